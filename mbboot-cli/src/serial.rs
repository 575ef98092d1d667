//! Serial port discovery and interactive selection.

use anyhow::{Context, Result, bail};
use dialoguer::Select;
use log::debug;

/// A discovered serial port.
pub struct PortEntry {
    /// Port name/path.
    pub name: String,
    /// Short description (USB product string if known).
    pub description: String,
}

/// List the serial ports available on this machine.
pub fn list_ports() -> Result<Vec<PortEntry>> {
    let ports = serialport::available_ports().context("failed to enumerate serial ports")?;

    Ok(ports
        .into_iter()
        .map(|p| {
            let description = match &p.port_type {
                serialport::SerialPortType::UsbPort(info) => {
                    let product = info.product.as_deref().unwrap_or("USB serial");
                    format!("{} ({:04x}:{:04x})", product, info.vid, info.pid)
                },
                serialport::SerialPortType::BluetoothPort => "Bluetooth serial".to_string(),
                serialport::SerialPortType::PciPort => "PCI serial".to_string(),
                serialport::SerialPortType::Unknown => "serial port".to_string(),
            };
            PortEntry {
                name: p.port_name,
                description,
            }
        })
        .collect())
}

/// Pick a serial port: the single available one, or an interactive
/// choice. Fails in non-interactive mode when the choice is ambiguous.
pub fn select_port(non_interactive: bool) -> Result<String> {
    let ports = list_ports()?;

    match ports.len() {
        0 => bail!("no serial ports found; specify one with --port"),
        1 => {
            debug!("Auto-selected the only serial port: {}", ports[0].name);
            Ok(ports[0].name.clone())
        },
        _ if non_interactive => {
            bail!(
                "multiple serial ports found ({}); specify one with --port",
                ports
                    .iter()
                    .map(|p| p.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        },
        _ => {
            let items: Vec<String> = ports
                .iter()
                .map(|p| format!("{} — {}", p.name, p.description))
                .collect();
            let choice = Select::new()
                .with_prompt("Select serial port")
                .items(&items)
                .default(0)
                .interact()
                .context("port selection aborted")?;
            Ok(ports[choice].name.clone())
        },
    }
}
