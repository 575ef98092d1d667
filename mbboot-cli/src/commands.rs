//! Command implementations: info, read, write, ports.

use std::cell::RefCell;
use std::fs;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use mbboot::transport::{DataBits, Parity, StopBits};
use mbboot::{Device, FirmwareEngine, LinkQueue, RtuConfig, RtuMaster, Transport};

use crate::config::Config;
use crate::serial::select_port;
use crate::{Cli, CliError, ParityArg, was_interrupted};

/// Everything a command needs to talk to the device.
pub(crate) struct Session {
    master: Rc<RtuMaster>,
    engine: Rc<FirmwareEngine>,
    link: Rc<LinkQueue>,
}

/// Outcome of a read/write iteration, captured from the engine's events.
enum OpOutcome {
    Read(Vec<u8>),
    Written,
    Cancelled,
    Failed(mbboot::Error),
}

/// Resolve settings, open the serial link and read the flash geometry.
pub(crate) fn open_session(cli: &Cli, config: &Config) -> Result<Session> {
    let port = match cli.port.clone().or_else(|| config.connection.port.clone()) {
        Some(port) => port,
        None => select_port(cli.non_interactive)?,
    };

    let rtu_config = RtuConfig {
        port_name: port.clone(),
        baud_rate: cli.baud.or(config.connection.baud).unwrap_or(115200),
        data_bits: match cli.data_bits.or(config.connection.data_bits) {
            Some(7) => DataBits::Seven,
            Some(8) | None => DataBits::Eight,
            Some(other) => bail!("unsupported data bits: {other}"),
        },
        parity: match cli.parity {
            Some(ParityArg::None) => Parity::None,
            Some(ParityArg::Odd) => Parity::Odd,
            Some(ParityArg::Even) => Parity::Even,
            None => match config.connection.parity.as_deref() {
                Some("odd") => Parity::Odd,
                Some("even") => Parity::Even,
                Some("none") | None => Parity::None,
                Some(other) => bail!("unsupported parity: {other}"),
            },
        },
        stop_bits: match cli.stop_bits.or(config.connection.stop_bits) {
            Some(2) => StopBits::Two,
            Some(1) | None => StopBits::One,
            Some(other) => bail!("unsupported stop bits: {other}"),
        },
        timeout: Duration::from_millis(cli.timeout_ms.or(config.modbus.timeout_ms).unwrap_or(1000)),
        retries: cli.retries.or(config.modbus.retries).unwrap_or(3),
    };
    let server = cli.server.or(config.modbus.server).unwrap_or(1);

    debug!("Opening {port} at {} baud, server {server}", rtu_config.baud_rate);

    let master = RtuMaster::new(rtu_config);
    let link = LinkQueue::new(Rc::clone(&master) as Rc<dyn Transport>);
    let device = Device::new(Rc::clone(&link), server);
    let engine = FirmwareEngine::new(device);

    if !link.connect_link() {
        bail!("failed to open serial port {port}");
    }

    let session = Session {
        master,
        engine,
        link,
    };

    read_geometry(&session).context("failed to read device flash geometry")?;

    Ok(session)
}

/// Pump the transport until the outcome channel is filled.
fn drive<T>(session: &Session, outcome: &Rc<RefCell<Option<T>>>, cancellable: bool) -> Result<T> {
    let mut cancel_requested = false;

    loop {
        if let Some(value) = outcome.borrow_mut().take() {
            return Ok(value);
        }

        if cancellable && was_interrupted() && !cancel_requested {
            // Cooperative: takes effect at the next chain step boundary.
            session.engine.cancel();
            cancel_requested = true;
        }

        if !session.master.poll() {
            if let Some(value) = outcome.borrow_mut().take() {
                return Ok(value);
            }
            bail!("link went idle before the operation completed");
        }
    }
}

/// Run the engine's configuration chain to completion.
fn read_geometry(session: &Session) -> Result<()> {
    let outcome: Rc<RefCell<Option<Result<(), mbboot::Error>>>> = Rc::new(RefCell::new(None));

    let sink = Rc::clone(&outcome);
    session.engine.events().conf_read.connect(move |()| {
        *sink.borrow_mut() = Some(Ok(()));
    });
    let sink = Rc::clone(&outcome);
    session.engine.events().conf_read_error.connect(move |e| {
        *sink.borrow_mut() = Some(Err(e.clone()));
    });

    if !session.engine.conf_read() && outcome.borrow().is_none() {
        bail!("device link is not ready");
    }

    drive(session, &outcome, false)?.map_err(|e| anyhow!(e.detailed()))
}

/// Wire the engine's read/write outcome events into a channel.
fn observe_outcome(session: &Session) -> Rc<RefCell<Option<OpOutcome>>> {
    let outcome: Rc<RefCell<Option<OpOutcome>>> = Rc::new(RefCell::new(None));
    let events = session.engine.events();

    let sink = Rc::clone(&outcome);
    events.data_read.connect(move |data| {
        *sink.borrow_mut() = Some(OpOutcome::Read(data.clone()));
    });
    let sink = Rc::clone(&outcome);
    events.data_written.connect(move |()| {
        *sink.borrow_mut() = Some(OpOutcome::Written);
    });
    for canceled in [&events.data_read_canceled, &events.data_write_canceled] {
        let sink = Rc::clone(&outcome);
        canceled.connect(move |()| {
            *sink.borrow_mut() = Some(OpOutcome::Cancelled);
        });
    }
    for error in [&events.data_read_error, &events.data_write_error] {
        let sink = Rc::clone(&outcome);
        error.connect(move |e| {
            *sink.borrow_mut() = Some(OpOutcome::Failed(e.clone()));
        });
    }

    outcome
}

/// Progress bar driven by the engine's progress events.
fn attach_progress(session: &Session, quiet: bool) -> ProgressBar {
    let bar = if quiet {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(
                "{bar:40.cyan/blue} {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
            )
            .expect("valid progress template"),
        );
        bar
    };

    let bar_range = bar.clone();
    session.engine.events().progress_range.connect(move |(min, max)| {
        bar_range.set_length(u64::from(*max));
        bar_range.set_position(u64::from(*min));
    });
    let bar_pos = bar.clone();
    session.engine.events().progress.connect(move |current| {
        bar_pos.set_position(u64::from(*current));
    });

    bar
}

/// `info` command: print the device's flash geometry.
pub(crate) fn cmd_info(cli: &Cli, config: &Config) -> Result<()> {
    let session = open_session(cli, config)?;
    let engine = &session.engine;

    println!("flash size:  {} KB", engine.flash_size());
    println!("page size:   {} bytes", engine.page_size());
    println!("page count:  {}", engine.pages_count());
    println!("flash base:  0x{:08X}", mbboot::FLASH_BASE);

    session.link.disconnect_link();
    Ok(())
}

/// `read` command: dump a byte range of device flash into a file.
pub(crate) fn cmd_read(
    cli: &Cli,
    config: &Config,
    address: u32,
    size: u32,
    output: &Path,
) -> Result<()> {
    let session = open_session(cli, config)?;

    if !cli.quiet {
        eprintln!(
            "{} Reading {size} bytes from 0x{address:08X}",
            style("→").cyan()
        );
    }

    let outcome = observe_outcome(&session);
    let bar = attach_progress(&session, cli.quiet);

    if !session.engine.read_data(address, size) {
        bail!("read rejected: check the address range and device state");
    }

    let result = drive(&session, &outcome, true);
    bar.finish_and_clear();
    session.link.disconnect_link();

    match result? {
        OpOutcome::Read(data) => {
            fs::write(output, &data)
                .with_context(|| format!("failed to write {}", output.display()))?;
            if !cli.quiet {
                eprintln!(
                    "{} Read {} bytes into {}",
                    style("✓").green(),
                    data.len(),
                    output.display()
                );
            }
            Ok(())
        },
        OpOutcome::Cancelled => Err(CliError::Cancelled("read cancelled".into()).into()),
        OpOutcome::Failed(e) => Err(anyhow!(e.detailed())),
        OpOutcome::Written => unreachable!("write outcome from a read operation"),
    }
}

/// `write` command: flash a file into a byte range of device flash.
pub(crate) fn cmd_write(cli: &Cli, config: &Config, address: u32, file: &Path) -> Result<()> {
    let data = fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
    if data.is_empty() {
        bail!("{} is empty", file.display());
    }

    let session = open_session(cli, config)?;
    let engine = &session.engine;

    let flash_end = mbboot::FLASH_BASE + engine.geometry().flash_size_bytes();
    let end = address
        .checked_add(data.len() as u32)
        .filter(|&end| end <= flash_end)
        .ok_or_else(|| anyhow!("range 0x{address:08X}+{} exceeds flash", data.len()))?;

    if !cli.quiet {
        let first_page = engine.page_number(address);
        let last_page = engine.page_number(end - 1);
        eprintln!(
            "{} Writing {} bytes to 0x{address:08X} (pages {first_page}..={last_page}, erased before rewrite)",
            style("→").cyan(),
            data.len()
        );
    }

    let outcome = observe_outcome(&session);
    let bar = attach_progress(&session, cli.quiet);

    if !session.engine.write_data(address, &data) {
        bail!("write rejected: check the address range and device state");
    }

    let result = drive(&session, &outcome, true);
    bar.finish_and_clear();
    session.link.disconnect_link();

    match result? {
        OpOutcome::Written => {
            if !cli.quiet {
                eprintln!("{} Wrote {} bytes", style("✓").green(), data.len());
            }
            Ok(())
        },
        OpOutcome::Cancelled => Err(CliError::Cancelled("write cancelled".into()).into()),
        OpOutcome::Failed(e) => Err(anyhow!(e.detailed())),
        OpOutcome::Read(_) => unreachable!("read outcome from a write operation"),
    }
}

/// `ports` command: list available serial ports.
pub(crate) fn cmd_ports() -> Result<()> {
    let ports = crate::serial::list_ports()?;
    if ports.is_empty() {
        eprintln!("no serial ports found");
        return Ok(());
    }
    for port in ports {
        println!("{}\t{}", port.name, port.description);
    }
    Ok(())
}
