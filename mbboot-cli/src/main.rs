//! mbboot CLI - firmware updater for Modbus RTU bootloaders.
//!
//! ## Features
//!
//! - Read and write device flash over the bootloader's File Record
//!   extension
//! - Print device flash geometry
//! - Interactive serial port selection
//! - Shell completion generation
//! - Layered TOML configuration with environment variable support

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{Shell, generate};
use env_logger::Env;
use log::error;

mod commands;
mod config;
mod serial;

use config::Config;

/// Set by the Ctrl-C handler; polled by the pump loop to request a
/// cooperative cancel.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Whether Ctrl-C was pressed.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Process exit code for a cancelled operation.
const EXIT_CANCELLED: u8 = 130;

/// CLI-level errors with dedicated exit codes.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// The operation was cancelled (Ctrl-C).
    #[error("{0}")]
    Cancelled(String),
}

/// mbboot - firmware updater for Modbus RTU bootloaders.
///
/// Environment variables:
///   MBBOOT_PORT              - Default serial port
///   MBBOOT_BAUD              - Default baud rate (default: 115200)
///   MBBOOT_SERVER            - Default device address (default: 1)
///   MBBOOT_TIMEOUT_MS        - Per-exchange timeout in milliseconds
///   MBBOOT_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "mbboot")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub(crate) struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "MBBOOT_PORT")]
    pub(crate) port: Option<String>,

    /// Baud rate.
    #[arg(short, long, global = true, env = "MBBOOT_BAUD")]
    pub(crate) baud: Option<u32>,

    /// Device (server) address on the Modbus link.
    #[arg(short, long, global = true, env = "MBBOOT_SERVER")]
    pub(crate) server: Option<u8>,

    /// Parity.
    #[arg(long, global = true, value_enum)]
    pub(crate) parity: Option<ParityArg>,

    /// Data bits (7 or 8).
    #[arg(long, global = true)]
    pub(crate) data_bits: Option<u8>,

    /// Stop bits (1 or 2).
    #[arg(long, global = true)]
    pub(crate) stop_bits: Option<u8>,

    /// Per-exchange response timeout in milliseconds.
    #[arg(long, global = true, env = "MBBOOT_TIMEOUT_MS")]
    pub(crate) timeout_ms: Option<u64>,

    /// Retries after a timed-out exchange.
    #[arg(long, global = true)]
    pub(crate) retries: Option<u32>,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub(crate) config_path: Option<PathBuf>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub(crate) quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "MBBOOT_NON_INTERACTIVE")]
    pub(crate) non_interactive: bool,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

/// Serial parity options.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub(crate) enum ParityArg {
    /// No parity.
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the device's flash geometry.
    Info,

    /// Read a byte range of device flash into a file.
    Read {
        /// Start address (hex with 0x prefix, or decimal).
        #[arg(long, value_parser = parse_address)]
        address: u32,

        /// Number of bytes to read.
        #[arg(long)]
        size: u32,

        /// Output file.
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Write a file into device flash (touched pages are erased first).
    Write {
        /// Start address (hex with 0x prefix, or decimal).
        #[arg(long, value_parser = parse_address)]
        address: u32,

        /// File with the bytes to write.
        file: PathBuf,
    },

    /// List available serial ports.
    Ports,

    /// Generate shell completions.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

/// Parse an address given as `0x...` hex or plain decimal.
fn parse_address(s: &str) -> Result<u32, String> {
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|_| format!("invalid address: {s}"))
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn run(cli: &Cli) -> Result<()> {
    let config = match &cli.config_path {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    };

    match &cli.command {
        Commands::Info => commands::cmd_info(cli, &config),
        Commands::Read {
            address,
            size,
            output,
        } => commands::cmd_read(cli, &config, *address, *size, output),
        Commands::Write { address, file } => commands::cmd_write(cli, &config, *address, file),
        Commands::Ports => commands::cmd_ports(),
        Commands::Completions { shell } => {
            generate(
                *shell,
                &mut Cli::command(),
                "mbboot",
                &mut std::io::stdout(),
            );
            Ok(())
        },
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        error!("failed to install Ctrl-C handler: {e}");
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if e.downcast_ref::<CliError>().is_some() {
                eprintln!("Cancelled: {e}");
                ExitCode::from(EXIT_CANCELLED)
            } else {
                eprintln!("Error: {e:#}");
                ExitCode::from(1)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address_hex_and_decimal() {
        assert_eq!(parse_address("0x08000000"), Ok(0x0800_0000));
        assert_eq!(parse_address("0X10"), Ok(16));
        assert_eq!(parse_address("2048"), Ok(2048));
        assert!(parse_address("zzz").is_err());
        assert!(parse_address("0x").is_err());
    }

    #[test]
    fn test_cli_parses_read_command() {
        let cli = Cli::parse_from([
            "mbboot", "read", "--address", "0x08000000", "--size", "256", "--output", "dump.bin",
        ]);
        match cli.command {
            Commands::Read { address, size, .. } => {
                assert_eq!(address, 0x0800_0000);
                assert_eq!(size, 256);
            },
            _ => panic!("expected read command"),
        }
    }

    #[test]
    fn test_cli_verify_structure() {
        Cli::command().debug_assert();
    }
}
