//! dezflash CLI - Command-line tool for flashing ESP32-family chips.
//!
//! ## Features
//!
//! - Write raw images to flash through the ROM bootloader
//! - Erase flash memory
//! - Identify the connected chip and its flash
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable support

use {
    anyhow::Result,
    clap::{Parser, Subcommand, ValueEnum},
    clap_complete::Shell,
    config::Config,
    console::style,
    dezflash::{
        FlashFrequency, FlashMode, FlashSize, LoaderConfig, ResetMode, SerialConfig, Session,
    },
    env_logger::Env,
    log::debug,
    serial::{SerialOptions, ask_remember_port, select_serial_port},
    std::{
        env,
        path::PathBuf,
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    },
};

mod commands;
mod config;
mod serial;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the user pressed Ctrl-C.
fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Errors classified by the CLI itself, each with its own exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or environment the user has to fix (exit 2).
    #[error("{0}")]
    Usage(String),
    /// Unusable configuration (exit 3).
    #[error("{0}")]
    Config(String),
    /// The user aborted (exit 130).
    #[error("{0}")]
    Cancelled(String),
}

const EXIT_GENERIC: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_CONFIG: i32 = 3;
const EXIT_DEVICE: i32 = 4;
const EXIT_CANCELLED: i32 = 130;

/// Map an error to the process exit code.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => EXIT_USAGE,
            CliError::Config(_) => EXIT_CONFIG,
            CliError::Cancelled(_) => EXIT_CANCELLED,
        };
    }

    let lib_err = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<dezflash::Error>());
    match lib_err {
        Some(dezflash::Error::Cancelled) => EXIT_CANCELLED,
        Some(dezflash::Error::FlashJobFailed { source, .. })
            if matches!(**source, dezflash::Error::Cancelled) =>
        {
            EXIT_CANCELLED
        },
        Some(dezflash::Error::Config(_)) => EXIT_CONFIG,
        Some(dezflash::Error::InvalidJobLayout(_)) => EXIT_USAGE,
        Some(e) if e.is_device_error() => EXIT_DEVICE,
        _ if was_interrupted() => EXIT_CANCELLED,
        _ => EXIT_GENERIC,
    }
}

/// dezflash - A cross-platform tool for flashing ESP32-family chips.
///
/// Environment variables:
///   DEZFLASH_PORT              - Default serial port
///   DEZFLASH_BAUD              - Handshake baud rate (default: 115200)
///   DEZFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "dezflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Examples:\n  \
    dezflash write-flash bootloader.bin:0x1000 partitions.bin:0x8000 app.bin:0x10000\n  \
    dezflash --port /dev/ttyUSB0 chip-id --json\n  \
    dezflash erase-flash")]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "DEZFLASH_PORT")]
    port: Option<String>,

    /// Baud rate for the bootloader handshake.
    #[arg(short, long, global = true, env = "DEZFLASH_BAUD")]
    baud: Option<u32>,

    /// Baud rate to switch to after the handshake.
    #[arg(long, global = true)]
    target_baud: Option<u32>,

    /// How to put the chip into its bootloader before connecting.
    #[arg(long, global = true, value_enum, default_value = "default-reset")]
    before: BeforeReset,

    /// Number of handshake attempts.
    #[arg(long, global = true)]
    connect_attempts: Option<usize>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "DEZFLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Confirm port selection even for auto-detected ports.
    #[arg(long, global = true)]
    confirm_port: bool,

    /// Offer all serial ports, not only recognised boards.
    #[arg(long, global = true)]
    list_all_ports: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Reset strategy before the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum BeforeReset {
    /// Pulse DTR/RTS to enter the ROM bootloader.
    DefaultReset,
    /// The chip is already in its bootloader.
    NoReset,
}

impl From<BeforeReset> for ResetMode {
    fn from(before: BeforeReset) -> Self {
        match before {
            BeforeReset::DefaultReset => ResetMode::DefaultReset,
            BeforeReset::NoReset => ResetMode::NoReset,
        }
    }
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Write binary images to flash.
    WriteFlash {
        /// Images to write, as file:address (e.g. app.bin:0x10000).
        #[arg(value_name = "FILE:ADDR", required = true, value_parser = parse_flash_arg)]
        images: Vec<(PathBuf, u32)>,

        /// Flash size written into the bootloader header.
        #[arg(long, value_parser = parse_flash_size)]
        flash_size: Option<FlashSize>,

        /// SPI clock written into the bootloader header (20m, 26m, 40m, 80m).
        #[arg(long, value_parser = parse_flash_freq)]
        flash_freq: Option<FlashFrequency>,

        /// SPI mode written into the bootloader header (qio, qout, dio, dout).
        #[arg(long, value_parser = parse_flash_mode)]
        flash_mode: Option<FlashMode>,

        /// Skip the bulk erase and erase only the written regions.
        #[arg(long)]
        no_erase_all: bool,

        /// Deflate images before sending them.
        #[arg(long)]
        compress: bool,

        /// Keep writing the remaining images after one fails.
        #[arg(long)]
        continue_on_error: bool,

        /// Leave the chip in the bootloader afterwards.
        #[arg(long)]
        no_reset: bool,
    },

    /// Erase the whole flash chip.
    EraseFlash,

    /// Identify the chip and its flash.
    ChipId {
        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions (auto-detected if not specified with --install).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Automatically install completions to your shell configuration.
        #[arg(long)]
        install: bool,
    },
}

/// Parse an image argument in format "file:address".
///
/// The address follows the last colon so Windows drive letters survive.
fn parse_flash_arg(s: &str) -> Result<(PathBuf, u32), String> {
    let (path, addr) = s
        .rsplit_once(':')
        .filter(|(path, _)| !path.is_empty())
        .ok_or_else(|| {
            format!("Invalid format: '{s}'. Expected 'file:address' (e.g., 'app.bin:0x10000')")
        })?;
    Ok((PathBuf::from(path), parse_hex_u32(addr)?))
}

/// Parse hexadecimal address (supports 0x prefix and underscores).
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let s = s
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    let s: String = s
        .chars()
        .filter(|c| *c != '_')
        .collect();
    u32::from_str_radix(&s, 16).map_err(|e| format!("Invalid hex address: {e}"))
}

fn parse_flash_size(s: &str) -> Result<FlashSize, String> {
    s.parse()
        .map_err(|e: dezflash::Error| e.to_string())
}

fn parse_flash_freq(s: &str) -> Result<FlashFrequency, String> {
    s.parse()
        .map_err(|e: dezflash::Error| e.to_string())
}

fn parse_flash_mode(s: &str) -> Result<FlashMode, String> {
    s.parse()
        .map_err(|e: dezflash::Error| e.to_string())
}

fn main() {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();
    init_logging(&cli);
    install_interrupt_handler();

    if let Err(err) = run(&cli) {
        eprintln!("{} {err:#}", style("Error:").red().bold());
        std::process::exit(exit_code_for(&err));
    }
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "dezflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );
}

fn install_interrupt_handler() {
    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::SeqCst)) {
        debug!("Could not install Ctrl-C handler: {e}");
    }
    dezflash::set_interrupt_checker(was_interrupted);
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = match cli.config_path {
        Some(ref path) => Config::load_from_path(path)?,
        None => Config::load(),
    };

    match &cli.command {
        Commands::WriteFlash {
            images,
            flash_size,
            flash_freq,
            flash_mode,
            no_erase_all,
            compress,
            continue_on_error,
            no_reset,
        } => {
            let args = commands::write_flash::WriteFlashArgs {
                images,
                flash_size: *flash_size,
                flash_freq: *flash_freq,
                flash_mode: *flash_mode,
                no_erase_all: *no_erase_all,
                compress: *compress,
                continue_on_error: *continue_on_error,
                no_reset: *no_reset,
            };
            commands::write_flash::cmd_write_flash(cli, &mut config, &args)
        },
        Commands::EraseFlash => commands::erase::cmd_erase_flash(cli, &mut config),
        Commands::ChipId { json } => commands::chip_id::cmd_chip_id(cli, &mut config, *json),
        Commands::ListPorts { json } => {
            commands::list_ports::cmd_list_ports(*json);
            Ok(())
        },
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "specify a shell type, e.g.: dezflash completions bash \
                         (or use dezflash completions --install)"
                            .to_string(),
                    )
                })?;
                commands::completions::cmd_completions(shell);
                Ok(())
            }
        },
    }
}

/// Get serial port from CLI args or interactive selection.
fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli
            .port
            .clone(),
        list_all_ports: cli.list_all_ports,
        non_interactive: cli.non_interactive,
        confirm_port: cli.confirm_port,
    };

    let selected = select_serial_port(&options, config)?;

    // Ask to remember if not a known device and interactive mode
    if !selected.is_known && !cli.non_interactive && cli.port.is_none() {
        ask_remember_port(&selected.port, config)?;
    }

    Ok(selected
        .port
        .name)
}

/// Handshake baud: flag, then config, then the ROM default.
fn handshake_baud(cli: &Cli, config: &Config) -> u32 {
    cli.baud
        .or(config
            .port
            .connection
            .baud)
        .unwrap_or(dezflash::session::DEFAULT_BAUD)
}

/// Build the loader tunables from flags and configuration.
fn loader_config(cli: &Cli, config: &Config) -> LoaderConfig {
    let mut loader = LoaderConfig::default()
        .with_baud_rate(handshake_baud(cli, config))
        .with_target_baud(
            cli.target_baud
                .or(config
                    .loader
                    .target_baud),
        )
        .with_reset_mode(
            cli.before
                .into(),
        );
    if let Some(attempts) = cli
        .connect_attempts
        .or(config
            .loader
            .connect_attempts)
    {
        loader = loader.with_connect_attempts(attempts);
    }
    if let Some(ms) = config
        .loader
        .block_timeout_ms
    {
        loader = loader.with_block_timeout(Duration::from_millis(ms));
    }
    loader
}

/// Select a port and build a disconnected session on it.
fn open_session(cli: &Cli, config: &mut Config) -> Result<Session<SerialConfig>> {
    let port = get_port(cli, config)?;
    let loader = loader_config(cli, config);
    if !cli.quiet {
        eprintln!(
            "{} Using port {} at {} baud",
            style("🔌").cyan(),
            style(&port).green(),
            loader.baud_rate
        );
    }
    Ok(Session::new(
        SerialConfig::new(port, loader.baud_rate),
        loader,
    ))
}

/// Handshake with the bootloader, printing the usual status lines.
fn connect_session(cli: &Cli, session: &mut Session<SerialConfig>) -> Result<dezflash::Chip> {
    if !cli.quiet {
        eprintln!(
            "{} Connecting to the bootloader...",
            style("⏳").yellow()
        );
    }
    let chip = session.connect()?;
    if !cli.quiet {
        eprintln!("{} Connected to {chip}", style("✓").green());
    }
    Ok(chip)
}
