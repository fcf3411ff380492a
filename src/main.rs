//! mousechord command line entry point.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mousechord::config::{Config, ConfigFile};
use mousechord::control::{self, ControlCommand, ControlServer};
use mousechord::engine::{Engine, EngineConfig};
use mousechord::error::{EXIT_CONFIG, EXIT_OK, EXIT_OTHER};
use mousechord::input_backend::linux::{EvdevDevices, UinputSinks};
use mousechord::input_backend::{DeviceProvider, StopSignal};
use mousechord::keys;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "MOUSECHORD_LOG";

#[derive(Parser, Debug)]
#[command(name = "mousechord", version, about = "Remap mouse side buttons to key chords")]
struct Cli {
    /// Config file (default: $MOUSECHORD_CONFIG, ~/.config/mousechord/config.toml,
    /// /etc/mousechord/config.toml)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Control socket path
    #[arg(long, global = true, value_name = "PATH", env = "MOUSECHORD_SOCKET")]
    socket: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run the remapper in the foreground (default)
    Run,
    /// Ask a running instance for its state
    Status,
    /// Ask a running instance to stop
    Stop,
    /// List input devices with their ids and mouse buttons
    ListDevices,
    /// Validate the configuration and print the effective setup
    CheckConfig,
    /// Print the built-in configuration as TOML
    DefaultConfig,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let socket = cli.socket.clone().unwrap_or_else(control::socket_path);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(&cli, socket),
        Command::Status => client(&socket, ControlCommand::Status),
        Command::Stop => client(&socket, ControlCommand::Stop),
        Command::ListDevices => {
            init_tracing("warn", cli.verbose);
            list_devices();
            ExitCode::from(EXIT_OK)
        }
        Command::CheckConfig => check_config(&cli),
        Command::DefaultConfig => match toml::to_string_pretty(&ConfigFile::builtin()) {
            Ok(text) => {
                print!("{text}");
                ExitCode::from(EXIT_OK)
            }
            Err(e) => {
                eprintln!("error: {e}");
                ExitCode::from(EXIT_OTHER)
            }
        },
    }
}

fn init_tracing(level: &str, verbose: u8) {
    let level = match verbose {
        0 => level,
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();
}

fn run(cli: &Cli, socket: PathBuf) -> ExitCode {
    let (config, source) = match Config::load(cli.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            init_tracing("info", cli.verbose);
            error!("[ConfigError] {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    // The subscriber's level comes from the config, so the loader's outcome
    // is only logged once it is installed.
    init_tracing(&config.logging.level, cli.verbose);
    info!("mousechord {} starting", env!("CARGO_PKG_VERSION"));
    info!("{}", source.log_line());

    if unsafe { libc::geteuid() } != 0 {
        warn!("Not running as root; opening input devices or /dev/uinput may fail");
    }

    match serve(config, &socket) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(EXIT_OTHER)
        }
    }
}

fn serve(config: Config, socket: &std::path::Path) -> Result<ExitCode> {
    let stop = Arc::new(StopSignal::new().context("Failed to create stop pipe")?);

    let stop_signal = stop.clone();
    ctrlc::set_handler(move || {
        info!("Termination signal received");
        stop_signal.request();
    })
    .context("Failed to install signal handler")?;

    let mut engine = Engine::new(EvdevDevices, UinputSinks, EngineConfig::from(config), stop.clone());

    // The remapper itself does not depend on the control channel.
    let _server = match ControlServer::bind(socket, engine.status(), stop) {
        Ok(server) => Some(server),
        Err(e) => {
            warn!("Control socket unavailable: {e:#}");
            None
        }
    };

    Ok(match engine.run() {
        Ok(_) => ExitCode::from(EXIT_OK),
        Err(e) => ExitCode::from(e.exit_code()),
    })
}

fn client(socket: &std::path::Path, command: ControlCommand) -> ExitCode {
    match control::send_command(socket, command) {
        Ok(reply) => {
            println!("{reply}");
            if reply.starts_with("ERR") {
                ExitCode::from(EXIT_OTHER)
            } else {
                ExitCode::from(EXIT_OK)
            }
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(EXIT_OTHER)
        }
    }
}

fn list_devices() {
    let devices = EvdevDevices.enumerate();
    if devices.is_empty() {
        println!("No input devices readable (try running as root)");
        return;
    }
    println!("Available input devices:");
    for dev in &devices {
        let buttons: Vec<String> = dev.mouse_buttons().map(keys::display).collect();
        println!("  {dev}");
        if buttons.is_empty() {
            println!("      {} key codes, no mouse buttons", dev.keys.len());
        } else {
            println!("      buttons: {}", buttons.join(", "));
        }
    }
}

fn check_config(cli: &Cli) -> ExitCode {
    let (config, source) = match Config::load(cli.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("config error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    println!("Config: {source}");
    println!("Device: {}", config.criteria);
    println!("Remaps:");
    for (trigger, chord) in config.table.entries() {
        println!("  {} -> {}", keys::display(trigger), chord);
    }
    println!(
        "Sink: '{}' ({} attempt(s), {:?} initial backoff)",
        config.sink.name, config.sink.create_attempts, config.sink.retry_backoff
    );
    println!("Log level: {}", config.logging.level);
    ExitCode::from(EXIT_OK)
}
