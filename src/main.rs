use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};
use tokio::sync::watch;

use station_link::config::{CONFIG_FILE, Config, Overrides};
use station_link::dispatch::{BaseStation, DispatchLoop};
use station_link::error::Result;
use station_link::serial::port::{
    PortSettings, SerialTransport, describe_port, list_ports, resolve_port_name,
};

/// Weather base station: ingests station samples and serves forecasts over serial.
#[derive(Debug, Parser)]
#[command(name = "station-link", version, about)]
struct Cli {
    /// Configuration file (RON)
    #[arg(long, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Serial port, overrides the config file
    #[arg(long)]
    port: Option<String>,

    /// Baud rate, overrides the config file
    #[arg(long)]
    baud: Option<u32>,

    /// Station dataset directory, overrides the config file
    #[arg(long)]
    dataset_dir: Option<PathBuf>,

    /// Print the available serial ports and exit
    #[arg(long)]
    list_ports: bool,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp_millis()
        .init();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    if cli.list_ports {
        for port in list_ports()? {
            println!("{}", describe_port(&port));
        }
        return Ok(0);
    }

    let mut config = Config::load(&cli.config)?;
    config.apply_overrides(Overrides {
        port_name: cli.port,
        baud_rate: cli.baud,
        dataset_dir: cli.dataset_dir,
    });
    config.validate()?;

    let port_name = resolve_port_name(config.serial.port_name.as_deref())?;
    let settings = PortSettings::from_config(port_name, &config.serial)?;
    let transport =
        SerialTransport::open(&settings, config.max_line_bytes, config.read_timeout())?;
    info!(
        "Listening on {}, datasets in {}, models in {}",
        transport.port_name(),
        config.dataset_dir.display(),
        config.model_dir.display()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if wait_for_interrupt().await {
            let _ = shutdown_tx.send(true);
        }
    });

    let mut dispatch = DispatchLoop::new(transport, BaseStation::from_config(&config));
    let reason = dispatch.run(shutdown_rx).await;
    Ok(reason.exit_code())
}

/// Resolves on Ctrl-C, or SIGTERM on unix. `false` if no listener could be installed.
async fn wait_for_interrupt() -> bool {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                return tokio::select! {
                    result = tokio::signal::ctrl_c() => interrupted(result),
                    _ = terminate.recv() => {
                        info!("Terminate signal received");
                        true
                    }
                };
            }
            Err(e) => error!("Cannot listen for SIGTERM: {e}"),
        }
    }
    interrupted(tokio::signal::ctrl_c().await)
}

fn interrupted(result: std::io::Result<()>) -> bool {
    match result {
        Ok(()) => {
            info!("Interrupt received");
            true
        }
        Err(e) => {
            error!("Cannot listen for interrupt, the loop will run until killed: {e}");
            false
        }
    }
}
