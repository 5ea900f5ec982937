//! Ventilation unit service
//!
//! Starts one engine per configured device and logs its measurements until
//! Ctrl+C or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use common::service_bootstrap::{self, ServiceInfo};
use errors::{config_error, VentError, VentResult};
use ventsrv::config::{AppConfig, DEFAULT_CONFIG_PATH};
use ventsrv::engine::{DeviceEngine, LogSink, ResultSink};
use ventsrv::protocols::modbus::{Connector, TcpConnector};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "ventsrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Modbus TCP engine for Exvent ventilation units",
    long_about = None
)]
struct Args {
    /// Configuration file (yaml, toml or json)
    #[arg(short = 'c', long, env = "VENTSRV_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Validation mode - only validate configuration without starting service
    #[arg(long)]
    validate: bool,
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("ventsrv exiting [{}]: {}", e.error_code(), e);
        eprintln!("ventsrv: {}", e);
        common::logging::flush();
        std::process::exit(e.exit_code());
    }
}

fn override_log_level(config: &mut AppConfig, level: &str) -> VentResult<()> {
    let level = level.to_ascii_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        return Err(config_error!(
            "Unknown log level '{}', expected one of {}",
            level,
            LOG_LEVELS.join(", ")
        ));
    }
    config.service.logging.level = level;
    Ok(())
}

async fn run(args: Args) -> VentResult<()> {
    service_bootstrap::load_development_env();

    let mut config = AppConfig::load(&args.config)?;
    config.validate()?;

    if args.validate {
        println!(
            "Configuration {} is valid ({} device(s))",
            args.config.display(),
            config.devices.len()
        );
        return Ok(());
    }

    if let Some(level) = &args.log_level {
        override_log_level(&mut config, level)?;
    }

    let service_info = ServiceInfo::new(
        config.service.name.clone(),
        env!("CARGO_PKG_VERSION"),
        "Modbus TCP engine for Exvent ventilation units",
    );
    service_bootstrap::init_logging(&service_info, &config.service.logging, args.no_color)?;
    if !args.no_color {
        service_bootstrap::print_startup_banner(&service_info);
    }
    info!("Configuration loaded from {}", args.config.display());

    let connector: Arc<dyn Connector> = Arc::new(TcpConnector);
    let mut engines = Vec::with_capacity(config.devices.len());
    for device in &config.devices {
        let table = Arc::new(device.model.register_table());
        let sink: Arc<dyn ResultSink> = Arc::new(LogSink::new(&device.name, Arc::clone(&table)));

        match DeviceEngine::start(
            device.engine_settings(),
            table,
            device.model.action_table(),
            Arc::clone(&connector),
            sink,
        ) {
            Ok(engine) => {
                info!("Device {} ({}) started", device.name, device.model);
                engines.push(engine);
            },
            Err(e) => {
                error!("Device {} failed to start: {}", device.name, e);
                for engine in &engines {
                    engine.shutdown().await;
                }
                return Err(VentError::StartupFailed(format!("device {}: {}", device.name, e)));
            },
        }
    }

    let signal = common::shutdown::wait_for_shutdown().await;
    info!("{} received, stopping {} device(s)", signal, engines.len());

    futures::future::join_all(engines.iter().map(|engine| engine.shutdown())).await;

    info!("ventsrv stopped");
    common::logging::flush();
    Ok(())
}
