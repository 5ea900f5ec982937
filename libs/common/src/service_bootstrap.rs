//! Service bootstrap utilities
//!
//! Startup banner, logging initialization and environment setup shared by the
//! ventsrv binaries.

use crate::logging::{self, LogConfig, LoggingConfig};
use tracing::info;

/// Service metadata for startup
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    /// Service name (e.g., "ventsrv")
    pub name: String,
    /// Service version from Cargo.toml
    pub version: String,
    /// Service description
    pub description: String,
}

impl ServiceInfo {
    /// Create new service info
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: description.into(),
        }
    }
}

/// Print startup banner
pub fn print_startup_banner(service: &ServiceInfo) {
    let banner = r#"
 ██╗   ██╗███████╗███╗   ██╗████████╗███████╗██████╗ ██╗   ██╗
 ██║   ██║██╔════╝████╗  ██║╚══██╔══╝██╔════╝██╔══██╗██║   ██║
 ██║   ██║█████╗  ██╔██╗ ██║   ██║   ███████╗██████╔╝██║   ██║
 ╚██╗ ██╔╝██╔══╝  ██║╚██╗██║   ██║   ╚════██║██╔══██╗╚██╗ ██╔╝
  ╚████╔╝ ███████╗██║ ╚████║   ██║   ███████║██║  ██║ ╚████╔╝
   ╚═══╝  ╚══════╝╚═╝  ╚═══╝   ╚═╝   ╚══════╝╚═╝  ╚═╝  ╚═══╝
    "#;

    info!("{}", banner);
    info!(" {} v{}", service.name.to_uppercase(), service.version);
    info!(" {}", service.description);
    info!("");
}

/// Initialize logging for a service from its `logging` config section
///
/// Log root directory priority:
/// 1. `VENTSRV_LOG_DIR` environment variable
/// 2. `settings.dir`
/// 3. Default "logs"
pub fn init_logging(
    service: &ServiceInfo,
    settings: &LoggingConfig,
    no_color: bool,
) -> anyhow::Result<()> {
    let mut log_config = LogConfig::from_settings(&service.name, settings);
    log_config.ansi = !no_color;

    logging::init_with_config(log_config).map_err(|e| anyhow::anyhow!("{}", e))?;

    Ok(())
}

/// Load environment variables in development mode
///
/// In debug builds, reads `.env` and sets variables that are not already set.
/// In release builds this is a no-op.
pub fn load_development_env() {
    #[cfg(debug_assertions)]
    {
        if let Ok(content) = std::fs::read_to_string(".env") {
            for line in content.lines() {
                let trimmed = line.trim();
                if trimmed.starts_with('#') || trimmed.is_empty() {
                    continue;
                }

                if let Some((key, value)) = trimmed.split_once('=') {
                    let key = key.trim();
                    if std::env::var(key).is_err() {
                        std::env::set_var(key, value.trim());
                    }
                }
            }
        }
    }
}
