// Module declarations
pub mod capabilities;
pub mod clients;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod protocol;
pub mod relay;
pub mod router;
pub mod server;
pub mod settings;
pub mod synthesis;
pub mod transcoder;
pub mod upstream;

#[cfg(test)]
mod test_support;

use std::path::PathBuf;

pub use error::RelayError;
pub use relay::Relay;

use settings::SettingsManager;

/// Startup options collected by the binary
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Settings file; defaults to ~/.clinic-relay/settings.json
    pub config_path: Option<PathBuf>,
    /// Overrides `server.bind_address`
    pub bind_address: Option<String>,
    /// Filter used when RUST_LOG is unset
    pub log_level: String,
    pub file_logging: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            config_path: None,
            bind_address: None,
            log_level: "info".to_string(),
            file_logging: true,
        }
    }
}

/// Load settings, start the relay and serve until Ctrl-C
pub async fn run(options: RunOptions) -> Result<(), RelayError> {
    let logs_dir = if options.file_logging {
        logging::logs_dir()
    } else {
        None
    };
    logging::init(logs_dir.as_deref(), &options.log_level);

    let manager = match options.config_path {
        Some(path) => SettingsManager::new_with_path(path),
        None => SettingsManager::new(),
    }
    .map_err(RelayError::Settings)?;
    log::info!("Settings: Loaded {}", manager.path().display());

    let mut settings = manager.get();
    settings.apply_env();
    if let Some(bind) = options.bind_address {
        settings.server.bind_address = bind;
    }
    SettingsManager::validate(&settings).map_err(RelayError::Settings)?;

    if settings.api_key.is_none() {
        log::warn!(
            "Settings: {} is not set, upstream connections and capabilities will fail",
            settings::manager::API_KEY_ENV
        );
    }

    let relay = Relay::from_settings(&settings);
    server::serve(relay, &settings.server.bind_address, shutdown_signal()).await
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => log::info!("Received Ctrl-C"),
        Err(e) => {
            log::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
