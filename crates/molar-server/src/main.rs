use std::env;

use molar_config::loader::{DEFAULT_CONFIG_FILE, load_config};
use molar_server::{AppState, ServerBuilder};

/// How the configuration path was determined.
#[derive(Debug, Clone, Copy)]
enum ConfigSource {
    CliArgument,
    EnvironmentVariable,
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CliArgument => write!(f, "CLI argument (--config)"),
            Self::EnvironmentVariable => write!(f, "environment variable (MOLAR_CONFIG)"),
            Self::Default => write!(f, "default"),
        }
    }
}

#[tokio::main]
async fn main() {
    // .env is optional
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
        {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    molar_server::observability::init_tracing();

    let (config_path, source) = resolve_config_path();
    let cfg = match load_config(Some(&config_path)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };

    tracing::info!(path = %config_path, source = %source, "Configuration loaded");
    molar_server::observability::apply_logging_config(&cfg.logging);
    if let Err(e) = molar_server::metrics::install_exporter() {
        tracing::warn!(error = %e, "Prometheus exporter not installed, /metrics will answer 503");
    }

    let state = AppState::from_config(&cfg);
    tracing::info!(
        cache_backend = state.cache.kv().backend_name(),
        rate_limiting = cfg.rate_limit.enabled,
        apm = cfg.apm.enabled,
        "Cache layer initialized"
    );

    let server = ServerBuilder::new()
        .with_config(cfg)
        .with_state(state)
        .build();

    if let Err(e) = server.run().await {
        tracing::error!(error = %e, "server exited with error");
        std::process::exit(1);
    }
}

fn resolve_config_path() -> (String, ConfigSource) {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return (path, ConfigSource::CliArgument);
            }
        }
    }

    if let Ok(path) = env::var("MOLAR_CONFIG") {
        if !path.is_empty() {
            return (path, ConfigSource::EnvironmentVariable);
        }
    }

    (DEFAULT_CONFIG_FILE.to_string(), ConfigSource::Default)
}
