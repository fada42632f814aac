use clap::Parser;
use mockserver::server::{
    config::{Configuration, DEFAULT_BASE_PATH, DEFAULT_PORT},
    log::LogLevel,
    MockServerBuilder,
};
use std::{error::Error, path::PathBuf};
use tracing_subscriber::EnvFilter;

/// Holds command line parameters provided by the user.
#[derive(Parser, Debug)]
#[command(name = "mockserver")]
#[command(about = "HTTP mock and proxy server with a JSON control plane")]
struct CommandLineParameters {
    /// Port to listen on. May be given more than once.
    #[arg(short, long = "port", env = "MOCKSERVER_SERVER_PORT", value_delimiter = ',', default_value_t = DEFAULT_PORT)]
    ports: Vec<u16>,
    #[arg(long, env = "MOCKSERVER_BASE_PATH", default_value = DEFAULT_BASE_PATH)]
    base_path: String,
    #[arg(long, env = "MOCKSERVER_LIVENESS_HTTP_GET_PATH")]
    liveness_path: Option<String>,
    /// Minimum level of log entries returned by the retrieve command.
    #[arg(long, env = "MOCKSERVER_LOG_LEVEL", default_value = "INFO")]
    log_level: LogLevel,
    #[arg(long, env = "MOCKSERVER_MAX_EXPECTATIONS", default_value_t = 5_000)]
    max_expectations: usize,
    #[arg(long, env = "MOCKSERVER_MAX_LOG_ENTRIES", default_value_t = 60_000)]
    max_log_entries: usize,
    /// Forward unmatched requests for foreign hosts.
    #[arg(long, env = "MOCKSERVER_PROXY")]
    proxy: bool,
    /// Listen on all interfaces instead of 127.0.0.1.
    #[arg(short, long, env = "MOCKSERVER_EXPOSE")]
    expose: bool,
    #[arg(long, env = "MOCKSERVER_INITIALIZATION_JSON_PATH")]
    initialization_json_path: Option<PathBuf>,
}

impl From<CommandLineParameters> for Configuration {
    fn from(params: CommandLineParameters) -> Self {
        Configuration {
            ports: params.ports,
            base_path: params.base_path,
            liveness_path: params.liveness_path,
            log_level: params.log_level,
            max_expectations: params.max_expectations,
            max_log_entries: params.max_log_entries,
            proxy: params.proxy,
            expose: params.expose,
            initialization_json_path: params.initialization_json_path,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mockserver=info")),
        )
        .init();

    let params = CommandLineParameters::parse();

    tracing::info!(
        "Starting {} server V{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let server = MockServerBuilder::new()
        .configuration(params.into())
        .build()?;

    server
        .start_with_signals(None, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!("Cannot listen for shutdown signal: {}", err);
                std::future::pending::<()>().await;
            }
            tracing::info!("Received shutdown signal");
        })
        .await?;

    Ok(())
}
