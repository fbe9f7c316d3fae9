//! `sencha-controller`: runs on the target machine and executes commands
//! sent by the sencha server

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use sencha::config::ClientConfig;
use sencha::executor::{BrowserExecutor, ControllerClient, DesktopExecutor};
use sencha::telemetry;

#[derive(Debug, Parser)]
#[command(name = "sencha-controller")]
#[command(about = "Remote executor for the sencha server", version)]
struct Cli {
    /// Server WebSocket url
    #[arg(long, env = "SENCHA_SERVER_URL", default_value = "ws://localhost:8080/ws/controller")]
    server_url: String,

    #[arg(long, env = "SENCHA_API_KEY", hide_env_values = true)]
    api_key: String,

    #[arg(long, env = "SENCHA_RECONNECT_INTERVAL_SECS", default_value_t = 5)]
    reconnect_interval_secs: u64,

    /// Consecutive failed connection attempts before exiting
    #[arg(long, env = "SENCHA_MAX_RECONNECT_ATTEMPTS", default_value_t = 10)]
    max_reconnect_attempts: u32,

    /// Upper bound for a single run_command
    #[arg(long, env = "SENCHA_COMMAND_TIMEOUT_SECS", default_value_t = 120)]
    command_timeout_secs: u64,

    /// DevTools endpoint of a Chromium started with --remote-debugging-port
    #[arg(long, env = "SENCHA_DEVTOOLS_URL", default_value = "http://127.0.0.1:9222")]
    devtools_url: String,

    /// Open URLs with xdg-open and refuse the other browser actions
    #[arg(long, env = "SENCHA_NO_BROWSER")]
    no_browser: bool,

    /// Timeout for a single DevTools call
    #[arg(long, env = "SENCHA_BROWSER_TIMEOUT_SECS", default_value_t = 30)]
    browser_timeout_secs: u64,

    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,

    #[arg(long, env = "SENCHA_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing("sencha-controller", cli.otlp_endpoint.as_deref(), cli.log_json)
        .map_err(|e| anyhow!(e))?;

    let config = ClientConfig {
        server_url: cli.server_url,
        api_key: cli.api_key,
        reconnect_interval: Duration::from_secs(cli.reconnect_interval_secs),
        max_reconnect_attempts: cli.max_reconnect_attempts,
        command_timeout: Duration::from_secs(cli.command_timeout_secs),
    };
    config.validate()?;

    let mut executor = DesktopExecutor::new(config.command_timeout);
    if !cli.no_browser {
        let browser = BrowserExecutor::new(cli.devtools_url, Duration::from_secs(cli.browser_timeout_secs))?;
        info!(devtools_url = browser.devtools_url(), "browser actions go through DevTools");
        executor = executor.with_browser(browser);
    }
    let executor = Arc::new(executor);
    let client = ControllerClient::new(config, executor);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            signal.cancel();
        }
    });

    let result = client.run(shutdown).await;
    telemetry::shutdown_tracing();
    result.map_err(Into::into)
}
