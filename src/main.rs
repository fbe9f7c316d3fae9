//! `sencha` server: controller WebSocket endpoint, operations API and agent runs

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sencha::agent::runs::DEFAULT_RETAINED_RUNS;
use sencha::agent::{NullSink, RunRegistry, SessionStore, StepSink};
use sencha::api::{self, ApiState};
use sencha::backend::{build_backend, BackendKind, LocalBackend, ReasoningAdapter};
use sencha::config::{parse_api_keys, AgentConfig, BackendConfig, ControllerConfig};
use sencha::controller::{self, ChannelRegistry, ControllerState, Dispatcher, StaticKeyAuthenticator};
use sencha::retry::RetryPolicy;
use sencha::telemetry;

#[derive(Debug, Parser)]
#[command(name = "sencha")]
#[command(about = "Drive remote desktop machines from an AI agent loop", version)]
struct Cli {
    #[arg(long, env = "SENCHA_BIND", default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// Accepted controller keys as `key=machine_id,...`
    #[arg(long, env = "SENCHA_API_KEYS", default_value = "", hide_env_values = true)]
    api_keys: String,

    #[arg(long, env = "SENCHA_HANDSHAKE_TIMEOUT_SECS", default_value_t = 10)]
    handshake_timeout_secs: u64,

    #[arg(long, env = "SENCHA_HEARTBEAT_INTERVAL_SECS", default_value_t = 15)]
    heartbeat_interval_secs: u64,

    /// Close channels silent for longer than this
    #[arg(long, env = "SENCHA_HEARTBEAT_TIMEOUT_SECS", default_value_t = 45)]
    heartbeat_timeout_secs: u64,

    /// Default timeout for one-off API dispatches
    #[arg(long, env = "SENCHA_COMMAND_TIMEOUT_SECS", default_value_t = 30)]
    command_timeout_secs: u64,

    // ── Agent loop ──────────────────────────────────────────────────────────
    #[arg(long, env = "SENCHA_MAX_STEPS", default_value_t = 30)]
    max_steps: u32,

    #[arg(long, env = "SENCHA_CONTEXT_CAPACITY", default_value_t = 8)]
    context_capacity: usize,

    #[arg(long, env = "SENCHA_OBSERVE_TIMEOUT_SECS", default_value_t = 30)]
    observe_timeout_secs: u64,

    #[arg(long, env = "SENCHA_ACTION_TIMEOUT_SECS", default_value_t = 60)]
    action_timeout_secs: u64,

    /// Whole-session deadline, 0 disables it
    #[arg(long, env = "SENCHA_SESSION_DEADLINE_SECS", default_value_t = 300)]
    session_deadline_secs: u64,

    /// Attempts per dispatch and per backend call
    #[arg(long, env = "SENCHA_RETRY_ATTEMPTS", default_value_t = 3)]
    retry_attempts: u32,

    /// Also fetch page elements while observing
    #[arg(long, env = "SENCHA_OBSERVE_ELEMENTS")]
    observe_elements: bool,

    #[arg(long, env = "SENCHA_SYSTEM_PROMPT_FILE")]
    system_prompt_file: Option<PathBuf>,

    /// Write one JSON file per session here
    #[arg(long, env = "SENCHA_SESSION_DIR")]
    session_dir: Option<PathBuf>,

    /// Finished runs kept in memory for the runs API
    #[arg(long, env = "SENCHA_RETAINED_RUNS", default_value_t = DEFAULT_RETAINED_RUNS)]
    retained_runs: usize,

    // ── Reasoning backend ───────────────────────────────────────────────────
    #[arg(long, value_enum, env = "SENCHA_BACKEND", default_value_t = BackendKind::Local)]
    backend: BackendKind,

    #[arg(long, env = "SENCHA_MODEL", default_value = "qwen2.5vl")]
    model: String,

    #[arg(long, env = "SENCHA_LOCAL_URL", default_value = "http://localhost:11434")]
    local_url: String,

    #[arg(long, env = "SENCHA_HOSTED_URL", default_value = "https://api.openai.com/v1")]
    hosted_url: String,

    #[arg(long, env = "SENCHA_HOSTED_API_KEY", hide_env_values = true)]
    hosted_api_key: Option<String>,

    #[arg(long, env = "SENCHA_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    #[arg(long, env = "SENCHA_MAX_TOKENS", default_value_t = 4096)]
    max_tokens: u32,

    #[arg(long, env = "SENCHA_REQUEST_TIMEOUT_SECS", default_value_t = 600)]
    request_timeout_secs: u64,

    /// Skip the startup check that the local model is pulled
    #[arg(long, env = "SENCHA_SKIP_MODEL_CHECK")]
    skip_model_check: bool,

    // ── Telemetry ───────────────────────────────────────────────────────────
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,

    #[arg(long, env = "SENCHA_LOG_JSON")]
    log_json: bool,
}

impl Cli {
    fn retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            ..RetryPolicy::default()
        }
    }

    fn controller_config(&self) -> Result<ControllerConfig> {
        let config = ControllerConfig {
            bind_addr: self.bind,
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            api_keys: parse_api_keys(&self.api_keys)?,
            ..ControllerConfig::default()
        };
        config.validate()?;
        Ok(config)
    }

    async fn agent_config(&self) -> Result<AgentConfig> {
        let system_prompt = match &self.system_prompt_file {
            Some(path) => Some(
                tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("reading system prompt {}", path.display()))?,
            ),
            None => None,
        };
        let config = AgentConfig {
            max_steps: self.max_steps,
            context_capacity: self.context_capacity,
            observe_timeout: Duration::from_secs(self.observe_timeout_secs),
            action_timeout: Duration::from_secs(self.action_timeout_secs),
            retry: self.retry(),
            session_deadline: (self.session_deadline_secs > 0)
                .then(|| Duration::from_secs(self.session_deadline_secs)),
            observe_elements: self.observe_elements,
            system_prompt,
            session_dir: self.session_dir.clone(),
            ..AgentConfig::default()
        };
        config.validate()?;
        Ok(config)
    }

    fn backend_config(&self) -> Result<BackendConfig> {
        let config = BackendConfig {
            kind: self.backend,
            local_url: self.local_url.clone(),
            hosted_url: self.hosted_url.clone(),
            api_key: self.hosted_api_key.clone(),
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            retry: self.retry(),
            check_model: !self.skip_model_check,
        };
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing("sencha", cli.otlp_endpoint.as_deref(), cli.log_json)
        .map_err(|e| anyhow!(e))?;

    let result = serve(cli).await;
    telemetry::shutdown_tracing();
    result
}

async fn serve(cli: Cli) -> Result<()> {
    let controller_config = cli.controller_config()?;
    let agent_config = cli.agent_config().await?;
    let backend_config = cli.backend_config()?;

    if backend_config.kind == BackendKind::Local && backend_config.check_model {
        check_local_model(&backend_config).await;
    }
    let backend = build_backend(&backend_config)?;
    info!(backend = backend.name(), model = %backend_config.model, "reasoning backend ready");
    let decider = Arc::new(ReasoningAdapter::new(
        backend,
        agent_config.system_prompt.clone(),
        backend_config.retry.clone(),
    ));

    let sink: Arc<dyn StepSink> = match &agent_config.session_dir {
        Some(dir) => Arc::new(
            SessionStore::new(dir).with_context(|| format!("creating session dir {}", dir.display()))?,
        ),
        None => Arc::new(NullSink),
    };

    if controller_config.api_keys.is_empty() {
        warn!("no controller api keys configured, every handshake will be rejected");
    }
    let channels = Arc::new(ChannelRegistry::new());
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&channels),
        controller_config.command_timeout,
    ));
    let runs = Arc::new(RunRegistry::with_retention(cli.retained_runs));

    let app = controller::server::router(ControllerState {
        channels: Arc::clone(&channels),
        authenticator: Arc::new(StaticKeyAuthenticator::new(controller_config.api_keys.clone())),
        settings: controller_config.channel_settings(),
    })
    .merge(api::router(ApiState {
        dispatcher,
        runs: Arc::clone(&runs),
        decider,
        sink,
        agent_config,
    }));

    let shutdown = CancellationToken::new();
    let monitor = Arc::clone(&channels).spawn_heartbeat_monitor(
        controller_config.heartbeat_interval,
        controller_config.heartbeat_timeout,
        shutdown.clone(),
    );

    let listener = tokio::net::TcpListener::bind(controller_config.bind_addr)
        .await
        .with_context(|| format!("binding {}", controller_config.bind_addr))?;
    info!(addr = %controller_config.bind_addr, "sencha server listening");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutdown requested");
            signal.cancel();
        })
        .await
        .context("server error")?;

    runs.cancel_all();
    channels.close_all("server shutting down");
    shutdown.cancel();
    let _ = monitor.await;
    info!("sencha server stopped");
    Ok(())
}

/// Warn early when the local runner does not have the model pulled
async fn check_local_model(config: &BackendConfig) {
    let backend = match LocalBackend::new(
        config.local_url.clone(),
        config.model.clone(),
        config.temperature,
        Duration::from_secs(10),
    ) {
        Ok(backend) => backend,
        Err(e) => {
            warn!(error = %e, "could not build local backend client for model check");
            return;
        }
    };
    match backend.ensure_model().await {
        Ok(true) => info!(model = %config.model, "local model available"),
        Ok(false) => warn!(
            model = %config.model,
            url = %config.local_url,
            "local model not found, pull it before starting a session"
        ),
        Err(e) => warn!(error = %e, url = %config.local_url, "local model runner unreachable"),
    }
}
