//! Vigil relay host.
//!
//! Accepts WebSocket participants, relays their audio to each other and
//! moderates every utterance through the speech engine and the remote
//! toxicity classifier.

mod http;
mod settings;
mod state;
mod storage;
mod websocket;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vigil_core::{
    telemetry::FanoutSink, CsvSink, HttpClassifier, Mode, ModerationEngine, NullSink,
    StubTranscriber, TelemetrySink, Transcriber,
};

use settings::{default_settings_path, load_settings, save_settings, ServerSettings};
use state::AppState;
use storage::UtteranceStore;

const DEFAULT_LOG_FILTER: &str = "vigil=info,vigil_core=info,vigil_server=info,tower_http=info";

#[derive(Debug, Parser)]
#[command(name = "vigil", version, about = "Voice relay with live toxicity moderation")]
struct Cli {
    /// Settings file (defaults to $XDG_CONFIG_HOME/vigil/settings.json).
    #[arg(long, env = "VIGIL_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, e.g. 0.0.0.0:8080.
    #[arg(long)]
    bind: Option<String>,

    /// reactive | preventive
    #[arg(long)]
    mode: Option<Mode>,

    /// Emit JSON log lines.
    #[arg(long)]
    log_json: bool,

    /// Write the resolved settings to the config file and exit.
    #[arg(long)]
    write_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_settings_path);
    let mut settings = load_settings(&config_path);
    settings
        .apply_env(|key| std::env::var(key).ok())
        .map_err(anyhow::Error::msg)
        .context("invalid environment override")?;
    if let Some(bind) = cli.bind {
        settings.bind = bind;
    }
    if let Some(mode) = cli.mode {
        settings.mode = mode;
    }
    settings.log_json |= cli.log_json;
    settings.normalize();

    if cli.write_config {
        save_settings(&config_path, &settings)
            .with_context(|| format!("failed to write {}", config_path.display()))?;
        println!("wrote {}", config_path.display());
        return Ok(());
    }

    init_tracing(settings.log_json);
    info!(config = %config_path.display(), mode = %settings.mode, "Vigil starting");

    let engine_config = settings.engine_config().normalized();
    let transcriber = build_transcriber(&settings)?;
    let classifier = Arc::new(
        HttpClassifier::new(
            settings.toxicity_api_url.clone(),
            engine_config.classifier_threshold,
            engine_config.classifier_timeout,
        )
        .context("failed to build classifier client")?,
    );
    let store = match &settings.sqlite_path {
        Some(path) => Some(Arc::new(
            UtteranceStore::new(path)
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("failed to open {}", path.display()))?,
        )),
        None => None,
    };
    let sink = build_sink(&settings, store.clone())?;

    let engine = Arc::new(
        ModerationEngine::new(engine_config, transcriber, classifier, sink)
            .context("invalid engine configuration")?,
    );
    engine.warm_up().context("speech engine failed to start")?;

    let bind = settings.bind.clone();
    let state = AppState::new(Arc::clone(&engine), settings, store);
    let app = http::create_router(state);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(addr = %bind, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.shutdown();
    info!("Vigil stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn build_transcriber(settings: &ServerSettings) -> anyhow::Result<Arc<dyn Transcriber>> {
    match settings.stt_backend.as_str() {
        "whisper" => build_whisper(settings),
        _ => {
            warn!("using the stub speech engine, transcripts are placeholders");
            Ok(Arc::new(StubTranscriber::new()))
        }
    }
}

#[cfg(feature = "whisper")]
fn build_whisper(settings: &ServerSettings) -> anyhow::Result<Arc<dyn Transcriber>> {
    use vigil_core::{WhisperConfig, WhisperTranscriber};

    let mut config = WhisperConfig::default();
    if let Some(path) = &settings.whisper_model {
        config.model_path = path.clone();
    }
    config.language = (settings.language_hint != "auto").then(|| settings.language_hint.clone());
    let transcriber = WhisperTranscriber::new(config).context("failed to load whisper model")?;
    Ok(Arc::new(transcriber))
}

#[cfg(not(feature = "whisper"))]
fn build_whisper(_settings: &ServerSettings) -> anyhow::Result<Arc<dyn Transcriber>> {
    anyhow::bail!("sttBackend is \"whisper\" but vigil was built without the `whisper` feature")
}

fn build_sink(
    settings: &ServerSettings,
    store: Option<Arc<UtteranceStore>>,
) -> anyhow::Result<Arc<dyn TelemetrySink>> {
    let mut sinks: Vec<Arc<dyn TelemetrySink>> = Vec::new();
    if let Some(path) = &settings.stats_csv {
        let csv = CsvSink::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        info!(path = %path.display(), "writing utterance stats");
        sinks.push(Arc::new(csv));
    }
    if let Some(store) = store {
        info!(path = %store.path().display(), "recording utterances to sqlite");
        sinks.push(store);
    }
    Ok(match sinks.len() {
        0 => Arc::new(NullSink),
        1 => sinks.remove(0),
        _ => Arc::new(FanoutSink::new(sinks)),
    })
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
