//! Headless lipcast host.
//!
//! Loads the config, opens one session against a counting sink and reads
//! newline-delimited JSON commands from stdin:
//!
//! ```text
//! {"command":"speak","text":"hello there"}
//! {"command":"switch_avatar","avatar_id":"bob"}
//! {"command":"interrupt"}
//! {"command":"shutdown"}
//! ```
//!
//! Responses go to stdout, diagnostics to stderr (and a daily log file when
//! `logging.directory` is set).

use anyhow::Context;
use lipcast::config::LipcastConfig;
use lipcast::control::{ControlBus, run_command_reader};
use lipcast::session::SessionManager;
use lipcast::transport::{NullSink, TransportSink};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

fn init_logging(config: &LipcastConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = fmt::layer().with_writer(std::io::stderr);

    match &config.logging.directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "lipcast.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

fn load_config() -> anyhow::Result<LipcastConfig> {
    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(LipcastConfig::default_config_path);
    if path.exists() {
        LipcastConfig::from_file(&path).with_context(|| format!("loading {}", path.display()))
    } else {
        Ok(LipcastConfig::default())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;
    let _guard = init_logging(&config);
    tracing::info!("lipcast-host starting");

    let chunk_samples = config.audio.chunk_samples;
    let poll = config.render.poll_timeout();
    let manager = SessionManager::new(config)
        .context("building session manager")?
        .start()
        .context("starting session manager")?;

    let sink = Arc::new(NullSink::default());
    let transport: Arc<dyn TransportSink> = sink.clone();
    let session = manager
        .negotiate(transport, None)
        .context("opening session")?;
    manager.activate(&session).context("activating session")?;

    let bus = ControlBus::new(chunk_samples, poll);
    bus.attach(&manager, session.clone())
        .context("attaching control route")?;
    tracing::info!(session = %session, "session ready, reading commands from stdin");

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let result = run_command_reader(stdin, tokio::io::stdout(), &bus, &session).await;

    // Let the listener process a trailing shutdown before tearing down.
    tokio::time::sleep(poll).await;
    let manager_for_close = Arc::clone(&manager);
    tokio::task::spawn_blocking(move || {
        bus.close();
        manager_for_close.shutdown();
    })
    .await
    .context("shutting down")?;

    tracing::info!(
        session = %session,
        video = sink.video_frames(),
        audio = sink.audio_frames(),
        "lipcast-host shut down"
    );
    result.map_err(|e| anyhow::anyhow!("command reader failed: {e}"))
}
