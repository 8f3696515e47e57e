use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::{Parser, ValueEnum};
use parking_lot::RwLock;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use webrtc::media::io::h264_reader::H264Reader;

use daydream_client::auth::{CredentialStore, LoginManager, LoginOptions, LoginStatus};
use daydream_client::gateway::{GatewayClient, GatewayConfig};
use daydream_client::orchestrator::{Orchestrator, OrchestratorConfig, RtcConnector};
use daydream_client::params::{GenerationParams, PromptInput};
use daydream_client::webrtc::{VideoSample, VideoSource, WebRtcConfig};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// Daydream client command line arguments
#[derive(Parser, Debug)]
#[command(name = "daydream-client")]
#[command(version, about = "Stream a local video source through the Daydream gateway", long_about = None)]
struct CliArgs {
    /// Gateway API base URL
    #[arg(long, value_name = "URL", default_value = "https://api.daydream.live")]
    api_url: String,

    /// Pipeline to run on the gateway
    #[arg(long, default_value = "streamdiffusion")]
    pipeline: String,

    /// Generation prompt
    #[arg(short, long, default_value = "a watercolor painting")]
    prompt: String,

    /// Diffusion model identifier
    #[arg(long, default_value = "stabilityai/sd-turbo")]
    model_id: String,

    /// Annex-B H.264 file used as the video source
    #[arg(long, value_name = "FILE")]
    source: Option<PathBuf>,

    /// Source frame rate
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Force a fresh browser login even when a key is stored
    #[arg(long)]
    login: bool,

    /// Delete the stored API key and exit
    #[arg(long)]
    logout: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level);

    let store = CredentialStore::default_location()?;

    if args.logout {
        store.delete()?;
        info!("Stored API key removed");
        return Ok(());
    }

    let api_key = acquire_key(&store, &args).await?;

    let source_path = args
        .source
        .clone()
        .ok_or_else(|| anyhow::anyhow!("--source <FILE> is required to stream"))?;

    let gateway = Arc::new(GatewayClient::new(
        GatewayConfig {
            api_url: args.api_url.clone(),
            pipeline: args.pipeline.clone(),
        },
        api_key,
    ));

    let params = Arc::new(RwLock::new(GenerationParams {
        model_id: args.model_id.clone(),
        prompt: PromptInput::Text(args.prompt.clone()),
        ..Default::default()
    }));

    let source = Arc::new(VideoSource::new());
    let webrtc_config = WebRtcConfig::default();
    let connector = Arc::new(RtcConnector::new(
        webrtc_config,
        gateway.clone(),
        source.clone(),
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        gateway,
        connector,
        params,
        OrchestratorConfig::default(),
    ));

    let feeder = tokio::spawn(feed_from_file(source_path, args.fps.max(1), source));
    let session = orchestrator.spawn();

    let mut state_rx = orchestrator.state_watch();
    let watcher = tokio::spawn(async move {
        while state_rx.changed().await.is_ok() {
            info!("Session: {}", *state_rx.borrow());
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    orchestrator.shutdown();
    session.await?;

    feeder.abort();
    watcher.abort();
    Ok(())
}

/// Load the stored key or walk the user through the browser login.
async fn acquire_key(store: &CredentialStore, args: &CliArgs) -> anyhow::Result<String> {
    if !args.login {
        if let Some(key) = store.load() {
            return Ok(key);
        }
    }

    let mut manager = LoginManager::new();
    let flow = manager
        .start(LoginOptions {
            api_url: args.api_url.clone(),
            ..LoginOptions::new(store.clone())
        })
        .await?;

    println!("Open this URL in your browser to sign in:");
    println!("  {}", flow.browser_url());

    match flow.wait().await {
        LoginStatus::Success(key) => Ok(key),
        LoginStatus::Failed(reason) => Err(anyhow::anyhow!("login failed: {}", reason)),
        LoginStatus::Pending => unreachable!("wait() never returns pending"),
    }
}

/// Push NAL units from an Annex-B file into the source at the given rate,
/// looping the file until aborted.
async fn feed_from_file(path: PathBuf, fps: u32, source: Arc<VideoSource>) {
    let frame_duration = Duration::from_secs(1) / fps;
    let mut ticker = tokio::time::interval(frame_duration);

    loop {
        let file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(e) => {
                warn!("Cannot open source file {}: {}", path.display(), e);
                return;
            }
        };
        let mut reader = H264Reader::new(BufReader::new(file), 1_048_576);

        while let Ok(nal) = reader.next_nal() {
            ticker.tick().await;
            source.push(VideoSample {
                data: Bytes::from(nal.data.to_vec()),
                duration: frame_duration,
            });
        }
        info!("Source file ended, looping");
    }
}

fn init_logging(level: LogLevel) {
    let filter = match level {
        LogLevel::Error => "daydream_client=error",
        LogLevel::Warn => "daydream_client=warn",
        LogLevel::Info => "daydream_client=info",
        LogLevel::Debug => "daydream_client=debug,webrtc=info",
        LogLevel::Trace => "daydream_client=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
