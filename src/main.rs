//! tagview: run the tag overlay pipeline against a camera or generated frames.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tagview::capture::{FrameSource, SyntheticSource};
use tagview::detect::NullDetector;
use tagview::display::RasterSurface;
use tagview::settings::SourceKind;
use tagview::{Pipeline, PipelineEvent, Settings};

#[derive(Debug, Parser)]
#[command(name = "tagview", version, about = "Live fiducial tag overlay")]
struct Args {
    /// TOML settings file, layered over the defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(short, long)]
    duration: Option<u64>,

    /// Write the last presented overlay to this PNG on exit.
    #[arg(short, long)]
    snapshot: Option<PathBuf>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tagview=info"));
    let fmt = tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime());
    let registry = tracing_subscriber::registry().with(filter).with(fmt);

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.init();
}

fn frame_source(kind: SourceKind) -> Result<Box<dyn FrameSource>> {
    match kind {
        SourceKind::Synthetic => Ok(Box::new(SyntheticSource::new())),
        #[cfg(feature = "v4l2")]
        SourceKind::V4l2 => Ok(Box::new(tagview::capture::V4l2Source::new())),
        #[cfg(not(feature = "v4l2"))]
        SourceKind::V4l2 => Err(eyre!("built without the `v4l2` feature")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let args = Args::parse();
    info!("tagview launching...");

    let settings = Settings::load(args.config.as_deref())?;
    info!(?settings, "settings resolved");

    let source = frame_source(settings.capture.source)?;
    let surface = RasterSurface::new(settings.display.width, settings.display.height);
    let overlay = surface.presented();

    let mut pipeline = Pipeline::new(settings, source, NullDetector::default(), surface);
    let events = pipeline.events();
    pipeline.start()?;

    let monitor = tokio::spawn(async move {
        while let Ok(event) = events.recv_async().await {
            match event {
                PipelineEvent::StateChanged(state) => info!(?state, "pipeline"),
                PipelineEvent::CaptureFps(fps) => info!("capture: {fps:.1} fps"),
                PipelineEvent::DetectFps(fps) => info!("detect+render: {fps:.1} fps"),
                PipelineEvent::Backpressure { dropped, total_dropped } => {
                    warn!(dropped, total_dropped, "frames dropped")
                }
            }
        }
    });

    match args.duration {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                res = tokio::signal::ctrl_c() => res?,
            }
        }
        None => tokio::signal::ctrl_c().await?,
    }

    info!("shutting down");
    pipeline.stop();
    let stats = pipeline.stats();
    info!(?stats, "pipeline statistics");
    drop(pipeline);
    monitor.abort();

    if let Some(path) = args.snapshot {
        overlay
            .load()
            .save(&path)
            .map_err(|e| eyre!("failed to write snapshot {}: {e}", path.display()))?;
        info!(path = %path.display(), "overlay snapshot written");
    }

    info!("tagview shut down");
    Ok(())
}
