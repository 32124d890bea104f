//! panostream: six-lens camera frame streaming service

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use color_eyre::{eyre::WrapErr, Result};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use panostream::{Collaborators, Config, Supervisor};

/// Fallback when no config path is given on the command line
const CONFIG_ENV: &str = "PANOSTREAM_CONFIG";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("panostream=info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_timer(fmt::time::uptime()));
    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());
    registry.init();

    info!("panostream launching...");

    // Load configuration
    let path = std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os(CONFIG_ENV))
        .map(PathBuf::from);
    let config = Config::load(path.as_deref()).wrap_err("loading configuration")?;
    info!(
        "Streaming {} lens(es) to {} ({:?})",
        config.capture.frame_lens_count(),
        config.transport.endpoint,
        config.transport.mode
    );
    let config = Arc::new(ArcSwap::from_pointee(config));

    let supervisor = Supervisor::new(config.clone(), Collaborators::default());
    let handle = supervisor.handle();

    #[cfg(unix)]
    reload::spawn(path, config, handle.clone())?;

    let mut run = tokio::task::spawn_blocking(move || supervisor.run());
    tokio::select! {
        joined = &mut run => joined?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Ctrl-C received, shutting down");
            handle.shutdown();
            run.await?;
        }
    }

    info!(stats = ?handle.stats(), "panostream shutting down");
    Ok(())
}

#[cfg(unix)]
mod reload {
    use std::path::PathBuf;
    use std::sync::Arc;

    use arc_swap::ArcSwap;
    use color_eyre::Result;
    use tokio::signal::unix::{signal, SignalKind};
    use tracing::{info, warn};

    use panostream::{Config, SupervisorHandle};

    /// Reload the config on SIGHUP and restart the pipeline with it.
    pub fn spawn(
        path: Option<PathBuf>,
        config: Arc<ArcSwap<Config>>,
        handle: SupervisorHandle,
    ) -> Result<()> {
        let mut hangup = signal(SignalKind::hangup())?;
        tokio::spawn(async move {
            while hangup.recv().await.is_some() {
                match Config::load(path.as_deref()) {
                    Ok(fresh) => {
                        info!("Configuration reloaded, restarting pipeline");
                        config.store(Arc::new(fresh));
                        handle.restart();
                    }
                    Err(e) => warn!("Keeping current configuration: {}", e),
                }
            }
        });
        Ok(())
    }
}
