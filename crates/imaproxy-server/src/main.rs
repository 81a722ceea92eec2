//! IMAProxy - transparent IMAP proxy entry point

use anyhow::Result;
use imaproxy_common::Config;
use imaproxy_core::ProxyServer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod supervisor;

/// Set in worker processes, holding the worker number
pub(crate) const WORKER_ENV: &str = "IMAPROXY_WORKER";

/// How long in-flight connections get to drain on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    init_logging(&config);

    let worker = std::env::var(WORKER_ENV)
        .ok()
        .and_then(|v| v.parse::<u32>().ok());

    if config.process.workers > 0 && worker.is_none() {
        info!(
            "Starting IMAProxy supervisor with {} workers",
            config.process.workers
        );
        let code = supervisor::supervise(config.process.workers).await?;
        std::process::exit(code);
    }

    run_proxy(config, worker).await
}

fn load_config() -> Result<Config> {
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(std::path::Path::new(&path))?,
        None => Config::load()?,
    };
    Ok(config)
}

async fn run_proxy(config: Config, worker: Option<u32>) -> Result<()> {
    match worker {
        Some(n) => info!("Starting IMAProxy worker {}...", n),
        None => info!("Starting IMAProxy..."),
    }

    let config = Arc::new(config);
    let server = Arc::new(ProxyServer::new(config.clone(), worker)?);
    let listener = server.bind().await?;

    drop_privileges(&config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let accept_handle = {
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run(listener, shutdown_rx).await {
                error!("Proxy server error: {}", e);
            }
        })
    };

    wait_for_signal().await?;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    let _ = accept_handle.await;

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while server.open_connections() > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            "Forcing shutdown with {} connections still open",
            server.open_connections()
        );
    }

    info!("IMAProxy shutdown complete");
    Ok(())
}

/// Block until SIGINT or SIGTERM arrives
pub(crate) async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok(())
    }
}

/// Give up root after the listen port is bound
#[cfg(unix)]
fn drop_privileges(config: &Config) -> Result<()> {
    use nix::unistd::{setgid, setuid, Gid, Uid};

    if let Some(gid) = config.process.user_gid {
        setgid(Gid::from_raw(gid))?;
        info!("Dropped group privileges to gid {}", gid);
    }
    if let Some(uid) = config.process.user_uid {
        setuid(Uid::from_raw(uid))?;
        info!("Dropped user privileges to uid {}", uid);
    }
    Ok(())
}

#[cfg(not(unix))]
fn drop_privileges(_config: &Config) -> Result<()> {
    Ok(())
}

fn init_logging(config: &Config) {
    let default = if config.logging.debug_log {
        "info,imaproxy_core=debug,imaproxy_server=debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(config.logging.use_colors),
        )
        .with(filter)
        .init();
}
