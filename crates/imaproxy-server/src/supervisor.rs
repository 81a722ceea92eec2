//! Pre-forked worker supervision
//!
//! The parent re-executes itself once per configured worker; the workers
//! share nothing and each bind the listen port with port reuse. Crashed
//! workers are restarted until the crash budget runs out, at which point
//! the parent exits nonzero so an external supervisor can take over.

use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{error, info, warn};

/// Restarts granted across all workers before giving up
const CRASH_BUDGET: u32 = 10;

/// Run the worker pool. Returns the parent's exit code.
pub async fn supervise(workers: u32) -> Result<i32> {
    let exe = std::env::current_exe().context("Cannot resolve own executable")?;
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut children: Vec<(u32, Child)> = Vec::new();
    for n in 0..workers {
        children.push((n, spawn_worker(&exe, &args, n)?));
    }

    let mut crashes = 0u32;
    let mut tick = tokio::time::interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            _ = crate::wait_for_signal() => {
                info!("Supervisor shutting down {} workers", children.len());
                shutdown_workers(children).await;
                return Ok(0);
            }
            _ = tick.tick() => {
                let mut exhausted = false;
                for (n, child) in children.iter_mut() {
                    let status = match child.try_wait() {
                        Ok(Some(status)) => status,
                        Ok(None) => continue,
                        Err(e) => {
                            error!("Cannot poll worker {}: {}", n, e);
                            continue;
                        }
                    };

                    crashes += 1;
                    if crashes > CRASH_BUDGET {
                        error!(
                            "Worker {} exited with {}; crash budget of {} exhausted",
                            n, status, CRASH_BUDGET
                        );
                        exhausted = true;
                        break;
                    }

                    warn!(
                        "Worker {} exited with {}; restarting (crash {} of {})",
                        n, status, crashes, CRASH_BUDGET
                    );
                    *child = spawn_worker(&exe, &args, *n)?;
                }
                if exhausted {
                    shutdown_workers(children).await;
                    return Ok(1);
                }
            }
        }
    }
}

fn spawn_worker(exe: &Path, args: &[String], n: u32) -> Result<Child> {
    let child = Command::new(exe)
        .args(args)
        .env(crate::WORKER_ENV, n.to_string())
        .spawn()
        .with_context(|| format!("Failed to spawn worker {}", n))?;
    info!("Worker {} started (pid {:?})", n, child.id());
    Ok(child)
}

async fn shutdown_workers(mut children: Vec<(u32, Child)>) {
    for (_, child) in children.iter_mut() {
        let _ = child.start_kill();
    }
    for (n, mut child) in children {
        if let Err(e) = child.wait().await {
            warn!("Waiting for worker {} failed: {}", n, e);
        }
    }
}
