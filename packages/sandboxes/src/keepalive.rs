// ABOUTME: Periodic keepalive tasks that hold a sandbox open against idle eviction
// ABOUTME: Service loop re-probes health, platform loop issues a no-op remote command

use crate::backend::{ExecOptions, SandboxHandle};
use crate::probe::ReadinessProber;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Minimum service keepalive period
const SERVICE_FLOOR: Duration = Duration::from_secs(5);
/// Minimum platform keepalive period
const PLATFORM_FLOOR: Duration = Duration::from_secs(10);

/// Clamp a configured service keepalive interval to its floor
pub fn clamp_service_interval(secs: u64) -> Duration {
    Duration::from_secs(secs).max(SERVICE_FLOOR)
}

/// Clamp a configured platform keepalive interval to its floor
pub fn clamp_platform_interval(secs: u64) -> Duration {
    Duration::from_secs(secs).max(PLATFORM_FLOOR)
}

/// Handle to one running keepalive loop.
///
/// Cancellation is cooperative: the loop checks its shutdown channel at
/// every sleep boundary. `cancel` also aborts the task outright so a
/// mid-probe tick cannot outlive teardown.
pub struct KeepaliveHandle {
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl KeepaliveHandle {
    pub fn cancel(self) {
        let _ = self.shutdown.send(true);
        self.task.abort();
    }
}

/// Spawn the service keepalive: re-probe the public health endpoint on a
/// fixed period and log health transitions. The loop exits when cancelled
/// or once the owning registry entry (tracked via `liveness`) is gone.
pub fn spawn_service_keepalive(
    sandbox_id: String,
    prober: Arc<ReadinessProber>,
    secure_url: String,
    plain_url: Option<String>,
    interval: Duration,
    liveness: Weak<()>,
) -> KeepaliveHandle {
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        info!(
            "Service keepalive for {} every {:?} ({})",
            sandbox_id, interval, secure_url
        );
        let mut was_healthy: Option<bool> = None;
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if *shutdown_rx.borrow() {
                break;
            }
            if liveness.upgrade().is_none() {
                debug!("Registry entry for {} is gone; keepalive exiting", sandbox_id);
                break;
            }

            let result = prober.probe_once(&secure_url, plain_url.as_deref()).await;
            let healthy = result.any_ok();
            match was_healthy {
                Some(prev) if prev == healthy => {}
                _ if healthy => info!("Sandbox {} is healthy", sandbox_id),
                _ => warn!("Sandbox {} failed its keepalive probe", sandbox_id),
            }
            was_healthy = Some(healthy);
        }
        debug!("Service keepalive for {} stopped", sandbox_id);
    });
    KeepaliveHandle { task, shutdown }
}

/// Spawn the platform keepalive: a trivial remote command on a fixed
/// period, purely to register backend activity. Execution errors are
/// logged and the loop continues.
pub fn spawn_platform_keepalive(
    sandbox_id: String,
    handle: Arc<dyn SandboxHandle>,
    interval: Duration,
    liveness: Weak<()>,
) -> KeepaliveHandle {
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        info!(
            "Platform keepalive for {} every {:?}",
            sandbox_id, interval
        );
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if *shutdown_rx.borrow() {
                break;
            }
            if liveness.upgrade().is_none() {
                debug!(
                    "Registry entry for {} is gone; platform keepalive exiting",
                    sandbox_id
                );
                break;
            }

            match handle
                .execute("bash -lc 'true'", ExecOptions::default())
                .await
            {
                Ok(_) => debug!("Platform keepalive tick for {}", sandbox_id),
                Err(e) => warn!("Platform keepalive for {} failed: {}", sandbox_id, e),
            }
        }
        debug!("Platform keepalive for {} stopped", sandbox_id);
    });
    KeepaliveHandle { task, shutdown }
}
