//! Background leader heartbeat.
//!
//! Every tick reads a key through the router. A failed read marks the
//! cluster down; the next tick then refreshes the cluster before reading.
//! Watch sessions are restarted when the leader moves (their long-polls
//! are parked on the old leader). Any other successful tick restarts
//! sessions whose loop died, whether during an outage or on a transient
//! failure the heartbeat never saw.

use std::time::Duration;

use http::Method;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::observer::ObserverRegistry;
use crate::router::FailoverRouter;
use crate::transport::Transport;

/// Cluster reachability as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStatus {
    Up,
    Down,
}

/// Handle to the heartbeat task. Dropping it stops the task.
pub struct Heartbeat {
    status: watch::Receiver<ClusterStatus>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    /// Spawn the heartbeat. Returns `None` when `interval` is zero.
    pub fn start<T: Transport>(
        router: FailoverRouter<T>,
        observers: ObserverRegistry<T>,
        interval: Duration,
        key: &str,
    ) -> Option<Self> {
        if interval.is_zero() {
            debug!("heartbeat disabled");
            return None;
        }

        let initial = match router.cluster().current_leader() {
            Some(_) => ClusterStatus::Up,
            None => ClusterStatus::Down,
        };
        let (status_tx, status) = watch::channel(initial);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let key = key.to_string();

        let handle = tokio::spawn(async move {
            run_heartbeat_loop(router, observers, interval, &key, status_tx, shutdown_rx).await;
        });

        info!(interval_ms = interval.as_millis() as u64, "heartbeat started");
        Some(Self {
            status,
            shutdown_tx,
            handle,
        })
    }

    pub fn status(&self) -> ClusterStatus {
        *self.status.borrow()
    }

    /// Receive every status change.
    pub fn subscribe(&self) -> watch::Receiver<ClusterStatus> {
        self.status.clone()
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        self.handle.abort();
    }
}

async fn run_heartbeat_loop<T: Transport>(
    router: FailoverRouter<T>,
    observers: ObserverRegistry<T>,
    interval: Duration,
    key: &str,
    status_tx: watch::Sender<ClusterStatus>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last_leader = router.cluster().current_leader().map(|n| n.id.clone());

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                beat(&router, &observers, key, &status_tx, &mut last_leader).await;
            }
            _ = shutdown.changed() => {
                debug!("heartbeat shutting down");
                break;
            }
        }
    }
}

async fn beat<T: Transport>(
    router: &FailoverRouter<T>,
    observers: &ObserverRegistry<T>,
    key: &str,
    status_tx: &watch::Sender<ClusterStatus>,
    last_leader: &mut Option<String>,
) {
    let cluster = router.cluster();
    let was_down = *status_tx.borrow() == ClusterStatus::Down;
    let mut recovered = false;

    if was_down {
        match cluster.refresh().await {
            Ok(_) if cluster.current_leader().is_some() => {
                status_tx.send_replace(ClusterStatus::Up);
                recovered = true;
                info!("cluster reachable again");
            }
            Ok(_) => debug!("cluster still has no leader"),
            Err(e) => debug!(error = %e, "heartbeat refresh failed"),
        }
    }

    let request = router.protocol().key_request(Method::GET, key);
    match router.execute(request).await {
        Ok(resp) => debug!(%key, status = %resp.status, "heartbeat read"),
        Err(e) => {
            if status_tx.send_replace(ClusterStatus::Down) == ClusterStatus::Up {
                warn!(error = %e, "heartbeat failed, cluster marked down");
            }
            return;
        }
    }

    let leader = cluster.current_leader().map(|n| n.id.clone());
    let moved = matches!((&*last_leader, &leader), (Some(old), Some(new)) if old != new);
    if moved {
        let restarted = observers.rerun_all().await;
        info!(from = ?last_leader, to = ?leader, restarted, "leader moved, watch sessions restarted");
    } else {
        let restarted = observers.rerun_dead().await;
        if recovered {
            info!(restarted, "restarted watch sessions after outage");
        } else if restarted > 0 {
            info!(restarted, "restarted dead watch sessions");
        }
    }
    if leader.is_some() {
        *last_leader = leader;
    }
    let overview = observers.overview().await;
    debug!(observers = ?overview, "heartbeat complete");
}
