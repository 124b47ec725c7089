//! Long-lived watch sessions.
//!
//! A [`WatchSession`] owns a background task that long-polls a prefix
//! through the [`FailoverRouter`], hands every accepted change to a
//! callback and re-issues the watch from the next index. The session
//! outlives its task: [`rerun`](WatchSession::rerun) replaces the task and
//! keeps the index watermark, which is how sessions follow a new leader.
//!
//! ```text
//!   observe() ──► WatchSession ──spawn──► watch_loop ──► router.watch(prefix, next)
//!                   │  ▲                      │
//!        cancel ────┘  └── rerun (heartbeat)  └──► callback(&ChangeInfo)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::protocol::{normalize_key, ChangeInfo};
use crate::router::FailoverRouter;
use crate::transport::{HttpTransport, Transport};

/// Invoked for every change a session accepts.
pub type ChangeCallback = Arc<dyn Fn(&ChangeInfo) + Send + Sync>;

/// Tracks the next change index a session asks for.
///
/// The service sometimes replays changes that were already delivered
/// after a restart or re-election. A change is delivered when nothing has
/// been seen yet or when its index is at or past the watermark; accepting
/// index `i` moves the watermark to `i + 1`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexWatermark {
    next: Option<u64>,
}

impl IndexWatermark {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from a known index.
    pub fn starting_at(index: Option<u64>) -> Self {
        Self { next: index }
    }

    /// Index to request next; `None` before the first change.
    pub fn next(&self) -> Option<u64> {
        self.next
    }

    /// Whether a change with `index` should be delivered. Advances the
    /// watermark when it is.
    pub fn accept(&mut self, index: Option<u64>) -> bool {
        match (self.next, index) {
            (None, Some(i)) => {
                self.next = Some(i + 1);
                true
            }
            (None, None) => true,
            (Some(next), Some(i)) if i >= next => {
                self.next = Some(i + 1);
                true
            }
            _ => false,
        }
    }
}

/// One spawned run of a session's loop.
struct LoopSlot {
    /// Taken by `join`.
    handle: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    alive: Arc<AtomicBool>,
}

impl LoopSlot {
    fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Clears the liveness flag when the loop task ends, however it ends.
struct AliveGuard(Arc<AtomicBool>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct SessionInner<T> {
    prefix: String,
    router: FailoverRouter<T>,
    callback: ChangeCallback,
    retry_delay: Duration,
    watermark: Mutex<IndexWatermark>,
    running: AtomicBool,
    slot: Mutex<Option<LoopSlot>>,
}

/// Handle to a continuous subscription on a prefix. Cheap to clone; all
/// clones control the same session.
pub struct WatchSession<T = HttpTransport> {
    inner: Arc<SessionInner<T>>,
}

impl<T> Clone for WatchSession<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> WatchSession<T> {
    /// Create a session without starting it.
    pub fn new(
        prefix: &str,
        router: FailoverRouter<T>,
        callback: ChangeCallback,
        retry_delay: Duration,
        from_index: Option<u64>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                prefix: normalize_key(prefix),
                router,
                callback,
                retry_delay,
                watermark: Mutex::new(IndexWatermark::starting_at(from_index)),
                running: AtomicBool::new(false),
                slot: Mutex::new(None),
            }),
        }
    }

    /// Start the loop. A session that is already running is restarted.
    pub fn run(&self) {
        self.inner.running.store(true, Ordering::Release);
        self.spawn_loop(false);
        info!(prefix = %self.inner.prefix, index = ?self.last_index(), "watch session started");
    }

    /// Replace the loop task, keeping the watermark. Cancelled sessions
    /// stay cancelled.
    pub fn rerun(&self) {
        if !self.spawn_loop(true) {
            debug!(prefix = %self.inner.prefix, "rerun ignored for cancelled session");
            return;
        }
        info!(prefix = %self.inner.prefix, index = ?self.last_index(), "watch session restarted");
    }

    /// Stop the session. An in-flight long-poll is dropped; use
    /// [`join`](Self::join) to wait for the task to finish.
    pub fn cancel(&self) {
        self.inner.running.store(false, Ordering::Release);
        if let Some(slot) = self.inner.slot.lock().expect("slot lock").as_ref() {
            let _ = slot.shutdown_tx.send(true);
        }
        info!(prefix = %self.inner.prefix, "watch session cancelled");
    }

    /// Wait for the current loop task to finish.
    pub async fn join(&self) {
        let handle = self
            .inner
            .slot
            .lock()
            .expect("slot lock")
            .as_mut()
            .and_then(|slot| slot.handle.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Whether the session wants to be watching (not cancelled).
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Whether the loop task is still executing.
    pub fn is_alive(&self) -> bool {
        self.inner
            .slot
            .lock()
            .expect("slot lock")
            .as_ref()
            .is_some_and(|slot| slot.alive.load(Ordering::Acquire))
    }

    /// The next index the session will ask for.
    pub fn last_index(&self) -> Option<u64> {
        self.inner.watermark.lock().expect("watermark lock").next()
    }

    pub fn prefix(&self) -> &str {
        &self.inner.prefix
    }

    /// Spawn a fresh loop in place of the current one. With
    /// `only_if_running`, the running flag is checked under the slot lock,
    /// which `cancel` also takes, so a concurrent cancel either prevents
    /// the spawn or signals the new loop. Returns whether a loop started.
    fn spawn_loop(&self, only_if_running: bool) -> bool {
        let previous = {
            let mut slot = self.inner.slot.lock().expect("slot lock");
            if only_if_running && !self.is_running() {
                return false;
            }
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let alive = Arc::new(AtomicBool::new(true));
            let guard = AliveGuard(alive.clone());
            let handle = tokio::spawn(watch_loop(self.inner.clone(), shutdown_rx, guard));
            slot.replace(LoopSlot {
                handle: Some(handle),
                shutdown_tx,
                alive,
            })
        };
        if let Some(previous) = previous {
            previous.stop();
        }
        true
    }
}

async fn watch_loop<T: Transport>(
    inner: Arc<SessionInner<T>>,
    mut shutdown: watch::Receiver<bool>,
    _alive: AliveGuard,
) {
    let prefix = inner.prefix.as_str();
    loop {
        if *shutdown.borrow() {
            break;
        }
        let index = inner.watermark.lock().expect("watermark lock").next();
        debug!(%prefix, ?index, "watching");

        let outcome = tokio::select! {
            result = inner.router.watch(prefix, index) => result,
            _ = shutdown.changed() => break,
        };

        match outcome {
            Ok(Some(change)) => {
                let deliver = inner.watermark.lock().expect("watermark lock").accept(change.index);
                if deliver {
                    (inner.callback)(&change);
                } else {
                    debug!(%prefix, index = ?change.index, "suppressed replayed change");
                }
            }
            Ok(None) => {
                tokio::select! {
                    _ = tokio::time::sleep(inner.retry_delay) => {}
                    _ = shutdown.changed() => break,
                }
            }
            Err(e) => {
                warn!(%prefix, error = %e, "watch failed, session waits for a rerun");
                break;
            }
        }
    }
    debug!(%prefix, "watch loop exited");
}

/// Snapshot of one registered session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserverStatus {
    pub prefix: String,
    pub running: bool,
    pub alive: bool,
    pub last_index: Option<u64>,
}

/// Sessions keyed by prefix, at most one per prefix.
pub struct ObserverRegistry<T = HttpTransport> {
    sessions: Arc<RwLock<HashMap<String, WatchSession<T>>>>,
}

impl<T> Clone for ObserverRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            sessions: self.sessions.clone(),
        }
    }
}

impl<T> Default for ObserverRegistry<T> {
    fn default() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<T: Transport> ObserverRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, cancelling any previous session on its prefix.
    pub async fn insert(&self, session: WatchSession<T>) {
        let mut sessions = self.sessions.write().await;
        if let Some(old) = sessions.insert(session.prefix().to_string(), session) {
            old.cancel();
            debug!(prefix = %old.prefix(), "replaced existing watch session");
        }
    }

    pub async fn get(&self, prefix: &str) -> Option<WatchSession<T>> {
        self.sessions.read().await.get(&normalize_key(prefix)).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn overview(&self) -> Vec<ObserverStatus> {
        let sessions = self.sessions.read().await;
        let mut out: Vec<ObserverStatus> = sessions
            .values()
            .map(|s| ObserverStatus {
                prefix: s.prefix().to_string(),
                running: s.is_running(),
                alive: s.is_alive(),
                last_index: s.last_index(),
            })
            .collect();
        out.sort_by(|a, b| a.prefix.cmp(&b.prefix));
        out
    }

    /// Restart sessions that want to run but whose task has ended.
    pub async fn rerun_dead(&self) -> usize {
        let sessions = self.sessions.read().await;
        let mut restarted = 0;
        for session in sessions.values() {
            if session.is_running() && !session.is_alive() {
                session.rerun();
                restarted += 1;
            }
        }
        restarted
    }

    /// Restart every running session, e.g. after the leader moved.
    pub async fn rerun_all(&self) -> usize {
        let sessions = self.sessions.read().await;
        let mut restarted = 0;
        for session in sessions.values().filter(|s| s.is_running()) {
            session.rerun();
            restarted += 1;
        }
        restarted
    }

    /// Cancel and forget every session.
    pub async fn cancel_all(&self) {
        let mut sessions = self.sessions.write().await;
        for (prefix, session) in sessions.drain() {
            session.cancel();
            debug!(%prefix, "watch session dropped from registry");
        }
    }
}
