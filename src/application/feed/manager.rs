//! Reference-counted registry of live market data feeds.
//!
//! Each [`FeedKey`] maps to at most one slot, and each slot owns at most one
//! upstream connection. Callers attach and detach by handle; a slot whose
//! reference set empties is kept for a grace period so churn reuses the same
//! connection. A periodic sweep evicts slots idle past the grace period and
//! reopens connections that stayed unhealthy too long.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::domain::{CallerHandle, FeedEvent, FeedInfo, FeedKey, FeedPayload, FeedSnapshot};
use crate::error::ControlError;
use crate::infrastructure::config::feeds::FeedConfig;
use crate::port::{FeedStream, FeedUpstream};

/// A running pump task and the signal that stops it.
struct Connection {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Connection {
    /// Stop the pump and wait until the upstream stream is closed.
    async fn close(self) {
        let _ = self.stop.send(());
        let _ = self.task.await;
    }
}

struct SlotState {
    refs: BTreeSet<CallerHandle>,
    idle_since: Option<Instant>,
    last_access: Instant,
    payload: Option<FeedPayload>,
    received_at: Option<DateTime<Utc>>,
    healthy: bool,
    unhealthy_since: Option<Instant>,
    degraded: bool,
    connection: Option<Connection>,
    /// Bumped whenever the connection is replaced; pumps from older
    /// generations stop writing.
    generation: u64,
    retired: bool,
}

impl SlotState {
    fn new(now: Instant) -> Self {
        Self {
            refs: BTreeSet::new(),
            idle_since: Some(now),
            last_access: now,
            payload: None,
            received_at: None,
            healthy: true,
            unhealthy_since: None,
            degraded: false,
            connection: None,
            generation: 0,
            retired: false,
        }
    }

    fn mark_healthy(&mut self) {
        self.healthy = true;
        self.unhealthy_since = None;
        self.degraded = false;
    }

    fn mark_unhealthy(&mut self, now: Instant) {
        self.healthy = false;
        self.unhealthy_since.get_or_insert(now);
    }

    fn snapshot(&self, key: &FeedKey) -> FeedSnapshot {
        FeedSnapshot {
            key: key.clone(),
            payload: self.payload.clone(),
            received_at: self.received_at,
            healthy: self.healthy,
            degraded: self.degraded,
        }
    }

    /// Detach the current connection, invalidating its pump.
    fn take_connection(&mut self) -> Option<Connection> {
        self.generation += 1;
        self.connection.take()
    }
}

struct FeedSlot {
    key: FeedKey,
    /// Serializes opening and replacing the connection for this key only.
    open_lock: tokio::sync::Mutex<()>,
    state: Arc<Mutex<SlotState>>,
}

/// What a sweep decided for one slot.
enum SweepAction {
    Evict,
    Reopen,
}

/// Outcome of one eviction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: usize,
    pub reopened: usize,
    pub degraded: usize,
}

struct Inner {
    upstream: Arc<dyn FeedUpstream>,
    idle_timeout: Duration,
    unhealthy_timeout: Duration,
    slots: Mutex<HashMap<FeedKey, Arc<FeedSlot>>>,
}

/// Market Data Feed Manager.
///
/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct FeedManager {
    inner: Arc<Inner>,
}

impl FeedManager {
    pub fn new(upstream: Arc<dyn FeedUpstream>, config: &FeedConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                upstream,
                idle_timeout: config.idle_timeout(),
                unhealthy_timeout: config.unhealthy_timeout(),
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Mint a fresh caller handle.
    #[must_use]
    pub fn caller(&self) -> CallerHandle {
        CallerHandle::generate()
    }

    fn slot(&self, key: &FeedKey) -> Option<Arc<FeedSlot>> {
        self.inner.slots.lock().get(key).cloned()
    }

    fn slot_or_insert(&self, key: &FeedKey) -> Arc<FeedSlot> {
        let mut slots = self.inner.slots.lock();
        Arc::clone(slots.entry(key.clone()).or_insert_with(|| {
            Arc::new(FeedSlot {
                key: key.clone(),
                open_lock: tokio::sync::Mutex::new(()),
                state: Arc::new(Mutex::new(SlotState::new(Instant::now()))),
            })
        }))
    }

    fn unregister(&self, slot: &Arc<FeedSlot>) {
        let mut slots = self.inner.slots.lock();
        if slots.get(&slot.key).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            slots.remove(&slot.key);
        }
    }

    /// Attach `caller` to the feed for `key`, opening it on first use.
    ///
    /// Concurrent first acquires of the same key share one upstream open.
    ///
    /// # Errors
    ///
    /// [`ControlError::InvalidRequest`] for a malformed key,
    /// [`ControlError::UpstreamUnavailable`] if a new feed cannot be opened.
    pub async fn acquire(&self, key: &FeedKey, caller: &CallerHandle) -> Result<FeedSnapshot, ControlError> {
        key.validate()?;
        loop {
            let slot = self.slot_or_insert(key);
            let _open = slot.open_lock.lock().await;

            let needs_open = {
                let state = slot.state.lock();
                if state.retired {
                    // Evicted while we waited; start over with a fresh slot.
                    continue;
                }
                state.connection.is_none() && !state.degraded
            };

            if needs_open {
                match self.open_connection(&slot).await {
                    Ok(connection) => {
                        let mut state = slot.state.lock();
                        state.connection = Some(connection);
                        state.mark_healthy();
                    }
                    Err(e) => {
                        let abandoned = {
                            let mut state = slot.state.lock();
                            if state.refs.is_empty() {
                                state.retired = true;
                            }
                            state.retired
                        };
                        if abandoned {
                            self.unregister(&slot);
                        }
                        warn!(key = %key, error = %e, "Failed to open feed");
                        return Err(e);
                    }
                }
            }

            let now = Instant::now();
            let mut state = slot.state.lock();
            if state.refs.insert(caller.clone()) {
                debug!(key = %key, caller = %caller, refs = state.refs.len(), "Feed acquired");
            }
            state.idle_since = None;
            state.last_access = now;
            return Ok(state.snapshot(key));
        }
    }

    /// Detach `caller`. The feed lingers for the grace period once its last
    /// reference goes.
    ///
    /// # Errors
    ///
    /// [`ControlError::NotFound`] if the feed does not exist or `caller` is
    /// not attached to it.
    pub fn release(&self, key: &FeedKey, caller: &CallerHandle) -> Result<(), ControlError> {
        let slot = self
            .slot(key)
            .ok_or_else(|| ControlError::NotFound(format!("feed {key}")))?;
        let now = Instant::now();
        let mut state = slot.state.lock();
        if state.retired || !state.refs.remove(caller) {
            return Err(ControlError::NotFound(format!(
                "caller {caller} on feed {key}"
            )));
        }
        state.last_access = now;
        if state.refs.is_empty() {
            state.idle_since = Some(now);
            debug!(key = %key, "Feed idle, grace period started");
        }
        Ok(())
    }

    /// Latest cached snapshot.
    ///
    /// Counts as a reference taken and dropped at once: an idle feed starts
    /// its grace period over.
    ///
    /// # Errors
    ///
    /// [`ControlError::NotFound`] if no feed exists for `key`.
    pub fn read(&self, key: &FeedKey) -> Result<FeedSnapshot, ControlError> {
        let slot = self
            .slot(key)
            .ok_or_else(|| ControlError::NotFound(format!("feed {key}")))?;
        let mut state = slot.state.lock();
        if state.retired {
            return Err(ControlError::NotFound(format!("feed {key}")));
        }
        let now = Instant::now();
        state.last_access = now;
        if state.refs.is_empty() {
            state.idle_since = Some(now);
        }
        Ok(state.snapshot(key))
    }

    /// Bookkeeping for every live feed, ordered by key.
    #[must_use]
    pub fn active_feeds(&self) -> Vec<FeedInfo> {
        let slots: Vec<Arc<FeedSlot>> = self.inner.slots.lock().values().cloned().collect();
        let now = Instant::now();
        let mut feeds: Vec<FeedInfo> = slots
            .iter()
            .filter_map(|slot| {
                let state = slot.state.lock();
                if state.retired {
                    return None;
                }
                let expires_in_secs = state.idle_since.map(|since| {
                    self.inner
                        .idle_timeout
                        .saturating_sub(now.saturating_duration_since(since))
                        .as_secs()
                });
                Some(FeedInfo {
                    key: slot.key.clone(),
                    references: state.refs.len(),
                    seconds_since_access: now.saturating_duration_since(state.last_access).as_secs(),
                    expires_in_secs,
                    healthy: state.healthy,
                    degraded: state.degraded,
                    has_data: state.payload.is_some(),
                })
            })
            .collect();
        feeds.sort_by(|a, b| a.key.cmp(&b.key));
        feeds
    }

    /// Number of live feeds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.slots.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One eviction pass.
    ///
    /// Slots whose connection is being opened are skipped and revisited on
    /// the next pass.
    pub async fn sweep(&self) -> SweepReport {
        let slots: Vec<Arc<FeedSlot>> = self.inner.slots.lock().values().cloned().collect();
        let now = Instant::now();

        let outcomes = join_all(slots.into_iter().map(|slot| self.sweep_slot(slot, now))).await;

        let mut report = SweepReport::default();
        for outcome in outcomes.into_iter().flatten() {
            match outcome {
                (SweepAction::Evict, _) => report.evicted += 1,
                (SweepAction::Reopen, true) => report.reopened += 1,
                (SweepAction::Reopen, false) => report.degraded += 1,
            }
        }
        if report != SweepReport::default() {
            info!(
                evicted = report.evicted,
                reopened = report.reopened,
                degraded = report.degraded,
                "Feed sweep complete"
            );
        }
        report
    }

    async fn sweep_slot(&self, slot: Arc<FeedSlot>, now: Instant) -> Option<(SweepAction, bool)> {
        let Ok(_open) = slot.open_lock.try_lock() else {
            return None;
        };

        let (action, old) = {
            let mut state = slot.state.lock();
            if state.retired {
                return None;
            }
            let idle_expired = state.refs.is_empty()
                && state
                    .idle_since
                    .is_some_and(|since| now.saturating_duration_since(since) >= self.inner.idle_timeout);
            let unhealthy_expired = !state.healthy
                && state.unhealthy_since.is_some_and(|since| {
                    now.saturating_duration_since(since) >= self.inner.unhealthy_timeout
                });

            if idle_expired {
                state.retired = true;
                (SweepAction::Evict, state.take_connection())
            } else if unhealthy_expired || (state.degraded && state.connection.is_none()) {
                (SweepAction::Reopen, state.take_connection())
            } else {
                return None;
            }
        };

        if let Some(connection) = old {
            connection.close().await;
        }

        match action {
            SweepAction::Evict => {
                self.unregister(&slot);
                info!(key = %slot.key, "Evicted idle feed");
                Some((SweepAction::Evict, true))
            }
            SweepAction::Reopen => {
                warn!(key = %slot.key, "Reopening unhealthy feed");
                let reopened = match self.open_connection(&slot).await {
                    Ok(connection) => {
                        let mut state = slot.state.lock();
                        state.connection = Some(connection);
                        state.mark_healthy();
                        true
                    }
                    Err(e) => {
                        let mut state = slot.state.lock();
                        state.degraded = true;
                        state.healthy = false;
                        state.unhealthy_since = Some(Instant::now());
                        warn!(key = %slot.key, error = %e, "Feed reopen failed, marking degraded");
                        false
                    }
                };
                Some((SweepAction::Reopen, reopened))
            }
        }
    }

    /// Close and forget the feed for `key`, dropping every reference.
    ///
    /// # Errors
    ///
    /// [`ControlError::NotFound`] if no feed exists for `key`.
    pub async fn close(&self, key: &FeedKey) -> Result<(), ControlError> {
        let slot = self
            .slot(key)
            .ok_or_else(|| ControlError::NotFound(format!("feed {key}")))?;
        let _open = slot.open_lock.lock().await;
        let connection = {
            let mut state = slot.state.lock();
            if state.retired {
                return Err(ControlError::NotFound(format!("feed {key}")));
            }
            state.retired = true;
            state.refs.clear();
            state.take_connection()
        };
        if let Some(connection) = connection {
            connection.close().await;
        }
        self.unregister(&slot);
        info!(key = %key, "Feed closed manually");
        Ok(())
    }

    /// Close every feed.
    pub async fn shutdown(&self) {
        let keys: Vec<FeedKey> = self.inner.slots.lock().keys().cloned().collect();
        for key in keys {
            let _ = self.close(&key).await;
        }
    }

    /// Run [`sweep`](Self::sweep) every `interval` until the task is aborted.
    #[must_use]
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;
                debug!(interval_secs = interval.as_secs(), "Feed sweeper started");
                loop {
                    ticker.tick().await;
                    manager.sweep().await;
                }
            }
            .instrument(info_span!("feed_sweeper")),
        )
    }

    async fn open_connection(&self, slot: &Arc<FeedSlot>) -> Result<Connection, ControlError> {
        let stream = self
            .inner
            .upstream
            .open(&slot.key)
            .await
            .map_err(|e| ControlError::UpstreamUnavailable(format!("{}: {e}", slot.key)))?;

        let generation = {
            let mut state = slot.state.lock();
            state.generation += 1;
            state.generation
        };
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(pump(
            stream,
            Arc::clone(&slot.state),
            generation,
            stop_rx,
            slot.key.clone(),
        ));
        info!(key = %slot.key, upstream = self.inner.upstream.name(), "Feed opened");
        Ok(Connection { stop, task })
    }
}

/// Copy upstream events into the slot until told to stop, then close the
/// stream.
async fn pump(
    mut stream: Box<dyn FeedStream>,
    state: Arc<Mutex<SlotState>>,
    generation: u64,
    mut stop: oneshot::Receiver<()>,
    key: FeedKey,
) {
    loop {
        tokio::select! {
            _ = &mut stop => break,
            event = stream.next_event() => {
                let ended = {
                    let now = Instant::now();
                    let mut slot = state.lock();
                    if slot.generation != generation {
                        break;
                    }
                    match event {
                        Some(FeedEvent::Data(payload)) => {
                            slot.payload = Some(payload);
                            slot.received_at = Some(Utc::now());
                            slot.mark_healthy();
                            false
                        }
                        Some(FeedEvent::Healthy) => {
                            slot.mark_healthy();
                            false
                        }
                        Some(FeedEvent::Unhealthy { reason }) => {
                            if slot.healthy {
                                warn!(key = %key, reason = %reason, "Feed unhealthy");
                            }
                            slot.mark_unhealthy(now);
                            false
                        }
                        None => {
                            warn!(key = %key, "Feed stream ended");
                            slot.mark_unhealthy(now);
                            true
                        }
                    }
                };
                if ended {
                    let _ = (&mut stop).await;
                    break;
                }
            }
        }
    }
    stream.close().await;
}
