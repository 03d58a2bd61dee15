//! In-memory [`FeedUpstream`] that counts opens and closes per key.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::domain::{FeedEvent, FeedKey};
use crate::error::Error;
use crate::port::{FeedStream, FeedUpstream};

#[derive(Default)]
struct State {
    opens: HashMap<FeedKey, u32>,
    closes: HashMap<FeedKey, u32>,
    senders: HashMap<FeedKey, mpsc::UnboundedSender<FeedEvent>>,
    fail_next: u32,
    open_delay: Duration,
}

/// Upstream whose streams are fed by the test.
///
/// Every `open` call is counted, failed ones included. Events pushed for a
/// key go to the most recently opened stream.
#[derive(Clone, Default)]
pub struct CountingUpstream {
    state: Arc<Mutex<State>>,
}

impl CountingUpstream {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` opens with a connection error.
    pub fn fail_next_opens(&self, n: u32) {
        self.state.lock().fail_next = n;
    }

    /// Make every later `open` take `delay` before it resolves.
    pub fn set_open_delay(&self, delay: Duration) {
        self.state.lock().open_delay = delay;
    }

    /// Deliver `event` on the live stream for `key`. Returns `false` if
    /// there is none.
    pub fn push(&self, key: &FeedKey, event: FeedEvent) -> bool {
        self.state
            .lock()
            .senders
            .get(key)
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    /// End the live stream for `key` as if the exchange hung up.
    pub fn end_stream(&self, key: &FeedKey) {
        self.state.lock().senders.remove(key);
    }

    #[must_use]
    pub fn open_count(&self, key: &FeedKey) -> u32 {
        self.state.lock().opens.get(key).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn close_count(&self, key: &FeedKey) -> u32 {
        self.state.lock().closes.get(key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl FeedUpstream for CountingUpstream {
    async fn open(&self, key: &FeedKey) -> Result<Box<dyn FeedStream>, Error> {
        let delay = self.state.lock().open_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        *state.opens.entry(key.clone()).or_default() += 1;
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(Error::Connection(format!("refused {key}")));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.senders.insert(key.clone(), tx);
        Ok(Box::new(CountingStream {
            key: key.clone(),
            rx,
            state: Arc::clone(&self.state),
        }))
    }

    fn name(&self) -> &'static str {
        "counting"
    }
}

struct CountingStream {
    key: FeedKey,
    rx: mpsc::UnboundedReceiver<FeedEvent>,
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl FeedStream for CountingStream {
    async fn next_event(&mut self) -> Option<FeedEvent> {
        self.rx.recv().await
    }

    async fn close(&mut self) {
        self.rx.close();
        *self.state.lock().closes.entry(self.key.clone()).or_default() += 1;
    }
}
