//! Correlation-id keyed table of outstanding requests.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::domain::{BrokerMessage, CorrelationId};
use crate::error::ControlError;

/// Outstanding requests awaiting a reply.
///
/// At most one waiter exists per correlation id. An entry disappears when it
/// is resolved or when its [`PendingReply`] is dropped, so a reply arriving
/// after a timeout finds nothing and is discarded.
#[derive(Debug, Default)]
pub struct PendingTable {
    waiters: Mutex<HashMap<CorrelationId, oneshot::Sender<BrokerMessage>>>,
}

impl PendingTable {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a waiter for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Conflict`] if `id` is already outstanding.
    pub fn register(self: &Arc<Self>, id: CorrelationId) -> Result<PendingReply, ControlError> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock();
        if waiters.contains_key(&id) {
            return Err(ControlError::Conflict(format!(
                "request {id} is already outstanding"
            )));
        }
        waiters.insert(id.clone(), tx);
        Ok(PendingReply {
            id,
            rx,
            table: Arc::clone(self),
        })
    }

    /// Deliver `message` to the waiter for `id`.
    ///
    /// Returns the message back if nobody is waiting.
    pub fn resolve(&self, id: &CorrelationId, message: BrokerMessage) -> Result<(), BrokerMessage> {
        let Some(tx) = self.waiters.lock().remove(id) else {
            return Err(message);
        };
        tx.send(message)
    }

    fn forget(&self, id: &CorrelationId) {
        self.waiters.lock().remove(id);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receiving side of a registered request.
#[derive(Debug)]
pub struct PendingReply {
    id: CorrelationId,
    rx: oneshot::Receiver<BrokerMessage>,
    table: Arc<PendingTable>,
}

impl PendingReply {
    /// Wait for the reply. `None` if the table was torn down.
    pub async fn recv(&mut self) -> Option<BrokerMessage> {
        (&mut self.rx).await.ok()
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.table.forget(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg() -> BrokerMessage {
        BrokerMessage::new("t", "{}")
    }

    #[tokio::test]
    async fn resolves_registered_waiter() {
        let table = PendingTable::new();
        let id = CorrelationId::generate();
        let mut reply = table.register(id.clone()).unwrap();
        assert!(table.resolve(&id, msg()).is_ok());
        assert_eq!(reply.recv().await, Some(msg()));
        assert!(table.is_empty());
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let table = PendingTable::new();
        let id = CorrelationId::generate();
        let _reply = table.register(id.clone()).unwrap();
        assert!(matches!(table.register(id), Err(ControlError::Conflict(_))));
    }

    #[test]
    fn dropped_waiter_is_forgotten() {
        let table = PendingTable::new();
        let id = CorrelationId::generate();
        drop(table.register(id.clone()).unwrap());
        assert!(table.is_empty());
        assert!(table.resolve(&id, msg()).is_err());
    }

    #[test]
    fn unknown_id_returns_message() {
        let table = PendingTable::new();
        let back = table.resolve(&CorrelationId::generate(), msg()).unwrap_err();
        assert_eq!(back, msg());
    }
}
