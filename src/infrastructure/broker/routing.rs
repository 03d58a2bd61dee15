//! Topic-filter routes for uncorrelated inbound messages.

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

use crate::domain::{topic_matches, BrokerMessage};

#[derive(Debug)]
struct Route {
    filter: String,
    tx: mpsc::Sender<BrokerMessage>,
}

/// Registered routes, in registration order.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, filter: impl Into<String>, tx: mpsc::Sender<BrokerMessage>) {
        self.routes.push(Route {
            filter: filter.into(),
            tx,
        });
    }

    /// Distinct filters with a live receiver, to (re)subscribe on connect.
    #[must_use]
    pub fn filters(&self) -> Vec<String> {
        let mut filters: Vec<String> = Vec::new();
        for route in self.routes.iter().filter(|r| !r.tx.is_closed()) {
            if !filters.contains(&route.filter) {
                filters.push(route.filter.clone());
            }
        }
        filters
    }

    /// Deliver to every matching route without blocking.
    ///
    /// Full routes drop the message; closed routes are removed. Returns the
    /// number of routes that accepted it.
    pub fn dispatch(&mut self, message: &BrokerMessage) -> usize {
        let mut delivered = 0;
        self.routes.retain(|route| {
            if !topic_matches(&route.filter, &message.topic) {
                return !route.tx.is_closed();
            }
            match route.tx.try_send(message.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    warn!(
                        filter = %route.filter,
                        topic = %message.topic,
                        "Route queue full, dropping message"
                    );
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
        delivered
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatches_to_matching_routes_only() {
        let mut table = RouteTable::new();
        let (status_tx, mut status_rx) = mpsc::channel(4);
        let (log_tx, mut log_rx) = mpsc::channel(4);
        table.add("ns/bots/+/status", status_tx);
        table.add("ns/bots/+/log", log_tx);

        let delivered = table.dispatch(&BrokerMessage::new("ns/bots/a/status", "{}"));
        assert_eq!(delivered, 1);
        assert!(status_rx.try_recv().is_ok());
        assert!(log_rx.try_recv().is_err());
    }

    #[test]
    fn closed_routes_are_pruned() {
        let mut table = RouteTable::new();
        let (tx, rx) = mpsc::channel(1);
        table.add("a/#", tx);
        drop(rx);
        assert!(table.filters().is_empty());
        assert_eq!(table.dispatch(&BrokerMessage::new("a/b", "{}")), 0);
        assert!(table.is_empty());
    }

    #[test]
    fn full_route_drops_without_blocking() {
        let mut table = RouteTable::new();
        let (tx, _rx) = mpsc::channel(1);
        table.add("a", tx);
        assert_eq!(table.dispatch(&BrokerMessage::new("a", "1")), 1);
        assert_eq!(table.dispatch(&BrokerMessage::new("a", "2")), 0);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn filters_are_deduplicated() {
        let mut table = RouteTable::new();
        let (tx1, _rx1) = mpsc::channel(1);
        let (tx2, _rx2) = mpsc::channel(1);
        table.add("a/+", tx1);
        table.add("a/+", tx2);
        assert_eq!(table.filters(), vec!["a/+".to_string()]);
    }
}
