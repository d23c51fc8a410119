//! Event bus — serialized broadcast of [`UiEvent`]s to all connected UI
//! clients.
//!
//! Each client gets a bounded queue; `broadcast` enqueues under a single
//! lock, so events are totally ordered and every client observes them in
//! broadcast order. A client whose queue is full or closed is dropped on
//! the spot — a slow client never stalls the producer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use valet_domain::event::UiEvent;

/// Per-client queue depth. A UI that falls this far behind is dropped.
const CLIENT_QUEUE_DEPTH: usize = 256;

pub type ClientId = u64;

pub struct EventBus {
    clients: Mutex<HashMap<ClientId, mpsc::Sender<UiEvent>>>,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a client. The caller owns the receiver and forwards its
    /// events onto the client's socket.
    pub fn connect(&self) -> (ClientId, mpsc::Receiver<UiEvent>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_DEPTH);
        self.clients.lock().insert(id, tx);
        tracing::debug!(client_id = id, "ui client connected");
        (id, rx)
    }

    /// Deliver an event to a single client (replayable state on connect).
    pub fn send_to(&self, client: ClientId, event: UiEvent) {
        let mut clients = self.clients.lock();
        if let Some(tx) = clients.get(&client) {
            if tx.try_send(event).is_err() {
                clients.remove(&client);
                tracing::warn!(client_id = client, "ui client queue stalled, dropping");
            }
        }
    }

    /// Enqueue an event for every connected client, in broadcast order.
    pub fn broadcast(&self, event: UiEvent) {
        let mut clients = self.clients.lock();
        let mut dropped: Vec<ClientId> = Vec::new();
        for (id, tx) in clients.iter() {
            if tx.try_send(event.clone()).is_err() {
                dropped.push(*id);
            }
        }
        for id in dropped {
            clients.remove(&id);
            tracing::warn!(client_id = id, "ui client queue stalled, dropping");
        }
    }

    pub fn disconnect(&self, client: ClientId) {
        self.clients.lock().remove(&client);
        tracing::debug!(client_id = client, "ui client disconnected");
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(text: &str) -> UiEvent {
        UiEvent::Query {
            content: text.into(),
        }
    }

    #[tokio::test]
    async fn broadcast_preserves_order_per_client() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.connect();

        bus.broadcast(query("one"));
        bus.broadcast(query("two"));
        bus.broadcast(query("three"));

        for expected in ["one", "two", "three"] {
            match rx.recv().await.unwrap() {
                UiEvent::Query { content } => assert_eq!(content, expected),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn all_clients_receive_broadcasts() {
        let bus = EventBus::new();
        let (_a, mut rx_a) = bus.connect();
        let (_b, mut rx_b) = bus.connect();

        bus.broadcast(query("hello"));

        assert!(matches!(rx_a.recv().await, Some(UiEvent::Query { .. })));
        assert!(matches!(rx_b.recv().await, Some(UiEvent::Query { .. })));
    }

    #[tokio::test]
    async fn full_queue_drops_only_the_slow_client() {
        let bus = EventBus::new();
        let (slow, slow_rx) = bus.connect();
        let (_fast, mut fast_rx) = bus.connect();

        // Never drained: fill the slow client's queue to capacity.
        for i in 0..CLIENT_QUEUE_DEPTH {
            bus.send_to(slow, query(&format!("e{i}")));
        }
        assert_eq!(bus.client_count(), 2);

        // The next broadcast overflows the slow client and removes it.
        bus.broadcast(query("final"));
        assert_eq!(bus.client_count(), 1);

        match fast_rx.recv().await.unwrap() {
            UiEvent::Query { content } => assert_eq!(content, "final"),
            other => panic!("unexpected event: {other:?}"),
        }
        drop(slow_rx);
    }

    #[tokio::test]
    async fn send_to_targets_one_client() {
        let bus = EventBus::new();
        let (id_a, mut rx_a) = bus.connect();
        let (_b, mut rx_b) = bus.connect();

        bus.send_to(id_a, query("private"));
        assert!(matches!(rx_a.recv().await, Some(UiEvent::Query { .. })));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_deregisters() {
        let bus = EventBus::new();
        let (id, rx) = bus.connect();
        assert_eq!(bus.client_count(), 1);
        bus.disconnect(id);
        assert_eq!(bus.client_count(), 0);
        drop(rx);
    }

    #[tokio::test]
    async fn closed_receiver_is_pruned_on_broadcast() {
        let bus = EventBus::new();
        let (_id, rx) = bus.connect();
        drop(rx);
        bus.broadcast(query("into the void"));
        assert_eq!(bus.client_count(), 0);
    }
}
