//! In-memory `Consumer` double for tests: a shared queue with ack/nack
//! tracked on the side so tests can assert on outcomes without a real bus.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{BusMessage, Consumer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acked,
    Nacked,
}

struct Inner {
    queue: Mutex<VecDeque<(String, Vec<u8>, u32)>>,
    outcomes: Mutex<Vec<(String, Outcome)>>,
    closed: Mutex<bool>,
    notify: Notify,
}

/// An in-memory bus: `push` enqueues a payload, `receive` dequeues it,
/// `outcomes()` reports what every delivered message resolved to.
pub struct MemoryBus {
    inner: std::sync::Arc<Inner>,
}

impl MemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: std::sync::Arc::new(Inner {
                queue: Mutex::new(VecDeque::new()),
                outcomes: Mutex::new(Vec::new()),
                closed: Mutex::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Enqueue a message with the given redelivery count.
    pub fn push(&self, id: &str, payload: Vec<u8>, redelivery_count: u32) {
        self.inner
            .queue
            .lock()
            .unwrap()
            .push_back((id.to_string(), payload, redelivery_count));
        self.inner.notify.notify_one();
    }

    /// All (message id, outcome) pairs recorded so far, in delivery order.
    #[must_use]
    pub fn outcomes(&self) -> Vec<(String, Outcome)> {
        self.inner.outcomes.lock().unwrap().clone()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryMessage {
    id: String,
    payload: Vec<u8>,
    redelivery_count: u32,
    inner: std::sync::Arc<Inner>,
}

#[async_trait]
impl BusMessage for MemoryMessage {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn redelivery_count(&self) -> u32 {
        self.redelivery_count
    }

    async fn ack(self: Box<Self>) {
        self.inner
            .outcomes
            .lock()
            .unwrap()
            .push((self.id.clone(), Outcome::Acked));
    }

    async fn nack(self: Box<Self>) {
        self.inner
            .outcomes
            .lock()
            .unwrap()
            .push((self.id.clone(), Outcome::Nacked));
    }
}

#[async_trait]
impl Consumer for MemoryBus {
    async fn receive(&self) -> Option<Box<dyn BusMessage>> {
        loop {
            if *self.inner.closed.lock().unwrap() {
                return None;
            }
            let popped = self.inner.queue.lock().unwrap().pop_front();
            if let Some((id, payload, redelivery_count)) = popped {
                return Some(Box::new(MemoryMessage {
                    id,
                    payload,
                    redelivery_count,
                    inner: std::sync::Arc::clone(&self.inner),
                }));
            }
            self.inner.notify.notified().await;
        }
    }

    async fn close(&self) {
        *self.inner.closed.lock().unwrap() = true;
        self.inner.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_pushed_messages_in_order() {
        let bus = MemoryBus::new();
        bus.push("a", b"{}".to_vec(), 0);
        bus.push("b", b"{}".to_vec(), 0);

        let first = bus.receive().await.unwrap();
        assert_eq!(first.id(), "a");
        first.ack().await;

        let second = bus.receive().await.unwrap();
        assert_eq!(second.id(), "b");
        second.nack().await;

        assert_eq!(
            bus.outcomes(),
            vec![
                ("a".to_string(), Outcome::Acked),
                ("b".to_string(), Outcome::Nacked),
            ]
        );
    }

    #[tokio::test]
    async fn receive_returns_none_after_close() {
        let bus = MemoryBus::new();
        bus.close().await;
        assert!(bus.receive().await.is_none());
    }
}
