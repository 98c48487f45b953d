use std::collections::VecDeque;

use deepresearch_schema::wire::ServerMessage;
use tokio::sync::{Mutex, Notify};

pub const MIN_QUEUE_CAPACITY: usize = 256;

/// Bounded per-session outgoing queue. The server must never block on a
/// slow client: once full, the oldest message is dropped and replaced with
/// a `telemetry-dropped` status marker.
pub struct OutgoingQueue {
    capacity: usize,
    state: Mutex<VecDeque<ServerMessage>>,
    notify: Notify,
}

impl OutgoingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(MIN_QUEUE_CAPACITY),
            state: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// On overflow, evicts exactly one message before appending `message`,
    /// then appends a `telemetry-dropped` marker. The queue can therefore
    /// transiently hold `capacity + 1` entries (the new message and its
    /// marker sharing the one freed slot).
    pub async fn push(&self, message: ServerMessage) {
        {
            let mut queue = self.state.lock().await;
            let dropped = if queue.len() >= self.capacity {
                queue.pop_front();
                true
            } else {
                false
            };
            queue.push_back(message);
            if dropped {
                queue.push_back(ServerMessage::Status {
                    content: "telemetry-dropped".to_string(),
                });
            }
        }
        self.notify.notify_one();
    }

    /// Waits for and removes the next message, FIFO.
    pub async fn pop(&self) -> ServerMessage {
        loop {
            {
                let mut queue = self.state.lock().await;
                if let Some(message) = queue.pop_front() {
                    return message;
                }
            }
            self.notify.notified().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_then_pop_preserves_fifo_order() {
        let queue = OutgoingQueue::new(MIN_QUEUE_CAPACITY);
        queue.push(ServerMessage::Output { content: "a".into() }).await;
        queue.push(ServerMessage::Output { content: "b".into() }).await;
        assert!(matches!(queue.pop().await, ServerMessage::Output { content } if content == "a"));
        assert!(matches!(queue.pop().await, ServerMessage::Output { content } if content == "b"));
    }

    #[tokio::test]
    async fn overflow_drops_oldest_once_and_appends_marker() {
        let queue = OutgoingQueue::new(MIN_QUEUE_CAPACITY);
        for i in 0..MIN_QUEUE_CAPACITY {
            queue.push(ServerMessage::Output { content: format!("msg-{i}") }).await;
        }
        assert_eq!(queue.len().await, MIN_QUEUE_CAPACITY);

        queue.push(ServerMessage::Output { content: "overflow".into() }).await;
        // one eviction freed a slot for "overflow" and its dropped-marker
        assert_eq!(queue.len().await, MIN_QUEUE_CAPACITY + 1);

        // only "msg-0" was dropped; "msg-1" is still the oldest survivor
        let first = queue.pop().await;
        assert!(matches!(first, ServerMessage::Output { content } if content == "msg-1"));

        let second = queue.pop().await;
        assert!(matches!(second, ServerMessage::Output { content } if content == "msg-2"));
    }

    #[tokio::test]
    async fn capacity_is_floored_at_minimum() {
        let queue = OutgoingQueue::new(1);
        assert_eq!(queue.capacity, MIN_QUEUE_CAPACITY);
    }
}
