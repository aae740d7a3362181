//! Message Queue: thread-safe FIFO of user messages arriving during an
//! in-flight turn.

use crate::message::Message;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// A message that arrived while the agent was busy, waiting to be folded
/// into the conversation at the next checkpoint.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message: Message,
    pub request_id: String,
    pub queued_at_unix: i64,
}

/// Thread-safe FIFO. All operations lock briefly and return; `drain` is the
/// only way checkpoints consume the queue, and it is always an atomic
/// snapshot-and-clear, never a partial pop loop.
#[derive(Default)]
pub struct MessageQueue {
    inner: Mutex<VecDeque<QueuedMessage>>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, message: QueuedMessage) {
        self.inner.lock().push_back(message);
    }

    /// Pop a single message FIFO, mainly for tests; checkpoints should
    /// prefer [`MessageQueue::drain`].
    pub fn dequeue(&self) -> Option<QueuedMessage> {
        self.inner.lock().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Atomically take every currently-queued message, in FIFO order,
    /// leaving the queue empty.
    pub fn drain(&self) -> Vec<QueuedMessage> {
        let mut guard = self.inner.lock();
        guard.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qm(text: &str) -> QueuedMessage {
        QueuedMessage {
            message: Message::user(text),
            request_id: format!("req-{text}"),
            queued_at_unix: 0,
        }
    }

    #[test]
    fn drain_preserves_fifo_order() {
        let q = MessageQueue::new();
        q.enqueue(qm("a"));
        q.enqueue(qm("b"));
        q.enqueue(qm("c"));

        let drained = q.drain();
        let texts: Vec<_> = drained.iter().map(|m| m.message.text()).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
        assert!(q.is_empty());
    }

    #[test]
    fn drain_on_empty_queue_returns_empty_vec() {
        let q = MessageQueue::new();
        assert!(q.drain().is_empty());
    }

    #[test]
    fn concurrent_enqueues_all_land() {
        use std::sync::Arc;
        use std::thread;

        let q = Arc::new(MessageQueue::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let q = q.clone();
            handles.push(thread::spawn(move || {
                q.enqueue(qm(&i.to_string()));
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(q.len(), 16);
        assert_eq!(q.drain().len(), 16);
    }
}
