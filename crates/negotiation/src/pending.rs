//! Per-session FIFO of application messages held back by the gate

use std::collections::VecDeque;

/// Messages waiting for the handshake to finish
///
/// The queue never sends or drops on its own: the owner takes everything out
/// in one go with [`take_all`](Self::take_all) and either replays the batch
/// or drops it.
#[derive(Debug)]
pub struct PendingMessageQueue<T> {
    messages: VecDeque<T>,
}

impl<T> PendingMessageQueue<T> {
    pub fn new() -> Self {
        Self {
            messages: VecDeque::new(),
        }
    }

    /// Append a message; the queue owns it from here on
    pub fn push(&mut self, msg: T) {
        self.messages.push_back(msg);
    }

    /// Swap the queue out, leaving it empty
    pub fn take_all(&mut self) -> VecDeque<T> {
        std::mem::take(&mut self.messages)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl<T> Default for PendingMessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Tracked {
        id: u32,
        drops: Arc<AtomicUsize>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_take_all_keeps_order() {
        let mut queue = PendingMessageQueue::new();
        for i in 0..5 {
            queue.push(i);
        }
        assert_eq!(queue.len(), 5);

        let batch: Vec<_> = queue.take_all().into_iter().collect();
        assert_eq!(batch, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
        assert!(queue.take_all().is_empty());
    }

    #[test]
    fn test_released_exactly_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut queue = PendingMessageQueue::default();
        for id in 0..3 {
            queue.push(Tracked {
                id,
                drops: drops.clone(),
            });
        }

        let released = queue.take_all();
        assert_eq!(released.iter().map(|t| t.id).collect::<Vec<_>>(), vec![0, 1, 2]);
        drop(released);
        assert_eq!(drops.load(Ordering::SeqCst), 3);

        // a second drain finds nothing to release
        drop(queue.take_all());
        drop(queue);
        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }
}
