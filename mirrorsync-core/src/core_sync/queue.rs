//! Bounded, per-path de-duplicating work queue

use hashlink::LinkedHashMap;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Direction {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueKey {
    pub direction: Direction,
    pub path: String,
}

impl QueueKey {
    pub fn outbound(path: impl Into<String>) -> Self {
        Self {
            direction: Direction::Outbound,
            path: path.into(),
        }
    }

    pub fn inbound(path: impl Into<String>) -> Self {
        Self {
            direction: Direction::Inbound,
            path: path.into(),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Enqueued {
    /// New entry at the back of the queue
    Queued,
    /// Replaced the task already waiting under the same key
    Replaced,
}

/// Insertion-ordered queue where a key holds at most one task.
///
/// Re-queuing a waiting key replaces its task in place, so the latest event
/// wins without losing its place in line.
#[derive(Debug)]
pub struct SyncQueue<T> {
    entries: LinkedHashMap<QueueKey, T>,
    capacity: usize,
}

impl<T> SyncQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: LinkedHashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Add or replace a task. A full queue hands the task back.
    pub fn push(&mut self, key: QueueKey, task: T) -> Result<Enqueued, T> {
        if let Some(waiting) = self.entries.get_mut(&key) {
            *waiting = task;
            return Ok(Enqueued::Replaced);
        }
        if self.entries.len() >= self.capacity {
            return Err(task);
        }
        self.entries.insert(key, task);
        Ok(Enqueued::Queued)
    }

    /// Pop up to `max` tasks, oldest first
    pub fn drain_batch(&mut self, max: usize) -> Vec<T> {
        let mut batch = Vec::with_capacity(max.min(self.entries.len()));
        while batch.len() < max {
            match self.entries.pop_front() {
                Some((_, task)) => batch.push(task),
                None => break,
            }
        }
        batch
    }

    pub fn contains(&self, key: &QueueKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_task_replaces_in_place() {
        let mut queue = SyncQueue::new(8);
        assert_eq!(queue.push(QueueKey::outbound("a"), "a1"), Ok(Enqueued::Queued));
        assert_eq!(queue.push(QueueKey::outbound("b"), "b1"), Ok(Enqueued::Queued));
        assert_eq!(queue.push(QueueKey::outbound("a"), "a2"), Ok(Enqueued::Replaced));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.drain_batch(10), vec!["a2", "b1"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_directions_do_not_collide() {
        let mut queue = SyncQueue::new(8);
        queue.push(QueueKey::outbound("a.txt"), 1).unwrap();
        queue.push(QueueKey::inbound("a.txt"), 2).unwrap();
        assert_eq!(queue.len(), 2);
        assert!(queue.contains(&QueueKey::inbound("a.txt")));
    }

    #[test]
    fn test_drain_in_batches() {
        let mut queue = SyncQueue::new(32);
        for i in 0..25 {
            queue.push(QueueKey::outbound(format!("f{}", i)), i).unwrap();
        }
        assert_eq!(queue.drain_batch(10), (0..10).collect::<Vec<_>>());
        assert_eq!(queue.drain_batch(10), (10..20).collect::<Vec<_>>());
        assert_eq!(queue.drain_batch(10), (20..25).collect::<Vec<_>>());
        assert!(queue.drain_batch(10).is_empty());
    }

    #[test]
    fn test_full_queue_returns_task_but_still_replaces() {
        let mut queue = SyncQueue::new(2);
        queue.push(QueueKey::outbound("a"), "a1").unwrap();
        queue.push(QueueKey::outbound("b"), "b1").unwrap();
        assert!(queue.is_full());

        assert_eq!(queue.push(QueueKey::outbound("c"), "c1"), Err("c1"));
        assert_eq!(queue.push(QueueKey::outbound("a"), "a2"), Ok(Enqueued::Replaced));
    }
}
