//! Per-path debounce timers.
//!
//! Every raw notification for a path pushes that path's deadline out by one
//! window. When a deadline passes, the caller inspects the file and turns the
//! final observed state into at most one [`ChangeKind`] via [`classify`].

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::ChangeKind;

#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    pending: HashMap<String, Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    /// (Re)start the timer for `path`
    pub fn touch(&mut self, path: impl Into<String>, now: Instant) {
        self.pending.insert(path.into(), now + self.window);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    /// Remove and return every path whose timer has fired, in path order
    pub fn take_expired(&mut self, now: Instant) -> Vec<String> {
        let mut expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();
        expired.sort();
        for path in &expired {
            self.pending.remove(path);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Map the state before the window and the state at expiry to an event.
///
/// A path deleted and recreated inside one window reports `Modified`; a path
/// created and deleted inside one window reports nothing.
pub fn classify(existed_before: bool, exists_now: bool) -> Option<ChangeKind> {
    match (existed_before, exists_now) {
        (true, true) => Some(ChangeKind::Modified),
        (false, true) => Some(ChangeKind::Created),
        (true, false) => Some(ChangeKind::Deleted),
        (false, false) => None,
    }
}
