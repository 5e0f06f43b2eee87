//! Suppression of watcher events caused by our own inbound writes

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Extra time on top of the watcher latency before a path is released
pub const ECHO_MARGIN: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
enum Hold {
    /// A write is in flight
    Writing,
    /// Write finished. Until the deadline, a notification is ours while the
    /// disk still holds `written` (`None` for a removal).
    Until {
        deadline: Instant,
        written: Option<String>,
    },
}

/// Paths whose next change notifications were caused by the engine itself.
///
/// `arm` must be called before the write starts and `release` after it
/// completes. For one window after `release` the path's notifications are
/// treated as echoes as long as the disk matches what was written; any other
/// content is a real edit and ends the hold.
#[derive(Debug, Clone)]
pub struct EchoGuard {
    window: Duration,
    holds: Arc<Mutex<HashMap<String, Hold>>>,
}

impl EchoGuard {
    /// `latency` is the longest a watcher takes to report a change; the
    /// margin is added here
    pub fn new(latency: Duration) -> Self {
        Self {
            window: latency + ECHO_MARGIN,
            holds: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn holds(&self) -> std::sync::MutexGuard<'_, HashMap<String, Hold>> {
        self.holds
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn arm(&self, path: &str) {
        self.holds().insert(path.to_string(), Hold::Writing);
    }

    /// Start the post-write window. `written` is the hash now on disk, or
    /// `None` if the file was removed.
    pub fn release(&self, path: &str, written: Option<&str>) {
        self.holds().insert(
            path.to_string(),
            Hold::Until {
                deadline: Instant::now() + self.window,
                written: written.map(str::to_string),
            },
        );
    }

    /// Whether a notification for `path`, whose disk content now hashes to
    /// `on_disk`, was caused by our own write
    pub fn is_echo(&self, path: &str, on_disk: Option<&str>) -> bool {
        let mut holds = self.holds();
        let echo = match holds.get(path) {
            Some(Hold::Writing) => return true,
            Some(Hold::Until { deadline, written }) => {
                *deadline > Instant::now() && written.as_deref() == on_disk
            }
            None => return false,
        };
        if !echo {
            holds.remove(path);
        }
        echo
    }

    /// Drop expired holds
    pub fn sweep(&self) {
        let now = Instant::now();
        self.holds()
            .retain(|_, hold| !matches!(hold, Hold::Until { deadline, .. } if *deadline <= now));
    }

    pub fn len(&self) -> usize {
        self.holds().len()
    }

    pub fn is_empty(&self) -> bool {
        self.holds().is_empty()
    }
}

impl Default for EchoGuard {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_armed_until_released_window_passes() {
        let guard = EchoGuard::new(Duration::from_millis(20));
        assert!(!guard.is_echo("a.txt", Some("h1")));

        guard.arm("a.txt");
        assert!(guard.is_echo("a.txt", Some("anything")));
        std::thread::sleep(Duration::from_millis(200));
        // No expiry while the write is in flight
        assert!(guard.is_echo("a.txt", None));

        guard.release("a.txt", Some("h1"));
        assert!(guard.is_echo("a.txt", Some("h1")));
        // Native watchers may report one write more than once
        assert!(guard.is_echo("a.txt", Some("h1")));
        std::thread::sleep(Duration::from_millis(200));
        assert!(!guard.is_echo("a.txt", Some("h1")));
        assert!(guard.is_empty());
    }

    #[test]
    fn test_edit_inside_window_is_not_an_echo() {
        let guard = EchoGuard::new(Duration::from_secs(10));
        guard.release("a.txt", Some("applied"));

        assert!(!guard.is_echo("a.txt", Some("edited")));
        // The hold ends with the first real edit
        assert!(!guard.is_echo("a.txt", Some("applied")));
        assert!(guard.is_empty());
    }

    #[test]
    fn test_removal_echo_matches_missing_file() {
        let guard = EchoGuard::new(Duration::from_secs(10));
        guard.release("gone.txt", None);
        assert!(guard.is_echo("gone.txt", None));

        // Recreated by the user before the window closed
        assert!(!guard.is_echo("gone.txt", Some("new")));
    }

    #[test]
    fn test_sweep_keeps_in_flight_writes() {
        let guard = EchoGuard::new(Duration::ZERO);
        guard.arm("writing");
        guard.arm("done");
        guard.release("done", Some("h"));
        std::thread::sleep(Duration::from_millis(150));

        guard.sweep();
        assert_eq!(guard.len(), 1);
        assert!(guard.is_echo("writing", None));
    }

    #[test]
    fn test_window_includes_margin() {
        let guard = EchoGuard::new(Duration::from_secs(1));
        assert_eq!(guard.window(), Duration::from_secs(1) + ECHO_MARGIN);
    }

    #[test]
    fn test_clones_share_state() {
        let guard = EchoGuard::default();
        let other = guard.clone();
        guard.arm("x");
        assert!(other.is_echo("x", None));
    }
}
