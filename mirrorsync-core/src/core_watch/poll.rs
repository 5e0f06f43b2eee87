//! Polling fallback: periodic tree scans diffed against the previous scan.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::walk::{scan_tree_async, Snapshot};
use super::{
    read_ignore, replace_ignore, unix_now, ChangeEvent, ChangeKind, IgnoreMatcher, SharedIgnore,
    WatchConfig, WatchError, WatchStrategy, WatchStream, Watcher, EVENT_CHANNEL_CAPACITY,
};
use crate::shutdown::ShutdownTrigger;

/// Events turning `old` into `new`, sorted by path
pub fn diff_snapshots(old: &Snapshot, new: &Snapshot, observed_at: f64) -> Vec<ChangeEvent> {
    let mut events = Vec::new();

    for (path, fingerprint) in new {
        match old.get(path) {
            None => events.push(ChangeEvent {
                path: path.clone(),
                kind: ChangeKind::Created,
                observed_at,
            }),
            Some(previous) if previous != fingerprint => events.push(ChangeEvent {
                path: path.clone(),
                kind: ChangeKind::Modified,
                observed_at,
            }),
            Some(_) => {}
        }
    }

    for path in old.keys() {
        if !new.contains_key(path) {
            events.push(ChangeEvent {
                path: path.clone(),
                kind: ChangeKind::Deleted,
                observed_at,
            });
        }
    }

    events.sort_by(|a, b| a.path.cmp(&b.path));
    events
}

pub struct PollingWatcher {
    interval: Duration,
    ignore: SharedIgnore,
    stop: Option<ShutdownTrigger>,
}

impl PollingWatcher {
    pub fn new(config: &WatchConfig) -> Result<Self, WatchError> {
        Ok(Self {
            interval: config.poll_interval,
            ignore: Arc::new(RwLock::new(IgnoreMatcher::new(&config.ignore_patterns)?)),
            stop: None,
        })
    }
}

#[async_trait]
impl Watcher for PollingWatcher {
    async fn start(&mut self, root: &Path) -> Result<WatchStream, WatchError> {
        if self.stop.is_some() {
            return Err(WatchError::AlreadyStarted);
        }

        let root = root.to_path_buf();
        let baseline = scan_tree_async(root.clone(), read_ignore(&self.ignore)).await?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let trigger = ShutdownTrigger::new();
        let shutdown = trigger.listener();
        self.stop = Some(trigger);

        let ignore = self.ignore.clone();
        let interval = self.interval;
        tokio::spawn(async move {
            poll_loop(root, baseline, interval, ignore, tx, shutdown).await;
        });

        debug!(interval_ms = self.interval.as_millis() as u64, "Polling watcher started");
        Ok(rx)
    }

    fn stop(&mut self) {
        if let Some(trigger) = &self.stop {
            trigger.trigger();
        }
    }

    fn set_ignore_patterns(&self, patterns: &[String]) -> Result<(), WatchError> {
        replace_ignore(&self.ignore, IgnoreMatcher::new(patterns)?);
        Ok(())
    }

    fn strategy(&self) -> WatchStrategy {
        WatchStrategy::Polling
    }
}

impl Drop for PollingWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn poll_loop(
    root: PathBuf,
    mut previous: Snapshot,
    interval: Duration,
    ignore: SharedIgnore,
    tx: mpsc::Sender<Result<ChangeEvent, WatchError>>,
    shutdown: crate::shutdown::Shutdown,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let current = match scan_tree_async(root.clone(), read_ignore(&ignore)).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Polling scan failed");
                let _ = tx.send(Err(e)).await;
                break;
            }
        };

        // Patterns may have changed since the last scan; drop anything now ignored
        let matcher = read_ignore(&ignore);
        previous.retain(|path, _| !matcher.is_ignored(path));

        for event in diff_snapshots(&previous, &current, unix_now()) {
            if tx.send(Ok(event)).await.is_err() {
                return;
            }
        }
        previous = current;
    }

    debug!("Polling watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::super::walk::Fingerprint;
    use super::*;
    use std::time::SystemTime;

    fn fp(size: u64) -> Fingerprint {
        Fingerprint {
            size,
            modified: Some(SystemTime::UNIX_EPOCH + Duration::from_secs(size)),
        }
    }

    #[test]
    fn test_diff_detects_all_kinds() {
        let mut old = Snapshot::new();
        old.insert("keep".into(), fp(1));
        old.insert("edit".into(), fp(2));
        old.insert("gone".into(), fp(3));

        let mut new = Snapshot::new();
        new.insert("keep".into(), fp(1));
        new.insert("edit".into(), fp(20));
        new.insert("born".into(), fp(4));

        let events = diff_snapshots(&old, &new, 42.0);
        let summary: Vec<_> = events.iter().map(|e| (e.path.as_str(), e.kind)).collect();
        assert_eq!(
            summary,
            vec![
                ("born", ChangeKind::Created),
                ("edit", ChangeKind::Modified),
                ("gone", ChangeKind::Deleted),
            ]
        );
        assert!(events.iter().all(|e| e.observed_at == 42.0));
    }

    #[tokio::test]
    async fn test_polling_watcher_reports_changes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "v1").unwrap();

        let config = WatchConfig {
            poll_interval: Duration::from_millis(50),
            ..WatchConfig::default()
        };
        let mut watcher = PollingWatcher::new(&config).unwrap();
        let mut rx = watcher.start(dir.path()).await.unwrap();

        std::fs::write(dir.path().join("b.txt"), "new").unwrap();
        std::fs::write(dir.path().join("ignored.tmp"), "x").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for poll event")
            .expect("stream ended")
            .expect("watch error");
        assert_eq!(event.path, "b.txt");
        assert_eq!(event.kind, ChangeKind::Created);

        std::fs::remove_file(dir.path().join("a.txt")).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(event.path, "a.txt");
        assert_eq!(event.kind, ChangeKind::Deleted);

        watcher.stop();
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = PollingWatcher::new(&WatchConfig::default()).unwrap();
        let _rx = watcher.start(dir.path()).await.unwrap();
        assert!(matches!(
            watcher.start(dir.path()).await,
            Err(WatchError::AlreadyStarted)
        ));
    }
}
