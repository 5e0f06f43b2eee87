//! Native OS notifications with per-path debouncing.

use async_trait::async_trait;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::debounce::{classify, Debouncer};
use super::walk::scan_tree_async;
use super::{
    read_ignore, relative_path, replace_ignore, unix_now, ChangeEvent, ChangeKind, IgnoreMatcher,
    SharedIgnore, WatchConfig, WatchError, WatchStrategy, WatchStream, Watcher,
    EVENT_CHANNEL_CAPACITY,
};
use crate::shutdown::{Shutdown, ShutdownTrigger};

type RawEvent = notify::Result<Event>;

pub struct NativeWatcher {
    window: Duration,
    ignore: SharedIgnore,
    inner: Option<RecommendedWatcher>,
    stop: Option<ShutdownTrigger>,
}

impl NativeWatcher {
    pub fn new(config: &WatchConfig) -> Result<Self, WatchError> {
        Ok(Self {
            window: config.debounce_window,
            ignore: Arc::new(RwLock::new(IgnoreMatcher::new(&config.ignore_patterns)?)),
            inner: None,
            stop: None,
        })
    }
}

#[async_trait]
impl Watcher for NativeWatcher {
    async fn start(&mut self, root: &Path) -> Result<WatchStream, WatchError> {
        if self.stop.is_some() {
            return Err(WatchError::AlreadyStarted);
        }

        // notify may report canonical paths (e.g. /private/var on macOS)
        let root = tokio::fs::canonicalize(root)
            .await
            .map_err(|e| WatchError::RootInaccessible(format!("{}: {}", root.display(), e)))?;

        let known: HashSet<String> = scan_tree_async(root.clone(), read_ignore(&self.ignore))
            .await?
            .into_keys()
            .collect();

        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<RawEvent>();
        let mut watcher = notify::recommended_watcher(move |result: RawEvent| {
            // Receiver gone means the debounce task exited; nothing to do
            let _ = raw_tx.send(result);
        })?;
        watcher.watch(&root, RecursiveMode::Recursive)?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let trigger = ShutdownTrigger::new();
        let task = DebounceTask {
            root,
            debouncer: Debouncer::new(self.window),
            known,
            ignore: self.ignore.clone(),
            tx,
        };
        tokio::spawn(task.run(raw_rx, trigger.listener()));

        self.inner = Some(watcher);
        self.stop = Some(trigger);
        debug!(window_ms = self.window.as_millis() as u64, "Native watcher started");
        Ok(rx)
    }

    fn stop(&mut self) {
        if let Some(trigger) = &self.stop {
            trigger.trigger();
        }
        // Dropping the notify handle removes the OS watches
        self.inner = None;
    }

    fn set_ignore_patterns(&self, patterns: &[String]) -> Result<(), WatchError> {
        replace_ignore(&self.ignore, IgnoreMatcher::new(patterns)?);
        Ok(())
    }

    fn strategy(&self) -> WatchStrategy {
        WatchStrategy::Native
    }
}

impl Drop for NativeWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

struct DebounceTask {
    root: PathBuf,
    debouncer: Debouncer,
    /// Files known to exist as of the last emitted event for them
    known: HashSet<String>,
    ignore: SharedIgnore,
    tx: mpsc::Sender<Result<ChangeEvent, WatchError>>,
}

impl DebounceTask {
    async fn run(mut self, mut raw_rx: mpsc::UnboundedReceiver<RawEvent>, shutdown: Shutdown) {
        loop {
            let deadline = self.debouncer.next_deadline();
            let sleep_until = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                _ = shutdown.cancelled() => break,
                raw = raw_rx.recv() => match raw {
                    Some(Ok(event)) => self.observe(event),
                    Some(Err(e)) => {
                        warn!(error = %e, "Native watcher reported an error");
                        let _ = self.tx.send(Err(WatchError::Notify(e))).await;
                        break;
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(sleep_until), if deadline.is_some() => {
                    if !self.flush_expired().await {
                        break;
                    }
                }
            }
        }
        debug!("Native watcher stopped");
    }

    fn observe(&mut self, event: Event) {
        if matches!(event.kind, EventKind::Access(_)) {
            return;
        }
        let matcher = read_ignore(&self.ignore);
        let now = Instant::now();
        for path in &event.paths {
            let Some(rel) = relative_path(&self.root, path) else {
                continue;
            };
            if matcher.is_ignored(&rel) {
                continue;
            }
            trace!(path = %rel, kind = ?event.kind, "Raw change");
            self.debouncer.touch(rel, now);
        }
    }

    /// Emit events for expired timers; returns false when the stream must end
    async fn flush_expired(&mut self) -> bool {
        if let Err(e) = tokio::fs::metadata(&self.root).await {
            let _ = self
                .tx
                .send(Err(WatchError::RootInaccessible(format!(
                    "{}: {}",
                    self.root.display(),
                    e
                ))))
                .await;
            return false;
        }

        let matcher = read_ignore(&self.ignore);
        for rel in self.debouncer.take_expired(Instant::now()) {
            if matcher.is_ignored(&rel) {
                continue;
            }
            let abs = self.root.join(&rel);
            let meta = tokio::fs::metadata(&abs).await.ok();

            let events = match meta {
                Some(meta) if meta.is_dir() => self.directory_appeared(&rel, &matcher).await,
                Some(_) => self.file_settled(&rel, true),
                None if self.known.contains(&rel) => self.file_settled(&rel, false),
                None => self.directory_vanished(&rel),
            };

            for event in events {
                if self.tx.send(Ok(event)).await.is_err() {
                    return false;
                }
            }
        }
        true
    }

    fn file_settled(&mut self, rel: &str, exists_now: bool) -> Vec<ChangeEvent> {
        let existed = self.known.contains(rel);
        let Some(kind) = classify(existed, exists_now) else {
            return Vec::new();
        };
        if exists_now {
            self.known.insert(rel.to_string());
        } else {
            self.known.remove(rel);
        }
        vec![ChangeEvent {
            path: rel.to_string(),
            kind,
            observed_at: unix_now(),
        }]
    }

    /// A directory moved in or was created with contents we may not have seen
    async fn directory_appeared(&mut self, rel: &str, matcher: &IgnoreMatcher) -> Vec<ChangeEvent> {
        let dir = self.root.join(rel);
        let Ok(snapshot) = scan_tree_async(dir, matcher.clone()).await else {
            return Vec::new();
        };
        let mut events = Vec::new();
        let mut paths: Vec<_> = snapshot.into_keys().collect();
        paths.sort();
        for child in paths {
            let full = format!("{}/{}", rel, child);
            if matcher.is_ignored(&full) || self.known.contains(&full) {
                continue;
            }
            self.known.insert(full.clone());
            events.push(ChangeEvent {
                path: full,
                kind: ChangeKind::Created,
                observed_at: unix_now(),
            });
        }
        events
    }

    /// A directory moved out or was removed without per-file notifications
    fn directory_vanished(&mut self, rel: &str) -> Vec<ChangeEvent> {
        let prefix = format!("{}/", rel);
        let mut gone: Vec<String> = self
            .known
            .iter()
            .filter(|p| p.starts_with(&prefix))
            .cloned()
            .collect();
        gone.sort();
        gone.into_iter()
            .map(|path| {
                self.known.remove(&path);
                ChangeEvent {
                    path,
                    kind: ChangeKind::Deleted,
                    observed_at: unix_now(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_event(rx: &mut WatchStream) -> ChangeEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
            .expect("watch error")
    }

    fn fast_config() -> WatchConfig {
        WatchConfig {
            debounce_window: Duration::from_millis(150),
            ..WatchConfig::default()
        }
    }

    #[tokio::test]
    async fn test_rapid_writes_coalesce() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "v0").unwrap();

        let mut watcher = NativeWatcher::new(&fast_config()).unwrap();
        let mut rx = watcher.start(dir.path()).await.unwrap();

        for i in 0..10 {
            std::fs::write(dir.path().join("a.txt"), format!("v{}", i + 1)).unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let event = next_event(&mut rx).await;
        assert_eq!(event.path, "a.txt");
        assert_eq!(event.kind, ChangeKind::Modified);

        // Nothing else follows the single coalesced event
        let extra = tokio::time::timeout(Duration::from_millis(400), rx.recv()).await;
        assert!(extra.is_err(), "expected no further events, got {:?}", extra);
        watcher.stop();
    }

    #[tokio::test]
    async fn test_delete_and_recreate_reports_modified() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("doc.md");
        std::fs::write(&file, "one").unwrap();

        let mut watcher = NativeWatcher::new(&fast_config()).unwrap();
        let mut rx = watcher.start(dir.path()).await.unwrap();

        std::fs::remove_file(&file).unwrap();
        std::fs::write(&file, "two").unwrap();

        let event = next_event(&mut rx).await;
        assert_eq!(event.path, "doc.md");
        assert_eq!(event.kind, ChangeKind::Modified);
        watcher.stop();
    }

    #[tokio::test]
    async fn test_ignored_paths_never_emitted() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = NativeWatcher::new(&fast_config()).unwrap();
        let mut rx = watcher.start(dir.path()).await.unwrap();

        std::fs::write(dir.path().join("scratch.tmp"), "x").unwrap();
        std::fs::write(dir.path().join("kept.txt"), "y").unwrap();

        let event = next_event(&mut rx).await;
        assert_eq!(event.path, "kept.txt");
        assert_eq!(event.kind, ChangeKind::Created);
        watcher.stop();
    }
}
