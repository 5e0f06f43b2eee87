//! Two engines mirroring over loopback TCP

use mirrorsync_core::core_sync::content_hash;
use mirrorsync_core::core_watch::WatchMode;
use mirrorsync_core::{MirrorConfig, MirrorEngine, SyncRecord};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

fn fast_config(root: &Path) -> MirrorConfig {
    let mut config = MirrorConfig::new(root);
    config.listen_address = "127.0.0.1:0".to_string();
    config.debounce_window_ms = 50;
    config.poll_interval_ms = 50;
    config.drain_interval_ms = 20;
    config.reconnect_interval_sec = 1;
    config.watch_mode = WatchMode::Poll;
    config
}

/// Re-evaluate `cond` every 25ms until it holds; ten seconds by default
macro_rules! eventually {
    ($what:expr, $cond:expr) => {
        eventually!($what, $cond, 400)
    };
    ($what:expr, $cond:expr, $attempts:expr) => {{
        let mut satisfied = false;
        for _ in 0..$attempts {
            if $cond {
                satisfied = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(satisfied, "timed out waiting for {}", $what);
    }};
}

async fn record(engine: &MirrorEngine, path: &str) -> Option<SyncRecord> {
    engine.sync_status(path).await.ok().flatten()
}

struct Pair {
    a: MirrorEngine,
    b: MirrorEngine,
    dir_a: TempDir,
    dir_b: TempDir,
}

/// A listens, B dials A
async fn start_pair() -> Pair {
    start_pair_with(fast_config).await
}

async fn start_pair_with(configure: fn(&Path) -> MirrorConfig) -> Pair {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();

    let a = MirrorEngine::new(configure(dir_a.path())).unwrap();
    a.start().await.unwrap();
    let addr = a.local_addr().await.unwrap();

    let mut config_b = configure(dir_b.path());
    config_b.remote_endpoint = Some(addr.to_string());
    let b = MirrorEngine::new(config_b).unwrap();
    b.start().await.unwrap();

    eventually!("connection", a.status().await.active_connections == 1);
    Pair { a, b, dir_a, dir_b }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_write_on_one_side_lands_on_the_other() {
    let pair = start_pair().await;
    let body = b"hello from a";
    fs::write(pair.dir_a.path().join("a.txt"), body).unwrap();

    let target = pair.dir_b.path().join("a.txt");
    eventually!("a.txt on b", fs::read(&target).ok().as_deref() == Some(&body[..]));

    let on_a = record(&pair.a, "a.txt").await.unwrap();
    eventually!("b ledger", record(&pair.b, "a.txt").await.is_some());
    let on_b = record(&pair.b, "a.txt").await.unwrap();
    assert_eq!(on_a.content_hash, content_hash(body));
    assert_eq!(on_b.content_hash, on_a.content_hash);
    assert_eq!(on_b.origin_session, pair.a.session_id());
    assert_eq!(on_b.timestamp, on_a.timestamp);

    pair.a.stop().await.unwrap();
    pair.b.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_applied_changes_do_not_echo_back() {
    let pair = start_pair().await;
    fs::write(pair.dir_a.path().join("notes.md"), b"one").unwrap();

    let target = pair.dir_b.path().join("notes.md");
    eventually!("notes.md on b", target.exists());

    // Give both watchers several windows to pick up anything spurious
    tokio::time::sleep(Duration::from_millis(800)).await;

    let a = pair.a.status().await;
    let b = pair.b.status().await;
    assert_eq!(a.metrics.outbound_syncs, 1);
    assert_eq!(b.metrics.outbound_syncs, 0);
    assert_eq!(b.metrics.inbound_applies, 1);
    assert_eq!(a.metrics.inbound_applies, 0);

    let on_a = record(&pair.a, "notes.md").await.unwrap();
    assert_eq!(on_a.origin_session, pair.a.session_id());

    pair.a.stop().await.unwrap();
    pair.b.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delete_and_binary_files_propagate() {
    let pair = start_pair().await;
    let binary: Vec<u8> = (0..=255u8).rev().collect();
    fs::create_dir_all(pair.dir_b.path().join("assets")).unwrap();
    fs::write(pair.dir_b.path().join("assets/logo.bin"), &binary).unwrap();

    let on_a = pair.dir_a.path().join("assets/logo.bin");
    eventually!("logo.bin on a", fs::read(&on_a).ok() == Some(binary.clone()));

    fs::remove_file(pair.dir_b.path().join("assets/logo.bin")).unwrap();
    eventually!("logo.bin removed on a", !on_a.exists());
    eventually!(
        "tombstone on a",
        record(&pair.a, "assets/logo.bin")
            .await
            .map(|r| r.deleted)
            .unwrap_or(false)
    );

    pair.a.stop().await.unwrap();
    pair.b.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_peer_catches_up_after_reconnect() {
    let pair = start_pair().await;
    let Pair { a, b, dir_a, dir_b } = pair;

    fs::write(dir_a.path().join("first.txt"), b"1").unwrap();
    let first = dir_b.path().join("first.txt");
    eventually!("first.txt on b", first.exists());

    b.stop().await.unwrap();
    eventually!("a notices b left", a.status().await.active_connections == 0);

    // Changes made while b is away
    fs::write(dir_a.path().join("second.txt"), b"2").unwrap();
    fs::remove_file(dir_a.path().join("first.txt")).unwrap();
    eventually!(
        "a recorded changes",
        record(&a, "second.txt").await.is_some()
            && record(&a, "first.txt").await.map(|r| r.deleted).unwrap_or(false)
    );

    let addr = a.local_addr().await.unwrap();
    let mut config_b = fast_config(dir_b.path());
    config_b.remote_endpoint = Some(addr.to_string());
    let b = MirrorEngine::new(config_b).unwrap();
    b.start().await.unwrap();

    let second = dir_b.path().join("second.txt");
    eventually!(
        "b converged",
        fs::read(&second).ok().as_deref() == Some(&b"2"[..]) && !first.exists()
    );

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_existing_files_sync_on_connect() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    fs::write(dir_a.path().join("only_a.txt"), b"from a").unwrap();
    fs::write(dir_b.path().join("only_b.txt"), b"from b").unwrap();

    let a = MirrorEngine::new(fast_config(dir_a.path())).unwrap();
    a.start().await.unwrap();
    let mut config_b = fast_config(dir_b.path());
    config_b.remote_endpoint = Some(a.local_addr().await.unwrap().to_string());
    let b = MirrorEngine::new(config_b).unwrap();
    b.start().await.unwrap();

    let a_has = dir_a.path().join("only_b.txt");
    let b_has = dir_b.path().join("only_a.txt");
    eventually!("both sides hold both files", a_has.exists() && b_has.exists());
    assert_eq!(fs::read(&a_has).unwrap(), b"from b");
    assert_eq!(fs::read(&b_has).unwrap(), b"from a");

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

/// Regular files directly under `root`
fn file_count(root: &Path) -> usize {
    fs::read_dir(root)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
                .count()
        })
        .unwrap_or(0)
}

fn write_bulk(root: &Path, prefix: &str, files: usize, size: usize) {
    for i in 0..files {
        let mut body = format!("{}-{:04}\n", prefix, i).into_bytes();
        body.resize(size, b'a' + (i % 26) as u8);
        fs::write(root.join(format!("{}-{:04}.txt", prefix, i)), body).unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_large_trees_on_both_sides_converge() {
    const FILES: usize = 400;
    const SIZE: usize = 48 * 1024;

    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    write_bulk(dir_a.path(), "a", FILES, SIZE);
    write_bulk(dir_b.path(), "b", FILES, SIZE);

    let small_queue = |root: &Path| {
        let mut config = fast_config(root);
        config.queue_capacity = 8;
        config
    };

    let a = MirrorEngine::new(small_queue(dir_a.path())).unwrap();
    a.start().await.unwrap();

    let mut config_b = small_queue(dir_b.path());
    config_b.remote_endpoint = Some(a.local_addr().await.unwrap().to_string());
    let b = MirrorEngine::new(config_b).unwrap();
    tokio::time::timeout(Duration::from_secs(60), b.start())
        .await
        .expect("start stalled while both sides were resyncing")
        .unwrap();

    eventually!(
        "both trees complete",
        file_count(dir_a.path()) == 2 * FILES && file_count(dir_b.path()) == 2 * FILES,
        4800
    );
    for name in ["a-0000.txt", "a-0399.txt", "b-0000.txt", "b-0399.txt"] {
        let left = fs::read(dir_a.path().join(name)).unwrap();
        let right = fs::read(dir_b.path().join(name)).unwrap();
        assert_eq!(left.len(), SIZE);
        assert_eq!(left, right, "{} differs", name);
    }

    // Both links stay usable afterwards
    fs::write(dir_b.path().join("after.txt"), b"still flowing").unwrap();
    let after = dir_a.path().join("after.txt");
    eventually!("after.txt on a", after.exists(), 2400);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_changes_made_while_watcher_down_reach_peer() {
    let base_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let root_a = base_a.path().join("ws");
    let parked = base_a.path().join("parked");
    fs::create_dir(&root_a).unwrap();

    let a = MirrorEngine::new(fast_config(&root_a)).unwrap();
    a.start().await.unwrap();
    let mut config_b = fast_config(dir_b.path());
    config_b.remote_endpoint = Some(a.local_addr().await.unwrap().to_string());
    let b = MirrorEngine::new(config_b).unwrap();
    b.start().await.unwrap();
    eventually!("connection", a.status().await.active_connections == 1);

    // Pull the tree out from under a's watcher and edit it while it is gone
    fs::rename(&root_a, &parked).unwrap();
    eventually!(
        "watcher failure",
        a.status().await.metrics.watcher_restarts >= 1
    );
    fs::write(parked.join("during_outage.txt"), b"made blind").unwrap();
    fs::rename(&parked, &root_a).unwrap();

    let target = dir_b.path().join("during_outage.txt");
    eventually!(
        "during_outage.txt on b",
        fs::read(&target).ok().as_deref() == Some(&b"made blind"[..]),
        1200
    );

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

fn slow_poll_config(root: &Path) -> MirrorConfig {
    let mut config = fast_config(root);
    config.poll_interval_ms = 1000;
    config
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_polling_watcher_echo_is_suppressed() {
    let pair = start_pair_with(slow_poll_config).await;
    fs::write(pair.dir_a.path().join("polled.txt"), b"slow scan").unwrap();

    let target = pair.dir_b.path().join("polled.txt");
    eventually!("polled.txt on b", target.exists());

    // b's next scan sees the file it just wrote
    eventually!(
        "echo suppressed on b",
        pair.b.status().await.metrics.echo_suppressed > 0
    );
    let b = pair.b.status().await;
    assert_eq!(b.metrics.outbound_syncs, 0);
    assert_eq!(b.metrics.inbound_applies, 1);

    pair.a.stop().await.unwrap();
    pair.b.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_edit_right_after_inbound_apply_is_synced() {
    let pair = start_pair_with(slow_poll_config).await;
    fs::write(pair.dir_a.path().join("draft.md"), b"from a").unwrap();

    let on_b = pair.dir_b.path().join("draft.md");
    eventually!("draft.md on b", on_b.exists());
    // Inside b's echo window, but different content
    fs::write(&on_b, b"edited on b").unwrap();

    let on_a = pair.dir_a.path().join("draft.md");
    eventually!(
        "b's edit on a",
        fs::read(&on_a).ok().as_deref() == Some(&b"edited on b"[..])
    );

    pair.a.stop().await.unwrap();
    pair.b.stop().await.unwrap();
}
