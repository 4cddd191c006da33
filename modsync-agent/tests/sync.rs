//! End-to-end sync passes against an in-process file server.

mod common;

use common::{config_for, content, read, transfer_artifacts, visible_files, write, TestServer};
use modsync_agent::fs::hash::hash_bytes;
use modsync_agent::transfer::StrategyMode;
use modsync_agent::{EventSink, SyncError, SyncEvent, SyncOrchestrator, SyncOutcome};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

fn keys(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn drain(mut rx: tokio::sync::mpsc::UnboundedReceiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn modified(root: &Path, key: &str) -> std::time::SystemTime {
    std::fs::metadata(root.join(key)).unwrap().modified().unwrap()
}

#[tokio::test]
async fn test_sync_deletes_fetches_and_keeps_unchanged() {
    let server = TestServer::start().await;
    let a = content(1, 500);
    let b = content(2, 20_000_000);
    server.put("a.jar", &a);
    server.put("b.jar", &b);

    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(root, "a.jar", &a);
    write(root, "fake.jar", b"not on the server");
    let a_mtime = modified(root, "a.jar");

    let orchestrator = SyncOrchestrator::new(config_for(&server)).unwrap();
    let (sink, rx) = EventSink::channel();
    let report = orchestrator.sync(root, false, sink).await.unwrap();

    assert_eq!(report.outcome, SyncOutcome::Completed);
    assert_eq!(report.diff.to_delete, keys(&["fake.jar"]));
    assert_eq!(report.diff.to_fetch, keys(&["b.jar"]));
    assert_eq!(report.diff.unchanged, keys(&["a.jar"]));
    assert_eq!(report.deleted_count, 1);
    assert_eq!(report.downloaded_count, 1);
    assert_eq!(report.total_bytes_downloaded, 20_000_000);

    assert_eq!(visible_files(root), vec!["a.jar", "b.jar"]);
    assert_eq!(hash_bytes(&read(root, "b.jar").unwrap()), hash_bytes(&b));
    assert_eq!(modified(root, "a.jar"), a_mtime);
    assert!(transfer_artifacts(root).is_empty());

    // 20MB sits in the resumable band: one plain GET, no HEAD needed
    assert_eq!(server.gets("b.jar"), vec![None]);
    assert!(server.gets("a.jar").is_empty());

    let events = drain(rx);
    assert!(matches!(
        events.first(),
        Some(SyncEvent::PassStarted { files_to_fetch: 1, files_to_delete: 1, .. })
    ));
    assert!(events.contains(&SyncEvent::FileDeleted { path: "fake.jar".into() }));
    assert!(events.contains(&SyncEvent::FileCompleted { path: "b.jar".into(), bytes: 20_000_000 }));
    assert!(matches!(
        events.last(),
        Some(SyncEvent::PassCompleted { deleted: 1, downloaded: 1, bytes: 20_000_000 })
    ));
}

#[tokio::test]
async fn test_second_pass_is_a_noop() {
    let server = TestServer::start().await;
    server.put("a.jar", &content(1, 4096));
    server.put("mods/nested/b.jar", &content(2, 300_000));

    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let orchestrator = SyncOrchestrator::new(config_for(&server)).unwrap();

    let first = orchestrator.sync(root, false, EventSink::disabled()).await.unwrap();
    assert_eq!(first.outcome, SyncOutcome::Completed);
    assert_eq!(first.downloaded_count, 2);
    let gets_after_first = server.total_gets();

    let second = orchestrator.sync(root, false, EventSink::disabled()).await.unwrap();
    assert_eq!(second.outcome, SyncOutcome::Completed);
    assert!(second.diff.is_noop());
    assert_eq!(second.unchanged_count, 2);
    assert_eq!(second.downloaded_count, 0);
    assert_eq!(server.total_gets(), gets_after_first);
    assert_eq!(visible_files(root), vec!["a.jar", "mods/nested/b.jar"]);
}

#[tokio::test]
async fn test_resume_continues_from_partial_temp_file() {
    let server = TestServer::start().await;
    let b = content(3, 2 * 1024 * 1024);
    server.put("b.jar", &b);

    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(root, "b.jar.modsync.tmp", &b[..1024 * 1024]);

    let orchestrator = SyncOrchestrator::new(config_for(&server)).unwrap();
    let report = orchestrator.sync(root, false, EventSink::disabled()).await.unwrap();

    assert_eq!(report.outcome, SyncOutcome::Completed);
    assert_eq!(server.gets("b.jar"), vec![Some("bytes=1048576-".to_string())]);
    assert_eq!(read(root, "b.jar").unwrap(), b);
    assert!(transfer_artifacts(root).is_empty());
}

#[tokio::test]
async fn test_resume_restarts_when_server_ignores_range() {
    let server = TestServer::start().await;
    let b = content(4, 2 * 1024 * 1024);
    server.put("b.jar", &b);
    server.disable_ranges();

    let dir = TempDir::new().unwrap();
    let root = dir.path();
    // Stale prefix that must not be kept
    write(root, "b.jar.modsync.tmp", &content(99, 1024 * 1024));

    let orchestrator = SyncOrchestrator::new(config_for(&server)).unwrap();
    let report = orchestrator.sync(root, false, EventSink::disabled()).await.unwrap();

    assert_eq!(report.outcome, SyncOutcome::Completed);
    assert_eq!(server.gets("b.jar").len(), 1);
    assert_eq!(read(root, "b.jar").unwrap(), b);
}

#[tokio::test]
async fn test_failed_pass_restores_deleted_and_removes_fetched() {
    let server = TestServer::start().await;
    let a = content(1, 500);
    let new1 = content(5, 500);
    server.put("a.jar", &a);
    server.put("new1.jar", &new1);
    server.put("new2.jar", &content(2, 2 * 1024 * 1024));
    server.put("new3.jar", &content(3, 11 * 1024 * 1024));
    server.truncate("new2.jar");
    server.stall("new3.jar");

    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(root, "a.jar", &a);
    write(root, "fake1.jar", b"fake one");
    write(root, "fake2.jar", b"fake two");

    let mut config = config_for(&server);
    // new1.jar lands well before new2.jar exhausts its retries
    config.sync.retry_delay_ms = 200;
    let attempts = config.sync.max_retries as usize;
    let orchestrator = SyncOrchestrator::new(config).unwrap();
    let (sink, rx) = EventSink::channel();
    let report = orchestrator.sync(root, false, sink).await.unwrap();

    assert_eq!(report.outcome, SyncOutcome::RolledBack);
    assert!(!report.is_success());
    assert!(report.error.as_deref().is_some_and(|e| e.contains("new2.jar")));
    let restore = report.restore.as_ref().unwrap();
    assert!(restore.is_complete());
    assert_eq!(server.gets("new2.jar").len(), attempts);

    let events = drain(rx);
    assert!(events.contains(&SyncEvent::FileDeleted { path: "fake1.jar".into() }));
    assert!(events.contains(&SyncEvent::FileDeleted { path: "fake2.jar".into() }));
    assert!(events.contains(&SyncEvent::FileCompleted { path: "new1.jar".into(), bytes: 500 }));
    let completed: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            SyncEvent::FileCompleted { path, .. } => Some(path.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(completed, vec!["new1.jar"]);

    // The folder is exactly as it was before the pass
    assert_eq!(visible_files(root), vec!["a.jar", "fake1.jar", "fake2.jar"]);
    assert_eq!(read(root, "fake1.jar").unwrap(), b"fake one");
    assert_eq!(read(root, "fake2.jar").unwrap(), b"fake two");
    assert_eq!(read(root, "a.jar").unwrap(), a);
    assert!(transfer_artifacts(root).is_empty());
}

#[tokio::test]
async fn test_truncated_download_is_never_promoted() {
    let server = TestServer::start().await;
    server.put("b.jar", &content(2, 2 * 1024 * 1024));
    server.truncate("b.jar");

    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(root, "b.jar", b"old b");

    let orchestrator = SyncOrchestrator::new(config_for(&server)).unwrap();
    let report = orchestrator.sync(root, false, EventSink::disabled()).await.unwrap();

    assert_eq!(report.outcome, SyncOutcome::RolledBack);
    assert_eq!(read(root, "b.jar").unwrap(), b"old b");
    assert!(transfer_artifacts(root).is_empty());
}

#[tokio::test]
async fn test_manual_rollback_undoes_last_pass() {
    let server = TestServer::start().await;
    server.put("a.jar", &content(1, 1000));
    server.put("b.jar", &content(2, 2000));

    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(root, "a.jar", b"old a");
    write(root, "fake.jar", b"fake");

    let orchestrator = SyncOrchestrator::new(config_for(&server)).unwrap();
    let report = orchestrator.sync(root, false, EventSink::disabled()).await.unwrap();
    assert_eq!(report.outcome, SyncOutcome::Completed);
    assert_eq!(visible_files(root), vec!["a.jar", "b.jar"]);

    let restore = orchestrator.rollback(root).await.unwrap();
    assert!(restore.is_complete());
    assert_eq!(restore.removed, 1);
    assert_eq!(visible_files(root), vec!["a.jar", "fake.jar"]);
    assert_eq!(read(root, "a.jar").unwrap(), b"old a");
    assert_eq!(read(root, "fake.jar").unwrap(), b"fake");
}

#[tokio::test]
async fn test_rollback_without_snapshot_is_an_error() {
    let server = TestServer::start().await;
    let dir = TempDir::new().unwrap();
    let orchestrator = SyncOrchestrator::new(config_for(&server)).unwrap();

    let result = orchestrator.rollback(dir.path()).await;
    assert!(matches!(result, Err(SyncError::NoSnapshot(_))));
}

#[tokio::test]
async fn test_failure_without_backups_reports_incomplete_rollback() {
    let server = TestServer::start().await;
    server.put("b.jar", &content(2, 200_000));
    server.truncate("b.jar");

    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(root, "fake.jar", b"fake");

    let mut config = config_for(&server);
    config.backup.enabled = false;
    let orchestrator = SyncOrchestrator::new(config).unwrap();
    let report = orchestrator.sync(root, false, EventSink::disabled()).await.unwrap();

    assert_eq!(report.outcome, SyncOutcome::RollbackIncomplete);
    assert!(report.restore.is_none());
    assert!(!root.join("b.jar").exists());
    assert!(transfer_artifacts(root).is_empty());
}

#[tokio::test]
async fn test_cancel_mid_pass_restores_folder() {
    let server = TestServer::start().await;
    server.put("a.jar", &content(1, 1000));
    server.put("slow.jar", &content(6, 2 * 1024 * 1024));
    server.stall("slow.jar");

    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(root, "a.jar", b"old a");
    write(root, "extra.jar", b"extra");

    let orchestrator = SyncOrchestrator::new(config_for(&server)).unwrap();
    let (sink, rx) = EventSink::channel();

    let canceller = async {
        wait_for_get(&server, "slow.jar").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        orchestrator.cancel();
    };
    let (report, ()) = tokio::join!(orchestrator.sync(root, false, sink), canceller);
    let report = report.unwrap();

    assert_eq!(report.outcome, SyncOutcome::Cancelled);
    assert_eq!(visible_files(root), vec!["a.jar", "extra.jar"]);
    assert_eq!(read(root, "a.jar").unwrap(), b"old a");
    assert!(transfer_artifacts(root).is_empty());

    let events = drain(rx);
    assert!(matches!(events.last(), Some(SyncEvent::PassFailed { cancelled: true, .. })));
}

#[tokio::test]
async fn test_dry_run_changes_nothing() {
    let server = TestServer::start().await;
    server.put("a.jar", &content(1, 1000));

    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(root, "fake.jar", b"fake");

    let orchestrator = SyncOrchestrator::new(config_for(&server)).unwrap();
    let report = orchestrator.sync(root, true, EventSink::disabled()).await.unwrap();

    assert_eq!(report.outcome, SyncOutcome::DryRun);
    assert_eq!(report.diff.to_fetch, keys(&["a.jar"]));
    assert_eq!(report.diff.to_delete, keys(&["fake.jar"]));
    assert_eq!(visible_files(root), vec!["fake.jar"]);
    assert_eq!(server.total_gets(), 0);
    assert!(!root.join(".modsync_backups").exists());
}

#[tokio::test]
async fn test_keep_unmatched_files_when_deletion_disabled() {
    let server = TestServer::start().await;
    server.put("a.jar", &content(1, 1000));

    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(root, "local-only.jar", b"mine");

    let mut config = config_for(&server);
    config.sync.delete_unmatched = false;
    let orchestrator = SyncOrchestrator::new(config).unwrap();
    let report = orchestrator.sync(root, false, EventSink::disabled()).await.unwrap();

    assert_eq!(report.outcome, SyncOutcome::Completed);
    assert!(report.diff.to_delete.is_empty());
    assert_eq!(visible_files(root), vec!["a.jar", "local-only.jar"]);
}

#[tokio::test]
async fn test_invalid_manifest_fails_before_any_change() {
    let server = TestServer::start().await;
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(root, "fake.jar", b"fake");

    let bodies = [
        "[1, 2, 3]",
        r#"{"../escape.jar": {"size": 1, "hash": null}}"#,
        r#"{".modsync_cache.json": {"size": 2, "hash": null}}"#,
    ];
    for body in bodies {
        server.set_manifest_body(body);
        // Fresh orchestrator so the manifest is not served from cache
        let orchestrator = SyncOrchestrator::new(config_for(&server)).unwrap();
        let result = orchestrator.sync(root, false, EventSink::disabled()).await;
        assert!(matches!(result, Err(SyncError::InvalidManifest(_))), "{}", body);
    }

    assert_eq!(visible_files(root), vec!["fake.jar"]);
    assert!(!root.join(".modsync_backups").exists());
}

#[tokio::test]
async fn test_unhashed_remote_entry_is_checked_by_size() {
    let server = TestServer::start().await;
    let data = content(7, 10_000);
    server.put("config/settings.cfg", &data);
    server.without_hash("config/settings.cfg");

    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let orchestrator = SyncOrchestrator::new(config_for(&server)).unwrap();

    let report = orchestrator.sync(root, false, EventSink::disabled()).await.unwrap();
    assert_eq!(report.outcome, SyncOutcome::Completed);
    assert_eq!(read(root, "config/settings.cfg").unwrap(), data);

    let again = orchestrator.sync(root, false, EventSink::disabled()).await.unwrap();
    assert!(again.diff.is_noop());
}

#[tokio::test]
async fn test_large_file_uses_parallel_ranges() {
    let server = TestServer::start().await;
    let big = content(8, 51 * 1024 * 1024);
    server.put("big.pak", &big);

    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let orchestrator = SyncOrchestrator::new(config_for(&server)).unwrap();
    let report = orchestrator.sync(root, false, EventSink::disabled()).await.unwrap();

    assert_eq!(report.outcome, SyncOutcome::Completed);
    let gets = server.gets("big.pak");
    assert!(gets.len() >= 2);
    assert!(gets.iter().all(|range| range.is_some()));
    assert!(gets.contains(&Some("bytes=0-26738687".to_string())));
    assert_eq!(hash_bytes(&read(root, "big.pak").unwrap()), hash_bytes(&big));
    assert!(transfer_artifacts(root).is_empty());
}

#[tokio::test]
async fn test_parallel_falls_back_when_ranges_are_not_honored() {
    let server = TestServer::start().await;
    let big = content(9, 51 * 1024 * 1024);
    server.put("big.pak", &big);
    server.ignore_ranges();

    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let orchestrator = SyncOrchestrator::new(config_for(&server)).unwrap();
    let report = orchestrator.sync(root, false, EventSink::disabled()).await.unwrap();

    assert_eq!(report.outcome, SyncOutcome::Completed);
    assert_eq!(server.gets("big.pak").last(), Some(&None));
    assert_eq!(hash_bytes(&read(root, "big.pak").unwrap()), hash_bytes(&big));
    assert!(transfer_artifacts(root).is_empty());
}

async fn wait_for_get(server: &TestServer, key: &str) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while server.gets(key).is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{} was never requested", key));
}

#[tokio::test]
async fn test_huge_files_are_fetched_one_at_a_time() {
    let server = TestServer::start().await;
    server.put("huge1.pak", &content(10, 11 * 1024 * 1024));
    server.put("huge2.pak", &content(11, 12 * 1024 * 1024));
    server.stall("huge1.pak");
    server.stall("huge2.pak");

    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let mut config = config_for(&server);
    config.strategy.mode = StrategyMode::FastOptimized;
    let orchestrator = SyncOrchestrator::new(config).unwrap();

    let requested = || server.gets("huge1.pak").len() + server.gets("huge2.pak").len();
    let watcher = async {
        tokio::time::timeout(Duration::from_secs(10), async {
            while requested() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("no huge file was requested");
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let in_flight = requested();
        orchestrator.cancel();
        in_flight
    };
    let pass = orchestrator.sync(root, false, EventSink::disabled());
    let (report, in_flight) = tokio::join!(pass, watcher);

    assert_eq!(in_flight, 1);
    let report = report.unwrap();
    assert_eq!(report.profile.as_deref(), Some("fast_optimized"));
    assert_eq!(report.outcome, SyncOutcome::Cancelled);
    assert!(transfer_artifacts(root).is_empty());
}

#[tokio::test]
async fn test_unhashed_large_file_is_checked_against_head_hash() {
    let server = TestServer::start().await;
    server.put("big.pak", &content(12, 51 * 1024 * 1024));
    server.without_hash("big.pak");
    server.corrupt("big.pak");

    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let orchestrator = SyncOrchestrator::new(config_for(&server)).unwrap();
    let report = orchestrator.sync(root, false, EventSink::disabled()).await.unwrap();

    assert_eq!(report.outcome, SyncOutcome::RolledBack);
    assert!(report.error.as_deref().is_some_and(|e| e.contains("does not match")));
    assert!(server.heads("big.pak") >= 1);
    assert!(!root.join("big.pak").exists());
    assert!(transfer_artifacts(root).is_empty());
}

#[tokio::test]
async fn test_unhashed_large_file_with_matching_head_hash_completes() {
    let server = TestServer::start().await;
    let big = content(13, 51 * 1024 * 1024);
    server.put("big.pak", &big);
    server.without_hash("big.pak");

    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let orchestrator = SyncOrchestrator::new(config_for(&server)).unwrap();
    let report = orchestrator.sync(root, false, EventSink::disabled()).await.unwrap();

    assert_eq!(report.outcome, SyncOutcome::Completed);
    assert_eq!(hash_bytes(&read(root, "big.pak").unwrap()), hash_bytes(&big));
}

#[tokio::test]
async fn test_head_length_contradicting_manifest_fails_before_download() {
    let server = TestServer::start().await;
    server.put("big.pak", &content(14, 1000));
    server.set_manifest_body(r#"{"big.pak": {"size": 62914560, "hash": null}}"#);

    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let orchestrator = SyncOrchestrator::new(config_for(&server)).unwrap();
    let report = orchestrator.sync(root, false, EventSink::disabled()).await.unwrap();

    assert_eq!(report.outcome, SyncOutcome::RolledBack);
    assert!(report.error.as_deref().is_some_and(|e| e.contains("manifest lists")));
    assert_eq!(server.heads("big.pak"), 1);
    assert!(server.gets("big.pak").is_empty());
    assert!(!root.join("big.pak").exists());
}

#[tokio::test]
async fn test_stalled_download_is_retried_not_cancelled() {
    let server = TestServer::start().await;
    server.put("s.jar", &content(15, 200_000));
    server.stall("s.jar");

    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let mut config = config_for(&server);
    config.sync.max_retries = 2;
    let orchestrator = SyncOrchestrator::new(config).unwrap();
    let (sink, rx) = EventSink::channel();
    let report = orchestrator.sync(root, false, sink).await.unwrap();

    assert_eq!(report.outcome, SyncOutcome::RolledBack);
    assert!(report.error.as_deref().is_some_and(|e| e.contains("stalled")));
    assert_eq!(server.gets("s.jar").len(), 2);
    // One reachability check before the retry
    assert_eq!(server.heads("s.jar"), 1);
    assert!(!root.join("s.jar").exists());
    assert!(transfer_artifacts(root).is_empty());

    let events = drain(rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, SyncEvent::FileFailed { path, .. } if path == "s.jar")));
    assert!(matches!(events.last(), Some(SyncEvent::PassFailed { cancelled: false, .. })));
}

#[tokio::test]
async fn test_retry_is_skipped_while_server_is_unreachable() {
    let server = TestServer::start().await;
    server.put("b.jar", &content(16, 200_000));
    server.truncate("b.jar");
    server.fail_heads("b.jar");

    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let config = config_for(&server);
    let retries = config.sync.max_retries as usize - 1;
    let orchestrator = SyncOrchestrator::new(config).unwrap();
    let report = orchestrator.sync(root, false, EventSink::disabled()).await.unwrap();

    assert_eq!(report.outcome, SyncOutcome::RolledBack);
    assert!(report.error.as_deref().is_some_and(|e| e.contains("unreachable")));
    // Only the first attempt reached GET; every retry stopped at HEAD
    assert_eq!(server.gets("b.jar").len(), 1);
    assert_eq!(server.heads("b.jar"), retries);
    assert!(transfer_artifacts(root).is_empty());
}

#[tokio::test]
async fn test_cancel_without_backups_reports_incomplete_rollback() {
    let server = TestServer::start().await;
    server.put("slow.jar", &content(17, 2 * 1024 * 1024));
    server.stall("slow.jar");

    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(root, "extra.jar", b"extra");

    let mut config = config_for(&server);
    config.backup.enabled = false;
    let orchestrator = SyncOrchestrator::new(config).unwrap();
    let (sink, rx) = EventSink::channel();

    let canceller = async {
        wait_for_get(&server, "slow.jar").await;
        orchestrator.cancel();
    };
    let (report, ()) = tokio::join!(orchestrator.sync(root, false, sink), canceller);
    let report = report.unwrap();

    // extra.jar was deleted and there is nothing to restore it from
    assert_eq!(report.outcome, SyncOutcome::RollbackIncomplete);
    assert!(report.restore.is_none());
    assert_eq!(report.error.as_deref(), Some("Operation cancelled"));
    assert!(!root.join("extra.jar").exists());
    assert!(transfer_artifacts(root).is_empty());

    let events = drain(rx);
    assert!(matches!(events.last(), Some(SyncEvent::PassFailed { cancelled: true, .. })));
}
