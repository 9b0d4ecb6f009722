mod common;

use automation_queue::{QueueError, ResourceClass, SubmitRequest};
use common::{config, start, Harness};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn hold(user: &str, class: ResourceClass, label: &str, priority: i32) -> SubmitRequest {
    SubmitRequest::new(user, "hold", class)
        .payload(json!(label))
        .priority(priority)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn burst_never_exceeds_class_capacity() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let (_launcher, scheduler) = start(&config(tmp.path()), &harness);
    let scheduler = Arc::new(scheduler);

    let submissions: Vec<_> = (0..8)
        .map(|i| {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                scheduler
                    .submit(hold(&format!("user-{i}"), ResourceClass::ExclusiveAutomation, &format!("r{i}"), 1))
                    .await
            })
        })
        .collect();

    harness.wait_started(5).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.started().len(), 5);
    let status = scheduler.status().await;
    let exclusive = status.class(ResourceClass::ExclusiveAutomation);
    assert_eq!(exclusive.in_flight, 5);
    assert_eq!(exclusive.queued, 3);
    assert_eq!(exclusive.max_concurrent, 5);

    harness.release(8);
    for submission in futures_util::future::join_all(submissions).await {
        submission.unwrap().unwrap();
    }
    assert_eq!(harness.peak.load(Ordering::SeqCst), 5);
    let status = scheduler.status().await;
    assert_eq!(status.class(ResourceClass::ExclusiveAutomation).in_flight, 0);
    assert_eq!(status.completed, 8);
}

#[tokio::test]
async fn saturated_class_does_not_block_other_classes() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = config(tmp.path());
    config.capacity.exclusive_automation = 1;
    let harness = Harness::new();
    let (_launcher, scheduler) = start(&config, &harness);

    let a1 = scheduler
        .enqueue(hold("alice", ResourceClass::ExclusiveAutomation, "a1", 5))
        .await
        .unwrap();
    harness.wait_started(1).await;
    let a2 = scheduler
        .enqueue(hold("bob", ResourceClass::ExclusiveAutomation, "a2", 5))
        .await
        .unwrap();
    let b1 = scheduler
        .enqueue(hold("carol", ResourceClass::BackgroundTask, "b1", 0))
        .await
        .unwrap();

    harness.wait_started(2).await;
    assert_eq!(harness.started(), vec!["a1", "b1"]);
    let status = scheduler.status().await;
    assert_eq!(status.class(ResourceClass::ExclusiveAutomation).queued, 1);
    assert_eq!(status.class(ResourceClass::BackgroundTask).in_flight, 1);

    harness.release(3);
    assert_eq!(a1.await.unwrap(), json!("a1"));
    assert_eq!(b1.await.unwrap(), json!("b1"));
    assert_eq!(a2.await.unwrap(), json!("a2"));
}

#[tokio::test]
async fn equal_priorities_admit_in_submission_order() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = config(tmp.path());
    config.capacity.persistence = 1;
    let harness = Harness::new();
    let (_launcher, scheduler) = start(&config, &harness);

    let mut pending = vec![scheduler
        .enqueue(hold("alice", ResourceClass::Persistence, "r0", 3))
        .await
        .unwrap()];
    harness.wait_started(1).await;
    for label in ["r1", "r2", "r3"] {
        pending.push(
            scheduler
                .enqueue(hold("alice", ResourceClass::Persistence, label, 3))
                .await
                .unwrap(),
        );
    }

    for admitted in 2..=4 {
        harness.release(1);
        harness.wait_started(admitted).await;
    }
    harness.release(1);
    for submission in pending {
        submission.await.unwrap();
    }
    assert_eq!(harness.started(), vec!["r0", "r1", "r2", "r3"]);
}

#[tokio::test]
async fn higher_priority_jumps_the_queue_once_a_slot_frees() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let (_launcher, scheduler) = start(&config(tmp.path()), &harness);

    let mut pending = Vec::new();
    for (i, priority) in [1, 1, 1, 1, 1, 2].into_iter().enumerate() {
        pending.push(
            scheduler
                .enqueue(hold("alice", ResourceClass::ExclusiveAutomation, &format!("r{i}"), priority))
                .await
                .unwrap(),
        );
    }
    harness.wait_started(5).await;
    assert_eq!(scheduler.status().await.class(ResourceClass::ExclusiveAutomation).queued, 1);

    for label in ["late-low-1", "late-low-2"] {
        pending.push(
            scheduler
                .enqueue(hold("alice", ResourceClass::ExclusiveAutomation, label, 1))
                .await
                .unwrap(),
        );
    }

    harness.release(1);
    harness.wait_started(6).await;
    assert_eq!(harness.started()[5], "r5");

    harness.release(7);
    for submission in pending {
        submission.await.unwrap();
    }
    let mut late = harness.started()[6..].to_vec();
    late.sort();
    assert_eq!(late, vec!["late-low-1", "late-low-2"]);
}

#[tokio::test]
async fn failing_operations_always_release_their_slot() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let (_launcher, scheduler) = start(&config(tmp.path()), &harness);

    for _ in 0..100 {
        let err = scheduler
            .submit(SubmitRequest::new("alice", "fail", ResourceClass::ExternalApi))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "workbook is read-only");
        let status = scheduler.status().await;
        assert_eq!(status.class(ResourceClass::ExternalApi).in_flight, 0);
    }

    let status = scheduler.status().await;
    assert_eq!(status.failed, 100);
    let session = scheduler.sessions().get("alice").await.unwrap();
    assert!(session.active_operations.is_empty());
}

#[tokio::test]
async fn unobtainable_session_fails_as_expired_without_leaking_a_slot() {
    let tmp = tempfile::tempdir().unwrap();
    let not_a_dir = tmp.path().join("root-file");
    std::fs::write(&not_a_dir, b"").unwrap();
    let harness = Harness::new();
    let (_launcher, scheduler) = start(&config(&not_a_dir), &harness);

    let err = scheduler
        .submit(hold("alice", ResourceClass::BackgroundTask, "never", 0))
        .await
        .unwrap_err();

    assert!(matches!(err, QueueError::SessionExpired(ref user) if user == "alice"));
    assert!(harness.started().is_empty());
    let status = scheduler.status().await;
    assert_eq!(status.class(ResourceClass::BackgroundTask).in_flight, 0);
    assert_eq!(status.total_sessions, 0);
}

#[tokio::test]
async fn concurrent_first_requests_share_one_session() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let (_launcher, scheduler) = start(&config(tmp.path()), &harness);

    let first = scheduler
        .enqueue(hold("alice", ResourceClass::BackgroundTask, "one", 0))
        .await
        .unwrap();
    let second = scheduler
        .enqueue(hold("alice", ResourceClass::BackgroundTask, "two", 0))
        .await
        .unwrap();
    harness.wait_started(2).await;

    let sessions = scheduler.sessions().list().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].active_operations, 2);

    harness.release(2);
    first.await.unwrap();
    second.await.unwrap();
}

#[tokio::test]
async fn idle_session_is_reclaimed_by_the_reaper() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = config(tmp.path());
    config.session_timeout_secs = 1;
    config.reap_interval_secs = 1;
    let harness = Harness::new();
    let (launcher, scheduler) = start(&config, &harness);

    let launched = scheduler
        .submit(SubmitRequest::new("alice", "launch", ResourceClass::ExclusiveAutomation))
        .await
        .unwrap();
    let pid = launched["pid"].as_u64().unwrap() as u32;
    let dirs = scheduler.sessions().get("alice").await.unwrap().dirs;
    assert!(dirs.excel().is_dir());

    tokio::time::sleep(Duration::from_millis(2500)).await;

    assert!(scheduler.sessions().get("alice").await.is_none());
    assert_eq!(scheduler.sessions().count().await, 0);
    assert!(!dirs.root().exists());
    assert_eq!(launcher.killed(), vec![pid]);
    assert_eq!(scheduler.sessions().processes().len().await, 0);
}

#[tokio::test]
async fn cleanup_session_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let (launcher, scheduler) = start(&config(tmp.path()), &harness);

    scheduler
        .submit(SubmitRequest::new("alice", "launch", ResourceClass::ExclusiveAutomation))
        .await
        .unwrap();

    scheduler.cleanup_session("alice").await;
    scheduler.cleanup_session("alice").await;
    scheduler.cleanup_session("never-seen").await;

    assert_eq!(launcher.killed().len(), 1);
    assert_eq!(scheduler.status().await.total_sessions, 0);
}

#[tokio::test]
async fn one_users_processes_survive_another_users_cleanup() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let (launcher, scheduler) = start(&config(tmp.path()), &harness);

    for user in ["alice", "bob"] {
        scheduler
            .submit(SubmitRequest::new(user, "launch", ResourceClass::ExclusiveAutomation))
            .await
            .unwrap();
    }
    scheduler.cleanup_session("alice").await;

    let remaining = scheduler.sessions().processes().handles().await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].user_id, "bob");
    assert_eq!(launcher.killed().len(), 1);
    assert!(scheduler.sessions().get("bob").await.is_some());
}
