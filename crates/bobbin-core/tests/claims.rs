mod common;

use std::collections::HashSet;

use bobbin_core::RuntimeConfig;
use bobbin_core::app::{Resolution, Tick};
use bobbin_core::domain::{BobbinError, DlqStatus, Outcome, TaskStatus, WorkerId};
use bobbin_core::ports::{DlqFilter, DlqStore, TaskStore};
use common::{Harness, tenant};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_hand_out_each_task_once() {
    let h = Harness::new().await;
    let t1 = tenant("t1");
    for n in 0..20 {
        h.enqueue_echo(&t1, n).await;
    }

    let mut joins = Vec::new();
    for i in 0..8 {
        let claims = h.app.claims().clone();
        joins.push(tokio::spawn(async move {
            let worker = WorkerId::new(format!("w{i}"));
            let mut got = Vec::new();
            while let Some(task) = claims.claim_next(&worker).await.unwrap() {
                assert_eq!(task.claimed_by.as_ref(), Some(&worker));
                got.push(task.id);
            }
            got
        }));
    }

    let mut all = Vec::new();
    for join in joins {
        all.extend(join.await.unwrap());
    }
    let unique: HashSet<_> = all.iter().copied().collect();
    assert_eq!(all.len(), 20);
    assert_eq!(unique.len(), 20);
    assert_eq!(h.tasks().counts(Some(&t1)).await.unwrap().claimed, 20);
}

#[tokio::test]
async fn always_failing_task_dead_letters_after_exactly_max_attempts() {
    let h = Harness::new().await;
    let t1 = tenant("t1");
    let task = h.enqueue_failing(&t1, 1).await;
    let worker = h.app.worker(WorkerId::new("w1"));

    let mut resolutions = Vec::new();
    for _ in 0..10 {
        if let Tick::Processed(_, resolution) = worker.run_once().await.unwrap() {
            resolutions.push(resolution);
        }
        h.clock.advance(chrono::Duration::minutes(10));
    }

    assert_eq!(resolutions.len(), 3);
    assert!(matches!(resolutions[0], Resolution::Retrying { attempts: 1, .. }));
    assert!(matches!(resolutions[1], Resolution::Retrying { attempts: 2, .. }));
    assert!(matches!(resolutions[2], Resolution::DeadLettered { attempts: 3, .. }));

    let stored = h.tasks().get(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::DeadLettered);
    assert_eq!(stored.attempts, 3);
    assert_eq!(
        stored.last_error.as_deref(),
        Some("Transient: downstream unavailable")
    );
}

#[tokio::test]
async fn retry_waits_for_backoff() {
    let h = Harness::new().await;
    let t1 = tenant("t1");
    h.enqueue_failing(&t1, 1).await;
    let worker = h.app.worker(WorkerId::new("w1"));

    assert!(matches!(
        worker.run_once().await.unwrap(),
        Tick::Processed(_, Resolution::Retrying { attempts: 1, .. })
    ));
    // base delay is 2s
    assert_eq!(worker.run_once().await.unwrap(), Tick::Idle);
    h.clock.advance(chrono::Duration::seconds(2));
    assert!(matches!(
        worker.run_once().await.unwrap(),
        Tick::Processed(_, Resolution::Retrying { attempts: 2, .. })
    ));
}

#[tokio::test]
async fn crashed_worker_task_is_reclaimed_and_finished_elsewhere() {
    let h = Harness::new().await;
    let t1 = tenant("t1");
    let task = h.enqueue_echo(&t1, 7).await;
    let claims = h.app.claims();

    let w1 = WorkerId::new("w1");
    let claimed = claims.claim_next(&w1).await.unwrap().unwrap();
    claims.mark_running(claimed.id, &w1).await.unwrap();
    // w1 dies here without reporting

    assert!(claims.sweep_expired().await.unwrap().is_empty());
    h.clock.advance(chrono::Duration::seconds(61));
    assert_eq!(claims.sweep_expired().await.unwrap(), vec![task.id]);

    let stored = h.tasks().get(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Queued);
    assert_eq!(stored.attempts, 0);
    assert_eq!(stored.claimed_by, None);

    let w2 = h.app.worker(WorkerId::new("w2"));
    match w2.run_once().await.unwrap() {
        Tick::Processed(t, Resolution::Completed) => assert_eq!(t.id, task.id),
        other => panic!("unexpected tick: {other:?}"),
    }

    // the late report from w1 changes nothing
    let err = claims
        .release_or_fail(task.id, &w1, Outcome::success())
        .await
        .unwrap_err();
    assert!(matches!(err, BobbinError::LeaseLost { .. }));
    let stored = h.tasks().get(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    assert_eq!(stored.result, Some(serde_json::json!({"n": 7})));
}

#[tokio::test]
async fn emergency_stop_halts_claims_until_resumed() {
    let h = Harness::new().await;
    let t1 = tenant("t1");
    h.enqueue_echo(&t1, 1).await;
    let worker = h.app.worker(WorkerId::new("w1"));

    assert!(h.app.admin().stop("incident").await.success);
    assert_eq!(worker.run_once().await.unwrap(), Tick::Idle);
    assert_eq!(h.tasks().counts(Some(&t1)).await.unwrap().queued, 1);

    assert!(h.app.admin().resume("resolved").await.success);
    assert!(matches!(
        worker.run_once().await.unwrap(),
        Tick::Processed(_, Resolution::Completed)
    ));
}

#[tokio::test]
async fn paused_tenant_waits_while_others_complete() {
    let h = Harness::new().await;
    let t1 = tenant("t1");
    let t2 = tenant("t2");

    assert!(h.app.admin().pause(Some("t1"), "noisy tenant").await.success);
    h.enqueue_echo(&t1, 1).await;
    h.enqueue_echo(&t2, 2).await;

    let worker = h.app.worker(WorkerId::new("w1"));
    assert_eq!(h.run_until_idle(&worker).await, 1);

    let t1_counts = h.tasks().counts(Some(&t1)).await.unwrap();
    let t2_counts = h.tasks().counts(Some(&t2)).await.unwrap();
    assert_eq!(t1_counts.queued, 1);
    assert_eq!(t2_counts.completed, 1);

    assert!(h.app.admin().unpause(Some("t1"), "").await.success);
    assert_eq!(h.run_until_idle(&worker).await, 1);
    assert_eq!(h.tasks().counts(Some(&t1)).await.unwrap().completed, 1);
}

#[tokio::test]
async fn store_outage_fails_claims_safely() {
    let h = Harness::new().await;
    let t1 = tenant("t1");
    h.enqueue_echo(&t1, 1).await;
    let worker = h.app.worker(WorkerId::new("w1"));

    h.tasks().set_available(false);
    let err = worker.run_once().await.unwrap_err();
    assert!(err.is_unavailable());

    h.tasks().set_available(true);
    assert!(matches!(
        worker.run_once().await.unwrap(),
        Tick::Processed(_, Resolution::Completed)
    ));
}

#[tokio::test]
async fn failed_dead_letter_transition_withdraws_the_dlq_item() {
    let mut config = RuntimeConfig::default();
    config.retry.max_attempts = 1;
    let h = Harness::with_config(config).await;
    let t1 = tenant("t1");
    let task = h.enqueue_failing(&t1, 1).await;
    let worker = h.app.worker(WorkerId::new("w1"));

    h.faults.fail_dead_letter(true);
    let err = worker.run_once().await.unwrap_err();
    assert!(err.is_unavailable());

    // no orphan item; the task is still w1's
    assert_eq!(h.backend.dlq.count(None).await.unwrap(), 0);
    let stuck = h.tasks().get(task.id).await.unwrap().unwrap();
    assert_eq!(stuck.status, TaskStatus::Running);
    assert_eq!(stuck.attempts, 0);

    h.faults.fail_dead_letter(false);
    h.clock.advance(chrono::Duration::seconds(61));
    assert_eq!(h.app.claims().sweep_expired().await.unwrap(), vec![task.id]);
    assert!(matches!(
        worker.run_once().await.unwrap(),
        Tick::Processed(_, Resolution::DeadLettered { attempts: 1, .. })
    ));

    let items = h.app.dlq().list(&DlqFilter::default()).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].source_task_id, task.id);
    assert_eq!(items[0].status, DlqStatus::Failed);
}
