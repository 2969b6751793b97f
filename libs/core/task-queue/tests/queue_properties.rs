//! Queue behavior against the in-memory broker.

use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use task_queue::{
    FailOutcome, LaneStore, MemoryBroker, NewTask, QueueConfig, QueueError, QueueManager,
    RetryPolicy, TaskId, TaskPayload, TaskStatus,
};

fn config() -> QueueConfig {
    QueueConfig::new("it:queue")
        .with_retry_policy(RetryPolicy::immediate())
        .with_poll_interval(Duration::from_millis(5))
}

fn manager() -> QueueManager {
    QueueManager::in_memory(config())
}

/// Manager plus a handle on its broker, for simulating crashes mid-operation.
fn manager_with_broker(config: QueueConfig) -> (QueueManager, Arc<MemoryBroker>) {
    let broker = Arc::new(MemoryBroker::new().with_ttl(config.ttl));
    let manager = QueueManager::new(broker.clone(), broker.clone(), broker.clone(), config);
    (manager, broker)
}

fn doc(name: &str) -> TaskPayload {
    TaskPayload::json(json!({ "doc": name }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dequeues_hand_out_distinct_tasks() {
    let manager = Arc::new(manager());
    let mut enqueued = HashSet::new();
    for i in 0..20 {
        let id = manager
            .enqueue(doc(&format!("{i}.pdf")), i % 10, None)
            .await
            .unwrap();
        enqueued.insert(id);
    }

    let mut handles = Vec::new();
    for i in 0..20 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            manager
                .dequeue(Duration::from_millis(200), &format!("worker-{i}"))
                .await
                .unwrap()
        }));
    }

    let mut claimed = HashSet::new();
    for handle in handles {
        let task = handle.await.unwrap().expect("every worker gets a task");
        assert_eq!(task.status, TaskStatus::Processing);
        assert!(claimed.insert(task.task_id), "task handed out twice");
    }

    assert_eq!(claimed, enqueued);
    let stats = manager.stats().await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.processing, 20);
}

#[tokio::test]
async fn retry_count_is_monotonic_and_bounded() {
    let manager = manager();
    let id = manager.enqueue(doc("a.pdf"), 0, Some(4)).await.unwrap();

    let mut last = 0;
    loop {
        let task = manager
            .dequeue(Duration::from_millis(100), "w1")
            .await
            .unwrap()
            .expect("retry is promoted back to its lane");
        assert!(task.retry_count >= last);
        assert!(task.retry_count <= task.max_retries);
        last = task.retry_count;

        match manager.fail(&id, "timeout", true).await.unwrap() {
            FailOutcome::Retrying { attempt, .. } => assert_eq!(attempt, last + 1),
            FailOutcome::DeadLettered { attempts } => {
                assert_eq!(attempts, 5);
                break;
            }
            FailOutcome::Ignored => panic!("active task ignored"),
        }
    }

    let task = manager.get_status(&id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::DeadLetter);
    assert_eq!(task.retry_count, 4);
}

#[tokio::test]
async fn ack_and_fail_on_final_tasks_change_nothing() {
    let manager = manager();
    let done = manager.enqueue(doc("a.pdf"), 0, None).await.unwrap();
    let dead = manager.enqueue(doc("b.pdf"), 0, None).await.unwrap();
    manager.dequeue(Duration::ZERO, "w1").await.unwrap();
    manager.dequeue(Duration::ZERO, "w1").await.unwrap();

    assert!(manager.ack(&done, json!({"chunks": 1})).await.unwrap());
    manager.fail(&dead, "corrupt", false).await.unwrap();

    assert!(!manager.ack(&done, json!({"chunks": 2})).await.unwrap());
    assert_eq!(
        manager.fail(&done, "late failure", true).await.unwrap(),
        FailOutcome::Ignored
    );
    assert!(!manager.ack(&dead, json!({})).await.unwrap());
    assert_eq!(
        manager.fail(&dead, "again", false).await.unwrap(),
        FailOutcome::Ignored
    );

    let done = manager.get_status(&done).await.unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.result, Some(json!({"chunks": 1})));
    assert_eq!(done.last_error, None);

    let dead = manager.get_status(&dead).await.unwrap().unwrap();
    assert_eq!(dead.status, TaskStatus::DeadLetter);
    assert_eq!(dead.last_error.as_deref(), Some("corrupt"));
    assert_eq!(manager.dead_letters(10, 0).await.unwrap().len(), 1);
}

#[tokio::test]
async fn priority_lane_drains_first_then_fifo() {
    let manager = manager();
    let a = manager.enqueue(doc("a"), 0, None).await.unwrap();
    let b = manager.enqueue(doc("b"), 9, None).await.unwrap();
    let c = manager.enqueue(doc("c"), 1, None).await.unwrap();
    let d = manager.enqueue(doc("d"), 5, None).await.unwrap();

    let mut order = Vec::new();
    while let Some(task) = manager.dequeue(Duration::ZERO, "w1").await.unwrap() {
        order.push(task.task_id);
    }

    assert_eq!(order, vec![b, d, a, c]);
}

#[tokio::test]
async fn dead_letter_round_trip() {
    let manager = manager();
    let id = manager.enqueue(doc("a.pdf"), 0, Some(1)).await.unwrap();

    manager.dequeue(Duration::ZERO, "w1").await.unwrap().unwrap();
    assert!(matches!(
        manager.fail(&id, "first", true).await.unwrap(),
        FailOutcome::Retrying { attempt: 1, .. }
    ));

    manager
        .dequeue(Duration::from_millis(100), "w1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        manager.fail(&id, "second", true).await.unwrap(),
        FailOutcome::DeadLettered { attempts: 2 }
    );

    let entries = manager.dead_letters(10, 0).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].task.task_id, id);
    assert_eq!(entries[0].error, "second");
    assert_eq!(entries[0].attempts, 2);

    let task = manager.retry(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retry_count, 0);
    assert_eq!(task.last_error, None);
    assert!(manager.dead_letters(10, 0).await.unwrap().is_empty());

    let again = manager.dequeue(Duration::ZERO, "w2").await.unwrap().unwrap();
    assert_eq!(again.task_id, id);
    assert_eq!(again.retry_count, 0);
}

#[tokio::test]
async fn stats_match_task_outcomes() {
    let manager = manager();
    for i in 0..10 {
        manager.enqueue(doc(&format!("{i}.pdf")), 0, None).await.unwrap();
    }

    for i in 0..8 {
        let task = manager.dequeue(Duration::ZERO, "w1").await.unwrap().unwrap();
        if i < 6 {
            manager.ack(&task.task_id, json!({})).await.unwrap();
        } else {
            manager.fail(&task.task_id, "unsupported", false).await.unwrap();
        }
    }

    let stats = manager.stats().await.unwrap();
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.completed, 6);
    assert_eq!(stats.dead_letter, 2);
    assert_eq!(stats.processing, 0);
    assert_eq!(stats.failed, 0);
}

#[tokio::test]
async fn failing_task_walks_to_dead_letter() {
    let manager = manager();
    manager
        .submit(
            NewTask::new(doc("a.pdf"))
                .with_id("t1")
                .with_priority(0)
                .with_max_retries(3),
        )
        .await
        .unwrap();
    let t1 = TaskId::new("t1");

    let task = manager.dequeue(Duration::ZERO, "w1").await.unwrap().unwrap();
    assert_eq!(task.task_id, t1);
    assert_eq!(task.status, TaskStatus::Processing);

    for expected in 1..=3 {
        let message = format!("embedding timeout #{expected}");
        manager.fail(&t1, &message, true).await.unwrap();

        let task = manager.get_status(&t1).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, expected);
        assert_eq!(task.last_error, Some(message));

        manager
            .dequeue(Duration::from_millis(100), "w1")
            .await
            .unwrap()
            .unwrap();
    }

    let outcome = manager.fail(&t1, "embedding timeout #4", true).await.unwrap();
    assert_eq!(outcome, FailOutcome::DeadLettered { attempts: 4 });

    let task = manager.get_status(&t1).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::DeadLetter);
    assert_eq!(task.retry_count, 3);
    assert_eq!(task.last_error.as_deref(), Some("embedding timeout #4"));
    assert_eq!(
        task.describe(),
        "processing failed after 4 attempts: embedding timeout #4"
    );
}

#[tokio::test]
async fn reaper_returns_stale_processing_tasks() {
    let manager = manager();
    let id = manager.enqueue(doc("a.pdf"), 7, None).await.unwrap();
    manager.dequeue(Duration::ZERO, "crashed-worker").await.unwrap();

    // Nothing is stale yet
    let report = manager.reclaim_stale(Duration::from_secs(600)).await.unwrap();
    assert_eq!(report.reclaimed, 0);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let report = manager.reclaim_stale(Duration::from_millis(10)).await.unwrap();
    assert_eq!(report.reclaimed, 1);

    let task = manager.dequeue(Duration::ZERO, "w2").await.unwrap().unwrap();
    assert_eq!(task.task_id, id);
    assert_eq!(task.worker_id.as_deref(), Some("w2"));
}

#[tokio::test]
async fn cleanup_drops_old_terminal_records_only() {
    let manager = manager();
    let done = manager.enqueue(doc("a"), 0, None).await.unwrap();
    let live = manager.enqueue(doc("b"), 0, None).await.unwrap();
    manager.dequeue(Duration::ZERO, "w1").await.unwrap();
    manager.ack(&done, json!({})).await.unwrap();

    let report = manager.cleanup(Duration::from_secs(3600)).await.unwrap();
    assert_eq!(report.removed(), 0);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let report = manager.cleanup(Duration::from_millis(10)).await.unwrap();
    assert_eq!(report.completed, 1);
    assert!(!report.has_more);

    assert!(manager.get_status(&done).await.unwrap().is_none());
    assert!(manager.get_status(&live).await.unwrap().is_some());
}

#[tokio::test]
async fn duplicate_ids_are_rejected() {
    let manager = manager();
    manager
        .submit(NewTask::new(doc("a")).with_id("dup"))
        .await
        .unwrap();

    let err = manager
        .submit(NewTask::new(doc("b")).with_id("dup"))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Duplicate(_)));
    assert_eq!(manager.stats().await.unwrap().pending, 1);
}

#[tokio::test]
async fn late_reports_from_a_reclaimed_worker_are_ignored() {
    let manager = QueueManager::in_memory(
        config().with_retry_policy(RetryPolicy::new(Duration::from_secs(60), Duration::from_secs(600))),
    );
    let id = manager.enqueue(doc("a.pdf"), 0, None).await.unwrap();
    manager.dequeue(Duration::ZERO, "w1").await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    let report = manager.reclaim_stale(Duration::from_millis(10)).await.unwrap();
    assert_eq!(report.reclaimed, 1);

    // w1 wakes up after its task went back to the lane
    assert_eq!(manager.fail(&id, "timeout", true).await.unwrap(), FailOutcome::Ignored);
    assert!(!manager.ack(&id, json!({"late": true})).await.unwrap());

    let task = manager.get_status(&id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retry_count, 0);
    assert_eq!(manager.stats().await.unwrap().scheduled, 0);

    let task = manager.dequeue(Duration::ZERO, "w2").await.unwrap().unwrap();
    assert_eq!(task.worker_id.as_deref(), Some("w2"));

    // Fenced reports from w1 cannot touch w2's run
    assert_eq!(
        manager.fail_as(&id, "w1", "timeout", true).await.unwrap(),
        FailOutcome::Ignored
    );
    assert!(!manager.ack_as(&id, "w1", json!({})).await.unwrap());
    assert!(!manager.release_as(&id, "w1").await.unwrap());
    assert_eq!(
        manager.get_status(&id).await.unwrap().unwrap().status,
        TaskStatus::Processing
    );

    assert!(manager.ack_as(&id, "w2", json!({"chunks": 1})).await.unwrap());
}

#[tokio::test]
async fn popped_but_unclaimed_task_is_recovered_under_backlog() {
    let (manager, broker) = manager_with_broker(config().with_cleanup_batch(2));
    for name in ["a-backlog", "b-backlog"] {
        manager.submit(NewTask::new(doc(name)).with_id(name)).await.unwrap();
    }
    let orphan = manager
        .submit(NewTask::new(doc("c")).with_id("c-orphan").with_priority(9))
        .await
        .unwrap();

    // Worker pops the id and dies before claiming it
    assert_eq!(broker.try_pop().await.unwrap(), Some(orphan.clone()));

    tokio::time::sleep(Duration::from_millis(20)).await;
    let report = manager.reclaim_stale(Duration::from_millis(10)).await.unwrap();
    assert_eq!(report.requeued, 1);
    assert_eq!(report.settled, 1);
    assert!(!broker.is_in_flight(&orphan).await.unwrap());

    let task = manager.dequeue(Duration::ZERO, "w2").await.unwrap().unwrap();
    assert_eq!(task.task_id, orphan);
    assert_eq!(manager.stats().await.unwrap().pending, 2);
}

#[tokio::test]
async fn orphan_sweep_pages_past_a_backlog() {
    let (manager, broker) = manager_with_broker(config().with_cleanup_batch(2));
    for name in ["a-backlog", "b-backlog", "c-orphan"] {
        manager.submit(NewTask::new(doc(name)).with_id(name)).await.unwrap();
    }
    let orphan = TaskId::new("c-orphan");

    // Record written, lane entry lost
    assert_eq!(broker.remove(&orphan, 0).await.unwrap(), 1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let first = manager.reclaim_stale(Duration::from_millis(10)).await.unwrap();
    assert_eq!(first.requeued, 0);
    let second = manager.reclaim_stale(Duration::from_millis(10)).await.unwrap();
    assert_eq!(second.requeued, 1);

    assert!(broker.contains(&orphan, 0).await.unwrap());
    assert_eq!(manager.stats().await.unwrap().pending, 3);
}

#[tokio::test]
async fn dequeue_clears_in_flight_markers() {
    let (manager, broker) = manager_with_broker(config());
    let id = manager.enqueue(doc("a"), 0, None).await.unwrap();

    manager.dequeue(Duration::ZERO, "w1").await.unwrap().unwrap();
    assert!(!broker.is_in_flight(&id).await.unwrap());

    let report = manager.reclaim_stale(Duration::ZERO).await.unwrap();
    assert_eq!(report.settled, 0);
    assert_eq!(report.requeued, 0);
}

#[tokio::test]
async fn reaper_keeps_live_terminal_records_counted() {
    let manager = manager();
    let id = manager.enqueue(doc("a"), 0, None).await.unwrap();
    manager.dequeue(Duration::ZERO, "w1").await.unwrap();
    manager.ack(&id, json!({})).await.unwrap();

    let report = manager.reclaim_stale(Duration::ZERO).await.unwrap();
    assert_eq!(report.pruned, 0);
    assert_eq!(manager.stats().await.unwrap().completed, 1);
}
