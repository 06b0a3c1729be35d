
use std::sync::Arc;
use std::time::Duration;

use weles_lite::config::DispatcherConfig;
use weles_lite::dryad::{DispatchSpec, Dryad, DryadJobFilter, DryadJobManager, DryadJobStatus};
use weles_lite::error::{ErrorKind, WelesError};
use weles_lite::spec::{JobConfig, TestCase, Timeouts};
use weles_lite::status::{status_channel, StatusChange, StatusReceiver};
use test_harness::{Behavior, FakeRunner};

fn manager(behavior: Behavior) -> (DryadJobManager, Arc<FakeRunner>) {
    manager_with(behavior, DispatcherConfig::default())
}

fn manager_with(behavior: Behavior, config: DispatcherConfig) -> (DryadJobManager, Arc<FakeRunner>) {
    let runner = Arc::new(FakeRunner::new(behavior));
    (DryadJobManager::new(config, runner.clone()), runner)
}

fn dispatch_spec(timeout_secs: Option<u64>) -> DispatchSpec {
    let config = JobConfig {
        job_name: "smoke".to_string(),
        timeouts: Timeouts { job: timeout_secs },
        tests: vec![
            TestCase {
                name: "boot".to_string(),
                commands: vec!["true".to_string()],
            },
            TestCase {
                name: "net".to_string(),
                commands: vec!["true".to_string()],
            },
        ],
        ..Default::default()
    };
    DispatchSpec {
        config: Arc::new(config),
        log_path: None,
    }
}

fn dryad(n: u8) -> Dryad {
    Dryad::new(format!("10.0.1.{}", n), "root")
}

async fn collect_until_terminal(
    rx: &mut StatusReceiver<DryadJobStatus>,
) -> Vec<StatusChange<DryadJobStatus>> {
    let mut events = Vec::new();
    loop {
        let change = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for dispatch status")
            .expect("status channel closed");
        let terminal = matches!(
            change.status,
            DryadJobStatus::Completed | DryadJobStatus::Failed | DryadJobStatus::Canceled
        );
        events.push(change);
        if terminal {
            return events;
        }
    }
}

fn statuses(events: &[StatusChange<DryadJobStatus>]) -> Vec<DryadJobStatus> {
    events.iter().map(|e| e.status).collect()
}

#[tokio::test]
async fn test_dispatch_completes() {
    let (manager, runner) = manager(Behavior::Succeed);
    let (tx, mut rx) = status_channel();

    manager.create(1, dryad(1), dispatch_spec(None), tx).await.unwrap();
    let events = collect_until_terminal(&mut rx).await;

    assert_eq!(
        statuses(&events),
        vec![
            DryadJobStatus::Waiting,
            DryadJobStatus::Running,
            DryadJobStatus::Completed
        ]
    );
    assert!(events.iter().all(|e| e.id == 1));
    assert_eq!(events.last().unwrap().info, "2 test cases passed");

    let info = manager.get(1).await.unwrap();
    assert_eq!(info.status, DryadJobStatus::Completed);
    assert_eq!(info.dryad, dryad(1));
    assert!(info.updated >= info.created);
    assert_eq!(runner.executed.load(std::sync::atomic::Ordering::SeqCst), 1);

    // Exactly one terminal event.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_duplicate_dispatch_is_rejected() {
    let (manager, _runner) = manager(Behavior::Hang);
    let (tx, _rx) = status_channel();

    manager
        .create(1, dryad(1), dispatch_spec(None), tx.clone())
        .await
        .unwrap();

    let err = manager
        .create(1, dryad(2), dispatch_spec(None), tx.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, WelesError::AlreadyRunning(1)));
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let err = manager
        .create(2, dryad(1), dispatch_spec(None), tx)
        .await
        .unwrap_err();
    assert!(matches!(err, WelesError::ResourceUnavailable(_)));

    manager.cancel(1).await.unwrap();
}

#[tokio::test]
async fn test_cancel_running_dispatch() {
    let (manager, _runner) = manager(Behavior::Hang);
    let (tx, mut rx) = status_channel();

    manager.create(7, dryad(1), dispatch_spec(None), tx).await.unwrap();
    assert_eq!(rx.recv().await.unwrap().status, DryadJobStatus::Waiting);
    assert_eq!(rx.recv().await.unwrap().status, DryadJobStatus::Running);

    manager.cancel(7).await.unwrap();
    let events = collect_until_terminal(&mut rx).await;
    assert_eq!(statuses(&events), vec![DryadJobStatus::Canceled]);
    assert_eq!(manager.get(7).await.unwrap().status, DryadJobStatus::Canceled);

    let err = manager.cancel(7).await.unwrap_err();
    assert!(matches!(err, WelesError::AlreadyTerminal(7)));

    let err = manager.cancel(8).await.unwrap_err();
    assert!(matches!(err, WelesError::DispatchNotFound(8)));
}

#[tokio::test]
async fn test_dryad_is_free_after_dispatch_ends() {
    let (manager, _runner) = manager(Behavior::Succeed);
    let (tx, mut rx) = status_channel();

    manager
        .create(1, dryad(1), dispatch_spec(None), tx.clone())
        .await
        .unwrap();
    collect_until_terminal(&mut rx).await;

    manager.create(2, dryad(1), dispatch_spec(None), tx).await.unwrap();
    let events = collect_until_terminal(&mut rx).await;
    assert_eq!(events.last().unwrap().status, DryadJobStatus::Completed);
    assert_eq!(events.last().unwrap().id, 2);
}

#[tokio::test]
async fn test_timeout_fails_dispatch() {
    let (manager, _runner) = manager(Behavior::Hang);
    let (tx, mut rx) = status_channel();

    manager
        .create(1, dryad(1), dispatch_spec(Some(1)), tx)
        .await
        .unwrap();
    let events = collect_until_terminal(&mut rx).await;
    let last = events.last().unwrap();
    assert_eq!(last.status, DryadJobStatus::Failed);
    assert!(last.info.contains("timed out"), "info: {}", last.info);
}

#[tokio::test]
async fn test_runner_panic_is_contained() {
    let (manager, _runner) = manager(Behavior::Panic);
    let (tx, mut rx) = status_channel();

    manager.create(1, dryad(1), dispatch_spec(None), tx).await.unwrap();
    let events = collect_until_terminal(&mut rx).await;
    let last = events.last().unwrap();
    assert_eq!(last.status, DryadJobStatus::Failed);
    assert!(last.info.contains("panicked"), "info: {}", last.info);
}

#[tokio::test]
async fn test_failed_tests_fail_dispatch() {
    let (manager, _runner) = manager(Behavior::FailTests);
    let (tx, mut rx) = status_channel();

    manager.create(1, dryad(1), dispatch_spec(None), tx).await.unwrap();
    let events = collect_until_terminal(&mut rx).await;
    assert_eq!(
        statuses(&events),
        vec![
            DryadJobStatus::Waiting,
            DryadJobStatus::Running,
            DryadJobStatus::Failed
        ]
    );
    assert_eq!(events.last().unwrap().info, "1 of 2 test cases failed");
}

#[tokio::test]
async fn test_prepare_failure_never_runs() {
    let (manager, runner) = manager(Behavior::FailPrepare);
    let (tx, mut rx) = status_channel();

    manager.create(1, dryad(1), dispatch_spec(None), tx).await.unwrap();
    let events = collect_until_terminal(&mut rx).await;
    assert_eq!(
        statuses(&events),
        vec![DryadJobStatus::Waiting, DryadJobStatus::Failed]
    );
    assert_eq!(runner.executed.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_list_and_reap() {
    let config = DispatcherConfig {
        reap_after: Duration::ZERO,
        ..Default::default()
    };
    let (manager, _runner) = manager_with(Behavior::Succeed, config);
    let (tx, mut rx) = status_channel();

    manager
        .create(2, dryad(2), dispatch_spec(None), tx.clone())
        .await
        .unwrap();
    collect_until_terminal(&mut rx).await;
    manager.create(1, dryad(1), dispatch_spec(None), tx).await.unwrap();
    collect_until_terminal(&mut rx).await;

    let all = manager.list(&DryadJobFilter::default()).await;
    let ids: Vec<u64> = all.iter().map(|d| d.job_id).collect();
    assert_eq!(ids, vec![1, 2]);

    let on_dryad_two = DryadJobFilter {
        dryads: vec![dryad(2).addr],
        ..Default::default()
    };
    let filtered = manager.list(&on_dryad_two).await;
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].job_id, 2);

    assert_eq!(manager.reap_finished().await, 2);
    assert!(manager.list(&DryadJobFilter::default()).await.is_empty());
    assert!(matches!(
        manager.get(1).await.unwrap_err(),
        WelesError::DispatchNotFound(1)
    ));
}
