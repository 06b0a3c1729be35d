
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use weles_lite::artifacts::{ArtifactFilter, ArtifactSortKey, ArtifactStatus, ArtifactType};
use weles_lite::dryad::DryadJobStatus;
use weles_lite::error::{ErrorKind, WelesError};
use weles_lite::jobs::{JobFilter, JobSortKey, JobStatus};
use weles_lite::pagination::{Paginator, Sorter};
use weles_lite::status::StatusChange;
use weles_lite::JobId;
use test_harness::{assert_eventually, Behavior, SpecBuilder, StalledFetcher, TestNode};

/// Drain every change received so far, grouped by job.
fn drain(
    rx: &mut broadcast::Receiver<StatusChange<JobStatus>>,
) -> HashMap<JobId, Vec<JobStatus>> {
    let mut seen: HashMap<JobId, Vec<JobStatus>> = HashMap::new();
    while let Ok(change) = rx.try_recv() {
        seen.entry(change.id).or_default().push(change.status);
    }
    seen
}

#[tokio::test]
async fn test_job_ids_increase_and_start_new() {
    let node = TestNode::start_with(Behavior::Succeed, |config| {
        config.broker.acquire_timeout = Duration::from_secs(5);
    });
    let mut changes = node.jobs().subscribe();

    let mut ids = Vec::new();
    for name in ["a", "b", "c"] {
        ids.push(node.jobs().create_job(&SpecBuilder::new(name).build()).await.unwrap());
    }
    assert!(ids.windows(2).all(|w| w[0] < w[1]));

    for &id in &ids {
        node.wait_for_terminal(id).await;
    }
    let seen = drain(&mut changes);
    for id in ids {
        assert_eq!(seen[&id].first(), Some(&JobStatus::New));
    }
}

#[tokio::test]
async fn test_job_with_image_completes() {
    let node = TestNode::start(Behavior::Succeed);
    let mut changes = node.jobs().subscribe();
    let image = node.image("boot.img", b"kernel");

    let spec = SpecBuilder::new("smoke").image("boot", &image).build();
    let job_id = node.jobs().create_job(&spec).await.unwrap();
    let job = node.wait_for_status(job_id, JobStatus::Completed).await;

    assert_eq!(job.name, "smoke");
    assert_eq!(job.info, "1 test cases passed");
    assert!(job.updated >= job.created);
    assert_eq!(
        drain(&mut changes)[&job_id],
        vec![
            JobStatus::New,
            JobStatus::Parsing,
            JobStatus::Downloading,
            JobStatus::Waiting,
            JobStatus::Running,
            JobStatus::Completed,
        ]
    );

    let filter = ArtifactFilter {
        job_ids: vec![job_id],
        ..Default::default()
    };
    let artifacts = node
        .node
        .artifacts
        .list_artifacts(&filter, &Sorter::ascending(ArtifactSortKey::Id), &Paginator::default())
        .await
        .unwrap()
        .records;
    let types: Vec<ArtifactType> = artifacts.iter().map(|a| a.description.artifact_type).collect();
    assert_eq!(
        types,
        vec![ArtifactType::Yaml, ArtifactType::Image, ArtifactType::Result]
    );
    assert!(artifacts.iter().all(|a| a.status == ArtifactStatus::Ready));
    assert_eq!(
        job.artifacts,
        artifacts.iter().map(|a| a.id).collect::<Vec<_>>()
    );

    assert_eq!(std::fs::read(&artifacts[0].path).unwrap(), spec);
    assert_eq!(std::fs::read(&artifacts[1].path).unwrap(), b"kernel");
    assert_eq!(std::fs::read_to_string(&artifacts[2].path).unwrap(), "ran smoke\n");

    let dispatch = node.node.dispatcher.get(job_id).await.unwrap();
    assert_eq!(dispatch.status, DryadJobStatus::Completed);
}

#[tokio::test]
async fn test_job_without_images_skips_download() {
    let node = TestNode::start(Behavior::Succeed);
    let mut changes = node.jobs().subscribe();

    let job_id = node
        .jobs()
        .create_job(&SpecBuilder::new("bare").build())
        .await
        .unwrap();
    node.wait_for_status(job_id, JobStatus::Completed).await;

    assert_eq!(
        drain(&mut changes)[&job_id],
        vec![
            JobStatus::New,
            JobStatus::Parsing,
            JobStatus::Waiting,
            JobStatus::Running,
            JobStatus::Completed,
        ]
    );
}

#[tokio::test]
async fn test_malformed_spec_is_rejected_synchronously() {
    let node = TestNode::start(Behavior::Succeed);

    let err = node.jobs().create_job(b"job_name: [unclosed").await.unwrap_err();
    assert!(matches!(err, WelesError::MalformedSpec(_)));
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = node.jobs().create_job(b"- a\n- list\n").await.unwrap_err();
    assert!(matches!(err, WelesError::MalformedSpec(_)));

    assert!(node.jobs().jobs(&[]).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_spec_fails_job() {
    let node = TestNode::start(Behavior::Succeed);

    let spec = SpecBuilder::new("empty").no_tests().build();
    let job_id = node.jobs().create_job(&spec).await.unwrap();
    let job = node.wait_for_status(job_id, JobStatus::Failed).await;

    assert!(job.info.contains("no test cases"), "info: {}", job.info);
    assert_eq!(node.runner.prepared.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancel_completed_job_is_rejected() {
    let node = TestNode::start(Behavior::Succeed);

    let job_id = node
        .jobs()
        .create_job(&SpecBuilder::new("done").build())
        .await
        .unwrap();
    node.wait_for_status(job_id, JobStatus::Completed).await;

    let err = node.jobs().cancel_job(job_id).await.unwrap_err();
    assert!(matches!(err, WelesError::AlreadyTerminal(id) if id == job_id));
    assert_eq!(err.kind(), ErrorKind::Conflict);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        node.jobs().job(job_id).await.unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test]
async fn test_cancel_unknown_job() {
    let node = TestNode::start(Behavior::Succeed);
    let err = node.jobs().cancel_job(99).await.unwrap_err();
    assert!(matches!(err, WelesError::JobNotFound(99)));
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_cancel_running_job() {
    let node = TestNode::start(Behavior::Hang);

    let job_id = node
        .jobs()
        .create_job(&SpecBuilder::new("stuck").build())
        .await
        .unwrap();
    node.wait_for_status(job_id, JobStatus::Running).await;

    node.jobs().cancel_job(job_id).await.unwrap();
    // Repeated requests are accepted until the job is terminal.
    let _ = node.jobs().cancel_job(job_id).await;

    let job = node.wait_for_status(job_id, JobStatus::Canceled).await;
    assert_eq!(job.info, "canceled by user");

    let dispatch = node.node.dispatcher.get(job_id).await.unwrap();
    assert_eq!(dispatch.status, DryadJobStatus::Canceled);

    // The dryad is back in the pool.
    let next = node
        .jobs()
        .create_job(&SpecBuilder::new("next").build())
        .await
        .unwrap();
    node.wait_for_status(next, JobStatus::Running).await;
    node.jobs().cancel_job(next).await.unwrap();
    node.wait_for_status(next, JobStatus::Canceled).await;
}

#[tokio::test]
async fn test_cancel_job_waiting_for_dryad() {
    let node = TestNode::start_with(Behavior::Hang, |config| {
        config.broker.acquire_timeout = Duration::from_secs(30);
    });

    let busy = node
        .jobs()
        .create_job(&SpecBuilder::new("busy").build())
        .await
        .unwrap();
    node.wait_for_status(busy, JobStatus::Running).await;

    let queued = node
        .jobs()
        .create_job(&SpecBuilder::new("queued").build())
        .await
        .unwrap();
    node.wait_for_status(queued, JobStatus::Waiting).await;

    node.jobs().cancel_job(queued).await.unwrap();
    node.wait_for_status(queued, JobStatus::Canceled).await;
    assert_eq!(
        node.jobs().job(busy).await.unwrap().status,
        JobStatus::Running
    );

    node.jobs().cancel_job(busy).await.unwrap();
    node.wait_for_status(busy, JobStatus::Canceled).await;
}

#[tokio::test]
async fn test_cancel_job_while_downloading() {
    let fetcher = Arc::new(StalledFetcher::default());
    let node = TestNode::start_with_fetcher(Behavior::Succeed, fetcher.clone(), |config| {
        config.storage.max_concurrent_downloads = 2;
    });

    let spec = SpecBuilder::new("images")
        .image("boot", "http://images.invalid/boot.img")
        .image("rootfs", "http://images.invalid/rootfs.img")
        .build();
    let job_id = node.jobs().create_job(&spec).await.unwrap();
    node.wait_for_status(job_id, JobStatus::Downloading).await;
    assert_eventually(
        || {
            let fetcher = fetcher.clone();
            async move { fetcher.started.load(Ordering::SeqCst) == 2 }
        },
        Duration::from_secs(5),
        "both downloads should start",
    )
    .await;

    node.jobs().cancel_job(job_id).await.unwrap();
    let job = node.wait_for_status(job_id, JobStatus::Canceled).await;
    assert_eq!(job.info, "canceled by user");

    let filter = ArtifactFilter {
        job_ids: vec![job_id],
        ..Default::default()
    };
    let artifacts = node
        .node
        .artifacts
        .list_artifacts(&filter, &Sorter::ascending(ArtifactSortKey::Id), &Paginator::default())
        .await
        .unwrap()
        .records;
    let states: Vec<(ArtifactType, ArtifactStatus)> = artifacts
        .iter()
        .map(|a| (a.description.artifact_type, a.status))
        .collect();
    assert_eq!(
        states,
        vec![
            (ArtifactType::Yaml, ArtifactStatus::Ready),
            (ArtifactType::Image, ArtifactStatus::Failed),
            (ArtifactType::Image, ArtifactStatus::Failed),
        ]
    );
    assert_eq!(node.runner.prepared.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_image_failure_fails_job() {
    let node = TestNode::start(Behavior::Succeed);
    let good = node.image("boot.img", b"kernel");
    let missing = node.missing_image("rootfs.img");

    let spec = SpecBuilder::new("broken")
        .image("boot", &good)
        .image("rootfs", &missing)
        .build();
    let job_id = node.jobs().create_job(&spec).await.unwrap();
    let job = node.wait_for_status(job_id, JobStatus::Failed).await;

    assert!(job.info.contains("failed"), "info: {}", job.info);
    assert_eq!(node.runner.prepared.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_no_matching_dryad_fails_job() {
    let node = TestNode::start(Behavior::Succeed);

    let spec = SpecBuilder::new("x86").device_type("x86_64").build();
    let job_id = node.jobs().create_job(&spec).await.unwrap();
    let job = node.wait_for_status(job_id, JobStatus::Failed).await;

    assert!(job.info.contains("no dryad matches"), "info: {}", job.info);
}

#[tokio::test]
async fn test_failed_tests_fail_job() {
    let node = TestNode::start(Behavior::FailTests);

    let job_id = node
        .jobs()
        .create_job(&SpecBuilder::new("flaky").build())
        .await
        .unwrap();
    let job = node.wait_for_status(job_id, JobStatus::Failed).await;
    assert_eq!(job.info, "1 of 1 test cases failed");
}

#[tokio::test]
async fn test_dispatch_timeout_fails_job() {
    let node = TestNode::start(Behavior::Hang);

    let spec = SpecBuilder::new("slow").timeout(1).build();
    let job_id = node.jobs().create_job(&spec).await.unwrap();
    let job = node.wait_for_status(job_id, JobStatus::Failed).await;
    assert!(job.info.contains("timed out"), "info: {}", job.info);
}

#[tokio::test]
async fn test_registry_capacity() {
    let node = TestNode::start_with(Behavior::Succeed, |config| config.max_jobs = 2);

    node.jobs().create_job(&SpecBuilder::new("a").build()).await.unwrap();
    node.jobs().create_job(&SpecBuilder::new("b").build()).await.unwrap();
    let err = node
        .jobs()
        .create_job(&SpecBuilder::new("c").build())
        .await
        .unwrap_err();
    assert!(matches!(err, WelesError::RegistryFull(2)));
    assert_eq!(err.kind(), ErrorKind::ResourceUnavailable);
}

#[tokio::test]
async fn test_list_and_lookup_jobs() {
    let node = TestNode::start_with(Behavior::Succeed, |config| {
        config.broker.acquire_timeout = Duration::from_secs(5);
    });

    let ok = node.jobs().create_job(&SpecBuilder::new("ok").build()).await.unwrap();
    let bad = node
        .jobs()
        .create_job(&SpecBuilder::new("bad").no_tests().build())
        .await
        .unwrap();
    node.wait_for_status(ok, JobStatus::Completed).await;
    node.wait_for_status(bad, JobStatus::Failed).await;

    let failed = JobFilter {
        statuses: vec![JobStatus::Failed],
        ..Default::default()
    };
    let page = node
        .jobs()
        .list_jobs(&failed, &Sorter::ascending(JobSortKey::Id), &Paginator::default())
        .await
        .unwrap();
    assert_eq!(page.info.total_records, 1);
    assert_eq!(page.records[0].job_id, bad);

    let by_name = JobFilter {
        names: vec!["ok".to_string()],
        ..Default::default()
    };
    let page = node
        .jobs()
        .list_jobs(&by_name, &Sorter::default(), &Paginator::default())
        .await
        .unwrap();
    assert_eq!(page.records.len(), 1);
    assert_eq!(page.records[0].job_id, ok);

    let both = node.jobs().jobs(&[bad, ok]).await.unwrap();
    assert_eq!(both.iter().map(|j| j.job_id).collect::<Vec<_>>(), vec![bad, ok]);

    let err = node.jobs().jobs(&[ok, 1000]).await.unwrap_err();
    assert!(matches!(err, WelesError::JobNotFound(1000)));

    let err = node
        .jobs()
        .list_jobs(&JobFilter::default(), &Sorter::default(), &Paginator::after(1000, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, WelesError::InvalidCursor(1000)));
}
