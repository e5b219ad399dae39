
use std::sync::Arc;
use std::time::Duration;

use polar_router::config::WorkerConfig;
use polar_router::scheduler::{
    FailureReason, JobError, JobStatus, Transition, TransitionOutcome, WorkItem,
};
use polar_router::worker::{ComputeError, Route};
use tokio_util::sync::CancellationToken;

use test_harness::{assert_eventually, southern_request, test_service, three_point_computer};

fn fast_workers() -> WorkerConfig {
    WorkerConfig::default()
        .with_workers(2)
        .with_max_attempts(3)
        .with_timeouts(Duration::from_secs(5), Duration::from_secs(10))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_job_runs_to_done_with_route() {
    let svc = test_service(fast_workers(), three_point_computer(Duration::from_millis(500)));
    let node = &svc.node;
    let job_id = node.dispatcher.submit(southern_request()).await.unwrap();
    assert_eq!(node.status.get_status(&job_id).await.unwrap().status, JobStatus::Pending);

    let shutdown = CancellationToken::new();
    let workers = node.spawn_background(shutdown.clone());

    let mut observed = vec![JobStatus::Pending];
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        let status = node.status.get_status(&job_id).await.unwrap().status;
        if observed.last() != Some(&status) {
            observed.push(status);
        }
        if status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(observed, vec![JobStatus::Pending, JobStatus::Running, JobStatus::Done]);

    let view = node.status.get_status(&job_id).await.unwrap();
    let route = view.result.expect("done job carries a route");
    assert_eq!(route.waypoints.len(), 3);
    assert_eq!(route.mesh_id, "southern");
    assert!(view.error.is_none());
    assert_eq!(view.attempts, 1);

    shutdown.cancel();
    workers.await.unwrap();
}

#[tokio::test]
async fn test_timeout_retries_then_fails_with_timeout() {
    let workers = WorkerConfig::default()
        .with_max_attempts(3)
        .with_timeouts(Duration::from_millis(50), Duration::from_secs(10));
    let svc = test_service(workers, three_point_computer(Duration::from_millis(300)));
    let node = &svc.node;
    let job_id = node.dispatcher.submit(southern_request()).await.unwrap();

    for _ in 0..3 {
        assert!(node.pool.process_next("worker-0").await.unwrap());
    }
    assert!(!node.pool.process_next("worker-0").await.unwrap());

    let job = node.store.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 3);
    assert_eq!(job.error.as_ref().unwrap().reason, FailureReason::Timeout);
    assert!(job.result.is_none());

    let requeues = job
        .history
        .iter()
        .filter(|r| r.to == JobStatus::Pending)
        .count();
    assert_eq!(requeues, 2);
    assert_eq!(svc.loader.calls(), 1);
}

#[tokio::test]
async fn test_crashed_worker_job_is_reclaimed_after_deadline() {
    let workers = WorkerConfig::default()
        .with_max_attempts(3)
        .with_timeouts(Duration::from_millis(100), Duration::from_millis(200));
    let svc = test_service(workers, three_point_computer(Duration::from_millis(10)));
    let node = &svc.node;
    let job_id = node.dispatcher.submit(southern_request()).await.unwrap();

    // A worker claims and starts the job, then dies without reporting.
    let delivery = node.queue.claim("doomed").await.unwrap().unwrap();
    let start = Transition::Start {
        worker: "doomed".to_string(),
        lease_expires_at: delivery.deadline,
    };
    assert!(node.store.update_status(&job_id, 0, start).await.unwrap().is_applied());

    // Nothing is visible until the deadline passes.
    assert!(!node.pool.process_next("survivor").await.unwrap());
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(node.pool.process_next("survivor").await.unwrap());

    let job = node.store.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.attempts, 2);
    let path: Vec<(JobStatus, JobStatus)> = job.history.iter().map(|r| (r.from, r.to)).collect();
    assert_eq!(
        path,
        vec![
            (JobStatus::Pending, JobStatus::Running),
            (JobStatus::Running, JobStatus::Pending),
            (JobStatus::Pending, JobStatus::Running),
            (JobStatus::Running, JobStatus::Done),
        ]
    );
    assert_eq!(job.history[1].reason, Some(FailureReason::WorkerError));
}

#[tokio::test]
async fn test_stale_report_does_not_alter_finished_job() {
    let svc = test_service(fast_workers(), three_point_computer(Duration::from_millis(10)));
    let node = &svc.node;
    let job_id = node.dispatcher.submit(southern_request()).await.unwrap();
    node.pool.process_next("worker-0").await.unwrap();

    let done = node.store.get(&job_id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Done);

    // A late report from the first attempt, at the version it last saw.
    let late = Transition::Fail {
        error: JobError::new(FailureReason::Timeout, "late timeout"),
    };
    match node.store.update_status(&job_id, 1, late).await.unwrap() {
        TransitionOutcome::Rejected { current } => assert_eq!(current.status, JobStatus::Done),
        TransitionOutcome::Applied(_) => panic!("stale report was applied"),
    }

    // Even at the current version, nothing leaves a terminal state.
    let route = done.result.clone().unwrap();
    let outcome = node
        .store
        .update_status(&job_id, done.version, Transition::Complete { route })
        .await
        .unwrap();
    assert!(!outcome.is_applied());

    let after = node.store.get(&job_id).await.unwrap().unwrap();
    assert_eq!(after.version, done.version);
    assert_eq!(after.result, done.result);
    assert!(after.error.is_none());
}

#[tokio::test]
async fn test_duplicate_delivery_runs_job_once() {
    let svc = test_service(fast_workers(), three_point_computer(Duration::from_millis(10)));
    let node = &svc.node;
    let job_id = node.dispatcher.submit(southern_request()).await.unwrap();
    node.queue.enqueue(WorkItem::new(job_id)).await.unwrap();

    assert!(node.pool.process_next("a").await.unwrap());
    assert!(node.pool.process_next("b").await.unwrap());

    let job = node.store.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.attempts, 1);
    let stats = node.pool.stats();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.duplicates, 1);
}

#[tokio::test]
async fn test_infeasible_route_is_not_retried() {
    let computer = Arc::new(|_: &polar_router::mesh::MeshData, _: &polar_router::scheduler::RouteRequest| -> Result<Route, ComputeError> {
        Err(ComputeError::NoFeasibleRoute("pack ice".to_string()))
    });
    let svc = test_service(fast_workers(), computer);
    let node = &svc.node;
    let job_id = node.dispatcher.submit(southern_request()).await.unwrap();

    node.pool.process_next("worker-0").await.unwrap();
    assert!(!node.pool.process_next("worker-0").await.unwrap());

    let view = node.status.get_status(&job_id).await.unwrap();
    assert_eq!(view.status, JobStatus::Failed);
    assert_eq!(view.attempts, 1);
    let error = view.error.unwrap();
    assert_eq!(error.category, "ComputationFailure");
    assert_eq!(error.reason, FailureReason::NoFeasibleRoute);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_jobs_share_one_mesh_load() {
    let svc = test_service(fast_workers().with_workers(4), three_point_computer(Duration::from_millis(20)));
    let node = &svc.node;

    let mut ids = Vec::new();
    for i in 0..8 {
        let request = southern_request().with_departure_time(chrono::Utc::now() + chrono::TimeDelta::hours(i));
        ids.push(node.dispatcher.submit(request).await.unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 8);

    let shutdown = CancellationToken::new();
    let workers = node.spawn_background(shutdown.clone());

    let store = node.store.clone();
    let watched = ids.clone();
    assert_eventually(
        || {
            let store = store.clone();
            let watched = watched.clone();
            async move {
                for id in &watched {
                    match store.get(id).await {
                        Ok(Some(job)) if job.status == JobStatus::Done => {}
                        _ => return false,
                    }
                }
                true
            }
        },
        Duration::from_secs(10),
        "all jobs should complete",
    )
    .await;

    assert_eq!(svc.loader.calls(), 1);
    shutdown.cancel();
    workers.await.unwrap();
}
