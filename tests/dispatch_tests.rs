
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio_util::sync::CancellationToken;

use polar_router::config::{DedupeConfig, WorkerConfig};
use polar_router::error::RouteError;
use polar_router::geo::Coordinate;
use polar_router::mesh::{CacheLimits, MeshCatalog, MeshRegistry};
use polar_router::node::Node;
use polar_router::scheduler::{
    Dispatcher, Disposition, FailureReason, JobStatus, JobStore, MemoryWorkQueue, MeshHints, RouteRequest,
    Transition,
};

use test_harness::{
    assert_eventually, southern_mesh, southern_request, test_config, test_service, three_point_computer,
    CountingLoader,
};

#[tokio::test]
async fn test_identical_submissions_return_same_job() {
    let svc = test_service(WorkerConfig::default(), three_point_computer(Duration::ZERO));
    let node = &svc.node;

    let first = node.dispatcher.submit(southern_request()).await.unwrap();
    let second = node.dispatcher.submit(southern_request()).await.unwrap();
    assert_eq!(first, second);

    // Display names and sub-metre noise do not change the identity.
    let renamed = RouteRequest::new(Coordinate::new(-60.700001, -45.5), Coordinate::new(-54.2, -36.4))
        .with_names("Signy Island", "Grytviken");
    assert_eq!(node.dispatcher.submit(renamed).await.unwrap(), first);

    let recent = node.status.recent(Utc::now() - TimeDelta::minutes(1)).await.unwrap();
    assert_eq!(recent.len(), 1);
}

#[tokio::test]
async fn test_uncovered_region_is_rejected_without_job() {
    let svc = test_service(WorkerConfig::default(), three_point_computer(Duration::ZERO));
    let node = &svc.node;

    let request = RouteRequest::new(Coordinate::new(78.0, 15.0), Coordinate::new(80.0, 20.0));
    let err = node.dispatcher.submit(request).await.unwrap_err();
    assert!(matches!(err, RouteError::InvalidRequest(_)));
    assert!(!err.is_retryable());

    let recent = node.status.recent(Utc::now() - TimeDelta::hours(1)).await.unwrap();
    assert!(recent.is_empty());
    assert!(!node.pool.process_next("worker-0").await.unwrap());
    assert_eq!(svc.loader.calls(), 0);
}

#[tokio::test]
async fn test_departure_outside_validity_is_rejected() {
    let svc = test_service(WorkerConfig::default(), three_point_computer(Duration::ZERO));
    let request = southern_request().with_departure_time(Utc::now() + TimeDelta::days(90));
    assert!(matches!(
        svc.node.dispatcher.submit(request).await,
        Err(RouteError::InvalidRequest(_))
    ));
}

#[tokio::test]
async fn test_state_machine_history_after_completion() {
    let svc = test_service(WorkerConfig::default(), three_point_computer(Duration::ZERO));
    let node = &svc.node;
    let job_id = node.dispatcher.submit(southern_request()).await.unwrap();
    node.pool.process_next("worker-0").await.unwrap();

    let job = node.store.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.version, job.history.len() as u64);
    for pair in job.history.windows(2) {
        assert_eq!(pair[0].to, pair[1].from);
        assert!(!pair[0].to.is_terminal());
    }
    assert!(job.result.is_some() != job.error.is_some());
    assert!(job.started_at.unwrap() <= job.completed_at.unwrap());

    // Resubmitting reuses the finished route; forcing recalculation does not.
    let again = node.dispatcher.submit_with_disposition(southern_request()).await.unwrap();
    assert_eq!(again.job_id, job_id);
    assert_eq!(again.disposition, Disposition::Reused);

    let forced = node
        .dispatcher
        .submit_with_disposition(southern_request().force_recalculate())
        .await
        .unwrap();
    assert_ne!(forced.job_id, job_id);
}

#[tokio::test]
async fn test_newer_mesh_is_preferred_and_hints_override() {
    let mut newer = southern_mesh();
    newer.id = "southern-2026-10".to_string();
    newer.created = Utc::now();

    let registry = MeshRegistry::new(
        Arc::new(MeshCatalog::new(vec![southern_mesh(), newer])),
        Arc::new(CountingLoader::new(Duration::ZERO)),
        CacheLimits {
            max_entries: 2,
            max_bytes: usize::MAX,
        },
    );
    let store = Arc::new(polar_router::scheduler::MemoryJobStore::new());
    let dispatcher = Dispatcher::new(
        store.clone(),
        Arc::new(MemoryWorkQueue::new(Duration::from_secs(30))),
        registry,
        DedupeConfig::default(),
    );

    let id = dispatcher.submit(southern_request()).await.unwrap();
    assert_eq!(store.get(&id).await.unwrap().unwrap().mesh_id, "southern-2026-10");

    let hinted = southern_request().with_hints(MeshHints {
        mesh_id: Some("southern".to_string()),
        generated_after: None,
    });
    let id = dispatcher.submit(hinted).await.unwrap();
    assert_eq!(store.get(&id).await.unwrap().unwrap().mesh_id, "southern");
}

fn write_mesh_dir(dir: &Path) {
    std::fs::write(dir.join("southern.vessel.json"), br#"{"cellboxes": []}"#).unwrap();
    std::fs::write(
        dir.join("southern.meta.json"),
        serde_json::to_vec_pretty(&southern_mesh()).unwrap(),
    )
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unfinished_jobs_resume_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let meshes = dir.path().join("meshes");
    std::fs::create_dir(&meshes).unwrap();
    write_mesh_dir(&meshes);

    let mut config = test_config(WorkerConfig::default()).with_store_path(dir.path().join("jobs.json"));
    config.mesh.dir = meshes;

    let (pending_id, running_id) = {
        let node = Node::new(config.clone()).await.unwrap();
        let pending = node.dispatcher.submit(southern_request()).await.unwrap();
        let later = southern_request().with_departure_time(Utc::now() + TimeDelta::hours(3));
        let running = node.dispatcher.submit(later).await.unwrap();

        // A worker picks up the second job and the process stops before it reports.
        let start = Transition::Start {
            worker: "worker-0".to_string(),
            lease_expires_at: Utc::now() + TimeDelta::minutes(10),
        };
        assert!(node.store.update_status(&running, 0, start).await.unwrap().is_applied());
        (pending, running)
    };

    let node = Node::new(config).await.unwrap();
    let resubmitted = node.dispatcher.submit_with_disposition(southern_request()).await.unwrap();
    assert_eq!(resubmitted.job_id, pending_id);
    assert_eq!(resubmitted.disposition, Disposition::InFlight);

    let shutdown = CancellationToken::new();
    let workers = node.spawn_background(shutdown.clone());

    let store = node.store.clone();
    assert_eventually(
        || {
            let store = store.clone();
            async move {
                for id in [pending_id, running_id] {
                    match store.get(&id).await {
                        Ok(Some(job)) if job.status == JobStatus::Done => {}
                        _ => return false,
                    }
                }
                true
            }
        },
        Duration::from_secs(10),
        "jobs from before the restart should complete",
    )
    .await;

    let resumed = node.store.get(&running_id).await.unwrap().unwrap();
    assert_eq!(resumed.attempts, 2);
    assert_eq!(resumed.history[1].reason, Some(FailureReason::WorkerError));

    let again = node.dispatcher.submit_with_disposition(southern_request()).await.unwrap();
    assert_eq!(again.job_id, pending_id);
    assert_eq!(again.disposition, Disposition::Reused);

    shutdown.cancel();
    workers.await.unwrap();
}
