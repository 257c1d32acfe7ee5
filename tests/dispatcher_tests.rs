//! End-to-end job lifecycle through the service and the dispatcher.


use std::io::Read;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use sitegrab::error::{AdmissionError, DownloadError, SitegrabError};
use sitegrab::scheduler::{BrowserKind, JobStatus, RequestedActions, ScreenshotFormat};
use sitegrab::worker::Backends;
use test_harness::{
    assert_eventually, origin, same_backend, GatedBackend, ScriptedBackend, TestService,
};
use tokio_util::sync::CancellationToken;

fn both_actions() -> RequestedActions {
    RequestedActions::browser_save(BrowserKind::Firefox, false)
        .with_screenshot(ScreenshotFormat::Png)
}

#[tokio::test]
async fn test_screenshot_job_end_to_end() {
    let screenshot = ScriptedBackend::succeeding("screenshot", "screenshot.png", b"PNGDATA");
    let t = TestService::new(Backends::new(
        Arc::new(ScriptedBackend::failing("browser")),
        Arc::new(screenshot.clone()),
    ));

    let id = t
        .service
        .submit(
            "https://example.com",
            origin(4),
            RequestedActions::screenshot(ScreenshotFormat::Png),
        )
        .await
        .unwrap();
    assert_eq!(t.service.get_job(&id).unwrap().status, JobStatus::Waiting);

    let second = t
        .service
        .submit(
            "https://example.org",
            origin(4),
            RequestedActions::screenshot(ScreenshotFormat::Png),
        )
        .await;
    assert!(matches!(
        second,
        Err(SitegrabError::Admission(AdmissionError::OriginBusy))
    ));

    let done = t
        .dispatcher
        .dispatch_next(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(done.id, id);
    assert_eq!(done.status, JobStatus::Done);
    assert!(!done.error);
    assert!(done.started.is_some() && done.finished.is_some());
    assert!(done.started <= done.finished);
    assert_eq!(screenshot.call_count(), 1);

    let bytes = t.service.download(&id).await.unwrap();
    let on_disk = std::fs::read(t.config.artifact_path(id)).unwrap();
    assert_eq!(bytes, on_disk, "download returns the packaged bytes");

    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
    let mut shot = Vec::new();
    archive
        .by_name("screenshot.png")
        .unwrap()
        .read_to_end(&mut shot)
        .unwrap();
    assert_eq!(shot, b"PNGDATA");

    assert!(
        !t.config.work_dir(id).exists(),
        "working directory is cleaned up"
    );
}

#[tokio::test]
async fn test_all_actions_fail_produces_no_artifact() {
    let t = TestService::new(Backends::new(
        Arc::new(ScriptedBackend::failing("browser")),
        Arc::new(ScriptedBackend::failing("screenshot")),
    ));
    let id = t
        .service
        .submit("https://example.com", origin(1), both_actions())
        .await
        .unwrap();

    let done = t
        .dispatcher
        .dispatch_next(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(done.status, JobStatus::Done);
    assert!(done.error);
    assert_eq!(done.messages.len(), 2);
    assert!(!t.config.artifact_path(id).exists());
    assert!(matches!(
        t.service.download(&id).await,
        Err(SitegrabError::Download(DownloadError::ArtifactMissing))
    ));
}

#[tokio::test]
async fn test_partial_success_is_downloadable() {
    let t = TestService::new(Backends::new(
        Arc::new(ScriptedBackend::succeeding("browser", "page.html", b"<html/>")),
        Arc::new(ScriptedBackend::failing("screenshot")),
    ));
    let id = t
        .service
        .submit("https://example.com", origin(1), both_actions())
        .await
        .unwrap();

    let done = t
        .dispatcher
        .dispatch_next(&CancellationToken::new())
        .await
        .unwrap();

    assert!(done.error);
    assert_eq!(done.messages, vec!["unable to run screenshot".to_string()]);
    assert!(t.config.artifact_path(id).exists());

    let bytes = t.service.download(&id).await.unwrap();
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
    assert_eq!(archive.len(), 1);
    assert_eq!(archive.by_index(0).unwrap().name(), "page.html");
}

#[tokio::test]
async fn test_jobs_start_in_submission_order() {
    let log = Arc::new(std::sync::Mutex::new(Vec::new()));
    let backend = ScriptedBackend::succeeding("screenshot", "s.png", b"x").with_log(log.clone());
    let t = TestService::new(same_backend(Arc::new(backend)));

    let urls = ["https://example.com", "https://example.org", "https://example.com/c"];
    let mut ids = Vec::new();
    for (i, url) in urls.iter().enumerate() {
        ids.push(
            t.service
                .submit(
                    url,
                    origin(10 + i as u8),
                    RequestedActions::screenshot(ScreenshotFormat::Png),
                )
                .await
                .unwrap(),
        );
    }

    let mut started = Vec::new();
    while let Some(done) = t.dispatcher.dispatch_next(&CancellationToken::new()).await {
        started.push(done.id);
    }
    assert_eq!(started, ids);

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 3);
    assert!(log[0].ends_with("https://example.com"));
    assert!(log[1].ends_with("https://example.org"));
    assert!(log[2].ends_with("https://example.com/c"));
}

#[tokio::test]
async fn test_dispatcher_runs_one_job_at_a_time() {
    let gate = GatedBackend::new();
    let t = TestService::new(same_backend(Arc::new(gate.clone())));
    let store = t.store.clone();

    let mut ids = Vec::new();
    for i in 0..3u8 {
        ids.push(
            t.service
                .submit(
                    "https://example.com",
                    origin(i),
                    RequestedActions::screenshot(ScreenshotFormat::Png),
                )
                .await
                .unwrap(),
        );
    }

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(t.dispatcher.clone().run(shutdown.clone()));

    for (n, id) in ids.iter().enumerate() {
        let gate_ref = gate.clone();
        assert_eventually(
            || {
                let gate = gate_ref.clone();
                async move { gate.entered() == n + 1 }
            },
            Duration::from_secs(2),
            "next job should start",
        )
        .await;

        let running: Vec<_> = store
            .snapshot()
            .into_iter()
            .filter(|j| j.status == JobStatus::Running)
            .map(|j| j.id)
            .collect();
        assert_eq!(running, vec![*id]);

        gate.release_one();
    }

    let store_ref = store.clone();
    assert_eventually(
        || {
            let store = store_ref.clone();
            async move { store.snapshot().iter().all(|j| j.is_done()) }
        },
        Duration::from_secs(2),
        "all jobs should finish",
    )
    .await;
    assert_eq!(gate.max_active.load(Ordering::SeqCst), 1);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("dispatcher should stop")
        .unwrap();
}

#[tokio::test]
async fn test_dispatcher_wakes_on_submission() {
    let backend = ScriptedBackend::succeeding("screenshot", "s.png", b"x");
    let t = TestService::new(same_backend(Arc::new(backend)));
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(t.dispatcher.clone().run(shutdown.clone()));

    // Let the dispatcher go idle before anything is submitted.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let id = t
        .service
        .submit(
            "https://example.com",
            origin(1),
            RequestedActions::screenshot(ScreenshotFormat::Png),
        )
        .await
        .unwrap();

    let service = t.service.clone();
    assert_eventually(
        || {
            let service = service.clone();
            async move {
                service
                    .get_job(&id)
                    .map(|j| j.status == JobStatus::Done)
                    .unwrap_or(false)
            }
        },
        Duration::from_secs(2),
        "submitted job should be dispatched without polling",
    )
    .await;

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_shutdown_cancels_running_capture() {
    let gate = GatedBackend::new();
    let t = TestService::new(same_backend(Arc::new(gate.clone())));
    let id = t
        .service
        .submit(
            "https://example.com",
            origin(1),
            RequestedActions::screenshot(ScreenshotFormat::Png),
        )
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(t.dispatcher.clone().run(shutdown.clone()));
    let gate_ref = gate.clone();
    assert_eventually(
        || {
            let gate = gate_ref.clone();
            async move { gate.entered() == 1 }
        },
        Duration::from_secs(2),
        "job should start",
    )
    .await;

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("dispatcher should stop")
        .unwrap();

    let job = t.service.get_job(&id).unwrap();
    assert_eq!(job.status, JobStatus::Done);
    assert!(job.error);
    assert_eq!(job.messages, vec!["gated cancelled".to_string()]);
}

#[tokio::test]
async fn test_download_rules() {
    let t = TestService::new(same_backend(Arc::new(ScriptedBackend::succeeding(
        "screenshot",
        "s.png",
        b"x",
    ))));
    let unknown = sitegrab::scheduler::JobId::new();
    assert!(matches!(
        t.service.download(&unknown).await,
        Err(SitegrabError::Download(DownloadError::NotFound))
    ));

    let id = t
        .service
        .submit(
            "https://example.com",
            origin(1),
            RequestedActions::screenshot(ScreenshotFormat::Png),
        )
        .await
        .unwrap();
    assert!(matches!(
        t.service.download(&id).await,
        Err(SitegrabError::Download(DownloadError::NotFinished))
    ));

    let done = t
        .dispatcher
        .dispatch_next(&CancellationToken::new())
        .await
        .unwrap();
    let finished = done.finished.unwrap();
    let window = chrono::Duration::seconds(t.config.finished_retention_secs as i64);

    assert!(t
        .service
        .download_at(&id, finished + window - chrono::Duration::seconds(1))
        .await
        .is_ok());
    assert!(matches!(
        t.service.download_at(&id, finished + window).await,
        Err(SitegrabError::Download(DownloadError::Expired))
    ));
    assert!(
        t.service.get_job(&id).is_ok(),
        "expiry is enforced before the sweep removes the record"
    );
}

#[tokio::test]
async fn test_queue_status_reports_counts_and_limits() {
    let gate = GatedBackend::new();
    let t = TestService::with_config(same_backend(Arc::new(gate.clone())), |c| {
        c.with_max_queue(4).with_retention(7, 90)
    });

    for i in 0..3u8 {
        t.service
            .submit(
                "https://example.com",
                origin(i),
                RequestedActions::screenshot(ScreenshotFormat::Png),
            )
            .await
            .unwrap();
    }
    let status = t.service.queue_status();
    assert_eq!(status.queue, 3);
    assert_eq!(status.waiting, 3);
    assert!(status.running.is_none());
    assert_eq!(status.max_queue, 4);
    assert_eq!(status.max_keep_failed_jobs_time, 7);
    assert_eq!(status.max_keep_finished_jobs_time, 90);

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(t.dispatcher.clone().run(shutdown.clone()));
    let gate_ref = gate.clone();
    assert_eventually(
        || {
            let gate = gate_ref.clone();
            async move { gate.entered() == 1 }
        },
        Duration::from_secs(2),
        "first job should start",
    )
    .await;

    let status = t.service.queue_status();
    assert_eq!(status.queue, 3);
    assert_eq!(status.waiting, 2);
    assert!(status.running.is_some());

    shutdown.cancel();
    handle.await.unwrap();
}
