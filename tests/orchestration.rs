use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::time::{sleep, timeout};
use xburn::adapters::{Operation, SimulatedBackend, Simulator};
use xburn::config::AppConfig;
use xburn::context::AppContext;
use xburn::core::error::BackendError;
use xburn::core::backend::EVENT_CHANNEL_CAPACITY;
use xburn::core::events::{BackendEvent, Topic};
use xburn::core::models::{BlankMode, Device, JobProgress, JobResult, JobState, MediaInfo};
use xburn::core::{BurnOptions, FileEntry, Orchestrator, OrchestratorError, Project};

fn drive(path: &str) -> Device {
    Device {
        path: path.to_string(),
        name: format!("Test Writer {path}"),
        vendor: "TEST".into(),
        model: "BD-RE".into(),
        capabilities: BTreeSet::from(["dvd+r".to_string(), "bd-r".to_string()]),
    }
}

fn media(media_type: &str, capacity: u64) -> MediaInfo {
    MediaInfo {
        media_type: media_type.into(),
        media_status: "blank".into(),
        total_capacity: capacity,
        free_space: capacity,
        ..Default::default()
    }
}

fn project() -> Project {
    Project {
        name: "Holiday photos".into(),
        volume_id: "PHOTOS".into(),
        entries: vec![FileEntry {
            source_path: "/home/user/photos".into(),
            dest_path: "/photos".into(),
            is_dir: false,
            size: 734_003_200,
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn orchestrator() -> (Arc<Orchestrator>, Simulator) {
    let (backend, sim) = SimulatedBackend::new();
    let config = AppConfig {
        status_poll_interval_secs: 0,
        ..AppConfig::default()
    };
    let orchestrator = Orchestrator::new(AppContext::new(config, Arc::new(backend)));
    orchestrator.sync().init();
    (Arc::new(orchestrator), sim)
}

/// Wait until `cond` holds, failing the test after two seconds.
async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let waited = timeout(Duration::from_secs(2), async {
        while !cond() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

/// Let the event pump drain what the simulator already sent.
async fn settle() {
    sleep(Duration::from_millis(50)).await;
}

async fn start_burn(orchestrator: &Orchestrator, device: &str) -> String {
    orchestrator
        .dispatcher()
        .start_burn(&project(), device, &BurnOptions::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn burn_progresses_and_completes() {
    let (orchestrator, sim) = orchestrator();

    let id = start_burn(&orchestrator, "/dev/sr0").await;
    assert_eq!(id, "job-1");
    assert_eq!(orchestrator.current_job().unwrap().state, JobState::Preparing);

    sim.progress(
        &id,
        JobProgress {
            phase: "burning".into(),
            percent: 50.0,
            bytes_written: 367_001_600,
            bytes_total: 734_003_200,
            ..Default::default()
        },
    );
    eventually("burning at 50%", || {
        orchestrator
            .current_job()
            .is_some_and(|j| j.state == JobState::Burning && j.progress.percent == 50.0)
    })
    .await;

    sim.complete(&id, "Burn completed successfully");
    eventually("completion", || {
        orchestrator
            .current_job()
            .is_some_and(|j| j.state == JobState::Complete)
    })
    .await;

    let job = orchestrator.current_job().unwrap();
    assert!(job.finished_at.is_some());
    assert!(job.result.unwrap().success);
    assert!(!orchestrator.tracker().is_busy());
}

#[tokio::test]
async fn rejected_blank_becomes_an_error_job() {
    let (orchestrator, sim) = orchestrator();
    sim.fail_next(
        Operation::BlankDisc,
        BackendError::Rejected("medium is not erasable".into()),
    );

    let err = orchestrator
        .dispatcher()
        .blank_disc("/dev/sr1", BlankMode::Full)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::CommandRejected(_)));

    let job = orchestrator.current_job().unwrap();
    assert_eq!(job.state, JobState::Error);
    assert_eq!(job.device_path, "/dev/sr1");
    assert!(job.finished_at.is_some());
    assert!(!job.result.unwrap().success);
    assert!(
        orchestrator
            .log_lines()
            .iter()
            .any(|l| l.text.contains("medium is not erasable"))
    );

    // A failed start does not block the next one.
    assert!(
        orchestrator
            .dispatcher()
            .blank_disc("/dev/sr1", BlankMode::Fast)
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn media_change_on_another_drive_is_ignored() {
    let (orchestrator, sim) = orchestrator();
    orchestrator.registry().select_device("/dev/sr1").await;
    let fetched = sim.count(Operation::GetMediaInfo);

    sim.emit(BackendEvent::media_changed("/dev/sr0"));
    sleep(Duration::from_millis(100)).await;
    assert_eq!(sim.count(Operation::GetMediaInfo), fetched);

    sim.insert_media("/dev/sr1", media("BD-R", 25_025_314_816));
    eventually("media refresh of the selected drive", || {
        orchestrator
            .registry()
            .media_info()
            .is_some_and(|m| m.media_type == "BD-R")
    })
    .await;
    assert_eq!(sim.count(Operation::GetMediaInfo), fetched + 1);
}

#[tokio::test]
async fn eject_while_busy_is_refused_before_the_backend() {
    let (orchestrator, sim) = orchestrator();
    sim.insert_media("/dev/sr0", media("DVD+R", 4_700_372_992));
    orchestrator.registry().select_device("/dev/sr0").await;
    assert!(orchestrator.registry().media_info().is_some());

    start_burn(&orchestrator, "/dev/sr0").await;
    let err = orchestrator
        .dispatcher()
        .eject_disc("/dev/sr0")
        .await
        .unwrap_err();

    assert_eq!(
        err,
        OrchestratorError::DeviceBusy {
            device: "/dev/sr0".into()
        }
    );
    assert_eq!(sim.count(Operation::EjectDisc), 0);
    assert!(orchestrator.registry().media_info().is_some());
}

#[tokio::test]
async fn eject_of_another_drive_is_allowed_during_a_burn() {
    let (orchestrator, sim) = orchestrator();
    sim.insert_media("/dev/sr1", media("CD-R", 737_280_000));
    start_burn(&orchestrator, "/dev/sr0").await;

    orchestrator.dispatcher().eject_disc("/dev/sr1").await.unwrap();
    assert_eq!(sim.count(Operation::EjectDisc), 1);
}

#[tokio::test]
async fn stale_media_fetch_is_discarded() {
    let (orchestrator, sim) = orchestrator();
    sim.insert_media("/dev/sr0", media("DVD+R", 4_700_372_992));
    sim.insert_media("/dev/sr1", media("BD-R", 25_025_314_816));
    settle().await;

    sim.delay_next(Operation::GetMediaInfo, Duration::from_millis(300));
    let slow = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.registry().select_device("/dev/sr0").await })
    };
    eventually("the slow fetch to start", || {
        sim.count(Operation::GetMediaInfo) == 1
    })
    .await;

    sim.delay_next(Operation::GetMediaInfo, Duration::from_millis(100));
    let fast = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.registry().select_device("/dev/sr1").await })
    };
    sleep(Duration::from_millis(20)).await;
    assert!(orchestrator.registry().media_info().is_none());

    fast.await.unwrap();
    slow.await.unwrap();

    let registry = orchestrator.registry();
    assert_eq!(registry.current_device().as_deref(), Some("/dev/sr1"));
    assert_eq!(registry.media_info().unwrap().media_type, "BD-R");
}

#[tokio::test]
async fn cancel_without_a_job_makes_no_backend_call() {
    let (orchestrator, sim) = orchestrator();
    orchestrator.dispatcher().cancel_burn().await.unwrap();
    assert_eq!(sim.count(Operation::CancelBurn), 0);
}

#[tokio::test]
async fn cancel_waits_for_the_backend_to_confirm() {
    let (orchestrator, sim) = orchestrator();
    sim.set_auto_cancel(false);
    let id = start_burn(&orchestrator, "/dev/sr0").await;

    orchestrator.dispatcher().cancel_burn().await.unwrap();
    let job = orchestrator.current_job().unwrap();
    assert!(job.cancel_requested);
    assert!(job.is_busy());

    // A second request while one is pending is not forwarded.
    orchestrator.dispatcher().cancel_burn().await.unwrap();
    assert_eq!(sim.count(Operation::CancelBurn), 1);

    sim.emit(BackendEvent::state_changed(id, JobState::Cancelled));
    eventually("cancellation", || {
        orchestrator
            .current_job()
            .is_some_and(|j| j.state == JobState::Cancelled)
    })
    .await;
    assert!(
        orchestrator
            .log_lines()
            .iter()
            .any(|l| l.text == "Burn cancelled.")
    );
}

#[tokio::test]
async fn init_twice_delivers_events_once() {
    let (orchestrator, sim) = orchestrator();
    assert!(!orchestrator.sync().init());

    let id = start_burn(&orchestrator, "/dev/sr0").await;
    sim.log(&id, "Writing track 1");
    eventually("the log line", || !orchestrator.log_lines().is_empty()).await;
    settle().await;

    let matching = orchestrator
        .log_lines()
        .into_iter()
        .filter(|l| l.text == "Writing track 1")
        .count();
    assert_eq!(matching, 1);
}

#[tokio::test]
async fn repeated_terminal_events_change_nothing() {
    let (orchestrator, sim) = orchestrator();
    let id = start_burn(&orchestrator, "/dev/sr0").await;

    sim.emit(BackendEvent::error(id.clone(), "write error at block 1024"));
    eventually("the error", || {
        orchestrator
            .current_job()
            .is_some_and(|j| j.state == JobState::Error)
    })
    .await;
    let first = orchestrator.current_job().unwrap();

    sleep(Duration::from_millis(20)).await;
    sim.emit(BackendEvent::error(id.clone(), "write error at block 1024"));
    sim.emit(BackendEvent::complete(
        id.clone(),
        JobResult::succeeded("late"),
    ));
    sleep(Duration::from_millis(100)).await;

    let job = orchestrator.current_job().unwrap();
    assert_eq!(job.state, JobState::Error);
    assert_eq!(job.finished_at, first.finished_at);
    let errors = orchestrator
        .log_lines()
        .into_iter()
        .filter(|l| l.text.starts_with("ERROR:"))
        .count();
    assert_eq!(errors, 1);
}

#[tokio::test]
async fn rendered_percent_never_goes_backwards() {
    let (orchestrator, sim) = orchestrator();
    let id = start_burn(&orchestrator, "/dev/sr0").await;
    let mut job_rx = orchestrator.subscribe_job();

    let mut seen = Vec::new();
    for percent in [5.0, 12.5, 12.5, 40.0, 99.0] {
        sim.emit(BackendEvent::progress(
            id.clone(),
            JobProgress {
                phase: "burning".into(),
                percent,
                bytes_total: 734_003_200,
                ..Default::default()
            },
        ));
        eventually("the progress update", || {
            orchestrator
                .current_job()
                .is_some_and(|j| j.progress.percent == percent)
        })
        .await;
        if job_rx.has_changed().unwrap_or(false) {
            if let Some(job) = job_rx.borrow_and_update().as_ref() {
                seen.push(job.progress.percent);
            }
        }
    }

    assert!(!seen.is_empty());
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
}

#[tokio::test]
async fn events_for_a_superseded_job_are_discarded() {
    let (orchestrator, sim) = orchestrator();
    let old = start_burn(&orchestrator, "/dev/sr0").await;
    sim.complete(&old, "done");
    eventually("the first job to finish", || !orchestrator.tracker().is_busy()).await;

    let new = start_burn(&orchestrator, "/dev/sr0").await;
    assert_ne!(old, new);

    sim.emit(BackendEvent::error(old, "late failure of the old job"));
    sleep(Duration::from_millis(100)).await;

    let job = orchestrator.current_job().unwrap();
    assert_eq!(job.id, new);
    assert!(job.is_busy());
}

#[tokio::test]
async fn legacy_jobs_follow_events_without_ids() {
    let (orchestrator, sim) = orchestrator();
    sim.set_assign_ids(false);

    let local = orchestrator
        .dispatcher()
        .blank_disc("/dev/sr0", BlankMode::Fast)
        .await
        .unwrap();
    assert!(local.starts_with("blank-"));

    let backend_id = sim.active_job().unwrap();
    sim.complete(&backend_id, "Disc blanked");
    eventually("the legacy job to complete", || {
        orchestrator
            .current_job()
            .is_some_and(|j| j.id == local && j.state == JobState::Complete)
    })
    .await;

    // Local ids are never polled.
    orchestrator.fetch_job_status().await.unwrap();
    assert_eq!(sim.count(Operation::GetJobStatus), 0);
}

#[tokio::test]
async fn forgotten_job_resets_on_poll() {
    let (orchestrator, sim) = orchestrator();
    let id = start_burn(&orchestrator, "/dev/sr0").await;
    sim.forget_job(&id);

    let job = orchestrator.fetch_job_status().await.unwrap();
    assert!(job.is_none());
    assert!(orchestrator.current_job().is_none());
    assert_eq!(sim.count(Operation::GetJobStatus), 1);
}

#[tokio::test]
async fn unavailable_status_poll_keeps_the_job() {
    let (orchestrator, sim) = orchestrator();
    start_burn(&orchestrator, "/dev/sr0").await;
    sim.fail_next(
        Operation::GetJobStatus,
        BackendError::Unavailable("service restarting".into()),
    );

    let err = orchestrator.fetch_job_status().await.unwrap_err();
    assert!(matches!(err, OrchestratorError::BackendUnavailable(_)));
    assert!(orchestrator.current_job().unwrap().is_busy());
}

#[tokio::test]
async fn device_list_updates_select_the_first_drive() {
    let (orchestrator, sim) = orchestrator();
    sim.insert_media("/dev/sr0", media("DVD+R", 4_700_372_992));

    sim.add_device(drive("/dev/sr0"));
    eventually("auto-selection with media", || {
        orchestrator.registry().current_device().as_deref() == Some("/dev/sr0")
            && orchestrator.registry().media_info().is_some()
    })
    .await;

    // A later drive does not steal the selection.
    sim.add_device(drive("/dev/sr1"));
    eventually("the second drive", || orchestrator.registry().devices().len() == 2).await;
    assert_eq!(
        orchestrator.registry().current_device().as_deref(),
        Some("/dev/sr0")
    );
}

#[tokio::test]
async fn failed_listing_keeps_the_previous_drives() {
    let (orchestrator, sim) = orchestrator();
    sim.add_device(drive("/dev/sr0"));
    orchestrator.registry().list_devices().await.unwrap();

    sim.fail_next(
        Operation::ListDevices,
        BackendError::Unavailable("udev not running".into()),
    );
    let err = orchestrator.registry().list_devices().await.unwrap_err();
    assert!(matches!(err, OrchestratorError::BackendUnavailable(_)));
    assert_eq!(orchestrator.registry().devices().len(), 1);
    assert!(!orchestrator.registry().is_loading());
}

#[tokio::test]
async fn finished_job_refreshes_media_of_the_selected_drive() {
    let (orchestrator, sim) = orchestrator();
    sim.insert_media("/dev/sr0", media("DVD+R", 4_700_372_992));
    settle().await;
    orchestrator.registry().select_device("/dev/sr0").await;
    let fetched = sim.count(Operation::GetMediaInfo);

    let id = start_burn(&orchestrator, "/dev/sr0").await;
    sim.complete(&id, "done");

    eventually("a media refresh", || {
        sim.count(Operation::GetMediaInfo) > fetched
    })
    .await;
}

#[tokio::test]
async fn start_and_shutdown() {
    let (backend, sim) = SimulatedBackend::new();
    sim.add_device(drive("/dev/sr0"));
    let orchestrator = Orchestrator::new(AppContext::new(
        AppConfig::default(),
        Arc::new(backend),
    ));

    orchestrator.start().await;
    assert!(orchestrator.sync().is_running());
    assert_eq!(
        orchestrator.registry().current_device().as_deref(),
        Some("/dev/sr0")
    );

    orchestrator.shutdown().await;
    assert!(!orchestrator.sync().is_running());
}

#[tokio::test]
async fn subscribers_only_see_applied_events() {
    let (orchestrator, sim) = orchestrator();
    let errors = Arc::new(AtomicUsize::new(0));
    let media_changes = Arc::new(AtomicUsize::new(0));

    let counter = errors.clone();
    orchestrator
        .sync()
        .subscriptions()
        .subscribe(Topic::JobError, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    let counter = media_changes.clone();
    orchestrator
        .sync()
        .subscriptions()
        .subscribe(Topic::DeviceMediaChanged, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

    let id = start_burn(&orchestrator, "/dev/sr0").await;
    sim.emit(BackendEvent::error(id.clone(), "write error at block 4096"));
    sim.emit(BackendEvent::error(id.clone(), "write error at block 4096"));
    sim.emit(BackendEvent::error("job-unrelated", "other drive failed"));
    // Nothing is selected, so this drive's media is of no interest.
    sim.emit(BackendEvent::media_changed("/dev/sr1"));

    eventually("the error", || {
        orchestrator
            .current_job()
            .is_some_and(|j| j.state == JobState::Error)
    })
    .await;
    settle().await;

    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(media_changes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn lagged_push_channel_is_reconciled_by_polling() {
    let (orchestrator, sim) = orchestrator();
    sim.add_device(drive("/dev/sr0"));
    sim.insert_media("/dev/sr0", media("DVD+R", 4_700_372_992));
    eventually("the selected drive", || {
        orchestrator.registry().media_info().is_some()
    })
    .await;
    settle().await;

    let id = start_burn(&orchestrator, "/dev/sr0").await;
    let listings = sim.count(Operation::ListDevices);
    let media_fetches = sim.count(Operation::GetMediaInfo);

    // The completion is never pushed, and the pump cannot run while the
    // channel overflows.
    assert!(sim.complete_silently(&id, "Burn completed successfully"));
    for n in 0..EVENT_CHANNEL_CAPACITY + 44 {
        sim.emit(BackendEvent::log_line(id.clone(), format!("line {n}"), None));
    }

    eventually("the reconciled job", || {
        orchestrator
            .current_job()
            .is_some_and(|j| j.state == JobState::Complete)
    })
    .await;
    assert!(sim.count(Operation::GetJobStatus) >= 1);
    eventually("the drive state to be pulled again", || {
        sim.count(Operation::ListDevices) > listings
            && sim.count(Operation::GetMediaInfo) > media_fetches
    })
    .await;
}

#[tokio::test]
async fn status_poll_completes_a_job_whose_event_was_lost() {
    let (orchestrator, sim) = orchestrator();
    sim.insert_media("/dev/sr0", media("DVD+R", 4_700_372_992));
    settle().await;
    orchestrator.registry().select_device("/dev/sr0").await;
    let fetched = sim.count(Operation::GetMediaInfo);

    let id = start_burn(&orchestrator, "/dev/sr0").await;
    assert!(sim.complete_silently(&id, "Burn completed successfully"));
    settle().await;
    assert!(orchestrator.current_job().unwrap().is_busy());

    let job = orchestrator.fetch_job_status().await.unwrap().unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.state, JobState::Complete);
    assert!(job.finished_at.is_some());
    assert!(job.result.unwrap().success);

    eventually("a media refresh", || {
        sim.count(Operation::GetMediaInfo) > fetched
    })
    .await;
}
