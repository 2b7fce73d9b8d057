use std::collections::BTreeSet;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;
use xburn::adapters::{Operation, SimulatedBackend};
use xburn::core::DiscBackend;
use xburn::core::error::BackendError;
use xburn::core::events::{BackendEvent, Topic};
use xburn::core::models::{BlankMode, Device, FormatMode, JobState, MediaInfo};
use xburn::core::{BurnOptions, Project};

async fn next_event(rx: &mut broadcast::Receiver<BackendEvent>) -> BackendEvent {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timeout waiting for event")
        .expect("channel closed")
}

fn drive(path: &str) -> Device {
    Device {
        path: path.to_string(),
        name: "Test Writer".into(),
        vendor: "TEST".into(),
        model: "DVD-RW".into(),
        capabilities: BTreeSet::from(["dvd-r".to_string()]),
    }
}

#[tokio::test]
async fn device_changes_are_pushed() {
    let (backend, sim) = SimulatedBackend::new();
    let mut rx = backend.subscribe();

    sim.add_device(drive("/dev/sr0"));
    match next_event(&mut rx).await {
        BackendEvent::DeviceListUpdated(payload) => {
            assert_eq!(payload.devices.len(), 1);
            assert_eq!(payload.devices[0].path, "/dev/sr0");
        }
        other => panic!("expected a device list, got {other:?}"),
    }

    sim.insert_media("/dev/sr0", MediaInfo::default());
    let event = next_event(&mut rx).await;
    assert_eq!(event.topic(), Topic::DeviceMediaChanged);

    sim.remove_device("/dev/sr0");
    match next_event(&mut rx).await {
        BackendEvent::DeviceListUpdated(payload) => assert!(payload.devices.is_empty()),
        other => panic!("expected a device list, got {other:?}"),
    }
    assert!(backend.list_devices().await.unwrap().is_empty());
}

#[tokio::test]
async fn only_one_job_runs_at_a_time() {
    let (backend, sim) = SimulatedBackend::new();
    let project = Project::default();
    let options = BurnOptions::default();

    let id = backend
        .start_burn(&project, "/dev/sr0", &options)
        .await
        .unwrap();
    let refused = backend.blank_disc("/dev/sr1", BlankMode::Fast).await;
    assert!(matches!(refused, Err(BackendError::Rejected(_))));

    assert!(sim.complete(&id, "done"));
    assert!(
        backend
            .format_disc("/dev/sr1", FormatMode::Fast)
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn job_lifecycle_events_carry_the_id() {
    let (backend, sim) = SimulatedBackend::new();
    let mut rx = backend.subscribe();
    let id = backend
        .blank_disc("/dev/sr0", BlankMode::Full)
        .await
        .unwrap()
        .unwrap();

    assert!(sim.log(&id, "Blanking started"));
    let event = next_event(&mut rx).await;
    assert_eq!(event.topic(), Topic::JobLogLine);
    assert_eq!(event.job_id(), Some(id.as_str()));

    assert!(sim.fail(&id, "drive reported a write error"));
    match next_event(&mut rx).await {
        BackendEvent::JobError(payload) => {
            assert_eq!(payload.job_id.as_deref(), Some(id.as_str()));
            assert_eq!(payload.error, "drive reported a write error");
        }
        other => panic!("expected an error event, got {other:?}"),
    }
    // The finished operation changed the disc.
    assert_eq!(next_event(&mut rx).await.topic(), Topic::DeviceMediaChanged);

    // A finished job does not finish twice.
    assert!(!sim.complete(&id, "late"));
    let job = backend.get_job_status(&id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Error);
}

#[tokio::test]
async fn cancel_is_confirmed_by_an_event() {
    let (backend, _sim) = SimulatedBackend::new();
    let mut rx = backend.subscribe();
    let id = backend
        .start_burn(&Project::default(), "/dev/sr0", &BurnOptions::default())
        .await
        .unwrap();

    backend.cancel_burn(&id).await.unwrap();
    match next_event(&mut rx).await {
        BackendEvent::JobStateChanged(payload) => {
            assert_eq!(payload.job_id.as_deref(), Some(id.as_str()));
            assert_eq!(payload.state, JobState::Cancelled);
        }
        other => panic!("expected a state change, got {other:?}"),
    }

    assert_eq!(
        backend.cancel_burn("job-99").await,
        Err(BackendError::JobNotFound("job-99".into()))
    );
}

#[tokio::test]
async fn injected_failures_and_call_log() {
    let (backend, sim) = SimulatedBackend::new();
    sim.fail_next(
        Operation::GetMediaInfo,
        BackendError::Unavailable("bus reset".into()),
    );

    assert!(backend.get_media_info("/dev/sr0").await.is_err());
    let media = backend.get_media_info("/dev/sr0").await.unwrap();
    assert_eq!(media.media_type, "none");

    backend.eject_disc("/dev/sr0").await.unwrap();
    assert_eq!(
        sim.calls(),
        vec![
            Operation::GetMediaInfo,
            Operation::GetMediaInfo,
            Operation::EjectDisc
        ]
    );
}
