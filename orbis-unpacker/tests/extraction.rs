mod common;

use common::{
    FakePlist, FakeSource, drain, file_name, gate, package_file, progress, statuses, unpacker,
};
use orbis_unpacker::extract::{
    ERROR_PREFIX, STATUS_CANCELLED, STATUS_CANCELLING, STATUS_EXTRACTING, STATUS_SUCCEEDED,
};
use orbis_unpacker::{
    ChannelEvents, ExtractionState, Status, UnpackEvent, UnpackEvents, Unpacker,
};
use std::time::{Duration, Instant};
use tempfile::tempdir;

#[test]
fn three_files_report_thirds_then_succeed() {
    let dir = tempdir().unwrap();
    let pkg = package_file(dir.path());
    let dest = dir.path().join("out");
    let (unpacker, events) = unpacker(FakeSource::default());

    unpacker.open(&pkg).unwrap();
    drain(&events);

    assert!(unpacker.extract(&dest, false));
    let state = unpacker.wait();

    assert_eq!(
        state,
        ExtractionState {
            status: Status::Succeeded,
            progress_percent: 100,
            message: STATUS_SUCCEEDED.to_owned(),
            cancel_requested: false,
        }
    );

    let events = drain(&events);
    assert_eq!(progress(&events), [33, 66, 100]);
    assert_eq!(statuses(&events), [STATUS_EXTRACTING, STATUS_SUCCEEDED]);
    assert_eq!(
        events.last(),
        Some(&UnpackEvent::ExtractionFinished {
            success: true,
            message: STATUS_SUCCEEDED.to_owned(),
        })
    );

    for index in 0..3 {
        assert!(dest.join(file_name(index)).is_file());
    }
    assert!(pkg.exists());
}

#[test]
fn progress_is_floor_of_completed_share() {
    let dir = tempdir().unwrap();
    let pkg = package_file(dir.path());
    let (unpacker, events) = unpacker(FakeSource {
        files: 7,
        ..Default::default()
    });

    unpacker.open(&pkg).unwrap();
    unpacker.extract(dir.path().join("out"), false);
    unpacker.wait();

    let expected: Vec<u8> = (0..7).map(|i| ((i + 1) * 100 / 7) as u8).collect();
    assert_eq!(progress(&drain(&events)), expected);
    assert_eq!(expected, [14, 28, 42, 57, 71, 85, 100]);
}

#[test]
fn empty_package_succeeds_at_full_progress() {
    let dir = tempdir().unwrap();
    let pkg = package_file(dir.path());
    let (unpacker, events) = unpacker(FakeSource {
        files: 0,
        ..Default::default()
    });

    unpacker.open(&pkg).unwrap();
    drain(&events);
    unpacker.extract(dir.path().join("out"), false);
    let state = unpacker.wait();

    assert_eq!(state.status, Status::Succeeded);
    assert_eq!(state.progress_percent, 100);
    assert_eq!(progress(&drain(&events)), [100]);
}

#[test]
fn cancel_before_first_file_writes_nothing() {
    let dir = tempdir().unwrap();
    let pkg = package_file(dir.path());
    let dest = dir.path().join("out");
    let (gate, handle) = gate(None);
    let (unpacker, events) = unpacker(FakeSource {
        gate: Some(gate),
        ..Default::default()
    });

    unpacker.open(&pkg).unwrap();
    drain(&events);

    assert!(unpacker.extract(&dest, true));
    handle.wait_entered();
    unpacker.cancel();

    let state = unpacker.state();
    assert_eq!(state.status, Status::Cancelling);
    assert_eq!(state.message, STATUS_CANCELLING);
    assert!(state.cancel_requested);

    handle.release();
    let state = unpacker.wait();

    assert_eq!(state.status, Status::Cancelled);
    assert_eq!(state.progress_percent, 0);
    assert_eq!(state.message, STATUS_CANCELLED);

    let events = drain(&events);
    assert!(progress(&events).is_empty());
    assert_eq!(
        statuses(&events),
        [STATUS_EXTRACTING, STATUS_CANCELLING, STATUS_CANCELLED]
    );
    assert_eq!(
        events.last(),
        Some(&UnpackEvent::ExtractionFinished {
            success: false,
            message: STATUS_CANCELLED.to_owned(),
        })
    );

    assert_eq!(std::fs::read_dir(&dest).unwrap().count(), 0);
    assert!(pkg.exists(), "cancelled run must keep the package");
}

#[test]
fn cancel_lets_the_file_in_flight_finish() {
    let dir = tempdir().unwrap();
    let pkg = package_file(dir.path());
    let dest = dir.path().join("out");
    let (gate, handle) = gate(Some(1));
    let (unpacker, events) = unpacker(FakeSource {
        files: 4,
        gate: Some(gate),
        ..Default::default()
    });

    unpacker.open(&pkg).unwrap();
    unpacker.extract(&dest, false);
    handle.wait_entered();
    unpacker.cancel();
    handle.release();
    let state = unpacker.wait();

    assert_eq!(state.status, Status::Cancelled);
    assert_eq!(state.progress_percent, 50);
    assert_eq!(progress(&drain(&events)), [25, 50]);
    assert!(dest.join(file_name(0)).is_file());
    assert!(dest.join(file_name(1)).is_file());
    assert!(!dest.join(file_name(2)).exists());
    assert!(!dest.join(file_name(3)).exists());
}

#[test]
fn start_while_running_is_ignored() {
    let dir = tempdir().unwrap();
    let pkg = package_file(dir.path());
    let (gate, handle) = gate(None);
    let (unpacker, events) = unpacker(FakeSource {
        gate: Some(gate),
        ..Default::default()
    });

    unpacker.open(&pkg).unwrap();
    drain(&events);

    assert!(unpacker.extract(dir.path().join("a"), false));
    handle.wait_entered();

    let before = unpacker.state();
    assert_eq!(before.status, Status::Running);
    assert!(!unpacker.extract(dir.path().join("b"), false));
    assert_eq!(unpacker.state(), before);

    handle.release();
    assert_eq!(unpacker.wait().status, Status::Succeeded);

    let events = drain(&events);
    assert_eq!(statuses(&events), [STATUS_EXTRACTING, STATUS_SUCCEEDED]);
    assert!(!dir.path().join("b").exists());
}

#[test]
fn start_while_cancelling_is_ignored() {
    let dir = tempdir().unwrap();
    let pkg = package_file(dir.path());
    let (gate, handle) = gate(None);
    let (unpacker, events) = unpacker(FakeSource {
        gate: Some(gate),
        ..Default::default()
    });

    unpacker.open(&pkg).unwrap();
    drain(&events);

    assert!(unpacker.extract(dir.path().join("a"), false));
    handle.wait_entered();
    unpacker.cancel();

    let before = unpacker.state();
    assert_eq!(before.status, Status::Cancelling);
    assert!(!unpacker.extract(dir.path().join("b"), false));
    assert_eq!(unpacker.state(), before);

    handle.release();
    assert_eq!(unpacker.wait().status, Status::Cancelled);

    let events = drain(&events);
    assert_eq!(
        statuses(&events),
        [STATUS_EXTRACTING, STATUS_CANCELLING, STATUS_CANCELLED]
    );
    assert!(!dir.path().join("b").exists());
}

#[test]
fn failing_file_fails_the_run_and_keeps_earlier_files() {
    let dir = tempdir().unwrap();
    let pkg = package_file(dir.path());
    let dest = dir.path().join("out");
    let (unpacker, events) = unpacker(FakeSource {
        fail_at: Some(1),
        ..Default::default()
    });

    unpacker.open(&pkg).unwrap();
    drain(&events);
    unpacker.extract(&dest, true);
    let state = unpacker.wait();

    assert_eq!(state.status, Status::Failed);
    assert_eq!(state.progress_percent, 33);
    assert_eq!(
        state.message,
        format!("{ERROR_PREFIX}cannot extract file #1: corrupt entry")
    );

    let events = drain(&events);
    assert_eq!(progress(&events), [33]);
    assert!(matches!(
        events.last(),
        Some(UnpackEvent::ExtractionFinished { success: false, message }) if message == &state.message
    ));

    assert!(dest.join(file_name(0)).is_file());
    assert!(!dest.join(file_name(1)).exists());
    assert!(pkg.exists(), "failed run must keep the package");
}

#[test]
fn reopen_failure_leaves_destination_untouched() {
    let dir = tempdir().unwrap();
    let pkg = package_file(dir.path());
    let dest = dir.path().join("out");
    let (unpacker, _events) = unpacker(FakeSource::default());

    unpacker.open(&pkg).unwrap();
    std::fs::remove_file(&pkg).unwrap();

    unpacker.extract(&dest, false);
    let state = unpacker.wait();

    assert_eq!(state.status, Status::Failed);
    assert!(state.message.starts_with(ERROR_PREFIX));
    assert!(state.message.contains("no such package"));
    assert!(!dest.exists());
}

#[test]
fn prepare_failure_fails_the_run() {
    let dir = tempdir().unwrap();
    let pkg = package_file(dir.path());
    let (unpacker, events) = unpacker(FakeSource {
        fail_prepare: true,
        ..Default::default()
    });

    unpacker.open(&pkg).unwrap();
    drain(&events);
    unpacker.extract(dir.path().join("out"), false);
    let state = unpacker.wait();

    assert_eq!(state.status, Status::Failed);
    assert_eq!(state.message, format!("{ERROR_PREFIX}destination is read-only"));
    assert!(progress(&drain(&events)).is_empty());
}

#[test]
fn successful_run_deletes_source_when_asked() {
    let dir = tempdir().unwrap();
    let pkg = package_file(dir.path());
    let (unpacker, _events) = unpacker(FakeSource::default());

    unpacker.open(&pkg).unwrap();
    unpacker.extract(dir.path().join("out"), true);

    assert_eq!(unpacker.wait().status, Status::Succeeded);
    assert!(!pkg.exists());
}

#[test]
fn finished_run_can_be_restarted() {
    let dir = tempdir().unwrap();
    let pkg = package_file(dir.path());
    let (unpacker, events) = unpacker(FakeSource {
        fail_at: Some(0),
        ..Default::default()
    });

    unpacker.open(&pkg).unwrap();
    unpacker.extract(dir.path().join("out"), false);
    assert_eq!(unpacker.wait().status, Status::Failed);
    drain(&events);

    // Retrying is a fresh start that resets the state.
    assert!(unpacker.extract(dir.path().join("out"), false));
    let state = unpacker.wait();

    assert_eq!(state.status, Status::Failed);
    assert_eq!(statuses(&drain(&events))[0], STATUS_EXTRACTING);
}

#[test]
fn progress_resets_between_runs() {
    let dir = tempdir().unwrap();
    let pkg = package_file(dir.path());
    let (gate, handle) = gate(None);
    let (unpacker, _events) = unpacker(FakeSource {
        files: 2,
        gate: Some(gate),
        ..Default::default()
    });

    unpacker.open(&pkg).unwrap();
    unpacker.extract(dir.path().join("first"), false);
    handle.wait_entered();
    handle.release();
    assert_eq!(unpacker.wait().progress_percent, 100);

    unpacker.extract(dir.path().join("second"), false);
    handle.wait_entered();

    let state = unpacker.state();
    assert_eq!(state.status, Status::Running);
    assert_eq!(state.progress_percent, 0);
    assert_eq!(state.message, STATUS_EXTRACTING);

    handle.release();
    assert_eq!(unpacker.wait().progress_percent, 100);
}

#[test]
fn cancel_without_run_is_ignored() {
    let dir = tempdir().unwrap();
    let pkg = package_file(dir.path());
    let (unpacker, events) = unpacker(FakeSource::default());

    unpacker.open(&pkg).unwrap();
    drain(&events);
    unpacker.cancel();

    assert_eq!(unpacker.state().status, Status::Idle);
    assert!(!unpacker.state().cancel_requested);
    assert!(drain(&events).is_empty());
}

#[test]
fn extract_needs_an_open_package() {
    let dir = tempdir().unwrap();
    let (unpacker, _events) = unpacker(FakeSource::default());

    assert!(!unpacker.extract(dir.path().join("out"), false));
    assert_eq!(unpacker.state().status, Status::Idle);
}

/// Forwards to a channel, but takes its time over the final status line.
struct SlowFinish(ChannelEvents);

impl UnpackEvents for SlowFinish {
    fn progress_changed(&self, percent: u8) {
        self.0.progress_changed(percent);
    }

    fn status_changed(&self, message: &str) {
        if message == STATUS_SUCCEEDED {
            std::thread::sleep(Duration::from_millis(200));
        }

        self.0.status_changed(message);
    }

    fn extraction_finished(&self, success: bool, message: &str) {
        self.0.extraction_finished(success, message);
    }
}

#[test]
fn restart_waits_for_previous_notifications() {
    let dir = tempdir().unwrap();
    let pkg = package_file(dir.path());
    let (events, receiver) = ChannelEvents::new();
    let unpacker = Unpacker::with_readers(FakeSource::default(), FakePlist, SlowFinish(events));

    unpacker.open(&pkg).unwrap();
    drain(&receiver);
    assert!(unpacker.extract(dir.path().join("first"), false));

    // The state turns terminal before the listener hears about it.
    let deadline = Instant::now() + Duration::from_secs(10);
    while unpacker.state().status != Status::Succeeded {
        assert!(Instant::now() < deadline, "first run did not finish");
        std::thread::sleep(Duration::from_millis(1));
    }

    assert!(unpacker.extract(dir.path().join("second"), false));
    assert_eq!(unpacker.wait().status, Status::Succeeded);

    let finished = UnpackEvent::ExtractionFinished {
        success: true,
        message: STATUS_SUCCEEDED.to_owned(),
    };
    let events: Vec<_> = receiver
        .try_iter()
        .filter(|e| !matches!(e, UnpackEvent::ProgressChanged(_)))
        .collect();

    assert_eq!(
        events,
        [
            UnpackEvent::StatusChanged(STATUS_EXTRACTING.to_owned()),
            UnpackEvent::StatusChanged(STATUS_SUCCEEDED.to_owned()),
            finished.clone(),
            UnpackEvent::StatusChanged(STATUS_EXTRACTING.to_owned()),
            UnpackEvent::StatusChanged(STATUS_SUCCEEDED.to_owned()),
            finished,
        ]
    );
}
