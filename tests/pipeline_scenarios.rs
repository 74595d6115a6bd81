mod support;

use std::collections::BTreeSet;
use std::time::Duration;

use mregion::config::PipelineSettings;
use mregion::dataset::{DatasetError, SamplingPolicy};
use mregion::image_source::ImageId;
use mregion::training::{FailureKind, JobState};
use mregion::{Session, SessionError};
use support::images::{in_memory_source, square};
use support::models::{gated_config, gated_registry};

const WAIT: Duration = Duration::from_secs(10);

fn policy() -> SamplingPolicy {
    SamplingPolicy {
        crop_size: 8,
        ..SamplingPolicy::default()
    }
}

/// Three regions labelled a, a, b on a 128x64 striped image.
fn three_region_session(session: &Session) -> ImageId {
    let info = session.attach_source(in_memory_source("slide", 128, 64));
    session.add_region(&info.id, square(8.0, 8.0, 10.0), "a").unwrap();
    session.add_region(&info.id, square(30.0, 30.0, 10.0), "a").unwrap();
    session.add_region(&info.id, square(90.0, 20.0, 10.0), "b").unwrap();
    info.id
}

fn validation_members(session: &Session, image: &ImageId, seed: u64) -> BTreeSet<u64> {
    let snapshot = session.snapshot(image).unwrap();
    let dataset = session.build_dataset(&snapshot, seed, 0.8, &policy()).unwrap();
    dataset
        .validation()
        .iter()
        .map(|sample| sample.region_id.0)
        .collect()
}

#[test]
fn seeded_split_is_reproducible_and_seed_dependent() {
    let session = Session::new(PipelineSettings::default());
    let image = three_region_session(&session);
    let snapshot = session.snapshot(&image).unwrap();

    let first = session.build_dataset(&snapshot, 1337, 0.8, &policy()).unwrap();
    assert_eq!(first.len(), 3);
    assert_eq!(first.train().len(), 2);
    assert_eq!(first.validation().len(), 1);
    assert_eq!(first.classes(), ["a".to_string(), "b".to_string()]);

    let again = session.build_dataset(&snapshot, 1337, 0.8, &policy()).unwrap();
    assert_eq!(first.train(), again.train());
    assert_eq!(first.validation(), again.validation());
    assert_eq!(first.fingerprint(), again.fingerprint());

    let other = session.build_dataset(&snapshot, 7, 0.8, &policy()).unwrap();
    assert_eq!(other.train().len(), 2);
    assert_ne!(first.fingerprint(), other.fingerprint());
    let other_again = session.build_dataset(&snapshot, 7, 0.8, &policy()).unwrap();
    assert_eq!(other.validation(), other_again.validation());

    let memberships: BTreeSet<BTreeSet<u64>> = (0..32)
        .map(|seed| validation_members(&session, &image, seed))
        .collect();
    assert!(memberships.len() >= 2, "seed never changed the split");
}

#[test]
fn cancelled_job_keeps_exactly_the_events_it_published() {
    let (models, gate) = gated_registry(3);
    let session = Session::with_models(PipelineSettings::default(), models);
    let image = three_region_session(&session);
    let snapshot = session.snapshot(&image).unwrap();
    let dataset = session.build_dataset(&snapshot, 1337, 0.8, &policy()).unwrap();

    let job = session
        .start_training(dataset, gated_config(10), 1337)
        .unwrap();
    let live = session.subscribe_with_history(&job).unwrap();
    let received: Vec<_> = live.take(2).collect();
    assert_eq!(
        received
            .iter()
            .map(|event| event.epoch)
            .collect::<Vec<_>>(),
        vec![1, 2]
    );

    assert_eq!(gate.reached.recv_timeout(WAIT).unwrap(), 3);
    session.cancel(&job).unwrap();
    gate.release.send(()).unwrap();
    assert_eq!(
        session.wait_timeout(&job, WAIT).unwrap(),
        Some(JobState::Cancelled)
    );

    let history = session.history(&job).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history.events()[1].epoch, 2);
    assert!(session.subscribe(&job).unwrap().next().is_none());
    assert!(session.artifact(&job).unwrap().is_none());
    assert_eq!(session.job_progress(&job).unwrap().planned_epochs, 10);
}

#[test]
fn empty_snapshot_builds_nothing_and_leaves_the_store_alone() {
    let session = Session::new(PipelineSettings::default());
    let info = session.attach_source(in_memory_source("blank", 64, 64));
    let snapshot = session.snapshot(&info.id).unwrap();
    assert!(snapshot.is_empty());

    let err = session
        .build_dataset(&snapshot, 1337, 0.8, &policy())
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::Dataset(DatasetError::EmptyAnnotationSet)
    ));

    let after = session.snapshot(&info.id).unwrap();
    assert_eq!(after.version(), snapshot.version());
    assert!(after.is_empty());
}

#[test]
fn edits_during_training_do_not_reach_the_running_job() {
    let (models, gate) = gated_registry(1);
    let session = Session::with_models(PipelineSettings::default(), models);
    let image = three_region_session(&session);
    let snapshot = session.snapshot(&image).unwrap();
    let dataset = session.build_dataset(&snapshot, 1337, 0.8, &policy()).unwrap();
    let train_before = dataset.train().to_vec();

    let job = session
        .start_training(dataset.clone(), gated_config(2), 1337)
        .unwrap();
    gate.reached.recv_timeout(WAIT).unwrap();

    let first = snapshot.regions().next().unwrap().id;
    session.delete_region(first).unwrap();
    session.add_region(&image, square(60.0, 40.0, 12.0), "c").unwrap();
    assert!(session.snapshot(&image).unwrap().version() > snapshot.version());

    gate.release.send(()).unwrap();
    assert_eq!(
        session.wait_timeout(&job, WAIT).unwrap(),
        Some(JobState::Completed)
    );
    assert_eq!(dataset.train(), train_before.as_slice());
    let record = session.job_record(&job).unwrap();
    assert_eq!(record.snapshot_version, snapshot.version());
    assert_eq!(record.classes, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(record.dataset_fingerprint, dataset.fingerprint());
}

#[test]
fn closing_the_image_fails_its_live_job() {
    let (models, gate) = gated_registry(1);
    let session = Session::with_models(PipelineSettings::default(), models);
    let image = three_region_session(&session);
    let snapshot = session.snapshot(&image).unwrap();
    let dataset = session.build_dataset(&snapshot, 1337, 0.8, &policy()).unwrap();

    let job = session
        .start_training(dataset, gated_config(3), 1337)
        .unwrap();
    gate.reached.recv_timeout(WAIT).unwrap();

    assert_eq!(session.close_image(&image).unwrap(), 3);
    gate.release.send(()).unwrap();
    assert_eq!(
        session.wait_timeout(&job, WAIT).unwrap(),
        Some(JobState::Failed)
    );
    let failure = session.job_failure(&job).unwrap().unwrap();
    assert_eq!(failure.kind, FailureKind::ImageRemoved);
    assert!(session.orchestrator().active_job(&image).is_none());
    assert!(matches!(
        session.snapshot(&image),
        Err(SessionError::Annotation(_))
    ));
}

#[test]
fn second_job_on_the_same_image_is_rejected_until_the_first_ends() {
    let (models, gate) = gated_registry(1);
    let session = Session::with_models(PipelineSettings::default(), models);
    let image = three_region_session(&session);
    let snapshot = session.snapshot(&image).unwrap();
    let dataset = session.build_dataset(&snapshot, 1337, 0.8, &policy()).unwrap();

    let first = session
        .start_training(dataset.clone(), gated_config(1), 1)
        .unwrap();
    gate.reached.recv_timeout(WAIT).unwrap();
    let err = session
        .start_training(dataset.clone(), gated_config(1), 2)
        .unwrap_err();
    assert!(err.to_string().contains(first.id.as_str()));

    gate.release.send(()).unwrap();
    assert_eq!(
        session.wait_timeout(&first, WAIT).unwrap(),
        Some(JobState::Completed)
    );
    let second = session.start_training(dataset, gated_config(1), 2).unwrap();
    assert_eq!(
        session.wait_timeout(&second, WAIT).unwrap(),
        Some(JobState::Completed)
    );
    assert_ne!(first.id, second.id);
}
