use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{JobFailure, JobProgress, JobState, ModelArtifact, TrainingError};
use crate::image_source::ImageId;

/// Why a worker stopped before finishing.
pub(super) enum Stop {
    Cancelled,
    Failed(TrainingError),
}

impl Stop {
    pub(super) fn model(err: super::ModelError) -> Self {
        Stop::Failed(TrainingError::Model(err))
    }
}

struct ControlState {
    state: JobState,
    cancel_requested: bool,
    pause_requested: bool,
    image_removed: Option<ImageId>,
    epoch: u32,
    step: u64,
    failure: Option<JobFailure>,
    artifact: Option<ModelArtifact>,
    finished_at: Option<String>,
}

/// State shared between the orchestrator (requests) and the worker (checkpoints).
pub(super) struct JobControl {
    inner: Mutex<ControlState>,
    changed: Condvar,
    planned_epochs: u32,
}

impl JobControl {
    pub(super) fn new(planned_epochs: u32) -> Self {
        Self {
            inner: Mutex::new(ControlState {
                state: JobState::Preparing,
                cancel_requested: false,
                pause_requested: false,
                image_removed: None,
                epoch: 0,
                step: 0,
                failure: None,
                artifact: None,
                finished_at: None,
            }),
            changed: Condvar::new(),
            planned_epochs,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, ControlState>) -> MutexGuard<'a, ControlState> {
        self.changed
            .wait(guard)
            .unwrap_or_else(|err| err.into_inner())
    }

    pub(super) fn state(&self) -> JobState {
        self.lock().state
    }

    pub(super) fn progress(&self) -> JobProgress {
        let inner = self.lock();
        JobProgress {
            state: inner.state,
            epoch: inner.epoch,
            step: inner.step,
            planned_epochs: self.planned_epochs,
        }
    }

    pub(super) fn failure(&self) -> Option<JobFailure> {
        self.lock().failure.clone()
    }

    pub(super) fn artifact(&self) -> Option<ModelArtifact> {
        self.lock().artifact.clone()
    }

    pub(super) fn finished_at(&self) -> Option<String> {
        self.lock().finished_at.clone()
    }

    /// Returns `false` when the job already ended.
    pub(super) fn request_cancel(&self) -> bool {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return false;
        }
        inner.cancel_requested = true;
        drop(inner);
        self.changed.notify_all();
        true
    }

    /// Reports `Paused` at once. The worker finishes its current step, then
    /// parks at the next checkpoint or publish, whichever comes first.
    pub(super) fn request_pause(&self) -> Result<(), JobState> {
        let mut inner = self.lock();
        match inner.state {
            JobState::Paused => Ok(()),
            JobState::Running if !inner.cancel_requested => {
                inner.pause_requested = true;
                inner.state = JobState::Paused;
                drop(inner);
                self.changed.notify_all();
                Ok(())
            }
            other => Err(other),
        }
    }

    pub(super) fn request_resume(&self) -> Result<(), JobState> {
        let mut inner = self.lock();
        match inner.state {
            JobState::Running => Ok(()),
            JobState::Paused => {
                inner.pause_requested = false;
                inner.state = JobState::Running;
                drop(inner);
                self.changed.notify_all();
                Ok(())
            }
            other => Err(other),
        }
    }

    /// Returns `false` when the job already ended.
    pub(super) fn mark_image_removed(&self, image_id: &ImageId) -> bool {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return false;
        }
        inner.image_removed = Some(image_id.clone());
        drop(inner);
        self.changed.notify_all();
        true
    }

    /// Worker-side gate: blocks while paused, fails once cancelled or invalidated.
    pub(super) fn checkpoint(&self) -> Result<(), Stop> {
        let mut inner = self.lock();
        loop {
            Self::check_live(&inner)?;
            if !inner.pause_requested {
                return Ok(());
            }
            inner = self.wait(inner);
        }
    }

    pub(super) fn begin_running(&self) -> Result<(), Stop> {
        let mut inner = self.lock();
        Self::check_live(&inner)?;
        inner.state = JobState::Running;
        drop(inner);
        self.changed.notify_all();
        Ok(())
    }

    pub(super) fn set_position(&self, epoch: u32, step: u64) {
        let mut inner = self.lock();
        inner.epoch = epoch;
        inner.step = step;
    }

    /// Run `publish` only while the job is live, waiting out a pause first.
    /// Holding the lock across the call means nothing is published once
    /// `request_cancel` or `request_pause` has returned.
    pub(super) fn publish_if_live(
        &self,
        publish: impl FnOnce() -> Result<(), Stop>,
    ) -> Result<(), Stop> {
        let mut inner = self.lock();
        loop {
            Self::check_live(&inner)?;
            if !inner.pause_requested {
                return publish();
            }
            inner = self.wait(inner);
        }
    }

    pub(super) fn finish(
        &self,
        state: JobState,
        failure: Option<JobFailure>,
        artifact: Option<ModelArtifact>,
    ) {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return;
        }
        inner.state = state;
        inner.failure = failure;
        inner.artifact = artifact;
        inner.finished_at = Some(super::record::timestamp_now());
        inner.pause_requested = false;
        drop(inner);
        self.changed.notify_all();
    }

    pub(super) fn wait_terminal(&self) -> JobState {
        let mut inner = self.lock();
        while !inner.state.is_terminal() {
            inner = self.wait(inner);
        }
        inner.state
    }

    pub(super) fn wait_terminal_timeout(&self, timeout: Duration) -> Option<JobState> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        while !inner.state.is_terminal() {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            inner = match self.changed.wait_timeout(inner, deadline - now) {
                Ok((guard, _)) => guard,
                Err(err) => err.into_inner().0,
            };
        }
        Some(inner.state)
    }

    fn check_live(inner: &ControlState) -> Result<(), Stop> {
        if inner.cancel_requested {
            return Err(Stop::Cancelled);
        }
        if let Some(image_id) = &inner.image_removed {
            return Err(Stop::Failed(TrainingError::ImageRemoved(image_id.clone())));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn pause_blocks_checkpoint_until_resume() {
        let control = Arc::new(JobControl::new(3));
        assert_eq!(control.request_pause(), Err(JobState::Preparing));
        assert!(control.begin_running().is_ok());
        control.request_pause().unwrap();
        assert_eq!(control.state(), JobState::Paused);

        let worker = {
            let control = control.clone();
            thread::spawn(move || control.checkpoint().is_ok())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!worker.is_finished());
        control.request_resume().unwrap();
        assert!(worker.join().unwrap());
        assert_eq!(control.state(), JobState::Running);
    }

    #[test]
    fn cancel_wakes_paused_worker_and_blocks_publishing() {
        let control = Arc::new(JobControl::new(1));
        control.begin_running().ok();
        control.request_pause().unwrap();
        let worker = {
            let control = control.clone();
            thread::spawn(move || matches!(control.checkpoint(), Err(Stop::Cancelled)))
        };
        assert!(control.request_cancel());
        assert!(worker.join().unwrap());

        let mut published = false;
        assert!(
            control
                .publish_if_live(|| {
                    published = true;
                    Ok(())
                })
                .is_err()
        );
        assert!(!published);

        control.finish(JobState::Cancelled, None, None);
        assert_eq!(control.wait_terminal(), JobState::Cancelled);
        assert!(!control.request_cancel());
        assert_eq!(control.request_resume(), Err(JobState::Cancelled));
    }

    #[test]
    fn paused_job_publishes_nothing_until_resume() {
        let control = Arc::new(JobControl::new(2));
        control.begin_running().ok();
        control.request_pause().unwrap();

        let (sent, received) = std::sync::mpsc::channel();
        let worker = {
            let control = control.clone();
            thread::spawn(move || {
                control.publish_if_live(|| {
                    sent.send(()).ok();
                    Ok(())
                })
            })
        };
        assert!(received.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(control.state(), JobState::Paused);

        control.request_resume().unwrap();
        assert!(received.recv_timeout(Duration::from_secs(10)).is_ok());
        assert!(worker.join().unwrap().is_ok());
    }

    #[test]
    fn image_removal_fails_checkpoints() {
        let control = JobControl::new(1);
        assert!(control.mark_image_removed(&ImageId::new("slide")));
        assert!(matches!(
            control.checkpoint(),
            Err(Stop::Failed(TrainingError::ImageRemoved(_)))
        ));
        assert_eq!(
            control.wait_terminal_timeout(Duration::from_millis(5)),
            None
        );
    }
}
