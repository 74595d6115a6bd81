use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::control::JobControl;
use super::record::JobRecord;
use super::runner::{ActiveJobs, JobRunner};
use super::{
    JobFailure, JobHandle, JobId, JobProgress, JobState, ModelArtifact, ModelConfig,
    ModelRegistry, TrainingError,
};
use crate::config::TrainingSettings;
use crate::dataset::Dataset;
use crate::image_source::{ImageId, ImageSource};
use crate::metrics::MetricsBridge;

struct JobEntry {
    handle: JobHandle,
    control: Arc<JobControl>,
    record: JobRecord,
    worker: Option<JoinHandle<()>>,
}

/// Owns every training job and the one-active-job-per-image rule.
pub struct Orchestrator {
    settings: TrainingSettings,
    models: ModelRegistry,
    bridge: Arc<MetricsBridge>,
    jobs: Mutex<HashMap<JobId, JobEntry>>,
    active: ActiveJobs,
}

impl Orchestrator {
    pub fn new(settings: TrainingSettings, models: ModelRegistry, bridge: Arc<MetricsBridge>) -> Self {
        Self {
            settings,
            models,
            bridge,
            jobs: Mutex::new(HashMap::new()),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn bridge(&self) -> &Arc<MetricsBridge> {
        &self.bridge
    }

    /// Start training `dataset` on a new worker thread.
    ///
    /// Fails with `JobAlreadyRunning` while another job for the same image is
    /// preparing, running or paused.
    pub fn start(
        &self,
        dataset: Arc<Dataset>,
        source: Arc<dyn ImageSource>,
        model_config: ModelConfig,
        seed: u64,
    ) -> Result<JobHandle, TrainingError> {
        model_config.validate()?;
        let factory = self
            .models
            .get(&model_config.architecture)
            .ok_or_else(|| TrainingError::UnknownArchitecture(model_config.architecture.clone()))?;
        let image_id = dataset.image_id().clone();
        if source.info().id != image_id {
            return Err(TrainingError::ImageMismatch {
                dataset: image_id,
                image: source.info().id.clone(),
            });
        }

        let job_id = JobId::new();
        {
            let mut active = self.active.lock().unwrap_or_else(|err| err.into_inner());
            if let Some(running) = active.get(&image_id) {
                return Err(TrainingError::JobAlreadyRunning {
                    image_id,
                    job_id: running.clone(),
                });
            }
            active.insert(image_id.clone(), job_id.clone());
        }

        let handle = JobHandle {
            id: job_id.clone(),
            image_id: image_id.clone(),
        };
        let control = Arc::new(JobControl::new(model_config.epochs));
        let record = JobRecord::new(job_id.clone(), &dataset, model_config.clone(), seed);
        self.bridge.open_stream(&job_id);
        // Register before spawning so a fast worker cannot finish unobserved.
        self.lock_jobs().insert(
            job_id.clone(),
            JobEntry {
                handle: handle.clone(),
                control: control.clone(),
                record,
                worker: None,
            },
        );

        let runner = JobRunner {
            job_id: job_id.clone(),
            image_id: image_id.clone(),
            dataset,
            source,
            model_config,
            seed,
            settings: self.settings.clone(),
            factory,
            control,
            bridge: self.bridge.clone(),
            active: self.active.clone(),
        };
        let spawned = std::thread::Builder::new()
            .name(format!("mregion-train-{}", job_id.short()))
            .spawn(move || runner.run());
        match spawned {
            Ok(worker) => {
                if let Some(entry) = self.lock_jobs().get_mut(&job_id) {
                    entry.worker = Some(worker);
                }
                info!("Started training job {} for {}", job_id, image_id);
                Ok(handle)
            }
            Err(err) => {
                self.lock_jobs().remove(&job_id);
                self.bridge.remove(&job_id);
                self.active
                    .lock()
                    .unwrap_or_else(|err| err.into_inner())
                    .remove(&image_id);
                Err(TrainingError::Spawn(err))
            }
        }
    }

    /// Request cancellation. Idempotent; a no-op on finished jobs.
    pub fn cancel(&self, handle: &JobHandle) -> Result<(), TrainingError> {
        let control = self.control(&handle.id)?;
        if control.request_cancel() {
            info!("Cancellation requested for job {}", handle.id);
        } else {
            debug!("Cancel ignored for finished job {}", handle.id);
        }
        Ok(())
    }

    /// Pause a running job. The job reports `Paused` on return; a step
    /// already in flight runs to completion, but its events wait for `resume`.
    pub fn pause(&self, handle: &JobHandle) -> Result<(), TrainingError> {
        let control = self.control(&handle.id)?;
        control
            .request_pause()
            .map_err(|state| TrainingError::UnsupportedOperation {
                job_id: handle.id.clone(),
                operation: "pause",
                state,
            })?;
        info!("Paused job {}", handle.id);
        Ok(())
    }

    pub fn resume(&self, handle: &JobHandle) -> Result<(), TrainingError> {
        let control = self.control(&handle.id)?;
        control
            .request_resume()
            .map_err(|state| TrainingError::UnsupportedOperation {
                job_id: handle.id.clone(),
                operation: "resume",
                state,
            })?;
        info!("Resumed job {}", handle.id);
        Ok(())
    }

    pub fn state(&self, handle: &JobHandle) -> Result<JobState, TrainingError> {
        Ok(self.control(&handle.id)?.state())
    }

    pub fn progress(&self, handle: &JobHandle) -> Result<JobProgress, TrainingError> {
        Ok(self.control(&handle.id)?.progress())
    }

    /// Set when the job ended in `Failed`.
    pub fn failure(&self, handle: &JobHandle) -> Result<Option<JobFailure>, TrainingError> {
        Ok(self.control(&handle.id)?.failure())
    }

    /// Set only when the job ended in `Completed`.
    pub fn artifact(&self, handle: &JobHandle) -> Result<Option<ModelArtifact>, TrainingError> {
        Ok(self.control(&handle.id)?.artifact())
    }

    /// Block until the job is terminal. Not for the interactive thread.
    pub fn wait(&self, handle: &JobHandle) -> Result<JobState, TrainingError> {
        Ok(self.control(&handle.id)?.wait_terminal())
    }

    /// Like [`Orchestrator::wait`], giving up after `timeout`.
    pub fn wait_timeout(
        &self,
        handle: &JobHandle,
        timeout: Duration,
    ) -> Result<Option<JobState>, TrainingError> {
        Ok(self.control(&handle.id)?.wait_terminal_timeout(timeout))
    }

    /// Current record for the job, including its live state.
    pub fn record(&self, handle: &JobHandle) -> Result<JobRecord, TrainingError> {
        let jobs = self.lock_jobs();
        let entry = jobs
            .get(&handle.id)
            .ok_or_else(|| TrainingError::UnknownJob(handle.id.clone()))?;
        let progress = entry.control.progress();
        let mut record = entry.record.clone();
        record.state = progress.state;
        record.last_epoch = progress.epoch;
        record.last_step = progress.step;
        record.failure = entry.control.failure();
        record.finished_at = entry.control.finished_at();
        Ok(record)
    }

    /// The job currently holding `image_id`'s training slot.
    pub fn active_job(&self, image_id: &ImageId) -> Option<JobHandle> {
        let active = self.active.lock().unwrap_or_else(|err| err.into_inner());
        active.get(image_id).map(|job_id| JobHandle {
            id: job_id.clone(),
            image_id: image_id.clone(),
        })
    }

    pub fn jobs(&self) -> Vec<JobHandle> {
        let mut handles: Vec<JobHandle> = self
            .lock_jobs()
            .values()
            .map(|entry| entry.handle.clone())
            .collect();
        handles.sort_by(|a, b| a.id.cmp(&b.id));
        handles
    }

    /// Fail every live job reading `image_id`; returns how many were flagged.
    pub fn invalidate_image(&self, image_id: &ImageId) -> usize {
        let jobs = self.lock_jobs();
        let mut flagged = 0;
        for entry in jobs.values().filter(|entry| &entry.handle.image_id == image_id) {
            if entry.control.mark_image_removed(image_id) {
                flagged += 1;
            }
        }
        if flagged > 0 {
            warn!("Image {} removed under {} live job(s)", image_id, flagged);
        }
        flagged
    }

    /// Forget a finished job, joining its worker and dropping its metrics.
    pub fn discard(&self, handle: &JobHandle) -> Result<(), TrainingError> {
        let entry = {
            let mut jobs = self.lock_jobs();
            let entry = jobs
                .get(&handle.id)
                .ok_or_else(|| TrainingError::UnknownJob(handle.id.clone()))?;
            if !entry.control.state().is_terminal() {
                return Err(TrainingError::JobStillActive(handle.id.clone()));
            }
            jobs.remove(&handle.id)
        };
        if let Some(worker) = entry.and_then(|entry| entry.worker) {
            let _ = worker.join();
        }
        self.bridge.remove(&handle.id);
        debug!("Discarded job {}", handle.id);
        Ok(())
    }

    fn control(&self, job_id: &JobId) -> Result<Arc<JobControl>, TrainingError> {
        self.lock_jobs()
            .get(job_id)
            .map(|entry| entry.control.clone())
            .ok_or_else(|| TrainingError::UnknownJob(job_id.clone()))
    }

    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<JobId, JobEntry>> {
        self.jobs.lock().unwrap_or_else(|err| err.into_inner())
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        let mut jobs = self.lock_jobs();
        for entry in jobs.values() {
            entry.control.request_cancel();
        }
        let workers: Vec<JoinHandle<()>> = jobs
            .values_mut()
            .filter_map(|entry| entry.worker.take())
            .collect();
        drop(jobs);
        for worker in workers {
            let _ = worker.join();
        }
    }
}
