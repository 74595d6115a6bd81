//! In-process facade the presentation layer drives.
//!
//! A [`Session`] owns the opened images, the annotation store, the training
//! orchestrator and the metrics bridge. Every method returns promptly:
//! training runs on worker threads and metrics are read through snapshots or
//! subscriptions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::annotations::{
    AnnotationDocument, AnnotationError, AnnotationSnapshot, AnnotationStore, AreaReport,
    Geometry, ImportSummary, Region, RegionId, ReportError, ScaleInfo, area_report,
};
use crate::config::PipelineSettings;
use crate::dataset::{Dataset, DatasetBuilder, DatasetError, SamplingPolicy};
use crate::image_source::{ImageError, ImageId, ImageInfo, ImageSource, open_image};
use crate::metrics::{MetricHistory, MetricSubscription, MetricsBridge, MetricsError};
use crate::training::{
    JobFailure, JobHandle, JobProgress, JobRecord, JobState, ModelArtifact, ModelConfig,
    ModelRegistry, Orchestrator, RecordError, TrainingError, save_record,
    save_record_to_jobs_dir,
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Image {0} is not open")]
    ImageNotOpen(ImageId),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error(transparent)]
    Annotation(#[from] AnnotationError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Training(#[from] TrainingError),
    #[error(transparent)]
    Metrics(#[from] MetricsError),
    #[error(transparent)]
    Record(#[from] RecordError),
}

pub struct Session {
    settings: PipelineSettings,
    images: RwLock<HashMap<ImageId, Arc<dyn ImageSource>>>,
    store: AnnotationStore,
    bridge: Arc<MetricsBridge>,
    orchestrator: Orchestrator,
}

impl Session {
    pub fn new(settings: PipelineSettings) -> Self {
        Self::with_models(settings, ModelRegistry::default())
    }

    pub fn with_models(settings: PipelineSettings, models: ModelRegistry) -> Self {
        let bridge = Arc::new(MetricsBridge::new());
        let orchestrator = Orchestrator::new(settings.training.clone(), models, bridge.clone());
        Self {
            settings,
            images: RwLock::new(HashMap::new()),
            store: AnnotationStore::new(),
            bridge,
            orchestrator,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn store(&self) -> &AnnotationStore {
        &self.store
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Open an image file or tiled pyramid directory. Re-opening is a no-op.
    pub fn open_image(&self, locator: impl AsRef<Path>) -> Result<ImageInfo, SessionError> {
        let source = open_image(locator)?;
        Ok(self.attach_source(source))
    }

    /// Register an already constructed source (custom adapters, tests).
    pub fn attach_source(&self, source: Arc<dyn ImageSource>) -> ImageInfo {
        let info = source.info().clone();
        let mut images = self.images.write().unwrap_or_else(|err| err.into_inner());
        if let Some(existing) = images.get(&info.id) {
            return existing.info().clone();
        }
        self.store.register_image(&info.id);
        images.insert(info.id.clone(), source);
        info!(
            "Opened {} ({}x{}, {} levels)",
            info.id,
            info.width,
            info.height,
            info.level_count()
        );
        info
    }

    /// Close an image, dropping its regions and failing any job still reading it.
    pub fn close_image(&self, image_id: &ImageId) -> Result<usize, SessionError> {
        self.images
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .remove(image_id)
            .ok_or_else(|| SessionError::ImageNotOpen(image_id.clone()))?;
        self.orchestrator.invalidate_image(image_id);
        let removed = self.store.remove_image(image_id)?;
        info!("Closed {} ({} regions dropped)", image_id, removed);
        Ok(removed)
    }

    pub fn image(&self, image_id: &ImageId) -> Result<Arc<dyn ImageSource>, SessionError> {
        self.images
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .get(image_id)
            .cloned()
            .ok_or_else(|| SessionError::ImageNotOpen(image_id.clone()))
    }

    pub fn add_region(
        &self,
        image_id: &ImageId,
        geometry: Geometry,
        label: &str,
    ) -> Result<Arc<Region>, SessionError> {
        Ok(self.store.add_region(image_id, geometry, label)?)
    }

    pub fn update_region(
        &self,
        id: RegionId,
        geometry: Option<Geometry>,
        label: Option<&str>,
    ) -> Result<Arc<Region>, SessionError> {
        Ok(self.store.update_region(id, geometry, label)?)
    }

    pub fn delete_region(&self, id: RegionId) -> Result<(), SessionError> {
        Ok(self.store.delete_region(id)?)
    }

    pub fn set_boundary(
        &self,
        image_id: &ImageId,
        boundary: Option<Geometry>,
    ) -> Result<(), SessionError> {
        Ok(self.store.set_boundary(image_id, boundary)?)
    }

    pub fn set_scale(&self, image_id: &ImageId, scale: Option<ScaleInfo>) -> Result<(), SessionError> {
        Ok(self.store.set_scale(image_id, scale)?)
    }

    pub fn snapshot(&self, image_id: &ImageId) -> Result<AnnotationSnapshot, SessionError> {
        Ok(self.store.snapshot(image_id)?)
    }

    pub fn build_dataset(
        &self,
        snapshot: &AnnotationSnapshot,
        seed: u64,
        split_ratio: f64,
        policy: &SamplingPolicy,
    ) -> Result<Arc<Dataset>, SessionError> {
        let source = self.image(snapshot.image_id())?;
        let dataset = DatasetBuilder::new(source.info()).build(snapshot, seed, split_ratio, policy)?;
        Ok(Arc::new(dataset))
    }

    /// Snapshot the image now and build with the configured seed, split and policy.
    pub fn build_default_dataset(&self, image_id: &ImageId) -> Result<Arc<Dataset>, SessionError> {
        let snapshot = self.snapshot(image_id)?;
        self.build_dataset(
            &snapshot,
            self.settings.dataset.seed,
            self.settings.dataset.split_ratio,
            &self.settings.sampling,
        )
    }

    pub fn start_training(
        &self,
        dataset: Arc<Dataset>,
        model_config: ModelConfig,
        seed: u64,
    ) -> Result<JobHandle, SessionError> {
        let source = self.image(dataset.image_id())?;
        Ok(self.orchestrator.start(dataset, source, model_config, seed)?)
    }

    /// Train with the configured model and the dataset's own seed.
    pub fn start_default_training(&self, dataset: Arc<Dataset>) -> Result<JobHandle, SessionError> {
        let seed = dataset.seed();
        self.start_training(dataset, self.settings.model.clone(), seed)
    }

    pub fn cancel(&self, job: &JobHandle) -> Result<(), SessionError> {
        Ok(self.orchestrator.cancel(job)?)
    }

    pub fn pause(&self, job: &JobHandle) -> Result<(), SessionError> {
        Ok(self.orchestrator.pause(job)?)
    }

    pub fn resume(&self, job: &JobHandle) -> Result<(), SessionError> {
        Ok(self.orchestrator.resume(job)?)
    }

    pub fn job_state(&self, job: &JobHandle) -> Result<JobState, SessionError> {
        Ok(self.orchestrator.state(job)?)
    }

    pub fn job_progress(&self, job: &JobHandle) -> Result<JobProgress, SessionError> {
        Ok(self.orchestrator.progress(job)?)
    }

    /// Block until the job is terminal. Not for the interactive thread.
    pub fn wait(&self, job: &JobHandle) -> Result<JobState, SessionError> {
        Ok(self.orchestrator.wait(job)?)
    }

    pub fn wait_timeout(
        &self,
        job: &JobHandle,
        timeout: Duration,
    ) -> Result<Option<JobState>, SessionError> {
        Ok(self.orchestrator.wait_timeout(job, timeout)?)
    }

    pub fn job_failure(&self, job: &JobHandle) -> Result<Option<JobFailure>, SessionError> {
        Ok(self.orchestrator.failure(job)?)
    }

    pub fn artifact(&self, job: &JobHandle) -> Result<Option<ModelArtifact>, SessionError> {
        Ok(self.orchestrator.artifact(job)?)
    }

    pub fn discard_job(&self, job: &JobHandle) -> Result<(), SessionError> {
        Ok(self.orchestrator.discard(job)?)
    }

    pub fn subscribe(&self, job: &JobHandle) -> Result<MetricSubscription, SessionError> {
        Ok(self.bridge.subscribe(&job.id)?)
    }

    pub fn subscribe_with_history(
        &self,
        job: &JobHandle,
    ) -> Result<MetricSubscription, SessionError> {
        Ok(self.bridge.subscribe_with_history(&job.id)?)
    }

    pub fn history(&self, job: &JobHandle) -> Result<MetricHistory, SessionError> {
        Ok(self.bridge.history(&job.id)?)
    }

    pub fn job_record(&self, job: &JobHandle) -> Result<JobRecord, SessionError> {
        Ok(self.orchestrator.record(job)?)
    }

    /// Persist the job record, under `<app root>/jobs` when `dir` is `None`.
    pub fn save_job_record(
        &self,
        job: &JobHandle,
        dir: Option<&Path>,
    ) -> Result<PathBuf, SessionError> {
        let record = self.job_record(job)?;
        let path = match dir {
            Some(dir) => save_record(dir, &record)?,
            None => save_record_to_jobs_dir(&record)?,
        };
        Ok(path)
    }

    pub fn import_annotations(
        &self,
        image_id: &ImageId,
        path: &Path,
    ) -> Result<ImportSummary, SessionError> {
        self.image(image_id)?;
        let document = AnnotationDocument::load(path)?;
        let summary = self.store.import_document(image_id, &document)?;
        info!(
            "Imported {} regions into {} from {} ({} skipped)",
            summary.regions_added,
            image_id,
            path.display(),
            summary.regions_skipped
        );
        Ok(summary)
    }

    pub fn export_annotations(&self, image_id: &ImageId, path: &Path) -> Result<(), SessionError> {
        let source = self.image(image_id)?;
        let snapshot = self.snapshot(image_id)?;
        AnnotationDocument::from_snapshot(&snapshot, Some(source.info())).save(path)?;
        Ok(())
    }

    pub fn area_report(&self, image_id: &ImageId) -> Result<AreaReport, SessionError> {
        let source = self.image(image_id)?;
        let snapshot = self.snapshot(image_id)?;
        let info = source.info();
        Ok(area_report(&snapshot, info.width, info.height)?)
    }
}
