//! Metrics/analysis bridge: per-job append-only metric history with live
//! subscriptions.
//!
//! Training workers publish into the bridge; analysis views read it through
//! [`MetricsBridge::history`] or follow it through [`MetricSubscription`].
//! Every event ever published for a job is kept, so a view that attaches late
//! still sees the full trajectory.

mod history;
mod subscription;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::training::{JobId, JobState};

pub use history::{MetricHistory, Objective};
pub use subscription::{MetricSubscription, SubscriptionPoll};

/// One timestamped set of scalar measurements for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEvent {
    pub job_id: JobId,
    /// 1-based epoch the measurement belongs to.
    pub epoch: u32,
    /// Optimizer steps completed when the measurement was taken.
    pub step: u64,
    pub emitted_at_ms: i64,
    pub values: BTreeMap<String, f64>,
}

impl MetricEvent {
    pub fn new(job_id: JobId, epoch: u32, step: u64, values: BTreeMap<String, f64>) -> Self {
        Self {
            job_id,
            epoch,
            step,
            emitted_at_ms: crate::annotations::now_ms(),
            values,
        }
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn position(&self) -> (u32, u64) {
        (self.epoch, self.step)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetricsError {
    #[error("No metric stream for job {0}")]
    UnknownJob(JobId),
    #[error("Metric stream for job {0} is closed")]
    StreamClosed(JobId),
    #[error("Event {next:?} does not follow {previous:?} for job {job_id}")]
    OutOfOrder {
        job_id: JobId,
        previous: (u32, u64),
        next: (u32, u64),
    },
}

#[derive(Debug, Default)]
pub(crate) struct StreamState {
    pub(crate) events: Vec<MetricEvent>,
    pub(crate) terminal: Option<JobState>,
}

#[derive(Debug, Default)]
pub(crate) struct JobStream {
    state: Mutex<StreamState>,
    changed: Condvar,
}

impl JobStream {
    pub(crate) fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub(crate) fn wait<'a>(
        &self,
        guard: MutexGuard<'a, StreamState>,
    ) -> MutexGuard<'a, StreamState> {
        self.changed
            .wait(guard)
            .unwrap_or_else(|err| err.into_inner())
    }

    pub(crate) fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a, StreamState>,
        timeout: std::time::Duration,
    ) -> MutexGuard<'a, StreamState> {
        match self.changed.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(err) => err.into_inner().0,
        }
    }
}

/// Registry of metric streams keyed by job.
#[derive(Default)]
pub struct MetricsBridge {
    streams: RwLock<HashMap<JobId, Arc<JobStream>>>,
}

impl MetricsBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty stream for a job. Re-opening an existing stream is a no-op.
    pub fn open_stream(&self, job_id: &JobId) {
        let mut streams = self.streams.write().unwrap_or_else(|err| err.into_inner());
        streams.entry(job_id.clone()).or_default();
    }

    /// Append an event. Rejected once the stream is closed or when the
    /// event's `(epoch, step)` does not strictly follow the previous one.
    pub fn publish(&self, event: MetricEvent) -> Result<(), MetricsError> {
        let stream = self.stream(&event.job_id)?;
        let mut state = stream.lock();
        if state.terminal.is_some() {
            return Err(MetricsError::StreamClosed(event.job_id));
        }
        if let Some(previous) = state.events.last() {
            if event.position() <= previous.position() {
                return Err(MetricsError::OutOfOrder {
                    job_id: event.job_id.clone(),
                    previous: previous.position(),
                    next: event.position(),
                });
            }
        }
        state.events.push(event);
        drop(state);
        stream.changed.notify_all();
        Ok(())
    }

    /// Mark the stream finished with the job's terminal state.
    pub fn close(&self, job_id: &JobId, terminal: JobState) -> Result<(), MetricsError> {
        let stream = self.stream(job_id)?;
        let mut state = stream.lock();
        if state.terminal.is_none() {
            state.terminal = Some(terminal);
            debug!(
                "Closed metric stream for {} as {:?} after {} events",
                job_id,
                terminal,
                state.events.len()
            );
        }
        drop(state);
        stream.changed.notify_all();
        Ok(())
    }

    /// Follow events published after this call until the job ends.
    pub fn subscribe(&self, job_id: &JobId) -> Result<MetricSubscription, MetricsError> {
        let stream = self.stream(job_id)?;
        let cursor = stream.lock().events.len();
        Ok(MetricSubscription::new(stream, cursor))
    }

    /// Replay everything published so far, then follow until the job ends.
    pub fn subscribe_with_history(
        &self,
        job_id: &JobId,
    ) -> Result<MetricSubscription, MetricsError> {
        Ok(MetricSubscription::new(self.stream(job_id)?, 0))
    }

    /// Every event published so far, in emission order.
    pub fn history(&self, job_id: &JobId) -> Result<MetricHistory, MetricsError> {
        let stream = self.stream(job_id)?;
        let events = stream.lock().events.clone();
        Ok(MetricHistory::new(events))
    }

    pub fn terminal(&self, job_id: &JobId) -> Result<Option<JobState>, MetricsError> {
        Ok(self.stream(job_id)?.lock().terminal)
    }

    /// Forget a job's stream. Live subscriptions keep their own handle.
    pub fn remove(&self, job_id: &JobId) {
        self.streams
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .remove(job_id);
    }

    fn stream(&self, job_id: &JobId) -> Result<Arc<JobStream>, MetricsError> {
        self.streams
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .get(job_id)
            .cloned()
            .ok_or_else(|| MetricsError::UnknownJob(job_id.clone()))
    }
}
