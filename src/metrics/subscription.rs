use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{JobStream, MetricEvent};
use crate::training::JobState;

/// Outcome of a non-blocking subscription poll.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionPoll {
    Event(MetricEvent),
    /// Nothing new yet; the job is still live.
    Pending,
    /// Every event has been delivered and the job reached this state.
    Ended(JobState),
}

/// Cursor over one job's metric stream.
///
/// The blocking [`Iterator`] implementation is meant for background threads;
/// interactive code should call [`MetricSubscription::poll`] instead.
pub struct MetricSubscription {
    stream: Arc<JobStream>,
    cursor: usize,
}

impl MetricSubscription {
    pub(super) fn new(stream: Arc<JobStream>, cursor: usize) -> Self {
        Self { stream, cursor }
    }

    pub fn poll(&mut self) -> SubscriptionPoll {
        let state = self.stream.lock();
        if let Some(event) = state.events.get(self.cursor) {
            self.cursor += 1;
            return SubscriptionPoll::Event(event.clone());
        }
        match state.terminal {
            Some(terminal) => SubscriptionPoll::Ended(terminal),
            None => SubscriptionPoll::Pending,
        }
    }

    /// Drain every event currently available without blocking.
    pub fn drain(&mut self) -> Vec<MetricEvent> {
        let state = self.stream.lock();
        let pending = state.events.get(self.cursor..).unwrap_or_default().to_vec();
        self.cursor += pending.len();
        pending
    }

    /// Block for at most `timeout` waiting for the next event.
    pub fn next_timeout(&mut self, timeout: Duration) -> SubscriptionPoll {
        let deadline = Instant::now() + timeout;
        let mut state = self.stream.lock();
        loop {
            if let Some(event) = state.events.get(self.cursor) {
                self.cursor += 1;
                return SubscriptionPoll::Event(event.clone());
            }
            if let Some(terminal) = state.terminal {
                return SubscriptionPoll::Ended(terminal);
            }
            let now = Instant::now();
            if now >= deadline {
                return SubscriptionPoll::Pending;
            }
            state = self.stream.wait_timeout(state, deadline - now);
        }
    }
}

impl Iterator for MetricSubscription {
    type Item = MetricEvent;

    fn next(&mut self) -> Option<MetricEvent> {
        let mut state = self.stream.lock();
        loop {
            if let Some(event) = state.events.get(self.cursor) {
                self.cursor += 1;
                return Some(event.clone());
            }
            if state.terminal.is_some() {
                return None;
            }
            state = self.stream.wait(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::MetricsBridge;
    use super::*;
    use crate::training::JobId;
    use std::collections::BTreeMap;

    #[test]
    fn poll_reports_pending_then_end() {
        let bridge = MetricsBridge::new();
        let job = JobId::new();
        bridge.open_stream(&job);
        let mut subscription = bridge.subscribe(&job).unwrap();
        assert_eq!(subscription.poll(), SubscriptionPoll::Pending);
        assert_eq!(
            subscription.next_timeout(Duration::from_millis(5)),
            SubscriptionPoll::Pending
        );

        bridge
            .publish(MetricEvent::new(job.clone(), 1, 1, BTreeMap::new()))
            .unwrap();
        bridge
            .publish(MetricEvent::new(job.clone(), 1, 2, BTreeMap::new()))
            .unwrap();
        assert_eq!(subscription.drain().len(), 2);
        bridge.close(&job, JobState::Completed).unwrap();
        assert_eq!(
            subscription.poll(),
            SubscriptionPoll::Ended(JobState::Completed)
        );
        assert!(subscription.next().is_none());
    }
}
