use serde::{Deserialize, Serialize};

use super::MetricEvent;

/// Direction in which a scalar improves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    Minimize,
    Maximize,
}

/// Point-in-time copy of a job's events, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricHistory {
    events: Vec<MetricEvent>,
}

impl MetricHistory {
    pub fn new(events: Vec<MetricEvent>) -> Self {
        Self { events }
    }

    pub fn events(&self) -> &[MetricEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn into_events(self) -> Vec<MetricEvent> {
        self.events
    }

    /// `(epoch, step, value)` for every event carrying `name`.
    pub fn series(&self, name: &str) -> Vec<(u32, u64, f64)> {
        self.events
            .iter()
            .filter_map(|event| event.value(name).map(|value| (event.epoch, event.step, value)))
            .collect()
    }

    pub fn latest(&self, name: &str) -> Option<&MetricEvent> {
        self.events
            .iter()
            .rev()
            .find(|event| event.values.contains_key(name))
    }

    /// Event with the best finite value of `name`; ties keep the earliest.
    pub fn best(&self, name: &str, objective: Objective) -> Option<&MetricEvent> {
        let mut best: Option<(&MetricEvent, f64)> = None;
        for event in &self.events {
            let Some(value) = event.value(name).filter(|value| value.is_finite()) else {
                continue;
            };
            let better = match best {
                None => true,
                Some((_, current)) => match objective {
                    Objective::Minimize => value < current,
                    Objective::Maximize => value > current,
                },
            };
            if better {
                best = Some((event, value));
            }
        }
        best.map(|(event, _)| event)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::JobId;
    use std::collections::BTreeMap;

    fn history() -> MetricHistory {
        let job = JobId::new();
        let rows = [
            (1, 10, 0.9, Some(0.5)),
            (1, 15, 0.8, None),
            (2, 20, 0.6, Some(0.75)),
            (3, 30, 0.65, Some(0.75)),
        ];
        MetricHistory::new(
            rows.into_iter()
                .map(|(epoch, step, loss, accuracy)| {
                    let mut values = BTreeMap::from([("train_loss".to_string(), loss)]);
                    if let Some(accuracy) = accuracy {
                        values.insert("val_accuracy".to_string(), accuracy);
                    }
                    MetricEvent::new(job.clone(), epoch, step, values)
                })
                .collect(),
        )
    }

    #[test]
    fn series_and_latest_skip_missing_values() {
        let history = history();
        assert_eq!(
            history.series("val_accuracy"),
            vec![(1, 10, 0.5), (2, 20, 0.75), (3, 30, 0.75)]
        );
        assert_eq!(history.latest("train_loss").map(|e| e.step), Some(30));
        assert!(history.latest("val_loss").is_none());
    }

    #[test]
    fn best_respects_objective_and_keeps_first_tie() {
        let history = history();
        assert_eq!(
            history.best("train_loss", Objective::Minimize).map(|e| e.step),
            Some(20)
        );
        assert_eq!(
            history.best("val_accuracy", Objective::Maximize).map(|e| e.step),
            Some(20)
        );
    }

    #[test]
    fn json_export_parses_back() {
        let history = history();
        let json = history.to_json().unwrap();
        let parsed: MetricHistory = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, history);
    }
}
