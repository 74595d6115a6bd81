use serde::{Deserialize, Serialize};

/// How samples are cut from each region.
///
/// Every random choice the policy enables (jitter, flips) is drawn from the
/// dataset's seeded generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingPolicy {
    /// Edge of the square crop, in pixels of `level`.
    #[serde(default = "default_crop_size")]
    pub crop_size: u32,
    #[serde(default = "default_samples_per_region")]
    pub samples_per_region: u32,
    /// Pyramid level crops are read from.
    #[serde(default)]
    pub level: usize,
    /// Maximum offset of the crop center from the region center, in pixels of `level`.
    #[serde(default)]
    pub jitter: u32,
    #[serde(default)]
    pub flip_horizontal: bool,
    #[serde(default)]
    pub flip_vertical: bool,
    /// Only sample regions carrying one of these labels.
    #[serde(default)]
    pub labels: Option<Vec<String>>,
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self {
            crop_size: default_crop_size(),
            samples_per_region: default_samples_per_region(),
            level: 0,
            jitter: 0,
            flip_horizontal: false,
            flip_vertical: false,
            labels: None,
        }
    }
}

impl SamplingPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if self.crop_size == 0 {
            return Err("crop_size must be >= 1".to_string());
        }
        if self.samples_per_region == 0 {
            return Err("samples_per_region must be >= 1".to_string());
        }
        if let Some(labels) = &self.labels {
            if labels.iter().all(|label| label.trim().is_empty()) {
                return Err("labels filter must name at least one label".to_string());
            }
        }
        Ok(())
    }

    pub fn accepts_label(&self, label: &str) -> bool {
        match &self.labels {
            Some(labels) => labels.iter().any(|wanted| wanted.trim() == label),
            None => true,
        }
    }
}

fn default_crop_size() -> u32 {
    64
}

fn default_samples_per_region() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_filter_and_validation() {
        let mut policy = SamplingPolicy::default();
        assert!(policy.accepts_label("anything"));
        policy.labels = Some(vec![" tumor ".to_string()]);
        assert!(policy.accepts_label("tumor"));
        assert!(!policy.accepts_label("stroma"));
        policy.validate().unwrap();
        policy.labels = Some(vec![]);
        assert!(policy.validate().is_err());
        policy.labels = None;
        policy.crop_size = 0;
        assert!(policy.validate().is_err());
    }

    #[test]
    fn missing_toml_fields_take_defaults() {
        let policy: SamplingPolicy = toml::from_str("jitter = 4").unwrap();
        assert_eq!(policy.crop_size, 64);
        assert_eq!(policy.samples_per_region, 1);
        assert_eq!(policy.jitter, 4);
    }
}
