pub(super) const MIN_SPLIT_RATIO: f64 = 0.05;
pub(super) const MAX_SPLIT_RATIO: f64 = 0.95;
pub(super) const MAX_SAMPLE_RETRIES: u32 = 16;
pub(super) const MAX_RETRY_BACKOFF_MS: u64 = 10_000;

pub(super) fn clamp_sample_retries(value: u32) -> u32 {
    value.min(MAX_SAMPLE_RETRIES)
}

pub(super) fn clamp_retry_backoff(value: u64) -> u64 {
    value.min(MAX_RETRY_BACKOFF_MS)
}

pub(super) fn default_seed() -> u64 {
    1337
}

pub(super) fn default_split_ratio() -> f64 {
    0.8
}

pub(super) fn default_max_sample_retries() -> u32 {
    3
}

pub(super) fn default_retry_backoff_ms() -> u64 {
    25
}
