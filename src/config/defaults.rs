use std::path::PathBuf;

pub fn default_version() -> u32 {
    1
}

pub fn default_max_workers() -> usize {
    4
}

pub fn default_step_timeout_sec() -> u64 {
    300
}

pub fn default_review_timeout_sec() -> u64 {
    0
}

pub fn default_state_dir() -> PathBuf {
    PathBuf::from(".veritas")
}

pub fn default_report_dir() -> PathBuf {
    PathBuf::from("reports")
}

pub fn default_base_delay() -> f64 {
    1.0
}

pub fn default_backoff_factor() -> f64 {
    2.0
}

pub fn default_max_delay() -> f64 {
    60.0
}

pub fn default_jitter_range() -> f64 {
    0.1
}

pub fn default_max_retries() -> u32 {
    3
}

pub fn default_min_quality() -> f64 {
    0.7
}

pub fn default_target_quality() -> f64 {
    0.85
}

pub fn default_review_threshold_low() -> f64 {
    0.5
}

pub fn default_review_threshold_high() -> f64 {
    0.9
}

pub fn default_quality_retries() -> u32 {
    2
}

pub fn default_echo_score() -> f64 {
    1.0
}

pub fn default_true() -> bool {
    true
}
