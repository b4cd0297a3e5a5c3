mod defaults;
mod types;

pub use types::*;

use crate::error::ConfigError;
use defaults::*;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            max_workers: default_max_workers(),
            step_timeout_sec: default_step_timeout_sec(),
            review_timeout_sec: default_review_timeout_sec(),
            failure_policy: FailurePolicy::default(),
            state_dir: default_state_dir(),
            report_dir: default_report_dir(),
            retry: RetryConfig::default(),
            quality: QualityPolicy::default(),
            agents: Vec::new(),
        }
    }
}

impl Config {
    /// Load config from a YAML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Validate the config
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }

        self.retry.validate()?;
        self.quality.validate()?;

        let mut seen = HashSet::new();
        for agent in &self.agents {
            if !seen.insert(agent.name.as_str()) {
                return Err(ConfigError::DuplicateAgent(agent.name.clone()));
            }
            if agent.kind == AgentKind::Process && agent.binary.is_none() {
                return Err(ConfigError::MissingBinary(agent.name.clone()));
            }
        }

        Ok(())
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_sec)
    }

    /// `None` means review-required steps are parked without waiting.
    pub fn review_timeout(&self) -> Option<Duration> {
        (self.review_timeout_sec > 0).then(|| Duration::from_secs(self.review_timeout_sec))
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_negative = |v: f64| v.is_finite() && v >= 0.0;
        if !non_negative(self.base_delay) || !non_negative(self.max_delay) {
            return Err(ConfigError::InvalidRetry(
                "base_delay and max_delay must be finite and non-negative".to_string(),
            ));
        }
        if !(self.backoff_factor >= 1.0) {
            return Err(ConfigError::InvalidRetry(
                "backoff_factor must be at least 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_range) {
            return Err(ConfigError::InvalidRetry(
                "jitter_range must be within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

impl QualityPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if ![
            self.min_quality,
            self.target_quality,
            self.review_threshold_low,
            self.review_threshold_high,
        ]
        .into_iter()
        .all(in_unit)
        {
            return Err(ConfigError::InvalidQualityPolicy(
                "thresholds must be within [0, 1]".to_string(),
            ));
        }
        if self.min_quality > self.target_quality {
            return Err(ConfigError::InvalidQualityPolicy(format!(
                "min_quality ({}) exceeds target_quality ({})",
                self.min_quality, self.target_quality
            )));
        }
        if self.review_threshold_low > self.review_threshold_high {
            return Err(ConfigError::InvalidQualityPolicy(format!(
                "review_threshold_low ({}) exceeds review_threshold_high ({})",
                self.review_threshold_low, self.review_threshold_high
            )));
        }
        Ok(())
    }
}
