// Engine configuration module
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::EngineError;

/// Hard ceilings. A configuration may lower these, never raise them.
pub const MAX_DEVICES_PER_JOB: u32 = 100_000;
pub const MAX_CONCURRENT_JOBS: usize = 5;
pub const MAX_CONNECT_RATE: u32 = 2_000;
pub const MAX_PUBLISH_RATE: u32 = 50_000;
pub const MAX_MESSAGE_SIZE_BYTES: u32 = 1_048_576;

/// Global safety limits enforced across all jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyLimits {
    pub max_devices_per_job: u32,
    pub max_concurrent_jobs: usize,
    pub connect_rate_per_second: u32,
    pub publish_rate_per_second: u32,
    pub max_message_size_bytes: u32,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_devices_per_job: MAX_DEVICES_PER_JOB,
            max_concurrent_jobs: MAX_CONCURRENT_JOBS,
            connect_rate_per_second: MAX_CONNECT_RATE,
            publish_rate_per_second: MAX_PUBLISH_RATE,
            max_message_size_bytes: MAX_MESSAGE_SIZE_BYTES,
        }
    }
}

impl SafetyLimits {
    fn validate_into(&self, errors: &mut Vec<String>) {
        check_limit(
            errors,
            "limits.max_devices_per_job",
            self.max_devices_per_job as u64,
            MAX_DEVICES_PER_JOB as u64,
        );
        check_limit(
            errors,
            "limits.max_concurrent_jobs",
            self.max_concurrent_jobs as u64,
            MAX_CONCURRENT_JOBS as u64,
        );
        check_limit(
            errors,
            "limits.connect_rate_per_second",
            self.connect_rate_per_second as u64,
            MAX_CONNECT_RATE as u64,
        );
        check_limit(
            errors,
            "limits.publish_rate_per_second",
            self.publish_rate_per_second as u64,
            MAX_PUBLISH_RATE as u64,
        );
        check_limit(
            errors,
            "limits.max_message_size_bytes",
            self.max_message_size_bytes as u64,
            MAX_MESSAGE_SIZE_BYTES as u64,
        );
    }
}

fn check_limit(errors: &mut Vec<String>, name: &str, value: u64, ceiling: u64) {
    if value == 0 {
        errors.push(format!("{} must be greater than 0", name));
    } else if value > ceiling {
        errors.push(format!("{} must not exceed {}", name, ceiling));
    }
}

/// What a session does when a publish is not acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum PublishRetryPolicy {
    /// Count the failure and move on to the next scheduled message.
    CountAndContinue,
    /// Re-send up to `max_attempts` times in total before counting a failure.
    Retry { max_attempts: u32 },
}

impl Default for PublishRetryPolicy {
    fn default() -> Self {
        PublishRetryPolicy::CountAndContinue
    }
}

impl PublishRetryPolicy {
    pub fn attempts(&self) -> u32 {
        match self {
            PublishRetryPolicy::CountAndContinue => 1,
            PublishRetryPolicy::Retry { max_attempts } => (*max_attempts).max(1),
        }
    }
}

/// Engine-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub limits: SafetyLimits,
    pub shutdown_grace_secs: u64,
    pub job_retention_secs: u64,
    /// Fraction of devices whose initial connect may fail before the job is failed.
    pub connection_failure_threshold: f64,
    pub connect_timeout_secs: u64,
    pub connect_retries: u32,
    pub reconnect_backoff_ms: u64,
    pub snapshot_interval_secs: u64,
    /// Added to ramp + runtime before a job is declared timed out.
    pub job_timeout_margin_secs: u64,
    pub publish_retry: PublishRetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limits: SafetyLimits::default(),
            shutdown_grace_secs: 10,
            job_retention_secs: 3_600,
            connection_failure_threshold: 0.5,
            connect_timeout_secs: 10,
            connect_retries: 3,
            reconnect_backoff_ms: 1_000,
            snapshot_interval_secs: 1,
            job_timeout_margin_secs: 60,
            publish_retry: PublishRetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Validate every field, collecting all violations.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        self.limits.validate_into(&mut errors);

        if self.shutdown_grace_secs == 0 {
            errors.push("shutdown_grace_secs must be greater than 0".to_string());
        }
        if self.job_retention_secs == 0 {
            errors.push("job_retention_secs must be greater than 0".to_string());
        }
        if !(self.connection_failure_threshold > 0.0 && self.connection_failure_threshold <= 1.0) {
            errors.push("connection_failure_threshold must be in (0, 1]".to_string());
        }
        if self.connect_timeout_secs == 0 {
            errors.push("connect_timeout_secs must be greater than 0".to_string());
        }
        if self.snapshot_interval_secs == 0 {
            errors.push("snapshot_interval_secs must be greater than 0".to_string());
        }
        if let PublishRetryPolicy::Retry { max_attempts } = self.publish_retry {
            if max_attempts == 0 {
                errors.push("publish_retry.max_attempts must be greater than 0".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }
}

/// Parse and validate a configuration from a JSON string.
pub fn load_from_str(json: &str) -> Result<EngineConfig, EngineError> {
    let config: EngineConfig = serde_json::from_str(json)
        .map_err(|e| EngineError::Config(format!("JSON parse error: {}", e)))?;

    config.validate().map_err(|errors| {
        EngineError::Config(format!("Validation errors: {}", errors.join("; ")))
    })?;

    Ok(config)
}

/// Parse and validate a configuration file.
pub fn load_from_file(path: &Path) -> Result<EngineConfig, EngineError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        EngineError::Config(format!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        ))
    })?;

    load_from_str(&content)
}
