// Global admission control and shared rate limiting
pub mod limiter;

pub use limiter::RateLimiter;

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::config::SafetyLimits;
use crate::error::{AdmissionReason, EngineError};
use crate::spec::TestSpec;

/// A held concurrent-job slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct JobSlot {
    _permit: OwnedSemaphorePermit,
}

/// Enforces the safety limits across every job of one engine.
///
/// The connect and publish limiters are shared by all jobs, so one job's
/// traffic reduces the headroom left for another.
pub struct SafetyController {
    limits: SafetyLimits,
    job_slots: Arc<Semaphore>,
    connect: RateLimiter,
    publish: RateLimiter,
}

impl SafetyController {
    pub fn new(limits: SafetyLimits) -> Self {
        Self {
            job_slots: Arc::new(Semaphore::new(limits.max_concurrent_jobs)),
            connect: RateLimiter::with_default_burst(limits.connect_rate_per_second),
            publish: RateLimiter::with_default_burst(limits.publish_rate_per_second),
            limits,
        }
    }

    pub fn limits(&self) -> &SafetyLimits {
        &self.limits
    }

    /// Reject specs that can never run within the per-job limits.
    pub fn check_structural(&self, spec: &TestSpec) -> Result<(), EngineError> {
        if spec.devices > self.limits.max_devices_per_job {
            return Err(EngineError::admission(
                AdmissionReason::StructuralLimit,
                format!(
                    "{} devices requested, limit is {}",
                    spec.devices, self.limits.max_devices_per_job
                ),
            ));
        }
        if spec.message_size_bytes > self.limits.max_message_size_bytes {
            return Err(EngineError::admission(
                AdmissionReason::StructuralLimit,
                format!(
                    "message size {} bytes exceeds limit of {}",
                    spec.message_size_bytes, self.limits.max_message_size_bytes
                ),
            ));
        }
        if spec.connect_rate > self.limits.connect_rate_per_second {
            return Err(EngineError::admission(
                AdmissionReason::StructuralLimit,
                format!(
                    "connect rate {}/s exceeds global ceiling of {}/s",
                    spec.connect_rate, self.limits.connect_rate_per_second
                ),
            ));
        }
        Ok(())
    }

    /// Structural check, then take a concurrent-job slot without waiting.
    pub fn admit(&self, spec: &TestSpec) -> Result<JobSlot, EngineError> {
        self.check_structural(spec)?;
        let permit = self.job_slots.clone().try_acquire_owned().map_err(|_| {
            EngineError::admission(
                AdmissionReason::ConcurrentJobs,
                format!(
                    "{} concurrent jobs already running",
                    self.limits.max_concurrent_jobs
                ),
            )
        })?;
        debug!(
            available = self.job_slots.available_permits(),
            "job slot granted"
        );
        Ok(JobSlot { _permit: permit })
    }

    pub fn available_slots(&self) -> usize {
        self.job_slots.available_permits()
    }

    pub fn connect_limiter(&self) -> &RateLimiter {
        &self.connect
    }

    pub fn publish_limiter(&self) -> &RateLimiter {
        &self.publish
    }

    /// Session starts per second for this job: its own connect rate, capped globally.
    pub fn ramp_rate(&self, spec: &TestSpec) -> u32 {
        spec.connect_rate
            .min(self.limits.connect_rate_per_second)
            .max(1)
    }
}
