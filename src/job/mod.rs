// Job manager
//
// Owns the registry of jobs, validates and admits new ones, and runs each
// admitted job's device pool on its own task.
pub mod state;

pub use state::{ExpectedMessages, JobState, JobStatus, JobView};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::pool::{DevicePool, PoolEnd, SessionEnv};
use crate::rate::{JobSlot, SafetyController};
use crate::spec::{ExpectedCounts, TestSpec};
use crate::stats::{EngineCounters, EngineCountersSnapshot, JobMetrics};
use crate::transport::TransportConnector;

/// Longest pause between two reaper passes.
const REAPER_PERIOD: Duration = Duration::from_secs(60);

/// One tracked job.
pub struct JobEntry {
    id: String,
    order: u64,
    spec: Arc<TestSpec>,
    expected: ExpectedCounts,
    metrics: Arc<JobMetrics>,
    status: RwLock<JobStatus>,
    state_tx: watch::Sender<JobState>,
    cancel: CancellationToken,
    teardown: watch::Receiver<bool>,
}

impl JobEntry {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> JobState {
        self.status.read().state
    }

    pub fn metrics(&self) -> &Arc<JobMetrics> {
        &self.metrics
    }

    fn transition(&self, next: JobState, error: Option<String>) -> bool {
        let applied = self.status.write().transition(next, error);
        if applied {
            self.state_tx.send_replace(next);
        }
        applied
    }

    pub fn view(&self) -> JobView {
        let status = self.status.read().clone();
        JobView {
            job_id: self.id.clone(),
            state: status.state,
            protocol: self.spec.protocol,
            test_type: self.spec.test_type,
            devices: self.spec.devices,
            runtime_seconds: self.spec.runtime_seconds,
            created_at: status.created_at,
            started_at: status.started_at,
            ended_at: status.ended_at,
            elapsed_seconds: status.elapsed_seconds(),
            expected_messages: ExpectedMessages {
                per_device: self.expected.messages_per_device,
                total: self.expected.total_messages,
            },
            metrics: self.metrics.snapshot(),
            error: status.error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthView {
    pub status: String,
    pub running_jobs: usize,
    pub tracked_jobs: usize,
    pub available_slots: usize,
    pub counters: EngineCountersSnapshot,
}

pub struct JobManager {
    config: Arc<EngineConfig>,
    safety: Arc<SafetyController>,
    connector: Arc<dyn TransportConnector>,
    jobs: DashMap<String, Arc<JobEntry>>,
    counters: Arc<EngineCounters>,
    next_order: AtomicU64,
}

impl JobManager {
    pub fn new(config: EngineConfig, connector: Arc<dyn TransportConnector>) -> Self {
        let safety = Arc::new(SafetyController::new(config.limits.clone()));
        Self {
            config: Arc::new(config),
            safety,
            connector,
            jobs: DashMap::new(),
            counters: Arc::new(EngineCounters::default()),
            next_order: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn safety(&self) -> &Arc<SafetyController> {
        &self.safety
    }

    /// Validate, admit and start a job. Must be called inside a Tokio runtime.
    pub fn create_job(&self, spec: TestSpec) -> Result<String> {
        if let Err(e) = spec.ensure_valid() {
            self.counters.record_validation_rejection();
            debug!(error = %e, "rejected invalid test spec");
            return Err(e);
        }
        let slot = match self.safety.admit(&spec) {
            Ok(slot) => slot,
            Err(e) => {
                self.counters.record_admission_rejection();
                warn!(error = %e, "job not admitted");
                return Err(e);
            }
        };

        let job_id = Uuid::new_v4().to_string();
        let spec = Arc::new(spec);
        let metrics = Arc::new(JobMetrics::new());
        let cancel = CancellationToken::new();
        let (teardown_tx, teardown_rx) = watch::channel(false);
        let (state_tx, _) = watch::channel(JobState::Pending);
        let entry = Arc::new(JobEntry {
            id: job_id.clone(),
            order: self.next_order.fetch_add(1, Ordering::Relaxed),
            spec: Arc::clone(&spec),
            expected: spec.expected_counts(),
            metrics: Arc::clone(&metrics),
            status: RwLock::new(JobStatus::new()),
            state_tx,
            cancel: cancel.clone(),
            teardown: teardown_rx,
        });
        self.jobs.insert(job_id.clone(), Arc::clone(&entry));

        let env = Arc::new(SessionEnv {
            job_id: job_id.clone(),
            spec: Arc::clone(&spec),
            config: Arc::clone(&self.config),
            metrics,
            safety: Arc::clone(&self.safety),
            connector: Arc::clone(&self.connector),
            cancel,
        });
        let pool = DevicePool::new(env);
        info!(
            job = %job_id,
            protocol = %spec.protocol,
            test_type = %spec.test_type,
            devices = spec.devices,
            runtime = spec.runtime_seconds,
            "job created"
        );
        tokio::spawn(run_job(entry, pool, slot, teardown_tx, Arc::clone(&self.counters)));
        Ok(job_id)
    }

    fn entry(&self, job_id: &str) -> Result<Arc<JobEntry>> {
        self.jobs
            .get(job_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| EngineError::NotFound(format!("job {} not found", job_id)))
    }

    pub fn get_status(&self, job_id: &str) -> Result<JobView> {
        Ok(self.entry(job_id)?.view())
    }

    /// Every tracked job, most recently created first.
    pub fn list_jobs(&self) -> Vec<JobView> {
        let mut entries: Vec<Arc<JobEntry>> =
            self.jobs.iter().map(|e| Arc::clone(e.value())).collect();
        entries.sort_by(|a, b| b.order.cmp(&a.order));
        entries.iter().map(|e| e.view()).collect()
    }

    /// Ask a job to stop. Returns once its sessions have been told to
    /// disconnect, or after the grace period at the latest.
    pub async fn stop_job(&self, job_id: &str) -> Result<JobView> {
        let entry = self.entry(job_id)?;
        let state = entry.state();
        if state.is_terminal() {
            return Err(EngineError::AlreadyTerminal(format!(
                "job {} is already {}",
                job_id, state
            )));
        }
        info!(job = %job_id, %state, "stop requested");
        entry.cancel.cancel();

        let mut teardown = entry.teardown.clone();
        let asked = async {
            while !*teardown.borrow_and_update() {
                if teardown.changed().await.is_err() {
                    break;
                }
            }
        };
        if tokio::time::timeout(self.config.shutdown_grace(), asked)
            .await
            .is_err()
        {
            warn!(job = %job_id, "teardown not acknowledged within grace period");
        }
        Ok(entry.view())
    }

    /// Wait until a job reaches a terminal state.
    pub async fn wait_for_completion(&self, job_id: &str) -> Result<JobView> {
        let entry = self.entry(job_id)?;
        let mut state = entry.state_tx.subscribe();
        while !state.borrow_and_update().is_terminal() {
            if state.changed().await.is_err() {
                break;
            }
        }
        Ok(entry.view())
    }

    /// Evict a finished job.
    pub fn delete_job(&self, job_id: &str) -> Result<()> {
        let entry = self.entry(job_id)?;
        let state = entry.state();
        if !state.is_terminal() {
            return Err(EngineError::JobActive(format!(
                "job {} is {}; stop it before deleting",
                job_id, state
            )));
        }
        self.jobs.remove(job_id);
        debug!(job = %job_id, "job deleted");
        Ok(())
    }

    /// Evict terminal jobs that ended more than the retention window ago.
    pub fn cleanup_expired(&self) -> usize {
        self.cleanup_expired_at(Utc::now())
    }

    pub fn cleanup_expired_at(&self, now: DateTime<Utc>) -> usize {
        let retention = self.config.job_retention();
        let before = self.jobs.len();
        self.jobs.retain(|_, entry| {
            let status = entry.status.read();
            let expired = status.state.is_terminal()
                && status
                    .ended_at
                    .and_then(|ended| (now - ended).to_std().ok())
                    .map_or(false, |age| age >= retention);
            !expired
        });
        let removed = before.saturating_sub(self.jobs.len());
        if removed > 0 {
            info!(removed, "expired jobs evicted");
        }
        removed
    }

    /// Periodically evict expired jobs until the manager is dropped.
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        let period = self.config.job_retention().min(REAPER_PERIOD);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                match manager.upgrade() {
                    Some(manager) => {
                        manager.cleanup_expired();
                    }
                    None => return,
                }
            }
        })
    }

    pub fn health(&self) -> HealthView {
        let running_jobs = self
            .jobs
            .iter()
            .filter(|e| !e.value().state().is_terminal())
            .count();
        HealthView {
            status: "healthy".to_string(),
            running_jobs,
            tracked_jobs: self.jobs.len(),
            available_slots: self.safety.available_slots(),
            counters: self.counters.snapshot(),
        }
    }
}

/// Execution task of one job: run its pool, then record the terminal state.
async fn run_job(
    entry: Arc<JobEntry>,
    pool: DevicePool,
    slot: JobSlot,
    teardown: watch::Sender<bool>,
    counters: Arc<EngineCounters>,
) {
    let (started_tx, started_rx) = oneshot::channel();
    let mark_running = async {
        if started_rx.await.is_ok() && entry.transition(JobState::Running, None) {
            counters.record_started();
            info!(job = %entry.id, "job running");
        }
    };
    let (end, ()) = tokio::join!(pool.run(started_tx, teardown), mark_running);

    // free the slot before the terminal state becomes visible
    drop(slot);

    let (state, error) = match end {
        PoolEnd::Completed => (JobState::Completed, None),
        PoolEnd::Cancelled => (JobState::Stopped, None),
        PoolEnd::TimedOut => (JobState::Failed, Some("job timed out".to_string())),
        PoolEnd::ConnectThreshold(reason) | PoolEnd::SetupFailed(reason) => {
            (JobState::Failed, Some(reason))
        }
    };
    if entry.transition(state, error) {
        match state {
            JobState::Completed => counters.record_completed(),
            JobState::Stopped => counters.record_stopped(),
            _ => counters.record_failed(),
        }
        info!(job = %entry.id, %state, "job finished");
    }
}
