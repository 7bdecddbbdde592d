// Job lifecycle state machine and the read-only job view.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::spec::{Protocol, TestType};
use crate::stats::MetricsSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Stopped)
    }

    /// Pending → Running → {Completed, Stopped, Failed}. A pending job may
    /// also end directly in Stopped or Failed. Terminal states never change.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        match self {
            JobState::Pending => matches!(
                next,
                JobState::Running | JobState::Stopped | JobState::Failed
            ),
            JobState::Running => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable lifecycle data of one job, behind the job's lock.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// First fatal error, for failed jobs.
    pub error: Option<String>,
}

impl JobStatus {
    pub fn new() -> Self {
        Self {
            state: JobState::Pending,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            error: None,
        }
    }

    /// Apply a transition if it is legal. Returns whether it was applied.
    pub fn transition(&mut self, next: JobState, error: Option<String>) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        let now = Utc::now();
        if next == JobState::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.ended_at = Some(now);
            if self.error.is_none() {
                self.error = error;
            }
        }
        self.state = next;
        true
    }

    /// Seconds since the job started running, frozen once it ended.
    pub fn elapsed_seconds(&self) -> f64 {
        match self.started_at {
            Some(start) => {
                let end = self.ended_at.unwrap_or_else(Utc::now);
                (end - start).num_milliseconds().max(0) as f64 / 1000.0
            }
            None => 0.0,
        }
    }
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedMessages {
    pub per_device: u64,
    pub total: u64,
}

/// Read-only snapshot of a job returned by status and list queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub job_id: String,
    pub state: JobState,
    pub protocol: Protocol,
    pub test_type: TestType,
    pub devices: u32,
    pub runtime_seconds: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub elapsed_seconds: f64,
    pub expected_messages: ExpectedMessages,
    pub metrics: MetricsSnapshot,
    pub error: Option<String>,
}
