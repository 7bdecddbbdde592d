// Device session pool
//
// Ramps up one task per simulated device, supervises them for the job's
// lifetime and tears them down with a bounded grace period.
pub mod session;

pub use session::{
    ConnectProfile, ConnectionState, DeviceSession, Interrupt, SessionEnv, SessionOutcome,
};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::strategy::Strategy;

/// How a pool run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEnd {
    /// Every session ran its schedule to the end (or failed individually).
    Completed,
    /// The job's cancellation token fired.
    Cancelled,
    /// Too many devices failed their initial connect.
    ConnectThreshold(String),
    /// The hard deadline passed before the sessions finished.
    TimedOut,
    /// The transport refused the job before ramp-up.
    SetupFailed(String),
}

/// Per-outcome session tallies, for logging.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Tally {
    completed: u64,
    stopped: u64,
    failed: u64,
}

impl Tally {
    fn add(&mut self, joined: Result<SessionOutcome, tokio::task::JoinError>, env: &SessionEnv) {
        match joined {
            Ok(SessionOutcome::Completed) => self.completed += 1,
            Ok(SessionOutcome::Stopped) => self.stopped += 1,
            Ok(SessionOutcome::Failed(_)) => self.failed += 1,
            Err(e) if e.is_panic() => {
                self.failed += 1;
                env.metrics.record_device_failed("device session panicked");
            }
            Err(_) => {}
        }
    }
}

pub struct DevicePool {
    env: Arc<SessionEnv>,
    strategy: Arc<Strategy>,
}

impl DevicePool {
    pub fn new(env: Arc<SessionEnv>) -> Self {
        let strategy = Arc::new(Strategy::for_spec(&env.spec));
        Self { env, strategy }
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    /// Sessions started per second: the job's connect rate capped by the
    /// global connect ceiling.
    pub fn ramp_rate(&self) -> u32 {
        self.env.safety.ramp_rate(&self.env.spec).max(1)
    }

    pub fn ramp_duration(&self) -> Duration {
        Duration::from_secs_f64(self.env.spec.devices as f64 / self.ramp_rate() as f64)
    }

    /// Longest the pool may run before it is torn down as timed out.
    pub fn deadline(&self) -> Duration {
        self.ramp_duration()
            + Duration::from_secs(self.env.spec.runtime_seconds as u64)
            + Duration::from_secs(self.env.config.job_timeout_margin_secs)
    }

    /// Run the job. `started` fires once ramp-up begins; `teardown` flips to
    /// true once every session has been told to disconnect.
    pub async fn run(self, started: oneshot::Sender<()>, teardown: watch::Sender<bool>) -> PoolEnd {
        let env = Arc::clone(&self.env);
        if env.cancel.is_cancelled() {
            teardown.send_replace(true);
            return PoolEnd::Cancelled;
        }
        if let Err(e) = env.connector.prepare(env.spec.protocol, &env.spec.broker_url) {
            warn!(job = %env.job_id, error = %e, "transport setup failed");
            teardown.send_replace(true);
            return PoolEnd::SetupFailed(e.to_string());
        }
        let _ = started.send(());

        let devices = env.spec.devices;
        let ramp_rate = self.ramp_rate();
        let ramp_start = Instant::now();
        env.metrics.mark_started();
        let deadline = ramp_start + self.deadline();
        info!(
            job = %env.job_id,
            test_type = %env.spec.test_type,
            devices,
            ramp_rate,
            "ramping up device sessions"
        );

        let sampler = tokio::spawn(sample_throughput(Arc::clone(&env)));
        let (connected_tx, mut connected_rx) = mpsc::unbounded_channel::<()>();
        let mut sessions = JoinSet::new();
        let mut tally = Tally::default();
        let mut next_index = 0u32;
        let mut threshold_checked = false;

        let end = loop {
            if next_index == devices && sessions.is_empty() {
                if let Some(reason) = self.threshold_breach(&mut threshold_checked) {
                    break PoolEnd::ConnectThreshold(reason);
                }
                break PoolEnd::Completed;
            }
            let next_at =
                ramp_start + Duration::from_secs_f64(next_index as f64 / ramp_rate as f64);
            tokio::select! {
                _ = env.cancel.cancelled() => break PoolEnd::Cancelled,
                _ = tokio::time::sleep_until(deadline) => break PoolEnd::TimedOut,
                _ = tokio::time::sleep_until(next_at), if next_index < devices => {
                    let session_env = Arc::clone(&env);
                    let strategy = Arc::clone(&self.strategy);
                    sessions.spawn(run_session(next_index, session_env, strategy, connected_tx.clone()));
                    next_index += 1;
                    if next_index == devices {
                        debug!(job = %env.job_id, elapsed = ?ramp_start.elapsed(), "ramp-up complete");
                    }
                }
                Some(()) = connected_rx.recv() => {
                    if let Some(reason) = self.threshold_breach(&mut threshold_checked) {
                        break PoolEnd::ConnectThreshold(reason);
                    }
                }
                Some(joined) = sessions.join_next() => tally.add(joined, &env),
            }
        };

        match &end {
            PoolEnd::ConnectThreshold(reason) => warn!(job = %env.job_id, %reason, "failing job"),
            PoolEnd::TimedOut => warn!(job = %env.job_id, "job deadline passed"),
            _ => {}
        }

        // every remaining session observes the token and disconnects
        env.cancel.cancel();
        teardown.send_replace(true);
        self.drain(&mut sessions, &mut tally).await;
        sampler.abort();
        env.metrics.sample_throughput();
        env.metrics.mark_finished();

        info!(
            job = %env.job_id,
            completed = tally.completed,
            stopped = tally.stopped,
            failed = tally.failed,
            "device sessions finished"
        );
        end
    }

    /// Evaluated once, after every device has resolved its first connect.
    fn threshold_breach(&self, checked: &mut bool) -> Option<String> {
        if *checked {
            return None;
        }
        let devices = self.env.spec.devices as u64;
        let (resolved, failed) = self.env.metrics.initial_connects();
        if resolved < devices {
            return None;
        }
        *checked = true;
        let threshold = self.env.config.connection_failure_threshold;
        let fraction = failed as f64 / devices as f64;
        if fraction > threshold {
            Some(format!(
                "{} of {} devices failed to connect (threshold {:.0}%)",
                failed,
                devices,
                threshold * 100.0
            ))
        } else {
            None
        }
    }

    /// Wait up to the grace period for sessions to close, then abort the rest.
    async fn drain(&self, sessions: &mut JoinSet<SessionOutcome>, tally: &mut Tally) {
        let grace_deadline = Instant::now() + self.env.config.shutdown_grace();
        loop {
            match tokio::time::timeout_at(grace_deadline, sessions.join_next()).await {
                Ok(Some(joined)) => tally.add(joined, &self.env),
                Ok(None) => return,
                Err(_) => {
                    let stragglers = sessions.len() as u64;
                    warn!(job = %self.env.job_id, stragglers, "grace period over, aborting sessions");
                    sessions.abort_all();
                    while sessions.join_next().await.is_some() {}
                    self.env.metrics.record_forced_terminations(stragglers);
                    return;
                }
            }
        }
    }
}

/// One device from first connect to close.
pub async fn run_session(
    index: u32,
    env: Arc<SessionEnv>,
    strategy: Arc<Strategy>,
    connected: mpsc::UnboundedSender<()>,
) -> SessionOutcome {
    let spec = Arc::clone(&env.spec);
    let mut session =
        match DeviceSession::new(index, Arc::clone(&env), |id| strategy.connect_profile(&spec, id)) {
            Ok(session) => session,
            Err(e) => {
                env.metrics.record_initial_connect(false);
                env.metrics.record_device_failed(&e.to_string());
                let _ = connected.send(());
                return SessionOutcome::Failed(e.to_string());
            }
        };

    let retries = if strategy.retries_connects() {
        env.config.connect_retries
    } else {
        0
    };
    match session.connect_with_retry(retries).await {
        Ok(_) => {
            env.metrics.record_initial_connect(true);
            let _ = connected.send(());
        }
        Err(Interrupt::Cancelled) => return SessionOutcome::Stopped,
        Err(Interrupt::Fatal(e)) => {
            env.metrics.record_initial_connect(false);
            session.fail(&e);
            let _ = connected.send(());
            return SessionOutcome::Failed(e.to_string());
        }
    }

    let outcome = match strategy.run(&mut session).await {
        Ok(()) => SessionOutcome::Completed,
        Err(Interrupt::Cancelled) => SessionOutcome::Stopped,
        Err(Interrupt::Fatal(e)) => {
            debug!(device = %session.device_id(), error = %e, "device session failed");
            session.fail(&e);
            return SessionOutcome::Failed(e.to_string());
        }
    };
    session.disconnect().await;
    outcome
}

async fn sample_throughput(env: Arc<SessionEnv>) {
    let mut interval = tokio::time::interval(env.config.snapshot_interval());
    interval.tick().await;
    loop {
        tokio::select! {
            _ = env.cancel.cancelled() => return,
            _ = interval.tick() => {
                env.metrics.sample_throughput();
            }
        }
    }
}
