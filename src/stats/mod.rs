// Per-job metrics aggregation
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Samples kept per latency shard. Older samples are overwritten.
pub const LATENCY_SAMPLES_PER_SHARD: usize = 8_192;

struct LatencyShard {
    samples: Vec<Duration>,
    next: usize,
}

impl LatencyShard {
    fn push(&mut self, latency: Duration) {
        if self.samples.len() < LATENCY_SAMPLES_PER_SHARD {
            self.samples.push(latency);
        } else {
            self.samples[self.next] = latency;
        }
        self.next = (self.next + 1) % LATENCY_SAMPLES_PER_SHARD;
    }
}

/// Thread-safe counters for one job, written by its device sessions and read
/// by status queries. Latency recording uses sharded buffers keyed by device
/// index so sessions rarely contend on the same lock.
pub struct JobMetrics {
    connections_attempted: AtomicU64,
    connections_succeeded: AtomicU64,
    connections_failed: AtomicU64,
    reconnects: AtomicU64,
    initial_connects: AtomicU64,
    initial_connect_failures: AtomicU64,
    messages_published: AtomicU64,
    bytes_published: AtomicU64,
    publish_failures: AtomicU64,
    messages_received: AtomicU64,
    retained_published: AtomicU64,
    commands_received: AtomicU64,
    replayed_messages: AtomicU64,
    lwt_triggered: AtomicU64,
    anomalies_injected: AtomicU64,
    forced_terminations: AtomicU64,
    devices_failed: AtomicU64,
    active_sessions: AtomicU64,
    throughput_bits: AtomicU64,
    last_sampled_published: AtomicU64,
    last_sampled_at: Mutex<Instant>,
    last_error: Mutex<Option<String>>,
    latency_shards: Vec<Mutex<LatencyShard>>,
    /// Ramp start and teardown end; the average throughput is measured over it.
    window: Mutex<(Option<Instant>, Option<Instant>)>,
}

/// A point-in-time copy of a job's metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub connections_attempted: u64,
    pub connections_succeeded: u64,
    pub connections_failed: u64,
    pub reconnects: u64,
    pub messages_published: u64,
    pub bytes_published: u64,
    pub publish_failures: u64,
    pub messages_received: u64,
    pub retained_published: u64,
    pub commands_received: u64,
    pub replayed_messages: u64,
    pub lwt_triggered: u64,
    pub anomalies_injected: u64,
    pub forced_terminations: u64,
    pub devices_failed: u64,
    pub active_sessions: u64,
    pub throughput_per_second: f64,
    pub average_throughput: f64,
    pub latency_p50_ms: f64,
    pub latency_p90_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub last_error: Option<String>,
}

impl JobMetrics {
    pub fn new() -> Self {
        let shard_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::with_shards(shard_count)
    }

    pub fn with_shards(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        let latency_shards = (0..shard_count)
            .map(|_| {
                Mutex::new(LatencyShard {
                    samples: Vec::new(),
                    next: 0,
                })
            })
            .collect();
        let now = Instant::now();
        Self {
            connections_attempted: AtomicU64::new(0),
            connections_succeeded: AtomicU64::new(0),
            connections_failed: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            initial_connects: AtomicU64::new(0),
            initial_connect_failures: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            bytes_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            retained_published: AtomicU64::new(0),
            commands_received: AtomicU64::new(0),
            replayed_messages: AtomicU64::new(0),
            lwt_triggered: AtomicU64::new(0),
            anomalies_injected: AtomicU64::new(0),
            forced_terminations: AtomicU64::new(0),
            devices_failed: AtomicU64::new(0),
            active_sessions: AtomicU64::new(0),
            throughput_bits: AtomicU64::new(0f64.to_bits()),
            last_sampled_published: AtomicU64::new(0),
            last_sampled_at: Mutex::new(now),
            last_error: Mutex::new(None),
            latency_shards,
            window: Mutex::new((None, None)),
        }
    }

    pub fn record_connect_attempt(&self) {
        self.connections_attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect_success(&self) {
        self.connections_succeeded.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect_failure(&self, error: &str) {
        self.connections_failed.fetch_add(1, Ordering::Relaxed);
        self.record_error(error);
    }

    /// Outcome of a device's first connection, retries included.
    pub fn record_initial_connect(&self, connected: bool) {
        self.initial_connects.fetch_add(1, Ordering::Relaxed);
        if !connected {
            self.initial_connect_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn initial_connects(&self) -> (u64, u64) {
        (
            self.initial_connects.load(Ordering::Relaxed),
            self.initial_connect_failures.load(Ordering::Relaxed),
        )
    }

    pub fn record_disconnect(&self) {
        // saturating: a gauge must never wrap below zero
        let _ = self
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an acknowledged publish. `shard_hint` is usually the device index.
    pub fn record_publish(&self, bytes: usize, latency: Duration, shard_hint: usize) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
        self.bytes_published
            .fetch_add(bytes as u64, Ordering::Relaxed);
        let idx = shard_hint % self.latency_shards.len();
        self.latency_shards[idx].lock().push(latency);
    }

    pub fn record_publish_failure(&self, error: &str) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
        self.record_error(error);
    }

    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retained(&self) {
        self.retained_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command_received(&self) {
        self.commands_received.fetch_add(1, Ordering::Relaxed);
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replayed(&self, count: u64) {
        self.replayed_messages.fetch_add(count, Ordering::Relaxed);
        self.messages_received.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_lwt_triggered(&self) {
        self.lwt_triggered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_anomalies(&self, count: u64) {
        self.anomalies_injected.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_forced_terminations(&self, count: u64) {
        self.forced_terminations.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_device_failed(&self, error: &str) {
        self.devices_failed.fetch_add(1, Ordering::Relaxed);
        self.record_error(error);
    }

    pub fn record_error(&self, error: &str) {
        *self.last_error.lock() = Some(error.to_string());
    }

    pub fn messages_published(&self) -> u64 {
        self.messages_published.load(Ordering::Relaxed)
    }

    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    /// Recompute messages-per-second over the time since the previous sample.
    pub fn sample_throughput(&self) -> f64 {
        let now = Instant::now();
        let published = self.messages_published.load(Ordering::Relaxed);
        let mut last_at = self.last_sampled_at.lock();
        let previous = self
            .last_sampled_published
            .swap(published, Ordering::Relaxed);
        let secs = now.duration_since(*last_at).as_secs_f64();
        *last_at = now;
        let rate = if secs > 0.0 {
            published.saturating_sub(previous) as f64 / secs
        } else {
            0.0
        };
        self.throughput_bits.store(rate.to_bits(), Ordering::Relaxed);
        rate
    }

    /// Open the measurement window. Later calls keep the first start.
    pub fn mark_started(&self) {
        let mut window = self.window.lock();
        if window.0.is_none() {
            window.0 = Some(Instant::now());
        }
    }

    /// Close the measurement window; the average throughput is frozen from here on.
    pub fn mark_finished(&self) {
        let mut window = self.window.lock();
        if window.0.is_some() && window.1.is_none() {
            window.1 = Some(Instant::now());
        }
    }

    /// Length of the measurement window so far.
    pub fn active_duration(&self) -> Duration {
        match *self.window.lock() {
            (Some(start), Some(end)) => end.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    /// Take a snapshot of the current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let published = self.messages_published.load(Ordering::Relaxed);
        let elapsed = self.active_duration().as_secs_f64();
        let average_throughput = if elapsed > 0.0 {
            published as f64 / elapsed
        } else {
            0.0
        };

        // Merge all shards into a single Vec for percentile calculation
        let mut all_latencies = Vec::new();
        for shard in &self.latency_shards {
            all_latencies.extend_from_slice(&shard.lock().samples);
        }
        let (p50, p90, p95, p99) = calculate_percentiles(&all_latencies);

        MetricsSnapshot {
            connections_attempted: self.connections_attempted.load(Ordering::Relaxed),
            connections_succeeded: self.connections_succeeded.load(Ordering::Relaxed),
            connections_failed: self.connections_failed.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            messages_published: published,
            bytes_published: self.bytes_published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            retained_published: self.retained_published.load(Ordering::Relaxed),
            commands_received: self.commands_received.load(Ordering::Relaxed),
            replayed_messages: self.replayed_messages.load(Ordering::Relaxed),
            lwt_triggered: self.lwt_triggered.load(Ordering::Relaxed),
            anomalies_injected: self.anomalies_injected.load(Ordering::Relaxed),
            forced_terminations: self.forced_terminations.load(Ordering::Relaxed),
            devices_failed: self.devices_failed.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            throughput_per_second: f64::from_bits(self.throughput_bits.load(Ordering::Relaxed)),
            average_throughput,
            latency_p50_ms: as_millis(p50),
            latency_p90_ms: as_millis(p90),
            latency_p95_ms: as_millis(p95),
            latency_p99_ms: as_millis(p99),
            last_error: self.last_error.lock().clone(),
        }
    }

    /// Display a formatted snapshot to stdout.
    pub fn display_snapshot(job_id: &str, snapshot: &MetricsSnapshot) {
        println!("--- {} ---", job_id);
        println!(
            "Connections: {} ok / {} failed | Active: {} | Reconnects: {}",
            snapshot.connections_succeeded,
            snapshot.connections_failed,
            snapshot.active_sessions,
            snapshot.reconnects
        );
        println!(
            "Published: {} | Failures: {} | Received: {} | {:.1} msg/s",
            snapshot.messages_published,
            snapshot.publish_failures,
            snapshot.messages_received,
            snapshot.throughput_per_second
        );
        println!(
            "Latency p50: {:.1}ms | p90: {:.1}ms | p95: {:.1}ms | p99: {:.1}ms",
            snapshot.latency_p50_ms,
            snapshot.latency_p90_ms,
            snapshot.latency_p95_ms,
            snapshot.latency_p99_ms,
        );
    }

    /// Display a final result summary.
    pub fn display_final_summary(job_id: &str, state: &str, snapshot: &MetricsSnapshot) {
        println!("=== Final Result Summary ===");
        println!("Job:                 {} ({})", job_id, state);
        println!("Connections:         {}", snapshot.connections_attempted);
        println!("  succeeded:         {}", snapshot.connections_succeeded);
        println!("  failed:            {}", snapshot.connections_failed);
        println!("  reconnects:        {}", snapshot.reconnects);
        println!("Messages published:  {}", snapshot.messages_published);
        println!("Publish failures:    {}", snapshot.publish_failures);
        println!("Messages received:   {}", snapshot.messages_received);
        println!("Replayed messages:   {}", snapshot.replayed_messages);
        println!("LWT triggered:       {}", snapshot.lwt_triggered);
        println!("Forced terminations: {}", snapshot.forced_terminations);
        println!("Average throughput:  {:.1} msg/s", snapshot.average_throughput);
        println!(
            "Latency p50: {:.1}ms | p90: {:.1}ms | p95: {:.1}ms | p99: {:.1}ms",
            snapshot.latency_p50_ms,
            snapshot.latency_p90_ms,
            snapshot.latency_p95_ms,
            snapshot.latency_p99_ms,
        );
        if let Some(error) = &snapshot.last_error {
            println!("Last error:          {}", error);
        }
        println!("============================");
    }
}

impl Default for JobMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn as_millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Calculate percentiles from a slice of durations.
/// Returns (p50, p90, p95, p99). Returns Duration::ZERO for empty input.
pub fn calculate_percentiles(latencies: &[Duration]) -> (Duration, Duration, Duration, Duration) {
    if latencies.is_empty() {
        return (
            Duration::ZERO,
            Duration::ZERO,
            Duration::ZERO,
            Duration::ZERO,
        );
    }

    let mut sorted = latencies.to_vec();
    sorted.sort_unstable();

    (
        percentile_at(&sorted, 50.0),
        percentile_at(&sorted, 90.0),
        percentile_at(&sorted, 95.0),
        percentile_at(&sorted, 99.0),
    )
}

/// Nearest-rank percentile of a sorted, non-empty slice.
fn percentile_at(sorted: &[Duration], pct: f64) -> Duration {
    let len = sorted.len();
    let rank = (pct / 100.0 * len as f64).ceil() as usize;
    sorted[rank.saturating_sub(1).min(len - 1)]
}

/// Process-wide job lifecycle counters (not a cross-job metrics aggregate).
#[derive(Default)]
pub struct EngineCounters {
    jobs_started: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_stopped: AtomicU64,
    validation_rejections: AtomicU64,
    admission_rejections: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineCountersSnapshot {
    pub jobs_started: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_stopped: u64,
    pub validation_rejections: u64,
    pub admission_rejections: u64,
}

impl EngineCounters {
    pub fn record_started(&self) {
        self.jobs_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stopped(&self) {
        self.jobs_stopped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_validation_rejection(&self) {
        self.validation_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_admission_rejection(&self) {
        self.admission_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineCountersSnapshot {
        EngineCountersSnapshot {
            jobs_started: self.jobs_started.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_stopped: self.jobs_stopped.load(Ordering::Relaxed),
            validation_rejections: self.validation_rejections.load(Ordering::Relaxed),
            admission_rejections: self.admission_rejections.load(Ordering::Relaxed),
        }
    }
}
