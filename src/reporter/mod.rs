// Reporter module - job report data model, JSON output and run comparison
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::config::EngineConfig;
use crate::job::{JobState, JobView};
use crate::spec::{ExpectedCounts, TestSpec, TestType};

/// 1ジョブの実行結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub spec: TestSpec,
    pub config: EngineConfig,
    pub expected: ExpectedCounts,
    pub job: JobView,
    /// Accounting discrepancies found by `check_expectations`.
    #[serde(default)]
    pub discrepancies: Vec<String>,
}

impl JobReport {
    pub fn new(spec: TestSpec, config: EngineConfig, job: JobView) -> Self {
        let expected = spec.expected_counts();
        let mut report = Self {
            spec,
            config,
            expected,
            job,
            discrepancies: Vec::new(),
        };
        report.discrepancies = check_expectations(&report);
        report
    }

    pub fn passed(&self) -> bool {
        self.job.state == JobState::Completed && self.discrepancies.is_empty()
    }
}

/// 2回の実行結果の比較
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonReport {
    pub throughput_change_pct: f64,
    pub latency_p50_change_pct: f64,
    pub latency_p90_change_pct: f64,
    pub latency_p95_change_pct: f64,
    pub latency_p99_change_pct: f64,
    pub failure_rate_change: f64,
    pub improvements: Vec<String>,
    pub regressions: Vec<String>,
}

/// JSONレポートをファイルに書き出す
pub fn write_json_report(report: &JobReport, path: &Path) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json)?;
    Ok(())
}

pub fn load_json_report(path: &Path) -> anyhow::Result<JobReport> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Compare what a completed job did against what its test type promises.
/// Devices that failed are excluded from the message expectation.
pub fn check_expectations(report: &JobReport) -> Vec<String> {
    let mut found = Vec::new();
    if report.job.state != JobState::Completed {
        return found;
    }
    let metrics = &report.job.metrics;
    let expected = &report.expected;
    let healthy = (report.spec.devices as u64).saturating_sub(metrics.devices_failed);

    let expected_messages = expected.messages_per_device * healthy;
    let accounted = metrics.messages_published + metrics.publish_failures;
    if report.spec.test_type == TestType::Command {
        // a missed command produces a failure and no response
        if metrics.messages_published > expected_messages {
            found.push(format!(
                "published {} messages, at most {} expected",
                metrics.messages_published, expected_messages
            ));
        }
    } else if accounted < expected_messages {
        found.push(format!(
            "published {} messages ({} failed), expected {}",
            metrics.messages_published, metrics.publish_failures, expected_messages
        ));
    }

    let expected_reconnects = expected.reconnects_per_device * healthy;
    if metrics.reconnects < expected_reconnects {
        found.push(format!(
            "{} reconnects, expected {}",
            metrics.reconnects, expected_reconnects
        ));
    }
    let expected_lwt = expected.lwt_per_device * healthy;
    if metrics.lwt_triggered != expected_lwt {
        found.push(format!(
            "{} last-will triggers, expected {}",
            metrics.lwt_triggered, expected_lwt
        ));
    }
    found
}

/// パーセンテージ変化を計算する。previous が 0 の場合は 0.0 を返す。
fn pct_change(current: f64, previous: f64) -> f64 {
    if previous == 0.0 {
        0.0
    } else {
        (current - previous) / previous * 100.0
    }
}

fn failure_rate(report: &JobReport) -> f64 {
    let m = &report.job.metrics;
    let attempts = m.messages_published + m.publish_failures;
    if attempts == 0 {
        0.0
    } else {
        m.publish_failures as f64 / attempts as f64
    }
}

/// 2つのレポートを比較する
pub fn compare_reports(current: &JobReport, previous: &JobReport) -> ComparisonReport {
    let cur = &current.job.metrics;
    let prev = &previous.job.metrics;
    let throughput_change_pct = pct_change(cur.average_throughput, prev.average_throughput);
    let latency_p50_change_pct = pct_change(cur.latency_p50_ms, prev.latency_p50_ms);
    let latency_p90_change_pct = pct_change(cur.latency_p90_ms, prev.latency_p90_ms);
    let latency_p95_change_pct = pct_change(cur.latency_p95_ms, prev.latency_p95_ms);
    let latency_p99_change_pct = pct_change(cur.latency_p99_ms, prev.latency_p99_ms);
    let failure_rate_change = failure_rate(current) - failure_rate(previous);

    let mut improvements = Vec::new();
    let mut regressions = Vec::new();

    if throughput_change_pct > 0.0 {
        improvements.push(format!("Throughput improved by {:.1}%", throughput_change_pct));
    } else if throughput_change_pct < 0.0 {
        regressions.push(format!(
            "Throughput regressed by {:.1}%",
            throughput_change_pct.abs()
        ));
    }

    // Latency: lower is better
    for (name, change) in [
        ("p50 latency", latency_p50_change_pct),
        ("p90 latency", latency_p90_change_pct),
        ("p95 latency", latency_p95_change_pct),
        ("p99 latency", latency_p99_change_pct),
    ] {
        if change < 0.0 {
            improvements.push(format!("{} improved by {:.1}%", name, change.abs()));
        } else if change > 0.0 {
            regressions.push(format!("{} regressed by {:.1}%", name, change));
        }
    }

    if failure_rate_change < 0.0 {
        improvements.push(format!(
            "Publish failure rate improved by {:.4}",
            failure_rate_change.abs()
        ));
    } else if failure_rate_change > 0.0 {
        regressions.push(format!(
            "Publish failure rate regressed by {:.4}",
            failure_rate_change
        ));
    }

    ComparisonReport {
        throughput_change_pct,
        latency_p50_change_pct,
        latency_p90_change_pct,
        latency_p95_change_pct,
        latency_p99_change_pct,
        failure_rate_change,
        improvements,
        regressions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ExpectedMessages;
    use crate::stats::JobMetrics;
    use chrono::Utc;
    use tempfile::TempDir;

    /// テスト用のJobReportを生成するヘルパー
    fn make_report(test_type: TestType, devices: u32, runtime: u32) -> JobReport {
        let spec = TestSpec {
            broker_url: "mqtt://sim".to_string(),
            test_type,
            devices,
            runtime_seconds: runtime,
            ..TestSpec::default()
        };
        let expected = spec.expected_counts();
        let job = JobView {
            job_id: "job-1".to_string(),
            state: JobState::Completed,
            protocol: spec.protocol,
            test_type,
            devices,
            runtime_seconds: runtime,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            ended_at: Some(Utc::now()),
            elapsed_seconds: runtime as f64,
            expected_messages: ExpectedMessages {
                per_device: expected.messages_per_device,
                total: expected.total_messages,
            },
            metrics: JobMetrics::new().snapshot(),
            error: None,
        };
        JobReport {
            spec,
            config: EngineConfig::default(),
            expected,
            job,
            discrepancies: Vec::new(),
        }
    }

    // ===== 期待値チェック =====

    #[test]
    fn test_exact_telemetry_run_has_no_discrepancies() {
        let mut report = make_report(TestType::Telemetry, 100, 60);
        report.job.metrics.messages_published = 6_000;
        assert!(check_expectations(&report).is_empty());
    }

    #[test]
    fn test_missing_messages_reported() {
        let mut report = make_report(TestType::Telemetry, 100, 60);
        report.job.metrics.messages_published = 5_000;
        let found = check_expectations(&report);
        assert_eq!(found.len(), 1);
        assert!(found[0].contains("expected 6000"));
    }

    #[test]
    fn test_failed_devices_excluded() {
        let mut report = make_report(TestType::Telemetry, 10, 60);
        report.job.metrics.devices_failed = 2;
        report.job.metrics.messages_published = 480;
        assert!(check_expectations(&report).is_empty());
    }

    #[test]
    fn test_lwt_count_must_be_exact() {
        let mut report = make_report(TestType::Lwt, 10, 60);
        report.job.metrics.messages_published = 300;
        report.job.metrics.lwt_triggered = 11;
        let found = check_expectations(&report);
        assert_eq!(found.len(), 1);
        assert!(found[0].contains("last-will"));
    }

    #[test]
    fn test_stopped_job_not_checked() {
        let mut report = make_report(TestType::Churn, 10, 60);
        report.job.state = JobState::Stopped;
        assert!(check_expectations(&report).is_empty());
        assert!(!report.passed());
    }

    // ===== ファイル入出力 =====

    #[test]
    fn test_write_and_load_report() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.json");
        let mut report = make_report(TestType::Burst, 5, 120);
        report.job.metrics.messages_published = 1_950;
        write_json_report(&report, &path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"messagesPublished\": 1950"));
        let loaded = load_json_report(&path).unwrap();
        assert_eq!(loaded, report);
    }

    #[test]
    fn test_load_missing_report_fails() {
        let dir = TempDir::new().unwrap();
        assert!(load_json_report(&dir.path().join("missing.json")).is_err());
    }

    // ===== 比較 =====

    #[test]
    fn test_compare_improvement_and_regression() {
        let mut previous = make_report(TestType::Telemetry, 10, 60);
        previous.job.metrics.average_throughput = 100.0;
        previous.job.metrics.latency_p50_ms = 10.0;
        previous.job.metrics.latency_p99_ms = 40.0;
        let mut current = previous.clone();
        current.job.metrics.average_throughput = 150.0;
        current.job.metrics.latency_p50_ms = 5.0;
        current.job.metrics.latency_p99_ms = 60.0;

        let cmp = compare_reports(&current, &previous);
        assert!((cmp.throughput_change_pct - 50.0).abs() < 1e-9);
        assert!((cmp.latency_p50_change_pct + 50.0).abs() < 1e-9);
        assert!(cmp.improvements.iter().any(|s| s.starts_with("Throughput")));
        assert!(cmp.regressions.iter().any(|s| s.starts_with("p99 latency")));
    }

    #[test]
    fn test_compare_zero_baseline() {
        let report = make_report(TestType::Telemetry, 1, 10);
        let cmp = compare_reports(&report, &report);
        assert_eq!(cmp.throughput_change_pct, 0.0);
        assert!(cmp.improvements.is_empty());
        assert!(cmp.regressions.is_empty());
    }
}
