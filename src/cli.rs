// CLI subcommand definitions using clap derive macros
use clap::Parser;
use std::path::{Path, PathBuf};

use crate::config::SafetyLimits;
use crate::error::EngineError;
use crate::rate::SafetyController;
use crate::reporter::{compare_reports, load_json_report};
use crate::spec::{ExpectedCounts, TestSpec, TestType};

/// IoTデバイス群の負荷試験エンジン
#[derive(Parser, Debug, PartialEq)]
#[command(name = "iot-load-engine")]
pub enum Cli {
    /// テスト仕様を検証し、期待メッセージ数を表示する
    Validate {
        /// JSONテスト仕様ファイル
        spec: PathBuf,
        /// テスト種別の上書き（POST /tests/{testType} と同じ扱い）
        #[arg(long, value_enum)]
        test_type: Option<TestType>,
    },
    /// 内蔵のシミュレーションブローカーに対してジョブを実行する
    Simulate {
        /// JSONテスト仕様ファイル
        spec: PathBuf,
        /// テスト種別の上書き
        #[arg(long, value_enum)]
        test_type: Option<TestType>,
        /// エンジン設定ファイル
        #[arg(long)]
        config: Option<PathBuf>,
        /// JSONレポート出力先
        #[arg(long)]
        output: Option<PathBuf>,
        /// ログレベル（RUST_LOG が優先される）
        #[arg(long, default_value = "info")]
        log_level: String,
        /// 接続失敗の注入率 (0.0-1.0)
        #[arg(long, default_value_t = 0.0)]
        connect_failure_rate: f64,
        /// 送信失敗の注入率 (0.0-1.0)
        #[arg(long, default_value_t = 0.0)]
        publish_failure_rate: f64,
        /// QoS 1/2 の応答遅延（ミリ秒）
        #[arg(long, default_value_t = 0)]
        latency_ms: u64,
    },
    /// 2つのジョブレポートを比較する
    Compare {
        /// 現在のレポートJSON
        current: PathBuf,
        /// 過去のレポートJSON
        previous: PathBuf,
    },
}

/// Read a spec file and apply an optional test type override.
pub fn load_spec(path: &Path, test_type: Option<TestType>) -> Result<TestSpec, EngineError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        EngineError::Config(format!(
            "Failed to read spec file '{}': {}",
            path.display(),
            e
        ))
    })?;
    let spec = TestSpec::from_json(&text)?;
    Ok(match test_type {
        Some(t) => spec.with_type_overrides(t),
        None => spec,
    })
}

/// validateサブコマンドの実行
///
/// 仕様の範囲チェックと、既定の安全上限に対する構造チェックを行い、
/// 期待値をJSONで標準出力に表示する。
pub fn run_validate(path: &Path, test_type: Option<TestType>) -> Result<ExpectedCounts, EngineError> {
    let spec = load_spec(path, test_type)?;
    spec.ensure_valid()?;
    SafetyController::new(SafetyLimits::default()).check_structural(&spec)?;

    let expected = spec.expected_counts();
    let json = serde_json::to_string_pretty(&expected)
        .map_err(|e| EngineError::Config(format!("Failed to serialize expectations: {}", e)))?;
    println!("{}", json);
    Ok(expected)
}

/// compareサブコマンドの実行
pub fn run_compare(current_path: &Path, previous_path: &Path) -> anyhow::Result<()> {
    let current = load_json_report(current_path)?;
    let previous = load_json_report(previous_path)?;
    let report = compare_reports(&current, &previous);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_spec(dir: &TempDir, json: &str) -> PathBuf {
        let path = dir.path().join("spec.json");
        std::fs::write(&path, json).unwrap();
        path
    }

    // === validate サブコマンドテスト ===

    #[test]
    fn test_validate_parses_path_and_type() {
        let cli = Cli::try_parse_from(["iot-load-engine", "validate", "spec.json", "--test-type", "burst"]);
        assert_eq!(
            cli.unwrap(),
            Cli::Validate {
                spec: PathBuf::from("spec.json"),
                test_type: Some(TestType::Burst),
            }
        );
    }

    #[test]
    fn test_validate_rejects_unknown_type() {
        let cli = Cli::try_parse_from(["iot-load-engine", "validate", "spec.json", "--test-type", "soak"]);
        assert!(cli.is_err());
    }

    #[test]
    fn test_run_validate_returns_expected_counts() {
        let dir = TempDir::new().unwrap();
        let path = write_spec(&dir, r#"{"brokerUrl":"mqtt://sim","devices":100,"runtimeSeconds":60}"#);
        let expected = run_validate(&path, None).unwrap();
        assert_eq!(expected.messages_per_device, 60);
        assert_eq!(expected.total_messages, 6_000);
    }

    #[test]
    fn test_run_validate_applies_type_override() {
        let dir = TempDir::new().unwrap();
        let path = write_spec(
            &dir,
            r#"{"brokerUrl":"mqtt://sim","devices":500,"runtimeSeconds":120,"churnIntervalSeconds":10}"#,
        );
        let expected = run_validate(&path, Some(TestType::Churn)).unwrap();
        assert_eq!(expected.reconnects_per_device, 12);
    }

    #[test]
    fn test_run_validate_rejects_out_of_range() {
        let dir = TempDir::new().unwrap();
        let path = write_spec(&dir, r#"{"brokerUrl":"mqtt://sim","devices":100001}"#);
        let err = run_validate(&path, None).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_run_validate_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = run_validate(&dir.path().join("nope.json"), None).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    // === simulate サブコマンドテスト ===

    #[test]
    fn test_simulate_defaults() {
        let cli = Cli::try_parse_from(["iot-load-engine", "simulate", "spec.json"]).unwrap();
        match cli {
            Cli::Simulate {
                spec,
                test_type,
                config,
                output,
                log_level,
                connect_failure_rate,
                publish_failure_rate,
                latency_ms,
            } => {
                assert_eq!(spec, PathBuf::from("spec.json"));
                assert!(test_type.is_none());
                assert!(config.is_none());
                assert!(output.is_none());
                assert_eq!(log_level, "info");
                assert_eq!(connect_failure_rate, 0.0);
                assert_eq!(publish_failure_rate, 0.0);
                assert_eq!(latency_ms, 0);
            }
            _ => panic!("Expected Simulate"),
        }
    }

    #[test]
    fn test_simulate_with_faults() {
        let cli = Cli::try_parse_from([
            "iot-load-engine",
            "simulate",
            "spec.json",
            "--connect-failure-rate",
            "0.25",
            "--latency-ms",
            "15",
            "--output",
            "out.json",
        ])
        .unwrap();
        match cli {
            Cli::Simulate {
                connect_failure_rate,
                latency_ms,
                output,
                ..
            } => {
                assert_eq!(connect_failure_rate, 0.25);
                assert_eq!(latency_ms, 15);
                assert_eq!(output, Some(PathBuf::from("out.json")));
            }
            _ => panic!("Expected Simulate"),
        }
    }

    // === compare サブコマンドテスト ===

    #[test]
    fn test_compare_requires_two_paths() {
        assert!(Cli::try_parse_from(["iot-load-engine", "compare", "a.json"]).is_err());
        assert!(Cli::try_parse_from(["iot-load-engine", "compare", "a.json", "b.json"]).is_ok());
    }

    #[test]
    fn test_run_compare_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(run_compare(&missing, &missing).is_err());
    }
}
