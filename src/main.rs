use clap::Parser;
use iot_load_engine::cli::{load_spec, run_compare, run_validate, Cli};
use iot_load_engine::config::{self, EngineConfig};
use iot_load_engine::job::JobManager;
use iot_load_engine::reporter::{self, JobReport};
use iot_load_engine::spec::TestType;
use iot_load_engine::stats::JobMetrics;
use iot_load_engine::transport::sim::{SimBroker, SimFaults};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Asynchronously waits until the given `AtomicBool` flag becomes `true`.
async fn wait_for_shutdown(flag: &AtomicBool) {
    loop {
        if flag.load(Ordering::Relaxed) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// RUST_LOG wins over the --log-level flag.
fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

struct SimulateArgs {
    spec: PathBuf,
    test_type: Option<TestType>,
    config: Option<PathBuf>,
    output: Option<PathBuf>,
    faults: SimFaults,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli {
        Cli::Validate { spec, test_type } => run_validate(&spec, test_type)
            .map(|_| ())
            .map_err(anyhow::Error::from),
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
            init_tracing(&log_level);
            let args = SimulateArgs {
                spec,
                test_type,
                config,
                output,
                faults: SimFaults {
                    connect_failure_rate,
                    publish_failure_rate,
                    latency: Duration::from_millis(latency_ms),
                    ..SimFaults::default()
                },
            };
            run_simulation(args).await
        }
        Cli::Compare { current, previous } => run_compare(&current, &previous),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    Ok(match path {
        Some(path) => config::load_from_file(path)?,
        None => EngineConfig::default(),
    })
}

async fn run_simulation(args: SimulateArgs) -> anyhow::Result<()> {
    let cfg = load_config(args.config.as_deref())?;
    let spec = load_spec(&args.spec, args.test_type)?;

    let broker = SimBroker::new();
    broker.set_faults(args.faults);
    let manager = Arc::new(JobManager::new(cfg.clone(), Arc::new(broker.connector())));
    let reaper = manager.spawn_reaper();

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    {
        let flag = shutdown_flag.clone();
        ctrlc::set_handler(move || {
            flag.store(true, Ordering::Relaxed);
        })?;
    }

    let job_id = manager.create_job(spec.clone())?;
    info!(job_id = %job_id, test_type = %spec.test_type, devices = spec.devices, "job submitted");

    let completion = manager.wait_for_completion(&job_id);
    tokio::pin!(completion);
    let mut ticker = tokio::time::interval(cfg.snapshot_interval());
    let mut stopping = false;

    let view = loop {
        tokio::select! {
            view = &mut completion => break view?,
            _ = ticker.tick() => {
                if let Ok(view) = manager.get_status(&job_id) {
                    JobMetrics::display_snapshot(&job_id, &view.metrics);
                }
            }
            _ = wait_for_shutdown(&shutdown_flag), if !stopping => {
                stopping = true;
                warn!(job_id = %job_id, "interrupt received, stopping job");
                if let Err(e) = manager.stop_job(&job_id).await {
                    warn!(job_id = %job_id, error = %e, "stop request not applied");
                }
            }
        }
    };
    reaper.abort();

    JobMetrics::display_final_summary(&view.job_id, view.state.as_str(), &view.metrics);
    info!(
        connected_clients = broker.connected_clients(),
        will_deliveries = broker.stats().will_deliveries,
        "broker state after job"
    );

    let report = JobReport::new(spec, cfg, view);
    for discrepancy in &report.discrepancies {
        warn!(job_id = %job_id, "{}", discrepancy);
    }
    if let Some(path) = args.output.as_deref() {
        reporter::write_json_report(&report, path)?;
        info!(path = %path.display(), "report written");
    }
    if !report.passed() {
        anyhow::bail!(
            "job {} ended {} with {} discrepancies",
            report.job.job_id,
            report.job.state,
            report.discrepancies.len()
        );
    }
    Ok(())
}
