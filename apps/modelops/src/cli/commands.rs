//! # CLI Command Implementations

use crate::api::{self, ServedModel};
use crate::collaborators::{CommandTrainer, FileHealthSource, run_data_command};
use crate::config::Settings;
use crate::daemon::{run_monitor, stop_on_ctrl_c};
use crate::locking::FileModelLock;
use crate::supervisor::OsProcessManager;
use modelops_core::health::EvaluationWindow;
use modelops_core::primitives::now_millis;
use modelops_core::{
    HealthEvaluator, HealthSource, LifecycleController, ModelRegistry, ModelStatus, Monitor,
    OpsError, ServeCommand, Stage, TransitionReport, Version, open_registry,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Timeout for one `/health` probe in `test`.
const SMOKE_TEST_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// WIRING
// =============================================================================

/// Open the tracking store and check it answers.
fn connect(settings: &Settings) -> Result<Arc<dyn ModelRegistry>, OpsError> {
    let registry = open_registry(&settings.tracking_uri)?;
    registry.ping()?;
    Ok(registry)
}

/// Controller over the tracking store and OS serving processes. Operations
/// are serialized per model with every other modelops process sharing the
/// run directory.
fn open_controller(settings: &Settings) -> Result<Arc<LifecycleController>, OpsError> {
    let registry = connect(settings)?;
    let processes = Arc::new(OsProcessManager::new(
        &settings.run_dir,
        settings.shutdown_timeout,
    )?);
    let trainer = Arc::new(CommandTrainer::new(
        Arc::clone(&registry),
        settings.train_command.clone(),
        settings.data_version.clone(),
    ));
    let plan = settings.deployment_plan(default_serve_command(settings)?);
    let locks = Arc::new(FileModelLock::new(&settings.run_dir)?);
    Ok(Arc::new(
        LifecycleController::new(registry, processes, trainer, plan).with_model_lock(locks),
    ))
}

/// This binary's own `serve` verb. The tracking URI is passed through so the
/// child reads the same store even when it came from a config file.
pub fn default_serve_command(settings: &Settings) -> Result<ServeCommand, OpsError> {
    let exe = std::env::current_exe()
        .map_err(|e| OpsError::Process(format!("cannot locate own executable: {}", e)))?;
    let mut command = ServeCommand::new(exe.to_string_lossy())
        .arg("serve")
        .arg("--stage")
        .arg("{stage}")
        .arg("--port")
        .arg("{port}")
        .arg("--model")
        .arg("{model}")
        .arg("--version")
        .arg("{version}")
        .arg("--quiet");
    command
        .env
        .insert("TRACKING_URI".to_string(), settings.tracking_uri.clone());
    Ok(command)
}

/// Run blocking controller work off the async runtime.
async fn blocking<T, F>(work: F) -> Result<T, OpsError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, OpsError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| OpsError::Process(format!("background task failed: {}", e)))?
}

fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_default()
    );
}

fn print_transition(report: &TransitionReport, json_mode: bool) {
    if json_mode {
        print_json(report);
        return;
    }
    let previous = report
        .previous
        .map(|v| format!(" (was v{})", v))
        .unwrap_or_default();
    println!(
        "{}: {} v{} on port {} (pid {}){}",
        report.operation,
        report.model,
        report.version,
        report.handle.port,
        report.handle.pid,
        previous
    );
}

// =============================================================================
// SETUP / DATA / TRAIN
// =============================================================================

/// Create working directories and initialise the tracking store.
pub async fn cmd_setup(settings: &Settings, json_mode: bool) -> Result<(), OpsError> {
    for dir in [&settings.monitoring_dir, &settings.run_dir] {
        std::fs::create_dir_all(dir).map_err(|e| {
            OpsError::IoError(format!("Cannot create '{}': {}", dir.display(), e))
        })?;
    }
    connect(settings)?;

    if json_mode {
        print_json(&serde_json::json!({
            "tracking_uri": settings.tracking_uri,
            "monitoring_dir": settings.monitoring_dir,
            "run_dir": settings.run_dir,
        }));
    } else {
        println!("Tracking store ready: {}", settings.tracking_uri);
        println!("Monitoring data:      {}", settings.monitoring_dir.display());
        println!("Process records:      {}", settings.run_dir.display());
    }
    Ok(())
}

/// Run the dataset preparation command.
pub async fn cmd_data(settings: &Settings, json_mode: bool) -> Result<(), OpsError> {
    let argv = settings.data_command.clone();
    let data_version = settings.data_version.clone();
    blocking(move || run_data_command(argv.as_deref(), &data_version)).await?;

    if json_mode {
        print_json(&serde_json::json!({ "data_version": settings.data_version }));
    } else {
        println!("Dataset {} prepared", settings.data_version);
    }
    Ok(())
}

/// Train and register a new version.
pub async fn cmd_train(settings: &Settings, json_mode: bool) -> Result<(), OpsError> {
    use modelops_core::Trainer;

    let registry = connect(settings)?;
    let trainer = CommandTrainer::new(
        Arc::clone(&registry),
        settings.train_command.clone(),
        settings.data_version.clone(),
    );
    let model = settings.model_name.clone();
    let trained = blocking(move || trainer.train(&model)).await?;
    let record = registry.get_version(&trained.model, trained.version)?;

    if json_mode {
        print_json(&record);
    } else {
        println!("Registered {}", trained);
        for (name, value) in &record.metadata.metrics {
            println!("  {:<8} {:.4}", name, value);
        }
    }
    Ok(())
}

// =============================================================================
// SERVE / TEST
// =============================================================================

/// Run the serving shell until SIGTERM or Ctrl+C.
pub async fn cmd_serve(
    settings: &Settings,
    stage: Option<&str>,
    host: &str,
    port: Option<u16>,
    version: Option<&str>,
) -> Result<(), OpsError> {
    let stage = match stage {
        Some(s) => s.parse()?,
        None => settings.model_stage,
    };
    let port = match port {
        Some(p) => p,
        None => settings.deployment_plan(ServeCommand::default()).port_for(stage)?,
    };
    // An unresolved `{version}` placeholder renders as an empty string.
    let version = version
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| {
            v.trim_start_matches('v')
                .parse::<u64>()
                .map(Version)
                .map_err(|_| OpsError::InvalidInput(format!("invalid version '{}'", v)))
        })
        .transpose()?;

    let record = version.and_then(|v| {
        open_registry(&settings.tracking_uri)
            .and_then(|registry| registry.get_version(&settings.model_name, v))
            .map_err(|e| tracing::warn!(error = %e, "serving without registry metadata"))
            .ok()
    });

    let served = ServedModel {
        model: settings.model_name.clone(),
        stage,
        port,
        version,
        record,
        started_at_ms: now_millis(),
    };
    tracing::info!(
        model = %served.model,
        stage = %stage,
        version = ?version.map(Version::value),
        "starting serving shell"
    );

    let addr = format!("{}:{}", host, port);
    api::run_server(&addr, served, api::termination_signal()).await
}

/// Result of one `/health` probe.
#[derive(Debug, Serialize)]
struct SmokeResult {
    stage: Stage,
    port: u16,
    ok: bool,
    detail: String,
}

/// Smoke-check `/health` of every running serving process.
pub async fn cmd_test(settings: &Settings, json_mode: bool) -> Result<(), OpsError> {
    let controller = open_controller(settings)?;
    let model = settings.model_name.clone();
    let status = blocking(move || controller.status(&model)).await?;

    let targets: Vec<(Stage, u16)> = [&status.staging_process, &status.production_process]
        .into_iter()
        .flatten()
        .map(|h| (h.stage, h.port))
        .collect();
    if targets.is_empty() {
        return Err(OpsError::NotFound(format!(
            "no serving process is running for {}",
            status.model
        )));
    }

    let client = reqwest::Client::builder()
        .timeout(SMOKE_TEST_TIMEOUT)
        .build()
        .map_err(|e| OpsError::IoError(format!("HTTP client error: {}", e)))?;

    let mut results = Vec::with_capacity(targets.len());
    for (stage, port) in targets {
        let url = format!("http://127.0.0.1:{}/health", port);
        let result = match client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                let body = response.text().await.unwrap_or_default();
                SmokeResult {
                    stage,
                    port,
                    ok: true,
                    detail: body,
                }
            }
            Ok(response) => SmokeResult {
                stage,
                port,
                ok: false,
                detail: format!("HTTP {}", response.status()),
            },
            Err(e) => SmokeResult {
                stage,
                port,
                ok: false,
                detail: e.to_string(),
            },
        };
        results.push(result);
    }

    if json_mode {
        print_json(&results);
    } else {
        for r in &results {
            let mark = if r.ok { "ok  " } else { "FAIL" };
            println!("[{}] {:<10} :{}  {}", mark, r.stage, r.port, r.detail);
        }
    }

    let failed = results.iter().filter(|r| !r.ok).count();
    if failed > 0 {
        return Err(OpsError::Process(format!(
            "{} of {} serving processes failed the health check",
            failed,
            results.len()
        )));
    }
    Ok(())
}

// =============================================================================
// DEPLOYMENT
// =============================================================================

/// setup, data, train, staging, promote.
pub async fn cmd_pipeline(settings: &Settings, json_mode: bool) -> Result<(), OpsError> {
    cmd_setup(settings, json_mode).await?;
    if settings.data_command.is_some() {
        cmd_data(settings, json_mode).await?;
    } else {
        tracing::info!("DATA_COMMAND not configured, skipping data preparation");
    }
    cmd_train(settings, json_mode).await?;
    cmd_staging(settings, json_mode).await?;
    cmd_promote(settings, json_mode).await
}

/// Deploy the latest registered version to staging.
pub async fn cmd_staging(settings: &Settings, json_mode: bool) -> Result<(), OpsError> {
    let controller = open_controller(settings)?;
    let model = settings.model_name.clone();
    let report = blocking(move || controller.deploy_staging(&model)).await?;
    print_transition(&report, json_mode);
    Ok(())
}

/// Promote the staging version to production.
pub async fn cmd_promote(settings: &Settings, json_mode: bool) -> Result<(), OpsError> {
    let controller = open_controller(settings)?;
    let model = settings.model_name.clone();
    let report = blocking(move || controller.promote(&model)).await?;
    print_transition(&report, json_mode);
    Ok(())
}

/// Restore the previous production version.
pub async fn cmd_rollback(settings: &Settings, json_mode: bool) -> Result<(), OpsError> {
    let controller = open_controller(settings)?;
    let model = settings.model_name.clone();
    let report = blocking(move || controller.rollback(&model)).await?;
    print_transition(&report, json_mode);
    Ok(())
}

/// Restart or stop serving processes to match the registry.
pub async fn cmd_reconcile(settings: &Settings, json_mode: bool) -> Result<(), OpsError> {
    let controller = open_controller(settings)?;
    let model = settings.model_name.clone();
    let report = blocking(move || controller.reconcile(&model)).await?;

    if json_mode {
        print_json(&report);
        return Ok(());
    }
    for handle in &report.running {
        let version = handle.version.map(|v| format!("v{}", v)).unwrap_or_default();
        println!(
            "running  {:<10} :{} pid {} {}",
            handle.stage, handle.port, handle.pid, version
        );
    }
    for stage in &report.stopped {
        println!("stopped  {}", stage);
    }
    if report.running.is_empty() && report.stopped.is_empty() {
        println!("Nothing to reconcile for {}", report.model);
    }
    Ok(())
}

/// Registry state plus live processes.
pub async fn cmd_status(settings: &Settings, json_mode: bool) -> Result<(), OpsError> {
    let controller = open_controller(settings)?;
    let model = settings.model_name.clone();
    let status = blocking(move || controller.status(&model)).await?;

    if json_mode {
        print_json(&status);
        return Ok(());
    }
    print_status(&status);
    Ok(())
}

fn print_status(status: &ModelStatus) {
    let describe = |stage: Stage, record: Option<&modelops_core::ModelVersion>| match record {
        Some(r) => format!("v{} ({})", r.version, stage),
        None => "-".to_string(),
    };
    let history: Vec<String> = status
        .production_history
        .iter()
        .map(|v| format!("v{}", v))
        .collect();

    println!("modelops Status");
    println!("===============");
    println!("Model:      {}", status.model);
    println!("State:      {:?}", status.state);
    println!("Versions:   {}", status.version_count);
    println!(
        "Staging:    {}",
        describe(Stage::Staging, status.staging.as_ref())
    );
    println!(
        "Production: {}",
        describe(Stage::Production, status.production.as_ref())
    );
    println!("History:    {}", history.join(" -> "));
    println!();
    for handle in [&status.staging_process, &status.production_process]
        .into_iter()
        .flatten()
    {
        let version = handle.version.map(|v| format!("v{}", v)).unwrap_or_default();
        println!(
            "Process:    {:<10} :{} pid {} {}",
            handle.stage, handle.port, handle.pid, version
        );
    }
}

// =============================================================================
// MONITORING
// =============================================================================

/// Run the monitor loop until Ctrl+C (or `ticks` ticks).
pub async fn cmd_monitor_start(settings: &Settings, ticks: Option<u64>) -> Result<(), OpsError> {
    let controller = open_controller(settings)?;
    let source = Arc::new(FileHealthSource::new(&settings.monitoring_dir));
    let monitor = Monitor::new(
        controller,
        source,
        settings.thresholds(),
        settings.model_name.clone(),
    )
    .with_window(settings.performance_window);

    let summary = run_monitor(
        monitor,
        settings.monitoring_interval,
        ticks,
        stop_on_ctrl_c(),
    )
    .await;
    tracing::info!(
        ticks = summary.ticks,
        breaches = summary.breaches,
        retrains = summary.retrains,
        "monitor finished"
    );
    Ok(())
}

/// Evaluate performance over the configured window.
pub async fn cmd_monitor_performance(settings: &Settings, json_mode: bool) -> Result<(), OpsError> {
    let source = FileHealthSource::new(&settings.monitoring_dir);
    let window_ms = u64::try_from(settings.performance_window.as_millis()).unwrap_or(u64::MAX);
    let window = EvaluationWindow::ending_at(now_millis(), window_ms);
    let outcomes = source.outcomes(&settings.model_name, window)?;
    let report =
        HealthEvaluator::new(settings.drift_threshold).evaluate_performance(&outcomes, window)?;
    let below = report.score < settings.performance_threshold;

    if json_mode {
        print_json(&serde_json::json!({
            "report": report,
            "floor": settings.performance_threshold,
            "below_floor": below,
        }));
    } else {
        println!("Score (R²): {:.4}", report.score);
        println!("RMSE:       {:.4}", report.rmse);
        println!("MAE:        {:.4}", report.mae);
        println!("Samples:    {}", report.samples);
        if below {
            println!(
                "Below floor {:.4}: retraining recommended",
                settings.performance_threshold
            );
        }
    }
    Ok(())
}

/// Compare reference and current feature distributions.
pub async fn cmd_monitor_drift(settings: &Settings, json_mode: bool) -> Result<(), OpsError> {
    let source = FileHealthSource::new(&settings.monitoring_dir);
    let reference = source.reference(&settings.model_name)?;
    let current = source.current(&settings.model_name)?;
    let report =
        HealthEvaluator::new(settings.drift_threshold).evaluate_drift(&reference, &current)?;

    if json_mode {
        print_json(&report);
    } else {
        for (feature, psi) in &report.per_feature {
            println!("  {:<24} PSI {:.4}", feature, psi);
        }
        let worst = report.feature.as_deref().unwrap_or("-");
        println!(
            "Drift {} (max PSI {:.4} on {}, sensitivity {:.4})",
            if report.detected { "DETECTED" } else { "not detected" },
            report.magnitude,
            worst,
            settings.drift_threshold
        );
    }
    Ok(())
}

/// Retrain and redeploy immediately.
pub async fn cmd_monitor_retrain(settings: &Settings, json_mode: bool) -> Result<(), OpsError> {
    let controller = open_controller(settings)?;
    let model = settings.model_name.clone();
    let report = blocking(move || controller.retrain_and_redeploy(&model)).await?;
    print_transition(&report, json_mode);
    Ok(())
}
