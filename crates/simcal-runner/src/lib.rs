pub mod calibration;
pub mod campaign;
pub mod config_patch;
pub mod error;
pub mod harness;
pub mod invoke;
pub mod output;
pub mod sandbox;
pub mod score;
pub mod tables;

pub use calibration::{Calibration, SettingBinding};
pub use campaign::{run_campaign, CampaignOptions, CampaignReport};
pub use config_patch::{ConfigSetting, Scope};
pub use harness::{
    EvaluationHarness, EvaluationResult, Failure, FailureKind, HarnessConfig, NonZeroExitPolicy,
    Objective, Outcome, Stage,
};
pub use invoke::CancelToken;
pub use sandbox::{Sandbox, SandboxLayout};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde_json::json;
use simcal_core::{atomic_write_json_pretty, ensure_dir, ParameterVector, WorkerId};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tables::ResultsTable;
use tracing::info;

pub struct RunResult {
    pub run_dir: PathBuf,
    pub run_id: String,
    pub evaluated: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub stopped: bool,
    pub best: Option<BestSample>,
}

#[derive(Debug, Clone)]
pub struct BestSample {
    pub index: usize,
    pub score: f64,
    pub parameters: ParameterVector,
}

/// Command-line overrides for one run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// CSV of sampled vectors; the best guess alone is evaluated when unset.
    pub samples: Option<PathBuf>,
    pub workers: Option<usize>,
    pub timeout_seconds: Option<u64>,
    pub limit: Option<usize>,
}

pub struct CalibrationSummary {
    pub campaign_id: String,
    pub template_dir: PathBuf,
    pub sandbox_root: PathBuf,
    pub sandbox_prefix: String,
    pub config_file: PathBuf,
    pub config_file_exists: bool,
    pub simulator_command: Vec<String>,
    pub timeout_seconds: Option<u64>,
    pub on_nonzero_exit: NonZeroExitPolicy,
    pub output_path: PathBuf,
    pub output_column: String,
    pub trim_trailing: usize,
    pub observations_path: PathBuf,
    pub observation_count: usize,
    pub parameter_count: usize,
    pub setting_count: usize,
    pub workers: usize,
}

struct RunControlGuard {
    run_dir: PathBuf,
    run_id: String,
    done: bool,
}

impl RunControlGuard {
    fn new(run_dir: &Path, run_id: &str) -> Self {
        Self {
            run_dir: run_dir.to_path_buf(),
            run_id: run_id.to_string(),
            done: false,
        }
    }

    fn complete(&mut self, status: &str) -> Result<()> {
        campaign::write_run_control(&self.run_dir, &self.run_id, status, std::process::id())?;
        self.done = true;
        Ok(())
    }
}

impl Drop for RunControlGuard {
    fn drop(&mut self) {
        if !self.done {
            let _ = campaign::write_run_control(
                &self.run_dir,
                &self.run_id,
                "failed",
                std::process::id(),
            );
        }
    }
}

pub fn describe_calibration(path: &Path) -> Result<CalibrationSummary> {
    describe_run(path, &RunOptions::default())
}

/// Summary of the calibration as `run_calibration` will see it, with the
/// `options` overrides applied.
pub fn describe_run(path: &Path, options: &RunOptions) -> Result<CalibrationSummary> {
    let calibration = load_with_overrides(path, options)?;
    let observed =
        tables::load_observations(&calibration.observations.path, &calibration.observations.column)?;
    let template_dir = calibration.template.dir.clone();
    Ok(CalibrationSummary {
        campaign_id: calibration.campaign.id.clone(),
        sandbox_root: calibration.template.layout.sandbox_root(&template_dir),
        sandbox_prefix: calibration.template.layout.prefix.clone(),
        config_file_exists: template_dir.join(&calibration.simulator.config_file).is_file(),
        config_file: calibration.simulator.config_file.clone(),
        simulator_command: calibration.simulator.command.clone(),
        timeout_seconds: calibration.simulator.timeout_seconds,
        on_nonzero_exit: calibration.simulator.on_nonzero_exit,
        output_path: calibration.output.path.clone(),
        output_column: calibration.output.column.to_string(),
        trim_trailing: calibration.output.trim_trailing,
        observations_path: calibration.observations.path.clone(),
        observation_count: observed.len(),
        parameter_count: calibration.parameters.len(),
        setting_count: calibration.settings.len(),
        workers: calibration.campaign.workers,
        template_dir,
    })
}

/// Evaluates the best-guess vector once, with `overrides` applied on top.
pub fn evaluate_once(
    path: &Path,
    overrides: &[(String, f64)],
    worker: Option<WorkerId>,
) -> Result<EvaluationResult> {
    let calibration = Calibration::load(path)?;
    let observed =
        tables::load_observations(&calibration.observations.path, &calibration.observations.column)?;
    let mut params = ParameterVector::best_guess(&calibration.parameters);
    for (name, value) in overrides {
        if !params.set(name, *value) {
            return Err(anyhow!("unknown parameter '{}'", name));
        }
    }
    let worker = worker.unwrap_or_else(|| WorkerId::for_process(0));
    let harness = EvaluationHarness::new(
        calibration.harness_config(),
        calibration.parameters.clone(),
        observed,
    );
    Ok(harness.evaluate(&worker, &params))
}

fn load_with_overrides(path: &Path, options: &RunOptions) -> Result<Calibration> {
    let mut calibration = Calibration::load(path)?;
    if let Some(workers) = options.workers {
        calibration.campaign.workers = workers;
    }
    if let Some(timeout) = options.timeout_seconds {
        calibration.simulator.timeout_seconds = Some(timeout);
    }
    calibration.validate()?;
    Ok(calibration)
}

pub fn run_calibration(path: &Path, options: &RunOptions) -> Result<RunResult> {
    let calibration = load_with_overrides(path, options)?;

    let observed =
        tables::load_observations(&calibration.observations.path, &calibration.observations.column)?;
    let mut samples = match &options.samples {
        Some(samples_path) => tables::load_samples(samples_path, &calibration.parameters)?,
        None => vec![ParameterVector::best_guess(&calibration.parameters)],
    };
    if let Some(limit) = options.limit {
        samples.truncate(limit);
    }

    let project_root = calibration_dir(path);
    let (run_id, run_dir) = create_run_dir(&project_root)?;
    campaign::write_run_control(&run_dir, &run_id, "running", std::process::id())?;
    let mut run_guard = RunControlGuard::new(&run_dir, &run_id);
    info!(run_id = %run_id, samples = samples.len(), "run started");

    atomic_write_json_pretty(
        &run_dir.join("resolved_calibration.json"),
        &serde_json::to_value(&calibration)?,
    )?;

    let cancel = CancelToken::new();
    let harness = EvaluationHarness::new(
        calibration.harness_config(),
        calibration.parameters.clone(),
        observed,
    )
    .with_cancel(cancel.clone());
    let campaign_options = CampaignOptions {
        workers: calibration.campaign.workers,
        cancel,
        control_path: Some(campaign::control_path(&run_dir)),
    };

    let jsonl_path = run_dir.join("results.jsonl");
    let mut jsonl = BufWriter::new(
        fs::File::create(&jsonl_path)
            .with_context(|| format!("failed to create {}", jsonl_path.display()))?,
    );
    let mut table = ResultsTable::create(&run_dir.join("results.csv"), &calibration.parameters)?;
    let report = run_campaign(&harness, &samples, &campaign_options, &mut |index, result| {
        let mut row = serde_json::to_value(result)?;
        row["index"] = json!(index);
        writeln!(jsonl, "{}", serde_json::to_string(&row)?)?;
        jsonl.flush()?;
        table.append(index, result)
    })?;
    table.into_inner()?;

    let best = report.best().map(|(index, score)| BestSample {
        index,
        score,
        parameters: samples[index].clone(),
    });
    let result = RunResult {
        run_dir: run_dir.clone(),
        run_id: run_id.clone(),
        evaluated: report.evaluated(),
        succeeded: report.succeeded(),
        failed: report.evaluated() - report.succeeded(),
        skipped: report.skipped(),
        stopped: report.stopped,
        best,
    };
    let summary = json!({
        "schema_version": "run_summary_v1",
        "run_id": run_id,
        "campaign_id": calibration.campaign.id,
        "samples": samples.len(),
        "evaluated": result.evaluated,
        "succeeded": result.succeeded,
        "failed": result.failed,
        "skipped": result.skipped,
        "stopped": result.stopped,
        "best": result.best.as_ref().map(|b| json!({
            "index": b.index,
            "score": b.score,
            "parameters": b.parameters,
        })),
        "finished_at": Utc::now().to_rfc3339(),
    });
    atomic_write_json_pretty(&run_dir.join("summary.json"), &summary)?;
    run_guard.complete(if result.stopped { "stopped" } else { "completed" })?;
    info!(
        run_id = %result.run_id,
        evaluated = result.evaluated,
        succeeded = result.succeeded,
        stopped = result.stopped,
        "run finished"
    );
    Ok(result)
}

/// Asks the run in `run_dir` to stop; returns the control file written.
pub fn request_stop(run_dir: &Path) -> Result<PathBuf> {
    let run_control = run_dir.join("runtime").join("run_control.json");
    if !run_control.is_file() {
        return Err(anyhow!("{} is not a run directory", run_dir.display()));
    }
    campaign::write_stop_request(run_dir)
}

/// Removes sandboxes leaked by killed processes. Must not run while a
/// campaign is using the same template.
pub fn clean_sandboxes(path: &Path) -> Result<Vec<PathBuf>> {
    let calibration = Calibration::load(path)?;
    let layout = &calibration.template.layout;
    let root = layout.sandbox_root(&calibration.template.dir);
    let removed = sandbox::sweep_leaked(&root, &layout.prefix)
        .with_context(|| format!("failed to sweep sandboxes under {}", root.display()))?;
    info!(root = %root.display(), removed = removed.len(), "swept leaked sandboxes");
    Ok(removed)
}

fn calibration_dir(path: &Path) -> PathBuf {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf())
}

fn create_run_dir(project_root: &Path) -> Result<(String, PathBuf)> {
    let runs = project_root.join(sandbox::STATE_DIR).join("runs");
    ensure_dir(&runs)?;
    let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let mut attempt = 0;
    loop {
        let run_id = if attempt == 0 {
            format!("run_{}", stamp)
        } else {
            format!("run_{}_{}", stamp, attempt)
        };
        let run_dir = runs.join(&run_id);
        match fs::create_dir(&run_dir) {
            Ok(()) => return Ok((run_id, run_dir)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => attempt += 1,
            Err(err) => {
                return Err(err).with_context(|| format!("failed to create {}", run_dir.display()))
            }
        }
    }
}
