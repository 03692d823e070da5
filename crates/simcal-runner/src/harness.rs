//! One parameter vector in, one well-formed [`EvaluationResult`] out.
//!
//! ```text
//! Idle -> SandboxCreated -> ConfigPatched -> ModelRan -> OutputParsed -> Scored
//! ```
//!
//! Every component error is turned into a failed result carrying the last
//! [`Stage`] reached. The sandbox is torn down on every path before `evaluate`
//! returns; `sandbox_removed` records whether that succeeded.

use crate::calibration::SettingBinding;
use crate::config_patch::{self, ConfigSetting};
use crate::error::{ModelExecutionError, ScoreInputError};
use crate::invoke::{self, CancelToken, SimulatorCommand};
use crate::output::{self, OutputSpec};
use crate::sandbox::{self, Sandbox, SandboxLayout};
use crate::score;
use serde::{Deserialize, Serialize};
use simcal_core::{ParameterSpec, ParameterVector, WorkerId};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NonZeroExitPolicy {
    /// A nonzero exit fails the evaluation.
    #[default]
    Fail,
    /// Log the exit code and score whatever output the simulator left.
    Parse,
}

impl NonZeroExitPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            NonZeroExitPolicy::Fail => "fail",
            NonZeroExitPolicy::Parse => "parse",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    SandboxCreated,
    ConfigPatched,
    ModelRan,
    OutputParsed,
    Scored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidParameters,
    SandboxCreate,
    ConfigWrite,
    ModelExecution,
    NonZeroExit,
    Timeout,
    Cancelled,
    OutputParse,
    ScoreInput,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    /// Last stage reached before the failure.
    pub stage: Stage,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Scored { score: f64 },
    Failed(Failure),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub worker: WorkerId,
    pub parameters: ParameterVector,
    pub outcome: Outcome,
    pub exit_code: Option<i32>,
    pub records: Option<usize>,
    pub elapsed_ms: u64,
    pub sandbox_removed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teardown_error: Option<String>,
}

impl EvaluationResult {
    pub fn score(&self) -> Option<f64> {
        match self.outcome {
            Outcome::Scored { score } => Some(score),
            Outcome::Failed(_) => None,
        }
    }

    /// The score, or NaN for a failed run.
    pub fn score_or_nan(&self) -> f64 {
        self.score().unwrap_or(f64::NAN)
    }

    pub fn failure(&self) -> Option<&Failure> {
        match &self.outcome {
            Outcome::Scored { .. } => None,
            Outcome::Failed(f) => Some(f),
        }
    }

    pub fn is_success(&self) -> bool {
        self.score().is_some()
    }
}

/// The seam between a sampler and the harness: anything that turns a
/// parameter vector into a result for a given worker.
pub trait Objective: Sync {
    fn evaluate(&self, worker: &WorkerId, params: &ParameterVector) -> EvaluationResult;
}

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub template_dir: PathBuf,
    pub layout: SandboxLayout,
    pub config_file: PathBuf,
    pub bindings: Vec<SettingBinding>,
    pub simulator: SimulatorCommand,
    pub on_nonzero_exit: NonZeroExitPolicy,
    pub output: OutputSpec,
}

impl HarnessConfig {
    pub fn settings_for(&self, params: &ParameterVector) -> Result<Vec<ConfigSetting>, String> {
        self.bindings
            .iter()
            .map(|b| {
                b.to_setting(params).ok_or_else(|| {
                    format!("setting '{}' needs missing parameter '{}'", b.key, b.parameter)
                })
            })
            .collect()
    }
}

pub struct EvaluationHarness {
    config: HarnessConfig,
    parameters: Vec<ParameterSpec>,
    observed: Vec<f64>,
    cancel: CancelToken,
}

struct Progress {
    stage: Stage,
    exit_code: Option<i32>,
    records: Option<usize>,
}

impl Progress {
    fn fail(&self, kind: FailureKind, reason: impl ToString) -> Failure {
        Failure {
            kind,
            stage: self.stage,
            reason: reason.to_string(),
        }
    }
}

impl EvaluationHarness {
    pub fn new(config: HarnessConfig, parameters: Vec<ParameterSpec>, observed: Vec<f64>) -> Self {
        Self {
            config,
            parameters,
            observed,
            cancel: CancelToken::new(),
        }
    }

    /// Shares `cancel` with the caller so it can stop running simulators.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn parameters(&self) -> &[ParameterSpec] {
        &self.parameters
    }

    pub fn observed(&self) -> &[f64] {
        &self.observed
    }

    /// The harness as a plain function value bound to one worker.
    pub fn bind(&self, worker: WorkerId) -> impl Fn(&ParameterVector) -> EvaluationResult + '_ {
        move |params| self.evaluate(&worker, params)
    }

    pub fn evaluate(&self, worker: &WorkerId, params: &ParameterVector) -> EvaluationResult {
        let started = Instant::now();
        let mut progress = Progress {
            stage: Stage::Idle,
            exit_code: None,
            records: None,
        };
        let mut sandbox_removed = true;
        let mut teardown_error = None;
        let mut created: Option<PathBuf> = None;

        let caught = panic::catch_unwind(AssertUnwindSafe(|| -> Result<f64, Failure> {
            self.check_parameters(worker, params)
                .map_err(|reason| progress.fail(FailureKind::InvalidParameters, reason))?;
            let sandbox = Sandbox::create(&self.config.template_dir, worker, &self.config.layout)
                .map_err(|e| progress.fail(FailureKind::SandboxCreate, e))?;
            created = Some(sandbox.path().to_path_buf());
            progress.stage = Stage::SandboxCreated;

            let simulated = self.run_in_sandbox(&sandbox, params, &mut progress);

            match sandbox.destroy() {
                Ok(()) => {}
                Err(err) => {
                    warn!(worker = %worker, error = %err, "sandbox teardown failed; continuing");
                    sandbox_removed = false;
                    teardown_error = Some(err.to_string());
                }
            }

            let simulated = simulated?;
            let score = score::nash_sutcliffe(&simulated, &self.observed)
                .map_err(|e| progress.fail(FailureKind::ScoreInput, describe_score_error(e)))?;
            progress.stage = Stage::Scored;
            Ok(score)
        }));

        let outcome = match caught {
            Ok(Ok(score)) => Outcome::Scored { score },
            Ok(Err(failure)) => Outcome::Failed(failure),
            Err(payload) => {
                let (removed, error) = settle_after_panic(created.as_deref());
                sandbox_removed = removed;
                teardown_error = error;
                Outcome::Failed(progress.fail(FailureKind::Internal, panic_message(&*payload)))
            }
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            Outcome::Scored { score } => {
                info!(worker = %worker, score, elapsed_ms, "evaluation scored")
            }
            Outcome::Failed(f) => warn!(
                worker = %worker,
                kind = ?f.kind,
                stage = ?f.stage,
                reason = %f.reason,
                elapsed_ms,
                "evaluation failed"
            ),
        }
        EvaluationResult {
            worker: worker.clone(),
            parameters: params.clone(),
            outcome,
            exit_code: progress.exit_code,
            records: progress.records,
            elapsed_ms,
            sandbox_removed,
            teardown_error,
        }
    }

    fn run_in_sandbox(
        &self,
        sandbox: &Sandbox,
        params: &ParameterVector,
        progress: &mut Progress,
    ) -> Result<Vec<f64>, Failure> {
        let settings = self
            .config
            .settings_for(params)
            .map_err(|reason| progress.fail(FailureKind::InvalidParameters, reason))?;
        let config_path = sandbox.path().join(&self.config.config_file);
        config_patch::apply_all(&config_path, &settings)
            .map_err(|e| progress.fail(FailureKind::ConfigWrite, e))?;
        progress.stage = Stage::ConfigPatched;

        let run = invoke::run(sandbox, &self.config.simulator, &self.cancel).map_err(|e| {
            let kind = match e {
                ModelExecutionError::TimedOut { .. } => FailureKind::Timeout,
                ModelExecutionError::Cancelled => FailureKind::Cancelled,
                _ => FailureKind::ModelExecution,
            };
            progress.fail(kind, e)
        })?;
        progress.exit_code = run.exit_code;
        info!(
            worker = %sandbox.worker(),
            exit_code = ?run.exit_code,
            runtime_s = run.elapsed.as_secs_f64(),
            "simulator finished"
        );
        if !run.success() {
            let err = ModelExecutionError::NonZeroExit {
                exit_code: run.exit_code,
                stderr_tail: run.stderr_tail.clone(),
            };
            match self.config.on_nonzero_exit {
                NonZeroExitPolicy::Fail => return Err(progress.fail(FailureKind::NonZeroExit, err)),
                NonZeroExitPolicy::Parse => {
                    warn!(worker = %sandbox.worker(), error = %err, "parsing output of failed simulator run")
                }
            }
        }
        progress.stage = Stage::ModelRan;

        let series = output::read(sandbox.path(), &self.config.output)
            .map_err(|e| progress.fail(FailureKind::OutputParse, e))?;
        progress.records = Some(series.len());
        progress.stage = Stage::OutputParsed;
        Ok(series.values())
    }

    fn check_parameters(&self, worker: &WorkerId, params: &ParameterVector) -> Result<(), String> {
        if params.len() != self.parameters.len() {
            return Err(format!(
                "expected {} parameters, got {}",
                self.parameters.len(),
                params.len()
            ));
        }
        for (spec, value) in self.parameters.iter().zip(params.iter()) {
            if spec.name != value.name {
                return Err(format!(
                    "expected parameter '{}' but got '{}'",
                    spec.name, value.name
                ));
            }
            if !value.value.is_finite() {
                return Err(format!("parameter '{}' is not finite", spec.name));
            }
            if !spec.contains(value.value) {
                warn!(
                    worker = %worker,
                    parameter = %spec.name,
                    value = value.value,
                    "parameter outside its bounds"
                );
            }
        }
        Ok(())
    }
}

impl Objective for EvaluationHarness {
    fn evaluate(&self, worker: &WorkerId, params: &ParameterVector) -> EvaluationResult {
        EvaluationHarness::evaluate(self, worker, params)
    }
}

fn describe_score_error(err: ScoreInputError) -> String {
    match err {
        ScoreInputError::LengthMismatch { .. } => {
            format!("{} (check output.trim_trailing)", err)
        }
        other => other.to_string(),
    }
}

/// The sandbox guard ran while unwinding; remove anything still there and
/// report the result.
fn settle_after_panic(created: Option<&Path>) -> (bool, Option<String>) {
    let Some(path) = created else {
        return (true, None);
    };
    match sandbox::remove_sandbox(path) {
        Ok(()) => (true, None),
        Err(err) => {
            warn!(sandbox = %path.display(), error = %err, "sandbox left behind after panic");
            (false, Some(err.to_string()))
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("evaluation panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("evaluation panicked: {}", s)
    } else {
        "evaluation panicked".to_string()
    }
}
