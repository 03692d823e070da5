//! Typed failures of the evaluation components.
//!
//! The harness converts every one of these into a failed
//! [`EvaluationResult`](crate::EvaluationResult); none escape `evaluate`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigWriteError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("setting '{key}' not found in {path}")]
    NoMatch { key: String, path: PathBuf },
    #[error("setting key cannot be empty")]
    EmptyKey,
}

#[derive(Debug, Error)]
pub enum SandboxCreateError {
    #[error("template directory {0} does not exist")]
    MissingTemplate(PathBuf),
    #[error("failed to copy template into sandbox {path}: {source}")]
    Copy {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to walk template {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("failed to remove stale sandbox {path}: {source}")]
    Stale {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
#[error("failed to remove sandbox {path}: {source}")]
pub struct SandboxDestroyError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

#[derive(Debug, Error)]
pub enum ModelExecutionError {
    #[error("simulator command is empty")]
    EmptyCommand,
    #[error("failed to spawn simulator '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed while waiting on simulator: {0}")]
    Wait(#[source] std::io::Error),
    #[error("simulator exceeded timeout of {timeout:?} and was terminated")]
    TimedOut { timeout: std::time::Duration },
    #[error("simulator was terminated because the run was cancelled")]
    Cancelled,
    #[error("simulator exited with code {exit_code:?}: {stderr_tail}")]
    NonZeroExit {
        exit_code: Option<i32>,
        stderr_tail: String,
    },
}

#[derive(Debug, Error)]
pub enum OutputParseError {
    #[error("output file {path} is missing: {source}")]
    Missing {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("output file {0} is empty")]
    Empty(PathBuf),
    #[error("output file {0} has no readable header")]
    Header(PathBuf),
    #[error("column {column} not found in header {header:?}")]
    Column { column: String, header: Vec<String> },
}

#[derive(Debug, Error, PartialEq)]
pub enum ScoreInputError {
    #[error("simulated series has {simulated} values but observed has {observed}")]
    LengthMismatch { simulated: usize, observed: usize },
    #[error("cannot score empty series")]
    Empty,
    #[error("observed series has zero variance")]
    DegenerateObservations,
    #[error("simulated value at index {index} is not finite")]
    NonFinite { index: usize },
}

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("cannot read calibration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid calibration YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("calibration is invalid:\n  {}", .0.join("\n  "))]
    Invalid(Vec<String>),
}
