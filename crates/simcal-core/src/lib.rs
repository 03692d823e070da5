use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)?;
    Ok(())
}

pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                let _ = out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// One calibrated parameter: its sampling bounds and the reference value used
/// when no sample is supplied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub lower: f64,
    pub upper: f64,
    pub best_guess: f64,
}

impl ParameterSpec {
    /// Bounds are accepted in either order.
    pub fn contains(&self, value: f64) -> bool {
        let lo = self.lower.min(self.upper);
        let hi = self.lower.max(self.upper);
        value >= lo && value <= hi
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterValue {
    pub name: String,
    pub value: f64,
}

/// Ordered named values, one per [`ParameterSpec`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterVector {
    entries: Vec<ParameterValue>,
}

impl ParameterVector {
    pub fn new(entries: Vec<ParameterValue>) -> Self {
        Self { entries }
    }

    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(name, value)| ParameterValue {
                    name: name.into(),
                    value,
                })
                .collect(),
        }
    }

    pub fn best_guess(specs: &[ParameterSpec]) -> Self {
        Self::from_pairs(specs.iter().map(|s| (s.name.clone(), s.best_guess)))
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value)
    }

    /// Replaces the value of `name`; returns false when no such entry exists.
    pub fn set(&mut self, name: &str, value: f64) -> bool {
        match self.entries.iter_mut().find(|e| e.name == name) {
            Some(entry) => {
                entry.value = value;
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParameterValue> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkerIdError {
    #[error("worker id cannot be empty")]
    Empty,
    #[error("worker id '{0}' may only contain ASCII letters, digits, '-', '_' and '.'")]
    InvalidCharacters(String),
}

/// Identity of the worker executing an evaluation. Sandboxes are named after
/// it, so two live evaluations must never share one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(raw: impl Into<String>) -> Result<Self, WorkerIdError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(WorkerIdError::Empty);
        }
        let valid = raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c))
            && raw != "."
            && raw != "..";
        if !valid {
            return Err(WorkerIdError::InvalidCharacters(raw));
        }
        Ok(Self(raw))
    }

    /// `<pid>-w<index>`: unique across processes on one host and across the
    /// worker threads of one process.
    pub fn for_process(index: usize) -> Self {
        Self(format!("{}-w{}", std::process::id(), index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for WorkerId {
    type Error = WorkerIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        WorkerId::new(value)
    }
}

impl From<WorkerId> for String {
    fn from(value: WorkerId) -> Self {
        value.0
    }
}
