//! Reader for the simulator's whitespace-delimited output table.
//!
//! The first line names the columns. Field 0 of every data row is the
//! timestamp; when a row carries more tokens than the header has names, the
//! surplus leading tokens are part of the timestamp (`2020-01-01 00:00`) and
//! value columns line up with the header from the right.

use crate::error::OutputParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnSelector {
    Index(usize),
    Name(String),
}

impl fmt::Display for ColumnSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnSelector::Index(i) => write!(f, "#{}", i),
            ColumnSelector::Name(n) => write!(f, "'{}'", n),
        }
    }
}

/// Where the simulated series lives and how to align it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    /// Relative to the sandbox root.
    pub path: PathBuf,
    pub column: ColumnSelector,
    #[serde(default = "default_unit_scale")]
    pub unit_scale: f64,
    /// Records dropped from the end so the series lines up with the
    /// observation record.
    #[serde(default)]
    pub trim_trailing: usize,
}

fn default_unit_scale() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub timestamp: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationSeries {
    pub header: Vec<String>,
    pub column: String,
    pub points: Vec<SeriesPoint>,
    pub skipped_lines: usize,
}

impl SimulationSeries {
    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.value).collect()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn trim_trailing(&mut self, count: usize) {
        let keep = self.points.len().saturating_sub(count);
        self.points.truncate(keep);
    }
}

/// Parses and trims according to `spec`, resolving `spec.path` against
/// `sandbox_root`.
pub fn read(sandbox_root: &Path, spec: &OutputSpec) -> Result<SimulationSeries, OutputParseError> {
    let mut series = parse(&sandbox_root.join(&spec.path), &spec.column, spec.unit_scale)?;
    series.trim_trailing(spec.trim_trailing);
    Ok(series)
}

pub fn parse(
    output_path: &Path,
    column: &ColumnSelector,
    unit_scale: f64,
) -> Result<SimulationSeries, OutputParseError> {
    let data = fs::read(output_path).map_err(|source| OutputParseError::Missing {
        path: output_path.to_path_buf(),
        source,
    })?;
    if data.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(OutputParseError::Empty(output_path.to_path_buf()));
    }
    let text = String::from_utf8_lossy(&data);
    let mut lines = text.lines();
    let header: Vec<String> = lines
        .next()
        .map(|l| l.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();
    if header.is_empty() {
        return Err(OutputParseError::Header(output_path.to_path_buf()));
    }
    let col = resolve_column(&header, column)?;

    let mut points = Vec::new();
    let mut skipped_lines = 0;
    for line in lines {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        if fields.len() < header.len() {
            skipped_lines += 1;
            continue;
        }
        let offset = fields.len() - header.len();
        match fields[offset + col].parse::<f64>() {
            Ok(raw) => points.push(SeriesPoint {
                timestamp: fields[..=offset].join(" "),
                value: raw * unit_scale,
            }),
            Err(_) => skipped_lines += 1,
        }
    }
    debug!(
        output = %output_path.display(),
        column = %header[col],
        records = points.len(),
        skipped_lines,
        "parsed simulator output"
    );
    Ok(SimulationSeries {
        column: header[col].clone(),
        header,
        points,
        skipped_lines,
    })
}

fn resolve_column(header: &[String], column: &ColumnSelector) -> Result<usize, OutputParseError> {
    let idx = match column {
        ColumnSelector::Index(i) => Some(*i),
        ColumnSelector::Name(name) => header.iter().position(|h| h == name),
    };
    match idx {
        Some(i) if i >= 1 && i < header.len() => Ok(i),
        _ => Err(OutputParseError::Column {
            column: column.to_string(),
            header: header.to_vec(),
        }),
    }
}
