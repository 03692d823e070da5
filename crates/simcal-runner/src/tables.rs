//! CSV inputs and outputs of a campaign: observed series, externally sampled
//! parameter vectors, and the per-evaluation result table.

use crate::harness::EvaluationResult;
use anyhow::{anyhow, Context, Result};
use simcal_core::{ParameterSpec, ParameterVector};
use std::path::Path;

/// Loads the named numeric column of a headed CSV file.
pub fn load_observations(path: &Path, column: &str) -> Result<Vec<f64>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("failed to open observations {}", path.display()))?;
    let headers = reader.headers()?.clone();
    let idx = headers
        .iter()
        .position(|h| h == column)
        .ok_or_else(|| {
            anyhow!(
                "observations {} have no column '{}' (columns: {:?})",
                path.display(),
                column,
                headers.iter().collect::<Vec<_>>()
            )
        })?;
    let mut values = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let raw = record.get(idx).unwrap_or("");
        let value: f64 = raw.parse().with_context(|| {
            format!(
                "observations {} row {}: '{}' is not a number",
                path.display(),
                row + 1,
                raw
            )
        })?;
        values.push(value);
    }
    if values.is_empty() {
        return Err(anyhow!("observations {} contain no rows", path.display()));
    }
    Ok(values)
}

/// Loads sampled parameter vectors. The header must name every parameter,
/// either verbatim or with the `par` prefix samplers commonly write; other
/// columns are ignored.
pub fn load_samples(path: &Path, specs: &[ParameterSpec]) -> Result<Vec<ParameterVector>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("failed to open samples {}", path.display()))?;
    let headers = reader.headers()?.clone();
    let mut columns = Vec::with_capacity(specs.len());
    let mut missing = Vec::new();
    for spec in specs {
        let prefixed = format!("par{}", spec.name);
        match headers
            .iter()
            .position(|h| h == spec.name)
            .or_else(|| headers.iter().position(|h| h == prefixed))
        {
            Some(idx) => columns.push(idx),
            None => missing.push(spec.name.clone()),
        }
    }
    if !missing.is_empty() {
        return Err(anyhow!(
            "samples {} are missing parameter columns: {}",
            path.display(),
            missing.join(", ")
        ));
    }
    let mut samples = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let mut pairs = Vec::with_capacity(specs.len());
        for (spec, idx) in specs.iter().zip(&columns) {
            let raw = record.get(*idx).unwrap_or("");
            let value: f64 = raw.parse().with_context(|| {
                format!(
                    "samples {} row {} column {}: '{}' is not a number",
                    path.display(),
                    row + 1,
                    spec.name,
                    raw
                )
            })?;
            pairs.push((spec.name.clone(), value));
        }
        samples.push(ParameterVector::from_pairs(pairs));
    }
    Ok(samples)
}

/// Result table with one row per evaluation. Failed runs keep their row with
/// a NaN score so downstream analysis sees the gap.
pub struct ResultsTable<W: std::io::Write> {
    writer: csv::Writer<W>,
}

impl ResultsTable<std::fs::File> {
    pub fn create(path: &Path, specs: &[ParameterSpec]) -> Result<Self> {
        let writer = csv::Writer::from_path(path)
            .with_context(|| format!("failed to open results table {}", path.display()))?;
        Self::new(writer, specs)
    }
}

impl<W: std::io::Write> ResultsTable<W> {
    pub fn new(mut writer: csv::Writer<W>, specs: &[ParameterSpec]) -> Result<Self> {
        let mut header = vec![
            "index".to_string(),
            "worker".to_string(),
            "status".to_string(),
            "score".to_string(),
            "reason".to_string(),
            "exit_code".to_string(),
            "elapsed_ms".to_string(),
        ];
        header.extend(specs.iter().map(|s| s.name.clone()));
        writer.write_record(&header)?;
        writer.flush()?;
        Ok(Self { writer })
    }

    pub fn append(&mut self, index: usize, result: &EvaluationResult) -> Result<()> {
        let (status, reason) = match result.failure() {
            None => ("scored".to_string(), String::new()),
            Some(f) => (
                serde_json::to_value(f.kind)?
                    .as_str()
                    .unwrap_or("failed")
                    .to_string(),
                f.reason.clone(),
            ),
        };
        let mut record = vec![
            index.to_string(),
            result.worker.to_string(),
            status,
            result.score_or_nan().to_string(),
            reason,
            result.exit_code.map(|c| c.to_string()).unwrap_or_default(),
            result.elapsed_ms.to_string(),
        ];
        record.extend(result.parameters.iter().map(|p| p.value.to_string()));
        self.writer.write_record(&record)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| anyhow!("failed to flush results table: {}", e.error()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::{Failure, FailureKind, Outcome, Stage};
    use chrono::Utc;
    use simcal_core::{ensure_dir, WorkerId};
    use std::fs;
    use std::path::PathBuf;

    fn temp_file(tag: &str, name: &str, contents: &str) -> (PathBuf, PathBuf) {
        let root = std::env::temp_dir().join(format!(
            "simcal_tables_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp dir");
        let path = root.join(name);
        fs::write(&path, contents).expect("write table");
        (root, path)
    }

    fn specs() -> Vec<ParameterSpec> {
        vec![
            ParameterSpec {
                name: "a".to_string(),
                lower: 0.0,
                upper: 1.0,
                best_guess: 0.5,
            },
            ParameterSpec {
                name: "b".to_string(),
                lower: 0.0,
                upper: 1.0,
                best_guess: 0.5,
            },
        ]
    }

    #[test]
    fn observations_load_named_column() {
        let (root, path) = temp_file(
            "obs",
            "validation.csv",
            "date,value\n2006-01-01, 1.5\n2006-01-02,2.5\n",
        );
        assert_eq!(load_observations(&path, "value").unwrap(), vec![1.5, 2.5]);
        let err = load_observations(&path, "flow").expect_err("missing column");
        assert!(err.to_string().contains("no column 'flow'"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn observations_reject_non_numeric_rows() {
        let (root, path) = temp_file("obsbad", "validation.csv", "value\n1\nn/a\n");
        let err = load_observations(&path, "value").expect_err("bad row");
        assert!(err.to_string().contains("row 2"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn samples_follow_spec_order_and_accept_prefix() {
        let (root, path) = temp_file(
            "samples",
            "samples.csv",
            "like1,parb,a,chain\n0.1,0.9,0.2,0\n0.3,0.8,0.4,0\n",
        );
        let samples = load_samples(&path, &specs()).unwrap();
        assert_eq!(samples.len(), 2);
        let names: Vec<&str> = samples[0].iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(samples[1].get("a"), Some(0.4));
        assert_eq!(samples[1].get("b"), Some(0.8));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn samples_report_missing_columns() {
        let (root, path) = temp_file("samplesmissing", "samples.csv", "a\n0.1\n");
        let err = load_samples(&path, &specs()).expect_err("missing b");
        assert!(err.to_string().contains("missing parameter columns: b"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn results_table_marks_failures_with_nan() {
        let mut table = ResultsTable::new(csv::Writer::from_writer(Vec::new()), &specs()).unwrap();
        let params = ParameterVector::from_pairs([("a", 0.1), ("b", 0.2)]);
        let ok = EvaluationResult {
            worker: WorkerId::new("w0").unwrap(),
            parameters: params.clone(),
            outcome: Outcome::Scored { score: 0.75 },
            exit_code: Some(0),
            records: Some(3),
            elapsed_ms: 12,
            sandbox_removed: true,
            teardown_error: None,
        };
        let failed = EvaluationResult {
            outcome: Outcome::Failed(Failure {
                kind: FailureKind::NonZeroExit,
                stage: Stage::ConfigPatched,
                reason: "exit 1".to_string(),
            }),
            exit_code: Some(1),
            records: None,
            ..ok.clone()
        };
        table.append(0, &ok).unwrap();
        table.append(1, &failed).unwrap();
        let text = String::from_utf8(table.into_inner().unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "index,worker,status,score,reason,exit_code,elapsed_ms,a,b");
        assert_eq!(lines[1], "0,w0,scored,0.75,,0,12,0.1,0.2");
        assert_eq!(lines[2], "1,w0,non_zero_exit,NaN,exit 1,1,12,0.1,0.2");
    }
}
