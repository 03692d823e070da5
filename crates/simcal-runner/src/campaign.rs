//! Dispatches a batch of parameter vectors over independent worker threads.
//!
//! Each worker owns a distinct [`WorkerId`], so sandboxes never overlap; no
//! locks guard the evaluations themselves.

use crate::harness::{EvaluationResult, Objective};
use crate::invoke::CancelToken;
use anyhow::Result;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use simcal_core::{atomic_write_json_pretty, ParameterVector, WorkerId};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

const CONTROL_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct CampaignOptions {
    pub workers: usize,
    pub cancel: CancelToken,
    /// Polled for a `stop` action while the campaign runs.
    pub control_path: Option<PathBuf>,
}

impl Default for CampaignOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            cancel: CancelToken::new(),
            control_path: None,
        }
    }
}

#[derive(Debug)]
pub struct CampaignReport {
    /// Indexed like the input samples; `None` for samples never dispatched.
    pub results: Vec<Option<EvaluationResult>>,
    pub stopped: bool,
}

impl CampaignReport {
    pub fn evaluated(&self) -> usize {
        self.results.iter().filter(|r| r.is_some()).count()
    }

    pub fn succeeded(&self) -> usize {
        self.results
            .iter()
            .flatten()
            .filter(|r| r.is_success())
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.results.len() - self.evaluated()
    }

    /// Highest score and its sample index.
    pub fn best(&self) -> Option<(usize, f64)> {
        self.results
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().and_then(|r| r.score()).map(|s| (i, s)))
            .fold(None, |best, (i, s)| match best {
                Some((_, b)) if b >= s => best,
                _ => Some((i, s)),
            })
    }
}

/// Evaluates `samples` with `options.workers` threads, handing each finished
/// result to `sink` on the calling thread. A sink error or a stop request
/// cancels the campaign: no new samples are dispatched and running simulators
/// are terminated through the shared cancel token.
pub fn run_campaign(
    objective: &dyn Objective,
    samples: &[ParameterVector],
    options: &CampaignOptions,
    sink: &mut dyn FnMut(usize, &EvaluationResult) -> Result<()>,
) -> Result<CampaignReport> {
    let workers = options.workers.max(1).min(samples.len().max(1));
    let next = AtomicUsize::new(0);
    let mut results: Vec<Option<EvaluationResult>> = vec![None; samples.len()];
    let mut sink_error = None;
    info!(samples = samples.len(), workers, "campaign started");

    thread::scope(|scope| {
        let (tx, rx) = mpsc::channel::<(usize, EvaluationResult)>();
        for w in 0..workers {
            let tx = tx.clone();
            let next = &next;
            let cancel = &options.cancel;
            scope.spawn(move || {
                let worker = WorkerId::for_process(w);
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let idx = next.fetch_add(1, Ordering::SeqCst);
                    if idx >= samples.len() {
                        break;
                    }
                    debug!(worker = %worker, sample = idx, "dispatching evaluation");
                    let result = objective.evaluate(&worker, &samples[idx]);
                    if tx.send((idx, result)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        loop {
            match rx.recv_timeout(CONTROL_POLL) {
                Ok((idx, result)) => {
                    if sink_error.is_none() {
                        if let Err(err) = sink(idx, &result) {
                            warn!(error = %err, "result sink failed; cancelling campaign");
                            options.cancel.cancel();
                            sink_error = Some(err);
                        }
                    }
                    results[idx] = Some(result);
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
            if !options.cancel.is_cancelled() {
                if let Some(path) = &options.control_path {
                    if stop_requested(path) {
                        info!(control = %path.display(), "stop requested; cancelling campaign");
                        options.cancel.cancel();
                    }
                }
            }
        }
    });

    if let Some(err) = sink_error {
        return Err(err);
    }
    let report = CampaignReport {
        results,
        stopped: options.cancel.is_cancelled(),
    };
    info!(
        evaluated = report.evaluated(),
        succeeded = report.succeeded(),
        skipped = report.skipped(),
        stopped = report.stopped,
        "campaign finished"
    );
    Ok(report)
}

#[derive(Debug, Deserialize)]
struct ControlFile {
    action: String,
}

pub fn control_path(run_dir: &Path) -> PathBuf {
    run_dir.join("runtime").join("campaign_control.json")
}

/// Asks the campaign running in `run_dir` to stop after in-flight work is
/// terminated.
pub fn write_stop_request(run_dir: &Path) -> Result<PathBuf> {
    let path = control_path(run_dir);
    let payload = json!({
        "schema_version": "campaign_control_v1",
        "action": "stop",
        "requested_at": Utc::now().to_rfc3339(),
    });
    atomic_write_json_pretty(&path, &payload)?;
    Ok(path)
}

pub fn write_run_control(run_dir: &Path, run_id: &str, status: &str, pid: u32) -> Result<()> {
    let payload: Value = json!({
        "schema_version": "run_control_v1",
        "run_id": run_id,
        "status": status,
        "pid": pid,
        "updated_at": Utc::now().to_rfc3339(),
    });
    atomic_write_json_pretty(&run_dir.join("runtime").join("run_control.json"), &payload)
}

fn stop_requested(path: &Path) -> bool {
    fs::read(path)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<ControlFile>(&bytes).ok())
        .map(|c| c.action == "stop")
        .unwrap_or(false)
}
