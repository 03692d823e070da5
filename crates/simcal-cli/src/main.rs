use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use simcal_core::WorkerId;
use simcal_runner::config_patch::{self, ConfigSetting, Scope};
use simcal_runner::error::CalibrationError;
use simcal_runner::{Calibration, EvaluationResult, Outcome};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "simcal",
    version,
    about = "Evaluate a simulator in isolated sandboxes and score it against observations"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a calibration template to fill in.
    Init {
        #[arg(default_value = "calibration.yaml")]
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
    Describe {
        calibration: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Validate {
        calibration: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Rewrite one `key = value` setting of a config file in place.
    Patch {
        config: PathBuf,
        #[arg(long)]
        key: String,
        #[arg(long = "value", required = true, num_args = 1..)]
        values: Vec<String>,
        #[arg(long)]
        first: bool,
        #[arg(long)]
        optional: bool,
        #[arg(long)]
        json: bool,
    },
    /// Evaluate the best-guess vector once.
    Evaluate {
        calibration: PathBuf,
        #[arg(long = "set")]
        set_values: Vec<String>,
        #[arg(long)]
        worker_id: Option<String>,
        #[arg(long)]
        json: bool,
    },
    Run {
        calibration: PathBuf,
        #[arg(long)]
        samples: Option<PathBuf>,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        timeout_seconds: Option<u64>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Ask a running campaign to stop.
    Stop {
        #[arg(long)]
        run_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Remove sandboxes leaked by killed runs.
    Clean {
        calibration: PathBuf,
        #[arg(long)]
        runs: bool,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let payload = match err.downcast_ref::<CalibrationError>() {
                    Some(CalibrationError::Invalid(issues)) => json_error(
                        "invalid_calibration",
                        "calibration is invalid".to_string(),
                        json!({ "issues": issues }),
                    ),
                    _ => json_error("command_failed", format!("{:#}", err), json!({})),
                };
                emit_json(&payload);
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Init { path, force } => {
            if !force && path.exists() {
                return Err(anyhow::anyhow!(
                    "init file already exists (use --force): {}",
                    path.display()
                ));
            }
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, CALIBRATION_TEMPLATE)?;
            println!("wrote: {}", path.display());
            println!(
                "next: edit {}, fill in all fields marked REQUIRED",
                path.display()
            );
            println!("next: simcal validate {}", path.display());
        }
        Commands::Describe { calibration, json } => {
            let summary = simcal_runner::describe_calibration(&calibration)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": summary_to_json(&summary)
                })));
            }
            print_summary(&summary);
        }
        Commands::Validate { calibration, json } => {
            let loaded = Calibration::load(&calibration)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "validate",
                    "valid": true,
                    "campaign": loaded.campaign.id,
                    "parameters": loaded.parameters.len(),
                    "settings": loaded.settings.len()
                })));
            }
            println!("ok");
        }
        Commands::Patch {
            config,
            key,
            values,
            first,
            optional,
            json,
        } => {
            let mut setting = ConfigSetting::repeated(key, &values);
            if first {
                setting = setting.with_scope(Scope::First);
            }
            if optional {
                setting = setting.optional();
            }
            let replaced = config_patch::apply(&config, &setting)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "patch",
                    "config": config.display().to_string(),
                    "key": setting.key,
                    "value": setting.value,
                    "replaced": replaced
                })));
            }
            println!("replaced: {}", replaced);
        }
        Commands::Evaluate {
            calibration,
            set_values,
            worker_id,
            json,
        } => {
            let overrides = parse_set_values(&set_values)?;
            let worker = worker_id.map(|raw| WorkerId::new(raw)).transpose()?;
            let result = simcal_runner::evaluate_once(&calibration, &overrides, worker)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "evaluate",
                    "result": serde_json::to_value(&result)?
                })));
            }
            print_evaluation(&result);
        }
        Commands::Run {
            calibration,
            samples,
            workers,
            timeout_seconds,
            limit,
            json,
        } => {
            let options = simcal_runner::RunOptions {
                samples,
                workers,
                timeout_seconds,
                limit,
            };
            let summary = simcal_runner::describe_run(&calibration, &options)?;
            let result = simcal_runner::run_calibration(&calibration, &options)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "summary": summary_to_json(&summary),
                    "run": run_result_to_json(&result)
                })));
            }
            print_summary(&summary);
            println!("run_id: {}", result.run_id);
            println!("run_dir: {}", result.run_dir.display());
            println!(
                "evaluated: {} (succeeded {}, failed {}, skipped {})",
                result.evaluated, result.succeeded, result.failed, result.skipped
            );
            if result.stopped {
                println!("stopped: true");
            }
            if let Some(best) = &result.best {
                println!("best: sample {} score {:.4}", best.index, best.score);
            }
        }
        Commands::Stop { run_dir, json } => {
            let control = simcal_runner::request_stop(&run_dir)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "stop",
                    "run_dir": run_dir.display().to_string(),
                    "control": control.display().to_string()
                })));
            }
            println!("stop requested: {}", control.display());
        }
        Commands::Clean {
            calibration,
            runs,
            json,
        } => {
            let removed = simcal_runner::clean_sandboxes(&calibration)?;
            let mut runs_removed = None;
            if runs {
                let runs_dir = calibration
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or(std::path::Path::new("."))
                    .join(simcal_runner::sandbox::STATE_DIR)
                    .join("runs");
                if runs_dir.exists() {
                    std::fs::remove_dir_all(&runs_dir)?;
                    runs_removed = Some(runs_dir);
                }
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "clean",
                    "sandboxes": removed.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
                    "runs": runs_removed.as_ref().map(|p| p.display().to_string())
                })));
            }
            for p in removed.iter().chain(runs_removed.iter()) {
                println!("removed: {}", p.display());
            }
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Describe { json, .. }
        | Commands::Validate { json, .. }
        | Commands::Patch { json, .. }
        | Commands::Evaluate { json, .. }
        | Commands::Run { json, .. }
        | Commands::Stop { json, .. }
        | Commands::Clean { json, .. } => *json,
        Commands::Init { .. } => false,
    }
}

fn run_result_to_json(result: &simcal_runner::RunResult) -> Value {
    json!({
        "run_id": result.run_id,
        "run_dir": result.run_dir.display().to_string(),
        "evaluated": result.evaluated,
        "succeeded": result.succeeded,
        "failed": result.failed,
        "skipped": result.skipped,
        "stopped": result.stopped,
        "best": result.best.as_ref().map(|b| json!({
            "index": b.index,
            "score": b.score,
            "parameters": b.parameters
        }))
    })
}

fn parse_set_values(values: &[String]) -> Result<Vec<(String, f64)>> {
    let mut out = Vec::with_capacity(values.len());
    for raw in values {
        let (key, val_raw) = raw
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("invalid --set '{}': expected name=value", raw))?;
        if key.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "invalid --set '{}': name cannot be empty",
                raw
            ));
        }
        let value: f64 = val_raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid --set '{}': value is not a number", raw))?;
        out.push((key.trim().to_string(), value));
    }
    Ok(out)
}

fn summary_to_json(summary: &simcal_runner::CalibrationSummary) -> Value {
    json!({
        "campaign": summary.campaign_id,
        "template": summary.template_dir.display().to_string(),
        "sandbox_root": summary.sandbox_root.display().to_string(),
        "sandbox_prefix": summary.sandbox_prefix,
        "config_file": summary.config_file.display().to_string(),
        "config_file_exists": summary.config_file_exists,
        "simulator": summary.simulator_command,
        "timeout_seconds": summary.timeout_seconds,
        "on_nonzero_exit": summary.on_nonzero_exit.as_str(),
        "output": summary.output_path.display().to_string(),
        "output_column": summary.output_column,
        "trim_trailing": summary.trim_trailing,
        "observations": summary.observations_path.display().to_string(),
        "observation_count": summary.observation_count,
        "parameters": summary.parameter_count,
        "settings": summary.setting_count,
        "workers": summary.workers
    })
}

fn print_summary(summary: &simcal_runner::CalibrationSummary) {
    println!("campaign: {}", summary.campaign_id);
    println!("template: {}", summary.template_dir.display());
    println!(
        "sandboxes: {}/{}<worker>",
        summary.sandbox_root.display(),
        summary.sandbox_prefix
    );
    println!("config_file: {}", summary.config_file.display());
    if !summary.config_file_exists {
        println!("config_file_exists: false");
    }
    println!("simulator: {:?}", summary.simulator_command);
    if let Some(t) = summary.timeout_seconds {
        println!("timeout_seconds: {}", t);
    }
    println!("on_nonzero_exit: {}", summary.on_nonzero_exit.as_str());
    println!(
        "output: {} column {}",
        summary.output_path.display(),
        summary.output_column
    );
    println!("trim_trailing: {}", summary.trim_trailing);
    println!(
        "observations: {} ({} values)",
        summary.observations_path.display(),
        summary.observation_count
    );
    println!("parameters: {}", summary.parameter_count);
    println!("settings: {}", summary.setting_count);
    println!("workers: {}", summary.workers);
}

fn print_evaluation(result: &EvaluationResult) {
    println!("worker: {}", result.worker);
    match &result.outcome {
        Outcome::Scored { score } => println!("score: {:.6}", score),
        Outcome::Failed(failure) => {
            println!("status: failed");
            println!("kind: {:?}", failure.kind);
            println!("stage: {:?}", failure.stage);
            println!("reason: {}", failure.reason);
        }
    }
    if let Some(code) = result.exit_code {
        println!("exit_code: {}", code);
    }
    if let Some(records) = result.records {
        println!("records: {}", records);
    }
    println!("elapsed_ms: {}", result.elapsed_ms);
    if !result.sandbox_removed {
        println!(
            "sandbox_removed: false ({})",
            result.teardown_error.as_deref().unwrap_or("unknown error")
        );
    }
}

const CALIBRATION_TEMPLATE: &str = "\
version: '0.1'
campaign:
  id: ''                              # REQUIRED
  workers: 1
template:
  dir: ''                             # REQUIRED: directory copied into every sandbox
  prefix: simcal_sandbox_
  exclude: []
simulator:
  command: []                         # REQUIRED: e.g. [./DHSVM3.1.3, Input.sauk.global]
  config_file: ''                     # REQUIRED: patched file, relative to the template
  timeout_seconds: 3600
  on_nonzero_exit: fail               # fail | parse
output:
  path: ''                            # REQUIRED: e.g. output/Streamflow.Only
  column: 1                           # index into the header, or a quoted name
  unit_scale: 1.0
  trim_trailing: 0
observations:
  path: validation.csv
  column: value
parameters: []                        # REQUIRED: - { name, lower, upper, best_guess }
settings: []                          # REQUIRED: - { key, parameter, factors, repeat, decimals, scope }
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_values_parse_name_and_number() {
        let parsed = parse_set_values(&[
            "Lateral_Conductivity_61=0.0017".to_string(),
            " scale = -2 ".to_string(),
        ])
        .expect("parse");
        assert_eq!(
            parsed,
            vec![
                ("Lateral_Conductivity_61".to_string(), 0.0017),
                ("scale".to_string(), -2.0)
            ]
        );
        assert!(parse_set_values(&["scale".to_string()]).is_err());
        assert!(parse_set_values(&["=1".to_string()]).is_err());
        assert!(parse_set_values(&["scale=fast".to_string()]).is_err());
    }

    #[test]
    fn patch_accepts_repeated_values() {
        let cli = Cli::try_parse_from([
            "simcal",
            "patch",
            "Input.global",
            "--key",
            "Vertical Conductivity 61",
            "--value",
            "0.1",
            "0.1",
            "0.1",
            "--first",
            "--json",
        ])
        .expect("parse");
        assert!(command_json_mode(&cli.command));
        match cli.command {
            Commands::Patch {
                key, values, first, ..
            } => {
                assert_eq!(key, "Vertical Conductivity 61");
                assert_eq!(values, vec!["0.1", "0.1", "0.1"]);
                assert!(first);
            }
            _ => panic!("expected patch"),
        }
    }

    #[test]
    fn template_is_a_parseable_calibration() {
        let parsed: Result<Calibration, _> = serde_yaml::from_str(CALIBRATION_TEMPLATE);
        let cal = parsed.expect("template parses");
        let err = cal.validate().expect_err("template has REQUIRED blanks");
        match err {
            CalibrationError::Invalid(issues) => {
                assert!(issues.iter().any(|i| i.contains("campaign.id")));
                assert!(issues.iter().any(|i| i.contains("template.dir")));
                assert!(issues.iter().any(|i| i.contains("simulator.command")));
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
