#![cfg(unix)]

use chrono::Utc;
use simcal_core::{ensure_dir, ParameterVector, WorkerId};
use simcal_runner::config_patch::{self, ConfigSetting};
use simcal_runner::{
    evaluate_once, run_calibration, run_campaign, Calibration, CampaignOptions, EvaluationHarness,
    FailureKind, RunOptions,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;

const MODEL_CFG: &str = "\
# sauk basin
Scale = 0.0
Lateral Conductivity 61 = 0.0
Lateral Conductivity 610 = 9.9
";

// Refuses to run if another evaluation's marker is visible in its cwd.
const SIM_SCRIPT: &str = r#"scale=$(sed -n 's/^Scale = //p' model.cfg)
for m in marker_*; do
  if [ -e "$m" ]; then echo "foreign marker $m" >&2; exit 9; fi
done
touch "marker_$$"
sleep 0.2
case "$scale" in
  -*) echo "negative scale $scale" >&2; exit 4 ;;
esac
mkdir -p output
echo "DATE Q" > output/flow.txt
for i in 1 2 3 4; do
  echo "2020-01-0$i $(awk "BEGIN { print $i * $scale }")" >> output/flow.txt
done
"#;

const CALIBRATION_YAML: &str = r#"
version: '0.1'
campaign:
  id: e2e
  workers: 2
template:
  dir: model
simulator:
  command: [sh, sim.sh]
  config_file: model.cfg
  timeout_seconds: 30
output:
  path: output/flow.txt
  column: Q
  trim_trailing: 1
observations:
  path: validation.csv
parameters:
  - { name: scale, lower: -5, upper: 5, best_guess: 1 }
  - { name: lateral, lower: 0.00001, upper: 0.01, best_guess: 0.0017 }
settings:
  - { key: Scale, parameter: scale }
  - { key: Lateral Conductivity 61, parameter: lateral }
"#;

fn project(tag: &str) -> (PathBuf, PathBuf) {
    let root = std::env::temp_dir().join(format!(
        "simcal_e2e_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    let model = root.join("model");
    ensure_dir(&model).expect("model dir");
    fs::write(model.join("model.cfg"), MODEL_CFG).expect("config");
    fs::write(model.join("sim.sh"), SIM_SCRIPT).expect("script");
    fs::write(root.join("validation.csv"), "value\n1\n2\n3\n").expect("observations");
    let calibration = root.join("calibration.yaml");
    fs::write(&calibration, CALIBRATION_YAML).expect("calibration");
    (root, calibration)
}

fn assert_template_untouched(root: &Path) {
    let model = root.join("model");
    let leftovers: Vec<String> = fs::read_dir(&model)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|n| n.starts_with("simcal_sandbox_") || n.starts_with("marker_"))
        .collect();
    assert!(leftovers.is_empty(), "leftovers: {:?}", leftovers);
    assert_eq!(fs::read_to_string(model.join("model.cfg")).unwrap(), MODEL_CFG);
}

#[test]
fn patch_changes_only_the_exact_key() {
    let (root, _) = project("patch");
    let cfg = root.join("model").join("model.cfg");
    let replaced = config_patch::apply(&cfg, &ConfigSetting::new("Lateral Conductivity 61", "0.0017"))
        .expect("patch");
    assert_eq!(replaced, 1);
    let patched = fs::read_to_string(&cfg).unwrap();
    let before: Vec<&str> = MODEL_CFG.lines().collect();
    let after: Vec<&str> = patched.lines().collect();
    assert_eq!(before.len(), after.len());
    let changed: Vec<usize> = (0..before.len()).filter(|i| before[*i] != after[*i]).collect();
    assert_eq!(changed, vec![2]);
    assert_eq!(after[2], "Lateral Conductivity 61 = 0.0017");
    let _ = fs::remove_dir_all(root);
}

#[test]
fn concurrent_workers_never_share_a_sandbox() {
    let (root, path) = project("concurrent");
    let calibration = Calibration::load(&path).expect("load");
    let harness = EvaluationHarness::new(
        calibration.harness_config(),
        calibration.parameters.clone(),
        vec![1.0, 2.0, 3.0],
    );
    let params = ParameterVector::best_guess(&calibration.parameters);

    let results = thread::scope(|scope| {
        let handles: Vec<_> = (0..2)
            .map(|w| {
                let harness = &harness;
                let params = &params;
                scope.spawn(move || {
                    let worker = WorkerId::new(format!("it-{}", w)).unwrap();
                    (0..2)
                        .map(|_| harness.evaluate(&worker, params))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    });

    assert_eq!(results.len(), 4);
    for result in &results {
        assert_eq!(result.score(), Some(1.0), "{:?}", result.outcome);
        assert!(result.sandbox_removed);
    }
    assert_template_untouched(&root);
    let _ = fs::remove_dir_all(root);
}

#[test]
fn campaign_over_sampled_vectors() {
    let (root, path) = project("campaign");
    let calibration = Calibration::load(&path).expect("load");
    let harness = EvaluationHarness::new(
        calibration.harness_config(),
        calibration.parameters.clone(),
        vec![1.0, 2.0, 3.0],
    );
    let samples: Vec<ParameterVector> = [1.0, 2.0, -1.0, 1.0]
        .iter()
        .map(|s| ParameterVector::from_pairs([("scale", *s), ("lateral", 0.0017)]))
        .collect();
    let options = CampaignOptions {
        workers: 2,
        ..CampaignOptions::default()
    };
    let report = run_campaign(&harness, &samples, &options, &mut |_, _| Ok(())).expect("campaign");
    assert_eq!(report.evaluated(), 4);
    assert_eq!(report.succeeded(), 3);
    let failed = report.results[2].as_ref().unwrap();
    assert_eq!(failed.failure().unwrap().kind, FailureKind::NonZeroExit);
    assert!(failed.failure().unwrap().reason.contains("negative scale"));
    assert_eq!(report.best().map(|(_, s)| s), Some(1.0));
    assert_template_untouched(&root);
    let _ = fs::remove_dir_all(root);
}

#[test]
fn run_writes_result_artifacts() {
    let (root, path) = project("run");
    let samples = root.join("samples.csv");
    fs::write(&samples, "scale,lateral\n1,0.0017\n2,0.0017\n-1,0.0017\n").unwrap();
    let result = run_calibration(
        &path,
        &RunOptions {
            samples: Some(samples),
            ..RunOptions::default()
        },
    )
    .expect("run");
    assert_eq!(result.evaluated, 3);
    assert_eq!(result.succeeded, 2);
    assert_eq!(result.failed, 1);
    assert_eq!(result.skipped, 0);
    assert!(!result.stopped);
    let best = result.best.as_ref().expect("best");
    assert_eq!(best.index, 0);
    assert_eq!(best.score, 1.0);

    let run_dir = &result.run_dir;
    assert!(run_dir.starts_with(root.canonicalize().unwrap().join(".simcal").join("runs")));
    assert!(run_dir.join("resolved_calibration.json").is_file());

    let jsonl = fs::read_to_string(run_dir.join("results.jsonl")).unwrap();
    assert_eq!(jsonl.lines().count(), 3);

    let csv = fs::read_to_string(run_dir.join("results.csv")).unwrap();
    let rows: Vec<&str> = csv.lines().collect();
    assert_eq!(rows.len(), 4);
    assert!(rows[0].ends_with(",scale,lateral"));
    let failed_row = rows.iter().find(|r| r.starts_with("2,")).expect("row 2");
    assert!(failed_row.contains(",non_zero_exit,NaN,"));

    let summary: serde_json::Value =
        serde_json::from_slice(&fs::read(run_dir.join("summary.json")).unwrap()).unwrap();
    assert_eq!(summary["evaluated"], 3);
    assert_eq!(summary["best"]["index"], 0);
    let control: serde_json::Value = serde_json::from_slice(
        &fs::read(run_dir.join("runtime").join("run_control.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(control["status"], "completed");

    assert_template_untouched(&root);
    let _ = fs::remove_dir_all(root);
}

#[test]
fn evaluate_once_applies_overrides() {
    let (root, path) = project("once");
    let result = evaluate_once(&path, &[("scale".to_string(), 2.0)], None).expect("evaluate");
    // sim [2,4,6] vs obs [1,2,3]
    assert!((result.score().unwrap() + 6.0).abs() < 1e-9);
    let err = evaluate_once(&path, &[("nope".to_string(), 1.0)], None).expect_err("unknown");
    assert!(err.to_string().contains("unknown parameter 'nope'"));
    assert_template_untouched(&root);
    let _ = fs::remove_dir_all(root);
}

#[test]
fn clean_removes_leaked_sandboxes() {
    let (root, path) = project("clean");
    let leaked = root.join("model").join("simcal_sandbox_999-w0");
    ensure_dir(&leaked.join("output")).unwrap();
    let removed = simcal_runner::clean_sandboxes(&path).expect("clean");
    assert_eq!(removed.len(), 1);
    assert!(!leaked.exists());
    assert!(root.join("model").join("model.cfg").is_file());
    let _ = fs::remove_dir_all(root);
}
