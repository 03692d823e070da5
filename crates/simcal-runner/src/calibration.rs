//! The calibration file: what to copy, what to patch, what to run, what to
//! read back and what to compare it with.

use crate::config_patch::{ConfigSetting, Scope};
use crate::error::CalibrationError;
use crate::harness::{HarnessConfig, NonZeroExitPolicy};
use crate::invoke::SimulatorCommand;
use crate::output::{ColumnSelector, OutputSpec};
use crate::sandbox::SandboxLayout;
use serde::{Deserialize, Serialize};
use simcal_core::{ParameterSpec, ParameterVector};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MAX_DECIMALS: u32 = 15;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Calibration {
    pub version: String,
    pub campaign: CampaignSection,
    pub template: TemplateSection,
    pub simulator: SimulatorSection,
    pub output: OutputSpec,
    pub observations: ObservationSource,
    pub parameters: Vec<ParameterSpec>,
    pub settings: Vec<SettingBinding>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignSection {
    pub id: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_workers() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSection {
    pub dir: PathBuf,
    #[serde(flatten)]
    pub layout: SandboxLayout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorSection {
    pub command: Vec<String>,
    /// The configuration file patched in every sandbox, relative to its root.
    pub config_file: PathBuf,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub on_nonzero_exit: NonZeroExitPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationSource {
    pub path: PathBuf,
    #[serde(default = "default_observation_column")]
    pub column: String,
}

fn default_observation_column() -> String {
    "value".to_string()
}

/// Derives one config setting from one parameter. Each factor yields one
/// value (`parameter * factor`); the factor list is written `repeat` times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingBinding {
    pub key: String,
    pub parameter: String,
    #[serde(default = "default_factors")]
    pub factors: Vec<f64>,
    #[serde(default = "default_repeat")]
    pub repeat: usize,
    #[serde(default = "default_decimals")]
    pub decimals: u32,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_factors() -> Vec<f64> {
    vec![1.0]
}

fn default_repeat() -> usize {
    1
}

fn default_decimals() -> u32 {
    5
}

fn default_required() -> bool {
    true
}

impl SettingBinding {
    /// `None` when `params` has no value for the bound parameter.
    pub fn to_setting(&self, params: &ParameterVector) -> Option<ConfigSetting> {
        let value = params.get(&self.parameter)?;
        let values: Vec<String> = (0..self.repeat)
            .flat_map(|_| self.factors.iter())
            .map(|f| format_value(value * f, self.decimals))
            .collect();
        let mut setting = ConfigSetting::repeated(self.key.clone(), &values).with_scope(self.scope);
        setting.required = self.required;
        Some(setting)
    }
}

/// Rounds to `decimals` places and prints the shortest representation.
pub fn format_value(value: f64, decimals: u32) -> String {
    let scale = 10f64.powi(decimals.min(MAX_DECIMALS) as i32);
    let rounded = (value * scale).round() / scale;
    if rounded == 0.0 {
        "0".to_string()
    } else {
        format!("{}", rounded)
    }
}

impl Calibration {
    /// Reads and validates `path`; relative template and observation paths are
    /// resolved against the file's directory.
    pub fn load(path: &Path) -> Result<Self, CalibrationError> {
        let raw = fs::read_to_string(path).map_err(|source| CalibrationError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut calibration: Calibration = serde_yaml::from_str(&raw)?;
        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
        calibration.resolve_paths(&base);
        calibration.validate()?;
        Ok(calibration)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let absolutize = |p: &Path| -> PathBuf {
            if p.as_os_str().is_empty() {
                PathBuf::new()
            } else if p.is_relative() {
                simcal_core::normalize_path(&base.join(p))
            } else {
                p.to_path_buf()
            }
        };
        self.template.dir = absolutize(&self.template.dir);
        self.observations.path = absolutize(&self.observations.path);
        if let Some(root) = self.template.layout.root.take() {
            self.template.layout.root = Some(absolutize(&root));
        }
    }

    /// Reports every problem at once.
    pub fn validate(&self) -> Result<(), CalibrationError> {
        let mut issues = Vec::new();
        if self.campaign.id.trim().is_empty() {
            issues.push("campaign.id must not be empty".to_string());
        }
        if self.campaign.workers == 0 {
            issues.push("campaign.workers must be at least 1".to_string());
        }
        if self.template.dir.as_os_str().is_empty() {
            issues.push("template.dir must not be empty".to_string());
        }
        if self.template.layout.prefix.is_empty() {
            issues.push("template.prefix must not be empty".to_string());
        }
        if self.simulator.command.is_empty() {
            issues.push("simulator.command must not be empty".to_string());
        }
        check_relative(&self.simulator.config_file, "simulator.config_file", &mut issues);
        if self.simulator.timeout_seconds == Some(0) {
            issues.push("simulator.timeout_seconds must be positive when set".to_string());
        }
        check_relative(&self.output.path, "output.path", &mut issues);
        if !self.output.unit_scale.is_finite() || self.output.unit_scale == 0.0 {
            issues.push("output.unit_scale must be finite and non-zero".to_string());
        }
        if self.output.column == ColumnSelector::Index(0) {
            issues.push("output.column 0 is the timestamp; pick a value column".to_string());
        }

        if self.observations.path.as_os_str().is_empty() {
            issues.push("observations.path must not be empty".to_string());
        }

        if self.parameters.is_empty() {
            issues.push("parameters must not be empty".to_string());
        }
        let mut names = BTreeSet::new();
        for p in &self.parameters {
            if p.name.trim().is_empty() {
                issues.push("parameter name must not be empty".to_string());
            } else if !names.insert(p.name.as_str()) {
                issues.push(format!("parameter '{}' is declared twice", p.name));
            }
            if !(p.lower.is_finite() && p.upper.is_finite() && p.best_guess.is_finite()) {
                issues.push(format!("parameter '{}' has non-finite bounds", p.name));
            } else if !p.contains(p.best_guess) {
                issues.push(format!(
                    "parameter '{}' best_guess {} lies outside [{}, {}]",
                    p.name, p.best_guess, p.lower, p.upper
                ));
            }
        }

        if self.settings.is_empty() {
            issues.push("settings must not be empty".to_string());
        }
        for s in &self.settings {
            if s.key.trim().is_empty() || s.key.contains('\n') || s.key.contains('=') {
                issues.push(format!("setting key '{}' is not a valid key", s.key));
            }
            if !names.contains(s.parameter.as_str()) {
                issues.push(format!(
                    "setting '{}' references unknown parameter '{}'",
                    s.key, s.parameter
                ));
            }
            if s.factors.is_empty() || s.factors.iter().any(|f| !f.is_finite()) {
                issues.push(format!("setting '{}' needs finite factors", s.key));
            }
            if s.repeat == 0 {
                issues.push(format!("setting '{}' repeat must be at least 1", s.key));
            }
            if s.decimals > MAX_DECIMALS {
                issues.push(format!(
                    "setting '{}' decimals must be at most {}",
                    s.key, MAX_DECIMALS
                ));
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(CalibrationError::Invalid(issues))
        }
    }

    pub fn harness_config(&self) -> HarnessConfig {
        HarnessConfig {
            template_dir: self.template.dir.clone(),
            layout: self.template.layout.clone(),
            config_file: self.simulator.config_file.clone(),
            bindings: self.settings.clone(),
            simulator: SimulatorCommand {
                command: self.simulator.command.clone(),
                timeout: self.simulator.timeout_seconds.map(Duration::from_secs),
            },
            on_nonzero_exit: self.simulator.on_nonzero_exit,
            output: self.output.clone(),
        }
    }
}

fn check_relative(path: &Path, field: &str, issues: &mut Vec<String>) {
    if path.as_os_str().is_empty() {
        issues.push(format!("{} must not be empty", field));
    } else if path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        issues.push(format!("{} must be a path inside the sandbox", field));
    }
}
