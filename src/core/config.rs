//! Gate declarations loaded from `.phasegate/gates.toml`.
//!
//! A schema violation here aborts the run with `ConfigError`; it is never
//! downgraded to a failing step.

use crate::core::error::PhasegateError;
use crate::core::model::{BypassActor, PhaseId, Predicate, Step};
use crate::core::store::Store;
use regex::Regex;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;

pub const DEFAULT_BASE_REF: &str = "main";
pub const DEFAULT_CACHE_TTL_HOURS: u64 = 24;
pub const DEFAULT_REQUIRED_SIGNERS: usize = 2;
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Files whose change invalidates every incremental shortcut.
pub const DEFAULT_FORCE_FULL: &[&str] = &[
    "Cargo.toml",
    "**/Cargo.toml",
    "Cargo.lock",
    "package.json",
    "package-lock.json",
    "pyproject.toml",
    "go.mod",
    ".phasegate/**",
    "spec.md",
    "SPEC.md",
    "**/*.spec.md",
];

/// An external tool invocation, run through the `Checker` seam.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckDef {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub description: String,
    /// Overrides `settings.default_timeout_secs`.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Safe to re-run once after a failure.
    #[serde(default)]
    pub retriable: bool,
    /// Append changed files as trailing arguments in incremental mode.
    #[serde(default)]
    pub pass_files: bool,
    /// A missing tool for a required check is a configuration error.
    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDef {
    pub id: PhaseId,
    #[serde(default)]
    pub name: String,
    /// Failure blocks every later phase; completion requires attestation.
    #[serde(default)]
    pub is_gate: bool,
    #[serde(default)]
    pub required_signers: Option<usize>,
    /// Run this phase's checks as concurrent workers.
    #[serde(default)]
    pub parallel: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_base_ref")]
    pub base_ref: String,
    #[serde(default = "default_ttl")]
    pub cache_ttl_hours: u64,
    #[serde(default = "default_required_signers")]
    pub required_signers: usize,
    #[serde(default)]
    pub bypass_actors: Vec<BypassActor>,
    /// Extra force-full patterns on top of `DEFAULT_FORCE_FULL`.
    #[serde(default)]
    pub force_full: Vec<String>,
    /// Minimum pass rate the final gate demands of each gate phase.
    #[serde(default)]
    pub min_pass_rate: Option<f64>,
    #[serde(default = "default_timeout")]
    pub default_timeout_secs: u64,
}

fn default_base_ref() -> String {
    DEFAULT_BASE_REF.to_string()
}

fn default_ttl() -> u64 {
    DEFAULT_CACHE_TTL_HOURS
}

fn default_required_signers() -> usize {
    DEFAULT_REQUIRED_SIGNERS
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_ref: default_base_ref(),
            cache_ttl_hours: DEFAULT_CACHE_TTL_HOURS,
            required_signers: DEFAULT_REQUIRED_SIGNERS,
            bypass_actors: Vec::new(),
            force_full: Vec::new(),
            min_pass_rate: None,
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl Settings {
    /// Apply `PHASEGATE_BASE_REF` and `PHASEGATE_CACHE_TTL_HOURS`.
    pub fn apply_env(&mut self) -> Result<(), PhasegateError> {
        if let Ok(base) = std::env::var("PHASEGATE_BASE_REF")
            && !base.trim().is_empty()
        {
            self.base_ref = base.trim().to_string();
        }
        if let Ok(raw) = std::env::var("PHASEGATE_CACHE_TTL_HOURS") {
            self.cache_ttl_hours = raw.trim().parse::<u64>().map_err(|_| {
                PhasegateError::ConfigError(format!(
                    "PHASEGATE_CACHE_TTL_HOURS must be a whole number of hours, got '{}'",
                    raw
                ))
            })?;
        }
        Ok(())
    }

    pub fn force_full_patterns(&self) -> Vec<String> {
        DEFAULT_FORCE_FULL
            .iter()
            .map(|s| s.to_string())
            .chain(self.force_full.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GateConfig {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub check: Vec<CheckDef>,
    #[serde(default)]
    pub phase: Vec<PhaseDef>,
    #[serde(default)]
    pub step: Vec<Step>,
}

impl GateConfig {
    pub fn parse(content: &str) -> Result<Self, PhasegateError> {
        let config: GateConfig = toml::from_str(content)
            .map_err(|e| PhasegateError::ConfigError(format!("gates.toml: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load, apply env overrides, and validate the store's declarations.
    pub fn load(store: &Store) -> Result<Self, PhasegateError> {
        let path = store.config_path();
        if !path.exists() {
            return Err(PhasegateError::ConfigError(format!(
                "no step declarations at {} (run `phasegate init`)",
                path.display()
            )));
        }
        let content = fs::read_to_string(&path)?;
        let mut config = Self::parse(&content)?;
        config.settings.apply_env()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PhasegateError> {
        let mut errors = Vec::new();

        if self.settings.required_signers == 0 {
            errors.push("settings.required_signers must be at least 1".to_string());
        }
        if let Some(rate) = self.settings.min_pass_rate
            && !(0.0..=1.0).contains(&rate)
        {
            errors.push(format!("settings.min_pass_rate {} is outside 0.0..=1.0", rate));
        }

        let mut check_names = FxHashSet::default();
        for check in &self.check {
            if check.name.trim().is_empty() {
                errors.push("check with empty name".to_string());
            }
            if check.command.trim().is_empty() {
                errors.push(format!("check '{}' has an empty command", check.name));
            }
            if !check_names.insert(check.name.as_str()) {
                errors.push(format!("duplicate check '{}'", check.name));
            }
        }

        let mut phases = FxHashSet::default();
        for phase in &self.phase {
            if !phases.insert(phase.id) {
                errors.push(format!("duplicate phase '{}'", phase.id));
            }
            if phase.required_signers == Some(0) {
                errors.push(format!("phase '{}' requires 0 signers", phase.id));
            }
        }

        let mut step_ids = FxHashSet::default();
        for step in &self.step {
            if !step_ids.insert(step.id.as_str()) {
                errors.push(format!("duplicate step id '{}'", step.id));
            }
            let prefix = step.phase.step_prefix();
            if !step.id.starts_with(&prefix) || step.id.len() == prefix.len() {
                errors.push(format!(
                    "step '{}' must be named '{}<name>' to match its phase",
                    step.id, prefix
                ));
            }
            if !phases.contains(&step.phase) {
                errors.push(format!(
                    "step '{}' belongs to undeclared phase '{}'",
                    step.id, step.phase
                ));
            }
            self.validate_predicate(&step.id, &step.predicate, &check_names, &mut errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(PhasegateError::ConfigError(errors.join("; ")))
        }
    }

    fn validate_predicate(
        &self,
        step_id: &str,
        predicate: &Predicate,
        check_names: &FxHashSet<&str>,
        errors: &mut Vec<String>,
    ) {
        match predicate {
            Predicate::FileExists { path, contains } => {
                if path.trim().is_empty() {
                    errors.push(format!("step '{}' checks an empty path", step_id));
                }
                if let Some(pattern) = contains
                    && let Err(e) = Regex::new(pattern)
                {
                    errors.push(format!("step '{}' has invalid pattern: {}", step_id, e));
                }
            }
            Predicate::CheckPassed { check } | Predicate::MetricWithinBaseline { check, .. } => {
                if !check_names.contains(check.as_str()) {
                    errors.push(format!(
                        "step '{}' references undeclared check '{}'",
                        step_id, check
                    ));
                }
                if let Predicate::MetricWithinBaseline { metric, .. } = predicate
                    && metric.trim().is_empty()
                {
                    errors.push(format!("step '{}' names an empty metric", step_id));
                }
            }
            Predicate::SignaturePresent { phase } => {
                if !self.phase.iter().any(|p| p.id == *phase && p.is_gate) {
                    errors.push(format!(
                        "step '{}' expects a signature for '{}', which is not a declared gate phase",
                        step_id, phase
                    ));
                }
            }
            Predicate::Composite { of, .. } => {
                if of.is_empty() {
                    errors.push(format!("step '{}' has an empty composite", step_id));
                }
                for inner in of {
                    self.validate_predicate(step_id, inner, check_names, errors);
                }
            }
        }
    }

    pub fn phase_def(&self, id: PhaseId) -> Option<&PhaseDef> {
        self.phase.iter().find(|p| p.id == id)
    }

    /// Declared phases in pipeline order.
    pub fn ordered_phases(&self) -> Vec<&PhaseDef> {
        let mut phases: Vec<&PhaseDef> = self.phase.iter().collect();
        phases.sort_by_key(|p| p.id);
        phases
    }

    /// The declared phase immediately before `id`, if any.
    pub fn predecessor(&self, id: PhaseId) -> Option<&PhaseDef> {
        self.ordered_phases().into_iter().rev().find(|p| p.id < id)
    }

    pub fn steps_for(&self, id: PhaseId) -> Vec<&Step> {
        self.step.iter().filter(|s| s.phase == id).collect()
    }

    pub fn checks_by_name(&self) -> BTreeMap<String, CheckDef> {
        self.check
            .iter()
            .map(|c| (c.name.clone(), c.clone()))
            .collect()
    }

    pub fn required_signers_for(&self, id: PhaseId) -> usize {
        self.phase_def(id)
            .and_then(|p| p.required_signers)
            .unwrap_or(self.settings.required_signers)
    }
}

/// Starter declaration written by `phasegate init`.
pub const STARTER_CONFIG: &str = r#"# phasegate step declarations.
# Step ids must be prefixed by their phase: phase1.<name> ... phase7.<name>.

[settings]
base_ref = "main"
cache_ttl_hours = 24
required_signers = 2
default_timeout_secs = 5
# bypass_actors = [{ actor_id = "release-bot", mode = "always" }]
# force_full = ["build.rs"]
# min_pass_rate = 0.9

[[check]]
name = "fmt"
command = "cargo"
args = ["fmt", "--check"]

[[check]]
name = "clippy"
command = "cargo"
args = ["clippy", "--quiet"]
timeout_secs = 300

[[check]]
name = "test"
command = "cargo"
args = ["test", "--quiet"]
timeout_secs = 600
retriable = true

[[phase]]
id = "Phase1"
name = "Specification"

[[phase]]
id = "Phase2"
name = "Design"

[[phase]]
id = "Phase3"
name = "Implementation"

[[phase]]
id = "Phase4"
name = "Testing"
is_gate = true

[[phase]]
id = "Phase5"
name = "Review"
is_gate = true
parallel = true

[[phase]]
id = "Phase6"
name = "Documentation"

[[phase]]
id = "Phase7"
name = "Release"

[[step]]
id = "phase1.spec-present"
phase = "Phase1"
description = "Specification document exists"
predicate = { kind = "file_exists", path = "SPEC.md" }

[[step]]
id = "phase2.design-present"
phase = "Phase2"
description = "Design notes exist"
predicate = { kind = "composite", mode = "any", of = [{ kind = "file_exists", path = "DESIGN.md" }, { kind = "file_exists", path = "docs/design.md" }] }

[[step]]
id = "phase3.formatted"
phase = "Phase3"
predicate = { kind = "check_passed", check = "fmt" }

[[step]]
id = "phase4.tests"
phase = "Phase4"
predicate = { kind = "check_passed", check = "test" }

[[step]]
id = "phase5.lint"
phase = "Phase5"
predicate = { kind = "check_passed", check = "clippy" }

[[step]]
id = "phase5.testing-attested"
phase = "Phase5"
predicate = { kind = "signature_present", phase = "Phase4" }

[[step]]
id = "phase6.readme"
phase = "Phase6"
severity = "warning"
predicate = { kind = "file_exists", path = "README.md" }

[[step]]
id = "phase7.changelog"
phase = "Phase7"
severity = "informational"
optional = true
predicate = { kind = "file_exists", path = "CHANGELOG.md" }
"#;
