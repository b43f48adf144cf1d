//! Core vocabulary: phases, steps, predicates and their results.

use crate::core::time;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stable phase identifiers. Never renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PhaseId {
    Phase1,
    Phase2,
    Phase3,
    Phase4,
    Phase5,
    Phase6,
    Phase7,
}

impl PhaseId {
    pub const ALL: [PhaseId; 7] = [
        PhaseId::Phase1,
        PhaseId::Phase2,
        PhaseId::Phase3,
        PhaseId::Phase4,
        PhaseId::Phase5,
        PhaseId::Phase6,
        PhaseId::Phase7,
    ];

    pub fn number(self) -> u8 {
        match self {
            PhaseId::Phase1 => 1,
            PhaseId::Phase2 => 2,
            PhaseId::Phase3 => 3,
            PhaseId::Phase4 => 4,
            PhaseId::Phase5 => 5,
            PhaseId::Phase6 => 6,
            PhaseId::Phase7 => 7,
        }
    }

    pub fn from_number(n: u8) -> Option<Self> {
        Self::ALL.get(usize::from(n).checked_sub(1)?).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PhaseId::Phase1 => "Phase1",
            PhaseId::Phase2 => "Phase2",
            PhaseId::Phase3 => "Phase3",
            PhaseId::Phase4 => "Phase4",
            PhaseId::Phase5 => "Phase5",
            PhaseId::Phase6 => "Phase6",
            PhaseId::Phase7 => "Phase7",
        }
    }

    /// Required prefix of every step id declared in this phase (`phase3.`).
    pub fn step_prefix(self) -> String {
        format!("phase{}.", self.number())
    }
}

impl fmt::Display for PhaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseId {
    type Err = String;

    /// Accepts `Phase3`, `phase3` or `3`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let digits = lower.strip_prefix("phase").unwrap_or(&lower);
        digits
            .parse::<u8>()
            .ok()
            .and_then(PhaseId::from_number)
            .ok_or_else(|| format!("unknown phase '{}': expected Phase1..Phase7", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Blocking,
    Warning,
    Informational,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Blocking => write!(f, "blocking"),
            Severity::Warning => write!(f, "warning"),
            Severity::Informational => write!(f, "informational"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositeMode {
    #[default]
    All,
    Any,
}

/// What a step verifies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    /// A repo-relative file exists, optionally containing a regex match.
    FileExists {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        contains: Option<String>,
    },
    /// A declared check exits 0 against the resolved scope.
    CheckPassed { check: String },
    /// A measurement emitted by `check` stays within the metric's ceiling.
    MetricWithinBaseline { metric: String, check: String },
    /// The gate artifact of `phase` carries at least one valid signature.
    SignaturePresent { phase: PhaseId },
    Composite {
        #[serde(default)]
        mode: CompositeMode,
        of: Vec<Predicate>,
    },
}

impl Predicate {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Predicate::FileExists { .. } => "file_exists",
            Predicate::CheckPassed { .. } => "check_passed",
            Predicate::MetricWithinBaseline { .. } => "metric_within_baseline",
            Predicate::SignaturePresent { .. } => "signature_present",
            Predicate::Composite { .. } => "composite",
        }
    }

    /// Every check this predicate (transitively) runs.
    pub fn check_names(&self) -> Vec<&str> {
        match self {
            Predicate::CheckPassed { check } | Predicate::MetricWithinBaseline { check, .. } => {
                vec![check.as_str()]
            }
            Predicate::Composite { of, .. } => of.iter().flat_map(|p| p.check_names()).collect(),
            Predicate::FileExists { .. } | Predicate::SignaturePresent { .. } => Vec::new(),
        }
    }
}

/// One atomic verification within a phase, declared once per config version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub phase: PhaseId,
    #[serde(default)]
    pub description: String,
    pub predicate: Predicate,
    #[serde(default)]
    pub severity: Severity,
    /// Optional steps resolve to Skip instead of Fail when they cannot be evaluated.
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
    Skip,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Pass => write!(f, "PASS"),
            Outcome::Fail => write!(f, "FAIL"),
            Outcome::Skip => write!(f, "SKIP"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub outcome: Outcome,
    pub detail: String,
    pub measured_at: String,
}

impl StepResult {
    pub fn new(step_id: &str, outcome: Outcome, detail: impl Into<String>) -> Self {
        Self {
            step_id: step_id.to_string(),
            outcome,
            detail: detail.into(),
            measured_at: time::now_epoch_z(),
        }
    }

    pub fn pass(step_id: &str, detail: impl Into<String>) -> Self {
        Self::new(step_id, Outcome::Pass, detail)
    }

    pub fn fail(step_id: &str, detail: impl Into<String>) -> Self {
        Self::new(step_id, Outcome::Fail, detail)
    }

    pub fn skip(step_id: &str, detail: impl Into<String>) -> Self {
        Self::new(step_id, Outcome::Skip, detail)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    NotStarted,
    InProgress,
    Passed,
    Failed,
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseStatus::NotStarted => write!(f, "not_started"),
            PhaseStatus::InProgress => write!(f, "in_progress"),
            PhaseStatus::Passed => write!(f, "passed"),
            PhaseStatus::Failed => write!(f, "failed"),
        }
    }
}

/// How a bypass actor may skip signature requirements.
///
/// Only `Always` is unconditional; `PullRequest` bypass is honoured by the
/// hosting platform, not by the local gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BypassMode {
    #[default]
    Always,
    PullRequest,
}

impl BypassMode {
    pub fn as_str(self) -> &'static str {
        match self {
            BypassMode::Always => "always",
            BypassMode::PullRequest => "pull_request",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BypassActor {
    pub actor_id: String,
    #[serde(default)]
    pub mode: BypassMode,
}
