//! Phase state machine: entry rules, step evaluation and aggregation.
//!
//! Phase status is kept per branch in `.phasegate/state/<branch>.json`.
//! Evaluating a phase returns a `PhaseReport` carrying its own tally; no
//! counters live outside the report.

use crate::core::attest::{Authorization, GateArtifact, GateAttestor, GateStore};
use crate::core::baseline::{BaselineGuard, BaselineVerdict};
use crate::core::config::GateConfig;
use crate::core::error::PhasegateError;
use crate::core::evidence::{EvidenceRecord, EvidenceRecorder};
use crate::core::model::{
    CompositeMode, Outcome, PhaseId, PhaseStatus, Predicate, Severity, Step, StepResult,
};
use crate::core::runner::{CheckRun, CheckRunner};
use crate::core::scope::ChangeScope;
use crate::core::store::{Store, branch_component, write_atomic};
use crate::core::time;
use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

pub const DEADLINE_DETAIL: &str = "timed out";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub status: PhaseStatus,
    pub updated_at: String,
    #[serde(default)]
    pub run_id: Option<String>,
}

/// Per-branch phase status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseLedger {
    pub branch: String,
    #[serde(default)]
    pub phases: BTreeMap<PhaseId, LedgerEntry>,
}

impl PhaseLedger {
    pub fn status(&self, phase: PhaseId) -> PhaseStatus {
        self.phases
            .get(&phase)
            .map(|e| e.status)
            .unwrap_or_default()
    }

    fn set(&mut self, phase: PhaseId, status: PhaseStatus, run_id: &str) {
        self.phases.insert(
            phase,
            LedgerEntry {
                status,
                updated_at: time::now_epoch_z(),
                run_id: Some(run_id.to_string()),
            },
        );
    }
}

pub fn ledger_path(store: &Store, branch: &str) -> PathBuf {
    store
        .state_dir()
        .join(format!("{}.json", branch_component(branch)))
}

pub fn load_ledger(store: &Store, branch: &str) -> Result<PhaseLedger, PhasegateError> {
    let path = ledger_path(store, branch);
    if !path.exists() {
        return Ok(PhaseLedger {
            branch: branch.to_string(),
            phases: BTreeMap::new(),
        });
    }
    let raw = fs::read_to_string(&path)?;
    serde_json::from_str(&raw).map_err(|e| {
        PhasegateError::ValidationError(format!("corrupt phase ledger {}: {}", path.display(), e))
    })
}

fn save_ledger(store: &Store, ledger: &PhaseLedger) -> Result<(), PhasegateError> {
    let bytes = serde_json::to_vec_pretty(ledger)?;
    write_atomic(&ledger_path(store, &ledger.branch), &bytes)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PhaseTally {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl PhaseTally {
    pub fn from_results(results: &[StepResult]) -> Self {
        let mut tally = Self {
            total: results.len(),
            ..Self::default()
        };
        for r in results {
            match r.outcome {
                Outcome::Pass => tally.passed += 1,
                Outcome::Fail => tally.failed += 1,
                Outcome::Skip => tally.skipped += 1,
            }
        }
        tally
    }

    /// `passed / total`; 0.0 for an empty phase.
    pub fn pass_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.passed as f64 / self.total as f64
        }
    }

    pub fn absorb(&mut self, other: &PhaseTally) {
        self.total += other.total;
        self.passed += other.passed;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport {
    pub run_id: String,
    pub phase: PhaseId,
    pub status: PhaseStatus,
    pub results: Vec<StepResult>,
    pub tally: PhaseTally,
    pub pass_rate: f64,
    /// `step_id: reason` for every failed Blocking step.
    pub blocking_failures: Vec<String>,
    pub warnings: Vec<String>,
    pub artifact: Option<GateArtifact>,
}

/// Collaborators a phase evaluation reads from and writes to.
pub struct PhaseContext<'a> {
    pub config: &'a GateConfig,
    pub runner: &'a CheckRunner<'a>,
    pub baselines: &'a BaselineGuard,
    pub gates: &'a GateStore,
    pub attestor: &'a GateAttestor<'a>,
    pub evidence: &'a EvidenceRecorder,
}

/// Who is running, on what.
#[derive(Debug, Clone)]
pub struct RunIdentity {
    pub run_id: String,
    pub branch: String,
    pub commit: String,
    pub principal: Option<String>,
}

enum Verdict {
    Pass(String),
    Fail(String),
    /// The predicate could not be decided (missing measurement, unreadable file).
    Unevaluable(String),
}

/// One cell per check name: parallel steps sharing a check wait on the
/// first run instead of starting their own.
type RunMemo = Mutex<BTreeMap<String, Arc<OnceLock<CheckRun>>>>;

pub struct PhaseStateMachine<'a> {
    ctx: PhaseContext<'a>,
    store: Store,
    identity: RunIdentity,
}

impl<'a> PhaseStateMachine<'a> {
    pub fn new(ctx: PhaseContext<'a>, store: &Store, identity: RunIdentity) -> Self {
        Self {
            ctx,
            store: store.clone(),
            identity,
        }
    }

    pub fn ledger(&self) -> Result<PhaseLedger, PhasegateError> {
        load_ledger(&self.store, &self.identity.branch)
    }

    /// Move `phase` to InProgress if its predecessor allows it.
    pub fn enter(&self, phase: PhaseId) -> Result<(), PhasegateError> {
        let config = self.ctx.config;
        if config.phase_def(phase).is_none() {
            return Err(PhasegateError::NotFound(format!("phase {} is not declared", phase)));
        }
        let mut ledger = self.ledger()?;

        if let Some(prev) = config.predecessor(phase) {
            let prev_status = ledger.status(prev.id);
            if prev_status != PhaseStatus::Passed {
                return Err(PhasegateError::TransitionBlocked(format!(
                    "{} requires {} to be passed (it is {})",
                    phase, prev.id, prev_status
                )));
            }
            if prev.is_gate {
                self.require_authorized_gate(prev.id)?;
            }
        }

        ledger.set(phase, PhaseStatus::InProgress, &self.identity.run_id);
        save_ledger(&self.store, &ledger)?;
        tracing::debug!(phase = %phase, branch = %self.identity.branch, "phase entered");
        Ok(())
    }

    fn require_authorized_gate(&self, gate: PhaseId) -> Result<(), PhasegateError> {
        let artifact = self
            .ctx
            .gates
            .load(&self.identity.branch, gate)?
            .ok_or_else(|| {
                PhasegateError::TransitionBlocked(format!(
                    "gate {} has no artifact on '{}'",
                    gate, self.identity.branch
                ))
            })?;
        let need = self.ctx.config.required_signers_for(gate);
        let auth = self
            .ctx
            .attestor
            .verify_with(&artifact, self.identity.principal.as_deref(), need);
        if let Authorization::Insufficient { have, need } = auth {
            return Err(PhasegateError::TransitionBlocked(format!(
                "gate {} has {} of {} required signatures",
                gate, have, need
            )));
        }
        Ok(())
    }

    /// Evaluate every step of `phase` against `scope`.
    pub fn evaluate(
        &self,
        phase: PhaseId,
        scope: &ChangeScope,
        deadline: Option<Instant>,
    ) -> Result<PhaseReport, PhasegateError> {
        let config = self.ctx.config;
        let def = config
            .phase_def(phase)
            .ok_or_else(|| PhasegateError::NotFound(format!("phase {} is not declared", phase)))?;
        let steps = config.steps_for(phase);
        let memo: RunMemo = Mutex::new(BTreeMap::new());

        tracing::info!(phase = %phase, steps = steps.len(), parallel = def.parallel, scope = ?scope.mode, "evaluating phase");
        let results: Vec<StepResult> = if def.parallel {
            steps
                .par_iter()
                .map(|step| self.eval_step(step, scope, deadline, &memo))
                .collect()
        } else {
            steps
                .iter()
                .map(|step| self.eval_step(step, scope, deadline, &memo))
                .collect()
        };

        let tally = PhaseTally::from_results(&results);
        let mut blocking_failures = Vec::new();
        let mut warnings = Vec::new();
        let mut deadline_skips = false;
        for (step, result) in steps.iter().zip(&results) {
            match (step.severity, result.outcome) {
                (Severity::Blocking, Outcome::Fail) => {
                    blocking_failures.push(format!("{}: {}", step.id, result.detail));
                }
                (Severity::Blocking, Outcome::Skip) if result.detail == DEADLINE_DETAIL => {
                    deadline_skips = true;
                }
                (Severity::Warning, Outcome::Fail) => {
                    warnings.push(format!("{}: {}", step.id, result.detail));
                }
                _ => {}
            }
        }

        let status = if !blocking_failures.is_empty() {
            PhaseStatus::Failed
        } else if deadline_skips {
            PhaseStatus::InProgress
        } else {
            PhaseStatus::Passed
        };

        let mut ledger = self.ledger()?;
        ledger.set(phase, status, &self.identity.run_id);
        save_ledger(&self.store, &ledger)?;

        let record = EvidenceRecord {
            run_id: self.identity.run_id.clone(),
            run_timestamp: time::now_epoch_z(),
            phase_id: phase,
            status,
            total_steps: tally.total,
            passed: tally.passed,
            failed: tally.failed,
            skipped: tally.skipped,
            pass_rate: tally.pass_rate(),
            vcs_branch: self.identity.branch.clone(),
            vcs_commit: self.identity.commit.clone(),
            blocking_failures: blocking_failures.clone(),
        };
        if let Some(warning) = self.ctx.evidence.record(&record) {
            warnings.push(warning);
        }

        let artifact = if def.is_gate && status == PhaseStatus::Passed {
            let fresh = GateArtifact::new(
                phase,
                &self.identity.branch,
                &self.identity.commit,
                &results,
                config.required_signers_for(phase),
                config.settings.bypass_actors.clone(),
            );
            Some(self.ctx.gates.ensure(fresh)?)
        } else {
            None
        };

        tracing::info!(phase = %phase, %status, passed = tally.passed, failed = tally.failed, skipped = tally.skipped, "phase evaluated");
        Ok(PhaseReport {
            run_id: self.identity.run_id.clone(),
            phase,
            status,
            pass_rate: tally.pass_rate(),
            tally,
            results,
            blocking_failures,
            warnings,
            artifact,
        })
    }

    fn eval_step(
        &self,
        step: &Step,
        scope: &ChangeScope,
        deadline: Option<Instant>,
        memo: &RunMemo,
    ) -> StepResult {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return StepResult::skip(&step.id, DEADLINE_DETAIL);
        }
        let mut runs = Vec::new();
        let verdict = self.eval_predicate(&step.predicate, scope, memo, &mut runs);
        self.write_step_log(&step.id, &runs);
        match verdict {
            Verdict::Pass(detail) => StepResult::pass(&step.id, detail),
            Verdict::Fail(detail) => StepResult::fail(&step.id, detail),
            Verdict::Unevaluable(detail) if step.optional => StepResult::skip(&step.id, detail),
            Verdict::Unevaluable(detail) => StepResult::fail(&step.id, detail),
        }
    }

    fn execute(&self, check: &str, scope: &ChangeScope, memo: &RunMemo) -> CheckRun {
        let cell = match memo.lock() {
            Ok(mut memo) => Arc::clone(memo.entry(check.to_string()).or_default()),
            Err(_) => return self.ctx.runner.execute(check, scope),
        };
        cell.get_or_init(|| self.ctx.runner.execute(check, scope)).clone()
    }

    fn eval_predicate(
        &self,
        predicate: &Predicate,
        scope: &ChangeScope,
        memo: &RunMemo,
        runs: &mut Vec<CheckRun>,
    ) -> Verdict {
        match predicate {
            Predicate::FileExists { path, contains } => self.eval_file(path, contains.as_deref()),
            Predicate::CheckPassed { check } => {
                let run = self.execute(check, scope, memo);
                let verdict = if run.passed() {
                    Verdict::Pass(format!("{}: {}", check, run.detail))
                } else {
                    Verdict::Fail(format!("{}: {}", check, run.detail))
                };
                runs.push(run);
                verdict
            }
            Predicate::MetricWithinBaseline { metric, check } => {
                let run = self.execute(check, scope, memo);
                let measured = run.measurements.get(metric).copied();
                let detail = run.detail.clone();
                runs.push(run);
                let Some(measured) = measured else {
                    return Verdict::Unevaluable(format!(
                        "{} reported no '{}' measurement ({})",
                        check, metric, detail
                    ));
                };
                match self.ctx.baselines.validate(metric, measured) {
                    Ok(BaselineVerdict::Pass) => {
                        let ceiling = self
                            .ctx
                            .baselines
                            .get(metric)
                            .map(|b| b.ceiling_value)
                            .unwrap_or(measured);
                        Verdict::Pass(format!("{} = {} (ceiling {})", metric, measured, ceiling))
                    }
                    Ok(BaselineVerdict::Fail { excess }) => Verdict::Fail(format!(
                        "{} = {} exceeds its ceiling by {}",
                        metric, measured, excess
                    )),
                    Err(e) => Verdict::Unevaluable(e.to_string()),
                }
            }
            Predicate::SignaturePresent { phase } => {
                match self.ctx.gates.load(&self.identity.branch, *phase) {
                    Ok(Some(artifact)) => {
                        let signers = self.ctx.attestor.valid_signers(&artifact);
                        if signers.is_empty() {
                            Verdict::Fail(format!("{} artifact has no valid signature", phase))
                        } else {
                            Verdict::Pass(format!("{} signed by {}", phase, signers.join(", ")))
                        }
                    }
                    Ok(None) => Verdict::Fail(format!(
                        "no {} gate artifact on '{}'",
                        phase, self.identity.branch
                    )),
                    Err(e) => Verdict::Unevaluable(e.to_string()),
                }
            }
            Predicate::Composite { mode, of } => {
                let verdicts: Vec<Verdict> = of
                    .iter()
                    .map(|p| self.eval_predicate(p, scope, memo, runs))
                    .collect();
                combine(*mode, verdicts)
            }
        }
    }

    fn eval_file(&self, path: &str, contains: Option<&str>) -> Verdict {
        let full = self.store.repo_root.join(path);
        if !full.is_file() {
            return Verdict::Fail(format!("{} is missing", path));
        }
        let Some(pattern) = contains else {
            return Verdict::Pass(format!("{} exists", path));
        };
        let re = match Regex::new(pattern) {
            Ok(re) => re,
            Err(e) => return Verdict::Unevaluable(format!("invalid pattern: {}", e)),
        };
        match fs::read_to_string(&full) {
            Ok(content) if re.is_match(&content) => {
                Verdict::Pass(format!("{} matches /{}/", path, pattern))
            }
            Ok(_) => Verdict::Fail(format!("{} does not match /{}/", path, pattern)),
            Err(e) => Verdict::Unevaluable(format!("cannot read {}: {}", path, e)),
        }
    }

    /// Each step writes only its own log file, so parallel workers never
    /// share an output.
    fn write_step_log(&self, step_id: &str, runs: &[CheckRun]) {
        if runs.is_empty() {
            return;
        }
        let mut body = String::new();
        for run in runs {
            body.push_str(&format!(
                "== {} outcome={} exit={} cached={} attempts={}\n{}\n",
                run.check_name,
                run.outcome,
                run.exit_code.map_or_else(|| "none".to_string(), |c| c.to_string()),
                run.from_cache,
                run.attempts,
                if run.diagnostics.is_empty() {
                    &run.detail
                } else {
                    &run.diagnostics
                }
            ));
        }
        let path = self
            .store
            .run_dir(&self.identity.run_id)
            .join(format!("{}.log", step_id));
        if let Err(e) = write_atomic(&path, body.as_bytes()) {
            tracing::warn!(step = step_id, error = %e, "step log not written");
        }
    }
}

fn combine(mode: CompositeMode, verdicts: Vec<Verdict>) -> Verdict {
    let mut passes = Vec::new();
    let mut fails = Vec::new();
    let mut unknown = Vec::new();
    for v in verdicts {
        match v {
            Verdict::Pass(d) => passes.push(d),
            Verdict::Fail(d) => fails.push(d),
            Verdict::Unevaluable(d) => unknown.push(d),
        }
    }
    match mode {
        CompositeMode::All if !fails.is_empty() => Verdict::Fail(fails.join("; ")),
        CompositeMode::All if !unknown.is_empty() => Verdict::Unevaluable(unknown.join("; ")),
        CompositeMode::All => Verdict::Pass(passes.join("; ")),
        CompositeMode::Any if !passes.is_empty() => Verdict::Pass(passes.join("; ")),
        CompositeMode::Any if fails.is_empty() => Verdict::Unevaluable(unknown.join("; ")),
        CompositeMode::Any => Verdict::Fail(
            fails
                .into_iter()
                .chain(unknown)
                .collect::<Vec<_>>()
                .join("; "),
        ),
    }
}
