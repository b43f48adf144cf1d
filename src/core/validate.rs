//! One validation run: resolve scope, evaluate phases in order, summarise.
//!
//! Without `--phase`, evaluation walks the declared phases from the first,
//! stops at the first phase that does not pass, and stops (without failing)
//! at a gate still waiting for signatures.

use crate::core::attest::{Ed25519Keyring, GateAttestor, GateStore};
use crate::core::baseline::BaselineGuard;
use crate::core::cache::ContentCache;
use crate::core::checker::Checker;
use crate::core::config::GateConfig;
use crate::core::error::PhasegateError;
use crate::core::evidence::EvidenceRecorder;
use crate::core::model::{PhaseId, PhaseStatus};
use crate::core::phase::{PhaseContext, PhaseReport, PhaseStateMachine, PhaseTally, RunIdentity};
use crate::core::runner::CheckRunner;
use crate::core::scope::{ChangeScope, ChangeScopeResolver};
use crate::core::store::Store;
use crate::core::time;
use crate::core::vcs::VersionControl;
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Evaluate only this phase (strict entry rules apply).
    pub phase: Option<PhaseId>,
    /// Skip diff-based scoping.
    pub full: bool,
    pub deadline: Option<Duration>,
    /// Acting principal for bypass decisions.
    pub principal: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationSummary {
    pub run_id: String,
    pub branch: String,
    pub commit: String,
    pub scope: ChangeScope,
    pub reports: Vec<PhaseReport>,
    pub tally: PhaseTally,
    /// Why the walk stopped before the last declared phase, if it did.
    pub halted: Option<String>,
    pub exit_code: i32,
}

impl ValidationSummary {
    pub fn blocking_failures(&self) -> Vec<String> {
        self.reports
            .iter()
            .flat_map(|r| r.blocking_failures.iter().cloned())
            .collect()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.reports
            .iter()
            .flat_map(|r| r.warnings.iter().cloned())
            .collect()
    }
}

/// Truthy values of `PHASEGATE_FULL`.
pub fn full_from_env() -> bool {
    std::env::var("PHASEGATE_FULL")
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

pub fn resolve_scope(
    config: &GateConfig,
    vcs: &dyn VersionControl,
    full: bool,
) -> ChangeScope {
    if full {
        return ChangeScope::full("full scan requested");
    }
    ChangeScopeResolver::new(vcs, config.settings.force_full_patterns())
        .resolve(&config.settings.base_ref, "HEAD")
}

pub fn run_validation(
    store: &Store,
    config: &GateConfig,
    vcs: &dyn VersionControl,
    checker: &dyn Checker,
    opts: &RunOptions,
) -> Result<ValidationSummary, PhasegateError> {
    let started = Instant::now();
    let deadline = opts.deadline.map(|d| started + d);
    let run_id = time::new_run_id();
    let branch = vcs.current_branch()?;
    let commit = vcs.commit_hash("HEAD")?;
    let scope = resolve_scope(config, vcs, opts.full);
    tracing::info!(run_id = %run_id, branch = %branch, mode = ?scope.mode, reason = %scope.reason, "validation started");

    let phases: Vec<PhaseId> = match opts.phase {
        Some(phase) => vec![phase],
        None => config.ordered_phases().iter().map(|p| p.id).collect(),
    };

    let tree_id = tree_identity(vcs, &commit, &run_id);
    let cache = ContentCache::new(
        &store.cache_dir(),
        &store.repo_root,
        config.settings.cache_ttl_hours,
        &tree_id,
    );
    let runner = CheckRunner::new(
        checker,
        &cache,
        config.checks_by_name(),
        config.settings.default_timeout_secs,
    );
    preflight(config, &runner, &phases)?;

    let baselines = BaselineGuard::load(store)?;
    let gates = GateStore::new(&store.gates_dir());
    let keyring = Ed25519Keyring::load(&store.keyring_path())?;
    let attestor =
        GateAttestor::new(&keyring).with_bypass_actors(config.settings.bypass_actors.clone());
    let evidence = EvidenceRecorder::new(&store.evidence_path());
    let machine = PhaseStateMachine::new(
        PhaseContext {
            config,
            runner: &runner,
            baselines: &baselines,
            gates: &gates,
            attestor: &attestor,
            evidence: &evidence,
        },
        store,
        RunIdentity {
            run_id: run_id.clone(),
            branch: branch.clone(),
            commit: commit.clone(),
            principal: opts.principal.clone(),
        },
    );

    let mut reports = Vec::new();
    let mut halted = None;
    for phase in phases {
        match machine.enter(phase) {
            Ok(()) => {}
            Err(PhasegateError::TransitionBlocked(reason)) if opts.phase.is_none() => {
                halted = Some(reason);
                break;
            }
            Err(e) => return Err(e),
        }
        let report = machine.evaluate(phase, &scope, deadline)?;
        let status = report.status;
        reports.push(report);
        if status != PhaseStatus::Passed {
            if opts.phase.is_none() {
                halted = Some(format!("{} is {}", phase, status));
            }
            break;
        }
    }

    let mut tally = PhaseTally::default();
    for report in &reports {
        tally.absorb(&report.tally);
    }
    let exit_code = if reports.iter().all(|r| r.status == PhaseStatus::Passed) {
        0
    } else {
        1
    };
    tracing::info!(run_id = %run_id, exit_code, elapsed_ms = started.elapsed().as_millis() as u64, "validation finished");

    Ok(ValidationSummary {
        run_id,
        branch,
        commit,
        scope,
        reports,
        tally,
        halted,
        exit_code,
    })
}

/// Identity of the checked-out tree for checks with no file scope: the
/// commit, plus a digest of uncommitted edits when there are any. When the
/// tree state cannot be read the identity is unique to this run, so nothing
/// full-scope is served from the cache.
fn tree_identity(vcs: &dyn VersionControl, commit: &str, run_id: &str) -> String {
    match vcs.worktree_digest() {
        Ok(digest) if digest.is_empty() => commit.to_string(),
        Ok(digest) => format!("{}+{}", commit, digest),
        Err(e) => {
            tracing::warn!(error = %e, "working tree state unknown; full-scope results will not be reused");
            format!("{}+run-{}", commit, run_id)
        }
    }
}

/// A required check whose tool is missing aborts the run before any step.
fn preflight(
    config: &GateConfig,
    runner: &CheckRunner<'_>,
    phases: &[PhaseId],
) -> Result<(), PhasegateError> {
    let referenced: BTreeSet<&str> = phases
        .iter()
        .flat_map(|p| config.steps_for(*p))
        .flat_map(|s| s.predicate.check_names())
        .collect();
    let missing: Vec<String> = runner
        .missing_tools()
        .into_iter()
        .filter(|c| referenced.contains(c.name.as_str()))
        .map(|c| format!("check '{}' needs '{}'", c.name, c.command))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(PhasegateError::ConfigError(format!(
            "required tool not found: {}",
            missing.join(", ")
        )))
    }
}
