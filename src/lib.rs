//! phasegate: a workflow gate validation engine.
//!
//! **phasegate enforces a multi-phase delivery process on a git branch.**
//!
//! Each phase (`Phase1`..`Phase7`) declares ordered steps. A validation run
//! resolves which files changed, runs the declared checks through a
//! content-addressed cache, compares metrics against regression-proof
//! ceilings, and records the outcome as evidence. Gate phases leave an
//! artifact that distinct trusted signers attest with Ed25519 signatures;
//! the pre-push hook refuses to let a branch through until every gate is
//! attested for `HEAD`.
//!
//! # Layout
//!
//! All state lives under `<repo>/.phasegate/`:
//!
//! - `gates.toml`: checks, phases and steps
//! - `trusted_signers.toml`: signer id → public key
//! - `baselines.json`: metric ceilings (history in `baseline.events.jsonl`)
//! - `cache/`, `gates/<branch>/`, `state/<branch>.json`, `evidence.jsonl`, `runs/`
//!
//! # Examples
//!
//! ```bash
//! phasegate init
//! phasegate validate
//! phasegate gate sign Phase4 --signer alice --key-file ~/.phasegate-alice.key
//! phasegate hook install
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: scope resolution, cache, runner, baselines, phases, attestation,
//!   evidence and the final gate

mod cli;
pub mod core;

use crate::core::attest::{Ed25519Keyring, Ed25519Signer, GateAttestor, GateStore, Signer};
use crate::core::baseline::{BaselineGuard, BaselineVerdict};
use crate::core::cache::ContentCache;
use crate::core::checker::{Checker, ProcessChecker};
use crate::core::config::{GateConfig, STARTER_CONFIG};
use crate::core::error::PhasegateError;
use crate::core::evidence::EvidenceRecorder;
use crate::core::final_gate::{FinalGate, FinalGateDecision};
use crate::core::model::{Outcome, PhaseId, PhaseStatus};
use crate::core::output;
use crate::core::phase::load_ledger;
use crate::core::store::{STORE_DIR, Store};
use crate::core::time;
use crate::core::validate::{self, RunOptions, ValidationSummary};
use crate::core::vcs::{GitCli, VersionControl};
use clap::Parser;
use cli::{
    BaselineCommand, CacheCommand, Cli, Command, EvidenceCommand, GateCommand, HookCommand,
    StepsCommand, ValidateCli,
};
use std::fs;
use std::path::Path;
use std::time::Duration;

const PRE_PUSH_HOOK: &str = "#!/bin/sh\n# installed by phasegate\nexec phasegate hook pre-push \"$@\"\n";

/// Parse arguments, run one command, return the process exit code.
pub fn run() -> Result<i32, PhasegateError> {
    let cli = Cli::parse();
    let current_dir = std::env::current_dir()?;

    match cli.command {
        Command::Init { force } => init_store(&current_dir, force),
        command => {
            let store = Store::discover(&current_dir).ok_or_else(|| {
                PhasegateError::ConfigError(format!(
                    "'{}' directory not found in current or parent directories. Run `phasegate init` first.",
                    STORE_DIR
                ))
            })?;
            dispatch(&store, command)
        }
    }
}

fn dispatch(store: &Store, command: Command) -> Result<i32, PhasegateError> {
    match command {
        Command::Init { force } => init_store(&store.repo_root, force),
        Command::Validate(args) => cmd_validate(store, args),
        Command::Status { format } => cmd_status(store, wants_json(&format)?),
        Command::Scope { full, format } => cmd_scope(store, full, wants_json(&format)?),
        Command::Steps(steps) => match steps.command {
            StepsCommand::Lint => cmd_steps_lint(store),
            StepsCommand::List { phase } => cmd_steps_list(store, phase.as_deref()),
        },
        Command::Cache(cache) => cmd_cache(store, cache.command),
        Command::Baseline(baseline) => cmd_baseline(store, baseline.command),
        Command::Gate(gate) => cmd_gate(store, gate.command),
        Command::Evidence(evidence) => match evidence.command {
            EvidenceCommand::List { limit, format } => {
                cmd_evidence_list(store, limit, wants_json(&format)?)
            }
        },
        Command::Hook(hook) => match hook.command {
            HookCommand::PrePush { principal, format } => {
                cmd_pre_push(store, actor(principal), wants_json(&format)?)
            }
            HookCommand::Install { force } => cmd_hook_install(store, force),
        },
    }
}

fn wants_json(format: &str) -> Result<bool, PhasegateError> {
    match format {
        "text" => Ok(false),
        "json" => Ok(true),
        other => Err(PhasegateError::ConfigError(format!(
            "unknown format '{}': expected 'text' or 'json'",
            other
        ))),
    }
}

fn parse_phase(raw: &str) -> Result<PhaseId, PhasegateError> {
    raw.parse::<PhaseId>().map_err(PhasegateError::ConfigError)
}

/// Explicit principal, else `PHASEGATE_ACTOR`.
fn actor(explicit: Option<String>) -> Option<String> {
    explicit.or_else(|| {
        std::env::var("PHASEGATE_ACTOR")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    })
}

fn print_json(cmd: &str, status: &str, extra: serde_json::Value) -> Result<(), PhasegateError> {
    let envelope = time::command_envelope(cmd, status, extra);
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(())
}

fn short(commit: &str) -> &str {
    &commit[..commit.len().min(12)]
}

fn init_store(dir: &Path, force: bool) -> Result<i32, PhasegateError> {
    use colored::Colorize;

    let store = Store::at(dir);
    let config_path = store.config_path();
    if config_path.exists() && !force {
        println!(
            "{} {} already exists (use --force to overwrite)",
            "init:".bold(),
            config_path.display()
        );
        return Ok(0);
    }
    fs::create_dir_all(&store.root)?;
    fs::write(&config_path, STARTER_CONFIG)?;
    let ignore = store.root.join(".gitignore");
    if !ignore.exists() {
        fs::write(&ignore, "cache/\nruns/\nstate/\n")?;
    }
    if !store.keyring_path().exists() {
        fs::write(
            store.keyring_path(),
            "# signer_id = \"<hex Ed25519 public key>\"\n",
        )?;
    }
    println!(
        "{} wrote {}",
        "init:".bold(),
        config_path.display().to_string().bright_green()
    );
    Ok(0)
}

fn cmd_validate(store: &Store, args: ValidateCli) -> Result<i32, PhasegateError> {
    let json = wants_json(&args.format)?;
    let config = GateConfig::load(store)?;
    let vcs = GitCli::new(&store.repo_root);
    let checker = ProcessChecker::new(&store.repo_root);
    let opts = RunOptions {
        phase: args.phase.as_deref().map(parse_phase).transpose()?,
        full: args.full || validate::full_from_env(),
        deadline: args.deadline_secs.map(Duration::from_secs),
        principal: actor(args.principal),
    };
    let summary = validate::run_validation(store, &config, &vcs, &checker, &opts)?;

    if json {
        let status = if summary.exit_code == 0 { "ok" } else { "failed" };
        print_json(
            "validate",
            status,
            serde_json::json!({ "exit_code": summary.exit_code, "summary": summary }),
        )?;
    } else {
        print_summary(&config, &summary);
    }
    Ok(summary.exit_code)
}

fn print_summary(config: &GateConfig, summary: &ValidationSummary) {
    use colored::Colorize;

    println!(
        "validate: run {} branch={} commit={}",
        summary.run_id,
        summary.branch.bright_cyan(),
        short(&summary.commit)
    );
    println!(
        "validate: scope {:?} ({})",
        summary.scope.mode, summary.scope.reason
    );

    for report in &summary.reports {
        let name = config
            .phase_def(report.phase)
            .map(|p| p.name.as_str())
            .unwrap_or_default();
        println!("validate: phase {} {}", report.phase.to_string().bold(), name);
        for result in &report.results {
            let label = match result.outcome {
                Outcome::Pass => "PASS".green().bold(),
                Outcome::Fail => "FAIL".red().bold(),
                Outcome::Skip => "SKIP".yellow().bold(),
            };
            println!(
                "  {} {}  {}",
                label,
                result.step_id,
                output::compact_line(&result.detail, 110).dimmed()
            );
        }
        let status = match report.status {
            PhaseStatus::Passed => report.status.to_string().green(),
            PhaseStatus::Failed => report.status.to_string().red(),
            _ => report.status.to_string().yellow(),
        };
        println!(
            "validate: phase {} {} ({}/{}, pass_rate={:.2})",
            report.phase, status, report.tally.passed, report.tally.total, report.pass_rate
        );
        if let Some(artifact) = &report.artifact {
            println!(
                "validate: gate {} artifact {} signatures={}/{}",
                artifact.phase_id,
                &artifact.content_hash[..artifact.content_hash.len().min(16)],
                artifact.signatures.len(),
                artifact.required_signers
            );
        }
    }

    if let Some(halted) = &summary.halted {
        println!("validate: halted: {}", halted.yellow());
    }
    println!(
        "validate: summary total={} pass={} fail={} skip={} exit={}",
        summary.tally.total,
        summary.tally.passed,
        summary.tally.failed,
        summary.tally.skipped,
        summary.exit_code
    );
    let failures = summary.blocking_failures();
    if !failures.is_empty() {
        println!(
            "validate: failures {}: {}",
            failures.len(),
            output::preview_messages(&failures, 3, 110)
        );
    }
    let warnings = summary.warnings();
    if !warnings.is_empty() {
        println!(
            "validate: warnings {}: {}",
            warnings.len(),
            output::preview_messages(&warnings, 3, 110)
        );
    }
}

fn cmd_status(store: &Store, json: bool) -> Result<i32, PhasegateError> {
    use colored::Colorize;

    let config = GateConfig::load(store)?;
    let vcs = GitCli::new(&store.repo_root);
    let branch = vcs.current_branch()?;
    let ledger = load_ledger(store, &branch)?;
    let gates = GateStore::new(&store.gates_dir());
    let keyring = Ed25519Keyring::load(&store.keyring_path())?;
    let attestor = GateAttestor::new(&keyring);

    let mut rows = Vec::new();
    for def in config.ordered_phases() {
        let artifact = if def.is_gate {
            gates.load(&branch, def.id)?
        } else {
            None
        };
        let signatures = artifact.as_ref().map(|a| attestor.valid_signers(a).len());
        rows.push(serde_json::json!({
            "phase": def.id,
            "name": def.name,
            "is_gate": def.is_gate,
            "status": ledger.status(def.id),
            "valid_signatures": signatures,
            "required_signers": def.is_gate.then(|| config.required_signers_for(def.id)),
        }));
    }

    if json {
        return print_json("status", "ok", serde_json::json!({ "branch": branch, "phases": rows }))
            .map(|_| 0);
    }

    println!("status: branch {}", branch.bright_cyan());
    for def in config.ordered_phases() {
        let status = ledger.status(def.id);
        let colored_status = match status {
            PhaseStatus::Passed => status.to_string().green(),
            PhaseStatus::Failed => status.to_string().red(),
            PhaseStatus::InProgress => status.to_string().yellow(),
            PhaseStatus::NotStarted => status.to_string().dimmed(),
        };
        let gate = if def.is_gate {
            match gates.load(&branch, def.id)? {
                Some(a) => format!(
                    " gate {}/{} signed",
                    attestor.valid_signers(&a).len(),
                    config.required_signers_for(def.id)
                ),
                None => " gate (no artifact)".to_string(),
            }
        } else {
            String::new()
        };
        println!("  {:<7} {:<16} {}{}", def.id, def.name, colored_status, gate);
    }
    Ok(0)
}

fn cmd_scope(store: &Store, full: bool, json: bool) -> Result<i32, PhasegateError> {
    let config = GateConfig::load(store)?;
    let vcs = GitCli::new(&store.repo_root);
    let scope = validate::resolve_scope(&config, &vcs, full || validate::full_from_env());
    if json {
        print_json("scope", "ok", serde_json::json!({ "scope": scope }))?;
        return Ok(0);
    }
    println!("scope: {:?} ({})", scope.mode, scope.reason);
    println!("scope: base_ref={}", config.settings.base_ref);
    for file in &scope.changed_files {
        println!("  {}", file);
    }
    Ok(0)
}

fn cmd_steps_lint(store: &Store) -> Result<i32, PhasegateError> {
    use colored::Colorize;

    let config = GateConfig::load(store)?;
    let checker = ProcessChecker::new(&store.repo_root);
    let missing: Vec<String> = config
        .check
        .iter()
        .filter(|c| !checker.available(c))
        .map(|c| format!("check '{}' needs '{}'", c.name, c.command))
        .collect();
    println!(
        "steps: {} {} phases, {} checks, {} steps",
        "ok".green().bold(),
        config.phase.len(),
        config.check.len(),
        config.step.len()
    );
    for m in &missing {
        println!("steps: {} {}", "missing tool".yellow(), m);
    }
    Ok(0)
}

fn cmd_steps_list(store: &Store, phase: Option<&str>) -> Result<i32, PhasegateError> {
    let config = GateConfig::load(store)?;
    let only = phase.map(parse_phase).transpose()?;
    for def in config.ordered_phases() {
        if only.is_some_and(|p| p != def.id) {
            continue;
        }
        let gate = if def.is_gate { " [gate]" } else { "" };
        println!("{} {}{}", def.id, def.name, gate);
        for step in config.steps_for(def.id) {
            let optional = if step.optional { " optional" } else { "" };
            println!(
                "  {:<32} {:<22} {}{}  {}",
                step.id,
                step.predicate.kind_name(),
                step.severity,
                optional,
                step.description
            );
        }
    }
    Ok(0)
}

fn cmd_cache(store: &Store, command: CacheCommand) -> Result<i32, PhasegateError> {
    let ttl = match GateConfig::load(store) {
        Ok(config) => config.settings.cache_ttl_hours,
        Err(_) => crate::core::config::DEFAULT_CACHE_TTL_HOURS,
    };
    let cache = ContentCache::new(&store.cache_dir(), &store.repo_root, ttl, "");
    match command {
        CacheCommand::Stats => {
            let stats = cache.stats()?;
            println!(
                "cache: entries={} expired={} corrupt={} bytes={} ttl_hours={}",
                stats.entries,
                stats.expired,
                stats.corrupt,
                stats.bytes,
                cache.ttl_hours()
            );
        }
        CacheCommand::Prune => println!("cache: pruned {}", cache.prune()?),
        CacheCommand::Clear => println!("cache: cleared {}", cache.clear()?),
        CacheCommand::Invalidate { pattern } => {
            println!("cache: invalidated {}", cache.invalidate(&pattern)?)
        }
    }
    Ok(0)
}

fn cmd_baseline(store: &Store, command: BaselineCommand) -> Result<i32, PhasegateError> {
    use colored::Colorize;

    let mut guard = BaselineGuard::load(store)?;
    match command {
        BaselineCommand::Show => {
            for b in guard.all() {
                println!(
                    "{:<28} ceiling={:<10} updated_at={}  {}",
                    b.metric_name, b.ceiling_value, b.updated_at, b.justification
                );
            }
            Ok(0)
        }
        BaselineCommand::Check { metric, value } => match guard.validate(&metric, value)? {
            BaselineVerdict::Pass => {
                println!("baseline: {} {} = {}", "PASS".green().bold(), metric, value);
                Ok(0)
            }
            BaselineVerdict::Fail { excess } => {
                println!(
                    "baseline: {} {} = {} exceeds its ceiling by {}",
                    "FAIL".red().bold(),
                    metric,
                    value,
                    excess
                );
                Ok(1)
            }
        },
        BaselineCommand::Update {
            metric,
            ceiling,
            justification,
        } => {
            let who = actor(None).unwrap_or_else(|| "unknown".to_string());
            let b = guard.update_baseline(&metric, ceiling, &justification, &who)?;
            println!("baseline: {} ceiling set to {}", b.metric_name, b.ceiling_value);
            Ok(0)
        }
    }
}

fn cmd_gate(store: &Store, command: GateCommand) -> Result<i32, PhasegateError> {
    use colored::Colorize;

    let config = GateConfig::load(store)?;
    let vcs = GitCli::new(&store.repo_root);
    let branch = vcs.current_branch()?;
    let gates = GateStore::new(&store.gates_dir());
    let keyring = Ed25519Keyring::load(&store.keyring_path())?;
    let attestor =
        GateAttestor::new(&keyring).with_bypass_actors(config.settings.bypass_actors.clone());

    let load = |raw: &str| -> Result<_, PhasegateError> {
        let phase = parse_phase(raw)?;
        gates.load(&branch, phase)?.ok_or_else(|| {
            PhasegateError::NotFound(format!(
                "no {} gate artifact on '{}'; run `phasegate validate`",
                phase, branch
            ))
        })
    };

    match command {
        GateCommand::Show { phase } => {
            let artifact = load(&phase)?;
            println!("{}", serde_json::to_string_pretty(&artifact)?);
            Ok(0)
        }
        GateCommand::Sign {
            phase,
            signer,
            key_file,
        } => {
            let artifact = load(&phase)?;
            let signer = Ed25519Signer::from_seed_file(&signer, &key_file)?;
            let signed = attestor.sign(&artifact, &signer)?;
            gates.save(&signed)?;
            let trusted = attestor
                .valid_signers(&signed)
                .iter()
                .any(|s| s == signer.signer_id());
            println!(
                "gate: {} signed {} ({}/{} valid)",
                signer.signer_id().bold(),
                signed.phase_id,
                attestor.valid_signers(&signed).len(),
                config.required_signers_for(signed.phase_id).max(signed.required_signers)
            );
            if !trusted {
                println!(
                    "gate: {} signer is not in trusted_signers.toml; public key {}",
                    "warning:".yellow(),
                    signer.public_key_hex()
                );
            }
            Ok(0)
        }
        GateCommand::Verify { phase, principal } => {
            let artifact = load(&phase)?;
            let need = config.required_signers_for(artifact.phase_id);
            let principal = actor(principal);
            let auth = attestor.verify_with(&artifact, principal.as_deref(), need);
            println!("{}", serde_json::to_string_pretty(&auth)?);
            Ok(if auth.is_authorized() { 0 } else { 1 })
        }
    }
}

fn cmd_evidence_list(store: &Store, limit: usize, json: bool) -> Result<i32, PhasegateError> {
    let records = EvidenceRecorder::new(&store.evidence_path()).read_records(Some(limit))?;
    if json {
        print_json("evidence.list", "ok", serde_json::json!({ "records": records }))?;
        return Ok(0);
    }
    for r in &records {
        println!(
            "{} {} {:<7} {:<11} {}/{} pass_rate={:.2} {}@{}",
            r.run_timestamp,
            r.run_id,
            r.phase_id,
            r.status,
            r.passed,
            r.total_steps,
            r.pass_rate,
            r.vcs_branch,
            short(&r.vcs_commit)
        );
    }
    Ok(0)
}

fn cmd_pre_push(store: &Store, principal: Option<String>, json: bool) -> Result<i32, PhasegateError> {
    let config = GateConfig::load(store)?;
    let vcs = GitCli::new(&store.repo_root);
    let branch = vcs.current_branch()?;
    let head = vcs.commit_hash("HEAD")?;
    let gates = GateStore::new(&store.gates_dir());
    let keyring = Ed25519Keyring::load(&store.keyring_path())?;
    let attestor =
        GateAttestor::new(&keyring).with_bypass_actors(config.settings.bypass_actors.clone());
    let evidence = EvidenceRecorder::new(&store.evidence_path());
    let decision = FinalGate::new(&config, &gates, &attestor, &evidence).evaluate(
        &branch,
        &head,
        principal.as_deref(),
    )?;

    if json {
        let status = if decision.allowed { "allowed" } else { "blocked" };
        print_json("hook.pre-push", status, serde_json::json!({ "decision": decision }))?;
    } else {
        print_decision(&decision);
    }
    Ok(if decision.allowed { 0 } else { 1 })
}

fn print_decision(decision: &FinalGateDecision) {
    use colored::Colorize;

    for gate in &decision.gates {
        let label = if gate.ok {
            "OK".green().bold()
        } else {
            "BLOCKED".red().bold()
        };
        let via = match &gate.bypass_actor {
            Some(actor) => format!(" (bypass: {})", actor),
            None => String::new(),
        };
        println!(
            "pre-push: {} {} signers=[{}]{}",
            label,
            gate.phase,
            gate.signers.join(", "),
            via
        );
    }
    for reason in decision.reasons() {
        println!("pre-push:   {}", reason);
    }
    if decision.allowed {
        println!("pre-push: {} {}", "allowed".green().bold(), decision.branch);
    } else {
        println!(
            "pre-push: {} {} ({} reason(s))",
            "blocked".red().bold(),
            decision.branch,
            decision.reasons().len()
        );
    }
}

fn cmd_hook_install(store: &Store, force: bool) -> Result<i32, PhasegateError> {
    let hooks = GitCli::new(&store.repo_root).hooks_dir()?;
    let path = hooks.join("pre-push");
    if path.exists() && !force {
        let existing = fs::read_to_string(&path).unwrap_or_default();
        if existing != PRE_PUSH_HOOK {
            return Err(PhasegateError::ValidationError(format!(
                "{} already exists (use --force to replace it)",
                path.display()
            )));
        }
    }
    fs::create_dir_all(&hooks)?;
    fs::write(&path, PRE_PUSH_HOOK)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
    }
    println!("hook: installed {}", path.display());
    Ok(0)
}
