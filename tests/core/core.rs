use phasegate::core::attest::{
    Authorization, Ed25519Keyring, Ed25519Signer, GateAttestor, GateStore, Signer,
};
use phasegate::core::baseline::BaselineGuard;
use phasegate::core::checker::{CheckOutput, Checker};
use phasegate::core::config::{CheckDef, GateConfig};
use phasegate::core::error::PhasegateError;
use phasegate::core::evidence::EvidenceRecorder;
use phasegate::core::final_gate::FinalGate;
use phasegate::core::model::{Outcome, PhaseId, PhaseStatus};
use phasegate::core::phase::load_ledger;
use phasegate::core::scope::{ChangeScope, ScopeMode};
use phasegate::core::store::Store;
use phasegate::core::validate::{RunOptions, run_validation};
use phasegate::core::vcs::VersionControl;
use ed25519_dalek::SigningKey;
use std::collections::BTreeMap;
use std::fs;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tempfile::tempdir;

const HEAD: &str = "c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1";

struct FakeVcs {
    changed: Vec<String>,
    head: Mutex<String>,
    dirty: Mutex<String>,
}

impl FakeVcs {
    fn with_changes(changed: Vec<String>) -> Self {
        Self {
            changed,
            head: Mutex::new(HEAD.to_string()),
            dirty: Mutex::new(String::new()),
        }
    }
}

impl VersionControl for FakeVcs {
    fn diff_files(&self, _: &str, _: &str) -> Result<Vec<String>, PhasegateError> {
        Ok(self.changed.clone())
    }
    fn commit_hash(&self, _: &str) -> Result<String, PhasegateError> {
        Ok(self.head.lock().unwrap().clone())
    }
    fn current_branch(&self) -> Result<String, PhasegateError> {
        Ok("feature/gates".to_string())
    }
    fn worktree_digest(&self) -> Result<String, PhasegateError> {
        Ok(self.dirty.lock().unwrap().clone())
    }
}

/// Every check exits `exit_code` and reports the configured measurements.
struct FakeChecker {
    exit_code: i32,
    measurements: BTreeMap<String, f64>,
    calls: AtomicU32,
    available: bool,
}

impl FakeChecker {
    fn passing() -> Self {
        Self {
            exit_code: 0,
            measurements: BTreeMap::new(),
            calls: AtomicU32::new(0),
            available: true,
        }
    }

    fn measuring(metric: &str, value: f64) -> Self {
        let mut checker = Self::passing();
        checker.measurements.insert(metric.to_string(), value);
        checker
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Checker for FakeChecker {
    fn run(
        &self,
        _: &CheckDef,
        _: &ChangeScope,
        _: Duration,
    ) -> Result<CheckOutput, PhasegateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(CheckOutput {
            exit_code: self.exit_code,
            diagnostics: String::new(),
            measurements: self.measurements.clone(),
            timed_out: false,
            duration_ms: 1,
        })
    }

    fn available(&self, _: &CheckDef) -> bool {
        self.available
    }
}

const METRIC_CONFIG: &str = r#"
[[check]]
name = "lint"
command = "lint-tool"

[[phase]]
id = "Phase3"
name = "Implementation"

[[step]]
id = "phase3.lint-budget"
phase = "Phase3"
predicate = { kind = "metric_within_baseline", metric = "lint_warnings", check = "lint" }
"#;

const GATE_CONFIG: &str = r#"
[settings]
required_signers = 2

[[check]]
name = "test"
command = "test-tool"

[[phase]]
id = "Phase4"
name = "Testing"
is_gate = true

[[phase]]
id = "Phase5"
name = "Review"
parallel = true

[[step]]
id = "phase4.tests"
phase = "Phase4"
predicate = { kind = "check_passed", check = "test" }

[[step]]
id = "phase5.tests-attested"
phase = "Phase5"
predicate = { kind = "signature_present", phase = "Phase4" }

[[step]]
id = "phase5.readme"
phase = "Phase5"
severity = "warning"
predicate = { kind = "file_exists", path = "README.md" }
"#;

fn workspace(config: &str) -> (tempfile::TempDir, Store, GateConfig) {
    let tmp = tempdir().expect("tempdir");
    let store = Store::at(tmp.path());
    fs::create_dir_all(&store.root).unwrap();
    fs::write(store.config_path(), config).unwrap();
    for i in 0..5 {
        fs::create_dir_all(tmp.path().join("src")).unwrap();
        fs::write(tmp.path().join(format!("src/f{}.rs", i)), format!("// {}", i)).unwrap();
    }
    let config = GateConfig::load(&store).expect("config loads");
    (tmp, store, config)
}

fn five_changed_files() -> Vec<String> {
    (0..5).map(|i| format!("src/f{}.rs", i)).collect()
}

fn set_ceiling(store: &Store, metric: &str, ceiling: f64) {
    let mut guard = BaselineGuard::load(store).unwrap();
    guard
        .update_baseline(metric, ceiling, "initial budget", "test")
        .unwrap();
}

fn signer(id: &str, seed: u8) -> Ed25519Signer {
    Ed25519Signer::new(id, SigningKey::from_bytes(&[seed; 32]))
}

fn trust(store: &Store, signers: &[&Ed25519Signer]) {
    let body: String = signers
        .iter()
        .map(|s| format!("{} = \"{}\"\n", s.signer_id(), s.public_key_hex()))
        .collect();
    fs::write(store.keyring_path(), body).unwrap();
}

#[test]
fn metric_at_ceiling_passes_incrementally() {
    let (_tmp, store, config) = workspace(METRIC_CONFIG);
    set_ceiling(&store, "lint_warnings", 50.0);
    let vcs = FakeVcs::with_changes(five_changed_files());
    let checker = FakeChecker::measuring("lint_warnings", 50.0);

    let summary = run_validation(&store, &config, &vcs, &checker, &RunOptions::default()).unwrap();
    assert_eq!(summary.scope.mode, ScopeMode::Incremental);
    assert_eq!(summary.scope.changed_files.len(), 5);
    assert_eq!(summary.reports.len(), 1);
    assert_eq!(summary.reports[0].status, PhaseStatus::Passed);
    assert_eq!(summary.reports[0].pass_rate, 1.0);
    assert_eq!(summary.exit_code, 0);
}

#[test]
fn metric_over_ceiling_fails_and_names_the_metric() {
    let (_tmp, store, config) = workspace(METRIC_CONFIG);
    set_ceiling(&store, "lint_warnings", 50.0);
    let vcs = FakeVcs::with_changes(five_changed_files());
    let checker = FakeChecker::measuring("lint_warnings", 51.0);

    let summary = run_validation(&store, &config, &vcs, &checker, &RunOptions::default()).unwrap();
    let report = &summary.reports[0];
    assert_eq!(report.status, PhaseStatus::Failed);
    assert_eq!(report.blocking_failures.len(), 1);
    assert!(report.blocking_failures[0].starts_with("phase3.lint-budget: "));
    assert!(report.blocking_failures[0].contains("lint_warnings"));
    assert_eq!(summary.exit_code, 1);

    // The run never moves the ceiling.
    let guard = BaselineGuard::load(&store).unwrap();
    assert_eq!(guard.get("lint_warnings").unwrap().ceiling_value, 50.0);
}

#[test]
fn manifest_among_two_hundred_changes_forces_full_scope() {
    let (_tmp, store, config) = workspace(METRIC_CONFIG);
    set_ceiling(&store, "lint_warnings", 50.0);
    let mut changed: Vec<String> = (0..199).map(|i| format!("src/gen/m{}.rs", i)).collect();
    changed.push("Cargo.toml".to_string());
    let vcs = FakeVcs::with_changes(changed);
    let checker = FakeChecker::measuring("lint_warnings", 3.0);

    let summary = run_validation(&store, &config, &vcs, &checker, &RunOptions::default()).unwrap();
    assert_eq!(summary.scope.mode, ScopeMode::Full);
    assert!(summary.scope.reason.contains("Cargo.toml"));
}

#[test]
fn unknown_metric_baseline_fails_the_step() {
    let (_tmp, store, config) = workspace(METRIC_CONFIG);
    let vcs = FakeVcs::with_changes(five_changed_files());
    let checker = FakeChecker::measuring("lint_warnings", 1.0);
    let summary = run_validation(&store, &config, &vcs, &checker, &RunOptions::default()).unwrap();
    assert_eq!(summary.reports[0].results[0].outcome, Outcome::Fail);
    assert!(summary.reports[0].results[0].detail.contains("no baseline"));
}

#[test]
fn second_run_is_served_from_cache() {
    let (_tmp, store, config) = workspace(METRIC_CONFIG);
    set_ceiling(&store, "lint_warnings", 50.0);
    let vcs = FakeVcs::with_changes(five_changed_files());
    let checker = FakeChecker::measuring("lint_warnings", 10.0);

    run_validation(&store, &config, &vcs, &checker, &RunOptions::default()).unwrap();
    let second = run_validation(&store, &config, &vcs, &checker, &RunOptions::default()).unwrap();
    assert_eq!(checker.calls(), 1);
    assert_eq!(second.exit_code, 0);
    let log = fs::read_to_string(store.run_dir(&second.run_id).join("phase3.lint-budget.log")).unwrap();
    assert!(log.contains("cached=true"));
}

#[test]
fn full_scope_reruns_after_uncommitted_edits() {
    let (_tmp, store, config) = workspace(METRIC_CONFIG);
    set_ceiling(&store, "lint_warnings", 50.0);
    // Nothing ahead of the base: the scope falls back to a full scan.
    let vcs = FakeVcs::with_changes(Vec::new());
    let checker = FakeChecker::measuring("lint_warnings", 10.0);

    let first = run_validation(&store, &config, &vcs, &checker, &RunOptions::default()).unwrap();
    assert_eq!(first.scope.mode, ScopeMode::Full);
    run_validation(&store, &config, &vcs, &checker, &RunOptions::default()).unwrap();
    assert_eq!(checker.calls(), 1);

    *vcs.dirty.lock().unwrap() = "edited-a".to_string();
    run_validation(&store, &config, &vcs, &checker, &RunOptions::default()).unwrap();
    assert_eq!(checker.calls(), 2);
    run_validation(&store, &config, &vcs, &checker, &RunOptions::default()).unwrap();
    assert_eq!(checker.calls(), 2);

    *vcs.dirty.lock().unwrap() = "edited-b".to_string();
    run_validation(&store, &config, &vcs, &checker, &RunOptions::default()).unwrap();
    assert_eq!(checker.calls(), 3);
}

#[test]
fn expired_deadline_skips_steps_and_leaves_phase_in_progress() {
    let (_tmp, store, config) = workspace(METRIC_CONFIG);
    set_ceiling(&store, "lint_warnings", 50.0);
    let vcs = FakeVcs::with_changes(five_changed_files());
    let checker = FakeChecker::measuring("lint_warnings", 10.0);
    let opts = RunOptions {
        deadline: Some(Duration::ZERO),
        ..RunOptions::default()
    };

    let summary = run_validation(&store, &config, &vcs, &checker, &opts).unwrap();
    let report = &summary.reports[0];
    assert_eq!(report.results[0].outcome, Outcome::Skip);
    assert_eq!(report.results[0].detail, "timed out");
    assert_eq!(report.status, PhaseStatus::InProgress);
    assert_eq!(summary.exit_code, 1);
    assert_eq!(checker.calls(), 0);
}

#[test]
fn missing_required_tool_is_a_configuration_error() {
    let (_tmp, store, config) = workspace(METRIC_CONFIG);
    let vcs = FakeVcs::with_changes(five_changed_files());
    let mut checker = FakeChecker::passing();
    checker.available = false;

    let err = run_validation(&store, &config, &vcs, &checker, &RunOptions::default()).unwrap_err();
    assert!(matches!(err, PhasegateError::ConfigError(ref m) if m.contains("lint-tool")));
    assert_eq!(err.exit_code(), 2);
    assert_eq!(checker.calls(), 0);
}

#[test]
fn gate_phase_waits_for_two_distinct_signers() {
    let (_tmp, store, config) = workspace(GATE_CONFIG);
    let alice = signer("alice", 1);
    let bob = signer("bob", 2);
    trust(&store, &[&alice, &bob]);
    let vcs = FakeVcs::with_changes(five_changed_files());
    let checker = FakeChecker::passing();

    // Phase4 passes and leaves an unsigned artifact; Phase5 cannot be entered yet.
    let first = run_validation(&store, &config, &vcs, &checker, &RunOptions::default()).unwrap();
    assert_eq!(first.reports.len(), 1);
    let artifact = first.reports[0].artifact.clone().expect("gate artifact");
    assert_eq!(artifact.commit, HEAD);
    assert_eq!(artifact.required_signers, 2);
    assert!(first.halted.as_deref().unwrap().contains("0 of 2"));
    assert_eq!(first.exit_code, 0);

    let gates = GateStore::new(&store.gates_dir());
    let keyring = Ed25519Keyring::load(&store.keyring_path()).unwrap();
    let attestor = GateAttestor::new(&keyring);

    // alice submitting twice is still one signer.
    let signed = attestor.sign(&artifact, &alice).unwrap();
    let mut doubled = signed.clone();
    doubled.signatures.push(signed.signatures[0].clone());
    gates.save(&doubled).unwrap();
    assert_eq!(
        attestor.verify(&doubled, None),
        Authorization::Insufficient { have: 1, need: 2 }
    );
    let evidence = EvidenceRecorder::new(&store.evidence_path());
    let final_gate = FinalGate::new(&config, &gates, &attestor, &evidence);
    assert!(!final_gate.evaluate("feature/gates", HEAD, None).unwrap().allowed);

    gates.save(&attestor.sign(&signed, &bob).unwrap()).unwrap();

    // Same commit and outcomes: the artifact and its signatures survive the re-run.
    let second = run_validation(&store, &config, &vcs, &checker, &RunOptions::default()).unwrap();
    assert_eq!(second.reports.len(), 2);
    assert_eq!(second.reports[1].status, PhaseStatus::Passed);
    assert_eq!(second.reports[1].warnings.len(), 1);
    assert!(second.halted.is_none());
    assert_eq!(second.exit_code, 0);

    let decision = final_gate.evaluate("feature/gates", HEAD, None).unwrap();
    assert!(decision.allowed, "{:?}", decision.reasons());

    let ledger = load_ledger(&store, "feature/gates").unwrap();
    assert_eq!(ledger.status(PhaseId::Phase5), PhaseStatus::Passed);
}

#[test]
fn new_commit_invalidates_the_final_gate() {
    let (_tmp, store, config) = workspace(GATE_CONFIG);
    let alice = signer("alice", 1);
    let bob = signer("bob", 2);
    trust(&store, &[&alice, &bob]);
    let vcs = FakeVcs::with_changes(five_changed_files());
    let checker = FakeChecker::passing();

    let first = run_validation(&store, &config, &vcs, &checker, &RunOptions::default()).unwrap();
    let artifact = first.reports[0].artifact.clone().unwrap();
    let gates = GateStore::new(&store.gates_dir());
    let keyring = Ed25519Keyring::load(&store.keyring_path()).unwrap();
    let attestor = GateAttestor::new(&keyring);
    let signed = attestor.sign(&attestor.sign(&artifact, &alice).unwrap(), &bob).unwrap();
    gates.save(&signed).unwrap();

    let evidence = EvidenceRecorder::new(&store.evidence_path());
    let final_gate = FinalGate::new(&config, &gates, &attestor, &evidence);
    let new_head = "d2d2d2d2d2d2d2d2d2d2d2d2d2d2d2d2d2d2d2d2";
    let decision = final_gate.evaluate("feature/gates", new_head, None).unwrap();
    assert!(!decision.allowed);
    assert!(decision.reasons().iter().any(|r| r.contains("HEAD is")));

    // Validating the new commit replaces the artifact and drops the old signatures.
    *vcs.head.lock().unwrap() = new_head.to_string();
    let rerun = run_validation(&store, &config, &vcs, &checker, &RunOptions::default()).unwrap();
    assert!(rerun.reports[0].artifact.as_ref().unwrap().signatures.is_empty());
}

#[test]
fn explicit_phase_respects_entry_rules() {
    let (_tmp, store, config) = workspace(GATE_CONFIG);
    let vcs = FakeVcs::with_changes(five_changed_files());
    let checker = FakeChecker::passing();
    let opts = RunOptions {
        phase: Some(PhaseId::Phase5),
        ..RunOptions::default()
    };

    let err = run_validation(&store, &config, &vcs, &checker, &opts).unwrap_err();
    assert!(matches!(err, PhasegateError::TransitionBlocked(ref m) if m.contains("Phase4")));
    assert_eq!(err.exit_code(), 1);
}

#[test]
fn bypass_actor_enters_past_an_unsigned_gate() {
    let config_text = GATE_CONFIG.replace(
        "required_signers = 2",
        "required_signers = 2\nbypass_actors = [{ actor_id = \"release-bot\", mode = \"always\" }, { actor_id = \"reviewer\", mode = \"pull_request\" }]",
    );
    let (_tmp, store, config) = workspace(&config_text);
    let vcs = FakeVcs::with_changes(five_changed_files());
    let checker = FakeChecker::passing();

    let reviewer = RunOptions {
        principal: Some("reviewer".to_string()),
        ..RunOptions::default()
    };
    let summary = run_validation(&store, &config, &vcs, &checker, &reviewer).unwrap();
    assert_eq!(summary.reports.len(), 1);

    let bot = RunOptions {
        principal: Some("release-bot".to_string()),
        ..RunOptions::default()
    };
    let summary = run_validation(&store, &config, &vcs, &checker, &bot).unwrap();
    assert_eq!(summary.reports.len(), 2);
    // Bypass covers entry only; the signature step still has nothing to count.
    assert_eq!(summary.reports[1].results[0].outcome, Outcome::Fail);
    assert_eq!(summary.exit_code, 1);
}

/// Slow enough that parallel steps overlap while the check is running.
struct SlowChecker(FakeChecker);

impl Checker for SlowChecker {
    fn run(
        &self,
        check: &CheckDef,
        scope: &ChangeScope,
        timeout: Duration,
    ) -> Result<CheckOutput, PhasegateError> {
        std::thread::sleep(Duration::from_millis(100));
        self.0.run(check, scope, timeout)
    }
}

#[test]
fn parallel_steps_sharing_a_check_run_it_once() {
    let mut config_text = String::from(
        r#"
[[check]]
name = "shared"
command = "shared-tool"

[[phase]]
id = "Phase2"
parallel = true
"#,
    );
    for i in 0..6 {
        config_text.push_str(&format!(
            "\n[[step]]\nid = \"phase2.s{}\"\nphase = \"Phase2\"\npredicate = {{ kind = \"check_passed\", check = \"shared\" }}\n",
            i
        ));
    }
    let (_tmp, store, config) = workspace(&config_text);
    let vcs = FakeVcs::with_changes(five_changed_files());
    let checker = SlowChecker(FakeChecker::passing());

    let summary = run_validation(&store, &config, &vcs, &checker, &RunOptions::default()).unwrap();
    assert_eq!(summary.reports[0].tally.passed, 6);
    assert_eq!(checker.0.calls(), 1);
}

#[test]
fn parallel_phase_writes_isolated_step_logs() {
    let config_text = r#"
[[check]]
name = "a"
command = "tool-a"

[[check]]
name = "b"
command = "tool-b"

[[phase]]
id = "Phase2"
parallel = true

[[step]]
id = "phase2.a"
phase = "Phase2"
predicate = { kind = "check_passed", check = "a" }

[[step]]
id = "phase2.b"
phase = "Phase2"
predicate = { kind = "composite", mode = "all", of = [{ kind = "check_passed", check = "b" }, { kind = "file_exists", path = "src/f0.rs", contains = "^// 0$" }] }

[[step]]
id = "phase2.changelog"
phase = "Phase2"
optional = true
predicate = { kind = "metric_within_baseline", metric = "absent", check = "a" }
"#;
    let (_tmp, store, config) = workspace(config_text);
    let vcs = FakeVcs::with_changes(five_changed_files());
    let checker = FakeChecker::passing();

    let summary = run_validation(&store, &config, &vcs, &checker, &RunOptions::default()).unwrap();
    let report = &summary.reports[0];
    let ids: Vec<&str> = report.results.iter().map(|r| r.step_id.as_str()).collect();
    assert_eq!(ids, vec!["phase2.a", "phase2.b", "phase2.changelog"]);
    assert_eq!(report.results[2].outcome, Outcome::Skip);
    assert_eq!(report.status, PhaseStatus::Passed);
    assert_eq!(report.tally.passed, 2);

    let run_dir = store.run_dir(&summary.run_id);
    assert!(run_dir.join("phase2.a.log").is_file());
    assert!(run_dir.join("phase2.b.log").is_file());

    let evidence = EvidenceRecorder::new(&store.evidence_path())
        .read_records(None)
        .unwrap();
    assert_eq!(evidence.len(), 1);
    assert_eq!(evidence[0].run_id, summary.run_id);
    assert_eq!(evidence[0].total_steps, 3);
}
