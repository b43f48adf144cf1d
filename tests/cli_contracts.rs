use ed25519_dalek::SigningKey;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

const GATES: &str = r#"
[settings]
base_ref = "main"
required_signers = 2

[[check]]
name = "lint"
command = "sh"
args = ["-c", "echo 'lint_warnings = 3'"]

[[check]]
name = "test"
command = "sh"
args = ["-c", "echo running; exit 0"]

[[phase]]
id = "Phase3"
name = "Implementation"

[[phase]]
id = "Phase4"
name = "Testing"
is_gate = true

[[step]]
id = "phase3.lint-budget"
phase = "Phase3"
predicate = { kind = "metric_within_baseline", metric = "lint_warnings", check = "lint" }

[[step]]
id = "phase4.tests"
phase = "Phase4"
predicate = { kind = "check_passed", check = "test" }
"#;

fn run_phasegate(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_phasegate"))
        .current_dir(dir)
        .args(args)
        .env("NO_COLOR", "1")
        .env_remove("PHASEGATE_FULL")
        .env_remove("PHASEGATE_ACTOR")
        .output()
        .expect("run phasegate")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).to_string()
}

fn git(dir: &Path, args: &[&str]) {
    let out = Command::new("git")
        .current_dir(dir)
        .args(args)
        .output()
        .expect("git");
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
}

fn commit_file(dir: &Path, name: &str, body: &str) {
    fs::write(dir.join(name), body).unwrap();
    git(dir, &["add", name]);
    git(dir, &["commit", "-q", "-m", name]);
}

/// A repo with `main` plus a `feature` branch one commit ahead, and the
/// test gates declared in the working tree.
fn setup_repo() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().expect("tmpdir");
    let dir = tmp.path().to_path_buf();
    git(&dir, &["init", "-q", "-b", "main"]);
    git(&dir, &["config", "user.email", "gate@example.com"]);
    git(&dir, &["config", "user.name", "Gate"]);
    commit_file(&dir, "README.md", "# demo\n");
    git(&dir, &["checkout", "-q", "-b", "feature"]);
    commit_file(&dir, "lib.rs", "pub fn f() {}\n");

    let init = run_phasegate(&dir, &["init"]);
    assert!(init.status.success(), "init failed: {:?}", init);
    fs::write(dir.join(".phasegate/gates.toml"), GATES).unwrap();
    (tmp, dir)
}

fn set_ceiling(dir: &Path, ceiling: &str) {
    let out = run_phasegate(
        dir,
        &["baseline", "update", "lint_warnings", ceiling, "--justification", "initial budget"],
    );
    assert!(out.status.success(), "baseline update failed: {:?}", out);
}

/// Writes a key file for `id` and registers its public key as trusted.
fn add_signer(dir: &Path, id: &str, seed: u8) -> PathBuf {
    let key = SigningKey::from_bytes(&[seed; 32]);
    let key_path = dir.join(format!("{}.key", id));
    fs::write(&key_path, hex::encode([seed; 32])).unwrap();
    let keyring = dir.join(".phasegate/trusted_signers.toml");
    let mut body = fs::read_to_string(&keyring).unwrap_or_default();
    body.push_str(&format!(
        "{} = \"{}\"\n",
        id,
        hex::encode(key.verifying_key().as_bytes())
    ));
    fs::write(&keyring, body).unwrap();
    key_path
}

#[test]
fn init_writes_a_loadable_starter_config() {
    let tmp = TempDir::new().unwrap();
    git(tmp.path(), &["init", "-q", "-b", "main"]);
    let out = run_phasegate(tmp.path(), &["init"]);
    assert!(out.status.success());
    assert!(tmp.path().join(".phasegate/gates.toml").is_file());
    assert!(tmp.path().join(".phasegate/trusted_signers.toml").is_file());

    let lint = run_phasegate(tmp.path(), &["steps", "lint"]);
    assert!(lint.status.success(), "{:?}", lint);
    assert!(stdout(&lint).contains("7 phases"));

    // A second init leaves the existing declarations alone.
    fs::write(tmp.path().join(".phasegate/gates.toml"), GATES).unwrap();
    run_phasegate(tmp.path(), &["init"]);
    let kept = fs::read_to_string(tmp.path().join(".phasegate/gates.toml")).unwrap();
    assert_eq!(kept, GATES);
}

#[test]
fn commands_outside_a_store_exit_with_config_error() {
    let tmp = TempDir::new().unwrap();
    let out = run_phasegate(tmp.path(), &["validate"]);
    assert_eq!(out.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&out.stderr).contains("phasegate init"));
}

#[test]
fn validate_passes_within_the_ceiling() {
    let (_tmp, dir) = setup_repo();
    set_ceiling(&dir, "3");

    let out = run_phasegate(&dir, &["validate"]);
    let text = stdout(&out);
    assert_eq!(out.status.code(), Some(0), "{}", text);
    assert!(text.contains("PASS phase3.lint-budget"));
    assert!(text.contains("PASS phase4.tests"));
    assert!(text.contains("exit=0"));
    assert!(dir.join(".phasegate/evidence.jsonl").is_file());
}

#[test]
fn validate_fails_over_the_ceiling() {
    let (_tmp, dir) = setup_repo();
    set_ceiling(&dir, "2");

    let out = run_phasegate(&dir, &["validate"]);
    let text = stdout(&out);
    assert_eq!(out.status.code(), Some(1), "{}", text);
    assert!(text.contains("FAIL phase3.lint-budget"));
    assert!(text.contains("lint_warnings = 3 exceeds its ceiling by 1"));
    assert!(text.contains("halted: Phase3 is failed"));
}

#[test]
fn invalid_declarations_exit_with_config_error() {
    let (_tmp, dir) = setup_repo();
    let broken = GATES.replace("id = \"phase4.tests\"", "id = \"tests\"");
    fs::write(dir.join(".phasegate/gates.toml"), broken).unwrap();

    let out = run_phasegate(&dir, &["validate"]);
    assert_eq!(out.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&out.stderr).contains("phase4."));
}

#[test]
fn validate_json_envelope() {
    let (_tmp, dir) = setup_repo();
    set_ceiling(&dir, "10");

    let out = run_phasegate(&dir, &["validate", "--format", "json", "--full"]);
    assert_eq!(out.status.code(), Some(0));
    let json: serde_json::Value = serde_json::from_slice(&out.stdout).expect("json output");
    assert_eq!(json["cmd"], "validate");
    assert_eq!(json["status"], "ok");
    assert_eq!(json["exit_code"], 0);
    assert_eq!(json["summary"]["scope"]["mode"], "full");
    assert_eq!(json["summary"]["reports"].as_array().unwrap().len(), 2);
    assert_eq!(json["summary"]["reports"][1]["artifact"]["phase_id"], "Phase4");
}

#[test]
fn baseline_update_requires_a_justification() {
    let (_tmp, dir) = setup_repo();
    let missing_flag = run_phasegate(&dir, &["baseline", "update", "lint_warnings", "5"]);
    assert!(!missing_flag.status.success());

    let blank = run_phasegate(
        &dir,
        &["baseline", "update", "lint_warnings", "5", "--justification", "  "],
    );
    assert_eq!(blank.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&blank.stderr).contains("justification"));
    assert!(!dir.join(".phasegate/baselines.json").exists());

    set_ceiling(&dir, "5");
    let over = run_phasegate(&dir, &["baseline", "check", "lint_warnings", "6"]);
    assert_eq!(over.status.code(), Some(1));
    let at = run_phasegate(&dir, &["baseline", "check", "lint_warnings", "5"]);
    assert_eq!(at.status.code(), Some(0));
}

#[test]
fn cache_serves_repeat_runs_and_can_be_cleared() {
    let (_tmp, dir) = setup_repo();
    set_ceiling(&dir, "3");
    assert_eq!(run_phasegate(&dir, &["validate"]).status.code(), Some(0));

    let stats = stdout(&run_phasegate(&dir, &["cache", "stats"]));
    assert!(stats.contains("entries=2"), "{}", stats);

    let again = stdout(&run_phasegate(&dir, &["validate"]));
    assert!(again.contains("(cached)"), "{}", again);

    let cleared = stdout(&run_phasegate(&dir, &["cache", "clear"]));
    assert!(cleared.contains("cleared 2"));
}

#[test]
fn pre_push_blocks_until_two_signers_attest_head() {
    let (_tmp, dir) = setup_repo();
    set_ceiling(&dir, "3");
    let alice = add_signer(&dir, "alice", 7);
    let bob = add_signer(&dir, "bob", 9);

    let blocked = run_phasegate(&dir, &["hook", "pre-push"]);
    assert_eq!(blocked.status.code(), Some(1));
    assert!(stdout(&blocked).contains("no gate artifact"));

    assert_eq!(run_phasegate(&dir, &["validate"]).status.code(), Some(0));
    let alice_key = alice.to_str().unwrap();
    let sign = run_phasegate(
        &dir,
        &["gate", "sign", "Phase4", "--signer", "alice", "--key-file", alice_key],
    );
    assert!(sign.status.success(), "{:?}", sign);

    // A second signature from alice does not count twice.
    let twice = run_phasegate(
        &dir,
        &["gate", "sign", "Phase4", "--signer", "alice", "--key-file", alice_key],
    );
    assert_eq!(twice.status.code(), Some(1));
    let verify = run_phasegate(&dir, &["gate", "verify", "Phase4"]);
    assert_eq!(verify.status.code(), Some(1));
    assert!(stdout(&verify).contains("insufficient"));

    let sign_bob = run_phasegate(
        &dir,
        &["gate", "sign", "Phase4", "--signer", "bob", "--key-file", bob.to_str().unwrap()],
    );
    assert!(sign_bob.status.success());
    assert_eq!(run_phasegate(&dir, &["gate", "verify", "Phase4"]).status.code(), Some(0));

    let allowed = run_phasegate(&dir, &["hook", "pre-push", "--format", "json"]);
    let json: serde_json::Value = serde_json::from_slice(&allowed.stdout).unwrap();
    assert_eq!(json["status"], "allowed", "{}", json);
    assert_eq!(allowed.status.code(), Some(0));

    // New commit: the attestation no longer covers HEAD.
    commit_file(&dir, "lib.rs", "pub fn g() {}\n");
    let stale = run_phasegate(&dir, &["hook", "pre-push"]);
    assert_eq!(stale.status.code(), Some(1));
    assert!(stdout(&stale).contains("HEAD is"));
}

#[test]
fn hook_install_writes_an_executable_pre_push_hook() {
    let (_tmp, dir) = setup_repo();
    let out = run_phasegate(&dir, &["hook", "install"]);
    assert!(out.status.success(), "{:?}", out);
    let hook = dir.join(".git/hooks/pre-push");
    let body = fs::read_to_string(&hook).unwrap();
    assert!(body.contains("phasegate hook pre-push"));
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&hook).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    // Reinstalling the same hook is fine; clobbering a foreign one is not.
    assert!(run_phasegate(&dir, &["hook", "install"]).status.success());
    fs::write(&hook, "#!/bin/sh\nexit 0\n").unwrap();
    assert_eq!(run_phasegate(&dir, &["hook", "install"]).status.code(), Some(1));
    assert!(run_phasegate(&dir, &["hook", "install", "--force"]).status.success());
}

#[test]
fn status_and_evidence_reflect_the_last_run() {
    let (_tmp, dir) = setup_repo();
    set_ceiling(&dir, "3");
    run_phasegate(&dir, &["validate"]);

    let status = run_phasegate(&dir, &["status", "--format", "json"]);
    let json: serde_json::Value = serde_json::from_slice(&status.stdout).unwrap();
    assert_eq!(json["branch"], "feature");
    assert_eq!(json["phases"][0]["status"], "passed");
    assert_eq!(json["phases"][1]["valid_signatures"], 0);

    let evidence = run_phasegate(&dir, &["evidence", "list", "--format", "json"]);
    let json: serde_json::Value = serde_json::from_slice(&evidence.stdout).unwrap();
    let records = json["records"].as_array().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["phase_id"], "Phase3");
    assert_eq!(records[0]["pass_rate"], 1.0);
}
