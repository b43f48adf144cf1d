//! Cache-or-run execution of declared checks.

use crate::core::cache::ContentCache;
use crate::core::checker::{CheckOutput, Checker};
use crate::core::config::CheckDef;
use crate::core::model::{Outcome, StepResult};
use crate::core::output;
use crate::core::scope::ChangeScope;
use crate::core::time;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

const DETAIL_MAX_CHARS: usize = 240;
const DIAGNOSTIC_TAIL_LINES: usize = 20;

/// Outcome of one check execution, cached or fresh.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckRun {
    pub check_name: String,
    pub outcome: Outcome,
    /// `None` when the process never completed (timeout, spawn failure).
    pub exit_code: Option<i32>,
    pub measurements: BTreeMap<String, f64>,
    pub detail: String,
    /// Full tool output of a fresh run; empty for cache hits.
    #[serde(skip)]
    pub diagnostics: String,
    pub from_cache: bool,
    pub attempts: u32,
}

impl CheckRun {
    fn failed(check_name: &str, detail: String, attempts: u32) -> Self {
        Self {
            check_name: check_name.to_string(),
            outcome: Outcome::Fail,
            exit_code: None,
            measurements: BTreeMap::new(),
            detail,
            diagnostics: String::new(),
            from_cache: false,
            attempts,
        }
    }

    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Pass
    }
}

pub struct CheckRunner<'a> {
    checker: &'a dyn Checker,
    cache: &'a ContentCache,
    checks: BTreeMap<String, CheckDef>,
    default_timeout_secs: u64,
}

impl<'a> CheckRunner<'a> {
    pub fn new(
        checker: &'a dyn Checker,
        cache: &'a ContentCache,
        checks: BTreeMap<String, CheckDef>,
        default_timeout_secs: u64,
    ) -> Self {
        Self {
            checker,
            cache,
            checks,
            default_timeout_secs,
        }
    }

    /// Required checks whose tool cannot be found.
    pub fn missing_tools(&self) -> Vec<&CheckDef> {
        self.checks
            .values()
            .filter(|c| c.required && !self.checker.available(c))
            .collect()
    }

    /// Run `check_name` and report it as the result of step `check_name`.
    pub fn run(&self, check_name: &str, scope: &ChangeScope) -> StepResult {
        let run = self.execute(check_name, scope);
        StepResult::new(check_name, run.outcome, run.detail)
    }

    pub fn execute(&self, check_name: &str, scope: &ChangeScope) -> CheckRun {
        let Some(check) = self.checks.get(check_name) else {
            return CheckRun::failed(check_name, format!("undeclared check '{}'", check_name), 0);
        };

        let files = scope.cache_inputs();
        let key = self.cache.key(check_name, files);
        if let Some(entry) = self.cache.get(&key, time::now_secs()) {
            tracing::debug!(check = check_name, "cache hit");
            let outcome = if entry.exit_code == 0 {
                Outcome::Pass
            } else {
                Outcome::Fail
            };
            return CheckRun {
                check_name: check_name.to_string(),
                outcome,
                exit_code: Some(entry.exit_code),
                measurements: entry.measurements,
                detail: format!("{} (cached)", entry.detail),
                diagnostics: String::new(),
                from_cache: true,
                attempts: 0,
            };
        }

        let timeout = Duration::from_secs(check.timeout_secs.unwrap_or(self.default_timeout_secs));
        let max_attempts = if check.retriable { 2 } else { 1 };
        let mut attempts = 0;
        let output = loop {
            attempts += 1;
            match self.checker.run(check, scope, timeout) {
                Ok(out) if out.passed() || attempts >= max_attempts => break out,
                Ok(out) => {
                    tracing::info!(check = check_name, exit_code = out.exit_code, timed_out = out.timed_out, "retrying check");
                }
                Err(e) if attempts >= max_attempts => {
                    tracing::warn!(check = check_name, error = %e, "check could not run");
                    return CheckRun::failed(check_name, e.to_string(), attempts);
                }
                Err(e) => {
                    tracing::info!(check = check_name, error = %e, "retrying check");
                }
            }
        };

        let detail = describe(&output);
        if output.timed_out {
            return CheckRun {
                measurements: BTreeMap::new(),
                diagnostics: output.diagnostics,
                ..CheckRun::failed(check_name, detail, attempts)
            };
        }

        if let Err(e) = self.cache.put(
            &key,
            check_name,
            output.exit_code,
            files,
            output.measurements.clone(),
            &detail,
        ) {
            tracing::warn!(check = check_name, error = %e, "cache write failed");
        }

        CheckRun {
            check_name: check_name.to_string(),
            outcome: if output.exit_code == 0 {
                Outcome::Pass
            } else {
                Outcome::Fail
            },
            exit_code: Some(output.exit_code),
            measurements: output.measurements,
            detail,
            diagnostics: output.diagnostics,
            from_cache: false,
            attempts,
        }
    }
}

fn describe(output: &CheckOutput) -> String {
    if output.timed_out {
        return output::compact_line(&output.diagnostics, DETAIL_MAX_CHARS);
    }
    if output.exit_code == 0 {
        return "exit 0".to_string();
    }
    let tail = output::tail_lines(&output.diagnostics, DIAGNOSTIC_TAIL_LINES);
    let summary = output::compact_line(&tail, DETAIL_MAX_CHARS);
    if summary.is_empty() {
        format!("exit {}", output.exit_code)
    } else {
        format!("exit {}: {}", output.exit_code, summary)
    }
}
