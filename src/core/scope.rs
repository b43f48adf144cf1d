//! Change scope resolution: decide whether checks may run incrementally.
//!
//! Every uncertain case resolves to `Full`. Under-checking is the failure
//! mode this module exists to prevent.

use crate::core::glob;
use crate::core::vcs::VersionControl;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeMode {
    Full,
    Incremental,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeScope {
    pub mode: ScopeMode,
    /// Diffed paths. Informational in `Full` mode.
    pub changed_files: Vec<String>,
    /// Why this mode was chosen.
    pub reason: String,
}

impl ChangeScope {
    pub fn full(reason: impl Into<String>) -> Self {
        Self {
            mode: ScopeMode::Full,
            changed_files: Vec::new(),
            reason: reason.into(),
        }
    }

    pub fn incremental(changed_files: Vec<String>) -> Self {
        let reason = format!("{} changed file(s)", changed_files.len());
        Self {
            mode: ScopeMode::Incremental,
            changed_files,
            reason,
        }
    }

    pub fn is_full(&self) -> bool {
        self.mode == ScopeMode::Full
    }

    /// Files that define cache identity. Empty in `Full` mode, which makes the
    /// cache key on the commit instead.
    pub fn cache_inputs(&self) -> &[String] {
        match self.mode {
            ScopeMode::Full => &[],
            ScopeMode::Incremental => &self.changed_files,
        }
    }
}

pub struct ChangeScopeResolver<'a> {
    vcs: &'a dyn VersionControl,
    force_full: Vec<String>,
}

impl<'a> ChangeScopeResolver<'a> {
    pub fn new(vcs: &'a dyn VersionControl, force_full: Vec<String>) -> Self {
        Self { vcs, force_full }
    }

    pub fn resolve(&self, base_ref: &str, head_ref: &str) -> ChangeScope {
        if let Err(e) = self.vcs.commit_hash(base_ref) {
            tracing::info!(base_ref, error = %e, "base reference unresolvable; full scan");
            return ChangeScope::full(format!("base reference '{}' unresolvable", base_ref));
        }

        let changed = match self.vcs.diff_files(base_ref, head_ref) {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!(base_ref, head_ref, error = %e, "diff failed; full scan");
                return ChangeScope::full(format!("diff {}...{} failed", base_ref, head_ref));
            }
        };

        if changed.is_empty() {
            return ChangeScope::full("no upstream changes to compare");
        }

        if let Some((file, pattern)) = self.first_force_full_match(&changed) {
            tracing::debug!(file, pattern, "force-full file changed");
            let mut scope =
                ChangeScope::full(format!("'{}' matches force-full pattern '{}'", file, pattern));
            scope.changed_files = changed;
            return scope;
        }

        ChangeScope::incremental(changed)
    }

    fn first_force_full_match<'f>(&'f self, changed: &'f [String]) -> Option<(&'f str, &'f str)> {
        changed.iter().find_map(|file| {
            self.force_full
                .iter()
                .find(|p| glob::glob_match(p, file))
                .map(|p| (file.as_str(), p.as_str()))
        })
    }
}
