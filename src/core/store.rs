//! On-disk layout of a phasegate workspace.
//!
//! All persistent state lives under `<repo>/.phasegate/`:
//!
//! - `gates.toml`: step/check/phase declarations (operator-authored)
//! - `trusted_signers.toml`: signer id → Ed25519 public key (hex)
//! - `baselines.json` + `baseline.events.jsonl`: metric ceilings and history
//! - `cache/<key>.json`: one record per cache key
//! - `gates/<branch>/<phase>.json`: one gate artifact per phase per branch
//! - `state/<branch>.json`: phase status ledger
//! - `evidence.jsonl`: append-only run records
//! - `runs/<run_id>/`: per-step diagnostics of a run

use crate::core::error::PhasegateError;
use std::fs;
use std::path::{Path, PathBuf};

pub const STORE_DIR: &str = ".phasegate";

/// Handle to a repository's phasegate workspace.
#[derive(Debug, Clone)]
pub struct Store {
    /// Repository root (parent of `.phasegate/`).
    pub repo_root: PathBuf,
    /// Absolute path to `.phasegate/`.
    pub root: PathBuf,
}

impl Store {
    pub fn at(repo_root: &Path) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            root: repo_root.join(STORE_DIR),
        }
    }

    /// Walk up from `start` to the first directory containing `.phasegate/`.
    pub fn discover(start: &Path) -> Option<Self> {
        let mut current = Some(start);
        while let Some(dir) = current {
            if dir.join(STORE_DIR).is_dir() {
                return Some(Self::at(dir));
            }
            current = dir.parent();
        }
        None
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("gates.toml")
    }

    pub fn keyring_path(&self) -> PathBuf {
        self.root.join("trusted_signers.toml")
    }

    pub fn baselines_path(&self) -> PathBuf {
        self.root.join("baselines.json")
    }

    pub fn baseline_events_path(&self) -> PathBuf {
        self.root.join("baseline.events.jsonl")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn gates_dir(&self) -> PathBuf {
        self.root.join("gates")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn evidence_path(&self) -> PathBuf {
        self.root.join("evidence.jsonl")
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join("runs").join(run_id)
    }
}

/// Branch names contain `/`; flatten them into a single path component.
pub fn branch_component(branch: &str) -> String {
    branch
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Replace `path` with `bytes` so readers never observe a partial file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PhasegateError> {
    let parent = path.parent().ok_or_else(|| {
        PhasegateError::ValidationError(format!("path has no parent: {}", path.display()))
    })?;
    fs::create_dir_all(parent)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{}.{}.tmp", file_name, ulid::Ulid::new()));
    fs::write(&tmp, bytes)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(PhasegateError::IoError(e));
    }
    Ok(())
}
