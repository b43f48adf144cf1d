//! Version-control seam.
//!
//! The engine only needs a few read-only questions answered; `GitCli`
//! answers them by shelling out to `git`.

use crate::core::error::PhasegateError;
use crate::core::store::STORE_DIR;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

pub trait VersionControl: Send + Sync {
    /// Repo-relative paths that differ between two references.
    fn diff_files(&self, base_ref: &str, head_ref: &str) -> Result<Vec<String>, PhasegateError>;
    /// Resolve a reference to a full commit id; errors if it does not exist.
    fn commit_hash(&self, reference: &str) -> Result<String, PhasegateError>;
    fn current_branch(&self) -> Result<String, PhasegateError>;
    /// Digest of uncommitted state (tracked edits plus untracked files,
    /// ignoring the store directory). Empty when the tree matches HEAD.
    fn worktree_digest(&self) -> Result<String, PhasegateError>;
}

#[derive(Debug, Clone)]
pub struct GitCli {
    repo_root: PathBuf,
}

impl GitCli {
    pub fn new(repo_root: &Path) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
        }
    }

    fn run_git(&self, args: &[&str]) -> Result<String, PhasegateError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .map_err(|e| PhasegateError::VcsError(format!("git failed to start: {}", e)))?;

        if !output.status.success() {
            return Err(PhasegateError::VcsError(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Directory git reads hooks from (honours worktrees and `core.hooksPath`).
    pub fn hooks_dir(&self) -> Result<PathBuf, PhasegateError> {
        let raw = self.run_git(&["rev-parse", "--git-path", "hooks"])?;
        let path = PathBuf::from(raw);
        Ok(if path.is_absolute() {
            path
        } else {
            self.repo_root.join(path)
        })
    }
}

impl VersionControl for GitCli {
    fn diff_files(&self, base_ref: &str, head_ref: &str) -> Result<Vec<String>, PhasegateError> {
        // Three-dot range: changes on head since it forked from base.
        let range = format!("{}...{}", base_ref, head_ref);
        let output = self.run_git(&["-c", "core.quotepath=false", "diff", "--name-only", &range])?;
        Ok(output
            .lines()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect())
    }

    fn commit_hash(&self, reference: &str) -> Result<String, PhasegateError> {
        let spec = format!("{}^{{commit}}", reference);
        self.run_git(&["rev-parse", "--verify", "--quiet", &spec])
    }

    fn current_branch(&self) -> Result<String, PhasegateError> {
        let branch = self.run_git(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        if branch == "HEAD" {
            // Detached: name the state by commit so gate files stay per-checkout.
            let commit = self.commit_hash("HEAD")?;
            return Ok(format!("detached-{}", &commit[..commit.len().min(12)]));
        }
        Ok(branch)
    }

    fn worktree_digest(&self) -> Result<String, PhasegateError> {
        let exclude = format!(":(exclude){}", STORE_DIR);
        let tracked = self.run_git(&[
            "-c",
            "core.quotepath=false",
            "diff",
            "HEAD",
            "--binary",
            "--",
            ".",
            &exclude,
        ])?;
        let untracked = self.run_git(&[
            "-c",
            "core.quotepath=false",
            "ls-files",
            "--others",
            "--exclude-standard",
            "--",
            ".",
            &exclude,
        ])?;
        if tracked.is_empty() && untracked.is_empty() {
            return Ok(String::new());
        }

        let mut hasher = Sha256::new();
        hasher.update(tracked.as_bytes());
        hasher.update([0]);
        for path in untracked.lines().map(str::trim).filter(|p| !p.is_empty()) {
            hasher.update(path.as_bytes());
            hasher.update([0]);
            if let Ok(bytes) = fs::read(self.repo_root.join(path)) {
                hasher.update(Sha256::digest(&bytes));
            }
            hasher.update([0]);
        }
        Ok(hex::encode(hasher.finalize()))
    }
}
