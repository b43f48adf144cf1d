//! Append-only audit log of phase outcomes (`.phasegate/evidence.jsonl`).
//!
//! Evidence is audit trail, not gate logic: a failed write becomes a warning
//! and never changes a run's result. Each record is one line written with a
//! single `write_all` on an append-mode handle, so readers never see half a
//! record.

use crate::core::error::PhasegateError;
use crate::core::model::{PhaseId, PhaseStatus};
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub run_id: String,
    pub run_timestamp: String,
    pub phase_id: PhaseId,
    pub status: PhaseStatus,
    pub total_steps: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub pass_rate: f64,
    pub vcs_branch: String,
    pub vcs_commit: String,
    #[serde(default)]
    pub blocking_failures: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct EvidenceRecorder {
    path: PathBuf,
}

impl EvidenceRecorder {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    /// Append `record`. Returns a warning instead of failing.
    pub fn record(&self, record: &EvidenceRecord) -> Option<String> {
        match self.append(record) {
            Ok(()) => None,
            Err(e) => {
                let warning = format!(
                    "evidence for {} not recorded at {}: {}",
                    record.phase_id,
                    self.path.display(),
                    e
                );
                tracing::warn!("{}", warning);
                Some(warning)
            }
        }
    }

    fn append(&self, record: &EvidenceRecord) -> Result<(), PhasegateError> {
        let mut record = record.clone();
        // Keep the log's timestamps non-decreasing even if the clock steps back.
        if let Some(last) = self.last_timestamp()
            && time::epoch_secs(&record.run_timestamp).is_none_or(|ts| ts < last)
        {
            record.run_timestamp = time::epoch_z(last);
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    fn last_timestamp(&self) -> Option<u64> {
        let raw = fs::read_to_string(&self.path).ok()?;
        raw.lines()
            .rev()
            .filter_map(|line| serde_json::from_str::<EvidenceRecord>(line).ok())
            .find_map(|r| time::epoch_secs(&r.run_timestamp))
    }

    /// Records in log order. With `limit`, only the most recent `limit`.
    /// Malformed lines are skipped.
    pub fn read_records(&self, limit: Option<usize>) -> Result<Vec<EvidenceRecord>, PhasegateError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)?;
        let mut records = Vec::new();
        for (idx, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<EvidenceRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(line = idx + 1, error = %e, "skipping malformed evidence line"),
            }
        }
        if let Some(limit) = limit
            && records.len() > limit
        {
            records.drain(..records.len() - limit);
        }
        Ok(records)
    }

    /// Most recent record for `phase` on `branch`.
    pub fn latest_for(
        &self,
        phase: PhaseId,
        branch: &str,
    ) -> Result<Option<EvidenceRecord>, PhasegateError> {
        Ok(self
            .read_records(None)?
            .into_iter()
            .rev()
            .find(|r| r.phase_id == phase && r.vcs_branch == branch))
    }
}
