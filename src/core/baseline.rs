//! Regression-proof metric ceilings.
//!
//! A measurement passes iff it is at or below its metric's ceiling. Ceilings
//! only move through `update_baseline`, which demands a justification and
//! leaves a line in `baseline.events.jsonl`; validation runs never call it.

use crate::core::error::PhasegateError;
use crate::core::store::{Store, write_atomic};
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub metric_name: String,
    pub ceiling_value: f64,
    pub updated_at: String,
    pub justification: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum BaselineVerdict {
    Pass,
    Fail { excess: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BaselineEvent {
    event_id: String,
    ts: String,
    metric_name: String,
    previous_ceiling: Option<f64>,
    new_ceiling: f64,
    justification: String,
    actor: String,
}

#[derive(Debug, Clone)]
pub struct BaselineGuard {
    path: PathBuf,
    events_path: PathBuf,
    baselines: BTreeMap<String, Baseline>,
}

impl BaselineGuard {
    pub fn load(store: &Store) -> Result<Self, PhasegateError> {
        Self::open(&store.baselines_path(), &store.baseline_events_path())
    }

    /// A missing file is an empty baseline set.
    pub fn open(path: &Path, events_path: &Path) -> Result<Self, PhasegateError> {
        let baselines = if path.exists() {
            let raw = fs::read_to_string(path)?;
            let list: Vec<Baseline> = serde_json::from_str(&raw).map_err(|e| {
                PhasegateError::ConfigError(format!("{}: {}", path.display(), e))
            })?;
            list.into_iter()
                .map(|b| (b.metric_name.clone(), b))
                .collect()
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            events_path: events_path.to_path_buf(),
            baselines,
        })
    }

    pub fn get(&self, metric: &str) -> Option<&Baseline> {
        self.baselines.get(metric)
    }

    pub fn all(&self) -> impl Iterator<Item = &Baseline> {
        self.baselines.values()
    }

    /// Compare `measured` against the ceiling; equal to the ceiling passes.
    pub fn validate(&self, metric: &str, measured: f64) -> Result<BaselineVerdict, PhasegateError> {
        let baseline = self
            .baselines
            .get(metric)
            .ok_or_else(|| PhasegateError::NotFound(format!("no baseline for metric '{}'", metric)))?;
        if !measured.is_finite() {
            return Err(PhasegateError::ValidationError(format!(
                "metric '{}' measured a non-finite value",
                metric
            )));
        }
        if measured > baseline.ceiling_value {
            Ok(BaselineVerdict::Fail {
                excess: measured - baseline.ceiling_value,
            })
        } else {
            Ok(BaselineVerdict::Pass)
        }
    }

    /// Move a ceiling. The only way a baseline ever changes.
    pub fn update_baseline(
        &mut self,
        metric: &str,
        new_ceiling: f64,
        justification: &str,
        actor: &str,
    ) -> Result<Baseline, PhasegateError> {
        if metric.trim().is_empty() {
            return Err(PhasegateError::ValidationError(
                "metric name must not be empty".to_string(),
            ));
        }
        if justification.trim().is_empty() {
            return Err(PhasegateError::ValidationError(format!(
                "updating '{}' requires a justification",
                metric
            )));
        }
        if !new_ceiling.is_finite() {
            return Err(PhasegateError::ValidationError(format!(
                "ceiling for '{}' must be a finite number",
                metric
            )));
        }

        let previous = self.baselines.get(metric).map(|b| b.ceiling_value);
        let baseline = Baseline {
            metric_name: metric.to_string(),
            ceiling_value: new_ceiling,
            updated_at: time::now_epoch_z(),
            justification: justification.trim().to_string(),
        };
        let event = BaselineEvent {
            event_id: time::new_run_id(),
            ts: baseline.updated_at.clone(),
            metric_name: metric.to_string(),
            previous_ceiling: previous,
            new_ceiling,
            justification: baseline.justification.clone(),
            actor: actor.to_string(),
        };
        // No ceiling moves without its history line.
        self.append_event(&event)?;

        let replaced = self.baselines.insert(metric.to_string(), baseline.clone());
        if let Err(e) = self.save() {
            match replaced {
                Some(old) => self.baselines.insert(metric.to_string(), old),
                None => self.baselines.remove(metric),
            };
            return Err(e);
        }
        tracing::info!(metric, ?previous, new_ceiling, actor, "baseline updated");
        Ok(baseline)
    }

    fn save(&self) -> Result<(), PhasegateError> {
        let list: Vec<&Baseline> = self.baselines.values().collect();
        let bytes = serde_json::to_vec_pretty(&list)?;
        write_atomic(&self.path, &bytes)
    }

    fn append_event(&self, event: &BaselineEvent) -> Result<(), PhasegateError> {
        if let Some(parent) = self.events_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Number of recorded ceiling changes.
    pub fn history_len(&self) -> usize {
        fs::read_to_string(&self.events_path)
            .map(|raw| raw.lines().filter(|l| !l.trim().is_empty()).count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(dir: &Path) -> BaselineGuard {
        BaselineGuard::open(&dir.join("baselines.json"), &dir.join("baseline.events.jsonl")).unwrap()
    }

    #[test]
    fn ceiling_is_inclusive() {
        let tmp = tempfile::tempdir().unwrap();
        let mut g = guard(tmp.path());
        g.update_baseline("lint_warnings", 50.0, "initial", "ci").unwrap();
        assert_eq!(g.validate("lint_warnings", 50.0).unwrap(), BaselineVerdict::Pass);
        assert_eq!(g.validate("lint_warnings", 12.0).unwrap(), BaselineVerdict::Pass);
        assert_eq!(
            g.validate("lint_warnings", 51.0).unwrap(),
            BaselineVerdict::Fail { excess: 1.0 }
        );
    }

    #[test]
    fn unrecorded_update_leaves_ceiling_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let mut g = guard(tmp.path());
        g.update_baseline("lint_warnings", 50.0, "initial", "ci").unwrap();

        // History can no longer be appended to.
        let events = tmp.path().join("baseline.events.jsonl");
        fs::remove_file(&events).unwrap();
        fs::create_dir(&events).unwrap();

        assert!(g.update_baseline("lint_warnings", 500.0, "loosen", "mallory").is_err());
        assert_eq!(g.get("lint_warnings").unwrap().ceiling_value, 50.0);

        let reloaded = guard(tmp.path());
        assert_eq!(reloaded.get("lint_warnings").unwrap().ceiling_value, 50.0);
        assert_eq!(
            reloaded.validate("lint_warnings", 51.0).unwrap(),
            BaselineVerdict::Fail { excess: 1.0 }
        );
    }

    #[test]
    fn unknown_metric_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let g = guard(tmp.path());
        assert!(matches!(
            g.validate("coverage", 1.0),
            Err(PhasegateError::NotFound(_))
        ));
    }

    #[test]
    fn update_requires_justification_and_persists() {
        let tmp = tempfile::tempdir().unwrap();
        let mut g = guard(tmp.path());
        assert!(g.update_baseline("lint_warnings", 10.0, "  ", "ci").is_err());
        assert!(g.get("lint_warnings").is_none());

        g.update_baseline("lint_warnings", 10.0, "initial", "ci").unwrap();
        g.update_baseline("lint_warnings", 8.0, "cleanup landed", "alice").unwrap();

        let reloaded = guard(tmp.path());
        let b = reloaded.get("lint_warnings").unwrap();
        assert_eq!(b.ceiling_value, 8.0);
        assert_eq!(b.justification, "cleanup landed");
        assert_eq!(reloaded.history_len(), 2);
    }

    #[test]
    fn validation_never_moves_the_ceiling() {
        let tmp = tempfile::tempdir().unwrap();
        let mut g = guard(tmp.path());
        g.update_baseline("lint_warnings", 50.0, "initial", "ci").unwrap();
        for measured in [10.0, 49.0, 75.0] {
            let _ = g.validate("lint_warnings", measured);
        }
        assert_eq!(guard(tmp.path()).get("lint_warnings").unwrap().ceiling_value, 50.0);
        assert_eq!(g.history_len(), 1);
    }
}
