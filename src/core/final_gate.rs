//! Pre-push checkpoint: re-read every gate artifact on the branch and decide
//! whether the protected transition may happen.

use crate::core::attest::{Authorization, GateAttestor, GateStore};
use crate::core::config::GateConfig;
use crate::core::error::PhasegateError;
use crate::core::evidence::EvidenceRecorder;
use crate::core::model::{PhaseId, PhaseStatus};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateCheck {
    pub phase: PhaseId,
    pub ok: bool,
    pub signers: Vec<String>,
    pub bypass_actor: Option<String>,
    /// Why this gate blocks; empty when `ok`.
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinalGateDecision {
    pub allowed: bool,
    pub branch: String,
    pub commit: String,
    pub gates: Vec<GateCheck>,
}

impl FinalGateDecision {
    /// `Phase4: reason` for every blocking condition.
    pub fn reasons(&self) -> Vec<String> {
        self.gates
            .iter()
            .flat_map(|g| g.reasons.iter().map(move |r| format!("{}: {}", g.phase, r)))
            .collect()
    }
}

pub struct FinalGate<'a> {
    config: &'a GateConfig,
    gates: &'a GateStore,
    attestor: &'a GateAttestor<'a>,
    evidence: &'a EvidenceRecorder,
}

impl<'a> FinalGate<'a> {
    pub fn new(
        config: &'a GateConfig,
        gates: &'a GateStore,
        attestor: &'a GateAttestor<'a>,
        evidence: &'a EvidenceRecorder,
    ) -> Self {
        Self {
            config,
            gates,
            attestor,
            evidence,
        }
    }

    pub fn evaluate(
        &self,
        branch: &str,
        head_commit: &str,
        principal: Option<&str>,
    ) -> Result<FinalGateDecision, PhasegateError> {
        let mut checks = Vec::new();
        for def in self.config.ordered_phases().into_iter().filter(|p| p.is_gate) {
            checks.push(self.check_gate(def.id, branch, head_commit, principal)?);
        }
        let allowed = checks.iter().all(|c| c.ok);
        tracing::info!(branch, allowed, gates = checks.len(), "final gate evaluated");
        Ok(FinalGateDecision {
            allowed,
            branch: branch.to_string(),
            commit: head_commit.to_string(),
            gates: checks,
        })
    }

    fn check_gate(
        &self,
        phase: PhaseId,
        branch: &str,
        head_commit: &str,
        principal: Option<&str>,
    ) -> Result<GateCheck, PhasegateError> {
        let mut check = GateCheck {
            phase,
            ok: false,
            signers: Vec::new(),
            bypass_actor: None,
            reasons: Vec::new(),
        };

        let artifact = match self.gates.load(branch, phase) {
            Ok(Some(artifact)) => artifact,
            Ok(None) => {
                check
                    .reasons
                    .push(format!("no gate artifact on '{}'; run `phasegate validate`", branch));
                return Ok(check);
            }
            Err(e) => {
                check.reasons.push(e.to_string());
                return Ok(check);
            }
        };

        if artifact.commit != head_commit {
            check.reasons.push(format!(
                "artifact attests {} but HEAD is {}",
                short(&artifact.commit),
                short(head_commit)
            ));
        }

        let need = self.config.required_signers_for(phase);
        match self.attestor.verify_with(&artifact, principal, need) {
            Authorization::Authorized {
                signers,
                bypass_actor,
            } => {
                check.signers = signers;
                check.bypass_actor = bypass_actor;
            }
            Authorization::Insufficient { have, need } => {
                check.signers = self.attestor.valid_signers(&artifact);
                check.reasons.push(format!(
                    "{} of {} required signatures",
                    have, need
                ));
            }
        }

        match self.evidence.latest_for(phase, branch)? {
            None => check.reasons.push("no evidence recorded".to_string()),
            Some(record) => {
                if record.status != PhaseStatus::Passed {
                    check
                        .reasons
                        .push(format!("latest run {} is {}", record.run_id, record.status));
                } else if record.vcs_commit != head_commit {
                    check.reasons.push(format!(
                        "latest evidence is for {}, not HEAD",
                        short(&record.vcs_commit)
                    ));
                }
                if let Some(min) = self.config.settings.min_pass_rate
                    && record.pass_rate < min
                {
                    check.reasons.push(format!(
                        "pass rate {:.2} is below the required {:.2}",
                        record.pass_rate, min
                    ));
                }
            }
        }

        check.ok = check.reasons.is_empty();
        Ok(check)
    }
}

fn short(commit: &str) -> &str {
    &commit[..commit.len().min(12)]
}
