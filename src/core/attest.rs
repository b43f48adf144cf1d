//! Gate artifacts and their signatures.
//!
//! A gate phase that passes leaves an artifact binding the phase, branch,
//! commit and step outcomes under a content hash. Signers append Ed25519
//! signatures over that binding; `verify` counts distinct trusted signers
//! against the required threshold.

use crate::core::error::PhasegateError;
use crate::core::model::{BypassActor, BypassMode, PhaseId, StepResult};
use crate::core::store::{branch_component, write_atomic};
use crate::core::time;
use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const SIGNATURE_DOMAIN: &str = "phasegate-gate-v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateSignature {
    pub signer_id: String,
    /// Hex-encoded signature bytes.
    pub signature: String,
    pub signed_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateArtifact {
    pub phase_id: PhaseId,
    pub branch: String,
    pub commit: String,
    pub content_hash: String,
    #[serde(default)]
    pub signatures: Vec<GateSignature>,
    pub required_signers: usize,
    #[serde(default)]
    pub bypass_actors: Vec<BypassActor>,
    pub created_at: String,
}

impl GateArtifact {
    pub fn new(
        phase_id: PhaseId,
        branch: &str,
        commit: &str,
        results: &[StepResult],
        required_signers: usize,
        bypass_actors: Vec<BypassActor>,
    ) -> Self {
        Self {
            phase_id,
            branch: branch.to_string(),
            commit: commit.to_string(),
            content_hash: content_hash(phase_id, commit, results),
            signatures: Vec::new(),
            required_signers,
            bypass_actors,
            created_at: time::now_epoch_z(),
        }
    }

    /// Bytes every signer signs: every field a verifier relies on.
    /// Timestamps and signatures are excluded so the payload is stable
    /// across signers.
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut bypass: Vec<String> = self
            .bypass_actors
            .iter()
            .map(|a| format!("{}:{}", a.actor_id, a.mode.as_str()))
            .collect();
        bypass.sort();
        format!(
            "{}\nphase={}\nbranch={}\ncommit={}\ncontent={}\nrequired={}\nbypass={}",
            SIGNATURE_DOMAIN,
            self.phase_id,
            self.branch,
            self.commit,
            self.content_hash,
            self.required_signers,
            bypass.join(",")
        )
        .into_bytes()
    }

    pub fn has_signer(&self, signer_id: &str) -> bool {
        self.signatures.iter().any(|s| s.signer_id == signer_id)
    }
}

/// SHA-256 over the canonical JSON of phase, commit and per-step outcomes.
pub fn content_hash(phase_id: PhaseId, commit: &str, results: &[StepResult]) -> String {
    let steps: Vec<serde_json::Value> = results
        .iter()
        .map(|r| serde_json::json!({ "id": r.step_id, "outcome": r.outcome }))
        .collect();
    let canonical = serde_json::json!({
        "phase": phase_id,
        "commit": commit,
        "steps": steps,
    });
    hex::encode(Sha256::digest(canonical.to_string().as_bytes()))
}

pub trait Signer {
    fn signer_id(&self) -> &str;
    fn sign(&self, payload: &[u8]) -> Vec<u8>;
}

pub trait Verifier: Send + Sync {
    /// True iff `signer_id` is trusted and `signature` is valid over `payload`.
    fn verify(&self, signer_id: &str, payload: &[u8], signature: &[u8]) -> bool;
}

pub struct Ed25519Signer {
    id: String,
    key: SigningKey,
}

impl Ed25519Signer {
    pub fn new(id: &str, key: SigningKey) -> Self {
        Self {
            id: id.to_string(),
            key,
        }
    }

    /// `seed_hex` is the 32-byte secret seed, hex-encoded.
    pub fn from_seed_hex(id: &str, seed_hex: &str) -> Result<Self, PhasegateError> {
        let bytes = hex::decode(seed_hex.trim())
            .map_err(|e| PhasegateError::SignatureError(format!("signing key is not hex: {}", e)))?;
        let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            PhasegateError::SignatureError(format!(
                "signing key must be 32 bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self::new(id, SigningKey::from_bytes(&seed)))
    }

    pub fn from_seed_file(id: &str, path: &Path) -> Result<Self, PhasegateError> {
        let raw = fs::read_to_string(path).map_err(|e| {
            PhasegateError::SignatureError(format!("cannot read key {}: {}", path.display(), e))
        })?;
        Self::from_seed_hex(id, &raw)
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.key.verifying_key().as_bytes())
    }
}

impl Signer for Ed25519Signer {
    fn signer_id(&self) -> &str {
        &self.id
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        use ed25519_dalek::Signer as _;
        self.key.sign(payload).to_bytes().to_vec()
    }
}

/// Trusted public keys, read from `trusted_signers.toml` (`id = "hex"`).
#[derive(Debug, Clone, Default)]
pub struct Ed25519Keyring {
    keys: BTreeMap<String, VerifyingKey>,
}

impl Ed25519Keyring {
    pub fn parse(content: &str) -> Result<Self, PhasegateError> {
        let raw: BTreeMap<String, String> = toml::from_str(content)
            .map_err(|e| PhasegateError::ConfigError(format!("trusted_signers.toml: {}", e)))?;
        let mut keyring = Self::default();
        for (id, key_hex) in raw {
            let bytes = hex::decode(key_hex.trim()).map_err(|e| {
                PhasegateError::ConfigError(format!("signer '{}': key is not hex: {}", id, e))
            })?;
            let array: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                PhasegateError::ConfigError(format!("signer '{}': key must be 32 bytes", id))
            })?;
            let key = VerifyingKey::from_bytes(&array).map_err(|e| {
                PhasegateError::ConfigError(format!("signer '{}': invalid key: {}", id, e))
            })?;
            keyring.keys.insert(id, key);
        }
        Ok(keyring)
    }

    /// A missing keyring trusts nobody.
    pub fn load(path: &Path) -> Result<Self, PhasegateError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn insert(&mut self, signer_id: &str, key: VerifyingKey) {
        self.keys.insert(signer_id.to_string(), key);
    }

    pub fn signer_ids(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(|k| k.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl Verifier for Ed25519Keyring {
    fn verify(&self, signer_id: &str, payload: &[u8], signature: &[u8]) -> bool {
        use ed25519_dalek::Verifier as _;
        let Some(key) = self.keys.get(signer_id) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify(payload, &signature).is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Authorization {
    Authorized {
        signers: Vec<String>,
        bypass_actor: Option<String>,
    },
    Insufficient {
        have: usize,
        need: usize,
    },
}

impl Authorization {
    pub fn is_authorized(&self) -> bool {
        matches!(self, Authorization::Authorized { .. })
    }
}

pub struct GateAttestor<'a> {
    verifier: &'a dyn Verifier,
    /// Configured bypass actors. The copy recorded on an artifact is never
    /// consulted.
    bypass_actors: Vec<BypassActor>,
}

impl<'a> GateAttestor<'a> {
    pub fn new(verifier: &'a dyn Verifier) -> Self {
        Self {
            verifier,
            bypass_actors: Vec::new(),
        }
    }

    pub fn with_bypass_actors(mut self, actors: Vec<BypassActor>) -> Self {
        self.bypass_actors = actors;
        self
    }

    fn bypasses(&self, principal: &str) -> bool {
        self.bypass_actors
            .iter()
            .any(|a| a.actor_id == principal && a.mode == BypassMode::Always)
    }

    /// Append `signer`'s signature. A signer may sign an artifact once.
    pub fn sign(
        &self,
        artifact: &GateArtifact,
        signer: &dyn Signer,
    ) -> Result<GateArtifact, PhasegateError> {
        if artifact.has_signer(signer.signer_id()) {
            return Err(PhasegateError::SignatureError(format!(
                "'{}' already signed {} on {}",
                signer.signer_id(),
                artifact.phase_id,
                artifact.branch
            )));
        }
        let signature = signer.sign(&artifact.signing_payload());
        let mut signed = artifact.clone();
        signed.signatures.push(GateSignature {
            signer_id: signer.signer_id().to_string(),
            signature: hex::encode(signature),
            signed_at: time::now_epoch_z(),
        });
        Ok(signed)
    }

    /// Distinct signer ids whose signature verifies, in signing order.
    pub fn valid_signers(&self, artifact: &GateArtifact) -> Vec<String> {
        let payload = artifact.signing_payload();
        let mut seen = FxHashSet::default();
        let mut signers = Vec::new();
        for sig in &artifact.signatures {
            if seen.contains(sig.signer_id.as_str()) {
                continue;
            }
            let Ok(bytes) = hex::decode(&sig.signature) else {
                tracing::warn!(signer = %sig.signer_id, "signature is not hex");
                continue;
            };
            if self.verifier.verify(&sig.signer_id, &payload, &bytes) {
                seen.insert(sig.signer_id.as_str());
                signers.push(sig.signer_id.clone());
            } else {
                tracing::debug!(signer = %sig.signer_id, phase = %artifact.phase_id, "signature did not verify");
            }
        }
        signers
    }

    /// Verify against the artifact's own threshold.
    pub fn verify(&self, artifact: &GateArtifact, principal: Option<&str>) -> Authorization {
        self.verify_with(artifact, principal, artifact.required_signers)
    }

    /// Verify against `need` distinct signers, never fewer than the artifact demands.
    pub fn verify_with(
        &self,
        artifact: &GateArtifact,
        principal: Option<&str>,
        need: usize,
    ) -> Authorization {
        let need = need.max(artifact.required_signers);
        let signers = self.valid_signers(artifact);
        if signers.len() >= need {
            return Authorization::Authorized {
                signers,
                bypass_actor: None,
            };
        }
        if let Some(principal) = principal
            && self.bypasses(principal)
        {
            tracing::info!(principal, phase = %artifact.phase_id, "gate bypassed");
            return Authorization::Authorized {
                signers,
                bypass_actor: Some(principal.to_string()),
            };
        }
        Authorization::Insufficient {
            have: signers.len(),
            need,
        }
    }
}

/// One artifact file per phase per branch under `.phasegate/gates/`.
#[derive(Debug, Clone)]
pub struct GateStore {
    dir: PathBuf,
}

impl GateStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn path(&self, branch: &str, phase: PhaseId) -> PathBuf {
        self.dir
            .join(branch_component(branch))
            .join(format!("{}.json", phase))
    }

    pub fn load(&self, branch: &str, phase: PhaseId) -> Result<Option<GateArtifact>, PhasegateError> {
        let path = self.path(branch, phase);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        let artifact = serde_json::from_str(&raw).map_err(|e| {
            PhasegateError::SignatureError(format!("corrupt gate artifact {}: {}", path.display(), e))
        })?;
        Ok(Some(artifact))
    }

    pub fn save(&self, artifact: &GateArtifact) -> Result<(), PhasegateError> {
        let bytes = serde_json::to_vec_pretty(artifact)?;
        write_atomic(&self.path(&artifact.branch, artifact.phase_id), &bytes)
    }

    /// Store `fresh` unless an artifact with the same content hash exists,
    /// in which case that one (and its signatures) is kept.
    pub fn ensure(&self, fresh: GateArtifact) -> Result<GateArtifact, PhasegateError> {
        match self.load(&fresh.branch, fresh.phase_id) {
            Ok(Some(existing)) if existing.content_hash == fresh.content_hash => {
                return Ok(existing);
            }
            Ok(Some(existing)) => {
                tracing::info!(
                    phase = %fresh.phase_id,
                    dropped_signatures = existing.signatures.len(),
                    "gate content changed; artifact replaced"
                );
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "replacing unreadable gate artifact"),
        }
        self.save(&fresh)?;
        Ok(fresh)
    }

    pub fn list(&self, branch: &str) -> Result<Vec<GateArtifact>, PhasegateError> {
        let mut artifacts = Vec::new();
        for phase in PhaseId::ALL {
            if let Some(artifact) = self.load(branch, phase)? {
                artifacts.push(artifact);
            }
        }
        Ok(artifacts)
    }
}
