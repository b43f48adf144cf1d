use std::env;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PhasegateError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Environment variable error: {0}")]
    EnvVarError(#[from] env::VarError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Transition blocked: {0}")]
    TransitionBlocked(String),
    #[error("Version control error: {0}")]
    VcsError(String),
    #[error("Signature error: {0}")]
    SignatureError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

impl PhasegateError {
    /// Process exit code for a run aborted by this error.
    ///
    /// Configuration problems exit with 2 so automation can tell "the gate
    /// could not run" apart from "the gate ran and blocked".
    pub fn exit_code(&self) -> i32 {
        match self {
            PhasegateError::ConfigError(_) | PhasegateError::Toml(_) => 2,
            _ => 1,
        }
    }
}
