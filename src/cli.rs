//! CLI struct definitions for the phasegate command-line interface.
//!
//! All clap-derived types live here. Dispatch lives in `lib.rs`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "phasegate",
    version = env!("CARGO_PKG_VERSION"),
    about = "Phase gate validation: incremental cached checks, metric baselines and signed gate attestations for protected branches."
)]
pub(crate) struct Cli {
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Create `.phasegate/` with a starter step declaration
    Init {
        /// Overwrite an existing gates.toml
        #[clap(long)]
        force: bool,
    },
    /// Evaluate phases and record evidence
    Validate(ValidateCli),
    /// Show per-phase status and gate signatures for the current branch
    Status {
        /// Output format: 'text' or 'json'.
        #[clap(long, default_value = "text")]
        format: String,
    },
    /// Show how the change scope resolves
    Scope {
        /// Force a full scan
        #[clap(long)]
        full: bool,
        /// Output format: 'text' or 'json'.
        #[clap(long, default_value = "text")]
        format: String,
    },
    /// Inspect step declarations
    Steps(StepsCli),
    /// Manage the check result cache
    Cache(CacheCli),
    /// Inspect and move metric ceilings
    Baseline(BaselineCli),
    /// Inspect, sign and verify gate artifacts
    Gate(GateCli),
    /// Read the evidence log
    Evidence(EvidenceCli),
    /// Git hook entry points
    Hook(HookCli),
}

#[derive(clap::Args, Debug)]
pub(crate) struct ValidateCli {
    /// Evaluate only this phase (e.g. Phase3, phase3 or 3)
    #[clap(long)]
    pub phase: Option<String>,
    /// Force a full scan instead of diff-based scoping
    #[clap(long)]
    pub full: bool,
    /// Output format: 'text' or 'json'.
    #[clap(long, default_value = "text")]
    pub format: String,
    /// Skip steps not yet evaluated after this many seconds
    #[clap(long)]
    pub deadline_secs: Option<u64>,
    /// Acting principal (defaults to PHASEGATE_ACTOR)
    #[clap(long)]
    pub principal: Option<String>,
}

#[derive(clap::Args, Debug)]
pub(crate) struct StepsCli {
    #[clap(subcommand)]
    pub command: StepsCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum StepsCommand {
    /// Validate gates.toml and report missing tools
    Lint,
    /// List declared steps
    List {
        /// Only this phase
        #[clap(long)]
        phase: Option<String>,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct CacheCli {
    #[clap(subcommand)]
    pub command: CacheCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum CacheCommand {
    /// Entry counts and size
    Stats,
    /// Delete expired and unreadable entries
    Prune,
    /// Delete every entry
    Clear,
    /// Delete entries whose source files match a glob
    Invalidate {
        /// Glob over repo-relative paths (e.g. 'src/**/*.rs')
        pattern: String,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct BaselineCli {
    #[clap(subcommand)]
    pub command: BaselineCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum BaselineCommand {
    /// List metric ceilings
    Show,
    /// Compare a measurement against its ceiling
    Check { metric: String, value: f64 },
    /// Move a ceiling (requires a justification)
    Update {
        metric: String,
        ceiling: f64,
        #[clap(long)]
        justification: String,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct GateCli {
    #[clap(subcommand)]
    pub command: GateCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum GateCommand {
    /// Print the artifact of a gate phase on the current branch
    Show { phase: String },
    /// Sign the artifact of a gate phase
    Sign {
        phase: String,
        /// Signer id as listed in trusted_signers.toml
        #[clap(long)]
        signer: String,
        /// File holding the hex-encoded 32-byte Ed25519 seed
        #[clap(long)]
        key_file: PathBuf,
    },
    /// Check whether a gate phase is authorized
    Verify {
        phase: String,
        /// Acting principal (defaults to PHASEGATE_ACTOR)
        #[clap(long)]
        principal: Option<String>,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct EvidenceCli {
    #[clap(subcommand)]
    pub command: EvidenceCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum EvidenceCommand {
    /// Most recent evidence records
    List {
        #[clap(long, default_value = "20")]
        limit: usize,
        /// Output format: 'text' or 'json'.
        #[clap(long, default_value = "text")]
        format: String,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct HookCli {
    #[clap(subcommand)]
    pub command: HookCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum HookCommand {
    /// Final gate check; exits non-zero to block the push
    PrePush {
        /// Acting principal (defaults to PHASEGATE_ACTOR)
        #[clap(long)]
        principal: Option<String>,
        /// Output format: 'text' or 'json'.
        #[clap(long, default_value = "text")]
        format: String,
    },
    /// Install the git pre-push hook
    Install {
        /// Replace an existing hook
        #[clap(long)]
        force: bool,
    },
}
