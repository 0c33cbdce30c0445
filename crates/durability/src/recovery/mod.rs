//! Recovery module
//!
//! - `config`: recovery parameters (RecoveryConfig)
//! - `session`: per-session reconstruction and conflict policy
//! - `manager`: directory replay (WalRecoveryManager)

pub mod config;
pub mod manager;
pub mod session;

pub use config::{RecoveryConfig, RecoveryConfigError};
pub use manager::{
    RecoveryError, RecoveryReport, RecoveryStats, RecoveryStatus, WalRecoveryManager,
};
pub use session::{
    merge_revisions, ApplyOutcome, ConflictPolicy, ReconstructStats, RecoveredSession,
    SessionReconstructor,
};
