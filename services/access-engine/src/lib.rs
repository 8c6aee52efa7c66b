//! Lornu AI Access Engine
//!
//! Bootstraps three access tiers and one shared service identity across the
//! source-control host, code-quality server, artifact registry and build
//! server, persisting every generated credential in a Vault-compatible
//! secret store.

pub mod adapters;
pub mod config;
pub mod error;
pub mod readiness;
pub mod reconciler;
pub mod secrets;
pub mod seeder;
pub mod types;

pub use config::AccessConfig;
pub use error::{ReconcileError, StepError, StoreError};
pub use readiness::{Readiness, ReadinessProber};
pub use reconciler::{run_reconciliation, PlatformTarget, Reconciler};
pub use secrets::{MemoryBackend, SecretStore, VaultClient};
pub use seeder::{SeedReport, Seeder};
pub use types::{AccessTier, PlatformKind, PlatformStatus, ReconciliationResult, RunReport};
