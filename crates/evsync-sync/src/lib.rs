//! Configuration, the secondary store normalizer and the reconciliation pass.

pub mod config;
pub mod pipeline;
pub mod secondary;

pub use config::{EmptyCrawlPolicy, SecondaryCredentials, SourceEntry, SourceRegistry, SyncConfig};
pub use pipeline::{
    run_pass_from_env, sync_existing_from_env, ConfiguredSource, PassPhase, PassSummary,
    ReconciliationPass, SecondaryOutcome, SourceReport, SyncError,
};
pub use secondary::{
    InMemoryBackend, PostgrestBackend, SecondaryBackend, SecondarySync, SecondarySyncError,
    SecondarySyncReport, SyncStep,
};

pub const CRATE_NAME: &str = "evsync-sync";
