//! Gold Reconciler - Bronze to Gold reconciliation
//!
//! Resolves extraction log entries to curated Gold entities while keeping
//! manually verified entities out of reach of automated writes.

pub mod batch;
pub mod extractor;
pub mod guard;
pub mod identity;
pub mod llm;
pub mod locks;
pub mod manual;
pub mod pipeline;
pub mod reconciler;

pub use batch::{
    AmbiguousEntry, AppendFailure, BatchFailure, BatchReconciler, BatchReport, ReconciliationStats,
};
pub use extractor::{
    build_extractor, ExtractionOutput, FieldExtractor, RuleBasedRoleNameExtractor, SourceDocument,
};
pub use guard::{Decision, VerificationGuard};
pub use identity::{derive_entry_key, derive_key, IdentityResolver, KeyRule};
pub use llm::LlmFieldExtractor;
pub use locks::{KeyGuard, KeyLocks};
pub use manual::ManualOverride;
pub use pipeline::ExtractionPipeline;
pub use reconciler::{ReconciliationResult, Reconciler, SkipReason};
