//! Access-state reconciliation for the LED-UP health-data registry.
//!
//! Raw contract logs are normalized into [`AuthEvent`]s, folded in order-key
//! order into an [`AccessSnapshot`], and projected into read-only views.

mod event;
mod reconcile;
mod source;
mod views;

pub use event::{
    normalize, normalize_batch, AccessLevel, Address, AuthEvent, EventKind, EventPayload,
    OrderKey, RawLog, RecordId,
};
pub use reconcile::{
    merge_authoritative, reconcile, AccessKey, AccessReader, AccessSnapshot, AccessState,
    AccessStatus, AuthoritativeRead, Divergence, FoldPath, IngestOutcome, MergePolicy,
    MergeReport, Reconciler, Registration, StateSource,
};
pub use source::{
    BlockRange, EventSource, InMemoryLedger, Subscription, DEFAULT_SUBSCRIPTION_CAPACITY,
};
pub use views::{
    access_history, active_share_count, check_access, consumers_of, records_of, shared_with_me,
    EstimateBasis, HistoryEntry, RecordConsumer, ShareFilter, SharedRecord, WallClockEstimate,
};

/// Ruleset identifier stamped into every derived view.
pub const FOLD_RULESET_VERSION: &str = "access-fold.v1";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("malformed {event} log at {order_key}: {reason}")]
pub struct MalformedEventError {
    pub event: String,
    pub order_key: OrderKey,
    pub reason: String,
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AccessError {
    #[error(transparent)]
    Malformed(#[from] MalformedEventError),
    #[error("invalid address `{0}`: expected 0x followed by 40 hex digits")]
    InvalidAddress(String),
    #[error("record id MUST be non-empty")]
    InvalidRecordId,
    #[error("invalid block range: from_block {from_block} is after to_block {to_block}")]
    InvalidBlockRange { from_block: u64, to_block: u64 },
    #[error("event source error: {0}")]
    Source(String),
}
