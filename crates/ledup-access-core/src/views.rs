//! Read-only projections over a reconciled [`AccessSnapshot`].
//!
//! Every function takes `now` (unix seconds) explicitly; nothing here reads a clock.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::event::{AccessLevel, Address, AuthEvent, EventKind, EventPayload, OrderKey, RecordId};
use crate::reconcile::{order_events, AccessSnapshot, AccessState, AccessStatus, Registration};

/// Which non-active entries [`shared_with_me`] keeps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct ShareFilter {
    pub include_revoked: bool,
    pub include_expired: bool,
}

impl Default for ShareFilter {
    fn default() -> Self {
        Self { include_revoked: false, include_expired: true }
    }
}

impl ShareFilter {
    #[must_use]
    pub fn active_only() -> Self {
        Self { include_revoked: false, include_expired: false }
    }

    #[must_use]
    pub fn everything() -> Self {
        Self { include_revoked: true, include_expired: true }
    }

    fn keeps(self, status: AccessStatus) -> bool {
        match status {
            AccessStatus::Active => true,
            AccessStatus::Expired => self.include_expired,
            AccessStatus::Revoked => self.include_revoked,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SharedRecord {
    pub record_id: RecordId,
    pub status: AccessStatus,
    pub state: AccessState,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecordConsumer {
    pub subject: Address,
    pub status: AccessStatus,
    pub state: AccessState,
}

/// Records shared with `subject`, newest grant first.
#[must_use]
pub fn shared_with_me(
    snapshot: &AccessSnapshot,
    subject: &Address,
    now: i64,
    filter: ShareFilter,
) -> Vec<SharedRecord> {
    let mut shared = snapshot
        .entries()
        .filter(|(key, _)| key.subject == *subject)
        .filter_map(|(key, state)| {
            let status = state.status(now);
            filter.keeps(status).then(|| SharedRecord {
                record_id: key.record_id.clone(),
                status,
                state: state.clone(),
            })
        })
        .collect::<Vec<_>>();
    shared.sort_by(|lhs, rhs| {
        rhs.state
            .granted_at
            .cmp(&lhs.state.granted_at)
            .then_with(|| lhs.record_id.cmp(&rhs.record_id))
    });
    shared
}

/// Every subject ever granted access to `record_id`, in grant order.
#[must_use]
pub fn consumers_of(snapshot: &AccessSnapshot, record_id: &RecordId, now: i64) -> Vec<RecordConsumer> {
    let mut consumers = snapshot
        .entries_for_record(record_id)
        .map(|(key, state)| RecordConsumer {
            subject: key.subject,
            status: state.status(now),
            state: state.clone(),
        })
        .collect::<Vec<_>>();
    consumers.sort_by(|lhs, rhs| {
        lhs.state.granted_at.cmp(&rhs.state.granted_at).then_with(|| lhs.subject.cmp(&rhs.subject))
    });
    consumers
}

#[must_use]
pub fn active_share_count(snapshot: &AccessSnapshot, record_id: &RecordId, now: i64) -> usize {
    snapshot.entries_for_record(record_id).filter(|(_, state)| state.is_active(now)).count()
}

/// Registrations made by `producer`, in registration order.
#[must_use]
pub fn records_of(snapshot: &AccessSnapshot, producer: &Address) -> Vec<Registration> {
    let mut records = snapshot
        .registrations()
        .filter(|registration| registration.producer == *producer)
        .cloned()
        .collect::<Vec<_>>();
    records.sort_by(|lhs, rhs| lhs.registered_at.cmp(&rhs.registered_at));
    records
}

/// True only for an active entry whose level is at least `required`.
#[must_use]
pub fn check_access(
    snapshot: &AccessSnapshot,
    record_id: &RecordId,
    subject: &Address,
    required: AccessLevel,
    now: i64,
) -> bool {
    snapshot
        .get(record_id, subject)
        .is_some_and(|state| state.is_active(now) && state.access_level >= required)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum EstimateBasis {
    BlockTimestamp,
    Unavailable,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct WallClockEstimate {
    #[serde(with = "time::serde::rfc3339::option")]
    pub at: Option<OffsetDateTime>,
    pub basis: EstimateBasis,
}

impl WallClockEstimate {
    fn from_block_timestamp(block_timestamp: Option<i64>) -> Self {
        match block_timestamp.and_then(|seconds| OffsetDateTime::from_unix_timestamp(seconds).ok()) {
            Some(at) => Self { at: Some(at), basis: EstimateBasis::BlockTimestamp },
            None => Self { at: None, basis: EstimateBasis::Unavailable },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HistoryEntry {
    pub subject: Address,
    pub order_key: OrderKey,
    pub kind: EventKind,
    pub access_level: Option<AccessLevel>,
    pub expiration: Option<i64>,
    pub revoker: Option<Address>,
    pub actor_did: Option<String>,
    pub wall_clock: WallClockEstimate,
}

/// Grant, revoke, and trigger events for one record in ledger order.
#[must_use]
pub fn access_history(events: &[AuthEvent], record_id: &RecordId) -> Vec<HistoryEntry> {
    let relevant = events
        .iter()
        .filter(|event| &event.record_id == record_id && event.kind() != EventKind::Registered)
        .cloned();

    order_events(relevant)
        .into_iter()
        .map(|event| {
            let kind = event.kind();
            let (access_level, expiration, revoker) = match event.payload {
                EventPayload::Granted { access_level, expiration } => {
                    (Some(access_level), Some(expiration), None)
                }
                EventPayload::Revoked { revoker } => (None, None, Some(revoker)),
                EventPayload::Registered | EventPayload::Triggered => (None, None, None),
            };
            HistoryEntry {
                subject: event.subject,
                order_key: event.order_key,
                kind,
                access_level,
                expiration,
                revoker,
                actor_did: event.actor_did,
                wall_clock: WallClockEstimate::from_block_timestamp(event.block_timestamp),
            }
        })
        .collect()
}
