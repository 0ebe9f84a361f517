use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::event::{AccessLevel, Address, AuthEvent, EventPayload, OrderKey, RecordId};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AccessKey {
    pub record_id: RecordId,
    pub subject: Address,
}

impl AccessKey {
    #[must_use]
    pub fn new(record_id: RecordId, subject: Address) -> Self {
        Self { record_id, subject }
    }

    fn record_range(record_id: &RecordId) -> RangeInclusive<Self> {
        Self::new(record_id.clone(), Address::ZERO)..=Self::new(record_id.clone(), Address::MAX)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StateSource {
    Events,
    Authoritative,
}

/// Display status of an access entry. First match wins: revoked, then expired, then active.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AccessStatus {
    Active,
    Expired,
    Revoked,
}

impl AccessStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AccessState {
    pub access_level: AccessLevel,
    /// Absolute unix seconds.
    pub expiration: i64,
    pub is_revoked: bool,
    pub granted_at: OrderKey,
    pub revoked_at: Option<OrderKey>,
    pub revoked_by: Option<Address>,
    pub actor_did: Option<String>,
    pub source: StateSource,
}

impl AccessState {
    /// Expiry is evaluated against the caller's clock on every query.
    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        self.expiration <= now
    }

    #[must_use]
    pub fn status(&self, now: i64) -> AccessStatus {
        if self.is_revoked {
            AccessStatus::Revoked
        } else if self.is_expired(now) {
            AccessStatus::Expired
        } else {
            AccessStatus::Active
        }
    }

    #[must_use]
    pub fn is_active(&self, now: i64) -> bool {
        self.status(now) == AccessStatus::Active
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Registration {
    pub record_id: RecordId,
    pub producer: Address,
    pub producer_did: Option<String>,
    pub registered_at: OrderKey,
}

/// Result of folding an event log.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct AccessSnapshot {
    entries: BTreeMap<AccessKey, AccessState>,
    registrations: BTreeMap<RecordId, Registration>,
}

impl AccessSnapshot {
    #[must_use]
    pub fn get(&self, record_id: &RecordId, subject: &Address) -> Option<&AccessState> {
        self.entries.get(&AccessKey::new(record_id.clone(), *subject))
    }

    pub fn entries(&self) -> impl Iterator<Item = (&AccessKey, &AccessState)> {
        self.entries.iter()
    }

    /// Entries for one record, ordered by subject address.
    pub fn entries_for_record<'a>(
        &'a self,
        record_id: &RecordId,
    ) -> impl Iterator<Item = (&'a AccessKey, &'a AccessState)> {
        self.entries.range(AccessKey::record_range(record_id))
    }

    #[must_use]
    pub fn registration(&self, record_id: &RecordId) -> Option<&Registration> {
        self.registrations.get(record_id)
    }

    pub fn registrations(&self) -> impl Iterator<Item = &Registration> {
        self.registrations.values()
    }

    /// Number of access entries. Registrations are counted separately.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when there are no access entries, even if records are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn registration_count(&self) -> usize {
        self.registrations.len()
    }

    fn apply(&mut self, event: &AuthEvent) {
        match &event.payload {
            EventPayload::Registered => match self.registrations.entry(event.record_id.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(Registration {
                        record_id: event.record_id.clone(),
                        producer: event.subject,
                        producer_did: event.actor_did.clone(),
                        registered_at: event.order_key,
                    });
                }
                Entry::Occupied(existing) => {
                    tracing::debug!(
                        record_id = %event.record_id,
                        first = %existing.get().registered_at,
                        duplicate = %event.order_key,
                        "ignoring repeated registration of record id"
                    );
                }
            },
            EventPayload::Granted { access_level, expiration } => {
                let key = AccessKey::new(event.record_id.clone(), event.subject);
                let granted = AccessState {
                    access_level: *access_level,
                    expiration: *expiration,
                    is_revoked: false,
                    granted_at: event.order_key,
                    revoked_at: None,
                    revoked_by: None,
                    actor_did: event.actor_did.clone(),
                    source: StateSource::Events,
                };
                if let Some(previous) = self.entries.insert(key, granted) {
                    if previous.is_revoked {
                        tracing::debug!(
                            record_id = %event.record_id,
                            subject = %event.subject,
                            order_key = %event.order_key,
                            "re-grant clears earlier revocation"
                        );
                    }
                }
            }
            EventPayload::Revoked { revoker } => {
                let key = AccessKey::new(event.record_id.clone(), event.subject);
                match self.entries.get_mut(&key) {
                    Some(state) if !state.is_revoked && state.granted_at < event.order_key => {
                        state.is_revoked = true;
                        state.revoked_at = Some(event.order_key);
                        state.revoked_by = Some(*revoker);
                    }
                    Some(_) => {
                        tracing::debug!(
                            record_id = %event.record_id,
                            subject = %event.subject,
                            order_key = %event.order_key,
                            "revoke has no active grant to apply to"
                        );
                    }
                    None => {
                        tracing::debug!(
                            record_id = %event.record_id,
                            subject = %event.subject,
                            order_key = %event.order_key,
                            "ignoring revoke that precedes any grant"
                        );
                    }
                }
            }
            EventPayload::Triggered => {}
        }
    }
}

/// Sort by order key (ties broken by the remaining event fields) and drop exact duplicates.
pub(crate) fn order_events<I>(events: I) -> Vec<AuthEvent>
where
    I: IntoIterator<Item = AuthEvent>,
{
    let mut ordered = events.into_iter().collect::<Vec<_>>();
    ordered.sort();

    let before = ordered.len();
    ordered.dedup();
    if ordered.len() != before {
        tracing::debug!(duplicates = before - ordered.len(), "collapsed identical events");
    }

    for pair in ordered.windows(2) {
        if pair[0].order_key == pair[1].order_key {
            tracing::debug!(
                order_key = %pair[0].order_key,
                "distinct events share one order key; ordering by event content"
            );
        }
    }

    ordered
}

/// Fold events, in any arrival order, into an access snapshot.
#[must_use]
pub fn reconcile<I>(events: I) -> AccessSnapshot
where
    I: IntoIterator<Item = AuthEvent>,
{
    let mut snapshot = AccessSnapshot::default();
    for event in &order_events(events) {
        snapshot.apply(event);
    }
    snapshot
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FoldPath {
    /// Every event in the batch had already been seen.
    Unchanged,
    /// The batch extended the log past its last key and was applied in place.
    Appended,
    /// The batch reached behind the last applied key; state was refolded.
    Refolded,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IngestOutcome {
    pub path: FoldPath,
    pub accepted: usize,
    pub duplicates: usize,
}

/// Long-lived fold that accepts batches as they are observed.
///
/// Ends in the same state as [`reconcile`] over every event ingested so far.
#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    events: Vec<AuthEvent>,
    snapshot: AccessSnapshot,
}

impl Reconciler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_events<I>(events: I) -> Self
    where
        I: IntoIterator<Item = AuthEvent>,
    {
        let mut reconciler = Self::new();
        reconciler.ingest(events);
        reconciler
    }

    pub fn ingest<I>(&mut self, batch: I) -> IngestOutcome
    where
        I: IntoIterator<Item = AuthEvent>,
    {
        let mut received = 0_usize;
        let fresh = order_events(batch.into_iter().inspect(|_| received += 1))
            .into_iter()
            .filter(|event| self.events.binary_search(event).is_err())
            .collect::<Vec<_>>();
        let accepted = fresh.len();
        let duplicates = received - accepted;

        let Some(first) = fresh.first() else {
            return IngestOutcome { path: FoldPath::Unchanged, accepted, duplicates };
        };

        let appendable = self.events.last().map_or(true, |last| first > last);
        if appendable {
            for event in &fresh {
                self.snapshot.apply(event);
            }
            self.events.extend(fresh);
            return IngestOutcome { path: FoldPath::Appended, accepted, duplicates };
        }

        tracing::debug!(
            late_key = %first.order_key,
            accepted,
            "batch reaches behind applied events; refolding"
        );
        self.events.extend(fresh);
        self.events.sort();
        let mut snapshot = AccessSnapshot::default();
        for event in &self.events {
            snapshot.apply(event);
        }
        self.snapshot = snapshot;
        IngestOutcome { path: FoldPath::Refolded, accepted, duplicates }
    }

    #[must_use]
    pub fn snapshot(&self) -> &AccessSnapshot {
        &self.snapshot
    }

    /// Ingested events in fold order.
    #[must_use]
    pub fn events(&self) -> &[AuthEvent] {
        &self.events
    }

    #[must_use]
    pub fn into_parts(self) -> (Vec<AuthEvent>, AccessSnapshot) {
        (self.events, self.snapshot)
    }
}

/// Point-in-time contract read for one (record, subject) pair.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AuthoritativeRead {
    pub has_access: bool,
    pub expiration: i64,
    pub access_level: AccessLevel,
    pub is_revoked: bool,
    #[serde(default)]
    pub observed_at_block: Option<u64>,
}

impl AuthoritativeRead {
    fn derived_has_access(&self, now: i64) -> bool {
        !self.is_revoked && self.expiration > now && self.access_level != AccessLevel::None
    }
}

pub trait AccessReader {
    type Error;

    /// Read the contract's current view of one pair, if the reader has one.
    ///
    /// # Errors
    /// Returns the reader's error when the read cannot be performed.
    fn read_access(
        &self,
        record_id: &RecordId,
        subject: &Address,
    ) -> Result<Option<AuthoritativeRead>, Self::Error>;
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    #[default]
    AuthoritativeWins,
    EventsOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Divergence {
    pub record_id: RecordId,
    pub subject: Address,
    pub reported_has_access: bool,
    pub derived_has_access: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct MergeReport {
    pub consulted: usize,
    pub overridden: usize,
    pub divergences: Vec<Divergence>,
}

/// Overlay authoritative reads onto event-derived entries.
///
/// Only pairs already present in the snapshot are read; a read never creates an
/// entry. Under [`MergePolicy::AuthoritativeWins`] a returned read replaces level,
/// expiration, and revocation, and marks the entry as authoritative.
///
/// # Errors
/// Propagates the first reader error; entries merged before it keep their overrides.
pub fn merge_authoritative<R>(
    snapshot: &mut AccessSnapshot,
    reader: &R,
    policy: MergePolicy,
    now: i64,
) -> Result<MergeReport, R::Error>
where
    R: AccessReader,
{
    let mut report = MergeReport::default();
    if policy == MergePolicy::EventsOnly {
        return Ok(report);
    }

    for (key, state) in &mut snapshot.entries {
        let Some(read) = reader.read_access(&key.record_id, &key.subject)? else {
            continue;
        };
        report.consulted += 1;

        let derived_has_access = read.derived_has_access(now);
        if derived_has_access != read.has_access {
            tracing::debug!(
                record_id = %key.record_id,
                subject = %key.subject,
                reported = read.has_access,
                derived = derived_has_access,
                "authoritative read disagrees with its own fields"
            );
            report.divergences.push(Divergence {
                record_id: key.record_id.clone(),
                subject: key.subject,
                reported_has_access: read.has_access,
                derived_has_access,
            });
        }

        let changed = state.access_level != read.access_level
            || state.expiration != read.expiration
            || state.is_revoked != read.is_revoked;
        if changed {
            report.overridden += 1;
            tracing::debug!(
                record_id = %key.record_id,
                subject = %key.subject,
                "authoritative read overrides event-derived state"
            );
        }

        state.access_level = read.access_level;
        state.expiration = read.expiration;
        if read.is_revoked && !state.is_revoked {
            state.is_revoked = true;
            state.revoked_at = None;
            state.revoked_by = None;
        } else if !read.is_revoked && state.is_revoked {
            state.is_revoked = false;
            state.revoked_at = None;
            state.revoked_by = None;
        }
        state.source = StateSource::Authoritative;
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::convert::Infallible;

    use proptest::prelude::*;

    use super::*;

    fn address(byte: u8) -> Address {
        Address::from_bytes([byte; 20])
    }

    fn record(value: &str) -> RecordId {
        match RecordId::new(value) {
            Ok(id) => id,
            Err(err) => panic!("invalid fixture record id {value}: {err}"),
        }
    }

    fn event(
        record_id: &str,
        subject: Address,
        order_key: (u64, u32),
        payload: EventPayload,
    ) -> AuthEvent {
        AuthEvent {
            order_key: OrderKey::new(order_key.0, order_key.1),
            payload,
            record_id: record(record_id),
            subject,
            actor_did: None,
            block_timestamp: None,
        }
    }

    fn grant(
        record_id: &str,
        subject: Address,
        order_key: (u64, u32),
        access_level: AccessLevel,
        expiration: i64,
    ) -> AuthEvent {
        event(record_id, subject, order_key, EventPayload::Granted { access_level, expiration })
    }

    fn revoke(record_id: &str, subject: Address, order_key: (u64, u32), revoker: Address) -> AuthEvent {
        event(record_id, subject, order_key, EventPayload::Revoked { revoker })
    }

    fn state_of<'a>(snapshot: &'a AccessSnapshot, record_id: &str, subject: Address) -> &'a AccessState {
        match snapshot.get(&record(record_id), &subject) {
            Some(state) => state,
            None => panic!("expected access state for {record_id}/{subject}"),
        }
    }

    fn seeded_permutation(events: &[AuthEvent], seed: u64) -> Vec<AuthEvent> {
        fn splitmix64(mut value: u64) -> u64 {
            value = value.wrapping_add(0x9E37_79B9_7F4A_7C15);
            value = (value ^ (value >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
            value = (value ^ (value >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
            value ^ (value >> 31)
        }

        let mut keyed = events
            .iter()
            .cloned()
            .enumerate()
            .map(|(index, event)| {
                let index_u64 = u64::try_from(index).unwrap_or(u64::MAX);
                (splitmix64(seed ^ index_u64), event)
            })
            .collect::<Vec<_>>();
        keyed.sort_by_key(|(key, _)| *key);
        keyed.into_iter().map(|(_, event)| event).collect()
    }

    struct MapReader(HashMap<(RecordId, Address), AuthoritativeRead>);

    impl AccessReader for MapReader {
        type Error = Infallible;

        fn read_access(
            &self,
            record_id: &RecordId,
            subject: &Address,
        ) -> Result<Option<AuthoritativeRead>, Self::Error> {
            Ok(self.0.get(&(record_id.clone(), *subject)).cloned())
        }
    }

    #[test]
    fn regrant_clears_revocation_and_takes_new_terms() {
        let subject = address(0xaa);
        let snapshot = reconcile([
            grant("r1", subject, (1, 0), AccessLevel::Read, 1_000),
            revoke("r1", subject, (2, 0), address(0x01)),
            grant("r1", subject, (3, 0), AccessLevel::Write, 2_000),
        ]);

        let state = state_of(&snapshot, "r1", subject);
        assert!(!state.is_revoked);
        assert_eq!(state.access_level, AccessLevel::Write);
        assert_eq!(state.expiration, 2_000);
        assert_eq!(state.granted_at, OrderKey::new(3, 0));
        assert_eq!(state.revoked_at, None);
        assert_eq!(state.revoked_by, None);
    }

    #[test]
    fn orphan_revoke_creates_no_entry() {
        let snapshot = reconcile([revoke("r1", address(0xaa), (5, 0), address(0x01))]);
        assert!(snapshot.is_empty());
    }

    #[test]
    fn orphan_revoke_leaves_unrelated_grant_untouched() {
        let granted = address(0xbb);
        let snapshot = reconcile([
            grant("r1", granted, (4, 0), AccessLevel::Read, 1_000),
            revoke("r1", address(0xaa), (5, 0), address(0x01)),
        ]);

        assert_eq!(snapshot.len(), 1);
        assert!(!state_of(&snapshot, "r1", granted).is_revoked);
    }

    #[test]
    fn revoke_before_grant_in_ledger_order_is_ignored_even_if_delivered_late() {
        let subject = address(0xaa);
        let snapshot = reconcile([
            grant("r1", subject, (9, 0), AccessLevel::Read, 1_000),
            revoke("r1", subject, (3, 0), address(0x01)),
        ]);
        assert!(!state_of(&snapshot, "r1", subject).is_revoked);
    }

    #[test]
    fn second_revoke_keeps_first_revocation() {
        let subject = address(0xaa);
        let snapshot = reconcile([
            grant("r1", subject, (1, 0), AccessLevel::Read, 1_000),
            revoke("r1", subject, (2, 0), address(0x01)),
            revoke("r1", subject, (3, 0), address(0x02)),
        ]);

        let state = state_of(&snapshot, "r1", subject);
        assert_eq!(state.revoked_at, Some(OrderKey::new(2, 0)));
        assert_eq!(state.revoked_by, Some(address(0x01)));
    }

    #[test]
    fn revoke_sharing_grant_order_key_does_not_apply() {
        let subject = address(0xaa);
        let snapshot = reconcile([
            revoke("r1", subject, (7, 0), address(0x01)),
            grant("r1", subject, (7, 0), AccessLevel::Read, 1_000),
        ]);
        assert!(!state_of(&snapshot, "r1", subject).is_revoked);
    }

    #[test]
    fn triggered_and_registered_events_do_not_alter_access_state() {
        let subject = address(0xaa);
        let producer = address(0x01);
        let snapshot = reconcile([
            event("r1", producer, (1, 0), EventPayload::Registered),
            grant("r1", subject, (2, 0), AccessLevel::Read, 1_000),
            event("r1", subject, (3, 0), EventPayload::Triggered),
        ]);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(state_of(&snapshot, "r1", subject).granted_at, OrderKey::new(2, 0));
        let registration = match snapshot.registration(&record("r1")) {
            Some(registration) => registration,
            None => panic!("registration should be tracked"),
        };
        assert_eq!(registration.producer, producer);
    }

    #[test]
    fn registration_only_snapshot_has_no_entries() {
        let snapshot = reconcile([event("r1", address(0x01), (2, 0), EventPayload::Registered)]);
        assert_eq!(snapshot.len(), 0);
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.registration_count(), 1);
    }

    #[test]
    fn first_registration_wins() {
        let snapshot = reconcile([
            event("r1", address(0x02), (8, 0), EventPayload::Registered),
            event("r1", address(0x01), (2, 0), EventPayload::Registered),
        ]);
        let registration = match snapshot.registration(&record("r1")) {
            Some(registration) => registration,
            None => panic!("registration should be tracked"),
        };
        assert_eq!(registration.producer, address(0x01));
        assert_eq!(registration.registered_at, OrderKey::new(2, 0));
    }

    #[test]
    fn status_precedence_prefers_revoked_over_expired() {
        let subject = address(0xaa);
        let snapshot = reconcile([
            grant("r1", subject, (1, 0), AccessLevel::Read, 100),
            revoke("r1", subject, (2, 0), address(0x01)),
        ]);
        let state = state_of(&snapshot, "r1", subject);
        assert!(state.is_expired(500));
        assert_eq!(state.status(500), AccessStatus::Revoked);
    }

    #[test]
    fn expiry_boundary_is_inclusive() {
        let subject = address(0xaa);
        let snapshot = reconcile([grant("r1", subject, (1, 0), AccessLevel::Read, 100)]);
        let state = state_of(&snapshot, "r1", subject);
        assert_eq!(state.status(99), AccessStatus::Active);
        assert_eq!(state.status(100), AccessStatus::Expired);
    }

    #[test]
    fn identical_duplicates_collapse() {
        let subject = address(0xaa);
        let once = reconcile([grant("r1", subject, (1, 0), AccessLevel::Read, 100)]);
        let twice = reconcile([
            grant("r1", subject, (1, 0), AccessLevel::Read, 100),
            grant("r1", subject, (1, 0), AccessLevel::Read, 100),
        ]);
        assert_eq!(once, twice);
    }

    #[test]
    fn conflicting_grants_at_one_order_key_resolve_deterministically() {
        let subject = address(0xaa);
        let lhs = grant("r1", subject, (1, 0), AccessLevel::Read, 100);
        let rhs = grant("r1", subject, (1, 0), AccessLevel::Write, 50);
        let forward = reconcile([lhs.clone(), rhs.clone()]);
        let backward = reconcile([rhs, lhs]);
        assert_eq!(forward, backward);
        assert_eq!(state_of(&forward, "r1", subject).access_level, AccessLevel::Write);
    }

    #[test]
    fn reconciler_appends_in_order_and_refolds_late_batches() {
        let subject = address(0xaa);
        let mut reconciler = Reconciler::new();

        let first = reconciler.ingest([grant("r1", subject, (10, 0), AccessLevel::Read, 1_000)]);
        assert_eq!(first.path, FoldPath::Appended);

        let late = reconciler.ingest([
            grant("r1", subject, (3, 0), AccessLevel::Write, 500),
            revoke("r1", subject, (5, 0), address(0x01)),
        ]);
        assert_eq!(late.path, FoldPath::Refolded);
        assert_eq!(late.accepted, 2);

        let repeat = reconciler.ingest([grant("r1", subject, (10, 0), AccessLevel::Read, 1_000)]);
        assert_eq!(repeat.path, FoldPath::Unchanged);
        assert_eq!(repeat.duplicates, 1);

        let state = state_of(reconciler.snapshot(), "r1", subject);
        assert!(!state.is_revoked);
        assert_eq!(state.granted_at, OrderKey::new(10, 0));
        assert_eq!(reconciler.events().len(), 3);
    }

    #[test]
    fn reconciler_handles_orphan_revoke_completed_by_earlier_grant() {
        let subject = address(0xaa);
        let mut reconciler = Reconciler::new();
        reconciler.ingest([revoke("r1", subject, (5, 0), address(0x01))]);
        assert!(reconciler.snapshot().is_empty());

        reconciler.ingest([grant("r1", subject, (3, 0), AccessLevel::Read, 1_000)]);
        assert!(state_of(reconciler.snapshot(), "r1", subject).is_revoked);
    }

    #[test]
    fn authoritative_read_overrides_event_state() {
        let subject = address(0xaa);
        let untouched = address(0xbb);
        let mut snapshot = reconcile([
            grant("r1", subject, (1, 0), AccessLevel::Read, 1_000),
            grant("r1", untouched, (2, 0), AccessLevel::Read, 1_000),
        ]);

        let reader = MapReader(HashMap::from([(
            (record("r1"), subject),
            AuthoritativeRead {
                has_access: false,
                expiration: 1_000,
                access_level: AccessLevel::Read,
                is_revoked: true,
                observed_at_block: Some(20),
            },
        )]));

        let report = match merge_authoritative(&mut snapshot, &reader, MergePolicy::default(), 500)
        {
            Ok(report) => report,
            Err(never) => match never {},
        };
        assert_eq!(report.consulted, 1);
        assert_eq!(report.overridden, 1);
        assert!(report.divergences.is_empty());

        let state = state_of(&snapshot, "r1", subject);
        assert!(state.is_revoked);
        assert_eq!(state.source, StateSource::Authoritative);
        assert_eq!(state_of(&snapshot, "r1", untouched).source, StateSource::Events);
    }

    #[test]
    fn authoritative_merge_reports_divergent_reads_and_respects_events_only() {
        let subject = address(0xaa);
        let events = [grant("r1", subject, (1, 0), AccessLevel::Read, 1_000)];
        let reader = MapReader(HashMap::from([(
            (record("r1"), subject),
            AuthoritativeRead {
                has_access: true,
                expiration: 100,
                access_level: AccessLevel::Read,
                is_revoked: false,
                observed_at_block: None,
            },
        )]));

        let mut merged = reconcile(events.clone());
        let report = match merge_authoritative(&mut merged, &reader, MergePolicy::default(), 500) {
            Ok(report) => report,
            Err(never) => match never {},
        };
        assert_eq!(report.divergences.len(), 1);
        assert_eq!(state_of(&merged, "r1", subject).expiration, 100);

        let mut events_only = reconcile(events.clone());
        let report =
            match merge_authoritative(&mut events_only, &reader, MergePolicy::EventsOnly, 500) {
                Ok(report) => report,
                Err(never) => match never {},
            };
        assert_eq!(report, MergeReport::default());
        assert_eq!(events_only, reconcile(events));
    }

    fn arb_events() -> impl Strategy<Value = Vec<AuthEvent>> {
        let step = (0_u8..4, 0_u8..3, 0_u8..3, 0_u8..3, 0_i64..4_000);
        prop::collection::vec(step, 0..48).prop_map(|steps| {
            steps
                .into_iter()
                .enumerate()
                .map(|(index, (kind, record_index, subject_index, level, expiration))| {
                    let index = u64::try_from(index).unwrap_or(u64::MAX);
                    let order_key = (index / 3, u32::try_from(index % 3).unwrap_or(0));
                    let record_id = format!("r{record_index}");
                    let subject = address(0xa0 + subject_index);
                    let payload = match kind {
                        0 => EventPayload::Registered,
                        1 => EventPayload::Granted {
                            access_level: AccessLevel::from_ordinal(u64::from(level))
                                .unwrap_or(AccessLevel::Read),
                            expiration,
                        },
                        2 => EventPayload::Revoked { revoker: address(0x01) },
                        _ => EventPayload::Triggered,
                    };
                    event(&record_id, subject, order_key, payload)
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn property_fold_is_independent_of_arrival_order(
            events in arb_events(),
            seed in any::<u64>(),
        ) {
            let expected = reconcile(events.clone());
            let shuffled = reconcile(seeded_permutation(&events, seed));
            prop_assert_eq!(expected, shuffled);
        }
    }

    proptest! {
        #[test]
        fn property_incremental_fold_matches_full_fold(
            events in arb_events(),
            seed in any::<u64>(),
            split in any::<prop::sample::Index>(),
        ) {
            let shuffled = seeded_permutation(&events, seed);
            let cut = if shuffled.is_empty() { 0 } else { split.index(shuffled.len() + 1) };
            let (head, tail) = shuffled.split_at(cut);

            let mut reconciler = Reconciler::new();
            reconciler.ingest(head.to_vec());
            reconciler.ingest(tail.to_vec());

            prop_assert_eq!(reconciler.snapshot(), &reconcile(events));
        }
    }
}
