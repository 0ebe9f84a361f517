use std::cell::RefCell;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use ledup_access_core::{
    access_history, active_share_count, check_access, consumers_of, merge_authoritative,
    normalize_batch, records_of, shared_with_me, AccessLevel, AccessReader, AccessSnapshot,
    AccessStatus,
    Address, AuthEvent, AuthoritativeRead, BlockRange, EventKind, EventSource, HistoryEntry,
    MergePolicy, MergeReport, RawLog, RecordConsumer, RecordId, Reconciler, Registration,
    ShareFilter, SharedRecord, FOLD_RULESET_VERSION,
};
use ledup_access_store_sqlite::{AppendSummary, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestLogsRequest {
    pub contract: Address,
    pub logs: Vec<RawLog>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestLogsResult {
    pub contract: Address,
    pub normalized: usize,
    pub append: AppendSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncRequest {
    pub contract: Address,
    /// Defaults to the block after the stored checkpoint.
    #[serde(default)]
    pub from_block: Option<u64>,
    pub to_block: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncResult {
    pub contract: Address,
    pub range: Option<BlockRange>,
    pub fetched: usize,
    pub append: AppendSummary,
    pub checkpoint: Option<u64>,
    /// False when the window started past checkpoint + 1; the gap stays unsynced.
    pub checkpoint_advanced: bool,
    pub up_to_date: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordReadRequest {
    pub contract: Address,
    pub record_id: RecordId,
    pub subject: Address,
    pub read: AuthoritativeRead,
}

/// Which archive to fold and at what instant to evaluate expiry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ViewScope {
    pub contract: Address,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub as_of: Option<OffsetDateTime>,
    #[serde(default)]
    pub merge_policy: MergePolicy,
}

impl ViewScope {
    #[must_use]
    pub fn new(contract: Address) -> Self {
        Self { contract, as_of: None, merge_policy: MergePolicy::default() }
    }

    #[must_use]
    pub fn at(mut self, as_of: OffsetDateTime) -> Self {
        self.as_of = Some(as_of);
        self
    }

    #[must_use]
    pub fn with_policy(mut self, merge_policy: MergePolicy) -> Self {
        self.merge_policy = merge_policy;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SharedWithMeRequest {
    #[serde(flatten)]
    pub scope: ViewScope,
    pub subject: Address,
    #[serde(default)]
    pub filter: ShareFilter,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordViewRequest {
    #[serde(flatten)]
    pub scope: ViewScope,
    pub record_id: RecordId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordsOfRequest {
    #[serde(flatten)]
    pub scope: ViewScope,
    pub producer: Address,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckAccessRequest {
    #[serde(flatten)]
    pub scope: ViewScope,
    pub record_id: RecordId,
    pub subject: Address,
    #[serde(default = "default_required_level")]
    pub required: AccessLevel,
}

fn default_required_level() -> AccessLevel {
    AccessLevel::Read
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActiveShareCount {
    pub record_id: RecordId,
    pub active: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessCheck {
    pub allowed: bool,
    pub required: AccessLevel,
    pub status: Option<AccessStatus>,
    pub access_level: Option<AccessLevel>,
}

/// A view plus the provenance needed to reproduce it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ViewResult<T> {
    pub snapshot_id: String,
    pub contract: Address,
    #[serde(with = "time::serde::rfc3339")]
    pub as_of: OffsetDateTime,
    pub fold_ruleset_version: String,
    pub merge_policy: MergePolicy,
    pub events: usize,
    pub merge: MergeReport,
    pub data: T,
}

struct FoldedView {
    events: Vec<AuthEvent>,
    snapshot: AccessSnapshot,
    merge: MergeReport,
    as_of: OffsetDateTime,
    snapshot_id: String,
}

impl FoldedView {
    fn now(&self) -> i64 {
        self.as_of.unix_timestamp()
    }

    fn into_result<T>(self, scope: &ViewScope, data: T) -> ViewResult<T> {
        ViewResult {
            snapshot_id: self.snapshot_id,
            contract: scope.contract,
            as_of: self.as_of,
            fold_ruleset_version: FOLD_RULESET_VERSION.to_string(),
            merge_policy: scope.merge_policy,
            events: self.events.len(),
            merge: self.merge,
            data,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AccessLedgerApi {
    db_path: PathBuf,
}

impl AccessLedgerApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Validate and archive a batch of raw logs.
    ///
    /// Every log is normalized first; one malformed log rejects the whole batch
    /// and nothing is written.
    ///
    /// # Errors
    /// Returns an error when a log is malformed or the archive write fails.
    pub fn ingest_logs(&self, input: IngestLogsRequest) -> Result<IngestLogsResult> {
        let normalized = normalize_batch(&input.logs)
            .with_context(|| format!("rejected log batch for contract {}", input.contract))?
            .len();

        let mut store = self.open_store()?;
        store.migrate()?;
        let append = store.append_logs(&input.contract, &input.logs)?;
        tracing::info!(
            contract = %input.contract,
            inserted = append.inserted,
            skipped = append.skipped_duplicates,
            "ingested raw logs"
        );

        Ok(IngestLogsResult { contract: input.contract, normalized, append })
    }

    /// Pull every event kind for a block window from `source` into the archive,
    /// then advance the contract's checkpoint to `to_block`.
    ///
    /// The checkpoint only moves when the window is contiguous with it (starts
    /// at or before checkpoint + 1). A window that leaves a gap is archived but
    /// the checkpoint stays put, so the next resume still covers the gap.
    ///
    /// # Errors
    /// Returns an error when the range is invalid, the source fails, a fetched
    /// log is malformed, or the archive write fails.
    pub fn sync_from<S>(&self, source: &S, input: SyncRequest) -> Result<SyncResult>
    where
        S: EventSource,
        S::Error: Into<anyhow::Error>,
    {
        let mut store = self.open_store()?;
        store.migrate()?;

        let checkpoint = store.checkpoint(&input.contract)?;
        let from_block = match (input.from_block, checkpoint) {
            (Some(from_block), _) => from_block,
            (None, Some(last_block)) => last_block.saturating_add(1),
            (None, None) => 0,
        };

        if input.from_block.is_none() && from_block > input.to_block {
            return Ok(SyncResult {
                contract: input.contract,
                range: None,
                fetched: 0,
                append: AppendSummary::default(),
                checkpoint,
                checkpoint_advanced: false,
                up_to_date: true,
            });
        }

        let range = BlockRange::new(from_block, input.to_block)?;
        let mut fetched = Vec::new();
        for kind in EventKind::ALL {
            let logs = source
                .fetch_events(&input.contract, kind, range)
                .map_err(|err| -> anyhow::Error { err.into() })
                .with_context(|| {
                    format!(
                        "failed to fetch {} logs for blocks {}..={}",
                        kind.event_name(),
                        range.from_block,
                        range.to_block
                    )
                })?;
            fetched.extend(logs);
        }

        normalize_batch(&fetched)
            .with_context(|| format!("source returned malformed logs for {}", input.contract))?;
        let append = store.append_logs(&input.contract, &fetched)?;

        let resume_from = checkpoint.map_or(0, |last_block| last_block.saturating_add(1));
        let checkpoint_advanced = range.from_block <= resume_from;
        let checkpoint = if checkpoint_advanced {
            Some(store.advance_checkpoint(&input.contract, range.to_block)?)
        } else {
            tracing::warn!(
                contract = %input.contract,
                from_block = range.from_block,
                resume_from,
                "sync window leaves a gap after the checkpoint; checkpoint not advanced"
            );
            checkpoint
        };

        tracing::info!(
            contract = %input.contract,
            from_block = range.from_block,
            to_block = range.to_block,
            fetched = fetched.len(),
            inserted = append.inserted,
            "synced contract logs"
        );

        Ok(SyncResult {
            contract: input.contract,
            range: Some(range),
            fetched: fetched.len(),
            append,
            checkpoint,
            checkpoint_advanced,
            up_to_date: false,
        })
    }

    /// Store the latest contract read for one (record, subject) pair.
    ///
    /// # Errors
    /// Returns an error when the archive write fails.
    pub fn record_read(&self, input: RecordReadRequest) -> Result<RecordReadRequest> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.record_read(&input.contract, &input.record_id, &input.subject, &input.read)?;
        Ok(input)
    }

    /// # Errors
    /// Returns an error when the archive cannot be read or folded.
    pub fn shared_with_me(
        &self,
        input: SharedWithMeRequest,
    ) -> Result<ViewResult<Vec<SharedRecord>>> {
        let folded = self.fold(&input.scope)?;
        let records = shared_with_me(&folded.snapshot, &input.subject, folded.now(), input.filter);
        Ok(folded.into_result(&input.scope, records))
    }

    /// # Errors
    /// Returns an error when the archive cannot be read or folded.
    pub fn consumers_of(&self, input: RecordViewRequest) -> Result<ViewResult<Vec<RecordConsumer>>> {
        let folded = self.fold(&input.scope)?;
        let consumers = consumers_of(&folded.snapshot, &input.record_id, folded.now());
        Ok(folded.into_result(&input.scope, consumers))
    }

    /// # Errors
    /// Returns an error when the archive cannot be read or folded.
    pub fn active_share_count(
        &self,
        input: RecordViewRequest,
    ) -> Result<ViewResult<ActiveShareCount>> {
        let folded = self.fold(&input.scope)?;
        let active = active_share_count(&folded.snapshot, &input.record_id, folded.now());
        Ok(folded.into_result(&input.scope, ActiveShareCount { record_id: input.record_id, active }))
    }

    /// Event history is read from the archive as-is; recorded reads do not alter it.
    ///
    /// # Errors
    /// Returns an error when the archive cannot be read or folded.
    pub fn access_history(&self, input: RecordViewRequest) -> Result<ViewResult<Vec<HistoryEntry>>> {
        let folded = self.fold(&input.scope)?;
        let history = access_history(&folded.events, &input.record_id);
        Ok(folded.into_result(&input.scope, history))
    }

    /// # Errors
    /// Returns an error when the archive cannot be read or folded.
    pub fn records_of(&self, input: RecordsOfRequest) -> Result<ViewResult<Vec<Registration>>> {
        let folded = self.fold(&input.scope)?;
        let records = records_of(&folded.snapshot, &input.producer);
        Ok(folded.into_result(&input.scope, records))
    }

    /// # Errors
    /// Returns an error when the archive cannot be read or folded.
    pub fn check_access(&self, input: CheckAccessRequest) -> Result<ViewResult<AccessCheck>> {
        let folded = self.fold(&input.scope)?;
        let now = folded.now();
        let state = folded.snapshot.get(&input.record_id, &input.subject);
        let check = AccessCheck {
            allowed: check_access(
                &folded.snapshot,
                &input.record_id,
                &input.subject,
                input.required,
                now,
            ),
            required: input.required,
            status: state.map(|state| state.status(now)),
            access_level: state.map(|state| state.access_level),
        };
        Ok(folded.into_result(&input.scope, check))
    }

    fn fold(&self, scope: &ViewScope) -> Result<FoldedView> {
        let mut store = self.open_store()?;
        store.migrate()?;

        let as_of = scope.as_of.unwrap_or_else(OffsetDateTime::now_utc);
        let logs = store.list_logs(&scope.contract)?;
        let events = normalize_batch(&logs).map_err(|err| {
            anyhow!("archive for contract {} holds a malformed log: {err}", scope.contract)
        })?;

        let (events, mut snapshot) = Reconciler::from_events(events).into_parts();
        let recorded = store.reads(scope.contract);
        let consulted = ConsultedReads::new(&recorded);
        let merge = merge_authoritative(
            &mut snapshot,
            &consulted,
            scope.merge_policy,
            as_of.unix_timestamp(),
        )?;
        if !merge.divergences.is_empty() {
            tracing::warn!(
                contract = %scope.contract,
                divergences = merge.divergences.len(),
                "recorded reads disagree with their own fields"
            );
        }

        let snapshot_id = compute_snapshot_id(scope, as_of, &events, consulted.into_reads())?;
        Ok(FoldedView { events, snapshot, merge, as_of, snapshot_id })
    }
}

type ConsultedRead = (RecordId, Address, AuthoritativeRead);

/// Pass-through reader that remembers every read the merge actually used.
struct ConsultedReads<'a, R> {
    inner: &'a R,
    seen: RefCell<Vec<ConsultedRead>>,
}

impl<'a, R> ConsultedReads<'a, R> {
    fn new(inner: &'a R) -> Self {
        Self { inner, seen: RefCell::new(Vec::new()) }
    }

    fn into_reads(self) -> Vec<ConsultedRead> {
        self.seen.into_inner()
    }
}

impl<R: AccessReader> AccessReader for ConsultedReads<'_, R> {
    type Error = R::Error;

    fn read_access(
        &self,
        record_id: &RecordId,
        subject: &Address,
    ) -> std::result::Result<Option<AuthoritativeRead>, Self::Error> {
        let read = self.inner.read_access(record_id, subject)?;
        if let Some(read) = &read {
            self.seen.borrow_mut().push((record_id.clone(), *subject, read.clone()));
        }
        Ok(read)
    }
}

/// Commits to everything the view depends on: scope, ruleset, the full event
/// payloads, and each recorded read the merge consulted.
fn compute_snapshot_id(
    scope: &ViewScope,
    as_of: OffsetDateTime,
    events: &[AuthEvent],
    mut reads: Vec<ConsultedRead>,
) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(scope.contract.to_string().as_bytes());
    hasher.update(as_of.unix_timestamp().to_string().as_bytes());
    hasher.update(FOLD_RULESET_VERSION.as_bytes());
    hasher.update(format!("merge_policy={:?}", scope.merge_policy).as_bytes());

    let mut ordered = events.iter().collect::<Vec<_>>();
    ordered.sort_unstable();
    for event in ordered {
        let encoded = serde_json::to_vec(event).context("failed to encode event for snapshot id")?;
        hasher.update(b"event:");
        hasher.update(&encoded);
    }

    reads.sort_by(|lhs, rhs| (&lhs.0, &lhs.1).cmp(&(&rhs.0, &rhs.1)));
    for (record_id, subject, read) in &reads {
        let encoded = serde_json::to_vec(read).context("failed to encode read for snapshot id")?;
        hasher.update(format!("read:{record_id}/{subject}:").as_bytes());
        hasher.update(&encoded);
    }

    let digest = hasher.finalize();
    let digest_hex = format!("{digest:x}");
    Ok(format!("snap_{}", &digest_hex[..16]))
}

#[cfg(test)]
mod tests {
    use ledup_access_core::{InMemoryLedger, StateSource};
    use serde_json::{json, Map, Value};
    use time::macros::datetime;

    use super::*;

    const CONTRACT: &str = "0x4242424242424242424242424242424242424242";
    const AAA: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const BBB: &str = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
    const PRODUCER: &str = "0x0101010101010101010101010101010101010101";

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("ledup-access-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn address(raw: &str) -> Result<Address> {
        Ok(Address::parse(raw)?)
    }

    fn log(event: &str, block_number: u64, log_index: u32, args: Value) -> RawLog {
        RawLog {
            event: event.to_string(),
            block_number,
            log_index,
            block_timestamp: None,
            transaction_hash: None,
            args: match args {
                Value::Object(map) => map,
                _ => Map::new(),
            },
        }
    }

    fn scenario_logs() -> Vec<RawLog> {
        vec![
            log(
                "AccessGranted",
                10,
                0,
                json!({ "recordId": "r1", "consumer": AAA, "accessLevel": 1, "expiration": 1_000 }),
            ),
            log(
                "AccessGranted",
                10,
                1,
                json!({ "recordId": "r1", "consumer": BBB, "accessLevel": "write", "expiration": 2_000 }),
            ),
            log(
                "AccessRevoked",
                11,
                0,
                json!({ "recordId": "r1", "consumer": AAA, "revoker": PRODUCER }),
            ),
        ]
    }

    fn scope_at(unix: i64) -> Result<ViewScope> {
        Ok(ViewScope::new(address(CONTRACT)?).at(OffsetDateTime::from_unix_timestamp(unix)?))
    }

    // Test IDs: TAPI-001
    #[test]
    fn ingest_then_views_round_trip() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = AccessLedgerApi::new(db_path.clone());

        let ingested =
            api.ingest_logs(IngestLogsRequest { contract: address(CONTRACT)?, logs: scenario_logs() })?;
        assert_eq!(ingested.normalized, 3);
        assert_eq!(ingested.append.inserted, 3);

        let shared_aaa = api.shared_with_me(SharedWithMeRequest {
            scope: scope_at(1_500)?,
            subject: address(AAA)?,
            filter: ShareFilter::default(),
        })?;
        assert!(shared_aaa.data.is_empty());
        assert!(shared_aaa.snapshot_id.starts_with("snap_"));
        assert_eq!(shared_aaa.fold_ruleset_version, FOLD_RULESET_VERSION);

        let consumers = api.consumers_of(RecordViewRequest {
            scope: scope_at(1_500)?,
            record_id: RecordId::new("r1")?,
        })?;
        let statuses = consumers.data.iter().map(|consumer| consumer.status).collect::<Vec<_>>();
        assert_eq!(statuses, vec![AccessStatus::Revoked, AccessStatus::Active]);
        assert_eq!(consumers.snapshot_id, shared_aaa.snapshot_id);

        let count = api.active_share_count(RecordViewRequest {
            scope: scope_at(1_500)?,
            record_id: RecordId::new("r1")?,
        })?;
        assert_eq!(count.data.active, 1);

        let later = api.active_share_count(RecordViewRequest {
            scope: scope_at(2_500)?,
            record_id: RecordId::new("r1")?,
        })?;
        assert_eq!(later.data.active, 0);
        assert_ne!(later.snapshot_id, count.snapshot_id);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-002
    #[test]
    fn malformed_batch_is_rejected_before_archiving() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = AccessLedgerApi::new(db_path.clone());

        let mut logs = scenario_logs();
        logs.push(log("AccessGranted", 12, 0, json!({ "recordId": "r1", "consumer": AAA })));
        let Err(err) = api.ingest_logs(IngestLogsRequest { contract: address(CONTRACT)?, logs })
        else {
            return Err(anyhow!("expected malformed batch to be rejected"));
        };
        assert!(format!("{err:#}").contains("expiration"));

        let history = api.access_history(RecordViewRequest {
            scope: scope_at(0)?,
            record_id: RecordId::new("r1")?,
        })?;
        assert!(history.data.is_empty());

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-003
    #[test]
    fn sync_pulls_from_source_and_resumes_from_checkpoint() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = AccessLedgerApi::new(db_path.clone());
        let contract = address(CONTRACT)?;

        let ledger = InMemoryLedger::new();
        for raw in scenario_logs() {
            ledger.append(contract, raw)?;
        }

        let first =
            api.sync_from(&ledger, SyncRequest { contract, from_block: None, to_block: 10 })?;
        assert_eq!(first.fetched, 2);
        assert_eq!(first.checkpoint, Some(10));

        let second =
            api.sync_from(&ledger, SyncRequest { contract, from_block: None, to_block: 20 })?;
        assert_eq!(second.range, Some(BlockRange::new(11, 20)?));
        assert_eq!(second.fetched, 1);

        let repeat =
            api.sync_from(&ledger, SyncRequest { contract, from_block: None, to_block: 20 })?;
        assert!(repeat.up_to_date);

        let replay =
            api.sync_from(&ledger, SyncRequest { contract, from_block: Some(0), to_block: 20 })?;
        assert_eq!(replay.append.skipped_duplicates, 3);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-007
    #[test]
    fn explicit_window_past_checkpoint_does_not_hide_gap() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = AccessLedgerApi::new(db_path.clone());
        let contract = address(CONTRACT)?;

        let ledger = InMemoryLedger::new();
        ledger.append(
            contract,
            log(
                "AccessGranted",
                5,
                0,
                json!({ "recordId": "r1", "consumer": AAA, "accessLevel": 1, "expiration": 9_000 }),
            ),
        )?;
        ledger.append(
            contract,
            log(
                "AccessGranted",
                150,
                0,
                json!({ "recordId": "r1", "consumer": BBB, "accessLevel": 1, "expiration": 9_000 }),
            ),
        )?;

        let ahead = api.sync_from(
            &ledger,
            SyncRequest { contract, from_block: Some(100), to_block: 200 },
        )?;
        assert_eq!(ahead.fetched, 1);
        assert!(!ahead.checkpoint_advanced);
        assert_eq!(ahead.checkpoint, None);

        let resumed =
            api.sync_from(&ledger, SyncRequest { contract, from_block: None, to_block: 200 })?;
        assert!(!resumed.up_to_date);
        assert_eq!(resumed.range, Some(BlockRange::new(0, 200)?));
        assert_eq!(resumed.append.inserted, 1);
        assert_eq!(resumed.append.skipped_duplicates, 1);
        assert!(resumed.checkpoint_advanced);
        assert_eq!(resumed.checkpoint, Some(200));

        let history = api.access_history(RecordViewRequest {
            scope: scope_at(1_000)?,
            record_id: RecordId::new("r1")?,
        })?;
        assert_eq!(history.data.len(), 2);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-008
    #[test]
    fn snapshot_id_changes_when_a_consulted_read_changes() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = AccessLedgerApi::new(db_path.clone());
        let contract = address(CONTRACT)?;
        api.ingest_logs(IngestLogsRequest { contract, logs: scenario_logs() })?;

        let check = |scope: ViewScope| -> Result<ViewResult<AccessCheck>> {
            api.check_access(CheckAccessRequest {
                scope,
                record_id: RecordId::new("r1")?,
                subject: address(BBB)?,
                required: AccessLevel::Read,
            })
        };

        let before = check(scope_at(1_500)?)?;
        let before_events_only = check(scope_at(1_500)?.with_policy(MergePolicy::EventsOnly))?;
        assert!(before.data.allowed);

        api.record_read(RecordReadRequest {
            contract,
            record_id: RecordId::new("r1")?,
            subject: address(BBB)?,
            read: AuthoritativeRead {
                has_access: false,
                expiration: 2_000,
                access_level: AccessLevel::Write,
                is_revoked: true,
                observed_at_block: Some(12),
            },
        })?;

        let after = check(scope_at(1_500)?)?;
        assert!(!after.data.allowed);
        assert_ne!(after.snapshot_id, before.snapshot_id);
        assert_eq!(check(scope_at(1_500)?)?.snapshot_id, after.snapshot_id);

        let after_events_only = check(scope_at(1_500)?.with_policy(MergePolicy::EventsOnly))?;
        assert_eq!(after_events_only.snapshot_id, before_events_only.snapshot_id);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-004
    #[test]
    fn recorded_reads_override_events_unless_events_only() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = AccessLedgerApi::new(db_path.clone());
        let contract = address(CONTRACT)?;
        api.ingest_logs(IngestLogsRequest { contract, logs: scenario_logs() })?;

        api.record_read(RecordReadRequest {
            contract,
            record_id: RecordId::new("r1")?,
            subject: address(BBB)?,
            read: AuthoritativeRead {
                has_access: false,
                expiration: 2_000,
                access_level: AccessLevel::Write,
                is_revoked: true,
                observed_at_block: Some(12),
            },
        })?;

        let merged = api.check_access(CheckAccessRequest {
            scope: scope_at(1_500)?,
            record_id: RecordId::new("r1")?,
            subject: address(BBB)?,
            required: AccessLevel::Read,
        })?;
        assert!(!merged.data.allowed);
        assert_eq!(merged.data.status, Some(AccessStatus::Revoked));
        assert_eq!(merged.merge.overridden, 1);

        let events_only = api.check_access(CheckAccessRequest {
            scope: scope_at(1_500)?.with_policy(MergePolicy::EventsOnly),
            record_id: RecordId::new("r1")?,
            subject: address(BBB)?,
            required: AccessLevel::Write,
        })?;
        assert!(events_only.data.allowed);
        assert_ne!(events_only.snapshot_id, merged.snapshot_id);

        let consumers = api.consumers_of(RecordViewRequest {
            scope: scope_at(1_500)?,
            record_id: RecordId::new("r1")?,
        })?;
        let sources = consumers.data.iter().map(|consumer| consumer.state.source).collect::<Vec<_>>();
        assert_eq!(sources, vec![StateSource::Events, StateSource::Authoritative]);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-005
    #[test]
    fn records_of_and_history_surface_registrations_and_block_time() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = AccessLedgerApi::new(db_path.clone());
        let contract = address(CONTRACT)?;

        let mut logs = scenario_logs();
        logs.push(log(
            "RecordRegistered",
            2,
            0,
            json!({ "recordId": "r1", "producer": PRODUCER, "did": "did:ledup:producer" }),
        ));
        logs[0].block_timestamp = Some(1_700_000_000);
        api.ingest_logs(IngestLogsRequest { contract, logs })?;

        let records = api.records_of(RecordsOfRequest {
            scope: ViewScope::new(contract).at(datetime!(2026-01-01 00:00 UTC)),
            producer: address(PRODUCER)?,
        })?;
        assert_eq!(records.data.len(), 1);
        assert_eq!(records.data[0].producer_did.as_deref(), Some("did:ledup:producer"));

        let history = api.access_history(RecordViewRequest {
            scope: ViewScope::new(contract),
            record_id: RecordId::new("r1")?,
        })?;
        assert_eq!(history.data.len(), 3);
        assert_eq!(
            history.data[0].wall_clock.at.map(OffsetDateTime::unix_timestamp),
            Some(1_700_000_000)
        );

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-006
    #[test]
    fn view_requests_accept_flattened_json() -> Result<()> {
        let request: SharedWithMeRequest = serde_json::from_value(json!({
            "contract": CONTRACT,
            "as_of": "2026-01-01T00:00:00Z",
            "subject": AAA,
        }))?;
        assert_eq!(request.scope.merge_policy, MergePolicy::AuthoritativeWins);
        assert_eq!(request.scope.as_of, Some(datetime!(2026-01-01 00:00 UTC)));
        assert_eq!(request.filter, ShareFilter::default());
        Ok(())
    }
}
