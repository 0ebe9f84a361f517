use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use ledup_access_core::{
    normalize_batch, AccessLevel, AccessReader, Address, AuthoritativeRead, BlockRange,
    EventKind, EventSource, RawLog, RecordId,
};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, Transaction};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS raw_logs (
  contract TEXT NOT NULL,
  block_number INTEGER NOT NULL CHECK (block_number >= 0),
  log_index INTEGER NOT NULL CHECK (log_index >= 0),
  event TEXT NOT NULL,
  block_timestamp INTEGER,
  transaction_hash TEXT,
  args_json TEXT NOT NULL,
  ingested_at TEXT NOT NULL,
  PRIMARY KEY (contract, block_number, log_index)
);

CREATE TABLE IF NOT EXISTS sync_checkpoints (
  contract TEXT PRIMARY KEY,
  last_block INTEGER NOT NULL CHECK (last_block >= 0),
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_raw_logs_event_block ON raw_logs(contract, event, block_number);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS authoritative_reads (
  contract TEXT NOT NULL,
  record_id TEXT NOT NULL,
  subject TEXT NOT NULL,
  has_access INTEGER NOT NULL CHECK (has_access IN (0, 1)),
  expiration INTEGER NOT NULL,
  access_level TEXT NOT NULL CHECK (access_level IN ('none', 'read', 'write')),
  is_revoked INTEGER NOT NULL CHECK (is_revoked IN (0, 1)),
  observed_at_block INTEGER,
  recorded_at TEXT NOT NULL,
  PRIMARY KEY (contract, record_id, subject)
);
";

const RAW_LOGS_FILE: &str = "raw_logs.ndjson";
const READS_FILE: &str = "authoritative_reads.ndjson";
const CHECKPOINTS_FILE: &str = "sync_checkpoints.ndjson";

/// Archive of raw contract logs, sync checkpoints, and recorded contract reads.
pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppendSummary {
    pub inserted: usize,
    pub skipped_duplicates: usize,
}

/// One archived log with the contract that emitted it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArchivedLog {
    pub contract: Address,
    pub log: RawLog,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncCheckpoint {
    pub contract: Address,
    pub last_block: u64,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordedRead {
    pub contract: Address,
    pub record_id: RecordId,
    pub subject: Address,
    pub read: AuthoritativeRead,
    pub recorded_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported_logs: usize,
    pub skipped_existing_logs: usize,
    pub imported_reads: usize,
    pub skipped_existing_reads: usize,
    pub imported_checkpoints: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

struct LogRow {
    contract: String,
    block_number: i64,
    log_index: i64,
    event: String,
    block_timestamp: Option<i64>,
    transaction_hash: Option<String>,
    args_json: String,
}

struct ReadRow {
    contract: String,
    record_id: String,
    subject: String,
    has_access: bool,
    expiration: i64,
    access_level: String,
    is_revoked: bool,
    observed_at_block: Option<i64>,
    recorded_at: String,
}

const SELECT_LOG_COLUMNS: &str = "SELECT contract, block_number, log_index, event, block_timestamp,
        transaction_hash, args_json
 FROM raw_logs";

const SELECT_READ_COLUMNS: &str = "SELECT contract, record_id, subject, has_access, expiration,
        access_level, is_revoked, observed_at_block, recorded_at
 FROM authoritative_reads";

impl SqliteStore {
    /// Open a SQLite-backed archive and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 {
            self.apply_migration_2()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&mut self) -> Result<i64> {
        if !table_exists(&self.conn, "raw_logs")? {
            let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
            return Ok(1);
        }

        if !table_has_column(&self.conn, "raw_logs", "log_index")? {
            return Err(anyhow!("database schema is invalid: raw_logs has no log_index column"));
        }

        // Tables exist without migration rows; adopt whatever shape is present.
        record_schema_version(&self.conn, 1)?;
        if table_exists(&self.conn, "authoritative_reads")? {
            record_schema_version(&self.conn, 2)?;
            return Ok(2);
        }
        Ok(1)
    }

    fn apply_migration_2(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration v2 transaction")?;
        tx.execute_batch(MIGRATION_002_SQL).context("failed to create authoritative_reads")?;
        record_schema_version(&tx, 2)?;
        tx.commit().context("failed to commit migration v2")?;
        Ok(())
    }

    /// Archive logs emitted by `contract`. Logs already stored at the same
    /// `(block_number, log_index)` are skipped.
    ///
    /// # Errors
    /// Returns an error when serialization or any write in the transaction fails.
    pub fn append_logs(&mut self, contract: &Address, logs: &[RawLog]) -> Result<AppendSummary> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let summary = insert_logs(&tx, contract, logs)?;
        tx.commit().context("failed to commit raw log append")?;

        if summary.skipped_duplicates > 0 {
            tracing::debug!(
                contract = %contract,
                skipped = summary.skipped_duplicates,
                "skipped logs already archived"
            );
        }
        Ok(summary)
    }

    /// Every archived log for `contract` in order-key order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_logs(&self, contract: &Address) -> Result<Vec<RawLog>> {
        let rows = self.query_logs(
            &format!("{SELECT_LOG_COLUMNS} WHERE contract = ?1 ORDER BY block_number, log_index"),
            params![contract.to_string()],
        )?;
        rows.into_iter().map(|row| decode_log(row).map(|archived| archived.log)).collect()
    }

    /// Contracts with at least one archived log, ascending.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn contracts(&self) -> Result<Vec<Address>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT contract FROM raw_logs ORDER BY contract ASC")
            .context("failed to prepare contract listing")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut contracts = Vec::new();
        for row in rows {
            contracts.push(parse_address(&row?)?);
        }
        Ok(contracts)
    }

    /// Highest fully synced block for `contract`, if any sync has completed.
    ///
    /// # Errors
    /// Returns an error when the checkpoint cannot be read.
    pub fn checkpoint(&self, contract: &Address) -> Result<Option<u64>> {
        let last_block = self
            .conn
            .query_row(
                "SELECT last_block FROM sync_checkpoints WHERE contract = ?1",
                params![contract.to_string()],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .context("failed to read sync checkpoint")?;
        last_block.map(block_from_sql).transpose()
    }

    /// Advance the checkpoint for `contract`. A lower block never moves it back.
    ///
    /// # Errors
    /// Returns an error when the checkpoint cannot be written.
    pub fn advance_checkpoint(&mut self, contract: &Address, last_block: u64) -> Result<u64> {
        self.conn
            .execute(
                "INSERT INTO sync_checkpoints(contract, last_block, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(contract) DO UPDATE SET
                   last_block = MAX(last_block, excluded.last_block),
                   updated_at = excluded.updated_at",
                params![contract.to_string(), block_to_sql(last_block)?, now_rfc3339()?],
            )
            .context("failed to write sync checkpoint")?;
        self.checkpoint(contract)?
            .ok_or_else(|| anyhow!("sync checkpoint missing after write for {contract}"))
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_checkpoints(&self) -> Result<Vec<SyncCheckpoint>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT contract, last_block, updated_at FROM sync_checkpoints ORDER BY contract",
            )
            .context("failed to prepare checkpoint listing")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, String>(2)?))
        })?;

        let mut checkpoints = Vec::new();
        for row in rows {
            let (contract, last_block, updated_at) = row?;
            checkpoints.push(SyncCheckpoint {
                contract: parse_address(&contract)?,
                last_block: block_from_sql(last_block)?,
                updated_at,
            });
        }
        Ok(checkpoints)
    }

    /// Record the latest contract read for one pair, replacing any earlier read.
    ///
    /// # Errors
    /// Returns an error when the read cannot be written.
    pub fn record_read(
        &mut self,
        contract: &Address,
        record_id: &RecordId,
        subject: &Address,
        read: &AuthoritativeRead,
    ) -> Result<()> {
        let recorded_at = now_rfc3339()?;
        upsert_read(
            &self.conn,
            &RecordedRead {
                contract: *contract,
                record_id: record_id.clone(),
                subject: *subject,
                read: read.clone(),
                recorded_at,
            },
        )
    }

    /// # Errors
    /// Returns an error when the read cannot be queried or decoded.
    pub fn get_read(
        &self,
        contract: &Address,
        record_id: &RecordId,
        subject: &Address,
    ) -> Result<Option<AuthoritativeRead>> {
        let rows = self.query_reads(
            &format!(
                "{SELECT_READ_COLUMNS} WHERE contract = ?1 AND record_id = ?2 AND subject = ?3"
            ),
            params![contract.to_string(), record_id.as_str(), subject.to_string()],
        )?;
        rows.into_iter().next().map(|row| decode_read(row).map(|recorded| recorded.read)).transpose()
    }

    /// Recorded reads, optionally limited to one contract.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_reads(&self, contract: Option<&Address>) -> Result<Vec<RecordedRead>> {
        let rows = match contract {
            Some(contract) => self.query_reads(
                &format!(
                    "{SELECT_READ_COLUMNS} WHERE contract = ?1 ORDER BY contract, record_id, subject"
                ),
                params![contract.to_string()],
            )?,
            None => self.query_reads(
                &format!("{SELECT_READ_COLUMNS} ORDER BY contract, record_id, subject"),
                params![],
            )?,
        };
        rows.into_iter().map(decode_read).collect()
    }

    /// Reader over reads recorded for `contract`.
    #[must_use]
    pub fn reads(&self, contract: Address) -> RecordedReads<'_> {
        RecordedReads { store: self, contract }
    }

    /// Export logs, reads, and checkpoints as deterministic NDJSON plus manifest.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let logs = self
            .query_logs(
                &format!("{SELECT_LOG_COLUMNS} ORDER BY contract, block_number, log_index"),
                params![],
            )?
            .into_iter()
            .map(decode_log)
            .collect::<Result<Vec<_>>>()?;
        let reads = self.list_reads(None)?;
        let checkpoints = self.list_checkpoints()?;

        let (logs_sha256, logs_records) = write_ndjson_file(&out_dir.join(RAW_LOGS_FILE), &logs)?;
        let (reads_sha256, reads_records) = write_ndjson_file(&out_dir.join(READS_FILE), &reads)?;
        let (checkpoints_sha256, checkpoints_records) =
            write_ndjson_file(&out_dir.join(CHECKPOINTS_FILE), &checkpoints)?;

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            files: vec![
                ExportFileDigest {
                    path: RAW_LOGS_FILE.to_string(),
                    sha256: logs_sha256,
                    records: logs_records,
                },
                ExportFileDigest {
                    path: READS_FILE.to_string(),
                    sha256: reads_sha256,
                    records: reads_records,
                },
                ExportFileDigest {
                    path: CHECKPOINTS_FILE.to_string(),
                    sha256: checkpoints_sha256,
                    records: checkpoints_records,
                },
            ],
        };

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }

    /// Import an exported snapshot directory into this database.
    ///
    /// # Errors
    /// Returns an error when the manifest does not match the files, when any
    /// raw log fails normalization, or when migration, parsing, duplicate
    /// handling, or writes fail.
    pub fn import_snapshot(&mut self, in_dir: &Path, skip_existing: bool) -> Result<ImportSummary> {
        self.migrate()?;
        let manifest = read_export_manifest(&in_dir.join("manifest.json"))?;
        validate_import_manifest(in_dir, &manifest)?;

        let logs = read_ndjson_file::<ArchivedLog>(&in_dir.join(RAW_LOGS_FILE))?;
        let reads = read_ndjson_file::<RecordedRead>(&in_dir.join(READS_FILE))?;
        let checkpoints = read_ndjson_file::<SyncCheckpoint>(&in_dir.join(CHECKPOINTS_FILE))?;

        // Views fold every archived log, so nothing unnormalizable may land here.
        normalize_batch(logs.iter().map(|archived| &archived.log)).with_context(|| {
            format!("snapshot {} holds a malformed raw log", in_dir.display())
        })?;

        let mut summary = ImportSummary {
            imported_logs: 0,
            skipped_existing_logs: 0,
            imported_reads: 0,
            skipped_existing_reads: 0,
            imported_checkpoints: 0,
        };

        let tx = self.conn.transaction().context("failed to start import transaction")?;

        for archived in logs {
            let appended = insert_logs(&tx, &archived.contract, std::slice::from_ref(&archived.log))?;
            if appended.skipped_duplicates > 0 {
                if !skip_existing {
                    return Err(anyhow!(
                        "log already archived for contract {} at {}",
                        archived.contract,
                        archived.log.order_key()
                    ));
                }
                summary.skipped_existing_logs += 1;
            } else {
                summary.imported_logs += 1;
            }
        }

        for recorded in reads {
            if read_exists(&tx, &recorded)? {
                if !skip_existing {
                    return Err(anyhow!(
                        "authoritative read already recorded for {}/{} on {}",
                        recorded.record_id,
                        recorded.subject,
                        recorded.contract
                    ));
                }
                summary.skipped_existing_reads += 1;
                continue;
            }
            upsert_read(&tx, &recorded)?;
            summary.imported_reads += 1;
        }

        for checkpoint in checkpoints {
            tx.execute(
                "INSERT INTO sync_checkpoints(contract, last_block, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(contract) DO UPDATE SET
                   last_block = MAX(last_block, excluded.last_block),
                   updated_at = excluded.updated_at",
                params![
                    checkpoint.contract.to_string(),
                    block_to_sql(checkpoint.last_block)?,
                    checkpoint.updated_at
                ],
            )
            .context("failed to import sync checkpoint")?;
            summary.imported_checkpoints += 1;
        }

        tx.commit().context("failed to commit snapshot import")?;
        Ok(summary)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        Ok(())
    }

    /// Run quick-check, foreign-key-check, and schema status checks.
    ///
    /// # Errors
    /// Returns an error when any integrity query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status: self.schema_status()?,
        })
    }

    fn query_logs<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<LogRow>> {
        let mut stmt = self.conn.prepare(sql).context("failed to prepare raw log query")?;
        let rows = stmt.query_map(params, |row| {
            Ok(LogRow {
                contract: row.get(0)?,
                block_number: row.get(1)?,
                log_index: row.get(2)?,
                event: row.get(3)?,
                block_timestamp: row.get(4)?,
                transaction_hash: row.get(5)?,
                args_json: row.get(6)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to read raw log row")?);
        }
        Ok(out)
    }

    fn query_reads<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<ReadRow>> {
        let mut stmt = self.conn.prepare(sql).context("failed to prepare read query")?;
        let rows = stmt.query_map(params, |row| {
            Ok(ReadRow {
                contract: row.get(0)?,
                record_id: row.get(1)?,
                subject: row.get(2)?,
                has_access: row.get(3)?,
                expiration: row.get(4)?,
                access_level: row.get(5)?,
                is_revoked: row.get(6)?,
                observed_at_block: row.get(7)?,
                recorded_at: row.get(8)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to read authoritative read row")?);
        }
        Ok(out)
    }
}

impl EventSource for SqliteStore {
    type Error = anyhow::Error;

    fn fetch_events(
        &self,
        contract: &Address,
        kind: EventKind,
        range: BlockRange,
    ) -> Result<Vec<RawLog>> {
        let to_block = i64::try_from(range.to_block).unwrap_or(i64::MAX);
        let rows = self.query_logs(
            &format!(
                "{SELECT_LOG_COLUMNS}
                 WHERE contract = ?1 AND event = ?2 AND block_number BETWEEN ?3 AND ?4
                 ORDER BY block_number, log_index"
            ),
            params![
                contract.to_string(),
                kind.event_name(),
                block_to_sql(range.from_block)?,
                to_block
            ],
        )?;
        rows.into_iter().map(|row| decode_log(row).map(|archived| archived.log)).collect()
    }
}

/// [`AccessReader`] over reads recorded for one contract.
pub struct RecordedReads<'a> {
    store: &'a SqliteStore,
    contract: Address,
}

impl AccessReader for RecordedReads<'_> {
    type Error = anyhow::Error;

    fn read_access(
        &self,
        record_id: &RecordId,
        subject: &Address,
    ) -> Result<Option<AuthoritativeRead>> {
        self.store.get_read(&self.contract, record_id, subject)
    }
}

fn insert_logs(tx: &Transaction<'_>, contract: &Address, logs: &[RawLog]) -> Result<AppendSummary> {
    let ingested_at = now_rfc3339()?;
    let contract = contract.to_string();
    let mut summary = AppendSummary::default();

    for log in logs {
        let args_json =
            serde_json::to_string(&log.args).context("failed to serialize raw log args")?;
        let changed = tx
            .execute(
                "INSERT OR IGNORE INTO raw_logs(
                    contract, block_number, log_index, event, block_timestamp,
                    transaction_hash, args_json, ingested_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    contract,
                    block_to_sql(log.block_number)?,
                    i64::from(log.log_index),
                    log.event,
                    log.block_timestamp,
                    log.transaction_hash,
                    args_json,
                    ingested_at,
                ],
            )
            .with_context(|| format!("failed to archive log at {}", log.order_key()))?;

        if changed == 0 {
            summary.skipped_duplicates += 1;
        } else {
            summary.inserted += 1;
        }
    }

    Ok(summary)
}

fn upsert_read(conn: &Connection, recorded: &RecordedRead) -> Result<()> {
    let observed_at_block = recorded.read.observed_at_block.map(block_to_sql).transpose()?;
    conn.execute(
        "INSERT INTO authoritative_reads(
            contract, record_id, subject, has_access, expiration,
            access_level, is_revoked, observed_at_block, recorded_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT(contract, record_id, subject) DO UPDATE SET
            has_access = excluded.has_access,
            expiration = excluded.expiration,
            access_level = excluded.access_level,
            is_revoked = excluded.is_revoked,
            observed_at_block = excluded.observed_at_block,
            recorded_at = excluded.recorded_at",
        params![
            recorded.contract.to_string(),
            recorded.record_id.as_str(),
            recorded.subject.to_string(),
            recorded.read.has_access,
            recorded.read.expiration,
            recorded.read.access_level.as_str(),
            recorded.read.is_revoked,
            observed_at_block,
            recorded.recorded_at,
        ],
    )
    .with_context(|| {
        format!("failed to record authoritative read for {}/{}", recorded.record_id, recorded.subject)
    })?;
    Ok(())
}

fn read_exists(conn: &Connection, recorded: &RecordedRead) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(
                SELECT 1 FROM authoritative_reads
                WHERE contract = ?1 AND record_id = ?2 AND subject = ?3
            )",
            params![
                recorded.contract.to_string(),
                recorded.record_id.as_str(),
                recorded.subject.to_string()
            ],
            |row| row.get::<_, i64>(0),
        )
        .context("failed to check for existing authoritative read")?;
    Ok(exists == 1)
}

fn decode_log(row: LogRow) -> Result<ArchivedLog> {
    let args = serde_json::from_str(&row.args_json).with_context(|| {
        format!("invalid args_json for log at {}:{}", row.block_number, row.log_index)
    })?;
    Ok(ArchivedLog {
        contract: parse_address(&row.contract)?,
        log: RawLog {
            event: row.event,
            block_number: block_from_sql(row.block_number)?,
            log_index: u32::try_from(row.log_index)
                .with_context(|| format!("log index out of range: {}", row.log_index))?,
            block_timestamp: row.block_timestamp,
            transaction_hash: row.transaction_hash,
            args,
        },
    })
}

fn decode_read(row: ReadRow) -> Result<RecordedRead> {
    let access_level = AccessLevel::parse(&row.access_level)
        .ok_or_else(|| anyhow!("invalid stored access level: {}", row.access_level))?;
    Ok(RecordedRead {
        contract: parse_address(&row.contract)?,
        record_id: RecordId::new(row.record_id).context("invalid stored record id")?,
        subject: parse_address(&row.subject)?,
        read: AuthoritativeRead {
            has_access: row.has_access,
            expiration: row.expiration,
            access_level,
            is_revoked: row.is_revoked,
            observed_at_block: row.observed_at_block.map(block_from_sql).transpose()?,
        },
        recorded_at: row.recorded_at,
    })
}

fn parse_address(raw: &str) -> Result<Address> {
    Address::parse(raw).with_context(|| format!("invalid stored address: {raw}"))
}

fn block_to_sql(block: u64) -> Result<i64> {
    i64::try_from(block).with_context(|| format!("block number exceeds sqlite range: {block}"))
}

fn block_from_sql(block: i64) -> Result<u64> {
    u64::try_from(block).with_context(|| format!("negative block number in archive: {block}"))
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "raw_logs")? {
        return Ok((0, false));
    }

    if table_exists(conn, "authoritative_reads")? {
        return Ok((2, true));
    }

    Ok((1, true))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

fn read_ndjson_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut values = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse NDJSON row {} from {}", index + 1, path.display())
        })?;
        values.push(value);
    }

    Ok(values)
}

fn read_export_manifest(path: &Path) -> Result<ExportManifest> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read manifest file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse manifest JSON {}", path.display()))
}

fn ndjson_digest_and_records(path: &Path) -> Result<(String, usize)> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut records = 0_usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
        if !line.trim().is_empty() {
            records += 1;
        }
    }

    Ok((format!("{:x}", hasher.finalize()), records))
}

fn validate_import_manifest(in_dir: &Path, manifest: &ExportManifest) -> Result<()> {
    if manifest.schema_version <= 0 || manifest.schema_version > LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported export schema version {}; supported range is 1..={}",
            manifest.schema_version,
            LATEST_SCHEMA_VERSION
        ));
    }

    let mut by_path: BTreeMap<&str, &ExportFileDigest> = BTreeMap::new();
    for file in &manifest.files {
        if by_path.insert(file.path.as_str(), file).is_some() {
            return Err(anyhow!("manifest contains duplicate file entry: {}", file.path));
        }
    }

    for required in [RAW_LOGS_FILE, READS_FILE, CHECKPOINTS_FILE] {
        let Some(expected) = by_path.get(required) else {
            return Err(anyhow!("manifest is missing required file entry: {required}"));
        };
        let file_path = in_dir.join(required);
        if !file_path.exists() {
            return Err(anyhow!("manifest references missing file {}", file_path.display()));
        }

        let (actual_sha256, actual_records) = ndjson_digest_and_records(&file_path)?;
        if actual_sha256 != expected.sha256 {
            return Err(anyhow!(
                "manifest digest mismatch for {required}: expected {}, got {}",
                expected.sha256,
                actual_sha256
            ));
        }
        if actual_records != expected.records {
            return Err(anyhow!(
                "manifest record count mismatch for {required}: expected {}, got {}",
                expected.records,
                actual_records
            ));
        }
    }

    Ok(())
}
