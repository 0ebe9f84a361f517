use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use hmac::{Hmac, Mac};
use ledup_access_api::{
    AccessLedgerApi, CheckAccessRequest, IngestLogsRequest, RecordReadRequest,
    RecordViewRequest, RecordsOfRequest, SharedWithMeRequest, SyncRequest, ViewScope,
};
use ledup_access_core::{
    AccessLevel, Address, AuthoritativeRead, MergePolicy, RawLog, RecordId, ShareFilter,
};
use ledup_access_store_sqlite::SqliteStore;
use serde_json::Value;
use sha2::Sha256;
use time::OffsetDateTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const MANIFEST_FILE: &str = "manifest.json";
const MANIFEST_SIG_FILE: &str = "manifest.sig";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Parser)]
#[command(name = "ledup")]
#[command(about = "LED-UP access ledger CLI")]
struct Cli {
    #[arg(long, default_value = "./ledup_access.sqlite3")]
    db: PathBuf,

    /// Filter used when `RUST_LOG` is unset.
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Logs {
        #[command(subcommand)]
        command: Box<LogsCommand>,
    },
    Reads {
        #[command(subcommand)]
        command: Box<ReadsCommand>,
    },
    Access {
        #[command(subcommand)]
        command: Box<AccessCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Export(DbExportArgs),
    Import(DbImportArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    signing_key_file: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct DbImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
    /// Pass `--skip-existing false` to fail on rows already in the archive.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    skip_existing: bool,
    #[arg(long)]
    verify_key_file: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    allow_unsigned: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum LogsCommand {
    /// Archive logs from a JSON array or NDJSON file.
    Import(LogsImportArgs),
    List(ContractArgs),
    /// Pull logs for a block window from another archive.
    Sync(LogsSyncArgs),
}

#[derive(Debug, Args)]
struct ContractArgs {
    #[arg(long)]
    contract: String,
}

#[derive(Debug, Args)]
struct LogsImportArgs {
    #[arg(long)]
    contract: String,
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
struct LogsSyncArgs {
    #[arg(long)]
    contract: String,
    #[arg(long)]
    source_db: PathBuf,
    #[arg(long)]
    from_block: Option<u64>,
    #[arg(long)]
    to_block: u64,
}

#[derive(Debug, Subcommand)]
enum ReadsCommand {
    Record(ReadsRecordArgs),
    List(ContractArgs),
}

#[derive(Debug, Args)]
struct ReadsRecordArgs {
    #[arg(long)]
    contract: String,
    #[arg(long)]
    record_id: String,
    #[arg(long)]
    subject: String,
    #[arg(long)]
    has_access: bool,
    #[arg(long)]
    expiration: i64,
    #[arg(long)]
    level: LevelArg,
    #[arg(long, default_value_t = false)]
    revoked: bool,
    #[arg(long)]
    observed_at_block: Option<u64>,
}

#[derive(Debug, Subcommand)]
enum AccessCommand {
    SharedWithMe(SharedWithMeArgs),
    Consumers(RecordArgs),
    ActiveCount(RecordArgs),
    History(RecordArgs),
    RecordsOf(RecordsOfArgs),
    Check(CheckArgs),
}

#[derive(Debug, Args)]
struct ScopeArgs {
    #[arg(long)]
    contract: String,
    #[arg(long)]
    as_of: Option<String>,
    #[arg(long, value_enum, default_value_t = PolicyArg::AuthoritativeWins)]
    policy: PolicyArg,
}

#[derive(Debug, Args)]
struct SharedWithMeArgs {
    #[command(flatten)]
    scope: ScopeArgs,
    #[arg(long)]
    subject: String,
    #[arg(long, default_value_t = false)]
    include_revoked: bool,
    #[arg(long, default_value_t = false)]
    active_only: bool,
}

#[derive(Debug, Args)]
struct RecordArgs {
    #[command(flatten)]
    scope: ScopeArgs,
    #[arg(long)]
    record_id: String,
}

#[derive(Debug, Args)]
struct RecordsOfArgs {
    #[command(flatten)]
    scope: ScopeArgs,
    #[arg(long)]
    producer: String,
}

#[derive(Debug, Args)]
struct CheckArgs {
    #[command(flatten)]
    scope: ScopeArgs,
    #[arg(long)]
    record_id: String,
    #[arg(long)]
    subject: String,
    #[arg(long, value_enum, default_value_t = LevelArg::Read)]
    required: LevelArg,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LevelArg {
    #[value(name = "none")]
    NoAccess,
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PolicyArg {
    AuthoritativeWins,
    EventsOnly,
}

impl LevelArg {
    fn into_level(self) -> AccessLevel {
        match self {
            Self::NoAccess => AccessLevel::None,
            Self::Read => AccessLevel::Read,
            Self::Write => AccessLevel::Write,
        }
    }
}

impl PolicyArg {
    fn into_policy(self) -> MergePolicy {
        match self {
            Self::AuthoritativeWins => MergePolicy::AuthoritativeWins,
            Self::EventsOnly => MergePolicy::EventsOnly,
        }
    }
}

impl ScopeArgs {
    fn into_scope(self) -> Result<ViewScope> {
        let mut scope = ViewScope::new(parse_address(&self.contract)?)
            .with_policy(self.policy.into_policy());
        if let Some(raw) = self.as_of.as_deref() {
            scope = scope.at(parse_rfc3339(raw)?);
        }
        Ok(scope)
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit<T: serde::Serialize>(value: &T) -> Result<()> {
    emit_json(serde_json::to_value(value).context("failed to serialize command output")?)
}

fn init_tracing(fallback: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .map_err(|err| anyhow!("invalid log filter `{fallback}`: {err}"))?;

    // stdout carries the JSON contract; diagnostics go to stderr.
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(true))
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(*command, &mut store)
        }
        Command::Logs { command } => run_logs(*command, &cli.db),
        Command::Reads { command } => run_reads(*command, &cli.db),
        Command::Access { command } => run_access(*command, &AccessLedgerApi::new(cli.db)),
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Export(args) => run_db_export(&args, store),
        DbCommand::Import(args) => run_db_import(&args, store),
        DbCommand::Backup(args) => run_db_backup(&args, store),
        DbCommand::Restore(args) => run_db_restore(&args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty(),
        "inferred_from_legacy": status.inferred_from_legacy
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions,
            "inferred_from_legacy": before.inferred_from_legacy
        }))?;
        return Ok(());
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_export(args: &DbExportArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let manifest = store.export_snapshot(&args.out)?;

    let signed = if let Some(key_path) = args.signing_key_file.as_ref() {
        let signing_key = read_hex_key_file(key_path)?;
        let manifest_path = args.out.join(MANIFEST_FILE);
        let manifest_bytes = fs::read(&manifest_path)
            .with_context(|| format!("failed to read manifest file {}", manifest_path.display()))?;
        write_manifest_signature(&args.out, &manifest_bytes, &signing_key)?;
        true
    } else {
        remove_if_exists(&args.out.join(MANIFEST_SIG_FILE))?;
        false
    };

    emit_json(serde_json::json!({
        "out_dir": args.out,
        "signed": signed,
        "manifest": manifest
    }))
}

fn run_db_import(args: &DbImportArgs, store: &mut SqliteStore) -> Result<()> {
    let verify_key =
        args.verify_key_file.as_ref().map(|path| read_hex_key_file(path)).transpose()?;
    check_import_signature(&args.input, verify_key.as_ref(), args.allow_unsigned)?;

    let summary = store.import_snapshot(&args.input, args.skip_existing)?;
    emit_json(serde_json::json!({
        "in_dir": args.input,
        "skip_existing": args.skip_existing,
        "summary": summary
    }))
}

fn run_db_backup(args: &DbBackupArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    store.backup_database(&args.out)?;
    emit_json(serde_json::json!({
        "backup_path": args.out,
        "status": "ok"
    }))
}

fn run_db_restore(args: &DbRestoreArgs, store: &mut SqliteStore) -> Result<()> {
    store.restore_database(&args.input)?;
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "restored_from": args.input,
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions
    }))
}

fn run_db_integrity_check(store: &SqliteStore) -> Result<()> {
    let report = store.integrity_check()?;
    emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
}

fn run_logs(command: LogsCommand, db: &Path) -> Result<()> {
    match command {
        LogsCommand::Import(args) => {
            let api = AccessLedgerApi::new(db.to_path_buf());
            let logs = read_raw_logs(&args.file)?;
            let result = api.ingest_logs(IngestLogsRequest {
                contract: parse_address(&args.contract)?,
                logs,
            })?;
            emit(&result)
        }
        LogsCommand::List(args) => {
            let contract = parse_address(&args.contract)?;
            let mut store = SqliteStore::open(db)?;
            store.migrate()?;
            let logs = store.list_logs(&contract)?;
            emit_json(serde_json::json!({
                "contract": contract,
                "checkpoint": store.checkpoint(&contract)?,
                "logs": logs
            }))
        }
        LogsCommand::Sync(args) => {
            let api = AccessLedgerApi::new(db.to_path_buf());
            let mut source = SqliteStore::open(&args.source_db)?;
            source.migrate()?;
            let result = api.sync_from(
                &source,
                SyncRequest {
                    contract: parse_address(&args.contract)?,
                    from_block: args.from_block,
                    to_block: args.to_block,
                },
            )?;
            emit(&result)
        }
    }
}

fn run_reads(command: ReadsCommand, db: &Path) -> Result<()> {
    match command {
        ReadsCommand::Record(args) => {
            let api = AccessLedgerApi::new(db.to_path_buf());
            let recorded = api.record_read(RecordReadRequest {
                contract: parse_address(&args.contract)?,
                record_id: parse_record_id(&args.record_id)?,
                subject: parse_address(&args.subject)?,
                read: AuthoritativeRead {
                    has_access: args.has_access,
                    expiration: args.expiration,
                    access_level: args.level.into_level(),
                    is_revoked: args.revoked,
                    observed_at_block: args.observed_at_block,
                },
            })?;
            emit(&recorded)
        }
        ReadsCommand::List(args) => {
            let contract = parse_address(&args.contract)?;
            let mut store = SqliteStore::open(db)?;
            store.migrate()?;
            let reads = store.list_reads(Some(&contract))?;
            emit_json(serde_json::json!({ "contract": contract, "reads": reads }))
        }
    }
}

fn run_access(command: AccessCommand, api: &AccessLedgerApi) -> Result<()> {
    match command {
        AccessCommand::SharedWithMe(args) => {
            let filter = if args.active_only {
                ShareFilter::active_only()
            } else {
                ShareFilter { include_revoked: args.include_revoked, ..ShareFilter::default() }
            };
            emit(&api.shared_with_me(SharedWithMeRequest {
                scope: args.scope.into_scope()?,
                subject: parse_address(&args.subject)?,
                filter,
            })?)
        }
        AccessCommand::Consumers(args) => emit(&api.consumers_of(record_request(args)?)?),
        AccessCommand::ActiveCount(args) => {
            emit(&api.active_share_count(record_request(args)?)?)
        }
        AccessCommand::History(args) => emit(&api.access_history(record_request(args)?)?),
        AccessCommand::RecordsOf(args) => emit(&api.records_of(RecordsOfRequest {
            scope: args.scope.into_scope()?,
            producer: parse_address(&args.producer)?,
        })?),
        AccessCommand::Check(args) => emit(&api.check_access(CheckAccessRequest {
            scope: args.scope.into_scope()?,
            record_id: parse_record_id(&args.record_id)?,
            subject: parse_address(&args.subject)?,
            required: args.required.into_level(),
        })?),
    }
}

fn record_request(args: RecordArgs) -> Result<RecordViewRequest> {
    Ok(RecordViewRequest {
        scope: args.scope.into_scope()?,
        record_id: parse_record_id(&args.record_id)?,
    })
}

fn read_raw_logs(path: &Path) -> Result<Vec<RawLog>> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read log file {}", path.display()))?;

    if body.trim_start().starts_with('[') {
        return serde_json::from_str(&body)
            .with_context(|| format!("failed to parse JSON log array {}", path.display()));
    }

    let mut logs = Vec::new();
    for (index, line) in body.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let log = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse log on line {} of {}", index + 1, path.display())
        })?;
        logs.push(log);
    }
    Ok(logs)
}

fn read_hex_key_file(path: &Path) -> Result<[u8; 32]> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read key file {}", path.display()))?;
    let trimmed = body.trim();
    let bytes = hex::decode(trimmed)
        .with_context(|| format!("key file must contain hex bytes: {}", path.display()))?;
    if bytes.len() != 32 {
        return Err(anyhow!(
            "key file {} must decode to exactly 32 bytes (got {})",
            path.display(),
            bytes.len()
        ));
    }

    let mut key = [0_u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

fn write_manifest_signature(out_dir: &Path, manifest_bytes: &[u8], key: &[u8; 32]) -> Result<()> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|err| anyhow!("failed to initialize signature key: {err}"))?;
    mac.update(manifest_bytes);
    let signature_hex = hex::encode(mac.finalize().into_bytes());
    let signature_path = out_dir.join(MANIFEST_SIG_FILE);
    fs::write(&signature_path, signature_hex)
        .with_context(|| format!("failed to write manifest signature {}", signature_path.display()))
}

fn verify_manifest_signature(in_dir: &Path, manifest_bytes: &[u8], key: &[u8; 32]) -> Result<()> {
    let signature_path = in_dir.join(MANIFEST_SIG_FILE);
    let signature_body = fs::read_to_string(&signature_path).with_context(|| {
        format!("failed to read manifest signature file {}", signature_path.display())
    })?;
    let signature = hex::decode(signature_body.trim()).with_context(|| {
        format!("manifest signature file is not valid hex: {}", signature_path.display())
    })?;

    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|err| anyhow!("failed to initialize signature verification key: {err}"))?;
    mac.update(manifest_bytes);
    mac.verify_slice(&signature).map_err(|_| {
        anyhow!("manifest signature verification failed for {}", signature_path.display())
    })
}

fn check_import_signature(
    input_dir: &Path,
    verify_key: Option<&[u8; 32]>,
    allow_unsigned: bool,
) -> Result<()> {
    let manifest_path = input_dir.join(MANIFEST_FILE);
    let manifest_bytes = fs::read(&manifest_path)
        .with_context(|| format!("failed to read manifest {}", manifest_path.display()))?;

    let signature_path = input_dir.join(MANIFEST_SIG_FILE);
    if signature_path.exists() {
        let key = verify_key.ok_or_else(|| {
            anyhow!(
                "snapshot is signed; provide --verify-key-file to verify {}",
                signature_path.display()
            )
        })?;
        return verify_manifest_signature(input_dir, &manifest_bytes, key);
    }

    if !allow_unsigned {
        return Err(anyhow!(
            "snapshot is unsigned; rerun with --allow-unsigned for explicit override"
        ));
    }
    tracing::warn!(in_dir = %input_dir.display(), "importing unsigned snapshot");
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)
            .with_context(|| format!("failed to remove file {}", path.display()))?;
    }
    Ok(())
}

fn parse_address(value: &str) -> Result<Address> {
    Address::parse(value).with_context(|| format!("invalid address argument: {value}"))
}

fn parse_record_id(value: &str) -> Result<RecordId> {
    RecordId::new(value).with_context(|| format!("invalid record id argument: {value:?}"))
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 UTC timestamp: {value}"))?;

    if parsed.offset() != time::UtcOffset::UTC {
        return Err(anyhow!("timestamp MUST use UTC offset Z (received: {value})"));
    }

    Ok(parsed)
}
