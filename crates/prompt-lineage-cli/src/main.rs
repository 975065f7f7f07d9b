use std::fs;
use std::io::{self, BufRead, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use prompt_lineage_core::{CredentialCipher, MethodologyId, MethodologyKind, PromptId};
use prompt_lineage_store_sqlite::{
    ContinueOnFailure, FailureHandler, LineageManager, MigrationEngine, MigrationFailure,
    MigrationRegistry, RecoveryDecision, ResetOnFailure, SaveMode, SqliteStore,
};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

mod cipher;
mod transform;

use cipher::PassphraseCipher;
use transform::CommandTransform;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const LOG_ENV: &str = "PL_LOG";
const DEFAULT_LOG_FILTER: &str = "warn";

#[derive(Debug, Parser)]
#[command(name = "pl")]
#[command(about = "Prompt Lineage CLI")]
struct Cli {
    #[arg(long, env = "PL_DB", default_value = "./prompt_lineage.sqlite3")]
    db: PathBuf,

    /// Load migration units from `<dir>/index.json` instead of the bundled set.
    #[arg(long, env = "PL_MIGRATIONS_DIR")]
    migrations_dir: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = OnFailureArg::Continue)]
    on_failure: OnFailureArg,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Prompt {
        #[command(subcommand)]
        command: Box<PromptCommand>,
    },
    Methodology {
        #[command(subcommand)]
        command: Box<MethodologyCommand>,
    },
    Apply(Box<ApplyArgs>),
    Credential {
        #[command(subcommand)]
        command: Box<CredentialCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    Status,
    Migrate(DbMigrateArgs),
    Reset(DbResetArgs),
    IntegrityCheck,
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    Export(DbExportArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbResetArgs {
    /// Confirm dropping every table, including the migration ledger.
    #[arg(long, default_value_t = false)]
    yes: bool,
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

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Subcommand)]
enum PromptCommand {
    Save(PromptSaveArgs),
    Show(PromptIdArgs),
    History(PromptHistoryArgs),
    Lineage(PromptLineageArgs),
    Latest(PromptLatestArgs),
    Delete(PromptIdArgs),
}

/// Prompt text from `--content`, `--file`, or stdin when neither is given.
#[derive(Debug, Args)]
struct ContentArgs {
    #[arg(long, conflicts_with = "file")]
    content: Option<String>,
    #[arg(long)]
    file: Option<PathBuf>,
}

impl ContentArgs {
    fn reads_stdin(&self) -> bool {
        self.content.is_none() && self.file.is_none()
    }
}

#[derive(Debug, Args)]
struct PromptSaveArgs {
    #[command(flatten)]
    input: ContentArgs,
    #[arg(long, default_value_t = false, conflicts_with = "lineage")]
    new_lineage: bool,
    /// Continue the lineage rooted at this id instead of the global latest record.
    #[arg(long)]
    lineage: Option<i64>,
}

#[derive(Debug, Args)]
struct PromptIdArgs {
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Args)]
struct PromptHistoryArgs {
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

#[derive(Debug, Args)]
struct PromptLineageArgs {
    #[arg(long)]
    root: i64,
}

#[derive(Debug, Args)]
struct PromptLatestArgs {
    /// List the newest version of every lineage instead of the single latest record.
    #[arg(long, default_value_t = false)]
    per_lineage: bool,
}

#[derive(Debug, Subcommand)]
enum MethodologyCommand {
    List(MethodologyListArgs),
    Show(MethodologyShowArgs),
}

#[derive(Debug, Args)]
struct MethodologyListArgs {
    #[arg(long, value_enum)]
    kind: Option<MethodologyKindArg>,
}

#[derive(Debug, Args)]
#[command(group(clap::ArgGroup::new("selector").required(true).args(["id", "name"])))]
struct MethodologyShowArgs {
    #[arg(long)]
    id: Option<i64>,
    #[arg(long)]
    name: Option<String>,
}

#[derive(Debug, Args)]
struct ApplyArgs {
    #[arg(long)]
    methodology: String,
    #[command(flatten)]
    input: ContentArgs,
    /// Program that reads the prompt on stdin and writes the transformed prompt to stdout.
    #[arg(long)]
    transform_cmd: String,
    #[arg(long = "transform-arg", allow_hyphen_values = true)]
    transform_args: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum CredentialCommand {
    Set(CredentialSetArgs),
    Get(CredentialGetArgs),
    Delete(CredentialProviderArgs),
    List,
}

#[derive(Debug, Args)]
struct CredentialSetArgs {
    #[arg(long)]
    provider: String,
    /// Environment variable holding the secret to seal.
    #[arg(long)]
    secret_env: String,
    #[arg(long)]
    passphrase_env: String,
}

#[derive(Debug, Args)]
struct CredentialGetArgs {
    #[arg(long)]
    provider: String,
    #[arg(long)]
    passphrase_env: String,
}

#[derive(Debug, Args)]
struct CredentialProviderArgs {
    #[arg(long)]
    provider: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OnFailureArg {
    Continue,
    Reset,
    Ask,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MethodologyKindArg {
    Intent,
    Technique,
    Evasion,
}

impl From<MethodologyKindArg> for MethodologyKind {
    fn from(value: MethodologyKindArg) -> Self {
        match value {
            MethodologyKindArg::Intent => Self::Intent,
            MethodologyKindArg::Technique => Self::Technique,
            MethodologyKindArg::Evasion => Self::Evasion,
        }
    }
}

/// Asks on stderr whether to reset the store after a failed unit.
struct AskOnFailure;

impl FailureHandler for AskOnFailure {
    fn on_failure(&mut self, failure: &MigrationFailure) -> RecoveryDecision {
        eprint!(
            "migration unit {} failed: {}\nreset the store and drop all data? [y/N] ",
            failure.unit, failure.message
        );
        if io::stderr().flush().is_err() {
            return RecoveryDecision::Continue;
        }

        let mut answer = String::new();
        match io::stdin().lock().read_line(&mut answer) {
            Ok(_) if matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes") => {
                RecoveryDecision::ResetStore
            }
            _ => RecoveryDecision::Continue,
        }
    }
}

fn failure_handler(policy: OnFailureArg) -> Box<dyn FailureHandler> {
    match policy {
        OnFailureArg::Continue => Box::new(ContinueOnFailure),
        OnFailureArg::Reset => Box::new(ResetOnFailure),
        OnFailureArg::Ask => Box::new(AskOnFailure),
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
        other => json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    // A second init only happens under test harnesses; keep the first subscriber.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr).try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    if matches!(cli.on_failure, OnFailureArg::Ask) && reads_content_from_stdin(&cli.command) {
        bail!("--on-failure ask needs stdin for its answer; pass the prompt with --content or --file");
    }
    let registry = load_registry(cli.migrations_dir.as_deref())?;

    match cli.command {
        Command::Db { command } => {
            let mut store = open_store(&cli.db)?;
            run_db(*command, &mut store, &registry, cli.on_failure)
        }
        Command::Prompt { command } => {
            let mut store = open_migrated_store(&cli.db, &registry, cli.on_failure)?;
            run_prompt(*command, &mut store)
        }
        Command::Methodology { command } => {
            let store = open_migrated_store(&cli.db, &registry, cli.on_failure)?;
            run_methodology(*command, &store)
        }
        Command::Apply(args) => {
            let mut store = open_migrated_store(&cli.db, &registry, cli.on_failure)?;
            run_apply(*args, &mut store)
        }
        Command::Credential { command } => {
            let mut store = open_migrated_store(&cli.db, &registry, cli.on_failure)?;
            run_credential(*command, &mut store)
        }
    }
}

fn reads_content_from_stdin(command: &Command) -> bool {
    match command {
        Command::Prompt { command } => {
            matches!(&**command, PromptCommand::Save(args) if args.input.reads_stdin())
        }
        Command::Apply(args) => args.input.reads_stdin(),
        _ => false,
    }
}

fn load_registry(dir: Option<&Path>) -> Result<MigrationRegistry> {
    match dir {
        Some(dir) => MigrationRegistry::from_index_dir(dir)
            .with_context(|| format!("failed to load migration units from {}", dir.display())),
        None => MigrationRegistry::bundled().context("failed to load bundled migration units"),
    }
}

fn open_store(path: &Path) -> Result<SqliteStore> {
    SqliteStore::open(path)
        .with_context(|| format!("failed to open prompt store {}", path.display()))
}

fn open_migrated_store(
    path: &Path,
    registry: &MigrationRegistry,
    policy: OnFailureArg,
) -> Result<SqliteStore> {
    let mut store = open_store(path)?;
    let mut handler = failure_handler(policy);
    let report = MigrationEngine::new(registry)
        .run(&mut store, handler.as_mut())
        .context("failed to run migrations")?;
    if report.reset_performed {
        bail!("a migration unit failed and the store was reset; fix the unit and rerun");
    }
    report.into_result().context("prompt store schema is incomplete")?;
    Ok(store)
}

fn read_content(input: &ContentArgs) -> Result<String> {
    if let Some(content) = input.content.as_ref() {
        return Ok(content.clone());
    }
    if let Some(path) = input.file.as_ref() {
        return fs::read_to_string(path)
            .with_context(|| format!("failed to read prompt file {}", path.display()));
    }

    let mut content = String::new();
    io::stdin().read_to_string(&mut content).context("failed to read prompt from stdin")?;
    Ok(content)
}

fn run_db(
    command: DbCommand,
    store: &mut SqliteStore,
    registry: &MigrationRegistry,
    policy: OnFailureArg,
) -> Result<()> {
    match command {
        DbCommand::Status => run_db_status(store, registry),
        DbCommand::Migrate(args) => run_db_migrate(&args, store, registry, policy),
        DbCommand::Reset(args) => run_db_reset(&args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
        DbCommand::Backup(args) => run_db_backup(&args, store),
        DbCommand::Restore(args) => run_db_restore(&args, store, registry, policy),
        DbCommand::Export(args) => run_db_export(&args, store, registry, policy),
    }
}

fn run_db_status(store: &SqliteStore, registry: &MigrationRegistry) -> Result<()> {
    let status = store.schema_status_for(registry)?;
    emit_json(json!({
        "applied": status.applied,
        "pending": status.pending,
        "unknown": status.unknown,
        "up_to_date": status.up_to_date
    }))
}

fn run_db_migrate(
    args: &DbMigrateArgs,
    store: &mut SqliteStore,
    registry: &MigrationRegistry,
    policy: OnFailureArg,
) -> Result<()> {
    if args.dry_run {
        emit_json(json!({
            "dry_run": true,
            "would_apply": store.pending_migrations(registry)?
        }))?;
        return Ok(());
    }

    let mut handler = failure_handler(policy);
    let report = MigrationEngine::new(registry).run(store, handler.as_mut())?;
    let status = store.schema_status_for(registry)?;
    emit_json(json!({
        "dry_run": false,
        "applied": report.applied(),
        "outcomes": report.outcomes,
        "failures": report.failures,
        "reset_performed": report.reset_performed,
        "up_to_date": status.up_to_date
    }))?;

    if report.reset_performed {
        bail!("a migration unit failed and the store was reset");
    }
    report.into_result()?;
    Ok(())
}

fn run_db_reset(args: &DbResetArgs, store: &mut SqliteStore) -> Result<()> {
    if !args.yes {
        bail!("refusing to reset the store without --yes");
    }
    let dropped = store.reset_store()?;
    emit_json(json!({ "dropped": dropped }))
}

fn run_db_integrity_check(store: &SqliteStore) -> Result<()> {
    let report = store.integrity_check()?;
    emit_json(serde_json::to_value(report)?)
}

fn run_db_backup(args: &DbBackupArgs, store: &SqliteStore) -> Result<()> {
    store.backup_database(&args.out)?;
    emit_json(json!({ "backup_path": args.out.display().to_string() }))
}

fn run_db_restore(
    args: &DbRestoreArgs,
    store: &mut SqliteStore,
    registry: &MigrationRegistry,
    policy: OnFailureArg,
) -> Result<()> {
    let mut handler = failure_handler(policy);
    let report = store.restore_database_with(&args.input, registry, handler.as_mut())?;
    let status = store.schema_status_for(registry)?;
    emit_json(json!({
        "restored_from": args.input.display().to_string(),
        "applied": report.applied(),
        "failures": report.failures,
        "reset_performed": report.reset_performed,
        "up_to_date": status.up_to_date
    }))?;

    if report.reset_performed {
        bail!("a migration unit failed after restore and the store was reset");
    }
    report.into_result()?;
    Ok(())
}

fn run_db_export(
    args: &DbExportArgs,
    store: &mut SqliteStore,
    registry: &MigrationRegistry,
    policy: OnFailureArg,
) -> Result<()> {
    let mut handler = failure_handler(policy);
    MigrationEngine::new(registry).run(store, handler.as_mut())?.into_result()?;
    let manifest = store.export_snapshot(&args.out)?;
    emit_json(json!({
        "export_dir": args.out.display().to_string(),
        "manifest": manifest
    }))
}

fn run_prompt(command: PromptCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        PromptCommand::Save(args) => {
            let content = read_content(&args.input)?;
            let mode = match (args.new_lineage, args.lineage) {
                (true, _) => SaveMode::NewLineage,
                (false, Some(root)) => SaveMode::ContinueLineage(PromptId(root)),
                (false, None) => SaveMode::Continue,
            };
            let record = LineageManager::new(store).save(&content, mode)?;
            emit_json(json!({ "prompt": record }))
        }
        PromptCommand::Show(args) => {
            let record = store.get_prompt(PromptId(args.id))?;
            emit_json(json!({ "prompt": record }))
        }
        PromptCommand::History(args) => {
            let records = store.history(args.limit)?;
            emit_json(json!({ "limit": args.limit, "prompts": records }))
        }
        PromptCommand::Lineage(args) => {
            let records = store.by_lineage(PromptId(args.root))?;
            emit_json(json!({ "lineage_root": args.root, "prompts": records }))
        }
        PromptCommand::Latest(args) => {
            if args.per_lineage {
                emit_json(json!({ "prompts": store.latest_per_lineage()? }))
            } else {
                emit_json(json!({ "prompt": store.latest_prompt()? }))
            }
        }
        PromptCommand::Delete(args) => {
            let summary = store.delete_prompt(PromptId(args.id))?;
            emit_json(json!({ "deleted": summary }))
        }
    }
}

fn run_methodology(command: MethodologyCommand, store: &SqliteStore) -> Result<()> {
    match command {
        MethodologyCommand::List(args) => {
            let methodologies = store.list_methodologies(args.kind.map(MethodologyKind::from))?;
            emit_json(json!({ "methodologies": methodologies }))
        }
        MethodologyCommand::Show(args) => {
            let methodology = match (args.id, args.name.as_deref()) {
                (Some(id), _) => store.get_methodology(MethodologyId(id))?,
                (None, Some(name)) => store.get_methodology_by_name(name)?,
                (None, None) => return Err(anyhow!("either --id or --name is required")),
            };
            emit_json(json!({ "methodology": methodology }))
        }
    }
}

fn run_apply(args: ApplyArgs, store: &mut SqliteStore) -> Result<()> {
    let content = read_content(&args.input)?;
    let methodology = store.get_methodology_by_name(&args.methodology)?;
    let mut transform = CommandTransform::new(args.transform_cmd, args.transform_args);
    let mut progress = |line: &str| eprintln!("{line}");

    let record = LineageManager::new(store)
        .apply_methodology(&content, &methodology, &mut transform, &mut progress)
        .with_context(|| format!("failed to apply methodology {}", methodology.name))?;
    emit_json(json!({
        "checkpoint_id": record.parent_id,
        "methodology": methodology.name,
        "prompt": record
    }))
}

fn run_credential(command: CredentialCommand, store: &mut SqliteStore) -> Result<()> {
    let cipher = PassphraseCipher::default();
    match command {
        CredentialCommand::Set(args) => {
            let secret = read_env(&args.secret_env)?;
            let passphrase = read_env(&args.passphrase_env)?;
            let sealed = cipher.encrypt(secret.as_bytes(), &passphrase)?;
            store.put_credential(&args.provider, &sealed)?;
            emit_json(json!({ "provider": args.provider.trim(), "stored": true }))
        }
        CredentialCommand::Get(args) => {
            let passphrase = read_env(&args.passphrase_env)?;
            let sealed = store
                .get_credential(&args.provider)?
                .ok_or_else(|| anyhow!("no credential stored for provider {}", args.provider))?;
            let secret = String::from_utf8(cipher.decrypt(&sealed, &passphrase)?)
                .context("stored credential is not valid UTF-8")?;
            emit_json(json!({ "provider": args.provider.trim(), "secret": secret }))
        }
        CredentialCommand::Delete(args) => {
            let deleted = store.delete_credential(&args.provider)?;
            emit_json(json!({ "provider": args.provider.trim(), "deleted": deleted }))
        }
        CredentialCommand::List => {
            emit_json(json!({ "providers": store.list_credential_providers()? }))
        }
    }
}

fn read_env(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("environment variable {name} is not set"))
}
