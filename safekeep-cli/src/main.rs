/*!
Safekeep CLI - Command-line interface for the safekeep backup pipeline.

This CLI creates, inspects, verifies and restores backups of the live
store, edits the persisted backup config and drives the scheduler.
*/

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use safekeep_core::encryption::EncryptionKey;
use safekeep_core::{
    gather_metrics, init_default_observability, init_observability, BackupConfig,
    BackupConfigPatch, BackupFilter, BackupFrequency, BackupOptions, BackupOrchestrator,
    BackupRecord, BackupScheduler, BackupType, JsonFileCatalog, KeyProvider, OperationOutcome,
    PipelineConfig, RecordStatus, RestoreOptions, RestoreOrchestrator, RestoreRecord,
    DEFAULT_LOG_DIRECTIVE,
};
use std::path::PathBuf;
use std::sync::Arc;
use tabled::{Table, Tabled};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "safekeep")]
#[command(about = "Backup and restore for the school data store")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "SAFEKEEP_LOG_JSON")]
    log_json: bool,

    /// Print Prometheus metrics after the command (requires the metrics feature)
    #[arg(long, global = true)]
    metrics: bool,

    /// JSON pipeline config file
    #[arg(short, long, global = true, env = "SAFEKEEP_CONFIG")]
    config: Option<PathBuf>,

    /// Live store path
    #[arg(long, global = true, env = "SAFEKEEP_DATABASE_PATH")]
    database: Option<PathBuf>,

    /// Backup artifact directory
    #[arg(long, global = true, env = "SAFEKEEP_BACKUP_DIR")]
    backup_dir: Option<PathBuf>,

    /// Catalog file holding backup and restore records
    #[arg(long, global = true, env = "SAFEKEEP_CATALOG_PATH")]
    catalog: Option<PathBuf>,

    /// User id recorded on backups and restores
    #[arg(long = "by", global = true, env = "SAFEKEEP_USER", default_value = "cli")]
    user: String,

    /// Bucket for cloud uploads (requires the s3 feature)
    #[arg(long, global = true, env = "SAFEKEEP_S3_BUCKET")]
    s3_bucket: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and manage backups
    #[command(subcommand)]
    Backup(BackupCommand),
    /// Restore the live store from a backup
    Restore {
        /// Backup identifier
        backup_id: String,
        /// Skip the pre-restore safety backup
        #[arg(long)]
        no_safety_backup: bool,
        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
    /// Inspect restore history
    #[command(subcommand)]
    Restores(RestoresCommand),
    /// Show aggregate backup statistics
    Stats,
    /// Show or edit the backup config
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Run or inspect scheduled backups
    #[command(subcommand)]
    Schedule(ScheduleCommand),
    /// Manage encryption keys
    #[command(subcommand)]
    Key(KeyCommand),
    /// Register an administrator credited with scheduled backups
    AddAdmin {
        /// Administrator user id
        user_id: String,
    },
}

#[derive(Subcommand)]
enum BackupCommand {
    /// Create a backup
    Create {
        #[arg(short = 't', long = "type", value_enum, default_value = "manual")]
        backup_type: TypeArg,
        /// Display name (defaults to "Backup <date>")
        #[arg(short, long)]
        name: Option<String>,
        #[command(flatten)]
        envelope: EnvelopeArgs,
        /// Upload the finished artifact to cloud storage
        #[arg(long)]
        upload: bool,
    },
    /// List backups, newest first
    List {
        #[arg(short = 't', long = "type", value_enum)]
        backup_type: Option<TypeArg>,
        #[arg(short, long, value_enum)]
        status: Option<StatusArg>,
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Show details of a backup
    Show { backup_id: String },
    /// Re-hash a backup's artifact against its recorded checksum
    Verify { backup_id: String },
    /// Delete a backup and its artifact
    Delete {
        backup_id: String,
        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
    /// Copy a backup's artifact to a file or directory
    Export {
        backup_id: String,
        destination: PathBuf,
    },
    /// Apply retention rules now
    Prune,
}

#[derive(Args)]
struct EnvelopeArgs {
    /// Encrypt the artifact (default: backup config)
    #[arg(long, conflicts_with = "no_encrypt")]
    encrypt: bool,
    /// Do not encrypt the artifact
    #[arg(long)]
    no_encrypt: bool,
    /// Do not compress the artifact
    #[arg(long)]
    no_compress: bool,
}

impl EnvelopeArgs {
    fn options(&self, upload: bool) -> BackupOptions {
        let mut options = BackupOptions::new().compress(!self.no_compress);
        if self.encrypt {
            options = options.encrypt(true);
        } else if self.no_encrypt {
            options = options.encrypt(false);
        }
        if upload {
            options = options.upload_to_cloud(true);
        }
        options
    }
}

#[derive(Subcommand)]
enum RestoresCommand {
    /// List restores, newest first
    List {
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Show details of a restore
    Show { restore_id: String },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the backup config
    Show,
    /// Update backup config fields
    Set {
        #[arg(long)]
        encryption: Option<bool>,
        #[arg(long)]
        auto_backup: Option<bool>,
        #[arg(long, value_enum)]
        frequency: Option<FrequencyArg>,
        /// Time of day as HH:MM
        #[arg(long)]
        time: Option<String>,
        #[arg(long)]
        cloud_storage: Option<bool>,
        #[arg(long)]
        auto_sync: Option<bool>,
        #[arg(long)]
        sync_interval: Option<u32>,
        #[arg(long)]
        retention_days: Option<u32>,
        #[arg(long)]
        max_backups: Option<u32>,
    },
    /// Record the current key as the expected encryption key
    RotateKey,
}

#[derive(Subcommand)]
enum ScheduleCommand {
    /// Arm the scheduler and run until interrupted
    Run,
    /// Run the scheduled backup job once, now
    RunNow,
    /// Print the next scheduled run time
    Next,
}

#[derive(Subcommand)]
enum KeyCommand {
    /// Print the active key as hex
    Export,
    /// Generate a new random key
    Generate,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum TypeArg {
    Full,
    Incremental,
    Manual,
}

impl From<TypeArg> for BackupType {
    fn from(value: TypeArg) -> Self {
        match value {
            TypeArg::Full => BackupType::Full,
            TypeArg::Incremental => BackupType::Incremental,
            TypeArg::Manual => BackupType::Manual,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum StatusArg {
    InProgress,
    Completed,
    Failed,
}

impl From<StatusArg> for RecordStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::InProgress => RecordStatus::InProgress,
            StatusArg::Completed => RecordStatus::Completed,
            StatusArg::Failed => RecordStatus::Failed,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FrequencyArg {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl From<FrequencyArg> for BackupFrequency {
    fn from(value: FrequencyArg) -> Self {
        match value {
            FrequencyArg::Hourly => BackupFrequency::Hourly,
            FrequencyArg::Daily => BackupFrequency::Daily,
            FrequencyArg::Weekly => BackupFrequency::Weekly,
            FrequencyArg::Monthly => BackupFrequency::Monthly,
        }
    }
}

#[derive(Tabled)]
struct BackupRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Type")]
    backup_type: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Envelope")]
    envelope: String,
    #[tabled(rename = "Started")]
    started: String,
    #[tabled(rename = "Size")]
    size: String,
}

impl From<&BackupRecord> for BackupRow {
    fn from(record: &BackupRecord) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            backup_type: record.backup_type.to_string(),
            status: record.status.to_string(),
            envelope: envelope_label(record),
            started: format_timestamp(record.started_at.timestamp()),
            size: record.file_size.map(format_size).unwrap_or_else(|| "-".to_string()),
        }
    }
}

#[derive(Tabled)]
struct RestoreRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Backup")]
    backup_id: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "By")]
    performed_by: String,
    #[tabled(rename = "Started")]
    started: String,
    #[tabled(rename = "Safety Backup")]
    safety_backup: String,
}

impl From<&RestoreRecord> for RestoreRow {
    fn from(record: &RestoreRecord) -> Self {
        Self {
            id: record.id.clone(),
            backup_id: record.backup_record_id.clone(),
            status: record.status.to_string(),
            performed_by: record.performed_by.clone(),
            started: format_timestamp(record.started_at.timestamp()),
            safety_backup: record
                .pre_restore_backup_id
                .clone()
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose, cli.log_json)?;

    let settings = load_settings(&cli)?;
    let catalog = Arc::new(
        JsonFileCatalog::open(&settings.catalog_path)
            .await
            .with_context(|| format!("opening catalog {}", settings.catalog_path.display()))?,
    );
    let keys = KeyProvider::from_env(&settings.encryption_secret_env);
    let backups = build_orchestrator(&cli, settings, catalog.clone(), keys).await?;

    match cli.command {
        Commands::Backup(command) => run_backup_command(&backups, &cli.user, command).await?,
        Commands::Restore {
            backup_id,
            no_safety_backup,
            force,
        } => restore_backup(backups, &cli.user, &backup_id, no_safety_backup, force).await?,
        Commands::Restores(command) => run_restores_command(backups, command).await?,
        Commands::Stats => show_stats(&backups).await?,
        Commands::Config(command) => run_config_command(&backups, &cli.user, command).await?,
        Commands::Schedule(command) => run_schedule_command(backups, command).await?,
        Commands::Key(command) => run_key_command(&backups, command)?,
        Commands::AddAdmin { user_id } => {
            catalog.add_admin(user_id.as_str()).await?;
            println!("✓ Administrator {user_id} registered");
        }
    }

    if cli.metrics {
        print_metrics()?;
    }
    Ok(())
}

fn init_logging(verbose: bool, json: bool) -> Result<(), anyhow::Error> {
    if !verbose && !json {
        return Ok(init_default_observability()?);
    }
    let directive = if verbose { "debug" } else { DEFAULT_LOG_DIRECTIVE };
    init_observability(json, directive)?;
    Ok(())
}

fn print_metrics() -> Result<(), anyhow::Error> {
    match gather_metrics()? {
        Some(text) => print!("{text}"),
        None => eprintln!("Metrics are not available; rebuild with the metrics feature"),
    }
    Ok(())
}

fn load_settings(cli: &Cli) -> Result<PipelineConfig, anyhow::Error> {
    let mut settings = match &cli.config {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::from_env()?,
    };
    if let Some(path) = &cli.database {
        settings.database_path = path.clone();
    }
    if let Some(dir) = &cli.backup_dir {
        settings.backup_dir = dir.clone();
        if cli.catalog.is_none() && cli.config.is_none() {
            settings.catalog_path = dir.join("catalog.json");
        }
    }
    if let Some(path) = &cli.catalog {
        settings.catalog_path = path.clone();
    }
    settings.validate()?;
    Ok(settings)
}

async fn build_orchestrator(
    cli: &Cli,
    settings: PipelineConfig,
    catalog: Arc<JsonFileCatalog>,
    keys: KeyProvider,
) -> Result<Arc<BackupOrchestrator>, anyhow::Error> {
    #[cfg(feature = "s3")]
    let cloud = match &cli.s3_bucket {
        Some(bucket) => {
            let uploader = safekeep_core::S3Uploader::from_env(bucket.as_str()).await?;
            Some(safekeep_core::CloudSync::new(
                Arc::new(uploader),
                settings.upload_timeout(),
            ))
        }
        None => None,
    };
    #[cfg(not(feature = "s3"))]
    let cloud: Option<safekeep_core::CloudSync> = {
        if cli.s3_bucket.is_some() {
            tracing::warn!("S3 support not enabled, cloud uploads are disabled");
        }
        None
    };

    let mut orchestrator = BackupOrchestrator::new(settings, catalog, keys);
    if let Some(cloud) = cloud {
        orchestrator = orchestrator.with_cloud(cloud);
    }
    Ok(Arc::new(orchestrator))
}

async fn run_backup_command(
    backups: &BackupOrchestrator,
    user: &str,
    command: BackupCommand,
) -> Result<(), anyhow::Error> {
    match command {
        BackupCommand::Create {
            backup_type,
            name,
            envelope,
            upload,
        } => {
            let record = backups
                .create_backup(
                    backup_type.into(),
                    user,
                    name.as_deref(),
                    envelope.options(upload),
                )
                .await?;
            println!("✓ Backup created");
            print_backup(&record);
        }
        BackupCommand::List {
            backup_type,
            status,
            limit,
        } => {
            let filter = BackupFilter {
                backup_type: backup_type.map(Into::into),
                status: status.map(Into::into),
                limit,
            };
            let records = backups.list_backups(&filter).await?;
            if records.is_empty() {
                println!("No backups found");
            } else {
                let rows: Vec<BackupRow> = records.iter().map(BackupRow::from).collect();
                println!("{}", Table::new(rows));
            }
        }
        BackupCommand::Show { backup_id } => {
            let record = backups.get_backup(&backup_id).await?;
            print_backup(&record);
        }
        BackupCommand::Verify { backup_id } => {
            info!("Verifying backup: {}", backup_id);
            let result = backups.verify_backup(&backup_id).await;
            report(&OperationOutcome::from_result(
                &result,
                "Backup is valid and integrity check passed",
            ));
            if let Err(safekeep_core::BackupError::ChecksumMismatch { expected, actual }) = &result {
                error!("  Expected hash: {}", expected);
                error!("  Actual hash: {}", actual);
                bail!("Integrity check failed");
            }
            result?;
        }
        BackupCommand::Delete { backup_id, force } => {
            if !force && !confirm(&format!("delete backup '{backup_id}'"))? {
                println!("Deletion cancelled");
                return Ok(());
            }
            backups.delete_backup(&backup_id).await?;
            println!("✓ Backup deleted successfully");
        }
        BackupCommand::Export {
            backup_id,
            destination,
        } => {
            let target = backups.export_artifact(&backup_id, &destination).await?;
            println!("✓ Backup exported to {}", target.display());
        }
        BackupCommand::Prune => {
            let deleted = backups.enforce_retention().await?;
            println!("✓ Retention applied, {} backup(s) deleted", deleted.len());
        }
    }
    Ok(())
}

async fn restore_backup(
    backups: Arc<BackupOrchestrator>,
    user: &str,
    backup_id: &str,
    no_safety_backup: bool,
    force: bool,
) -> Result<(), anyhow::Error> {
    if !force
        && !confirm(&format!(
            "replace the live store with backup '{backup_id}'"
        ))?
    {
        println!("Restore cancelled");
        return Ok(());
    }

    let options = if no_safety_backup {
        RestoreOptions::without_safety_backup()
    } else {
        RestoreOptions::default()
    };
    let restores = RestoreOrchestrator::new(backups);
    let result = restores.restore_from_backup(backup_id, user, options).await;
    report(&OperationOutcome::from_result(&result, "Restore completed"));
    let record = result?;

    println!("  Restore ID: {}", record.id);
    if let Some(safety) = &record.pre_restore_backup_id {
        println!("  Safety backup: {safety}");
    }
    println!("  Restart the application before serving requests from the restored store");
    Ok(())
}

async fn run_restores_command(
    backups: Arc<BackupOrchestrator>,
    command: RestoresCommand,
) -> Result<(), anyhow::Error> {
    let restores = RestoreOrchestrator::new(backups);
    match command {
        RestoresCommand::List { limit } => {
            let records = restores.list_restores(limit).await?;
            if records.is_empty() {
                println!("No restores found");
            } else {
                let rows: Vec<RestoreRow> = records.iter().map(RestoreRow::from).collect();
                println!("{}", Table::new(rows));
            }
        }
        RestoresCommand::Show { restore_id } => {
            let record = restores.get_restore(&restore_id).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
    }
    Ok(())
}

async fn show_stats(backups: &BackupOrchestrator) -> Result<(), anyhow::Error> {
    let stats = backups.get_stats().await?;
    println!("Backup Statistics:");
    println!("  Total: {}", stats.total_backups);
    println!("  Completed: {}", stats.completed_backups);
    println!("  Failed: {}", stats.failed_backups);
    println!("  Storage: {}", format_size(stats.total_storage));
    match &stats.last_backup {
        Some(last) => println!(
            "  Last backup: {} ({})",
            last.name,
            last.completed_at
                .map(|t| format_timestamp(t.timestamp()))
                .unwrap_or_else(|| "-".to_string())
        ),
        None => println!("  Last backup: never"),
    }
    Ok(())
}

async fn run_config_command(
    backups: &BackupOrchestrator,
    user: &str,
    command: ConfigCommand,
) -> Result<(), anyhow::Error> {
    match command {
        ConfigCommand::Show => print_config(&backups.get_config().await?),
        ConfigCommand::Set {
            encryption,
            auto_backup,
            frequency,
            time,
            cloud_storage,
            auto_sync,
            sync_interval,
            retention_days,
            max_backups,
        } => {
            backups.ensure_initialized().await?;
            let patch = BackupConfigPatch {
                encryption_enabled: encryption,
                auto_backup_enabled: auto_backup,
                backup_frequency: frequency.map(Into::into),
                backup_time: time,
                enable_cloud_storage: cloud_storage,
                auto_sync_enabled: auto_sync,
                sync_interval_minutes: sync_interval,
                retention_days,
                max_backups_to_keep: max_backups,
            };
            let updated = backups.update_config(&patch, user).await?;
            println!("✓ Backup config updated");
            print_config(&updated);
        }
        ConfigCommand::RotateKey => {
            let updated = backups.rotate_key_hash(user).await?;
            println!("✓ Encryption key hash rotated");
            print_config(&updated);
        }
    }
    Ok(())
}

async fn run_schedule_command(
    backups: Arc<BackupOrchestrator>,
    command: ScheduleCommand,
) -> Result<(), anyhow::Error> {
    let scheduler = BackupScheduler::new(backups);
    match command {
        ScheduleCommand::Run => {
            if !scheduler.initialize().await? {
                bail!("Auto backup is disabled; enable it with `safekeep config set --auto-backup true`");
            }
            if let Some(next) = scheduler.next_backup_time().await? {
                println!("Scheduler armed, next backup at {}", format_timestamp(next.timestamp()));
            }
            tokio::signal::ctrl_c().await?;
            scheduler.stop();
            println!("Scheduler stopped");
        }
        ScheduleCommand::RunNow => {
            let record = scheduler.run_now().await?;
            println!("✓ Scheduled backup completed");
            print_backup(&record);
        }
        ScheduleCommand::Next => match scheduler.next_backup_time().await? {
            Some(next) => println!("Next backup: {}", format_timestamp(next.timestamp())),
            None => println!("Auto backup is disabled"),
        },
    }
    Ok(())
}

fn run_key_command(backups: &BackupOrchestrator, command: KeyCommand) -> Result<(), anyhow::Error> {
    match command {
        KeyCommand::Export => {
            let hex = backups.keys().export_key().with_context(|| {
                format!(
                    "set {} to the encryption secret",
                    backups.settings().encryption_secret_env
                )
            })?;
            println!("{hex}");
        }
        KeyCommand::Generate => {
            let key = EncryptionKey::generate();
            println!("{}", key.to_hex());
            eprintln!("Key hash: {}", key.key_hash());
        }
    }
    Ok(())
}

fn print_backup(record: &BackupRecord) {
    println!("Backup Details:");
    println!("  ID: {}", record.id);
    println!("  Name: {}", record.name);
    println!("  Type: {}", record.backup_type);
    println!("  Status: {}", record.status);
    println!("  Created by: {}", record.created_by);
    println!("  Envelope: {}", envelope_label(record));
    println!("  Started: {}", format_timestamp(record.started_at.timestamp()));
    if let Some(path) = &record.file_path {
        println!("  File: {}", path.display());
    }
    if let Some(size) = record.file_size {
        println!("  Size: {}", format_size(size));
    }
    if let (Some(original), Some(ratio)) = (record.original_size, record.compression_ratio) {
        println!("  Original size: {} ({ratio:.1}% saved)", format_size(original));
    }
    if let Some(checksum) = &record.checksum {
        println!("  Checksum: {checksum}");
    }
    println!("  Records: {}", record.record_count);
    if let Some(key) = &record.cloud_key {
        println!("  Cloud key: {key}");
    }
    if let Some(message) = &record.error_message {
        println!("  Error: {message}");
    }
}

fn print_config(config: &BackupConfig) {
    println!("Backup Config:");
    println!("  Encryption: {}", config.encryption_enabled);
    println!(
        "  Key hash: {}",
        config.encryption_key_hash.as_deref().unwrap_or("-")
    );
    println!("  Auto backup: {}", config.auto_backup_enabled);
    println!(
        "  Schedule: {} at {} ({})",
        config.backup_frequency,
        config.backup_time,
        safekeep_core::cron_expression(config.backup_frequency, &config.backup_time)
    );
    println!(
        "  Cloud storage: {} (auto sync {}, every {} min)",
        config.enable_cloud_storage, config.auto_sync_enabled, config.sync_interval_minutes
    );
    println!(
        "  Retention: {} days, keep {} backups",
        config.retention_days, config.max_backups_to_keep
    );
    if let Some(last) = config.last_auto_backup {
        println!("  Last auto backup: {}", format_timestamp(last.timestamp()));
    }
}

fn report(outcome: &OperationOutcome) {
    if outcome.success {
        println!("✓ {}", outcome.message);
    } else {
        eprintln!("✗ {}", outcome.message);
    }
}

fn envelope_label(record: &BackupRecord) -> String {
    match (record.is_compressed, record.is_encrypted) {
        (true, true) => "gzip+aes".to_string(),
        (true, false) => "gzip".to_string(),
        (false, true) => "aes".to_string(),
        (false, false) => "raw".to_string(),
    }
}

fn confirm(action: &str) -> Result<bool, anyhow::Error> {
    use std::io::{self, Write};
    print!("Are you sure you want to {action}? (y/N): ");
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_lowercase().starts_with('y'))
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

fn format_timestamp(timestamp: i64) -> String {
    use chrono::{Local, TimeZone};

    match Local.timestamp_opt(timestamp, 0) {
        chrono::LocalResult::Single(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        _ => timestamp.to_string(),
    }
}
