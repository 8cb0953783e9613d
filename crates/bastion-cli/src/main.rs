use anyhow::{anyhow, bail, Context, Result};
use bastion_chain::{ChainConfig, ChainManager};
use bastion_cleanup::{CleanupConfig, CleanupSweeper, LocalDirStorage};
use bastion_core::{
    ArtifactFacts, BackupMode, BackupRecord, BackupSchedule, BackupTag, Clock, EncryptionKeyRecord,
    KeyType, RetentionConfig, RetentionMode, SourceType, SystemClock,
};
use bastion_immutability::{GuardConfig, ImmutabilityGuard};
use bastion_keys::EnvelopeKeyManager;
use bastion_retention::{RetentionEngine, RetentionEngineConfig};
use bastion_storage::{format_timestamp, LedgerStore};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

mod config;

use config::{load_file_config, Overrides, Settings};

const DEFAULT_PASSPHRASE_ENV: &str = "BASTION_EXPORT_PASSPHRASE";

#[derive(Parser)]
#[command(name = "bastion")]
#[command(about = "Backup lifecycle and protection engine", long_about = None)]
struct Cli {
    /// Config file (default: ./bastion.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Ledger database path
    #[arg(long, global = true)]
    database: Option<PathBuf>,
    /// File holding the master KEK (32 raw bytes or base64)
    #[arg(long, global = true)]
    kek_file: Option<PathBuf>,
    /// Artifact root for the local byte storage
    #[arg(long, global = true)]
    storage_root: Option<PathBuf>,
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage backup schedules and their GFS policy
    Schedule {
        #[command(subcommand)]
        action: ScheduleCommands,
    },
    /// Record backups reported by byte producers
    Backup {
        #[command(subcommand)]
        action: BackupCommands,
    },
    /// Inspect incremental chains
    Chain {
        #[command(subcommand)]
        action: ChainCommands,
    },
    /// Apply and inspect retention
    Retention {
        #[command(subcommand)]
        action: RetentionCommands,
    },
    /// Immutability and legal holds
    Protect {
        #[command(subcommand)]
        action: ProtectCommands,
    },
    /// Envelope encryption keys
    Keys {
        #[command(subcommand)]
        action: KeyCommands,
    },
    /// Physically remove expired backups past the grace period
    Sweep {
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        #[arg(long)]
        grace_hours: Option<i64>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Delete one backup if every guard allows it
    Delete {
        backup_id: String,
        #[arg(long, default_value_t = false)]
        admin: bool,
        #[arg(long, default_value_t = false)]
        override_governance: bool,
    },
}

#[derive(Subcommand)]
enum ScheduleCommands {
    Set {
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        source_type: SourceType,
        #[arg(long)]
        source_id: String,
        #[arg(long, default_value = "INCREMENTAL")]
        mode: BackupMode,
        #[arg(long, default_value_t = 7)]
        daily: u32,
        #[arg(long, default_value_t = 4)]
        weekly: u32,
        #[arg(long, default_value_t = 12)]
        monthly: u32,
        #[arg(long, default_value_t = 1)]
        yearly: u32,
        #[arg(long, default_value_t = false)]
        disabled: bool,
    },
    Show {
        id: String,
    },
}

#[derive(Subcommand)]
enum BackupCommands {
    /// Register a new backup and place it in a chain
    Start {
        #[arg(long)]
        source_type: SourceType,
        #[arg(long)]
        source_id: String,
        #[arg(long, default_value = "INCREMENTAL")]
        mode: BackupMode,
        #[arg(long)]
        schedule: Option<String>,
        #[arg(long, default_value = "DAILY")]
        tag: BackupTag,
        #[arg(long)]
        storage_path: Option<String>,
    },
    /// Record completion facts for a backup
    Complete {
        backup_id: String,
        #[arg(long)]
        original_size: u64,
        #[arg(long)]
        deduped_size: Option<u64>,
        #[arg(long)]
        compressed_size: Option<u64>,
    },
    Show {
        backup_id: String,
    },
}

#[derive(Subcommand)]
enum ChainCommands {
    /// Ordered backups needed to restore one backup
    Restore { backup_id: String },
    Verify { chain_id: String },
    Stats { chain_id: String },
    Members { chain_id: String },
    /// Consolidation plan for one chain, or every chain over the limit
    Consolidate {
        chain_id: Option<String>,
        #[arg(long)]
        max_length: Option<usize>,
    },
    Orphans,
}

#[derive(Subcommand)]
enum RetentionCommands {
    /// Evaluate GFS for a schedule and mark candidates as expired
    Evaluate {
        schedule_id: String,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Backups whose expiry mark is older than the grace period
    Expired {
        #[arg(long)]
        grace_hours: Option<i64>,
    },
    /// Clear a pending expiry mark
    Cancel { backup_id: String },
}

#[derive(Subcommand)]
enum ProtectCommands {
    CanDelete {
        backup_id: String,
        #[arg(long, default_value_t = false)]
        admin: bool,
        #[arg(long, default_value_t = false)]
        override_governance: bool,
    },
    MakeImmutable {
        backup_id: String,
        #[arg(long)]
        days: i64,
        #[arg(long)]
        mode: RetentionMode,
        #[arg(long)]
        reason: String,
    },
    RemoveHold { backup_id: String },
    Stats,
}

#[derive(Subcommand)]
enum KeyCommands {
    Generate {
        key_type: KeyType,
        reference_id: Option<String>,
    },
    /// Show the active key, optionally creating one
    Active {
        key_type: KeyType,
        reference_id: Option<String>,
        #[arg(long, default_value_t = false)]
        create: bool,
    },
    Rotate {
        key_type: KeyType,
        reference_id: Option<String>,
    },
    List {
        key_type: KeyType,
        reference_id: Option<String>,
    },
    /// Write a passphrase-sealed disaster-recovery bundle
    Export {
        #[arg(long)]
        out: PathBuf,
        /// Environment variable holding the passphrase
        #[arg(long, default_value = DEFAULT_PASSPHRASE_ENV)]
        passphrase_env: String,
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Restore keys from a disaster-recovery bundle
    Import {
        bundle: PathBuf,
        #[arg(long, default_value = DEFAULT_PASSPHRASE_ENV)]
        passphrase_env: String,
        /// Target is a fresh environment; every key must be new
        #[arg(long, default_value_t = false)]
        reencrypt: bool,
    },
}

struct Engines {
    clock: Arc<dyn Clock>,
    chains: ChainManager,
    retention: RetentionEngine,
    guard: ImmutabilityGuard,
}

impl Engines {
    fn new(settings: &Settings) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            chains: ChainManager::new(ChainConfig {
                max_chain_length: settings.max_chain_length,
            }),
            retention: RetentionEngine::new(
                RetentionEngineConfig {
                    grace_period_hours: settings.grace_period_hours,
                },
                clock.clone(),
            ),
            guard: ImmutabilityGuard::new(
                GuardConfig {
                    legal_hold_fallback_days: settings.legal_hold_fallback_days,
                },
                clock.clone(),
            ),
            clock,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let file = load_file_config(cli.config.as_deref())?;
    let settings = Settings::resolve(
        file,
        Overrides {
            database_path: cli.database,
            kek_file: cli.kek_file,
            storage_root: cli.storage_root,
        },
    );
    let mut store = LedgerStore::open(&settings.database_path).with_context(|| {
        format!(
            "Failed to open ledger {}",
            settings.database_path.display()
        )
    })?;
    debug!(
        event = "ledger_opened",
        path = %settings.database_path.display(),
        storage_root = %settings.storage_root.display()
    );
    let engines = Engines::new(&settings);

    match cli.command {
        Commands::Schedule { action } => run_schedule(&store, action),
        Commands::Backup { action } => run_backup(&store, &engines, action),
        Commands::Chain { action } => run_chain(&store, &engines, action),
        Commands::Retention { action } => run_retention(&mut store, &engines, action),
        Commands::Protect { action } => run_protect(&store, &engines, action),
        Commands::Keys { action } => {
            let keys = EnvelopeKeyManager::new(settings.load_kek()?, engines.clock.clone());
            run_keys(&mut store, &keys, action)
        }
        Commands::Sweep {
            dry_run,
            grace_hours,
            limit,
        } => {
            let storage = LocalDirStorage::new(&settings.storage_root);
            let sweeper = CleanupSweeper::new(
                CleanupConfig {
                    grace_period_hours: grace_hours,
                    max_deletions_per_sweep: limit,
                },
                &engines.retention,
                &engines.guard,
                &engines.chains,
                &storage,
            );
            let report = sweeper.sweep(&mut store, dry_run)?;
            print_json(&report)
        }
        Commands::Delete {
            backup_id,
            admin,
            override_governance,
        } => {
            let storage = LocalDirStorage::new(&settings.storage_root);
            let sweeper = CleanupSweeper::new(
                CleanupConfig::default(),
                &engines.retention,
                &engines.guard,
                &engines.chains,
                &storage,
            );
            let decision =
                sweeper.delete_backup(&mut store, &backup_id, admin, override_governance)?;
            match decision.reason {
                Some(reason) => println!("Deleted {backup_id} ({reason})"),
                None => println!("Deleted {backup_id}"),
            }
            Ok(())
        }
    }
}

fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to render output")?;
    println!("{rendered}");
    Ok(())
}

fn run_schedule(store: &LedgerStore, action: ScheduleCommands) -> Result<()> {
    match action {
        ScheduleCommands::Set {
            id,
            name,
            source_type,
            source_id,
            mode,
            daily,
            weekly,
            monthly,
            yearly,
            disabled,
        } => {
            let retention = RetentionConfig {
                daily,
                weekly,
                monthly,
                yearly,
            };
            retention.validate()?;
            let schedule = BackupSchedule {
                id,
                name,
                source_type,
                source_id,
                mode,
                retention,
                enabled: !disabled,
            };
            store.upsert_schedule(&schedule)?;
            print_json(&schedule)
        }
        ScheduleCommands::Show { id } => {
            let schedule = store
                .schedule(&id)?
                .ok_or_else(|| anyhow!("Schedule {id} not found"))?;
            print_json(&schedule)
        }
    }
}

fn run_backup(store: &LedgerStore, engines: &Engines, action: BackupCommands) -> Result<()> {
    match action {
        BackupCommands::Start {
            source_type,
            source_id,
            mode,
            schedule,
            tag,
            storage_path,
        } => {
            if let Some(schedule_id) = &schedule {
                if store.schedule(schedule_id)?.is_none() {
                    bail!("Schedule {schedule_id} not found");
                }
            }
            let mut backup =
                BackupRecord::pending(source_type, source_id, mode, engines.clock.now());
            backup.schedule_id = schedule;
            backup.tag = tag;
            backup.storage_path = storage_path;
            store.upsert_backup(&backup)?;
            let backup = engines.chains.initialize_chain(store, &backup.id, mode)?;
            print_json(&backup)
        }
        BackupCommands::Complete {
            backup_id,
            original_size,
            deduped_size,
            compressed_size,
        } => {
            let facts = ArtifactFacts {
                original_size,
                deduped_size,
                compressed_size,
            };
            let backup =
                engines
                    .chains
                    .complete_backup(store, &backup_id, &facts, engines.clock.now())?;
            print_json(&backup)
        }
        BackupCommands::Show { backup_id } => {
            let backup = store
                .backup(&backup_id)?
                .ok_or_else(|| anyhow!("Backup {backup_id} not found"))?;
            print_json(&backup)
        }
    }
}

fn run_chain(store: &LedgerStore, engines: &Engines, action: ChainCommands) -> Result<()> {
    let chains = &engines.chains;
    match action {
        ChainCommands::Restore { backup_id } => {
            let restore = chains.get_chain_for_restore(store, &backup_id)?;
            for backup in &restore {
                println!(
                    "{:>3}  {:<11}  {}  {}",
                    backup.sequence_number,
                    backup.mode.as_str(),
                    backup.id,
                    backup.storage_path.as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }
        ChainCommands::Verify { chain_id } => {
            let report = chains.verify_chain_integrity(store, &chain_id)?;
            print_json(&report)?;
            if !report.valid {
                bail!("Chain {chain_id} failed integrity checks");
            }
            Ok(())
        }
        ChainCommands::Stats { chain_id } => print_json(&chains.chain_statistics(store, &chain_id)?),
        ChainCommands::Members { chain_id } => print_json(&chains.chain_members(store, &chain_id)?),
        ChainCommands::Consolidate {
            chain_id,
            max_length,
        } => match chain_id {
            Some(chain_id) => print_json(&chains.plan_consolidation(store, &chain_id)?),
            None => print_json(&chains.chains_needing_consolidation(store, max_length)?),
        },
        ChainCommands::Orphans => {
            let orphans = chains.find_orphaned(store)?;
            if orphans.is_empty() {
                println!("No orphaned backups");
            }
            for backup in &orphans {
                println!(
                    "{}  missing parent {}",
                    backup.id,
                    backup.parent_backup_id.as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }
    }
}

fn run_retention(
    store: &mut LedgerStore,
    engines: &Engines,
    action: RetentionCommands,
) -> Result<()> {
    match action {
        RetentionCommands::Evaluate {
            schedule_id,
            dry_run,
        } => {
            let report = engines.retention.apply(store, &schedule_id, dry_run)?;
            print_json(&report)
        }
        RetentionCommands::Expired { grace_hours } => {
            let expired = engines.retention.get_expired_backups(store, grace_hours)?;
            for backup in &expired {
                println!(
                    "{}  expired {}",
                    backup.id,
                    backup.expires_at.map(format_timestamp).unwrap_or_default()
                );
            }
            Ok(())
        }
        RetentionCommands::Cancel { backup_id } => {
            if engines.retention.cancel_expiry(store, &backup_id)? {
                println!("Expiry cancelled for {backup_id}");
            } else {
                println!("Backup {backup_id} was not marked for expiry");
            }
            Ok(())
        }
    }
}

fn run_protect(store: &LedgerStore, engines: &Engines, action: ProtectCommands) -> Result<()> {
    let guard = &engines.guard;
    match action {
        ProtectCommands::CanDelete {
            backup_id,
            admin,
            override_governance,
        } => {
            let immutability = guard.can_delete(store, &backup_id, admin, override_governance)?;
            let dependency = engines.chains.can_delete(store, &backup_id)?;
            print_json(&immutability.and(dependency))
        }
        ProtectCommands::MakeImmutable {
            backup_id,
            days,
            mode,
            reason,
        } => print_json(&guard.make_immutable(store, &backup_id, days, mode, &reason)?),
        ProtectCommands::RemoveHold { backup_id } => {
            print_json(&guard.remove_legal_hold(store, &backup_id)?)
        }
        ProtectCommands::Stats => print_json(&guard.retention_statistics(store)?),
    }
}

fn run_keys(store: &mut LedgerStore, keys: &EnvelopeKeyManager, action: KeyCommands) -> Result<()> {
    match action {
        KeyCommands::Generate {
            key_type,
            reference_id,
        } => {
            let record = keys.generate(store, key_type, reference_id.as_deref())?;
            print_key(&record);
        }
        KeyCommands::Active {
            key_type,
            reference_id,
            create,
        } => match keys.get_active(store, key_type, reference_id.as_deref(), create)? {
            Some(record) => print_key(&record),
            None => println!("No active key for {key_type}"),
        },
        KeyCommands::Rotate {
            key_type,
            reference_id,
        } => {
            let outcome = keys.rotate(store, key_type, reference_id.as_deref())?;
            print_key(&outcome.retired);
            print_key(&outcome.current);
        }
        KeyCommands::List {
            key_type,
            reference_id,
        } => {
            for record in keys.list_keys(store, key_type, reference_id.as_deref())? {
                print_key(&record);
            }
        }
        KeyCommands::Export {
            out,
            passphrase_env,
            force,
        } => {
            let passphrase = read_passphrase(&passphrase_env)?;
            let sealed = keys.export_for_disaster_recovery(store, &passphrase)?;
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .create_new(!force)
                .truncate(true)
                .open(&out)
                .with_context(|| format!("Failed to create bundle {}", out.display()))?;
            file.write_all(&sealed)
                .with_context(|| format!("Failed to write bundle {}", out.display()))?;
            println!("Wrote {} bytes to {}", sealed.len(), out.display());
        }
        KeyCommands::Import {
            bundle,
            passphrase_env,
            reencrypt,
        } => {
            let passphrase = read_passphrase(&passphrase_env)?;
            let sealed = fs::read(&bundle)
                .with_context(|| format!("Failed to read bundle {}", bundle.display()))?;
            let report = keys.import_from_backup(store, &sealed, &passphrase, reencrypt)?;
            println!(
                "Imported {} key(s), {} already present",
                report.imported, report.already_present
            );
        }
    }
    Ok(())
}

fn read_passphrase(variable: &str) -> Result<Zeroizing<String>> {
    let value = std::env::var(variable)
        .map(Zeroizing::new)
        .map_err(|_| anyhow!("Set the bundle passphrase in ${variable}"))?;
    if value.is_empty() {
        bail!("${variable} is empty");
    }
    Ok(value)
}

fn print_key(record: &EncryptionKeyRecord) {
    println!(
        "{}  v{}  {}  created {}{}",
        record.scope_label(),
        record.key_version,
        if record.active { "active " } else { "retired" },
        format_timestamp(record.created_at),
        record
            .rotated_at
            .map(|at| format!("  rotated {}", format_timestamp(at)))
            .unwrap_or_default()
    );
}
