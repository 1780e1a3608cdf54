//! Keepsake CLI
//!
//! Command-line interface for backups and multi-device sync over a local
//! installation: key-value state in SQLite, app data in a JSON snapshot file.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keepsake::error::{KeepsakeError, Result};
use keepsake::kv::SqliteStore;
use keepsake::service::{KeepsakeService, ServiceOptions};
use keepsake::source::JsonFileDataSource;
use keepsake::types::*;

#[derive(Parser)]
#[command(name = "keepsake")]
#[command(about = "Backup and multi-device sync CLI")]
#[command(version)]
struct Cli {
    /// State directory (SQLite key-value store lives here)
    #[arg(long, env = "KEEPSAKE_HOME", default_value = "~/.local/share/keepsake")]
    home: String,

    /// App data snapshot file (defaults to <home>/data.json)
    #[arg(long, env = "KEEPSAKE_DATA")]
    data: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, env = "KEEPSAKE_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a backup now
    Backup,
    /// Restore a backup into the data file
    Restore {
        /// Backup ID
        id: String,
    },
    /// Verify a stored backup without restoring it
    Verify {
        /// Backup ID
        id: String,
    },
    /// List stored backups
    List,
    /// Show backup history
    History {
        /// Maximum entries, newest first
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Delete a stored backup
    Delete {
        /// Backup ID
        id: String,
    },
    /// Show backup and sync status
    Status,
    /// Run a sync session
    Sync,
    /// List conflicts
    Conflicts {
        /// Include resolved conflicts
        #[arg(short, long)]
        all: bool,
    },
    /// Resolve a conflict
    Resolve {
        /// Conflict ID
        id: String,
        /// use_device, merge or manual
        #[arg(short, long)]
        strategy: String,
        /// Device whose version wins (use_device)
        #[arg(short, long)]
        device: Option<String>,
        /// Final JSON payload (manual)
        #[arg(long)]
        data: Option<String>,
    },
    /// Show or rename this device
    Device {
        /// New display name
        #[arg(long)]
        rename: Option<String>,
    },
    /// Export or import the backup encryption key
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },
    /// Show or change configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum KeyAction {
    /// Print the key (base64)
    Export,
    /// Install a key exported from another device
    Import {
        /// Base64 key
        key: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print backup and sync configuration
    Show,
    /// Set one option, e.g. `backup.retentionDays 14` or `sync.autoSync true`
    Set {
        /// Option path: backup.<field> or sync.<field>
        key: String,
        /// Value (JSON, or a bare string)
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries command output
    let registry = tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::from_default_env());
    if cli.log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .init();
    }

    // Expand ~ in paths
    let home = PathBuf::from(shellexpand::tilde(&cli.home).to_string());
    std::fs::create_dir_all(&home)?;
    let data_path = match &cli.data {
        Some(path) => PathBuf::from(shellexpand::tilde(path).to_string()),
        None => home.join("data.json"),
    };

    let kv = Arc::new(SqliteStore::open(home.join("keepsake.db"))?);
    let source = Arc::new(JsonFileDataSource::open(&data_path)?);
    let service = KeepsakeService::init(
        kv,
        source,
        ServiceOptions {
            start_timers: false,
            ..Default::default()
        },
    )
    .await?;

    let result = run(&service, cli.command).await;
    service.shutdown();
    result
}

async fn run(service: &KeepsakeService, command: Commands) -> Result<()> {
    let backup = service.backup();
    let sync = service.sync();

    match command {
        Commands::Backup => {
            let metadata = backup.create_backup(true).await?;
            println!("Created backup {}", metadata.id);
            println!("{}", serde_json::to_string_pretty(&metadata)?);
        }
        Commands::Restore { id } => {
            let result = backup.restore_from_backup(&id).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                return Err(KeepsakeError::Integrity(format!(
                    "restore of {} failed with {} errors",
                    id,
                    result.errors.len()
                )));
            }
        }
        Commands::Verify { id } => {
            let verification = backup.verify_stored(&id).await?;
            println!("{}", serde_json::to_string_pretty(&verification)?);
        }
        Commands::List => {
            let backups = backup.list_backups().await?;
            if backups.is_empty() {
                println!("No backups on provider '{}'", service.provider_id());
            }
            for metadata in backups {
                println!(
                    "{}  {}  {:>10} bytes  {}{}",
                    metadata.id,
                    metadata.created_at.format("%Y-%m-%d %H:%M"),
                    metadata.compressed_size,
                    if metadata.manual { "manual" } else { "auto" },
                    if metadata.encrypted { ", encrypted" } else { "" }
                );
            }
        }
        Commands::History { limit } => {
            for entry in backup.backup_history().iter().rev().take(limit) {
                println!(
                    "{}  {}  {}  {}",
                    entry.timestamp.format("%Y-%m-%d %H:%M"),
                    if entry.success { "ok    " } else { "FAILED" },
                    entry.id,
                    entry.error.as_deref().unwrap_or("")
                );
            }
        }
        Commands::Delete { id } => {
            backup.delete_backup(&id).await?;
            println!("Deleted backup {}", id);
        }
        Commands::Status => {
            let status = serde_json::json!({
                "backup": backup.backup_status().await,
                "device": sync.current_device(),
                "sync": sync.sync_statistics(),
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Sync => {
            let session = sync.sync().await?;
            println!("{}", serde_json::to_string_pretty(&session)?);
        }
        Commands::Conflicts { all } => {
            let conflicts = sync.conflicts(!all);
            if conflicts.is_empty() {
                println!("No conflicts");
            }
            for conflict in conflicts {
                println!("{}", serde_json::to_string_pretty(&conflict)?);
            }
        }
        Commands::Resolve {
            id,
            strategy,
            device,
            data,
        } => {
            let strategy: ResolutionStrategy = strategy.parse()?;
            let manual_data = data
                .map(|raw| serde_json::from_str(&raw))
                .transpose()?;
            let conflict = sync
                .resolve_conflict(&id, strategy, device.as_deref(), manual_data)
                .await?;
            println!("Resolved conflict {} on {}", conflict.id, conflict.entity_key());
        }
        Commands::Device { rename } => {
            let device = match rename {
                Some(name) => sync.rename_device(&name)?,
                None => sync
                    .current_device()
                    .ok_or(KeepsakeError::DeviceNotRegistered)?,
            };
            println!("{}", serde_json::to_string_pretty(&device)?);
            for peer in sync.known_devices() {
                println!("peer: {} ({})", peer.name, peer.id);
            }
        }
        Commands::Key { action } => match action {
            KeyAction::Export => match backup.export_key()? {
                Some(key) => println!("{}", key),
                None => println!("No encryption key yet"),
            },
            KeyAction::Import { key } => {
                let id = backup.import_key(&key)?;
                println!("Imported key {}", id);
            }
        },
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let config = serde_json::json!({
                    "backup": backup.config(),
                    "sync": sync.config(),
                });
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            ConfigAction::Set { key, value } => {
                let (section, field) = key.split_once('.').ok_or_else(|| {
                    KeepsakeError::InvalidInput(format!("expected backup.<field> or sync.<field>, got {}", key))
                })?;
                let value: serde_json::Value = serde_json::from_str(&value)
                    .unwrap_or(serde_json::Value::String(value));

                match section {
                    "backup" => {
                        let updated: BackupConfig = set_field(&backup.config(), field, value)?;
                        service.update_backup_config(updated).await?;
                    }
                    "sync" => {
                        let updated: MultiDeviceSyncConfig = set_field(&sync.config(), field, value)?;
                        service.update_sync_config(updated).await?;
                    }
                    other => {
                        return Err(KeepsakeError::InvalidInput(format!(
                            "unknown config section: {}",
                            other
                        )))
                    }
                }
                println!("Set {}", key);
            }
        },
    }

    Ok(())
}

/// Replace one camelCase field of a config through its JSON form
fn set_field<T>(config: &T, field: &str, value: serde_json::Value) -> Result<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    let mut json = serde_json::to_value(config)?;
    let object = json
        .as_object_mut()
        .ok_or_else(|| KeepsakeError::Internal("config is not an object".to_string()))?;
    if !object.contains_key(field) {
        return Err(KeepsakeError::InvalidInput(format!("unknown option: {}", field)));
    }
    object.insert(field.to_string(), value);
    Ok(serde_json::from_value(json)?)
}
