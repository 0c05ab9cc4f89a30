//! ALFA Data Vault - CLI
//!
//! Command-line interface for vault maintenance.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use alfa_data_vault::{DataVault, ReconcileStatus, VaultConfig, VaultError, VaultResult};

#[derive(Parser)]
#[command(name = "alfa-data")]
#[command(author = "Karen Tonoyan")]
#[command(version = alfa_data_vault::VERSION)]
#[command(about = "ALFA Data Vault - Encrypted local record and document store")]
struct Cli {
    /// Data directory
    #[arg(short, long, default_value = "./alfa_data")]
    data_dir: PathBuf,

    /// Optional JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Unlock (creating the master key on first run)
    Unlock {
        /// Password
        #[arg(short, long)]
        password: String,
    },

    /// Re-wrap the master key under a new password
    ChangePassword {
        /// Current password
        #[arg(short, long)]
        password: String,

        /// New password
        #[arg(short, long)]
        new_password: String,
    },

    /// List collections
    Collections {
        /// Password
        #[arg(short, long)]
        password: String,
    },

    /// Print a collection as JSON
    Get {
        /// Collection name
        collection: String,

        /// Password
        #[arg(short, long)]
        password: String,
    },

    /// Write a backup archive
    Backup {
        /// Output file
        output: PathBuf,

        /// Password
        #[arg(short, long)]
        password: String,
    },

    /// Compare a backup archive with the data directory
    Reconcile {
        /// Backup archive
        backup: PathBuf,

        /// Password
        #[arg(short, long)]
        password: String,
    },

    /// Restore files from a backup archive
    Restore {
        /// Backup archive
        backup: PathBuf,

        /// Restore only these paths (default: everything)
        #[arg(short, long)]
        file: Vec<String>,

        /// Password
        #[arg(short, long)]
        password: String,
    },

    /// Cross-check document references against files
    Verify {
        /// Password
        #[arg(short, long)]
        password: String,
    },

    /// Import an older whole-store export
    ImportLegacy {
        /// Export file
        path: PathBuf,

        /// Password
        #[arg(short, long)]
        password: String,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn open(cli: &Cli, password: &str) -> VaultResult<DataVault> {
    let mut config = match &cli.config {
        Some(path) => VaultConfig::load(path)?,
        None => VaultConfig::default(),
    };
    if cli.config.is_none() {
        config.data_dir = cli.data_dir.clone();
    }

    let vault = DataVault::open(config)?;
    vault.unlock(password).await?;
    Ok(vault)
}

async fn run(cli: Cli) -> VaultResult<()> {
    match &cli.command {
        Commands::Unlock { password } => {
            println!("🔓 Unlocking vault...");
            let vault = open(&cli, password).await?;
            println!("✅ Vault unlocked: {}", vault.config().data_dir.display());
            vault.lock().await;
        }

        Commands::ChangePassword { password, new_password } => {
            if new_password.is_empty() {
                return Err(VaultError::InvalidConfig("new password must not be empty".into()));
            }
            let vault = open(&cli, password).await?;
            vault.change_password(password, new_password).await?;
            println!("✅ Password changed (only the wrapped key was rewritten)");
            vault.lock().await;
        }

        Commands::Collections { password } => {
            let vault = open(&cli, password).await?;
            let records = vault.records()?;
            let names = records.list_collections().await?;

            if names.is_empty() {
                println!("📭 No collections");
            }
            for name in names {
                match records.get(&name).await {
                    Ok(data) => println!("  {:<24} {} records", name, data.len()),
                    Err(e) => println!("  {:<24} unreadable ({})", name, e),
                }
            }
            vault.lock().await;
        }

        Commands::Get { collection, password } => {
            let vault = open(&cli, password).await?;
            let data = vault.records()?.get(collection).await?;
            println!("{}", serde_json::to_string_pretty(&data)?);
            vault.lock().await;
        }

        Commands::Backup { output, password } => {
            println!("📦 Creating backup...");
            let vault = open(&cli, password).await?;
            let manifest = vault.backup()?.create_backup(output).await?;

            println!("✅ Backup written to: {}", output.display());
            println!("   Data files:     {}", manifest.data_files.len());
            println!("   Document files: {}", manifest.document_files.len());
            println!("   Master key:     {}", if manifest.includes_master_key { "included" } else { "missing" });
            vault.lock().await;
        }

        Commands::Reconcile { backup, password } => {
            let vault = open(&cli, password).await?;
            let report = vault.backup()?.reconcile(backup).await?;

            println!("🔍 Reconciliation of {}", backup.display());
            println!("{:-<60}", "");
            for entry in report.entries.iter().filter(|e| e.status != ReconcileStatus::Same) {
                println!("  {:<9} {}", format!("{:?}", entry.status).to_lowercase(), entry.path);
            }
            println!("{:-<60}", "");
            println!(
                "new: {}  same: {}  conflict: {}  orphan: {}",
                report.count(ReconcileStatus::New),
                report.count(ReconcileStatus::Same),
                report.count(ReconcileStatus::Conflict),
                report.count(ReconcileStatus::Orphan)
            );
            for c in &report.incompatible {
                println!(
                    "⚠️ '{}' is schema v{} in the backup, this build supports v{}",
                    c.collection, c.backup_version, c.supported_version
                );
            }
            vault.lock().await;
        }

        Commands::Restore { backup, file, password } => {
            println!("♻️ Restoring from {}...", backup.display());
            let vault = open(&cli, password).await?;
            let selection = (!file.is_empty()).then_some(file.as_slice());
            let report = vault.backup()?.restore(backup, selection).await?;

            println!("✅ Restored {} files", report.restored.len());
            for failure in &report.failed {
                println!("   ❌ {}: {}", failure.path, failure.reason);
            }
            vault.lock().await;
        }

        Commands::Verify { password } => {
            let vault = open(&cli, password).await?;
            let report = vault.run_integrity_check().await?;

            println!("🩺 Integrity check");
            println!("{:-<60}", "");
            println!("Categories:          {}", report.categories.join(", "));
            println!("Collections scanned: {}", report.collections_scanned);
            println!("Matched documents:   {}", report.matched.len());
            println!("Missing documents:   {}", report.missing.len());
            for m in &report.missing {
                println!("   - {} in '{}' -> {}", m.document_id, m.collection, m.encrypted_path);
            }
            println!("Orphaned files:      {}", report.orphaned.len());
            for o in &report.orphaned {
                println!("   - {}", o.path());
            }
            println!("Missing thumbnails:  {}", report.missing_thumbnails.len());
            for u in &report.unreadable_collections {
                println!("⚠️ '{}' unreadable: {}", u.collection, u.reason);
            }

            if report.is_consistent() {
                println!("💚 Store is consistent");
            } else {
                println!("⚠️ Issues found (nothing was changed)");
            }
            vault.lock().await;
        }

        Commands::ImportLegacy { path, password } => {
            println!("📥 Importing legacy export: {}", path.display());
            let vault = open(&cli, password).await?;
            let report = vault.backup()?.import_legacy_backup(path).await?;

            for (name, count) in &report.imported {
                println!("  {:<24} {} records", name, count);
            }
            for name in &report.skipped {
                println!("  {:<24} skipped", name);
            }
            vault.lock().await;
        }
    }

    Ok(())
}
