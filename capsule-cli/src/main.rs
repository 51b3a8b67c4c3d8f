/*!
Capsule CLI - Command-line interface for capsule backup stores.

This CLI lists, inspects, exports and prunes the session backups kept in a
directory store, without a running editor or compute engine.
*/

use anyhow::{anyhow, Context};
use capsule_core::{
    create_store_from_config, inline_session, BackupEntry, BackupKind, BackupStore, KeyValueStore,
    StoreConfig, StoreKey, SESSION_FILE_NAME,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tabled::{Table, Tabled};
use tracing::{error, info};

type Store = BackupStore<Box<dyn KeyValueStore>>;

#[derive(Parser)]
#[command(name = "capsule")]
#[command(about = "CLI for capsule session backup stores")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Store location: a directory, `file://<dir>` or `memory://`
    #[arg(short, long, global = true, env = "CAPSULE_STORE", default_value = "./capsule-store")]
    store: String,

    /// Read and write entries without gzip
    #[arg(long, global = true)]
    no_compress: bool,

    /// Retention limit for automatic backups
    #[arg(long, global = true, default_value_t = 10)]
    max_backups: usize,

    /// Wipe and re-seed a store whose version marker does not match
    #[arg(long, global = true)]
    reset: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List session backups, newest first
    List {
        /// Also list stored map and reflection data files
        #[arg(short, long)]
        all: bool,
    },
    /// Show the contents of a backup
    Show {
        /// Position in `list` output, starting at 1
        index: usize,
        /// Print the raw session document
        #[arg(long)]
        json: bool,
    },
    /// Write a backup as a self-contained session file
    Export {
        /// Position in `list` output, starting at 1
        index: usize,
        /// Output file or directory
        #[arg(short, long, default_value = SESSION_FILE_NAME)]
        out: PathBuf,
    },
    /// Delete a backup and any data files only it referenced
    Delete {
        /// Position in `list` output, starting at 1
        index: usize,
        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
    /// Apply the retention limit and remove unreferenced data files
    Prune,
    /// Remove every backup and data file
    DropAll {
        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Tabled)]
struct BackupInfo {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Label")]
    label: String,
    #[tabled(rename = "Created")]
    created: String,
    #[tabled(rename = "Molecules")]
    molecules: usize,
    #[tabled(rename = "Maps")]
    maps: usize,
    #[tabled(rename = "Size")]
    size: String,
}

#[derive(Tabled)]
struct DataFileInfo {
    #[tabled(rename = "Type")]
    kind: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Size")]
    size: String,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let backups = open_store(&cli).await?;

    match cli.command {
        Commands::List { all } => list_backups(&backups, all).await?,
        Commands::Show { index, json } => show_backup(&backups, index, json).await?,
        Commands::Export { index, out } => export_backup(&backups, index, out).await?,
        Commands::Delete { index, force } => delete_backup(&backups, index, force).await?,
        Commands::Prune => prune(&backups).await?,
        Commands::DropAll { force } => drop_all(&backups, force).await?,
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"))
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn open_store(cli: &Cli) -> Result<Store, anyhow::Error> {
    let mut config = StoreConfig::from_uri(&cli.store)?;
    config.compress = !cli.no_compress;
    info!("Opening store {:?}", config);

    let backups = BackupStore::new(create_store_from_config(&config)?, cli.max_backups);

    if cli.reset {
        backups.init().await;
        if !backups.backups_enabled() {
            return Err(anyhow!("store at '{}' is not usable", cli.store));
        }
    } else if !matches!(cli.command, Commands::DropAll { .. }) {
        backups.verify_version().await.with_context(|| {
            format!(
                "refusing to open '{}'; rerun with --reset to wipe it",
                cli.store
            )
        })?;
    }
    Ok(backups)
}

async fn select(backups: &Store, index: usize) -> Result<BackupEntry, anyhow::Error> {
    let entries = backups.get_sorted_keys().await?;
    index
        .checked_sub(1)
        .and_then(|i| entries.into_iter().nth(i))
        .ok_or_else(|| anyhow!("no backup #{index}; run `capsule list` to see the backups"))
}

async fn list_backups(backups: &Store, all: bool) -> Result<(), anyhow::Error> {
    let entries = backups.get_sorted_keys().await?;

    if entries.is_empty() {
        println!("No backups found");
    } else {
        let mut rows = Vec::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            let size = backups
                .retrieve_backup(&entry.store_key())
                .await?
                .map(|value| format_size(value.len() as u64))
                .unwrap_or_else(|| "Unknown".to_string());
            rows.push(BackupInfo {
                index: i + 1,
                kind: kind_name(entry.kind).to_string(),
                label: entry.label(),
                created: format_timestamp(entry.key.date_time),
                molecules: entry.key.mol_names.len(),
                maps: entry.key.map_names.len(),
                size,
            });
        }
        println!("{}", Table::new(rows));
    }

    if all {
        let files = backups.data_file_names().await?;
        let mut rows = Vec::new();
        for name in &files.mtz {
            rows.push(data_file_row(backups, "reflections", StoreKey::mtz_data(name.clone())).await?);
        }
        for name in &files.maps {
            rows.push(data_file_row(backups, "map", StoreKey::map_data(name.clone())).await?);
        }

        if rows.is_empty() {
            println!("No data files found");
        } else {
            println!("{}", Table::new(rows));
        }
    }

    Ok(())
}

async fn data_file_row(
    backups: &Store,
    kind: &str,
    key: StoreKey,
) -> Result<DataFileInfo, anyhow::Error> {
    let size = backups
        .retrieve_backup(&key)
        .await?
        .map(|value| format_size(value.len() as u64))
        .unwrap_or_else(|| "Unknown".to_string());
    Ok(DataFileInfo {
        kind: kind.to_string(),
        name: key.data_file_name().unwrap_or_default().to_string(),
        size,
    })
}

async fn show_backup(backups: &Store, index: usize, json: bool) -> Result<(), anyhow::Error> {
    let entry = select(backups, index).await?;
    let session = backups.load_session(&entry).await?;

    if json {
        let value: serde_json::Value = serde_json::from_str(&session.to_json()?)?;
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let stored = backups.data_file_names().await?;

    println!("Backup Details:");
    println!("  Label: {}", entry.label());
    println!("  Kind: {}", kind_name(entry.kind));
    println!("  Created: {}", format_timestamp(entry.key.date_time));
    println!(
        "  Self-contained: {}",
        if session.includes_additional_map_data { "yes" } else { "no" }
    );

    println!("  Molecules:");
    for molecule in &session.molecule_data {
        println!(
            "    {} (molNo {}, {} styles, {} ligand dictionaries)",
            molecule.name,
            molecule.mol_no,
            molecule.display_objects_keys.len(),
            molecule.ligand_dicts.len()
        );
    }

    println!("  Maps:");
    for (i, map) in session.map_data.iter().enumerate() {
        let active = if session.active_map_index == Some(i) { " [active]" } else { "" };
        let grid = match (&map.map_data, &map.unique_id) {
            (Some(_), _) => "inlined",
            (None, Some(id)) if stored.maps.contains(id) => "stored",
            _ => "MISSING",
        };
        println!(
            "    {} (molNo {}, contour {}, grid {}){}",
            map.name, map.mol_no, map.contour_level, grid, active
        );
        if let Some(file) = map.reflection_file() {
            let present = map.reflection_data.is_some() || stored.mtz.contains(file);
            println!(
                "      reflections: {} ({})",
                file,
                if present { "present" } else { "MISSING" }
            );
        }
    }

    Ok(())
}

async fn export_backup(backups: &Store, index: usize, out: PathBuf) -> Result<(), anyhow::Error> {
    let entry = select(backups, index).await?;
    let session = backups.load_session(&entry).await?;
    let session = inline_session(session, backups.store())
        .await
        .with_context(|| format!("backup '{}' references missing data", entry.label()))?;

    let target = if out.is_dir() {
        out.join(SESSION_FILE_NAME)
    } else {
        out
    };
    let json = session.to_json()?;
    tokio::fs::write(&target, json.as_bytes()).await?;

    println!(
        "✓ Exported '{}' to {} ({})",
        entry.label(),
        target.display(),
        format_size(json.len() as u64)
    );
    Ok(())
}

async fn delete_backup(backups: &Store, index: usize, force: bool) -> Result<(), anyhow::Error> {
    let entry = select(backups, index).await?;

    if !force && !confirm(&format!("Are you sure you want to delete backup '{}'?", entry.label()))? {
        println!("Deletion cancelled");
        return Ok(());
    }

    match backups.remove_backup(&entry.store_key()).await {
        Ok(()) => {
            println!("✓ Backup deleted successfully");
            Ok(())
        }
        Err(e) => {
            error!("Failed to delete backup: {}", e);
            Err(e.into())
        }
    }
}

async fn prune(backups: &Store) -> Result<(), anyhow::Error> {
    let evicted = backups.cleanup_if_full().await?;
    let removed = backups.cleanup_unused_data_files().await?;
    println!("✓ Evicted {evicted} automatic backups, removed {removed} data files");
    Ok(())
}

async fn drop_all(backups: &Store, force: bool) -> Result<(), anyhow::Error> {
    if !force && !confirm("Are you sure you want to delete every backup?")? {
        println!("Cancelled");
        return Ok(());
    }

    backups.drop_all_backups().await?;
    println!("✓ All backups dropped");
    Ok(())
}

fn confirm(question: &str) -> Result<bool, anyhow::Error> {
    use std::io::{self, Write};

    print!("{question} (y/N): ");
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_lowercase().starts_with('y'))
}

fn kind_name(kind: BackupKind) -> &'static str {
    match kind {
        BackupKind::Automatic => "automatic",
        BackupKind::Manual => "manual",
    }
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

fn format_timestamp(millis: i64) -> String {
    use chrono::{Local, TimeZone};

    match Local.timestamp_millis_opt(millis) {
        chrono::LocalResult::Single(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        _ => millis.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_format_timestamp_falls_back_to_raw_value() {
        assert_eq!(format_timestamp(i64::MAX), i64::MAX.to_string());
    }

    #[test]
    fn test_cli_parses_export() {
        let cli = Cli::try_parse_from(["capsule", "--store", "memory://", "export", "2", "--out", "x.json"])
            .unwrap();
        assert_eq!(cli.store, "memory://");
        match cli.command {
            Commands::Export { index, out } => {
                assert_eq!(index, 2);
                assert_eq!(out, PathBuf::from("x.json"));
            }
            _ => panic!("expected export"),
        }
    }

    fn cli_for(dir: &std::path::Path, extra: &[&str]) -> Cli {
        let store = dir.to_string_lossy().to_string();
        let mut args = vec!["capsule", "--store", store.as_str()];
        args.extend_from_slice(extra);
        Cli::try_parse_from(args).unwrap()
    }

    async fn seed_old_store(dir: &std::path::Path) -> Box<dyn KeyValueStore> {
        let store = create_store_from_config(&StoreConfig::directory(dir)).unwrap();
        store
            .set_item(&StoreKey::Version.to_key_string().unwrap(), "v0".into())
            .await
            .unwrap();
        store
            .set_item(r#"{"type":"manual","dateTime":"1"}"#, "{}".into())
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_read_commands_leave_mismatched_store_alone() {
        let dir = tempfile::tempdir().unwrap();
        let store = seed_old_store(dir.path()).await;

        let commands: [&[&str]; 4] = [&["list"], &["show", "1"], &["export", "1"], &["prune"]];
        for command in commands {
            let err = open_store(&cli_for(dir.path(), command)).await.err().unwrap();
            assert!(err.to_string().contains("--reset"));
        }
        assert_eq!(store.keys().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_reset_wipes_mismatched_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = seed_old_store(dir.path()).await;

        let backups = open_store(&cli_for(dir.path(), &["--reset", "list"]))
            .await
            .unwrap();
        assert!(backups.get_sorted_keys().await.unwrap().is_empty());
        assert_eq!(store.keys().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_select_is_one_based() {
        let backups: Store = BackupStore::new(
            create_store_from_config(&StoreConfig::default_memory()).unwrap(),
            10,
        );
        backups.init().await;
        assert!(select(&backups, 0).await.is_err());
        assert!(select(&backups, 1).await.is_err());
    }
}
