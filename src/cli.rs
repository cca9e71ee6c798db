use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;
use tracing::debug;

use crate::cache::eviction::enumerate_entries;
use crate::cache::{CacheKey, CacheState, CacheStore, IntegrityMode};
use crate::config::{CacheConfig, ENV_ENABLED};
use crate::utils::logger;

const MAINTENANCE_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Parser, Debug)]
#[command(name = "codecache", version, about = "Inspect and manage the compiled-code cache")]
pub struct CodecacheCli {
    #[arg(long, global = true)]
    /// Cache root directory. Defaults to $CODECACHE_DIR or the platform cache dir.
    root: Option<PathBuf>,

    #[arg(long, global = true, value_name = "BYTES")]
    /// Maximum cache size in bytes.
    max_size: Option<u64>,

    #[arg(long, global = true)]
    /// Verify entries against the version token only (legacy on-disk format).
    legacy_token: bool,

    #[command(subcommand)]
    command: Command,
}

impl CodecacheCli {
    pub fn command(&self) -> &Command {
        &self.command
    }

    fn config(&self) -> CacheConfig {
        let mut config = CacheConfig::from_env();
        if let Some(root) = &self.root {
            config.root = Some(root.clone());
        }
        if let Some(max) = self.max_size {
            config.max_bytes = max;
        }
        if self.legacy_token {
            config.integrity = IntegrityMode::LegacyToken;
        }
        config
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Prints the shard and file name a source identifier maps to.
    Key { source_id: String },
    /// Loads a cached payload.
    Get {
        source_id: String,
        #[arg(long = "version", value_name = "TOKEN")]
        version_token: String,
        #[arg(short, long)]
        /// Write the payload here instead of stdout.
        output: Option<PathBuf>,
    },
    /// Stores the contents of a file as the payload for a source identifier.
    Put {
        source_id: String,
        #[arg(long = "version", value_name = "TOKEN")]
        version_token: String,
        file: PathBuf,
    },
    /// Shows cache location, entry count and size.
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// Runs a maintenance pass and waits for it to finish.
    Maintain,
    /// Removes every cache entry.
    Clear,
}

pub fn run() -> Result<()> {
    logger::init_logging();
    let cli = CodecacheCli::parse();
    execute(&cli)
}

pub fn execute(cli: &CodecacheCli) -> Result<()> {
    match &cli.command {
        Command::Key { source_id } => {
            handle_key(source_id);
            Ok(())
        }
        Command::Get {
            source_id,
            version_token,
            output,
        } => handle_get(&open_store(cli)?, source_id, version_token, output.as_deref()),
        Command::Put {
            source_id,
            version_token,
            file,
        } => handle_put(&open_store(cli)?, source_id, version_token, file),
        Command::Stats { json } => handle_stats(&open_store(cli)?, *json),
        Command::Maintain => handle_maintain(&open_store(cli)?),
        Command::Clear => handle_clear(&open_store(cli)?),
    }
}

fn open_store(cli: &CodecacheCli) -> Result<CacheStore> {
    let config = cli.config();
    config.validate().context("invalid cache configuration")?;
    let store = CacheStore::new(config);
    if store.initialize() != CacheState::Ready {
        bail!("cache is disabled (check {ENV_ENABLED} and that the cache root is writable)");
    }
    Ok(store)
}

fn handle_key(source_id: &str) {
    let key = CacheKey::derive(source_id);
    println!("{} {}", "key".bold(), key.as_str());
    println!("{} {}/{}", "path".bold(), key.shard(), key.file_name());
}

fn handle_get(
    store: &CacheStore,
    source_id: &str,
    version_token: &str,
    output: Option<&Path>,
) -> Result<()> {
    let Some(payload) = store.load(source_id, version_token) else {
        bail!("no valid cache entry for {source_id}");
    };

    match output {
        Some(path) => {
            fs::write(path, &payload)
                .with_context(|| format!("failed to write payload to {}", path.display()))?;
            eprintln!(
                "{} {} bytes to {}",
                "wrote".green().bold(),
                payload.len(),
                path.display()
            );
        }
        None => {
            let mut stdout = io::stdout().lock();
            stdout
                .write_all(&payload)
                .and_then(|()| stdout.flush())
                .context("failed to write payload to stdout")?;
        }
    }
    Ok(())
}

fn handle_put(store: &CacheStore, source_id: &str, version_token: &str, file: &Path) -> Result<()> {
    let payload =
        fs::read(file).with_context(|| format!("failed to read payload {}", file.display()))?;
    store
        .try_store(source_id, version_token, &payload)
        .with_context(|| format!("failed to store cache entry for {source_id}"))?;
    println!(
        "{} {} ({} bytes)",
        "stored".green().bold(),
        source_id,
        payload.len()
    );
    Ok(())
}

#[derive(Debug, Serialize)]
struct StatsReport {
    root: PathBuf,
    entries: usize,
    exact_bytes: u64,
    approximate_bytes: u64,
    max_bytes: u64,
    oldest: Option<DateTime<Utc>>,
    newest: Option<DateTime<Utc>>,
}

fn handle_stats(store: &CacheStore, json: bool) -> Result<()> {
    let Some(root) = store.root() else {
        bail!("cache is disabled");
    };
    let entries = enumerate_entries(root);
    let times = entries.iter().filter_map(|entry| entry.modified);
    let report = StatsReport {
        root: root.to_path_buf(),
        entries: entries.len(),
        exact_bytes: entries.iter().map(|entry| entry.size).sum(),
        approximate_bytes: store.approximate_bytes(),
        max_bytes: store.config().max_bytes,
        oldest: times.clone().min().map(to_utc),
        newest: times.max().map(to_utc),
    };

    if json {
        let text = serde_json::to_string_pretty(&report).context("failed to encode stats")?;
        println!("{text}");
        return Ok(());
    }

    println!("{} {}", "root".bold(), report.root.display());
    println!("{} {}", "entries".bold(), report.entries);
    println!(
        "{} {} / {} ({:.1}%)",
        "size".bold(),
        format_bytes(report.exact_bytes),
        format_bytes(report.max_bytes),
        report.exact_bytes as f64 * 100.0 / report.max_bytes as f64
    );
    if let (Some(oldest), Some(newest)) = (report.oldest, report.newest) {
        println!(
            "{} {} .. {}",
            "used".bold(),
            oldest.format("%Y-%m-%d %H:%M:%S"),
            newest.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

fn handle_maintain(store: &CacheStore) -> Result<()> {
    // A reconciliation pass may already be queued from initialization; either
    // way waiting for the queue to drain covers it.
    let queued = store.maintain();
    debug!(queued, "requested maintenance");
    if !store.wait_for_maintenance(MAINTENANCE_TIMEOUT) {
        bail!("maintenance did not finish within {}s", MAINTENANCE_TIMEOUT.as_secs());
    }

    let stats = store.stats();
    println!(
        "{} size now {} ({} passes)",
        "maintained".green().bold(),
        format_bytes(stats.approximate_bytes),
        stats.maintenance_runs
    );
    Ok(())
}

fn handle_clear(store: &CacheStore) -> Result<()> {
    // Let the startup pass finish so it does not race the deletions.
    store.wait_for_maintenance(MAINTENANCE_TIMEOUT);
    let removed = store.clear().context("failed to clear cache")?;
    println!("{} {removed} entries", "removed".green().bold());
    Ok(())
}

fn to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_bytes_picks_unit() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(100 * 1024 * 1024), "100.0 MiB");
    }

    #[test]
    fn global_flags_override_config() {
        let cli = CodecacheCli::parse_from([
            "codecache",
            "--root",
            "/tmp/cc",
            "--max-size",
            "4096",
            "--legacy-token",
            "stats",
        ]);
        let config = cli.config();
        assert_eq!(config.root, Some(PathBuf::from("/tmp/cc")));
        assert_eq!(config.max_bytes, 4096);
        assert_eq!(config.integrity, IntegrityMode::LegacyToken);
    }

    #[test]
    fn put_then_get_through_commands() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("cache");
        let payload_path = dir.path().join("payload.bin");
        let output_path = dir.path().join("out.bin");
        fs::write(&payload_path, b"compiled").unwrap();

        let root_arg = root.to_str().unwrap();
        let put = CodecacheCli::parse_from([
            "codecache",
            "--root",
            root_arg,
            "put",
            "https://a/b.js",
            "--version",
            "v1",
            payload_path.to_str().unwrap(),
        ]);
        execute(&put).unwrap();

        let get = CodecacheCli::parse_from([
            "codecache",
            "--root",
            root_arg,
            "get",
            "https://a/b.js",
            "--version",
            "v1",
            "--output",
            output_path.to_str().unwrap(),
        ]);
        execute(&get).unwrap();
        assert_eq!(fs::read(&output_path).unwrap(), b"compiled");

        let miss = CodecacheCli::parse_from([
            "codecache",
            "--root",
            root_arg,
            "get",
            "https://a/b.js",
            "--version",
            "v2",
        ]);
        assert!(execute(&miss).is_err());
    }
}
