#![forbid(unsafe_code)]
//! `fraid` — snapshot parity protection for disk arrays.
//!
//! The binary is a thin shell over the workspace crates: it loads the JSON
//! array configuration and the content snapshot, dispatches the subcommand,
//! and persists the snapshot afterwards. All policy lives in `fraid-sync`
//! and `fraid-model`.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fraid_hash::{HashKind, HashSpec};
use fraid_model::{stat_entity, ArrayState, BlockCell, Disk, FileId, LiveState};
use fraid_sync::{run_sync, SilentProgress, SyncOptions};
use fraid_types::{BlockIndex, BlockSize};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "fraid", about = "FrankenRAID — snapshot parity protection for disk arrays")]
struct Cli {
    /// Path to the array configuration.
    #[arg(long, global = true, default_value = "fraid.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan the data disks, tracking new files and marking removed ones.
    Scan,
    /// Bring the parity files into agreement with the data disks.
    Sync {
        /// First block to process.
        #[arg(long, default_value_t = 0)]
        start: u32,
        /// Number of blocks to process (0 means to the end).
        #[arg(long, default_value_t = 0)]
        count: u32,
        /// Hash all new data before touching parity.
        #[arg(long)]
        prehash: bool,
        /// Rebuild parity even if the existing files are undersized.
        #[arg(long)]
        force_full: bool,
        /// Disable the copy detection advice.
        #[arg(long)]
        force_nocopy: bool,
        /// Extend parity sparsely instead of preallocating.
        #[arg(long)]
        skip_fallocate: bool,
        /// Force a checkpoint right after this block.
        #[arg(long, default_value_t = 0)]
        force_autosave_at: u32,
        /// How many per-block EIOs are tolerated before a hard stop.
        #[arg(long, default_value_t = 100)]
        io_error_limit: u32,
    },
    /// Summarise the array state and list bad blocks.
    Status {
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

// ── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Config {
    /// Content snapshot path.
    content: PathBuf,
    /// Block size in bytes.
    #[serde(default = "default_block_size")]
    block_size: u32,
    /// Digest algorithm for new arrays.
    #[serde(default)]
    hash: HashChoice,
    /// Checkpoint threshold in GiB of processed data (0 disables it).
    #[serde(default)]
    autosave_gib: u64,
    data: Vec<DataDisk>,
    parity: Vec<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct DataDisk {
    name: String,
    dir: PathBuf,
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum HashChoice {
    #[default]
    Xxh3,
    Blake3,
}

impl From<HashChoice> for HashKind {
    fn from(choice: HashChoice) -> Self {
        match choice {
            HashChoice::Xxh3 => Self::Xxh3,
            HashChoice::Blake3 => Self::Blake3,
        }
    }
}

fn default_block_size() -> u32 {
    fraid_types::DEFAULT_BLOCK_SIZE
}

fn load_config(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read config {}", path.display()))?;
    let config: Config =
        serde_json::from_str(&text).with_context(|| format!("bad config {}", path.display()))?;
    if config.parity.is_empty() || config.parity.len() > fraid_types::LEV_MAX {
        bail!(
            "config must name between 1 and {} parity files",
            fraid_types::LEV_MAX
        );
    }
    if config.data.is_empty() {
        bail!("config names no data disks");
    }
    Ok(config)
}

/// Load the snapshot, or start a fresh array when none exists yet.
fn load_state(config: &Config) -> Result<ArrayState> {
    let block_size = BlockSize::new(config.block_size).map_err(|e| anyhow::anyhow!("{e}"))?;

    let mut state = if config.content.exists() {
        let state = ArrayState::load_content(&config.content)
            .with_context(|| format!("cannot load content {}", config.content.display()))?;
        if state.block_size != block_size {
            bail!(
                "config block size {} does not match the content file ({})",
                block_size,
                state.block_size
            );
        }
        if state.level != config.parity.len() {
            bail!(
                "config names {} parity files but the content file was written with {}",
                config.parity.len(),
                state.level
            );
        }
        state
    } else {
        let seed: [u8; 16] = rand::random();
        let mut state = ArrayState::new(
            block_size,
            config.parity.len(),
            HashSpec::new(config.hash.into(), seed),
        );
        for disk in &config.data {
            state.disks.push(Disk::new(disk.name.clone(), &disk.dir));
        }
        state.content_path = config.content.clone();
        state
    };

    if state.disks.len() != config.data.len() {
        bail!(
            "config names {} data disks but the content file has {}",
            config.data.len(),
            state.disks.len()
        );
    }
    // Directories may have been remounted elsewhere; the config wins.
    for (disk, configured) in state.disks.iter_mut().zip(&config.data) {
        disk.dir = configured.dir.clone();
    }

    state.parity_paths = config.parity.clone();
    state.content_path = config.content.clone();
    state.autosave = config.autosave_gib * 1024 * 1024 * 1024;
    Ok(state)
}

// ── Scan ────────────────────────────────────────────────────────────────────

fn list_files(dir: &Path, prefix: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir.join(prefix))? {
        let entry = entry?;
        let sub = prefix.join(entry.file_name());
        let kind = entry.file_type()?;
        if kind.is_dir() {
            list_files(dir, &sub, out)?;
        } else if kind.is_file() {
            out.push(sub);
        }
    }
    Ok(())
}

/// Track new files as CHG runs appended to the disk, and turn the blocks of
/// removed files into DELETED so the next sync rewrites their parity.
fn scan(state: &mut ArrayState) -> Result<()> {
    let block_size = state.block_size;
    for disk in &mut state.disks {
        let mut present: Vec<PathBuf> = Vec::new();
        list_files(&disk.dir, Path::new(""), &mut present)
            .with_context(|| format!("cannot scan {}", disk.dir.display()))?;

        // Removed or modified files: their parity is stale now.
        let mut stale: Vec<FileId> = Vec::new();
        for (idx, entity) in disk.files().iter().enumerate() {
            #[expect(clippy::cast_possible_truncation)] // arena is u32-indexed
            let id = FileId(idx as u32);
            let on_disk = stat_entity(&disk.dir, &entity.sub).ok();
            let unchanged = on_disk.as_ref().is_some_and(|live| {
                live.size == entity.size
                    && live.mtime_sec == entity.mtime_sec
                    && live.mtime_nsec == entity.mtime_nsec
                    && live.inode == entity.inode
            });
            if !unchanged {
                stale.push(id);
                if on_disk.is_some() {
                    warn!(disk = %disk.name, file = %entity.sub.display(), "file changed, re-syncing as new");
                }
            }
        }

        for i in 0..disk.blockmax() {
            let i = BlockIndex(i);
            if let BlockCell::Live { file, hash, .. } = disk.block(i) {
                if stale.contains(&file) {
                    disk.set_block(i, BlockCell::Deleted { hash });
                }
            }
        }

        // New files (and the re-added changed ones) append after everything.
        for sub in present {
            let already = disk
                .files()
                .iter()
                .enumerate()
                .any(|(idx, entity)| {
                    #[expect(clippy::cast_possible_truncation)]
                    let id = FileId(idx as u32);
                    entity.sub == sub && !stale.contains(&id)
                });
            if already {
                continue;
            }
            let entity = stat_entity(&disk.dir, &sub)?;
            let start = BlockIndex(disk.blockmax());
            info!(disk = %disk.name, file = %sub.display(), blocks = block_size.blocks_for_file(entity.size), "tracking");
            disk.track_file(entity, start, block_size);
        }
    }
    state.need_write = true;
    Ok(())
}

// ── Status ──────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct StatusOutput {
    block_size: u32,
    level: usize,
    disks: Vec<DiskStatus>,
    bad_blocks: Vec<u32>,
}

#[derive(Debug, Serialize)]
struct DiskStatus {
    name: String,
    files: usize,
    blocks_synced: u32,
    blocks_pending: u32,
    blocks_deleted: u32,
}

fn status(state: &ArrayState, json: bool) -> Result<()> {
    let blockmax = state.parity_allocated_size();
    let mut disks = Vec::new();
    for disk in &state.disks {
        let mut synced = 0_u32;
        let mut pending = 0_u32;
        let mut deleted = 0_u32;
        for i in 0..blockmax.0 {
            match disk.block(BlockIndex(i)) {
                BlockCell::Empty => {}
                BlockCell::Deleted { .. } => deleted += 1,
                BlockCell::Live { state, .. } => match state {
                    LiveState::Blk => synced += 1,
                    LiveState::Chg | LiveState::Rep => pending += 1,
                },
            }
        }
        disks.push(DiskStatus {
            name: disk.name.clone(),
            files: disk.files().len(),
            blocks_synced: synced,
            blocks_pending: pending,
            blocks_deleted: deleted,
        });
    }

    let bad_blocks: Vec<u32> = (0..blockmax.0)
        .filter(|&i| state.info.get(BlockIndex(i)).is_bad())
        .collect();

    let output = StatusOutput {
        block_size: state.block_size.get(),
        level: state.level,
        disks,
        bad_blocks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!(
            "array: {} disks, {} parity levels, {} byte blocks",
            output.disks.len(),
            output.level,
            output.block_size
        );
        for d in &output.disks {
            println!(
                "  {}: {} files, {} synced, {} pending, {} deleted",
                d.name, d.files, d.blocks_synced, d.blocks_pending, d.blocks_deleted
            );
        }
        if output.bad_blocks.is_empty() {
            println!("no bad blocks");
        } else {
            println!("bad blocks: {:?}", output.bad_blocks);
        }
    }
    Ok(())
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let mut state = load_state(&config)?;

    match cli.command {
        Command::Scan => {
            scan(&mut state)?;
            state.write_content()?;
            Ok(())
        }
        Command::Sync {
            start,
            count,
            prehash,
            force_full,
            force_nocopy,
            skip_fallocate,
            force_autosave_at,
            io_error_limit,
        } => {
            let opts = SyncOptions {
                force_full,
                force_nocopy,
                skip_fallocate,
                prehash,
                expect_recoverable: false,
                force_autosave_at,
                io_error_limit,
                skip_self: false,
            };
            let result = run_sync(
                &mut state,
                BlockIndex(start),
                count,
                &opts,
                &mut SilentProgress,
            );
            // Whatever got committed must survive, error or not.
            if state.need_write {
                state.write_content()?;
            }
            result.map_err(|e| anyhow::anyhow!("{e}"))?;
            Ok(())
        }
        Command::Status { json } => status(&state, json),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
