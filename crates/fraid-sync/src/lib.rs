#![forbid(unsafe_code)]
//! The FrankenRAID sync engine.
//!
//! [`run_sync`] brings the parity files back into agreement with the data
//! disks: it opens and resizes the parity set, optionally runs the prehash
//! pass, then drives the sync pass over the requested block range, and
//! closes everything down. The heavy lifting lives in the two passes; this
//! module is the orchestration and the guard rails around parity sizing.

mod buffer;
mod hash_pass;
mod progress;
mod sync_pass;
mod usage;

pub use progress::{Progress, SilentProgress};

use fraid_error::{FraidError, Result};
use fraid_model::ArrayState;
use fraid_parity::ParityFile;
use fraid_types::{BlockIndex, ParityLevel};
use tracing::{error, info, warn};

/// Knobs for one sync invocation.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Accept undersized parity files and rebuild them from scratch.
    pub force_full: bool,
    /// Advice flag surfaced when a deduplicated file fails verification.
    pub force_nocopy: bool,
    /// Extend parity sparsely instead of preallocating.
    pub skip_fallocate: bool,
    /// Run the hash pass before touching parity.
    pub prehash: bool,
    /// Invert the success sense: the run is expected to find errors
    /// (used by the test suites of the outer tooling).
    pub expect_recoverable: bool,
    /// Force an autosave right after this block index; 0 disables it.
    pub force_autosave_at: u32,
    /// How many per-block `EIO`s are tolerated before a hard bail.
    pub io_error_limit: u32,
    /// Skip the buffer self-test.
    pub skip_self: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            force_full: false,
            force_nocopy: false,
            skip_fallocate: false,
            prehash: false,
            expect_recoverable: false,
            force_autosave_at: 0,
            io_error_limit: 100,
            skip_self: false,
        }
    }
}

/// Error counters accumulated across both passes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncSummary {
    pub file_errors: u32,
    pub io_errors: u32,
    pub data_errors: u32,
}

/// Sync the block range `[blockstart, blockstart + blockcount)` (the whole
/// range when `blockcount` is 0).
///
/// Returns the accumulated counters on success. Any unrecoverable condition
/// — a bailed pass, nonzero error counters (inverted under
/// `expect_recoverable`), a failing parity close — yields
/// [`FraidError::Unrecoverable`]; configuration problems (range out of
/// bounds, undersized parity without `force_full`) yield
/// [`FraidError::Config`] before anything is modified.
pub fn run_sync(
    state: &mut ArrayState,
    blockstart: BlockIndex,
    blockcount: u32,
    opts: &SyncOptions,
    progress: &mut dyn Progress,
) -> Result<SyncSummary> {
    info!("Initializing...");

    let mut blockmax = state.parity_allocated_size();
    // Parity files always cover the full allocation, even for a range run.
    let size = state.block_size.block_to_byte(blockmax);
    let used_paritymax = state.parity_used_size();

    if blockstart > blockmax {
        return Err(FraidError::Config(format!(
            "starting block {blockstart} is bigger than the parity size {blockmax}"
        )));
    }

    if blockcount != 0 {
        let end = u64::from(blockstart.0) + u64::from(blockcount);
        if end < u64::from(blockmax.0) {
            #[expect(clippy::cast_possible_truncation)] // end < blockmax.0: u32
            {
                blockmax = BlockIndex(end as u32);
            }
        }
    }

    if state.parity_paths.len() != state.level {
        return Err(FraidError::Config(format!(
            "{} parity paths configured for {} levels",
            state.parity_paths.len(),
            state.level
        )));
    }

    // ── Open and measure every parity level ─────────────────────────────
    let mut parities: Vec<ParityFile> = Vec::with_capacity(state.level);
    let mut file_paritymax: u32 = 0;
    for (l, path) in state.parity_paths.iter().enumerate() {
        #[expect(clippy::cast_possible_truncation)] // level <= LEV_MAX
        let lev = ParityLevel::new(l as u8).map_err(|e| FraidError::Config(e.to_string()))?;
        let parity = ParityFile::create(lev, path)?;
        let parityblocks = parity.block_count(state.block_size)?;

        if parityblocks < used_paritymax.0 {
            warn!(
                level = lev.name(),
                path = %path.display(),
                has = parityblocks,
                expected = used_paritymax.0,
                "parity file has fewer data blocks than expected"
            );
        }
        if l == 0 || file_paritymax > parityblocks {
            file_paritymax = parityblocks;
        }
        parities.push(parity);
    }

    // An undersized parity set means its tail content cannot be trusted;
    // only a full rebuild may proceed from here.
    if !opts.force_full && file_paritymax < used_paritymax.0 {
        error!("DANGER! One or more of the parity files are smaller than expected!");
        if file_paritymax != 0 {
            error!(
                "if this happens because you are using an old content file, \
                 sync again with --force-full to rebuild the parity"
            );
        } else {
            error!("it's possible that the parity disks are not mounted");
            error!(
                "if instead you are adding a new parity level, sync again \
                 with --force-full to rebuild the parity"
            );
        }
        return Err(FraidError::Config(
            "parity files smaller than expected".to_owned(),
        ));
    }

    // ── Resize ──────────────────────────────────────────────────────────
    // From this point every DELETED block past the new end is gone for good;
    // the next content write drops them.
    for parity in &parities {
        if let Err(e) = parity.chsize(size, opts.skip_fallocate) {
            log_parity_overflow(state, parity.size().unwrap_or(0));
            error!(
                level = parity.level().name(),
                "without an accessible {} file, it isn't possible to sync",
                parity.level().name()
            );
            return Err(e);
        }
    }

    state.refresh_freespace();

    let mut unrecoverable: u32 = 0;
    let mut skip_sync = false;
    let mut summary = SyncSummary::default();

    // ── Hash pass ───────────────────────────────────────────────────────
    if opts.prehash {
        info!("Hashing...");
        let outcome = hash_pass::hash_process(state, blockstart, blockmax, progress);
        skip_sync = outcome.skip_sync;
        summary.file_errors += outcome.error;
        summary.io_errors += outcome.io_error;
        if outcome.failed() {
            unrecoverable += 1;
        }
        if state.need_write {
            state.write_content()?;
        }
    }

    // ── Sync pass ───────────────────────────────────────────────────────
    if !skip_sync {
        info!("Syncing...");
        if blockstart < blockmax {
            let outcome =
                sync_pass::sync_process(state, &parities, blockstart, blockmax, opts, progress);
            summary.file_errors += outcome.error;
            summary.io_errors += outcome.io_error;
            summary.data_errors += outcome.silent_error;

            let failed = if opts.expect_recoverable {
                outcome.total() == 0
            } else {
                outcome.total() != 0
            };
            if failed {
                unrecoverable += 1;
            }
        } else {
            info!("Nothing to do");
        }
    }

    for parity in parities {
        let name = parity.level().name();
        if let Err(e) = parity.close() {
            error!(level = name, %e, "DANGER! Unexpected close error in a parity disk");
            unrecoverable += 1;
        }
    }

    if unrecoverable != 0 {
        return Err(FraidError::Unrecoverable {
            file_errors: summary.file_errors,
            io_errors: summary.io_errors,
            data_errors: summary.data_errors,
        });
    }
    Ok(summary)
}

/// Name the disks whose block allocation no longer fits the parity size.
fn log_parity_overflow(state: &ArrayState, available_bytes: u64) {
    let available_blocks = state.block_size.bytes_to_blocks(available_bytes);
    for disk in &state.disks {
        if disk.blockmax() > available_blocks {
            warn!(
                disk = %disk.name,
                needed = disk.blockmax(),
                available = available_blocks,
                "disk allocation exceeds the parity capacity"
            );
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options() {
        let opts = SyncOptions::default();
        assert!(!opts.force_full);
        assert!(!opts.prehash);
        assert_eq!(opts.io_error_limit, 100);
        assert_eq!(opts.force_autosave_at, 0);
    }
}
