//! The sync pass.
//!
//! Walks every enabled index in the range: reads the data blocks, verifies
//! stored hashes, recovers silent errors in memory through the parity codec,
//! regenerates and writes the parity rows that actually changed, commits the
//! block-state transitions, and checkpoints periodically.
//!
//! An index is *enabled* when at least one disk has a file there and at
//! least one disk has invalid parity there; everything else is already in
//! agreement and is skipped.
//!
//! Ordering is the crash-safety contract: all data reads complete before any
//! parity write, all parity writes complete before any model mutation, and
//! the content snapshot is never written without fsyncing every parity level
//! first. A crash mid-index leaves the snapshot describing the old state, so
//! the next run simply re-processes that index.

use crate::buffer::BufferPool;
use crate::hash_pass::warn_stat_mismatch;
use crate::progress::Progress;
use crate::usage::UsageTimer;
use crate::SyncOptions;
use fraid_error::{FraidError, IoClass};
use fraid_model::{ArrayState, BlockCell, DiskHandle, LiveState};
use fraid_parity::ParityFile;
use fraid_types::{BlockHash, BlockIndex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

/// A block recorded for possible recovery at the current index: either it
/// has invalid parity (its prior content may still be encoded there), or it
/// is a BLK whose fresh hash did not match.
#[derive(Debug, Clone, Copy)]
struct FailedBlock {
    /// Disk slot.
    disk: usize,
    /// Bytes actually read (short at the tail of a file).
    size: usize,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SyncOutcome {
    pub error: u32,
    pub silent_error: u32,
    pub io_error: u32,
}

impl SyncOutcome {
    pub(crate) fn total(&self) -> u32 {
        self.error + self.silent_error + self.io_error
    }
}

fn block_is_enabled(state: &ArrayState, i: BlockIndex) -> bool {
    let mut one_valid = false;
    let mut one_invalid = false;
    for disk in &state.disks {
        let cell = disk.block(i);
        if cell.has_file() {
            one_valid = true;
        }
        if cell.has_invalid_parity() {
            one_invalid = true;
        }
    }
    one_valid && one_invalid
}

fn now_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[expect(clippy::too_many_lines)] // one loop, one state machine
pub(crate) fn sync_process(
    state: &mut ArrayState,
    parities: &[ParityFile],
    blockstart: BlockIndex,
    blockmax: BlockIndex,
    opts: &SyncOptions,
    progress: &mut dyn Progress,
) -> SyncOutcome {
    // The pass trusts every stored hash, including CHG and DELETED ones; the
    // loader must have cleared hashes that predate the current algorithm.
    debug_assert!(state.clear_past_hash);

    let now = now_seconds();
    let diskmax = state.disks.len();
    let level = state.level;
    let block_size = state.block_size;
    let bs = block_size.as_usize();

    let mut handles: Vec<DiskHandle> = (0..diskmax).map(|_| DiskHandle::new()).collect();
    let mut pool = BufferPool::new(diskmax, level, block_size);
    if !opts.skip_self {
        assert!(pool.self_test(), "block buffer self-test failed");
    }

    // Pending new-algorithm hashes, one slot per disk, for rehash indices.
    let mut rehash_pending: Vec<Option<BlockHash>> = vec![None; diskmax];
    let mut failed: Vec<FailedBlock> = Vec::with_capacity(diskmax);
    let mut failed_map: Vec<usize> = Vec::with_capacity(diskmax);

    let mut out = SyncOutcome::default();
    let mut usage = UsageTimer::start();

    let mut countmax: u32 = 0;
    for ii in blockstart.0..blockmax.0 {
        if block_is_enabled(state, BlockIndex(ii)) {
            countmax += 1;
        }
    }

    // The autosave step is sized on all disks being read in parallel.
    let autosavelimit =
        state.autosave / ((diskmax.max(1) as u64) * u64::from(block_size.get()));
    let mut autosavemissing = u64::from(countmax);
    let mut autosavedone: u64 = 0;

    usage.waste();

    let mut countsize: u64 = 0;
    let mut countpos: u32 = 0;
    let mut bailed = false;

    'pass: {
        if !progress.begin(blockstart, blockmax, countmax) {
            break 'pass;
        }

        for ii in blockstart.0..blockmax.0 {
            let i = BlockIndex(ii);
            if !block_is_enabled(state, i) {
                continue;
            }

            autosavedone += 1;
            autosavemissing -= 1;

            let mut error_on_this_block = false;
            let mut silent_error_on_this_block = false;
            let mut io_error_on_this_block = false;
            let mut fixed_error_on_this_block = false;

            failed.clear();

            let info = state.info.get(i);
            let rehash = info.is_rehash();

            // A bad index may owe its badness to wrong parity; rewrite it.
            let mut parity_needs_to_be_updated = info.is_bad();

            // ── Per-disk read and verify ────────────────────────────────
            for j in 0..diskmax {
                rehash_pending[j] = None;

                let cell = state.disks[j].block(i);

                if cell.has_invalid_parity() {
                    // Parity may still encode this cell's previous content;
                    // keep it around for the recovery map. DELETED cells are
                    // recorded here and skipped by the file check below.
                    failed.push(FailedBlock {
                        disk: j,
                        size: bs,
                    });

                    // CHG decides later, from the hash comparison.
                    if !matches!(
                        cell,
                        BlockCell::Live {
                            state: LiveState::Chg,
                            ..
                        }
                    ) {
                        parity_needs_to_be_updated = true;
                    }
                }

                let BlockCell::Live {
                    state: cell_state,
                    file,
                    file_pos,
                    hash: stored_hash,
                } = cell
                else {
                    // EMPTY or DELETED contributes zeroes to the new parity.
                    pool.zero_data(j);
                    continue;
                };

                usage.cpu();

                if handles[j].current().is_some_and(|open| open != file) {
                    if let Err(e) = handles[j].close() {
                        let disk = &state.disks[j];
                        if IoClass::of(&e) == IoClass::Eio {
                            error!(block = ii, disk = %disk.name, %e, "close failed");
                            error!(
                                "DANGER! Unexpected input/output close error in a data disk, \
                                 it isn't possible to sync. Stopping at block {ii}"
                            );
                            out.io_error += 1;
                        } else {
                            error!(block = ii, disk = %disk.name, %e, "close failed");
                            out.error += 1;
                        }
                        bailed = true;
                        break 'pass;
                    }
                }

                let st = match handles[j].open(&state.disks[j], file) {
                    Ok(st) => st,
                    Err(e) => {
                        let disk = &state.disks[j];
                        let sub = disk.file(file).sub.display().to_string();
                        match IoClass::of(&e) {
                            IoClass::Eio => {
                                error!(block = ii, disk = %disk.name, file = %sub, %e, "open failed");
                                error!(
                                    "DANGER! Unexpected input/output open error in a data disk, \
                                     it isn't possible to sync. Stopping at block {ii}"
                                );
                                out.io_error += 1;
                                bailed = true;
                                break 'pass;
                            }
                            IoClass::Enoent => {
                                warn!(block = ii, disk = %disk.name, file = %sub, "missing file");
                                warn!("you cannot modify data disks during a sync, rerun when finished");
                                out.error += 1;
                                error_on_this_block = true;
                                continue;
                            }
                            IoClass::Eaccess => {
                                warn!(block = ii, disk = %disk.name, file = %sub, "no access to file");
                                warn!("fix the access permission in the data disk and rerun");
                                out.error += 1;
                                error_on_this_block = true;
                                continue;
                            }
                            IoClass::Other => {
                                error!(block = ii, disk = %disk.name, file = %sub, %e, "open failed");
                                out.error += 1;
                                bailed = true;
                                break 'pass;
                            }
                        }
                    }
                };

                let entity = state.disks[j].file(file);
                if !st.matches(entity) {
                    warn_stat_mismatch(&state.disks[j].name, entity, &st, ii);
                    out.error += 1;
                    error_on_this_block = true;
                    continue;
                }

                let read_size = match handles[j].read(file_pos, block_size, pool.data_mut(j)) {
                    Ok(n) => n,
                    Err(e) => {
                        let disk = &state.disks[j];
                        let sub = disk.file(file).sub.display().to_string();
                        if IoClass::of(&e) == IoClass::Eio {
                            error!(block = ii, disk = %disk.name, file = %sub, pos = file_pos, %e, "read failed");
                            if out.io_error >= opts.io_error_limit {
                                error!(
                                    "DANGER! Too many input/output read errors in a data disk, \
                                     it isn't possible to sync. Stopping at block {ii}"
                                );
                                out.io_error += 1;
                                bailed = true;
                                break 'pass;
                            }
                            warn!(disk = %disk.name, file = %sub, pos = file_pos, "input/output error");
                            out.io_error += 1;
                            io_error_on_this_block = true;
                            continue;
                        }
                        error!(block = ii, disk = %disk.name, file = %sub, pos = file_pos, %e, "read failed");
                        out.error += 1;
                        bailed = true;
                        break 'pass;
                    }
                };
                usage.disk();
                countsize += read_size as u64;

                let fresh = if rehash {
                    // Verify under the previous algorithm; stash the new one
                    // for the commit.
                    rehash_pending[j] = Some(state.hash.digest(&pool.data(j)[..read_size]));
                    state.prev_hash.digest(&pool.data(j)[..read_size])
                } else {
                    state.hash.digest(&pool.data(j)[..read_size])
                };

                if cell.has_updated_hash() {
                    if fresh != stored_hash {
                        let entity = state.disks[j].file(file);
                        let sub = entity.sub.display().to_string();
                        if cell.has_invalid_parity() {
                            // A REP modified after its hash was recorded.
                            warn!(block = ii, disk = %state.disks[j].name, file = %sub, pos = file_pos, "unexpected data change");
                            warn!("WARNING! Unexpected data modification of a file without parity!");
                            if entity.is_copy {
                                warn!(
                                    "this file was detected as a copy with matching name, size and \
                                     timestamp, but its data differs; if the files are expected to \
                                     be different, sync again with --force-nocopy"
                                );
                            } else {
                                warn!("try removing the file from the array and rerun the sync");
                            }
                            out.error += 1;
                            error_on_this_block = true;
                            continue;
                        }
                        // A BLK that no longer matches: silent error.
                        warn!(block = ii, disk = %state.disks[j].name, file = %sub, pos = file_pos, "data error");
                        failed.push(FailedBlock {
                            disk: j,
                            size: read_size,
                        });
                        out.silent_error += 1;
                        silent_error_on_this_block = true;
                        continue;
                    }
                } else {
                    // Only CHG reaches here: EMPTY/DELETED bailed at the file
                    // check, BLK/REP in the branch above.
                    debug_assert_eq!(cell_state, LiveState::Chg);

                    if !parity_needs_to_be_updated {
                        if stored_hash.is_real() {
                            if fresh != stored_hash {
                                parity_needs_to_be_updated = true;
                            }
                        } else {
                            parity_needs_to_be_updated = true;
                        }
                    }

                    // Record the hash but keep the CHG state: if this index
                    // is later skipped, the content stays recoverable from
                    // the old parity.
                    // Under rehash this is the previous-algorithm hash; the
                    // commit overwrites it with the stashed one.
                    state.disks[j].set_block(
                        i,
                        BlockCell::Live {
                            state: LiveState::Chg,
                            file,
                            file_pos,
                            hash: fresh,
                        },
                    );
                }
            }

            // ── Silent-error recovery, in memory only ───────────────────
            // The reconstruction is used to validate the data and keep the
            // new parity consistent; it is never written to the data disk.
            // That is the fix command's job, driven by the bad flag below.
            if silent_error_on_this_block && !error_on_this_block && !io_error_on_this_block {
                failed_map.clear();
                let mut something_to_recover = false;
                let mut map_complete = true;

                for fb in &failed {
                    let j = fb.disk;
                    let cell = state.disks[j].block(i);

                    if matches!(cell, BlockCell::Live { state: LiveState::Blk, .. }) {
                        something_to_recover = true;
                    }

                    // The recovery overwrites the buffer; keep the as-read
                    // content so non-BLK blocks can be put back afterward.
                    pool.save_scratch(j);

                    let chg_zero = matches!(
                        cell,
                        BlockCell::Live { state: LiveState::Chg, hash, .. } if hash.is_zero()
                    );
                    if chg_zero {
                        // The previous parity encoded nothing for this cell.
                        pool.zero_data(j);
                    } else {
                        if failed_map.len() >= level {
                            map_complete = false;
                            break;
                        }
                        failed_map.push(j);
                    }
                }

                if something_to_recover && map_complete {
                    usage.cpu();

                    // At least one BLK exists, so parity exists at this index.
                    for l in 0..level {
                        match parities[l].read_block(block_size, i, pool.parity_mut(l)) {
                            Ok(()) => usage.parity(),
                            Err(FraidError::Io(e)) if IoClass::of(&e) == IoClass::Eio => {
                                error!(block = ii, level = parities[l].level().name(), %e, "parity read failed");
                                if out.io_error >= opts.io_error_limit {
                                    error!(
                                        "DANGER! Too many input/output read errors in the {} disk, \
                                         it isn't possible to sync. Stopping at block {ii}",
                                        parities[l].level().name()
                                    );
                                    out.io_error += 1;
                                    bailed = true;
                                    break 'pass;
                                }
                                warn!(level = parities[l].level().name(), block = ii, "input/output error in parity");
                                out.io_error += 1;
                                io_error_on_this_block = true;
                            }
                            Err(e) => {
                                error!(block = ii, level = parities[l].level().name(), %e, "parity read failed");
                                out.error += 1;
                                bailed = true;
                                break 'pass;
                            }
                        }
                    }

                    if !io_error_on_this_block {
                        let recovered =
                            fraid_raid::recover(&failed_map, diskmax, level, bs, pool.codec_slice());

                        let mut all_verified = recovered;
                        if recovered {
                            for fb in &failed {
                                let j = fb.disk;
                                let cell = state.disks[j].block(i);
                                if let BlockCell::Live {
                                    state: LiveState::Blk,
                                    hash,
                                    ..
                                } = cell
                                {
                                    let size = fb.size;
                                    let spec = if rehash { state.prev_hash } else { state.hash };
                                    let digest = spec.digest(&pool.data(j)[..size]);
                                    if digest != hash {
                                        all_verified = false;
                                        break;
                                    }
                                    pool.data_mut(j)[size..bs].fill(0);
                                } else {
                                    // The old content was only needed to feed
                                    // the codec; the new parity must encode
                                    // what is on disk now.
                                    pool.restore_scratch(j);
                                }
                            }
                        }

                        if all_verified {
                            fixed_error_on_this_block = true;
                        }
                    }
                }
            }

            // ── Parity generate and commit ──────────────────────────────
            if !error_on_this_block
                && !io_error_on_this_block
                && (!silent_error_on_this_block || fixed_error_on_this_block)
            {
                if parity_needs_to_be_updated {
                    fraid_raid::generate(diskmax, level, bs, pool.codec_slice());
                    usage.cpu();

                    for l in 0..level {
                        match parities[l].write_block(block_size, i, pool.parity(l)) {
                            Ok(()) => usage.parity(),
                            Err(FraidError::Io(e)) if IoClass::of(&e) == IoClass::Eio => {
                                error!(block = ii, level = parities[l].level().name(), %e, "parity write failed");
                                if out.io_error >= opts.io_error_limit {
                                    error!(
                                        "DANGER! Too many input/output write errors in the {} disk, \
                                         it isn't possible to sync. Stopping at block {ii}",
                                        parities[l].level().name()
                                    );
                                    out.io_error += 1;
                                    bailed = true;
                                    break 'pass;
                                }
                                warn!(level = parities[l].level().name(), block = ii, "input/output error in parity");
                                out.io_error += 1;
                                io_error_on_this_block = true;
                            }
                            Err(e) => {
                                error!(block = ii, level = parities[l].level().name(), %e, "parity write failed");
                                error!("ensure the {} disk has free space available", parities[l].level().name());
                                out.error += 1;
                                bailed = true;
                                break 'pass;
                            }
                        }
                    }
                }

                if !io_error_on_this_block {
                    // Parity now covers the new content: promote every live
                    // cell and erase the deleted ones.
                    for j in 0..diskmax {
                        match state.disks[j].block(i) {
                            BlockCell::Empty => {}
                            BlockCell::Deleted { .. } => {
                                state.disks[j].set_block(i, BlockCell::Empty);
                            }
                            BlockCell::Live {
                                file,
                                file_pos,
                                hash,
                                ..
                            } => {
                                state.disks[j].set_block(
                                    i,
                                    BlockCell::Live {
                                        state: LiveState::Blk,
                                        file,
                                        file_pos,
                                        hash,
                                    },
                                );
                            }
                        }
                    }
                }

                // Refresh the info word only when parity was really written
                // and the data is known good; a timestamp over data we know
                // is bad would be misleading.
                if parity_needs_to_be_updated
                    && !silent_error_on_this_block
                    && !io_error_on_this_block
                {
                    if rehash {
                        for j in 0..diskmax {
                            if let Some(new_hash) = rehash_pending[j] {
                                if let BlockCell::Live {
                                    state: cell_state,
                                    file,
                                    file_pos,
                                    ..
                                } = state.disks[j].block(i)
                                {
                                    state.disks[j].set_block(
                                        i,
                                        BlockCell::Live {
                                            state: cell_state,
                                            file,
                                            file_pos,
                                            hash: new_hash,
                                        },
                                    );
                                }
                            }
                        }
                    }

                    state
                        .info
                        .set(i, fraid_model::InfoWord::make(now, false, false));
                }
            }

            // The in-memory correction is not on the data disk; flag the
            // index so check/fix re-examines it.
            if silent_error_on_this_block || io_error_on_this_block {
                state.info.set(i, info.with_bad());
            }

            state.need_write = true;
            countpos += 1;

            if progress.tick(i, countpos, countmax, countsize) {
                break;
            }

            // ── Autosave ────────────────────────────────────────────────
            let forced = opts.force_autosave_at != 0 && opts.force_autosave_at == ii;
            if (state.autosave != 0
                && autosavedone >= autosavelimit
                && autosavemissing >= autosavelimit)
                || forced
            {
                autosavedone = 0;
                usage.cpu();
                progress.stop();
                info!("Autosaving...");

                // The snapshot must never describe parity that is still in
                // the disk cache.
                for parity in parities {
                    if let Err(e) = parity.sync() {
                        error!(block = ii, level = parity.level().name(), %e, "parity sync failed");
                        error!("DANGER! Unexpected sync error in {} disk", parity.level().name());
                        out.error += 1;
                        bailed = true;
                        break 'pass;
                    }
                }
                if let Err(e) = state.write_content() {
                    error!(%e, "content write failed");
                    out.error += 1;
                    bailed = true;
                    break 'pass;
                }

                progress.restart();
                usage.waste();
            }
        }
    }

    if !bailed {
        progress.end(countpos, countmax, countsize);
        usage.print();

        // Terminal flush: nothing returned as synced may still be volatile.
        for parity in parities {
            if let Err(e) = parity.sync() {
                error!(level = parity.level().name(), %e, "parity sync failed");
                error!("DANGER! Unexpected sync error in {} disk", parity.level().name());
                out.error += 1;
                bailed = true;
                break;
            }
        }
    }

    if !bailed {
        if out.total() != 0 {
            info!(
                file_errors = out.error,
                io_errors = out.io_error,
                data_errors = out.silent_error,
                "sync finished with errors"
            );
        } else if countpos != 0 {
            info!("Everything OK");
        }
        if out.error != 0 {
            warn!("WARNING! Unexpected file errors!");
        }
        if out.io_error != 0 {
            error!("DANGER! Unexpected input/output errors! The failing blocks are now marked as bad!");
        }
        if out.silent_error != 0 {
            error!("DANGER! Unexpected data errors! The failing blocks are now marked as bad!");
        }
        if out.io_error != 0 || out.silent_error != 0 {
            error!("use the status command to list the bad blocks and the fix command to recover");
        }
        debug!(
            error_file = out.error,
            error_io = out.io_error,
            error_data = out.silent_error,
            exit = if out.total() == 0 { "ok" } else { "error" },
            "sync summary"
        );
    }

    for (j, handle) in handles.iter_mut().enumerate() {
        if let Err(e) = handle.close() {
            error!(disk = %state.disks[j].name, %e, "close failed while exiting");
            out.error += 1;
        }
    }

    out
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use fraid_hash::{HashKind, HashSpec};
    use fraid_model::{Disk, FileEntity, FileId};
    use fraid_types::BlockSize;

    fn state_with_cells(cells: Vec<Vec<BlockCell>>) -> ArrayState {
        let mut state = ArrayState::new(
            BlockSize::new(4096).unwrap(),
            1,
            HashSpec::new(HashKind::Xxh3, [1; 16]),
        );
        for (n, disk_cells) in cells.into_iter().enumerate() {
            let mut disk = Disk::new(format!("d{n}"), format!("/tmp/d{n}"));
            disk.push_file(FileEntity {
                sub: "f".into(),
                size: 4096,
                mtime_sec: 0,
                mtime_nsec: 0,
                inode: 0,
                is_copy: false,
            });
            for (idx, cell) in disk_cells.into_iter().enumerate() {
                #[expect(clippy::cast_possible_truncation)]
                disk.set_block(BlockIndex(idx as u32), cell);
            }
            state.disks.push(disk);
        }
        state
    }

    fn live(s: LiveState) -> BlockCell {
        BlockCell::Live {
            state: s,
            file: FileId(0),
            file_pos: 0,
            hash: BlockHash::ZERO,
        }
    }

    #[test]
    fn enabled_needs_a_file_and_invalid_parity() {
        // One CHG: both a file and invalid parity on the same disk.
        let state = state_with_cells(vec![vec![live(LiveState::Chg)]]);
        assert!(block_is_enabled(&state, BlockIndex(0)));

        // All BLK: nothing invalid.
        let state = state_with_cells(vec![vec![live(LiveState::Blk)]]);
        assert!(!block_is_enabled(&state, BlockIndex(0)));

        // Only a DELETED cell: invalid parity but no file anywhere.
        let state = state_with_cells(vec![vec![BlockCell::Deleted {
            hash: BlockHash::ZERO,
        }]]);
        assert!(!block_is_enabled(&state, BlockIndex(0)));

        // DELETED on one disk plus BLK on another: file + invalid.
        let state = state_with_cells(vec![
            vec![BlockCell::Deleted {
                hash: BlockHash::ZERO,
            }],
            vec![live(LiveState::Blk)],
        ]);
        assert!(block_is_enabled(&state, BlockIndex(0)));

        // Empty index.
        let state = state_with_cells(vec![vec![]]);
        assert!(!block_is_enabled(&state, BlockIndex(5)));
    }
}
