//! The prehash pass.
//!
//! Fills the missing digest of every CHG block in the range before any
//! parity work starts: the user gets to find read errors (and abort) while
//! parity is still untouched, and the sync pass can then trust stored CHG
//! hashes when deciding whether parity truly needs rewriting. Blocks are
//! promoted to REP (hash known, parity still stale), never to BLK.

use crate::progress::Progress;
use crate::usage::UsageTimer;
use fraid_error::IoClass;
use fraid_model::{ArrayState, BlockCell, DiskHandle, LiveState};
use fraid_types::BlockIndex;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct HashOutcome {
    /// The next sync pass must not run (user abort or bail).
    pub skip_sync: bool,
    pub error: u32,
    pub io_error: u32,
}

impl HashOutcome {
    pub(crate) fn failed(&self) -> bool {
        self.error + self.io_error != 0
    }
}

pub(crate) fn hash_process(
    state: &mut ArrayState,
    blockstart: BlockIndex,
    blockmax: BlockIndex,
    progress: &mut dyn Progress,
) -> HashOutcome {
    let diskmax = state.disks.len();
    let block_size = state.block_size;
    let mut handles: Vec<DiskHandle> = (0..diskmax).map(|_| DiskHandle::new()).collect();
    let mut buffer = vec![0_u8; block_size.as_usize()];
    let mut out = HashOutcome::default();
    let mut usage = UsageTimer::start();

    // Count the blocks to process so progress totals are meaningful.
    let mut countmax: u32 = 0;
    for disk in &state.disks {
        for ii in blockstart.0..blockmax.0 {
            let cell = disk.block(BlockIndex(ii));
            if cell.has_file() && !cell.has_updated_hash() {
                countmax += 1;
            }
        }
    }
    usage.waste();

    let mut countsize: u64 = 0;
    let mut countpos: u32 = 0;
    let mut bailed = false;

    'pass: {
        if !progress.begin(blockstart, blockmax, countmax) {
            break 'pass;
        }

        for j in 0..diskmax {
            for ii in blockstart.0..blockmax.0 {
                let i = BlockIndex(ii);
                let cell = state.disks[j].block(i);
                if !cell.has_file() || cell.has_updated_hash() {
                    continue;
                }
                let BlockCell::Live {
                    state: LiveState::Chg,
                    file,
                    file_pos,
                    ..
                } = cell
                else {
                    continue;
                };

                let rehash = state.info.get(i).is_rehash();
                usage.cpu();

                // A different file on this slot: close it first.
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
                                continue;
                            }
                            IoClass::Eaccess => {
                                warn!(block = ii, disk = %disk.name, file = %sub, "no access to file");
                                warn!("fix the access permission in the data disk and rerun");
                                out.error += 1;
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
                    continue;
                }

                let read_size = match handles[j].read(file_pos, block_size, &mut buffer) {
                    Ok(n) => n,
                    Err(e) => {
                        let disk = &state.disks[j];
                        let sub = disk.file(file).sub.display().to_string();
                        if IoClass::of(&e) == IoClass::Eio {
                            error!(block = ii, disk = %disk.name, file = %sub, pos = file_pos, %e, "read failed");
                            error!(
                                "DANGER! Unexpected input/output read error in a data disk, \
                                 it isn't possible to sync. Stopping at block {ii}"
                            );
                            out.io_error += 1;
                        } else {
                            error!(block = ii, disk = %disk.name, file = %sub, pos = file_pos, %e, "read failed");
                            out.error += 1;
                        }
                        bailed = true;
                        break 'pass;
                    }
                };
                usage.disk();
                countsize += read_size as u64;

                let spec = if rehash { state.prev_hash } else { state.hash };
                let digest = spec.digest(&buffer[..read_size]);

                state.disks[j].set_block(
                    i,
                    BlockCell::Live {
                        state: LiveState::Rep,
                        file,
                        file_pos,
                        hash: digest,
                    },
                );
                state.need_write = true;
                countpos += 1;

                if progress.tick(i, countpos, countmax, countsize) {
                    out.skip_sync = true;
                    break 'pass;
                }
            }

            // Close the last file on this disk.
            if let Err(e) = handles[j].close() {
                let disk = &state.disks[j];
                if IoClass::of(&e) == IoClass::Eio {
                    error!(disk = %disk.name, %e, "close failed");
                    error!("DANGER! Unexpected input/output close error in a data disk");
                    out.io_error += 1;
                } else {
                    error!(disk = %disk.name, %e, "close failed");
                    out.error += 1;
                }
                bailed = true;
                break 'pass;
            }
        }
    }

    if bailed {
        // A bail also forbids the following sync pass.
        out.skip_sync = true;
    } else {
        progress.end(countpos, countmax, countsize);
        if out.error != 0 {
            info!(file_errors = out.error, "hash pass finished with errors");
            warn!("WARNING! Unexpected file errors!");
        } else if countpos != 0 {
            info!("Everything OK");
        }
        debug!(error_file = out.error, "hash summary");
    }

    // Close whatever is still open; at this point errors are only counted.
    for (j, handle) in handles.iter_mut().enumerate() {
        if let Err(e) = handle.close() {
            error!(disk = %state.disks[j].name, %e, "close failed while exiting");
            out.error += 1;
        }
    }

    out
}

pub(crate) fn warn_stat_mismatch(
    disk: &str,
    entity: &fraid_model::FileEntity,
    st: &fraid_model::StatSnapshot,
    block: u32,
) {
    let sub = entity.sub.display().to_string();
    if st.size != entity.size {
        warn!(
            block,
            disk,
            file = %sub,
            from = entity.size,
            to = st.size,
            "unexpected size change"
        );
    } else if st.mtime_sec != entity.mtime_sec || st.mtime_nsec != entity.mtime_nsec {
        warn!(
            block,
            disk,
            file = %sub,
            from = %format!("{}.{}", entity.mtime_sec, entity.mtime_nsec),
            to = %format!("{}.{}", st.mtime_sec, st.mtime_nsec),
            "unexpected time change"
        );
    } else {
        warn!(
            block,
            disk,
            file = %sub,
            from = entity.inode,
            to = st.inode,
            "unexpected inode change"
        );
    }
    warn!("you cannot modify files during a sync, rerun when finished");
}
