#![forbid(unsafe_code)]
//! Array model for FrankenRAID.
//!
//! Materialises the block/disk/file model that the sync engine walks: per
//! disk, a file arena and a dense array of tagged block cells; per logical
//! index, a packed info word; plus the content-file snapshot that persists
//! all of it across runs.

mod block;
mod content;
mod handle;
mod info;

pub use block::{stat_entity, BlockCell, Disk, FileEntity, FileId, LiveState};
pub use handle::{DiskHandle, StatSnapshot};
pub use info::{InfoArray, InfoWord};

use fraid_error::Result;
use fraid_hash::HashSpec;
use fraid_types::{BlockIndex, BlockSize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// The whole array: geometry, hash configuration, disks, and info words.
#[derive(Debug, Clone)]
pub struct ArrayState {
    pub block_size: BlockSize,
    /// Number of parity levels in use (1..=6).
    pub level: usize,
    /// Current digest algorithm/seed pair.
    pub hash: HashSpec,
    /// Previous pair, still in effect at indices flagged `rehash`.
    pub prev_hash: HashSpec,
    pub disks: Vec<Disk>,
    pub info: InfoArray,
    /// One path per parity level. Config-owned, not persisted.
    pub parity_paths: Vec<PathBuf>,
    /// Where the content snapshot lives. Config-owned, not persisted.
    pub content_path: PathBuf,
    /// Autosave threshold in bytes of processed data; 0 disables it.
    pub autosave: u64,
    /// Loader guarantee: stale CHG/DELETED hashes were cleared, so every
    /// stored hash can be trusted during the sync pass.
    pub clear_past_hash: bool,
    /// The model changed since the last snapshot write.
    pub need_write: bool,
}

impl ArrayState {
    /// Fresh empty state with the given geometry.
    #[must_use]
    pub fn new(block_size: BlockSize, level: usize, hash: HashSpec) -> Self {
        Self {
            block_size,
            level,
            hash,
            prev_hash: hash,
            disks: Vec::new(),
            info: InfoArray::new(),
            parity_paths: Vec::new(),
            content_path: PathBuf::new(),
            autosave: 0,
            clear_past_hash: true,
            need_write: false,
        }
    }

    /// Highest index + 1 any disk allocates (counting DELETED cells, whose
    /// parity is still live).
    #[must_use]
    pub fn parity_allocated_size(&self) -> BlockIndex {
        BlockIndex(self.disks.iter().map(Disk::blockmax).max().unwrap_or(0))
    }

    /// Highest index + 1 whose parity was ever written. This is the least
    /// size the existing parity files must have for their content to be
    /// trusted.
    #[must_use]
    pub fn parity_used_size(&self) -> BlockIndex {
        BlockIndex(self.info.used_size())
    }

    /// Persist the content snapshot and clear the dirty marker.
    pub fn write_content(&mut self) -> Result<()> {
        content::save_to(self, &self.content_path)?;
        self.need_write = false;
        debug!(path = %self.content_path.display(), "content snapshot written");
        Ok(())
    }

    /// Load a snapshot. Config-owned fields (parity paths, autosave) are
    /// left at their defaults for the caller to fill in.
    pub fn load_content(path: &Path) -> Result<Self> {
        content::load_from(path)
    }

    /// Log the free space of every parity directory. Failures are reported
    /// and otherwise ignored; the numbers are advisory.
    pub fn refresh_freespace(&self) {
        for path in &self.parity_paths {
            let dir = path.parent().unwrap_or(Path::new("."));
            match nix::sys::statvfs::statvfs(dir) {
                Ok(vfs) => {
                    let free = vfs.blocks_available() * vfs.fragment_size();
                    debug!(dir = %dir.display(), free_bytes = free, "parity free space");
                }
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "cannot stat parity filesystem");
                }
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use fraid_hash::HashKind;
    use fraid_types::BlockHash;

    fn sample_state() -> ArrayState {
        let bs = BlockSize::new(4096).unwrap();
        let mut state = ArrayState::new(bs, 2, HashSpec::new(HashKind::Blake3, [9; 16]));
        state.prev_hash = HashSpec::new(HashKind::Xxh3, [4; 16]);

        let mut d0 = Disk::new("d0", "/mnt/disk0");
        let f = d0.track_file(
            FileEntity {
                sub: "a/b.bin".into(),
                size: 4096 * 2 + 5,
                mtime_sec: 1_700_000_000,
                mtime_nsec: 123,
                inode: 77,
                is_copy: true,
            },
            BlockIndex(0),
            bs,
        );
        d0.set_block(
            BlockIndex(3),
            BlockCell::Deleted {
                hash: BlockHash([2; 16]),
            },
        );
        d0.set_block(
            BlockIndex(4),
            BlockCell::Live {
                state: LiveState::Blk,
                file: f,
                file_pos: 9,
                hash: BlockHash([3; 16]),
            },
        );
        state.disks.push(d0);
        state.disks.push(Disk::new("d1", "/mnt/disk1"));

        state
            .info
            .set(BlockIndex(4), InfoWord::make(1_700_000_123, true, false));
        state
    }

    #[test]
    fn allocated_and_used_sizes() {
        let state = sample_state();
        assert_eq!(state.parity_allocated_size(), BlockIndex(5));
        assert_eq!(state.parity_used_size(), BlockIndex(5));

        let empty = ArrayState::new(
            BlockSize::new(4096).unwrap(),
            1,
            HashSpec::new(HashKind::Xxh3, [0; 16]),
        );
        assert_eq!(empty.parity_allocated_size(), BlockIndex(0));
        assert_eq!(empty.parity_used_size(), BlockIndex(0));
    }

    #[test]
    fn content_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("content.fraid");

        let mut state = sample_state();
        state.content_path = path.clone();
        state.need_write = true;
        state.write_content().unwrap();
        assert!(!state.need_write);

        let loaded = ArrayState::load_content(&path).unwrap();
        assert_eq!(loaded.block_size, state.block_size);
        assert_eq!(loaded.level, 2);
        assert_eq!(loaded.hash, state.hash);
        assert_eq!(loaded.prev_hash, state.prev_hash);
        assert_eq!(loaded.clear_past_hash, state.clear_past_hash);
        assert_eq!(loaded.disks.len(), 2);
        assert_eq!(loaded.disks[0].name, "d0");
        assert_eq!(loaded.disks[0].files().len(), 1);
        assert!(loaded.disks[0].files()[0].is_copy);
        assert_eq!(
            loaded.disks[0].block(BlockIndex(3)),
            state.disks[0].block(BlockIndex(3))
        );
        assert_eq!(
            loaded.disks[0].block(BlockIndex(4)),
            state.disks[0].block(BlockIndex(4))
        );
        assert!(loaded.info.get(BlockIndex(4)).is_bad());
        assert_eq!(loaded.info.get(BlockIndex(4)).timestamp(), 1_700_000_123);
    }

    #[test]
    fn content_rejects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("content.fraid");

        let mut state = sample_state();
        state.content_path = path.clone();
        state.write_content().unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let err = ArrayState::load_content(&path).unwrap_err();
        assert!(err.to_string().contains("crc mismatch"), "{err}");
    }

    #[test]
    fn content_rejects_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("content.fraid");

        let mut state = sample_state();
        state.content_path = path.clone();
        state.write_content().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 10]).unwrap();
        assert!(ArrayState::load_content(&path).is_err());
    }

    #[test]
    fn write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("content.fraid");
        let mut state = sample_state();
        state.content_path = path.clone();
        state.write_content().unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("content.fraid")]);
    }
}
