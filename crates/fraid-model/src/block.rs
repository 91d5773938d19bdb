//! Per-disk block cells, file entities, and the disk itself.
//!
//! A disk is a named directory plus a dense array of block cells indexed by
//! [`BlockIndex`]. Cells are tagged variants rather than a state byte with
//! side tables: a `Live` cell points into the disk's file arena, a `Deleted`
//! cell keeps only the hash of the content that parity still encodes, and
//! `Empty` means the position is unused on this disk.

use fraid_types::{BlockHash, BlockIndex, BlockSize};
use std::path::{Path, PathBuf};

/// Index into a disk's file arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(pub u32);

/// One tracked file on a data disk.
///
/// Size, mtime, and inode are the values recorded when the file was scanned;
/// the sync engine compares them against a live `stat` to detect concurrent
/// modification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntity {
    /// Path relative to the disk directory.
    pub sub: PathBuf,
    pub size: u64,
    pub mtime_sec: i64,
    pub mtime_nsec: u32,
    pub inode: u64,
    /// File was deduplicated against another by metadata match.
    pub is_copy: bool,
}

/// State of a live block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveState {
    /// Content differs from what parity encodes; hash may be stale or zero.
    Chg,
    /// Hash is known, parity not yet updated.
    Rep,
    /// Hash authoritative, parity covers it.
    Blk,
}

/// One (disk, index) position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCell {
    /// Position unused on this disk.
    Empty,
    /// File is gone but parity still encodes its prior content.
    Deleted { hash: BlockHash },
    /// Backed by a live file.
    Live {
        state: LiveState,
        file: FileId,
        /// Block offset within the file, in block units.
        file_pos: u32,
        hash: BlockHash,
    },
}

impl BlockCell {
    /// True for BLK, CHG, and REP.
    #[must_use]
    pub fn has_file(&self) -> bool {
        matches!(self, Self::Live { .. })
    }

    /// True for BLK and REP: the stored hash matches the current content.
    #[must_use]
    pub fn has_updated_hash(&self) -> bool {
        matches!(
            self,
            Self::Live {
                state: LiveState::Blk | LiveState::Rep,
                ..
            }
        )
    }

    /// True for CHG, REP, and DELETED: parity does not yet reflect this cell.
    #[must_use]
    pub fn has_invalid_parity(&self) -> bool {
        matches!(
            self,
            Self::Deleted { .. }
                | Self::Live {
                    state: LiveState::Chg | LiveState::Rep,
                    ..
                }
        )
    }

    /// Stored hash, if the cell carries one.
    #[must_use]
    pub fn hash(&self) -> Option<BlockHash> {
        match self {
            Self::Empty => None,
            Self::Deleted { hash } | Self::Live { hash, .. } => Some(*hash),
        }
    }
}

/// A named data disk: directory, file arena, and block array.
#[derive(Debug, Clone, Default)]
pub struct Disk {
    pub name: String,
    pub dir: PathBuf,
    files: Vec<FileEntity>,
    blocks: Vec<BlockCell>,
}

impl Disk {
    #[must_use]
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
            files: Vec::new(),
            blocks: Vec::new(),
        }
    }

    /// Cell at `i`; positions past the array end are `Empty`.
    #[must_use]
    pub fn block(&self, i: BlockIndex) -> BlockCell {
        self.blocks
            .get(i.0 as usize)
            .copied()
            .unwrap_or(BlockCell::Empty)
    }

    /// Store `cell` at `i`, growing the array with `Empty` as needed.
    pub fn set_block(&mut self, i: BlockIndex, cell: BlockCell) {
        let idx = i.0 as usize;
        if idx >= self.blocks.len() {
            if cell == BlockCell::Empty {
                return;
            }
            self.blocks.resize(idx + 1, BlockCell::Empty);
        }
        self.blocks[idx] = cell;
    }

    #[must_use]
    pub fn file(&self, id: FileId) -> &FileEntity {
        &self.files[id.0 as usize]
    }

    #[must_use]
    pub fn files(&self) -> &[FileEntity] {
        &self.files
    }

    /// Absolute path of a tracked file.
    #[must_use]
    pub fn file_path(&self, id: FileId) -> PathBuf {
        self.dir.join(&self.file(id).sub)
    }

    /// Append a file entity without touching blocks.
    pub fn push_file(&mut self, entity: FileEntity) -> FileId {
        #[expect(clippy::cast_possible_truncation)] // arena bounded by u32 blocks
        let id = FileId(self.files.len() as u32);
        self.files.push(entity);
        id
    }

    /// Track a new file: append its entity and lay out CHG cells with no
    /// hash starting at `start`, one per `block_size` unit of `entity.size`.
    pub fn track_file(
        &mut self,
        entity: FileEntity,
        start: BlockIndex,
        block_size: BlockSize,
    ) -> FileId {
        let blocks = block_size.blocks_for_file(entity.size);
        let id = self.push_file(entity);
        for pos in 0..blocks {
            self.set_block(
                BlockIndex(start.0 + pos),
                BlockCell::Live {
                    state: LiveState::Chg,
                    file: id,
                    file_pos: pos,
                    hash: BlockHash::ZERO,
                },
            );
        }
        id
    }

    /// Highest non-empty index + 1.
    #[must_use]
    pub fn blockmax(&self) -> u32 {
        let used = self
            .blocks
            .iter()
            .rposition(|c| *c != BlockCell::Empty)
            .map_or(0, |p| p + 1);
        u32::try_from(used).unwrap_or(u32::MAX)
    }

    #[must_use]
    pub fn raw_blocks(&self) -> &[BlockCell] {
        &self.blocks
    }
}

/// Build a [`FileEntity`] from a live file on disk.
pub fn stat_entity(dir: &Path, sub: &Path) -> std::io::Result<FileEntity> {
    use std::os::unix::fs::MetadataExt;
    let meta = std::fs::metadata(dir.join(sub))?;
    let mtime_nsec = u32::try_from(meta.mtime_nsec()).unwrap_or(0);
    Ok(FileEntity {
        sub: sub.to_owned(),
        size: meta.size(),
        mtime_sec: meta.mtime(),
        mtime_nsec,
        inode: meta.ino(),
        is_copy: false,
    })
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates_per_state() {
        let live = |state| BlockCell::Live {
            state,
            file: FileId(0),
            file_pos: 0,
            hash: BlockHash::ZERO,
        };
        let deleted = BlockCell::Deleted {
            hash: BlockHash::ZERO,
        };

        assert!(!BlockCell::Empty.has_file());
        assert!(!BlockCell::Empty.has_invalid_parity());

        assert!(!deleted.has_file());
        assert!(deleted.has_invalid_parity());
        assert!(!deleted.has_updated_hash());

        assert!(live(LiveState::Chg).has_file());
        assert!(live(LiveState::Chg).has_invalid_parity());
        assert!(!live(LiveState::Chg).has_updated_hash());

        assert!(live(LiveState::Rep).has_invalid_parity());
        assert!(live(LiveState::Rep).has_updated_hash());

        assert!(!live(LiveState::Blk).has_invalid_parity());
        assert!(live(LiveState::Blk).has_updated_hash());
    }

    #[test]
    fn disk_block_defaults_empty() {
        let disk = Disk::new("d0", "/tmp/d0");
        assert_eq!(disk.block(BlockIndex(42)), BlockCell::Empty);
        assert_eq!(disk.blockmax(), 0);
    }

    #[test]
    fn track_file_lays_out_chg_cells() {
        let bs = BlockSize::new(4096).unwrap();
        let mut disk = Disk::new("d0", "/tmp/d0");
        let entity = FileEntity {
            sub: PathBuf::from("a.bin"),
            size: 4096 * 2 + 100, // 3 blocks, short tail
            mtime_sec: 1,
            mtime_nsec: 2,
            inode: 3,
            is_copy: false,
        };
        let id = disk.track_file(entity, BlockIndex(1), bs);

        assert_eq!(disk.block(BlockIndex(0)), BlockCell::Empty);
        for (i, pos) in [(1_u32, 0_u32), (2, 1), (3, 2)] {
            match disk.block(BlockIndex(i)) {
                BlockCell::Live {
                    state: LiveState::Chg,
                    file,
                    file_pos,
                    hash,
                } => {
                    assert_eq!(file, id);
                    assert_eq!(file_pos, pos);
                    assert!(hash.is_zero());
                }
                other => panic!("expected CHG at {i}, got {other:?}"),
            }
        }
        assert_eq!(disk.blockmax(), 4);
    }

    #[test]
    fn set_block_empty_past_end_is_noop() {
        let mut disk = Disk::new("d0", "/tmp/d0");
        disk.set_block(BlockIndex(10), BlockCell::Empty);
        assert_eq!(disk.blockmax(), 0);
        assert!(disk.raw_blocks().is_empty());
    }
}
