//! Lazily-opened data-file readers, one per disk slot.
//!
//! The sync passes walk block indices in order, so consecutive blocks of the
//! same file reuse one open descriptor; the handle is switched only when a
//! different file shows up on the same disk slot. The `stat` snapshot taken
//! at open time is what gets compared against the recorded file entity —
//! a mismatch means the file changed while the sync was running.

use crate::block::{Disk, FileEntity, FileId};
use fraid_types::BlockSize;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Live `stat` fields compared against a [`FileEntity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatSnapshot {
    pub size: u64,
    pub mtime_sec: i64,
    pub mtime_nsec: u32,
    pub inode: u64,
}

impl StatSnapshot {
    /// True when every recorded field still matches the live file.
    #[must_use]
    pub fn matches(&self, entity: &FileEntity) -> bool {
        self.size == entity.size
            && self.mtime_sec == entity.mtime_sec
            && self.mtime_nsec == entity.mtime_nsec
            && self.inode == entity.inode
    }
}

#[derive(Debug)]
struct OpenFile {
    id: FileId,
    file: File,
    stat: StatSnapshot,
    path: PathBuf,
}

/// Read handle for one disk slot.
#[derive(Debug, Default)]
pub struct DiskHandle {
    open: Option<OpenFile>,
}

impl DiskHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the currently open file, if any.
    #[must_use]
    pub fn current(&self) -> Option<FileId> {
        self.open.as_ref().map(|o| o.id)
    }

    /// Path of the currently open file, for diagnostics.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.open.as_ref().map(|o| o.path.as_path())
    }

    /// Stat snapshot taken when the current file was opened.
    #[must_use]
    pub fn stat(&self) -> Option<StatSnapshot> {
        self.open.as_ref().map(|o| o.stat)
    }

    /// Open `id` read-only and snapshot its `stat`. A no-op returning the
    /// cached snapshot when `id` is already the open file.
    pub fn open(&mut self, disk: &Disk, id: FileId) -> io::Result<StatSnapshot> {
        if let Some(open) = self.open.as_ref() {
            if open.id == id {
                return Ok(open.stat);
            }
        }
        debug_assert!(self.open.is_none(), "switch requires an explicit close");

        let path = disk.file_path(id);
        let file = File::open(&path)?;
        let stat = {
            use std::os::unix::fs::MetadataExt;
            let meta = file.metadata()?;
            let mtime_nsec = u32::try_from(meta.mtime_nsec()).unwrap_or(0);
            StatSnapshot {
                size: meta.size(),
                mtime_sec: meta.mtime(),
                mtime_nsec,
                inode: meta.ino(),
            }
        };
        self.open = Some(OpenFile {
            id,
            file,
            stat,
            path,
        });
        Ok(stat)
    }

    /// Read the block at `file_pos` into `buf`, zero-padding past the end of
    /// the file. Returns the number of bytes actually read.
    ///
    /// The final block of a file whose size is not a multiple of the block
    /// size reads short; the zero-padded tail is what parity covers.
    pub fn read(
        &mut self,
        file_pos: u32,
        block_size: BlockSize,
        buf: &mut [u8],
    ) -> io::Result<usize> {
        let open = self
            .open
            .as_mut()
            .ok_or_else(|| io::Error::other("no file open on this handle"))?;

        let len = block_size.as_usize();
        let offset = u64::from(file_pos) * u64::from(block_size.get());
        let remaining = open.stat.size.saturating_sub(offset);
        let read_size = usize::try_from(remaining.min(len as u64)).unwrap_or(len);

        open.file.read_exact_at(&mut buf[..read_size], offset)?;
        buf[read_size..len].fill(0);
        Ok(read_size)
    }

    /// Close the current file, if any.
    ///
    /// Dropping a `File` swallows `close(2)` errors; the descriptor is closed
    /// by hand so an `EIO` at close is still observable.
    pub fn close(&mut self) -> io::Result<()> {
        use std::os::fd::IntoRawFd;
        if let Some(open) = self.open.take() {
            nix::unistd::close(open.file.into_raw_fd()).map_err(io::Error::from)?;
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::stat_entity;
    use fraid_types::BlockIndex;

    fn setup(content: &[u8]) -> (tempfile::TempDir, Disk, FileId) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.bin"), content).unwrap();
        let mut disk = Disk::new("d0", dir.path());
        let entity = stat_entity(dir.path(), Path::new("data.bin")).unwrap();
        let id = disk.track_file(entity, BlockIndex(0), BlockSize::new(4096).unwrap());
        (dir, disk, id)
    }

    #[test]
    fn read_full_and_short_blocks() {
        let bs = BlockSize::new(4096).unwrap();
        let mut content = vec![0xCD_u8; 4096];
        content.extend_from_slice(&[0xAB; 100]);
        let (_dir, disk, id) = setup(&content);

        let mut handle = DiskHandle::new();
        handle.open(&disk, id).unwrap();

        let mut buf = vec![0xFF_u8; 4096];
        assert_eq!(handle.read(0, bs, &mut buf).unwrap(), 4096);
        assert!(buf.iter().all(|&b| b == 0xCD));

        assert_eq!(handle.read(1, bs, &mut buf).unwrap(), 100);
        assert!(buf[..100].iter().all(|&b| b == 0xAB));
        assert!(buf[100..].iter().all(|&b| b == 0), "tail not zero-padded");

        handle.close().unwrap();
        assert!(handle.current().is_none());
    }

    #[test]
    fn stat_matches_recorded_entity() {
        let (_dir, disk, id) = setup(b"hello");
        let mut handle = DiskHandle::new();
        handle.open(&disk, id).unwrap();
        assert!(handle.stat().unwrap().matches(disk.file(id)));
    }

    #[test]
    fn stat_mismatch_after_modification() {
        let (dir, disk, id) = setup(b"hello");

        // Rewrite with different content length.
        std::fs::write(dir.path().join("data.bin"), b"hello world, changed").unwrap();

        let mut handle = DiskHandle::new();
        handle.open(&disk, id).unwrap();
        assert!(!handle.stat().unwrap().matches(disk.file(id)));
    }

    #[test]
    fn open_missing_file_is_not_found() {
        let (dir, disk, id) = setup(b"hello");
        std::fs::remove_file(dir.path().join("data.bin")).unwrap();

        let mut handle = DiskHandle::new();
        let err = handle.open(&disk, id).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn reopen_same_file_is_noop() {
        let (_dir, disk, id) = setup(b"hello");
        let mut handle = DiskHandle::new();
        handle.open(&disk, id).unwrap();
        let stat = handle.stat().unwrap();
        handle.open(&disk, id).unwrap();
        assert_eq!(handle.stat().unwrap(), stat);
    }
}
