#![forbid(unsafe_code)]
//! Parity file handles.
//!
//! Each parity level is one flat file holding a grid of `block_size`-sized
//! blocks: byte offset of block `i` is `i * block_size`. The handle exposes
//! sized random-access block reads/writes via positional I/O, explicit
//! fsync, and resizing with optional preallocation.

use fraid_error::{FraidError, Result};
use fraid_types::{BlockIndex, BlockSize, ParityLevel};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::debug;

/// I/O counters for one parity file.
#[derive(Debug, Clone, Default)]
pub struct ParityStats {
    pub reads: u64,
    pub writes: u64,
    pub syncs: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// An open parity file for one level.
pub struct ParityFile {
    level: ParityLevel,
    path: PathBuf,
    file: File,
    stats: Mutex<ParityStats>,
}

impl std::fmt::Debug for ParityFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParityFile")
            .field("level", &self.level)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl ParityFile {
    /// Create or open the parity file for writing.
    ///
    /// The file is created if absent and never truncated here; resizing is a
    /// separate, explicit step so the driver can first compare the on-disk
    /// size against what the content file expects.
    pub fn create(level: ParityLevel, path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| FraidError::Parity {
                level: level.name(),
                detail: format!("cannot open {}: {e}", path.display()),
            })?;
        Ok(Self {
            level,
            path: path.to_owned(),
            file,
            stats: Mutex::new(ParityStats::default()),
        })
    }

    #[must_use]
    pub fn level(&self) -> ParityLevel {
        self.level
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size in bytes.
    pub fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Number of whole blocks currently stored.
    pub fn block_count(&self, block_size: BlockSize) -> Result<u32> {
        Ok(block_size.bytes_to_blocks(self.size()?))
    }

    /// Resize to exactly `bytes`, truncating or extending.
    ///
    /// Growth preallocates with `fallocate` unless `skip_fallocate` is set,
    /// falling back to a plain `set_len` on filesystems without support.
    pub fn chsize(&self, bytes: u64, skip_fallocate: bool) -> Result<()> {
        let current = self.size()?;
        if bytes == current {
            return Ok(());
        }

        if bytes > current && !skip_fallocate {
            let len = i64::try_from(bytes).map_err(|_| FraidError::Parity {
                level: self.level.name(),
                detail: format!("size {bytes} overflows fallocate"),
            })?;
            match nix::fcntl::fallocate(self.file.as_raw_fd(), nix::fcntl::FallocateFlags::empty(), 0, len) {
                Ok(()) => return Ok(()),
                Err(nix::errno::Errno::EOPNOTSUPP | nix::errno::Errno::EINVAL) => {
                    debug!(
                        level = self.level.name(),
                        "fallocate not supported, extending sparse"
                    );
                }
                Err(e) => {
                    return Err(FraidError::Io(std::io::Error::from(e)));
                }
            }
        }

        self.file.set_len(bytes)?;
        Ok(())
    }

    /// Read the parity block at `i` into `buf` (exactly `block_size` bytes).
    pub fn read_block(&self, block_size: BlockSize, i: BlockIndex, buf: &mut [u8]) -> Result<()> {
        let len = block_size.as_usize();
        self.file
            .read_exact_at(&mut buf[..len], block_size.block_to_byte(i))?;
        let mut s = self.stats.lock();
        s.reads += 1;
        s.bytes_read += u64::from(block_size.get());
        Ok(())
    }

    /// Write the parity block at `i` from `buf` (exactly `block_size` bytes).
    pub fn write_block(&self, block_size: BlockSize, i: BlockIndex, buf: &[u8]) -> Result<()> {
        let len = block_size.as_usize();
        self.file
            .write_all_at(&buf[..len], block_size.block_to_byte(i))?;
        let mut s = self.stats.lock();
        s.writes += 1;
        s.bytes_written += u64::from(block_size.get());
        Ok(())
    }

    /// Flush the disk cache. Pending writes are not durable until this
    /// returns.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        self.stats.lock().syncs += 1;
        Ok(())
    }

    /// Flush and close.
    pub fn close(self) -> Result<()> {
        self.file.sync_all().map_err(|e| FraidError::Parity {
            level: self.level.name(),
            detail: format!("close failed: {e}"),
        })
    }

    #[must_use]
    pub fn stats(&self) -> ParityStats {
        self.stats.lock().clone()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn bs() -> BlockSize {
        BlockSize::new(4096).unwrap()
    }

    fn open(dir: &tempfile::TempDir, name: &str) -> ParityFile {
        ParityFile::create(ParityLevel::new(0).unwrap(), &dir.path().join(name)).unwrap()
    }

    #[test]
    fn create_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let parity = open(&dir, "parity");
        assert_eq!(parity.size().unwrap(), 0);
        assert_eq!(parity.block_count(bs()).unwrap(), 0);
    }

    #[test]
    fn chsize_extends_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let parity = open(&dir, "parity");

        parity.chsize(4096 * 8, false).unwrap();
        assert_eq!(parity.block_count(bs()).unwrap(), 8);

        parity.chsize(4096 * 3, false).unwrap();
        assert_eq!(parity.block_count(bs()).unwrap(), 3);
    }

    #[test]
    fn chsize_skip_fallocate_extends_sparse() {
        let dir = tempfile::tempdir().unwrap();
        let parity = open(&dir, "parity");
        parity.chsize(4096 * 4, true).unwrap();
        assert_eq!(parity.size().unwrap(), 4096 * 4);
    }

    #[test]
    fn block_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let parity = open(&dir, "parity");
        parity.chsize(4096 * 4, true).unwrap();

        let data = vec![0x5A_u8; 4096];
        parity.write_block(bs(), BlockIndex(2), &data).unwrap();
        parity.sync().unwrap();

        let mut back = vec![0_u8; 4096];
        parity.read_block(bs(), BlockIndex(2), &mut back).unwrap();
        assert_eq!(back, data);

        // Untouched block reads back as zeroes.
        parity.read_block(bs(), BlockIndex(1), &mut back).unwrap();
        assert!(back.iter().all(|&b| b == 0));
    }

    #[test]
    fn read_past_end_fails() {
        let dir = tempfile::tempdir().unwrap();
        let parity = open(&dir, "parity");
        parity.chsize(4096, true).unwrap();

        let mut buf = vec![0_u8; 4096];
        assert!(parity.read_block(bs(), BlockIndex(5), &mut buf).is_err());
    }

    #[test]
    fn stats_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let parity = open(&dir, "parity");
        parity.chsize(4096 * 2, true).unwrap();

        let buf = vec![1_u8; 4096];
        parity.write_block(bs(), BlockIndex(0), &buf).unwrap();
        parity.write_block(bs(), BlockIndex(1), &buf).unwrap();
        let mut back = vec![0_u8; 4096];
        parity.read_block(bs(), BlockIndex(0), &mut back).unwrap();
        parity.sync().unwrap();

        let stats = parity.stats();
        assert_eq!(stats.writes, 2);
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.syncs, 1);
        assert_eq!(stats.bytes_written, 8192);
    }

    #[test]
    fn reopen_preserves_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parity");
        {
            let parity = ParityFile::create(ParityLevel::new(0).unwrap(), &path).unwrap();
            parity.chsize(4096, true).unwrap();
            parity.write_block(bs(), BlockIndex(0), &[7_u8; 4096]).unwrap();
            parity.close().unwrap();
        }
        let parity = ParityFile::create(ParityLevel::new(0).unwrap(), &path).unwrap();
        assert_eq!(parity.block_count(bs()).unwrap(), 1);
        let mut back = vec![0_u8; 4096];
        parity.read_block(bs(), BlockIndex(0), &mut back).unwrap();
        assert_eq!(back, [7_u8; 4096]);
    }
}
