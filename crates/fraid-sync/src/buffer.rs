//! Preallocated block buffers for one sync run.
//!
//! Layout of the pool, all slots `block_size` bytes:
//!
//! ```text
//! [0, diskmax)                        data, one per disk slot
//! [diskmax, diskmax + level)          parity rows
//! [diskmax + level, 2·diskmax + level) scratch copies for recovery
//! 2·diskmax + level                    the zero block, never written after init
//! ```
//!
//! The data and parity ranges are exactly the slice the codec entry points
//! take; scratch slots preserve the as-read content of failed buffers so the
//! recovery path can restore everything that is not a BLK.

use fraid_types::BlockSize;

pub(crate) struct BufferPool {
    bufs: Vec<Vec<u8>>,
    diskmax: usize,
    level: usize,
    block_size: usize,
}

impl BufferPool {
    pub(crate) fn new(diskmax: usize, level: usize, block_size: BlockSize) -> Self {
        let block_size = block_size.as_usize();
        let count = 2 * diskmax + level + 1;
        Self {
            bufs: vec![vec![0_u8; block_size]; count],
            diskmax,
            level,
            block_size,
        }
    }

    /// Pattern write/read-back over every slot, catching bad RAM before any
    /// parity gets computed from it. Returns `false` on a mismatch.
    pub(crate) fn self_test(&mut self) -> bool {
        let zero = self.zero_index();
        for (slot, buf) in self.bufs.iter_mut().enumerate() {
            if slot == zero {
                continue;
            }
            for (pos, byte) in buf.iter_mut().enumerate() {
                #[expect(clippy::cast_possible_truncation)]
                {
                    *byte = ((slot * 89 + pos * 251) % 256) as u8;
                }
            }
            for (pos, byte) in buf.iter().enumerate() {
                #[expect(clippy::cast_possible_truncation)]
                let want = ((slot * 89 + pos * 251) % 256) as u8;
                if *byte != want {
                    return false;
                }
            }
            buf.fill(0);
        }
        self.bufs[zero].iter().all(|&b| b == 0)
    }

    fn zero_index(&self) -> usize {
        2 * self.diskmax + self.level
    }

    /// Blank the data slot `j` from the zero block.
    pub(crate) fn zero_data(&mut self, j: usize) {
        debug_assert!(j < self.diskmax);
        let zero = self.zero_index();
        let (head, tail) = self.bufs.split_at_mut(zero);
        head[j][..self.block_size].copy_from_slice(&tail[0][..self.block_size]);
    }

    pub(crate) fn data_mut(&mut self, j: usize) -> &mut [u8] {
        debug_assert!(j < self.diskmax);
        &mut self.bufs[j]
    }

    pub(crate) fn data(&self, j: usize) -> &[u8] {
        debug_assert!(j < self.diskmax);
        &self.bufs[j]
    }

    pub(crate) fn parity_mut(&mut self, l: usize) -> &mut [u8] {
        debug_assert!(l < self.level);
        &mut self.bufs[self.diskmax + l]
    }

    pub(crate) fn parity(&self, l: usize) -> &[u8] {
        debug_assert!(l < self.level);
        &self.bufs[self.diskmax + l]
    }

    /// Copy data slot `j` into its scratch slot.
    pub(crate) fn save_scratch(&mut self, j: usize) {
        debug_assert!(j < self.diskmax);
        let (data, rest) = self.bufs.split_at_mut(self.diskmax);
        rest[self.level + j][..self.block_size].copy_from_slice(&data[j][..self.block_size]);
    }

    /// Restore data slot `j` from its scratch slot.
    pub(crate) fn restore_scratch(&mut self, j: usize) {
        debug_assert!(j < self.diskmax);
        let (data, rest) = self.bufs.split_at_mut(self.diskmax);
        data[j][..self.block_size].copy_from_slice(&rest[self.level + j][..self.block_size]);
    }

    /// The codec view: data buffers followed by parity buffers.
    pub(crate) fn codec_slice(&mut self) -> &mut [Vec<u8>] {
        &mut self.bufs[..self.diskmax + self.level]
    }
}
