//! Per-index parity metadata.
//!
//! Each logical index carries one packed word: the wall-clock second its
//! parity was last written, a `bad` flag (the index saw a silent or I/O
//! error and a later `fix` must re-examine it), and a `rehash` flag (hashes
//! at this index still use the previous algorithm/seed pair). The all-zero
//! word means the index was never synced.

use fraid_types::BlockIndex;

/// Packed `(timestamp << 2 | rehash << 1 | bad)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfoWord(pub u64);

impl InfoWord {
    pub const NONE: Self = Self(0);

    #[must_use]
    pub fn make(timestamp: u64, bad: bool, rehash: bool) -> Self {
        Self((timestamp << 2) | (u64::from(rehash) << 1) | u64::from(bad))
    }

    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn timestamp(self) -> u64 {
        self.0 >> 2
    }

    #[must_use]
    pub fn is_bad(self) -> bool {
        self.0 & 1 != 0
    }

    #[must_use]
    pub fn is_rehash(self) -> bool {
        self.0 & 2 != 0
    }

    /// Same word with the bad flag set, every other field preserved.
    #[must_use]
    pub fn with_bad(self) -> Self {
        Self(self.0 | 1)
    }
}

/// Dense info array indexed by [`BlockIndex`].
#[derive(Debug, Clone, Default)]
pub struct InfoArray {
    words: Vec<InfoWord>,
}

impl InfoArray {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Word at `i`; positions past the end are `NONE`.
    #[must_use]
    pub fn get(&self, i: BlockIndex) -> InfoWord {
        self.words
            .get(i.0 as usize)
            .copied()
            .unwrap_or(InfoWord::NONE)
    }

    pub fn set(&mut self, i: BlockIndex, word: InfoWord) {
        let idx = i.0 as usize;
        if idx >= self.words.len() {
            if word.is_none() {
                return;
            }
            self.words.resize(idx + 1, InfoWord::NONE);
        }
        self.words[idx] = word;
    }

    /// Highest index + 1 whose parity was ever written.
    #[must_use]
    pub fn used_size(&self) -> u32 {
        let used = self
            .words
            .iter()
            .rposition(|w| !w.is_none())
            .map_or(0, |p| p + 1);
        u32::try_from(used).unwrap_or(u32::MAX)
    }

    #[must_use]
    pub fn raw(&self) -> &[InfoWord] {
        &self.words
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack() {
        let w = InfoWord::make(1_700_000_000, false, true);
        assert_eq!(w.timestamp(), 1_700_000_000);
        assert!(!w.is_bad());
        assert!(w.is_rehash());
        assert!(!w.is_none());
    }

    #[test]
    fn with_bad_preserves_fields() {
        let w = InfoWord::make(12345, false, true).with_bad();
        assert!(w.is_bad());
        assert!(w.is_rehash());
        assert_eq!(w.timestamp(), 12345);
    }

    #[test]
    fn array_defaults_and_used_size() {
        let mut arr = InfoArray::new();
        assert!(arr.get(BlockIndex(9)).is_none());
        assert_eq!(arr.used_size(), 0);

        arr.set(BlockIndex(4), InfoWord::make(10, false, false));
        assert_eq!(arr.used_size(), 5);
        assert!(arr.get(BlockIndex(3)).is_none());
        assert_eq!(arr.get(BlockIndex(4)).timestamp(), 10);
    }

    #[test]
    fn setting_none_past_end_does_not_grow() {
        let mut arr = InfoArray::new();
        arr.set(BlockIndex(100), InfoWord::NONE);
        assert_eq!(arr.used_size(), 0);
        assert!(arr.raw().is_empty());
    }
}
