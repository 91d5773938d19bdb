//! Cooperative progress reporting and cancellation.
//!
//! The engine is single-threaded; the only suspension point it exposes is
//! the progress callback, which may request early termination by returning
//! `true` from [`Progress::tick`]. The current block is always either fully
//! committed or left untouched before the engine honours the request.

use fraid_types::BlockIndex;

/// Progress sink for one pass.
pub trait Progress {
    /// Called once before the pass starts. Returning `false` skips the pass
    /// entirely (it still runs its terminal flush).
    fn begin(&mut self, blockstart: BlockIndex, blockmax: BlockIndex, countmax: u32) -> bool;

    /// Called after each processed block. Returning `true` requests a
    /// cooperative abort.
    fn tick(&mut self, i: BlockIndex, countpos: u32, countmax: u32, countsize: u64) -> bool;

    /// Pause reporting (an autosave is about to block).
    fn stop(&mut self) {}

    /// Resume after [`Progress::stop`].
    fn restart(&mut self) {}

    /// Called when the pass finishes normally.
    fn end(&mut self, _countpos: u32, _countmax: u32, _countsize: u64) {}
}

/// Progress sink that reports nothing and never aborts.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentProgress;

impl Progress for SilentProgress {
    fn begin(&mut self, _blockstart: BlockIndex, _blockmax: BlockIndex, _countmax: u32) -> bool {
        true
    }

    fn tick(&mut self, _i: BlockIndex, _countpos: u32, _countmax: u32, _countsize: u64) -> bool {
        false
    }
}
