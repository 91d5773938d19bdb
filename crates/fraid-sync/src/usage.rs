//! Wall-time accounting across the sync loop.
//!
//! Time between two marks is attributed to whatever the engine was doing
//! when the second mark lands: hashing and codec work is `cpu`, data-disk
//! reads are `disk`, parity I/O is `parity`, and everything outside the
//! measured loop is `waste`.

use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug)]
pub(crate) struct UsageTimer {
    last: Instant,
    cpu: Duration,
    disk: Duration,
    parity: Duration,
    waste: Duration,
}

impl UsageTimer {
    pub(crate) fn start() -> Self {
        Self {
            last: Instant::now(),
            cpu: Duration::ZERO,
            disk: Duration::ZERO,
            parity: Duration::ZERO,
            waste: Duration::ZERO,
        }
    }

    fn lap(&mut self) -> Duration {
        let now = Instant::now();
        let lap = now - self.last;
        self.last = now;
        lap
    }

    pub(crate) fn cpu(&mut self) {
        let lap = self.lap();
        self.cpu += lap;
    }

    pub(crate) fn disk(&mut self) {
        let lap = self.lap();
        self.disk += lap;
    }

    pub(crate) fn parity(&mut self) {
        let lap = self.lap();
        self.parity += lap;
    }

    pub(crate) fn waste(&mut self) {
        let lap = self.lap();
        self.waste += lap;
    }

    pub(crate) fn print(&self) {
        debug!(
            cpu_s = self.cpu.as_secs_f64(),
            disk_s = self.disk.as_secs_f64(),
            parity_s = self.parity.as_secs_f64(),
            waste_s = self.waste.as_secs_f64(),
            "time split"
        );
    }
}
