// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Progress reporting, cancellation, and usage telemetry for
//! the parity passes.
//!
//! Time is attributed to whichever resource the loop was just
//! waiting on: the caller marks a boundary (`cpu`, `disk`,
//! `parity`) and the elapsed time since the previous boundary
//! lands in that bucket.  `waste` drops the interval instead,
//! which is used to exclude setup time from the summary.

use std::io::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::disk::BlockPos;
use crate::raid::LEV_MAX;

static CANCEL: AtomicBool = AtomicBool::new(false);

/// Requests a clean stop at the next position boundary.
pub fn request_cancel() {
    CANCEL.store(true, Ordering::SeqCst);
}

pub fn cancelled() -> bool {
    CANCEL.load(Ordering::SeqCst)
}

extern "C" fn on_sigint(_sig: libc::c_int) {
    // Only the atomic store; anything more is not signal safe.
    CANCEL.store(true, Ordering::SeqCst);
}

/// Routes SIGINT to the cancellation latch.
pub fn install_sigint() {
    let handler = on_sigint as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }
}

/// Terminal progress for one pass.
pub struct Progress {
    countmax: u64,
    start: Instant,
    last_print: Instant,
}

impl Progress {
    pub fn begin(blockstart: BlockPos, blockmax: BlockPos, countmax: u64) -> Progress {
        tracing::debug!("pass over blocks {blockstart}..{blockmax}, {countmax} to process");
        let now = Instant::now();
        Progress { countmax, start: now, last_print: now }
    }

    /// Advances the progress display.  Returns true when the
    /// pass should stop.
    pub fn step(&mut self, pos: BlockPos, countpos: u64, countsize: u64) -> bool {
        if self.last_print.elapsed() >= Duration::from_secs(1) {
            self.last_print = Instant::now();
            let percent = if self.countmax != 0 {
                countpos * 100 / self.countmax
            } else {
                100
            };
            let speed = countsize / 1024 / 1024
                / self.start.elapsed().as_secs().max(1);
            print!("{percent:>3}%, block {pos}, {speed} MiB/s\r");
            let _ = std::io::stdout().flush();
        }
        cancelled()
    }

    pub fn end(&self, countpos: u64, countsize: u64) {
        let elapsed = self.start.elapsed();
        println!(
            "{countpos} blocks, {} MiB in {}s",
            countsize / 1024 / 1024,
            elapsed.as_secs()
        );
    }
}

/// Per-resource time accounting.
pub struct Usage {
    last: Instant,
    cpu: Duration,
    disk: Vec<(String, Duration)>,
    parity: [Duration; LEV_MAX],
}

impl Usage {
    pub fn new(disk_names: Vec<String>) -> Usage {
        Usage {
            last: Instant::now(),
            cpu: Duration::ZERO,
            disk: disk_names.into_iter().map(|n| (n, Duration::ZERO)).collect(),
            parity: [Duration::ZERO; LEV_MAX],
        }
    }

    fn take(&mut self) -> Duration {
        let now = Instant::now();
        let spent = now - self.last;
        self.last = now;
        spent
    }

    /// Drops the time since the last boundary.
    pub fn waste(&mut self) {
        self.last = Instant::now();
    }

    pub fn cpu(&mut self) {
        let spent = self.take();
        self.cpu += spent;
    }

    pub fn disk(&mut self, index: usize) {
        let spent = self.take();
        self.disk[index].1 += spent;
    }

    pub fn parity(&mut self, level: usize) {
        let spent = self.take();
        self.parity[level] += spent;
    }

    /// Prints the share of wall time spent per resource.
    pub fn print(&self, levels: usize) {
        let total = self.cpu
            + self.disk.iter().map(|d| d.1).sum::<Duration>()
            + self.parity.iter().take(levels).sum::<Duration>();
        let total = total.max(Duration::from_millis(1));
        let share = |d: Duration| d.as_secs_f64() * 100.0 / total.as_secs_f64();
        let mut line = format!("time: cpu {:.0}%", share(self.cpu));
        for (name, spent) in &self.disk {
            line.push_str(&format!(", {} {:.0}%", name, share(*spent)));
        }
        for (level, spent) in self.parity.iter().take(levels).enumerate() {
            line.push_str(&format!(
                ", {} {:.0}%",
                crate::parity::lev_name(level),
                share(*spent)
            ));
        }
        tracing::info!("{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_buckets_accumulate() {
        let mut usage = Usage::new(vec!["d0".to_string()]);
        usage.waste();
        usage.cpu();
        usage.disk(0);
        usage.parity(0);
        assert!(usage.cpu <= usage.last.elapsed() + Duration::from_secs(1));
        usage.print(1);
    }
}
