//! Human-readable byte formatting and the periodic status reporter.
//!
//! spec.md names both of these as external collaborators with a named
//! interface only; kept minimal on purpose — this is not the place for a
//! full unit-formatting library.

use std::{thread, time::Duration};

use tracing::info;

use crate::blockdevice::Counters;

/// Formats a byte count as a human-readable string using metric (1000-based)
/// or binary (1024-based) units, matching `original_source`'s `HumanBytes`.
pub fn human_bytes(bytes: u64, metric: bool) -> String {
    let (base, units): (f64, &[&str]) = if metric {
        (1000.0, &["B", "kB", "MB", "GB", "TB"])
    } else {
        (1024.0, &["B", "KiB", "MiB", "GiB", "TiB"])
    };

    let mut value = bytes as f64;
    let mut unit = units[0];
    for &candidate in &units[1..] {
        if value < base {
            break;
        }
        value /= base;
        unit = candidate;
    }

    if unit == units[0] {
        format!("{bytes} {unit}")
    } else {
        format!("{value:.2} {unit}")
    }
}

/// Spawns a daemon thread that logs cumulative read/written bytes every
/// `interval`. Takes cloned `Counters` rather than the block device itself
/// so it never contends with the single-threaded server loop.
pub fn spawn_reporter(counters: Counters, interval: Duration) -> thread::JoinHandle<()> {
    thread::spawn(move || loop {
        let (read, written) = counters.snapshot();
        info!(
            read = %human_bytes(read, true),
            written = %human_bytes(written, true),
            "block device status"
        );
        thread::sleep(interval);
    })
}
