//! Process self-introspection for the coordinator's health self-report.
//!
//! Reads `/proc` on Linux; other targets report zeros.

use parking_lot::Mutex;
use std::time::Instant;

/// Resident set size of this process in bytes
#[must_use]
pub fn rss_bytes() -> u64 {
    #[cfg(target_os = "linux")]
    {
        // /proc/self/statm: size resident shared text lib data dt (pages)
        if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
            if let Some(resident) = statm.split_whitespace().nth(1) {
                if let Ok(pages) = resident.parse::<u64>() {
                    return pages * page_size();
                }
            }
        }
        0
    }
    #[cfg(not(target_os = "linux"))]
    {
        0
    }
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    // Kernel default on every supported deployment target
    4096
}

/// CPU usage sampler based on `/proc/self/stat` utime+stime deltas.
///
/// Each call returns the percentage of one core used since the previous
/// call; the first call returns 0.
#[derive(Default)]
pub struct CpuSampler {
    last: Mutex<Option<(Instant, u64)>>,
}

impl CpuSampler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample_percent(&self) -> f64 {
        let Some(ticks) = process_cpu_ticks() else {
            return 0.0;
        };
        let now = Instant::now();

        let mut last = self.last.lock();
        let previous = last.replace((now, ticks));
        let Some((prev_at, prev_ticks)) = previous else {
            return 0.0;
        };

        let elapsed = now.duration_since(prev_at).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }

        let tick_delta = ticks.saturating_sub(prev_ticks) as f64;
        let cpu_seconds = tick_delta / clock_ticks_per_second();
        (cpu_seconds / elapsed * 100.0).max(0.0)
    }
}

#[cfg(target_os = "linux")]
fn process_cpu_ticks() -> Option<u64> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    // Field 2 (comm) may contain spaces; skip past the closing paren
    let rest = stat.rsplit_once(')')?.1;
    let mut fields = rest.split_whitespace();
    // After comm: state is field 3, utime is field 14, stime field 15
    let utime: u64 = fields.nth(11)?.parse().ok()?;
    let stime: u64 = fields.next()?.parse().ok()?;
    Some(utime + stime)
}

#[cfg(not(target_os = "linux"))]
fn process_cpu_ticks() -> Option<u64> {
    None
}

fn clock_ticks_per_second() -> f64 {
    // USER_HZ is 100 on all supported kernels
    100.0
}
