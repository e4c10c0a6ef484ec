//! Per-process CPU and memory sampling
//!
//! On Linux usage is read from `/proc/<pid>/stat` (CPU ticks) and
//! `/proc/<pid>/statm` (resident pages). CPU percent is derived from the
//! delta between two successive samples of the same pid; the first sample
//! of a pid reports 0. Other platforms report zeros.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

/// Usage snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessUsage {
    /// Percent of one core since the previous sample
    pub cpu: f64,
    /// Resident set size in bytes
    pub memory: u64,
}

#[derive(Debug, Clone, Copy)]
struct CpuSample {
    ticks: u64,
    at: Instant,
}

/// Remembers the previous CPU sample of every pid it has seen
#[derive(Debug, Default)]
pub struct UsageSampler {
    previous: Mutex<HashMap<u32, CpuSample>>,
}

impl UsageSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sample `pid`; unreadable processes report zeros
    pub fn sample(&self, pid: u32) -> ProcessUsage {
        let now = Instant::now();
        let memory = read_resident_bytes(pid).unwrap_or(0);
        let Some(ticks) = read_cpu_ticks(pid) else {
            self.forget(pid);
            return ProcessUsage { cpu: 0.0, memory };
        };

        let mut previous = self.previous.lock().unwrap_or_else(PoisonError::into_inner);
        let cpu = match previous.insert(pid, CpuSample { ticks, at: now }) {
            Some(last) => {
                let elapsed = now.duration_since(last.at).as_secs_f64();
                let used = ticks.saturating_sub(last.ticks) as f64 / clock_ticks_per_second();
                if elapsed > 0.0 {
                    (used / elapsed * 100.0).max(0.0)
                } else {
                    0.0
                }
            }
            None => 0.0,
        };

        ProcessUsage { cpu, memory }
    }

    /// Drop the stored sample of an exited process
    pub fn forget(&self, pid: u32) {
        self.previous
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pid);
    }
}

#[cfg(target_os = "linux")]
fn read_cpu_ticks(pid: u32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    parse_cpu_ticks(&stat)
}

#[cfg(not(target_os = "linux"))]
fn read_cpu_ticks(_pid: u32) -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
fn read_resident_bytes(pid: u32) -> Option<u64> {
    let statm = std::fs::read_to_string(format!("/proc/{}/statm", pid)).ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * page_size())
}

#[cfg(not(target_os = "linux"))]
fn read_resident_bytes(_pid: u32) -> Option<u64> {
    None
}

/// utime + stime from a `/proc/<pid>/stat` line.
///
/// The command name (field 2) may contain spaces and parentheses, so fields
/// are counted from the last `)`.
fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // rest starts at field 3 (state); utime is field 14, stime field 15
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

#[cfg(target_os = "linux")]
fn clock_ticks_per_second() -> f64 {
    // SAFETY: sysconf has no preconditions
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as f64
    } else {
        100.0
    }
}

#[cfg(not(target_os = "linux"))]
fn clock_ticks_per_second() -> f64 {
    100.0
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}
