//! Daemon configuration (§4.10, ambient).
//!
//! Bind address, page-cache sizing and worker count are given at the
//! algorithm level but still have to come from *somewhere*, so the daemon's
//! own CLI owns them. The Non-goal is argument parsing for the interactive
//! trace *viewer*, not "the daemon takes no flags at all."

use std::fs;

use hpctrace_core::paged_file::{round_page_size, MIN_MEMORY_BUDGET, RECOMMENDED_PAGE_SIZE};

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub page_size: u64,
    pub memory_budget: u64,
    pub worker_count: usize,
    pub compression: bool,
}

impl Config {
    pub fn page_size_rounded(&self) -> u64 {
        round_page_size(self.page_size)
    }
}

pub fn default_page_size() -> u64 {
    RECOMMENDED_PAGE_SIZE
}

/// Half of physical RAM, floored at [`MIN_MEMORY_BUDGET`] (§4.1), read from
/// `/proc/meminfo` the way the original's `LargeByteBuffer::getRamSize`
/// queries the OS. Falls back to the floor on hosts without `/proc`.
pub fn detect_memory_budget() -> u64 {
    let total_kib = fs::read_to_string("/proc/meminfo").ok().and_then(|contents| {
        contents.lines().find_map(|line| {
            let rest = line.strip_prefix("MemTotal:")?;
            rest.trim().split_whitespace().next()?.parse::<u64>().ok()
        })
    });

    match total_kib {
        Some(kib) => std::cmp::max(kib * 1024 / 2, MIN_MEMORY_BUDGET),
        None => MIN_MEMORY_BUDGET,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_budget_never_below_floor() {
        assert!(detect_memory_budget() >= MIN_MEMORY_BUDGET);
    }
}
