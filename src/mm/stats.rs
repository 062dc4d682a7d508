//! VM event counters.

use log::{info, warn};
use spin::Mutex;

/// The tracked events. Discriminants index the counter array.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stat {
    TlbFaults,
    TlbFaultsWithFree,
    TlbFaultsWithReplace,
    TlbInvalidations,
    TlbReloads,
    PageFaultsZeroed,
    PageFaultsDisk,
    PageFaultsElf,
    PageFaultsSwapfile,
    SwapfileWrites,
}

pub const NUM_STATS: usize = 10;

const NAMES: [&str; NUM_STATS] = [
    "TLB Faults",
    "TLB Faults with Free",
    "TLB Faults with Replace",
    "TLB Invalidations",
    "TLB Reloads",
    "Page Faults (Zeroed)",
    "Page Faults (Disk)",
    "Page Faults from ELF",
    "Page Faults from Swapfile",
    "Swapfile Writes",
];

/// Monotone counters for the whole VM. Low-frequency; one mutex is
/// plenty.
pub struct VmStats {
    counts: Mutex<[u32; NUM_STATS]>,
}

impl VmStats {
    pub const fn new() -> VmStats {
        VmStats {
            counts: Mutex::new([0; NUM_STATS]),
        }
    }

    pub fn increment(&self, stat: Stat) {
        self.counts.lock()[stat as usize] += 1;
    }

    pub fn get(&self, stat: Stat) -> u32 {
        self.counts.lock()[stat as usize]
    }

    /// Log the counter table, then check the identities that must hold
    /// once the VM is quiesced. A mismatch is logged as a warning, not
    /// a panic. Returns whether every identity held.
    pub fn report(&self) -> bool {
        let counts = *self.counts.lock();

        info!("virtual memory statistics:");
        for (name, value) in NAMES.iter().zip(counts.iter()) {
            info!("  {name}: {value}");
        }

        let mut ok = true;

        let faults = counts[Stat::TlbFaults as usize];
        let free_plus_replace = counts[Stat::TlbFaultsWithFree as usize]
            + counts[Stat::TlbFaultsWithReplace as usize];
        if faults != free_plus_replace {
            warn!("TLB faults ({faults}) != with free + with replace ({free_plus_replace})");
            ok = false;
        }

        let reload_plus_paged = counts[Stat::TlbReloads as usize]
            + counts[Stat::PageFaultsDisk as usize]
            + counts[Stat::PageFaultsZeroed as usize];
        if faults != reload_plus_paged {
            warn!("TLB faults ({faults}) != reloads + disk + zeroed ({reload_plus_paged})");
            ok = false;
        }

        let disk = counts[Stat::PageFaultsDisk as usize];
        let elf_plus_swap =
            counts[Stat::PageFaultsElf as usize] + counts[Stat::PageFaultsSwapfile as usize];
        if disk != elf_plus_swap {
            warn!("disk page faults ({disk}) != ELF + swapfile reads ({elf_plus_swap})");
            ok = false;
        }

        ok
    }
}

impl Default for VmStats {
    fn default() -> VmStats {
        VmStats::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_accumulate() {
        let stats = VmStats::new();
        assert_eq!(stats.get(Stat::TlbFaults), 0);

        stats.increment(Stat::TlbFaults);
        stats.increment(Stat::TlbFaults);
        stats.increment(Stat::SwapfileWrites);
        assert_eq!(stats.get(Stat::TlbFaults), 2);
        assert_eq!(stats.get(Stat::SwapfileWrites), 1);
        assert_eq!(stats.get(Stat::TlbReloads), 0);
    }

    #[test]
    fn report_flags_inconsistency() {
        let stats = VmStats::new();
        assert!(stats.report());

        // A fault with no matching free/replace or reload entry.
        stats.increment(Stat::TlbFaults);
        assert!(!stats.report());

        stats.increment(Stat::TlbFaultsWithFree);
        stats.increment(Stat::TlbReloads);
        assert!(stats.report());
    }
}
