//! The software-managed TLB and its replacement policy.

use crate::mm::stats::{Stat, VmStats};
use crate::segment::Perm;

use shared::memory::{PhysAddress, VirtAddress, PAGE_SIZE};

/// Number of entries in the hardware TLB.
pub const NUM_TLB: usize = 64;

const TLBHI_VPAGE: u32 = 0xffff_f000;
const TLBLO_PPAGE: u32 = 0xffff_f000;
const TLBLO_DIRTY: u32 = 0x0000_0400;
const TLBLO_VALID: u32 = 0x0000_0200;

/// The parked entryhi for an invalid slot: a distinct kernel-segment
/// page per slot, so no two slots ever match the same probe and no
/// user address matches a parked slot.
const fn invalid_hi(slot: usize) -> u32 {
    0x8000_0000 + (slot as u32) * PAGE_SIZE.as_raw()
}

/// One CPU's TLB: 64 (entryhi, entrylo) pairs. Exclusive access
/// (`&mut`) stands in for running with interrupts disabled on the
/// owning CPU; nothing here takes another lock.
pub struct Tlb {
    slots: [(u32, u32); NUM_TLB],
    /// Round-robin victim cursor, advanced on each replacement.
    next_victim: usize,
}

impl Tlb {
    pub fn new() -> Tlb {
        let mut slots = [(0, 0); NUM_TLB];
        for (i, slot) in slots.iter_mut().enumerate() {
            *slot = (invalid_hi(i), 0);
        }
        Tlb {
            slots,
            next_victim: 0,
        }
    }

    /// Index of the slot whose page number matches `entryhi`, if any.
    pub fn probe(&self, entryhi: u32) -> Option<usize> {
        let vpage = entryhi & TLBHI_VPAGE;
        self.slots
            .iter()
            .position(|&(hi, _)| (hi & TLBHI_VPAGE) == vpage)
    }

    pub fn read(&self, slot: usize) -> (u32, u32) {
        self.slots[slot]
    }

    fn write(&mut self, slot: usize, entryhi: u32, entrylo: u32) {
        self.slots[slot] = (entryhi, entrylo);
    }

    fn rr_victim(&mut self) -> usize {
        let victim = self.next_victim;
        self.next_victim = (victim + 1) % NUM_TLB;
        victim
    }

    /// Install the translation `vaddr -> paddr`. Victim selection: a
    /// slot already holding this page, else any invalid slot, else
    /// round robin. The dirty bit is granted iff `perm` allows writes.
    pub fn load(&mut self, vaddr: VirtAddress, paddr: PhysAddress, perm: Perm, stats: &VmStats) {
        assert!(vaddr.is_aligned_to(PAGE_SIZE.as_raw()));
        assert!(paddr.is_aligned_to(PAGE_SIZE.as_raw()));

        let entryhi = vaddr.as_raw() & TLBHI_VPAGE;
        let victim = match self.probe(entryhi) {
            // Refreshing a stale entry displaces no other mapping.
            Some(slot) => {
                stats.increment(Stat::TlbFaultsWithFree);
                slot
            }
            None => {
                match self
                    .slots
                    .iter()
                    .position(|&(_, lo)| (lo & TLBLO_VALID) == 0)
                {
                    Some(slot) => {
                        stats.increment(Stat::TlbFaultsWithFree);
                        slot
                    }
                    None => {
                        stats.increment(Stat::TlbFaultsWithReplace);
                        self.rr_victim()
                    }
                }
            }
        };

        let mut entrylo = (paddr.as_raw() & TLBLO_PPAGE) | TLBLO_VALID;
        if perm.contains(Perm::W) {
            entrylo |= TLBLO_DIRTY;
        }
        self.write(victim, entryhi, entrylo);
    }

    /// Drop every entry. Called on address-space switch.
    pub fn invalidate_all(&mut self, stats: &VmStats) {
        for slot in 0..NUM_TLB {
            self.write(slot, invalid_hi(slot), 0);
        }
        stats.increment(Stat::TlbInvalidations);
    }

    /// Drop the entry for `vaddr`, if present.
    pub fn invalidate_entry(&mut self, vaddr: VirtAddress) {
        if let Some(slot) = self.probe(vaddr.as_raw() & TLBHI_VPAGE) {
            self.write(slot, invalid_hi(slot), 0);
        }
    }

    /// Translate `vaddr` as the MMU would: the mapped frame and
    /// whether the dirty bit grants writes.
    pub fn translate(&self, vaddr: VirtAddress) -> Option<(PhysAddress, bool)> {
        let slot = self.probe(vaddr.as_raw() & TLBHI_VPAGE)?;
        let (_, lo) = self.slots[slot];
        if (lo & TLBLO_VALID) == 0 {
            return None;
        }
        Some((
            PhysAddress::from_raw(lo & TLBLO_PPAGE),
            (lo & TLBLO_DIRTY) != 0,
        ))
    }
}

impl Default for Tlb {
    fn default() -> Tlb {
        Tlb::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(n: u32) -> VirtAddress {
        VirtAddress::from_raw(n * PAGE_SIZE.as_raw())
    }

    fn frame(n: u32) -> PhysAddress {
        PhysAddress::from_raw(n * PAGE_SIZE.as_raw())
    }

    #[test]
    fn load_fills_free_slots() {
        let stats = VmStats::new();
        let mut tlb = Tlb::new();

        tlb.load(page(1), frame(7), Perm::R, &stats);
        tlb.load(page(2), frame(8), Perm::R | Perm::W, &stats);

        assert_eq!(tlb.translate(page(1)), Some((frame(7), false)));
        assert_eq!(tlb.translate(page(2)), Some((frame(8), true)));
        assert_eq!(tlb.translate(page(3)), None);
        assert_eq!(stats.get(Stat::TlbFaultsWithFree), 2);
        assert_eq!(stats.get(Stat::TlbFaultsWithReplace), 0);
    }

    #[test]
    fn reload_refreshes_in_place() {
        let stats = VmStats::new();
        let mut tlb = Tlb::new();

        tlb.load(page(1), frame(7), Perm::R, &stats);
        let slot = tlb.probe(page(1).as_raw()).unwrap();

        tlb.load(page(1), frame(9), Perm::R | Perm::W, &stats);
        assert_eq!(tlb.probe(page(1).as_raw()), Some(slot));
        assert_eq!(tlb.translate(page(1)), Some((frame(9), true)));
        assert_eq!(stats.get(Stat::TlbFaultsWithFree), 2);
    }

    #[test]
    fn full_tlb_replaces_round_robin() {
        let stats = VmStats::new();
        let mut tlb = Tlb::new();

        for i in 0..NUM_TLB as u32 {
            tlb.load(page(1 + i), frame(i), Perm::R, &stats);
        }
        assert_eq!(stats.get(Stat::TlbFaultsWithFree), NUM_TLB as u32);

        // Slot 0 is the first round-robin victim.
        tlb.load(page(100), frame(99), Perm::R, &stats);
        assert_eq!(stats.get(Stat::TlbFaultsWithReplace), 1);
        assert_eq!(tlb.translate(page(1)), None);
        assert_eq!(tlb.translate(page(100)), Some((frame(99), false)));

        tlb.load(page(101), frame(98), Perm::R, &stats);
        assert_eq!(tlb.translate(page(2)), None);
        assert_eq!(stats.get(Stat::TlbFaultsWithReplace), 2);
    }

    #[test]
    fn invalidate_all_empties_every_slot() {
        let stats = VmStats::new();
        let mut tlb = Tlb::new();

        for i in 0..8 {
            tlb.load(page(1 + i), frame(i), Perm::R, &stats);
        }
        tlb.invalidate_all(&stats);

        for i in 0..8 {
            assert_eq!(tlb.translate(page(1 + i)), None);
        }
        assert_eq!(stats.get(Stat::TlbInvalidations), 1);
    }

    #[test]
    fn invalidate_entry_is_targeted() {
        let stats = VmStats::new();
        let mut tlb = Tlb::new();

        tlb.load(page(1), frame(1), Perm::R, &stats);
        tlb.load(page(2), frame(2), Perm::R, &stats);

        tlb.invalidate_entry(page(1));
        assert_eq!(tlb.translate(page(1)), None);
        assert_eq!(tlb.translate(page(2)), Some((frame(2), false)));
        // Invalidating an absent entry is a no-op.
        tlb.invalidate_entry(page(5));
    }
}
