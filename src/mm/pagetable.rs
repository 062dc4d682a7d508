//! Per-address-space page tables.

use crate::segment::Perm;

use alloc::vec;
use alloc::vec::Vec;

use shared::memory::{PhysAddress, VirtAddress, PAGE_SIZE};

/// Where a user page currently lives.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PageState {
    /// Never faulted in.
    Empty,
    /// Resident in the physical frame at this address.
    Resident(PhysAddress),
    /// Parked in the swap file at this byte offset.
    Swapped(u32),
}

#[derive(Clone, Copy, Debug)]
pub struct PtEntry {
    pub state: PageState,
    pub perm: Perm,
}

/// A flat table over the two mapped ranges of an address space:
/// code and data low, the stack window high. The ranges are disjoint,
/// so a single array would waste an entry per page of the gap; lookup
/// instead dispatches by range.
///
/// Addresses outside both ranges are contract violations.
#[derive(Clone)]
pub struct PageTable {
    base1: VirtAddress,
    num1: u32,
    base2: VirtAddress,
    num2: u32,
    entries: Vec<PtEntry>,
}

impl PageTable {
    pub fn new(base1: VirtAddress, num1: u32, base2: VirtAddress, num2: u32) -> PageTable {
        assert!(num1 > 0);
        assert!(num2 > 0);
        assert!(base1.is_aligned_to(PAGE_SIZE.as_raw()));
        assert!(base2.is_aligned_to(PAGE_SIZE.as_raw()));
        // Range 1 must end at or below range 2.
        assert!(base1 + PAGE_SIZE * num1 <= base2);

        PageTable {
            base1,
            num1,
            base2,
            num2,
            entries: vec![
                PtEntry {
                    state: PageState::Empty,
                    perm: Perm::empty(),
                };
                (num1 + num2) as usize
            ],
        }
    }

    pub fn num_pages(&self) -> u32 {
        self.num1 + self.num2
    }

    fn index_of(&self, vaddr: VirtAddress) -> usize {
        let aligned = vaddr.align_down(PAGE_SIZE.as_raw());
        let index = if aligned >= self.base2 {
            let index = (aligned - self.base2).as_raw() / PAGE_SIZE.as_raw() + self.num1;
            assert!(
                index < self.num1 + self.num2,
                "{:?} past the stack range",
                vaddr
            );
            index
        } else {
            assert!(aligned >= self.base1, "{:?} below the mapped ranges", vaddr);
            let index = (aligned - self.base1).as_raw() / PAGE_SIZE.as_raw();
            assert!(index < self.num1, "{:?} between the mapped ranges", vaddr);
            index
        };
        index as usize
    }

    /// Snapshot of the entry covering `vaddr`.
    pub fn get(&self, vaddr: VirtAddress) -> PtEntry {
        self.entries[self.index_of(vaddr)]
    }

    /// Map `vaddr` to the frame at `paddr`. The entry must not already
    /// be resident.
    pub fn add(&mut self, vaddr: VirtAddress, paddr: PhysAddress, perm: Perm) {
        assert!(paddr.is_aligned_to(PAGE_SIZE.as_raw()));
        let idx = self.index_of(vaddr);
        let entry = &mut self.entries[idx];
        assert!(
            matches!(entry.state, PageState::Empty | PageState::Swapped(_)),
            "mapping over a resident page at {:?}",
            vaddr
        );
        entry.state = PageState::Resident(paddr);
        entry.perm = perm;
    }

    /// The same transition as [`add`](Self::add); reads as the inverse
    /// of [`swap_out`](Self::swap_out) at call sites.
    pub fn swap_in(&mut self, vaddr: VirtAddress, paddr: PhysAddress, perm: Perm) {
        self.add(vaddr, paddr, perm);
    }

    /// Record that the page at `vaddr` now lives in the swap file at
    /// `offset`. The entry must be resident; its permissions survive.
    pub fn swap_out(&mut self, vaddr: VirtAddress, offset: u32) {
        let idx = self.index_of(vaddr);
        let entry = &mut self.entries[idx];
        assert!(
            matches!(entry.state, PageState::Resident(_)),
            "swapping out a non-resident page at {:?}",
            vaddr
        );
        entry.state = PageState::Swapped(offset);
    }

    /// Every (page base, entry) pair, range 1 then range 2.
    pub fn iter(&self) -> impl Iterator<Item = (VirtAddress, &PtEntry)> {
        self.entries.iter().enumerate().map(move |(i, entry)| {
            let i = i as u32;
            let vaddr = if i < self.num1 {
                self.base1 + PAGE_SIZE * i
            } else {
                self.base2 + PAGE_SIZE * (i - self.num1)
            };
            (vaddr, entry)
        })
    }
}
