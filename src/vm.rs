//! VM bootstrap and shutdown, the TLB-miss fault handler, and
//! address-space teardown.

use crate::addrspace::AddressSpace;
use crate::errno::Errno;
use crate::mm::coremap::CoreMap;
use crate::mm::pagetable::PageState;
use crate::mm::stats::{Stat, VmStats};
use crate::mm::swap::SwapStore;
use crate::mm::tlb::Tlb;
use crate::param::SWAP_SIZE;
use crate::ram::Ram;
use crate::vfs::Vnode;

use alloc::sync::Arc;

use log::info;
use shared::memory::{Frame, Length, Page, PhysAddress, VirtAddress, PAGE_SIZE};
use spin::Mutex;

/// Kind of TLB miss delivered by the trap handler.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FaultKind {
    Read,
    Write,
    /// A write through a TLB entry with the dirty bit clear. The text
    /// segment is never writable in this design, so this is always a
    /// policy violation.
    ReadOnly,
}

impl FaultKind {
    /// Decode the trap handler's fault code. `None` is an unknown code
    /// and surfaces as [`Errno::Inval`] at the boundary.
    pub fn from_code(code: u32) -> Option<FaultKind> {
        match code {
            0 => Some(FaultKind::Read),
            1 => Some(FaultKind::Write),
            2 => Some(FaultKind::ReadOnly),
            _ => None,
        }
    }
}

pub struct VmOptions {
    pub ram_size: Length,
    pub swap_size: Length,
}

impl Default for VmOptions {
    fn default() -> VmOptions {
        VmOptions {
            ram_size: Length::from_raw(4 * 1024 * 1024),
            swap_size: SWAP_SIZE,
        }
    }
}

/// The VM subsystem: every singleton the fault path touches.
pub struct Vm {
    ram: Ram,
    coremap: CoreMap,
    swap: SwapStore,
    stats: VmStats,
    /// Exclusive TLB access stands in for interrupts-off on the one
    /// CPU; nothing else is ever acquired under it.
    tlb: Mutex<Tlb>,
}

impl Vm {
    /// Bring up the core-map, swap store, and counters. `swapfile` is
    /// the already-opened backing file; its prior contents are
    /// meaningless.
    pub fn bootstrap(opts: VmOptions, swapfile: Arc<dyn Vnode>) -> Vm {
        let ram = Ram::new(opts.ram_size);
        let coremap = CoreMap::new(ram.nframes());
        let swap = SwapStore::new(swapfile, opts.swap_size);
        info!(
            "vm: {} frames of ram, {} swap slots",
            ram.nframes(),
            swap.slots()
        );
        Vm {
            ram,
            coremap,
            swap,
            stats: VmStats::new(),
            tlb: Mutex::new(Tlb::new()),
        }
    }

    /// Report the statistics (with consistency checks) and tear down.
    pub fn shutdown(self) {
        self.stats.report();
    }

    pub fn stats(&self) -> &VmStats {
        &self.stats
    }

    pub fn ram(&self) -> &Ram {
        &self.ram
    }

    pub fn coremap(&self) -> &CoreMap {
        &self.coremap
    }

    pub fn swap(&self) -> &SwapStore {
        &self.swap
    }

    /// Called on a context switch to a new address space. Without
    /// address-space tags in the TLB, every entry must go.
    pub fn activate(&self) {
        self.tlb.lock().invalidate_all(&self.stats);
    }

    /// Current hardware translation of `vaddr`, as the MMU would see
    /// it.
    pub fn translate(&self, vaddr: VirtAddress) -> Option<(PhysAddress, bool)> {
        self.tlb.lock().translate(vaddr)
    }

    /// Handle a TLB miss on `fault_vaddr`.
    ///
    /// Decides among four outcomes: zero-fill a fresh stack page, load
    /// a page of the executable, pull an evicted page back from swap,
    /// or just reload the TLB for a page that never left. All paths
    /// finish by installing the translation.
    ///
    /// # Panics
    ///
    /// A `ReadOnly` fault is a policy violation and panics, as do swap
    /// or ELF I/O failures underneath.
    pub fn fault(
        &self,
        space: Option<&Arc<AddressSpace>>,
        kind: FaultKind,
        fault_vaddr: VirtAddress,
    ) -> Result<(), Errno> {
        match kind {
            FaultKind::ReadOnly => {
                panic!("attempt to modify a read-only page at {fault_vaddr:?}")
            }
            FaultKind::Read | FaultKind::Write => {}
        }
        let space = space.ok_or(Errno::Fault)?;
        let vaddr = Page::containing(fault_vaddr).start();

        let segment = space.find_segment(fault_vaddr).ok_or(Errno::Fault)?;
        let entry = space.with_pt(|pt| pt.get(vaddr));

        let (paddr, perm) = match entry.state {
            PageState::Empty => {
                // First touch. Take a frame (possibly evicting someone
                // else's page), fill it, then publish the mapping.
                let grab = self.alloc_user_frame(space, vaddr);
                let frame = Frame::new(grab.paddr);
                if segment.is_stack() {
                    space.with_pt(|pt| {
                        // Safety: the frame is ours until `add`.
                        unsafe { self.ram.frame_mut(frame) }.fill(0);
                        pt.add(vaddr, grab.paddr, segment.perm());
                    });
                    self.stats.increment(Stat::PageFaultsZeroed);
                } else {
                    space.with_pt(|pt| {
                        segment.load_page(space.vnode().as_ref(), vaddr, &self.ram, frame);
                        pt.add(vaddr, grab.paddr, segment.perm());
                    });
                    self.stats.increment(Stat::PageFaultsElf);
                    self.stats.increment(Stat::PageFaultsDisk);
                }
                (grab.paddr, segment.perm())
            }
            PageState::Swapped(offset) => {
                let grab = self.alloc_user_frame(space, vaddr);
                let frame = Frame::new(grab.paddr);
                space.with_pt(|pt| {
                    self.swap.swap_in(&self.ram, frame, offset, &self.stats);
                    pt.swap_in(vaddr, grab.paddr, entry.perm);
                });
                self.stats.increment(Stat::PageFaultsDisk);
                (grab.paddr, entry.perm)
            }
            PageState::Resident(paddr) => {
                // The page never moved; the TLB just lost the entry.
                self.stats.increment(Stat::TlbReloads);
                (paddr, entry.perm)
            }
        };

        assert!(paddr.is_aligned_to(PAGE_SIZE.as_raw()));
        self.tlb.lock().load(vaddr, paddr, perm, &self.stats);
        self.stats.increment(Stat::TlbFaults);
        Ok(())
    }

    // Allocate through the core-map and drop the stale TLB entry when
    // the victim page belonged to the faulting space itself.
    fn alloc_user_frame(
        &self,
        space: &Arc<AddressSpace>,
        vaddr: VirtAddress,
    ) -> crate::mm::coremap::UserFrame {
        let grab = self
            .coremap
            .alloc_user(&self.ram, &self.swap, &self.stats, space, vaddr);
        if let Some(stale) = grab.evicted {
            self.tlb.lock().invalidate_entry(stale);
        }
        grab
    }

    /// Tear down `space`: hand every resident frame back to the
    /// core-map and every swapped-out slot back to the swap store.
    pub fn as_destroy(&self, space: Arc<AddressSpace>) {
        if let Some(pt) = space.take_pt() {
            for (_, entry) in pt.iter() {
                match entry.state {
                    PageState::Resident(paddr) => self.coremap.free_user(paddr),
                    PageState::Swapped(offset) => self.swap.free(offset),
                    PageState::Empty => {}
                }
            }
        }
        drop(space);
    }
}
