//! The core-map: per-frame state for all of physical memory, the FIFO
//! victim queue that drives eviction, and the contiguous-run allocator
//! for kernel requests.

use crate::addrspace::AddressSpace;
use crate::mm::stats::VmStats;
use crate::mm::swap::SwapStore;
use crate::ram::Ram;

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use shared::memory::{Frame, PhysAddress, VirtAddress, PAGE_SIZE};
use spin::Mutex;

/// What a physical frame is currently doing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FrameKind {
    /// Never handed out.
    Untracked,
    /// Previously allocated, now available for reuse.
    Freed,
    /// Part of a kernel allocation; never evicted.
    Kernel,
    /// Backing one user page; a member of the victim queue.
    User,
}

/// Non-owning back-reference from a user frame to the page table entry
/// it backs. The address space must release its frames before dying.
#[derive(Clone)]
struct BackRef {
    space: Weak<AddressSpace>,
    vaddr: VirtAddress,
}

struct Entry {
    kind: FrameKind,
    /// Frames in the allocation starting here; 0 except at the first
    /// frame of a run.
    alloc_size: u32,
    owner: Option<BackRef>,
    /// FIFO links: frame indices, `nframes` as the sentinel.
    prev: u32,
    next: u32,
}

/// FIFO endpoints. Head is the eviction victim, tail the most recent
/// allocation; both are the sentinel when no user frame exists.
struct Queue {
    head: u32,
    tail: u32,
}

/// A user-frame allocation.
pub struct UserFrame {
    pub paddr: PhysAddress,
    /// Set when the allocation evicted a page of the requesting
    /// address space; the caller must drop the stale TLB entry for it.
    pub evicted: Option<VirtAddress>,
}

pub struct CoreMap {
    /// Guards the entries, including their FIFO links. Acquired before
    /// `queue`, and never held across a swap-store or page-table call.
    entries: Mutex<Vec<Entry>>,
    /// Guards the FIFO endpoints.
    queue: Mutex<Queue>,
    nframes: u32,
}

impl CoreMap {
    pub fn new(nframes: u32) -> CoreMap {
        assert!(nframes > 0);
        let entries = (0..nframes)
            .map(|_| Entry {
                kind: FrameKind::Untracked,
                alloc_size: 0,
                owner: None,
                prev: nframes,
                next: nframes,
            })
            .collect();
        CoreMap {
            entries: Mutex::new(entries),
            queue: Mutex::new(Queue {
                head: nframes,
                tail: nframes,
            }),
            nframes,
        }
    }

    fn sentinel(&self) -> u32 {
        self.nframes
    }

    fn index_of(&self, paddr: PhysAddress) -> u32 {
        assert!(paddr.is_aligned_to(PAGE_SIZE.as_raw()));
        let index = paddr.as_raw() / PAGE_SIZE.as_raw();
        assert!(index < self.nframes);
        index
    }

    fn paddr_of(&self, index: u32) -> PhysAddress {
        PhysAddress::from_raw(index * PAGE_SIZE.as_raw())
    }

    /// `npages` contiguous frames for a kernel allocation: first-fit
    /// over previously freed runs, else fresh frames from `ram`.
    /// `None` when both are exhausted.
    pub fn alloc_kernel(&self, ram: &Ram, npages: u32) -> Option<PhysAddress> {
        assert!(npages > 0);

        if let Some(paddr) = self.take_freed_run(npages, FrameKind::Kernel, None) {
            return Some(paddr);
        }

        let paddr = ram.stealmem(npages)?;
        let first = self.index_of(paddr) as usize;
        let mut entries = self.entries.lock();
        for entry in &mut entries[first..first + npages as usize] {
            assert_eq!(entry.kind, FrameKind::Untracked);
            entry.kind = FrameKind::Kernel;
        }
        entries[first].alloc_size = npages;
        Some(paddr)
    }

    /// Release a kernel run. The length was recorded at allocation in
    /// the run's first frame.
    pub fn free_kernel(&self, paddr: PhysAddress) {
        let first = self.index_of(paddr) as usize;
        let mut entries = self.entries.lock();
        let npages = entries[first].alloc_size;
        assert!(npages > 0, "free of a frame that starts no run");
        assert_eq!(entries[first].kind, FrameKind::Kernel);
        entries[first].alloc_size = 0;
        for entry in &mut entries[first..first + npages as usize] {
            assert_eq!(entry.kind, FrameKind::Kernel);
            entry.kind = FrameKind::Freed;
            entry.owner = None;
        }
    }

    /// One frame backing the user page `vaddr` of `space`. Tries a
    /// freed frame, then a fresh one, and finally evicts the FIFO
    /// head. Never fails: eviction always yields a frame unless the
    /// swap file overflows (fatal).
    pub fn alloc_user(
        &self,
        ram: &Ram,
        swap: &SwapStore,
        stats: &VmStats,
        space: &Arc<AddressSpace>,
        vaddr: VirtAddress,
    ) -> UserFrame {
        assert!(vaddr.is_aligned_to(PAGE_SIZE.as_raw()));
        let owner = BackRef {
            space: Arc::downgrade(space),
            vaddr,
        };

        if let Some(paddr) = self.take_freed_run(1, FrameKind::User, Some(owner.clone())) {
            self.push_tail(self.index_of(paddr));
            return UserFrame {
                paddr,
                evicted: None,
            };
        }

        if let Some(paddr) = ram.stealmem(1) {
            let index = self.index_of(paddr);
            {
                let mut entries = self.entries.lock();
                let entry = &mut entries[index as usize];
                assert_eq!(entry.kind, FrameKind::Untracked);
                entry.kind = FrameKind::User;
                entry.alloc_size = 1;
                entry.owner = Some(owner);
            }
            self.push_tail(index);
            return UserFrame {
                paddr,
                evicted: None,
            };
        }

        self.evict(ram, swap, stats, space, owner)
    }

    /// Steal the FIFO head: park its page in the swap file, mark the
    /// old owner's entry swapped out, rebind the frame to `new_owner`,
    /// and move it to the FIFO tail. The frame's physical identity
    /// does not change, only its owner.
    fn evict(
        &self,
        ram: &Ram,
        swap: &SwapStore,
        stats: &VmStats,
        space: &Arc<AddressSpace>,
        new_owner: BackRef,
    ) -> UserFrame {
        // Read the victim under the locks; the I/O happens with both
        // released.
        let (victim, old_space, old_vaddr) = {
            let entries = self.entries.lock();
            let queue = self.queue.lock();
            let head = queue.head;
            assert!(
                head != self.sentinel(),
                "out of memory and no user frame to evict"
            );
            let entry = &entries[head as usize];
            assert_eq!(entry.kind, FrameKind::User);
            assert_eq!(entry.alloc_size, 1);
            let owner = entry.owner.as_ref().expect("user frame with no owner");
            (head, owner.space.clone(), owner.vaddr)
        };

        let paddr = self.paddr_of(victim);
        let offset = swap.swap_out(ram, Frame::new(paddr), stats);

        let old_space = old_space
            .upgrade()
            .expect("evicting a frame of a destroyed address space");
        old_space.with_pt(|pt| pt.swap_out(old_vaddr, offset));
        let evicted_here = Arc::ptr_eq(&old_space, space);

        // Commit: rebind the frame and recycle it to the FIFO tail.
        {
            let mut entries = self.entries.lock();
            let mut queue = self.queue.lock();
            {
                let entry = &mut entries[victim as usize];
                assert_eq!(entry.kind, FrameKind::User);
                assert_eq!(entry.alloc_size, 1);
                entry.owner = Some(new_owner);
            }
            unlink(&mut entries, &mut queue, victim, self.sentinel());
            link_tail(&mut entries, &mut queue, victim, self.sentinel());
        }

        UserFrame {
            paddr,
            evicted: evicted_here.then_some(old_vaddr),
        }
    }

    /// Release a single user frame and drop it from the victim queue.
    pub fn free_user(&self, paddr: PhysAddress) {
        let index = self.index_of(paddr);
        let mut entries = self.entries.lock();
        let mut queue = self.queue.lock();
        {
            let entry = &entries[index as usize];
            assert_eq!(entry.kind, FrameKind::User);
            assert_eq!(entry.alloc_size, 1);
        }
        unlink(&mut entries, &mut queue, index, self.sentinel());
        let entry = &mut entries[index as usize];
        entry.kind = FrameKind::Freed;
        entry.alloc_size = 0;
        entry.owner = None;
    }

    // First-fit scan for `npages` contiguous Freed frames; claims and
    // tags them when found.
    fn take_freed_run(
        &self,
        npages: u32,
        kind: FrameKind,
        owner: Option<BackRef>,
    ) -> Option<PhysAddress> {
        let npages = npages as usize;
        let mut entries = self.entries.lock();
        let total = entries.len();

        let mut found = None;
        'scan: for first in 0..total {
            if first + npages > total {
                break;
            }
            for index in first..first + npages {
                if entries[index].kind != FrameKind::Freed {
                    continue 'scan;
                }
            }
            found = Some(first);
            break;
        }

        let first = found?;
        for entry in &mut entries[first..first + npages] {
            entry.kind = kind;
            entry.alloc_size = 0;
            entry.owner = owner.clone();
        }
        entries[first].alloc_size = npages as u32;
        Some(self.paddr_of(first as u32))
    }

    fn push_tail(&self, index: u32) {
        let mut entries = self.entries.lock();
        let mut queue = self.queue.lock();
        link_tail(&mut entries, &mut queue, index, self.sentinel());
    }

    /// Kind of the frame holding `paddr`.
    pub fn kind_of(&self, paddr: PhysAddress) -> FrameKind {
        let index = self.index_of(paddr);
        self.entries.lock()[index as usize].kind
    }

    /// Victim-queue contents, head (next victim) first. Diagnostic.
    pub fn fifo_frames(&self) -> Vec<PhysAddress> {
        let entries = self.entries.lock();
        let queue = self.queue.lock();
        let mut frames = Vec::new();
        let mut index = queue.head;
        while index != self.sentinel() {
            assert!(frames.len() < entries.len(), "victim queue cycle");
            let entry = &entries[index as usize];
            assert_eq!(entry.kind, FrameKind::User);
            frames.push(self.paddr_of(index));
            index = entry.next;
        }
        frames
    }

    /// Visit every user frame with its back-reference.
    pub(crate) fn for_each_user_frame(
        &self,
        mut f: impl FnMut(PhysAddress, &Weak<AddressSpace>, VirtAddress),
    ) {
        let entries = self.entries.lock();
        for (index, entry) in entries.iter().enumerate() {
            if entry.kind == FrameKind::User {
                let owner = entry.owner.as_ref().expect("user frame with no owner");
                f(self.paddr_of(index as u32), &owner.space, owner.vaddr);
            }
        }
    }
}

fn link_tail(entries: &mut [Entry], queue: &mut Queue, index: u32, sentinel: u32) {
    entries[index as usize].next = sentinel;
    if queue.tail == sentinel {
        entries[index as usize].prev = sentinel;
        queue.head = index;
    } else {
        entries[queue.tail as usize].next = index;
        entries[index as usize].prev = queue.tail;
    }
    queue.tail = index;
}

fn unlink(entries: &mut [Entry], queue: &mut Queue, index: u32, sentinel: u32) {
    let (prev, next) = {
        let entry = &entries[index as usize];
        (entry.prev, entry.next)
    };
    if prev == sentinel {
        queue.head = next;
    } else {
        entries[prev as usize].next = next;
    }
    if next == sentinel {
        queue.tail = prev;
    } else {
        entries[next as usize].prev = prev;
    }
    let entry = &mut entries[index as usize];
    entry.prev = sentinel;
    entry.next = sentinel;
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::mm::pagetable::PageState;
    use crate::vfs::MemVnode;
    use shared::memory::Length;

    fn page_size() -> u32 {
        PAGE_SIZE.as_raw()
    }

    fn fixture(frames: u32) -> (Ram, CoreMap, SwapStore, VmStats) {
        let ram = Ram::new(Length::from_raw(frames * page_size()));
        let coremap = CoreMap::new(frames);
        let swap = SwapStore::new(
            Arc::new(MemVnode::new()),
            Length::from_raw(16 * page_size()),
        );
        (ram, coremap, swap, VmStats::new())
    }

    // A space whose page table covers four code pages at 4 MiB plus
    // the stack window, with `prefault` code pages made resident.
    fn space(
        coremap: &CoreMap,
        ram: &Ram,
        swap: &SwapStore,
        stats: &VmStats,
        prefault: u32,
    ) -> Arc<AddressSpace> {
        let mut space = AddressSpace::new("test", Arc::new(MemVnode::new()));
        space.define_region(
            VirtAddress::from_raw(0x0040_0000),
            4 * page_size(),
            crate::segment::Perm::R | crate::segment::Perm::W,
            0,
            0,
        );
        space.prepare_load();
        space.define_stack();
        let space = Arc::new(space);

        for i in 0..prefault {
            let vaddr = VirtAddress::from_raw(0x0040_0000 + i * page_size());
            let grab = coremap.alloc_user(ram, swap, stats, &space, vaddr);
            space.with_pt(|pt| pt.add(vaddr, grab.paddr, crate::segment::Perm::R));
        }
        space
    }

    #[test]
    fn kernel_runs_are_first_fit_over_freed() {
        let (ram, coremap, _, _) = fixture(8);

        let a = coremap.alloc_kernel(&ram, 2).unwrap();
        let b = coremap.alloc_kernel(&ram, 3).unwrap();
        assert_eq!(a, PhysAddress::from_raw(0));
        assert_eq!(b, PhysAddress::from_raw(2 * page_size()));

        coremap.free_kernel(a);
        assert_eq!(coremap.kind_of(a), FrameKind::Freed);

        // A 1-frame request reuses the freed run's start; a 3-frame
        // request doesn't fit there and takes fresh frames.
        let c = coremap.alloc_kernel(&ram, 1).unwrap();
        assert_eq!(c, a);
        let d = coremap.alloc_kernel(&ram, 3).unwrap();
        assert_eq!(d, PhysAddress::from_raw(5 * page_size()));

        // RAM is now exhausted and no freed run of 2 exists.
        assert_eq!(coremap.alloc_kernel(&ram, 2), None);
        assert_eq!(coremap.alloc_kernel(&ram, 1), Some(PhysAddress::from_raw(page_size())));
    }

    #[test]
    #[should_panic(expected = "starts no run")]
    fn free_kernel_mid_run_panics() {
        let (ram, coremap, _, _) = fixture(4);
        let run = coremap.alloc_kernel(&ram, 2).unwrap();
        coremap.free_kernel(PhysAddress::from_raw(run.as_raw() + page_size()));
    }

    #[test]
    fn user_frames_queue_in_fifo_order() {
        let (ram, coremap, swap, stats) = fixture(4);
        let space = space(&coremap, &ram, &swap, &stats, 3);

        let frames = coremap.fifo_frames();
        assert_eq!(
            frames,
            vec![
                PhysAddress::from_raw(0),
                PhysAddress::from_raw(page_size()),
                PhysAddress::from_raw(2 * page_size()),
            ]
        );

        // Freeing the middle element patches both neighbors.
        coremap.free_user(frames[1]);
        assert_eq!(coremap.fifo_frames(), vec![frames[0], frames[2]]);

        // Freeing the head promotes the next element.
        coremap.free_user(frames[0]);
        assert_eq!(coremap.fifo_frames(), vec![frames[2]]);

        // Freeing the sole element empties the queue.
        coremap.free_user(frames[2]);
        assert!(coremap.fifo_frames().is_empty());

        drop(space);
    }

    #[test]
    fn freed_user_frame_is_reused_before_fresh_ram() {
        let (ram, coremap, swap, stats) = fixture(4);
        let space = space(&coremap, &ram, &swap, &stats, 2);

        coremap.free_user(PhysAddress::from_raw(0));

        let vaddr = VirtAddress::from_raw(0x0040_3000);
        let grab = coremap.alloc_user(&ram, &swap, &stats, &space, vaddr);
        assert_eq!(grab.paddr, PhysAddress::from_raw(0));
        assert!(grab.evicted.is_none());
        // Reused frame goes to the tail.
        assert_eq!(
            coremap.fifo_frames(),
            vec![PhysAddress::from_raw(page_size()), PhysAddress::from_raw(0)]
        );
    }

    #[test]
    fn eviction_steals_the_fifo_head() {
        let (ram, coremap, swap, stats) = fixture(2);
        let space = space(&coremap, &ram, &swap, &stats, 2);

        let vaddr_old = VirtAddress::from_raw(0x0040_0000);
        let vaddr_new = VirtAddress::from_raw(0x0040_2000);
        let grab = coremap.alloc_user(&ram, &swap, &stats, &space, vaddr_new);

        // Frame 0 backed page 0; it now backs the new page and sits at
        // the queue tail.
        assert_eq!(grab.paddr, PhysAddress::from_raw(0));
        assert_eq!(grab.evicted, Some(vaddr_old));
        assert_eq!(
            coremap.fifo_frames(),
            vec![PhysAddress::from_raw(page_size()), PhysAddress::from_raw(0)]
        );

        // The old page is parked in slot 0.
        assert!(swap.is_slot_set(0));
        assert_eq!(
            space.with_pt(|pt| pt.get(vaddr_old).state),
            PageState::Swapped(0)
        );
    }

    #[test]
    fn back_references_match_user_frames() {
        let (ram, coremap, swap, stats) = fixture(4);
        let space = space(&coremap, &ram, &swap, &stats, 3);

        let mut seen = 0;
        coremap.for_each_user_frame(|paddr, weak, vaddr| {
            seen += 1;
            let owner = weak.upgrade().unwrap();
            assert!(Arc::ptr_eq(&owner, &space));
            assert_eq!(
                owner.with_pt(|pt| pt.get(vaddr).state),
                PageState::Resident(paddr)
            );
        });
        assert_eq!(seen, 3);
    }
}
