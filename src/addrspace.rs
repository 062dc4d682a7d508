//! Per-process address spaces.

use crate::mm::pagetable::PageTable;
use crate::param::{stack_base, STACK_PAGES, USERSTACK};
use crate::segment::{Perm, Segment};
use crate::sync::Sleeplock;
use crate::vfs::Vnode;

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use shared::memory::{VirtAddress, PAGE_SIZE};

/// One process's view of memory: its executable, the segments derived
/// from it, and the page table. The executable handle stays open for
/// the whole process lifetime so segment pages can be read on demand.
///
/// Segments are appended during `exec`, before the space is shared;
/// after that only the page table changes, under its own lock.
pub struct AddressSpace {
    progname: String,
    vnode: Arc<dyn Vnode>,
    segments: Vec<Segment>,
    pt: Sleeplock<Option<PageTable>>,
}

impl AddressSpace {
    pub fn new(progname: &str, vnode: Arc<dyn Vnode>) -> AddressSpace {
        AddressSpace {
            progname: progname.to_string(),
            vnode,
            segments: Vec::new(),
            pt: Sleeplock::new(None),
        }
    }

    pub fn progname(&self) -> &str {
        &self.progname
    }

    pub fn vnode(&self) -> &Arc<dyn Vnode> {
        &self.vnode
    }

    /// Append the segment covering `[vaddr, vaddr + mem_size)`.
    pub fn define_region(
        &mut self,
        vaddr: VirtAddress,
        mem_size: u32,
        perm: Perm,
        file_size: u32,
        file_offset: u32,
    ) {
        self.segments
            .push(Segment::new(vaddr, mem_size, perm, file_size, file_offset));
    }

    /// Build the page table over its two ranges: the span of the
    /// defined segments low, the stack window high. Entries fill in
    /// lazily as the process faults.
    pub fn prepare_load(&mut self) {
        let mut bounds: Option<(VirtAddress, VirtAddress)> = None;
        for segment in self.segments.iter().filter(|s| !s.is_stack()) {
            let (base, end) = bounds.unwrap_or((segment.base(), segment.end()));
            bounds = Some((base.min(segment.base()), end.max(segment.end())));
        }
        let (base, end) = bounds.expect("prepare_load with no regions defined");
        assert!(end <= stack_base());

        let num_pages = (end - base).as_raw() / PAGE_SIZE.as_raw();
        *self.pt.lock() = Some(PageTable::new(base, num_pages, stack_base(), STACK_PAGES));
    }

    /// Nothing is loaded eagerly, so nothing to finish.
    pub fn complete_load(&mut self) {}

    /// Append the stack segment and return the initial stack pointer.
    pub fn define_stack(&mut self) -> VirtAddress {
        self.define_region(
            stack_base(),
            STACK_PAGES * PAGE_SIZE.as_raw(),
            Perm::R | Perm::W,
            0,
            0,
        );
        USERSTACK
    }

    /// The segment containing `vaddr`, if any.
    pub fn find_segment(&self, vaddr: VirtAddress) -> Option<&Segment> {
        self.segments.iter().find(|s| s.contains(vaddr))
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Run `f` under the page-table lock. The lock may be held across
    /// blocking I/O; never acquire it while holding a spin lock.
    ///
    /// # Panics
    ///
    /// Panics if `prepare_load` has not run.
    pub fn with_pt<R>(&self, f: impl FnOnce(&mut PageTable) -> R) -> R {
        let mut guard = self.pt.lock();
        let pt = guard.as_mut().expect("page table not prepared");
        f(pt)
    }

    pub(crate) fn take_pt(&self) -> Option<PageTable> {
        self.pt.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::vfs::MemVnode;
    use shared::memory::PhysAddress;

    fn space_with_regions() -> AddressSpace {
        let mut space = AddressSpace::new("prog", Arc::new(MemVnode::new()));
        // Text at 4 MiB (one page), data right after it with an
        // unaligned base spilling into a second page.
        space.define_region(
            VirtAddress::from_raw(0x0040_0000),
            0x1000,
            Perm::R | Perm::X,
            0x1000,
            0,
        );
        space.define_region(
            VirtAddress::from_raw(0x0040_1800),
            0x1000,
            Perm::R | Perm::W,
            0x800,
            0x1000,
        );
        space
    }

    #[test]
    fn prepare_load_spans_the_defined_segments() {
        let mut space = space_with_regions();
        space.prepare_load();
        space.define_stack();

        // Text covers one page, data covers two after alignment.
        space.with_pt(|pt| assert_eq!(pt.num_pages(), 3 + STACK_PAGES));
    }

    #[test]
    fn define_stack_pins_the_top_of_user_space() {
        let mut space = space_with_regions();
        space.prepare_load();
        assert_eq!(space.define_stack(), USERSTACK);

        let stack = space.find_segment(stack_base()).unwrap();
        assert!(stack.is_stack());
        assert_eq!(stack.num_pages(), STACK_PAGES);
        assert!(space.find_segment(USERSTACK - PAGE_SIZE).is_some());
    }

    #[test]
    fn find_segment_rejects_gaps() {
        let space = space_with_regions();
        assert!(space.find_segment(VirtAddress::from_raw(0x0040_0abc)).is_some());
        assert!(space.find_segment(VirtAddress::from_raw(0x0300_0000)).is_none());
        assert!(space.find_segment(VirtAddress::from_raw(0x7fff_0000)).is_none());
    }

    #[test]
    fn page_table_populates_lazily() {
        let mut space = space_with_regions();
        space.prepare_load();
        space.define_stack();

        let vaddr = VirtAddress::from_raw(0x0040_1000);
        space.with_pt(|pt| {
            assert_eq!(
                pt.get(vaddr).state,
                crate::mm::pagetable::PageState::Empty
            );
            pt.add(vaddr, PhysAddress::from_raw(0x2000), Perm::R);
            assert_eq!(
                pt.get(vaddr).state,
                crate::mm::pagetable::PageState::Resident(PhysAddress::from_raw(0x2000))
            );
        });
    }

    #[test]
    #[should_panic(expected = "no regions defined")]
    fn prepare_load_requires_a_region() {
        AddressSpace::new("empty", Arc::new(MemVnode::new())).prepare_load();
    }
}
