//! The swap store: a fixed-size file of page slots with a bitmap of
//! slots in use.

use crate::mm::stats::{Stat, VmStats};
use crate::ram::Ram;
use crate::vfs::Vnode;

use alloc::sync::Arc;

use shared::memory::{Bitmap, Frame, Length, PAGE_SIZE};
use spin::Mutex;

/// Slot `i` of the file holds whatever page was last written at byte
/// offset `i * PAGE_SIZE`; a set bitmap bit means some page table
/// entry points at the slot. The file has no on-disk header and no
/// meaning across boots.
pub struct SwapStore {
    /// Guards the bitmap and the file together, and may be held across
    /// the synchronous I/O. Callers hold no other VM lock.
    inner: Mutex<Inner>,
}

struct Inner {
    file: Arc<dyn Vnode>,
    map: Bitmap,
}

impl SwapStore {
    /// # Panics
    ///
    /// Panics if `size` is zero or not page aligned.
    pub fn new(file: Arc<dyn Vnode>, size: Length) -> SwapStore {
        assert!(size.as_raw() > 0);
        assert!(size.is_aligned_to(PAGE_SIZE.as_raw()));
        let slots = (size.as_raw() / PAGE_SIZE.as_raw()) as usize;
        SwapStore {
            inner: Mutex::new(Inner {
                file,
                map: Bitmap::new(slots),
            }),
        }
    }

    pub fn slots(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// Park the contents of `frame` in a free slot and return the
    /// slot's byte offset. The write is synchronous.
    ///
    /// # Panics
    ///
    /// Panics when the swap file is full or the write fails.
    pub fn swap_out(&self, ram: &Ram, frame: Frame, stats: &VmStats) -> u32 {
        let mut inner = self.inner.lock();
        let index = match inner.map.alloc() {
            Some(index) => index,
            None => panic!("out of swap space"),
        };
        let offset = index as u32 * PAGE_SIZE.as_raw();

        // Safety: the evicting thread owns `frame` until the core-map
        // rebinds it.
        let src = unsafe { ram.frame(frame) };
        match inner.file.write_at(src, offset) {
            Ok(n) if n == src.len() => {}
            _ => panic!("cannot write page to swap file"),
        }

        stats.increment(Stat::SwapfileWrites);
        offset
    }

    /// Read the page parked at `offset` back into `frame` and release
    /// the slot.
    ///
    /// # Panics
    ///
    /// Panics if no page is parked at `offset` or the read fails.
    pub fn swap_in(&self, ram: &Ram, frame: Frame, offset: u32, stats: &VmStats) {
        let mut inner = self.inner.lock();
        let index = Self::slot_of(offset);
        assert!(
            inner.map.is_set(index),
            "no swapped page at offset {offset:#x}"
        );

        // Safety: the faulting thread owns the freshly allocated frame.
        let dst = unsafe { ram.frame_mut(frame) };
        match inner.file.read_at(dst, offset) {
            Ok(n) if n == dst.len() => {}
            _ => panic!("cannot read page from swap file"),
        }

        inner.map.unmark(index);
        stats.increment(Stat::PageFaultsSwapfile);
    }

    /// Release the slot at `offset` without touching the file.
    ///
    /// # Panics
    ///
    /// Panics if the slot is not in use.
    pub fn free(&self, offset: u32) {
        let mut inner = self.inner.lock();
        let index = Self::slot_of(offset);
        assert!(
            inner.map.is_set(index),
            "freeing an unused swap slot at {offset:#x}"
        );
        inner.map.unmark(index);
    }

    /// Whether slot `index` currently holds a page.
    pub fn is_slot_set(&self, index: usize) -> bool {
        self.inner.lock().map.is_set(index)
    }

    fn slot_of(offset: u32) -> usize {
        assert_eq!(offset % PAGE_SIZE.as_raw(), 0);
        (offset / PAGE_SIZE.as_raw()) as usize
    }
}
