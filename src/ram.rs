//! Simulated physical memory.

use core::cell::UnsafeCell;

use alloc::boxed::Box;
use alloc::vec;

use shared::memory::{Frame, Length, PhysAddress, PAGE_SIZE};
use spin::Mutex;

/// The machine's RAM: a page-aligned byte array plus the raw frame
/// allocator the core-map falls back to when its Freed pool is empty.
///
/// `stealmem` only hands out frames that have never been allocated and
/// does not support freeing; released frames are recycled through the
/// core-map instead.
pub struct Ram {
    bytes: UnsafeCell<Box<[u8]>>,
    /// Index of the lowest never-allocated frame.
    firstfree: Mutex<u32>,
}

// Safety: frame contents are only reached through `frame`/`frame_mut`,
// whose callers must hold the core-map allocation for that frame. The
// `firstfree` cursor has its own lock.
unsafe impl Send for Ram {}
unsafe impl Sync for Ram {}

impl Ram {
    /// # Panics
    ///
    /// Panics if `size` is zero or not page aligned.
    pub fn new(size: Length) -> Ram {
        assert!(size.as_raw() > 0);
        assert!(size.is_aligned_to(PAGE_SIZE.as_raw()));
        Ram {
            bytes: UnsafeCell::new(vec![0u8; size.as_raw() as usize].into_boxed_slice()),
            firstfree: Mutex::new(0),
        }
    }

    pub fn size(&self) -> Length {
        // Safety: the box itself is never resized or replaced.
        Length::from_raw(unsafe { (&*self.bytes.get()).len() } as u32)
    }

    pub fn nframes(&self) -> u32 {
        self.size().as_raw() / PAGE_SIZE.as_raw()
    }

    /// Take `npages` contiguous fresh frames off the bottom of unused
    /// RAM, or `None` when too few remain.
    pub fn stealmem(&self, npages: u32) -> Option<PhysAddress> {
        assert!(npages > 0);
        let mut firstfree = self.firstfree.lock();
        let end = firstfree.checked_add(npages)?;
        if end > self.nframes() {
            return None;
        }
        let addr = PhysAddress::from_raw(*firstfree * PAGE_SIZE.as_raw());
        *firstfree = end;
        Some(addr)
    }

    /// One frame's contents.
    ///
    /// # Safety
    ///
    /// The caller must hold the core-map allocation covering `frame`,
    /// and no `frame_mut` view of the same frame may exist.
    pub unsafe fn frame(&self, frame: Frame) -> &[u8] {
        let (start, end) = self.frame_bounds(frame);
        &(&*self.bytes.get())[start..end]
    }

    /// One frame's contents, mutably.
    ///
    /// # Safety
    ///
    /// The caller must hold the core-map allocation covering `frame`,
    /// and no other view of the same frame may exist.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn frame_mut(&self, frame: Frame) -> &mut [u8] {
        let (start, end) = self.frame_bounds(frame);
        &mut (&mut *self.bytes.get())[start..end]
    }

    fn frame_bounds(&self, frame: Frame) -> (usize, usize) {
        let start = frame.start().as_raw() as usize;
        let end = start + PAGE_SIZE.as_raw() as usize;
        assert!(end <= self.size().as_raw() as usize);
        (start, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stealmem_is_a_bump_allocator() {
        let ram = Ram::new(Length::from_raw(4 * PAGE_SIZE.as_raw()));
        assert_eq!(ram.nframes(), 4);

        assert_eq!(ram.stealmem(2), Some(PhysAddress::from_raw(0)));
        assert_eq!(ram.stealmem(1), Some(PhysAddress::from_raw(0x2000)));
        assert_eq!(ram.stealmem(2), None);
        assert_eq!(ram.stealmem(1), Some(PhysAddress::from_raw(0x3000)));
        assert_eq!(ram.stealmem(1), None);
    }

    #[test]
    fn frames_start_zeroed_and_hold_writes() {
        let ram = Ram::new(Length::from_raw(2 * PAGE_SIZE.as_raw()));
        let frame = Frame::new(ram.stealmem(1).unwrap());

        unsafe {
            assert!(ram.frame(frame).iter().all(|&b| b == 0));
            ram.frame_mut(frame)[..4].copy_from_slice(b"poke");
            assert_eq!(&ram.frame(frame)[..4], b"poke");
        }
    }

    #[test]
    #[should_panic]
    fn ram_must_be_page_aligned() {
        Ram::new(Length::from_raw(100));
    }
}
