//! Data structures representing pages and frames

use super::addr::{Length, PhysAddress, VirtAddress};

use static_assertions::const_assert;

pub const PAGE_SIZE: Length = Length::from_raw(4096);

/// Mask selecting the page-number bits of a 32-bit address.
pub const PAGE_FRAME: u32 = 0xffff_f000;

const_assert!(PAGE_SIZE.as_raw().is_power_of_two());
const_assert!(PAGE_FRAME == !(PAGE_SIZE.as_raw() - 1));

/// A 4 KiB physical memory frame
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Frame {
    start: PhysAddress,
}

impl Frame {
    /// Creates a `Frame` representing the frame beginning at `start`.
    ///
    /// # Panics
    ///
    /// Panics if `start` is not aligned to `PAGE_SIZE`.
    pub fn new(start: PhysAddress) -> Frame {
        assert!(start.is_aligned_to(PAGE_SIZE.as_raw()));
        Frame { start }
    }

    /// Gets the `Frame` that contains `addr`.
    pub fn containing(addr: PhysAddress) -> Frame {
        Self::new(addr.align_down(PAGE_SIZE.as_raw()))
    }

    /// Start address of the frame
    pub fn start(self) -> PhysAddress {
        self.start
    }

    /// Position of the frame in physical memory, counting from frame 0
    /// at address 0.
    pub fn index(self) -> usize {
        (self.start.as_raw() / PAGE_SIZE.as_raw()) as usize
    }

    /// The nth frame after `self`, or `None` if it's not addressable
    pub fn next(self, n: u32) -> Option<Frame> {
        let next_start = self
            .start
            .offset_by_checked(Length::from_raw(PAGE_SIZE.as_raw().checked_mul(n)?))?;
        Some(Self::new(next_start))
    }
}

/// A 4 KiB virtual memory page
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Page {
    start: VirtAddress,
}

impl Page {
    /// Creates a `Page` representing the page beginning at `start`.
    ///
    /// # Panics
    ///
    /// Panics if `start` is not aligned to `PAGE_SIZE`.
    pub fn new(start: VirtAddress) -> Page {
        assert!(start.is_aligned_to(PAGE_SIZE.as_raw()));
        Page { start }
    }

    /// Gets the `Page` that contains `addr`.
    pub fn containing(addr: VirtAddress) -> Page {
        Self::new(addr.align_down(PAGE_SIZE.as_raw()))
    }

    /// Start address of the page
    pub fn start(self) -> VirtAddress {
        self.start
    }

    /// The nth page after `self`, or `None` if it's not addressable
    pub fn next(self, n: u32) -> Option<Page> {
        let next_start = self
            .start
            .offset_by_checked(Length::from_raw(PAGE_SIZE.as_raw().checked_mul(n)?))?;
        Some(Self::new(next_start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_containing() {
        let frame = Frame::containing(PhysAddress::from_raw(0x1fff));
        assert_eq!(frame.start(), PhysAddress::from_raw(0x1000));
        assert_eq!(frame.index(), 1);
    }

    #[test]
    #[should_panic]
    fn frame_must_be_aligned() {
        Frame::new(PhysAddress::from_raw(0x1001));
    }

    #[test]
    fn page_next() {
        let page = Page::new(VirtAddress::from_raw(0x4000));
        assert_eq!(page.next(2).unwrap().start(), VirtAddress::from_raw(0x6000));
        assert_eq!(Page::new(VirtAddress::from_raw(0xffff_f000)).next(1), None);
    }
}
