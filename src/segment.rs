//! Program segments and the page-at-a-time executable loader.

use crate::param::USERSTACK;
use crate::ram::Ram;
use crate::vfs::Vnode;

use bitflags::bitflags;
use log::warn;
use shared::memory::{Frame, VirtAddress, PAGE_FRAME, PAGE_SIZE};

bitflags! {
    /// Segment permission bits, matching ELF `p_flags`.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct Perm: u32 {
        const X = 0x1;
        const W = 0x2;
        const R = 0x4;
    }
}

/// One loadable region of a process image. Immutable once defined.
///
/// `base` is page aligned; the true load address of the first byte is
/// `base + base_offset`. `mem_size` covers the whole aligned span, so
/// `base + mem_size` is also page aligned.
#[derive(Clone, Debug)]
pub struct Segment {
    perm: Perm,
    base: VirtAddress,
    base_offset: u32,
    file_offset: u32,
    file_size: u32,
    mem_size: u32,
    num_pages: u32,
}

impl Segment {
    /// Define a segment at `vaddr` (not necessarily aligned) covering
    /// `mem_size` bytes, of which the first `file_size` come from the
    /// executable at `file_offset`.
    pub fn new(
        vaddr: VirtAddress,
        mem_size: u32,
        perm: Perm,
        mut file_size: u32,
        file_offset: u32,
    ) -> Segment {
        assert!(!vaddr.is_zero());
        assert!(!perm.is_empty());

        if file_size > mem_size {
            warn!(
                "segment file size {} exceeds memory size {}, truncating",
                file_size, mem_size
            );
            file_size = mem_size;
        }

        let base_offset = vaddr.as_raw() & !PAGE_FRAME;
        let base = vaddr.align_down(PAGE_SIZE.as_raw());
        let mem_size = (mem_size + base_offset + PAGE_SIZE.as_raw() - 1) & PAGE_FRAME;
        let num_pages = mem_size / PAGE_SIZE.as_raw();
        assert!(num_pages > 0);

        Segment {
            perm,
            base,
            base_offset,
            file_offset,
            file_size,
            mem_size,
            num_pages,
        }
    }

    pub fn perm(&self) -> Perm {
        self.perm
    }

    pub fn base(&self) -> VirtAddress {
        self.base
    }

    pub fn mem_size(&self) -> u32 {
        self.mem_size
    }

    pub fn num_pages(&self) -> u32 {
        self.num_pages
    }

    /// First address past the segment.
    pub fn end(&self) -> VirtAddress {
        VirtAddress::from_raw(self.base.as_raw() + self.mem_size)
    }

    pub fn contains(&self, vaddr: VirtAddress) -> bool {
        vaddr >= self.base && vaddr.as_raw() - self.base.as_raw() < self.mem_size
    }

    /// The stack is the one segment pinned to the top of user space.
    pub fn is_stack(&self) -> bool {
        self.base.as_raw() == USERSTACK.as_raw() - self.mem_size
    }

    fn page_index(&self, vaddr: VirtAddress) -> u32 {
        assert!(self.contains(vaddr));
        let aligned = vaddr.align_down(PAGE_SIZE.as_raw());
        (aligned - self.base).as_raw() / PAGE_SIZE.as_raw()
    }

    /// What the executable contributes to page `page_index`, as
    /// (file offset, length, offset within the frame). `None` when the
    /// page is entirely past the file data.
    ///
    /// Page 0 starts `base_offset` bytes into the frame; every later
    /// page starts at its frame's first byte, skewed back by
    /// `base_offset` in the file.
    fn file_slice(&self, page_index: u32) -> Option<(u32, u32, u32)> {
        assert!(page_index < self.num_pages);
        if self.file_size == 0 {
            return None;
        }

        if page_index == 0 {
            let len = (PAGE_SIZE.as_raw() - self.base_offset).min(self.file_size);
            Some((self.file_offset, len, self.base_offset))
        } else {
            let skew = page_index * PAGE_SIZE.as_raw() - self.base_offset;
            if skew >= self.file_size {
                return None;
            }
            let len = PAGE_SIZE.as_raw().min(self.file_size - skew);
            Some((self.file_offset + skew, len, 0))
        }
    }

    /// Materialize the page holding `vaddr` into `frame`: wipe the
    /// frame, then read in whatever the executable contributes. Bytes
    /// past the file's contribution stay zero.
    ///
    /// # Panics
    ///
    /// Panics on a filesystem error or a truncated executable.
    pub fn load_page(&self, file: &dyn Vnode, vaddr: VirtAddress, ram: &Ram, frame: Frame) {
        let page_index = self.page_index(vaddr);

        // Safety: the faulting thread owns `frame` until the page
        // table entry goes in.
        let dst = unsafe { ram.frame_mut(frame) };
        dst.fill(0);

        let Some((offset, len, skip)) = self.file_slice(page_index) else {
            return;
        };
        let dst = &mut dst[skip as usize..(skip + len) as usize];
        match file.read_at(dst, offset) {
            Ok(n) if n == len as usize => {}
            Ok(_) => panic!("short read on segment, executable truncated?"),
            Err(e) => panic!("executable read failed: {:?}", e),
        }
    }
}
