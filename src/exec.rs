//! Loading an executable image at `exec` time.
//!
//! Only the program headers are interpreted here: each `PT_LOAD`
//! becomes a segment, and the page table is sized over them. No page
//! content is read until the process faults.

use crate::addrspace::AddressSpace;
use crate::errno::Errno;
use crate::segment::Perm;
use crate::vfs::Vnode;

use alloc::sync::Arc;
use alloc::vec;

use log::warn;
use shared::memory::VirtAddress;
use xmas_elf::header;
use xmas_elf::program::Type;
use xmas_elf::ElfFile;

/// A freshly built address space plus where to start running it.
pub struct LoadedImage {
    pub space: AddressSpace,
    pub entry_point: VirtAddress,
    pub stack_ptr: VirtAddress,
}

/// Parse `vnode` as a 32-bit executable and build its address space.
pub fn load_elf(progname: &str, vnode: Arc<dyn Vnode>) -> Result<LoadedImage, Errno> {
    let len = vnode.len() as usize;
    let mut image = vec![0u8; len];
    match vnode.read_at(&mut image, 0) {
        Ok(n) if n == len => {}
        _ => {
            warn!("{progname}: short read on executable, file truncated?");
            return Err(Errno::NoExec);
        }
    }

    let elf = ElfFile::new(&image).map_err(|e| {
        warn!("{progname}: not an executable: {e}");
        Errno::NoExec
    })?;
    match elf.header.pt1.class() {
        header::Class::ThirtyTwo => {}
        _ => {
            warn!("{progname}: not a 32-bit executable");
            return Err(Errno::NoExec);
        }
    }

    let mut space = AddressSpace::new(progname, vnode);
    let mut regions = 0u32;
    for ph in elf.program_iter() {
        match ph.get_type().map_err(|_| Errno::NoExec)? {
            Type::Load => {}
            // Processor-specific headers carry no loadable content.
            Type::Null | Type::Phdr | Type::ProcessorSpecific(_) => continue,
            other => {
                warn!("{progname}: unknown segment type {other:?}");
                return Err(Errno::NoExec);
            }
        }

        let flags = ph.flags();
        let mut perm = Perm::empty();
        if flags.is_read() {
            perm |= Perm::R;
        }
        if flags.is_write() {
            perm |= Perm::W;
        }
        if flags.is_execute() {
            perm |= Perm::X;
        }

        space.define_region(
            VirtAddress::from_raw(ph.virtual_addr() as u32),
            ph.mem_size() as u32,
            perm,
            ph.file_size() as u32,
            ph.offset() as u32,
        );
        regions += 1;
    }

    if regions == 0 {
        warn!("{progname}: no loadable segments");
        return Err(Errno::NoExec);
    }

    space.prepare_load();
    let stack_ptr = space.define_stack();
    space.complete_load();

    Ok(LoadedImage {
        space,
        entry_point: VirtAddress::from_raw(elf.header.pt2.entry_point() as u32),
        stack_ptr,
    })
}
