//! Machine and policy constants.

use shared::memory::{Length, VirtAddress, PAGE_SIZE};

use static_assertions::const_assert;

/// Top of the user virtual address space and the initial stack pointer.
pub const USERSTACK: VirtAddress = VirtAddress::from_raw(0x8000_0000);

/// Pages reserved for the user stack, immediately below [`USERSTACK`].
pub const STACK_PAGES: u32 = 18;

/// Default swap file capacity.
pub const SWAP_SIZE: Length = Length::from_raw(9 * 1024 * 1024);

const_assert!(USERSTACK.as_raw() % PAGE_SIZE.as_raw() == 0);
const_assert!(SWAP_SIZE.as_raw() % PAGE_SIZE.as_raw() == 0);

/// Lowest address of the stack region.
pub const fn stack_base() -> VirtAddress {
    VirtAddress::from_raw(USERSTACK.as_raw() - STACK_PAGES * PAGE_SIZE.as_raw())
}
