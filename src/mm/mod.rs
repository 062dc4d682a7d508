//! Memory management: the core-map, page tables, swap, TLB, and the
//! event counters that tie them together.

pub mod coremap;
pub mod pagetable;
pub mod stats;
pub mod swap;
pub mod tlb;
