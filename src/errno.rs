//! Error numbers crossing the trap boundary.

/// The only recoverable error category in the VM: conditions that make
/// the trap handler kill the faulting process or fail an `exec`.
/// Everything below this layer either succeeds or panics.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Errno {
    /// Invalid argument (unrecognized fault type).
    Inval,
    /// Bad memory reference: no current address space, or an address
    /// outside every segment.
    Fault,
    /// Out of memory.
    NoMem,
    /// Not an executable this kernel can run.
    NoExec,
}
