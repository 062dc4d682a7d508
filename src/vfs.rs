//! The filesystem seam.
//!
//! The VFS proper lives elsewhere in the kernel; the VM only needs
//! offset-addressed reads and writes on an already-open file. The swap
//! file and executables reach the VM as [`Vnode`] handles.

use alloc::vec::Vec;

use spin::Mutex;

/// Error from the backing filesystem.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IoError;

/// An open file.
pub trait Vnode: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`. Returns the number of
    /// bytes read; fewer than requested means end of file.
    fn read_at(&self, buf: &mut [u8], offset: u32) -> Result<usize, IoError>;

    /// Write all of `buf` at `offset`, extending the file if needed.
    /// Returns the number of bytes written.
    fn write_at(&self, buf: &[u8], offset: u32) -> Result<usize, IoError>;

    /// Current file length in bytes.
    fn len(&self) -> u32;
}

/// A file backed by kernel memory. Stands in for the emulator disk.
pub struct MemVnode {
    data: Mutex<Vec<u8>>,
}

impl MemVnode {
    pub fn new() -> MemVnode {
        Self::with_contents(Vec::new())
    }

    pub fn with_contents(data: Vec<u8>) -> MemVnode {
        MemVnode {
            data: Mutex::new(data),
        }
    }
}

impl Default for MemVnode {
    fn default() -> MemVnode {
        MemVnode::new()
    }
}

impl Vnode for MemVnode {
    fn read_at(&self, buf: &mut [u8], offset: u32) -> Result<usize, IoError> {
        let data = self.data.lock();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let count = buf.len().min(data.len() - offset);
        buf[..count].copy_from_slice(&data[offset..offset + count]);
        Ok(count)
    }

    fn write_at(&self, buf: &[u8], offset: u32) -> Result<usize, IoError> {
        let mut data = self.data.lock();
        let offset = offset as usize;
        let end = offset + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn len(&self) -> u32 {
        self.data.lock().len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read() {
        let file = MemVnode::new();
        assert_eq!(file.write_at(b"abcdef", 4), Ok(6));
        assert_eq!(file.len(), 10);

        let mut buf = [0u8; 6];
        assert_eq!(file.read_at(&mut buf, 4), Ok(6));
        assert_eq!(&buf, b"abcdef");
    }

    #[test]
    fn gap_reads_back_zeroed() {
        let file = MemVnode::new();
        file.write_at(b"x", 8).unwrap();

        let mut buf = [0xffu8; 8];
        assert_eq!(file.read_at(&mut buf, 0), Ok(8));
        assert_eq!(buf, [0u8; 8]);
    }

    #[test]
    fn read_past_eof_is_short() {
        let file = MemVnode::with_contents(b"hello".to_vec());
        let mut buf = [0u8; 8];
        assert_eq!(file.read_at(&mut buf, 3), Ok(2));
        assert_eq!(&buf[..2], b"lo");
        assert_eq!(file.read_at(&mut buf, 5), Ok(0));
    }
}
