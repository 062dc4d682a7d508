//! Lock types.

use spin::{Mutex, MutexGuard};

/// A mutex that may be held across blocking operations: file I/O, or a
/// frame allocation that has to evict. The spin locks inside `mm` must
/// never be held while acquiring one of these.
pub struct Sleeplock<T>(Mutex<T>);

impl<T> Sleeplock<T> {
    pub const fn new(value: T) -> Sleeplock<T> {
        Sleeplock(Mutex::new(value))
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.0.lock()
    }
}
