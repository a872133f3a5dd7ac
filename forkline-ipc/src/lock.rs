//! Lock that holds across `fork()`
//!
//! A POSIX semaphore placed in a shared anonymous mapping. Every process
//! forked after [`ProcessLock::new`] sees the same semaphore, so the lock
//! serializes threads in one process and workers in sibling processes alike.

use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::errno::Errno;
use nix::libc;
use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};

use crate::error::IpcError;

/// Binary semaphore in memory shared with forked children
pub struct ProcessLock {
    sem: NonNull<libc::sem_t>,
}

// The semaphore lives in a MAP_SHARED page and is only touched through
// sem_wait/sem_post, which are thread-safe.
unsafe impl Send for ProcessLock {}
unsafe impl Sync for ProcessLock {}

impl ProcessLock {
    /// Map a shared page and initialize an unlocked semaphore in it
    pub fn new() -> Result<Self, IpcError> {
        let len = NonZeroUsize::new(std::mem::size_of::<libc::sem_t>())
            .ok_or_else(|| IpcError::LockError("sem_t has zero size".to_string()))?;

        let page = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
        }
        .map_err(|e| IpcError::LockError(format!("mmap failed: {}", e)))?;

        let sem = page.cast::<libc::sem_t>();
        if unsafe { libc::sem_init(sem.as_ptr(), 1, 1) } != 0 {
            let err = Errno::last();
            unsafe {
                let _ = munmap(page, len.get());
            }
            return Err(IpcError::LockError(format!("sem_init failed: {}", err)));
        }

        Ok(Self { sem })
    }

    /// Block until the lock is acquired
    pub fn lock(&self) -> Result<ProcessLockGuard<'_>, IpcError> {
        loop {
            if unsafe { libc::sem_wait(self.sem.as_ptr()) } == 0 {
                return Ok(ProcessLockGuard { lock: self });
            }
            match Errno::last() {
                Errno::EINTR => continue,
                err => return Err(IpcError::LockError(format!("sem_wait failed: {}", err))),
            }
        }
    }

    /// Acquire the lock only if nobody holds it
    pub fn try_lock(&self) -> Option<ProcessLockGuard<'_>> {
        if unsafe { libc::sem_trywait(self.sem.as_ptr()) } == 0 {
            Some(ProcessLockGuard { lock: self })
        } else {
            None
        }
    }

    fn unlock(&self) {
        unsafe {
            libc::sem_post(self.sem.as_ptr());
        }
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        // Other processes may still hold their own mapping of the page, so the
        // semaphore is never destroyed; unmapping only drops this process's view.
        unsafe {
            let _ = munmap(self.sem.cast(), std::mem::size_of::<libc::sem_t>());
        }
    }
}

impl std::fmt::Debug for ProcessLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessLock").finish_non_exhaustive()
    }
}

/// Releases the [`ProcessLock`] on drop
pub struct ProcessLockGuard<'a> {
    lock: &'a ProcessLock,
}

impl Drop for ProcessLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_lock_is_exclusive() {
        let lock = ProcessLock::new().unwrap();
        let guard = lock.lock().unwrap();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_lock_serializes_threads() {
        let lock = Arc::new(ProcessLock::new().unwrap());
        let inside = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            let inside = Arc::clone(&inside);
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    let _guard = lock.lock().unwrap();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
    }
}
