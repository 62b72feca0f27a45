//! The buffer arena.
//!
//! One shared-memory region backs every signal buffer of one engine. The
//! arena is created and sized once at startup, mapped into every sidecar,
//! and never grows. Buffers are carved out with a bump allocator whose
//! offsets are never reused; the engine sizes the arena with headroom for
//! the programs it expects to build.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

use cadenza_comms::SharedMemory;
use cadenza_core::{EngineError, Result};

const ALIGNMENT: usize = 64;

pub struct BufferArena {
    shm: SharedMemory,
    used: AtomicUsize,
}

impl BufferArena {
    /// Create a freshly named arena of `size` bytes.
    pub fn new(size: usize) -> Result<Self> {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        let suffix: u32 = rand::rng().random();
        let name = format!("/cadenza-bufferarena-{secs:08x}-{suffix:08x}");

        tracing::info!("creating buffer arena {name} with {size} bytes");
        let shm = SharedMemory::create(&name, size)?;

        Ok(Self {
            shm,
            used: AtomicUsize::new(0),
        })
    }

    pub fn base(&self) -> *mut u8 {
        self.shm.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.shm.len()
    }

    pub fn name(&self) -> &str {
        self.shm.name()
    }

    /// Bytes handed out so far.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Reserve `len` bytes and return their offset from the arena base.
    /// Offsets are 64-byte aligned and never reused.
    pub fn allocate(&self, len: usize) -> Result<usize> {
        let len = len.div_ceil(ALIGNMENT) * ALIGNMENT;
        let offset = self.used.fetch_add(len, Ordering::Relaxed);
        if offset + len > self.size() {
            // Roll back so later, smaller requests may still fit
            self.used.fetch_sub(len, Ordering::Relaxed);
            return Err(EngineError::Error(format!(
                "buffer arena exhausted: {len} bytes requested, {} of {} used",
                offset,
                self.size()
            )));
        }
        Ok(offset)
    }

    /// Absolute pointer for an offset previously returned by
    /// [`allocate`](Self::allocate).
    pub fn ptr_at(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset < self.size());
        #[allow(unsafe_code)]
        unsafe {
            self.base().add(offset)
        }
    }
}

impl Drop for BufferArena {
    fn drop(&mut self) {
        tracing::info!("deleting buffer arena {}", self.name());
        // SharedMemory unmaps and unlinks the name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_allocate() {
        let arena = BufferArena::new(64 * 1024).unwrap();
        assert!(arena.name().starts_with("/cadenza-bufferarena-"));
        assert_eq!(arena.size(), 64 * 1024);

        let a = arena.allocate(100).unwrap();
        let b = arena.allocate(100).unwrap();
        assert_eq!(a % 64, 0);
        assert_eq!(b % 64, 0);
        assert!(b >= a + 100);
    }

    #[test]
    fn test_exhaustion() {
        let arena = BufferArena::new(1024).unwrap();
        assert!(arena.allocate(512).is_ok());
        assert!(arena.allocate(1024).is_err());
        // A smaller allocation still fits after the failed one rolled back
        assert!(arena.allocate(256).is_ok());
    }

    #[test]
    fn test_unique_names() {
        let a = BufferArena::new(4096).unwrap();
        let b = BufferArena::new(4096).unwrap();
        assert_ne!(a.name(), b.name());
    }
}
