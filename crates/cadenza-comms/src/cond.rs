//! The cross-process condition structure.
//!
//! One `PluginCond` lives inside the buffer arena per hosted plugin. The
//! engine clears the flag, asks the sidecar to process a block, and waits;
//! the sidecar sets the flag and broadcasts when the block is done. Both
//! primitives are initialized with `PTHREAD_PROCESS_SHARED` so either side
//! of the shared mapping can use them.
//!
//! The magic field is the sentinel `0x34638a33` exactly when the structure
//! has been initialized; every operation validates it first.

use std::mem::MaybeUninit;
use std::time::{Duration, Instant};

use cadenza_core::{EngineError, Result};

/// Sentinel marking an initialized `PluginCond`.
pub const PLUGIN_COND_MAGIC: u32 = 0x3463_8a33;

/// Shared synchronization block. Lives in shared memory; field order is
/// part of the cross-process contract.
#[repr(C)]
pub struct PluginCond {
    pub magic: u32,
    pub mutex: libc::pthread_mutex_t,
    pub cond: libc::pthread_cond_t,
    pub set: bool,
}

fn check(rc: i32) -> Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(EngineError::Pthread(rc))
    }
}

fn validate(cond: *const PluginCond) -> Result<()> {
    #[allow(unsafe_code)]
    let magic = unsafe { (*cond).magic };
    if magic == PLUGIN_COND_MAGIC {
        Ok(())
    } else {
        Err(EngineError::Error("plugin condition not initialized".into()))
    }
}

impl PluginCond {
    /// Initialize the structure in place with process-shared attributes.
    ///
    /// # Safety
    ///
    /// `ptr` must point to at least `size_of::<PluginCond>()` writable
    /// bytes that no other thread or process is touching yet.
    #[allow(unsafe_code)]
    pub unsafe fn init_in_place(ptr: *mut Self) -> Result<()> {
        unsafe {
            (*ptr).magic = PLUGIN_COND_MAGIC;
            (*ptr).set = false;

            let mut mutexattr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
            check(libc::pthread_mutexattr_init(mutexattr.as_mut_ptr()))?;
            check(libc::pthread_mutexattr_setpshared(
                mutexattr.as_mut_ptr(),
                libc::PTHREAD_PROCESS_SHARED,
            ))?;
            check(libc::pthread_mutex_init(
                &raw mut (*ptr).mutex,
                mutexattr.as_ptr(),
            ))?;
            libc::pthread_mutexattr_destroy(mutexattr.as_mut_ptr());

            let mut condattr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
            check(libc::pthread_condattr_init(condattr.as_mut_ptr()))?;
            check(libc::pthread_condattr_setpshared(
                condattr.as_mut_ptr(),
                libc::PTHREAD_PROCESS_SHARED,
            ))?;
            check(libc::pthread_cond_init(
                &raw mut (*ptr).cond,
                condattr.as_ptr(),
            ))?;
            libc::pthread_condattr_destroy(condattr.as_mut_ptr());
        }
        Ok(())
    }

    /// Tear the primitives down. Never fails; teardown has nobody to tell.
    ///
    /// # Safety
    ///
    /// `ptr` must point to an initialized `PluginCond` nobody is waiting on.
    #[allow(unsafe_code)]
    pub unsafe fn destroy_in_place(ptr: *mut Self) {
        unsafe {
            if libc::pthread_cond_destroy(&raw mut (*ptr).cond) != 0 {
                tracing::warn!("pthread_cond_destroy failed");
            }
            if libc::pthread_mutex_destroy(&raw mut (*ptr).mutex) != 0 {
                tracing::warn!("pthread_mutex_destroy failed");
            }
            (*ptr).magic = 0;
        }
    }

    /// Set the flag and wake all waiters (the sidecar's block-done signal).
    ///
    /// # Safety
    ///
    /// `ptr` must point to an initialized `PluginCond` in live shared memory.
    #[allow(unsafe_code)]
    pub unsafe fn signal(ptr: *mut Self) -> Result<()> {
        validate(ptr)?;
        unsafe {
            check(libc::pthread_mutex_lock(&raw mut (*ptr).mutex))?;
            (*ptr).set = true;
            check(libc::pthread_mutex_unlock(&raw mut (*ptr).mutex))?;
            check(libc::pthread_cond_broadcast(&raw mut (*ptr).cond))
        }
    }

    /// Clear the flag before requesting a new block.
    ///
    /// # Safety
    ///
    /// `ptr` must point to an initialized `PluginCond` in live shared memory.
    #[allow(unsafe_code)]
    pub unsafe fn clear(ptr: *mut Self) -> Result<()> {
        validate(ptr)?;
        unsafe {
            check(libc::pthread_mutex_lock(&raw mut (*ptr).mutex))?;
            (*ptr).set = false;
            check(libc::pthread_mutex_unlock(&raw mut (*ptr).mutex))
        }
    }

    /// Block until the flag is set.
    ///
    /// # Safety
    ///
    /// `ptr` must point to an initialized `PluginCond` in live shared memory.
    #[allow(unsafe_code)]
    pub unsafe fn wait(ptr: *mut Self) -> Result<()> {
        validate(ptr)?;
        unsafe {
            check(libc::pthread_mutex_lock(&raw mut (*ptr).mutex))?;
            while !(*ptr).set {
                let rc = libc::pthread_cond_wait(&raw mut (*ptr).cond, &raw mut (*ptr).mutex);
                if rc != 0 {
                    libc::pthread_mutex_unlock(&raw mut (*ptr).mutex);
                    return Err(EngineError::Pthread(rc));
                }
            }
            check(libc::pthread_mutex_unlock(&raw mut (*ptr).mutex))
        }
    }

    /// Block until the flag is set or `deadline` passes; `Timeout` on the
    /// latter.
    ///
    /// # Safety
    ///
    /// `ptr` must point to an initialized `PluginCond` in live shared memory.
    #[allow(unsafe_code)]
    pub unsafe fn wait_deadline(ptr: *mut Self, deadline: Instant) -> Result<()> {
        validate(ptr)?;

        let timespec = deadline_to_timespec(deadline);
        unsafe {
            check(libc::pthread_mutex_lock(&raw mut (*ptr).mutex))?;
            while !(*ptr).set {
                if Instant::now() > deadline {
                    libc::pthread_mutex_unlock(&raw mut (*ptr).mutex);
                    return Err(EngineError::Timeout);
                }
                let rc = libc::pthread_cond_timedwait(
                    &raw mut (*ptr).cond,
                    &raw mut (*ptr).mutex,
                    &timespec,
                );
                if rc != 0 && rc != libc::ETIMEDOUT {
                    libc::pthread_mutex_unlock(&raw mut (*ptr).mutex);
                    return Err(EngineError::Pthread(rc));
                }
            }
            check(libc::pthread_mutex_unlock(&raw mut (*ptr).mutex))
        }
    }
}

/// `pthread_cond_timedwait` takes an absolute CLOCK_REALTIME timespec.
fn deadline_to_timespec(deadline: Instant) -> libc::timespec {
    let from_now = deadline.saturating_duration_since(Instant::now());
    let wall = std::time::SystemTime::now() + from_now;
    let since_epoch = wall
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    libc::timespec {
        tv_sec: since_epoch.as_secs() as libc::time_t,
        tv_nsec: libc::c_long::from(since_epoch.subsec_nanos()),
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    struct CondBox(*mut PluginCond);
    unsafe impl Send for CondBox {}
    unsafe impl Sync for CondBox {}

    fn alloc_cond() -> (Box<MaybeUninit<PluginCond>>, *mut PluginCond) {
        let mut storage = Box::new(MaybeUninit::<PluginCond>::uninit());
        let ptr = storage.as_mut_ptr();
        unsafe { PluginCond::init_in_place(ptr) }.expect("init failed");
        (storage, ptr)
    }

    #[test]
    fn test_magic_after_init() {
        let (_storage, ptr) = alloc_cond();
        assert_eq!(unsafe { (*ptr).magic }, PLUGIN_COND_MAGIC);
        assert!(!unsafe { (*ptr).set });
        unsafe { PluginCond::destroy_in_place(ptr) };
    }

    #[test]
    fn test_uninitialized_is_rejected() {
        let mut storage = Box::new(MaybeUninit::<PluginCond>::zeroed());
        let ptr = storage.as_mut_ptr();
        assert!(matches!(
            unsafe { PluginCond::signal(ptr) },
            Err(EngineError::Error(_))
        ));
    }

    #[test]
    fn test_signal_wakes_waiter_and_is_reusable() {
        let (_storage, ptr) = alloc_cond();
        let shared = Arc::new(CondBox(ptr));

        for _ in 0..2 {
            let signaller = {
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(5));
                    unsafe { PluginCond::signal(shared.0) }.unwrap();
                })
            };

            let start = Instant::now();
            unsafe { PluginCond::wait_deadline(ptr, Instant::now() + Duration::from_secs(1)) }
                .expect("wait failed");
            assert!(start.elapsed() < Duration::from_millis(100));
            signaller.join().unwrap();

            // Clearing the flag rearms the condition without reinitializing
            unsafe { PluginCond::clear(ptr) }.unwrap();
            assert!(!unsafe { (*ptr).set });
        }

        unsafe { PluginCond::destroy_in_place(ptr) };
    }

    #[test]
    fn test_wait_deadline_times_out() {
        let (_storage, ptr) = alloc_cond();
        let start = Instant::now();
        let result =
            unsafe { PluginCond::wait_deadline(ptr, Instant::now() + Duration::from_millis(50)) };
        assert!(matches!(result, Err(EngineError::Timeout)));
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(start.elapsed() < Duration::from_secs(1));
        unsafe { PluginCond::destroy_in_place(ptr) };
    }
}
