//! POSIX shared memory regions.
//!
//! The buffer arena and every sidecar's view of it are `shm_open` objects
//! mapped read/write into each participating process. The creating side
//! owns the name and unlinks it on drop, so an aborted engine does not
//! leak names into `/dev/shm`.

use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;

use cadenza_core::{EngineError, Result};

/// A mapped shared-memory region.
pub struct SharedMemory {
    fd: RawFd,
    ptr: NonNull<u8>,
    size: usize,
    name: String,
    owner: bool,
}

impl SharedMemory {
    /// Create a new region with exclusive-create semantics and map it
    /// read/write. Fails if the name already exists; on a partial failure
    /// the name is unlinked again so nothing is orphaned.
    #[allow(unsafe_code)]
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let c_name = CString::new(name)
            .map_err(|_| EngineError::Error(format!("invalid shared memory name '{name}'")))?;

        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                libc::S_IRUSR | libc::S_IWUSR,
            )
        };
        if fd < 0 {
            return Err(EngineError::os(format!("shm_open({name})")));
        }

        if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let err = EngineError::os(format!("ftruncate({name})"));
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(err);
        }

        match Self::map(fd, size) {
            Ok(ptr) => Ok(Self {
                fd,
                ptr,
                size,
                name: name.to_owned(),
                owner: true,
            }),
            Err(err) => {
                unsafe {
                    libc::close(fd);
                    libc::shm_unlink(c_name.as_ptr());
                }
                Err(err)
            }
        }
    }

    /// Open and map an existing region. The size is taken from the object
    /// itself.
    #[allow(unsafe_code)]
    pub fn open(name: &str) -> Result<Self> {
        let c_name = CString::new(name)
            .map_err(|_| EngineError::Error(format!("invalid shared memory name '{name}'")))?;

        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(EngineError::os(format!("shm_open({name})")));
        }

        let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
        if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } < 0 {
            let err = EngineError::os(format!("fstat({name})"));
            unsafe { libc::close(fd) };
            return Err(err);
        }
        let size = unsafe { stat.assume_init() }.st_size as usize;

        match Self::map(fd, size) {
            Ok(ptr) => Ok(Self {
                fd,
                ptr,
                size,
                name: name.to_owned(),
                owner: false,
            }),
            Err(err) => {
                unsafe { libc::close(fd) };
                Err(err)
            }
        }
    }

    #[allow(unsafe_code)]
    fn map(fd: RawFd, size: usize) -> Result<NonNull<u8>> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(EngineError::Os {
                errno: io::Error::last_os_error().raw_os_error().unwrap_or(0),
                message: "mmap failed".into(),
            });
        }
        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| EngineError::Error("mmap returned null".into()))
    }

    /// Base address of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Size of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// The shm object name (starts with '/').
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for SharedMemory {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.size);
            libc::close(self.fd);
        }

        if self.owner {
            let Ok(c_name) = CString::new(self.name.as_str()) else {
                return;
            };
            if unsafe { libc::shm_unlink(c_name.as_ptr()) } != 0 {
                tracing::warn!("failed to unlink shared memory {}", self.name);
            }
        }
    }
}

// The region is explicitly designed to be shared; synchronization is the
// caller's contract (arena write discipline, PluginCond).
#[allow(unsafe_code)]
unsafe impl Send for SharedMemory {}
#[allow(unsafe_code)]
unsafe impl Sync for SharedMemory {}
