//! Per-process host state.
//!
//! One `HostState` is created at engine startup and passed explicitly to
//! everything that needs the sample rate, the URID table, or the current
//! block size. There are no global singletons; tests build their own.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use cadenza_core::{DynamicMapper, Frames, KnownUrids, SampleRate, Urid, UridMapper};

pub struct HostState {
    pub sample_rate: SampleRate,
    pub urids: KnownUrids,
    /// The engine's URID table; shared with in-process LV2 plugins.
    pub mapper: Arc<Mutex<DynamicMapper>>,
    block_size: AtomicUsize,
}

impl HostState {
    pub fn new(sample_rate: SampleRate, block_size: Frames) -> Self {
        let mut mapper = DynamicMapper::new();
        let urids = KnownUrids::resolve(&mut mapper);
        Self {
            sample_rate,
            urids,
            mapper: Arc::new(Mutex::new(mapper)),
            block_size: AtomicUsize::new(block_size),
        }
    }

    pub fn block_size(&self) -> Frames {
        self.block_size.load(Ordering::Acquire)
    }

    pub fn set_block_size(&self, block_size: Frames) {
        self.block_size.store(block_size, Ordering::Release);
    }

    pub fn map_uri(&self, uri: &str) -> Urid {
        self.mapper.lock().map(uri)
    }
}

/// `UridMapper` view over the host's shared table, for handing to plugin
/// feature sets.
pub struct SharedMapper(pub Arc<Mutex<DynamicMapper>>);

impl UridMapper for SharedMapper {
    fn map(&mut self, uri: &str) -> Urid {
        self.0.lock().map(uri)
    }

    fn unmap(&self, _urid: Urid) -> Option<&str> {
        // Cannot hand out a reference through the lock; unmap goes through
        // HostState directly where needed.
        None
    }
}
