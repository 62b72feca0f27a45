//! Programs.
//!
//! A program is an immutable snapshot of one graph compilation: its spec,
//! its arena-backed buffers, and a little per-opcode state (oscillator
//! phases, the noise source). Buffers are allocated once, at capacity for
//! the largest supported block size, so a block-size change on the audio
//! thread only rewrites lengths and re-runs the init pass - it never
//! allocates.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use cadenza_core::{Frames, MAX_BLOCK_SIZE, Result};

use crate::arena::BufferArena;
use crate::buffers::BufferType;
use crate::host::HostState;
use crate::spec::ProgramSpec;

struct ProgramBuffer {
    buffer_type: BufferType,
    offset: usize,
    capacity: usize,
}

/// Mutable per-opcode execution state, touched only by the audio thread.
pub struct OpStates {
    pub rng: SmallRng,
    /// One phase slot per opcode (used by SINE)
    pub phases: Vec<f64>,
}

pub struct Program {
    pub version: u32,
    spec: ProgramSpec,
    arena: Arc<BufferArena>,
    buffers: Vec<ProgramBuffer>,
    block_size: AtomicUsize,
    initialized: AtomicBool,
    pub states: Mutex<OpStates>,
}

impl Program {
    /// Allocate and initialize every buffer the spec names.
    pub fn new(
        host: &HostState,
        arena: Arc<BufferArena>,
        spec: ProgramSpec,
        block_size: Frames,
        version: u32,
    ) -> Result<Self> {
        let mut buffers = Vec::with_capacity(spec.num_buffers());
        for idx in 0..spec.num_buffers() {
            let (_, buffer_type) = spec.buffer(idx);
            let capacity = buffer_type.size(MAX_BLOCK_SIZE);
            let offset = arena.allocate(capacity)?;

            // SAFETY: the offset was just allocated; nobody else touches
            // this range.
            #[allow(unsafe_code)]
            unsafe {
                buffer_type.setup(arena.ptr_at(offset))?;
            }

            buffers.push(ProgramBuffer {
                buffer_type,
                offset,
                capacity,
            });
        }

        let program = Self {
            version,
            states: Mutex::new(OpStates {
                rng: SmallRng::from_os_rng(),
                phases: vec![0.0; spec.num_ops()],
            }),
            spec,
            arena,
            buffers,
            block_size: AtomicUsize::new(block_size),
            initialized: AtomicBool::new(false),
        };
        program.clear_buffers(host)?;

        tracing::info!("created program v{version}");
        Ok(program)
    }

    pub fn spec(&self) -> &ProgramSpec {
        &self.spec
    }

    pub fn block_size(&self) -> Frames {
        self.block_size.load(Ordering::Acquire)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn set_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    /// Adopt a new block size: lengths change, storage does not.
    pub fn set_block_size(&self, host: &HostState, block_size: Frames) -> Result<()> {
        self.block_size.store(block_size, Ordering::Release);
        self.clear_buffers(host)
    }

    fn clear_buffers(&self, host: &HostState) -> Result<()> {
        let block_size = self.block_size();
        for idx in 0..self.buffers.len() {
            if self.buffers[idx].buffer_type != BufferType::PluginCond {
                // SAFETY: exclusive access per the single-audio-thread
                // discipline; the range is within this buffer's allocation.
                #[allow(unsafe_code)]
                let slice = unsafe { self.buffer_slice(idx) };
                self.buffers[idx]
                    .buffer_type
                    .clear(host, block_size, slice)?;
            }
        }
        Ok(())
    }

    pub fn num_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffer_type(&self, idx: usize) -> BufferType {
        self.buffers[idx].buffer_type
    }

    /// Current byte length of a buffer (depends on the block size).
    pub fn buffer_len(&self, idx: usize) -> usize {
        self.buffers[idx].buffer_type.size(self.block_size())
    }

    /// Offset of a buffer from the arena base - what sidecars receive.
    pub fn buffer_offset(&self, idx: usize) -> usize {
        self.buffers[idx].offset
    }

    pub fn buffer_ptr(&self, idx: usize) -> *mut u8 {
        self.arena.ptr_at(self.buffers[idx].offset)
    }

    /// Byte view of a buffer at the current block size.
    ///
    /// # Safety
    ///
    /// Only the audio thread may hold buffer views, one opcode at a time;
    /// views must not outlive the block. Distinct indices never alias.
    #[allow(unsafe_code, clippy::mut_from_ref)]
    pub unsafe fn buffer_slice(&self, idx: usize) -> &mut [u8] {
        let buffer = &self.buffers[idx];
        let len = self.buffer_len(idx).min(buffer.capacity);
        // SAFETY: the region belongs exclusively to this buffer; the arena
        // mapping outlives the program; callers uphold the aliasing rules
        // above.
        unsafe { std::slice::from_raw_parts_mut(self.arena.ptr_at(buffer.offset), len) }
    }
}

impl Drop for Program {
    fn drop(&mut self) {
        for buffer in &self.buffers {
            // SAFETY: the program is being destroyed on a control thread;
            // no opcode holds a view anymore.
            #[allow(unsafe_code)]
            unsafe {
                buffer.buffer_type.cleanup(self.arena.ptr_at(buffer.offset));
            }
        }
        tracing::info!("deleted program v{}", self.version);
    }
}

impl OpStates {
    pub fn noise_sample(&mut self) -> f32 {
        self.rng.random::<f32>().mul_add(2.0, -1.0)
    }
}
