//! Core types, errors, and concurrency primitives shared across the cadenza ecosystem.
//!
//! This crate provides the fundamental building blocks that all other cadenza
//! crates depend on: the engine-wide error kind, the URID table, the
//! next/current/old publication slot used for lock-free hot swaps, and the
//! real-time-safe log pump.

pub mod error;
pub mod handoff;
pub mod logpump;
pub mod urid;

pub use error::{EngineError, Result};
pub use handoff::Handoff;
pub use logpump::{LogLevel, LogPump, RtLog};
pub use urid::{DynamicMapper, KnownUrids, ProxyMapper, StaticMapper, Urid, UridMapper};

/// Sample rate in Hz
pub type SampleRate = u32;

/// Number of audio frames (samples per channel)
pub type Frames = usize;

/// Audio sample type (32-bit float throughout the engine)
pub type Sample = f32;

/// Common block sizes
pub mod block_sizes {
    use super::Frames;

    /// 64 frames per block (very low latency, ~1.3ms @ 48kHz)
    pub const BLOCK_64: Frames = 64;
    /// 128 frames per block (low latency, ~2.7ms @ 48kHz)
    pub const BLOCK_128: Frames = 128;
    /// 256 frames per block (balanced, ~5.3ms @ 48kHz)
    pub const BLOCK_256: Frames = 256;
    /// 512 frames per block (higher latency, ~10.7ms @ 48kHz)
    pub const BLOCK_512: Frames = 512;
}

/// Largest block size any backend may report. Buffers are allocated at this
/// capacity so a block-size change never allocates on the audio thread.
pub const MAX_BLOCK_SIZE: Frames = 8192;
