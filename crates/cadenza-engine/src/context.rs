//! Per-block execution context.
//!
//! Everything an opcode or processor may consult during one block: the
//! frozen block size, the running sample position, named input buffers and
//! out-of-band messages supplied by the backend, and the handles that must
//! not be reached through globals (arena, RT log).

use std::collections::HashMap;
use std::sync::Arc;

use cadenza_core::{Frames, LogLevel, RtLog, Urid};

use crate::arena::BufferArena;
use crate::perf::PerfStats;

/// An out-of-band message routed into FETCH_MESSAGES.
#[derive(Debug, Clone)]
pub struct AtomMessage {
    /// Routing label matched against the opcode's labelset argument
    pub label: i64,
    pub type_urid: Urid,
    pub payload: Vec<u8>,
}

pub struct BlockContext {
    pub block_size: Frames,
    pub sample_pos: u64,
    /// Named input buffers for FETCH_BUFFER, refilled by the backend.
    pub buffers: HashMap<String, Vec<u8>>,
    /// Messages for FETCH_MESSAGES.
    pub messages: Vec<AtomMessage>,
    /// Values for FETCH_PARAMETER.
    pub parameters: HashMap<String, f32>,
    /// The arena, for processors that ship offsets to a sidecar.
    pub arena: Option<Arc<BufferArena>>,
    /// RT-safe log handle; `None` in contexts that do not log.
    pub log: Option<Arc<RtLog>>,
    /// Per-block span recording, reset by the VM each block.
    pub perf: PerfStats,
}

impl BlockContext {
    pub fn new(block_size: Frames) -> Self {
        Self {
            block_size,
            sample_pos: 0,
            buffers: HashMap::new(),
            messages: Vec::new(),
            parameters: HashMap::new(),
            arena: None,
            log: None,
            perf: PerfStats::new(),
        }
    }

    /// Emit through the RT log pump, if one is attached.
    pub fn emit_log(&self, level: LogLevel, logger: &str, message: &str) {
        if let Some(log) = &self.log {
            log.log(level, logger, message);
        }
    }
}
