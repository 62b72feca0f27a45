//! The cadenza audio engine core.
//!
//! A dataflow graph of audio nodes is flattened, off the audio thread, into
//! a linear [`ProgramSpec`](spec::ProgramSpec): typed buffers in a shared
//! arena, processor references, and an opcode list. The audio thread runs
//! the active [`Program`](program::Program) once per block through the
//! [`Vm`](vm::Vm), swapping in newly published programs between blocks with
//! a lock-free generational handoff.
//!
//! Processors span native DSP, script-compiled instruments, in-process
//! LADSPA/LV2 plugins, and out-of-process plugins connected through a
//! sidecar sharing the buffer arena.

pub mod arena;
pub mod atom;
pub mod backend;
pub mod backends;
pub mod buffers;
pub mod context;
pub mod host;
pub mod opcodes;
pub mod perf;
pub mod processor;
pub mod processors;
pub mod program;
pub mod spec;
pub mod vm;

pub use arena::BufferArena;
pub use backend::Backend;
pub use buffers::BufferType;
pub use context::BlockContext;
pub use host::HostState;
pub use opcodes::OpCode;
pub use processor::{PortDirection, PortType, Processor, ProcessorRegistry, ProcessorSpec};
pub use program::Program;
pub use spec::ProgramSpec;
pub use vm::Vm;
