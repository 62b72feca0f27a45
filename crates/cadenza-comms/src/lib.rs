//! Process-to-process plumbing for the cadenza engine.
//!
//! Everything the engine and its plugin-host sidecars need to share state
//! across process boundaries lives here: POSIX shared memory, the
//! process-shared condition structure used for per-block synchronization,
//! the memory-map wire codec sent over a sidecar's control pipe, the
//! line-framed audio stream used by the IPC backend and processor, and
//! real-time scheduler elevation.

pub mod cond;
pub mod memmap;
pub mod realtime;
pub mod shm;
pub mod stream;

pub use cond::{PLUGIN_COND_MAGIC, PluginCond};
pub use memmap::{PluginMemoryMapping, PortMapping};
pub use realtime::promote_to_rt_priority;
pub use shm::SharedMemory;
pub use stream::{AudioStreamClient, AudioStreamServer, BlockData};
