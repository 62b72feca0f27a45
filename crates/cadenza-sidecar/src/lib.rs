//! The plugin-host sidecar.
//!
//! One sidecar process hosts one third-party plugin. It shares the engine's
//! buffer arena through shared memory and is driven over a line-framed
//! control pipe: `MEMORY_MAP` rebinds ports to arena offsets,
//! `PROCESS_BLOCK` runs one block and signals the shared condition when
//! done. Crashing plugins take the sidecar down, never the engine.

pub mod host;
pub mod ladspa;
pub mod lv2;

pub use host::{HostLoop, HostSpec, PluginHost, create_host};
pub use ladspa::LadspaHost;
pub use lv2::Lv2Host;
