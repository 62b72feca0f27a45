//! Native plugin ABIs.
//!
//! C-ABI declarations and safe loader wrappers for the two third-party
//! plugin formats the engine hosts: LADSPA and LV2. Both the in-process
//! processors and the out-of-process sidecar hosts go through these
//! wrappers; discovery (which library file, which label or URI, which port
//! does what) is the job of an external plugin database.

pub mod ladspa;
pub mod lv2;

pub use ladspa::LadspaPlugin;
pub use lv2::{Lv2Features, Lv2Plugin};
