//! The script-compiled DSP engine.
//!
//! Script processors describe their DSP as an *orchestra* (instrument
//! definitions plus exported channels) and a *score* (timed note
//! statements). This crate compiles both into a [`ScriptEngine`] that runs
//! in fixed `ksmps`-frame steps: input channels are filled by the caller,
//! [`ScriptEngine::perform`] advances all active voices by one step, and
//! output channels carry the result.
//!
//! Channels are the only shared surface. Each one sits behind its own spin
//! lock, held just long enough to copy `ksmps` frames, so a control thread
//! can poke control channels while the audio thread performs.
//!
//! The language is a deliberately small orchestra dialect:
//!
//! ```text
//! 0dbfs = 1.0
//! ksmps = 32
//! nchnls = 2
//!
//! gaIn chnexport "in", 1
//! gaOut chnexport "out", 2
//!
//! instr 1
//!   aSig oscil p5 / 127, cpsmidinn(p4)
//!   gaOut = gaOut + aSig
//! endin
//! ```
//!
//! with `i`/`e` score statements (`i 1.60 0 -1 60 100` starts a held voice
//! tagged `1.60`, `i -1.60 0 0 0` releases it).

pub mod engine;
pub mod expr;
pub mod lock;
pub mod orchestra;
pub mod score;

pub use engine::{ChannelDirection, ChannelRate, ScriptEngine};
pub use lock::SpinLock;
pub use orchestra::Orchestra;
pub use score::ScoreEvent;
