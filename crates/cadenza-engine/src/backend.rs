//! Output backends.
//!
//! A backend paces the audio loop: it tells the VM the current block size,
//! frames each block with `begin_block`/`end_block`, and accepts channel
//! output from the OUTPUT opcode. Variants live in [`crate::backends`].

use cadenza_core::{Frames, Result};

use crate::context::BlockContext;

pub trait Backend: Send {
    /// Open devices/streams. Called once, before the first block.
    fn setup(&mut self) -> Result<()>;

    /// Release resources; never fails.
    fn cleanup(&mut self);

    /// Start one block: fill the context (sample position, named input
    /// buffers) and block until the downstream side is ready for a block.
    fn begin_block(&mut self, ctxt: &mut BlockContext) -> Result<()>;

    /// Finish one block: flush collected channel output downstream. Always
    /// called after a successful `begin_block`, even when the program
    /// errored in between.
    fn end_block(&mut self, ctxt: &mut BlockContext) -> Result<()>;

    /// Accept one channel of output for the current block.
    fn output(&mut self, channel: &str, samples: &[f32]) -> Result<()>;

    /// The block size currently in force. May change between blocks (the
    /// VM reads it after `begin_block`).
    fn block_size(&self) -> Frames;
}
