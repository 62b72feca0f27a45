//! The null backend: accepts any output and discards it.

use cadenza_core::{Frames, Result};

use crate::backend::Backend;
use crate::context::BlockContext;

pub struct NullBackend {
    block_size: Frames,
}

impl NullBackend {
    pub fn new(block_size: Frames) -> Self {
        Self { block_size }
    }
}

impl Backend for NullBackend {
    fn setup(&mut self) -> Result<()> {
        Ok(())
    }

    fn cleanup(&mut self) {}

    fn begin_block(&mut self, _ctxt: &mut BlockContext) -> Result<()> {
        Ok(())
    }

    fn end_block(&mut self, _ctxt: &mut BlockContext) -> Result<()> {
        Ok(())
    }

    fn output(&mut self, _channel: &str, _samples: &[f32]) -> Result<()> {
        Ok(())
    }

    fn block_size(&self) -> Frames {
        self.block_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discards_everything() {
        let mut backend = NullBackend::new(128);
        let mut ctxt = BlockContext::new(128);
        backend.setup().unwrap();
        backend.begin_block(&mut ctxt).unwrap();
        backend.output("left", &[0.5; 128]).unwrap();
        backend.output("anything", &[0.5; 128]).unwrap();
        backend.end_block(&mut ctxt).unwrap();
        assert_eq!(backend.block_size(), 128);
    }
}
