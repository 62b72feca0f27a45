//! The null processor: audio inputs pass through to outputs unchanged.

use cadenza_core::Result;

use crate::context::BlockContext;
use crate::processor::{
    BufferPtr, PortDirection, PortType, Processor, ProcessorCore, ProcessorSpec,
};

/// Raw port pointer that may cross threads with its processor.
pub(crate) struct PortPtr(pub(crate) BufferPtr);

// Port pointers target arena memory whose access is serialized by the
// opcode order on the single audio thread.
#[allow(unsafe_code)]
unsafe impl Send for PortPtr {}

pub struct NullProcessor {
    core: ProcessorCore,
    ports: Vec<Option<PortPtr>>,
}

impl NullProcessor {
    pub fn new() -> Self {
        Self {
            core: ProcessorCore::new("engine.processor.null"),
            ports: Vec::new(),
        }
    }
}

impl Default for NullProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for NullProcessor {
    fn core(&self) -> &ProcessorCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ProcessorCore {
        &mut self.core
    }

    fn setup(&mut self, spec: ProcessorSpec) -> Result<()> {
        self.ports = (0..spec.num_ports()).map(|_| None).collect();
        self.core.setup(spec)
    }

    fn cleanup(&mut self) {
        self.ports.clear();
        self.core.cleanup();
    }

    fn connect_port(&mut self, port_idx: usize, buf: BufferPtr) -> Result<()> {
        if port_idx >= self.ports.len() {
            return Err(cadenza_core::EngineError::Error(format!(
                "invalid port index {port_idx}"
            )));
        }
        self.ports[port_idx] = Some(PortPtr(buf));
        Ok(())
    }

    fn process_block(&mut self, ctxt: &mut BlockContext) -> Result<()> {
        let spec = self.core.spec()?;

        // Pair audio inputs with audio outputs in declaration order
        let inputs: Vec<usize> = (0..spec.num_ports())
            .filter(|&i| {
                spec.port(i).direction == PortDirection::Input
                    && spec.port(i).port_type == PortType::Audio
            })
            .collect();
        let outputs: Vec<usize> = (0..spec.num_ports())
            .filter(|&i| {
                spec.port(i).direction == PortDirection::Output
                    && spec.port(i).port_type == PortType::Audio
            })
            .collect();

        for (in_idx, out_idx) in inputs.iter().zip(&outputs) {
            if let (Some(input), Some(output)) = (&self.ports[*in_idx], &self.ports[*out_idx]) {
                // SAFETY: connected ports point at arena buffers of at
                // least block_size frames; the VM serializes access.
                #[allow(unsafe_code)]
                unsafe {
                    std::ptr::copy_nonoverlapping(input.0, output.0, ctxt.block_size * 4);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_through() {
        let mut spec = ProcessorSpec::new();
        spec.add_port("in", PortType::Audio, PortDirection::Input);
        spec.add_port("out", PortType::Audio, PortDirection::Output);

        let mut processor = NullProcessor::new();
        processor.setup(spec).unwrap();

        let mut input = vec![0.5f32; 64];
        let mut output = vec![0.0f32; 64];
        processor
            .connect_port(0, input.as_mut_ptr().cast())
            .unwrap();
        processor
            .connect_port(1, output.as_mut_ptr().cast())
            .unwrap();

        let mut ctxt = BlockContext::new(64);
        processor.process_block(&mut ctxt).unwrap();
        assert_eq!(output, vec![0.5f32; 64]);
    }

    #[test]
    fn test_invalid_port_index() {
        let mut processor = NullProcessor::new();
        processor.setup(ProcessorSpec::new()).unwrap();
        let mut data = [0u8; 4];
        assert!(processor.connect_port(3, data.as_mut_ptr()).is_err());
    }
}
