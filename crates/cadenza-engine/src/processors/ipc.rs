//! The IPC processor: pulls one block per call from a peer engine over an
//! audio-stream pair, mirroring the IPC backend from the client side.

use cadenza_comms::{AudioStreamClient, BlockData};
use cadenza_core::{EngineError, LogLevel, Result};

use crate::context::BlockContext;
use crate::processor::{BufferPtr, Processor, ProcessorCore, ProcessorSpec};
use crate::processors::null::PortPtr;

const NUM_PORTS: usize = 2;

pub struct IpcProcessor {
    core: ProcessorCore,
    stream: Option<AudioStreamClient>,
    ports: [Option<PortPtr>; NUM_PORTS],
}

impl IpcProcessor {
    pub fn new() -> Self {
        Self {
            core: ProcessorCore::new("engine.processor.ipc"),
            stream: None,
            ports: [None, None],
        }
    }
}

impl Default for IpcProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for IpcProcessor {
    fn core(&self) -> &ProcessorCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ProcessorCore {
        &mut self.core
    }

    fn setup(&mut self, spec: ProcessorSpec) -> Result<()> {
        self.core.setup(spec)?;
        let address = self.core.string_parameter("ipc_address")?;
        self.stream = Some(AudioStreamClient::connect(&address)?);
        Ok(())
    }

    fn cleanup(&mut self) {
        self.stream = None;
        self.ports = [None, None];
        self.core.cleanup();
    }

    fn connect_port(&mut self, port_idx: usize, buf: BufferPtr) -> Result<()> {
        if port_idx >= NUM_PORTS {
            return Err(EngineError::Error(format!("invalid port index {port_idx}")));
        }
        self.ports[port_idx] = Some(PortPtr(buf));
        Ok(())
    }

    fn process_block(&mut self, ctxt: &mut BlockContext) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| EngineError::Error("IPC processor not connected".into()))?;

        let request = BlockData {
            block_size: ctxt.block_size as u32,
            sample_pos: ctxt.sample_pos,
            buffers: Vec::new(),
        };
        stream.send_block(&request)?;

        let response = stream.receive_block()?;
        debug_assert_eq!(response.block_size as usize, ctxt.block_size);

        let mut ports_written = [false; NUM_PORTS];
        for (id, data) in &response.buffers {
            let p = match id.as_str() {
                "output:0" => 0,
                "output:1" => 1,
                other => {
                    ctxt.emit_log(
                        LogLevel::Warning,
                        "engine.processor.ipc",
                        &format!("ignoring unexpected buffer {other}"),
                    );
                    continue;
                }
            };
            let Some(port) = &self.ports[p] else {
                continue;
            };
            let n = data.len().min(ctxt.block_size * 4);
            // SAFETY: connected ports point at arena audio buffers of
            // block_size frames; access is serialized by the VM.
            #[allow(unsafe_code)]
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), port.0, n);
            }
            ports_written[p] = true;
        }

        for (p, written) in ports_written.iter().enumerate() {
            if !written {
                ctxt.emit_log(
                    LogLevel::Warning,
                    "engine.processor.ipc",
                    &format!("expected buffer output:{p} not received"),
                );
                if let Some(port) = &self.ports[p] {
                    #[allow(unsafe_code)]
                    unsafe {
                        std::ptr::write_bytes(port.0, 0, ctxt.block_size * 4);
                    }
                }
            }
        }

        Ok(())
    }
}
