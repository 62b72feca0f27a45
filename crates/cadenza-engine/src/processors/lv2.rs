//! In-process LV2 hosting.
//!
//! The plugin receives the engine's URID table as its urid:map feature, so
//! atom types in shared buffers mean the same thing on both sides.

use std::path::Path;
use std::sync::Arc;

use cadenza_plugin::{Lv2Features, Lv2Plugin};

use cadenza_core::{EngineError, Result};

use crate::context::BlockContext;
use crate::host::{HostState, SharedMapper};
use crate::processor::{BufferPtr, Processor, ProcessorCore, ProcessorSpec};

pub struct Lv2Processor {
    core: ProcessorCore,
    host: Arc<HostState>,
    plugin: Option<Lv2Plugin>,
}

impl Lv2Processor {
    pub fn new(host: Arc<HostState>) -> Self {
        Self {
            core: ProcessorCore::new("engine.processor.lv2"),
            host,
            plugin: None,
        }
    }
}

impl Processor for Lv2Processor {
    fn core(&self) -> &ProcessorCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ProcessorCore {
        &mut self.core
    }

    fn setup(&mut self, spec: ProcessorSpec) -> Result<()> {
        self.core.setup(spec)?;

        let binary_path = self.core.string_parameter("lv2_binary_path")?;
        let bundle_path = self.core.string_parameter("lv2_bundle_path")?;
        let uri = self.core.string_parameter("lv2_uri")?;

        let features = Lv2Features::new(Box::new(SharedMapper(Arc::clone(&self.host.mapper))));
        self.plugin = Some(Lv2Plugin::load(
            Path::new(&binary_path),
            Path::new(&bundle_path),
            &uri,
            self.host.sample_rate,
            features,
        )?);
        Ok(())
    }

    fn cleanup(&mut self) {
        self.plugin = None;
        self.core.cleanup();
    }

    fn connect_port(&mut self, port_idx: usize, buf: BufferPtr) -> Result<()> {
        let plugin = self
            .plugin
            .as_mut()
            .ok_or_else(|| EngineError::Error("LV2 plugin not loaded".into()))?;
        // SAFETY: the buffer is an arena allocation that outlives the
        // program referencing this processor.
        #[allow(unsafe_code)]
        unsafe {
            plugin.connect_port(port_idx as u32, buf.cast())
        }
    }

    fn process_block(&mut self, ctxt: &mut BlockContext) -> Result<()> {
        let plugin = self
            .plugin
            .as_mut()
            .ok_or_else(|| EngineError::Error("LV2 plugin not loaded".into()))?;
        plugin.run(ctxt.block_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::ParameterSpec;

    #[test]
    fn test_setup_fails_for_missing_binary() {
        let host = Arc::new(HostState::new(48_000, 64));
        let mut processor = Lv2Processor::new(host);

        let mut spec = ProcessorSpec::new();
        spec.add_parameter(ParameterSpec::String {
            name: "lv2_binary_path".into(),
            default: "/nonexistent/plugin.so".into(),
        });
        spec.add_parameter(ParameterSpec::String {
            name: "lv2_bundle_path".into(),
            default: "/nonexistent".into(),
        });
        spec.add_parameter(ParameterSpec::String {
            name: "lv2_uri".into(),
            default: "urn:example:plugin".into(),
        });
        assert!(processor.setup(spec).is_err());
    }
}
