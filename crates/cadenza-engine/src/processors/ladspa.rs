//! In-process LADSPA hosting.

use std::path::Path;
use std::sync::Arc;

use cadenza_plugin::LadspaPlugin;

use cadenza_core::{EngineError, Result};

use crate::context::BlockContext;
use crate::host::HostState;
use crate::processor::{BufferPtr, Processor, ProcessorCore, ProcessorSpec};

pub struct LadspaProcessor {
    core: ProcessorCore,
    host: Arc<HostState>,
    plugin: Option<LadspaPlugin>,
}

impl LadspaProcessor {
    pub fn new(host: Arc<HostState>) -> Self {
        Self {
            core: ProcessorCore::new("engine.processor.ladspa"),
            host,
            plugin: None,
        }
    }
}

impl Processor for LadspaProcessor {
    fn core(&self) -> &ProcessorCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ProcessorCore {
        &mut self.core
    }

    fn setup(&mut self, spec: ProcessorSpec) -> Result<()> {
        self.core.setup(spec)?;

        let library_path = self.core.string_parameter("ladspa_library_path")?;
        let label = self.core.string_parameter("ladspa_plugin_label")?;
        let plugin = LadspaPlugin::load(Path::new(&library_path), &label, self.host.sample_rate)?;

        if plugin.port_count() != self.core.spec()?.num_ports() {
            return Err(EngineError::Error(format!(
                "plugin '{label}' has {} ports, spec declares {}",
                plugin.port_count(),
                self.core.spec()?.num_ports()
            )));
        }

        self.plugin = Some(plugin);
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
            .ok_or_else(|| EngineError::Error("LADSPA plugin not loaded".into()))?;
        // SAFETY: the buffer is an arena allocation that outlives the
        // program referencing this processor.
        #[allow(unsafe_code)]
        unsafe {
            plugin.connect_port(port_idx, buf.cast::<f32>())
        }
    }

    fn process_block(&mut self, ctxt: &mut BlockContext) -> Result<()> {
        let plugin = self
            .plugin
            .as_mut()
            .ok_or_else(|| EngineError::Error("LADSPA plugin not loaded".into()))?;
        plugin.run(ctxt.block_size)
    }
}
