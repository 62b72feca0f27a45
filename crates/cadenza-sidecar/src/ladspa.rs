//! LADSPA sidecar host.

use std::path::Path;

use cadenza_core::{Result, SampleRate};
use cadenza_plugin::LadspaPlugin;

use crate::host::PluginHost;

pub struct LadspaHost {
    plugin: LadspaPlugin,
}

impl LadspaHost {
    pub fn load(library_path: &str, label: &str, sample_rate: SampleRate) -> Result<Self> {
        let plugin = LadspaPlugin::load(Path::new(library_path), label, sample_rate)?;
        Ok(Self { plugin })
    }
}

impl PluginHost for LadspaHost {
    unsafe fn connect_port(&mut self, port_idx: u32, buf: *mut u8) -> Result<()> {
        // SAFETY: caller guarantees the buffer stays valid; LADSPA port
        // data is raw f32.
        #[allow(unsafe_code)]
        unsafe {
            self.plugin.connect_port(port_idx as usize, buf.cast::<f32>())
        }
    }

    fn process_block(&mut self, block_size: usize) -> Result<()> {
        self.plugin.run(block_size)
    }
}
