//! LV2 sidecar host.
//!
//! The plugin's urid:map feature is backed by a [`ProxyMapper`] whose
//! static prefix is identical to the engine's table, so well-known ids
//! agree across the process boundary without coordination. URIs outside
//! the prefix are minted from a sidecar-local range; the embedding process
//! may install a different callback to resolve them centrally.

use std::path::Path;

use cadenza_core::{ProxyMapper, Result, SampleRate};
use cadenza_plugin::{Lv2Features, Lv2Plugin};

use crate::host::PluginHost;

/// First URID minted locally when no central resolver is installed. Far
/// above the engine's dynamic range so collisions are visible.
const LOCAL_URID_BASE: u32 = 1_000_000;

pub struct Lv2Host {
    plugin: Lv2Plugin,
}

impl Lv2Host {
    pub fn load(
        binary_path: &str,
        bundle_path: &str,
        uri: &str,
        sample_rate: SampleRate,
    ) -> Result<Self> {
        let mut next_urid = LOCAL_URID_BASE;
        let mapper = ProxyMapper::new(Box::new(move |uri| {
            tracing::debug!("minting local urid for {uri}");
            next_urid += 1;
            next_urid
        }));

        let features = Lv2Features::new(Box::new(mapper));
        let plugin = Lv2Plugin::load(
            Path::new(binary_path),
            Path::new(bundle_path),
            uri,
            sample_rate,
            features,
        )?;
        Ok(Self { plugin })
    }
}

impl PluginHost for Lv2Host {
    unsafe fn connect_port(&mut self, port_idx: u32, buf: *mut u8) -> Result<()> {
        // SAFETY: caller guarantees the buffer stays valid.
        #[allow(unsafe_code)]
        unsafe {
            self.plugin.connect_port(port_idx, buf.cast())
        }
    }

    fn process_block(&mut self, block_size: usize) -> Result<()> {
        self.plugin.run(block_size)
    }
}
