//! Processor variants.

pub mod custom_script;
pub mod ipc;
pub mod ladspa;
pub mod lv2;
pub mod null;
pub mod plugin;
pub mod sample_player;
pub mod script;
pub mod track_mixer;

use std::sync::Arc;

use crate::host::HostState;
use crate::processor::Processor;

pub use self::custom_script::CustomScriptProcessor;
pub use self::ipc::IpcProcessor;
pub use self::ladspa::LadspaProcessor;
pub use self::lv2::Lv2Processor;
pub use self::null::NullProcessor;
pub use self::plugin::PluginProcessor;
pub use self::sample_player::SamplePlayerProcessor;
pub use self::script::ScriptProcessor;
pub use self::track_mixer::TrackMixerProcessor;

/// The closed set of processor variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorKind {
    Null,
    Ladspa,
    Lv2,
    Script,
    CustomScript,
    SamplePlayer,
    TrackMixer,
    Ipc,
    Plugin,
}

/// Create a processor by kind. Setup is a separate step.
pub fn create_processor(kind: ProcessorKind, host: Arc<HostState>) -> Box<dyn Processor> {
    match kind {
        ProcessorKind::Null => Box::new(NullProcessor::new()),
        ProcessorKind::Ladspa => Box::new(LadspaProcessor::new(host)),
        ProcessorKind::Lv2 => Box::new(Lv2Processor::new(host)),
        ProcessorKind::Script => Box::new(ScriptProcessor::new(host)),
        ProcessorKind::CustomScript => Box::new(CustomScriptProcessor::new(host)),
        ProcessorKind::SamplePlayer => Box::new(SamplePlayerProcessor::new(host)),
        ProcessorKind::TrackMixer => Box::new(TrackMixerProcessor::new(host)),
        ProcessorKind::Ipc => Box::new(IpcProcessor::new()),
        ProcessorKind::Plugin => Box::new(PluginProcessor::new(host)),
    }
}
