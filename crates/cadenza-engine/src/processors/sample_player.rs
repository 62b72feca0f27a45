//! The sample player: a script processor whose orchestra plays a WAV file
//! loaded into a function table, one voice per note-on.

use std::path::Path;
use std::sync::Arc;

use cadenza_core::{EngineError, Result};
use cadenza_script::ScriptEngine;

use crate::context::BlockContext;
use crate::host::HostState;
use crate::processor::{BufferPtr, Processor, ProcessorCore, ProcessorSpec};
use crate::processors::script::ScriptProcessorBase;

// The sample plays untransposed at C4 (261.62558 Hz).
const ORCHESTRA: &str = r#"
0dbfs = 1.0
ksmps = 32

gaOut chnexport "out", 2

instr 1
  aSig sample 1, p5 / 127, cpsmidinn(p4) / 261.62558
  gaOut = gaOut + aSig
endin
"#;

pub struct SamplePlayerProcessor {
    base: ScriptProcessorBase,
}

impl SamplePlayerProcessor {
    pub fn new(host: Arc<HostState>) -> Self {
        Self {
            base: ScriptProcessorBase::new("engine.processor.sample_player", host),
        }
    }

    pub fn reap(&self) {
        self.base.reap();
    }

    fn load_sample(path: &Path) -> Result<Vec<f32>> {
        let mut reader = hound::WavReader::open(path)
            .map_err(|err| EngineError::Error(format!("failed to open {}: {err}", path.display())))?;
        let spec = reader.spec();

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<std::result::Result<_, _>>()
                .map_err(|err| EngineError::Error(format!("failed to read samples: {err}")))?,
            hound::SampleFormat::Int => {
                let scale = 1.0f32 / (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|s| s as f32 * scale))
                    .collect::<std::result::Result<_, _>>()
                    .map_err(|err| EngineError::Error(format!("failed to read samples: {err}")))?
            }
        };

        // Downmix to mono
        let channels = spec.channels.max(1) as usize;
        let data = interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect();
        Ok(data)
    }
}

impl Processor for SamplePlayerProcessor {
    fn core(&self) -> &ProcessorCore {
        self.base.core()
    }

    fn core_mut(&mut self) -> &mut ProcessorCore {
        self.base.core_mut()
    }

    fn setup(&mut self, spec: ProcessorSpec) -> Result<()> {
        self.base.setup(spec)?;

        let sample_path = self.base.core().string_parameter("sample_path")?;
        let data = Self::load_sample(Path::new(&sample_path))?;
        tracing::info!("loaded sample {sample_path} ({} frames)", data.len());

        let mut engine = ScriptEngine::compile(ORCHESTRA, "", self.base.host().sample_rate)?;
        engine.set_table(1, data);
        self.base.publish_engine(engine)
    }

    fn cleanup(&mut self) {
        self.base.cleanup();
    }

    fn connect_port(&mut self, port_idx: usize, buf: BufferPtr) -> Result<()> {
        self.base.connect_port(port_idx, buf)
    }

    fn process_block(&mut self, ctxt: &mut BlockContext) -> Result<()> {
        self.base.process_block(ctxt)
    }
}
