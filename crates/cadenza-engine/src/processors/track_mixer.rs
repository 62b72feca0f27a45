//! The track mixer: gain / mute / constant-power pan over a stereo pair.

use std::sync::Arc;

use cadenza_core::Result;

use crate::context::BlockContext;
use crate::host::HostState;
use crate::processor::{BufferPtr, Processor, ProcessorCore, ProcessorSpec};
use crate::processors::script::ScriptProcessorBase;

/// Pan is -1..1 with 0 = center (45 degrees, constant power).
const ORCHESTRA: &str = r#"
0dbfs = 1.0
ksmps = 32
nchnls = 2

gaInLeft chnexport "in:left", 1
gaInRight chnexport "in:right", 1
gaOutLeft chnexport "out:left", 2
gaOutRight chnexport "out:right", 2
gkGain chnexport "gain", 1
gkMuted chnexport "muted", 1
gkPan chnexport "pan", 1

instr 2
  if gkMuted > 0.5 then
    gaOutLeft = 0
    gaOutRight = 0
  else
    kTheta = 3.141592653589793 * 45 * (1 - gkPan) / 180
    gaOutLeft = 1.414213562373095 * cos(kTheta) * gaInLeft * gkGain
    gaOutRight = 1.414213562373095 * sin(kTheta) * gaInRight * gkGain
  endif
endin
"#;

const SCORE: &str = "i 2 0 -1\n";

pub struct TrackMixerProcessor {
    base: ScriptProcessorBase,
}

impl TrackMixerProcessor {
    pub fn new(host: Arc<HostState>) -> Self {
        Self {
            base: ScriptProcessorBase::new("engine.processor.track_mixer", host),
        }
    }

    pub fn reap(&self) {
        self.base.reap();
    }
}

impl Processor for TrackMixerProcessor {
    fn core(&self) -> &ProcessorCore {
        self.base.core()
    }

    fn core_mut(&mut self) -> &mut ProcessorCore {
        self.base.core_mut()
    }

    fn setup(&mut self, spec: ProcessorSpec) -> Result<()> {
        self.base.setup(spec)?;
        self.base.set_code(ORCHESTRA, SCORE)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{PortDirection, PortType};

    fn mixer_spec() -> ProcessorSpec {
        let mut spec = ProcessorSpec::new();
        spec.add_port("in:left", PortType::Audio, PortDirection::Input);
        spec.add_port("in:right", PortType::Audio, PortDirection::Input);
        spec.add_port("out:left", PortType::Audio, PortDirection::Output);
        spec.add_port("out:right", PortType::Audio, PortDirection::Output);
        spec.add_port("gain", PortType::KRateControl, PortDirection::Input);
        spec.add_port("muted", PortType::KRateControl, PortDirection::Input);
        spec.add_port("pan", PortType::KRateControl, PortDirection::Input);
        spec
    }

    struct Ports {
        in_left: Vec<f32>,
        in_right: Vec<f32>,
        out_left: Vec<f32>,
        out_right: Vec<f32>,
        gain: Vec<f32>,
        muted: Vec<f32>,
        pan: Vec<f32>,
    }

    impl Ports {
        fn new() -> Self {
            Self {
                in_left: vec![0.5; 64],
                in_right: vec![0.5; 64],
                out_left: vec![0.0; 64],
                out_right: vec![0.0; 64],
                gain: vec![1.0],
                muted: vec![0.0],
                pan: vec![0.0],
            }
        }

        fn connect(&mut self, processor: &mut TrackMixerProcessor) {
            processor.connect_port(0, self.in_left.as_mut_ptr().cast()).unwrap();
            processor.connect_port(1, self.in_right.as_mut_ptr().cast()).unwrap();
            processor.connect_port(2, self.out_left.as_mut_ptr().cast()).unwrap();
            processor.connect_port(3, self.out_right.as_mut_ptr().cast()).unwrap();
            processor.connect_port(4, self.gain.as_mut_ptr().cast()).unwrap();
            processor.connect_port(5, self.muted.as_mut_ptr().cast()).unwrap();
            processor.connect_port(6, self.pan.as_mut_ptr().cast()).unwrap();
        }
    }

    fn processor() -> TrackMixerProcessor {
        let host = Arc::new(HostState::new(48_000, 64));
        let mut processor = TrackMixerProcessor::new(host);
        processor.setup(mixer_spec()).unwrap();
        processor
    }

    #[test]
    fn test_center_pan_unity_gain() {
        let mut processor = processor();
        let mut ports = Ports::new();
        ports.connect(&mut processor);

        let mut ctxt = BlockContext::new(64);
        processor.process_block(&mut ctxt).unwrap();

        // Constant-power center: sqrt(2) * cos(45 deg) = 1
        for (&l, &r) in ports.out_left.iter().zip(&ports.out_right) {
            assert!((l - 0.5).abs() < 1e-3, "left {l}");
            assert!((r - 0.5).abs() < 1e-3, "right {r}");
        }
    }

    #[test]
    fn test_mute() {
        let mut processor = processor();
        let mut ports = Ports::new();
        ports.muted[0] = 1.0;
        ports.connect(&mut processor);

        let mut ctxt = BlockContext::new(64);
        processor.process_block(&mut ctxt).unwrap();
        assert!(ports.out_left.iter().all(|&s| s == 0.0));
        assert!(ports.out_right.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_hard_pan() {
        let mut processor = processor();
        let mut ports = Ports::new();
        // pan 1: theta 0, all weight on the left channel
        ports.pan[0] = 1.0;
        ports.connect(&mut processor);

        let mut ctxt = BlockContext::new(64);
        processor.process_block(&mut ctxt).unwrap();
        let l = ports.out_left[0];
        let r = ports.out_right[0];
        assert!(l > r, "pan toward left must favor the left channel");
        assert!(r.abs() < 1e-3);
    }

    #[test]
    fn test_gain_scales_output() {
        let mut processor = processor();
        let mut ports = Ports::new();
        ports.gain[0] = 0.5;
        ports.connect(&mut processor);

        let mut ctxt = BlockContext::new(64);
        processor.process_block(&mut ctxt).unwrap();
        for &l in &ports.out_left {
            assert!((l - 0.25).abs() < 1e-3);
        }
    }
}
