//! Script-compiled processors.
//!
//! A script processor runs a compiled [`ScriptEngine`] behind a
//! next/current/old instance handoff: compilation happens on a control
//! thread and is published atomically, so the graph keeps running while
//! code is rewritten. Within a block the processor works in
//! compiled-engine-native ksmps chunks - copy inputs in under the channel
//! locks, translate incoming MIDI atoms into inline score statements,
//! perform one tick, copy outputs back.

use std::sync::Arc;

use parking_lot::Mutex;

use cadenza_core::{EngineError, Handoff, LogLevel, Result};
use cadenza_script::{ChannelDirection, ChannelRate, ScriptEngine};

use crate::atom;
use crate::buffers::ATOM_DATA_SIZE;
use crate::context::BlockContext;
use crate::host::HostState;
use crate::processor::{
    BufferPtr, PortDirection, PortSpec, PortType, Processor, ProcessorCore, ProcessorSpec,
};
use crate::processors::null::PortPtr;

/// Instrument used for events arriving on an atom port.
const EVENT_INSTRUMENT: i32 = 1;

/// One published compilation: the engine plus the port-to-channel binding.
pub struct ScriptInstance {
    engine: Mutex<ScriptEngine>,
    channel_map: Vec<Option<usize>>,
}

/// Common machinery of the script-processor family.
pub struct ScriptProcessorBase {
    core: ProcessorCore,
    host: Arc<HostState>,
    instances: Handoff<ScriptInstance>,
    ports: Vec<Option<PortPtr>>,
}

impl ScriptProcessorBase {
    pub fn new(logger: &'static str, host: Arc<HostState>) -> Self {
        Self {
            core: ProcessorCore::new(logger),
            host,
            instances: Handoff::new(),
            ports: Vec::new(),
        }
    }

    pub fn core(&self) -> &ProcessorCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut ProcessorCore {
        &mut self.core
    }

    pub fn host(&self) -> &Arc<HostState> {
        &self.host
    }

    pub fn setup(&mut self, spec: ProcessorSpec) -> Result<()> {
        self.ports = (0..spec.num_ports()).map(|_| None).collect();
        self.core.setup(spec)
    }

    pub fn cleanup(&mut self) {
        self.instances.clear();
        self.ports.clear();
        self.core.cleanup();
    }

    pub fn connect_port(&mut self, port_idx: usize, buf: BufferPtr) -> Result<()> {
        if port_idx >= self.ports.len() {
            return Err(EngineError::Error(format!("invalid port index {port_idx}")));
        }
        self.ports[port_idx] = Some(PortPtr(buf));
        Ok(())
    }

    /// Compile and publish new code (control thread).
    pub fn set_code(&mut self, orchestra: &str, score: &str) -> Result<()> {
        tracing::info!("orchestra:\n{orchestra}");
        tracing::info!("score:\n{score}");
        let engine = ScriptEngine::compile(orchestra, score, self.host.sample_rate)?;
        self.publish_engine(engine)
    }

    /// Bind ports to a compiled engine's channels and publish it as the
    /// next instance. Any unactivated previous publish is discarded here.
    pub fn publish_engine(&mut self, engine: ScriptEngine) -> Result<()> {
        let block_size = self.host.block_size();
        if block_size % engine.ksmps() != 0 {
            return Err(EngineError::InvalidOperation(format!(
                "block size {block_size} is not a multiple of ksmps {}",
                engine.ksmps()
            )));
        }

        let spec = self.core.spec()?;
        let mut channel_map = Vec::with_capacity(spec.num_ports());
        for idx in 0..spec.num_ports() {
            channel_map.push(bind_port(&engine, spec.port(idx))?);
        }

        self.instances.publish(ScriptInstance {
            engine: Mutex::new(engine),
            channel_map,
        });
        Ok(())
    }

    /// Free a retired instance (control thread).
    pub fn reap(&self) {
        drop(self.instances.reap());
    }

    fn zero_outputs(&self, block_size: usize) -> Result<()> {
        let spec = self.core.spec()?;
        for idx in 0..spec.num_ports() {
            let port = spec.port(idx);
            if port.direction != PortDirection::Output {
                continue;
            }
            let Some(ptr) = &self.ports[idx] else {
                continue;
            };
            match port.port_type {
                PortType::Audio | PortType::ARateControl => {
                    port_samples(ptr, block_size).fill(0.0);
                }
                PortType::KRateControl => port_samples(ptr, 1).fill(0.0),
                _ => {
                    return Err(EngineError::Error(format!(
                        "port {idx} has unsupported type"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn process_block(&mut self, ctxt: &mut BlockContext) -> Result<()> {
        for (idx, port) in self.ports.iter().enumerate() {
            if port.is_none() {
                return Err(EngineError::Error(format!("port {idx} not connected")));
            }
        }

        // One swap step per block; the retired instance is freed by a
        // control thread via reap()
        let Some(instance) = self.instances.activate() else {
            return self.zero_outputs(ctxt.block_size);
        };

        let mut engine = instance.engine.lock();
        let ksmps = engine.ksmps();
        if ctxt.block_size % ksmps != 0 {
            return Err(EngineError::InvalidOperation(format!(
                "block size {} is not a multiple of ksmps {ksmps}",
                ctxt.block_size
            )));
        }

        let spec = self.core.spec()?;
        let mut pos = 0;
        while pos < ctxt.block_size {
            // Copy input ports into engine channels, translating events
            for idx in 0..spec.num_ports() {
                let port = spec.port(idx);
                if port.direction != PortDirection::Input {
                    continue;
                }
                let ptr = self.ports[idx].as_ref().unwrap();
                match port.port_type {
                    PortType::Audio | PortType::ARateControl => {
                        let channel = expect_channel(&instance.channel_map, idx)?;
                        let samples = port_samples(ptr, ctxt.block_size);
                        engine.write_channel(channel, &samples[pos..pos + ksmps]);
                    }
                    PortType::KRateControl => {
                        let channel = expect_channel(&instance.channel_map, idx)?;
                        engine.write_channel(channel, &port_samples(ptr, 1)[..1]);
                    }
                    PortType::AtomData => {
                        dispatch_events(&self.host, ctxt, &mut engine, ptr, pos, ksmps)?;
                    }
                    PortType::Internal => {
                        return Err(EngineError::Error(format!(
                            "port '{}' has unsupported type",
                            port.name
                        )));
                    }
                }
            }

            engine.perform()?;

            // Copy engine channels back into output ports
            for idx in 0..spec.num_ports() {
                let port = spec.port(idx);
                if port.direction != PortDirection::Output {
                    continue;
                }
                let ptr = self.ports[idx].as_ref().unwrap();
                let channel = expect_channel(&instance.channel_map, idx)?;
                match port.port_type {
                    PortType::Audio | PortType::ARateControl => {
                        let samples = port_samples(ptr, ctxt.block_size);
                        engine.read_channel(channel, &mut samples[pos..pos + ksmps]);
                    }
                    PortType::KRateControl => {
                        engine.read_channel(channel, &mut port_samples(ptr, 1)[..1]);
                    }
                    _ => {
                        return Err(EngineError::Error(format!(
                            "port '{}' has unsupported type",
                            port.name
                        )));
                    }
                }
            }

            pos += ksmps;
        }

        debug_assert_eq!(pos, ctxt.block_size);
        Ok(())
    }
}

fn bind_port(engine: &ScriptEngine, port: &PortSpec) -> Result<Option<usize>> {
    if port.port_type == PortType::AtomData {
        if port.direction == PortDirection::Output {
            return Err(EngineError::Error(format!(
                "port '{}': event outputs are not supported",
                port.name
            )));
        }
        return Ok(None);
    }

    let channel = engine.channel_index(&port.name).ok_or_else(|| {
        EngineError::Error(format!("orchestra does not define the channel '{}'", port.name))
    })?;

    let wanted_direction = match port.direction {
        PortDirection::Input => ChannelDirection::Input,
        PortDirection::Output => ChannelDirection::Output,
    };
    if engine.channel_direction(channel) != wanted_direction {
        return Err(EngineError::Error(format!(
            "channel '{}' has the wrong direction",
            port.name
        )));
    }

    let wanted_rate = match port.port_type {
        PortType::Audio | PortType::ARateControl => ChannelRate::Audio,
        PortType::KRateControl => ChannelRate::Control,
        _ => {
            return Err(EngineError::Error(format!(
                "port '{}' has unsupported type",
                port.name
            )));
        }
    };
    if engine.channel_rate(channel) != wanted_rate {
        return Err(EngineError::Error(format!(
            "channel '{}' has the wrong rate",
            port.name
        )));
    }

    Ok(Some(channel))
}

fn expect_channel(channel_map: &[Option<usize>], idx: usize) -> Result<usize> {
    channel_map
        .get(idx)
        .copied()
        .flatten()
        .ok_or_else(|| EngineError::Error(format!("port {idx} has no bound channel")))
}

/// Turn MIDI events of the current chunk into inline score statements.
fn dispatch_events(
    host: &HostState,
    ctxt: &BlockContext,
    engine: &mut ScriptEngine,
    ptr: &PortPtr,
    pos: usize,
    ksmps: usize,
) -> Result<()> {
    let buf = port_bytes(ptr, ATOM_DATA_SIZE);
    for event in atom::read_sequence(buf, &host.urids)? {
        let frames = event.frames as usize;
        if frames < pos || frames >= pos + ksmps {
            continue;
        }
        if event.type_urid != host.urids.midi_event {
            ctxt.emit_log(
                LogLevel::Warning,
                "engine.processor.script",
                &format!("ignoring event {} in sequence", event.type_urid),
            );
            continue;
        }
        let midi = event.payload;
        if midi.len() < 3 {
            continue;
        }
        match midi[0] & 0xf0 {
            0x90 => {
                engine.read_score(&format!(
                    "i {EVENT_INSTRUMENT}.{} 0 -1 {} {}",
                    midi[1], midi[1], midi[2]
                ))?;
            }
            0x80 => {
                engine.read_score(&format!("i -{EVENT_INSTRUMENT}.{} 0 0 0", midi[1]))?;
            }
            other => {
                ctxt.emit_log(
                    LogLevel::Warning,
                    "engine.processor.script",
                    &format!("ignoring unsupported midi event {other}"),
                );
            }
        }
    }
    Ok(())
}

fn port_samples(ptr: &PortPtr, frames: usize) -> &mut [f32] {
    // SAFETY: connected ports point at arena buffers sized for the current
    // block; the VM serializes access on one audio thread.
    #[allow(unsafe_code)]
    unsafe {
        std::slice::from_raw_parts_mut(ptr.0.cast::<f32>(), frames)
    }
}

fn port_bytes(ptr: &PortPtr, len: usize) -> &[u8] {
    // SAFETY: as above.
    #[allow(unsafe_code)]
    unsafe {
        std::slice::from_raw_parts(ptr.0, len)
    }
}

/// The generic orchestra/score processor: code arrives as parameters.
pub struct ScriptProcessor {
    base: ScriptProcessorBase,
}

impl ScriptProcessor {
    pub fn new(host: Arc<HostState>) -> Self {
        Self {
            base: ScriptProcessorBase::new("engine.processor.script", host),
        }
    }

    pub fn base_mut(&mut self) -> &mut ScriptProcessorBase {
        &mut self.base
    }

    /// Recompile with new code (control thread).
    pub fn set_code(&mut self, orchestra: &str, score: &str) -> Result<()> {
        self.base.set_code(orchestra, score)
    }

    /// Free a retired instance (control thread).
    pub fn reap(&self) {
        self.base.reap();
    }
}

impl Processor for ScriptProcessor {
    fn core(&self) -> &ProcessorCore {
        self.base.core()
    }

    fn core_mut(&mut self) -> &mut ProcessorCore {
        self.base.core_mut()
    }

    fn setup(&mut self, spec: ProcessorSpec) -> Result<()> {
        self.base.setup(spec)?;
        let orchestra = self.base.core().string_parameter("orchestra")?;
        let score = self.base.core().string_parameter("score")?;
        self.base.set_code(&orchestra, &score)
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
    use crate::atom::SequenceWriter;
    use crate::processor::ParameterSpec;

    const ORCHESTRA: &str = r#"
ksmps = 16
nchnls = 2

gaOut chnexport "out" , 2
gkGain chnexport "gain", 1

instr 1
  aSig oscil p5 / 127, cpsmidinn(p4)
  gaOut = gaOut + aSig * gkGain
endin
"#;

    fn stereo_spec() -> ProcessorSpec {
        let mut spec = ProcessorSpec::new();
        spec.add_port("in:events", PortType::AtomData, PortDirection::Input);
        spec.add_port("gain", PortType::KRateControl, PortDirection::Input);
        spec.add_port("out", PortType::Audio, PortDirection::Output);
        spec.add_parameter(ParameterSpec::String {
            name: "orchestra".into(),
            default: ORCHESTRA.into(),
        });
        spec.add_parameter(ParameterSpec::String {
            name: "score".into(),
            default: String::new(),
        });
        spec
    }

    struct TestPorts {
        events: Vec<u8>,
        gain: Vec<f32>,
        out: Vec<f32>,
    }

    fn connect(processor: &mut ScriptProcessor, ports: &mut TestPorts) {
        processor
            .connect_port(0, ports.events.as_mut_ptr())
            .unwrap();
        processor
            .connect_port(1, ports.gain.as_mut_ptr().cast())
            .unwrap();
        processor.connect_port(2, ports.out.as_mut_ptr().cast()).unwrap();
    }

    fn host() -> Arc<HostState> {
        Arc::new(HostState::new(48_000, 64))
    }

    fn empty_events(host: &HostState) -> Vec<u8> {
        let mut buf = vec![0u8; ATOM_DATA_SIZE];
        SequenceWriter::new(&mut buf, &host.urids);
        buf
    }

    fn rms(samples: &[f32]) -> f32 {
        samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32
    }

    #[test]
    fn test_zero_output_before_first_compile() {
        // A base with no published instance zeroes its outputs per block
        let host = host();
        let mut base = ScriptProcessorBase::new("engine.processor.script", host);
        let mut spec = ProcessorSpec::new();
        spec.add_port("out", PortType::Audio, PortDirection::Output);
        base.setup(spec).unwrap();

        let mut out = vec![1.0f32; 64];
        base.connect_port(0, out.as_mut_ptr().cast()).unwrap();
        let mut ctxt = BlockContext::new(64);
        base.process_block(&mut ctxt).unwrap();
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_note_on_produces_audio() {
        let host = host();
        let mut processor = ScriptProcessor::new(Arc::clone(&host));
        processor.setup(stereo_spec()).unwrap();

        let mut ports = TestPorts {
            events: empty_events(&host),
            gain: vec![1.0],
            out: vec![0.0; 64],
        };
        connect(&mut processor, &mut ports);

        let mut ctxt = BlockContext::new(64);
        // Silence before any note
        processor.process_block(&mut ctxt).unwrap();
        assert_eq!(rms(&ports.out), 0.0);

        // Note-on at frame 0
        let mut writer = SequenceWriter::new(&mut ports.events, &host.urids);
        writer.append(0, host.urids.midi_event, &[0x90, 69, 127]).unwrap();
        processor.process_block(&mut ctxt).unwrap();
        assert!(rms(&ports.out) > 0.0, "note-on must produce signal");

        // Note-off silences it again (after the release is processed)
        let mut writer = SequenceWriter::new(&mut ports.events, &host.urids);
        writer.append(0, host.urids.midi_event, &[0x80, 69, 0]).unwrap();
        processor.process_block(&mut ctxt).unwrap();

        SequenceWriter::new(&mut ports.events, &host.urids);
        processor.process_block(&mut ctxt).unwrap();
        assert_eq!(rms(&ports.out), 0.0, "note-off must silence the voice");
    }

    #[test]
    fn test_control_port_scales_output() {
        let host = host();
        let mut processor = ScriptProcessor::new(Arc::clone(&host));
        processor.setup(stereo_spec()).unwrap();

        let mut ports = TestPorts {
            events: empty_events(&host),
            gain: vec![0.0],
            out: vec![0.0; 64],
        };
        connect(&mut processor, &mut ports);

        let mut writer = SequenceWriter::new(&mut ports.events, &host.urids);
        writer.append(0, host.urids.midi_event, &[0x90, 69, 127]).unwrap();

        // Gain 0: audible voice, silent output
        let mut ctxt = BlockContext::new(64);
        processor.process_block(&mut ctxt).unwrap();
        assert_eq!(rms(&ports.out), 0.0);

        SequenceWriter::new(&mut ports.events, &host.urids);
        ports.gain[0] = 1.0;
        processor.process_block(&mut ctxt).unwrap();
        assert!(rms(&ports.out) > 0.0);
    }

    #[test]
    fn test_recompile_swaps_between_blocks() {
        let host = host();
        let mut processor = ScriptProcessor::new(Arc::clone(&host));
        processor.setup(stereo_spec()).unwrap();

        let mut ports = TestPorts {
            events: empty_events(&host),
            gain: vec![1.0],
            out: vec![0.0; 64],
        };
        connect(&mut processor, &mut ports);

        let mut ctxt = BlockContext::new(64);
        processor.process_block(&mut ctxt).unwrap();

        // Publish a constant-output orchestra; next block must run it
        let constant = r#"
ksmps = 16
gaOut chnexport "out", 2
gkGain chnexport "gain", 1

instr 1
  gaOut = 0.5
endin
"#;
        processor.set_code(constant, "i 1 0 -1\n").unwrap();
        processor.process_block(&mut ctxt).unwrap();
        assert!(ports.out.iter().all(|&s| s == 0.5));

        // The prior instance retired and is reaped on the control thread
        processor.reap();
    }

    #[test]
    fn test_ksmps_must_divide_block_size() {
        let host = Arc::new(HostState::new(48_000, 24));
        let mut processor = ScriptProcessor::new(host);
        // 24 % 16 != 0
        let result = processor.setup(stereo_spec());
        assert!(matches!(result, Err(EngineError::InvalidOperation(_))));
    }
}
