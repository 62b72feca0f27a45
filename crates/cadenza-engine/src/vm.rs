//! The VM.
//!
//! One audio thread calls [`Vm::process_block`] in a loop; control threads
//! publish new programs with [`Vm::set_spec`] and reap retired ones with
//! [`Vm::reap`]. The program handoff is lock-free; the backend slot is a
//! mutex the audio thread holds per block, uncontended unless a control
//! thread is swapping backends.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use cadenza_core::{EngineError, Handoff, LogLevel, Result};

use crate::arena::BufferArena;
use crate::backend::Backend;
use crate::context::BlockContext;
use crate::host::HostState;
use crate::opcodes::{ProgramState, opspec};
use crate::program::Program;
use crate::spec::ProgramSpec;

/// How long to idle when there is nothing to run.
const IDLE: Duration = Duration::from_millis(10);

pub struct Vm {
    host: Arc<HostState>,
    arena: Arc<BufferArena>,
    programs: Handoff<Program>,
    backend: Mutex<Option<Box<dyn Backend>>>,
    next_version: AtomicU32,
}

impl Vm {
    pub fn new(host: Arc<HostState>, arena: Arc<BufferArena>) -> Self {
        Self {
            host,
            arena,
            programs: Handoff::new(),
            backend: Mutex::new(None),
            next_version: AtomicU32::new(1),
        }
    }

    pub fn host(&self) -> &Arc<HostState> {
        &self.host
    }

    pub fn arena(&self) -> &Arc<BufferArena> {
        &self.arena
    }

    /// Build a program from `spec` and publish it (control thread). The
    /// program becomes active at the next block boundary; whatever it
    /// replaces is dropped here or via [`reap`](Self::reap).
    pub fn set_spec(&self, spec: ProgramSpec) -> Result<()> {
        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        let program = Program::new(
            &self.host,
            Arc::clone(&self.arena),
            spec,
            self.host.block_size(),
            version,
        )?;
        self.programs.publish(program);
        Ok(())
    }

    /// Drop the retired program, if any (control thread).
    pub fn reap(&self) -> bool {
        self.programs.reap().is_some()
    }

    /// Install a backend (control thread). Waits for the block in flight.
    pub fn set_backend(&self, mut backend: Box<dyn Backend>) -> Result<()> {
        backend.setup()?;
        self.host.set_block_size(backend.block_size());

        let mut slot = self.backend.lock();
        if let Some(old) = slot.as_mut() {
            old.cleanup();
        }
        *slot = Some(backend);
        Ok(())
    }

    pub fn clear_backend(&self) {
        let mut slot = self.backend.lock();
        if let Some(old) = slot.as_mut() {
            old.cleanup();
        }
        *slot = None;
    }

    /// Tear everything down (control thread, audio loop stopped).
    pub fn cleanup(&self) {
        self.programs.clear();
        self.clear_backend();
    }

    /// Run one block (audio thread).
    pub fn process_block(&self, ctxt: &mut BlockContext) -> Result<()> {
        let Some(program) = self.programs.activate() else {
            std::thread::sleep(IDLE);
            return Ok(());
        };

        let mut backend_slot = self.backend.lock();
        let Some(backend) = backend_slot.as_deref_mut() else {
            drop(backend_slot);
            std::thread::sleep(IDLE);
            return Ok(());
        };

        backend.begin_block(ctxt)?;
        let result = self.run_program(&program, backend, ctxt);
        let end_result = backend.end_block(ctxt);

        match result {
            Ok(()) => end_result,
            Err(err) => {
                if let Err(end_err) = end_result {
                    ctxt.emit_log(
                        LogLevel::Error,
                        "engine.vm",
                        &format!("ignoring error in end_block: {end_err}"),
                    );
                }
                Err(err)
            }
        }
    }

    fn run_program(
        &self,
        program: &Program,
        backend: &mut dyn Backend,
        ctxt: &mut BlockContext,
    ) -> Result<()> {
        let mut run_init = !program.is_initialized();

        let new_block_size = backend.block_size();
        if new_block_size != program.block_size() {
            ctxt.emit_log(
                LogLevel::Info,
                "engine.vm",
                &format!(
                    "block size changed {} -> {new_block_size}",
                    program.block_size()
                ),
            );
            program.set_block_size(&self.host, new_block_size)?;
            self.host.set_block_size(new_block_size);
            run_init = true;
        }

        ctxt.block_size = program.block_size();
        if ctxt.block_size == 0 {
            return Err(EngineError::Error("invalid block_size 0".into()));
        }
        ctxt.perf.reset();

        let spec = program.spec();
        let mut state = ProgramState {
            host: &self.host,
            program,
            backend,
            p: 0,
            current_op: 0,
            end: false,
        };
        while !state.end && state.p < spec.num_ops() {
            let p = state.p;
            state.p += 1;
            state.current_op = p;

            let instruction = spec.instruction(p);
            let os = opspec(instruction.opcode);
            if run_init && let Some(init) = os.init {
                init(ctxt, &mut state, &instruction.args)?;
            }
            if let Some(run) = os.run {
                let started = std::time::Instant::now();
                run(ctxt, &mut state, &instruction.args)?;
                ctxt.perf.record(os.name, started.elapsed());
            }
        }

        if run_init {
            program.set_initialized();
        }

        ctxt.sample_pos += ctxt.block_size as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::null::NullBackend;
    use crate::buffers::BufferType;
    use crate::opcodes::OpCode;
    use crate::spec::Arg;
    use cadenza_core::Frames;
    use std::collections::HashMap;

    /// What a [`CaptureBackend`] saw, shared with the test body.
    #[derive(Default)]
    struct Captured {
        channels: HashMap<String, Vec<f32>>,
        blocks: usize,
    }

    /// Backend that records everything written to it.
    struct CaptureBackend {
        block_size: Arc<Mutex<Frames>>,
        captured: Arc<Mutex<Captured>>,
    }

    impl CaptureBackend {
        fn new(block_size: Frames) -> (Self, Arc<Mutex<Frames>>, Arc<Mutex<Captured>>) {
            let block_size = Arc::new(Mutex::new(block_size));
            let captured = Arc::new(Mutex::new(Captured::default()));
            (
                Self {
                    block_size: Arc::clone(&block_size),
                    captured: Arc::clone(&captured),
                },
                block_size,
                captured,
            )
        }
    }

    impl Backend for CaptureBackend {
        fn setup(&mut self) -> Result<()> {
            Ok(())
        }
        fn cleanup(&mut self) {}
        fn begin_block(&mut self, _ctxt: &mut BlockContext) -> Result<()> {
            self.captured.lock().channels.clear();
            Ok(())
        }
        fn end_block(&mut self, _ctxt: &mut BlockContext) -> Result<()> {
            self.captured.lock().blocks += 1;
            Ok(())
        }
        fn output(&mut self, channel: &str, samples: &[f32]) -> Result<()> {
            self.captured
                .lock()
                .channels
                .insert(channel.to_owned(), samples.to_vec());
            Ok(())
        }
        fn block_size(&self) -> Frames {
            *self.block_size.lock()
        }
    }

    fn vm() -> Vm {
        let host = Arc::new(HostState::new(48_000, 64));
        let arena = Arc::new(BufferArena::new(4 * 1024 * 1024).unwrap());
        Vm::new(host, arena)
    }

    fn noise_spec() -> ProgramSpec {
        let mut spec = ProgramSpec::new();
        spec.append_buffer("b0", BufferType::FloatAudio);
        spec.append_opcode(OpCode::Noise, &[Arg::Buffer("b0")]).unwrap();
        spec.append_opcode(OpCode::Output, &[Arg::Buffer("b0"), Arg::Str("left")])
            .unwrap();
        spec
    }

    fn silence_spec() -> ProgramSpec {
        let mut spec = ProgramSpec::new();
        spec.append_buffer("b0", BufferType::FloatAudio);
        spec.append_opcode(OpCode::Clear, &[Arg::Buffer("b0")]).unwrap();
        spec.append_opcode(OpCode::Output, &[Arg::Buffer("b0"), Arg::Str("left")])
            .unwrap();
        spec
    }

    fn rms(samples: &[f32]) -> f32 {
        samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32
    }

    #[test]
    fn test_idle_without_program() {
        let vm = vm();
        let mut ctxt = BlockContext::new(64);
        // No program, no backend: the block is a bounded idle
        vm.process_block(&mut ctxt).unwrap();
    }

    #[test]
    fn test_hot_swap_noise_to_silence() {
        let vm = vm();
        let (backend, _, captured) = CaptureBackend::new(64);
        vm.set_backend(Box::new(backend)).unwrap();
        let mut ctxt = BlockContext::new(64);

        vm.set_spec(noise_spec()).unwrap();
        for _ in 0..10 {
            vm.process_block(&mut ctxt).unwrap();
            let captured = captured.lock();
            let left = captured.channels.get("left").unwrap();
            assert_eq!(left.len(), 64);
            assert!(rms(left) > 0.0, "noise program must be audible");
        }

        vm.set_spec(silence_spec()).unwrap();
        // First post-publish block picks up the new program
        vm.process_block(&mut ctxt).unwrap();
        for _ in 0..9 {
            vm.process_block(&mut ctxt).unwrap();
            let captured = captured.lock();
            let left = captured.channels.get("left").unwrap();
            assert_eq!(rms(left), 0.0, "silence program must output zeros");
        }

        // The noise program retired to a control thread
        assert!(vm.reap());
    }

    #[test]
    fn test_sine_block_size_change() {
        let vm = vm();
        let (backend, block_size, captured) = CaptureBackend::new(64);
        vm.set_backend(Box::new(backend)).unwrap();
        let mut ctxt = BlockContext::new(64);

        let mut spec = ProgramSpec::new();
        spec.append_buffer("b0", BufferType::FloatAudio);
        spec.append_opcode(OpCode::Sine, &[Arg::Buffer("b0"), Arg::Float(440.0)])
            .unwrap();
        spec.append_opcode(OpCode::Output, &[Arg::Buffer("b0"), Arg::Str("left")])
            .unwrap();
        vm.set_spec(spec).unwrap();

        let mut total_samples = 0usize;
        for _ in 0..3 {
            vm.process_block(&mut ctxt).unwrap();
            assert_eq!(ctxt.block_size, 64);
            total_samples += ctxt.block_size;
        }

        // Grow the backend's block size; the next block must produce
        // exactly 256 samples
        *block_size.lock() = 256;

        for _ in 0..2 {
            vm.process_block(&mut ctxt).unwrap();
            assert_eq!(ctxt.block_size, 256);
            total_samples += ctxt.block_size;

            let captured = captured.lock();
            let left = captured.channels.get("left").unwrap();
            assert_eq!(left.len(), 256);
            assert!(rms(left) > 0.0);
        }

        assert_eq!(total_samples, 64 * 3 + 256 * 2);
        assert_eq!(ctxt.sample_pos, (64 * 3 + 256 * 2) as u64);
    }

    #[test]
    fn test_end_opcode_stops_execution() {
        let vm = vm();
        vm.set_backend(Box::new(NullBackend::new(64))).unwrap();
        let mut ctxt = BlockContext::new(64);

        let mut spec = ProgramSpec::new();
        spec.append_buffer("b0", BufferType::FloatAudio);
        spec.append_opcode(OpCode::End, &[]).unwrap();
        // MUL on an event buffer would error if it ever ran
        spec.append_buffer("events", BufferType::AtomData);
        spec.append_opcode(OpCode::Mul, &[Arg::Buffer("events"), Arg::Float(2.0)])
            .unwrap();
        vm.set_spec(spec).unwrap();

        vm.process_block(&mut ctxt).unwrap();
    }

    #[test]
    fn test_fetch_buffer_falls_back_to_zero() {
        let vm = vm();
        let (backend, _, captured) = CaptureBackend::new(16);
        vm.set_backend(Box::new(backend)).unwrap();
        let mut ctxt = BlockContext::new(16);

        let mut spec = ProgramSpec::new();
        spec.append_buffer("b0", BufferType::FloatAudio);
        spec.append_opcode(
            OpCode::FetchBuffer,
            &[Arg::Str("input:main"), Arg::Buffer("b0")],
        )
        .unwrap();
        spec.append_opcode(OpCode::Output, &[Arg::Buffer("b0"), Arg::Str("left")])
            .unwrap();
        vm.set_spec(spec).unwrap();

        // Present: samples come through bit-identically
        let payload: Vec<u8> = (0..16).flat_map(|i| (i as f32 * 0.125).to_ne_bytes()).collect();
        ctxt.buffers.insert("input:main".into(), payload);
        vm.process_block(&mut ctxt).unwrap();
        {
            let captured = captured.lock();
            let left = captured.channels.get("left").unwrap();
            assert_eq!(left[8], 1.0);
        }

        // Absent: zeros
        ctxt.buffers.clear();
        vm.process_block(&mut ctxt).unwrap();
        let captured = captured.lock();
        let left = captured.channels.get("left").unwrap();
        assert!(left.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_stale_publish_never_reaches_audio() {
        let vm = vm();
        vm.set_backend(Box::new(NullBackend::new(64))).unwrap();
        let mut ctxt = BlockContext::new(64);

        vm.set_spec(silence_spec()).unwrap();
        vm.set_spec(noise_spec()).unwrap();
        // Only the latest publish is picked up; the stale one was dropped
        // on the control thread
        vm.process_block(&mut ctxt).unwrap();
        assert!(!vm.reap());
    }

    #[test]
    fn test_fetch_messages_and_parameter() {
        use crate::atom;
        use crate::context::AtomMessage;

        let vm = vm();
        vm.set_backend(Box::new(NullBackend::new(64))).unwrap();
        let mut ctxt = BlockContext::new(64);

        let mut spec = ProgramSpec::new();
        spec.append_buffer("events", BufferType::AtomData);
        spec.append_buffer("cv", BufferType::FloatCv);
        spec.append_opcode(
            OpCode::FetchMessages,
            &[Arg::Int(7), Arg::Buffer("events")],
        )
        .unwrap();
        spec.append_opcode(
            OpCode::FetchParameter,
            &[Arg::Str("volume"), Arg::Buffer("cv")],
        )
        .unwrap();
        vm.set_spec(spec).unwrap();

        ctxt.messages.push(AtomMessage {
            label: 7,
            type_urid: vm.host().urids.midi_event,
            payload: vec![0x90, 60, 100],
        });
        ctxt.messages.push(AtomMessage {
            label: 99,
            type_urid: vm.host().urids.midi_event,
            payload: vec![0x90, 61, 100],
        });
        ctxt.parameters.insert("volume".into(), 0.8);

        vm.process_block(&mut ctxt).unwrap();

        let program = vm.programs.current().unwrap();
        #[allow(unsafe_code)]
        let events = unsafe { program.buffer_slice(0) };
        let events: Vec<_> = atom::read_sequence(events, &vm.host().urids)
            .unwrap()
            .collect();
        // Only the matching label came through
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, &[0x90, 60, 100]);

        #[allow(unsafe_code)]
        let cv = crate::buffers::read_control_value(unsafe { program.buffer_slice(1) });
        assert_eq!(cv.value, 0.8);
        assert_eq!(cv.generation, 1);

        // Parameter gone: the buffer clears back to identity
        ctxt.parameters.clear();
        vm.process_block(&mut ctxt).unwrap();
        #[allow(unsafe_code)]
        let cv = crate::buffers::read_control_value(unsafe { program.buffer_slice(1) });
        assert_eq!(cv.value, 0.0);
    }

    #[test]
    fn test_set_float_and_mix_control_values() {
        let vm = vm();
        let (backend, _, captured) = CaptureBackend::new(4);
        vm.set_backend(Box::new(backend)).unwrap();
        let mut ctxt = BlockContext::new(4);

        // Two control values mixed, then broadcast into an audio block via
        // FETCH_PARAMETER-free plumbing is overkill here; assert through
        // LOG_RMS-free math: copy CVs into audio via SET_FLOAT semantics
        let mut spec = ProgramSpec::new();
        spec.append_buffer("cv0", BufferType::FloatCv);
        spec.append_buffer("cv1", BufferType::FloatCv);
        spec.append_opcode(OpCode::SetFloat, &[Arg::Buffer("cv0"), Arg::Float(0.25)])
            .unwrap();
        spec.append_opcode(OpCode::SetFloat, &[Arg::Buffer("cv1"), Arg::Float(0.5)])
            .unwrap();
        spec.append_opcode(OpCode::Mix, &[Arg::Buffer("cv0"), Arg::Buffer("cv1")])
            .unwrap();
        vm.set_spec(spec).unwrap();
        vm.process_block(&mut ctxt).unwrap();
        assert_eq!(captured.lock().blocks, 1);
        // One perf span per executed opcode
        assert_eq!(ctxt.perf.spans().len(), 3);
    }
}
