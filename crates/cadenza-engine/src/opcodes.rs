//! The opcode set.
//!
//! Each opcode declares an argspec string (`b`=buffer, `p`=processor,
//! `i`=int, `f`=float, `s`=string), an optional init function executed on
//! the program's init pass, and an optional run function executed every
//! block. Buffer and processor arguments arrive pre-resolved as indices.

use cadenza_core::{LogLevel, Result};

use crate::atom;
use crate::backend::Backend;
use crate::buffers::{self, ControlValue};
use crate::context::BlockContext;
use crate::host::HostState;
use crate::program::Program;
use crate::spec::OpArg;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum OpCode {
    Noop = 0,
    End,
    Copy,
    Clear,
    Mix,
    Mul,
    SetFloat,
    Output,
    FetchBuffer,
    FetchMessages,
    FetchParameter,
    Noise,
    Sine,
    MidiMonkey,
    ConnectPort,
    Call,
    LogRms,
    LogAtom,
}

pub const NUM_OPCODES: usize = 18;

/// Execution state threaded through one block.
pub struct ProgramState<'a> {
    pub host: &'a HostState,
    pub program: &'a Program,
    pub backend: &'a mut dyn Backend,
    /// Next instruction index
    pub p: usize,
    /// Index of the instruction currently executing
    pub current_op: usize,
    pub end: bool,
}

pub type OpFn = fn(&mut BlockContext, &mut ProgramState<'_>, &[OpArg]) -> Result<()>;

pub struct OpSpec {
    pub opcode: OpCode,
    pub name: &'static str,
    pub argspec: &'static str,
    pub init: Option<OpFn>,
    pub run: Option<OpFn>,
}

pub fn opspec(opcode: OpCode) -> &'static OpSpec {
    &OPSPECS[opcode as usize]
}

/// Byte view of a program buffer for the current block.
///
/// Sound because the VM is single-threaded: no two opcodes run at once, and
/// each view dies before the next opcode starts.
macro_rules! buffer {
    ($state:expr, $idx:expr) => {{
        #[allow(unsafe_code)]
        unsafe {
            $state.program.buffer_slice($idx)
        }
    }};
}

fn run_end(_ctxt: &mut BlockContext, state: &mut ProgramState<'_>, _args: &[OpArg]) -> Result<()> {
    state.end = true;
    Ok(())
}

fn run_copy(_ctxt: &mut BlockContext, state: &mut ProgramState<'_>, args: &[OpArg]) -> Result<()> {
    let idx1 = args[0].as_usize();
    let idx2 = args[1].as_usize();
    debug_assert_ne!(idx1, idx2);
    let src = buffer!(state, idx1);
    let dst = buffer!(state, idx2);
    debug_assert_eq!(src.len(), dst.len());
    dst.copy_from_slice(src);
    Ok(())
}

fn run_clear(_ctxt: &mut BlockContext, state: &mut ProgramState<'_>, args: &[OpArg]) -> Result<()> {
    let idx = args[0].as_usize();
    let block_size = state.program.block_size();
    state
        .program
        .buffer_type(idx)
        .clear(state.host, block_size, buffer!(state, idx))
}

fn run_mix(_ctxt: &mut BlockContext, state: &mut ProgramState<'_>, args: &[OpArg]) -> Result<()> {
    let idx1 = args[0].as_usize();
    let idx2 = args[1].as_usize();
    debug_assert_ne!(idx1, idx2);
    debug_assert_eq!(state.program.buffer_type(idx1), state.program.buffer_type(idx2));
    let block_size = state.program.block_size();
    let src = buffer!(state, idx1);
    let dst = buffer!(state, idx2);
    state
        .program
        .buffer_type(idx2)
        .mix(state.host, block_size, src, dst)
}

fn run_mul(_ctxt: &mut BlockContext, state: &mut ProgramState<'_>, args: &[OpArg]) -> Result<()> {
    let idx = args[0].as_usize();
    let factor = args[1].as_float();
    let block_size = state.program.block_size();
    state
        .program
        .buffer_type(idx)
        .mul(block_size, buffer!(state, idx), factor)
}

fn run_set_float(
    _ctxt: &mut BlockContext,
    state: &mut ProgramState<'_>,
    args: &[OpArg],
) -> Result<()> {
    let idx = args[0].as_usize();
    let value = args[1].as_float();
    let buf = buffer!(state, idx);
    let cv = buffers::read_control_value(buf);
    buffers::write_control_value(
        buf,
        ControlValue {
            value,
            generation: cv.generation + 1,
        },
    );
    Ok(())
}

fn run_output(_ctxt: &mut BlockContext, state: &mut ProgramState<'_>, args: &[OpArg]) -> Result<()> {
    let idx = args[0].as_usize();
    let channel = args[1].as_str();
    let block_size = state.program.block_size();
    let samples = buffers::samples(buffer!(state, idx), block_size);
    state.backend.output(channel, samples)
}

fn run_fetch_buffer(
    ctxt: &mut BlockContext,
    state: &mut ProgramState<'_>,
    args: &[OpArg],
) -> Result<()> {
    let in_buf_name = args[0].as_str();
    let out_idx = args[1].as_usize();
    let block_size = state.program.block_size();
    let out = buffer!(state, out_idx);

    match ctxt.buffers.get(in_buf_name) {
        Some(data) if data.len() == out.len() => {
            out.copy_from_slice(data);
            Ok(())
        }
        Some(data) => {
            ctxt.emit_log(
                LogLevel::Warning,
                "engine.opcodes",
                &format!(
                    "buffer {in_buf_name}: size mismatch ({} != {})",
                    data.len(),
                    out.len()
                ),
            );
            state
                .program
                .buffer_type(out_idx)
                .clear(state.host, block_size, out)
        }
        None => {
            ctxt.emit_log(
                LogLevel::Warning,
                "engine.opcodes",
                &format!("buffer {in_buf_name} not found in block context"),
            );
            state
                .program
                .buffer_type(out_idx)
                .clear(state.host, block_size, out)
        }
    }
}

fn run_fetch_messages(
    ctxt: &mut BlockContext,
    state: &mut ProgramState<'_>,
    args: &[OpArg],
) -> Result<()> {
    let label = args[0].as_int();
    let idx = args[1].as_usize();
    let buf = buffer!(state, idx);

    let mut writer = atom::SequenceWriter::new(buf, &state.host.urids);
    for message in &ctxt.messages {
        if message.label == label {
            writer.append(0, message.type_urid, &message.payload)?;
        }
    }
    Ok(())
}

fn run_fetch_parameter(
    ctxt: &mut BlockContext,
    state: &mut ProgramState<'_>,
    args: &[OpArg],
) -> Result<()> {
    let name = args[0].as_str();
    let idx = args[1].as_usize();
    let block_size = state.program.block_size();
    let buf = buffer!(state, idx);

    if let Some(&value) = ctxt.parameters.get(name) {
        let cv = buffers::read_control_value(buf);
        buffers::write_control_value(
            buf,
            ControlValue {
                value,
                generation: cv.generation + 1,
            },
        );
        Ok(())
    } else {
        state
            .program
            .buffer_type(idx)
            .clear(state.host, block_size, buf)
    }
}

fn run_noise(_ctxt: &mut BlockContext, state: &mut ProgramState<'_>, args: &[OpArg]) -> Result<()> {
    let idx = args[0].as_usize();
    let block_size = state.program.block_size();
    let samples = buffers::samples_mut(buffer!(state, idx), block_size);

    let mut states = state.program.states.lock();
    for sample in samples {
        *sample = states.noise_sample();
    }
    Ok(())
}

fn run_sine(_ctxt: &mut BlockContext, state: &mut ProgramState<'_>, args: &[OpArg]) -> Result<()> {
    let idx = args[0].as_usize();
    let freq = f64::from(args[1].as_float());
    let block_size = state.program.block_size();
    let samples = buffers::samples_mut(buffer!(state, idx), block_size);

    let step = std::f64::consts::TAU * freq / f64::from(state.host.sample_rate);
    let mut states = state.program.states.lock();
    let mut phase = states.phases[state.current_op];
    for sample in samples {
        *sample = phase.sin() as f32;
        phase += step;
        if phase > std::f64::consts::TAU {
            phase -= std::f64::consts::TAU;
        }
    }
    states.phases[state.current_op] = phase;
    Ok(())
}

fn run_midi_monkey(
    _ctxt: &mut BlockContext,
    state: &mut ProgramState<'_>,
    args: &[OpArg],
) -> Result<()> {
    use rand::Rng;

    let idx = args[0].as_usize();
    let prob = args[1].as_float();
    let block_size = state.program.block_size();
    let buf = buffer!(state, idx);

    let mut states = state.program.states.lock();
    let mut writer = atom::SequenceWriter::new(buf, &state.host.urids);
    if states.rng.random::<f32>() < prob {
        let frame = states.rng.random_range(0..block_size as i64);
        writer.append(frame, state.host.urids.midi_event, &[0x90, 62, 100])?;
    }
    Ok(())
}

fn init_connect_port(
    _ctxt: &mut BlockContext,
    state: &mut ProgramState<'_>,
    args: &[OpArg],
) -> Result<()> {
    let processor_idx = args[0].as_usize();
    let port_idx = args[1].as_usize();
    let buf_idx = args[2].as_usize();

    let processor = state.program.spec().processor(processor_idx);
    let ptr = state.program.buffer_ptr(buf_idx);
    processor.processor.lock().connect_port(port_idx, ptr)
}

fn run_call(ctxt: &mut BlockContext, state: &mut ProgramState<'_>, args: &[OpArg]) -> Result<()> {
    let processor_idx = args[0].as_usize();
    let processor = state.program.spec().processor(processor_idx);
    processor.processor.lock().process_block(ctxt)
}

fn run_log_rms(ctxt: &mut BlockContext, state: &mut ProgramState<'_>, args: &[OpArg]) -> Result<()> {
    let idx = args[0].as_usize();
    let block_size = state.program.block_size();
    let samples = buffers::samples(buffer!(state, idx), block_size);

    let sum: f32 = samples.iter().map(|s| s * s).sum();
    ctxt.emit_log(
        LogLevel::Info,
        "engine.opcodes",
        &format!("buffer {idx}, rms={:.3}", sum / block_size as f32),
    );
    Ok(())
}

fn run_log_atom(ctxt: &mut BlockContext, state: &mut ProgramState<'_>, args: &[OpArg]) -> Result<()> {
    let idx = args[0].as_usize();
    let buf = buffer!(state, idx);

    for event in atom::read_sequence(buf, &state.host.urids)? {
        ctxt.emit_log(
            LogLevel::Info,
            "engine.opcodes",
            &format!("buffer {idx}, event {} @{}", event.type_urid, event.frames),
        );
    }
    Ok(())
}

static OPSPECS: [OpSpec; NUM_OPCODES] = [
    // control flow
    OpSpec {
        opcode: OpCode::Noop,
        name: "NOOP",
        argspec: "",
        init: None,
        run: None,
    },
    OpSpec {
        opcode: OpCode::End,
        name: "END",
        argspec: "",
        init: None,
        run: Some(run_end),
    },
    // buffer access
    OpSpec {
        opcode: OpCode::Copy,
        name: "COPY",
        argspec: "bb",
        init: None,
        run: Some(run_copy),
    },
    OpSpec {
        opcode: OpCode::Clear,
        name: "CLEAR",
        argspec: "b",
        init: None,
        run: Some(run_clear),
    },
    OpSpec {
        opcode: OpCode::Mix,
        name: "MIX",
        argspec: "bb",
        init: None,
        run: Some(run_mix),
    },
    OpSpec {
        opcode: OpCode::Mul,
        name: "MUL",
        argspec: "bf",
        init: None,
        run: Some(run_mul),
    },
    OpSpec {
        opcode: OpCode::SetFloat,
        name: "SET_FLOAT",
        argspec: "bf",
        init: None,
        run: Some(run_set_float),
    },
    // I/O
    OpSpec {
        opcode: OpCode::Output,
        name: "OUTPUT",
        argspec: "bs",
        init: None,
        run: Some(run_output),
    },
    OpSpec {
        opcode: OpCode::FetchBuffer,
        name: "FETCH_BUFFER",
        argspec: "sb",
        init: None,
        run: Some(run_fetch_buffer),
    },
    OpSpec {
        opcode: OpCode::FetchMessages,
        name: "FETCH_MESSAGES",
        argspec: "ib",
        init: None,
        run: Some(run_fetch_messages),
    },
    OpSpec {
        opcode: OpCode::FetchParameter,
        name: "FETCH_PARAMETER",
        argspec: "sb",
        init: None,
        run: Some(run_fetch_parameter),
    },
    // generators
    OpSpec {
        opcode: OpCode::Noise,
        name: "NOISE",
        argspec: "b",
        init: None,
        run: Some(run_noise),
    },
    OpSpec {
        opcode: OpCode::Sine,
        name: "SINE",
        argspec: "bf",
        init: None,
        run: Some(run_sine),
    },
    OpSpec {
        opcode: OpCode::MidiMonkey,
        name: "MIDI_MONKEY",
        argspec: "bf",
        init: None,
        run: Some(run_midi_monkey),
    },
    // processors
    OpSpec {
        opcode: OpCode::ConnectPort,
        name: "CONNECT_PORT",
        argspec: "pib",
        init: Some(init_connect_port),
        run: None,
    },
    OpSpec {
        opcode: OpCode::Call,
        name: "CALL",
        argspec: "p",
        init: None,
        run: Some(run_call),
    },
    // diagnostics
    OpSpec {
        opcode: OpCode::LogRms,
        name: "LOG_RMS",
        argspec: "b",
        init: None,
        run: Some(run_log_rms),
    },
    OpSpec {
        opcode: OpCode::LogAtom,
        name: "LOG_ATOM",
        argspec: "b",
        init: None,
        run: Some(run_log_atom),
    },
];
