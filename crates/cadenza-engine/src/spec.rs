//! Program specs.
//!
//! A spec is built off-line on a control thread: buffers by name, processor
//! references, then opcodes. Appending an opcode resolves its symbolic
//! arguments - buffer names, processor references - into numeric indices
//! once, against the opcode's argspec string, so execution never touches a
//! name.

use std::collections::HashMap;
use std::sync::Arc;

use cadenza_core::{EngineError, Result};

use crate::buffers::BufferType;
use crate::opcodes::{OpCode, opspec};
use crate::processor::RegisteredProcessor;

/// A resolved opcode argument.
#[derive(Debug, Clone)]
pub enum OpArg {
    Int(i64),
    Float(f32),
    Str(String),
}

impl OpArg {
    pub fn as_int(&self) -> i64 {
        match self {
            Self::Int(value) => *value,
            _ => 0,
        }
    }

    pub fn as_usize(&self) -> usize {
        self.as_int() as usize
    }

    pub fn as_float(&self) -> f32 {
        match self {
            Self::Float(value) => *value,
            _ => 0.0,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Str(value) => value,
            _ => "",
        }
    }
}

/// An unresolved argument handed to [`ProgramSpec::append_opcode`].
pub enum Arg<'a> {
    Buffer(&'a str),
    Processor(&'a Arc<RegisteredProcessor>),
    Int(i64),
    Float(f32),
    Str(&'a str),
}

#[derive(Debug, Clone)]
pub struct Instruction {
    pub opcode: OpCode,
    pub args: Vec<OpArg>,
}

/// The off-line description a [`Program`](crate::program::Program) is built
/// from.
#[derive(Default)]
pub struct ProgramSpec {
    buffers: Vec<(String, BufferType)>,
    buffer_map: HashMap<String, usize>,
    processors: Vec<Arc<RegisteredProcessor>>,
    processor_map: HashMap<u64, usize>,
    instructions: Vec<Instruction>,
}

impl ProgramSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_buffer(&mut self, name: &str, buffer_type: BufferType) {
        self.buffer_map.insert(name.to_owned(), self.buffers.len());
        self.buffers.push((name.to_owned(), buffer_type));
    }

    pub fn buffer_idx(&self, name: &str) -> Result<usize> {
        self.buffer_map
            .get(name)
            .copied()
            .ok_or_else(|| EngineError::Error(format!("invalid buffer name '{name}'")))
    }

    pub fn num_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffer(&self, idx: usize) -> (&str, BufferType) {
        let (name, buffer_type) = &self.buffers[idx];
        (name, *buffer_type)
    }

    pub fn append_processor(&mut self, processor: Arc<RegisteredProcessor>) {
        self.processor_map
            .insert(processor.id(), self.processors.len());
        self.processors.push(processor);
    }

    pub fn processor_idx(&self, id: u64) -> Result<usize> {
        self.processor_map
            .get(&id)
            .copied()
            .ok_or_else(|| EngineError::Error(format!("invalid processor {id:016x}")))
    }

    pub fn num_processors(&self) -> usize {
        self.processors.len()
    }

    pub fn processor(&self, idx: usize) -> &Arc<RegisteredProcessor> {
        &self.processors[idx]
    }

    pub fn processors(&self) -> &[Arc<RegisteredProcessor>] {
        &self.processors
    }

    /// Append an opcode, resolving `args` against its argspec.
    pub fn append_opcode(&mut self, opcode: OpCode, args: &[Arg<'_>]) -> Result<()> {
        let os = opspec(opcode);
        if args.len() != os.argspec.len() {
            return Err(EngineError::Error(format!(
                "{} expects {} arguments, got {}",
                os.name,
                os.argspec.len(),
                args.len()
            )));
        }

        let mut resolved = Vec::with_capacity(args.len());
        for (kind, arg) in os.argspec.chars().zip(args) {
            let value = match (kind, arg) {
                ('b', Arg::Buffer(name)) => OpArg::Int(self.buffer_idx(name)? as i64),
                ('p', Arg::Processor(processor)) => {
                    OpArg::Int(self.processor_idx(processor.id())? as i64)
                }
                ('i', Arg::Int(value)) => OpArg::Int(*value),
                ('f', Arg::Float(value)) => OpArg::Float(*value),
                ('s', Arg::Str(value)) => OpArg::Str((*value).to_owned()),
                _ => {
                    return Err(EngineError::Error(format!(
                        "{}: argument does not match argspec '{}'",
                        os.name, os.argspec
                    )));
                }
            };
            resolved.push(value);
        }

        self.instructions.push(Instruction {
            opcode,
            args: resolved,
        });
        Ok(())
    }

    pub fn num_ops(&self) -> usize {
        self.instructions.len()
    }

    pub fn instruction(&self, idx: usize) -> &Instruction {
        &self.instructions[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_resolution() {
        let mut spec = ProgramSpec::new();
        spec.append_buffer("b0", BufferType::FloatAudio);
        spec.append_buffer("b1", BufferType::FloatAudio);

        spec.append_opcode(OpCode::Copy, &[Arg::Buffer("b0"), Arg::Buffer("b1")])
            .unwrap();
        assert_eq!(spec.num_ops(), 1);
        let instr = spec.instruction(0);
        assert_eq!(instr.args[0].as_usize(), 0);
        assert_eq!(instr.args[1].as_usize(), 1);
    }

    #[test]
    fn test_unknown_buffer_is_rejected() {
        let mut spec = ProgramSpec::new();
        let result = spec.append_opcode(OpCode::Clear, &[Arg::Buffer("nope")]);
        assert!(result.is_err());
    }

    #[test]
    fn test_argspec_mismatch_is_rejected() {
        let mut spec = ProgramSpec::new();
        spec.append_buffer("b0", BufferType::FloatAudio);
        // MUL is (buffer, float)
        assert!(
            spec.append_opcode(OpCode::Mul, &[Arg::Buffer("b0"), Arg::Str("x")])
                .is_err()
        );
        assert!(spec.append_opcode(OpCode::Mul, &[Arg::Buffer("b0")]).is_err());
        assert!(
            spec.append_opcode(OpCode::Mul, &[Arg::Buffer("b0"), Arg::Float(2.0)])
                .is_ok()
        );
    }
}
