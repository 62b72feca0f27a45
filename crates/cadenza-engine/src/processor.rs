//! The processor abstraction.
//!
//! A processor is a DSP unit with a stable 64-bit identity, declared ports,
//! typed parameters, and a per-block process function. Concrete variants
//! live in [`crate::processors`]; this module holds the common contract,
//! the shared bookkeeping every variant embeds, and the registry that owns
//! processors across program generations.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;

use cadenza_core::{EngineError, Result};

use crate::context::BlockContext;

/// Raw pointer to a buffer's data within the arena.
pub type BufferPtr = *mut u8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortType {
    Audio,
    ARateControl,
    KRateControl,
    AtomData,
    /// Engine-internal ports (e.g. a sidecar's condition buffer)
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

#[derive(Debug, Clone)]
pub struct PortSpec {
    pub name: String,
    pub port_type: PortType,
    pub direction: PortDirection,
}

/// Declared parameter with its default.
#[derive(Debug, Clone)]
pub enum ParameterSpec {
    String { name: String, default: String },
    Int { name: String, default: i64 },
    Float { name: String, default: f32 },
}

impl ParameterSpec {
    pub fn name(&self) -> &str {
        match self {
            Self::String { name, .. } | Self::Int { name, .. } | Self::Float { name, .. } => name,
        }
    }
}

/// Ports and parameters of one processor instance.
#[derive(Debug, Clone, Default)]
pub struct ProcessorSpec {
    ports: Vec<PortSpec>,
    parameters: Vec<ParameterSpec>,
}

impl ProcessorSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_port(&mut self, name: &str, port_type: PortType, direction: PortDirection) {
        self.ports.push(PortSpec {
            name: name.to_owned(),
            port_type,
            direction,
        });
    }

    pub fn num_ports(&self) -> usize {
        self.ports.len()
    }

    pub fn port(&self, idx: usize) -> &PortSpec {
        &self.ports[idx]
    }

    pub fn ports(&self) -> &[PortSpec] {
        &self.ports
    }

    pub fn add_parameter(&mut self, parameter: ParameterSpec) {
        self.parameters.push(parameter);
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name() == name)
    }
}

/// Bookkeeping shared by all processor variants: identity, spec, parameter
/// overrides. Variants embed one and delegate the common trait methods.
pub struct ProcessorCore {
    id: u64,
    logger: &'static str,
    spec: Option<ProcessorSpec>,
    string_parameters: HashMap<String, String>,
    int_parameters: HashMap<String, i64>,
    float_parameters: HashMap<String, f32>,
}

impl ProcessorCore {
    pub fn new(logger: &'static str) -> Self {
        Self {
            id: rand::rng().random(),
            logger,
            spec: None,
            string_parameters: HashMap::new(),
            int_parameters: HashMap::new(),
            float_parameters: HashMap::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn logger(&self) -> &'static str {
        self.logger
    }

    pub fn setup(&mut self, spec: ProcessorSpec) -> Result<()> {
        if self.spec.is_some() {
            return Err(EngineError::Error(format!(
                "processor {:016x} already set up",
                self.id
            )));
        }
        tracing::info!("setting up processor {:016x}", self.id);
        self.spec = Some(spec);
        Ok(())
    }

    pub fn cleanup(&mut self) {
        if self.spec.take().is_some() {
            tracing::info!("processor {:016x} cleaned up", self.id);
        }
    }

    pub fn spec(&self) -> Result<&ProcessorSpec> {
        self.spec
            .as_ref()
            .ok_or_else(|| EngineError::Error(format!("processor {:016x} not set up", self.id)))
    }

    pub fn string_parameter(&self, name: &str) -> Result<String> {
        if let Some(value) = self.string_parameters.get(name) {
            return Ok(value.clone());
        }
        match self.spec()?.parameter(name) {
            Some(ParameterSpec::String { default, .. }) => Ok(default.clone()),
            Some(_) => Err(EngineError::Error(format!(
                "parameter '{name}' is not of type string"
            ))),
            None => Err(EngineError::Error(format!("no parameter '{name}'"))),
        }
    }

    pub fn set_string_parameter(&mut self, name: &str, value: &str) {
        tracing::info!("set parameter {name}='{value}'");
        self.string_parameters.insert(name.to_owned(), value.to_owned());
    }

    pub fn int_parameter(&self, name: &str) -> Result<i64> {
        if let Some(&value) = self.int_parameters.get(name) {
            return Ok(value);
        }
        match self.spec()?.parameter(name) {
            Some(ParameterSpec::Int { default, .. }) => Ok(*default),
            Some(_) => Err(EngineError::Error(format!(
                "parameter '{name}' is not of type int"
            ))),
            None => Err(EngineError::Error(format!("no parameter '{name}'"))),
        }
    }

    pub fn set_int_parameter(&mut self, name: &str, value: i64) {
        self.int_parameters.insert(name.to_owned(), value);
    }

    pub fn float_parameter(&self, name: &str) -> Result<f32> {
        if let Some(&value) = self.float_parameters.get(name) {
            return Ok(value);
        }
        match self.spec()?.parameter(name) {
            Some(ParameterSpec::Float { default, .. }) => Ok(*default),
            Some(_) => Err(EngineError::Error(format!(
                "parameter '{name}' is not of type float"
            ))),
            None => Err(EngineError::Error(format!("no parameter '{name}'"))),
        }
    }

    pub fn set_float_parameter(&mut self, name: &str, value: f32) {
        self.float_parameters.insert(name.to_owned(), value);
    }
}

/// The uniform interface over heterogeneous DSP units.
pub trait Processor: Send {
    fn core(&self) -> &ProcessorCore;
    fn core_mut(&mut self) -> &mut ProcessorCore;

    fn id(&self) -> u64 {
        self.core().id()
    }

    /// Validate declarations and establish external resources.
    fn setup(&mut self, spec: ProcessorSpec) -> Result<()>;

    /// Release resources; idempotent, never fails.
    fn cleanup(&mut self);

    /// Point a port at its backing buffer. Called once per program
    /// activation per port, before the first process_block.
    fn connect_port(&mut self, port_idx: usize, buf: BufferPtr) -> Result<()>;

    /// Consume inputs, produce outputs for exactly `ctxt.block_size` frames.
    fn process_block(&mut self, ctxt: &mut BlockContext) -> Result<()>;
}

/// A registry entry. The id is duplicated here so programs can reference
/// processors without taking the lock.
pub struct RegisteredProcessor {
    id: u64,
    pub processor: Mutex<Box<dyn Processor>>,
}

impl RegisteredProcessor {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Owns processors across program generations.
///
/// Programs hold `Arc` clones of registry entries; a processor's resources
/// are released when its entry is removed *and* the last program holding it
/// has been retired - and since retired programs are only dropped on
/// control threads, teardown never happens on the audio thread.
#[derive(Default)]
pub struct ProcessorRegistry {
    entries: Mutex<HashMap<u64, Arc<RegisteredProcessor>>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, processor: Box<dyn Processor>) -> Arc<RegisteredProcessor> {
        let id = processor.id();
        let entry = Arc::new(RegisteredProcessor {
            id,
            processor: Mutex::new(processor),
        });
        let previous = self.entries.lock().insert(id, Arc::clone(&entry));
        debug_assert!(previous.is_none(), "duplicate processor id {id:016x}");
        entry
    }

    pub fn get(&self, id: u64) -> Option<Arc<RegisteredProcessor>> {
        self.entries.lock().get(&id).cloned()
    }

    /// Drop the registry's reference. Retired programs may still hold the
    /// processor; it is torn down with the last of them.
    pub fn remove(&self, id: u64) -> Result<()> {
        self.entries
            .lock()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| EngineError::Error(format!("no processor {id:016x} registered")))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::null::NullProcessor;

    fn stereo_spec() -> ProcessorSpec {
        let mut spec = ProcessorSpec::new();
        spec.add_port("in", PortType::Audio, PortDirection::Input);
        spec.add_port("out", PortType::Audio, PortDirection::Output);
        spec.add_parameter(ParameterSpec::Float {
            name: "gain".into(),
            default: 1.0,
        });
        spec
    }

    #[test]
    fn test_parameter_default_fallback() {
        let mut processor = NullProcessor::new();
        processor.setup(stereo_spec()).unwrap();

        assert_eq!(processor.core().float_parameter("gain").unwrap(), 1.0);
        processor.core_mut().set_float_parameter("gain", 0.5);
        assert_eq!(processor.core().float_parameter("gain").unwrap(), 0.5);

        assert!(processor.core().float_parameter("missing").is_err());
        assert!(processor.core().string_parameter("gain").is_err());
    }

    #[test]
    fn test_double_setup_is_rejected() {
        let mut processor = NullProcessor::new();
        processor.setup(stereo_spec()).unwrap();
        assert!(processor.setup(stereo_spec()).is_err());
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let mut processor = NullProcessor::new();
        processor.setup(stereo_spec()).unwrap();
        processor.cleanup();
        processor.cleanup();
    }

    #[test]
    fn test_registry_ownership() {
        let registry = ProcessorRegistry::new();
        let mut processor = NullProcessor::new();
        processor.setup(stereo_spec()).unwrap();
        let id = processor.id();

        let entry = registry.add(Box::new(processor));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(id).unwrap().id(), id);

        // A "program" still holds the entry after removal
        registry.remove(id).unwrap();
        assert!(registry.get(id).is_none());
        assert_eq!(entry.id(), id);

        assert!(registry.remove(id).is_err());
    }

    #[test]
    fn test_ids_are_distinct() {
        let a = NullProcessor::new();
        let b = NullProcessor::new();
        assert_ne!(a.id(), b.id());
    }
}
