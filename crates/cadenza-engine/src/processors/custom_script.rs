//! User-supplied orchestras with a generated port-export preamble.
//!
//! Port names become orchestra channel labels (alpha runs title-cased,
//! punctuation dropped): `in:left` exports as `gaInLeft`. The user's
//! orchestra text only has to reference those globals.

use std::fmt::Write as _;
use std::sync::Arc;

use cadenza_core::{EngineError, Result};

use crate::context::BlockContext;
use crate::host::HostState;
use crate::processor::{
    BufferPtr, PortDirection, PortType, Processor, ProcessorCore, ProcessorSpec,
};
use crate::processors::script::ScriptProcessorBase;

/// `in:left` -> `InLeft`
pub(crate) fn port_name_to_label(port_name: &str) -> String {
    let mut result = String::new();
    let mut was_alpha = false;
    for c in port_name.chars() {
        let is_alpha = c.is_ascii_alphabetic();
        if is_alpha && !was_alpha {
            result.extend(c.to_uppercase());
        } else if is_alpha {
            result.push(c);
        }
        was_alpha = is_alpha;
    }
    result
}

pub(crate) fn export_preamble(spec: &ProcessorSpec) -> Result<String> {
    let mut preamble = String::from("ksmps = 32\nnchnls = 2\n");
    for idx in 0..spec.num_ports() {
        let port = spec.port(idx);
        let mode = match port.direction {
            PortDirection::Input => 1,
            PortDirection::Output => 2,
        };
        match port.port_type {
            PortType::Audio | PortType::ARateControl => {
                let _ = writeln!(
                    preamble,
                    "ga{} chnexport \"{}\", {mode}",
                    port_name_to_label(&port.name),
                    port.name
                );
            }
            PortType::KRateControl => {
                let _ = writeln!(
                    preamble,
                    "gk{} chnexport \"{}\", {mode}",
                    port_name_to_label(&port.name),
                    port.name
                );
            }
            PortType::AtomData if port.direction == PortDirection::Input => {}
            _ => {
                return Err(EngineError::Error(format!(
                    "port {} not supported",
                    port.name
                )));
            }
        }
    }
    Ok(preamble)
}

pub struct CustomScriptProcessor {
    base: ScriptProcessorBase,
}

impl CustomScriptProcessor {
    pub fn new(host: Arc<HostState>) -> Self {
        Self {
            base: ScriptProcessorBase::new("engine.processor.custom_script", host),
        }
    }

    /// Recompile the user orchestra (control thread).
    pub fn set_code(&mut self, orchestra: &str, score: &str) -> Result<()> {
        let preamble = export_preamble(self.base.core().spec()?)?;
        self.base.set_code(&format!("{preamble}{orchestra}"), score)
    }

    pub fn reap(&self) {
        self.base.reap();
    }
}

impl Processor for CustomScriptProcessor {
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
        self.set_code(&orchestra, &score)
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
