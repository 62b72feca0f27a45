//! LADSPA hosting.
//!
//! The `ladspa.h` ABI declared in Rust, plus a loader that opens a plugin
//! library, finds a descriptor by label, and drives one instance through
//! its lifecycle. Port data is connected as raw `f32` pointers; the caller
//! owns the buffers and their block-size discipline.

use std::ffi::{CStr, c_char, c_ulong, c_void};
use std::path::Path;

use cadenza_core::{EngineError, Result, SampleRate};

// -- ladspa.h ---------------------------------------------------------------

pub type LadspaData = f32;
pub type LadspaHandle = *mut c_void;
pub type LadspaProperties = libc::c_int;
pub type LadspaPortDescriptor = libc::c_int;

pub const LADSPA_PORT_INPUT: LadspaPortDescriptor = 0x1;
pub const LADSPA_PORT_OUTPUT: LadspaPortDescriptor = 0x2;
pub const LADSPA_PORT_CONTROL: LadspaPortDescriptor = 0x4;
pub const LADSPA_PORT_AUDIO: LadspaPortDescriptor = 0x8;

#[repr(C)]
pub struct LadspaPortRangeHint {
    pub hint_descriptor: libc::c_int,
    pub lower_bound: LadspaData,
    pub upper_bound: LadspaData,
}

#[repr(C)]
pub struct LadspaDescriptor {
    pub unique_id: c_ulong,
    pub label: *const c_char,
    pub properties: LadspaProperties,
    pub name: *const c_char,
    pub maker: *const c_char,
    pub copyright: *const c_char,
    pub port_count: c_ulong,
    pub port_descriptors: *const LadspaPortDescriptor,
    pub port_names: *const *const c_char,
    pub port_range_hints: *const LadspaPortRangeHint,
    pub implementation_data: *mut c_void,
    pub instantiate:
        Option<unsafe extern "C" fn(*const LadspaDescriptor, c_ulong) -> LadspaHandle>,
    pub connect_port: Option<unsafe extern "C" fn(LadspaHandle, c_ulong, *mut LadspaData)>,
    pub activate: Option<unsafe extern "C" fn(LadspaHandle)>,
    pub run: Option<unsafe extern "C" fn(LadspaHandle, c_ulong)>,
    pub run_adding: Option<unsafe extern "C" fn(LadspaHandle, c_ulong)>,
    pub set_run_adding_gain: Option<unsafe extern "C" fn(LadspaHandle, LadspaData)>,
    pub deactivate: Option<unsafe extern "C" fn(LadspaHandle)>,
    pub cleanup: Option<unsafe extern "C" fn(LadspaHandle)>,
}

type DescriptorFn = unsafe extern "C" fn(c_ulong) -> *const LadspaDescriptor;

// ---------------------------------------------------------------------------

/// One loaded and activated LADSPA plugin instance.
pub struct LadspaPlugin {
    // Field order matters: the handle and descriptor must die before the
    // library is unloaded.
    handle: LadspaHandle,
    descriptor: *const LadspaDescriptor,
    _library: libloading::Library,
}

// The instance is only ever driven from one thread at a time; LADSPA has no
// thread affinity of its own.
#[allow(unsafe_code)]
unsafe impl Send for LadspaPlugin {}

impl LadspaPlugin {
    /// Open `library_path`, locate the descriptor with `label`, and
    /// instantiate it at `sample_rate`.
    #[allow(unsafe_code)]
    pub fn load(library_path: &Path, label: &str, sample_rate: SampleRate) -> Result<Self> {
        let library = unsafe { libloading::Library::new(library_path) }.map_err(|err| {
            EngineError::Error(format!(
                "failed to open LADSPA library {}: {err}",
                library_path.display()
            ))
        })?;

        let descriptor_fn: libloading::Symbol<DescriptorFn> =
            unsafe { library.get(b"ladspa_descriptor\0") }.map_err(|err| {
                EngineError::Error(format!(
                    "{} is not a LADSPA library: {err}",
                    library_path.display()
                ))
            })?;

        let mut descriptor: *const LadspaDescriptor = std::ptr::null();
        let mut idx: c_ulong = 0;
        loop {
            let desc = unsafe { descriptor_fn(idx) };
            if desc.is_null() {
                break;
            }
            let desc_label = unsafe { CStr::from_ptr((*desc).label) };
            if desc_label.to_string_lossy() == label {
                descriptor = desc;
                break;
            }
            idx += 1;
        }
        if descriptor.is_null() {
            return Err(EngineError::Error(format!(
                "no LADSPA plugin with label '{label}' in {}",
                library_path.display()
            )));
        }

        let instantiate = unsafe { (*descriptor).instantiate }
            .ok_or_else(|| EngineError::Error("LADSPA descriptor without instantiate".into()))?;
        let handle = unsafe { instantiate(descriptor, c_ulong::from(sample_rate)) };
        if handle.is_null() {
            return Err(EngineError::Error(format!(
                "failed to instantiate LADSPA plugin '{label}'"
            )));
        }

        if let Some(activate) = unsafe { (*descriptor).activate } {
            unsafe { activate(handle) };
        }

        tracing::info!(
            "loaded LADSPA plugin '{label}' from {}",
            library_path.display()
        );

        Ok(Self {
            handle,
            descriptor,
            _library: library,
        })
    }

    pub fn port_count(&self) -> usize {
        #[allow(unsafe_code)]
        unsafe {
            (*self.descriptor).port_count as usize
        }
    }

    #[allow(unsafe_code)]
    pub fn port_descriptor(&self, idx: usize) -> LadspaPortDescriptor {
        debug_assert!(idx < self.port_count());
        unsafe { *(*self.descriptor).port_descriptors.add(idx) }
    }

    #[allow(unsafe_code)]
    pub fn port_name(&self, idx: usize) -> String {
        debug_assert!(idx < self.port_count());
        unsafe { CStr::from_ptr(*(*self.descriptor).port_names.add(idx)) }
            .to_string_lossy()
            .into_owned()
    }

    pub fn is_input_port(&self, idx: usize) -> bool {
        self.port_descriptor(idx) & LADSPA_PORT_INPUT != 0
    }

    pub fn is_audio_port(&self, idx: usize) -> bool {
        self.port_descriptor(idx) & LADSPA_PORT_AUDIO != 0
    }

    /// Point a port at its backing buffer.
    ///
    /// # Safety
    ///
    /// `data` must stay valid (and sized for the block sizes passed to
    /// [`run`](Self::run)) until the port is reconnected or the plugin is
    /// dropped.
    #[allow(unsafe_code)]
    pub unsafe fn connect_port(&mut self, idx: usize, data: *mut f32) -> Result<()> {
        if idx >= self.port_count() {
            return Err(EngineError::Error(format!("invalid port index {idx}")));
        }
        let connect = unsafe { (*self.descriptor).connect_port }
            .ok_or_else(|| EngineError::Error("LADSPA descriptor without connect_port".into()))?;
        unsafe { connect(self.handle, idx as c_ulong, data) };
        Ok(())
    }

    /// Process `sample_count` frames.
    pub fn run(&mut self, sample_count: usize) -> Result<()> {
        #[allow(unsafe_code)]
        let run = unsafe { (*self.descriptor).run }
            .ok_or_else(|| EngineError::Error("LADSPA descriptor without run".into()))?;
        #[allow(unsafe_code)]
        unsafe {
            run(self.handle, sample_count as c_ulong)
        };
        Ok(())
    }
}

impl Drop for LadspaPlugin {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        unsafe {
            if let Some(deactivate) = (*self.descriptor).deactivate {
                deactivate(self.handle);
            }
            if let Some(cleanup) = (*self.descriptor).cleanup {
                cleanup(self.handle);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_nonexistent_library() {
        let result = LadspaPlugin::load(Path::new("/nonexistent/plugin.so"), "gain", 48_000);
        assert!(result.is_err());
    }

    #[test]
    fn test_port_descriptor_bits() {
        assert_eq!(LADSPA_PORT_INPUT | LADSPA_PORT_AUDIO, 0x9);
        assert_eq!(LADSPA_PORT_OUTPUT | LADSPA_PORT_CONTROL, 0x6);
    }
}
