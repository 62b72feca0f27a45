//! LV2 hosting.
//!
//! The minimal LV2 C ABI needed to drive a plugin: the descriptor entry
//! point and the urid:map host feature. The plugin database tells us which
//! binary and bundle to use and which URI to look for; everything turtle
//! stays outside the engine.

use std::ffi::{CStr, CString, c_char, c_void};
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;

use cadenza_core::{EngineError, Result, SampleRate, Urid, UridMapper};

// -- lv2core / urid ABI -----------------------------------------------------

pub type Lv2Handle = *mut c_void;

#[repr(C)]
pub struct Lv2Feature {
    pub uri: *const c_char,
    pub data: *mut c_void,
}

#[repr(C)]
pub struct Lv2Descriptor {
    pub uri: *const c_char,
    pub instantiate: Option<
        unsafe extern "C" fn(
            *const Lv2Descriptor,
            f64,
            *const c_char,
            *const *const Lv2Feature,
        ) -> Lv2Handle,
    >,
    pub connect_port: Option<unsafe extern "C" fn(Lv2Handle, u32, *mut c_void)>,
    pub activate: Option<unsafe extern "C" fn(Lv2Handle)>,
    pub run: Option<unsafe extern "C" fn(Lv2Handle, u32)>,
    pub deactivate: Option<unsafe extern "C" fn(Lv2Handle)>,
    pub cleanup: Option<unsafe extern "C" fn(Lv2Handle)>,
    pub extension_data: Option<unsafe extern "C" fn(*const c_char) -> *const c_void>,
}

#[repr(C)]
struct Lv2UridMap {
    handle: *mut c_void,
    map: unsafe extern "C" fn(*mut c_void, *const c_char) -> u32,
}

type DescriptorFn = unsafe extern "C" fn(u32) -> *const Lv2Descriptor;

const URID_MAP_URI: &[u8] = b"http://lv2plug.in/ns/ext/urid#map\0";

// ---------------------------------------------------------------------------

#[allow(unsafe_code)]
unsafe extern "C" fn urid_map_trampoline(handle: *mut c_void, uri: *const c_char) -> u32 {
    if handle.is_null() || uri.is_null() {
        return 0;
    }
    let mapper = unsafe { &*handle.cast::<Mutex<Box<dyn UridMapper>>>() };
    let uri = unsafe { CStr::from_ptr(uri) };
    uri.to_str().map_or(0, |uri| mapper.lock().map(uri))
}

/// The host feature set handed to every instantiated LV2 plugin.
///
/// Owns the urid:map feature; the backing mapper is shared with the engine
/// (or, inside a sidecar, proxies to it) so both sides agree on ids.
pub struct Lv2Features {
    mapper: Pin<Arc<Mutex<Box<dyn UridMapper>>>>,
    // Kept alive for the pointers handed to the plugin.
    _urid_map: Pin<Box<Lv2UridMap>>,
    _features: Vec<Pin<Box<Lv2Feature>>>,
    feature_array: Vec<*const Lv2Feature>,
}

// The raw pointers all point into the pinned allocations above.
#[allow(unsafe_code)]
unsafe impl Send for Lv2Features {}

impl Lv2Features {
    pub fn new(mapper: Box<dyn UridMapper>) -> Self {
        let mapper = Arc::pin(Mutex::new(mapper));

        let handle = std::ptr::from_ref::<Mutex<Box<dyn UridMapper>>>(&*mapper).cast_mut();
        let urid_map = Box::pin(Lv2UridMap {
            handle: handle.cast::<c_void>(),
            map: urid_map_trampoline,
        });

        let map_feature = Box::pin(Lv2Feature {
            uri: URID_MAP_URI.as_ptr().cast::<c_char>(),
            data: std::ptr::from_ref::<Lv2UridMap>(&*urid_map)
                .cast_mut()
                .cast::<c_void>(),
        });

        let features = vec![map_feature];
        let mut feature_array: Vec<*const Lv2Feature> = features
            .iter()
            .map(|f| std::ptr::from_ref::<Lv2Feature>(&**f))
            .collect();
        feature_array.push(std::ptr::null());

        Self {
            mapper,
            _urid_map: urid_map,
            _features: features,
            feature_array,
        }
    }

    /// Null-terminated feature array for `instantiate`.
    pub fn as_ptr(&self) -> *const *const Lv2Feature {
        self.feature_array.as_ptr()
    }

    /// Map a URI through the same table the plugin sees.
    pub fn map_uri(&self, uri: &str) -> Urid {
        self.mapper.lock().map(uri)
    }
}

/// One loaded and activated LV2 plugin instance.
pub struct Lv2Plugin {
    handle: Lv2Handle,
    descriptor: *const Lv2Descriptor,
    features: Lv2Features,
    _library: libloading::Library,
}

// Single-thread-at-a-time discipline, as for LADSPA.
#[allow(unsafe_code)]
unsafe impl Send for Lv2Plugin {}

impl Lv2Plugin {
    /// Open the plugin binary, find the descriptor for `plugin_uri`, and
    /// instantiate it with the engine's feature set.
    #[allow(unsafe_code)]
    pub fn load(
        binary_path: &Path,
        bundle_path: &Path,
        plugin_uri: &str,
        sample_rate: SampleRate,
        features: Lv2Features,
    ) -> Result<Self> {
        let library = unsafe { libloading::Library::new(binary_path) }.map_err(|err| {
            EngineError::Error(format!(
                "failed to open LV2 binary {}: {err}",
                binary_path.display()
            ))
        })?;

        let descriptor_fn: libloading::Symbol<DescriptorFn> =
            unsafe { library.get(b"lv2_descriptor\0") }.map_err(|err| {
                EngineError::Error(format!(
                    "{} is not an LV2 binary: {err}",
                    binary_path.display()
                ))
            })?;

        let mut descriptor: *const Lv2Descriptor = std::ptr::null();
        let mut idx = 0u32;
        loop {
            let desc = unsafe { descriptor_fn(idx) };
            if desc.is_null() {
                break;
            }
            let uri = unsafe { CStr::from_ptr((*desc).uri) };
            if uri.to_string_lossy() == plugin_uri {
                descriptor = desc;
                break;
            }
            idx += 1;
        }
        if descriptor.is_null() {
            return Err(EngineError::Error(format!(
                "plugin '{plugin_uri}' not found in {}",
                binary_path.display()
            )));
        }

        let instantiate = unsafe { (*descriptor).instantiate }
            .ok_or_else(|| EngineError::Error("LV2 descriptor without instantiate".into()))?;
        let bundle = CString::new(bundle_path.to_string_lossy().into_owned())
            .map_err(|_| EngineError::Error("invalid bundle path".into()))?;
        let handle = unsafe {
            instantiate(
                descriptor,
                f64::from(sample_rate),
                bundle.as_ptr(),
                features.as_ptr(),
            )
        };
        if handle.is_null() {
            return Err(EngineError::Error(format!(
                "failed to instantiate '{plugin_uri}'"
            )));
        }

        if let Some(activate) = unsafe { (*descriptor).activate } {
            unsafe { activate(handle) };
        }

        tracing::info!("loaded LV2 plugin {plugin_uri} from {}", binary_path.display());

        Ok(Self {
            handle,
            descriptor,
            features,
            _library: library,
        })
    }

    pub fn features(&self) -> &Lv2Features {
        &self.features
    }

    /// Point a port at its backing buffer.
    ///
    /// # Safety
    ///
    /// `data` must stay valid and correctly typed for this port until the
    /// port is reconnected or the plugin is dropped.
    #[allow(unsafe_code)]
    pub unsafe fn connect_port(&mut self, idx: u32, data: *mut c_void) -> Result<()> {
        let connect = unsafe { (*self.descriptor).connect_port }
            .ok_or_else(|| EngineError::Error("LV2 descriptor without connect_port".into()))?;
        unsafe { connect(self.handle, idx, data) };
        Ok(())
    }

    /// Process `sample_count` frames.
    pub fn run(&mut self, sample_count: usize) -> Result<()> {
        #[allow(unsafe_code)]
        let run = unsafe { (*self.descriptor).run }
            .ok_or_else(|| EngineError::Error("LV2 descriptor without run".into()))?;
        #[allow(unsafe_code)]
        unsafe {
            run(self.handle, sample_count as u32)
        };
        Ok(())
    }
}

impl Drop for Lv2Plugin {
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
    use cadenza_core::DynamicMapper;

    #[test]
    fn test_feature_array_is_null_terminated() {
        let features = Lv2Features::new(Box::new(DynamicMapper::new()));
        let array = features.as_ptr();
        #[allow(unsafe_code)]
        unsafe {
            assert!(!(*array).is_null());
            assert!((*array.add(1)).is_null());
        }
    }

    #[test]
    fn test_urid_feature_maps_through_engine_table() {
        let features = Lv2Features::new(Box::new(DynamicMapper::new()));
        assert_eq!(features.map_uri("http://lv2plug.in/ns/ext/midi#MidiEvent"), 1);
        assert_eq!(features.map_uri("urn:example:plugin-minted"), 1000);
    }

    #[test]
    fn test_trampoline_round_trip() {
        let features = Lv2Features::new(Box::new(DynamicMapper::new()));
        #[allow(unsafe_code)]
        unsafe {
            let feature = *features.as_ptr();
            let urid_map = &*(*feature).data.cast::<Lv2UridMap>();
            let uri = CString::new("urn:example:via-c").unwrap();
            let urid = (urid_map.map)(urid_map.handle, uri.as_ptr());
            assert_eq!(urid, 1000);
            // Mapping again yields the same id
            assert_eq!((urid_map.map)(urid_map.handle, uri.as_ptr()), 1000);
        }
    }

    #[test]
    fn test_load_nonexistent_binary() {
        let features = Lv2Features::new(Box::new(DynamicMapper::new()));
        let result = Lv2Plugin::load(
            Path::new("/nonexistent/plugin.so"),
            Path::new("/nonexistent"),
            "urn:example:plugin",
            48_000,
            features,
        );
        assert!(result.is_err());
    }
}
