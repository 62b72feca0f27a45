//! Backend variants: local audio device, IPC, null.

pub mod cpal;
pub mod ipc;
pub mod null;

pub use self::cpal::CpalBackend;
pub use self::ipc::IpcBackend;
pub use self::null::NullBackend;
