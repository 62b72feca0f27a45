//! Out-of-process plugin driving.
//!
//! The plugin itself runs in a sidecar process sharing the buffer arena.
//! Per block, from the audio thread: resend the memory map if ports moved,
//! clear the shared condition, write `PROCESS_BLOCK` down the control pipe,
//! and wait on the condition with a hard deadline. Pipe writes poll for
//! writability in bounded slices against the same deadline, so the audio
//! thread can never hang on a wedged sidecar.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cadenza_comms::{PluginCond, PluginMemoryMapping, PortMapping};
use cadenza_core::{EngineError, Result};

use crate::context::BlockContext;
use crate::host::HostState;
use crate::processor::{
    BufferPtr, PortDirection, PortType, Processor, ProcessorCore, ProcessorSpec,
};
use crate::processors::null::PortPtr;

/// Hard per-block deadline for the whole sidecar transaction.
const DEFAULT_DEADLINE: Duration = Duration::from_secs(2);

/// Name of the internal port carrying the shared condition.
pub const COND_PORT_NAME: &str = "<internal cond>";

pub struct PluginProcessor {
    core: ProcessorCore,
    #[allow(dead_code)]
    host: Arc<HostState>,
    pipe: RawFd,
    update_memmap: bool,
    deadline: Duration,
    ports: Vec<Option<PortPtr>>,
}

impl PluginProcessor {
    pub fn new(host: Arc<HostState>) -> Self {
        Self {
            core: ProcessorCore::new("engine.processor.plugin"),
            host,
            pipe: -1,
            update_memmap: true,
            deadline: DEFAULT_DEADLINE,
            ports: Vec::new(),
        }
    }

    /// Override the per-block deadline (tests).
    pub fn set_deadline(&mut self, deadline: Duration) {
        self.deadline = deadline;
    }

    /// Connect to a sidecar's control pipe.
    #[allow(unsafe_code)]
    pub fn pipe_open(&mut self, path: &str) -> Result<()> {
        debug_assert!(self.pipe < 0);
        tracing::info!("connecting to {path}");

        let c_path = CString::new(path)
            .map_err(|_| EngineError::Error(format!("invalid pipe path '{path}'")))?;
        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_WRONLY | libc::O_NONBLOCK) };
        if fd < 0 {
            return Err(EngineError::os(format!("open({path})")));
        }
        self.pipe = fd;
        self.update_memmap = true;
        Ok(())
    }

    /// Close the control pipe; the sidecar sees POLLHUP.
    #[allow(unsafe_code)]
    pub fn pipe_close(&mut self) {
        if self.pipe >= 0 {
            unsafe { libc::close(self.pipe) };
            self.pipe = -1;
        }
    }

    #[allow(unsafe_code)]
    fn pipe_write(&self, mut data: &[u8], deadline: Instant) -> Result<()> {
        while !data.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let msec = remaining.as_millis() as i32;
            if msec <= 0 {
                return Err(EngineError::Timeout);
            }

            let mut fds = libc::pollfd {
                fd: self.pipe,
                events: libc::POLLOUT,
                revents: 0,
            };
            let rc = unsafe { libc::poll(&mut fds, 1, msec.min(500)) };
            if rc < 0 {
                return Err(EngineError::os("poll on plugin pipe"));
            }

            if fds.revents & libc::POLLOUT != 0 {
                let written =
                    unsafe { libc::write(self.pipe, data.as_ptr().cast(), data.len()) };
                if written < 0 {
                    let err = std::io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EPIPE) {
                        return Err(EngineError::ConnectionClosed);
                    }
                    if err.raw_os_error() != Some(libc::EAGAIN) {
                        return Err(EngineError::os("write to plugin pipe"));
                    }
                } else {
                    data = &data[written as usize..];
                }
            } else if fds.revents & libc::POLLHUP != 0 {
                return Err(EngineError::ConnectionClosed);
            }
        }
        Ok(())
    }

    fn send_memory_map(&self, ctxt: &BlockContext, deadline: Instant) -> Result<()> {
        let arena = ctxt
            .arena
            .as_ref()
            .ok_or_else(|| EngineError::Error("no buffer arena in block context".into()))?;
        tracing::debug!("sending plugin memory mapping");

        let base = arena.base() as usize;
        let size = arena.size();
        let mut port_mappings = Vec::with_capacity(self.ports.len());
        for (idx, port) in self.ports.iter().enumerate() {
            let port = port
                .as_ref()
                .ok_or_else(|| EngineError::Error(format!("port {idx} not connected")))?;
            let address = port.0 as usize;
            debug_assert!(address >= base && address < base + size);
            port_mappings.push(PortMapping {
                port_index: idx as u32,
                offset: (address - base) as u64,
            });
        }

        let cond_offset = port_mappings
            .last()
            .map(|p| p.offset)
            .ok_or_else(|| EngineError::Error("plugin processor has no ports".into()))?;
        let mapping = PluginMemoryMapping {
            shmem_path: arena.name().to_owned(),
            cond_offset,
            block_size: ctxt.block_size as u32,
            num_buffers: self.ports.len() as u32,
        };
        let payload = mapping.encode(&port_mappings);

        self.pipe_write(format!("MEMORY_MAP\n{}\n", payload.len()).as_bytes(), deadline)?;
        self.pipe_write(&payload, deadline)
    }

    fn clear_outputs(&self, block_size: usize) -> Result<()> {
        let spec = self.core.spec()?;
        for idx in 0..spec.num_ports() {
            let port = spec.port(idx);
            if port.direction != PortDirection::Output {
                continue;
            }
            let Some(ptr) = &self.ports[idx] else {
                continue;
            };
            let frames = match port.port_type {
                PortType::Audio | PortType::ARateControl => block_size,
                PortType::KRateControl => 1,
                _ => continue,
            };
            // SAFETY: connected ports point at arena buffers of at least
            // block_size frames.
            #[allow(unsafe_code)]
            unsafe {
                std::ptr::write_bytes(ptr.0, 0, frames * 4);
            }
        }
        Ok(())
    }
}

impl Processor for PluginProcessor {
    fn core(&self) -> &ProcessorCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ProcessorCore {
        &mut self.core
    }

    fn setup(&mut self, mut spec: ProcessorSpec) -> Result<()> {
        // The shared condition travels as one more port so it lives in the
        // arena like any other buffer
        spec.add_port(COND_PORT_NAME, PortType::Internal, PortDirection::Input);
        self.ports = (0..spec.num_ports()).map(|_| None).collect();
        self.core.setup(spec)?;
        self.update_memmap = true;

        let pipe_path = self.core.string_parameter("plugin_pipe_path")?;
        if !pipe_path.is_empty() {
            self.pipe_open(&pipe_path)?;
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        self.pipe_close();
        self.ports.clear();
        self.core.cleanup();
    }

    fn connect_port(&mut self, port_idx: usize, buf: BufferPtr) -> Result<()> {
        if port_idx >= self.ports.len() {
            return Err(EngineError::Error(format!("invalid port index {port_idx}")));
        }
        self.ports[port_idx] = Some(PortPtr(buf));
        self.update_memmap = true;
        Ok(())
    }

    fn process_block(&mut self, ctxt: &mut BlockContext) -> Result<()> {
        if self.pipe < 0 {
            return self.clear_outputs(ctxt.block_size);
        }

        let deadline = Instant::now() + self.deadline;

        let cond_idx = self.ports.len() - 1;
        let cond = self.ports[cond_idx]
            .as_ref()
            .ok_or_else(|| EngineError::Error("condition port not connected".into()))?
            .0
            .cast::<PluginCond>();

        if self.update_memmap {
            self.send_memory_map(ctxt, deadline)?;
            self.update_memmap = false;
        }

        // SAFETY: the condition buffer was initialized by the program's
        // buffer setup and lives in the arena for the program's lifetime.
        #[allow(unsafe_code)]
        unsafe {
            PluginCond::clear(cond)?;
        }

        self.pipe_write(b"PROCESS_BLOCK\n", deadline)?;

        #[allow(unsafe_code)]
        unsafe {
            PluginCond::wait_deadline(cond, deadline)
        }
    }
}

impl Drop for PluginProcessor {
    fn drop(&mut self) {
        self.pipe_close();
    }
}
