//! The sidecar main loop and host abstraction.
//!
//! The control pipe is consumed by an explicit three-state machine
//! (`ReadCommand`, `ReadMemmapSize`, `ReadMemmap`) over a fixed 20 KiB
//! buffer - no callbacks, no framework. The loop polls with a one-second
//! timeout so an exit request or a hung peer is noticed promptly; POLLHUP
//! ends the loop with `ConnectionClosed`.

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cadenza_comms::{PluginCond, PluginMemoryMapping, SharedMemory, promote_to_rt_priority};
use cadenza_core::{EngineError, Result, SampleRate};

/// One hosted plugin, LADSPA or LV2.
pub trait PluginHost: Send {
    /// Point a plugin port at a buffer inside the mapped arena.
    ///
    /// # Safety
    ///
    /// `buf` must stay valid until the port is reconnected or the host is
    /// dropped; it comes out of the shared mapping the loop owns.
    unsafe fn connect_port(&mut self, port_idx: u32, buf: *mut u8) -> Result<()>;

    /// Run one block of DSP.
    fn process_block(&mut self, block_size: usize) -> Result<()>;
}

/// What to host. Discovery (paths, labels, URIs) happens outside.
#[derive(Debug, Clone)]
pub enum HostSpec {
    Ladspa {
        library_path: String,
        label: String,
    },
    Lv2 {
        binary_path: String,
        bundle_path: String,
        uri: String,
    },
}

/// Instantiate the plugin a spec describes.
pub fn create_host(spec: &HostSpec, sample_rate: SampleRate) -> Result<Box<dyn PluginHost>> {
    match spec {
        HostSpec::Ladspa {
            library_path,
            label,
        } => Ok(Box::new(crate::LadspaHost::load(
            library_path,
            label,
            sample_rate,
        )?)),
        HostSpec::Lv2 {
            binary_path,
            bundle_path,
            uri,
        } => Ok(Box::new(crate::Lv2Host::load(
            binary_path,
            bundle_path,
            uri,
            sample_rate,
        )?)),
    }
}

/// Handle for requesting loop exit from another thread.
#[derive(Clone)]
pub struct ExitFlag(Arc<AtomicBool>);

impl ExitFlag {
    pub fn request_exit(&self) {
        self.0.store(true, Ordering::Release);
    }
}

enum State {
    ReadCommand,
    ReadMemmapSize,
    ReadMemmap,
}

/// Drives one [`PluginHost`] from a control pipe.
pub struct HostLoop {
    exit_loop: Arc<AtomicBool>,
    shmem: Option<SharedMemory>,
    shmem_path: String,
    cond_offset: usize,
    block_size: usize,
}

impl HostLoop {
    pub fn new() -> Self {
        Self {
            exit_loop: Arc::new(AtomicBool::new(false)),
            shmem: None,
            shmem_path: String::new(),
            cond_offset: 0,
            block_size: 0,
        }
    }

    pub fn exit_flag(&self) -> ExitFlag {
        ExitFlag(Arc::clone(&self.exit_loop))
    }

    /// Read and execute commands until exit is requested or the pipe hangs
    /// up.
    #[allow(unsafe_code)]
    pub fn main_loop(&mut self, pipe_fd: RawFd, host: &mut dyn PluginHost) -> Result<()> {
        tracing::info!("entering main loop");

        if let Err(err) = promote_to_rt_priority() {
            tracing::warn!("could not switch to realtime priority: {err}");
        }

        let mut state = State::ReadCommand;
        let mut buf = vec![0u8; 20480];
        let mut buf_size = 0usize;
        let mut memmap_size = 0usize;

        while !self.exit_loop.load(Ordering::Acquire) {
            let mut fds = libc::pollfd {
                fd: pipe_fd,
                events: libc::POLLIN,
                revents: 0,
            };
            let rc = unsafe { libc::poll(&mut fds, 1, 1000) };
            if rc < 0 {
                return Err(EngineError::os("poll on control pipe"));
            }

            if fds.revents & libc::POLLIN != 0 {
                let bytes_read = unsafe {
                    libc::read(
                        pipe_fd,
                        buf.as_mut_ptr().add(buf_size).cast(),
                        buf.len() - buf_size,
                    )
                };
                if bytes_read < 0 {
                    return Err(EngineError::os("read from control pipe"));
                }
                if bytes_read == 0 {
                    return Err(EngineError::ConnectionClosed);
                }
                buf_size += bytes_read as usize;
            } else if fds.revents & libc::POLLHUP != 0 {
                return Err(EngineError::ConnectionClosed);
            }

            let mut more = true;
            while more {
                more = false;
                match state {
                    State::ReadCommand => {
                        let Some(lf) = buf[..buf_size].iter().position(|&b| b == b'\n') else {
                            continue;
                        };
                        let command = &buf[..lf];
                        if command == b"PROCESS_BLOCK" {
                            if self.shmem.is_none() {
                                return Err(EngineError::Error(
                                    "PROCESS_BLOCK before memory mapping was set".into(),
                                ));
                            }
                            host.process_block(self.block_size)?;
                            self.signal_done()?;
                        } else if command == b"MEMORY_MAP" {
                            state = State::ReadMemmapSize;
                        } else {
                            return Err(EngineError::Error(format!(
                                "unknown command '{}' received",
                                String::from_utf8_lossy(command)
                            )));
                        }

                        buf.copy_within(lf + 1..buf_size, 0);
                        buf_size -= lf + 1;
                        more = buf_size > 0;
                    }
                    State::ReadMemmapSize => {
                        let Some(lf) = buf[..buf_size].iter().position(|&b| b == b'\n') else {
                            continue;
                        };
                        memmap_size = std::str::from_utf8(&buf[..lf])
                            .ok()
                            .and_then(|s| s.parse().ok())
                            .ok_or_else(|| {
                                EngineError::Error("invalid memory map size".into())
                            })?;
                        if memmap_size > buf.len() {
                            return Err(EngineError::Error(format!(
                                "invalid memory map size {memmap_size}"
                            )));
                        }
                        state = State::ReadMemmap;

                        buf.copy_within(lf + 1..buf_size, 0);
                        buf_size -= lf + 1;
                        more = buf_size > 0;
                    }
                    State::ReadMemmap => {
                        if buf_size < memmap_size {
                            continue;
                        }
                        let payload = buf[..memmap_size].to_vec();
                        self.handle_memory_map(&payload, host)?;
                        state = State::ReadCommand;

                        buf.copy_within(memmap_size..buf_size, 0);
                        buf_size -= memmap_size;
                        more = buf_size > 0;
                    }
                }
            }
        }

        tracing::info!("main loop finished");
        Ok(())
    }

    #[allow(unsafe_code)]
    fn handle_memory_map(&mut self, payload: &[u8], host: &mut dyn PluginHost) -> Result<()> {
        let (mapping, ports) = PluginMemoryMapping::decode(payload)?;

        if mapping.shmem_path != self.shmem_path {
            tracing::info!("using new shared memory location {}", mapping.shmem_path);
            self.shmem = Some(SharedMemory::open(&mapping.shmem_path)?);
            self.shmem_path = mapping.shmem_path.clone();
        }
        let shmem = self.shmem.as_ref().unwrap();

        tracing::info!("cond_offset={}", mapping.cond_offset);
        self.cond_offset = mapping.cond_offset as usize;
        let cond = unsafe { shmem.as_ptr().add(self.cond_offset) }.cast::<PluginCond>();
        if unsafe { (*cond).magic } != cadenza_comms::PLUGIN_COND_MAGIC {
            return Err(EngineError::Error("plugin condition not initialized".into()));
        }

        tracing::info!("block_size={}", mapping.block_size);
        self.block_size = mapping.block_size as usize;

        tracing::info!("num_buffers={}", mapping.num_buffers);
        for port in ports {
            tracing::info!("port {} offset={}", port.port_index, port.offset);
            if port.offset as usize >= shmem.len() {
                return Err(EngineError::Error(format!(
                    "port {} offset {} outside the arena",
                    port.port_index, port.offset
                )));
            }
            let buf = unsafe { shmem.as_ptr().add(port.offset as usize) };
            unsafe { host.connect_port(port.port_index, buf)? };
        }

        Ok(())
    }

    /// Tell the engine the block is done: lock, set, unlock, broadcast.
    #[allow(unsafe_code)]
    fn signal_done(&self) -> Result<()> {
        let shmem = self
            .shmem
            .as_ref()
            .ok_or_else(|| EngineError::Error("no shared memory mapped".into()))?;
        let cond = unsafe { shmem.as_ptr().add(self.cond_offset) }.cast::<PluginCond>();
        unsafe { PluginCond::signal(cond) }
    }
}

impl Default for HostLoop {
    fn default() -> Self {
        Self::new()
    }
}
