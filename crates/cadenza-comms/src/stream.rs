//! Line-framed audio-block streams over named pipes.
//!
//! One frame per audio block, in both directions: `#LEN=<n>\n`, `n` payload
//! bytes, `#END\n`. A client announces teardown with `#CLOSE\n`. The
//! payload is a [`BlockData`] record: block size, sample position, and a
//! list of named byte buffers.
//!
//! The server side creates a `<address>.send` / `<address>.recv` fifo pair;
//! the client opens the same pair crosswise. Reads poll with a 500 ms
//! timeout so a stream can be shut down from another thread.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cadenza_core::{EngineError, Result};

/// Payload of one audio-stream frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockData {
    pub block_size: u32,
    pub sample_pos: u64,
    /// Named buffers, e.g. `("output:0", samples)`.
    pub buffers: Vec<(String, Vec<u8>)>,
}

impl BlockData {
    pub fn encode(&self) -> Vec<u8> {
        let payload: usize = self
            .buffers
            .iter()
            .map(|(id, data)| 8 + id.len() + data.len())
            .sum();
        let mut out = Vec::with_capacity(16 + payload);
        out.extend_from_slice(&self.block_size.to_ne_bytes());
        out.extend_from_slice(&self.sample_pos.to_ne_bytes());
        out.extend_from_slice(&(self.buffers.len() as u32).to_ne_bytes());
        for (id, data) in &self.buffers {
            out.extend_from_slice(&(id.len() as u32).to_ne_bytes());
            out.extend_from_slice(id.as_bytes());
            out.extend_from_slice(&(data.len() as u32).to_ne_bytes());
            out.extend_from_slice(data);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        fn take<'a>(bytes: &'a [u8], at: &mut usize, len: usize) -> Result<&'a [u8]> {
            let end = *at + len;
            if end > bytes.len() {
                return Err(EngineError::Error("truncated block data frame".into()));
            }
            let slice = &bytes[*at..end];
            *at = end;
            Ok(slice)
        }

        let mut at = 0;
        let block_size = u32::from_ne_bytes(take(bytes, &mut at, 4)?.try_into().unwrap());
        let sample_pos = u64::from_ne_bytes(take(bytes, &mut at, 8)?.try_into().unwrap());
        let num_buffers = u32::from_ne_bytes(take(bytes, &mut at, 4)?.try_into().unwrap());

        let mut buffers = Vec::with_capacity(num_buffers as usize);
        for _ in 0..num_buffers {
            let id_len = u32::from_ne_bytes(take(bytes, &mut at, 4)?.try_into().unwrap()) as usize;
            let id = std::str::from_utf8(take(bytes, &mut at, id_len)?)
                .map_err(|_| EngineError::Error("buffer id is not valid utf-8".into()))?
                .to_owned();
            let data_len =
                u32::from_ne_bytes(take(bytes, &mut at, 4)?.try_into().unwrap()) as usize;
            let data = take(bytes, &mut at, data_len)?.to_vec();
            buffers.push((id, data));
        }

        Ok(Self {
            block_size,
            sample_pos,
            buffers,
        })
    }
}

/// Asks a stream blocked in a read to give up.
#[derive(Clone)]
pub struct StreamCloser(Arc<AtomicBool>);

impl StreamCloser {
    pub fn close(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Buffered, pollable framing over one read fd and one write fd.
struct Framing {
    pipe_in: RawFd,
    pipe_out: RawFd,
    buffer: Vec<u8>,
    closed: Arc<AtomicBool>,
}

impl Framing {
    #[allow(unsafe_code)]
    fn fill_buffer(&mut self) -> Result<()> {
        loop {
            let mut fds = libc::pollfd {
                fd: self.pipe_in,
                events: libc::POLLIN,
                revents: 0,
            };
            let rc = unsafe { libc::poll(&mut fds, 1, 500) };
            if rc < 0 {
                return Err(EngineError::os("poll on stream pipe"));
            }

            if fds.revents & libc::POLLIN != 0 {
                let mut chunk = [0u8; 1024];
                let num_bytes =
                    unsafe { libc::read(self.pipe_in, chunk.as_mut_ptr().cast(), chunk.len()) };
                if num_bytes < 0 {
                    return Err(EngineError::os("read from stream pipe"));
                }
                if num_bytes == 0 {
                    return Err(EngineError::ConnectionClosed);
                }
                self.buffer.extend_from_slice(&chunk[..num_bytes as usize]);
                return Ok(());
            }
            if fds.revents & libc::POLLHUP != 0 {
                tracing::warn!("stream pipe disconnected");
                return Err(EngineError::ConnectionClosed);
            }

            if self.closed.load(Ordering::Acquire) {
                return Err(EngineError::ConnectionClosed);
            }
        }
    }

    fn get_line(&mut self) -> Result<String> {
        loop {
            if let Some(eol) = self.buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=eol).collect();
                return String::from_utf8(line[..eol].to_vec())
                    .map_err(|_| EngineError::Error("frame header is not valid utf-8".into()));
            }
            self.fill_buffer()?;
        }
    }

    fn get_bytes(&mut self, num_bytes: usize) -> Result<Vec<u8>> {
        while self.buffer.len() < num_bytes {
            self.fill_buffer()?;
        }
        Ok(self.buffer.drain(..num_bytes).collect())
    }

    fn receive_bytes(&mut self) -> Result<Vec<u8>> {
        let line = self.get_line()?;
        if line == "#CLOSE" {
            return Err(EngineError::ConnectionClosed);
        }
        let len: usize = line
            .strip_prefix("#LEN=")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| EngineError::Error(format!("bad frame header '{line}'")))?;

        let payload = self.get_bytes(len)?;

        let end = self.get_line()?;
        if end != "#END" {
            return Err(EngineError::Error(format!("bad frame trailer '{end}'")));
        }
        Ok(payload)
    }

    #[allow(unsafe_code)]
    fn write_all(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let written =
                unsafe { libc::write(self.pipe_out, data.as_ptr().cast(), data.len()) };
            if written < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EPIPE) {
                    return Err(EngineError::ConnectionClosed);
                }
                return Err(EngineError::os("write to stream pipe"));
            }
            data = &data[written as usize..];
        }
        Ok(())
    }

    fn send_bytes(&mut self, payload: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(payload.len() + 32);
        frame.extend_from_slice(format!("#LEN={}\n", payload.len()).as_bytes());
        frame.extend_from_slice(payload);
        frame.extend_from_slice(b"#END\n");
        self.write_all(&frame)
    }

    #[allow(unsafe_code)]
    fn close_fds(&mut self) {
        unsafe {
            if self.pipe_in >= 0 {
                libc::close(self.pipe_in);
                self.pipe_in = -1;
            }
            if self.pipe_out >= 0 {
                libc::close(self.pipe_out);
                self.pipe_out = -1;
            }
        }
    }
}

#[allow(unsafe_code)]
fn open_fifo(path: &str, flags: i32) -> Result<RawFd> {
    let c_path = CString::new(path)
        .map_err(|_| EngineError::Error(format!("invalid fifo path '{path}'")))?;
    let fd = unsafe { libc::open(c_path.as_ptr(), flags | libc::O_NONBLOCK) };
    if fd < 0 {
        return Err(EngineError::os(format!("open({path})")));
    }
    // Non-blocking is only needed to avoid hanging in open(); reads and
    // writes are paced by poll.
    let fl = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if fl < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, fl & !libc::O_NONBLOCK) } < 0 {
        let err = EngineError::os(format!("fcntl({path})"));
        unsafe { libc::close(fd) };
        return Err(err);
    }
    Ok(fd)
}

#[allow(unsafe_code)]
fn make_fifo(path: &str) -> Result<()> {
    let c_path = CString::new(path)
        .map_err(|_| EngineError::Error(format!("invalid fifo path '{path}'")))?;
    if unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) } != 0 {
        return Err(EngineError::os(format!("mkfifo({path})")));
    }
    Ok(())
}

/// Serving end: creates the fifo pair and waits for a client.
pub struct AudioStreamServer {
    address: String,
    framing: Framing,
}

impl AudioStreamServer {
    pub fn bind(address: &str) -> Result<Self> {
        tracing::info!("serving audio stream from {address}");

        let address_in = format!("{address}.send");
        let address_out = format!("{address}.recv");

        make_fifo(&address_in)?;
        let pipe_in = open_fifo(&address_in, libc::O_RDONLY)?;
        make_fifo(&address_out)?;
        // O_RDWR keeps the write end open even while no client is connected
        let pipe_out = open_fifo(&address_out, libc::O_RDWR)?;

        Ok(Self {
            address: address.to_owned(),
            framing: Framing {
                pipe_in,
                pipe_out,
                buffer: Vec::new(),
                closed: Arc::new(AtomicBool::new(false)),
            },
        })
    }

    pub fn receive_block(&mut self) -> Result<BlockData> {
        BlockData::decode(&self.framing.receive_bytes()?)
    }

    pub fn send_block(&mut self, block: &BlockData) -> Result<()> {
        self.framing.send_bytes(&block.encode())
    }

    pub fn closer(&self) -> StreamCloser {
        StreamCloser(Arc::clone(&self.framing.closed))
    }
}

impl Drop for AudioStreamServer {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        self.framing.close_fds();
        for suffix in [".send", ".recv"] {
            let path = format!("{}{suffix}", self.address);
            if let Ok(c_path) = CString::new(path.as_str())
                && unsafe { libc::unlink(c_path.as_ptr()) } != 0
            {
                tracing::warn!("failed to unlink fifo {path}");
            }
        }
    }
}

/// Connecting end: opens an existing fifo pair crosswise.
pub struct AudioStreamClient {
    framing: Framing,
}

impl AudioStreamClient {
    pub fn connect(address: &str) -> Result<Self> {
        tracing::info!("connecting to audio stream at {address}");

        let pipe_in = open_fifo(&format!("{address}.recv"), libc::O_RDONLY)?;
        let pipe_out = match open_fifo(&format!("{address}.send"), libc::O_RDWR) {
            Ok(fd) => fd,
            Err(err) => {
                #[allow(unsafe_code)]
                unsafe {
                    libc::close(pipe_in)
                };
                return Err(err);
            }
        };

        Ok(Self {
            framing: Framing {
                pipe_in,
                pipe_out,
                buffer: Vec::new(),
                closed: Arc::new(AtomicBool::new(false)),
            },
        })
    }

    pub fn receive_block(&mut self) -> Result<BlockData> {
        BlockData::decode(&self.framing.receive_bytes()?)
    }

    pub fn send_block(&mut self, block: &BlockData) -> Result<()> {
        self.framing.send_bytes(&block.encode())
    }

    pub fn closer(&self) -> StreamCloser {
        StreamCloser(Arc::clone(&self.framing.closed))
    }
}

impl Drop for AudioStreamClient {
    fn drop(&mut self) {
        if self.framing.pipe_out >= 0
            && let Err(err) = self.framing.write_all(b"#CLOSE\n")
        {
            tracing::warn!("failed to send close marker: {err}");
        }
        self.framing.close_fds();
    }
}
