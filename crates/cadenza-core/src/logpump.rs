//! Real-time-safe log pump.
//!
//! The audio thread must never hit the allocator or a blocking sink just to
//! say something. Instead it frames log records into fixed 1024-byte blocks
//! and pushes them onto a fixed-capacity SPSC ring; a background thread
//! reassembles the blocks and forwards complete records to a sink. A full
//! ring drops the record silently - losing a log line beats missing a
//! deadline.
//!
//! Wire form of a record: one header block (magic 0x87b6c23a, sequence
//! number, level, 128-byte logger name, payload length, continued flag)
//! followed by zero or more continuation blocks (magic 0x9f2d8e43).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Size of one ring slot in bytes.
pub const BLOCK_SIZE: usize = 1024;

/// Number of slots in the ring.
pub const RING_CAPACITY: usize = 128;

/// Maximum logger-name length carried in a header block.
pub const MAX_LOGGER_NAME: usize = 128;

const HEADER_MAGIC: u32 = 0x87b6_c23a;
const CONTINUATION_MAGIC: u32 = 0x9f2d_8e43;

// Header: magic(4) seq(4) level(4) logger(128) length(8) continued(1)
const HEADER_BYTES: usize = 4 + 4 + 4 + MAX_LOGGER_NAME + 8 + 1;
const HEADER_PAYLOAD: usize = BLOCK_SIZE - HEADER_BYTES;
// Continuation: magic(4) seq(4) length(8) continued(1)
const CONTINUATION_BYTES: usize = 4 + 4 + 8 + 1;
const CONTINUATION_PAYLOAD: usize = BLOCK_SIZE - CONTINUATION_BYTES;

/// Log levels carried over the pump wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warning = 2,
    Error = 3,
}

impl LogLevel {
    fn from_u32(value: u32) -> Self {
        match value {
            0 => Self::Debug,
            2 => Self::Warning,
            3 => Self::Error,
            _ => Self::Info,
        }
    }
}

/// Where reassembled records end up.
pub trait LogSink: Send {
    fn emit(&self, logger: &str, level: LogLevel, message: &str);
}

/// Default sink: forward to `tracing`.
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&self, logger: &str, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(target: "cadenza::rt", "{logger}: {message}"),
            LogLevel::Info => tracing::info!(target: "cadenza::rt", "{logger}: {message}"),
            LogLevel::Warning => tracing::warn!(target: "cadenza::rt", "{logger}: {message}"),
            LogLevel::Error => tracing::error!(target: "cadenza::rt", "{logger}: {message}"),
        }
    }
}

#[derive(Clone, Copy)]
struct Block {
    data: [u8; BLOCK_SIZE],
}

struct PumpShared {
    stop: AtomicBool,
    wake_lock: Mutex<()>,
    wake: Condvar,
}

/// Producer handle for the audio thread. Enqueue-only; never blocks, never
/// allocates.
pub struct RtLog {
    producer: Mutex<rtrb::Producer<Block>>,
    seq: AtomicU32,
    shared: Arc<PumpShared>,
}

impl RtLog {
    /// Frame `message` into blocks and enqueue them. Drops the whole record
    /// if the ring cannot take it.
    pub fn log(&self, level: LogLevel, logger: &str, message: &str) {
        let payload = message.as_bytes();
        let extra = payload.len().saturating_sub(HEADER_PAYLOAD);
        let needed = 1 + extra.div_ceil(CONTINUATION_PAYLOAD);

        // The lock is uncontended: only the audio thread produces.
        let mut producer = self.producer.lock();
        if producer.slots() < needed {
            return;
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let (head, mut rest) = payload.split_at(payload.len().min(HEADER_PAYLOAD));

        let mut block = Block {
            data: [0; BLOCK_SIZE],
        };
        block.data[0..4].copy_from_slice(&HEADER_MAGIC.to_ne_bytes());
        block.data[4..8].copy_from_slice(&seq.to_ne_bytes());
        block.data[8..12].copy_from_slice(&(level as u32).to_ne_bytes());
        let name_len = logger.len().min(MAX_LOGGER_NAME - 1);
        block.data[12..12 + name_len].copy_from_slice(&logger.as_bytes()[..name_len]);
        block.data[140..148].copy_from_slice(&(head.len() as u64).to_ne_bytes());
        block.data[148] = u8::from(!rest.is_empty());
        block.data[HEADER_BYTES..HEADER_BYTES + head.len()].copy_from_slice(head);
        let _ = producer.push(block);

        while !rest.is_empty() {
            let (chunk, tail) = rest.split_at(rest.len().min(CONTINUATION_PAYLOAD));
            rest = tail;

            let mut block = Block {
                data: [0; BLOCK_SIZE],
            };
            block.data[0..4].copy_from_slice(&CONTINUATION_MAGIC.to_ne_bytes());
            block.data[4..8].copy_from_slice(&seq.to_ne_bytes());
            block.data[8..16].copy_from_slice(&(chunk.len() as u64).to_ne_bytes());
            block.data[16] = u8::from(!rest.is_empty());
            block.data[CONTINUATION_BYTES..CONTINUATION_BYTES + chunk.len()]
                .copy_from_slice(chunk);
            let _ = producer.push(block);
        }
        drop(producer);

        self.shared.wake.notify_all();
    }

    pub fn debug(&self, logger: &str, message: &str) {
        self.log(LogLevel::Debug, logger, message);
    }

    pub fn info(&self, logger: &str, message: &str) {
        self.log(LogLevel::Info, logger, message);
    }

    pub fn warning(&self, logger: &str, message: &str) {
        self.log(LogLevel::Warning, logger, message);
    }

    pub fn error(&self, logger: &str, message: &str) {
        self.log(LogLevel::Error, logger, message);
    }
}

/// The consumer side: owns the background thread for one sink.
pub struct LogPump {
    shared: Arc<PumpShared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl LogPump {
    /// Start a pump feeding `sink`, returning the pump and the producer
    /// handle to hand to the audio thread.
    pub fn start(sink: Box<dyn LogSink>) -> (Self, RtLog) {
        let (producer, consumer) = rtrb::RingBuffer::new(RING_CAPACITY);
        let shared = Arc::new(PumpShared {
            stop: AtomicBool::new(false),
            wake_lock: Mutex::new(()),
            wake: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("cadenza-logpump".into())
            .spawn(move || pump_main(&thread_shared, consumer, sink.as_ref()))
            .expect("failed to spawn log pump thread");

        let rt_log = RtLog {
            producer: Mutex::new(producer),
            seq: AtomicU32::new(0),
            shared: Arc::clone(&shared),
        };

        (
            Self {
                shared,
                thread: Some(thread),
            },
            rt_log,
        )
    }
}

impl Drop for LogPump {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.wake.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn pump_main(shared: &PumpShared, mut consumer: rtrb::Consumer<Block>, sink: &dyn LogSink) {
    tracing::debug!("log pump thread started");

    struct Pending {
        seq: u32,
        level: LogLevel,
        logger: String,
        message: Vec<u8>,
        continued: bool,
    }
    let mut pending: Option<Pending> = None;

    loop {
        {
            let mut guard = shared.wake_lock.lock();
            shared
                .wake
                .wait_for(&mut guard, Duration::from_millis(500));
        }

        while let Ok(block) = consumer.pop() {
            let magic = u32::from_ne_bytes(block.data[0..4].try_into().unwrap());
            let seq = u32::from_ne_bytes(block.data[4..8].try_into().unwrap());
            match magic {
                HEADER_MAGIC => {
                    if let Some(p) = pending.take() {
                        tracing::warn!("log record {} truncated mid-stream", p.seq);
                    }
                    let level = LogLevel::from_u32(u32::from_ne_bytes(
                        block.data[8..12].try_into().unwrap(),
                    ));
                    let name_end = block.data[12..12 + MAX_LOGGER_NAME]
                        .iter()
                        .position(|&b| b == 0)
                        .unwrap_or(MAX_LOGGER_NAME);
                    let logger =
                        String::from_utf8_lossy(&block.data[12..12 + name_end]).into_owned();
                    let length = u64::from_ne_bytes(block.data[140..148].try_into().unwrap())
                        as usize;
                    let continued = block.data[148] != 0;
                    let message =
                        block.data[HEADER_BYTES..HEADER_BYTES + length.min(HEADER_PAYLOAD)].to_vec();
                    pending = Some(Pending {
                        seq,
                        level,
                        logger,
                        message,
                        continued,
                    });
                }
                CONTINUATION_MAGIC => {
                    if !pending.as_ref().is_some_and(|p| p.seq == seq) {
                        tracing::warn!("stray log continuation for record {seq}");
                        pending = None;
                        continue;
                    }
                    let p = pending.as_mut().unwrap();
                    let length = u64::from_ne_bytes(block.data[8..16].try_into().unwrap())
                        as usize;
                    p.continued = block.data[16] != 0;
                    p.message.extend_from_slice(
                        &block.data
                            [CONTINUATION_BYTES..CONTINUATION_BYTES + length.min(CONTINUATION_PAYLOAD)],
                    );
                }
                _ => {
                    tracing::warn!("log pump: bad block magic {magic:#x}");
                    pending = None;
                    continue;
                }
            }

            if pending.as_ref().is_some_and(|p| !p.continued) {
                let p = pending.take().unwrap();
                sink.emit(&p.logger, p.level, &String::from_utf8_lossy(&p.message));
            }
        }

        if shared.stop.load(Ordering::Acquire) {
            break;
        }
    }

    tracing::debug!("log pump thread stopped");
}
