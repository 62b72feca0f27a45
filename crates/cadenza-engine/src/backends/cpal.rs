//! The local audio device backend.
//!
//! Opens the default stereo output at a fixed sample rate and feeds it
//! through an SPSC ring: the VM thread pushes interleaved blocks in
//! `end_block`, the cpal callback drains them. `end_block` waits for ring
//! space, which paces the whole audio loop to the device clock. The cpal
//! stream lives on its own holder thread because stream handles must stay
//! where they were created on some platforms.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use ::cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use cadenza_core::{EngineError, Frames, LogLevel, Result, SampleRate};

use crate::backend::Backend;
use crate::context::BlockContext;

const NUM_CHANNELS: usize = 2;

/// Ring capacity in blocks; bounds added latency.
const RING_BLOCKS: usize = 8;

pub struct CpalBackend {
    sample_rate: SampleRate,
    block_size: Frames,
    producer: Option<rtrb::Producer<f32>>,
    stream_thread: Option<thread::JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    underruns: Arc<AtomicUsize>,
    reported_underruns: usize,
    samples: [Vec<f32>; NUM_CHANNELS],
    channel_written: [bool; NUM_CHANNELS],
}

impl CpalBackend {
    pub fn new(sample_rate: SampleRate, block_size: Frames) -> Self {
        Self {
            sample_rate,
            block_size,
            producer: None,
            stream_thread: None,
            stop: Arc::new(AtomicBool::new(false)),
            underruns: Arc::new(AtomicUsize::new(0)),
            reported_underruns: 0,
            samples: [Vec::new(), Vec::new()],
            channel_written: [false; NUM_CHANNELS],
        }
    }
}

fn stream_main(
    sample_rate: SampleRate,
    mut consumer: rtrb::Consumer<f32>,
    stop: Arc<AtomicBool>,
    underruns: Arc<AtomicUsize>,
    ready: &mpsc::Sender<Result<()>>,
) {
    let host = cpal::default_host();
    let Some(device) = host.default_output_device() else {
        let _ = ready.send(Err(EngineError::Error("no default output device".into())));
        return;
    };

    let config = cpal::StreamConfig {
        channels: NUM_CHANNELS as u16,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = device.build_output_stream(
        &config,
        move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
            for frame in data.iter_mut() {
                match consumer.pop() {
                    Ok(sample) => *frame = sample,
                    Err(_) => {
                        *frame = 0.0;
                        underruns.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        },
        |err| tracing::error!("audio stream error: {err}"),
        None,
    );

    let stream = match stream {
        Ok(stream) => stream,
        Err(err) => {
            let _ = ready.send(Err(EngineError::Error(format!(
                "failed to open audio stream: {err}"
            ))));
            return;
        }
    };
    if let Err(err) = stream.play() {
        let _ = ready.send(Err(EngineError::Error(format!(
            "failed to start audio stream: {err}"
        ))));
        return;
    }
    let _ = ready.send(Ok(()));

    while !stop.load(Ordering::Acquire) {
        thread::sleep(Duration::from_millis(50));
    }
    drop(stream);
}

impl Backend for CpalBackend {
    fn setup(&mut self) -> Result<()> {
        let (producer, consumer) =
            rtrb::RingBuffer::new(self.block_size * NUM_CHANNELS * RING_BLOCKS);
        self.producer = Some(producer);
        for samples in &mut self.samples {
            samples.resize(self.block_size, 0.0);
        }

        let (ready_tx, ready_rx) = mpsc::channel();
        let stop = Arc::clone(&self.stop);
        let underruns = Arc::clone(&self.underruns);
        let sample_rate = self.sample_rate;
        self.stream_thread = Some(
            thread::Builder::new()
                .name("cadenza-cpal".into())
                .spawn(move || stream_main(sample_rate, consumer, stop, underruns, &ready_tx))
                .map_err(|err| EngineError::Error(format!("failed to spawn stream thread: {err}")))?,
        );

        ready_rx
            .recv_timeout(Duration::from_secs(5))
            .map_err(|_| EngineError::Error("audio stream did not come up".into()))?
    }

    fn cleanup(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.stream_thread.take() {
            let _ = handle.join();
        }
        self.producer = None;
    }

    fn begin_block(&mut self, _ctxt: &mut BlockContext) -> Result<()> {
        for samples in &mut self.samples {
            samples.fill(0.0);
        }
        self.channel_written = [false; NUM_CHANNELS];
        Ok(())
    }

    fn end_block(&mut self, ctxt: &mut BlockContext) -> Result<()> {
        let producer = self
            .producer
            .as_mut()
            .ok_or_else(|| EngineError::Error("device backend not set up".into()))?;

        // Pace the loop: wait for ring space, bounded by the stream dying
        let needed = self.block_size * NUM_CHANNELS;
        while producer.slots() < needed {
            if producer.is_abandoned() {
                return Err(EngineError::ConnectionClosed);
            }
            thread::sleep(Duration::from_micros(500));
        }

        for i in 0..self.block_size {
            for samples in &self.samples {
                let _ = producer.push(samples[i]);
            }
        }

        let underruns = self.underruns.load(Ordering::Relaxed);
        if underruns > self.reported_underruns {
            ctxt.emit_log(
                LogLevel::Warning,
                "engine.backend.cpal",
                &format!("buffer underrun ({} samples)", underruns - self.reported_underruns),
            );
            self.reported_underruns = underruns;
        }
        Ok(())
    }

    fn output(&mut self, channel: &str, samples: &[f32]) -> Result<()> {
        let c = match channel {
            "left" => 0,
            "right" => 1,
            other => return Err(EngineError::Error(format!("invalid channel {other}"))),
        };
        let n = samples.len().min(self.samples[c].len());
        self.samples[c][..n].copy_from_slice(&samples[..n]);
        self.channel_written[c] = true;
        Ok(())
    }

    fn block_size(&self) -> Frames {
        self.block_size
    }
}

impl Drop for CpalBackend {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_routing_without_device() {
        let mut backend = CpalBackend::new(48_000, 64);
        backend.samples = [vec![0.0; 64], vec![0.0; 64]];
        backend.output("left", &[0.5; 64]).unwrap();
        backend.output("right", &[0.25; 64]).unwrap();
        assert!(backend.output("center", &[0.0; 64]).is_err());
        assert_eq!(backend.samples[0][0], 0.5);
        assert_eq!(backend.samples[1][0], 0.25);
    }

    // Requires an audio device; run manually
    #[test]
    #[ignore]
    fn test_stream_comes_up() {
        let mut backend = CpalBackend::new(48_000, 512);
        backend.setup().unwrap();
        let mut ctxt = BlockContext::new(512);
        for _ in 0..10 {
            backend.begin_block(&mut ctxt).unwrap();
            backend.output("left", &vec![0.0; 512]).unwrap();
            backend.output("right", &vec![0.0; 512]).unwrap();
            backend.end_block(&mut ctxt).unwrap();
        }
        backend.cleanup();
    }
}
