//! The IPC backend.
//!
//! Another process paces the engine over an audio-stream fifo pair: one
//! request frame per block (block size, sample position, named input
//! buffers), one response frame carrying the channels that were written.
//! A change of block size in the request takes effect for that block.

use cadenza_comms::{AudioStreamServer, BlockData};
use cadenza_core::{EngineError, Frames, Result};

use crate::backend::Backend;
use crate::context::BlockContext;

const NUM_CHANNELS: usize = 2;

pub struct IpcBackend {
    address: String,
    stream: Option<AudioStreamServer>,
    block_size: Frames,
    sample_pos: u64,
    samples: [Vec<f32>; NUM_CHANNELS],
    channel_written: [bool; NUM_CHANNELS],
}

impl IpcBackend {
    pub fn new(address: &str, block_size: Frames) -> Self {
        Self {
            address: address.to_owned(),
            stream: None,
            block_size,
            sample_pos: 0,
            samples: [Vec::new(), Vec::new()],
            channel_written: [false; NUM_CHANNELS],
        }
    }

    fn channel_index(channel: &str) -> Result<usize> {
        match channel {
            "left" => Ok(0),
            "right" => Ok(1),
            other => Err(EngineError::Error(format!("invalid channel {other}"))),
        }
    }
}

impl Backend for IpcBackend {
    fn setup(&mut self) -> Result<()> {
        if self.block_size == 0 {
            return Err(EngineError::Error("invalid block_size 0".into()));
        }
        self.stream = Some(AudioStreamServer::bind(&self.address)?);
        for samples in &mut self.samples {
            samples.resize(self.block_size, 0.0);
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        self.stream = None;
    }

    fn begin_block(&mut self, ctxt: &mut BlockContext) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| EngineError::Error("IPC backend not set up".into()))?;
        let request = stream.receive_block()?;

        ctxt.buffers.clear();
        for (id, data) in request.buffers {
            ctxt.buffers.insert(id, data);
        }
        ctxt.sample_pos = request.sample_pos;
        self.sample_pos = request.sample_pos;

        let request_block_size = request.block_size as Frames;
        if request_block_size != self.block_size {
            tracing::info!(
                "block size changed {} -> {request_block_size}",
                self.block_size
            );
            self.block_size = request_block_size;
            for samples in &mut self.samples {
                samples.resize(self.block_size, 0.0);
            }
        }

        self.channel_written = [false; NUM_CHANNELS];
        Ok(())
    }

    fn end_block(&mut self, _ctxt: &mut BlockContext) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| EngineError::Error("IPC backend not set up".into()))?;

        let mut response = BlockData {
            block_size: self.block_size as u32,
            sample_pos: self.sample_pos,
            buffers: Vec::new(),
        };
        for (c, written) in self.channel_written.iter().enumerate() {
            if *written {
                let bytes: Vec<u8> = self.samples[c]
                    .iter()
                    .flat_map(|s| s.to_ne_bytes())
                    .collect();
                response
                    .buffers
                    .push((format!("output:{}", response.buffers.len()), bytes));
            }
        }

        stream.send_block(&response)
    }

    fn output(&mut self, channel: &str, samples: &[f32]) -> Result<()> {
        let c = Self::channel_index(channel)?;
        if self.channel_written[c] {
            return Err(EngineError::Error(format!(
                "channel {channel} written multiple times"
            )));
        }
        self.channel_written[c] = true;
        let n = samples.len().min(self.samples[c].len());
        self.samples[c][..n].copy_from_slice(&samples[..n]);
        Ok(())
    }

    fn block_size(&self) -> Frames {
        self.block_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_comms::AudioStreamClient;
    use std::thread;

    #[test]
    fn test_request_response_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let address = dir.path().join("backend").to_str().unwrap().to_owned();

        let mut backend = IpcBackend::new(&address, 64);
        backend.setup().unwrap();

        let client_address = address.clone();
        let client = thread::spawn(move || {
            let mut client = AudioStreamClient::connect(&client_address).unwrap();
            let samples: Vec<f32> = (0..64).map(|i| i as f32 / 64.0).collect();
            let request = BlockData {
                block_size: 64,
                sample_pos: 128,
                buffers: vec![(
                    "input:main".into(),
                    samples.iter().flat_map(|s| s.to_ne_bytes()).collect(),
                )],
            };
            client.send_block(&request).unwrap();
            (samples, client.receive_block().unwrap())
        });

        let mut ctxt = BlockContext::new(64);
        backend.begin_block(&mut ctxt).unwrap();
        assert_eq!(ctxt.sample_pos, 128);
        assert!(ctxt.buffers.contains_key("input:main"));

        // Echo the received input back out
        let input: Vec<f32> = ctxt.buffers["input:main"]
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes(c.try_into().unwrap()))
            .collect();
        backend.output("left", &input).unwrap();
        backend.end_block(&mut ctxt).unwrap();

        let (sent, response) = client.join().unwrap();
        assert_eq!(response.block_size, 64);
        assert_eq!(response.buffers.len(), 1);
        assert_eq!(response.buffers[0].0, "output:0");
        let received: Vec<f32> = response.buffers[0]
            .1
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes(c.try_into().unwrap()))
            .collect();
        // Round trip is bit-identical
        assert_eq!(received, sent);
    }

    #[test]
    fn test_duplicate_channel_write_is_rejected() {
        let mut backend = IpcBackend::new("/tmp/unused", 64);
        backend.samples = [vec![0.0; 64], vec![0.0; 64]];
        backend.output("left", &[0.0; 64]).unwrap();
        assert!(backend.output("left", &[0.0; 64]).is_err());
        assert!(backend.output("center", &[0.0; 64]).is_err());
    }

    #[test]
    fn test_block_size_follows_request() {
        let dir = tempfile::tempdir().unwrap();
        let address = dir.path().join("backend").to_str().unwrap().to_owned();

        let mut backend = IpcBackend::new(&address, 64);
        backend.setup().unwrap();

        let client_address = address.clone();
        let client = thread::spawn(move || {
            let mut client = AudioStreamClient::connect(&client_address).unwrap();
            let request = BlockData {
                block_size: 256,
                sample_pos: 0,
                buffers: Vec::new(),
            };
            client.send_block(&request).unwrap();
            client.receive_block().unwrap()
        });

        let mut ctxt = BlockContext::new(64);
        backend.begin_block(&mut ctxt).unwrap();
        assert_eq!(backend.block_size(), 256);
        backend.end_block(&mut ctxt).unwrap();

        let response = client.join().unwrap();
        assert_eq!(response.block_size, 256);
    }
}
