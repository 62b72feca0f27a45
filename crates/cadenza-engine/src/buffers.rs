//! Typed buffers.
//!
//! Every signal buffer is a (type, offset, length) view into the arena.
//! The type defines byte size, one-time setup/cleanup, and the three
//! block-rate operations opcodes use: clear to identity, mix, and scale.

use cadenza_comms::PluginCond;
use cadenza_core::{EngineError, Frames, Result};

use crate::atom;
use crate::host::HostState;

/// Byte capacity of an event-sequence buffer.
pub const ATOM_DATA_SIZE: usize = 10240;

/// A float control value with a change-tracking generation counter.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlValue {
    pub value: f32,
    pub generation: u32,
}

/// The closed set of signal kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferType {
    /// One control scalar with generation counter
    FloatCv,
    /// One block of audio samples
    FloatAudio,
    /// A 10240-byte event sequence
    AtomData,
    /// A cross-process condition (see [`PluginCond`])
    PluginCond,
}

impl BufferType {
    /// Byte size at a given block size.
    pub fn size(self, block_size: Frames) -> usize {
        match self {
            Self::FloatCv => std::mem::size_of::<ControlValue>(),
            Self::FloatAudio => block_size * std::mem::size_of::<f32>(),
            Self::AtomData => ATOM_DATA_SIZE,
            Self::PluginCond => std::mem::size_of::<PluginCond>(),
        }
    }

    /// One-time initialization after allocation. Only the condition type
    /// has work to do: its mutex/condvar get process-shared attributes so
    /// a sidecar can wait on them.
    ///
    /// # Safety
    ///
    /// `ptr` must point to at least [`size`](Self::size) writable bytes
    /// owned by this buffer.
    #[allow(unsafe_code)]
    pub unsafe fn setup(self, ptr: *mut u8) -> Result<()> {
        match self {
            Self::PluginCond => unsafe { PluginCond::init_in_place(ptr.cast()) },
            _ => Ok(()),
        }
    }

    /// Inverse of [`setup`](Self::setup); never fails.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a buffer previously passed to `setup`.
    #[allow(unsafe_code)]
    pub unsafe fn cleanup(self, ptr: *mut u8) {
        if self == Self::PluginCond {
            unsafe { PluginCond::destroy_in_place(ptr.cast()) };
        }
    }

    /// Reset to the type's identity.
    pub fn clear(self, host: &HostState, block_size: Frames, buf: &mut [u8]) -> Result<()> {
        match self {
            Self::FloatCv => {
                write_control_value(
                    buf,
                    ControlValue {
                        value: 0.0,
                        generation: 0,
                    },
                );
                Ok(())
            }
            Self::FloatAudio => {
                for sample in samples_mut(buf, block_size) {
                    *sample = 0.0;
                }
                Ok(())
            }
            Self::AtomData => {
                buf.fill(0);
                atom::clear_sequence(buf, &host.urids);
                Ok(())
            }
            Self::PluginCond => Err(EngineError::InvalidOperation(
                "clear on a condition buffer".into(),
            )),
        }
    }

    /// Combine `src` into `dst`.
    pub fn mix(
        self,
        host: &HostState,
        block_size: Frames,
        src: &[u8],
        dst: &mut [u8],
    ) -> Result<()> {
        match self {
            Self::FloatCv => {
                let a = read_control_value(src);
                let b = read_control_value(dst);
                write_control_value(
                    dst,
                    ControlValue {
                        value: a.value + b.value,
                        generation: a.generation.max(b.generation) + 1,
                    },
                );
                Ok(())
            }
            Self::FloatAudio => {
                let src = samples(src, block_size);
                for (d, &s) in samples_mut(dst, block_size).iter_mut().zip(src) {
                    *d += s;
                }
                Ok(())
            }
            Self::AtomData => mix_sequences(host, src, dst),
            Self::PluginCond => Err(EngineError::InvalidOperation(
                "mix on a condition buffer".into(),
            )),
        }
    }

    /// Multiply by `factor`.
    pub fn mul(self, block_size: Frames, buf: &mut [u8], factor: f32) -> Result<()> {
        match self {
            Self::FloatCv => {
                let cv = read_control_value(buf);
                write_control_value(
                    buf,
                    ControlValue {
                        value: cv.value * factor,
                        generation: cv.generation + 1,
                    },
                );
                Ok(())
            }
            Self::FloatAudio => {
                for sample in samples_mut(buf, block_size) {
                    *sample *= factor;
                }
                Ok(())
            }
            Self::AtomData => Err(EngineError::InvalidOperation(
                "scale on an event-sequence buffer".into(),
            )),
            Self::PluginCond => Err(EngineError::InvalidOperation(
                "scale on a condition buffer".into(),
            )),
        }
    }
}

/// Merge two frame-sorted sequences through a scratch buffer, ties going to
/// the first input, then copy the result over `dst`.
fn mix_sequences(host: &HostState, src: &[u8], dst: &mut [u8]) -> Result<()> {
    let mut merged = [0u8; ATOM_DATA_SIZE];

    {
        let mut events1 = atom::read_sequence(src, &host.urids)?.peekable();
        let mut events2 = atom::read_sequence(dst, &host.urids)?.peekable();
        let mut writer = atom::SequenceWriter::new(&mut merged, &host.urids);

        loop {
            let event = match (events1.peek(), events2.peek()) {
                (Some(e1), Some(e2)) => {
                    if e1.frames <= e2.frames {
                        events1.next().unwrap()
                    } else {
                        events2.next().unwrap()
                    }
                }
                (Some(_), None) => events1.next().unwrap(),
                (None, Some(_)) => events2.next().unwrap(),
                (None, None) => break,
            };
            writer.append(event.frames, event.type_urid, event.payload)?;
        }
    }

    dst.copy_from_slice(&merged[..dst.len()]);
    Ok(())
}

pub fn read_control_value(buf: &[u8]) -> ControlValue {
    ControlValue {
        value: f32::from_ne_bytes(buf[0..4].try_into().unwrap()),
        generation: u32::from_ne_bytes(buf[4..8].try_into().unwrap()),
    }
}

pub fn write_control_value(buf: &mut [u8], cv: ControlValue) {
    buf[0..4].copy_from_slice(&cv.value.to_ne_bytes());
    buf[4..8].copy_from_slice(&cv.generation.to_ne_bytes());
}

/// Sample view over an audio-block buffer.
#[allow(unsafe_code)]
pub fn samples(buf: &[u8], block_size: Frames) -> &[f32] {
    debug_assert!(buf.len() >= block_size * 4);
    debug_assert_eq!(buf.as_ptr() as usize % std::mem::align_of::<f32>(), 0);
    // SAFETY: arena allocations are 64-byte aligned and the length is
    // checked above; f32 has no invalid bit patterns.
    unsafe { std::slice::from_raw_parts(buf.as_ptr().cast::<f32>(), block_size) }
}

/// Mutable sample view over an audio-block buffer.
#[allow(unsafe_code)]
pub fn samples_mut(buf: &mut [u8], block_size: Frames) -> &mut [f32] {
    debug_assert!(buf.len() >= block_size * 4);
    debug_assert_eq!(buf.as_ptr() as usize % std::mem::align_of::<f32>(), 0);
    // SAFETY: arena allocations are 64-byte aligned and the length is
    // checked above; f32 has no invalid bit patterns.
    unsafe { std::slice::from_raw_parts_mut(buf.as_mut_ptr().cast::<f32>(), block_size) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> HostState {
        HostState::new(48_000, 64)
    }

    #[test]
    fn test_control_value_mix() {
        let host = host();
        let mut a = vec![0u8; 8];
        let mut b = vec![0u8; 8];
        write_control_value(
            &mut a,
            ControlValue {
                value: 0.25,
                generation: 3,
            },
        );
        write_control_value(
            &mut b,
            ControlValue {
                value: 0.5,
                generation: 7,
            },
        );

        BufferType::FloatCv.mix(&host, 64, &a, &mut b).unwrap();
        let mixed = read_control_value(&b);
        assert_eq!(mixed.value, 0.75);
        assert_eq!(mixed.generation, 8);
    }

    #[test]
    fn test_control_value_mul_bumps_generation() {
        let mut buf = vec![0u8; 8];
        write_control_value(
            &mut buf,
            ControlValue {
                value: 2.0,
                generation: 1,
            },
        );
        BufferType::FloatCv.mul(64, &mut buf, 0.5).unwrap();
        let cv = read_control_value(&buf);
        assert_eq!(cv.value, 1.0);
        assert_eq!(cv.generation, 2);
    }

    #[test]
    fn test_audio_clear_mix_mul() {
        let host = host();
        let block_size = 16;
        let mut a = vec![0u8; BufferType::FloatAudio.size(block_size)];
        let mut b = vec![0u8; BufferType::FloatAudio.size(block_size)];

        samples_mut(&mut a, block_size).fill(0.25);
        samples_mut(&mut b, block_size).fill(0.5);

        BufferType::FloatAudio
            .mix(&host, block_size, &a, &mut b)
            .unwrap();
        for &s in samples_mut(&mut b, block_size).iter() {
            assert_eq!(s, 0.75);
        }

        BufferType::FloatAudio.mul(block_size, &mut b, 2.0).unwrap();
        for &s in samples_mut(&mut b, block_size).iter() {
            assert_eq!(s, 1.5);
        }

        BufferType::FloatAudio
            .clear(&host, block_size, &mut b)
            .unwrap();
        for &s in samples_mut(&mut b, block_size).iter() {
            assert_eq!(s, 0.0);
        }
    }

    #[test]
    fn test_event_mix_interleaves_sorted() {
        // Events at {0, 10, 20} and {5, 15} must merge to
        // {0, 5, 10, 15, 20}
        let host = host();
        let u = host.urids;
        let mut a = vec![0u8; ATOM_DATA_SIZE];
        let mut b = vec![0u8; ATOM_DATA_SIZE];

        let mut writer = atom::SequenceWriter::new(&mut a, &u);
        writer.append(0, u.midi_event, b"A").unwrap();
        writer.append(10, u.midi_event, b"B").unwrap();
        writer.append(20, u.midi_event, b"C").unwrap();

        let mut writer = atom::SequenceWriter::new(&mut b, &u);
        writer.append(5, u.midi_event, b"X").unwrap();
        writer.append(15, u.midi_event, b"Y").unwrap();

        BufferType::AtomData.mix(&host, 64, &a, &mut b).unwrap();

        let events: Vec<_> = atom::read_sequence(&b, &u).unwrap().collect();
        let got: Vec<(i64, &[u8])> = events.iter().map(|e| (e.frames, e.payload)).collect();
        assert_eq!(
            got,
            vec![
                (0, b"A".as_slice()),
                (5, b"X".as_slice()),
                (10, b"B".as_slice()),
                (15, b"Y".as_slice()),
                (20, b"C".as_slice()),
            ]
        );
    }

    #[test]
    fn test_event_mix_tie_takes_first_input() {
        let host = host();
        let u = host.urids;
        let mut a = vec![0u8; ATOM_DATA_SIZE];
        let mut b = vec![0u8; ATOM_DATA_SIZE];

        let mut writer = atom::SequenceWriter::new(&mut a, &u);
        writer.append(5, u.midi_event, b"first").unwrap();
        let mut writer = atom::SequenceWriter::new(&mut b, &u);
        writer.append(5, u.midi_event, b"second").unwrap();

        BufferType::AtomData.mix(&host, 64, &a, &mut b).unwrap();

        let events: Vec<_> = atom::read_sequence(&b, &u).unwrap().collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].payload, b"first");
        assert_eq!(events[1].payload, b"second");
    }

    #[test]
    fn test_event_count_is_sum() {
        let host = host();
        let u = host.urids;
        let mut a = vec![0u8; ATOM_DATA_SIZE];
        let mut b = vec![0u8; ATOM_DATA_SIZE];

        let mut writer = atom::SequenceWriter::new(&mut a, &u);
        for i in 0..7 {
            writer.append(i * 2, u.midi_event, &[i as u8]).unwrap();
        }
        let mut writer = atom::SequenceWriter::new(&mut b, &u);
        for i in 0..5 {
            writer.append(i * 3, u.midi_event, &[100 + i as u8]).unwrap();
        }

        BufferType::AtomData.mix(&host, 64, &a, &mut b).unwrap();
        let count = atom::read_sequence(&b, &u).unwrap().count();
        assert_eq!(count, 12);
    }

    #[test]
    fn test_forbidden_operations() {
        let host = host();
        let mut buf = vec![0u8; ATOM_DATA_SIZE];
        assert!(matches!(
            BufferType::AtomData.mul(64, &mut buf, 2.0),
            Err(EngineError::InvalidOperation(_))
        ));

        let mut cond = vec![0u8; BufferType::PluginCond.size(64)];
        assert!(matches!(
            BufferType::PluginCond.clear(&host, 64, &mut cond),
            Err(EngineError::InvalidOperation(_))
        ));
        let src = cond.clone();
        assert!(matches!(
            BufferType::PluginCond.mix(&host, 64, &src, &mut cond),
            Err(EngineError::InvalidOperation(_))
        ));
    }
}
