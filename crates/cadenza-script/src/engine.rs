//! The compiled engine: channels, voices, tables, and the ksmps step.

use std::collections::HashMap;

use cadenza_core::{Result, SampleRate};

pub use crate::orchestra::{ChannelDirection, ChannelRate};
use crate::expr::{self, EvalContext};
use crate::lock::{SpinLock, SpinLockGuard};
use crate::orchestra::{Orchestra, Stmt, Target};
use crate::score::{ScoreEvent, parse_score};

/// An exported channel with its backing storage.
struct Channel {
    name: String,
    rate: ChannelRate,
    direction: ChannelDirection,
    data: SpinLock<Vec<f32>>,
}

/// One sounding instance of an instrument.
struct Voice {
    instrument: usize,
    tag: f32,
    pfields: [f32; 16],
    locals: Vec<f32>,
    /// Oscillator phases / sample positions
    states: Vec<f64>,
    /// Remaining samples; `None` while held
    remaining: Option<u64>,
}

/// An event scheduled in absolute sample time.
struct Scheduled {
    time: u64,
    event: ScoreEvent,
}

/// A compiled orchestra + score, ready to perform.
///
/// Input channels are written by the host, [`perform`](Self::perform)
/// advances exactly one ksmps tick, output channels are read back. Channel
/// copies go through per-channel spin locks; everything else assumes a
/// single performing thread.
pub struct ScriptEngine {
    orchestra: Orchestra,
    sample_rate: SampleRate,
    channels: Vec<Channel>,
    tables: HashMap<u32, Vec<f32>>,
    voices: Vec<Voice>,
    pending: Vec<Scheduled>,
    now: u64,
}

impl ScriptEngine {
    /// Compile orchestra and score texts.
    pub fn compile(orchestra: &str, score: &str, sample_rate: SampleRate) -> Result<Self> {
        let orchestra = Orchestra::parse(orchestra)?;
        tracing::debug!(
            "compiled orchestra: ksmps={} channels={} instruments={}",
            orchestra.ksmps,
            orchestra.channels.len(),
            orchestra.instruments.len()
        );

        let channels = orchestra
            .channels
            .iter()
            .map(|decl| Channel {
                name: decl.name.clone(),
                rate: decl.rate,
                direction: decl.direction,
                data: SpinLock::new(vec![
                    0.0;
                    match decl.rate {
                        ChannelRate::Audio => orchestra.ksmps,
                        ChannelRate::Control => 1,
                    }
                ]),
            })
            .collect();

        let mut engine = Self {
            orchestra,
            sample_rate,
            channels,
            tables: HashMap::new(),
            voices: Vec::new(),
            pending: Vec::new(),
            now: 0,
        };
        engine.read_score(score)?;
        Ok(engine)
    }

    pub fn ksmps(&self) -> usize {
        self.orchestra.ksmps
    }

    pub fn sample_rate(&self) -> SampleRate {
        self.sample_rate
    }

    /// Number of currently sounding voices.
    pub fn active_voices(&self) -> usize {
        self.voices.len()
    }

    /// Register a function table (e.g. sample data for the `sample` opcode).
    pub fn set_table(&mut self, number: u32, data: Vec<f32>) {
        self.tables.insert(number, data);
    }

    /// Index of an exported channel by name.
    pub fn channel_index(&self, name: &str) -> Option<usize> {
        self.channels.iter().position(|c| c.name == name)
    }

    pub fn channel_rate(&self, idx: usize) -> ChannelRate {
        self.channels[idx].rate
    }

    pub fn channel_direction(&self, idx: usize) -> ChannelDirection {
        self.channels[idx].direction
    }

    /// Copy a channel's current tick out, under its lock. For control
    /// channels only `out[0]` is written.
    pub fn read_channel(&self, idx: usize, out: &mut [f32]) {
        let data = self.channels[idx].data.lock();
        let n = out.len().min(data.len());
        out[..n].copy_from_slice(&data[..n]);
    }

    /// Copy into a channel for the coming tick, under its lock.
    pub fn write_channel(&self, idx: usize, input: &[f32]) {
        let mut data = self.channels[idx].data.lock();
        let n = input.len().min(data.len());
        data[..n].copy_from_slice(&input[..n]);
    }

    /// Schedule additional score statements relative to now.
    pub fn read_score(&mut self, text: &str) -> Result<()> {
        let events = parse_score(text)?;
        for event in events {
            let offset = (event.start_time() * f64::from(self.sample_rate)) as u64;
            self.pending.push(Scheduled {
                time: self.now + offset,
                event,
            });
        }
        self.pending.sort_by_key(|s| s.time);
        Ok(())
    }

    /// Run one ksmps tick.
    pub fn perform(&mut self) -> Result<()> {
        self.dispatch_due_events();

        let ksmps = self.orchestra.ksmps;
        let sample_rate = self.sample_rate as f32;

        // Hold every channel lock for the duration of the tick. They are
        // uncontended except for control-thread channel pokes, which spin
        // for at most one tick.
        let mut guards: Vec<SpinLockGuard<'_, Vec<f32>>> =
            self.channels.iter().map(|c| c.data.lock()).collect();

        for (channel, guard) in self.channels.iter().zip(guards.iter_mut()) {
            if channel.direction == ChannelDirection::Output {
                guard.fill(0.0);
            }
        }

        for voice in &mut self.voices {
            let instrument = &self.orchestra.instruments[voice.instrument];
            let samples = match voice.remaining {
                Some(remaining) => (remaining as usize).min(ksmps),
                None => ksmps,
            };
            for sample in 0..samples {
                let mut ctx = VoiceCtx {
                    sample,
                    sample_rate,
                    channels: &mut guards,
                    pfields: &voice.pfields,
                    locals: &mut voice.locals,
                    states: &mut voice.states,
                    tables: &self.tables,
                };
                run_stmts(&instrument.statements, &mut ctx);
            }
            if let Some(remaining) = voice.remaining.as_mut() {
                *remaining = remaining.saturating_sub(ksmps as u64);
            }
        }
        drop(guards);

        self.voices
            .retain(|voice| voice.remaining != Some(0));

        self.now += ksmps as u64;
        Ok(())
    }

    fn dispatch_due_events(&mut self) {
        while let Some(scheduled) = self.pending.first() {
            if scheduled.time > self.now {
                break;
            }
            let scheduled = self.pending.remove(0);
            match scheduled.event {
                ScoreEvent::Start {
                    tag, dur, pfields, ..
                } => self.start_voice(tag, dur, &pfields),
                ScoreEvent::Stop { tag, .. } => {
                    self.voices
                        .retain(|v| v.remaining.is_some() || (v.tag - tag).abs() > 1e-4);
                }
            }
        }
    }

    fn start_voice(&mut self, tag: f32, dur: f64, extra_pfields: &[f32]) {
        let number = tag.trunc() as i32;
        let Some(instrument_idx) = self.orchestra.instrument_index(number) else {
            // An unknown instrument is a score bug, not an engine fault
            return;
        };
        let instrument = &self.orchestra.instruments[instrument_idx];

        let mut pfields = [0.0f32; 16];
        pfields[0] = tag;
        pfields[1] = 0.0;
        pfields[2] = dur as f32;
        for (slot, value) in pfields[3..].iter_mut().zip(extra_pfields) {
            *slot = *value;
        }

        let remaining = if dur < 0.0 {
            None
        } else {
            Some((dur * f64::from(self.sample_rate)).round() as u64)
        };

        self.voices.push(Voice {
            instrument: instrument_idx,
            tag,
            pfields,
            locals: vec![0.0; instrument.num_locals],
            states: vec![0.0; instrument.num_states],
            remaining,
        });
    }
}

struct VoiceCtx<'a, 'g> {
    sample: usize,
    sample_rate: f32,
    channels: &'a mut [SpinLockGuard<'g, Vec<f32>>],
    pfields: &'a [f32; 16],
    locals: &'a mut Vec<f32>,
    states: &'a mut Vec<f64>,
    tables: &'a HashMap<u32, Vec<f32>>,
}

impl VoiceCtx<'_, '_> {
    fn store(&mut self, target: Target, value: f32) {
        match target {
            Target::Local(slot) => self.locals[slot] = value,
            Target::Channel(idx) => {
                let data = &mut *self.channels[idx];
                let at = self.sample.min(data.len() - 1);
                data[at] = value;
            }
        }
    }
}

impl EvalContext for VoiceCtx<'_, '_> {
    fn pfield(&self, idx: usize) -> f32 {
        self.pfields.get(idx - 1).copied().unwrap_or(0.0)
    }

    fn local(&self, slot: usize) -> f32 {
        self.locals[slot]
    }

    fn channel(&self, idx: usize) -> f32 {
        let data = &*self.channels[idx];
        data[self.sample.min(data.len() - 1)]
    }

    fn oscil(&mut self, state: usize, amp: f32, freq: f32) -> f32 {
        let phase = self.states[state];
        let out = amp * (std::f64::consts::TAU * phase).sin() as f32;
        let mut next = phase + f64::from(freq) / f64::from(self.sample_rate);
        if next >= 1.0 {
            next -= 1.0;
        }
        self.states[state] = next;
        out
    }

    fn sample(&mut self, state: usize, table: u32, amp: f32, pitch: f32) -> f32 {
        let pos = self.states[state];
        self.states[state] = pos + f64::from(pitch);
        let Some(data) = self.tables.get(&table) else {
            return 0.0;
        };
        let idx = pos as usize;
        if pos < 0.0 || idx >= data.len() {
            return 0.0;
        }
        amp * data[idx]
    }
}

fn run_stmts(stmts: &[Stmt], ctx: &mut VoiceCtx<'_, '_>) {
    for stmt in stmts {
        match stmt {
            Stmt::Assign { target, expr } => {
                let value = expr::eval(expr, ctx);
                ctx.store(*target, value);
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                if expr::eval(cond, ctx) > 0.5 {
                    run_stmts(then_body, ctx);
                } else {
                    run_stmts(else_body, ctx);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SINE_ORCHESTRA: &str = r#"
ksmps = 16
nchnls = 2

gaOut chnexport "out", 2
gkGain chnexport "gain", 1

instr 1
  aSig oscil p5 / 127, cpsmidinn(p4)
  gaOut = gaOut + aSig
endin
"#;

    fn rms(samples: &[f32]) -> f32 {
        (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
    }

    #[test]
    fn test_silent_without_score() {
        let mut engine = ScriptEngine::compile(SINE_ORCHESTRA, "", 48_000).unwrap();
        engine.perform().unwrap();

        let out = engine.channel_index("out").unwrap();
        let mut samples = vec![1.0f32; 16];
        engine.read_channel(out, &mut samples);
        assert!(samples.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_held_note_produces_signal_until_released() {
        let mut engine = ScriptEngine::compile(SINE_ORCHESTRA, "", 48_000).unwrap();
        engine.read_score("i 1.60 0 -1 60 100\n").unwrap();

        let out = engine.channel_index("out").unwrap();
        let mut samples = vec![0.0f32; 16];

        let mut total = 0.0;
        for _ in 0..64 {
            engine.perform().unwrap();
            engine.read_channel(out, &mut samples);
            total += rms(&samples);
        }
        assert!(total > 0.0, "held note must produce signal");
        assert_eq!(engine.active_voices(), 1);

        engine.read_score("i -1.60 0 0 0\n").unwrap();
        engine.perform().unwrap();
        assert_eq!(engine.active_voices(), 0);

        engine.perform().unwrap();
        engine.read_channel(out, &mut samples);
        assert!(samples.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_oscillator_frequency() {
        // One full period of a 3000 Hz sine at 48 kHz is 16 samples
        let mut engine = ScriptEngine::compile(
            "ksmps = 16\ngaOut chnexport \"out\", 2\ninstr 1\n aSig oscil 1, 3000\n gaOut = aSig\nendin\n",
            "i 1 0 -1\n",
            48_000,
        )
        .unwrap();

        let out = engine.channel_index("out").unwrap();
        let mut first = vec![0.0f32; 16];
        let mut second = vec![0.0f32; 16];
        engine.perform().unwrap();
        engine.read_channel(out, &mut first);
        engine.perform().unwrap();
        engine.read_channel(out, &mut second);

        // Periodic: the second tick repeats the first
        for (a, b) in first.iter().zip(&second) {
            assert!((a - b).abs() < 1e-3);
        }
        assert!(rms(&first) > 0.5);
    }

    #[test]
    fn test_timed_note_expires() {
        // 0.001 s at 48 kHz = 48 samples = 3 ticks of 16
        let mut engine =
            ScriptEngine::compile(SINE_ORCHESTRA, "i 1 0 0.001 60 100\n", 48_000).unwrap();
        engine.perform().unwrap();
        assert_eq!(engine.active_voices(), 1);
        engine.perform().unwrap();
        engine.perform().unwrap();
        assert_eq!(engine.active_voices(), 0);
    }

    #[test]
    fn test_control_channel_feeds_instrument() {
        let orchestra = r#"
ksmps = 8
gaOut chnexport "out", 2
gkLevel chnexport "level", 1

instr 1
  gaOut = gkLevel
endin
"#;
        let mut engine = ScriptEngine::compile(orchestra, "i 1 0 -1\n", 48_000).unwrap();
        let level = engine.channel_index("level").unwrap();
        let out = engine.channel_index("out").unwrap();

        engine.write_channel(level, &[0.75]);
        engine.perform().unwrap();

        let mut samples = vec![0.0f32; 8];
        engine.read_channel(out, &mut samples);
        assert!(samples.iter().all(|&s| s == 0.75));
    }

    #[test]
    fn test_sample_table_playback() {
        let orchestra = r#"
ksmps = 4
gaOut chnexport "out", 2

instr 1
  aSig sample 1, 1, 1
  gaOut = aSig
endin
"#;
        let mut engine = ScriptEngine::compile(orchestra, "i 1 0 -1\n", 48_000).unwrap();
        engine.set_table(1, vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6]);

        let out = engine.channel_index("out").unwrap();
        let mut samples = vec![0.0f32; 4];

        engine.perform().unwrap();
        engine.read_channel(out, &mut samples);
        assert_eq!(samples, vec![0.1, 0.2, 0.3, 0.4]);

        engine.perform().unwrap();
        engine.read_channel(out, &mut samples);
        // Table exhausted halfway through the second tick
        assert_eq!(samples, vec![0.5, 0.6, 0.0, 0.0]);
    }

    #[test]
    fn test_polyphony_sums_voices() {
        let mut engine = ScriptEngine::compile(SINE_ORCHESTRA, "", 48_000).unwrap();
        engine.read_score("i 1.60 0 -1 60 100\n").unwrap();
        engine.read_score("i 1.64 0 -1 64 100\n").unwrap();
        engine.perform().unwrap();
        assert_eq!(engine.active_voices(), 2);

        // Releasing one tag leaves the other sounding
        engine.read_score("i -1.60 0 0 0\n").unwrap();
        engine.perform().unwrap();
        assert_eq!(engine.active_voices(), 1);
    }
}
