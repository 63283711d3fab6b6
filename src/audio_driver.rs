//! Audio driver interface (spec §6): two fixed-format PCM streams, capture
//! callback and playback pull, 160 samples (20 ms) at a time.
//!
//! `CpalAudioDriver` adapts the teacher's `audio.rs` stream-building code
//! (device enumeration, per-`SampleFormat` stream construction) to the
//! fixed 8 kHz/16-bit/mono/160-sample contract the spec requires, instead
//! of the teacher's negotiated-format passthrough.

use crate::config::{FRAME_SAMPLES, SAMPLE_RATE_HZ};
use crate::error::Error;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use parking_lot::Mutex;
use std::sync::Arc;

/// What the core consumes from the platform's audio stack (spec §6): a
/// capture callback fed 160-sample blocks, and a playback pull that fills
/// a caller-provided buffer.
pub trait AudioDriver: Send + Sync {
    fn start_capture(&self, on_frame: Box<dyn FnMut(&[i16; FRAME_SAMPLES]) + Send>) -> Result<(), Error>;
    fn start_playback(&self, pull: Box<dyn FnMut(&mut [i16; FRAME_SAMPLES]) + Send>) -> Result<(), Error>;
    fn stop(&self);
}

/// Accumulates arbitrary-sized host callback chunks into fixed 160-sample
/// blocks before handing them onward — cpal's own callback size is
/// host-negotiated and rarely lines up with the spec's frame size.
struct FrameAccumulator {
    buf: Vec<i16>,
}

impl FrameAccumulator {
    fn new() -> Self {
        Self { buf: Vec::with_capacity(FRAME_SAMPLES * 2) }
    }

    /// Push raw samples in, draining complete frames out via `emit`.
    fn push(&mut self, samples: &[i16], mut emit: impl FnMut(&[i16; FRAME_SAMPLES])) {
        self.buf.extend_from_slice(samples);
        while self.buf.len() >= FRAME_SAMPLES {
            let mut frame = [0i16; FRAME_SAMPLES];
            frame.copy_from_slice(&self.buf[..FRAME_SAMPLES]);
            emit(&frame);
            self.buf.drain(..FRAME_SAMPLES);
        }
    }
}

/// `AudioDriver` backed by CPAL, fixed to the spec's 8 kHz mono 16-bit
/// 160-sample-frame contract regardless of what the host device natively
/// negotiates.
pub struct CpalAudioDriver {
    input_stream: Mutex<Option<cpal::Stream>>,
    output_stream: Mutex<Option<cpal::Stream>>,
}

impl CpalAudioDriver {
    pub fn new() -> Self {
        Self {
            input_stream: Mutex::new(None),
            output_stream: Mutex::new(None),
        }
    }

    fn stream_config() -> StreamConfig {
        StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(SAMPLE_RATE_HZ),
            buffer_size: cpal::BufferSize::Default,
        }
    }
}

impl Default for CpalAudioDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioDriver for CpalAudioDriver {
    fn start_capture(&self, on_frame: Box<dyn FnMut(&[i16; FRAME_SAMPLES]) + Send>) -> Result<(), Error> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(Error::LinkUnavailable)?;
        let config = Self::stream_config();
        let sample_format = device
            .default_input_config()
            .map_err(|_| Error::LinkUnavailable)?
            .sample_format();

        let accum = Arc::new(Mutex::new(FrameAccumulator::new()));
        let on_frame = Arc::new(Mutex::new(on_frame));

        let build = |accum: Arc<Mutex<FrameAccumulator>>, on_frame: Arc<Mutex<Box<dyn FnMut(&[i16; FRAME_SAMPLES]) + Send>>>| {
            move |samples: &[i16]| {
                let mut accum = accum.lock();
                let mut cb = on_frame.lock();
                accum.push(samples, |frame| (cb)(frame));
            }
        };

        let stream = match sample_format {
            SampleFormat::I16 => {
                let cb = build(accum, on_frame);
                device
                    .build_input_stream(
                        &config,
                        move |data: &[i16], _| cb(data),
                        |err| eprintln!("[AUDIO][ERR] capture stream: {err}"),
                        None,
                    )
                    .map_err(|_| Error::LinkUnavailable)?
            }
            SampleFormat::F32 => {
                let cb = build(accum, on_frame);
                device
                    .build_input_stream(
                        &config,
                        move |data: &[f32], _| {
                            let converted: Vec<i16> =
                                data.iter().map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16).collect();
                            cb(&converted);
                        },
                        |err| eprintln!("[AUDIO][ERR] capture stream: {err}"),
                        None,
                    )
                    .map_err(|_| Error::LinkUnavailable)?
            }
            other => {
                eprintln!("[AUDIO] unsupported input sample format {other:?}, no capture stream built");
                return Err(Error::LinkUnavailable);
            }
        };
        stream.play().map_err(|_| Error::LinkUnavailable)?;
        *self.input_stream.lock() = Some(stream);
        Ok(())
    }

    fn start_playback(&self, pull: Box<dyn FnMut(&mut [i16; FRAME_SAMPLES]) + Send>) -> Result<(), Error> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(Error::LinkUnavailable)?;
        let config = Self::stream_config();
        let sample_format = device
            .default_output_config()
            .map_err(|_| Error::LinkUnavailable)?
            .sample_format();

        let pull = Arc::new(Mutex::new(pull));
        let leftover: Arc<Mutex<Vec<i16>>> = Arc::new(Mutex::new(Vec::new()));

        let fill = move |dest: &mut [i16], pull: &Arc<Mutex<Box<dyn FnMut(&mut [i16; FRAME_SAMPLES]) + Send>>>, leftover: &Arc<Mutex<Vec<i16>>>| {
            let mut out_pos = 0;
            let mut leftover = leftover.lock();
            while out_pos < dest.len() {
                if leftover.is_empty() {
                    let mut frame = [0i16; FRAME_SAMPLES];
                    (pull.lock())(&mut frame);
                    leftover.extend_from_slice(&frame);
                }
                let take = leftover.len().min(dest.len() - out_pos);
                dest[out_pos..out_pos + take].copy_from_slice(&leftover[..take]);
                leftover.drain(..take);
                out_pos += take;
            }
        };

        let stream = match sample_format {
            SampleFormat::I16 => {
                let pull = pull.clone();
                let leftover = leftover.clone();
                device
                    .build_output_stream(
                        &config,
                        move |dest: &mut [i16], _| fill(dest, &pull, &leftover),
                        |err| eprintln!("[AUDIO][ERR] playback stream: {err}"),
                        None,
                    )
                    .map_err(|_| Error::LinkUnavailable)?
            }
            SampleFormat::F32 => {
                let pull = pull.clone();
                let leftover = leftover.clone();
                device
                    .build_output_stream(
                        &config,
                        move |dest: &mut [f32], _| {
                            let mut ints = vec![0i16; dest.len()];
                            fill(&mut ints, &pull, &leftover);
                            for (d, s) in dest.iter_mut().zip(ints.iter()) {
                                *d = *s as f32 / i16::MAX as f32;
                            }
                        },
                        |err| eprintln!("[AUDIO][ERR] playback stream: {err}"),
                        None,
                    )
                    .map_err(|_| Error::LinkUnavailable)?
            }
            other => {
                eprintln!("[AUDIO] unsupported output sample format {other:?}, no playback stream built");
                return Err(Error::LinkUnavailable);
            }
        };
        stream.play().map_err(|_| Error::LinkUnavailable)?;
        *self.output_stream.lock() = Some(stream);
        Ok(())
    }

    fn stop(&self) {
        self.input_stream.lock().take();
        self.output_stream.lock().take();
    }
}
