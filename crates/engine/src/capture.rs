//! Microphone capture into an in-memory WAV blob.

use std::io::Cursor;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

pub const CAPTURE_MIME: &str = "audio/wav";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    /// The input device is missing, unavailable, or access was refused.
    #[error("microphone access denied: {0}")]
    PermissionDenied(String),
    #[error("input device error: {0}")]
    Device(String),
    #[error("failed to encode capture: {0}")]
    Encode(String),
}

/// Captured audio, tagged with its container type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureBlob {
    pub mime: String,
    pub bytes: Vec<u8>,
}

impl CaptureBlob {
    pub fn empty() -> Self {
        Self {
            mime: CAPTURE_MIME.to_string(),
            bytes: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// A running input stream. Dropping or releasing it stops capture.
pub trait InputHandle {
    fn release(self: Box<Self>);
}

pub struct OpenInput {
    pub sample_rate: u32,
    pub channels: u16,
    /// Interleaved samples pushed by the device callback.
    pub samples: rtrb::Consumer<f32>,
    pub handle: Box<dyn InputHandle>,
}

/// Source of input audio.
pub trait InputBackend {
    /// Open the input, with room for about `buffer_secs` of undrained audio.
    fn open(&mut self, buffer_secs: f32) -> Result<OpenInput, CaptureError>;
}

struct ActiveCapture {
    input: OpenInput,
    captured: Vec<f32>,
}

/// Accumulates input between `start_capture` and `stop_capture`.
pub struct Recorder<I = CpalInput> {
    backend: I,
    buffer_secs: f32,
    active: Option<ActiveCapture>,
}

impl<I: InputBackend> Recorder<I> {
    pub fn new(backend: I, buffer_secs: f32) -> Self {
        Self {
            backend,
            buffer_secs,
            active: None,
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.active.is_some()
    }

    /// Open the input. A capture already running is left untouched.
    pub fn start_capture(&mut self) -> Result<(), CaptureError> {
        if self.active.is_some() {
            log::debug!("capture already running");
            return Ok(());
        }

        let input = self.backend.open(self.buffer_secs)?;
        log::info!(
            "capturing at {} Hz, {} channel(s)",
            input.sample_rate,
            input.channels
        );
        self.active = Some(ActiveCapture {
            input,
            captured: Vec::new(),
        });
        Ok(())
    }

    /// Move everything the device has produced so far into the capture.
    /// Call this often enough that the ring never fills.
    pub fn poll(&mut self) -> usize {
        let Some(active) = &mut self.active else {
            return 0;
        };
        let before = active.captured.len();
        while let Ok(sample) = active.input.samples.pop() {
            active.captured.push(sample);
        }
        active.captured.len() - before
    }

    /// Stop the input and return what was captured.
    ///
    /// The stream is released even when encoding fails.
    pub fn stop_capture(&mut self) -> Result<CaptureBlob, CaptureError> {
        self.poll();
        let Some(active) = self.active.take() else {
            return Ok(CaptureBlob::empty());
        };

        let ActiveCapture { input, captured } = active;
        input.handle.release();

        if captured.is_empty() {
            return Ok(CaptureBlob::empty());
        }

        let bytes = encode_float_wav(&captured, input.sample_rate, input.channels)?;
        log::info!(
            "captured {} frames",
            captured.len() / input.channels.max(1) as usize
        );
        Ok(CaptureBlob {
            mime: CAPTURE_MIME.to_string(),
            bytes,
        })
    }
}

fn encode_float_wav(samples: &[f32], sample_rate: u32, channels: u16) -> Result<Vec<u8>, CaptureError> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut cursor = Cursor::new(Vec::new());
    let mut writer = hound::WavWriter::new(&mut cursor, spec)
        .map_err(|e| CaptureError::Encode(e.to_string()))?;
    for &sample in samples {
        writer
            .write_sample(sample)
            .map_err(|e| CaptureError::Encode(e.to_string()))?;
    }
    writer
        .finalize()
        .map_err(|e| CaptureError::Encode(e.to_string()))?;
    Ok(cursor.into_inner())
}

/// The default input device.
#[derive(Debug, Default)]
pub struct CpalInput;

struct CpalHandle {
    stream: cpal::Stream,
}

impl InputHandle for CpalHandle {
    fn release(self: Box<Self>) {
        if let Err(err) = self.stream.pause() {
            log::debug!("pausing input stream failed: {err}");
        }
    }
}

impl InputBackend for CpalInput {
    fn open(&mut self, buffer_secs: f32) -> Result<OpenInput, CaptureError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| CaptureError::PermissionDenied("no input device available".to_string()))?;

        let config = device.default_input_config().map_err(|e| match e {
            cpal::DefaultStreamConfigError::DeviceNotAvailable => {
                CaptureError::PermissionDenied(e.to_string())
            }
            other => CaptureError::Device(other.to_string()),
        })?;

        if config.sample_format() != cpal::SampleFormat::F32 {
            return Err(CaptureError::Device(format!(
                "unsupported sample format '{}'",
                config.sample_format()
            )));
        }

        let sample_rate = config.sample_rate().0;
        let channels = config.channels();
        let capacity = (buffer_secs.max(0.1) * sample_rate as f32) as usize * channels as usize;
        let (mut producer, consumer) = rtrb::RingBuffer::<f32>::new(capacity);

        let stream = device
            .build_input_stream(
                &config.into(),
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    for &sample in data {
                        let _ = producer.push(sample);
                    }
                },
                |err| log::error!("input stream error: {err}"),
                None,
            )
            .map_err(|e| match e {
                cpal::BuildStreamError::DeviceNotAvailable => {
                    CaptureError::PermissionDenied(e.to_string())
                }
                other => CaptureError::Device(other.to_string()),
            })?;

        stream.play().map_err(|e| match e {
            cpal::PlayStreamError::DeviceNotAvailable => {
                CaptureError::PermissionDenied(e.to_string())
            }
            other => CaptureError::Device(other.to_string()),
        })?;

        Ok(OpenInput {
            sample_rate,
            channels,
            samples: consumer,
            handle: Box::new(CpalHandle { stream }),
        })
    }
}
