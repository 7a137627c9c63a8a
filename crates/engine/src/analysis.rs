//! Frequency snapshots of the master bus for visual feedback.

use std::f32::consts::PI;
use std::sync::{Arc, Mutex, PoisonError};

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

pub const FFT_SIZE: usize = 256;
pub const BIN_COUNT: usize = FFT_SIZE / 2;

const SMOOTHING: f32 = 0.8;
const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

struct Window {
    samples: [f32; FFT_SIZE],
    /// Next slot to overwrite; also the oldest sample.
    cursor: usize,
}

struct TapInner {
    window: Mutex<Window>,
    smoothed: Mutex<Vec<f32>>,
    fft: Arc<dyn Fft<f32>>,
}

/// Passive tap on the master bus.
///
/// The audio thread pushes the mono sum of every block; readers call
/// [`snapshot`](AnalysisTap::snapshot) whenever they like. The writer only
/// ever `try_lock`s, so a slow reader costs a skipped block of analysis, never
/// audio.
#[derive(Clone)]
pub struct AnalysisTap {
    inner: Arc<TapInner>,
}

impl AnalysisTap {
    pub fn new() -> Self {
        let fft = FftPlanner::<f32>::new().plan_fft_forward(FFT_SIZE);
        Self {
            inner: Arc::new(TapInner {
                window: Mutex::new(Window {
                    samples: [0.0; FFT_SIZE],
                    cursor: 0,
                }),
                smoothed: Mutex::new(vec![0.0; BIN_COUNT]),
                fft,
            }),
        }
    }

    /// Feed interleaved stereo output. Called from the audio thread.
    pub(crate) fn write(&self, stereo: &[f32]) {
        let Ok(mut window) = self.inner.window.try_lock() else {
            return;
        };
        for frame in stereo.chunks_exact(2) {
            let cursor = window.cursor;
            window.samples[cursor] = (frame[0] + frame[1]) * 0.5;
            window.cursor = (cursor + 1) % FFT_SIZE;
        }
    }

    /// Byte magnitudes for `BIN_COUNT` bins, 0 at -100 dB and 255 at -30 dB,
    /// smoothed over successive snapshots.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut buffer: Vec<Complex<f32>> = {
            let window = self
                .inner
                .window
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            (0..FFT_SIZE)
                .map(|i| window.samples[(window.cursor + i) % FFT_SIZE])
                .enumerate()
                .map(|(n, sample)| Complex::new(sample * blackman(n), 0.0))
                .collect()
        };

        self.inner.fft.process(&mut buffer);

        let mut smoothed = self
            .inner
            .smoothed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        smoothed
            .iter_mut()
            .zip(&buffer[..BIN_COUNT])
            .map(|(previous, bin)| {
                let magnitude = bin.norm() / FFT_SIZE as f32;
                *previous = SMOOTHING * *previous + (1.0 - SMOOTHING) * magnitude;
                to_byte(*previous)
            })
            .collect()
    }
}

impl Default for AnalysisTap {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AnalysisTap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisTap")
            .field("fft_size", &FFT_SIZE)
            .finish()
    }
}

fn blackman(n: usize) -> f32 {
    let phase = 2.0 * PI * n as f32 / FFT_SIZE as f32;
    0.42 - 0.5 * phase.cos() + 0.08 * (2.0 * phase).cos()
}

fn to_byte(magnitude: f32) -> u8 {
    if magnitude <= 0.0 {
        return 0;
    }
    let db = 20.0 * magnitude.log10();
    let scaled = 255.0 * (db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS);
    scaled.clamp(0.0, 255.0) as u8
}
