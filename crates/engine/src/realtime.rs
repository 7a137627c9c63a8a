use basedrop::{Collector, Handle};
use cpal::{
    FromSample, SizedSample,
    traits::{DeviceTrait, HostTrait, StreamTrait},
};

use crate::analysis::AnalysisTap;
use crate::mixer::Mixer;
use crate::{EngineError, FrameClock, MixBackend, MixCommand, SessionGeneration};

/// Frames mixed per inner iteration of the output callback.
const MIX_CHUNK_FRAMES: usize = 512;

/// A mix graph running on the default output device.
pub struct AudioEngineHandle {
    pub commands: rtrb::Producer<MixCommand>,
    pub collector: Collector,
    pub handle: Handle,
    clock: FrameClock,
    generation: SessionGeneration,
    tap: AnalysisTap,
    _stream: cpal::Stream,
}

/// Open the default output device and start pulling from a fresh mix graph.
pub fn start(command_capacity: usize) -> anyhow::Result<AudioEngineHandle> {
    let collector = Collector::new();
    let handle = collector.handle();

    let (command_tx, command_rx) = rtrb::RingBuffer::<MixCommand>::new(command_capacity);

    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| anyhow::anyhow!("no output device found"))?;

    let config = device.default_output_config()?;
    let clock = FrameClock::new(config.sample_rate().0);
    let tap = AnalysisTap::new();
    let mixer = Mixer::new(clock.clone(), Some(tap.clone()));
    let generation = mixer.generation().clone();

    let stream = match config.sample_format() {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config.into(), mixer, command_rx)?,
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config.into(), mixer, command_rx)?,
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config.into(), mixer, command_rx)?,
        sample_format => anyhow::bail!("unsupported sample format '{sample_format}'"),
    };

    stream.play()?;
    log::info!("output stream running at {} Hz", clock.sample_rate());

    Ok(AudioEngineHandle {
        commands: command_tx,
        collector,
        handle,
        clock,
        generation,
        tap,
        _stream: stream,
    })
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut mixer: Mixer,
    mut command_rx: rtrb::Consumer<MixCommand>,
) -> anyhow::Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let output_channels = config.channels as usize;
    let mut scratch = vec![0.0f32; MIX_CHUNK_FRAMES * 2];

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            while let Ok(cmd) = command_rx.pop() {
                mixer.apply(cmd);
            }

            for block in data.chunks_mut(MIX_CHUNK_FRAMES * output_channels) {
                let frames = block.len() / output_channels;
                let mixed = &mut scratch[..frames * 2];
                mixer.process(mixed);

                for (frame, stereo) in block.chunks_mut(output_channels).zip(mixed.chunks_exact(2)) {
                    if output_channels == 1 {
                        frame[0] = T::from_sample((stereo[0] + stereo[1]) * 0.5);
                        continue;
                    }
                    for (ch, sample) in frame.iter_mut().enumerate() {
                        *sample = match ch {
                            0 => T::from_sample(stereo[0]),
                            1 => T::from_sample(stereo[1]),
                            _ => T::from_sample(0.0),
                        };
                    }
                }
            }
        },
        |err| log::error!("stream error: {err}"),
        None,
    )?;

    Ok(stream)
}

impl MixBackend for AudioEngineHandle {
    fn sample_rate(&self) -> u32 {
        self.clock.sample_rate()
    }

    fn clock(&self) -> &FrameClock {
        &self.clock
    }

    fn analysis(&self) -> Option<&AnalysisTap> {
        Some(&self.tap)
    }

    fn generation(&self) -> &SessionGeneration {
        &self.generation
    }

    fn gc_handle(&self) -> Handle {
        self.handle.clone()
    }

    fn send(&mut self, command: MixCommand) -> Result<(), EngineError> {
        self.commands
            .push(command)
            .map_err(|_| EngineError::QueueFull)
    }

    fn collect(&mut self) {
        self.collector.collect();
    }
}
