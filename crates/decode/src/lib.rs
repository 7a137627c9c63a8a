mod store;

use std::fs::File;
use std::io::Cursor;
use std::path::Path;

use studio_transport::{AudioArc, SourceRef};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

pub use store::{ClipBufferStore, SourceDecoder, SymphoniaDecoder};

/// Why a source could not be turned into a decoded buffer. Cloneable so a
/// memoized failure can be handed to every caller waiting on it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("failed to read source '{source_name}': {message}")]
    Read {
        source_name: String,
        message: String,
    },

    #[error("unsupported audio format: {0}")]
    Unsupported(String),

    #[error("corrupt audio data: {0}")]
    Corrupt(String),

    #[error("resampling failed: {0}")]
    Resample(String),

    #[error("decode task failed: {0}")]
    Task(String),
}

impl From<SymphoniaError> for DecodeError {
    fn from(err: SymphoniaError) -> Self {
        match err {
            SymphoniaError::Unsupported(what) => DecodeError::Unsupported(what.to_string()),
            other => DecodeError::Corrupt(other.to_string()),
        }
    }
}

/// Decode any supported source into interleaved f32 samples at its native rate.
pub fn decode_source(source: &SourceRef) -> Result<AudioArc, DecodeError> {
    match source {
        SourceRef::File(path) => decode_file(path),
        SourceRef::Memory { bytes, hint } => {
            let cursor = Cursor::new(bytes.clone());
            decode_stream(Box::new(cursor), hint.as_deref())
        }
    }
}

pub fn decode_file(path: &Path) -> Result<AudioArc, DecodeError> {
    let file = File::open(path).map_err(|e| DecodeError::Read {
        source_name: path.display().to_string(),
        message: e.to_string(),
    })?;
    let hint = path.extension().and_then(|e| e.to_str());
    decode_stream(Box::new(file), hint)
}

pub fn decode_bytes(bytes: Vec<u8>, hint: Option<&str>) -> Result<AudioArc, DecodeError> {
    decode_stream(Box::new(Cursor::new(bytes)), hint)
}

fn decode_stream(
    source: Box<dyn MediaSource>,
    extension: Option<&str>,
) -> Result<AudioArc, DecodeError> {
    let mss = MediaSourceStream::new(source, Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;

    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| DecodeError::Unsupported("no default track".to_string()))?;

    let sample_rate = track.codec_params.sample_rate.unwrap_or(44100);
    let mut channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(0) as u16;
    let track_id = track.id;

    let mut decoder =
        symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

    let mut samples = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(e.into()),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = decoder.decode(&packet)?;
        let spec = *decoded.spec();
        if channels == 0 {
            channels = spec.channels.count() as u16;
        }
        let duration = decoded.capacity() as u64;

        let mut sample_buf = SampleBuffer::<f32>::new(duration, spec);
        sample_buf.copy_interleaved_ref(decoded);
        samples.extend_from_slice(sample_buf.samples());
    }

    if channels == 0 {
        return Err(DecodeError::Unsupported(
            "stream does not declare a channel layout".to_string(),
        ));
    }
    // A truncated final packet may leave a partial frame behind
    let whole = samples.len() - samples.len() % channels as usize;
    samples.truncate(whole);

    Ok(AudioArc::new(samples, sample_rate, channels))
}
