//! Audio duration probing.
//!
//! Decoding is only needed for the real-time-factor estimate, so the
//! capability is chosen once at startup ([`select_decoder`]) and handed to
//! the duration sampler as an `Arc<dyn AudioDecoder>`.  Nothing else in the
//! crate decodes audio.
//!
//! | Decoder              | Reads                                          |
//! |----------------------|------------------------------------------------|
//! | [`SymphoniaDecoder`] | WAV, FLAC, Ogg/Vorbis, MP3, … via `symphonia`  |
//! | [`WavDecoder`]       | RIFF/WAVE headers only, via `hound`            |
//! | [`FallbackDecoder`]  | primary first, secondary if the primary fails  |

use std::io::Cursor;
use std::sync::Arc;

use symphonia::core::codecs::CODEC_TYPE_NULL;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;

use crate::config::DecoderChoice;

// ---------------------------------------------------------------------------
// DecodeError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum DecodeError {
    /// The container could not be recognised or parsed.
    #[error("unsupported or corrupt audio: {0}")]
    Format(String),

    /// The stream declares no usable audio track.
    #[error("no audio track found")]
    NoTrack,

    /// The sample rate is missing or zero, so no duration can be derived.
    #[error("unknown sample rate")]
    UnknownSampleRate,
}

// ---------------------------------------------------------------------------
// AudioDecoder trait
// ---------------------------------------------------------------------------

/// Object-safe, thread-safe duration probe.
pub trait AudioDecoder: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Duration of the encoded clip in seconds.
    fn duration_secs(&self, bytes: &[u8], mime: &str) -> Result<f64, DecodeError>;
}

/// Build the decoder capability for this run.
pub fn select_decoder(choice: DecoderChoice) -> Arc<dyn AudioDecoder> {
    let decoder: Arc<dyn AudioDecoder> = match choice {
        DecoderChoice::Auto => Arc::new(FallbackDecoder::new(SymphoniaDecoder, WavDecoder)),
        DecoderChoice::Symphonia => Arc::new(SymphoniaDecoder),
        DecoderChoice::Wav => Arc::new(WavDecoder),
    };
    log::info!("audio: duration probing via {}", decoder.name());
    decoder
}

// ---------------------------------------------------------------------------
// SymphoniaDecoder
// ---------------------------------------------------------------------------

/// General-purpose probe backed by `symphonia`.
///
/// Uses the container's declared frame count when present and otherwise
/// walks the packets of the default track, summing their durations.
#[derive(Debug, Clone, Copy, Default)]
pub struct SymphoniaDecoder;

impl AudioDecoder for SymphoniaDecoder {
    fn name(&self) -> &'static str {
        "symphonia"
    }

    fn duration_secs(&self, bytes: &[u8], mime: &str) -> Result<f64, DecodeError> {
        // MediaSourceStream needs an owned 'static source.
        let source = Cursor::new(bytes.to_vec());
        let mss = MediaSourceStream::new(Box::new(source), Default::default());

        let mut hint = Hint::new();
        hint.mime_type(mime);

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| DecodeError::Format(e.to_string()))?;
        let mut format = probed.format;

        let (track_id, n_frames, sample_rate, time_base) = {
            let track = format
                .tracks()
                .iter()
                .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
                .ok_or(DecodeError::NoTrack)?;
            let params = &track.codec_params;
            (track.id, params.n_frames, params.sample_rate, params.time_base)
        };

        if let (Some(frames), Some(rate)) = (n_frames, sample_rate) {
            if rate == 0 {
                return Err(DecodeError::UnknownSampleRate);
            }
            return Ok(frames as f64 / f64::from(rate));
        }

        let mut total_ts: u64 = 0;
        loop {
            match format.next_packet() {
                Ok(packet) if packet.track_id() == track_id => total_ts += packet.dur,
                Ok(_) => {}
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break
                }
                Err(e) => return Err(DecodeError::Format(e.to_string())),
            }
        }

        match (time_base, sample_rate) {
            (Some(tb), _) => {
                let t = tb.calc_time(total_ts);
                Ok(t.seconds as f64 + t.frac)
            }
            (None, Some(rate)) if rate > 0 => Ok(total_ts as f64 / f64::from(rate)),
            _ => Err(DecodeError::UnknownSampleRate),
        }
    }
}

// ---------------------------------------------------------------------------
// WavDecoder
// ---------------------------------------------------------------------------

/// Header-only probe for RIFF/WAVE payloads, backed by `hound`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WavDecoder;

impl AudioDecoder for WavDecoder {
    fn name(&self) -> &'static str {
        "wav"
    }

    fn duration_secs(&self, bytes: &[u8], _mime: &str) -> Result<f64, DecodeError> {
        let reader = hound::WavReader::new(Cursor::new(bytes))
            .map_err(|e| DecodeError::Format(e.to_string()))?;
        let rate = reader.spec().sample_rate;
        if rate == 0 {
            return Err(DecodeError::UnknownSampleRate);
        }
        Ok(f64::from(reader.duration()) / f64::from(rate))
    }
}

// ---------------------------------------------------------------------------
// FallbackDecoder
// ---------------------------------------------------------------------------

/// Tries `primary`, then `secondary` when the primary cannot read the clip.
pub struct FallbackDecoder<P: AudioDecoder, S: AudioDecoder> {
    primary: P,
    secondary: S,
}

impl<P: AudioDecoder, S: AudioDecoder> FallbackDecoder<P, S> {
    pub fn new(primary: P, secondary: S) -> Self {
        Self { primary, secondary }
    }
}

impl<P: AudioDecoder, S: AudioDecoder> AudioDecoder for FallbackDecoder<P, S> {
    fn name(&self) -> &'static str {
        "fallback"
    }

    fn duration_secs(&self, bytes: &[u8], mime: &str) -> Result<f64, DecodeError> {
        match self.primary.duration_secs(bytes, mime) {
            Ok(secs) => Ok(secs),
            Err(err) => {
                log::debug!(
                    "audio: {} failed ({err}), trying {}",
                    self.primary.name(),
                    self.secondary.name()
                );
                self.secondary.duration_secs(bytes, mime)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// 16-bit mono PCM WAV of `secs` seconds at `rate` Hz.
    fn wav_bytes(rate: u32, secs: f64) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            let n = (f64::from(rate) * secs) as usize;
            for i in 0..n {
                writer.write_sample((i % 128) as i16).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    struct AlwaysFails;

    impl AudioDecoder for AlwaysFails {
        fn name(&self) -> &'static str {
            "fails"
        }
        fn duration_secs(&self, _: &[u8], _: &str) -> Result<f64, DecodeError> {
            Err(DecodeError::NoTrack)
        }
    }

    #[test]
    fn wav_decoder_reads_header_duration() {
        let bytes = wav_bytes(16_000, 1.5);
        let secs = WavDecoder.duration_secs(&bytes, "audio/wav").unwrap();
        assert!((secs - 1.5).abs() < 1e-6, "{secs}");
    }

    #[test]
    fn symphonia_decoder_reads_wav() {
        let bytes = wav_bytes(8_000, 2.0);
        let secs = SymphoniaDecoder.duration_secs(&bytes, "audio/wav").unwrap();
        assert!((secs - 2.0).abs() < 1e-3, "{secs}");
    }

    #[test]
    fn garbage_is_a_format_error() {
        let err = WavDecoder.duration_secs(b"not audio at all", "audio/wav").unwrap_err();
        assert!(matches!(err, DecodeError::Format(_)));
        assert!(SymphoniaDecoder.duration_secs(b"not audio", "audio/wav").is_err());
    }

    #[test]
    fn fallback_uses_secondary_when_primary_fails() {
        let decoder = FallbackDecoder::new(AlwaysFails, WavDecoder);
        let bytes = wav_bytes(16_000, 0.25);
        let secs = decoder.duration_secs(&bytes, "audio/wav").unwrap();
        assert!((secs - 0.25).abs() < 1e-6);
    }

    #[test]
    fn selected_decoders_are_object_safe() {
        for choice in [DecoderChoice::Auto, DecoderChoice::Symphonia, DecoderChoice::Wav] {
            let decoder = select_decoder(choice);
            let bytes = wav_bytes(16_000, 1.0);
            let secs = decoder.duration_secs(&bytes, "audio/wav").unwrap();
            assert!((secs - 1.0).abs() < 1e-3);
        }
    }
}
