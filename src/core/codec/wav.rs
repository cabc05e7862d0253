//! Pre-recorded clips for the telephony leg.

use bytes::Bytes;
use std::path::Path;

use super::{CodecError, CodecResult, clip_to_telephony_frames};

/// Load a PCM16 WAV file as 20ms μ-law frames. Multi-channel files are
/// downmixed by taking the first channel.
pub fn load_wav_frames(path: &Path) -> CodecResult<Vec<Bytes>> {
    let mut reader = hound::WavReader::open(path)
        .map_err(|e| CodecError::InvalidPayload(format!("{}: {}", path.display(), e)))?;
    let spec = reader.spec();
    if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(CodecError::UnsupportedFormat(format!(
            "{}: expected 16-bit PCM, got {:?} {}-bit",
            path.display(),
            spec.sample_format,
            spec.bits_per_sample
        )));
    }
    if spec.sample_rate == 0 {
        return Err(CodecError::InvalidSampleRate(0));
    }

    let channels = spec.channels.max(1) as usize;
    let samples = reader
        .samples::<i16>()
        .step_by(channels)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CodecError::InvalidPayload(e.to_string()))?;

    Ok(clip_to_telephony_frames(&samples, spec.sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::TELEPHONY_FRAME_BYTES;
    use tempfile::TempDir;

    fn write_wav(path: &Path, sample_rate: u32, channels: u16, seconds_ms: u32) {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        let frames = sample_rate * seconds_ms / 1000;
        for i in 0..frames {
            for _ in 0..channels {
                writer.write_sample(((i % 100) as i16) * 100).unwrap();
            }
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_load_mono_16k_clip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("apology.wav");
        write_wav(&path, 16000, 1, 1000);

        let frames = load_wav_frames(&path).unwrap();
        assert_eq!(frames.len(), 50);
        assert!(frames.iter().all(|f| f.len() == TELEPHONY_FRAME_BYTES));
    }

    #[test]
    fn test_load_stereo_takes_one_channel() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stereo.wav");
        write_wav(&path, 8000, 2, 500);

        assert_eq!(load_wav_frames(&path).unwrap().len(), 25);
    }

    #[test]
    fn test_missing_file() {
        assert!(load_wav_frames(Path::new("/nonexistent/apology.wav")).is_err());
    }
}
