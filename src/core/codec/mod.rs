//! Frame codec between the telephony wire format and provider audio formats.
//!
//! The telephony leg always speaks 8 kHz μ-law in 20ms frames (160 bytes).
//! Providers either accept μ-law directly or want PCM16 at their own rate.

pub mod g711;
pub mod resample;
mod wav;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub use g711::{decode_mulaw, encode_mulaw, linear16_to_mulaw, mulaw_to_linear16};
pub use resample::{pcm16_from_le_bytes, pcm16_to_le_bytes, resample_linear};
pub use wav::load_wav_frames;

/// Duration of one media frame in milliseconds.
pub const FRAME_MS: u32 = 20;

/// Telephony sample rate.
pub const TELEPHONY_SAMPLE_RATE: u32 = 8000;

/// Size of one 20ms μ-law frame.
pub const TELEPHONY_FRAME_BYTES: usize = 160;

/// μ-law encoding of digital silence.
pub const MULAW_SILENCE: u8 = 0xFF;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid sample rate: {0}")]
    InvalidSampleRate(u32),

    #[error("Invalid audio payload: {0}")]
    InvalidPayload(String),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Audio format on the provider side of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "encoding", rename_all = "snake_case")]
pub enum AudioFormat {
    /// G.711 μ-law at 8 kHz, identical to the telephony leg.
    G711Ulaw,
    /// Little-endian signed 16-bit PCM, mono.
    Pcm16 { sample_rate: u32 },
}

impl AudioFormat {
    pub fn pcm16(sample_rate: u32) -> CodecResult<Self> {
        match sample_rate {
            8000 | 16000 | 24000 | 48000 => Ok(Self::Pcm16 { sample_rate }),
            other => Err(CodecError::InvalidSampleRate(other)),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        match self {
            Self::G711Ulaw => TELEPHONY_SAMPLE_RATE,
            Self::Pcm16 { sample_rate } => *sample_rate,
        }
    }

    pub fn bytes_per_sample(&self) -> usize {
        match self {
            Self::G711Ulaw => 1,
            Self::Pcm16 { .. } => 2,
        }
    }

    /// Bytes in one 20ms frame of this format.
    pub fn frame_bytes(&self) -> usize {
        (self.sample_rate() * FRAME_MS / 1000) as usize * self.bytes_per_sample()
    }

    /// Playback duration of `len` bytes in milliseconds.
    pub fn duration_ms(&self, len: usize) -> u64 {
        let samples = (len / self.bytes_per_sample()) as u64;
        samples * 1000 / self.sample_rate() as u64
    }

    /// Name used on realtime provider sockets.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::G711Ulaw => "g711_ulaw",
            Self::Pcm16 { .. } => "pcm16",
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::G711Ulaw => write!(f, "g711_ulaw"),
            Self::Pcm16 { sample_rate } => write!(f, "pcm16@{sample_rate}"),
        }
    }
}

impl FromStr for AudioFormat {
    type Err = CodecError;

    /// Accepts `g711_ulaw`, `mulaw`, `pcm16` (24 kHz) or `pcm16@<rate>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        match lower.as_str() {
            "g711_ulaw" | "mulaw" | "ulaw" | "pcmu" => Ok(Self::G711Ulaw),
            "pcm16" | "linear16" => Ok(Self::Pcm16 { sample_rate: 24000 }),
            other => {
                if let Some(rate) = other
                    .strip_prefix("pcm16@")
                    .or_else(|| other.strip_prefix("linear16@"))
                {
                    let rate = rate
                        .parse::<u32>()
                        .map_err(|_| CodecError::UnsupportedFormat(s.to_string()))?;
                    Self::pcm16(rate)
                } else {
                    Err(CodecError::UnsupportedFormat(s.to_string()))
                }
            }
        }
    }
}

/// Cuts an arbitrary byte stream into fixed-size frames, carrying the
/// remainder over to the next push.
#[derive(Debug)]
pub struct FrameChunker {
    frame_bytes: usize,
    pending: Vec<u8>,
}

impl FrameChunker {
    pub fn new(frame_bytes: usize) -> Self {
        Self {
            frame_bytes: frame_bytes.max(1),
            pending: Vec::with_capacity(frame_bytes),
        }
    }

    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.pending.extend_from_slice(data);
        let complete = self.pending.len() / self.frame_bytes;
        if complete == 0 {
            return Vec::new();
        }
        let rest = self.pending.split_off(complete * self.frame_bytes);
        let full = std::mem::replace(&mut self.pending, rest);
        full.chunks_exact(self.frame_bytes)
            .map(Bytes::copy_from_slice)
            .collect()
    }

    /// Emit the remainder padded to a full frame with `fill`.
    pub fn flush_padded(&mut self, fill: u8) -> Option<Bytes> {
        if self.pending.is_empty() {
            return None;
        }
        let mut last = std::mem::take(&mut self.pending);
        last.resize(self.frame_bytes, fill);
        Some(Bytes::from(last))
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Converts between telephony μ-law frames and one provider's input/output
/// formats. The outbound direction is stateful because provider audio
/// arrives in arbitrary chunk sizes.
#[derive(Debug)]
pub struct FrameCodec {
    provider_input: AudioFormat,
    provider_output: AudioFormat,
    odd_byte: Option<u8>,
    chunker: FrameChunker,
}

impl FrameCodec {
    pub fn new(provider_input: AudioFormat, provider_output: AudioFormat) -> Self {
        Self {
            provider_input,
            provider_output,
            odd_byte: None,
            chunker: FrameChunker::new(TELEPHONY_FRAME_BYTES),
        }
    }

    pub fn provider_input(&self) -> AudioFormat {
        self.provider_input
    }

    pub fn provider_output(&self) -> AudioFormat {
        self.provider_output
    }

    /// Telephony μ-law frame to the provider's input format.
    pub fn to_provider(&self, mulaw: &[u8]) -> Bytes {
        match self.provider_input {
            AudioFormat::G711Ulaw => Bytes::copy_from_slice(mulaw),
            AudioFormat::Pcm16 { sample_rate } => {
                let pcm = decode_mulaw(mulaw);
                let resampled = resample_linear(&pcm, TELEPHONY_SAMPLE_RATE, sample_rate);
                Bytes::from(pcm16_to_le_bytes(&resampled))
            }
        }
    }

    /// Provider output chunk to zero or more complete 20ms μ-law frames.
    pub fn to_telephony(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        match self.provider_output {
            AudioFormat::G711Ulaw => self.chunker.push(chunk),
            AudioFormat::Pcm16 { sample_rate } => {
                let mut data = Vec::with_capacity(chunk.len() + 1);
                if let Some(b) = self.odd_byte.take() {
                    data.push(b);
                }
                data.extend_from_slice(chunk);
                if data.len() % 2 == 1 {
                    self.odd_byte = data.pop();
                }
                let pcm = pcm16_from_le_bytes(&data);
                let resampled = resample_linear(&pcm, sample_rate, TELEPHONY_SAMPLE_RATE);
                self.chunker.push(&encode_mulaw(&resampled))
            }
        }
    }

    /// Emit any partial frame left at the end of a response, padded with silence.
    pub fn flush(&mut self) -> Option<Bytes> {
        self.odd_byte = None;
        self.chunker.flush_padded(MULAW_SILENCE)
    }

    /// Drop buffered partial audio after an interruption.
    pub fn reset(&mut self) {
        self.odd_byte = None;
        self.chunker.clear();
    }
}

/// Convert a decoded WAV clip into 20ms μ-law telephony frames.
pub fn clip_to_telephony_frames(samples: &[i16], sample_rate: u32) -> Vec<Bytes> {
    let resampled = resample_linear(samples, sample_rate, TELEPHONY_SAMPLE_RATE);
    let mut chunker = FrameChunker::new(TELEPHONY_FRAME_BYTES);
    let mut frames = chunker.push(&encode_mulaw(&resampled));
    frames.extend(chunker.flush_padded(MULAW_SILENCE));
    frames
}
