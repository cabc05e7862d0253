//! G.711 μ-law companding.
//!
//! Telephony media streams carry 8-bit μ-law samples at 8 kHz. Providers
//! that do not accept μ-law natively expect little-endian PCM16.

const MULAW_BIAS: i32 = 0x84;
const MULAW_CLIP: i32 = 0x7F7B;

/// Decode one μ-law byte into a linear 16-bit sample.
#[inline]
pub fn mulaw_to_linear16(mu: u8) -> i16 {
    let mu = !mu;
    let sign = mu & 0x80;
    let exponent = ((mu & 0x70) >> 4) as i32;
    let mantissa = (mu & 0x0F) as i32;

    let magnitude = (((mantissa << 3) + MULAW_BIAS) << exponent) - MULAW_BIAS;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Encode one linear 16-bit sample as μ-law.
#[inline]
pub fn linear16_to_mulaw(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80u8
    } else {
        0x00u8
    };
    pcm = pcm.min(MULAW_CLIP) + MULAW_BIAS;

    let mut exponent = 7u8;
    let mut mask = 0x4000;
    while exponent > 0 && (pcm & mask) == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = ((pcm >> (exponent + 3)) & 0x0F) as u8;
    !(sign | (exponent << 4) | mantissa)
}

/// Decode a μ-law buffer into PCM16 samples.
pub fn decode_mulaw(payload: &[u8]) -> Vec<i16> {
    payload.iter().map(|&b| mulaw_to_linear16(b)).collect()
}

/// Encode PCM16 samples into a μ-law buffer.
pub fn encode_mulaw(samples: &[i16]) -> Vec<u8> {
    samples.iter().map(|&s| linear16_to_mulaw(s)).collect()
}
