//! Linear-interpolation sample rate conversion for mono PCM16.
//!
//! Voice bandwidth on a phone line tops out near 3.4 kHz, so linear
//! interpolation between 8 kHz and 16/24 kHz is adequate in both directions.

/// Resample `input` from `from_hz` to `to_hz`.
pub fn resample_linear(input: &[i16], from_hz: u32, to_hz: u32) -> Vec<i16> {
    if from_hz == to_hz || input.is_empty() {
        return input.to_vec();
    }

    let out_len = ((input.len() as u64 * to_hz as u64) / from_hz as u64) as usize;
    let step = from_hz as f64 / to_hz as f64;
    let last = input.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos.floor() as usize;
            if idx >= last {
                return input[last];
            }
            let frac = pos - idx as f64;
            let a = input[idx] as f64;
            let b = input[idx + 1] as f64;
            (a + (b - a) * frac).round() as i16
        })
        .collect()
}

/// Convert little-endian PCM16 bytes into samples. A trailing odd byte is ignored.
pub fn pcm16_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Serialize samples as little-endian PCM16 bytes.
pub fn pcm16_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}
