//! G.711 companding expansion.
//!
//! PCMU (µ-law) and PCMA (A-law) payloads are expanded to linear 16-bit
//! PCM before the engine measures energy or feeds its concealment history.
//! Tables follow ITU-T G.711 segment/mantissa layout.

const BIAS: i32 = 0x84;

pub fn ulaw_to_linear(byte: u8) -> i16 {
    let u = !byte;
    let t = (((u & 0x0f) as i32) << 3) + BIAS;
    let t = t << ((u & 0x70) >> 4);

    if u & 0x80 != 0 { (BIAS - t) as i16 } else { (t - BIAS) as i16 }
}

pub fn alaw_to_linear(byte: u8) -> i16 {
    let a = byte ^ 0x55;
    let mut t = ((a & 0x0f) as i32) << 4;
    let seg = (a & 0x70) >> 4;

    match seg {
        0 => t += 8,
        1 => t += 0x108,
        _ => {
            t += 0x108;
            t <<= seg - 1;
        }
    }

    if a & 0x80 != 0 { t as i16 } else { -t as i16 }
}

/// Expands a payload into linear PCM according to the stream's payload
/// type. Unknown types are interpreted as little-endian 16-bit samples.
pub fn expand(payload: &[u8], payload_type: u8) -> Vec<i16> {
    match payload_type {
        0 => payload.iter().map(|&b| ulaw_to_linear(b)).collect(),
        8 => payload.iter().map(|&b| alaw_to_linear(b)).collect(),
        _ => payload
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect(),
    }
}
