//! Packet-loss concealment.
//!
//! Four concealment strategies over the stream's lookback ring of decoded
//! samples. The mode is a closed set; each arm is a plain function and no
//! further dispatch is intended.

use rand::Rng;

use super::codec::CodecDecoder;

/// Samples examined when searching for the best-matching waveform window.
pub const ANALYSIS_WINDOW_SIZE: usize = 160;

/// Fade-out applied to the tail of a concealed frame.
pub const MAX_FADE_LENGTH_MS: u32 = 20;

/// Lookback ring depth: 60 ms at 16 kHz.
pub const MAX_PREV_SAMPLES: usize = 960;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum PlcMode {
    Silence,
    Repeat,
    /// Shaped comfort noise following the lookback envelope.
    Pattern,
    #[default]
    Advanced,
}

/// Frame energy in dB over normalized int16 samples:
/// `10·log10(Σ xᵢ² / N + ε)`.
pub fn energy_level(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return -100.0;
    }

    let sum: f32 = samples
        .iter()
        .map(|&s| {
            let x = s as f32 / 32768.0;
            x * x
        })
        .sum();

    10.0 * (sum / samples.len() as f32 + 1e-10).log10()
}

/// Synthesizes one concealment frame into `out`.
pub fn conceal<D: CodecDecoder>(
    mode: PlcMode,
    lookback: &[i16],
    out: &mut [i16],
    comfort_noise_level: u8,
    sample_rate: u32,
    decoder: &mut D,
) {
    match mode {
        PlcMode::Silence => out.fill(0),
        PlcMode::Repeat => conceal_repeat(lookback, out, sample_rate),
        PlcMode::Pattern => conceal_pattern(lookback, out, comfort_noise_level),
        PlcMode::Advanced => {
            conceal_advanced(lookback, out, comfort_noise_level, sample_rate, decoder)
        }
    }
}

/// Repeats the most recent samples with a linear fade over the trailing
/// `MAX_FADE_LENGTH_MS`.
fn conceal_repeat(lookback: &[i16], out: &mut [i16], sample_rate: u32) {
    if lookback.is_empty() {
        out.fill(0);
        return;
    }

    let copy = lookback.len().min(out.len());
    let tail = &lookback[lookback.len() - copy..];
    let fade_samples = fade_samples(sample_rate, out.len());
    let len = out.len();

    for (i, slot) in out.iter_mut().enumerate() {
        let sample = if i < copy { tail[i] } else { 0 };
        *slot = (sample as f32 * fade_at(i, len, fade_samples)) as i16;
    }
}

/// Per-sample noise shaped by the magnitude of the corresponding lookback
/// sample; flat white noise when no history exists.
fn conceal_pattern(lookback: &[i16], out: &mut [i16], comfort_noise_level: u8) {
    let mut rng = rand::rng();
    let noise_level = comfort_noise_level as f32 / 32768.0;

    for (i, slot) in out.iter_mut().enumerate() {
        let random: f32 = rng.random_range(-1.0..1.0);
        let shape = if lookback.is_empty() {
            1.0
        } else {
            lookback[i % lookback.len()].unsigned_abs() as f32 / 32768.0
        };
        *slot = (random * noise_level * shape * 32768.0) as i16;
    }
}

/// Pattern-matched waveform substitution with psychoacoustic gain shaping
/// and a comfort-noise mix. Falls back to codec FEC synthesis when the
/// lookback is empty.
fn conceal_advanced<D: CodecDecoder>(
    lookback: &[i16],
    out: &mut [i16],
    comfort_noise_level: u8,
    sample_rate: u32,
    decoder: &mut D,
) {
    if lookback.is_empty() {
        if decoder.decode(None, out).is_err() {
            out.fill(0);
        }
        return;
    }

    let offset = best_matching_offset(lookback);
    let fade_samples = fade_samples(sample_rate, out.len());
    let noise_level = comfort_noise_level as f32 / 32768.0;
    let mut rng = rand::rng();
    let len = out.len();

    for (i, slot) in out.iter_mut().enumerate() {
        let pattern = lookback[(offset + i) % lookback.len()] as f32;
        let local_energy = local_energy(lookback, i);
        let fade = fade_at(i, len, fade_samples);

        let noise: f32 = rng.random_range(-1.0..1.0) * noise_level * (1.0 - local_energy) * fade;
        let mixed = pattern * fade + noise * 32768.0;
        *slot = mixed.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
    }
}

/// Maximal dot product of each candidate window against the most recent
/// `ANALYSIS_WINDOW_SIZE` samples.
fn best_matching_offset(lookback: &[i16]) -> usize {
    if lookback.len() <= ANALYSIS_WINDOW_SIZE {
        return 0;
    }

    let reference = &lookback[lookback.len() - ANALYSIS_WINDOW_SIZE..];
    let mut best_offset = 0;
    let mut best_correlation = f64::MIN;

    for offset in 0..lookback.len() - ANALYSIS_WINDOW_SIZE {
        let correlation: f64 = (0..ANALYSIS_WINDOW_SIZE)
            .map(|i| lookback[offset + i] as f64 * reference[i] as f64)
            .sum();

        if correlation > best_correlation {
            best_correlation = correlation;
            best_offset = offset;
        }
    }

    best_offset
}

/// Mean normalized magnitude in a half-window around `center`.
fn local_energy(lookback: &[i16], center: usize) -> f32 {
    let half = ANALYSIS_WINDOW_SIZE / 2;
    let start = center.saturating_sub(half);
    let end = (center + half).min(lookback.len());
    if start >= end {
        return 0.0;
    }

    let sum: f32 = lookback[start..end]
        .iter()
        .map(|&s| s.unsigned_abs() as f32 / 32768.0)
        .sum();
    (sum / (end - start) as f32).min(1.0)
}

fn fade_samples(sample_rate: u32, frame_len: usize) -> usize {
    ((MAX_FADE_LENGTH_MS * sample_rate / 1000) as usize).min(frame_len)
}

fn fade_at(i: usize, frame_len: usize, fade_samples: usize) -> f32 {
    if fade_samples == 0 || i < frame_len - fade_samples {
        1.0
    } else {
        (frame_len - i) as f32 / fade_samples as f32
    }
}
