//! Audio quality engine.
//!
//! Per-stream context owning the jitter buffer, the codec encoder/decoder
//! pair, the concealment lookback ring, the duplicate-detection history and
//! the adaptive play-out delay. Every accepted media packet is expanded to
//! PCM, classified by a voice-activity decision, re-framed through the
//! adaptive codec and queued by expected play-out time; the play-out side
//! hands frames to the decoder or synthesizes concealment when the network
//! failed to deliver.

pub mod buffer;
pub mod codec;
pub mod g711;
pub mod plc;

use self::{
    buffer::{AudioPacket, JitterBuffer, MAX_JITTER_BUFFER_PACKETS, SequenceHistory},
    codec::{CodecApplication, CodecDecoder, CodecEncoder, CodecError, MediaCodec},
    plc::{MAX_PREV_SAMPLES, PlcMode},
};

/// Bitrate adaptation bounds, in bits per second.
pub const MIN_BITRATE: u32 = 6_000;
pub const MAX_BITRATE: u32 = 64_000;
const BITRATE_STEP: u32 = 1_000;

/// Loss rates steering the bitrate: back off above 10 %, recover below 1 %.
const LOSS_BACKOFF: f64 = 0.10;
const LOSS_RECOVER: f64 = 0.01;

/// Asymmetric play-out delay adjustment: grow fast, shrink slow.
const DELAY_RAISE_US: i64 = 2_000;
const DELAY_LOWER_US: i64 = 1_000;

/// Extra play-out delay while concealment was recently needed.
const PLC_DELAY_PENALTY_MS: f64 = 5.0;

/// Jitter-buffer scheduling knobs.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct JitterControl {
    pub min_delay_ms: u32,
    pub max_delay_ms: u32,
    pub target_delay_ms: u32,
    pub jitter_factor: f64,
    pub fec_lookahead_ms: u32,
    pub sequence_history: usize,
}

impl Default for JitterControl {
    fn default() -> Self {
        Self {
            min_delay_ms: 20,
            max_delay_ms: 100,
            target_delay_ms: 40,
            jitter_factor: 1.5,
            fec_lookahead_ms: 20,
            sequence_history: 32,
        }
    }
}

/// Codec control-channel settings applied at stream creation.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CodecConfig {
    pub application: CodecApplication,
    pub complexity: u8,
    pub bitrate: u32,
    pub use_inband_fec: bool,
    pub use_dtx: bool,
    pub packet_loss_perc: u8,
    pub max_payload_size: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            application: CodecApplication::Voip,
            complexity: 10,
            bitrate: MAX_BITRATE,
            use_inband_fec: true,
            use_dtx: true,
            packet_loss_perc: 10,
            max_payload_size: 1500,
        }
    }
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct AudioConfig {
    pub plc_mode: PlcMode,
    /// Comfort-noise level, 0-100.
    pub comfort_noise_level: u8,
    /// Frames louder than this are treated as speech.
    pub speech_threshold_db: f32,
    pub codec: CodecConfig,
    pub jitter: JitterControl,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            plc_mode: PlcMode::Advanced,
            comfort_noise_level: 30,
            speech_threshold_db: -30.0,
            codec: CodecConfig::default(),
            jitter: JitterControl::default(),
        }
    }
}

/// Engine-side counters, one set per stream.
#[derive(Debug, Default, Clone)]
pub struct AudioStats {
    pub packets_received: u64,
    /// Duplicates, overflow rejections and too-late arrivals all land here.
    pub packets_lost: u64,
    pub dropped_packets: u64,
    pub late_packets: u64,
    pub plc_events: u32,
    pub plc_duration_ms: u64,
    pub inserted_silence_ms: u64,
    pub current_bitrate: u32,
    pub fec_used: bool,
    pub plc_used: bool,
}

/// What happened to a packet offered to the engine.
#[derive(Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    Accepted,
    /// Counted as lost and relabeled `last_seq + 1` before insertion.
    Duplicate,
    /// Rejected by the jitter buffer, counted as lost.
    Overflow,
    /// The encoder refused the frame; the packet was skipped.
    CodecFailure,
}

/// One play-out poll result.
#[derive(Debug)]
pub enum Playout {
    /// Decoded PCM of the head packet.
    Frame(Vec<i16>),
    /// Head packet exists but is not due yet; the caller plays silence.
    Silence,
    /// Head packet overstayed `max_delay_ms`; a concealment frame is
    /// returned instead and the packet was dropped.
    Concealed(Vec<i16>),
    Empty,
}

pub struct AudioContext<C: MediaCodec> {
    config: AudioConfig,
    encoder: C::Encoder,
    decoder: C::Decoder,
    sample_rate: u32,
    frame_samples: usize,
    source_payload_type: u8,
    buffer: JitterBuffer,
    history: SequenceHistory,
    /// Decoded-sample ring for concealment lookback.
    lookback: Vec<i16>,
    /// PCM of the previous frame, re-encoded as the redundant FEC twin.
    prev_frame: Option<Vec<i16>>,
    last_sequence: u16,
    adaptive_delay_us: i64,
    /// Mapping from RTP media time to the local microsecond clock,
    /// established by the first packet.
    media_epoch_us: Option<i64>,
    observed_loss: f64,
    jitter_us: f64,
    encode_buf: Vec<u8>,
    stats: AudioStats,
}

impl<C: MediaCodec> AudioContext<C> {
    pub fn new(
        codec: &C,
        config: AudioConfig,
        source_payload_type: u8,
        sample_rate: u32,
    ) -> Result<Self, CodecError> {
        let mut encoder = codec.create_encoder(sample_rate, 1, config.codec.application)?;
        encoder.set_complexity(config.codec.complexity);
        encoder.set_bitrate(config.codec.bitrate.clamp(MIN_BITRATE, MAX_BITRATE));
        encoder.set_inband_fec(config.codec.use_inband_fec);
        encoder.set_dtx(config.codec.use_dtx);
        encoder.set_packet_loss_perc(config.codec.packet_loss_perc);

        let decoder = codec.create_decoder(sample_rate, 1)?;

        Ok(Self {
            frame_samples: (sample_rate / 50) as usize,
            adaptive_delay_us: config.jitter.target_delay_ms as i64 * 1000,
            history: SequenceHistory::new(config.jitter.sequence_history),
            buffer: JitterBuffer::new(MAX_JITTER_BUFFER_PACKETS),
            encode_buf: vec![0; config.codec.max_payload_size],
            lookback: Vec::with_capacity(MAX_PREV_SAMPLES),
            prev_frame: None,
            media_epoch_us: None,
            last_sequence: 0,
            observed_loss: 0.0,
            jitter_us: 0.0,
            stats: AudioStats::default(),
            source_payload_type,
            sample_rate,
            encoder,
            decoder,
            config,
        })
    }

    /// Network-condition inputs from the stream analyzer, consulted by the
    /// bitrate adaptation and the play-out scheduler.
    pub fn set_network_state(&mut self, loss_rate: f64, jitter_us: f64) {
        self.observed_loss = loss_rate;
        self.jitter_us = jitter_us;
    }

    /// Feeds one media packet through duplicate detection, the adaptive
    /// encoder and into the jitter buffer.
    pub fn process_packet(
        &mut self,
        payload: &[u8],
        sequence: u16,
        timestamp: u32,
        arrival_us: i64,
    ) -> ProcessOutcome {
        let original_sequence = sequence;
        let mut duplicate = false;
        let mut sequence = sequence;

        if self.history.observe(sequence) {
            // The relabeling keeps downstream gap accounting simple at the
            // cost of misnaming the packet; the next arrival sees the
            // rewritten value.
            self.stats.packets_lost += 1;
            duplicate = true;
            sequence = self.last_sequence.wrapping_add(1);
        }
        self.last_sequence = sequence;

        let mut pcm = g711::expand(payload, self.source_payload_type);
        pcm.resize(self.frame_samples, 0);

        let energy = plc::energy_level(&pcm);
        let is_speech = energy > self.config.speech_threshold_db;

        self.adapt_bitrate();
        if self.config.codec.use_dtx {
            let non_speech = energy <= self.config.speech_threshold_db;
            self.encoder.set_dtx(non_speech);
        }

        let encoded = match self.encoder.encode(&pcm, &mut self.encode_buf) {
            Ok(n) => n,
            Err(_) => return ProcessOutcome::CodecFailure,
        };
        self.stats.current_bitrate = encoded as u32 * 8 * 50;

        let media_us = self.media_time_us(timestamp);
        self.media_epoch_us.get_or_insert(arrival_us - media_us);

        let packet = AudioPacket {
            payload: self.encode_buf[..encoded].to_vec(),
            timestamp,
            sequence,
            original_sequence,
            arrival_us,
            expected_play_us: self.expected_play_us(arrival_us),
            energy_db: energy,
            is_speech,
            is_fec: false,
        };

        if self.buffer.insert(packet).is_err() {
            self.stats.packets_lost += 1;
            self.stats.dropped_packets += 1;
            return ProcessOutcome::Overflow;
        }
        self.stats.packets_received += 1;

        if self.config.codec.use_inband_fec && self.config.jitter.fec_lookahead_ms > 0 {
            self.insert_fec_twin(sequence, timestamp, arrival_us);
        }

        self.prev_frame = Some(pcm);
        self.adjust_playout_delay();

        if duplicate {
            ProcessOutcome::Duplicate
        } else {
            ProcessOutcome::Accepted
        }
    }

    /// A redundant description of the prior frame, tagged `sequence + 1`
    /// and flagged as FEC.
    fn insert_fec_twin(&mut self, sequence: u16, timestamp: u32, arrival_us: i64) {
        let Some(prev) = self.prev_frame.as_ref() else {
            return;
        };

        let Ok(encoded) = self.encoder.encode(prev, &mut self.encode_buf) else {
            return;
        };

        let twin = AudioPacket {
            payload: self.encode_buf[..encoded].to_vec(),
            timestamp,
            sequence: sequence.wrapping_add(1),
            original_sequence: sequence,
            arrival_us,
            expected_play_us: self.expected_play_us(arrival_us),
            energy_db: 0.0,
            is_speech: false,
            is_fec: true,
        };

        if self.buffer.insert(twin).is_err() {
            self.stats.dropped_packets += 1;
        }
    }

    /// One play-out poll at `now_us`.
    pub fn next_frame(&mut self, now_us: i64) -> Playout {
        let frame_ms = (self.frame_samples as u64 * 1000) / self.sample_rate as u64;

        let Some(head) = self.buffer.head() else {
            return Playout::Empty;
        };

        if now_us < head.expected_play_us {
            self.stats.inserted_silence_ms += frame_ms;
            return Playout::Silence;
        }

        let too_late = self
            .media_epoch_us
            .map(|epoch| {
                let media_us = epoch + self.media_time_us(head.timestamp);
                now_us - media_us > self.config.jitter.max_delay_ms as i64 * 1000
            })
            .unwrap_or(false);

        let packet = match self.buffer.pop() {
            Some(p) => p,
            None => return Playout::Empty,
        };

        if too_late {
            self.stats.late_packets += 1;
            self.stats.packets_lost += 1;
            return Playout::Concealed(self.conceal_frame());
        }

        let mut pcm = vec![0i16; self.frame_samples];
        match self.decoder.decode(Some(&packet.payload), &mut pcm) {
            Ok(samples) => {
                pcm.truncate(samples);
                self.remember(&pcm);
                Playout::Frame(pcm)
            }
            Err(_) => Playout::Concealed(self.conceal_frame()),
        }
    }

    /// Plays out everything currently due. Used by the capture path, which
    /// has no real-time consumer pacing it.
    pub fn drain(&mut self, now_us: i64) {
        loop {
            let due = match self.buffer.head() {
                Some(head) => now_us >= head.expected_play_us,
                None => break,
            };
            if !due {
                break;
            }

            match self.next_frame(now_us) {
                Playout::Frame(_) | Playout::Concealed(_) => {}
                _ => break,
            }
        }
    }

    /// Synthesizes one concealment frame and accounts for it.
    pub fn conceal_frame(&mut self) -> Vec<i16> {
        let mut out = vec![0i16; self.frame_samples];
        plc::conceal(
            self.config.plc_mode,
            &self.lookback,
            &mut out,
            self.config.comfort_noise_level,
            self.sample_rate,
            &mut self.decoder,
        );

        self.stats.plc_used = true;
        self.stats.plc_events += 1;
        self.stats.plc_duration_ms += (self.frame_samples as u64 * 1000) / self.sample_rate as u64;
        out
    }

    /// Decodes a recovered payload straight into the lookback so later
    /// concealment can use it.
    pub fn accept_recovered(&mut self, payload: &[u8]) {
        self.stats.fec_used = true;
        let mut pcm = vec![0i16; self.frame_samples];
        if let Ok(samples) = self.decoder.decode(Some(payload), &mut pcm) {
            pcm.truncate(samples);
            self.remember(&pcm);
        }
    }

    fn remember(&mut self, pcm: &[i16]) {
        self.lookback.extend_from_slice(pcm);
        if self.lookback.len() > MAX_PREV_SAMPLES {
            let excess = self.lookback.len() - MAX_PREV_SAMPLES;
            self.lookback.drain(..excess);
        }
    }

    /// Loss-driven bitrate control: back off 1 kbps above 10 % loss,
    /// recover 1 kbps below 1 %, clamped to `[MIN_BITRATE, MAX_BITRATE]`.
    fn adapt_bitrate(&mut self) {
        let current = self.encoder.bitrate();
        let next = if self.observed_loss > LOSS_BACKOFF {
            current.saturating_sub(BITRATE_STEP)
        } else if self.observed_loss < LOSS_RECOVER {
            current + BITRATE_STEP
        } else {
            return;
        };

        self.encoder.set_bitrate(next.clamp(MIN_BITRATE, MAX_BITRATE));
    }

    /// Target = base + jitter·factor + concealment penalty, clamped to
    /// `[min_delay, max_delay]`. The delay rises 2 ms per update and falls
    /// 1 ms per update, so the buffer grows quickly under pressure and
    /// shrinks slowly.
    fn adjust_playout_delay(&mut self) {
        let jitter_ms = self.jitter_us / 1000.0;
        let penalty = if self.stats.plc_used { PLC_DELAY_PENALTY_MS } else { 0.0 };

        let target_ms = (self.config.jitter.target_delay_ms as f64
            + jitter_ms * self.config.jitter.jitter_factor
            + penalty)
            .clamp(
                self.config.jitter.min_delay_ms as f64,
                self.config.jitter.max_delay_ms as f64,
            );
        let target_us = (target_ms * 1000.0) as i64;

        if target_us > self.adaptive_delay_us {
            self.adaptive_delay_us += DELAY_RAISE_US;
        } else if target_us < self.adaptive_delay_us {
            self.adaptive_delay_us -= DELAY_LOWER_US;
        }
    }

    fn expected_play_us(&self, arrival_us: i64) -> i64 {
        let delay = self.adaptive_delay_us
            + (self.jitter_us * self.config.jitter.jitter_factor) as i64;
        arrival_us + delay.min(self.config.jitter.max_delay_ms as i64 * 1000)
    }

    fn media_time_us(&self, timestamp: u32) -> i64 {
        (timestamp as i128 * 1_000_000 / self.sample_rate as i128) as i64
    }

    pub fn stats(&self) -> &AudioStats {
        &self.stats
    }

    pub fn bitrate(&self) -> u32 {
        self.encoder.bitrate()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn has_lookback(&self) -> bool {
        !self.lookback.is_empty()
    }

    pub fn adaptive_delay_us(&self) -> i64 {
        self.adaptive_delay_us
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::PcmCodec;

    fn context() -> AudioContext<PcmCodec> {
        AudioContext::new(&PcmCodec, AudioConfig::default(), 0, 8000).unwrap()
    }

    fn ulaw_frame() -> Vec<u8> {
        // Alternating loud samples, clearly speech after expansion.
        vec![0x8a; 160]
    }

    #[test]
    fn packets_flow_to_playout() {
        let mut ctx = context();
        let r = ctx.process_packet(&ulaw_frame(), 1, 160, 1_000_000);
        assert_eq!(r, ProcessOutcome::Accepted);
        assert!(ctx.buffered() >= 1);

        // Well past the play-out deadline but inside max_delay.
        match ctx.next_frame(1_000_000 + 90_000) {
            Playout::Frame(pcm) => assert_eq!(pcm.len(), 160),
            other => panic!("expected frame, got {:?}", other),
        }
        assert!(ctx.has_lookback());
    }

    #[test]
    fn early_poll_signals_silence() {
        let mut ctx = context();
        ctx.process_packet(&ulaw_frame(), 1, 160, 1_000_000);

        assert!(matches!(ctx.next_frame(1_000_000), Playout::Silence));
        assert!(ctx.stats().inserted_silence_ms >= 20);
    }

    #[test]
    fn duplicate_is_lost_and_relabeled() {
        let mut ctx = context();
        ctx.process_packet(&ulaw_frame(), 500, 160, 1_000_000);
        let r = ctx.process_packet(&ulaw_frame(), 500, 320, 1_020_000);

        assert_eq!(r, ProcessOutcome::Duplicate);
        assert_eq!(ctx.stats().packets_lost, 1);
        // Relabeled to last_seq + 1; a third 500 is again a duplicate of
        // the original entry, not of the rewritten one.
        assert_eq!(ctx.last_sequence, 501);
    }

    #[test]
    fn bitrate_backs_off_under_loss_and_recovers() {
        let mut config = AudioConfig::default();
        config.codec.bitrate = 32_000;
        config.codec.use_inband_fec = false;
        let mut ctx = AudioContext::new(&PcmCodec, config, 0, 8000).unwrap();

        ctx.set_network_state(0.20, 0.0);
        for i in 0..10 {
            ctx.process_packet(&ulaw_frame(), i, i as u32 * 160, 1_000_000 + i as i64 * 20_000);
        }
        // One 1 kbps step per encode.
        assert_eq!(ctx.bitrate(), 32_000 - 10 * 1_000);

        for i in 10..50 {
            ctx.process_packet(&ulaw_frame(), i, i as u32 * 160, 1_000_000 + i as i64 * 20_000);
        }
        // Floored at MIN_BITRATE.
        assert_eq!(ctx.bitrate(), MIN_BITRATE);

        ctx.set_network_state(0.0, 0.0);
        for i in 50..60 {
            ctx.process_packet(&ulaw_frame(), i, i as u32 * 160, 1_000_000 + i as i64 * 20_000);
        }
        assert_eq!(ctx.bitrate(), MIN_BITRATE + 10 * 1_000);
    }

    #[test]
    fn fec_twin_rides_one_sequence_ahead() {
        let mut ctx = context();
        ctx.process_packet(&ulaw_frame(), 10, 160, 1_000_000);
        // First packet has no prior frame, no twin yet.
        assert_eq!(ctx.buffered(), 1);

        ctx.process_packet(&ulaw_frame(), 11, 320, 1_020_000);
        assert_eq!(ctx.buffered(), 3);
    }

    #[test]
    fn playout_delay_grows_fast_and_shrinks_slow() {
        let mut ctx = context();
        let base = ctx.adaptive_delay_us();

        ctx.set_network_state(0.0, 40_000.0);
        ctx.process_packet(&ulaw_frame(), 1, 160, 1_000_000);
        let grown = ctx.adaptive_delay_us();
        assert_eq!(grown, base + DELAY_RAISE_US);

        ctx.set_network_state(0.0, 0.0);
        ctx.process_packet(&ulaw_frame(), 2, 320, 1_020_000);
        assert_eq!(ctx.adaptive_delay_us(), grown - DELAY_LOWER_US);
    }
}
