//! RTP stream table and per-stream analyzer.
//!
//! Streams are keyed by `(SSRC, direction, endpoints)` with NAT64-aware
//! endpoint matching and live in a fixed table of [`MAX_STREAMS`] slots.
//! Each stream runs the RFC 3550 sequence machine and jitter estimator on
//! arrival order, gates the media path through a bounded reorder window,
//! attempts XOR-FEC recovery across loss gaps, and feeds the surviving
//! payloads to its audio context.

pub mod reorder;
pub mod sequence;

use std::net::SocketAddr;

use codec::{Direction, nat64, rtp::{PayloadType, RtpPacket}, sdp::MediaDescription};

use crate::{
    SessionHandler,
    audio::{AudioConfig, AudioContext, AudioStats, ProcessOutcome, codec::MediaCodec},
    stream::{
        reorder::{FecAssembler, InsertOutcome, PendingPacket, ReorderWindow},
        sequence::{SeqOutcome, SequenceTracker},
    },
};

/// Concurrent RTP streams tracked per call.
pub const MAX_STREAMS: usize = 8;

/// Packets per sliding window of the short-term loss rate.
const LOSS_WINDOW_SIZE: f64 = 100.0;

/// Exponential smoothing for the buffer-adaptation jitter estimate.
const JITTER_SMOOTHING_FACTOR: f64 = 0.125;

/// Buffer sizing bounds as multiples of the 20 ms packet interval.
const MIN_JITTER_MULTIPLIER: f64 = 1.5;
const MAX_JITTER_MULTIPLIER: f64 = 4.0;

/// Jitter change (ms) treated as a rapid network shift.
const RAPID_CHANGE_THRESHOLD: f64 = 50.0;

const PACKET_INTERVAL_MS: f64 = 20.0;

/// Smoothed inter-arrival jitter, RFC 3550 section 6.4.1: for each packet
/// with a new timestamp, `transit` is the difference between arrival (in
/// media clock ticks) and the RTP timestamp, and the estimate is damped by
/// 1/16 of each new deviation.
#[derive(Debug, Default)]
struct JitterEstimator {
    transit: Option<i64>,
    jitter: f64,
    spikes: u32,
    last_timestamp: Option<u32>,
}

impl JitterEstimator {
    fn update(&mut self, timestamp: u32, arrival_us: i64, clock_rate: u32) {
        if self.last_timestamp == Some(timestamp) {
            return;
        }
        self.last_timestamp = Some(timestamp);

        let arrival_ticks =
            (arrival_us as i128 * clock_rate as i128 / 1_000_000) as i64;
        let transit = arrival_ticks - timestamp as i64;

        if let Some(prev) = self.transit {
            let d = (transit - prev).abs();
            self.jitter += (d as f64 - self.jitter) / 16.0;

            // A deviation past ~10 ms of media clock is a spike.
            if d > clock_rate as i64 / 100 {
                self.spikes += 1;
            }
        }
        self.transit = Some(transit);
    }

    fn jitter_ticks(&self) -> f64 {
        self.jitter
    }

    fn jitter_us(&self, clock_rate: u32) -> f64 {
        self.jitter * 1_000_000.0 / clock_rate as f64
    }
}

/// Point-in-time counters for display and the final report.
#[derive(Debug, Clone)]
pub struct StreamSummary {
    pub ssrc: u32,
    pub payload_type: u8,
    pub codec_name: String,
    pub direction: Direction,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub packets_received: u64,
    pub lost: u64,
    pub out_of_order: u32,
    pub recovered: u32,
    pub concealed_ms: u64,
    pub corrected_timestamps: u32,
    pub jitter_ms: f64,
    pub jitter_spikes: u32,
    pub loss_rate: f64,
    pub buffer_ms: u32,
    pub buffer_target_ms: u32,
    pub audio: AudioStats,
}

pub struct RtpStream<C: MediaCodec> {
    // Identity.
    pub ssrc: u32,
    pub payload_type: u8,
    pub direction: Direction,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    /// NAT64 form of an endpoint, kept alongside the canonical address
    /// when the same flow shows up translated.
    pub nat64: Option<SocketAddr>,
    codec_name: String,

    // Sequence and timing state.
    clock_rate: u32,
    tracker: SequenceTracker,
    jitter: JitterEstimator,
    last_timestamp: Option<u32>,
    last_arrival_us: Option<i64>,
    corrected_timestamps: u32,

    // Quality aggregates.
    out_of_order: u32,
    recovered: u32,
    concealed_ms: u64,
    consecutive_losses: u32,
    loss_rate: f64,
    mean_frame_size: f64,
    reorder_dropped: u64,
    smoothed_jitter_ms: f64,
    buffer_size_ms: f64,
    buffer_target_ms: u32,

    // Media path.
    window: ReorderWindow,
    fec: FecAssembler,
    last_media_seq: Option<u16>,
    audio: AudioContext<C>,

    pub start_us: i64,
    pub last_packet_us: i64,
}

impl<C: MediaCodec> RtpStream<C> {
    fn new(
        codec: &C,
        audio_config: AudioConfig,
        packet: &RtpPacket<'_>,
        src: SocketAddr,
        dst: SocketAddr,
        direction: Direction,
        descriptor: Option<&MediaDescription>,
        arrival_us: i64,
    ) -> Result<Self, crate::audio::codec::CodecError> {
        // The clock rate is fixed at creation and never changes.
        let clock_rate = PayloadType::clock_rate(packet.payload_type);
        let audio = AudioContext::new(codec, audio_config, packet.payload_type, clock_rate)?;

        let nat64 = [src, dst]
            .into_iter()
            .find(|addr| nat64::is_nat64(&addr.ip()));

        Ok(Self {
            ssrc: packet.ssrc,
            payload_type: packet.payload_type,
            codec_name: descriptor.map(|d| d.codec.clone()).unwrap_or_default(),
            direction,
            src,
            dst,
            nat64,
            clock_rate,
            tracker: SequenceTracker::default(),
            jitter: JitterEstimator::default(),
            last_timestamp: None,
            last_arrival_us: None,
            corrected_timestamps: 0,
            out_of_order: 0,
            recovered: 0,
            concealed_ms: 0,
            consecutive_losses: 0,
            loss_rate: 0.0,
            mean_frame_size: 0.0,
            reorder_dropped: 0,
            smoothed_jitter_ms: 0.0,
            buffer_size_ms: 60.0,
            buffer_target_ms: 60,
            window: ReorderWindow::default(),
            fec: FecAssembler::default(),
            last_media_seq: None,
            audio,
            start_us: arrival_us,
            last_packet_us: arrival_us,
        })
    }

    /// Runs one packet through statistics (arrival order) and the media
    /// path (reorder window, gap handling, audio engine).
    pub fn process<H: SessionHandler>(
        &mut self,
        packet: &RtpPacket<'_>,
        arrival_us: i64,
        handler: &H,
    ) {
        self.last_packet_us = arrival_us;

        let timestamp = self.validate_timestamp(packet.timestamp, arrival_us);

        let outcome = self.tracker.update(packet.sequence);
        match outcome {
            SeqOutcome::BigJump | SeqOutcome::Late => self.out_of_order += 1,
            SeqOutcome::Probation { backward: true, .. } => self.out_of_order += 1,
            _ => {}
        }

        self.jitter.update(timestamp, arrival_us, self.clock_rate);
        self.update_quality_metrics(outcome, packet.payload.len());
        self.adapt_jitter_buffer();

        self.last_timestamp = Some(timestamp);
        self.last_arrival_us = Some(arrival_us);

        self.audio
            .set_network_state(self.loss_rate, self.jitter.jitter_us(self.clock_rate));

        // Media path.
        self.fec.insert(packet.sequence, packet.payload);
        let pending = PendingPacket {
            sequence: packet.sequence,
            timestamp,
            arrival_us,
            payload: packet.payload.to_vec(),
        };

        match self.window.insert(pending, self.tracker.max_seq()) {
            InsertOutcome::Full => {
                self.reorder_dropped += 1;
                return;
            }
            InsertOutcome::Stale => return,
            InsertOutcome::Stored { reordered } => {
                // The sequence machine already charged post-probation
                // misordering; the window covers what probation hid.
                if reordered
                    && matches!(outcome, SeqOutcome::Probation { backward: false, .. })
                {
                    self.out_of_order += 1;
                }
            }
        }

        while let Some(ready) = self.window.pop_ready(arrival_us) {
            self.advance_media(ready, handler);
        }
    }

    /// Gap handling and hand-off to the audio engine, in near-RTP order.
    fn advance_media<H: SessionHandler>(&mut self, packet: PendingPacket, handler: &H) {
        if let Some(last) = self.last_media_seq {
            let gap = packet.sequence.wrapping_sub(last).wrapping_sub(1);
            if gap > 0 && gap < sequence::MAX_DROPOUT {
                self.handle_gap(last, gap, handler);
            }
        }
        self.last_media_seq = Some(packet.sequence);

        let outcome = self.audio.process_packet(
            &packet.payload,
            packet.sequence,
            packet.timestamp,
            packet.arrival_us,
        );
        if outcome == ProcessOutcome::Duplicate {
            handler.on_duplicate(self.ssrc, packet.sequence);
        }

        self.audio.drain(packet.arrival_us);
    }

    /// Concealment selection across a loss gap, in priority order: FEC
    /// recovery, then waveform substitution when history exists, then
    /// comfort noise. Unrecovered frames are charged to `concealed_ms`.
    fn handle_gap<H: SessionHandler>(&mut self, last: u16, gap: u16, handler: &H) {
        let mut unrecovered = 0u32;

        for i in 1..=gap {
            let missing = last.wrapping_add(i);
            match self.fec.recover(missing) {
                Some(payload) => {
                    self.recovered += 1;
                    self.audio.accept_recovered(&payload);
                    handler.on_recovery(self.ssrc, missing);
                }
                None => unrecovered += 1,
            }
        }

        if unrecovered == 0 {
            return;
        }

        let samples_per_frame = PayloadType::samples_per_frame(self.payload_type) as u64;
        let concealed_ms =
            unrecovered as u64 * samples_per_frame * 1000 / self.clock_rate as u64;
        self.concealed_ms += concealed_ms;
        self.consecutive_losses += unrecovered;

        handler.on_concealment(self.ssrc, unrecovered as u16, concealed_ms as u32);
    }

    /// Expected timestamp from the arrival clock, with a 10 ms tolerance
    /// and a 20 ms frame-quantum escape hatch: a deviation that lands on a
    /// frame boundary is an unusual but valid beat, anything else is
    /// corrected to the expected value.
    fn validate_timestamp(&mut self, timestamp: u32, arrival_us: i64) -> u32 {
        let (Some(last_ts), Some(last_arrival)) = (self.last_timestamp, self.last_arrival_us)
        else {
            return timestamp;
        };

        let elapsed_ms = (arrival_us - last_arrival).max(0) / 1000;
        let ticks_per_ms = self.clock_rate / 1000;
        let expected = last_ts.wrapping_add(ticks_per_ms.wrapping_mul(elapsed_ms as u32));

        let tolerance = ticks_per_ms * 10;
        let forward = timestamp.wrapping_sub(expected);
        let deviation = forward.min(forward.wrapping_neg());

        if deviation <= tolerance {
            return timestamp;
        }

        let quantum = self.clock_rate / 50;
        if deviation % quantum <= tolerance {
            return timestamp;
        }

        self.corrected_timestamps += 1;
        expected
    }

    fn update_quality_metrics(&mut self, outcome: SeqOutcome, frame_size: usize) {
        if matches!(outcome, SeqOutcome::InOrder { .. }) {
            self.consecutive_losses = 0;
        }

        let received = self.tracker.received();
        let lost = self.tracker.lost();
        if received + lost > 0 {
            let current = lost as f64 / (received + lost) as f64;
            self.loss_rate =
                (self.loss_rate * (LOSS_WINDOW_SIZE - 1.0) + current) / LOSS_WINDOW_SIZE;
        }

        if self.mean_frame_size == 0.0 {
            self.mean_frame_size = frame_size as f64;
        } else {
            self.mean_frame_size = 0.95 * self.mean_frame_size + 0.05 * frame_size as f64;
        }
    }

    /// Buffer sizing from smoothed jitter and loss, clamped to 1.5x-4x of
    /// the packet interval, blended 0.8/0.2 into the published size.
    fn adapt_jitter_buffer(&mut self) {
        let current_jitter_ms = self.jitter.jitter_us(self.clock_rate) / 1000.0;

        if self.smoothed_jitter_ms == 0.0 {
            self.smoothed_jitter_ms = current_jitter_ms;
        } else {
            self.smoothed_jitter_ms = self.smoothed_jitter_ms * (1.0 - JITTER_SMOOTHING_FACTOR)
                + current_jitter_ms * JITTER_SMOOTHING_FACTOR;
        }

        let mut target = self.smoothed_jitter_ms * 2.0 + PACKET_INTERVAL_MS;

        let jitter_delta = (current_jitter_ms - self.smoothed_jitter_ms).abs();
        if jitter_delta > RAPID_CHANGE_THRESHOLD || self.loss_rate > 0.05 {
            target *= 1.5;
        }

        target = target.clamp(
            PACKET_INTERVAL_MS * MIN_JITTER_MULTIPLIER,
            PACKET_INTERVAL_MS * MAX_JITTER_MULTIPLIER,
        );

        self.buffer_size_ms = 0.8 * self.buffer_size_ms + 0.2 * target;
        self.buffer_target_ms = target as u32;
    }

    pub fn summary(&self) -> StreamSummary {
        StreamSummary {
            ssrc: self.ssrc,
            payload_type: self.payload_type,
            codec_name: self.codec_name.clone(),
            direction: self.direction,
            src: self.src,
            dst: self.dst,
            packets_received: self.tracker.packets_received(),
            lost: self.tracker.lost() + self.reorder_dropped,
            out_of_order: self.out_of_order,
            recovered: self.recovered,
            concealed_ms: self.concealed_ms,
            corrected_timestamps: self.corrected_timestamps,
            jitter_ms: self.jitter.jitter_us(self.clock_rate) / 1000.0,
            jitter_spikes: self.jitter.spikes,
            loss_rate: self.loss_rate,
            buffer_ms: self.buffer_size_ms as u32,
            buffer_target_ms: self.buffer_target_ms,
            audio: self.audio.stats().clone(),
        }
    }

    pub fn audio(&self) -> &AudioContext<C> {
        &self.audio
    }

    pub fn audio_mut(&mut self) -> &mut AudioContext<C> {
        &mut self.audio
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    pub fn lost(&self) -> u64 {
        self.tracker.lost()
    }

    pub fn received(&self) -> u64 {
        self.tracker.received()
    }

    pub fn packets_received(&self) -> u64 {
        self.tracker.packets_received()
    }

    pub fn out_of_order(&self) -> u32 {
        self.out_of_order
    }

    pub fn cycles(&self) -> u32 {
        self.tracker.cycles()
    }

    pub fn concealed_ms(&self) -> u64 {
        self.concealed_ms
    }

    pub fn jitter_ms(&self) -> f64 {
        self.jitter.jitter_us(self.clock_rate) / 1000.0
    }

    pub fn jitter_ticks(&self) -> f64 {
        self.jitter.jitter_ticks()
    }

    fn matches(&self, ssrc: u32, direction: Direction, src: &SocketAddr, dst: &SocketAddr) -> bool {
        self.ssrc == ssrc
            && self.direction.matches(direction)
            && nat64::endpoints_match(&self.src.ip(), &src.ip())
            && nat64::endpoints_match(&self.dst.ip(), &dst.ip())
    }

    /// Records the translated form of an endpoint without replacing the
    /// canonical one.
    fn note_nat64(&mut self, src: &SocketAddr, dst: &SocketAddr) {
        if self.nat64.is_some() {
            return;
        }
        if nat64::is_nat64(&src.ip()) && !nat64::is_nat64(&self.src.ip()) {
            self.nat64 = Some(*src);
        } else if nat64::is_nat64(&dst.ip()) && !nat64::is_nat64(&self.dst.ip()) {
            self.nat64 = Some(*dst);
        }
    }
}

/// Fixed-size stream table.
pub struct StreamTable<C: MediaCodec> {
    slots: Vec<Option<RtpStream<C>>>,
}

impl<C: MediaCodec> Default for StreamTable<C> {
    fn default() -> Self {
        Self {
            slots: (0..MAX_STREAMS).map(|_| None).collect(),
        }
    }
}

impl<C: MediaCodec> StreamTable<C> {
    /// Locates the stream for a packet or allocates the first free slot.
    /// Returns `None` when the table is full or the audio context cannot
    /// be created.
    #[allow(clippy::too_many_arguments)]
    pub fn find_or_create<H: SessionHandler>(
        &mut self,
        codec: &C,
        audio_config: &AudioConfig,
        packet: &RtpPacket<'_>,
        src: SocketAddr,
        dst: SocketAddr,
        direction: Direction,
        descriptor: Option<&MediaDescription>,
        arrival_us: i64,
        handler: &H,
    ) -> Option<&mut RtpStream<C>> {
        if let Some(idx) = self
            .slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.matches(packet.ssrc, direction, &src, &dst)))
        {
            let stream = self.slots[idx].as_mut()?;
            stream.note_nat64(&src, &dst);
            return self.slots[idx].as_mut();
        }

        let free = self.slots.iter().position(|s| s.is_none())?;
        let stream = RtpStream::new(
            codec,
            audio_config.clone(),
            packet,
            src,
            dst,
            direction,
            descriptor,
            arrival_us,
        )
        .ok()?;

        handler.on_stream_created(stream.ssrc, stream.payload_type, stream.direction);
        self.slots[free] = Some(stream);
        self.slots[free].as_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RtpStream<C>> {
        self.slots.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.slots.iter().all(|s| s.is_some())
    }

    /// Releases every stream's buffers and codec handles.
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }
}
