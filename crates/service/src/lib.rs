//! ## Call session tracking
//!
//! Stateful half of the call monitor: the SIP dialog state machine, the
//! per-SSRC stream table with its RFC 3550 analyzers, and the audio
//! quality engine. One [`CallSession`] holds everything a single monitored
//! call accumulates; the capture front end feeds it parsed packets and
//! polls it for termination inputs and statistics.
//!
//! The whole crate is synchronous and single-threaded on the packet path.
//! All per-packet state is consistent again by the time a `handle_*` call
//! returns, so a caller may check its stop conditions between any two
//! packets.

pub mod audio;
pub mod dialog;
pub mod stream;

use std::net::SocketAddr;

use codec::{
    Direction,
    rtp::RtpPacket,
    sdp::{MediaDescription, SessionDescription},
    sip::SipMessage,
};

use crate::{
    audio::{AudioConfig, codec::MediaCodec},
    dialog::{Dialog, DialogState},
    stream::{StreamSummary, StreamTable},
};

/// SDP stream descriptors retained per session.
pub const MAX_DESCRIPTORS: usize = 8;

/// Session observer.
///
/// The capture front end implements this to log, count and display what
/// the session discovers. Every method has a no-op default, so an
/// implementation only picks the events it cares about.
pub trait SessionHandler: Send + Sync {
    /// The dialog moved between states.
    #[allow(unused_variables)]
    fn on_dialog_transition(&self, from: DialogState, to: DialogState) {}

    /// An SDP body declared a media stream.
    #[allow(unused_variables)]
    fn on_descriptor(&self, media: &MediaDescription) {}

    /// A new RTP stream was admitted to the table.
    #[allow(unused_variables)]
    fn on_stream_created(&self, ssrc: u32, payload_type: u8, direction: Direction) {}

    /// A packet arrived for a new stream but all slots are taken.
    #[allow(unused_variables)]
    fn on_stream_table_full(&self, ssrc: u32) {}

    /// The audio engine flagged a duplicate sequence number.
    #[allow(unused_variables)]
    fn on_duplicate(&self, ssrc: u32, sequence: u16) {}

    /// A loss gap was concealed rather than recovered.
    #[allow(unused_variables)]
    fn on_concealment(&self, ssrc: u32, gap: u16, concealed_ms: u32) {}

    /// A missing packet was reconstructed from its FEC group.
    #[allow(unused_variables)]
    fn on_recovery(&self, ssrc: u32, sequence: u16) {}
}

/// No-op handler for tests and embedding.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullHandler;

impl SessionHandler for NullHandler {}

pub struct SessionOptions<C, H> {
    pub codec: C,
    pub audio: AudioConfig,
    pub handler: H,
}

/// One monitored call.
pub struct CallSession<C: MediaCodec, H: SessionHandler> {
    dialog: Dialog,
    descriptors: Vec<MediaDescription>,
    streams: StreamTable<C>,
    codec: C,
    audio_config: AudioConfig,
    handler: H,
    start_us: i64,
    last_rtp_seen_us: Option<i64>,
    sip_packets: u32,
    media_packets: u64,
}

impl<C: MediaCodec, H: SessionHandler> CallSession<C, H> {
    pub fn new(options: SessionOptions<C, H>, start_us: i64) -> Self {
        Self {
            dialog: Dialog::default(),
            descriptors: Vec::new(),
            streams: StreamTable::default(),
            codec: options.codec,
            audio_config: options.audio,
            handler: options.handler,
            start_us,
            last_rtp_seen_us: None,
            sip_packets: 0,
            media_packets: 0,
        }
    }

    /// Feeds a datagram seen on the signaling port. Unparseable payloads
    /// are counted and otherwise ignored.
    pub fn handle_signaling(&mut self, payload: &[u8], direction: Direction, now_us: i64) {
        self.sip_packets += 1;

        let Ok(message) = SipMessage::parse(payload) else {
            return;
        };

        if let Some((from, to)) = self.dialog.apply(&message, now_us) {
            self.handler.on_dialog_transition(from, to);
        }

        if let Some(body) = message.body {
            self.absorb_sdp(body, direction);
        }
    }

    // Descriptors are append-only: once declared, a stream description
    // stays valid for the rest of the session.
    fn absorb_sdp(&mut self, body: &str, direction: Direction) {
        let sdp = SessionDescription::parse(body, direction);
        for media in sdp.media {
            if self.descriptors.len() >= MAX_DESCRIPTORS {
                break;
            }
            self.handler.on_descriptor(&media);
            self.descriptors.push(media);
        }
    }

    /// Feeds a validated RTP packet. Returns false when the packet was
    /// dropped (table full, codec refused the stream).
    pub fn handle_media(
        &mut self,
        packet: &RtpPacket<'_>,
        src: SocketAddr,
        dst: SocketAddr,
        direction: Direction,
        arrival_us: i64,
    ) -> bool {
        let descriptor = self
            .descriptors
            .iter()
            .find(|d| d.payload_type == packet.payload_type);

        let Self {
            streams,
            codec,
            audio_config,
            handler,
            ..
        } = self;

        let Some(stream) = streams.find_or_create(
            codec,
            audio_config,
            packet,
            src,
            dst,
            direction,
            descriptor,
            arrival_us,
            handler,
        ) else {
            handler.on_stream_table_full(packet.ssrc);
            return false;
        };

        stream.process(packet, arrival_us, handler);
        self.last_rtp_seen_us = Some(arrival_us);
        self.media_packets += 1;
        true
    }

    pub fn dialog(&self) -> &Dialog {
        &self.dialog
    }

    pub fn descriptors(&self) -> &[MediaDescription] {
        &self.descriptors
    }

    pub fn streams(&self) -> &StreamTable<C> {
        &self.streams
    }

    pub fn summaries(&self) -> Vec<StreamSummary> {
        self.streams.iter().map(|s| s.summary()).collect()
    }

    pub fn start_us(&self) -> i64 {
        self.start_us
    }

    pub fn last_rtp_seen_us(&self) -> Option<i64> {
        self.last_rtp_seen_us
    }

    pub fn sip_packets(&self) -> u32 {
        self.sip_packets
    }

    pub fn media_packets(&self) -> u64 {
        self.media_packets
    }

    /// Aggregate quality figures across all active streams.
    pub fn quality(&self) -> (f64, u64, u64) {
        let mut jitter = 0.0;
        let mut lost = 0;
        let mut out_of_order = 0u64;
        let mut count = 0;

        for stream in self.streams.iter() {
            jitter += stream.jitter_ms();
            lost += stream.lost();
            out_of_order += stream.out_of_order() as u64;
            count += 1;
        }

        let avg_jitter = if count > 0 { jitter / count as f64 } else { 0.0 };
        (avg_jitter, lost, out_of_order)
    }

    /// Drops all per-stream resources: payload buffers, codec handles.
    pub fn release_streams(&mut self) {
        self.streams.clear();
    }
}
