use codec::{Direction, sdp::MediaDescription};
use service::{SessionHandler, dialog::DialogState};

use crate::statistics::Statistics;

/// Session observer wired to the log facade and the statistics.
///
/// The `sip` / `rtp` / `state` targets keep the per-subsystem debug
/// output separable, the way the capture's `--debug` mode presents it.
pub struct Observer {
    statistics: Statistics,
}

impl Observer {
    pub fn new(statistics: Statistics) -> Self {
        Self { statistics }
    }
}

impl SessionHandler for Observer {
    fn on_dialog_transition(&self, from: DialogState, to: DialogState) {
        log::info!(target: "state", "dialog: {} -> {}", from, to);
    }

    fn on_descriptor(&self, media: &MediaDescription) {
        log::debug!(
            target: "sip",
            "stream described: port={}, pt={}, codec={}/{}",
            media.port,
            media.payload_type,
            if media.codec.is_empty() { "?" } else { &media.codec },
            media.sample_rate,
        );
    }

    fn on_stream_created(&self, ssrc: u32, payload_type: u8, direction: Direction) {
        log::info!(
            target: "rtp",
            "new stream: ssrc={}, pt={}, direction={}",
            ssrc,
            payload_type,
            direction,
        );
        self.statistics.report(&[crate::statistics::Stats::Streams(1)]);
    }

    fn on_stream_table_full(&self, ssrc: u32) {
        log::warn!(target: "rtp", "stream table full, dropping ssrc={}", ssrc);
    }

    fn on_duplicate(&self, ssrc: u32, sequence: u16) {
        log::debug!(target: "rtp", "duplicate: ssrc={}, seq={}", ssrc, sequence);
    }

    fn on_concealment(&self, ssrc: u32, gap: u16, concealed_ms: u32) {
        log::debug!(
            target: "rtp",
            "concealed: ssrc={}, gap={}, duration={}ms",
            ssrc,
            gap,
            concealed_ms,
        );
    }

    fn on_recovery(&self, ssrc: u32, sequence: u16) {
        log::debug!(target: "rtp", "fec recovered: ssrc={}, seq={}", ssrc, sequence);
    }
}
