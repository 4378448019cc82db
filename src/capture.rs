//! Capture session lifecycle.
//!
//! Owns the capture handle and the output savefile, feeds every frame
//! through dissection into the call session, and decides when the capture
//! is over. The packet path is a synchronous loop on a blocking worker;
//! signals and the time budget run as tokio tasks that flip a monotonic
//! stop flag, observed at the next packet boundary (the 100 ms read
//! timeout bounds how long that takes).

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result};
use codec::{Error as WireError, RTP_MIN_PORT, SIP_PORT, dissect, rtp::RtpPacket};
use pcap::Capture;
use service::{
    CallSession, SessionHandler, SessionOptions, audio::codec::MediaCodec, dialog::DialogState,
};
use tokio::signal::unix::{SignalKind, signal};

use crate::{
    codec::{DefaultCodec, default_codec},
    config::Config,
    observer::Observer,
    statistics::{Statistics, Stats},
};

const SNAPLEN: i32 = 65535;
const PCAP_BUFFER_SIZE: i32 = 32 * 1024 * 1024;
const PCAP_TIMEOUT_MS: i32 = 100;

/// Media silence after which the call is considered gone.
pub const RTP_TIMEOUT_US: i64 = 30 * 1_000_000;

/// Grace period after the first hangup signal before stopping.
pub const RTP_GRACE_PERIOD_US: i64 = 5 * 1_000_000;

/// Budget for a call to materialize, and for auto mode to give up on a
/// stalled setup.
pub const AUTO_MODE_TIMEOUT_US: i64 = 300 * 1_000_000;

/// Auto mode: signaling silence after the call finished.
pub const AUTO_MODE_FINISHED_US: i64 = 60 * 1_000_000;

const STATUS_CHECK_INTERVAL_US: i64 = 1_000_000;
const MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// What the capture left behind for the final report.
#[derive(Debug)]
pub struct CaptureReport {
    pub dialog_state: DialogState,
    pub call_id: Option<String>,
    pub sip_packets: u32,
    pub media_packets: u64,
}

type Session = CallSession<DefaultCodec, Observer>;

/// Runs the capture to completion: installs the asynchronous stop
/// sources, then drives the packet loop on a blocking worker.
pub async fn run(config: Arc<Config>, statistics: Statistics) -> Result<CaptureReport> {
    let stopping = Arc::new(AtomicBool::new(false));

    for (kind, name) in [
        (SignalKind::interrupt(), "interrupt"),
        (SignalKind::terminate(), "termination"),
        (SignalKind::hangup(), "hangup"),
        (SignalKind::quit(), "quit"),
    ] {
        let mut stream = signal(kind).context("could not set up signal handlers")?;
        let stopping = stopping.clone();
        tokio::spawn(async move {
            if stream.recv().await.is_some() {
                log::info!("received {} signal, stopping capture", name);
                stopping.store(true, Ordering::Release);
            }
        });
    }

    if config.time > 0 {
        let seconds = config.time;
        let stopping = stopping.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(seconds)).await;
            log::info!("capture time limit reached ({} seconds), stopping", seconds);
            stopping.store(true, Ordering::Release);
        });
    }

    let worker =
        tokio::task::spawn_blocking(move || capture_loop(config, statistics, stopping));
    worker.await.context("capture worker failed")?
}

fn capture_loop(
    config: Arc<Config>,
    statistics: Statistics,
    stopping: Arc<AtomicBool>,
) -> Result<CaptureReport> {
    let mut cap = Capture::from_device(config.interface.as_str())
        .with_context(|| format!("could not create capture handle for {}", config.interface))?
        .snaplen(SNAPLEN)
        .promisc(true)
        .timeout(PCAP_TIMEOUT_MS)
        .immediate_mode(true)
        .buffer_size(PCAP_BUFFER_SIZE)
        .open()
        .with_context(|| format!("could not activate capture on {}", config.interface))?;

    // All VoIP traffic of interest is UDP; a broad filter makes sure no
    // media port convention is missed.
    cap.filter("udp", true).context("could not apply filter")?;

    let mut savefile = cap
        .savefile(&config.output)
        .with_context(|| format!("could not open output file {}", config.output.display()))?;

    let start_us = unix_now_us();
    let mut session: Session = CallSession::new(
        SessionOptions {
            codec: default_codec(),
            audio: config.audio.clone(),
            handler: Observer::new(statistics.clone()),
        },
        start_us,
    );

    log::info!(
        "capturing on {} -> {}",
        config.interface,
        config.output.display()
    );

    let mut rail = ErrorRail::default();
    let mut last_check_us = start_us;

    loop {
        if stopping.load(Ordering::Acquire) {
            break;
        }

        match cap.next_packet() {
            Ok(packet) => {
                let now_us = packet.header.ts.tv_sec as i64 * 1_000_000
                    + packet.header.ts.tv_usec as i64;

                savefile.write(&packet);
                savefile.flush().context("output file write failed")?;
                statistics.report(&[
                    Stats::TotalPkts(1),
                    Stats::WrittenBytes(packet.data.len() as u32),
                ]);

                handle_frame(&mut session, &statistics, &mut rail, packet.data, now_us)?;

                if check_status(&config, &session, &statistics, now_us, &mut last_check_us) {
                    break;
                }
            }
            Err(pcap::Error::TimeoutExpired) => {
                let now_us = unix_now_us();
                if check_status(&config, &session, &statistics, now_us, &mut last_check_us) {
                    break;
                }
            }
            Err(e) => {
                return Err(e).context("packet source failed");
            }
        }
    }

    // Drain in-flight output and release per-stream resources.
    savefile.flush().context("output file flush failed")?;
    statistics.publish_streams(session.summaries());

    let report = CaptureReport {
        dialog_state: session.dialog().state(),
        call_id: session.dialog().call_id().map(str::to_string),
        sip_packets: session.sip_packets(),
        media_packets: session.media_packets(),
    };
    session.release_streams();

    Ok(report)
}

/// Dissects one frame and routes it to signaling or media handling.
/// Returns an error only when the malformed-frame rail ran out.
fn handle_frame(
    session: &mut Session,
    statistics: &Statistics,
    rail: &mut ErrorRail,
    frame: &[u8],
    now_us: i64,
) -> Result<()> {
    let view = match dissect::dissect(frame) {
        Ok(view) => {
            rail.clear();
            view
        }
        // Foreign traffic (non-IP, non-UDP) is skipped without charge.
        Err(e) if e.is_foreign() => return Ok(()),
        Err(e) => {
            statistics.report(&[Stats::ErrorPkts(1)]);
            log::debug!("malformed frame: {}", e);
            if rail.charge(&e) >= MAX_CONSECUTIVE_ERRORS {
                anyhow::bail!("too many consecutive malformed frames ({})", e);
            }
            return Ok(());
        }
    };

    if view.src.port() == SIP_PORT || view.dst.port() == SIP_PORT {
        statistics.report(&[Stats::SipPkts(1)]);
        session.handle_signaling(view.payload, view.direction, now_us);
        return Ok(());
    }

    if view.src.port() >= RTP_MIN_PORT || view.dst.port() >= RTP_MIN_PORT {
        if let Ok(packet) = RtpPacket::parse(view.payload) {
            if packet.is_valid_audio() {
                statistics.report(&[Stats::RtpPkts(1)]);
                session.handle_media(&packet, view.src, view.dst, view.direction, now_us);
            }
        }
    }

    Ok(())
}

/// 1 Hz periodic work: progress line and the termination predicates.
/// Returns true when the capture should stop.
fn check_status(
    config: &Config,
    session: &Session,
    statistics: &Statistics,
    now_us: i64,
    last_check_us: &mut i64,
) -> bool {
    if now_us - *last_check_us < STATUS_CHECK_INTERVAL_US {
        // Termination is still evaluated on every packet.
        return should_stop(config, session, now_us);
    }
    *last_check_us = now_us;

    statistics.publish_streams(session.summaries());

    if session.dialog().state() == DialogState::Established {
        let (jitter_ms, lost, out_of_order) = session.quality();
        log::info!(
            target: "state",
            "call active: streams={}, lost={}, out_of_order={}, jitter={:.1}ms",
            session.streams().len(),
            lost,
            out_of_order,
            jitter_ms,
        );
    }

    should_stop(config, session, now_us)
}

/// Termination predicates, evaluated on every packet and once per second
/// while idle.
fn should_stop<C, H>(config: &Config, session: &CallSession<C, H>, now_us: i64) -> bool
where
    C: MediaCodec,
    H: SessionHandler,
{
    let dialog = session.dialog();
    let start_us = session.start_us();

    if config.time > 0 && now_us - start_us >= config.time as i64 * 1_000_000 {
        log::info!("time limit reached ({} seconds)", config.time);
        return true;
    }

    if let Some(last_rtp) = session.last_rtp_seen_us() {
        if now_us - last_rtp >= RTP_TIMEOUT_US {
            log::info!("no media for {} seconds", RTP_TIMEOUT_US / 1_000_000);
            return true;
        }
    }

    if dialog.state() == DialogState::Terminated {
        if let Some(bye) = dialog.last_bye_seen_us() {
            if now_us - bye >= RTP_GRACE_PERIOD_US {
                log::info!(target: "state", "grace period after hangup elapsed");
                return true;
            }
        }
    }

    // No call ever materialized.
    if dialog.state() == DialogState::Init && now_us - start_us >= AUTO_MODE_TIMEOUT_US {
        log::info!("no call within {} seconds", AUTO_MODE_TIMEOUT_US / 1_000_000);
        return true;
    }

    if config.auto {
        let last_sip = dialog.last_sip_seen_us().unwrap_or(start_us);
        let last_rtp = session.last_rtp_seen_us().unwrap_or(start_us);

        // Setup that never completes.
        if !matches!(
            dialog.state(),
            DialogState::Established | DialogState::Terminated
        ) && now_us - last_sip >= AUTO_MODE_TIMEOUT_US
            && now_us - last_rtp >= AUTO_MODE_TIMEOUT_US
        {
            log::info!("call setup stalled in auto mode");
            return true;
        }

        // Call over, signaling gone quiet.
        if dialog.state() == DialogState::Terminated
            && now_us - last_sip >= AUTO_MODE_FINISHED_US
        {
            log::info!("call finished in auto mode");
            return true;
        }
    }

    false
}

/// Per-class consecutive malformed-frame counter. Ten in a row of the
/// same class stop the capture: a rail against a broken packet source.
#[derive(Default)]
struct ErrorRail {
    class: Option<ErrorClass>,
    count: u32,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum ErrorClass {
    Truncated,
    InvalidHeader,
    InvalidLength,
    Other,
}

impl ErrorRail {
    fn charge(&mut self, error: &WireError) -> u32 {
        let class = match error {
            WireError::Truncated => ErrorClass::Truncated,
            WireError::InvalidHeader => ErrorClass::InvalidHeader,
            WireError::InvalidLength => ErrorClass::InvalidLength,
            _ => ErrorClass::Other,
        };

        if self.class == Some(class) {
            self.count += 1;
        } else {
            self.class = Some(class);
            self.count = 1;
        }
        self.count
    }

    fn clear(&mut self) {
        self.class = None;
        self.count = 0;
    }
}

fn unix_now_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use service::NullHandler;

    fn config(auto: bool, time: u64) -> Config {
        Config {
            mode: crate::config::Mode::Capture,
            interface: "lo".into(),
            output: "/tmp/test.pcap".into(),
            time,
            auto,
            debug: false,
            silent: true,
            audio: Default::default(),
            log: Default::default(),
        }
    }

    // The predicate tests drive a session directly; no capture handle is
    // involved.
    fn session(start_us: i64) -> CallSession<DefaultCodec, NullHandler> {
        CallSession::new(
            SessionOptions {
                codec: default_codec(),
                audio: Default::default(),
                handler: NullHandler,
            },
            start_us,
        )
    }

    fn stop(config: &Config, session: &CallSession<DefaultCodec, NullHandler>, now: i64) -> bool {
        should_stop(config, session, now)
    }

    fn apply_sip(
        session: &mut CallSession<DefaultCodec, NullHandler>,
        raw: &[u8],
        now_us: i64,
    ) {
        session.handle_signaling(raw, codec::Direction::Unknown, now_us);
    }

    #[test]
    fn time_budget_stops_the_capture() {
        let cfg = config(false, 10);
        let s = session(0);
        assert!(!stop(&cfg, &s, 9_999_999));
        assert!(stop(&cfg, &s, 10_000_000));
    }

    #[test]
    fn bye_starts_the_grace_period() {
        let cfg = config(false, 0);
        let mut s = session(0);

        apply_sip(&mut s, b"INVITE sip:b SIP/2.0\r\nCSeq: 1 INVITE\r\n\r\n", 1_000_000);
        apply_sip(&mut s, b"SIP/2.0 200 OK\r\nCSeq: 1 INVITE\r\n\r\n", 2_000_000);
        apply_sip(&mut s, b"BYE sip:a SIP/2.0\r\nCSeq: 2 BYE\r\n\r\n", 10_000_000);

        assert!(!stop(&cfg, &s, 10_000_000 + RTP_GRACE_PERIOD_US - 1));
        assert!(stop(&cfg, &s, 10_000_000 + RTP_GRACE_PERIOD_US));
    }

    #[test]
    fn idle_init_dialog_times_out() {
        let cfg = config(false, 0);
        let s = session(0);
        assert!(!stop(&cfg, &s, AUTO_MODE_TIMEOUT_US - 1));
        assert!(stop(&cfg, &s, AUTO_MODE_TIMEOUT_US));
    }

    #[test]
    fn error_rail_requires_same_class_in_a_row() {
        let mut rail = ErrorRail::default();

        for _ in 0..9 {
            assert!(rail.charge(&WireError::Truncated) < MAX_CONSECUTIVE_ERRORS);
        }
        // A different class restarts the count.
        assert_eq!(rail.charge(&WireError::InvalidLength), 1);
        for _ in 0..8 {
            rail.charge(&WireError::InvalidLength);
        }
        assert_eq!(rail.charge(&WireError::InvalidLength), 10);

        rail.clear();
        assert_eq!(rail.charge(&WireError::Truncated), 1);
    }
}
