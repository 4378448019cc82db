use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;
use service::stream::StreamSummary;

/// The type of information reported into the statistics.
#[derive(Debug, Clone, Copy)]
pub enum Stats {
    TotalPkts(u32),
    SipPkts(u32),
    RtpPkts(u32),
    ErrorPkts(u32),
    WrittenBytes(u32),
    Streams(u32),
}

pub trait Number {
    fn add(&self, value: u64);
    fn get(&self) -> u64;
}

#[derive(Default)]
pub struct Count(AtomicU64);

impl Number for Count {
    fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Capture-wide packet counters.
#[derive(Default)]
pub struct Counts<T> {
    pub total_pkts: T,
    pub sip_pkts: T,
    pub rtp_pkts: T,
    pub error_pkts: T,
    pub written_bytes: T,
    pub streams: T,
}

impl<T: Number> Counts<T> {
    /// # Example
    ///
    /// ```
    /// use call_monitor::statistics::*;
    ///
    /// let counts = Counts::<Count>::default();
    ///
    /// counts.add(&Stats::TotalPkts(1));
    /// assert_eq!(counts.total_pkts.get(), 1);
    ///
    /// counts.add(&Stats::SipPkts(2));
    /// assert_eq!(counts.sip_pkts.get(), 2);
    /// ```
    pub fn add(&self, payload: &Stats) {
        match payload {
            Stats::TotalPkts(v) => self.total_pkts.add(*v as u64),
            Stats::SipPkts(v) => self.sip_pkts.add(*v as u64),
            Stats::RtpPkts(v) => self.rtp_pkts.add(*v as u64),
            Stats::ErrorPkts(v) => self.error_pkts.add(*v as u64),
            Stats::WrittenBytes(v) => self.written_bytes.add(*v as u64),
            Stats::Streams(v) => self.streams.add(*v as u64),
        }
    }
}

/// Capture statistics shared between the hot path and the display task.
///
/// The capture thread reports counters and publishes per-stream snapshots;
/// the periodic display and the final summary read them.
#[derive(Clone, Default)]
pub struct Statistics {
    counts: Arc<Counts<Count>>,
    snapshot: Arc<Mutex<Vec<StreamSummary>>>,
}

impl Statistics {
    /// # Example
    ///
    /// ```
    /// use call_monitor::statistics::*;
    ///
    /// let statistics = Statistics::default();
    ///
    /// statistics.report(&[Stats::TotalPkts(1), Stats::RtpPkts(1)]);
    /// assert_eq!(statistics.counts().total_pkts.get(), 1);
    /// assert_eq!(statistics.counts().rtp_pkts.get(), 1);
    /// ```
    pub fn report(&self, reports: &[Stats]) {
        for item in reports {
            self.counts.add(item);
        }
    }

    pub fn counts(&self) -> &Counts<Count> {
        &self.counts
    }

    /// Publishes the per-stream state for the display side.
    pub fn publish_streams(&self, summaries: Vec<StreamSummary>) {
        *self.snapshot.lock() = summaries;
    }

    pub fn stream_snapshot(&self) -> Vec<StreamSummary> {
        self.snapshot.lock().clone()
    }
}
