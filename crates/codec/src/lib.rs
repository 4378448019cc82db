//! ## VoIP wire parsing
//!
//! [RFC 3550]: https://tools.ietf.org/html/rfc3550
//! [RFC 3261]: https://tools.ietf.org/html/rfc3261
//! [RFC 6052]: https://tools.ietf.org/html/rfc6052
//!
//! Stateless decoders for the protocol layers a call monitor has to peel
//! apart: Ethernet/IP/UDP framing, the RTP fixed header ([RFC 3550]), SIP
//! request and status lines with the handful of headers dialog tracking
//! needs ([RFC 3261]), SDP media descriptions, and the NAT64 address
//! embedding ([RFC 6052]). Everything here borrows from the captured frame;
//! nothing in this crate owns packet memory or keeps state between packets.

pub mod dissect;
pub mod nat64;
pub mod rtp;
pub mod sdp;
pub mod sip;

use std::{array::TryFromSliceError, str::Utf8Error};

/// The well-known SIP signaling port.
pub const SIP_PORT: u16 = 5060;

/// Lowest port number accepted as RTP media.
pub const RTP_MIN_PORT: u16 = 1024;

#[derive(Debug)]
pub enum Error {
    /// EtherType is neither IPv4 nor IPv6. Skipped, never counted.
    NotIp,
    /// IP protocol / next header is not UDP. Skipped, never counted.
    NotUdp,
    /// A length field points past the captured bytes.
    Truncated,
    /// A header field holds a value the protocol does not allow.
    InvalidHeader,
    /// The computed payload length is zero or negative.
    InvalidLength,
    NotRtp,
    NotSip,
    Utf8Error(Utf8Error),
    TryFromSliceError(TryFromSliceError),
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::NotIp, Self::NotIp) => true,
            (Self::NotUdp, Self::NotUdp) => true,
            (Self::Truncated, Self::Truncated) => true,
            (Self::InvalidHeader, Self::InvalidHeader) => true,
            (Self::InvalidLength, Self::InvalidLength) => true,
            (Self::NotRtp, Self::NotRtp) => true,
            (Self::NotSip, Self::NotSip) => true,
            (Self::Utf8Error(a), Self::Utf8Error(b)) => a == b,
            (Self::TryFromSliceError(_), Self::TryFromSliceError(_)) => true,
            _ => false,
        }
    }
}

impl Eq for Error {}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8Error(value)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(value: TryFromSliceError) -> Self {
        Self::TryFromSliceError(value)
    }
}

impl Error {
    /// Whether the caller should silently skip this frame (foreign traffic)
    /// instead of treating it as a malformed capture.
    ///
    /// # Example
    ///
    /// ```
    /// use call_monitor_codec::Error;
    ///
    /// assert!(Error::NotIp.is_foreign());
    /// assert!(Error::NotUdp.is_foreign());
    /// assert!(!Error::Truncated.is_foreign());
    /// ```
    pub fn is_foreign(&self) -> bool {
        matches!(self, Self::NotIp | Self::NotUdp)
    }
}

/// Traffic direction relative to the NAT64 boundary.
///
/// Derived from NAT64 inspection of the endpoints: a NAT64 source talking to
/// a plain destination is incoming, the reverse is outgoing, anything else
/// stays unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    #[default]
    Unknown,
    Incoming,
    Outgoing,
}

impl Direction {
    /// Directions are compatible when equal or when either side has not been
    /// classified yet. Stream matching uses this instead of strict equality
    /// so a flow that loses its NAT64 form mid-call keeps its stream record.
    pub fn matches(&self, other: Direction) -> bool {
        *self == other || *self == Direction::Unknown || other == Direction::Unknown
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Unknown => "unknown",
            Self::Incoming => "incoming",
            Self::Outgoing => "outgoing",
        })
    }
}
