//! RTP fixed-header parsing and audio-payload validation.

use num_enum::TryFromPrimitive;

use crate::Error;

/// Smallest packet that can carry RTP: the 12-byte fixed header plus one
/// payload byte.
pub const MIN_RTP_SIZE: usize = 13;

/// Standard RTP header size.
pub const RTP_HEADER_SIZE: usize = 12;

/// Static audio payload types with a fixed clock rate.
///
/// Dynamic types (96-127) carry their clock rate in SDP; anything unmapped
/// falls back to 8 kHz.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum PayloadType {
    Pcmu = 0,
    Pcma = 8,
    G722 = 9,
    ComfortNoise = 13,
}

impl PayloadType {
    /// The media clock rate the monitor tracks time in for this payload
    /// type. G.722 is tracked at its 16 kHz sampling rate.
    pub fn clock_rate(pt: u8) -> u32 {
        match PayloadType::try_from(pt) {
            Ok(PayloadType::G722) => 16_000,
            _ => 8_000,
        }
    }

    /// Samples in one 20 ms frame at this payload type's clock rate.
    pub fn samples_per_frame(pt: u8) -> u32 {
        match Self::clock_rate(pt) {
            8_000 => 160,
            16_000 => 320,
            rate => rate / 50,
        }
    }
}

/// RTP packet view.
///
/// ### RTP Fixed Header Fields
///
/// ```bash
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///  |V=2|P|X|  CC   |M|     PT      |       sequence number         |
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///  |                           timestamp                           |
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///  |           synchronization source (SSRC) identifier            |
///  +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
///  |            contributing source (CSRC) identifiers             |
///  |                             ....                              |
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone)]
pub struct RtpPacket<'a> {
    /// This field identifies the version of RTP. The version defined by
    /// RFC 3550 is two (2); the values 0 and 1 appear on the wire from
    /// legacy tools and are tolerated by the validator.
    pub version: u8,
    /// If the padding bit is set, the packet contains one or more
    /// additional padding octets at the end which are not part of the
    /// payload. The last octet of the padding contains a count of how
    /// many padding octets should be ignored, including itself.
    pub padding: bool,
    /// If the extension bit is set, the fixed header is followed by
    /// exactly one header extension.
    pub extension: bool,
    /// The CSRC count contains the number of CSRC identifiers that follow
    /// the fixed header.
    pub csrc_count: u8,
    pub marker: bool,
    /// This field identifies the format of the RTP payload and determines
    /// its interpretation by the application. A set of default mappings
    /// for audio and video is specified in the companion RFC 3551.
    pub payload_type: u8,
    /// The sequence number increments by one for each RTP data packet
    /// sent, and may be used by the receiver to detect packet loss and to
    /// restore packet sequence.
    pub sequence: u16,
    /// The timestamp reflects the sampling instant of the first octet in
    /// the RTP data packet, in units of the media clock.
    pub timestamp: u32,
    /// The SSRC field identifies the synchronization source. This
    /// identifier is chosen randomly, with the intent that no two
    /// synchronization sources within the same RTP session will have the
    /// same SSRC identifier.
    pub ssrc: u32,
    /// Length of the whole RTP packet as captured, used by the
    /// codec-specific size checks.
    pub packet_len: usize,
    /// The media payload after the fixed header, CSRC list, extension and
    /// padding have been peeled off.
    pub payload: &'a [u8],
}

impl<'a> RtpPacket<'a> {
    /// Parses the fixed header and checks that the declared CSRC count,
    /// extension and padding all fit inside the captured bytes.
    pub fn parse(buf: &'a [u8]) -> Result<Self, Error> {
        if buf.len() < MIN_RTP_SIZE {
            return Err(Error::NotRtp);
        }

        let version = buf[0] >> 6;
        if version > 2 {
            return Err(Error::NotRtp);
        }

        let padding = buf[0] & 0x20 != 0;
        let extension = buf[0] & 0x10 != 0;
        let csrc_count = buf[0] & 0x0f;
        let marker = buf[1] & 0x80 != 0;
        let payload_type = buf[1] & 0x7f;

        let sequence = u16::from_be_bytes(buf[2..4].try_into()?);
        let timestamp = u32::from_be_bytes(buf[4..8].try_into()?);
        let ssrc = u32::from_be_bytes(buf[8..12].try_into()?);

        let mut payload_start = RTP_HEADER_SIZE + csrc_count as usize * 4;
        if buf.len() < payload_start {
            return Err(Error::NotRtp);
        }

        if extension {
            // One extension header: 16-bit profile, 16-bit length in words.
            if buf.len() < payload_start + 4 {
                return Err(Error::NotRtp);
            }
            let words =
                u16::from_be_bytes(buf[payload_start + 2..payload_start + 4].try_into()?) as usize;
            payload_start += 4 + words * 4;
            if buf.len() < payload_start {
                return Err(Error::NotRtp);
            }
        }

        let mut payload_end = buf.len();
        if padding {
            let pad = buf[buf.len() - 1] as usize;
            if pad == 0 || payload_start + pad > payload_end {
                return Err(Error::NotRtp);
            }
            payload_end -= pad;
        }

        Ok(Self {
            version,
            padding,
            extension,
            csrc_count,
            marker,
            payload_type,
            sequence,
            timestamp,
            ssrc,
            packet_len: buf.len(),
            payload: &buf[payload_start..payload_end],
        })
    }

    /// Whether this looks like a monitorable audio packet.
    ///
    /// Payload types 0-34 are the static audio assignments, 96-127 the
    /// dynamic range. Any codec needs at least 20 bytes of packet; a 20 ms
    /// G.711 frame (PCMU/PCMA) needs 160.
    pub fn is_valid_audio(&self) -> bool {
        if !(self.payload_type <= 34 || (96..=127).contains(&self.payload_type)) {
            return false;
        }

        if self.packet_len < 20 {
            return false;
        }

        match PayloadType::try_from(self.payload_type) {
            Ok(PayloadType::Pcmu) | Ok(PayloadType::Pcma) => self.packet_len >= 160,
            _ => true,
        }
    }
}

/// Quick classification used on the capture hot path: does this UDP payload
/// plausibly carry RTP at all?
pub fn is_rtp(buf: &[u8]) -> bool {
    RtpPacket::parse(buf).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(seq: u16, ts: u32, ssrc: u32, pt: u8, payload_len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; RTP_HEADER_SIZE + payload_len];
        buf[0] = 0x80;
        buf[1] = pt;
        buf[2..4].copy_from_slice(&seq.to_be_bytes());
        buf[4..8].copy_from_slice(&ts.to_be_bytes());
        buf[8..12].copy_from_slice(&ssrc.to_be_bytes());
        buf
    }

    #[test]
    fn parses_fixed_header() {
        let buf = build(500, 80_000, 0xdeadbeef, 0, 160);
        let packet = RtpPacket::parse(&buf).unwrap();

        assert_eq!(packet.version, 2);
        assert_eq!(packet.sequence, 500);
        assert_eq!(packet.timestamp, 80_000);
        assert_eq!(packet.ssrc, 0xdeadbeef);
        assert_eq!(packet.payload_type, 0);
        assert_eq!(packet.payload.len(), 160);
        assert!(packet.is_valid_audio());
    }

    #[test]
    fn rejects_bad_version_and_short_packets() {
        let mut buf = build(1, 0, 1, 0, 160);
        buf[0] = 0xc0;
        assert!(RtpPacket::parse(&buf).is_err());

        assert!(RtpPacket::parse(&[0x80; 12]).is_err());
    }

    #[test]
    fn g711_size_floor() {
        let buf = build(1, 0, 1, 0, 80);
        let packet = RtpPacket::parse(&buf).unwrap();
        assert!(!packet.is_valid_audio());

        // The same short payload is fine for a dynamic payload type.
        let buf = build(1, 0, 1, 111, 80);
        assert!(RtpPacket::parse(&buf).unwrap().is_valid_audio());
    }

    #[test]
    fn payload_type_range() {
        let buf = build(1, 0, 1, 95, 160);
        assert!(!RtpPacket::parse(&buf).unwrap().is_valid_audio());

        let buf = build(1, 0, 1, 34, 160);
        assert!(RtpPacket::parse(&buf).unwrap().is_valid_audio());
    }

    #[test]
    fn padding_and_csrc_must_fit() {
        let mut buf = build(1, 0, 1, 0, 160);
        buf[0] = 0x80 | 0x0f;
        // 15 CSRCs do not fit in a 172-byte packet with 160 payload bytes
        // still expected behind them, but the parse itself only requires the
        // identifiers to be present.
        assert!(RtpPacket::parse(&buf).is_ok());

        let mut buf = build(1, 0, 1, 0, 4);
        buf[0] |= 0x20;
        *buf.last_mut().unwrap() = 200;
        assert!(RtpPacket::parse(&buf).is_err());
    }

    #[test]
    fn clock_rates() {
        assert_eq!(PayloadType::clock_rate(0), 8_000);
        assert_eq!(PayloadType::clock_rate(8), 8_000);
        assert_eq!(PayloadType::clock_rate(9), 16_000);
        assert_eq!(PayloadType::clock_rate(111), 8_000);
        assert_eq!(PayloadType::samples_per_frame(0), 160);
        assert_eq!(PayloadType::samples_per_frame(9), 320);
    }
}
