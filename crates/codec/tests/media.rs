use std::net::IpAddr;

use call_monitor_codec::{
    Direction, Error,
    dissect::dissect,
    nat64,
    rtp::{RTP_HEADER_SIZE, RtpPacket, is_rtp},
};

/// Builds an Ethernet/IPv4/UDP frame around the given payload.
fn ipv4_frame(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16, payload: &[u8]) -> Vec<u8> {
    let total_len = 20 + 8 + payload.len();
    let mut frame = vec![0u8; 14 + total_len];
    frame[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
    frame[14] = 0x45;
    frame[16..18].copy_from_slice(&(total_len as u16).to_be_bytes());
    frame[23] = 17;
    frame[26..30].copy_from_slice(&src);
    frame[30..34].copy_from_slice(&dst);
    frame[34..36].copy_from_slice(&sport.to_be_bytes());
    frame[36..38].copy_from_slice(&dport.to_be_bytes());
    frame[40..42].copy_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    frame[42..].copy_from_slice(payload);
    frame
}

fn ipv6_frame(src: IpAddr, sport: u16, dst: IpAddr, dport: u16, payload: &[u8]) -> Vec<u8> {
    let (IpAddr::V6(src), IpAddr::V6(dst)) = (src, dst) else {
        panic!("ipv6 addresses required");
    };

    let ip_payload_len = 8 + payload.len();
    let mut frame = vec![0u8; 14 + 40 + ip_payload_len];
    frame[12..14].copy_from_slice(&0x86ddu16.to_be_bytes());
    frame[14] = 0x60;
    frame[18..20].copy_from_slice(&(ip_payload_len as u16).to_be_bytes());
    frame[20] = 17;
    frame[22..38].copy_from_slice(&src.octets());
    frame[38..54].copy_from_slice(&dst.octets());
    frame[54..56].copy_from_slice(&sport.to_be_bytes());
    frame[56..58].copy_from_slice(&dport.to_be_bytes());
    frame[58..60].copy_from_slice(&(ip_payload_len as u16).to_be_bytes());
    frame[62..].copy_from_slice(payload);
    frame
}

fn rtp_payload(seq: u16, ts: u32, ssrc: u32, pt: u8, media_len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; RTP_HEADER_SIZE + media_len];
    buf[0] = 0x80;
    buf[1] = pt;
    buf[2..4].copy_from_slice(&seq.to_be_bytes());
    buf[4..8].copy_from_slice(&ts.to_be_bytes());
    buf[8..12].copy_from_slice(&ssrc.to_be_bytes());
    buf
}

#[test]
fn dissects_ipv4_rtp() {
    let rtp = rtp_payload(100, 16_000, 0x1234, 0, 160);
    let frame = ipv4_frame([192, 0, 2, 1], 16384, [192, 0, 2, 2], 16385, &rtp);

    let view = dissect(&frame).unwrap();
    assert_eq!(view.ip_version, 4);
    assert_eq!(view.src.port(), 16384);
    assert_eq!(view.dst.port(), 16385);
    assert_eq!(view.direction, Direction::Unknown);
    assert!(is_rtp(view.payload));

    let packet = RtpPacket::parse(view.payload).unwrap();
    assert_eq!(packet.sequence, 100);
    assert_eq!(packet.ssrc, 0x1234);
    assert!(packet.is_valid_audio());
}

#[test]
fn dissects_ipv6_with_nat64_direction() {
    let src: IpAddr = "64:ff9b::c0a8:101".parse().unwrap();
    let dst: IpAddr = "2001:db8::2".parse().unwrap();
    let rtp = rtp_payload(7, 0, 9, 8, 160);
    let frame = ipv6_frame(src, 20000, dst, 20001, &rtp);

    let view = dissect(&frame).unwrap();
    assert_eq!(view.ip_version, 6);
    assert_eq!(view.direction, Direction::Incoming);
    assert_eq!(
        nat64::embedded_ipv4(&view.src.ip()),
        Some("192.168.1.1".parse().unwrap())
    );
}

#[test]
fn foreign_traffic_is_flagged_for_silent_skip() {
    // ARP frame.
    let mut frame = vec![0u8; 60];
    frame[12..14].copy_from_slice(&0x0806u16.to_be_bytes());
    assert_eq!(dissect(&frame).unwrap_err(), Error::NotIp);

    // TCP segment.
    let mut frame = ipv4_frame([10, 0, 0, 1], 80, [10, 0, 0, 2], 8080, &[0u8; 32]);
    frame[23] = 6;
    assert_eq!(dissect(&frame).unwrap_err(), Error::NotUdp);
}

#[test]
fn malformed_frames_are_errors() {
    // IP total length beyond the captured bytes.
    let mut frame = ipv4_frame([10, 0, 0, 1], 5060, [10, 0, 0, 2], 5060, &[0u8; 32]);
    frame[16..18].copy_from_slice(&1000u16.to_be_bytes());
    assert_eq!(dissect(&frame).unwrap_err(), Error::Truncated);

    // Header length below 20 bytes.
    let mut frame = ipv4_frame([10, 0, 0, 1], 5060, [10, 0, 0, 2], 5060, &[0u8; 32]);
    frame[14] = 0x43;
    assert_eq!(dissect(&frame).unwrap_err(), Error::InvalidHeader);

    // UDP header with no payload behind it.
    let mut frame = ipv4_frame([10, 0, 0, 1], 5060, [10, 0, 0, 2], 5060, &[]);
    frame[16..18].copy_from_slice(&28u16.to_be_bytes());
    assert_eq!(dissect(&frame).unwrap_err(), Error::InvalidLength);

    assert_eq!(dissect(&[0u8; 8]).unwrap_err(), Error::Truncated);
}

#[test]
fn link_padding_does_not_leak_into_payload() {
    let rtp = rtp_payload(1, 0, 1, 0, 160);
    let mut frame = ipv4_frame([10, 0, 0, 1], 16384, [10, 0, 0, 2], 16385, &rtp);
    // Trailing link-layer padding past the IP total length.
    frame.extend_from_slice(&[0xaa; 16]);

    let view = dissect(&frame).unwrap();
    assert_eq!(view.payload.len(), rtp.len());
}
