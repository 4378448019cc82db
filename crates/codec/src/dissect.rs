//! Ethernet/IP/UDP frame dissection.
//!
//! Peels the link and network layers off a captured frame and hands back a
//! borrowed view of the UDP payload together with both endpoints and a
//! NAT64-derived direction hint. Only Ethernet II framing is understood;
//! non-IP EtherTypes and non-UDP protocols are reported as foreign traffic
//! so the caller can skip them without charging its error rail.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::{Error, Direction, nat64};

const ETHER_HEADER_LEN: usize = 14;
const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;
const IPPROTO_UDP: u8 = 17;
const UDP_HEADER_LEN: usize = 8;
const IPV6_HEADER_LEN: usize = 40;

/// A dissected UDP datagram, borrowing from the captured frame.
#[derive(Debug)]
pub struct PacketView<'a> {
    pub ip_version: u8,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub payload: &'a [u8],
    pub direction: Direction,
}

/// Validates the Ethernet/IP/UDP framing of a captured frame.
///
/// The IP length fields are checked against the captured length before any
/// slice is taken; a frame whose headers promise more bytes than were
/// captured is rejected as [`Error::Truncated`] rather than read short.
///
/// # Example
///
/// ```
/// use call_monitor_codec::dissect::dissect;
///
/// let mut frame = vec![0u8; 14 + 20 + 8 + 4];
/// frame[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
/// frame[14] = 0x45;
/// frame[16..18].copy_from_slice(&32u16.to_be_bytes());
/// frame[23] = 17;
/// frame[26..30].copy_from_slice(&[192, 0, 2, 1]);
/// frame[30..34].copy_from_slice(&[192, 0, 2, 2]);
/// frame[34..36].copy_from_slice(&5060u16.to_be_bytes());
/// frame[36..38].copy_from_slice(&5060u16.to_be_bytes());
///
/// let view = dissect(&frame).unwrap();
/// assert_eq!(view.ip_version, 4);
/// assert_eq!(view.payload.len(), 4);
/// ```
pub fn dissect(frame: &[u8]) -> Result<PacketView<'_>, Error> {
    if frame.len() < ETHER_HEADER_LEN {
        return Err(Error::Truncated);
    }

    let ether_type = u16::from_be_bytes(frame[12..14].try_into()?);
    match ether_type {
        ETHERTYPE_IPV4 => dissect_ipv4(frame),
        ETHERTYPE_IPV6 => dissect_ipv6(frame),
        _ => Err(Error::NotIp),
    }
}

fn dissect_ipv4(frame: &[u8]) -> Result<PacketView<'_>, Error> {
    let ip = &frame[ETHER_HEADER_LEN..];
    if ip.len() < 20 {
        return Err(Error::Truncated);
    }

    let version = ip[0] >> 4;
    let header_len = ((ip[0] & 0x0f) as usize) * 4;
    if version != 4 || header_len < 20 {
        return Err(Error::InvalidHeader);
    }

    let total_len = u16::from_be_bytes(ip[2..4].try_into()?) as usize;
    if total_len < header_len || ip.len() < total_len || ip.len() < header_len {
        return Err(Error::Truncated);
    }

    if ip[9] != IPPROTO_UDP {
        return Err(Error::NotUdp);
    }

    let src_ip = IpAddr::V4(Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]));
    let dst_ip = IpAddr::V4(Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]));

    let udp = &ip[header_len..];
    if udp.len() < UDP_HEADER_LEN {
        return Err(Error::Truncated);
    }

    let src_port = u16::from_be_bytes(udp[0..2].try_into()?);
    let dst_port = u16::from_be_bytes(udp[2..4].try_into()?);

    // Payload length comes from the IP total length, not from the capture:
    // trailing link padding must not leak into the payload.
    let payload_len = total_len as isize - header_len as isize - UDP_HEADER_LEN as isize;
    if payload_len <= 0 {
        return Err(Error::InvalidLength);
    }

    let payload = &udp[UDP_HEADER_LEN..UDP_HEADER_LEN + payload_len as usize];
    Ok(view(4, src_ip, src_port, dst_ip, dst_port, payload))
}

fn dissect_ipv6(frame: &[u8]) -> Result<PacketView<'_>, Error> {
    let ip = &frame[ETHER_HEADER_LEN..];
    if ip.len() < IPV6_HEADER_LEN {
        return Err(Error::Truncated);
    }

    if ip[0] >> 4 != 6 {
        return Err(Error::InvalidHeader);
    }

    // No extension-header walking; a media capture only cares about plain
    // UDP datagrams.
    if ip[6] != IPPROTO_UDP {
        return Err(Error::NotUdp);
    }

    let ip_payload_len = u16::from_be_bytes(ip[4..6].try_into()?) as usize;
    if ip.len() < IPV6_HEADER_LEN + ip_payload_len {
        return Err(Error::Truncated);
    }

    let src_ip = IpAddr::V6(Ipv6Addr::from(
        <[u8; 16]>::try_from(&ip[8..24]).map_err(Error::TryFromSliceError)?,
    ));
    let dst_ip = IpAddr::V6(Ipv6Addr::from(
        <[u8; 16]>::try_from(&ip[24..40]).map_err(Error::TryFromSliceError)?,
    ));

    let udp = &ip[IPV6_HEADER_LEN..IPV6_HEADER_LEN + ip_payload_len];
    if udp.len() < UDP_HEADER_LEN {
        return Err(Error::Truncated);
    }

    let src_port = u16::from_be_bytes(udp[0..2].try_into()?);
    let dst_port = u16::from_be_bytes(udp[2..4].try_into()?);

    let payload_len = ip_payload_len as isize - UDP_HEADER_LEN as isize;
    if payload_len <= 0 {
        return Err(Error::InvalidLength);
    }

    let payload = &udp[UDP_HEADER_LEN..];
    Ok(view(6, src_ip, src_port, dst_ip, dst_port, payload))
}

fn view<'a>(
    ip_version: u8,
    src_ip: IpAddr,
    src_port: u16,
    dst_ip: IpAddr,
    dst_port: u16,
    payload: &'a [u8],
) -> PacketView<'a> {
    PacketView {
        ip_version,
        direction: nat64::direction_hint(&src_ip, &dst_ip),
        src: SocketAddr::new(src_ip, src_port),
        dst: SocketAddr::new(dst_ip, dst_port),
        payload,
    }
}
