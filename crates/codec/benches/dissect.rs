use criterion::{Criterion, criterion_group, criterion_main};

use call_monitor_codec::{dissect::dissect, rtp::RtpPacket, sip::SipMessage};

fn rtp_frame() -> Vec<u8> {
    let mut rtp = vec![0u8; 172];
    rtp[0] = 0x80;
    rtp[2..4].copy_from_slice(&100u16.to_be_bytes());
    rtp[8..12].copy_from_slice(&0xdeadbeefu32.to_be_bytes());

    let total_len = 20 + 8 + rtp.len();
    let mut frame = vec![0u8; 14 + total_len];
    frame[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
    frame[14] = 0x45;
    frame[16..18].copy_from_slice(&(total_len as u16).to_be_bytes());
    frame[23] = 17;
    frame[34..36].copy_from_slice(&16384u16.to_be_bytes());
    frame[36..38].copy_from_slice(&16385u16.to_be_bytes());
    frame[42..].copy_from_slice(&rtp);
    frame
}

const INVITE: &[u8] = b"INVITE sip:bob@example.com SIP/2.0\r\n\
    From: <sip:alice@example.com>;tag=1928301774\r\n\
    To: <sip:bob@example.com>\r\n\
    Call-ID: a84b4c76e66710@example.com\r\n\
    CSeq: 314159 INVITE\r\n\
    \r\n\
    v=0\r\n\
    m=audio 49172 RTP/AVP 0\r\n\
    a=rtpmap:0 PCMU/8000\r\n";

fn criterion_benchmark(c: &mut Criterion) {
    let frame = rtp_frame();

    c.bench_function("dissect_ipv4_udp", |b| {
        b.iter(|| dissect(std::hint::black_box(&frame)).unwrap())
    });

    c.bench_function("parse_rtp_header", |b| {
        let view = dissect(&frame).unwrap();
        b.iter(|| RtpPacket::parse(std::hint::black_box(view.payload)).unwrap())
    });

    c.bench_function("parse_sip_invite", |b| {
        b.iter(|| SipMessage::parse(std::hint::black_box(INVITE)).unwrap())
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
