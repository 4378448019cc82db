use anyhow::Result;
use call_monitor_codec::{
    Direction,
    sdp::SessionDescription,
    sip::{MessageKind, SipMessage},
};

mod samples {
    pub const INVITE: &[u8] = b"INVITE sip:bob@biloxi.example.com SIP/2.0\r\n\
        Via: SIP/2.0/UDP pc33.atlanta.example.com;branch=z9hG4bK776asdhds\r\n\
        Max-Forwards: 70\r\n\
        To: Bob <sip:bob@biloxi.example.com>\r\n\
        From: Alice <sip:alice@atlanta.example.com>;tag=1928301774\r\n\
        Call-ID: a84b4c76e66710@pc33.atlanta.example.com\r\n\
        CSeq: 314159 INVITE\r\n\
        Contact: <sip:alice@pc33.atlanta.example.com>\r\n\
        Content-Type: application/sdp\r\n\
        Content-Length: 142\r\n\
        \r\n\
        v=0\r\n\
        o=alice 2890844526 2890844526 IN IP4 pc33.atlanta.example.com\r\n\
        s=Session SDP\r\n\
        c=IN IP4 192.0.2.101\r\n\
        t=0 0\r\n\
        m=audio 49172 RTP/AVP 0\r\n\
        a=rtpmap:0 PCMU/8000\r\n";

    pub const OK_INVITE: &[u8] = b"SIP/2.0 200 OK\r\n\
        Via: SIP/2.0/UDP pc33.atlanta.example.com;branch=z9hG4bK776asdhds\r\n\
        To: Bob <sip:bob@biloxi.example.com>;tag=a6c85cf\r\n\
        From: Alice <sip:alice@atlanta.example.com>;tag=1928301774\r\n\
        Call-ID: a84b4c76e66710@pc33.atlanta.example.com\r\n\
        CSeq: 314159 INVITE\r\n\
        \r\n";

    pub const BYE: &[u8] = b"BYE sip:alice@pc33.atlanta.example.com SIP/2.0\r\n\
        To: Alice <sip:alice@atlanta.example.com>;tag=1928301774\r\n\
        From: Bob <sip:bob@biloxi.example.com>;tag=a6c85cf\r\n\
        Call-ID: a84b4c76e66710@pc33.atlanta.example.com\r\n\
        CSeq: 231 BYE\r\n\
        \r\n";

    pub const OK_BYE: &[u8] = b"SIP/2.0 200 OK\r\n\
        Call-ID: a84b4c76e66710@pc33.atlanta.example.com\r\n\
        CSeq: 231 BYE\r\n\
        \r\n";

    pub const BUSY: &[u8] = b"SIP/2.0 486 Busy Here\r\n\
        Call-ID: a84b4c76e66710@pc33.atlanta.example.com\r\n\
        CSeq: 314159 INVITE\r\n\
        \r\n";
}

#[test]
fn invite_request() -> Result<()> {
    let msg = SipMessage::parse(samples::INVITE)?;

    assert!(msg.is_request("INVITE"));
    assert_eq!(
        msg.kind,
        MessageKind::Request {
            method: "INVITE",
            uri: "sip:bob@biloxi.example.com"
        }
    );
    assert_eq!(msg.call_id, Some("a84b4c76e66710@pc33.atlanta.example.com"));
    assert_eq!(msg.from_tag, Some("1928301774"));
    assert_eq!(msg.to_tag, None);
    assert!(msg.body.is_some());
    Ok(())
}

#[test]
fn invite_sdp_body() -> Result<()> {
    let msg = SipMessage::parse(samples::INVITE)?;
    let body = msg.body.ok_or_else(|| anyhow::anyhow!("missing SDP body"))?;
    let sdp = SessionDescription::parse(body, Direction::Outgoing);

    assert_eq!(sdp.media.len(), 1);
    assert_eq!(sdp.media[0].port, 49172);
    assert_eq!(sdp.media[0].payload_type, 0);
    assert_eq!(sdp.media[0].codec, "PCMU");
    assert_eq!(sdp.media[0].sample_rate, 8000);
    assert_eq!(sdp.media[0].direction, Direction::Outgoing);
    Ok(())
}

#[test]
fn response_classification() -> Result<()> {
    let ok = SipMessage::parse(samples::OK_INVITE)?;
    assert_eq!(ok.response_code(), Some(200));
    assert!(ok.answers("INVITE"));
    assert_eq!(ok.to_tag, Some("a6c85cf"));

    let ok_bye = SipMessage::parse(samples::OK_BYE)?;
    assert_eq!(ok_bye.response_code(), Some(200));
    assert!(ok_bye.answers("BYE"));

    let busy = SipMessage::parse(samples::BUSY)?;
    assert_eq!(busy.response_code(), Some(486));
    Ok(())
}

#[test]
fn bye_request() -> Result<()> {
    let msg = SipMessage::parse(samples::BYE)?;
    assert!(msg.is_request("BYE"));
    assert!(!msg.is_request("INVITE"));
    assert!(msg.answers("BYE"));
    Ok(())
}
