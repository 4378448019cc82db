//! SIP message parsing.
//!
//! The monitor only needs the pieces of a SIP message that drive dialog
//! tracking: whether it is a request or a response, the method or status
//! code, the CSeq method the message answers, the Call-ID, the From/To tag
//! parameters, and where the body starts. Everything else is carried along
//! unparsed.

use crate::Error;

/// A parsed SIP message, borrowing from the datagram.
#[derive(Debug)]
pub struct SipMessage<'a> {
    pub kind: MessageKind<'a>,
    /// Method named in the CSeq header, when present. A `200` answering an
    /// INVITE and one answering a BYE drive very different transitions.
    pub cseq_method: Option<&'a str>,
    pub call_id: Option<&'a str>,
    pub from_tag: Option<&'a str>,
    pub to_tag: Option<&'a str>,
    /// Message body after the `CRLF CRLF` boundary, when non-empty.
    pub body: Option<&'a str>,
    /// The request/status line, for debug logging.
    pub first_line: &'a str,
}

#[derive(Debug, PartialEq, Eq)]
pub enum MessageKind<'a> {
    Request { method: &'a str, uri: &'a str },
    Response { code: u16 },
}

impl<'a> SipMessage<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self, Error> {
        let text = std::str::from_utf8(payload)?;

        let first_line = text.lines().next().ok_or(Error::NotSip)?.trim_end();
        let kind = parse_first_line(first_line)?;

        let (headers, body) = match text.split_once("\r\n\r\n") {
            Some((h, b)) => (h, (!b.is_empty()).then_some(b)),
            None => (text, None),
        };

        let mut cseq_method = None;
        let mut call_id = None;
        let mut from_tag = None;
        let mut to_tag = None;

        for line in headers.lines().skip(1) {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();

            // Compact header forms (i, f, t) show up in the wild.
            match name.trim() {
                n if n.eq_ignore_ascii_case("cseq") => {
                    cseq_method = value.split_whitespace().nth(1);
                }
                n if n.eq_ignore_ascii_case("call-id") || n.eq_ignore_ascii_case("i") => {
                    call_id = Some(value);
                }
                n if n.eq_ignore_ascii_case("from") || n.eq_ignore_ascii_case("f") => {
                    from_tag = tag_param(value);
                }
                n if n.eq_ignore_ascii_case("to") || n.eq_ignore_ascii_case("t") => {
                    to_tag = tag_param(value);
                }
                _ => {}
            }
        }

        Ok(Self {
            kind,
            cseq_method,
            call_id,
            from_tag,
            to_tag,
            body,
            first_line,
        })
    }

    pub fn is_request(&self, method: &str) -> bool {
        matches!(self.kind, MessageKind::Request { method: m, .. } if m.eq_ignore_ascii_case(method))
    }

    pub fn response_code(&self) -> Option<u16> {
        match self.kind {
            MessageKind::Response { code } => Some(code),
            _ => None,
        }
    }

    /// Whether the CSeq names the given method.
    pub fn answers(&self, method: &str) -> bool {
        self.cseq_method
            .is_some_and(|m| m.eq_ignore_ascii_case(method))
    }
}

fn parse_first_line(line: &str) -> Result<MessageKind<'_>, Error> {
    if let Some(rest) = line.strip_prefix("SIP/2.0 ") {
        let code = rest
            .split_whitespace()
            .next()
            .and_then(|c| c.parse::<u16>().ok())
            .ok_or(Error::NotSip)?;
        return Ok(MessageKind::Response { code });
    }

    let mut parts = line.split_whitespace();
    let (method, uri, version) = (
        parts.next().ok_or(Error::NotSip)?,
        parts.next().ok_or(Error::NotSip)?,
        parts.next().ok_or(Error::NotSip)?,
    );

    if version != "SIP/2.0" || method.is_empty() {
        return Err(Error::NotSip);
    }

    Ok(MessageKind::Request { method, uri })
}

fn tag_param(value: &str) -> Option<&str> {
    value.split(';').skip(1).find_map(|param| {
        let (name, tag) = param.split_once('=')?;
        name.trim().eq_ignore_ascii_case("tag").then(|| tag.trim())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_line() {
        let msg = SipMessage::parse(
            b"INVITE sip:bob@example.com SIP/2.0\r\n\
              Call-ID: abc123@host\r\n\
              From: <sip:alice@example.com>;tag=a1\r\n\
              To: <sip:bob@example.com>\r\n\
              CSeq: 1 INVITE\r\n\r\n",
        )
        .unwrap();

        assert!(msg.is_request("INVITE"));
        assert_eq!(msg.call_id, Some("abc123@host"));
        assert_eq!(msg.from_tag, Some("a1"));
        assert_eq!(msg.to_tag, None);
        assert!(msg.answers("INVITE"));
    }

    #[test]
    fn status_line_with_cseq() {
        let msg = SipMessage::parse(
            b"SIP/2.0 200 OK\r\n\
              CSeq: 2 BYE\r\n\
              To: <sip:bob@example.com>;tag=b7\r\n\r\n",
        )
        .unwrap();

        assert_eq!(msg.response_code(), Some(200));
        assert!(msg.answers("BYE"));
        assert!(!msg.answers("INVITE"));
        assert_eq!(msg.to_tag, Some("b7"));
    }

    #[test]
    fn body_after_boundary() {
        let msg = SipMessage::parse(
            b"INVITE sip:b SIP/2.0\r\nContent-Type: application/sdp\r\n\r\nv=0\r\n",
        )
        .unwrap();
        assert_eq!(msg.body, Some("v=0\r\n"));
    }

    #[test]
    fn garbage_is_not_sip() {
        assert!(SipMessage::parse(b"\x80\x00RTP-ish").is_err());
        assert!(SipMessage::parse(b"hello world\r\n").is_err());
        assert!(SipMessage::parse(b"").is_err());
    }
}
