//! SDP media-description scanning.
//!
//! A line-by-line scan for the three line shapes that matter to the media
//! path: `m=audio <port> RTP/AVP <pt>`, `a=rtpmap:<pt> <codec>/<rate>` and
//! `a=fmtp:<pt> <params>`. Each `m=` line opens a new description; `a=`
//! lines bind to it by payload type. Malformed lines are skipped
//! individually, and a description that never sees its rtpmap keeps empty
//! codec fields.

use crate::Direction;

/// One `m=audio` section of an SDP body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    pub port: u16,
    pub payload_type: u8,
    pub codec: String,
    pub sample_rate: u32,
    pub format_params: String,
    pub direction: Direction,
}

#[derive(Debug, Default)]
pub struct SessionDescription {
    pub media: Vec<MediaDescription>,
}

impl SessionDescription {
    pub fn parse(body: &str, direction: Direction) -> Self {
        let mut media: Vec<MediaDescription> = Vec::new();

        for line in body.lines() {
            let line = line.trim_end();

            if let Some(rest) = line.strip_prefix("m=audio ") {
                if let Some(desc) = parse_media_line(rest, direction) {
                    media.push(desc);
                }
            } else if let Some(rest) = line.strip_prefix("a=rtpmap:") {
                let Some(current) = media.last_mut() else {
                    continue;
                };
                if let Some((pt, codec, rate)) = parse_rtpmap(rest) {
                    if pt == current.payload_type {
                        current.codec = codec.to_string();
                        current.sample_rate = rate;
                    }
                }
            } else if let Some(rest) = line.strip_prefix("a=fmtp:") {
                let Some(current) = media.last_mut() else {
                    continue;
                };
                if let Some((pt, params)) = parse_fmtp(rest) {
                    if pt == current.payload_type {
                        current.format_params = params.to_string();
                    }
                }
            }
        }

        Self { media }
    }
}

fn parse_media_line(rest: &str, direction: Direction) -> Option<MediaDescription> {
    let mut parts = rest.split_whitespace();
    let port = parts.next()?.parse().ok()?;
    if parts.next()? != "RTP/AVP" {
        return None;
    }
    let payload_type = parts.next()?.parse().ok()?;

    Some(MediaDescription {
        port,
        payload_type,
        codec: String::new(),
        sample_rate: 0,
        format_params: String::new(),
        direction,
    })
}

fn parse_rtpmap(rest: &str) -> Option<(u8, &str, u32)> {
    let (pt, mapping) = rest.split_once(' ')?;
    let pt = pt.trim().parse().ok()?;
    let (codec, rate) = mapping.split_once('/')?;
    // A trailing "/channels" part may follow the rate.
    let rate = rate.split('/').next()?.trim().parse().ok()?;
    Some((pt, codec.trim(), rate))
}

fn parse_fmtp(rest: &str) -> Option<(u8, &str)> {
    let (pt, params) = rest.split_once(' ')?;
    Some((pt.trim().parse().ok()?, params.trim()))
}
