//! SIP dialog state machine.
//!
//! One dialog per call attempt, driven by the parsed signaling stream:
//!
//! | From    | Event                        | To          |
//! |---------|------------------------------|-------------|
//! | INIT    | request `INVITE`             | TRYING      |
//! | TRYING  | `200` answering INVITE       | ESTABLISHED |
//! | any     | request `BYE`                | TERMINATED  |
//! | any     | `200` answering BYE          | TERMINATED  |
//! | any     | request `CANCEL`             | TERMINATED  |
//! | TRYING  | `486` / `487` / `603`        | TERMINATED  |
//!
//! BYE and its 200 OK may arrive in either order; whichever comes first
//! stamps `last_bye_seen` and later arrivals leave it untouched, so the
//! teardown grace period is anchored to the first sign of hangup. Every
//! other message is observed (counted) without transitioning.

use codec::sip::SipMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DialogState {
    #[default]
    Init,
    Trying,
    Established,
    /// Terminal: no event leaves this state.
    Terminated,
}

impl std::fmt::Display for DialogState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Init => "INIT",
            Self::Trying => "TRYING",
            Self::Established => "ESTABLISHED",
            Self::Terminated => "TERMINATED",
        })
    }
}

#[derive(Debug, Default)]
pub struct Dialog {
    state: DialogState,
    call_id: Option<String>,
    local_tag: Option<String>,
    remote_tag: Option<String>,
    last_sip_seen_us: Option<i64>,
    last_bye_seen_us: Option<i64>,
    /// Messages that did not cause a transition.
    observed: u32,
}

impl Dialog {
    /// Feeds one parsed SIP message through the state machine. Returns the
    /// `(from, to)` pair when the message caused a transition.
    pub fn apply(
        &mut self,
        msg: &SipMessage<'_>,
        now_us: i64,
    ) -> Option<(DialogState, DialogState)> {
        self.last_sip_seen_us = Some(now_us);
        self.learn_identity(msg);

        let from = self.state;
        let to = match from {
            DialogState::Init if msg.is_request("INVITE") => DialogState::Trying,
            DialogState::Trying
                if msg.response_code() == Some(200) && msg.answers("INVITE") =>
            {
                DialogState::Established
            }
            DialogState::Trying
                if matches!(msg.response_code(), Some(486) | Some(487) | Some(603)) =>
            {
                DialogState::Terminated
            }
            _ if msg.is_request("BYE") => {
                self.mark_bye(now_us);
                DialogState::Terminated
            }
            _ if msg.response_code() == Some(200) && msg.answers("BYE") => {
                self.mark_bye(now_us);
                DialogState::Terminated
            }
            _ if msg.is_request("CANCEL") => DialogState::Terminated,
            _ => {
                self.observed += 1;
                return None;
            }
        };

        self.state = to;
        (from != to).then_some((from, to))
    }

    fn learn_identity(&mut self, msg: &SipMessage<'_>) {
        if self.call_id.is_none() {
            self.call_id = msg.call_id.map(str::to_string);
        }
        if self.remote_tag.is_none() && msg.is_request("INVITE") {
            self.remote_tag = msg.from_tag.map(str::to_string);
        }
        if self.local_tag.is_none() && msg.response_code().is_some() {
            self.local_tag = msg.to_tag.map(str::to_string);
        }
    }

    // First hangup signal wins, BYE retransmissions refresh nothing.
    fn mark_bye(&mut self, now_us: i64) {
        self.last_bye_seen_us.get_or_insert(now_us);
    }

    pub fn state(&self) -> DialogState {
        self.state
    }

    pub fn call_id(&self) -> Option<&str> {
        self.call_id.as_deref()
    }

    pub fn local_tag(&self) -> Option<&str> {
        self.local_tag.as_deref()
    }

    pub fn remote_tag(&self) -> Option<&str> {
        self.remote_tag.as_deref()
    }

    pub fn last_sip_seen_us(&self) -> Option<i64> {
        self.last_sip_seen_us
    }

    pub fn last_bye_seen_us(&self) -> Option<i64> {
        self.last_bye_seen_us
    }

    pub fn observed(&self) -> u32 {
        self.observed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(raw: &[u8]) -> SipMessage<'_> {
        SipMessage::parse(raw).unwrap()
    }

    #[test]
    fn happy_path() {
        let mut dialog = Dialog::default();

        let t = dialog.apply(&msg(b"INVITE sip:b SIP/2.0\r\nCSeq: 1 INVITE\r\n\r\n"), 1);
        assert_eq!(t, Some((DialogState::Init, DialogState::Trying)));

        // Provisional responses are observed only.
        assert!(
            dialog
                .apply(&msg(b"SIP/2.0 180 Ringing\r\nCSeq: 1 INVITE\r\n\r\n"), 2)
                .is_none()
        );
        assert_eq!(dialog.observed(), 1);

        let t = dialog.apply(&msg(b"SIP/2.0 200 OK\r\nCSeq: 1 INVITE\r\n\r\n"), 3);
        assert_eq!(t, Some((DialogState::Trying, DialogState::Established)));

        let t = dialog.apply(&msg(b"BYE sip:a SIP/2.0\r\nCSeq: 2 BYE\r\n\r\n"), 4);
        assert_eq!(t, Some((DialogState::Established, DialogState::Terminated)));
        assert_eq!(dialog.last_bye_seen_us(), Some(4));
    }

    #[test]
    fn bye_and_ok_in_either_order() {
        let mut dialog = Dialog::default();
        dialog.apply(&msg(b"INVITE sip:b SIP/2.0\r\nCSeq: 1 INVITE\r\n\r\n"), 1);
        dialog.apply(&msg(b"SIP/2.0 200 OK\r\nCSeq: 1 INVITE\r\n\r\n"), 2);

        // 200 for BYE overtakes the BYE itself.
        dialog.apply(&msg(b"SIP/2.0 200 OK\r\nCSeq: 2 BYE\r\n\r\n"), 10);
        assert_eq!(dialog.state(), DialogState::Terminated);
        assert_eq!(dialog.last_bye_seen_us(), Some(10));

        // The late BYE does not move the grace anchor.
        dialog.apply(&msg(b"BYE sip:a SIP/2.0\r\nCSeq: 2 BYE\r\n\r\n"), 20);
        assert_eq!(dialog.last_bye_seen_us(), Some(10));
    }

    #[test]
    fn rejection_codes_terminate_from_trying() {
        for code in ["486 Busy Here", "487 Request Terminated", "603 Decline"] {
            let mut dialog = Dialog::default();
            dialog.apply(&msg(b"INVITE sip:b SIP/2.0\r\nCSeq: 1 INVITE\r\n\r\n"), 1);

            let raw = format!("SIP/2.0 {}\r\nCSeq: 1 INVITE\r\n\r\n", code);
            dialog.apply(&msg(raw.as_bytes()), 2);
            assert_eq!(dialog.state(), DialogState::Terminated);
        }
    }

    #[test]
    fn cancel_terminates_without_bye_anchor() {
        let mut dialog = Dialog::default();
        dialog.apply(&msg(b"INVITE sip:b SIP/2.0\r\nCSeq: 1 INVITE\r\n\r\n"), 1);
        dialog.apply(&msg(b"CANCEL sip:b SIP/2.0\r\nCSeq: 1 CANCEL\r\n\r\n"), 2);

        assert_eq!(dialog.state(), DialogState::Terminated);
        assert_eq!(dialog.last_bye_seen_us(), None);
    }

    #[test]
    fn learns_call_identity() {
        let mut dialog = Dialog::default();
        dialog.apply(
            &msg(b"INVITE sip:b SIP/2.0\r\n\
                   Call-ID: 42@host\r\n\
                   From: <sip:a>;tag=remote1\r\n\
                   CSeq: 1 INVITE\r\n\r\n"),
            1,
        );
        dialog.apply(
            &msg(b"SIP/2.0 200 OK\r\n\
                   To: <sip:b>;tag=local1\r\n\
                   CSeq: 1 INVITE\r\n\r\n"),
            2,
        );

        assert_eq!(dialog.call_id(), Some("42@host"));
        assert_eq!(dialog.remote_tag(), Some("remote1"));
        assert_eq!(dialog.local_tag(), Some("local1"));
    }
}
