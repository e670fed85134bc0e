//! Signaling envelope wire format
//!
//! Envelopes travel as JSON objects on a session-scoped topic:
//!
//! ```text
//! {
//!   "sessionId": "...",
//!   "fromId":    "...",
//!   "toId":      "..." | null,      null = broadcast (viewer-join, session-end)
//!   "kind":      "viewer-join" | "offer" | "answer" | "ice-candidate"
//!                | "viewer-leave" | "session-end",
//!   "payload":   { ... }            shape depends on kind
//! }
//! ```
//!
//! Every negotiation payload carries the viewer `instance` it belongs to and
//! the link `revision` it was produced for, so either side can tell a stale or
//! duplicated message from a fresh one without any help from the transport.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Envelope kind as it appears on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    ViewerJoin,
    Offer,
    Answer,
    IceCandidate,
    ViewerLeave,
    SessionEnd,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SignalKind::ViewerJoin => "viewer-join",
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
            SignalKind::ViewerLeave => "viewer-leave",
            SignalKind::SessionEnd => "session-end",
        };
        f.write_str(name)
    }
}

/// Offer or answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description as exchanged during negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Candidate network path
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        }
    }
}

/// Payload of `viewer-join`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinPayload {
    /// Identity of the viewer connection instance
    pub instance: String,
    /// Bumped each time the viewer discards its connection and re-announces
    pub epoch: u32,
}

/// Payload of `offer` and `answer`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptionPayload {
    pub description: SessionDescription,
    pub instance: String,
    pub revision: u32,
    /// Viewer epoch at the time of answering (answers only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<u32>,
}

/// Payload of `ice-candidate`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: IceCandidate,
    pub instance: String,
    pub revision: u32,
}

/// Payload of `viewer-leave`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeavePayload {
    pub instance: String,
}

/// Typed envelope body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    ViewerJoin(JoinPayload),
    Offer(DescriptionPayload),
    Answer(DescriptionPayload),
    IceCandidate(CandidatePayload),
    ViewerLeave(LeavePayload),
    SessionEnd,
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::ViewerJoin(_) => SignalKind::ViewerJoin,
            Signal::Offer(_) => SignalKind::Offer,
            Signal::Answer(_) => SignalKind::Answer,
            Signal::IceCandidate(_) => SignalKind::IceCandidate,
            Signal::ViewerLeave(_) => SignalKind::ViewerLeave,
            Signal::SessionEnd => SignalKind::SessionEnd,
        }
    }
}

/// Connection-setup message exchanged between the broadcaster and a viewer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope", into = "WireEnvelope")]
pub struct SignalingEnvelope {
    pub session_id: String,
    pub from_id: String,
    /// `None` addresses every subscriber of the session
    pub to_id: Option<String>,
    pub signal: Signal,
}

impl SignalingEnvelope {
    pub fn new(
        session_id: impl Into<String>,
        from_id: impl Into<String>,
        to_id: Option<String>,
        signal: Signal,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            from_id: from_id.into(),
            to_id,
            signal,
        }
    }

    /// Broadcast announcement from a viewer
    pub fn viewer_join(session_id: &str, viewer_id: &str, payload: JoinPayload) -> Self {
        Self::new(session_id, viewer_id, None, Signal::ViewerJoin(payload))
    }

    /// Broadcast termination notice from the broadcaster
    pub fn session_end(session_id: &str, broadcaster_id: &str) -> Self {
        Self::new(session_id, broadcaster_id, None, Signal::SessionEnd)
    }

    /// Targeted envelope
    pub fn targeted(session_id: &str, from_id: &str, to_id: &str, signal: Signal) -> Self {
        Self::new(session_id, from_id, Some(to_id.to_string()), signal)
    }

    pub fn kind(&self) -> SignalKind {
        self.signal.kind()
    }

    /// Whether this envelope should be handled by `participant_id`
    ///
    /// Broadcasts are for everyone except their sender.
    pub fn is_for(&self, participant_id: &str) -> bool {
        match &self.to_id {
            Some(to) => to == participant_id,
            None => self.from_id != participant_id,
        }
    }

    /// Serialize to the JSON wire form
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Parse the JSON wire form
    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    session_id: String,
    from_id: String,
    to_id: Option<String>,
    kind: SignalKind,
    #[serde(default)]
    payload: Value,
}

impl TryFrom<WireEnvelope> for SignalingEnvelope {
    type Error = serde_json::Error;

    fn try_from(wire: WireEnvelope) -> std::result::Result<Self, Self::Error> {
        let payload = wire.payload;
        let signal = match wire.kind {
            SignalKind::ViewerJoin => Signal::ViewerJoin(serde_json::from_value(payload)?),
            SignalKind::Offer => Signal::Offer(serde_json::from_value(payload)?),
            SignalKind::Answer => Signal::Answer(serde_json::from_value(payload)?),
            SignalKind::IceCandidate => Signal::IceCandidate(serde_json::from_value(payload)?),
            SignalKind::ViewerLeave => Signal::ViewerLeave(serde_json::from_value(payload)?),
            SignalKind::SessionEnd => Signal::SessionEnd,
        };

        Ok(SignalingEnvelope {
            session_id: wire.session_id,
            from_id: wire.from_id,
            to_id: wire.to_id,
            signal,
        })
    }
}

impl From<SignalingEnvelope> for WireEnvelope {
    fn from(envelope: SignalingEnvelope) -> Self {
        let kind = envelope.kind();
        let payload = match envelope.signal {
            Signal::ViewerJoin(p) => serde_json::to_value(p),
            Signal::Offer(p) | Signal::Answer(p) => serde_json::to_value(p),
            Signal::IceCandidate(p) => serde_json::to_value(p),
            Signal::ViewerLeave(p) => serde_json::to_value(p),
            Signal::SessionEnd => Ok(Value::Object(Default::default())),
        }
        .unwrap_or(Value::Null);

        WireEnvelope {
            session_id: envelope.session_id,
            from_id: envelope.from_id,
            to_id: envelope.to_id,
            kind,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_viewer_join_wire_shape() {
        let env = SignalingEnvelope::viewer_join(
            "s1",
            "viewer-7",
            JoinPayload {
                instance: "i1".into(),
                epoch: 2,
            },
        );
        let json: Value = serde_json::from_slice(&env.encode().unwrap()).unwrap();

        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["fromId"], "viewer-7");
        assert!(json["toId"].is_null());
        assert_eq!(json["kind"], "viewer-join");
        assert_eq!(json["payload"]["epoch"], 2);
    }

    #[test]
    fn test_parse_candidate_from_browser_shape() {
        let raw = br#"{
            "sessionId": "s1",
            "fromId": "viewer-1",
            "toId": "host",
            "kind": "ice-candidate",
            "payload": {
                "candidate": {"candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host", "sdpMid": "0", "sdpMLineIndex": 0},
                "instance": "abc",
                "revision": 3
            }
        }"#;

        let env = SignalingEnvelope::decode(raw).unwrap();
        assert_eq!(env.kind(), SignalKind::IceCandidate);
        assert!(env.is_for("host"));
        assert!(!env.is_for("viewer-2"));
        match env.signal {
            Signal::IceCandidate(p) => {
                assert_eq!(p.revision, 3);
                assert_eq!(p.candidate.sdp_m_line_index, Some(0));
            }
            other => panic!("unexpected signal: {:?}", other),
        }
    }

    #[test]
    fn test_offer_omits_epoch() {
        let env = SignalingEnvelope::targeted(
            "s1",
            "host",
            "viewer-1",
            Signal::Offer(DescriptionPayload {
                description: SessionDescription::offer("v=0"),
                instance: "abc".into(),
                revision: 1,
                epoch: None,
            }),
        );
        let json: Value = serde_json::from_slice(&env.encode().unwrap()).unwrap();
        assert_eq!(json["payload"]["description"]["type"], "offer");
        assert!(json["payload"].get("epoch").is_none());

        let back = SignalingEnvelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn test_session_end_accepts_missing_payload() {
        let raw = br#"{"sessionId":"s1","fromId":"host","toId":null,"kind":"session-end"}"#;
        let env = SignalingEnvelope::decode(raw).unwrap();
        assert_eq!(env.signal, Signal::SessionEnd);
        assert!(env.is_for("viewer-1"));
        assert!(!env.is_for("host"));
    }

    #[test]
    fn test_rejects_bad_payload() {
        let raw = br#"{"sessionId":"s1","fromId":"v","toId":null,"kind":"viewer-join","payload":{"epoch":"x"}}"#;
        assert!(SignalingEnvelope::decode(raw).is_err());

        let raw = br#"{"sessionId":"s1","fromId":"v","toId":null,"kind":"shout","payload":{}}"#;
        assert!(SignalingEnvelope::decode(raw).is_err());
    }
}
