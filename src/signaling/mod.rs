//! Signaling between the broadcaster and its viewers
//!
//! ```text
//!   ViewerConnection ──viewer-join──►┐
//!                                    │  topic "live:<session>"
//!   PeerConnectionManager ◄──────────┤  (RealtimeTransport)
//!          │                         │
//!          └──offer──────────────────┼──► ViewerConnection
//!   ◄──answer / ice-candidate────────┘
//! ```
//!
//! The transport is at-least-once with no cross-pair ordering. All
//! deduplication happens in the peer state machines using the instance and
//! revision carried in each payload.

pub mod channel;
pub mod envelope;
pub mod transport;

pub use channel::{SignalingChannel, SignalingConfig, Subscription, SubscriptionHandle};
pub use envelope::{
    CandidatePayload, DescriptionPayload, IceCandidate, JoinPayload, LeavePayload, SdpType,
    SessionDescription, Signal, SignalKind, SignalingEnvelope,
};
pub use transport::{MemoryRealtime, RealtimeTransport};
