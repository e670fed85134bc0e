//! In-process peer transport
//!
//! `LoopbackNetwork` pairs an offerer with an answerer through the token it
//! embeds in the offer SDP (`a=x-loopback:<token>`). A pair becomes
//! connected once both sides have applied the remote description and at
//! least one remote candidate, at which point media is relayed from the
//! offerer's outgoing tracks to a fresh stream on the answerer.
//!
//! ```text
//!   offerer.add_track(t) ──► watch<MediaTrack> ──► forwarder ──► answerer stream
//!   offerer.replace_track(t') ─┘   (swapped in place, same answerer stream)
//! ```
//!
//! Faults can be injected per viewer: `fail_next` makes the next
//! establishments fail, `break_link` drops an established pair.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::media::{MediaStream, MediaTrack, TrackKind};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};

use super::connection::{PeerConnection, PeerConnector, PeerEvent, PeerEventSink, PeerRole};

const TOKEN_ATTRIBUTE: &str = "a=x-loopback:";

/// Shared in-process network
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

#[derive(Default)]
struct NetworkState {
    pairs: HashMap<String, Pairing>,
    planned_failures: HashMap<String, u32>,
    next_port: u16,
    established: u64,
    failed: u64,
}

struct Pairing {
    offerer: Arc<Endpoint>,
    answerer: Option<Arc<Endpoint>>,
    established: bool,
}

impl Pairing {
    fn viewer_id(&self) -> &str {
        &self.offerer.remote_id
    }
}

struct Endpoint {
    local_id: String,
    remote_id: String,
    role: PeerRole,
    events: PeerEventSink,
    state: Mutex<EndpointState>,
}

#[derive(Default)]
struct EndpointState {
    token: Option<String>,
    local_description: bool,
    remote_description: bool,
    remote_candidates: HashSet<String>,
    senders: Vec<watch::Sender<MediaTrack>>,
    forwarders: Vec<JoinHandle<()>>,
    closed: bool,
}

impl Endpoint {
    fn is_ready(&self) -> bool {
        let state = self.state.lock();
        !state.closed
            && state.local_description
            && state.remote_description
            && !state.remote_candidates.is_empty()
    }

    fn stop_forwarding(&self) {
        for task in self.state.lock().forwarders.drain(..) {
            task.abort();
        }
    }
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` establishments involving `viewer_id` fail
    pub fn fail_next(&self, viewer_id: &str, count: u32) {
        *self
            .inner
            .lock()
            .planned_failures
            .entry(viewer_id.to_string())
            .or_insert(0) += count;
    }

    /// Drop every established pair involving `viewer_id`
    ///
    /// Both ends receive `PeerEvent::Failed`. Returns the number of pairs
    /// broken.
    pub fn break_link(&self, viewer_id: &str) -> usize {
        let broken: Vec<Pairing> = {
            let mut net = self.inner.lock();
            let tokens: Vec<String> = net
                .pairs
                .iter()
                .filter(|(_, p)| p.established && p.viewer_id() == viewer_id)
                .map(|(token, _)| token.clone())
                .collect();
            tokens
                .iter()
                .filter_map(|token| net.pairs.remove(token))
                .collect()
        };

        for pairing in &broken {
            tracing::debug!(viewer = viewer_id, "Loopback link broken");
            pairing.offerer.events.emit(PeerEvent::Failed("link interrupted".into()));
            if let Some(answerer) = &pairing.answerer {
                answerer.stop_forwarding();
                answerer.events.emit(PeerEvent::Failed("link interrupted".into()));
            }
        }
        broken.len()
    }

    /// Number of pairs that reached connectivity
    pub fn established_count(&self) -> u64 {
        self.inner.lock().established
    }

    /// Number of pairs that failed at establishment
    pub fn failed_count(&self) -> u64 {
        self.inner.lock().failed
    }

    fn next_candidate(&self) -> IceCandidate {
        let mut net = self.inner.lock();
        net.next_port = net.next_port.wrapping_add(1);
        let port = 40_000u32 + net.next_port as u32;
        IceCandidate::new(format!(
            "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
            net.next_port, port
        ))
    }

    fn register_offer(&self, token: &str, offerer: Arc<Endpoint>) {
        self.inner.lock().pairs.insert(
            token.to_string(),
            Pairing {
                offerer,
                answerer: None,
                established: false,
            },
        );
    }

    fn attach_answerer(&self, token: &str, answerer: &Arc<Endpoint>) -> Result<()> {
        let mut net = self.inner.lock();
        let pairing = net
            .pairs
            .get_mut(token)
            .ok_or_else(|| Error::NegotiationFailure("unknown or expired offer".into()))?;

        match &pairing.answerer {
            Some(existing) if !Arc::ptr_eq(existing, answerer) => Err(Error::NegotiationFailure(
                "offer already answered by another peer".into(),
            )),
            _ => {
                pairing.answerer = Some(Arc::clone(answerer));
                Ok(())
            }
        }
    }

    /// Connect the pair if both sides are ready
    fn try_establish(&self, token: &str) {
        let (offerer, answerer, fail) = {
            let mut net = self.inner.lock();
            let pairing = match net.pairs.get_mut(token) {
                Some(p) if !p.established => p,
                _ => return,
            };
            let answerer = match &pairing.answerer {
                Some(a) => Arc::clone(a),
                None => return,
            };
            if !pairing.offerer.is_ready() || !answerer.is_ready() {
                return;
            }

            pairing.established = true;
            let offerer = Arc::clone(&pairing.offerer);
            let fail = match net.planned_failures.get_mut(&offerer.remote_id) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            };
            if fail {
                net.pairs.remove(token);
                net.failed += 1;
            } else {
                net.established += 1;
            }
            (offerer, answerer, fail)
        };

        if fail {
            tracing::debug!(viewer = %offerer.remote_id, "Loopback establishment failed");
            offerer.events.emit(PeerEvent::Failed("ice connection failed".into()));
            answerer.events.emit(PeerEvent::Failed("ice connection failed".into()));
            return;
        }

        let sources: Vec<watch::Receiver<MediaTrack>> = offerer
            .state
            .lock()
            .senders
            .iter()
            .map(|s| s.subscribe())
            .collect();

        let mut tracks = Vec::with_capacity(sources.len());
        let mut forwarders = Vec::with_capacity(sources.len());
        for source in sources {
            let current = source.borrow().clone();
            let remote = MediaTrack::new(current.kind(), current.profile().clone());
            forwarders.push(tokio::spawn(forward(source, remote.clone())));
            tracks.push(remote);
        }
        answerer.state.lock().forwarders.extend(forwarders);

        tracing::debug!(
            offerer = %offerer.local_id,
            answerer = %answerer.local_id,
            tracks = tracks.len(),
            "Loopback pair connected"
        );

        offerer.events.emit(PeerEvent::Connected);
        answerer.events.emit(PeerEvent::Track(MediaStream::new(tracks)));
        answerer.events.emit(PeerEvent::Connected);
    }

    fn detach(&self, token: &str, endpoint: &Arc<Endpoint>) {
        let peer = {
            let mut net = self.inner.lock();
            let pairing = match net.pairs.get_mut(token) {
                Some(p) => p,
                None => return,
            };

            let is_offerer = Arc::ptr_eq(&pairing.offerer, endpoint);
            let is_answerer = pairing
                .answerer
                .as_ref()
                .map(|a| Arc::ptr_eq(a, endpoint))
                .unwrap_or(false);

            if pairing.established && (is_offerer || is_answerer) {
                let pairing = net.pairs.remove(token);
                pairing.and_then(|p| if is_offerer { p.answerer } else { Some(p.offerer) })
            } else if is_offerer {
                net.pairs.remove(token);
                None
            } else if is_answerer {
                pairing.answerer = None;
                None
            } else {
                None
            }
        };

        // Only a connected peer notices the other side going away
        if let Some(peer) = peer {
            peer.stop_forwarding();
            peer.events.emit(PeerEvent::Failed("remote peer closed".into()));
        }
    }
}

#[async_trait]
impl PeerConnector for LoopbackNetwork {
    async fn create(
        &self,
        local_id: &str,
        remote_id: &str,
        role: PeerRole,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>> {
        let endpoint = Arc::new(Endpoint {
            local_id: local_id.to_string(),
            remote_id: remote_id.to_string(),
            role,
            events,
            state: Mutex::new(EndpointState::default()),
        });
        Ok(Arc::new(LoopbackConnection {
            endpoint,
            network: self.clone(),
        }))
    }
}

/// Connection handle produced by [`LoopbackNetwork`]
pub struct LoopbackConnection {
    endpoint: Arc<Endpoint>,
    network: LoopbackNetwork,
}

impl LoopbackConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.endpoint.state.lock().closed {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    fn token(&self) -> Option<String> {
        self.endpoint.state.lock().token.clone()
    }

    fn announce_candidate(&self) {
        let candidate = self.network.next_candidate();
        self.endpoint.events.emit(PeerEvent::LocalCandidate(candidate));
    }
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    async fn add_track(&self, track: MediaTrack) -> Result<()> {
        self.ensure_open()?;
        if self.endpoint.role != PeerRole::Offerer {
            return Err(Error::InvalidState("answerer cannot send tracks".into()));
        }
        let (tx, _) = watch::channel(track);
        self.endpoint.state.lock().senders.push(tx);
        Ok(())
    }

    async fn replace_track(&self, track: MediaTrack) -> Result<()> {
        self.ensure_open()?;
        let state = self.endpoint.state.lock();
        let sender = state
            .senders
            .iter()
            .find(|s| s.borrow().is_compatible(&track))
            .ok_or_else(|| {
                Error::NegotiationFailure(format!("no compatible sender for {} track", track.kind()))
            })?;
        sender.send_replace(track);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        if self.endpoint.role != PeerRole::Offerer {
            return Err(Error::InvalidState("answerer cannot create offers".into()));
        }

        let token = Uuid::new_v4().to_string();
        let kinds: Vec<TrackKind> = {
            let mut state = self.endpoint.state.lock();
            state.token = Some(token.clone());
            state.local_description = true;
            state.senders.iter().map(|s| s.borrow().kind()).collect()
        };
        self.network
            .register_offer(&token, Arc::clone(&self.endpoint));
        self.announce_candidate();

        Ok(SessionDescription::offer(build_sdp(&token, &kinds, "sendonly")))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        let token = {
            let mut state = self.endpoint.state.lock();
            if !state.remote_description {
                return Err(Error::NegotiationFailure("remote offer not set".into()));
            }
            state.local_description = true;
            state.token.clone().unwrap_or_default()
        };
        self.announce_candidate();
        self.network.try_establish(&token);

        Ok(SessionDescription::answer(build_sdp(&token, &[], "recvonly")))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        let token = parse_token(&description.sdp)
            .ok_or_else(|| Error::NegotiationFailure("description has no loopback token".into()))?
            .to_string();

        match (self.endpoint.role, description.sdp_type) {
            (PeerRole::Answerer, SdpType::Offer) => {
                self.network.attach_answerer(&token, &self.endpoint)?;
                let mut state = self.endpoint.state.lock();
                state.token = Some(token.clone());
                state.remote_description = true;
            }
            (PeerRole::Offerer, SdpType::Answer) => {
                let mut state = self.endpoint.state.lock();
                if state.token.as_deref() != Some(token.as_str()) {
                    return Err(Error::NegotiationFailure(
                        "answer does not match the pending offer".into(),
                    ));
                }
                state.remote_description = true;
            }
            (role, sdp_type) => {
                return Err(Error::NegotiationFailure(format!(
                    "{:?} cannot apply remote {:?}",
                    role, sdp_type
                )));
            }
        }

        self.network.try_establish(&token);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.ensure_open()?;
        {
            let mut state = self.endpoint.state.lock();
            if !state.remote_description {
                return Err(Error::NegotiationFailure("remote description not set".into()));
            }
            state.remote_candidates.insert(candidate.candidate);
        }
        if let Some(token) = self.token() {
            self.network.try_establish(&token);
        }
        Ok(())
    }

    async fn close(&self) {
        let token = {
            let mut state = self.endpoint.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.senders.clear();
            for task in state.forwarders.drain(..) {
                task.abort();
            }
            state.token.clone()
        };
        if let Some(token) = token {
            self.network.detach(&token, &self.endpoint);
        }
    }
}

fn build_sdp(token: &str, kinds: &[TrackKind], direction: &str) -> String {
    let mut sdp = format!(
        "v=0\r\no=- 0 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n{}{}\r\n",
        TOKEN_ATTRIBUTE, token
    );
    for (mid, kind) in kinds.iter().enumerate() {
        sdp.push_str(&format!(
            "m={} 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:{}\r\na={}\r\n",
            kind, mid, direction
        ));
    }
    sdp
}

fn parse_token(sdp: &str) -> Option<&str> {
    sdp.lines()
        .find_map(|line| line.trim().strip_prefix(TOKEN_ATTRIBUTE))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Relay frames from whichever track currently sits in `source`
async fn forward(mut source: watch::Receiver<MediaTrack>, out: MediaTrack) {
    let mut frames = source.borrow_and_update().subscribe();
    loop {
        tokio::select! {
            changed = source.changed() => {
                if changed.is_err() {
                    break;
                }
                frames = source.borrow_and_update().subscribe();
            }
            frame = frames.recv() => match frame {
                Ok(frame) => {
                    out.send(frame);
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    if source.changed().await.is_err() {
                        break;
                    }
                    frames = source.borrow_and_update().subscribe();
                }
            }
        }
    }
}
