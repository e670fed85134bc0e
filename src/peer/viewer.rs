//! Viewer-side connection state machine
//!
//! ```text
//!   Waiting ──offer──► Connecting ──first track──► Connected
//!     ▲  │                 │                           │
//!     │  └─ no offer ──────┼───────────────────────────┼──► Failed ──restart()──► Waiting
//!     │                    └── transport failure ──────┘
//!     └──────── (retry budget left: new epoch, announce again)
//!   any ──close() / session-end──► Closed
//! ```
//!
//! The machine runs on its own task. The handle only sends commands and
//! reads `watch` snapshots of the state and the received stream.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::media::MediaStream;
use crate::signaling::{
    CandidatePayload, DescriptionPayload, IceCandidate, JoinPayload, LeavePayload,
    SessionDescription, Signal, SignalingChannel, SignalingEnvelope, Subscription,
};

use super::config::ViewerConfig;
use super::connection::{PeerConnection, PeerConnector, PeerEvent, PeerEventSink, PeerRole};
use super::negotiation::{classify_offer, CandidateAction, Negotiation, OfferDisposition};

/// Viewer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewerState {
    /// Announcing and waiting for an offer
    Waiting,
    /// Answer sent, waiting for media
    Connecting,
    /// Receiving the broadcaster's stream
    Connected,
    /// Gave up; `restart()` starts over
    Failed,
    /// Closed for good
    Closed,
}

impl std::fmt::Display for ViewerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ViewerState::Waiting => "waiting",
            ViewerState::Connecting => "connecting",
            ViewerState::Connected => "connected",
            ViewerState::Failed => "failed",
            ViewerState::Closed => "closed",
        };
        f.write_str(name)
    }
}

enum ViewerCommand {
    Close(oneshot::Sender<()>),
    Restart,
}

/// One viewer's connection to a live session
pub struct ViewerConnection {
    session_id: String,
    viewer_id: String,
    instance: String,
    commands: mpsc::UnboundedSender<ViewerCommand>,
    state: watch::Receiver<ViewerState>,
    stream: watch::Receiver<Option<MediaStream>>,
    task: JoinHandle<()>,
}

impl ViewerConnection {
    /// Subscribe to the session and start announcing
    pub async fn connect(
        session_id: &str,
        viewer_id: &str,
        channel: SignalingChannel,
        connector: Arc<dyn PeerConnector>,
        config: ViewerConfig,
    ) -> Result<Self> {
        let subscription = channel.subscribe(session_id).await?;
        let instance = Uuid::new_v4().to_string();

        let (state_tx, state_rx) = watch::channel(ViewerState::Waiting);
        let (stream_tx, stream_rx) = watch::channel(None);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let task = ViewerTask {
            session_id: session_id.to_string(),
            viewer_id: viewer_id.to_string(),
            instance: instance.clone(),
            broadcaster_id: None,
            channel,
            connector,
            config,
            state: state_tx,
            stream: stream_tx,
            epoch: 1,
            last_revision: 0,
            negotiation: Negotiation::new(),
            connection: None,
            generation: 0,
            events_tx,
            announcements: 0,
            next_announce: None,
            failures: 0,
        };

        tracing::info!(session = session_id, viewer = viewer_id, "Viewer connecting");

        Ok(Self {
            session_id: session_id.to_string(),
            viewer_id: viewer_id.to_string(),
            instance,
            commands: command_tx,
            state: state_rx,
            stream: stream_rx,
            task: tokio::spawn(task.run(subscription, command_rx, events_rx)),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    /// Identity of this connection instance on the wire
    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn state(&self) -> ViewerState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ViewerState> {
        self.state.clone()
    }

    /// Wait until the viewer reaches `target`
    ///
    /// Fails with `Error::Closed` if the viewer stops in another state.
    pub async fn wait_for_state(&self, target: ViewerState) -> Result<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|s| *s == target)
            .await
            .map(|_| ())
            .map_err(|_| Error::Closed)
    }

    /// Read-only handle to the received stream, once connected
    pub fn stream(&self) -> Option<MediaStream> {
        self.stream.borrow().clone()
    }

    /// Close from any state; later envelopes are ignored
    pub async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(ViewerCommand::Close(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Start over after `Failed` with fresh budgets
    pub fn restart(&self) -> Result<()> {
        if self.state() != ViewerState::Failed {
            return Err(Error::InvalidState(format!(
                "cannot restart viewer in {} state",
                self.state()
            )));
        }
        self.commands
            .send(ViewerCommand::Restart)
            .map_err(|_| Error::Closed)
    }
}

impl Drop for ViewerConnection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct ViewerTask {
    session_id: String,
    viewer_id: String,
    instance: String,
    broadcaster_id: Option<String>,
    channel: SignalingChannel,
    connector: Arc<dyn PeerConnector>,
    config: ViewerConfig,
    state: watch::Sender<ViewerState>,
    stream: watch::Sender<Option<MediaStream>>,
    epoch: u32,
    last_revision: u32,
    negotiation: Negotiation,
    connection: Option<Arc<dyn PeerConnection>>,
    generation: u32,
    events_tx: mpsc::UnboundedSender<(u32, PeerEvent)>,
    announcements: u32,
    next_announce: Option<Instant>,
    failures: u32,
}

impl ViewerTask {
    async fn run(
        mut self,
        mut subscription: Subscription,
        mut commands: mpsc::UnboundedReceiver<ViewerCommand>,
        mut events: mpsc::UnboundedReceiver<(u32, PeerEvent)>,
    ) {
        self.enter_waiting().await;
        let mut signaling_open = true;

        loop {
            let announce_at = self.next_announce;
            // Peer events go first: a failure must be counted before any
            // offer that was sent in reaction to it
            tokio::select! {
                biased;
                Some((generation, event)) = events.recv() => {
                    if generation == self.generation {
                        self.on_peer_event(event).await;
                    }
                }
                command = commands.recv() => match command {
                    Some(ViewerCommand::Close(ack)) => {
                        self.close(true).await;
                        let _ = ack.send(());
                    }
                    Some(ViewerCommand::Restart) => self.restart().await,
                    None => self.close(true).await,
                },
                envelope = subscription.recv(), if signaling_open => match envelope {
                    Some(envelope) => self.on_envelope(envelope).await,
                    None => {
                        signaling_open = false;
                        tracing::warn!(viewer = %self.viewer_id, "Signaling subscription closed");
                    }
                },
                _ = sleep_until(announce_at.unwrap_or_else(Instant::now)), if announce_at.is_some() => {
                    self.on_announce_timer().await;
                }
            }

            if self.current() == ViewerState::Closed {
                break;
            }
        }
    }

    fn current(&self) -> ViewerState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ViewerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(
                session = %self.session_id,
                viewer = %self.viewer_id,
                from = %previous,
                to = %state,
                "Viewer state change"
            );
        }
    }

    async fn publish(&self, envelope: SignalingEnvelope) {
        if let Err(e) = self.channel.publish(&self.session_id, &envelope).await {
            tracing::warn!(
                session = %self.session_id,
                viewer = %self.viewer_id,
                kind = %envelope.kind(),
                error = %e,
                "Failed to publish envelope"
            );
        }
    }

    async fn enter_waiting(&mut self) {
        self.set_state(ViewerState::Waiting);
        self.announcements = 0;
        self.announce().await;
    }

    async fn announce(&mut self) {
        self.announcements += 1;
        self.next_announce = Some(Instant::now() + self.config.announce_interval);
        tracing::debug!(
            session = %self.session_id,
            viewer = %self.viewer_id,
            epoch = self.epoch,
            attempt = self.announcements,
            "Announcing viewer"
        );
        let join = SignalingEnvelope::viewer_join(
            &self.session_id,
            &self.viewer_id,
            JoinPayload {
                instance: self.instance.clone(),
                epoch: self.epoch,
            },
        );
        self.publish(join).await;
    }

    async fn on_announce_timer(&mut self) {
        self.next_announce = None;
        if self.current() != ViewerState::Waiting {
            return;
        }
        if self.announcements >= self.config.max_announce_attempts {
            tracing::warn!(
                session = %self.session_id,
                viewer = %self.viewer_id,
                attempts = self.announcements,
                "No offer received, giving up"
            );
            self.set_state(ViewerState::Failed);
        } else {
            self.announce().await;
        }
    }

    async fn on_envelope(&mut self, envelope: SignalingEnvelope) {
        if !envelope.is_for(&self.viewer_id) {
            return;
        }

        match envelope.signal {
            Signal::Offer(payload) => self.on_offer(envelope.from_id, payload).await,
            Signal::IceCandidate(payload) => self.on_candidate(payload).await,
            Signal::SessionEnd => {
                if !self.trusts(&envelope.from_id) {
                    tracing::warn!(
                        session = %self.session_id,
                        viewer = %self.viewer_id,
                        from = %envelope.from_id,
                        "Ignoring session end from a non-broadcaster"
                    );
                    return;
                }
                tracing::info!(session = %self.session_id, viewer = %self.viewer_id, "Session ended by broadcaster");
                self.close(false).await;
            }
            Signal::ViewerJoin(_) | Signal::Answer(_) | Signal::ViewerLeave(_) => {}
        }
    }

    /// Whether `from_id` speaks for the broadcaster
    ///
    /// The one that sent the accepted offer wins over the configured one.
    /// With neither known, anyone but this viewer is trusted.
    fn trusts(&self, from_id: &str) -> bool {
        match self.broadcaster_id.as_ref().or(self.config.broadcaster_id.as_ref()) {
            Some(broadcaster_id) => broadcaster_id == from_id,
            None => from_id != self.viewer_id,
        }
    }

    async fn on_offer(&mut self, from_id: String, offer: DescriptionPayload) {
        if matches!(self.current(), ViewerState::Failed | ViewerState::Closed) {
            return;
        }
        if let Some(expected) = &self.config.broadcaster_id {
            if *expected != from_id {
                tracing::debug!(viewer = %self.viewer_id, from = %from_id, "Ignoring offer from unexpected sender");
                return;
            }
        }

        let disposition =
            classify_offer(&self.instance, self.last_revision, &offer.instance, offer.revision);
        if disposition != OfferDisposition::Accept {
            tracing::debug!(
                viewer = %self.viewer_id,
                revision = offer.revision,
                disposition = ?disposition,
                "Ignoring offer"
            );
            return;
        }

        tracing::debug!(
            session = %self.session_id,
            viewer = %self.viewer_id,
            revision = offer.revision,
            "Accepting offer"
        );

        self.discard_connection().await;
        self.broadcaster_id = Some(from_id);
        self.last_revision = offer.revision;
        self.negotiation.begin(offer.revision);
        self.next_announce = None;

        match self.answer(offer.description).await {
            Ok(answer) => {
                let envelope = self.to_broadcaster(Signal::Answer(DescriptionPayload {
                    description: answer,
                    instance: self.instance.clone(),
                    revision: self.last_revision,
                    epoch: Some(self.epoch),
                }));
                self.publish(envelope).await;
                self.set_state(ViewerState::Connecting);
            }
            Err(e) => self.on_transport_failure(e.to_string()).await,
        }
    }

    async fn answer(&mut self, offer: SessionDescription) -> Result<SessionDescription> {
        let remote_id = self.broadcaster_id.clone().unwrap_or_default();
        let sink = PeerEventSink::new(self.generation, self.events_tx.clone());
        let connection = self
            .connector
            .create(&self.viewer_id, &remote_id, PeerRole::Answerer, sink)
            .await?;
        self.connection = Some(Arc::clone(&connection));

        connection.set_remote_description(offer).await?;
        for candidate in self.negotiation.mark_remote_applied() {
            apply_candidate(&connection, candidate, &self.viewer_id).await;
        }
        connection.create_answer().await
    }

    async fn on_candidate(&mut self, payload: CandidatePayload) {
        if payload.instance != self.instance
            || matches!(self.current(), ViewerState::Failed | ViewerState::Closed)
        {
            return;
        }

        match self.negotiation.accept(payload.revision, payload.candidate.clone()) {
            CandidateAction::Apply => {
                if let Some(connection) = &self.connection {
                    apply_candidate(connection, payload.candidate, &self.viewer_id).await;
                }
            }
            CandidateAction::Dropped => {
                tracing::warn!(viewer = %self.viewer_id, "Candidate buffer full, dropping candidate");
            }
            action => {
                tracing::trace!(viewer = %self.viewer_id, action = ?action, "Candidate not applied");
            }
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let envelope = self.to_broadcaster(Signal::IceCandidate(CandidatePayload {
                    candidate,
                    instance: self.instance.clone(),
                    revision: self.last_revision,
                }));
                self.publish(envelope).await;
            }
            PeerEvent::Track(stream) => {
                if self.current() == ViewerState::Connecting {
                    self.failures = 0;
                    self.stream.send_replace(Some(stream));
                    self.set_state(ViewerState::Connected);
                    tracing::info!(
                        session = %self.session_id,
                        viewer = %self.viewer_id,
                        revision = self.last_revision,
                        "Viewer receiving stream"
                    );
                }
            }
            PeerEvent::Connected => {}
            PeerEvent::Failed(reason) => {
                if matches!(self.current(), ViewerState::Connecting | ViewerState::Connected) {
                    self.on_transport_failure(reason).await;
                }
            }
        }
    }

    async fn on_transport_failure(&mut self, reason: String) {
        self.failures += 1;
        self.discard_connection().await;
        self.stream.send_replace(None);

        if self.failures > self.config.max_transport_retries {
            tracing::warn!(
                session = %self.session_id,
                viewer = %self.viewer_id,
                reason = %reason,
                "Viewer connection failed"
            );
            self.next_announce = None;
            self.set_state(ViewerState::Failed);
        } else {
            self.epoch += 1;
            tracing::warn!(
                session = %self.session_id,
                viewer = %self.viewer_id,
                reason = %reason,
                epoch = self.epoch,
                "Viewer transport failure, announcing again"
            );
            self.enter_waiting().await;
        }
    }

    async fn restart(&mut self) {
        if self.current() != ViewerState::Failed {
            return;
        }
        self.failures = 0;
        self.epoch += 1;
        tracing::info!(session = %self.session_id, viewer = %self.viewer_id, "Viewer restarting");
        self.enter_waiting().await;
    }

    async fn discard_connection(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }
        // Events from the old connection are dropped from here on
        self.generation = self.generation.wrapping_add(1);
    }

    async fn close(&mut self, announce_leave: bool) {
        if self.current() == ViewerState::Closed {
            return;
        }
        self.next_announce = None;
        self.negotiation.reset();
        self.discard_connection().await;
        self.stream.send_replace(None);

        if announce_leave {
            let leave = SignalingEnvelope::new(
                self.session_id.clone(),
                self.viewer_id.clone(),
                self.broadcaster_id.clone(),
                Signal::ViewerLeave(LeavePayload {
                    instance: self.instance.clone(),
                }),
            );
            self.publish(leave).await;
        }

        self.set_state(ViewerState::Closed);
        tracing::info!(session = %self.session_id, viewer = %self.viewer_id, "Viewer closed");
    }

    fn to_broadcaster(&self, signal: Signal) -> SignalingEnvelope {
        SignalingEnvelope::new(
            self.session_id.clone(),
            self.viewer_id.clone(),
            self.broadcaster_id.clone(),
            signal,
        )
    }
}

async fn apply_candidate(connection: &Arc<dyn PeerConnection>, candidate: IceCandidate, viewer_id: &str) {
    if let Err(e) = connection.add_ice_candidate(candidate).await {
        tracing::warn!(viewer = viewer_id, error = %e, "Failed to apply candidate");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::signaling::MemoryRealtime;

    struct Setup {
        channel: SignalingChannel,
        host_side: Subscription,
        viewer: ViewerConnection,
    }

    async fn setup(config: ViewerConfig) -> Setup {
        let channel = SignalingChannel::new(Arc::new(MemoryRealtime::new()));
        let host_side = channel.subscribe("s1").await.unwrap();
        let viewer = ViewerConnection::connect(
            "s1",
            "v1",
            channel.clone(),
            Arc::new(crate::peer::loopback::LoopbackNetwork::new()),
            config,
        )
        .await
        .unwrap();
        Setup {
            channel,
            host_side,
            viewer,
        }
    }

    async fn next_join(sub: &mut Subscription) -> JoinPayload {
        loop {
            let env = sub.recv().await.unwrap();
            if let Signal::ViewerJoin(payload) = env.signal {
                return payload;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_announces_until_budget_exhausted() {
        let mut s = setup(ViewerConfig::default().max_announce_attempts(3)).await;

        for _ in 0..3 {
            let join = next_join(&mut s.host_side).await;
            assert_eq!(join.instance, s.viewer.instance());
            assert_eq!(join.epoch, 1);
        }

        tokio::time::timeout(
            Duration::from_secs(30),
            s.viewer.wait_for_state(ViewerState::Failed),
        )
        .await
        .unwrap()
        .unwrap();

        // Failed viewers stay quiet
        tokio::time::sleep(Duration::from_secs(10)).await;
        let mut extra = 0;
        while tokio::time::timeout(Duration::from_millis(1), s.host_side.recv())
            .await
            .is_ok()
        {
            extra += 1;
        }
        assert_eq!(extra, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_resets_budget() {
        let mut s = setup(ViewerConfig::default().max_announce_attempts(1)).await;
        next_join(&mut s.host_side).await;
        s.viewer.wait_for_state(ViewerState::Failed).await.unwrap();

        s.viewer.restart().unwrap();
        let join = next_join(&mut s.host_side).await;
        assert_eq!(join.epoch, 2);
        assert_eq!(s.viewer.state(), ViewerState::Waiting);
        assert!(matches!(s.viewer.restart(), Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_foreign_offer_ignored() {
        let s = setup(ViewerConfig::default()).await;
        let offer = SignalingEnvelope::targeted(
            "s1",
            "host",
            "v1",
            Signal::Offer(DescriptionPayload {
                description: SessionDescription::offer("v=0\r\na=x-loopback:nope\r\n"),
                instance: "someone-else".into(),
                revision: 1,
                epoch: None,
            }),
        );
        s.channel.publish("s1", &offer).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(s.viewer.state(), ViewerState::Waiting);
    }

    #[tokio::test]
    async fn test_close_publishes_leave_and_is_final() {
        let mut s = setup(ViewerConfig::default()).await;
        next_join(&mut s.host_side).await;

        s.viewer.close().await;
        assert_eq!(s.viewer.state(), ViewerState::Closed);
        assert!(s.viewer.stream().is_none());
        assert!(matches!(s.viewer.restart(), Err(Error::InvalidState(_))));

        loop {
            let env = s.host_side.recv().await.unwrap();
            if let Signal::ViewerLeave(payload) = env.signal {
                assert_eq!(payload.instance, s.viewer.instance());
                break;
            }
        }

        // Closing twice is harmless
        s.viewer.close().await;
        assert_eq!(s.viewer.state(), ViewerState::Closed);
    }

    #[tokio::test]
    async fn test_session_end_only_from_broadcaster() {
        let s = setup(ViewerConfig::default().broadcaster("host")).await;

        let spoofed = SignalingEnvelope::session_end("s1", "v2");
        s.channel.publish("s1", &spoofed).await.unwrap();
        let own = SignalingEnvelope::targeted("s1", "v1", "v1", Signal::SessionEnd);
        s.channel.publish("s1", &own).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(s.viewer.state(), ViewerState::Waiting);

        s.channel
            .publish("s1", &SignalingEnvelope::session_end("s1", "host"))
            .await
            .unwrap();
        tokio::time::timeout(
            Duration::from_secs(1),
            s.viewer.wait_for_state(ViewerState::Closed),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn test_own_session_end_is_ignored() {
        let s = setup(ViewerConfig::default()).await;
        let own = SignalingEnvelope::targeted("s1", "v1", "v1", Signal::SessionEnd);
        s.channel.publish("s1", &own).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(s.viewer.state(), ViewerState::Waiting);
    }

    #[tokio::test]
    async fn test_session_end_closes_viewer() {
        let s = setup(ViewerConfig::default()).await;
        s.channel
            .publish("s1", &SignalingEnvelope::session_end("s1", "host"))
            .await
            .unwrap();

        tokio::time::timeout(
            Duration::from_secs(1),
            s.viewer.wait_for_state(ViewerState::Closed),
        )
        .await
        .unwrap()
        .unwrap();
    }
}
