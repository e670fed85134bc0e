//! Broadcaster-side link registry
//!
//! One dispatcher task reads the session's signaling topic and routes each
//! envelope to the link task of the viewer it concerns. Every link owns its
//! connection, negotiation state and timers; the dispatcher never waits on
//! a negotiation, so a slow or failing viewer cannot hold up the others.
//!
//! ```text
//!   Subscription ──► dispatcher ──► LinkCommand ──► LinkTask(v1) ──► PeerConnection
//!                        │                     └──► LinkTask(v2) ──► PeerConnection
//!                        └── viewer-join from unknown viewer: spawn LinkTask
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::error::Result;
use crate::media::{MediaStream, MediaTrack};
use crate::signaling::{
    CandidatePayload, DescriptionPayload, IceCandidate, JoinPayload, LeavePayload,
    SessionDescription, Signal, SignalingChannel, SignalingEnvelope, Subscription,
};
use crate::stats::ManagerStats;

use super::config::ManagerConfig;
use super::connection::{PeerConnection, PeerConnector, PeerEvent, PeerEventSink, PeerRole};
use super::link::{LinkState, PeerLink};
use super::negotiation::{
    classify_answer, classify_join, AnswerDisposition, CandidateAction, JoinDisposition,
    Negotiation,
};

/// Departed instances remembered per viewer
const RETIRED_PER_VIEWER: usize = 4;

type Retired = Arc<Mutex<RetiredInstances>>;

/// Viewer instances that left or were replaced, oldest first
///
/// Joins from these are stale duplicates. Only the latest few instances of
/// each viewer are kept.
#[derive(Default)]
struct RetiredInstances {
    by_viewer: HashMap<String, VecDeque<String>>,
}

impl RetiredInstances {
    fn contains(&self, viewer_id: &str, instance: &str) -> bool {
        self.by_viewer
            .get(viewer_id)
            .is_some_and(|instances| instances.iter().any(|i| i == instance))
    }

    fn insert(&mut self, viewer_id: &str, instance: &str) {
        let instances = self.by_viewer.entry(viewer_id.to_string()).or_default();
        if instances.iter().any(|i| i == instance) {
            return;
        }
        instances.push_back(instance.to_string());
        while instances.len() > RETIRED_PER_VIEWER {
            instances.pop_front();
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.by_viewer.values().map(VecDeque::len).sum()
    }
}

enum LinkCommand {
    Join(JoinPayload),
    Answer(DescriptionPayload),
    Candidate(CandidatePayload),
    Close(oneshot::Sender<()>),
}

struct LinkEntry {
    commands: mpsc::UnboundedSender<LinkCommand>,
    snapshot: watch::Receiver<PeerLink>,
    task: JoinHandle<()>,
}

impl LinkEntry {
    fn state(&self) -> LinkState {
        self.snapshot.borrow().state
    }

    /// Close the link and wait for its task to release the connection
    async fn shutdown(self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(LinkCommand::Close(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        } else {
            self.task.abort();
        }
    }
}

struct Shared {
    session_id: String,
    broadcaster_id: String,
    channel: SignalingChannel,
    connector: Arc<dyn PeerConnector>,
    config: ManagerConfig,
    links: RwLock<HashMap<String, LinkEntry>>,
    tracks: watch::Sender<MediaStream>,
    retired: Retired,
}

impl Shared {
    fn is_retired(&self, viewer_id: &str, instance: &str) -> bool {
        self.retired.lock().contains(viewer_id, instance)
    }

    fn retire(&self, viewer_id: &str, instance: &str) {
        self.retired.lock().insert(viewer_id, instance);
    }

    async fn dispatch(&self, envelope: SignalingEnvelope) {
        if !envelope.is_for(&self.broadcaster_id) {
            return;
        }

        let viewer_id = envelope.from_id;
        match envelope.signal {
            Signal::ViewerJoin(payload) => self.on_join(&viewer_id, payload).await,
            Signal::Answer(payload) => self.route(&viewer_id, LinkCommand::Answer(payload)).await,
            Signal::IceCandidate(payload) => {
                self.route(&viewer_id, LinkCommand::Candidate(payload)).await
            }
            Signal::ViewerLeave(payload) => self.on_leave(&viewer_id, payload).await,
            Signal::Offer(_) | Signal::SessionEnd => {
                tracing::debug!(
                    session = %self.session_id,
                    from = %viewer_id,
                    "Ignoring broadcaster-bound envelope"
                );
            }
        }
    }

    async fn on_join(&self, viewer_id: &str, payload: JoinPayload) {
        if self.is_retired(viewer_id, &payload.instance) {
            tracing::debug!(
                session = %self.session_id,
                viewer = viewer_id,
                "Ignoring join from retired viewer instance"
            );
            return;
        }

        let mut links = self.links.write().await;
        let active = links.values().filter(|e| !e.state().is_terminal()).count();
        let at_capacity = self.config.max_viewers > 0 && active >= self.config.max_viewers;

        if let Some(entry) = links.get(viewer_id) {
            if entry.state() == LinkState::Failed && at_capacity {
                tracing::warn!(
                    session = %self.session_id,
                    viewer = viewer_id,
                    limit = self.config.max_viewers,
                    "Viewer limit reached, not reviving failed link"
                );
                return;
            }
            match entry.commands.send(LinkCommand::Join(payload)) {
                Ok(()) => return,
                Err(mpsc::error::SendError(LinkCommand::Join(payload))) => {
                    // Task is gone; start over with a fresh link
                    links.remove(viewer_id);
                    let entry = self.spawn_link(viewer_id, payload);
                    links.insert(viewer_id.to_string(), entry);
                    return;
                }
                Err(_) => return,
            }
        }

        if at_capacity {
            tracing::warn!(
                session = %self.session_id,
                viewer = viewer_id,
                limit = self.config.max_viewers,
                "Viewer limit reached, ignoring join"
            );
            return;
        }

        tracing::info!(session = %self.session_id, viewer = viewer_id, "Viewer joined");
        let entry = self.spawn_link(viewer_id, payload);
        links.insert(viewer_id.to_string(), entry);
    }

    async fn route(&self, viewer_id: &str, command: LinkCommand) {
        let links = self.links.read().await;
        match links.get(viewer_id) {
            Some(entry) => {
                let _ = entry.commands.send(command);
            }
            None => {
                tracing::debug!(
                    session = %self.session_id,
                    viewer = viewer_id,
                    "No link for envelope"
                );
            }
        }
    }

    async fn on_leave(&self, viewer_id: &str, payload: LeavePayload) {
        self.retire(viewer_id, &payload.instance);

        let entry = {
            let mut links = self.links.write().await;
            let serves_instance = links
                .get(viewer_id)
                .map(|e| e.snapshot.borrow().instance == payload.instance)
                .unwrap_or(false);
            if serves_instance {
                links.remove(viewer_id)
            } else {
                None
            }
        };

        if let Some(entry) = entry {
            tracing::info!(session = %self.session_id, viewer = viewer_id, "Viewer left");
            entry.shutdown().await;
        }
    }

    fn spawn_link(&self, viewer_id: &str, join: JoinPayload) -> LinkEntry {
        let link = PeerLink::new(&self.session_id, viewer_id, &join.instance, join.epoch);
        let (snapshot_tx, snapshot_rx) = watch::channel(link.clone());
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let task = LinkTask {
            session_id: self.session_id.clone(),
            broadcaster_id: self.broadcaster_id.clone(),
            viewer_id: viewer_id.to_string(),
            channel: self.channel.clone(),
            connector: Arc::clone(&self.connector),
            config: self.config.clone(),
            tracks: self.tracks.subscribe(),
            retired: Arc::clone(&self.retired),
            link,
            snapshot: snapshot_tx,
            negotiation: Negotiation::new(),
            connection: None,
            previous: None,
            sent_tracks: Vec::new(),
            current_offer: None,
            generation: 0,
            events_tx,
            deadline: None,
        };

        LinkEntry {
            commands: command_tx,
            snapshot: snapshot_rx,
            task: tokio::spawn(task.run(command_rx, events_rx)),
        }
    }
}

/// Registry of viewer links for one live session
pub struct PeerConnectionManager {
    shared: Arc<Shared>,
    dispatcher: JoinHandle<()>,
    ended: AtomicBool,
}

impl PeerConnectionManager {
    /// Start serving viewers of `session_id` with the tracks of `stream`
    ///
    /// The signaling subscription is in place when this returns, so no join
    /// published afterwards is missed.
    pub async fn start(
        session_id: &str,
        broadcaster_id: &str,
        channel: SignalingChannel,
        connector: Arc<dyn PeerConnector>,
        stream: MediaStream,
        config: ManagerConfig,
    ) -> Result<Self> {
        let subscription = channel.subscribe(session_id).await?;
        let (tracks, _) = watch::channel(stream);

        let shared = Arc::new(Shared {
            session_id: session_id.to_string(),
            broadcaster_id: broadcaster_id.to_string(),
            channel,
            connector,
            config,
            links: RwLock::new(HashMap::new()),
            tracks,
            retired: Arc::new(Mutex::new(RetiredInstances::default())),
        });

        tracing::info!(
            session = session_id,
            broadcaster = broadcaster_id,
            "Peer connection manager started"
        );

        let dispatcher = tokio::spawn(dispatch_loop(Arc::clone(&shared), subscription));
        Ok(Self {
            shared,
            dispatcher,
            ended: AtomicBool::new(false),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn broadcaster_id(&self) -> &str {
        &self.shared.broadcaster_id
    }

    /// Snapshot of one link
    pub async fn link(&self, viewer_id: &str) -> Option<PeerLink> {
        let links = self.shared.links.read().await;
        links.get(viewer_id).map(|e| e.snapshot.borrow().clone())
    }

    pub async fn link_state(&self, viewer_id: &str) -> Option<LinkState> {
        let links = self.shared.links.read().await;
        links.get(viewer_id).map(|e| e.state())
    }

    /// Snapshots of every registered link, tombstones included
    pub async fn links(&self) -> Vec<PeerLink> {
        let links = self.shared.links.read().await;
        links.values().map(|e| e.snapshot.borrow().clone()).collect()
    }

    /// Follow a link's snapshots as its task updates them
    pub async fn watch_link(&self, viewer_id: &str) -> Option<watch::Receiver<PeerLink>> {
        let links = self.shared.links.read().await;
        links.get(viewer_id).map(|e| e.snapshot.clone())
    }

    pub async fn viewer_ids(&self) -> Vec<String> {
        let links = self.shared.links.read().await;
        links.keys().cloned().collect()
    }

    /// Number of viewers with a connected link
    pub async fn viewer_count(&self) -> usize {
        let links = self.shared.links.read().await;
        links
            .values()
            .filter(|e| e.state() == LinkState::Connected)
            .count()
    }

    /// Aggregate link statistics
    pub async fn stats(&self) -> ManagerStats {
        let snapshots = self.links().await;
        ManagerStats::from_links(&snapshots)
    }

    /// Switch every link to the tracks of `stream`
    ///
    /// Compatible tracks are swapped in place on live links; anything else
    /// is renegotiated. Links negotiated later use the new tracks directly.
    pub fn replace_tracks(&self, stream: &MediaStream) {
        tracing::info!(
            session = %self.shared.session_id,
            stream = stream.id(),
            "Replacing outgoing tracks"
        );
        self.shared.tracks.send_replace(stream.clone());
    }

    /// Disconnect a viewer and ignore anything further from its instance
    ///
    /// Returns false if the viewer had no link.
    pub async fn remove_viewer(&self, viewer_id: &str) -> bool {
        let entry = self.shared.links.write().await.remove(viewer_id);
        match entry {
            Some(entry) => {
                let instance = entry.snapshot.borrow().instance.clone();
                self.shared.retire(viewer_id, &instance);
                tracing::info!(
                    session = %self.shared.session_id,
                    viewer = viewer_id,
                    "Removing viewer"
                );
                entry.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Announce the end of the session and tear down every link
    ///
    /// Links are closed even if the announcement cannot be delivered; the
    /// delivery error is returned afterwards.
    pub async fn end_session(&self) -> Result<()> {
        if self.ended.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let shared = &self.shared;
        let announced = shared
            .channel
            .publish(
                &shared.session_id,
                &SignalingEnvelope::session_end(&shared.session_id, &shared.broadcaster_id),
            )
            .await;
        if let Err(e) = &announced {
            tracing::warn!(session = %shared.session_id, error = %e, "Failed to announce session end");
        }

        self.dispatcher.abort();

        let entries: Vec<LinkEntry> = {
            let mut links = shared.links.write().await;
            links.drain().map(|(_, entry)| entry).collect()
        };
        let count = entries.len();
        for entry in entries {
            entry.shutdown().await;
        }

        tracing::info!(session = %shared.session_id, links = count, "Session ended");
        announced
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }
}

impl Drop for PeerConnectionManager {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

async fn dispatch_loop(shared: Arc<Shared>, mut subscription: Subscription) {
    while let Some(envelope) = subscription.recv().await {
        tracing::debug!(
            session = %shared.session_id,
            kind = %envelope.kind(),
            from = %envelope.from_id,
            "Dispatching envelope"
        );
        shared.dispatch(envelope).await;
    }
    tracing::warn!(session = %shared.session_id, "Signaling subscription closed");
}

/// Owner of one viewer link
struct LinkTask {
    session_id: String,
    broadcaster_id: String,
    viewer_id: String,
    channel: SignalingChannel,
    connector: Arc<dyn PeerConnector>,
    config: ManagerConfig,
    tracks: watch::Receiver<MediaStream>,
    retired: Retired,
    link: PeerLink,
    snapshot: watch::Sender<PeerLink>,
    negotiation: Negotiation,
    connection: Option<Arc<dyn PeerConnection>>,
    /// Connection still serving the viewer while a renegotiation is pending
    previous: Option<Arc<dyn PeerConnection>>,
    sent_tracks: Vec<MediaTrack>,
    current_offer: Option<SessionDescription>,
    generation: u32,
    events_tx: mpsc::UnboundedSender<(u32, PeerEvent)>,
    deadline: Option<Instant>,
}

impl LinkTask {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<LinkCommand>,
        mut events: mpsc::UnboundedReceiver<(u32, PeerEvent)>,
    ) {
        self.start_negotiation().await;
        let mut tracks_open = true;

        loop {
            let deadline = self.deadline;
            tokio::select! {
                biased;
                Some((generation, event)) = events.recv() => {
                    if generation == self.generation {
                        self.on_peer_event(event).await;
                    }
                }
                command = commands.recv() => match command {
                    Some(LinkCommand::Join(payload)) => self.on_join(payload).await,
                    Some(LinkCommand::Answer(payload)) => self.on_answer(payload).await,
                    Some(LinkCommand::Candidate(payload)) => self.on_candidate(payload).await,
                    Some(LinkCommand::Close(ack)) => {
                        self.close().await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.close().await;
                        break;
                    }
                },
                changed = self.tracks.changed(), if tracks_open => {
                    if changed.is_ok() {
                        self.on_tracks_changed().await;
                    } else {
                        tracks_open = false;
                    }
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_timeout().await;
                }
            }
            self.publish_snapshot();
        }
    }

    fn publish_snapshot(&self) {
        self.snapshot.send_replace(self.link.clone());
    }

    fn set_state(&mut self, state: LinkState) {
        if self.link.state != state {
            tracing::debug!(
                session = %self.session_id,
                viewer = %self.viewer_id,
                revision = self.link.revision,
                from = %self.link.state,
                to = %state,
                "Link state change"
            );
            self.link.state = state;
            self.publish_snapshot();
        }
    }

    async fn start_negotiation(&mut self) {
        if let Err(e) = self.negotiate().await {
            self.recover(e.to_string()).await;
        }
    }

    /// Offer on a fresh connection while the current one keeps serving
    ///
    /// The old connection is closed once the new one connects, so the viewer
    /// tears it down itself and never sees it fail.
    async fn renegotiate(&mut self) {
        if self.link.state == LinkState::Connected {
            self.retire_previous().await;
            self.previous = self.connection.take();
        }
        self.start_negotiation().await;
    }

    async fn retire_previous(&mut self) {
        if let Some(previous) = self.previous.take() {
            previous.close().await;
        }
    }

    /// Replace the connection and send a fresh offer
    async fn negotiate(&mut self) -> Result<()> {
        self.discard_connection().await;
        self.generation = self.generation.wrapping_add(1);
        self.link.revision += 1;
        self.negotiation.begin(self.link.revision);

        let stream = self.tracks.borrow_and_update().clone();
        let sink = PeerEventSink::new(self.generation, self.events_tx.clone());
        let connection = self
            .connector
            .create(&self.broadcaster_id, &self.viewer_id, PeerRole::Offerer, sink)
            .await?;
        self.connection = Some(Arc::clone(&connection));

        for track in stream.tracks() {
            connection.add_track(track.clone()).await?;
        }
        self.sent_tracks = stream.tracks().to_vec();

        let offer = connection.create_offer().await?;
        self.current_offer = Some(offer.clone());
        self.link.stats.offers_sent += 1;
        self.deadline = Some(Instant::now() + self.config.negotiation_timeout);
        self.set_state(LinkState::OfferSent);

        tracing::debug!(
            session = %self.session_id,
            viewer = %self.viewer_id,
            revision = self.link.revision,
            "Sending offer"
        );
        self.send_offer(offer).await;
        Ok(())
    }

    async fn send_offer(&self, description: SessionDescription) {
        let envelope = SignalingEnvelope::targeted(
            &self.session_id,
            &self.broadcaster_id,
            &self.viewer_id,
            Signal::Offer(DescriptionPayload {
                description,
                instance: self.link.instance.clone(),
                revision: self.link.revision,
                epoch: None,
            }),
        );
        // A lost offer is recovered by the viewer re-announcing or by the
        // negotiation timeout
        if let Err(e) = self.channel.publish(&self.session_id, &envelope).await {
            tracing::warn!(
                session = %self.session_id,
                viewer = %self.viewer_id,
                error = %e,
                "Failed to publish offer"
            );
        }
    }

    /// Count a transport failure and retry while budget remains
    async fn recover(&mut self, mut reason: String) {
        loop {
            self.link.consecutive_failures += 1;
            self.link.stats.transport_failures += 1;

            if self.link.consecutive_failures > self.config.max_transport_retries {
                self.fail(&reason).await;
                return;
            }

            tracing::warn!(
                session = %self.session_id,
                viewer = %self.viewer_id,
                attempt = self.link.consecutive_failures,
                reason = %reason,
                "Link transport failure, retrying with a fresh offer"
            );
            match self.negotiate().await {
                Ok(()) => return,
                Err(e) => reason = e.to_string(),
            }
        }
    }

    async fn fail(&mut self, reason: &str) {
        self.discard_connection().await;
        self.retire_previous().await;
        self.set_state(LinkState::Failed);
        tracing::warn!(
            session = %self.session_id,
            viewer = %self.viewer_id,
            reason = reason,
            "Link failed"
        );
    }

    async fn discard_connection(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }
        self.current_offer = None;
        self.sent_tracks.clear();
        self.deadline = None;
        self.negotiation.reset();
    }

    async fn close(&mut self) {
        self.discard_connection().await;
        self.retire_previous().await;
        self.set_state(LinkState::Closed);
    }

    async fn on_join(&mut self, join: JoinPayload) {
        match classify_join(&self.link.instance, self.link.epoch, &join.instance, join.epoch) {
            JoinDisposition::Supersede => {
                if join.instance != self.link.instance {
                    self.retired.lock().insert(&self.viewer_id, &self.link.instance);
                    self.link.instance = join.instance;
                    self.link.consecutive_failures = 0;
                }
                self.link.epoch = join.epoch;

                if self.link.state == LinkState::Failed {
                    self.link.consecutive_failures = 0;
                    tracing::info!(
                        session = %self.session_id,
                        viewer = %self.viewer_id,
                        "Viewer rejoined after link failure"
                    );
                } else {
                    self.link.stats.renegotiations += 1;
                    tracing::info!(
                        session = %self.session_id,
                        viewer = %self.viewer_id,
                        epoch = self.link.epoch,
                        "Viewer restarted, renegotiating"
                    );
                }
                self.renegotiate().await;
            }
            JoinDisposition::Duplicate => {
                if self.link.state == LinkState::OfferSent && !self.negotiation.is_remote_applied() {
                    if let Some(offer) = self.current_offer.clone() {
                        tracing::debug!(
                            session = %self.session_id,
                            viewer = %self.viewer_id,
                            revision = self.link.revision,
                            "Re-sending offer"
                        );
                        self.send_offer(offer).await;
                    }
                }
            }
        }
    }

    async fn on_answer(&mut self, answer: DescriptionPayload) {
        if self.link.state != LinkState::OfferSent {
            tracing::debug!(
                session = %self.session_id,
                viewer = %self.viewer_id,
                state = %self.link.state,
                "Ignoring answer outside negotiation"
            );
            return;
        }

        let disposition = classify_answer(
            &self.link.instance,
            self.link.revision,
            self.negotiation.is_remote_applied(),
            &answer.instance,
            answer.revision,
        );
        if disposition != AnswerDisposition::Apply {
            tracing::debug!(
                session = %self.session_id,
                viewer = %self.viewer_id,
                revision = answer.revision,
                disposition = ?disposition,
                "Ignoring answer"
            );
            return;
        }

        let connection = match &self.connection {
            Some(c) => Arc::clone(c),
            None => return,
        };
        if let Err(e) = connection.set_remote_description(answer.description).await {
            self.recover(e.to_string()).await;
            return;
        }

        if let Some(epoch) = answer.epoch {
            self.link.epoch = self.link.epoch.max(epoch);
        }
        self.link.stats.answers_applied += 1;
        tracing::debug!(
            session = %self.session_id,
            viewer = %self.viewer_id,
            revision = self.link.revision,
            "Answer applied"
        );

        for candidate in self.negotiation.mark_remote_applied() {
            self.apply_candidate(&connection, candidate).await;
        }
    }

    async fn on_candidate(&mut self, payload: CandidatePayload) {
        if payload.instance != self.link.instance || self.link.state.is_terminal() {
            return;
        }

        match self.negotiation.accept(payload.revision, payload.candidate.clone()) {
            CandidateAction::Apply => {
                if let Some(connection) = self.connection.clone() {
                    self.apply_candidate(&connection, payload.candidate).await;
                }
            }
            CandidateAction::Dropped => {
                tracing::warn!(
                    session = %self.session_id,
                    viewer = %self.viewer_id,
                    "Candidate buffer full, dropping candidate"
                );
            }
            action => {
                tracing::trace!(viewer = %self.viewer_id, action = ?action, "Candidate not applied");
            }
        }
    }

    async fn apply_candidate(&mut self, connection: &Arc<dyn PeerConnection>, candidate: IceCandidate) {
        match connection.add_ice_candidate(candidate).await {
            Ok(()) => self.link.stats.candidates_applied += 1,
            Err(e) => {
                tracing::warn!(
                    session = %self.session_id,
                    viewer = %self.viewer_id,
                    error = %e,
                    "Failed to apply candidate"
                );
            }
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let envelope = SignalingEnvelope::targeted(
                    &self.session_id,
                    &self.broadcaster_id,
                    &self.viewer_id,
                    Signal::IceCandidate(CandidatePayload {
                        candidate,
                        instance: self.link.instance.clone(),
                        revision: self.link.revision,
                    }),
                );
                match self.channel.publish(&self.session_id, &envelope).await {
                    Ok(()) => self.link.stats.candidates_sent += 1,
                    Err(e) => {
                        tracing::warn!(viewer = %self.viewer_id, error = %e, "Failed to publish candidate");
                    }
                }
            }
            PeerEvent::Connected => {
                if self.link.state == LinkState::OfferSent {
                    self.deadline = None;
                    self.link.consecutive_failures = 0;
                    self.link.stats.connected_at = Some(std::time::Instant::now());
                    self.set_state(LinkState::Connected);
                    self.retire_previous().await;
                    tracing::info!(
                        session = %self.session_id,
                        viewer = %self.viewer_id,
                        revision = self.link.revision,
                        "Viewer connected"
                    );
                }
            }
            PeerEvent::Failed(reason) => {
                if matches!(self.link.state, LinkState::OfferSent | LinkState::Connected) {
                    self.recover(reason).await;
                }
            }
            PeerEvent::Track(_) => {}
        }
    }

    async fn on_timeout(&mut self) {
        self.deadline = None;
        if self.link.state == LinkState::OfferSent {
            self.recover("negotiation timed out".to_string()).await;
        }
    }

    async fn on_tracks_changed(&mut self) {
        let stream = self.tracks.borrow_and_update().clone();
        let connection = match &self.connection {
            Some(c) if !self.link.state.is_terminal() => Arc::clone(c),
            _ => return,
        };

        let compatible = stream.tracks().len() == self.sent_tracks.len()
            && stream
                .tracks()
                .iter()
                .all(|t| self.sent_tracks.iter().any(|s| s.is_compatible(t)));

        if compatible {
            let mut swapped = true;
            for track in stream.tracks() {
                if let Err(e) = connection.replace_track(track.clone()).await {
                    tracing::warn!(viewer = %self.viewer_id, error = %e, "Track swap failed");
                    swapped = false;
                    break;
                }
            }
            if swapped {
                self.sent_tracks = stream.tracks().to_vec();
                tracing::debug!(viewer = %self.viewer_id, "Tracks swapped in place");
                return;
            }
        }

        self.link.stats.renegotiations += 1;
        tracing::info!(
            session = %self.session_id,
            viewer = %self.viewer_id,
            "Outgoing tracks changed shape, renegotiating"
        );
        self.renegotiate().await;
    }
}
