use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use prox_proto::{decode_server_frame, ClientFrame, IceCandidate, ServerFrame, Signal, SignalFrame};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::call::{Call, CallRole, CallState, CandidateOutcome};
use crate::connectivity::ConnectedPeers;
use crate::error::CallError;
use crate::identity::IdentityProvider;
use crate::media::{MediaEngineFactory, MediaError, MediaEvent, MediaEventSink, MediaNotice, SdpKind};

/// What the controller reports to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    RosterChanged(Vec<String>),
    IncomingCall { peer: String },
    StateChanged { peer: String, state: CallState },
    PeerConnected { peer: String },
    PeerDisconnected { peer: String },
    Failed { peer: String, reason: String },
    Closed { peer: String },
}

/// Sessions we have seen JOIN for one identity. `complete` is false when
/// the identity came from a PEERS roster, which does not list sessions.
#[derive(Debug, Default)]
struct KnownSessions {
    ids: HashSet<String>,
    complete: bool,
}

/// What a LEAVE tells us about the identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Departure {
    /// No session of the identity is left.
    Gone,
    /// Other sessions we know of are still present.
    Remaining,
    /// The identity may have sessions we were never told about.
    Unconfirmed,
}

#[derive(Debug, Default)]
struct Roster {
    peers: BTreeSet<String>,
    sessions: HashMap<String, KnownSessions>,
    // Identities to drop if the next PEERS no longer lists them.
    unconfirmed: HashSet<String>,
}

impl Roster {
    /// Install a fresh roster. Returns the unconfirmed departures it
    /// confirmed.
    fn replace(&mut self, peers: Vec<String>) -> Vec<String> {
        self.peers = peers.into_iter().collect();
        self.sessions.retain(|peer, _| self.peers.contains(peer));
        let mut departed: Vec<String> = self
            .unconfirmed
            .drain()
            .filter(|peer| !self.peers.contains(peer))
            .collect();
        departed.sort();
        departed
    }

    fn joined(&mut self, peer: &str, session_id: Option<String>) -> bool {
        let added = self.peers.insert(peer.to_string());
        let known = self
            .sessions
            .entry(peer.to_string())
            .or_insert_with(|| KnownSessions {
                ids: HashSet::new(),
                complete: added,
            });
        if let Some(session_id) = session_id {
            known.ids.insert(session_id);
        }
        added
    }

    fn left(&mut self, peer: &str, session_id: Option<&str>) -> Departure {
        if !self.peers.contains(peer) {
            return Departure::Gone;
        }
        let Some(session_id) = session_id else {
            self.forget(peer);
            return Departure::Gone;
        };
        let Some(known) = self.sessions.get_mut(peer) else {
            self.unconfirmed.insert(peer.to_string());
            return Departure::Unconfirmed;
        };
        known.ids.remove(session_id);
        if !known.ids.is_empty() {
            Departure::Remaining
        } else if known.complete {
            self.forget(peer);
            Departure::Gone
        } else {
            self.unconfirmed.insert(peer.to_string());
            Departure::Unconfirmed
        }
    }

    fn forget(&mut self, peer: &str) {
        self.sessions.remove(peer);
        self.unconfirmed.remove(peer);
        self.peers.remove(peer);
    }

    fn snapshot(&self) -> Vec<String> {
        self.peers.iter().cloned().collect()
    }

    fn clear(&mut self) -> bool {
        self.sessions.clear();
        self.unconfirmed.clear();
        let had_peers = !self.peers.is_empty();
        self.peers.clear();
        had_peers
    }
}

/// Owns every call this device is part of.
///
/// Frames from the signaling server go in through
/// [`CallController::handle_server_frame`]; frames for the server come out of
/// the outbound channel given to [`CallController::new`]. Offer and answer
/// processing runs on spawned tasks so candidates keep flowing while the
/// media engine works.
pub struct CallController {
    identity: Arc<dyn IdentityProvider>,
    factory: Arc<dyn MediaEngineFactory>,
    outbound: mpsc::UnboundedSender<ClientFrame>,
    events: mpsc::UnboundedSender<CallEvent>,
    media_tx: mpsc::UnboundedSender<MediaNotice>,
    calls: Mutex<HashMap<String, Arc<Call>>>,
    connected: Mutex<ConnectedPeers>,
    roster: Mutex<Roster>,
    session_id: Mutex<Option<String>>,
    socket_connected: AtomicBool,
    next_call_id: AtomicU64,
    media_pump: Mutex<Option<JoinHandle<()>>>,
}

impl CallController {
    /// Must be called from within a Tokio runtime.
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        factory: Arc<dyn MediaEngineFactory>,
        outbound: mpsc::UnboundedSender<ClientFrame>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<CallEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (media_tx, mut media_rx) = mpsc::unbounded_channel::<MediaNotice>();

        let controller = Arc::new(Self {
            identity,
            factory,
            outbound,
            events,
            media_tx,
            calls: Mutex::new(HashMap::new()),
            connected: Mutex::new(ConnectedPeers::default()),
            roster: Mutex::new(Roster::default()),
            session_id: Mutex::new(None),
            socket_connected: AtomicBool::new(false),
            next_call_id: AtomicU64::new(0),
            media_pump: Mutex::new(None),
        });

        let weak = Arc::downgrade(&controller);
        let pump = tokio::spawn(async move {
            while let Some(notice) = media_rx.recv().await {
                let Some(controller) = weak.upgrade() else {
                    break;
                };
                controller.handle_media_event(notice);
            }
        });
        *controller.media_pump.lock() = Some(pump);

        (controller, events_rx)
    }

    pub fn identity(&self) -> &str {
        self.identity.public_key()
    }

    /// Our session token, once the server has told us.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    pub fn is_socket_connected(&self) -> bool {
        self.socket_connected.load(Ordering::SeqCst)
    }

    pub fn roster(&self) -> Vec<String> {
        self.roster.lock().snapshot()
    }

    pub fn connected_peers(&self) -> Vec<String> {
        self.connected.lock().snapshot()
    }

    pub fn is_peer_connected(&self, peer: &str) -> bool {
        self.connected.lock().contains(peer)
    }

    /// The device of `peer` the current call is pinned to, if any.
    pub fn remote_session(&self, peer: &str) -> Option<String> {
        self.current_call(peer).and_then(|call| call.remote_session())
    }

    pub fn call_state(&self, peer: &str) -> Option<CallState> {
        self.current_call(peer).map(|call| call.state())
    }

    pub fn active_calls(&self) -> Vec<String> {
        let mut peers: Vec<_> = self.calls.lock().keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn join(&self) -> Result<(), CallError> {
        self.send(ClientFrame::Join {
            public_key: self.identity().to_string(),
        })
    }

    pub fn request_roster(&self) -> Result<(), CallError> {
        self.send(ClientFrame::List)
    }

    pub fn leave(&self) -> Result<(), CallError> {
        self.send(ClientFrame::Leave {
            public_key: self.identity().to_string(),
        })
    }

    /// Sign the peer's key and tell the server we trust it.
    pub fn declare_trust(&self, peer: &str) -> Result<(), CallError> {
        let signature = self.identity.sign(peer.as_bytes())?;
        self.send(ClientFrame::Trust {
            to: peer.to_string(),
            signature,
        })
    }

    pub fn on_transport_opened(&self) {
        self.socket_connected.store(true, Ordering::SeqCst);
    }

    /// The signaling socket is gone: every call ends and presence is unknown.
    pub async fn on_transport_closed(&self) {
        self.socket_connected.store(false, Ordering::SeqCst);
        *self.session_id.lock() = None;

        let calls: Vec<_> = self.calls.lock().values().cloned().collect();
        for call in calls {
            self.close_call(&call).await;
        }
        for peer in self.connected.lock().drain() {
            self.emit(CallEvent::PeerDisconnected { peer });
        }
        if self.roster.lock().clear() {
            self.emit(CallEvent::RosterChanged(Vec::new()));
        }
    }

    /// Place a call. Returns once the offer has been handed to the
    /// signaling channel.
    pub async fn start_call(&self, peer: &str) -> Result<(), CallError> {
        if peer == self.identity() {
            return Err(CallError::SelfCall);
        }
        let call = self.open_call(peer, CallRole::Caller, CallState::Offering, None)?;
        info!(target: "prox_call", peer = %peer, call_id = call.id(), "starting call");
        self.emit_state(&call);

        let sdp = match call.engine().create_offer().await {
            Ok(sdp) => sdp,
            Err(err) => {
                self.fail(&call, &err).await;
                return Err(err.into());
            }
        };
        if !self.is_current(&call) {
            debug!(target: "prox_call", peer = %peer, "call ended while offer was produced; discarding");
            return Err(CallError::Cancelled(peer.to_string()));
        }
        call.advance(CallState::Offering, CallState::AwaitingAnswer)
            .map_err(|_| CallError::Cancelled(peer.to_string()))?;
        self.emit_state(&call);

        if let Err(err) = self.send_signal(&call, Signal::Offer { sdp }) {
            self.close_call(&call).await;
            return Err(err);
        }
        self.release_local_candidates(&call);
        Ok(())
    }

    /// End the call with `peer`. Returns false if there was none.
    pub async fn hangup(&self, peer: &str) -> bool {
        match self.current_call(peer) {
            Some(call) => {
                info!(target: "prox_call", peer = %peer, "hanging up");
                self.close_call(&call).await
            }
            None => false,
        }
    }

    /// Push-to-talk. Leaves the call state untouched.
    pub fn set_local_audio(&self, peer: &str, enabled: bool) -> Result<(), CallError> {
        let call = self
            .current_call(peer)
            .ok_or_else(|| CallError::NoCall(peer.to_string()))?;
        call.set_local_audio(enabled);
        debug!(target: "prox_call", peer = %peer, enabled, "local audio toggled");
        Ok(())
    }

    /// Decode and dispatch one text frame from the server. Malformed frames
    /// are logged and dropped.
    pub async fn handle_text(self: &Arc<Self>, text: &str) {
        match decode_server_frame(text) {
            Ok(frame) => {
                if let Err(err) = self.handle_server_frame(frame).await {
                    debug!(target: "prox_call", error = %err, "server frame rejected");
                }
            }
            Err(err) => warn!(target: "prox_call", error = %err, "dropping malformed server frame"),
        }
    }

    pub async fn handle_server_frame(self: &Arc<Self>, frame: ServerFrame) -> Result<(), CallError> {
        match frame {
            ServerFrame::Peers { peers, session_id } => {
                if session_id.is_some() {
                    *self.session_id.lock() = session_id;
                }
                let me = self.identity().to_string();
                let (snapshot, departed) = {
                    let mut roster = self.roster.lock();
                    let departed =
                        roster.replace(peers.into_iter().filter(|peer| *peer != me).collect());
                    (roster.snapshot(), departed)
                };
                debug!(target: "prox_call", peers = snapshot.len(), "roster received");
                self.emit(CallEvent::RosterChanged(snapshot));
                for peer in departed {
                    if let Some(call) = self.current_call(&peer) {
                        info!(target: "prox_call", peer = %peer, "peer confirmed gone; closing call");
                        self.close_call(&call).await;
                    }
                }
                Ok(())
            }
            ServerFrame::Join {
                public_key,
                session_id,
            } => {
                if public_key == self.identity() {
                    return Ok(());
                }
                let added = self.roster.lock().joined(&public_key, session_id);
                if added {
                    debug!(target: "prox_call", peer = %public_key, "peer joined");
                    self.emit(CallEvent::RosterChanged(self.roster()));
                }
                Ok(())
            }
            ServerFrame::Leave {
                public_key,
                session_id,
            } => {
                self.peer_left(&public_key, session_id.as_deref()).await;
                Ok(())
            }
            ServerFrame::Trust { to, .. } => {
                debug!(target: "prox_call", to = %to, "trust declaration relayed");
                Ok(())
            }
            ServerFrame::Signal(frame) => self.handle_signal(frame).await,
        }
    }

    async fn handle_signal(self: &Arc<Self>, frame: SignalFrame) -> Result<(), CallError> {
        let SignalFrame {
            from,
            from_session_id,
            signal,
            ..
        } = frame;
        match signal {
            Signal::Offer { sdp } => {
                let call = self.admit_offer(&from, from_session_id)?;
                let controller = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(err) = controller.answer(call, sdp).await {
                        debug!(target: "prox_call", peer = %from, error = %err, "incoming call not answered");
                    }
                });
                Ok(())
            }
            Signal::Answer { sdp } => {
                let call = self.admit_answer(&from, from_session_id)?;
                let controller = Arc::clone(self);
                tokio::spawn(async move {
                    controller.complete_answer(call, sdp).await;
                });
                Ok(())
            }
            Signal::Candidate(candidate) => {
                self.accept_candidate(&from, from_session_id, candidate).await
            }
        }
    }

    fn admit_offer(&self, from: &str, from_session: Option<String>) -> Result<Arc<Call>, CallError> {
        let call = self.open_call(from, CallRole::Callee, CallState::Answering, from_session)?;
        info!(target: "prox_call", peer = %from, call_id = call.id(), "incoming call");
        self.emit(CallEvent::IncomingCall {
            peer: from.to_string(),
        });
        self.emit_state(&call);
        Ok(call)
    }

    async fn answer(&self, call: Arc<Call>, offer: String) -> Result<(), CallError> {
        if let Err(err) = call.apply_remote_description(SdpKind::Offer, &offer).await {
            self.fail(&call, &err).await;
            return Err(err.into());
        }
        let sdp = match call.engine().create_answer().await {
            Ok(sdp) => sdp,
            Err(err) => {
                self.fail(&call, &err).await;
                return Err(err.into());
            }
        };
        if !self.is_current(&call) {
            debug!(target: "prox_call", peer = %call.peer(), "call ended while answer was produced; discarding");
            return Err(CallError::Cancelled(call.peer().to_string()));
        }
        if let Err(err) = self.send_signal(&call, Signal::Answer { sdp }) {
            self.close_call(&call).await;
            return Err(err);
        }
        self.release_local_candidates(&call);
        if call.advance(CallState::Answering, CallState::Connected).is_ok() {
            self.emit_state(&call);
        }
        Ok(())
    }

    fn admit_answer(&self, from: &str, from_session: Option<String>) -> Result<Arc<Call>, CallError> {
        let call = self.current_call(from).ok_or_else(|| CallError::UnexpectedSignal {
            peer: from.to_string(),
            signal: "answer",
            state: CallState::Idle,
        })?;
        call.advance(CallState::AwaitingAnswer, CallState::Connected)
            .map_err(|state| CallError::UnexpectedSignal {
                peer: from.to_string(),
                signal: "answer",
                state,
            })?;
        call.pin_remote_session(from_session);
        Ok(call)
    }

    async fn complete_answer(&self, call: Arc<Call>, answer: String) {
        match call.apply_remote_description(SdpKind::Answer, &answer).await {
            Ok(_) => {
                info!(target: "prox_call", peer = %call.peer(), "call answered");
                self.emit_state(&call);
            }
            Err(err) => self.fail(&call, &err).await,
        }
    }

    async fn accept_candidate(
        &self,
        from: &str,
        from_session: Option<String>,
        candidate: IceCandidate,
    ) -> Result<(), CallError> {
        let call = self
            .current_call(from)
            .ok_or_else(|| CallError::NoCall(from.to_string()))?;
        match call.accept_remote_candidate(candidate, from_session).await {
            CandidateOutcome::Applied => trace!(target: "prox_call", peer = %from, "candidate applied"),
            CandidateOutcome::OtherSession => {
                debug!(target: "prox_call", peer = %from, "dropping candidate from an unpinned device")
            }
            CandidateOutcome::Buffered | CandidateOutcome::Rejected => {}
        }
        Ok(())
    }

    async fn peer_left(&self, peer: &str, session_id: Option<&str>) {
        let (was_listed, departure) = {
            let mut roster = self.roster.lock();
            (roster.peers.contains(peer), roster.left(peer, session_id))
        };
        match departure {
            Departure::Gone if was_listed => {
                debug!(target: "prox_call", peer = %peer, "peer left");
                self.emit(CallEvent::RosterChanged(self.roster()));
            }
            Departure::Unconfirmed => {
                debug!(target: "prox_call", peer = %peer, "device left; refreshing roster");
                if let Err(err) = self.request_roster() {
                    debug!(target: "prox_call", error = %err, "roster refresh not sent");
                }
            }
            Departure::Gone | Departure::Remaining => {}
        }

        let Some(call) = self.current_call(peer) else {
            return;
        };
        let departed = match (call.remote_session(), session_id) {
            (Some(remote), Some(left)) => remote == left,
            (Some(_), None) => true,
            (None, _) => departure == Departure::Gone,
        };
        if departed {
            info!(target: "prox_call", peer = %peer, "peer departed; closing call");
            self.close_call(&call).await;
        }
    }

    pub(crate) fn handle_media_event(&self, notice: MediaNotice) {
        let MediaNotice {
            peer,
            call_id,
            event,
        } = notice;
        let Some(call) = self.current_call(&peer).filter(|call| call.id() == call_id) else {
            trace!(target: "prox_call", peer = %peer, call_id, "media event for a finished call");
            return;
        };
        match event {
            MediaEvent::CandidateGenerated(candidate) => {
                let mut local = call.local_candidates().lock();
                if let Some(candidate) = local.admit(candidate) {
                    if let Err(err) = self.send_signal(&call, Signal::Candidate(candidate)) {
                        debug!(target: "prox_call", peer = %peer, error = %err, "local candidate not sent");
                    }
                }
            }
            MediaEvent::Connectivity(state) => {
                let change = self.connected.lock().reconcile(&peer, state);
                debug!(target: "prox_call", peer = %peer, state = ?state, "connectivity changed");
                match change {
                    Some(true) => self.emit(CallEvent::PeerConnected { peer }),
                    Some(false) => self.emit(CallEvent::PeerDisconnected { peer }),
                    None => {}
                }
            }
        }
    }

    fn open_call(
        &self,
        peer: &str,
        role: CallRole,
        state: CallState,
        remote_session: Option<String>,
    ) -> Result<Arc<Call>, CallError> {
        let mut calls = self.calls.lock();
        if calls.get(peer).is_some_and(|call| !call.is_closed()) {
            return Err(CallError::AlreadyActive(peer.to_string()));
        }
        let id = self.next_call_id.fetch_add(1, Ordering::SeqCst) + 1;
        let sink = MediaEventSink::new(peer, id, self.media_tx.clone());
        let engine = self.factory.create(peer, sink)?;
        let call = Arc::new(Call::new(id, peer, role, engine, remote_session));
        call.advance(CallState::Idle, state)
            .map_err(|_| CallError::Cancelled(peer.to_string()))?;
        calls.insert(peer.to_string(), Arc::clone(&call));
        Ok(call)
    }

    async fn fail(&self, call: &Arc<Call>, err: &MediaError) {
        if !self.is_current(call) {
            return;
        }
        warn!(target: "prox_call", peer = %call.peer(), error = %err, "media engine failed; closing call");
        self.emit(CallEvent::Failed {
            peer: call.peer().to_string(),
            reason: err.to_string(),
        });
        self.close_call(call).await;
    }

    /// Remove `call` if it is still the current one and close its engine.
    async fn close_call(&self, call: &Arc<Call>) -> bool {
        {
            let mut calls = self.calls.lock();
            if calls
                .get(call.peer())
                .is_some_and(|current| Arc::ptr_eq(current, call))
            {
                calls.remove(call.peer());
            }
        }
        if !call.close().await {
            return false;
        }
        let peer = call.peer().to_string();
        if self.connected.lock().remove(&peer) {
            self.emit(CallEvent::PeerDisconnected { peer: peer.clone() });
        }
        debug!(target: "prox_call", peer = %peer, call_id = call.id(), "call closed");
        self.emit(CallEvent::Closed { peer });
        true
    }

    fn release_local_candidates(&self, call: &Call) {
        let mut local = call.local_candidates().lock();
        for candidate in local.release() {
            if let Err(err) = self.send_signal(call, Signal::Candidate(candidate)) {
                debug!(target: "prox_call", peer = %call.peer(), error = %err, "held candidate not sent");
            }
        }
    }

    fn current_call(&self, peer: &str) -> Option<Arc<Call>> {
        self.calls.lock().get(peer).cloned()
    }

    fn is_current(&self, call: &Arc<Call>) -> bool {
        !call.is_closed()
            && self
                .calls
                .lock()
                .get(call.peer())
                .is_some_and(|current| Arc::ptr_eq(current, call))
    }

    fn send_signal(&self, call: &Call, signal: Signal) -> Result<(), CallError> {
        let frame = SignalFrame::new(self.identity(), call.peer(), signal)
            .with_to_session(call.remote_session())
            .with_from_session(self.session_id());
        self.send(ClientFrame::Signal(frame))
    }

    fn send(&self, frame: ClientFrame) -> Result<(), CallError> {
        self.outbound
            .send(frame)
            .map_err(|_| CallError::ChannelClosed)
    }

    fn emit_state(&self, call: &Call) {
        self.emit(CallEvent::StateChanged {
            peer: call.peer().to_string(),
            state: call.state(),
        });
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }
}

impl Drop for CallController {
    fn drop(&mut self) {
        if let Some(pump) = self.media_pump.lock().take() {
            pump.abort();
        }
    }
}
