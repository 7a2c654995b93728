use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use prox_proto::IceCandidate;
use tracing::{debug, trace, warn};

use crate::candidates::CandidateBuffer;
use crate::media::{MediaEngine, MediaError, SdpKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Offering,
    AwaitingAnswer,
    Answering,
    Connected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    Buffered,
    Applied,
    Rejected,
    /// Sent by a device of the peer other than the pinned one.
    OtherSession,
}

#[derive(Debug)]
struct RemoteCandidate {
    candidate: IceCandidate,
    from_session: Option<String>,
}

/// One negotiation with one peer identity.
pub struct Call {
    id: u64,
    peer: String,
    role: CallRole,
    engine: Arc<dyn MediaEngine>,
    state: Mutex<CallState>,
    remote_session: Mutex<Option<String>>,
    // Held across engine awaits so the drain and later arrivals stay ordered.
    remote_candidates: tokio::sync::Mutex<CandidateBuffer<RemoteCandidate>>,
    local_candidates: Mutex<CandidateBuffer>,
    audio_enabled: AtomicBool,
}

impl Call {
    pub(crate) fn new(
        id: u64,
        peer: impl Into<String>,
        role: CallRole,
        engine: Arc<dyn MediaEngine>,
        remote_session: Option<String>,
    ) -> Self {
        Self {
            id,
            peer: peer.into(),
            role,
            engine,
            state: Mutex::new(CallState::Idle),
            remote_session: Mutex::new(remote_session),
            remote_candidates: tokio::sync::Mutex::new(CandidateBuffer::new()),
            local_candidates: Mutex::new(CandidateBuffer::new()),
            audio_enabled: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn state(&self) -> CallState {
        *self.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CallState::Closed
    }

    pub fn remote_session(&self) -> Option<String> {
        self.remote_session.lock().clone()
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn engine(&self) -> &Arc<dyn MediaEngine> {
        &self.engine
    }

    /// Local candidates are held here until our description has been sent.
    pub(crate) fn local_candidates(&self) -> &Mutex<CandidateBuffer> {
        &self.local_candidates
    }

    /// Move from `from` to `to`. Fails with the current state otherwise.
    pub(crate) fn advance(&self, from: CallState, to: CallState) -> Result<(), CallState> {
        let mut state = self.state.lock();
        if *state != from {
            return Err(*state);
        }
        *state = to;
        Ok(())
    }

    /// Pin the remote device if none is known yet.
    pub(crate) fn pin_remote_session(&self, session_id: Option<String>) {
        let mut remote = self.remote_session.lock();
        if remote.is_none() {
            *remote = session_id;
        }
    }

    /// Whether a signal from `from_session` belongs to this call. Unpinned
    /// calls and untagged signals always match.
    fn is_pinned_session(&self, from_session: Option<&str>) -> bool {
        match (self.remote_session.lock().as_deref(), from_session) {
            (Some(pinned), Some(from)) => pinned == from,
            _ => true,
        }
    }

    /// Apply the remote description and then every candidate buffered before
    /// it, in arrival order. Buffered candidates from a device other than the
    /// pinned one are discarded. Returns how many were applied.
    pub(crate) async fn apply_remote_description(
        &self,
        kind: SdpKind,
        sdp: &str,
    ) -> Result<usize, MediaError> {
        self.engine.set_remote_description(kind, sdp).await?;

        let mut buffer = self.remote_candidates.lock().await;
        let drained = buffer.release();
        let held = drained.len();
        let mut count = 0;
        for remote in drained {
            if !self.is_pinned_session(remote.from_session.as_deref()) {
                continue;
            }
            count += 1;
            if let Err(err) = self.engine.add_ice_candidate(&remote.candidate).await {
                warn!(target: "prox_call", peer = %self.peer, error = %err, "buffered candidate rejected");
            }
        }
        if held > 0 {
            debug!(
                target: "prox_call",
                peer = %self.peer,
                count,
                discarded = held - count,
                "drained buffered candidates"
            );
        }
        Ok(count)
    }

    pub(crate) async fn accept_remote_candidate(
        &self,
        candidate: IceCandidate,
        from_session: Option<String>,
    ) -> CandidateOutcome {
        if !self.is_pinned_session(from_session.as_deref()) {
            return CandidateOutcome::OtherSession;
        }
        let mut buffer = self.remote_candidates.lock().await;
        let remote = RemoteCandidate {
            candidate,
            from_session,
        };
        let Some(RemoteCandidate { candidate, .. }) = buffer.admit(remote) else {
            trace!(target: "prox_call", peer = %self.peer, pending = buffer.len(), "candidate buffered");
            return CandidateOutcome::Buffered;
        };
        match self.engine.add_ice_candidate(&candidate).await {
            Ok(()) => CandidateOutcome::Applied,
            Err(err) => {
                warn!(target: "prox_call", peer = %self.peer, error = %err, "remote candidate rejected");
                CandidateOutcome::Rejected
            }
        }
    }

    pub(crate) fn set_local_audio(&self, enabled: bool) {
        self.audio_enabled.store(enabled, Ordering::SeqCst);
        self.engine.set_local_audio_enabled(enabled);
    }

    /// Close the engine handle. Returns false if the call was already closed.
    pub(crate) async fn close(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state == CallState::Closed {
                return false;
            }
            *state = CallState::Closed;
        }
        self.engine.close().await;
        true
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("role", &self.role)
            .field("state", &self.state())
            .field("remote_session", &self.remote_session())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::mock::{EngineCall, MockMediaEngine, MockScript};
    use crate::media::MediaEventSink;
    use tokio::sync::mpsc;

    fn call_with_mock() -> (Call, Arc<MockMediaEngine>) {
        call_pinned_to(None)
    }

    fn call_pinned_to(session: Option<&str>) -> (Call, Arc<MockMediaEngine>) {
        let (tx, _rx) = mpsc::unbounded_channel();
        let engine = Arc::new(MockMediaEngine::new(
            "B",
            MediaEventSink::new("B", 1, tx),
            MockScript::default(),
        ));
        let call = Call::new(
            1,
            "B",
            CallRole::Callee,
            engine.clone(),
            session.map(str::to_string),
        );
        (call, engine)
    }

    fn from(session: &str) -> Option<String> {
        Some(session.to_string())
    }

    fn candidate(value: &str) -> IceCandidate {
        IceCandidate {
            candidate: value.to_string(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn candidates_wait_for_the_remote_description() {
        let (call, engine) = call_with_mock();
        assert_eq!(
            call.accept_remote_candidate(candidate("c1"), None).await,
            CandidateOutcome::Buffered
        );
        assert_eq!(
            call.apply_remote_description(SdpKind::Offer, "sdp").await.unwrap(),
            1
        );
        assert_eq!(
            call.accept_remote_candidate(candidate("c2"), None).await,
            CandidateOutcome::Applied
        );
        assert_eq!(
            engine.calls(),
            vec![
                EngineCall::SetRemote(SdpKind::Offer, "sdp".into()),
                EngineCall::AddCandidate("c1".into()),
                EngineCall::AddCandidate("c2".into()),
            ]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn pinned_call_drops_candidates_from_other_devices() {
        let (call, engine) = call_pinned_to(Some("a-1"));
        assert_eq!(
            call.accept_remote_candidate(candidate("early-a2"), from("a-2")).await,
            CandidateOutcome::OtherSession
        );
        assert_eq!(
            call.accept_remote_candidate(candidate("early-a1"), from("a-1")).await,
            CandidateOutcome::Buffered
        );
        call.apply_remote_description(SdpKind::Offer, "sdp").await.unwrap();

        assert_eq!(
            call.accept_remote_candidate(candidate("late-a2"), from("a-2")).await,
            CandidateOutcome::OtherSession
        );
        assert_eq!(
            call.accept_remote_candidate(candidate("untagged"), None).await,
            CandidateOutcome::Applied
        );
        assert_eq!(engine.applied_candidates(), vec!["early-a1", "untagged"]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn buffered_candidates_are_filtered_once_a_device_is_pinned() {
        let (call, engine) = call_with_mock();
        for (value, session) in [("c-b1", "b-1"), ("c-b2", "b-2")] {
            assert_eq!(
                call.accept_remote_candidate(candidate(value), from(session)).await,
                CandidateOutcome::Buffered
            );
        }
        call.pin_remote_session(from("b-1"));
        call.pin_remote_session(from("b-2"));
        assert_eq!(call.remote_session().as_deref(), Some("b-1"));

        assert_eq!(
            call.apply_remote_description(SdpKind::Answer, "sdp").await.unwrap(),
            1
        );
        assert_eq!(engine.applied_candidates(), vec!["c-b1"]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn close_is_idempotent() {
        let (call, engine) = call_with_mock();
        assert!(call.close().await);
        assert!(!call.close().await);
        assert!(call.is_closed());
        assert_eq!(engine.calls(), vec![EngineCall::Close]);
    }

    #[test_timeout::timeout]
    fn advance_checks_the_current_state() {
        let (call, _engine) = call_with_mock();
        assert_eq!(call.advance(CallState::Idle, CallState::Answering), Ok(()));
        assert_eq!(
            call.advance(CallState::AwaitingAnswer, CallState::Connected),
            Err(CallState::Answering)
        );
        assert_eq!(call.state(), CallState::Answering);
    }

    #[test_timeout::timeout]
    fn push_to_talk_leaves_state_alone() {
        let (call, engine) = call_with_mock();
        call.set_local_audio(false);
        assert!(!call.audio_enabled());
        assert_eq!(call.state(), CallState::Idle);
        assert_eq!(engine.calls(), vec![EngineCall::LocalAudio(false)]);
    }
}
