//! Scripted in-memory media engine for tests and tooling.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use prox_proto::IceCandidate;
use tokio::sync::Notify;

use super::{MediaEngine, MediaEngineFactory, MediaError, MediaEvent, MediaEventSink, SdpKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    CreateOffer,
    CreateAnswer,
    SetRemote(SdpKind, String),
    AddCandidate(String),
    LocalAudio(bool),
    Close,
}

/// How every engine made by a [`MockEngineFactory`] behaves.
#[derive(Debug, Clone, Default)]
pub struct MockScript {
    pub fail_offer: bool,
    pub fail_remote_description: bool,
    /// Emitted through the sink right after a local description is produced.
    pub local_candidates: Vec<IceCandidate>,
    /// When set, `create_offer` waits for a permit before returning.
    pub offer_gate: Option<Arc<Notify>>,
    /// When set, `set_remote_description` waits for a permit before applying.
    pub remote_gate: Option<Arc<Notify>>,
}

pub struct MockMediaEngine {
    peer: String,
    sink: MediaEventSink,
    script: MockScript,
    calls: Mutex<Vec<EngineCall>>,
}

impl MockMediaEngine {
    pub fn new(peer: impl Into<String>, sink: MediaEventSink, script: MockScript) -> Self {
        Self {
            peer: peer.into(),
            sink,
            script,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                EngineCall::AddCandidate(candidate) => Some(candidate.clone()),
                _ => None,
            })
            .collect()
    }

    /// Simulate an engine callback.
    pub fn emit(&self, event: MediaEvent) -> bool {
        self.sink.emit(event)
    }

    fn record(&self, call: EngineCall) {
        self.calls.lock().push(call);
    }

    fn announce_local_candidates(&self) {
        for candidate in &self.script.local_candidates {
            self.sink
                .emit(MediaEvent::CandidateGenerated(candidate.clone()));
        }
    }
}

#[async_trait]
impl MediaEngine for MockMediaEngine {
    async fn create_offer(&self) -> Result<String, MediaError> {
        self.record(EngineCall::CreateOffer);
        if let Some(gate) = &self.script.offer_gate {
            gate.notified().await;
        }
        if self.script.fail_offer {
            return Err(MediaError::Negotiation("scripted offer failure".into()));
        }
        self.announce_local_candidates();
        Ok(format!("v=0 offer to {}", self.peer))
    }

    async fn create_answer(&self) -> Result<String, MediaError> {
        self.record(EngineCall::CreateAnswer);
        self.announce_local_candidates();
        Ok(format!("v=0 answer to {}", self.peer))
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), MediaError> {
        if let Some(gate) = &self.script.remote_gate {
            gate.notified().await;
        }
        if self.script.fail_remote_description {
            return Err(MediaError::RemoteDescription(
                "scripted remote description failure".into(),
            ));
        }
        self.record(EngineCall::SetRemote(kind, sdp.to_string()));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError> {
        self.record(EngineCall::AddCandidate(candidate.candidate.clone()));
        Ok(())
    }

    fn set_local_audio_enabled(&self, enabled: bool) {
        self.record(EngineCall::LocalAudio(enabled));
    }

    async fn close(&self) {
        self.record(EngineCall::Close);
    }
}

#[derive(Default)]
pub struct MockEngineFactory {
    script: MockScript,
    engines: Mutex<Vec<Arc<MockMediaEngine>>>,
}

impl MockEngineFactory {
    pub fn new(script: MockScript) -> Self {
        Self {
            script,
            engines: Mutex::new(Vec::new()),
        }
    }

    /// Most recent engine created for `peer`.
    pub fn engine_for(&self, peer: &str) -> Option<Arc<MockMediaEngine>> {
        self.engines
            .lock()
            .iter()
            .rev()
            .find(|engine| engine.peer == peer)
            .cloned()
    }

    pub fn created(&self) -> usize {
        self.engines.lock().len()
    }
}

impl MediaEngineFactory for MockEngineFactory {
    fn create(
        &self,
        peer: &str,
        events: MediaEventSink,
    ) -> Result<Arc<dyn MediaEngine>, MediaError> {
        let engine = Arc::new(MockMediaEngine::new(peer, events, self.script.clone()));
        self.engines.lock().push(engine.clone());
        Ok(engine)
    }
}
