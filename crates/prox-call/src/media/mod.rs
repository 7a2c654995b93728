use std::sync::Arc;

use async_trait::async_trait;
use prox_proto::IceCandidate;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::connectivity::ConnectivityState;

pub mod mock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("description negotiation failed: {0}")]
    Negotiation(String),

    #[error("remote description rejected: {0}")]
    RemoteDescription(String),

    #[error("candidate rejected: {0}")]
    Candidate(String),

    #[error("media engine unavailable: {0}")]
    Unavailable(String),
}

/// One peer connection inside the platform media stack.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Produce a local offer and install it as the local description.
    async fn create_offer(&self) -> Result<String, MediaError>;

    /// Produce a local answer to the applied remote offer.
    async fn create_answer(&self) -> Result<String, MediaError>;

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), MediaError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError>;

    /// Push-to-talk: gate the captured microphone track.
    fn set_local_audio_enabled(&self, enabled: bool);

    async fn close(&self);
}

/// Creates one engine per call. The engine reports candidates and
/// connectivity changes through the supplied sink.
pub trait MediaEngineFactory: Send + Sync {
    fn create(
        &self,
        peer: &str,
        events: MediaEventSink,
    ) -> Result<Arc<dyn MediaEngine>, MediaError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    CandidateGenerated(IceCandidate),
    Connectivity(ConnectivityState),
}

#[derive(Debug)]
pub(crate) struct MediaNotice {
    pub peer: String,
    pub call_id: u64,
    pub event: MediaEvent,
}

/// Handle an engine uses to report events for the call it was created for.
#[derive(Debug, Clone)]
pub struct MediaEventSink {
    peer: String,
    call_id: u64,
    tx: mpsc::UnboundedSender<MediaNotice>,
}

impl MediaEventSink {
    pub(crate) fn new(
        peer: impl Into<String>,
        call_id: u64,
        tx: mpsc::UnboundedSender<MediaNotice>,
    ) -> Self {
        Self {
            peer: peer.into(),
            call_id,
            tx,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Returns false once the controller is gone.
    pub fn emit(&self, event: MediaEvent) -> bool {
        self.tx
            .send(MediaNotice {
                peer: self.peer.clone(),
                call_id: self.call_id,
                event,
            })
            .is_ok()
    }
}
