//! Wire frames shared by the prox-road signaling server and the call client.
//! Every frame is a single JSON object tagged by `type`; decoding validates the
//! fields the router depends on so handlers never see half-formed frames.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Frames a client sends to the signaling server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum ClientFrame {
    /// Announce an identity on this connection.
    Join {
        #[serde(rename = "publicKey")]
        public_key: String,
    },
    /// Ask for the current roster.
    List,
    /// Retire this connection's session.
    Leave {
        #[serde(rename = "publicKey")]
        public_key: String,
    },
    /// Negotiation payload relayed verbatim to the addressed peer.
    Signal(SignalFrame),
    /// Trust declaration. Logged by the server, no other effect.
    Trust { to: String, signature: String },
}

/// Frames the signaling server sends to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum ServerFrame {
    /// Roster snapshot. `sessionId` is the receiver's own session when known.
    Peers {
        peers: Vec<String>,
        #[serde(
            rename = "sessionId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        session_id: Option<String>,
    },
    /// Another session presented an identity.
    Join {
        #[serde(rename = "publicKey")]
        public_key: String,
        #[serde(
            rename = "sessionId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        session_id: Option<String>,
    },
    /// A session went away (explicit leave, close, or liveness reap).
    Leave {
        #[serde(rename = "publicKey")]
        public_key: String,
        #[serde(
            rename = "sessionId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        session_id: Option<String>,
    },
    /// A relayed negotiation frame.
    Signal(SignalFrame),
    Trust { to: String, signature: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_session_id: Option<String>,
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_session_id: Option<String>,
    pub signal: Signal,
}

/// Where a signal should be delivered. Session tokens win over identities so
/// a handshake that started with one device stays on that device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalTarget<'a> {
    Session(&'a str),
    Identity(&'a str),
}

impl SignalFrame {
    pub fn new(from: impl Into<String>, to_public_key: impl Into<String>, signal: Signal) -> Self {
        Self {
            to: None,
            to_public_key: Some(to_public_key.into()),
            to_session_id: None,
            from: from.into(),
            from_session_id: None,
            signal,
        }
    }

    pub fn with_to_session(mut self, session_id: Option<String>) -> Self {
        self.to_session_id = session_id;
        self
    }

    pub fn with_from_session(mut self, session_id: Option<String>) -> Self {
        self.from_session_id = session_id;
        self
    }

    pub fn target(&self) -> Option<SignalTarget<'_>> {
        if let Some(session) = non_empty(&self.to_session_id) {
            return Some(SignalTarget::Session(session));
        }
        non_empty(&self.to_public_key)
            .or_else(|| non_empty(&self.to))
            .map(SignalTarget::Identity)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Signal {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate(IceCandidate),
}

impl Signal {
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Offer { .. } => "offer",
            Signal::Answer { .. } => "answer",
            Signal::Candidate(_) => "candidate",
        }
    }
}

/// A connectivity candidate in the shape browsers and native stacks emit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame is missing required field `{0}`")]
    MissingField(&'static str),
}

/// Decode and validate a frame received by the server.
pub fn decode_client_frame(text: &str) -> Result<ClientFrame, FrameError> {
    let frame: ClientFrame = serde_json::from_str(text)?;
    match &frame {
        ClientFrame::Join { public_key } | ClientFrame::Leave { public_key }
            if public_key.trim().is_empty() =>
        {
            Err(FrameError::MissingField("publicKey"))
        }
        ClientFrame::Signal(signal) if signal.from.trim().is_empty() => {
            Err(FrameError::MissingField("from"))
        }
        ClientFrame::Trust { to, .. } if to.trim().is_empty() => {
            Err(FrameError::MissingField("to"))
        }
        ClientFrame::Trust { signature, .. } if signature.is_empty() => {
            Err(FrameError::MissingField("signature"))
        }
        _ => Ok(frame),
    }
}

/// Decode a frame received by a client.
pub fn decode_server_frame(text: &str) -> Result<ServerFrame, FrameError> {
    let frame: ServerFrame = serde_json::from_str(text)?;
    match &frame {
        ServerFrame::Join { public_key, .. } | ServerFrame::Leave { public_key, .. }
            if public_key.is_empty() =>
        {
            Err(FrameError::MissingField("publicKey"))
        }
        _ => Ok(frame),
    }
}

pub fn encode<T: Serialize>(frame: &T) -> Result<String, FrameError> {
    Ok(serde_json::to_string(frame)?)
}
