//! Per-connection frame dispatch. A [`Connection`] owns the outbound sender of
//! one websocket and the session it registered (if any); every decoded frame
//! is applied to the shared [`IdentityRegistry`].

use std::time::Instant;

use axum::extract::ws::Message;
use metrics::counter;
use prox_proto::{decode_client_frame, ClientFrame, ServerFrame, SignalFrame, SignalTarget};
use tracing::{debug, info, warn};

use crate::registry::{frame_message, IdentityRegistry, SessionSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    Leave,
    Closed,
    Rejoin,
}

impl LeaveReason {
    fn as_str(self) -> &'static str {
        match self {
            LeaveReason::Leave => "leave",
            LeaveReason::Closed => "closed",
            LeaveReason::Rejoin => "rejoin",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    NotJoined,
    NoTarget,
    Unroutable,
}

/// What happened to one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Joined { session_id: String },
    Listed,
    Relayed { delivered: usize },
    Left,
    Trusted,
    Dropped(DropReason),
}

pub struct Connection {
    registry: IdentityRegistry,
    sender: SessionSender,
    session_id: Option<String>,
}

impl Connection {
    pub fn new(registry: IdentityRegistry, sender: SessionSender) -> Self {
        Self {
            registry,
            sender,
            session_id: None,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Decode and apply one text frame. Frames that fail to decode are dropped
    /// and the connection stays open.
    pub fn handle_text(&mut self, text: &str) -> Disposition {
        match decode_client_frame(text) {
            Ok(frame) => self.handle_frame(frame, text),
            Err(err) => {
                counter!("prox_road_frames_malformed_total", 1);
                warn!(
                    session_id = self.session_id.as_deref().unwrap_or("-"),
                    error = %err,
                    "dropping malformed frame"
                );
                Disposition::Dropped(DropReason::Malformed)
            }
        }
    }

    /// `raw` is the exact text the frame was decoded from; signals are
    /// relayed as-is.
    pub fn handle_frame(&mut self, frame: ClientFrame, raw: &str) -> Disposition {
        match frame {
            ClientFrame::Join { public_key } => self.join(&public_key),
            ClientFrame::List => {
                let identity = self
                    .session_id
                    .as_deref()
                    .and_then(|id| self.registry.identity_of(id));
                let peers = self.registry.roster_excluding(identity.as_deref());
                self.reply(&ServerFrame::Peers {
                    peers,
                    session_id: self.session_id.clone(),
                });
                Disposition::Listed
            }
            ClientFrame::Signal(signal) => self.relay(&signal, raw),
            ClientFrame::Leave { public_key } => {
                let Some(session_id) = self.session_id.clone() else {
                    debug!(identity = %public_key, "LEAVE from connection without a session");
                    return Disposition::Dropped(DropReason::NotJoined);
                };
                if self.registry.identity_of(&session_id).as_deref() != Some(public_key.as_str())
                {
                    warn!(
                        session_id = %session_id,
                        identity = %public_key,
                        "LEAVE names a different identity than the session joined with"
                    );
                }
                self.retire(LeaveReason::Leave);
                Disposition::Left
            }
            ClientFrame::Trust { to, signature } => {
                let from = self
                    .session_id
                    .as_deref()
                    .and_then(|id| self.registry.identity_of(id));
                info!(
                    from = from.as_deref().unwrap_or("-"),
                    to = %to,
                    signature_len = signature.len(),
                    "trust declaration"
                );
                Disposition::Trusted
            }
        }
    }

    pub fn record_ack(&self) {
        if let Some(session_id) = &self.session_id {
            self.registry.record_ack(session_id, Instant::now());
        }
    }

    /// Transport closed or failed: same as LEAVE for this connection's session.
    pub fn close(&mut self) {
        self.retire(LeaveReason::Closed);
    }

    fn join(&mut self, identity: &str) -> Disposition {
        if self.session_id.is_some() {
            self.retire(LeaveReason::Rejoin);
        }
        let joined = self
            .registry
            .join(identity, self.sender.clone(), Instant::now());
        counter!("prox_road_joins_total", 1);
        info!(session_id = %joined.session_id, identity = %identity, "session joined");
        self.session_id = Some(joined.session_id.clone());
        self.reply(&ServerFrame::Peers {
            peers: joined.roster,
            session_id: Some(joined.session_id.clone()),
        });
        Disposition::Joined {
            session_id: joined.session_id,
        }
    }

    fn relay(&self, signal: &SignalFrame, raw: &str) -> Disposition {
        let Some(target) = signal.target() else {
            counter!("prox_road_signals_dropped_total", 1);
            debug!(from = %signal.from, kind = signal.signal.kind(), "signal without target");
            return Disposition::Dropped(DropReason::NoTarget);
        };
        let message = Message::Text(raw.to_string());
        let delivered = match target {
            SignalTarget::Session(session_id) => {
                usize::from(self.registry.send_to_session(session_id, message))
            }
            SignalTarget::Identity(identity) => self.registry.send_to_identity(identity, message),
        };
        if delivered == 0 {
            counter!("prox_road_signals_dropped_total", 1);
            debug!(
                from = %signal.from,
                kind = signal.signal.kind(),
                target = ?target,
                "dropping unroutable signal"
            );
            return Disposition::Dropped(DropReason::Unroutable);
        }
        counter!("prox_road_signals_relayed_total", delivered as u64);
        debug!(
            from = %signal.from,
            kind = signal.signal.kind(),
            delivered,
            "relayed signal"
        );
        Disposition::Relayed { delivered }
    }

    fn retire(&mut self, reason: LeaveReason) {
        let Some(session_id) = self.session_id.take() else {
            return;
        };
        if let Some(departure) = self.registry.leave(&session_id) {
            counter!("prox_road_leaves_total", 1, "reason" => reason.as_str());
            info!(
                session_id = %departure.session_id,
                identity = %departure.identity,
                reason = reason.as_str(),
                "session left"
            );
        }
    }

    fn reply(&self, frame: &ServerFrame) {
        if let Some(message) = frame_message(frame) {
            let _ = self.sender.send(message);
        }
    }
}
