use std::borrow::Cow;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{close_code, CloseFrame, Message};
use metrics::gauge;
use parking_lot::Mutex;
use prox_proto::{encode, ServerFrame};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::liveness::LivenessConfig;

/// Outbound half of a transport session. The writer task drains it into the socket.
pub type SessionSender = mpsc::UnboundedSender<Message>;

/// Generate a new session ID
pub fn generate_session_id() -> String {
    Uuid::new_v4().to_string()
}

struct SessionEntry {
    identity: String,
    sender: SessionSender,
    last_probe_sent: Instant,
    last_ack: Instant,
}

#[derive(Default)]
struct RegistryInner {
    /// session_id -> session (owning)
    sessions: HashMap<String, SessionEntry>,
    /// identity -> session ids (index only)
    identities: HashMap<String, HashSet<String>>,
}

/// Shared registry of live sessions keyed by session id and by identity.
///
/// All mutations go through one mutex so JOIN, LEAVE and liveness reaps never
/// observe a half-updated identity index. No lock is held across an await.
#[derive(Clone, Default)]
pub struct IdentityRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub session_id: String,
    pub identity: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Joined {
    pub session_id: String,
    /// Identities present before this session registered, excluding its own.
    pub roster: Vec<String>,
}

#[derive(Debug, Default)]
pub struct SweepOutcome {
    pub probed: usize,
    pub reaped: Vec<Departure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RegistryStats {
    pub sessions: usize,
    pub identities: usize,
}

impl RegistryInner {
    fn insert(&mut self, identity: &str, sender: SessionSender, now: Instant) -> String {
        let session_id = generate_session_id();
        self.sessions.insert(
            session_id.clone(),
            SessionEntry {
                identity: identity.to_string(),
                sender,
                last_probe_sent: now,
                last_ack: now,
            },
        );
        self.identities
            .entry(identity.to_string())
            .or_default()
            .insert(session_id.clone());
        gauge!("prox_road_sessions", self.sessions.len() as f64);
        session_id
    }

    fn remove(&mut self, session_id: &str) -> Option<(Departure, SessionSender)> {
        let entry = self.sessions.remove(session_id)?;
        let mut emptied = false;
        if let Some(ids) = self.identities.get_mut(&entry.identity) {
            ids.remove(session_id);
            emptied = ids.is_empty();
        }
        if emptied {
            self.identities.remove(&entry.identity);
        }
        gauge!("prox_road_sessions", self.sessions.len() as f64);
        Some((
            Departure {
                session_id: session_id.to_string(),
                identity: entry.identity,
            },
            entry.sender,
        ))
    }

    fn roster_excluding(&self, identity: Option<&str>) -> Vec<String> {
        self.identities
            .iter()
            .filter(|(key, ids)| Some(key.as_str()) != identity && !ids.is_empty())
            .map(|(key, _)| key.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn broadcast_except(&self, session_id: &str, message: &Message) -> usize {
        let mut delivered = 0;
        for (id, entry) in &self.sessions {
            if id == session_id {
                continue;
            }
            if entry.sender.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    fn announce_leave(&self, departure: &Departure) {
        let frame = ServerFrame::Leave {
            public_key: departure.identity.clone(),
            session_id: Some(departure.session_id.clone()),
        };
        if let Some(message) = frame_message(&frame) {
            self.broadcast_except(&departure.session_id, &message);
        }
    }
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session for `identity` without announcing it.
    pub fn register(&self, identity: &str, sender: SessionSender) -> String {
        self.inner.lock().insert(identity, sender, Instant::now())
    }

    /// Remove a session without announcing it. Unknown ids are a no-op.
    pub fn unregister(&self, session_id: &str) -> Option<Departure> {
        self.inner
            .lock()
            .remove(session_id)
            .map(|(departure, _)| departure)
    }

    /// Register and announce a session. The roster is captured before the new
    /// session is inserted; the JOIN notice goes to every other session,
    /// including other sessions of the same identity.
    pub fn join(&self, identity: &str, sender: SessionSender, now: Instant) -> Joined {
        let mut inner = self.inner.lock();
        let roster = inner.roster_excluding(Some(identity));
        let session_id = inner.insert(identity, sender, now);
        let frame = ServerFrame::Join {
            public_key: identity.to_string(),
            session_id: Some(session_id.clone()),
        };
        if let Some(message) = frame_message(&frame) {
            let notified = inner.broadcast_except(&session_id, &message);
            debug!(session_id = %session_id, identity = %identity, notified, "announced join");
        }
        Joined { session_id, roster }
    }

    /// Unregister a session and broadcast exactly one LEAVE for it. Returns
    /// `None` when the session was already gone, in which case nothing is sent.
    pub fn leave(&self, session_id: &str) -> Option<Departure> {
        let mut inner = self.inner.lock();
        let (departure, _) = inner.remove(session_id)?;
        inner.announce_leave(&departure);
        Some(departure)
    }

    pub fn sessions_for(&self, identity: &str) -> HashSet<String> {
        self.inner
            .lock()
            .identities
            .get(identity)
            .cloned()
            .unwrap_or_default()
    }

    pub fn identity_of(&self, session_id: &str) -> Option<String> {
        self.inner
            .lock()
            .sessions
            .get(session_id)
            .map(|entry| entry.identity.clone())
    }

    /// Distinct identities present, sorted, minus `identity`.
    pub fn roster_excluding(&self, identity: Option<&str>) -> Vec<String> {
        self.inner.lock().roster_excluding(identity)
    }

    pub fn send_to_session(&self, session_id: &str, message: Message) -> bool {
        self.inner
            .lock()
            .sessions
            .get(session_id)
            .map(|entry| entry.sender.send(message).is_ok())
            .unwrap_or(false)
    }

    /// Fan a message out to every session presenting `identity`.
    pub fn send_to_identity(&self, identity: &str, message: Message) -> usize {
        let inner = self.inner.lock();
        let Some(ids) = inner.identities.get(identity) else {
            return 0;
        };
        ids.iter()
            .filter_map(|id| inner.sessions.get(id))
            .filter(|entry| entry.sender.send(message.clone()).is_ok())
            .count()
    }

    pub fn record_ack(&self, session_id: &str, now: Instant) {
        if let Some(entry) = self.inner.lock().sessions.get_mut(session_id) {
            entry.last_ack = now;
        }
    }

    /// One liveness pass. Sessions whose last ack is older than the dead
    /// threshold are closed, removed and announced in this same pass; the rest
    /// get a ping once the probe interval has elapsed since the previous one.
    ///
    /// A probe counts as due half an interval early, so a sweep that runs a
    /// little ahead of the previous one's spacing still pings.
    pub fn sweep(&self, now: Instant, config: &LivenessConfig) -> SweepOutcome {
        let mut inner = self.inner.lock();
        let mut outcome = SweepOutcome::default();
        let probe_due = config.probe_interval - config.probe_interval / 2;

        let dead: Vec<String> = inner
            .sessions
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_ack) > config.dead_after)
            .map(|(id, _)| id.clone())
            .collect();

        for session_id in dead {
            if let Some((departure, sender)) = inner.remove(&session_id) {
                let _ = sender.send(Message::Close(Some(CloseFrame {
                    code: close_code::AWAY,
                    reason: Cow::Borrowed("liveness timeout"),
                })));
                info!(
                    session_id = %departure.session_id,
                    identity = %departure.identity,
                    "reaping unresponsive session"
                );
                outcome.reaped.push(departure);
            }
        }
        for departure in &outcome.reaped {
            inner.announce_leave(departure);
        }

        for (session_id, entry) in inner.sessions.iter_mut() {
            if now.saturating_duration_since(entry.last_probe_sent) < probe_due {
                continue;
            }
            if entry.sender.send(Message::Ping(Vec::new())).is_err() {
                debug!(session_id = %session_id, "liveness probe not delivered");
            }
            entry.last_probe_sent = now;
            outcome.probed += 1;
        }

        outcome
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.lock();
        RegistryStats {
            sessions: inner.sessions.len(),
            identities: inner.identities.len(),
        }
    }
}

pub(crate) fn frame_message(frame: &ServerFrame) -> Option<Message> {
    match encode(frame) {
        Ok(text) => Some(Message::Text(text)),
        Err(err) => {
            warn!(error = %err, "failed to encode server frame");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::time::Duration;

    fn channel() -> (SessionSender, mpsc::UnboundedReceiver<Message>) {
        mpsc::unbounded_channel()
    }

    fn drain_text(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let Message::Text(text) = message {
                out.push(serde_json::from_str(&text).unwrap());
            }
        }
        out
    }

    fn liveness() -> LivenessConfig {
        LivenessConfig::new(Duration::from_secs(5), Duration::from_secs(12)).unwrap()
    }

    #[test_timeout::timeout]
    fn session_ids_are_unique() {
        let id1 = generate_session_id();
        let id2 = generate_session_id();
        assert_ne!(id1, id2);
        assert_eq!(id1.len(), 36);
    }

    #[test_timeout::timeout]
    fn roster_lists_identity_once_for_many_sessions() {
        let registry = IdentityRegistry::new();
        for _ in 0..3 {
            let (tx, _rx) = channel();
            registry.register("pk-a", tx);
        }
        let (tx, _rx) = channel();
        registry.register("pk-b", tx);

        assert_eq!(registry.roster_excluding(Some("pk-b")), vec!["pk-a"]);
        assert_eq!(registry.roster_excluding(None), vec!["pk-a", "pk-b"]);
        assert_eq!(registry.sessions_for("pk-a").len(), 3);
        assert!(registry.sessions_for("pk-z").is_empty());
    }

    #[test_timeout::timeout]
    fn unregister_is_idempotent_and_drops_empty_identity() {
        let registry = IdentityRegistry::new();
        let (tx, _rx) = channel();
        let id = registry.register("pk-a", tx);

        let departure = registry.unregister(&id).unwrap();
        assert_eq!(departure.identity, "pk-a");
        assert!(registry.unregister(&id).is_none());
        assert_eq!(
            registry.stats(),
            RegistryStats {
                sessions: 0,
                identities: 0
            }
        );
        assert!(registry.roster_excluding(None).is_empty());
    }

    #[test_timeout::timeout]
    fn leave_from_one_session_keeps_identity_present() {
        let registry = IdentityRegistry::new();
        let (tx1, _rx1) = channel();
        let (tx2, mut rx2) = channel();
        let first = registry.register("pk-a", tx1);
        let second = registry.register("pk-a", tx2);

        registry.leave(&first).unwrap();

        assert_eq!(registry.roster_excluding(Some("pk-b")), vec!["pk-a"]);
        assert_eq!(registry.sessions_for("pk-a"), HashSet::from([second]));
        let frames = drain_text(&mut rx2);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "LEAVE");
        assert_eq!(frames[0]["sessionId"], first.as_str());
        assert!(registry.leave(&first).is_none());
        assert!(drain_text(&mut rx2).is_empty());
    }

    #[test_timeout::timeout]
    fn join_snapshots_roster_before_registering() {
        let registry = IdentityRegistry::new();
        let (tx_b, mut rx_b) = channel();
        let (tx_a1, mut rx_a1) = channel();
        registry.join("pk-b", tx_b, Instant::now());
        let first = registry.join("pk-a", tx_a1, Instant::now());
        assert_eq!(first.roster, vec!["pk-b"]);

        let (tx_a2, mut rx_a2) = channel();
        let second = registry.join("pk-a", tx_a2, Instant::now());
        assert_eq!(second.roster, vec!["pk-b"]);

        let seen_by_b = drain_text(&mut rx_b);
        assert_eq!(seen_by_b.len(), 2);
        assert!(seen_by_b.iter().all(|f| f["type"] == "JOIN" && f["publicKey"] == "pk-a"));

        let seen_by_a1 = drain_text(&mut rx_a1);
        assert_eq!(seen_by_a1.len(), 1);
        assert_eq!(seen_by_a1[0]["sessionId"], second.session_id.as_str());
        assert!(drain_text(&mut rx_a2).is_empty());
    }

    #[test_timeout::timeout]
    fn targeted_sends() {
        let registry = IdentityRegistry::new();
        let (tx1, mut rx1) = channel();
        let (tx2, mut rx2) = channel();
        let one = registry.register("pk-b", tx1);
        registry.register("pk-b", tx2);

        assert!(registry.send_to_session(&one, Message::Text("x".into())));
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());

        assert_eq!(registry.send_to_identity("pk-b", Message::Text("y".into())), 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());

        assert!(!registry.send_to_session("missing", Message::Text("z".into())));
        assert_eq!(registry.send_to_identity("pk-z", Message::Text("z".into())), 0);
    }

    #[test_timeout::timeout]
    fn sweep_probes_after_interval() {
        let registry = IdentityRegistry::new();
        let start = Instant::now();
        let (tx, mut rx) = channel();
        registry.join("pk-a", tx, start);

        let early = registry.sweep(start + Duration::from_secs(2), &liveness());
        assert_eq!(early.probed, 0);

        let due = registry.sweep(start + Duration::from_secs(5), &liveness());
        assert_eq!(due.probed, 1);
        assert!(matches!(rx.try_recv(), Ok(Message::Ping(_))));

        let again = registry.sweep(start + Duration::from_secs(7), &liveness());
        assert_eq!(again.probed, 0);
    }

    #[test_timeout::timeout]
    fn late_tick_does_not_skip_the_next_probe() {
        let registry = IdentityRegistry::new();
        let start = Instant::now();
        let (tx, _rx) = channel();
        let session = registry.join("pk-a", tx, start).session_id;
        let config = liveness();
        let at = |millis: u64| start + Duration::from_millis(millis);

        // First tick wakes 10ms late, the second one on time.
        assert_eq!(registry.sweep(at(5_010), &config).probed, 1);
        registry.record_ack(&session, at(5_020));
        assert_eq!(registry.sweep(at(10_000), &config).probed, 1);
        registry.record_ack(&session, at(10_020));

        // The pong for this probe is lost.
        assert_eq!(registry.sweep(at(15_000), &config).probed, 1);
        let outcome = registry.sweep(at(20_000), &config);
        assert!(outcome.reaped.is_empty());
        assert_eq!(outcome.probed, 1);

        // A second lost pong is what reaps it.
        let outcome = registry.sweep(at(25_000), &config);
        assert_eq!(outcome.reaped.len(), 1);
        assert_eq!(outcome.reaped[0].session_id, session);
    }

    #[test_timeout::timeout]
    fn sweep_reaps_silent_session_once() {
        let registry = IdentityRegistry::new();
        let start = Instant::now();
        let (tx_a, mut rx_a) = channel();
        let (tx_b, mut rx_b) = channel();
        registry.join("pk-a", tx_a, start);
        let silent = registry.join("pk-b", tx_b, start).session_id;
        drain_text(&mut rx_a);

        let config = liveness();
        for secs in [5, 10] {
            let now = start + Duration::from_secs(secs);
            let session_a: Vec<String> = registry.sessions_for("pk-a").into_iter().collect();
            registry.record_ack(&session_a[0], now);
            assert!(registry.sweep(now, &config).reaped.is_empty());
        }

        let now = start + Duration::from_secs(15);
        let outcome = registry.sweep(now, &config);
        assert_eq!(outcome.reaped.len(), 1);
        assert_eq!(outcome.reaped[0].session_id, silent);
        assert!(registry.sessions_for("pk-b").is_empty());

        let leaves: Vec<Value> = drain_text(&mut rx_a)
            .into_iter()
            .filter(|f| f["type"] == "LEAVE")
            .collect();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0]["publicKey"], "pk-b");

        let mut closed = false;
        while let Ok(message) = rx_b.try_recv() {
            closed |= matches!(message, Message::Close(_));
        }
        assert!(closed);

        assert!(registry
            .sweep(now + Duration::from_secs(5), &config)
            .reaped
            .is_empty());
        assert!(drain_text(&mut rx_a).iter().all(|f| f["type"] != "LEAVE"));
    }

    #[test_timeout::timeout]
    fn probe_to_closed_channel_is_tolerated() {
        let registry = IdentityRegistry::new();
        let start = Instant::now();
        let (tx, rx) = channel();
        registry.join("pk-a", tx, start);
        drop(rx);

        let outcome = registry.sweep(start + Duration::from_secs(6), &liveness());
        assert_eq!(outcome.probed, 1);
        assert!(outcome.reaped.is_empty());
        let outcome = registry.sweep(start + Duration::from_secs(13), &liveness());
        assert_eq!(outcome.reaped.len(), 1);
    }
}
