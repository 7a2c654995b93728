use std::collections::BTreeSet;

/// Connection state reported by the media engine for one peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectivityState {
    /// `Some(true)` if the peer should count as connected, `Some(false)` if it
    /// should not, `None` while the engine is still working it out.
    pub fn is_established(self) -> Option<bool> {
        match self {
            Self::Connected | Self::Completed => Some(true),
            Self::Disconnected | Self::Failed | Self::Closed => Some(false),
            Self::New | Self::Checking => None,
        }
    }
}

/// Peers with an established media path.
#[derive(Debug, Default)]
pub struct ConnectedPeers {
    peers: BTreeSet<String>,
}

impl ConnectedPeers {
    /// Fold a connectivity event into the set. Returns the new membership
    /// when it changed.
    pub fn reconcile(&mut self, peer: &str, state: ConnectivityState) -> Option<bool> {
        match state.is_established()? {
            true if self.peers.insert(peer.to_string()) => Some(true),
            false if self.peers.remove(peer) => Some(false),
            _ => None,
        }
    }

    pub fn remove(&mut self, peer: &str) -> bool {
        self.peers.remove(peer)
    }

    pub fn contains(&self, peer: &str) -> bool {
        self.peers.contains(peer)
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.peers.iter().cloned().collect()
    }

    pub fn drain(&mut self) -> Vec<String> {
        std::mem::take(&mut self.peers).into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn repeated_events_change_membership_once() {
        let mut peers = ConnectedPeers::default();
        assert_eq!(peers.reconcile("B", ConnectivityState::Checking), None);
        assert_eq!(peers.reconcile("B", ConnectivityState::Connected), Some(true));
        assert_eq!(peers.reconcile("B", ConnectivityState::Completed), None);
        assert_eq!(peers.reconcile("B", ConnectivityState::Connected), None);
        assert!(peers.contains("B"));

        assert_eq!(peers.reconcile("B", ConnectivityState::Failed), Some(false));
        assert_eq!(peers.reconcile("B", ConnectivityState::Closed), None);
        assert!(!peers.contains("B"));
    }

    #[test_timeout::timeout]
    fn peers_are_tracked_independently() {
        let mut peers = ConnectedPeers::default();
        peers.reconcile("C", ConnectivityState::Connected);
        peers.reconcile("B", ConnectivityState::Completed);
        peers.reconcile("C", ConnectivityState::Disconnected);
        assert_eq!(peers.snapshot(), vec!["B".to_string()]);
        assert_eq!(peers.drain(), vec!["B".to_string()]);
        assert!(peers.snapshot().is_empty());
    }
}
