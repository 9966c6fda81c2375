//! Directory of peer public keys.
//!
//! Maps a [`PeerId`] to the exchange and signing public keys of that peer.
//! The directory is shared behind an `Arc` and may be populated from another
//! task while the client is running; lookups see whatever is present at the
//! time of the call.

use dashmap::DashMap;
use tracing::debug;

use crate::crypto::PeerKeys;
use crate::envelope::PeerId;
use crate::error::{ProtocolError, Result};

/// Concurrent map of peer identifiers to their public keys.
#[derive(Debug, Default)]
pub struct KeyDirectory {
    entries: DashMap<PeerId, PeerKeys>,
}

impl KeyDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the keys of a peer, returning the previous entry.
    pub fn insert(&self, peer: PeerId, keys: PeerKeys) -> Option<PeerKeys> {
        debug!(peer = %peer, fingerprint = %keys.fingerprint(), "Registering peer keys");
        self.entries.insert(peer, keys)
    }

    /// Look up the keys of a peer.
    pub fn get(&self, peer: PeerId) -> Option<PeerKeys> {
        self.entries.get(&peer).map(|entry| *entry.value())
    }

    /// Look up the keys of a peer, failing with [`ProtocolError::UnknownPeer`].
    pub fn require(&self, peer: PeerId) -> Result<PeerKeys> {
        self.get(peer)
            .ok_or(ProtocolError::UnknownPeer { peer_id: peer.0 })
    }

    /// Remove a peer.
    pub fn remove(&self, peer: PeerId) -> Option<PeerKeys> {
        self.entries.remove(&peer).map(|(_, keys)| keys)
    }

    /// Returns true if the peer has an entry.
    pub fn contains(&self, peer: PeerId) -> bool {
        self.entries.contains_key(&peer)
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no peers are known.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Known peer identifiers, sorted.
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.entries.iter().map(|entry| *entry.key()).collect();
        peers.sort();
        peers
    }
}

impl FromIterator<(PeerId, PeerKeys)> for KeyDirectory {
    fn from_iter<I: IntoIterator<Item = (PeerId, PeerKeys)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::LocalIdentity;
    use std::sync::Arc;

    #[test]
    fn test_insert_get_remove() {
        let directory = KeyDirectory::new();
        let keys = LocalIdentity::generate().public_keys();

        assert!(directory.is_empty());
        assert!(directory.insert(PeerId(3), keys).is_none());
        assert_eq!(directory.get(PeerId(3)), Some(keys));
        assert!(directory.contains(PeerId(3)));
        assert_eq!(directory.len(), 1);

        assert_eq!(directory.remove(PeerId(3)), Some(keys));
        assert!(directory.get(PeerId(3)).is_none());
    }

    #[test]
    fn test_insert_replaces() {
        let directory = KeyDirectory::new();
        let first = LocalIdentity::generate().public_keys();
        let second = LocalIdentity::generate().public_keys();

        directory.insert(PeerId(1), first);
        assert_eq!(directory.insert(PeerId(1), second), Some(first));
        assert_eq!(directory.get(PeerId(1)), Some(second));
    }

    #[test]
    fn test_require_unknown_peer() {
        let directory = KeyDirectory::new();
        assert!(matches!(
            directory.require(PeerId(8)),
            Err(ProtocolError::UnknownPeer { peer_id: 8 })
        ));
    }

    #[test]
    fn test_peers_sorted() {
        let directory: KeyDirectory = [5, 0, 3]
            .into_iter()
            .map(|id| (PeerId(id), LocalIdentity::generate().public_keys()))
            .collect();
        assert_eq!(directory.peers(), vec![PeerId(0), PeerId(3), PeerId(5)]);
    }

    #[test]
    fn test_shared_updates_visible() {
        let directory = Arc::new(KeyDirectory::new());
        let writer = Arc::clone(&directory);

        std::thread::spawn(move || {
            writer.insert(PeerId(9), LocalIdentity::generate().public_keys());
        })
        .join()
        .unwrap();

        assert!(directory.contains(PeerId(9)));
    }
}
