//! Peer registry: permanent and data-transfer peers keyed by identifier, in registration order.

use crate::identity::PeerId;
use crate::protocol::{Message, PeerAddress, NO_SUBSTITUTE_TEXT};

/// Why a link exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Long-lived control-plane link used for search and failover traffic.
    Permanent,
    /// Ephemeral link opened to move one file.
    DataTransfer,
}

/// Everything this node knows about one connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub id: PeerId,
    pub role: Role,
    /// This node's chosen failover recommendation.
    pub anchor: bool,
    /// Address the peer advertised as reachable.
    pub address: PeerAddress,
    /// Address the peer recommends if it disappears.
    pub substitute: Option<PeerAddress>,
}

impl PeerEntry {
    pub fn new(id: PeerId, role: Role, address: PeerAddress) -> Self {
        Self {
            id,
            role,
            anchor: false,
            address,
            substitute: None,
        }
    }
}

/// Failover recommendation handed to a newly accepted permanent peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recommendation {
    /// Fall back to this address if I disappear.
    Substitute(PeerAddress),
    /// You are my anchor (or I have no other peers).
    NoSubstitute,
}

impl Recommendation {
    pub fn to_message(&self) -> Message {
        match self {
            Recommendation::Substitute(addr) => Message::Substitute(addr.clone()),
            Recommendation::NoSubstitute => Message::NoSubstitute(NO_SUBSTITUTE_TEXT.to_string()),
        }
    }
}

#[derive(Debug, Default)]
pub struct PeerRegistry {
    permanent: Vec<PeerEntry>,
    data_transfer: Vec<PeerEntry>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer. An id may appear only once across both collections.
    pub fn insert(&mut self, entry: PeerEntry) -> Result<(), RegistryError> {
        if self.get(&entry.id).is_some() {
            return Err(RegistryError::Duplicate(entry.id));
        }
        match entry.role {
            Role::Permanent => self.permanent.push(entry),
            Role::DataTransfer => self.data_transfer.push(entry),
        }
        Ok(())
    }

    /// Remove a peer from whichever collection holds it.
    pub fn remove(&mut self, id: &PeerId) -> Option<PeerEntry> {
        for list in [&mut self.permanent, &mut self.data_transfer] {
            if let Some(pos) = list.iter().position(|p| p.id == *id) {
                return Some(list.remove(pos));
            }
        }
        None
    }

    pub fn get(&self, id: &PeerId) -> Option<&PeerEntry> {
        self.permanent
            .iter()
            .chain(self.data_transfer.iter())
            .find(|p| p.id == *id)
    }

    pub fn role_of(&self, id: &PeerId) -> Option<Role> {
        self.get(id).map(|p| p.role)
    }

    pub fn is_permanent(&self, id: &PeerId) -> bool {
        self.role_of(id) == Some(Role::Permanent)
    }

    pub fn permanent(&self) -> &[PeerEntry] {
        &self.permanent
    }

    pub fn data_transfer(&self) -> &[PeerEntry] {
        &self.data_transfer
    }

    pub fn is_empty(&self) -> bool {
        self.permanent.is_empty() && self.data_transfer.is_empty()
    }

    /// Broadcast targets: every permanent peer except `exclude`.
    pub fn permanent_ids_except(&self, exclude: Option<&PeerId>) -> Vec<PeerId> {
        self.permanent
            .iter()
            .map(|p| p.id)
            .filter(|id| Some(id) != exclude)
            .collect()
    }

    /// Every connected peer, permanent first.
    pub fn all_ids(&self) -> Vec<PeerId> {
        self.permanent
            .iter()
            .chain(self.data_transfer.iter())
            .map(|p| p.id)
            .collect()
    }

    pub fn anchor(&self) -> Option<&PeerEntry> {
        self.permanent.iter().find(|p| p.anchor)
    }

    /// Make `id` the anchor, demoting any previous one. Only permanent peers qualify.
    pub fn set_anchor(&mut self, id: &PeerId) -> bool {
        if !self.is_permanent(id) {
            return false;
        }
        for peer in &mut self.permanent {
            peer.anchor = peer.id == *id;
        }
        true
    }

    /// Record what a permanent peer recommends as its substitute.
    pub fn set_substitute(&mut self, id: &PeerId, substitute: Option<PeerAddress>) -> bool {
        match self.permanent.iter_mut().find(|p| p.id == *id) {
            Some(peer) => {
                peer.substitute = substitute;
                true
            }
            None => false,
        }
    }

    pub fn find_permanent_by_address(&self, address: &PeerAddress) -> Option<&PeerEntry> {
        self.permanent.iter().find(|p| p.address == *address)
    }

    /// What to tell `requester` to fall back to if this node disappears.
    pub fn recommendation_for(&self, requester: &PeerId) -> Recommendation {
        match self.anchor() {
            Some(anchor) if anchor.id != *requester => {
                Recommendation::Substitute(anchor.address.clone())
            }
            _ => Recommendation::NoSubstitute,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("peer {0} is already registered")]
    Duplicate(PeerId),
}
