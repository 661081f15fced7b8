//! Failover chain: what to do when a permanent peer leaves, and how a new anchor is announced.
//!
//! Each permanent peer tells this node the address it would recommend if it disappears. When the
//! anchor leaves, this node dials that address (or promotes a peer it already has) and tells the
//! rest of its permanent peers about the new anchor.

use crate::identity::PeerId;
use crate::protocol::{Message, PeerAddress};
use crate::registry::{PeerEntry, PeerRegistry, Role};

/// Reaction to a departed peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverPlan {
    Nothing,
    /// Dial this address as a new permanent, anchor-marked link.
    Reconnect(PeerAddress),
    /// Make this already-connected permanent peer the anchor.
    Promote(PeerId),
}

/// Decide the reaction to `departed`, which has already been removed from `registry`.
pub fn plan_departure(
    registry: &PeerRegistry,
    departed: &PeerEntry,
    own_address: &PeerAddress,
) -> FailoverPlan {
    if departed.role != Role::Permanent || !departed.anchor || registry.anchor().is_some() {
        return FailoverPlan::Nothing;
    }
    let substitute = departed
        .substitute
        .as_ref()
        .filter(|addr| *addr != own_address);
    match substitute {
        Some(addr) => match registry.find_permanent_by_address(addr) {
            Some(existing) => FailoverPlan::Promote(existing.id),
            None => FailoverPlan::Reconnect(addr.clone()),
        },
        None => promote_earliest(registry),
    }
}

/// Earliest-registered permanent peer, if this node has no anchor.
pub fn promote_earliest(registry: &PeerRegistry) -> FailoverPlan {
    if registry.anchor().is_some() {
        return FailoverPlan::Nothing;
    }
    registry
        .permanent()
        .first()
        .map(|peer| FailoverPlan::Promote(peer.id))
        .unwrap_or(FailoverPlan::Nothing)
}

/// Type 5 notices telling every other permanent peer about `anchor`'s address.
pub fn announce(registry: &PeerRegistry, anchor: &PeerId) -> Vec<(PeerId, Message)> {
    let Some(entry) = registry.get(anchor) else {
        return Vec::new();
    };
    registry
        .permanent_ids_except(Some(anchor))
        .into_iter()
        .map(|to| (to, Message::Substitute(entry.address.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> PeerAddress {
        PeerAddress::new("127.0.0.1", port)
    }

    fn permanent(port: u16) -> PeerEntry {
        PeerEntry::new(PeerId::generate(), Role::Permanent, addr(port))
    }

    #[test]
    fn anchor_with_substitute_reconnects() {
        // A -> B (anchor, recommends C).
        let mut reg = PeerRegistry::new();
        let mut b = permanent(4001);
        b.substitute = Some(addr(4002));
        reg.insert(b.clone()).unwrap();
        reg.set_anchor(&b.id);
        reg.insert(permanent(4005)).unwrap();
        let departed = reg.remove(&b.id).unwrap();
        assert_eq!(
            plan_departure(&reg, &departed, &addr(4000)),
            FailoverPlan::Reconnect(addr(4002))
        );
    }

    #[test]
    fn anchor_without_substitute_promotes_earliest() {
        let mut reg = PeerRegistry::new();
        let first = permanent(4001);
        let anchor = permanent(4002);
        let last = permanent(4003);
        for e in [&first, &anchor, &last] {
            reg.insert(e.clone()).unwrap();
        }
        reg.set_anchor(&anchor.id);
        let departed = reg.remove(&anchor.id).unwrap();
        assert_eq!(
            plan_departure(&reg, &departed, &addr(4000)),
            FailoverPlan::Promote(first.id)
        );
    }

    #[test]
    fn anchor_alone_leaves_nothing_to_do() {
        let mut reg = PeerRegistry::new();
        let anchor = permanent(4001);
        reg.insert(anchor.clone()).unwrap();
        reg.set_anchor(&anchor.id);
        let departed = reg.remove(&anchor.id).unwrap();
        assert_eq!(
            plan_departure(&reg, &departed, &addr(4000)),
            FailoverPlan::Nothing
        );
    }

    #[test]
    fn non_anchor_departure_ignored() {
        let mut reg = PeerRegistry::new();
        let anchor = permanent(4001);
        let mut other = permanent(4002);
        other.substitute = Some(addr(4009));
        reg.insert(anchor.clone()).unwrap();
        reg.insert(other.clone()).unwrap();
        reg.set_anchor(&anchor.id);
        let departed = reg.remove(&other.id).unwrap();
        assert_eq!(
            plan_departure(&reg, &departed, &addr(4000)),
            FailoverPlan::Nothing
        );
    }

    #[test]
    fn substitute_pointing_home_counts_as_none() {
        let mut reg = PeerRegistry::new();
        let mut anchor = permanent(4001);
        anchor.substitute = Some(addr(4000));
        let other = permanent(4002);
        reg.insert(anchor.clone()).unwrap();
        reg.insert(other.clone()).unwrap();
        reg.set_anchor(&anchor.id);
        let departed = reg.remove(&anchor.id).unwrap();
        assert_eq!(
            plan_departure(&reg, &departed, &addr(4000)),
            FailoverPlan::Promote(other.id)
        );
    }

    #[test]
    fn substitute_already_connected_is_promoted() {
        let mut reg = PeerRegistry::new();
        let c = permanent(4002);
        let mut b = permanent(4001);
        b.substitute = Some(c.address.clone());
        reg.insert(b.clone()).unwrap();
        reg.insert(c.clone()).unwrap();
        reg.set_anchor(&b.id);
        let departed = reg.remove(&b.id).unwrap();
        assert_eq!(
            plan_departure(&reg, &departed, &addr(4000)),
            FailoverPlan::Promote(c.id)
        );
    }

    #[test]
    fn announce_reaches_everyone_but_the_anchor() {
        let mut reg = PeerRegistry::new();
        let a = permanent(4001);
        let b = permanent(4002);
        let c = permanent(4003);
        for e in [&a, &b, &c] {
            reg.insert(e.clone()).unwrap();
        }
        reg.insert(PeerEntry::new(
            PeerId::generate(),
            Role::DataTransfer,
            addr(4004),
        ))
        .unwrap();
        let notices = announce(&reg, &b.id);
        assert_eq!(notices.len(), 2);
        for (to, msg) in notices {
            assert_ne!(to, b.id);
            assert_eq!(msg, Message::Substitute(b.address.clone()));
        }
    }
}
