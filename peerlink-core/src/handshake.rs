//! Connection handshake as two sans-IO state machines.
//!
//! The host writes the messages each side produces and feeds every received message back in,
//! until the side reports an established peer or an error.

use crate::identity::PeerId;
use crate::protocol::{Message, MessageKind, PeerAddress};
use crate::registry::{PeerEntry, Recommendation, Role};

/// Outcome of a successful handshake, from the point of view of the local side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstablishedPeer {
    pub id: PeerId,
    pub role: Role,
    pub address: PeerAddress,
    /// Substitute the remote side recommended (initiator side, permanent links only).
    pub substitute: Option<PeerAddress>,
}

impl EstablishedPeer {
    pub fn into_entry(self) -> PeerEntry {
        PeerEntry {
            id: self.id,
            role: self.role,
            anchor: false,
            address: self.address,
            substitute: self.substitute,
        }
    }
}

fn intent_message(role: Role) -> Message {
    match role {
        Role::Permanent => Message::RequestPermanent,
        Role::DataTransfer => Message::RequestDataTransfer,
    }
}

/// Outbound side: announces itself and its intent, then collects the acceptor's answer.
#[derive(Debug)]
pub struct Initiator {
    own_id: PeerId,
    own_address: PeerAddress,
    intent: Role,
    dialed: PeerAddress,
    peer_id: Option<PeerId>,
    accepted: bool,
    substitute: Option<PeerAddress>,
    address: Option<PeerAddress>,
}

impl Initiator {
    pub fn new(own_id: PeerId, own_address: PeerAddress, intent: Role, dialed: PeerAddress) -> Self {
        Self {
            own_id,
            own_address,
            intent,
            dialed,
            peer_id: None,
            accepted: false,
            substitute: None,
            address: None,
        }
    }

    /// Identifier, intent, own address, terminator.
    pub fn opening(&self) -> Vec<Message> {
        vec![
            Message::Identify(self.own_id),
            intent_message(self.intent),
            Message::Address(self.own_address.clone()),
            Message::EndOfHandshake,
        ]
    }

    /// Feed one received message. `Ok(Some(_))` once the acceptor's terminator arrives.
    pub fn on_message(&mut self, msg: Message) -> Result<Option<EstablishedPeer>, HandshakeError> {
        match msg {
            Message::Identify(id) => self.peer_id = Some(id),
            Message::Accepted => self.accepted = true,
            Message::Rejected => return Err(HandshakeError::Rejected),
            Message::Substitute(addr) => self.substitute = Some(addr),
            Message::NoSubstitute(_) => self.substitute = None,
            Message::Address(addr) => self.address = Some(addr),
            Message::EndOfHandshake => return self.finish().map(Some),
            other => return Err(HandshakeError::Unexpected(other.kind())),
        }
        Ok(None)
    }

    fn finish(&mut self) -> Result<EstablishedPeer, HandshakeError> {
        let id = self.peer_id.ok_or(HandshakeError::MissingId)?;
        if id == self.own_id {
            return Err(HandshakeError::SelfConnection);
        }
        if !self.accepted {
            return Err(HandshakeError::NotAccepted);
        }
        let address = self.address.take().unwrap_or_else(|| self.dialed.clone());
        let substitute = match self.intent {
            Role::Permanent => self.substitute.take(),
            Role::DataTransfer => None,
        };
        Ok(EstablishedPeer {
            id,
            role: self.intent,
            address,
            substitute,
        })
    }
}

/// Inbound side: identifies itself at once, then waits for the initiator's request.
#[derive(Debug)]
pub struct Acceptor {
    own_id: PeerId,
    own_address: PeerAddress,
    peer_id: Option<PeerId>,
    intent: Option<Role>,
    address: Option<PeerAddress>,
}

/// What the initiator asked for, pending this node's reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRequest {
    pub id: PeerId,
    pub role: Role,
    pub address: PeerAddress,
    own_address: PeerAddress,
}

impl InboundRequest {
    /// Messages accepting the request, plus the established peer.
    /// `recommendation` is only consulted for permanent links.
    pub fn accept(self, recommendation: Recommendation) -> (Vec<Message>, EstablishedPeer) {
        let messages = match self.role {
            Role::Permanent => vec![
                Message::Accepted,
                recommendation.to_message(),
                Message::Address(self.own_address),
                Message::EndOfHandshake,
            ],
            Role::DataTransfer => vec![Message::Accepted, Message::EndOfHandshake],
        };
        let peer = EstablishedPeer {
            id: self.id,
            role: self.role,
            address: self.address,
            substitute: None,
        };
        (messages, peer)
    }
}

impl Acceptor {
    pub fn new(own_id: PeerId, own_address: PeerAddress) -> Self {
        Self {
            own_id,
            own_address,
            peer_id: None,
            intent: None,
            address: None,
        }
    }

    /// Sent immediately on accept.
    pub fn opening(&self) -> Vec<Message> {
        vec![Message::Identify(self.own_id)]
    }

    /// Reply to send before closing a request that cannot be accepted.
    pub fn rejection() -> Vec<Message> {
        vec![Message::Rejected, Message::EndOfHandshake]
    }

    /// Feed one received message. `Ok(Some(_))` once the initiator's terminator arrives.
    pub fn on_message(&mut self, msg: Message) -> Result<Option<InboundRequest>, HandshakeError> {
        match msg {
            Message::Identify(id) => self.peer_id = Some(id),
            Message::RequestPermanent => self.intent = Some(Role::Permanent),
            Message::RequestDataTransfer => self.intent = Some(Role::DataTransfer),
            Message::Address(addr) => self.address = Some(addr),
            Message::EndOfHandshake => return self.finish().map(Some),
            other => return Err(HandshakeError::Unexpected(other.kind())),
        }
        Ok(None)
    }

    fn finish(&mut self) -> Result<InboundRequest, HandshakeError> {
        let id = self.peer_id.ok_or(HandshakeError::MissingId)?;
        if id == self.own_id {
            return Err(HandshakeError::SelfConnection);
        }
        let role = self.intent.ok_or(HandshakeError::MissingIntent)?;
        let address = self.address.take().ok_or(HandshakeError::MissingAddress)?;
        Ok(InboundRequest {
            id,
            role,
            address,
            own_address: self.own_address.clone(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("peer rejected the connection")]
    Rejected,
    #[error("handshake ended without acceptance")]
    NotAccepted,
    #[error("handshake ended without a peer identifier")]
    MissingId,
    #[error("handshake ended without an intent")]
    MissingIntent,
    #[error("handshake ended without a reachable address")]
    MissingAddress,
    #[error("connected to ourselves")]
    SelfConnection,
    #[error("unexpected {0:?} during handshake")]
    Unexpected(MessageKind),
    #[error("connection closed during handshake")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] crate::protocol::ProtocolError),
}
