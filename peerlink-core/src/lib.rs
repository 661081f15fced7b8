//! peerlink peer protocol engine.
//! Host-driven: no I/O; host passes frames and link events and receives actions.

pub mod engine;
pub mod failover;
pub mod handshake;
pub mod identity;
pub mod protocol;
pub mod registry;
pub mod search;
pub mod transfer;
pub mod wire;

pub use engine::{Action, Admission, ConnectPurpose, Engine, Notice, Origin, PendingMessage};
pub use identity::{PeerId, RequestId};
pub use protocol::{Message, MessageKind, PeerAddress, HANDSHAKE_TERMINATOR};
pub use wire::{decode_frame, encode_frame, Frame, FrameDecodeError, FrameEncodeError};
