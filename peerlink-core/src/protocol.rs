//! Peer protocol: message kinds, addresses, and typed payloads over `wire::Frame`.

use std::fmt;
use std::str::FromStr;

use crate::identity::{IdError, PeerId, RequestId, ID_LEN};
use crate::search::{SearchCodecError, SearchQuery, SearchResponse};
use crate::wire::Frame;

/// Signed byte closing the initial exchange, used identically by both ends.
pub const HANDSHAKE_TERMINATOR: i8 = -127;

/// Text sent with a disconnect notice.
pub const DISCONNECT_TEXT: &str = "Client exiting";
/// Text sent with a receipt confirmation.
pub const RECEIPT_TEXT: &str = "Finished downloading";
/// Text sent with a "no substitute" notice.
pub const NO_SUBSTITUTE_TEXT: &str = "You are my primary and no other peers";

/// Type tag of every message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum MessageKind {
    PeerId = 0,
    RequestPermanent = 1,
    RequestDataTransfer = 2,
    Accepted = 3,
    Rejected = 4,
    Substitute = 5,
    NoSubstitute = 6,
    Disconnect = 7,
    DownloadAccepted = 9,
    DownloadRefused = 10,
    FileChunk = 11,
    UploadComplete = 12,
    ReceiptConfirmed = 13,
    Address = 14,
    SearchQuery = -4,
    SearchResponse = -5,
    DownloadRequest = -6,
    EndOfHandshake = HANDSHAKE_TERMINATOR,
}

impl MessageKind {
    pub fn tag(self) -> i8 {
        self as i8
    }
}

impl TryFrom<i8> for MessageKind {
    type Error = ProtocolError;

    fn try_from(tag: i8) -> Result<Self, Self::Error> {
        Ok(match tag {
            0 => MessageKind::PeerId,
            1 => MessageKind::RequestPermanent,
            2 => MessageKind::RequestDataTransfer,
            3 => MessageKind::Accepted,
            4 => MessageKind::Rejected,
            5 => MessageKind::Substitute,
            6 => MessageKind::NoSubstitute,
            7 => MessageKind::Disconnect,
            9 => MessageKind::DownloadAccepted,
            10 => MessageKind::DownloadRefused,
            11 => MessageKind::FileChunk,
            12 => MessageKind::UploadComplete,
            13 => MessageKind::ReceiptConfirmed,
            14 => MessageKind::Address,
            -4 => MessageKind::SearchQuery,
            -5 => MessageKind::SearchResponse,
            -6 => MessageKind::DownloadRequest,
            HANDSHAKE_TERMINATOR => MessageKind::EndOfHandshake,
            other => return Err(ProtocolError::UnknownKind(other)),
        })
    }
}

/// Reachable "host:port" address a peer advertises.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| AddressError(s.to_string()))?;
        // Some peers render hosts as "/127.0.0.1".
        let host = host.trim_start_matches('/');
        if host.is_empty() {
            return Err(AddressError(s.to_string()));
        }
        let port = port.parse().map_err(|_| AddressError(s.to_string()))?;
        Ok(PeerAddress::new(host, port))
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("not a host:port address: {0:?}")]
pub struct AddressError(pub String);

/// Every message of the peer protocol, with its payload decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Identify(PeerId),
    RequestPermanent,
    RequestDataTransfer,
    Accepted,
    Rejected,
    Substitute(PeerAddress),
    NoSubstitute(String),
    Disconnect(String),
    DownloadAccepted { request: RequestId, size: u64 },
    DownloadRefused { request: RequestId },
    FileChunk { request: RequestId, data: Vec<u8> },
    UploadComplete { request: RequestId },
    ReceiptConfirmed(String),
    Address(PeerAddress),
    EndOfHandshake,
    SearchQuery(SearchQuery),
    SearchResponse(SearchResponse),
    DownloadRequest { request: RequestId, filename: String },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Identify(_) => MessageKind::PeerId,
            Message::RequestPermanent => MessageKind::RequestPermanent,
            Message::RequestDataTransfer => MessageKind::RequestDataTransfer,
            Message::Accepted => MessageKind::Accepted,
            Message::Rejected => MessageKind::Rejected,
            Message::Substitute(_) => MessageKind::Substitute,
            Message::NoSubstitute(_) => MessageKind::NoSubstitute,
            Message::Disconnect(_) => MessageKind::Disconnect,
            Message::DownloadAccepted { .. } => MessageKind::DownloadAccepted,
            Message::DownloadRefused { .. } => MessageKind::DownloadRefused,
            Message::FileChunk { .. } => MessageKind::FileChunk,
            Message::UploadComplete { .. } => MessageKind::UploadComplete,
            Message::ReceiptConfirmed(_) => MessageKind::ReceiptConfirmed,
            Message::Address(_) => MessageKind::Address,
            Message::EndOfHandshake => MessageKind::EndOfHandshake,
            Message::SearchQuery(_) => MessageKind::SearchQuery,
            Message::SearchResponse(_) => MessageKind::SearchResponse,
            Message::DownloadRequest { .. } => MessageKind::DownloadRequest,
        }
    }

    /// Encode the payload and wrap it in a frame.
    pub fn to_frame(&self) -> Frame {
        let payload = match self {
            Message::Identify(id) => id.to_string().into_bytes(),
            Message::RequestPermanent
            | Message::RequestDataTransfer
            | Message::Accepted
            | Message::Rejected
            | Message::EndOfHandshake => Vec::new(),
            Message::Substitute(addr) | Message::Address(addr) => addr.to_string().into_bytes(),
            Message::NoSubstitute(text)
            | Message::Disconnect(text)
            | Message::ReceiptConfirmed(text) => text.clone().into_bytes(),
            Message::DownloadAccepted { request, size } => {
                let mut out = request.as_bytes().to_vec();
                out.extend_from_slice(&size.to_be_bytes());
                out
            }
            Message::DownloadRefused { request } | Message::UploadComplete { request } => {
                request.as_bytes().to_vec()
            }
            Message::FileChunk { request, data } => {
                let mut out = Vec::with_capacity(ID_LEN + data.len());
                out.extend_from_slice(request.as_bytes());
                out.extend_from_slice(data);
                out
            }
            Message::SearchQuery(query) => query.encode(),
            Message::SearchResponse(response) => response.encode(),
            Message::DownloadRequest { request, filename } => {
                let mut out = request.as_bytes().to_vec();
                out.extend_from_slice(filename.as_bytes());
                out
            }
        };
        Frame::new(self.kind().tag(), payload)
    }

    /// Decode a frame's payload according to its type tag.
    pub fn from_frame(frame: &Frame) -> Result<Message, ProtocolError> {
        let kind = MessageKind::try_from(frame.kind)?;
        let payload = frame.payload.as_slice();
        let text = || {
            String::from_utf8(payload.to_vec()).map_err(|_| ProtocolError::Utf8(kind))
        };
        let request = || {
            RequestId::from_slice(payload).map_err(|source| ProtocolError::Id { kind, source })
        };
        let msg = match kind {
            MessageKind::PeerId => {
                let id = text()?
                    .parse::<PeerId>()
                    .map_err(|source| ProtocolError::Id { kind, source })?;
                Message::Identify(id)
            }
            MessageKind::RequestPermanent => Message::RequestPermanent,
            MessageKind::RequestDataTransfer => Message::RequestDataTransfer,
            MessageKind::Accepted => Message::Accepted,
            MessageKind::Rejected => Message::Rejected,
            MessageKind::Substitute => Message::Substitute(text()?.parse()?),
            MessageKind::NoSubstitute => Message::NoSubstitute(text()?),
            MessageKind::Disconnect => Message::Disconnect(text()?),
            MessageKind::DownloadAccepted => {
                let size: [u8; 8] = payload
                    .get(ID_LEN..ID_LEN + 8)
                    .and_then(|b| b.try_into().ok())
                    .ok_or(ProtocolError::Truncated {
                        kind,
                        needed: ID_LEN + 8,
                        got: payload.len(),
                    })?;
                Message::DownloadAccepted {
                    request: request()?,
                    size: u64::from_be_bytes(size),
                }
            }
            MessageKind::DownloadRefused => Message::DownloadRefused {
                request: request()?,
            },
            MessageKind::FileChunk => Message::FileChunk {
                request: request()?,
                data: payload[ID_LEN..].to_vec(),
            },
            MessageKind::UploadComplete => Message::UploadComplete {
                request: request()?,
            },
            MessageKind::ReceiptConfirmed => Message::ReceiptConfirmed(text()?),
            MessageKind::Address => Message::Address(text()?.parse()?),
            MessageKind::EndOfHandshake => Message::EndOfHandshake,
            MessageKind::SearchQuery => Message::SearchQuery(SearchQuery::decode(payload)?),
            MessageKind::SearchResponse => {
                Message::SearchResponse(SearchResponse::decode(payload)?)
            }
            MessageKind::DownloadRequest => {
                let request = request()?;
                let filename = String::from_utf8(payload[ID_LEN..].to_vec())
                    .map_err(|_| ProtocolError::Utf8(kind))?;
                Message::DownloadRequest { request, filename }
            }
        };
        Ok(msg)
    }
}

impl From<Message> for Frame {
    fn from(msg: Message) -> Frame {
        msg.to_frame()
    }
}

/// Error interpreting a frame's payload.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown message type {0}")]
    UnknownKind(i8),
    #[error("{kind:?} payload needs {needed} bytes, got {got}")]
    Truncated {
        kind: MessageKind,
        needed: usize,
        got: usize,
    },
    #[error("{0:?} payload is not valid UTF-8")]
    Utf8(MessageKind),
    #[error("{kind:?} payload carries a bad identifier: {source}")]
    Id { kind: MessageKind, source: IdError },
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error(transparent)]
    Search(#[from] SearchCodecError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_tag_maps_back() {
        for tag in i8::MIN..=i8::MAX {
            if let Ok(kind) = MessageKind::try_from(tag) {
                assert_eq!(kind.tag(), tag);
            }
        }
        assert!(matches!(
            MessageKind::try_from(8),
            Err(ProtocolError::UnknownKind(8))
        ));
        assert_eq!(MessageKind::EndOfHandshake.tag(), -127);
    }

    #[test]
    fn address_parsing() {
        let addr: PeerAddress = "/127.0.0.1:4000".parse().unwrap();
        assert_eq!(addr, PeerAddress::new("127.0.0.1", 4000));
        assert_eq!(addr.to_string(), "127.0.0.1:4000");
        assert!("127.0.0.1".parse::<PeerAddress>().is_err());
        assert!(":4000".parse::<PeerAddress>().is_err());
        assert!("host:port".parse::<PeerAddress>().is_err());
    }

    #[test]
    fn identify_payload_is_uuid_text() {
        let id = PeerId::generate();
        let frame = Message::Identify(id).to_frame();
        assert_eq!(frame.kind, 0);
        assert_eq!(frame.payload, id.to_string().into_bytes());
        assert_eq!(Message::from_frame(&frame).unwrap(), Message::Identify(id));
    }

    #[test]
    fn download_accepted_layout() {
        let request = RequestId::generate();
        let frame = Message::DownloadAccepted {
            request,
            size: 0x0102,
        }
        .to_frame();
        assert_eq!(frame.kind, 9);
        assert_eq!(frame.payload.len(), 24);
        assert_eq!(&frame.payload[16..], &[0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(
            Message::from_frame(&frame).unwrap(),
            Message::DownloadAccepted { request, size: 258 }
        );
    }

    #[test]
    fn chunk_and_request_split_on_id() {
        let request = RequestId::generate();
        let chunk = Message::FileChunk {
            request,
            data: b"payload".to_vec(),
        };
        assert_eq!(Message::from_frame(&chunk.to_frame()).unwrap(), chunk);

        let download = Message::DownloadRequest {
            request,
            filename: "report.pdf".into(),
        };
        let frame = download.to_frame();
        assert_eq!(frame.kind, -6);
        assert_eq!(&frame.payload[16..], b"report.pdf");
        assert_eq!(Message::from_frame(&frame).unwrap(), download);
    }

    #[test]
    fn short_payloads_are_errors() {
        let frame = Frame::new(MessageKind::DownloadAccepted.tag(), vec![0u8; 20]);
        assert!(matches!(
            Message::from_frame(&frame),
            Err(ProtocolError::Truncated { needed: 24, .. })
        ));
        let frame = Frame::new(MessageKind::UploadComplete.tag(), vec![0u8; 3]);
        assert!(matches!(
            Message::from_frame(&frame),
            Err(ProtocolError::Id { .. })
        ));
        let frame = Frame::new(MessageKind::Substitute.tag(), b"nowhere".to_vec());
        assert!(matches!(
            Message::from_frame(&frame),
            Err(ProtocolError::Address(_))
        ));
    }
}
