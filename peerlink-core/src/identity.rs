//! Peer and request identifiers: 128-bit values generated once and compared by value.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

/// Size in bytes of every identifier carried on the wire.
pub const ID_LEN: usize = 16;

/// Peer identifier. Generated once per process at startup and never reused.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; ID_LEN]);

/// Correlates a download's request, size notice, data chunks and completion notice.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct RequestId([u8; ID_LEN]);

macro_rules! uuid_backed {
    ($name:ident) => {
        impl $name {
            /// Fresh random identifier.
            pub fn generate() -> Self {
                $name(Uuid::new_v4().into_bytes())
            }

            pub fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
                $name(bytes)
            }

            /// Read an identifier from the first 16 bytes of `bytes`.
            pub fn from_slice(bytes: &[u8]) -> Result<Self, IdError> {
                let raw: [u8; ID_LEN] = bytes
                    .get(..ID_LEN)
                    .and_then(|b| b.try_into().ok())
                    .ok_or(IdError::Truncated(bytes.len()))?;
                Ok($name(raw))
            }

            pub fn as_bytes(&self) -> &[u8; ID_LEN] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", Uuid::from_bytes(self.0).hyphenated())
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::parse_str(s.trim()).map_err(|_| IdError::Text(s.to_string()))?;
                Ok($name(uuid.into_bytes()))
            }
        }
    };
}

uuid_backed!(PeerId);
uuid_backed!(RequestId);

#[derive(Debug, thiserror::Error)]
pub enum IdError {
    #[error("need {ID_LEN} bytes for an identifier, got {0}")]
    Truncated(usize),
    #[error("not an identifier: {0:?}")]
    Text(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_distinct() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn text_form_parses_back() {
        let id = PeerId::generate();
        let text = id.to_string();
        assert_eq!(text.len(), 36);
        assert_eq!(text.parse::<PeerId>().unwrap(), id);
    }

    #[test]
    fn from_slice_reads_prefix() {
        let id = RequestId::generate();
        let mut bytes = id.as_bytes().to_vec();
        bytes.extend_from_slice(b"trailing");
        assert_eq!(RequestId::from_slice(&bytes).unwrap(), id);
        assert!(matches!(
            RequestId::from_slice(&bytes[..10]),
            Err(IdError::Truncated(10))
        ));
    }

    #[test]
    fn garbage_text_rejected() {
        assert!("not-a-peer".parse::<PeerId>().is_err());
    }
}
