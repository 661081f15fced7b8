//! Search propagation: bounded-depth query flooding and the return-path response protocol.
//!
//! A query carries the propagation history (peer ids it has traversed, origin first). Each hop
//! appends itself before forwarding; a responder strips the last id (the peer it heard the query
//! from) and sends its answer back to that peer, and every relay strips one more id until the
//! history is empty at the origin.

use crate::identity::{PeerId, ID_LEN};
use crate::protocol::{AddressError, PeerAddress};

/// Queries that have already traversed this many hops are dropped.
pub const MAX_HISTORY_HOPS: usize = 6;
/// History size in bytes at which a query is no longer processed.
pub const MAX_HISTORY_BYTES: usize = MAX_HISTORY_HOPS * ID_LEN;
/// Separator between filenames in a response; illegal inside a filename.
pub const FILE_SEPARATOR: char = '/';

/// Ids that fit behind the one-byte history length.
const MAX_ENCODABLE_HOPS: usize = u8::MAX as usize / ID_LEN;

/// Ordered peer ids a query has traversed so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropagationHistory(Vec<PeerId>);

impl PropagationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hops(&self) -> &[PeerId] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.0.contains(id)
    }

    /// Length as carried in the leading history byte.
    pub fn byte_len(&self) -> usize {
        self.0.len() * ID_LEN
    }

    /// True once the depth cap is reached.
    pub fn is_exhausted(&self) -> bool {
        self.byte_len() >= MAX_HISTORY_BYTES
    }

    /// Copy of this history with `id` appended.
    pub fn with_hop(&self, id: PeerId) -> Result<Self, SearchCodecError> {
        if self.0.len() >= MAX_ENCODABLE_HOPS {
            return Err(SearchCodecError::HistoryFull);
        }
        let mut hops = self.0.clone();
        hops.push(id);
        Ok(Self(hops))
    }

    /// Split off the last hop.
    pub fn split_last(&self) -> Option<(PeerId, Self)> {
        let (last, rest) = self.0.split_last()?;
        Some((*last, Self(rest.to_vec())))
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        // `with_hop` and `decode` keep the length within a byte.
        out.push(self.byte_len() as u8);
        for id in &self.0 {
            out.extend_from_slice(id.as_bytes());
        }
    }

    /// Decode the leading history; returns it and the bytes consumed.
    fn decode(bytes: &[u8]) -> Result<(Self, usize), SearchCodecError> {
        let len = *bytes.first().ok_or(SearchCodecError::Empty)? as usize;
        if len % ID_LEN != 0 {
            return Err(SearchCodecError::HistoryLength(len));
        }
        let raw = bytes
            .get(1..1 + len)
            .ok_or(SearchCodecError::Truncated {
                needed: 1 + len,
                got: bytes.len(),
            })?;
        let hops = raw
            .chunks_exact(ID_LEN)
            .map(PeerId::from_slice)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| SearchCodecError::HistoryLength(len))?;
        Ok((Self(hops), 1 + len))
    }
}

impl From<Vec<PeerId>> for PropagationHistory {
    fn from(hops: Vec<PeerId>) -> Self {
        Self(hops)
    }
}

/// Type -4 payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub history: PropagationHistory,
    pub term: String,
}

impl SearchQuery {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.history.byte_len() + self.term.len());
        self.history.encode_into(&mut out);
        out.extend_from_slice(self.term.as_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SearchCodecError> {
        let (history, used) = PropagationHistory::decode(bytes)?;
        let term = std::str::from_utf8(&bytes[used..])
            .map_err(|_| SearchCodecError::Utf8)?
            .to_string();
        Ok(Self { history, term })
    }
}

/// Type -5 payload: return path plus the responder's offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    pub history: PropagationHistory,
    responder_address: PeerAddress,
    pub responder: PeerId,
    pub files: Vec<String>,
}

impl SearchResponse {
    pub fn new(
        history: PropagationHistory,
        responder_address: PeerAddress,
        responder: PeerId,
        files: Vec<String>,
    ) -> Result<Self, SearchCodecError> {
        let len = responder_address.to_string().len();
        if len > u8::MAX as usize {
            return Err(SearchCodecError::AddressTooLong(len));
        }
        Ok(Self {
            history,
            responder_address,
            responder,
            files,
        })
    }

    pub fn responder_address(&self) -> &PeerAddress {
        &self.responder_address
    }

    pub fn encode(&self) -> Vec<u8> {
        let address = self.responder_address.to_string();
        let files = self.files.join(&FILE_SEPARATOR.to_string());
        let mut out =
            Vec::with_capacity(2 + self.history.byte_len() + address.len() + ID_LEN + files.len());
        self.history.encode_into(&mut out);
        // Checked against the byte limit in `new`.
        out.push(address.len() as u8);
        out.extend_from_slice(address.as_bytes());
        out.extend_from_slice(self.responder.as_bytes());
        out.extend_from_slice(files.as_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SearchCodecError> {
        let (history, mut at) = PropagationHistory::decode(bytes)?;
        let addr_len = *bytes.get(at).ok_or(SearchCodecError::Truncated {
            needed: at + 1,
            got: bytes.len(),
        })? as usize;
        at += 1;
        let needed = at + addr_len + ID_LEN;
        if bytes.len() < needed {
            return Err(SearchCodecError::Truncated {
                needed,
                got: bytes.len(),
            });
        }
        let address = std::str::from_utf8(&bytes[at..at + addr_len])
            .map_err(|_| SearchCodecError::Utf8)?
            .parse::<PeerAddress>()?;
        at += addr_len;
        let responder =
            PeerId::from_slice(&bytes[at..]).map_err(|_| SearchCodecError::Truncated {
                needed,
                got: bytes.len(),
            })?;
        at += ID_LEN;
        let files = std::str::from_utf8(&bytes[at..])
            .map_err(|_| SearchCodecError::Utf8)?
            .split(FILE_SEPARATOR)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        Ok(Self {
            history,
            responder_address: address,
            responder,
            files,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SearchCodecError {
    #[error("empty search payload")]
    Empty,
    #[error("history length {0} is not a whole number of peer ids")]
    HistoryLength(usize),
    #[error("search payload needs {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },
    #[error("search payload is not valid UTF-8")]
    Utf8,
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error("responder address of {0} bytes does not fit its length byte")]
    AddressTooLong(usize),
    #[error("history cannot hold another hop")]
    HistoryFull,
}

/// One responder's answer as accumulated by the node that started the search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResult {
    pub address: PeerAddress,
    pub responder: PeerId,
    pub files: Vec<String>,
}

/// Local-files collaborator consulted to answer queries.
pub trait FileLister: Send {
    /// Names of shareable files containing `term`, case-insensitively. Never fails; an
    /// unreadable location yields an empty list.
    fn matching(&self, term: &str) -> Vec<String>;
}

impl<F> FileLister for F
where
    F: Fn(&str) -> Vec<String> + Send,
{
    fn matching(&self, term: &str) -> Vec<String> {
        self(term)
    }
}

/// The query this node floods when its user starts a search.
pub fn originate(own_id: PeerId, term: &str) -> SearchQuery {
    SearchQuery {
        history: PropagationHistory(vec![own_id]),
        term: term.to_string(),
    }
}

/// What to do with a received query.
#[derive(Debug, Default)]
pub struct QueryOutcome {
    /// Query to send to every permanent peer except the one it arrived from.
    pub forward: Option<SearchQuery>,
    /// Answer to send back to the peer it arrived from.
    pub reply: Option<SearchResponse>,
}

/// Process a query received from a peer.
pub fn handle_query(
    own_id: PeerId,
    own_address: &PeerAddress,
    query: &SearchQuery,
    lister: &dyn FileLister,
) -> QueryOutcome {
    let history = &query.history;
    if history.is_exhausted() || history.contains(&own_id) {
        return QueryOutcome::default();
    }
    let forward = history.with_hop(own_id).ok().map(|history| SearchQuery {
        history,
        term: query.term.clone(),
    });

    let reply = match history.split_last() {
        Some((_sender, return_path)) => {
            let files = lister.matching(&query.term);
            if files.is_empty() {
                None
            } else {
                match SearchResponse::new(return_path, own_address.clone(), own_id, files) {
                    Ok(reply) => Some(reply),
                    Err(e) => {
                        tracing::warn!(error = %e, "cannot answer search");
                        None
                    }
                }
            }
        }
        None => None,
    };
    QueryOutcome { forward, reply }
}

/// What to do with a received response.
#[derive(Debug)]
pub enum ResponseOutcome {
    /// Pass the unwrapped response on to `next_hop`.
    Relay {
        next_hop: PeerId,
        response: SearchResponse,
    },
    /// This node started the search.
    Deliver(SearchResult),
}

pub fn handle_response(response: SearchResponse) -> ResponseOutcome {
    match response.history.split_last() {
        Some((next_hop, rest)) => ResponseOutcome::Relay {
            next_hop,
            response: SearchResponse {
                history: rest,
                ..response
            },
        },
        None => ResponseOutcome::Deliver(SearchResult {
            address: response.responder_address,
            responder: response.responder,
            files: response.files,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> PeerAddress {
        PeerAddress::new("127.0.0.1", port)
    }

    fn lister_with(files: &'static [&'static str]) -> impl FileLister {
        move |term: &str| {
            files
                .iter()
                .filter(|f| f.to_lowercase().contains(&term.to_lowercase()))
                .map(|f| f.to_string())
                .collect::<Vec<_>>()
        }
    }

    fn no_files() -> impl FileLister {
        |_: &str| Vec::<String>::new()
    }

    #[test]
    fn query_wire_layout() {
        let origin = PeerId::generate();
        let bytes = originate(origin, "report").encode();
        assert_eq!(bytes[0], 16);
        assert_eq!(&bytes[1..17], origin.as_bytes());
        assert_eq!(&bytes[17..], b"report");
        let decoded = SearchQuery::decode(&bytes).unwrap();
        assert_eq!(decoded.history.hops(), &[origin]);
        assert_eq!(decoded.term, "report");
    }

    #[test]
    fn response_wire_layout() {
        let hop = PeerId::generate();
        let responder = PeerId::generate();
        let response = SearchResponse::new(
            vec![hop].into(),
            addr(4003),
            responder,
            vec!["a.txt".into(), "b.txt".into()],
        )
        .unwrap();
        let bytes = response.encode();
        assert_eq!(bytes[0], 16);
        assert_eq!(bytes[17] as usize, "127.0.0.1:4003".len());
        assert_eq!(&bytes[18..32], b"127.0.0.1:4003");
        assert_eq!(&bytes[32..48], responder.as_bytes());
        assert_eq!(&bytes[48..], b"a.txt/b.txt");
        assert_eq!(SearchResponse::decode(&bytes).unwrap(), response);
    }

    #[test]
    fn malformed_history_rejected() {
        assert!(matches!(
            SearchQuery::decode(&[5, 1, 2, 3, 4, 5]),
            Err(SearchCodecError::HistoryLength(5))
        ));
        assert!(matches!(
            SearchQuery::decode(&[32, 0, 0]),
            Err(SearchCodecError::Truncated { .. })
        ));
        assert!(matches!(
            SearchQuery::decode(&[]),
            Err(SearchCodecError::Empty)
        ));
    }

    #[test]
    fn query_forwarded_with_own_id_appended() {
        let origin = PeerId::generate();
        let me = PeerId::generate();
        let out = handle_query(me, &addr(1), &originate(origin, "x"), &no_files());
        let forward = out.forward.unwrap();
        assert_eq!(forward.history.hops(), &[origin, me]);
        assert_eq!(forward.history.byte_len(), 32);
        assert!(out.reply.is_none());
    }

    #[test]
    fn depth_cap_blocks_forward_and_answer() {
        let hops: Vec<PeerId> = (0..MAX_HISTORY_HOPS).map(|_| PeerId::generate()).collect();
        let query = SearchQuery {
            history: hops.into(),
            term: "report".into(),
        };
        assert_eq!(query.history.byte_len(), 96);
        let out = handle_query(
            PeerId::generate(),
            &addr(1),
            &query,
            &lister_with(&["report.pdf"]),
        );
        assert!(out.forward.is_none());
        assert!(out.reply.is_none());
    }

    #[test]
    fn five_hops_still_processed() {
        let hops: Vec<PeerId> = (0..5).map(|_| PeerId::generate()).collect();
        let query = SearchQuery {
            history: hops.into(),
            term: "report".into(),
        };
        let out = handle_query(
            PeerId::generate(),
            &addr(1),
            &query,
            &lister_with(&["report.pdf"]),
        );
        assert_eq!(out.forward.unwrap().history.byte_len(), 96);
        assert!(out.reply.is_some());
    }

    #[test]
    fn query_seen_before_is_dropped() {
        let me = PeerId::generate();
        let query = SearchQuery {
            history: vec![me, PeerId::generate()].into(),
            term: "report".into(),
        };
        let out = handle_query(me, &addr(1), &query, &lister_with(&["report.pdf"]));
        assert!(out.forward.is_none());
        assert!(out.reply.is_none());
    }

    #[test]
    fn empty_history_never_answered() {
        let query = SearchQuery {
            history: PropagationHistory::new(),
            term: "report".into(),
        };
        let out = handle_query(
            PeerId::generate(),
            &addr(1),
            &query,
            &lister_with(&["report.pdf"]),
        );
        assert!(out.reply.is_none());
        assert!(out.forward.is_some());
    }

    #[test]
    fn three_hop_round_trip() {
        let (origin, n1, n2, n3) = (
            PeerId::generate(),
            PeerId::generate(),
            PeerId::generate(),
            PeerId::generate(),
        );
        let none = no_files();
        let q1 = originate(origin, "report");
        let q2 = handle_query(n1, &addr(4001), &q1, &none).forward.unwrap();
        let q3 = handle_query(n2, &addr(4002), &q2, &none).forward.unwrap();
        let out = handle_query(n3, &addr(4003), &q3, &lister_with(&["report.pdf", "notes"]));
        let reply = out.reply.unwrap();
        assert_eq!(reply.history.hops(), &[origin, n1]);

        // Through the wire at every hop.
        let reply = SearchResponse::decode(&reply.encode()).unwrap();
        let (to, reply) = match handle_response(reply) {
            ResponseOutcome::Relay { next_hop, response } => (next_hop, response),
            other => panic!("expected relay, got {other:?}"),
        };
        assert_eq!(to, n1);
        assert_eq!(reply.history.byte_len(), 16);

        let reply = SearchResponse::decode(&reply.encode()).unwrap();
        let (to, reply) = match handle_response(reply) {
            ResponseOutcome::Relay { next_hop, response } => (next_hop, response),
            other => panic!("expected relay, got {other:?}"),
        };
        assert_eq!(to, origin);
        assert!(reply.history.is_empty());

        match handle_response(SearchResponse::decode(&reply.encode()).unwrap()) {
            ResponseOutcome::Deliver(result) => {
                assert_eq!(result.address, addr(4003));
                assert_eq!(result.responder, n3);
                assert_eq!(result.files, vec!["report.pdf".to_string()]);
            }
            other => panic!("expected delivery, got {other:?}"),
        }
    }

    #[test]
    fn oversized_address_refused() {
        let host = "h".repeat(300);
        assert!(matches!(
            SearchResponse::new(
                PropagationHistory::new(),
                PeerAddress::new(host, 1),
                PeerId::generate(),
                vec!["a".into()]
            ),
            Err(SearchCodecError::AddressTooLong(_))
        ));
    }
}
