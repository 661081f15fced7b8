//! Outstanding downloads, keyed by request id.
//!
//! The dispatcher is the only inserter and remover. Read loops look entries up to append chunks,
//! so the table sits on a concurrent map and the sink is opened lazily by the first chunk.

use std::io::{self, Write};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::identity::{PeerId, RequestId};

/// One download this node asked for.
#[derive(Debug)]
pub struct FileTransferRequest<S> {
    pub id: RequestId,
    pub filename: String,
    /// Peer the file is coming from.
    pub source: PeerId,
    /// Filled in by the sender's type 9.
    pub declared_size: Option<u64>,
    pub received: u64,
    sink: Option<S>,
}

impl<S> FileTransferRequest<S> {
    pub fn new(id: RequestId, filename: impl Into<String>, source: PeerId) -> Self {
        Self {
            id,
            filename: filename.into(),
            source,
            declared_size: None,
            received: 0,
            sink: None,
        }
    }

    /// Take the destination sink, if any chunk opened one.
    pub fn into_sink(self) -> Option<S> {
        self.sink
    }
}

/// Where a download stands after a chunk was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    pub received: u64,
    pub declared: Option<u64>,
}

impl ChunkProgress {
    /// Percentage received, when the size is known.
    pub fn percent(&self) -> Option<u64> {
        match self.declared {
            Some(0) => Some(100),
            Some(total) => Some(self.received.saturating_mul(100) / total),
            None => None,
        }
    }
}

#[derive(Debug)]
pub struct TransferTable<S> {
    requests: DashMap<RequestId, FileTransferRequest<S>>,
}

impl<S> Default for TransferTable<S> {
    fn default() -> Self {
        Self {
            requests: DashMap::new(),
        }
    }
}

impl<S> TransferTable<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, request: FileTransferRequest<S>) {
        self.requests.insert(request.id, request);
    }

    pub fn remove(&self, id: &RequestId) -> Option<FileTransferRequest<S>> {
        self.requests.remove(id).map(|(_, req)| req)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn source_of(&self, id: &RequestId) -> Option<PeerId> {
        self.requests.get(id).map(|req| req.source)
    }

    /// True while any download from `peer` is outstanding.
    pub fn has_source(&self, peer: &PeerId) -> bool {
        self.requests.iter().any(|entry| entry.source == *peer)
    }

    /// Record the size the sender announced. False if the request is unknown.
    pub fn set_declared_size(&self, id: &RequestId, size: u64) -> bool {
        match self.requests.get_mut(id) {
            Some(mut req) => {
                req.declared_size = Some(size);
                true
            }
            None => false,
        }
    }

    /// Remove every request sourced from `peer`.
    pub fn abandon_from(&self, peer: &PeerId) -> Vec<FileTransferRequest<S>> {
        let ids: Vec<RequestId> = self
            .requests
            .iter()
            .filter(|entry| entry.source == *peer)
            .map(|entry| *entry.key())
            .collect();
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }
}

impl<S: Write> TransferTable<S> {
    /// Append one chunk to its request's sink, opening the sink on first use.
    /// `open` receives the requested filename. The entry is not locked while the sink is opened
    /// or written; chunks of one request arrive from a single read loop.
    pub fn receive_chunk<F>(
        &self,
        id: &RequestId,
        data: &[u8],
        open: F,
    ) -> Result<ChunkProgress, TransferError>
    where
        F: FnOnce(&str) -> io::Result<S>,
    {
        let (taken, received) = {
            let mut req = self
                .requests
                .get_mut(id)
                .ok_or(TransferError::UnknownRequest(*id))?;
            let received = req.received.saturating_add(data.len() as u64);
            if let Some(declared) = req.declared_size {
                if received > declared {
                    return Err(TransferError::Overrun {
                        request: *id,
                        declared,
                        received,
                    });
                }
            }
            let taken = req.sink.take().ok_or_else(|| req.filename.clone());
            (taken, received)
        };
        let mut sink = match taken {
            Ok(sink) => sink,
            Err(filename) => open(&filename).map_err(|source| TransferError::Io {
                request: *id,
                source,
            })?,
        };
        let written = sink.write_all(data);

        // Removed meanwhile (peer evicted): the sink is dropped with it.
        let mut req = self
            .requests
            .get_mut(id)
            .ok_or(TransferError::UnknownRequest(*id))?;
        req.sink = Some(sink);
        written.map_err(|source| TransferError::Io {
            request: *id,
            source,
        })?;
        req.received = received;
        Ok(ChunkProgress {
            received,
            declared: req.declared_size,
        })
    }
}

/// Uploads this node is serving, counted per receiving peer.
#[derive(Debug, Default)]
pub struct UploadTable {
    active: DashMap<PeerId, usize>,
}

impl UploadTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one upload to `peer` until the returned guard is dropped.
    pub fn begin(self: &Arc<Self>, peer: PeerId) -> UploadGuard {
        *self.active.entry(peer).or_insert(0) += 1;
        UploadGuard {
            table: Arc::clone(self),
            peer,
        }
    }

    pub fn active_for(&self, peer: &PeerId) -> usize {
        self.active.get(peer).map_or(0, |n| *n)
    }

    fn end(&self, peer: &PeerId) {
        if let Entry::Occupied(mut entry) = self.active.entry(*peer) {
            let left = entry.get().saturating_sub(1);
            if left == 0 {
                entry.remove();
            } else {
                *entry.get_mut() = left;
            }
        }
    }
}

/// One upload in flight; dropping it ends the count.
#[derive(Debug)]
pub struct UploadGuard {
    table: Arc<UploadTable>,
    peer: PeerId,
}

impl Drop for UploadGuard {
    fn drop(&mut self) {
        self.table.end(&self.peer);
    }
}

/// Filename used when `name` already exists locally: the request id goes before the extension.
pub fn disambiguated_name(name: &str, id: &RequestId) -> String {
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{}-{}{}", &name[..dot], id, &name[dot..]),
        _ => format!("{name}-{id}"),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("no outstanding download for request {0}")]
    UnknownRequest(RequestId),
    #[error("request {request} received {received} bytes but {declared} were declared")]
    Overrun {
        request: RequestId,
        declared: u64,
        received: u64,
    },
    #[error("request {request}: {source}")]
    Io {
        request: RequestId,
        #[source]
        source: io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(source: PeerId) -> (TransferTable<Vec<u8>>, RequestId) {
        let table = TransferTable::new();
        let id = RequestId::generate();
        table.insert(FileTransferRequest::new(id, "report.pdf", source));
        (table, id)
    }

    #[test]
    fn chunks_append_in_order() {
        let (table, id) = table_with(PeerId::generate());
        let mut opened = 0;
        let p = table
            .receive_chunk(&id, b"hello ", |name| {
                assert_eq!(name, "report.pdf");
                opened += 1;
                Ok(Vec::new())
            })
            .unwrap();
        assert_eq!(p.received, 6);
        assert_eq!(p.percent(), None);
        assert!(table.set_declared_size(&id, 11));
        let p = table
            .receive_chunk(&id, b"world", |_| panic!("sink reopened"))
            .unwrap();
        assert_eq!(p.percent(), Some(100));
        assert_eq!(opened, 1);
        let req = table.remove(&id).unwrap();
        assert_eq!(req.received, 11);
        assert_eq!(req.into_sink().unwrap(), b"hello world");
        assert!(table.is_empty());
    }

    #[test]
    fn unknown_request_is_an_error_not_a_panic() {
        let table: TransferTable<Vec<u8>> = TransferTable::new();
        let id = RequestId::generate();
        assert!(matches!(
            table.receive_chunk(&id, b"x", |_| Ok(Vec::new())),
            Err(TransferError::UnknownRequest(_))
        ));
        assert!(!table.set_declared_size(&id, 1));
    }

    #[test]
    fn overrun_rejected() {
        let (table, id) = table_with(PeerId::generate());
        table.set_declared_size(&id, 2);
        assert!(matches!(
            table.receive_chunk(&id, b"abc", |_| Ok(Vec::new())),
            Err(TransferError::Overrun { declared: 2, .. })
        ));
        assert_eq!(table.remove(&id).unwrap().received, 0);
    }

    #[test]
    fn open_failure_reported() {
        let (table, id) = table_with(PeerId::generate());
        let err = table
            .receive_chunk(&id, b"abc", |_| {
                Err(io::Error::new(io::ErrorKind::PermissionDenied, "nope"))
            })
            .unwrap_err();
        assert!(matches!(err, TransferError::Io { .. }));
        assert!(table.remove(&id).unwrap().into_sink().is_none());
    }

    #[test]
    fn abandon_only_that_source() {
        let gone = PeerId::generate();
        let stays = PeerId::generate();
        let (table, a) = table_with(gone);
        let b = RequestId::generate();
        table.insert(FileTransferRequest::new(b, "notes.txt", stays));
        let dropped = table.abandon_from(&gone);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].id, a);
        assert_eq!(table.source_of(&b), Some(stays));
        assert!(table.has_source(&stays));
        assert!(!table.has_source(&gone));
    }

    #[test]
    fn table_usable_while_sink_opens() {
        let (table, id) = table_with(PeerId::generate());
        table
            .receive_chunk(&id, b"abc", |_| {
                // The dispatcher may touch the same entry meanwhile.
                assert!(table.set_declared_size(&id, 3));
                assert!(table.source_of(&id).is_some());
                Ok(Vec::new())
            })
            .unwrap();
        let req = table.remove(&id).unwrap();
        assert_eq!(req.declared_size, Some(3));
        assert_eq!(req.into_sink().unwrap(), b"abc");
    }

    #[test]
    fn chunk_for_request_removed_mid_write_is_unknown() {
        let (table, id) = table_with(PeerId::generate());
        let err = table
            .receive_chunk(&id, b"abc", |_| {
                table.remove(&id);
                Ok(Vec::new())
            })
            .unwrap_err();
        assert!(matches!(err, TransferError::UnknownRequest(_)));
    }

    #[test]
    fn uploads_counted_per_peer_until_guards_drop() {
        let uploads = Arc::new(UploadTable::new());
        let peer = PeerId::generate();
        let first = uploads.begin(peer);
        let second = uploads.begin(peer);
        assert_eq!(uploads.active_for(&peer), 2);
        assert_eq!(uploads.active_for(&PeerId::generate()), 0);
        drop(first);
        assert_eq!(uploads.active_for(&peer), 1);
        drop(second);
        assert_eq!(uploads.active_for(&peer), 0);
    }

    #[test]
    fn disambiguation_keeps_extension() {
        let id: RequestId = "67e55044-10b1-426f-9247-bb680e5fe0c8".parse().unwrap();
        assert_eq!(
            disambiguated_name("report.pdf", &id),
            "report-67e55044-10b1-426f-9247-bb680e5fe0c8.pdf"
        );
        assert_eq!(
            disambiguated_name("archive.tar.gz", &id),
            "archive.tar-67e55044-10b1-426f-9247-bb680e5fe0c8.gz"
        );
        assert_eq!(
            disambiguated_name("README", &id),
            "README-67e55044-10b1-426f-9247-bb680e5fe0c8"
        );
        assert_eq!(
            disambiguated_name(".profile", &id),
            ".profile-67e55044-10b1-426f-9247-bb680e5fe0c8"
        );
    }

    #[test]
    fn zero_byte_file_is_complete() {
        let p = ChunkProgress {
            received: 0,
            declared: Some(0),
        };
        assert_eq!(p.percent(), Some(100));
    }
}
