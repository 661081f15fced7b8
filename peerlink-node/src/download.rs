//! Receiving side of a download: chunk reception straight from the read loop, and the
//! destination file it writes into.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use peerlink_core::transfer::{disambiguated_name, FileTransferRequest};
use peerlink_core::{Frame, Message, RequestId};

use crate::node::Context;

/// File a download is written to.
#[derive(Debug)]
pub struct Destination {
    file: File,
    path: PathBuf,
}

impl Destination {
    /// Create `name` under `dir`. An existing file of that name is never overwritten; the
    /// request id is spliced into the new name instead.
    pub fn create(dir: &Path, name: &str, request: &RequestId) -> io::Result<Destination> {
        if Path::new(name).file_name().and_then(|n| n.to_str()) != Some(name) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("refusing to write {name:?}"),
            ));
        }
        std::fs::create_dir_all(dir)?;
        let open = |path: PathBuf| {
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .map(|file| Destination { file, path })
        };
        match open(dir.join(name)) {
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                open(dir.join(disambiguated_name(name, request)))
            }
            other => other,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Write for Destination {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Append a type 11 chunk to its download. Runs on the link's read loop; the write itself
/// happens on the blocking pool.
pub async fn receive_chunk(ctx: &Context, frame: Frame) {
    let (request, data) = match Message::from_frame(&frame) {
        Ok(Message::FileChunk { request, data }) => (request, data),
        Ok(other) => {
            tracing::warn!(kind = ?other.kind(), "not a file chunk");
            return;
        }
        Err(e) => {
            tracing::warn!(error = %e, "dropping malformed chunk");
            return;
        }
    };
    let transfers = ctx.transfers.clone();
    let dir = ctx.config.download_dir.clone();
    let written = tokio::task::spawn_blocking(move || {
        transfers.receive_chunk(&request, &data, |name| Destination::create(&dir, name, &request))
    })
    .await;
    match written {
        Ok(Ok(progress)) => match progress.percent() {
            Some(percent) => tracing::debug!(%request, received = progress.received, percent, "chunk"),
            None => tracing::debug!(%request, received = progress.received, "chunk"),
        },
        Ok(Err(e)) => tracing::warn!(error = %e, "dropping chunk"),
        Err(e) => tracing::warn!(%request, error = %e, "chunk writer panicked"),
    }
}

/// Flush a completed download to disk and return where it landed. A download that never saw a
/// chunk (an empty file) is created here.
pub fn finish(dir: &Path, request: FileTransferRequest<Destination>) -> io::Result<PathBuf> {
    let id = request.id;
    let filename = request.filename.clone();
    let mut dest = match request.into_sink() {
        Some(dest) => dest,
        None => Destination::create(dir, &filename, &id)?,
    };
    dest.flush()?;
    dest.file.sync_all()?;
    Ok(dest.path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_core::transfer::TransferTable;
    use peerlink_core::PeerId;

    #[test]
    fn existing_file_is_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("report.pdf"), b"old").unwrap();
        let request = RequestId::generate();
        let mut dest = Destination::create(dir.path(), "report.pdf", &request).unwrap();
        dest.write_all(b"new").unwrap();
        let expected = dir.path().join(disambiguated_name("report.pdf", &request));
        assert_eq!(dest.path(), expected.as_path());
        drop(dest);
        assert_eq!(std::fs::read(dir.path().join("report.pdf")).unwrap(), b"old");
        assert_eq!(std::fs::read(expected).unwrap(), b"new");
    }

    #[test]
    fn path_names_refused() {
        let dir = tempfile::tempdir().unwrap();
        let request = RequestId::generate();
        for name in ["../escape", "a/b", "..", ""] {
            assert!(Destination::create(dir.path(), name, &request).is_err(), "{name}");
        }
    }

    #[test]
    fn table_writes_through_destination() {
        let dir = tempfile::tempdir().unwrap();
        let table: TransferTable<Destination> = TransferTable::new();
        let request = RequestId::generate();
        table.insert(FileTransferRequest::new(request, "notes.txt", PeerId::generate()));
        for chunk in [&b"abc"[..], b"def", b"g"] {
            table
                .receive_chunk(&request, chunk, |name| Destination::create(dir.path(), name, &request))
                .unwrap();
        }
        let path = finish(dir.path(), table.remove(&request).unwrap()).unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"abcdefg");
    }

    #[test]
    fn empty_download_still_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut request = FileTransferRequest::new(RequestId::generate(), "empty.bin", PeerId::generate());
        request.declared_size = Some(0);
        let path = finish(dir.path(), request).unwrap();
        assert_eq!(std::fs::metadata(path).unwrap().len(), 0);
    }
}
