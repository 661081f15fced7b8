//! Sending side of a download, started straight from the read loop that saw the type -6.

use std::io;
use std::path::Path;

use anyhow::Context as _;
use peerlink_core::transfer::UploadGuard;
use peerlink_core::{Frame, Message, PeerId, RequestId};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use crate::node::Context;

/// Serve one download request on its own task so the read loop keeps draining the socket.
/// The upload counts against `peer` from here until its last frame is queued.
pub fn spawn(ctx: Context, peer: PeerId, frame: Frame, outbound: mpsc::Sender<Frame>) {
    let in_flight = ctx.uploads.begin(peer);
    tokio::spawn(async move {
        if let Err(e) = serve(&ctx, frame, &outbound, in_flight).await {
            tracing::warn!(peer = %peer, error = %e, "upload aborted");
        }
    });
}

async fn send(outbound: &mpsc::Sender<Frame>, message: Message) -> anyhow::Result<()> {
    outbound
        .send(message.to_frame())
        .await
        .map_err(|_| anyhow::anyhow!("link closed"))
}

async fn serve(
    ctx: &Context,
    frame: Frame,
    outbound: &mpsc::Sender<Frame>,
    in_flight: UploadGuard,
) -> anyhow::Result<()> {
    let Message::DownloadRequest { request, filename } = Message::from_frame(&frame)? else {
        anyhow::bail!("not a download request");
    };
    let mut file = match open_shared(&ctx.config.shared_dir, &filename).await {
        Ok(file) => file,
        Err(e) => {
            tracing::info!(%request, %filename, error = %e, "refusing download");
            drop(in_flight);
            return send(outbound, Message::DownloadRefused { request }).await;
        }
    };
    let size = file.metadata().await.context("reading file size")?.len();
    tracing::info!(%request, %filename, size, "upload started");
    send(outbound, Message::DownloadAccepted { request, size }).await?;
    stream_chunks(&mut file, request, ctx.config.chunk_size.max(1), outbound).await?;
    // Must end before the 12 is queued: the receipt it triggers checks the count.
    drop(in_flight);
    send(outbound, Message::UploadComplete { request }).await?;
    tracing::info!(%request, %filename, "upload complete");
    Ok(())
}

async fn stream_chunks<R>(
    reader: &mut R,
    request: RequestId,
    chunk_size: usize,
    outbound: &mpsc::Sender<Frame>,
) -> anyhow::Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = vec![0u8; chunk_size];
    loop {
        let n = read_full(reader, &mut buf).await.context("reading shared file")?;
        if n == 0 {
            return Ok(());
        }
        send(
            outbound,
            Message::FileChunk {
                request,
                data: buf[..n].to_vec(),
            },
        )
        .await?;
    }
}

/// Fill `buf` unless EOF comes first, so every chunk but the last is full-size.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Open a regular file directly under `dir`. Names that walk out of it are refused.
async fn open_shared(dir: &Path, name: &str) -> io::Result<tokio::fs::File> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("not a plain file name: {name:?}"),
        ));
    }
    let path = dir.join(name);
    let meta = tokio::fs::metadata(&path).await?;
    if !meta.is_file() {
        return Err(io::Error::new(io::ErrorKind::NotFound, "not a regular file"));
    }
    tokio::fs::File::open(&path).await
}
