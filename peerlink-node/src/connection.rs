//! Peer links: framed socket I/O, a writer task fed by a bounded queue, and the read loop.

use std::io;

use peerlink_core::protocol::{Message, MessageKind, DISCONNECT_TEXT};
use peerlink_core::wire::{decode_header, encode_frame, HEADER_LEN};
use peerlink_core::{Frame, PeerId, PendingMessage};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::dispatcher::Event;
use crate::node::Context;
use crate::{download, upload};

/// Read one envelope. Blocks until it is complete; EOF and oversized lengths are errors.
pub async fn read_frame<R>(reader: &mut R, max_len: u32) -> io::Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let (kind, len) = decode_header(&header);
    if len > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds {max_len}"),
        ));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Frame::new(kind, payload))
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes =
        encode_frame(frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    writer.write_all(&bytes).await?;
    writer.flush().await
}

/// A registered peer's live socket, owned by the dispatcher.
#[derive(Debug)]
pub struct Link {
    /// Distinguishes this socket from earlier links of the same peer.
    pub serial: u64,
    outbound: mpsc::Sender<Frame>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Link {
    /// Start the writer task and the read loop for an established socket.
    pub fn spawn(ctx: &Context, stream: TcpStream, peer: PeerId, serial: u64) -> Link {
        let (tx, rx) = mpsc::channel(ctx.config.send_queue_depth.max(1));
        let (reader, writer) = stream.into_split();
        let writer = tokio::spawn(write_loop(peer, writer, rx));
        let reader = tokio::spawn(read_loop(ctx.clone(), peer, serial, reader, tx.clone()));
        Link {
            serial,
            outbound: tx,
            reader,
            writer,
        }
    }

    /// Queue a frame, waiting while the queue is full. False once the writer is gone.
    pub async fn send(&self, frame: Frame) -> bool {
        self.outbound.send(frame).await.is_ok()
    }

    /// Stop reading; the writer drains what is queued, then closes the socket.
    pub fn close(self) -> JoinHandle<()> {
        self.reader.abort();
        self.writer
    }
}

async fn write_loop(peer: PeerId, mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        tracing::trace!(peer = %peer, kind = frame.kind, len = frame.payload.len(), "send");
        if let Err(e) = write_frame(&mut writer, &frame).await {
            tracing::debug!(peer = %peer, error = %e, "write failed");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(
    ctx: Context,
    peer: PeerId,
    serial: u64,
    mut reader: OwnedReadHalf,
    outbound: mpsc::Sender<Frame>,
) {
    let mut saw_disconnect = false;
    loop {
        let frame = match read_frame(&mut reader, ctx.config.max_frame_len).await {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!(peer = %peer, error = %e, "read loop ended");
                break;
            }
        };
        tracing::trace!(peer = %peer, kind = frame.kind, len = frame.payload.len(), "recv");
        if frame.kind == MessageKind::DownloadRequest.tag() {
            upload::spawn(ctx.clone(), peer, frame, outbound.clone());
            continue;
        }
        if frame.kind == MessageKind::FileChunk.tag() {
            download::receive_chunk(&ctx, frame).await;
            continue;
        }
        saw_disconnect = frame.kind == MessageKind::Disconnect.tag();
        let pending = PendingMessage::from_peer(peer, frame);
        if ctx.events.send(Event::Message { serial, pending }).is_err() || saw_disconnect {
            break;
        }
    }
    if !saw_disconnect {
        // Let the dispatcher run the eviction path as if the peer had said goodbye.
        let frame = Message::Disconnect(DISCONNECT_TEXT.to_string()).to_frame();
        let pending = PendingMessage::from_peer(peer, frame);
        let _ = ctx.events.send(Event::Message { serial, pending });
    }
}
