//! Drives the core handshake machines over a fresh socket.

use anyhow::Context as _;
use peerlink_core::handshake::{Acceptor, EstablishedPeer, HandshakeError, Initiator};
use peerlink_core::registry::{Recommendation, Role};
use peerlink_core::{Message, PeerAddress};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use crate::connection::{read_frame, write_frame};
use crate::dispatcher::Event;
use crate::node::Context;

async fn send_all(stream: &mut TcpStream, messages: Vec<Message>) -> anyhow::Result<()> {
    for m in messages {
        write_frame(stream, &m.to_frame()).await?;
    }
    Ok(())
}

async fn next_message(stream: &mut TcpStream, max_len: u32) -> Result<Message, HandshakeError> {
    let frame = read_frame(stream, max_len)
        .await
        .map_err(|_| HandshakeError::Closed)?;
    Ok(Message::from_frame(&frame)?)
}

/// Dial `address` and ask for a link of `role`.
pub async fn dial(
    ctx: &Context,
    address: &PeerAddress,
    role: Role,
) -> anyhow::Result<(TcpStream, EstablishedPeer)> {
    let mut stream = TcpStream::connect((address.host.as_str(), address.port))
        .await
        .with_context(|| format!("connecting to {address}"))?;
    let mut initiator = Initiator::new(ctx.own_id, ctx.own_address.clone(), role, address.clone());
    send_all(&mut stream, initiator.opening()).await?;
    loop {
        let msg = next_message(&mut stream, ctx.config.max_frame_len).await?;
        if let Some(peer) = initiator.on_message(msg)? {
            tracing::debug!(peer = %peer.id, %address, ?role, "handshake complete");
            return Ok((stream, peer));
        }
    }
}

/// Run the acceptor side on an inbound socket.
pub async fn accept(
    ctx: &Context,
    mut stream: TcpStream,
) -> anyhow::Result<(TcpStream, EstablishedPeer)> {
    let mut acceptor = Acceptor::new(ctx.own_id, ctx.own_address.clone());
    send_all(&mut stream, acceptor.opening()).await?;
    let request = loop {
        let step = match next_message(&mut stream, ctx.config.max_frame_len).await {
            Ok(msg) => acceptor.on_message(msg),
            Err(e) => Err(e),
        };
        match step {
            Ok(Some(request)) => break request,
            Ok(None) => {}
            Err(HandshakeError::Closed) => return Err(HandshakeError::Closed.into()),
            Err(e) => {
                let _ = send_all(&mut stream, Acceptor::rejection()).await;
                return Err(e.into());
            }
        }
    };

    let recommendation = match request.role {
        Role::Permanent => {
            let (reply, rx) = oneshot::channel();
            ctx.events
                .send(Event::Recommend {
                    requester: request.id,
                    reply,
                })
                .map_err(|_| anyhow::anyhow!("dispatcher stopped"))?;
            rx.await.context("dispatcher dropped recommendation")?
        }
        Role::DataTransfer => Recommendation::NoSubstitute,
    };
    let (reply, peer) = request.accept(recommendation);
    send_all(&mut stream, reply).await?;
    tracing::debug!(peer = %peer.id, role = ?peer.role, "accepted link");
    Ok((stream, peer))
}
