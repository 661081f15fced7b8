//! The dispatcher task: sole owner of the engine and the link table.
//!
//! Read loops, the accept loop, dial tasks and the user all talk to it through one unbounded
//! queue, drained strictly in order.

use std::collections::HashMap;
use std::time::Duration;

use peerlink_core::engine::DownloadError;
use peerlink_core::handshake::EstablishedPeer;
use peerlink_core::protocol::DISCONNECT_TEXT;
use peerlink_core::registry::{PeerEntry, Recommendation};
use peerlink_core::search::SearchResult;
use peerlink_core::transfer::FileTransferRequest;
use peerlink_core::{
    Action, ConnectPurpose, Engine, Message, Notice, Origin, PeerAddress, PeerId, PendingMessage,
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::connection::{write_frame, Link};
use crate::download::Destination;
use crate::node::Context;
use crate::{download, handshake};

/// How long shutdown waits for queued disconnect notices to flush.
const SHUTDOWN_FLUSH: Duration = Duration::from_secs(2);

/// Everything the dispatcher consumes.
#[derive(Debug)]
pub enum Event {
    /// A frame from a link's read loop.
    Message { serial: u64, pending: PendingMessage },
    /// Work from this node's user.
    Local(PendingMessage),
    /// A handshake completed. `purpose` is `None` for accepted sockets.
    Connected {
        stream: TcpStream,
        peer: EstablishedPeer,
        purpose: Option<ConnectPurpose>,
    },
    ConnectFailed {
        address: PeerAddress,
        purpose: ConnectPurpose,
    },
    /// Dial a peer (bootstrap).
    Connect {
        address: PeerAddress,
        purpose: ConnectPurpose,
    },
    /// Failover recommendation for an inbound permanent link.
    Recommend {
        requester: PeerId,
        reply: oneshot::Sender<Recommendation>,
    },
    Download {
        result: usize,
        file: usize,
        reply: oneshot::Sender<Result<(), DownloadError>>,
    },
    Results(oneshot::Sender<Vec<SearchResult>>),
    Peers(oneshot::Sender<Vec<PeerEntry>>),
    Shutdown(oneshot::Sender<()>),
}

pub struct Dispatcher {
    ctx: Context,
    engine: Engine<Destination>,
    links: HashMap<PeerId, Link>,
    next_serial: u64,
    /// Writers of closed links still flushing.
    closing: Vec<JoinHandle<()>>,
    events: mpsc::UnboundedReceiver<Event>,
    notices: mpsc::UnboundedSender<Notice>,
}

impl Dispatcher {
    pub fn new(
        ctx: Context,
        engine: Engine<Destination>,
        events: mpsc::UnboundedReceiver<Event>,
        notices: mpsc::UnboundedSender<Notice>,
    ) -> Self {
        Self {
            ctx,
            engine,
            links: HashMap::new(),
            next_serial: 0,
            closing: Vec::new(),
            events,
            notices,
        }
    }

    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            match event {
                Event::Message { serial, pending } => {
                    if let Origin::Peer(peer) = pending.origin {
                        if self.links.get(&peer).map(|l| l.serial) != Some(serial) {
                            tracing::debug!(peer = %peer, serial, "dropping message from stale link");
                            continue;
                        }
                    }
                    let actions = self.engine.handle(pending);
                    self.execute(actions).await;
                }
                Event::Local(pending) => {
                    let actions = self.engine.handle(pending);
                    self.execute(actions).await;
                }
                Event::Connected {
                    stream,
                    peer,
                    purpose,
                } => self.on_connected(stream, peer, purpose).await,
                Event::ConnectFailed { address, purpose } => {
                    let actions = self.engine.on_connect_failed(address, purpose);
                    self.execute(actions).await;
                }
                Event::Connect { address, purpose } => {
                    self.execute(vec![Action::Connect { address, purpose }]).await;
                }
                Event::Recommend { requester, reply } => {
                    let _ = reply.send(self.engine.recommendation_for(&requester));
                }
                Event::Download {
                    result,
                    file,
                    reply,
                } => match self.engine.start_download(result, file) {
                    Ok(actions) => {
                        let _ = reply.send(Ok(()));
                        self.execute(actions).await;
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                },
                Event::Results(reply) => {
                    let _ = reply.send(self.engine.search_results().to_vec());
                }
                Event::Peers(reply) => {
                    let registry = self.engine.registry();
                    let peers = registry
                        .permanent()
                        .iter()
                        .chain(registry.data_transfer())
                        .cloned()
                        .collect();
                    let _ = reply.send(peers);
                }
                Event::Shutdown(reply) => {
                    let actions = self.engine.shutdown();
                    self.execute(actions).await;
                    let leftover: Vec<JoinHandle<()>> =
                        self.links.drain().map(|(_, link)| link.close()).collect();
                    self.closing.extend(leftover);
                    for writer in self.closing.drain(..) {
                        let _ = tokio::time::timeout(SHUTDOWN_FLUSH, writer).await;
                    }
                    tracing::info!("dispatcher stopped");
                    let _ = reply.send(());
                    return;
                }
            }
        }
    }

    async fn on_connected(
        &mut self,
        mut stream: TcpStream,
        peer: EstablishedPeer,
        purpose: Option<ConnectPurpose>,
    ) {
        let id = peer.id;
        let admission = self.engine.on_connected(peer, purpose);
        if admission.admitted {
            self.next_serial += 1;
            let link = Link::spawn(&self.ctx, stream, id, self.next_serial);
            self.links.insert(id, link);
        } else {
            tokio::spawn(async move {
                let bye = Message::Disconnect(DISCONNECT_TEXT.to_string()).to_frame();
                let _ = write_frame(&mut stream, &bye).await;
            });
        }
        self.execute(admission.actions).await;
    }

    async fn execute(&mut self, actions: Vec<Action<Destination>>) {
        for action in actions {
            match action {
                Action::Send { to, message } => match self.links.get(&to) {
                    Some(link) => {
                        if !link.send(message.to_frame()).await {
                            tracing::debug!(peer = %to, "link writer gone");
                        }
                    }
                    None => tracing::debug!(peer = %to, kind = ?message.kind(), "no link for send"),
                },
                Action::Connect { address, purpose } => self.spawn_dial(address, purpose),
                Action::Close(peer) => {
                    if let Some(link) = self.links.remove(&peer) {
                        self.closing.retain(|w| !w.is_finished());
                        self.closing.push(link.close());
                    }
                }
                Action::FinishDownload(request) => self.finish_download(request),
                Action::Notify(notice) => {
                    tracing::debug!(?notice, "notice");
                    let _ = self.notices.send(notice);
                }
            }
        }
    }

    fn spawn_dial(&self, address: PeerAddress, purpose: ConnectPurpose) {
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let event = match handshake::dial(&ctx, &address, purpose.role()).await {
                Ok((stream, peer)) => Event::Connected {
                    stream,
                    peer,
                    purpose: Some(purpose),
                },
                Err(e) => {
                    tracing::warn!(%address, error = %e, "connect failed");
                    Event::ConnectFailed { address, purpose }
                }
            };
            let _ = ctx.events.send(event);
        });
    }

    fn finish_download(&self, request: FileTransferRequest<Destination>) {
        let notices = self.notices.clone();
        let dir = self.ctx.config.download_dir.clone();
        tokio::spawn(async move {
            let filename = request.filename.clone();
            let bytes = request.received;
            match tokio::task::spawn_blocking(move || download::finish(&dir, request)).await {
                Ok(Ok(path)) => {
                    tracing::info!(%filename, bytes, path = %path.display(), "download complete");
                    let _ = notices.send(Notice::DownloadComplete { filename, bytes });
                }
                Ok(Err(e)) => tracing::warn!(%filename, error = %e, "finishing download failed"),
                Err(e) => tracing::warn!(%filename, error = %e, "finishing download panicked"),
            }
        });
    }
}
