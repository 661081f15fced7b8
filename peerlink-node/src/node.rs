//! Node lifecycle: bind, start the dispatcher and accept loop, and a handle for the user side.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use peerlink_core::engine::DownloadError;
use peerlink_core::registry::PeerEntry;
use peerlink_core::search::SearchResult;
use peerlink_core::transfer::{TransferTable, UploadTable};
use peerlink_core::{ConnectPurpose, Engine, Notice, PeerAddress, PeerId, PendingMessage};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::dispatcher::{Dispatcher, Event};
use crate::download::Destination;
use crate::handshake;
use crate::lister::DirectoryLister;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// What every task of one node shares.
#[derive(Clone)]
pub struct Context {
    pub own_id: PeerId,
    pub own_address: PeerAddress,
    pub config: Arc<Config>,
    pub events: mpsc::UnboundedSender<Event>,
    pub transfers: Arc<TransferTable<Destination>>,
    pub uploads: Arc<UploadTable>,
}

/// A running node. Dropping it leaves the tasks running; call `shutdown`.
pub struct Node {
    ctx: Context,
    local_addr: SocketAddr,
    accept: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl Node {
    /// Bind the listener and start the node. Notices for the user arrive on the returned receiver.
    pub async fn start(config: Config) -> anyhow::Result<(Node, mpsc::UnboundedReceiver<Notice>)> {
        let listener = TcpListener::bind(("0.0.0.0", config.listen_port))
            .await
            .context("could not start server")?;
        let local_addr = listener.local_addr().context("could not start server")?;
        let own_id = PeerId::generate();
        let own_address = PeerAddress::new(config.advertise_host.clone(), local_addr.port());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let transfers = Arc::new(TransferTable::new());
        let lister = DirectoryLister::new(config.shared_dir.clone());
        let engine = Engine::new(own_id, own_address.clone(), Box::new(lister), transfers.clone());
        let ctx = Context {
            own_id,
            own_address: own_address.clone(),
            config: Arc::new(config),
            events: events_tx,
            transfers,
            uploads: engine.uploads().clone(),
        };
        let dispatcher = tokio::spawn(Dispatcher::new(ctx.clone(), engine, events_rx, notices_tx).run());
        let accept = tokio::spawn(accept_loop(ctx.clone(), listener));
        tracing::info!(peer = %own_id, address = %own_address, "node listening");

        Ok((
            Node {
                ctx,
                local_addr,
                accept,
                dispatcher,
            },
            notices_rx,
        ))
    }

    pub fn peer_id(&self) -> PeerId {
        self.ctx.own_id
    }

    /// Address advertised to peers.
    pub fn address(&self) -> &PeerAddress {
        &self.ctx.own_address
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Downloads still in flight.
    pub fn transfers_pending(&self) -> usize {
        self.ctx.transfers.len()
    }

    fn post(&self, event: Event) -> anyhow::Result<()> {
        self.ctx
            .events
            .send(event)
            .map_err(|_| anyhow::anyhow!("node stopped"))
    }

    async fn ask<T>(&self, event: impl FnOnce(oneshot::Sender<T>) -> Event) -> anyhow::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.post(event(tx))?;
        rx.await.map_err(|_| anyhow::anyhow!("node stopped"))
    }

    /// Dial `address` as a permanent, anchor-flagged link.
    pub fn connect(&self, address: PeerAddress) -> anyhow::Result<()> {
        self.post(Event::Connect {
            address,
            purpose: ConnectPurpose::Bootstrap,
        })
    }

    /// Start a search; earlier results are discarded.
    pub fn search(&self, term: &str) -> anyhow::Result<()> {
        self.post(Event::Local(PendingMessage::local_search(term)))
    }

    pub async fn results(&self) -> anyhow::Result<Vec<SearchResult>> {
        self.ask(Event::Results).await
    }

    pub async fn peers(&self) -> anyhow::Result<Vec<PeerEntry>> {
        self.ask(Event::Peers).await
    }

    /// Download file `file` of search result `result`.
    pub async fn download(&self, result: usize, file: usize) -> anyhow::Result<()> {
        let outcome: Result<(), DownloadError> = self
            .ask(|reply| Event::Download {
                result,
                file,
                reply,
            })
            .await?;
        Ok(outcome?)
    }

    /// Send a disconnect notice to every peer and close every link, then stop listening.
    pub async fn shutdown(self) {
        if self.ask(Event::Shutdown).await.is_err() {
            tracing::debug!("dispatcher already stopped");
        }
        let _ = self.dispatcher.await;
        self.accept.abort();
        let _ = self.accept.await;
    }
}

async fn accept_loop(ctx: Context, listener: TcpListener) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            match handshake::accept(&ctx, stream).await {
                Ok((stream, peer)) => {
                    let _ = ctx.events.send(Event::Connected {
                        stream,
                        peer,
                        purpose: None,
                    });
                }
                Err(e) => tracing::debug!(%remote, error = %e, "inbound handshake failed"),
            }
        });
    }
}
