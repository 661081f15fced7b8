//! Host-driven dispatcher state: the host feeds queued messages and link events in arrival
//! order, the engine mutates registry/search/transfer state and returns actions to execute.

use std::collections::HashMap;
use std::sync::Arc;

use crate::failover::{self, FailoverPlan};
use crate::handshake::EstablishedPeer;
use crate::identity::{PeerId, RequestId};
use crate::protocol::{Message, PeerAddress, DISCONNECT_TEXT, RECEIPT_TEXT};
use crate::registry::{PeerEntry, PeerRegistry, Recommendation, RegistryError, Role};
use crate::search::{self, FileLister, PropagationHistory, ResponseOutcome, SearchQuery, SearchResult};
use crate::transfer::{FileTransferRequest, TransferTable, UploadTable};
use crate::wire::Frame;

/// Where a queued message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// This node's own user.
    Local,
    Peer(PeerId),
}

/// One unit of dispatcher work. Consumed exactly once, in FIFO order.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub origin: Origin,
    pub frame: Frame,
}

impl PendingMessage {
    pub fn from_peer(peer: PeerId, frame: Frame) -> Self {
        Self {
            origin: Origin::Peer(peer),
            frame,
        }
    }

    /// The user asked to search for `term`.
    pub fn local_search(term: &str) -> Self {
        let query = SearchQuery {
            history: PropagationHistory::new(),
            term: term.to_string(),
        };
        Self {
            origin: Origin::Local,
            frame: Message::SearchQuery(query).to_frame(),
        }
    }
}

/// Why the host is asked to dial an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectPurpose {
    /// Startup peer given on the command line.
    Bootstrap,
    /// Recorded substitute of a departed anchor.
    Failover,
    /// Data-transfer link for one download.
    Download { request: RequestId, filename: String },
}

impl ConnectPurpose {
    pub fn role(&self) -> Role {
        match self {
            ConnectPurpose::Bootstrap | ConnectPurpose::Failover => Role::Permanent,
            ConnectPurpose::Download { .. } => Role::DataTransfer,
        }
    }

    /// Links dialed for this purpose become the anchor.
    pub fn is_anchor(&self) -> bool {
        !matches!(self, ConnectPurpose::Download { .. })
    }
}

/// Things worth telling the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    NoPeers,
    SearchResult { index: usize, result: SearchResult },
    DownloadRefused { filename: String },
    DownloadAbandoned { filename: String },
    AnchorChanged { peer: PeerId, address: PeerAddress },
    ConnectFailed { address: PeerAddress },
    /// Raised by the host once a finished download's sink is closed.
    DownloadComplete { filename: String, bytes: u64 },
}

/// Work for the host.
#[derive(Debug)]
pub enum Action<S> {
    Send { to: PeerId, message: Message },
    Connect { address: PeerAddress, purpose: ConnectPurpose },
    /// Release the peer's link.
    Close(PeerId),
    /// Download finished: flush and drop its sink.
    FinishDownload(FileTransferRequest<S>),
    Notify(Notice),
}

/// Result of registering a freshly handshaken link.
#[derive(Debug)]
pub struct Admission<S> {
    /// False when the link must be refused (send a disconnect notice and drop it).
    pub admitted: bool,
    pub actions: Vec<Action<S>>,
}

pub struct Engine<S> {
    own_id: PeerId,
    own_address: PeerAddress,
    registry: PeerRegistry,
    search_results: Vec<SearchResult>,
    transfers: Arc<TransferTable<S>>,
    uploads: Arc<UploadTable>,
    /// Requests waiting on a data link still being dialed, by responder.
    awaiting_link: HashMap<PeerId, Vec<(RequestId, String)>>,
    lister: Box<dyn FileLister>,
}

impl<S> Engine<S> {
    pub fn new(
        own_id: PeerId,
        own_address: PeerAddress,
        lister: Box<dyn FileLister>,
        transfers: Arc<TransferTable<S>>,
    ) -> Self {
        Self {
            own_id,
            own_address,
            registry: PeerRegistry::new(),
            search_results: Vec::new(),
            transfers,
            uploads: Arc::new(UploadTable::new()),
            awaiting_link: HashMap::new(),
            lister,
        }
    }

    pub fn own_id(&self) -> PeerId {
        self.own_id
    }

    pub fn own_address(&self) -> &PeerAddress {
        &self.own_address
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn search_results(&self) -> &[SearchResult] {
        &self.search_results
    }

    pub fn transfers(&self) -> &Arc<TransferTable<S>> {
        &self.transfers
    }

    /// Uploads in flight; the host counts them so data links outlive their last upload.
    pub fn uploads(&self) -> &Arc<UploadTable> {
        &self.uploads
    }

    /// Failover recommendation for an initiator asking for a permanent link.
    pub fn recommendation_for(&self, requester: &PeerId) -> Recommendation {
        self.registry.recommendation_for(requester)
    }

    /// Register a link that completed its handshake. `purpose` is `None` for accepted links.
    pub fn on_connected(
        &mut self,
        peer: EstablishedPeer,
        purpose: Option<ConnectPurpose>,
    ) -> Admission<S> {
        let id = peer.id;
        let role = peer.role;
        let anchor_flag = purpose.as_ref().is_some_and(|p| p.is_anchor());
        let mut actions = Vec::new();
        let queued = self.awaiting_link.remove(&id).unwrap_or_default();

        if let Err(RegistryError::Duplicate(_)) = self.registry.insert(peer.into_entry()) {
            tracing::warn!(peer = %id, "peer already registered, refusing second link");
            if purpose == Some(ConnectPurpose::Failover) && self.registry.is_permanent(&id) {
                self.make_anchor(&id, &mut actions);
            }
            if let Some(ConnectPurpose::Download { request, filename }) = purpose {
                // Reuse the link that already exists.
                actions.push(Action::Send {
                    to: id,
                    message: Message::DownloadRequest { request, filename },
                });
            }
            push_requests(id, queued, &mut actions);
            return Admission {
                admitted: false,
                actions,
            };
        }
        tracing::info!(peer = %id, ?role, "peer connected");

        if role == Role::Permanent && (anchor_flag || self.registry.anchor().is_none()) {
            self.make_anchor(&id, &mut actions);
        }
        if let Some(ConnectPurpose::Download { request, filename }) = purpose {
            actions.push(Action::Send {
                to: id,
                message: Message::DownloadRequest { request, filename },
            });
        }
        push_requests(id, queued, &mut actions);
        Admission {
            admitted: true,
            actions,
        }
    }

    /// A dial requested through `Action::Connect` failed.
    pub fn on_connect_failed(&mut self, address: PeerAddress, purpose: ConnectPurpose) -> Vec<Action<S>> {
        let mut actions = vec![Action::Notify(Notice::ConnectFailed {
            address: address.clone(),
        })];
        match purpose {
            ConnectPurpose::Bootstrap => {}
            ConnectPurpose::Failover => {
                tracing::warn!(%address, "failover reconnect failed, promoting a connected peer");
                if let FailoverPlan::Promote(id) = failover::promote_earliest(&self.registry) {
                    self.make_anchor(&id, &mut actions);
                }
            }
            ConnectPurpose::Download { request, filename } => {
                let queued = self
                    .transfers
                    .remove(&request)
                    .and_then(|req| self.awaiting_link.remove(&req.source))
                    .unwrap_or_default();
                actions.push(Action::Notify(Notice::DownloadAbandoned { filename }));
                for (request, filename) in queued {
                    self.transfers.remove(&request);
                    actions.push(Action::Notify(Notice::DownloadAbandoned { filename }));
                }
            }
        }
        actions
    }

    /// Ask for `file_index` of search result `result_index`.
    pub fn start_download(
        &mut self,
        result_index: usize,
        file_index: usize,
    ) -> Result<Vec<Action<S>>, DownloadError> {
        let result = self
            .search_results
            .get(result_index)
            .ok_or(DownloadError::NoSuchResult(result_index))?;
        let filename = result
            .files
            .get(file_index)
            .ok_or(DownloadError::NoSuchFile {
                result: result_index,
                file: file_index,
            })?
            .clone();
        let source = result.responder;
        let address = result.address.clone();
        let request = RequestId::generate();
        self.transfers
            .insert(FileTransferRequest::new(request, filename.clone(), source));
        tracing::info!(%request, %filename, peer = %source, "download requested");

        let action = if self.registry.get(&source).is_some() {
            Action::Send {
                to: source,
                message: Message::DownloadRequest { request, filename },
            }
        } else if let Some(waiting) = self.awaiting_link.get_mut(&source) {
            // One dial per responder; the request rides on the link it opens.
            waiting.push((request, filename));
            return Ok(Vec::new());
        } else {
            self.awaiting_link.insert(source, Vec::new());
            Action::Connect {
                address,
                purpose: ConnectPurpose::Download { request, filename },
            }
        };
        Ok(vec![action])
    }

    /// Disconnect notice to everyone and close every link.
    pub fn shutdown(&mut self) -> Vec<Action<S>> {
        let mut actions = Vec::new();
        for id in self.registry.all_ids() {
            actions.push(Action::Send {
                to: id,
                message: Message::Disconnect(DISCONNECT_TEXT.to_string()),
            });
            actions.push(Action::Close(id));
            self.registry.remove(&id);
            self.transfers.abandon_from(&id);
        }
        actions
    }

    /// Apply one queued message.
    pub fn handle(&mut self, pending: PendingMessage) -> Vec<Action<S>> {
        let message = match Message::from_frame(&pending.frame) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(origin = ?pending.origin, error = %e, "dropping malformed message");
                return Vec::new();
            }
        };
        match pending.origin {
            Origin::Local => self.handle_local(message),
            Origin::Peer(from) => self.handle_remote(from, message),
        }
    }

    fn handle_local(&mut self, message: Message) -> Vec<Action<S>> {
        match message {
            Message::SearchQuery(query) => self.start_search(&query.term),
            other => {
                tracing::debug!(kind = ?other.kind(), "ignoring local message");
                Vec::new()
            }
        }
    }

    fn start_search(&mut self, term: &str) -> Vec<Action<S>> {
        self.search_results.clear();
        let targets = self.registry.permanent_ids_except(None);
        if targets.is_empty() {
            return vec![Action::Notify(Notice::NoPeers)];
        }
        let query = search::originate(self.own_id, term);
        tracing::info!(%term, peers = targets.len(), "search started");
        targets
            .into_iter()
            .map(|to| Action::Send {
                to,
                message: Message::SearchQuery(query.clone()),
            })
            .collect()
    }

    fn handle_remote(&mut self, from: PeerId, message: Message) -> Vec<Action<S>> {
        let mut actions = Vec::new();
        match message {
            Message::Substitute(address) => {
                if !self.registry.set_substitute(&from, Some(address)) {
                    tracing::debug!(peer = %from, "substitute from non-permanent peer ignored");
                }
            }
            Message::NoSubstitute(_) => {
                self.registry.set_substitute(&from, None);
            }
            Message::Disconnect(_) => self.evict(&from, &mut actions),
            Message::DownloadAccepted { request, size } => {
                if self.transfers.set_declared_size(&request, size) {
                    tracing::debug!(%request, size, "download accepted");
                } else {
                    tracing::warn!(%request, "size notice for unknown download");
                }
            }
            Message::DownloadRefused { request } => match self.transfers.remove(&request) {
                Some(req) => {
                    actions.push(Action::Notify(Notice::DownloadRefused {
                        filename: req.filename,
                    }));
                    if self.data_link_idle(&from) {
                        self.teardown(&from, &mut actions);
                    }
                }
                None => tracing::warn!(%request, "refusal for unknown download"),
            },
            Message::UploadComplete { request } => match self.transfers.remove(&request) {
                Some(req) => {
                    actions.push(Action::FinishDownload(req));
                    actions.push(Action::Send {
                        to: from,
                        message: Message::ReceiptConfirmed(RECEIPT_TEXT.to_string()),
                    });
                }
                None => tracing::warn!(%request, "completion for unknown download"),
            },
            Message::ReceiptConfirmed(_) => {
                if self.data_link_idle(&from) {
                    self.teardown(&from, &mut actions);
                } else {
                    tracing::debug!(peer = %from, "receipt confirmed, link still in use");
                }
            }
            Message::SearchQuery(query) => {
                let outcome =
                    search::handle_query(self.own_id, &self.own_address, &query, &*self.lister);
                if let Some(forward) = outcome.forward {
                    for to in self.registry.permanent_ids_except(Some(&from)) {
                        actions.push(Action::Send {
                            to,
                            message: Message::SearchQuery(forward.clone()),
                        });
                    }
                }
                if let Some(reply) = outcome.reply {
                    actions.push(Action::Send {
                        to: from,
                        message: Message::SearchResponse(reply),
                    });
                }
            }
            Message::SearchResponse(response) => match search::handle_response(response) {
                ResponseOutcome::Relay { next_hop, response } => {
                    if self.registry.get(&next_hop).is_some() {
                        actions.push(Action::Send {
                            to: next_hop,
                            message: Message::SearchResponse(response),
                        });
                    } else {
                        tracing::warn!(peer = %next_hop, "search response for unknown hop dropped");
                    }
                }
                ResponseOutcome::Deliver(result) => {
                    tracing::info!(peer = %result.responder, files = result.files.len(), "search result");
                    self.search_results.push(result.clone());
                    actions.push(Action::Notify(Notice::SearchResult {
                        index: self.search_results.len() - 1,
                        result,
                    }));
                }
            },
            other => {
                tracing::warn!(peer = %from, kind = ?other.kind(), "unexpected message on dispatcher queue");
            }
        }
        actions
    }

    /// Remove `peer`, abandon its downloads and run failover if it was the anchor.
    fn evict(&mut self, peer: &PeerId, actions: &mut Vec<Action<S>>) {
        let Some(departed) = self.registry.remove(peer) else {
            tracing::debug!(peer = %peer, "disconnect from unregistered peer");
            return;
        };
        tracing::info!(peer = %peer, role = ?departed.role, anchor = departed.anchor, "peer left");
        actions.push(Action::Close(*peer));
        for req in self.transfers.abandon_from(peer) {
            actions.push(Action::Notify(Notice::DownloadAbandoned {
                filename: req.filename,
            }));
        }
        self.run_failover(&departed, actions);
    }

    fn run_failover(&mut self, departed: &PeerEntry, actions: &mut Vec<Action<S>>) {
        match failover::plan_departure(&self.registry, departed, &self.own_address) {
            FailoverPlan::Nothing => {}
            FailoverPlan::Reconnect(address) => {
                tracing::info!(%address, "reconnecting to substitute");
                actions.push(Action::Connect {
                    address,
                    purpose: ConnectPurpose::Failover,
                });
            }
            FailoverPlan::Promote(id) => self.make_anchor(&id, actions),
        }
    }

    /// A data link is finished once no download from it and no upload to it remains.
    fn data_link_idle(&self, peer: &PeerId) -> bool {
        self.registry.role_of(peer) == Some(Role::DataTransfer)
            && !self.transfers.has_source(peer)
            && self.uploads.active_for(peer) == 0
    }

    /// Disconnect notice then eviction, for data links whose job is done.
    fn teardown(&mut self, peer: &PeerId, actions: &mut Vec<Action<S>>) {
        actions.push(Action::Send {
            to: *peer,
            message: Message::Disconnect(DISCONNECT_TEXT.to_string()),
        });
        self.evict(peer, actions);
    }

    fn make_anchor(&mut self, id: &PeerId, actions: &mut Vec<Action<S>>) {
        if !self.registry.set_anchor(id) {
            return;
        }
        let Some(address) = self.registry.get(id).map(|p| p.address.clone()) else {
            return;
        };
        tracing::info!(peer = %id, %address, "new anchor");
        for (to, message) in failover::announce(&self.registry, id) {
            actions.push(Action::Send { to, message });
        }
        actions.push(Action::Notify(Notice::AnchorChanged { peer: *id, address }));
    }
}

fn push_requests<S>(to: PeerId, requests: Vec<(RequestId, String)>, actions: &mut Vec<Action<S>>) {
    for (request, filename) in requests {
        actions.push(Action::Send {
            to,
            message: Message::DownloadRequest { request, filename },
        });
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("no search result {0}")]
    NoSuchResult(usize),
    #[error("search result {result} has no file {file}")]
    NoSuchFile { result: usize, file: usize },
}
