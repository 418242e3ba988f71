// crates/manifold-server/src/mcp/mod.rs
// MCP server state for the aggregator

mod elicitation;
mod handler;
pub mod requests;
pub mod tools;

pub use elicitation::ElicitationClient;

use crate::background;
use crate::config::Profile;
use crate::downstream::ConnectionManager;
use crate::embeddings::EmbeddingClient;
use crate::finder::Finder;
use crate::gate::ConfirmationGate;
use crate::index::CapabilityIndex;
use manifold_types::IndexingProgress;
use rmcp::service::{Peer, RoleServer};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{RwLock, watch};

/// Aggregator state behind the `find`/`run` surface.
#[derive(Clone)]
pub struct ManifoldServer {
    pub profile: Arc<Profile>,
    pub index: Arc<CapabilityIndex>,
    pub embeddings: Arc<EmbeddingClient>,
    pub finder: Arc<Finder>,
    pub gate: Arc<ConfirmationGate>,
    pub connections: ConnectionManager,
    /// Upstream peer captured on first contact, for elicitation.
    pub peer: Arc<RwLock<Option<Peer<RoleServer>>>>,
    progress_tx: Arc<watch::Sender<Option<IndexingProgress>>>,
    progress_rx: watch::Receiver<Option<IndexingProgress>>,
    reconcile_started: Arc<AtomicBool>,
}

impl ManifoldServer {
    pub fn new(
        profile: Arc<Profile>,
        index: Arc<CapabilityIndex>,
        embeddings: Arc<EmbeddingClient>,
        gate: Arc<ConfirmationGate>,
        connections: ConnectionManager,
    ) -> Self {
        let finder = Arc::new(Finder::new(index.clone(), embeddings.clone()));
        let (progress_tx, progress_rx) = watch::channel(None);
        Self {
            profile,
            index,
            embeddings,
            finder,
            gate,
            connections,
            peer: Arc::new(RwLock::new(None)),
            progress_tx: Arc::new(progress_tx),
            progress_rx,
            reconcile_started: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Kick off background reconciliation exactly once. Must return
    /// immediately: the caller is answering `initialize`.
    pub fn start_reconciliation(&self) {
        if self.reconcile_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let server = self.clone();
        let progress_tx = self.progress_tx.clone();
        tokio::spawn(async move {
            background::reconcile(server, progress_tx).await;
        });
    }

    /// Snapshot of the indexer's progress; `None` once finished.
    pub fn indexing_progress(&self) -> Option<IndexingProgress> {
        self.progress_rx.borrow().clone()
    }

    pub fn elicitation(&self) -> ElicitationClient {
        ElicitationClient::new(self.peer.clone())
    }

    /// Remember the upstream peer on first contact.
    pub async fn capture_peer(&self, peer: &Peer<RoleServer>) {
        if self.peer.read().await.is_none() {
            *self.peer.write().await = Some(peer.clone());
        }
    }
}
