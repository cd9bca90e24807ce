//! Candidate buffer.
//!
//! Remote candidates can arrive before the remote description is applied.
//! They are held here in arrival order and applied in one go once the
//! negotiator says the description is in place. After that first flush,
//! candidates bypass the queue.

use crate::link::PeerLink;
use peerlink_common::IceCandidate;
use std::sync::Arc;

pub struct CandidateBuffer {
    link: Arc<dyn PeerLink>,
    pending: Vec<IceCandidate>,
    flushed: bool,
}

impl CandidateBuffer {
    pub fn new(link: Arc<dyn PeerLink>) -> Self {
        Self {
            link,
            pending: Vec::new(),
            flushed: false,
        }
    }

    /// Queue `candidate`, or apply it right away if the buffer was already flushed.
    pub async fn push(&mut self, candidate: IceCandidate) {
        if self.flushed {
            self.apply(candidate).await;
        } else {
            tracing::trace!(pending = self.pending.len() + 1, "Buffering remote candidate");
            self.pending.push(candidate);
        }
    }

    /// Apply everything queued, in arrival order. Only the first call does anything.
    pub async fn flush(&mut self) {
        if self.flushed {
            return;
        }
        self.flushed = true;

        let pending = std::mem::take(&mut self.pending);
        if !pending.is_empty() {
            tracing::debug!(count = pending.len(), "Flushing buffered candidates");
        }
        for candidate in pending {
            self.apply(candidate).await;
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    // A bad candidate never aborts the session.
    async fn apply(&self, candidate: IceCandidate) {
        if let Err(e) = self.link.add_ice_candidate(candidate).await {
            tracing::warn!(error = %e, "Failed to apply remote candidate");
        }
    }
}
