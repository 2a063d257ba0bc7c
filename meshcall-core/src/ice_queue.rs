//! Per-link buffer for remote connectivity candidates
//!
//! Candidates can reach a link before its remote description has been applied. They are
//! held here in arrival order and drained exactly once the description is in place.
//! Retransmitted candidates are recognised and skipped. Nothing is ever evicted: a
//! backlog beyond the configured bound is a negotiation failure for the link.

use crate::connection::NegotiationError;
use crate::types::IceCandidate;
use std::collections::{HashSet, VecDeque};

/// What a link should do with a remote candidate it just received
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    /// Apply it to the connection right away
    ApplyNow,
    /// Held until the remote description is applied
    Buffered,
    /// Already seen on this link; ignore
    Duplicate,
}

/// Bounded FIFO of remote candidates waiting for a remote description
#[derive(Debug)]
pub struct CandidateQueue {
    pending: VecDeque<IceCandidate>,
    seen: HashSet<IceCandidate>,
    max_pending: usize,
}

impl CandidateQueue {
    /// Create a queue holding at most `max_pending` candidates
    #[must_use]
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            seen: HashSet::new(),
            max_pending: max_pending.max(1),
        }
    }

    /// Decide what to do with `candidate`
    ///
    /// A candidate is only applied immediately when the remote description is set and
    /// nothing older is still waiting, which keeps application in arrival order.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::CandidateBacklog`] when buffering would exceed the
    /// bound. The queue is left unchanged.
    pub fn admit(
        &mut self,
        candidate: IceCandidate,
        remote_description_set: bool,
    ) -> Result<CandidateDisposition, NegotiationError> {
        if self.seen.contains(&candidate) {
            tracing::trace!(candidate = %candidate.candidate, "Duplicate remote candidate");
            return Ok(CandidateDisposition::Duplicate);
        }

        if remote_description_set && self.pending.is_empty() {
            self.seen.insert(candidate);
            return Ok(CandidateDisposition::ApplyNow);
        }

        if self.pending.len() >= self.max_pending {
            tracing::warn!(
                candidate = %candidate.candidate,
                max_pending = self.max_pending,
                "Pending candidate backlog exceeded"
            );
            return Err(NegotiationError::CandidateBacklog {
                limit: self.max_pending,
            });
        }
        self.seen.insert(candidate.clone());
        self.pending.push_back(candidate);
        Ok(CandidateDisposition::Buffered)
    }

    /// Take every buffered candidate in arrival order
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.pending.drain(..).collect()
    }

    /// Number of buffered candidates
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Forget everything, including the duplicate filter
    pub fn clear(&mut self) {
        self.pending.clear();
        self.seen.clear();
    }
}
