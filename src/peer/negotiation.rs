//! Negotiation bookkeeping shared by both sides of a link
//!
//! Each offer opens a new revision. Candidates are only meaningful for the
//! revision they were gathered for and can only be applied once that
//! revision's remote description is in place, so they are parked here until
//! then. The classification helpers decide what an incoming offer, answer or
//! join means for the current link without touching any connection.

use std::collections::{BTreeMap, HashSet};

use crate::signaling::IceCandidate;

/// Candidates buffered across all revisions before new ones are dropped
pub const MAX_PENDING_CANDIDATES: usize = 64;

/// What to do with an incoming candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateAction {
    /// Apply to the connection now
    Apply,
    /// Held until the remote description for its revision is applied
    Buffered,
    /// Already applied or already buffered
    Duplicate,
    /// Belongs to a superseded revision
    Stale,
    /// Buffer full
    Dropped,
}

/// Per-link candidate state
#[derive(Debug, Default)]
pub struct Negotiation {
    revision: u32,
    remote_applied: bool,
    pending: BTreeMap<u32, Vec<IceCandidate>>,
    applied: HashSet<IceCandidate>,
}

impl Negotiation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Revision currently being negotiated (0 before the first offer)
    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn is_remote_applied(&self) -> bool {
        self.remote_applied
    }

    /// Number of candidates waiting for a remote description
    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Open `revision`, discarding everything that belongs to older ones
    pub fn begin(&mut self, revision: u32) {
        self.revision = revision;
        self.remote_applied = false;
        self.applied.clear();
        self.pending = self.pending.split_off(&revision);
    }

    /// Record that the remote description for the current revision is set
    ///
    /// Returns the buffered candidates that must now be applied, in arrival
    /// order.
    pub fn mark_remote_applied(&mut self) -> Vec<IceCandidate> {
        self.remote_applied = true;
        let buffered = self.pending.remove(&self.revision).unwrap_or_default();
        buffered
            .into_iter()
            .filter(|c| self.applied.insert(c.clone()))
            .collect()
    }

    /// Classify a candidate produced for `revision`
    pub fn accept(&mut self, revision: u32, candidate: IceCandidate) -> CandidateAction {
        if revision < self.revision {
            return CandidateAction::Stale;
        }

        if revision == self.revision && self.remote_applied {
            return if self.applied.insert(candidate) {
                CandidateAction::Apply
            } else {
                CandidateAction::Duplicate
            };
        }

        let total = self.pending_count();
        let bucket = self.pending.entry(revision).or_default();
        if bucket.contains(&candidate) {
            CandidateAction::Duplicate
        } else if total >= MAX_PENDING_CANDIDATES {
            CandidateAction::Dropped
        } else {
            bucket.push(candidate);
            CandidateAction::Buffered
        }
    }

    /// Forget all buffered and applied candidates
    pub fn reset(&mut self) {
        self.remote_applied = false;
        self.pending.clear();
        self.applied.clear();
    }
}

/// How a viewer treats an incoming offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferDisposition {
    Accept,
    /// Addressed to another instance of this viewer
    Foreign,
    /// Older than the last applied offer
    Stale,
    /// Same revision as the last applied offer
    Duplicate,
}

/// Classify an offer against the viewer's own instance and last applied revision
pub fn classify_offer(
    own_instance: &str,
    last_revision: u32,
    instance: &str,
    revision: u32,
) -> OfferDisposition {
    if instance != own_instance {
        OfferDisposition::Foreign
    } else if revision < last_revision {
        OfferDisposition::Stale
    } else if revision == last_revision {
        OfferDisposition::Duplicate
    } else {
        OfferDisposition::Accept
    }
}

/// How the broadcaster treats an incoming answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerDisposition {
    Apply,
    Foreign,
    Stale,
    Duplicate,
}

/// Classify an answer against the link's pending offer
pub fn classify_answer(
    link_instance: &str,
    link_revision: u32,
    remote_applied: bool,
    instance: &str,
    revision: u32,
) -> AnswerDisposition {
    if instance != link_instance {
        AnswerDisposition::Foreign
    } else if revision != link_revision {
        AnswerDisposition::Stale
    } else if remote_applied {
        AnswerDisposition::Duplicate
    } else {
        AnswerDisposition::Apply
    }
}

/// How the broadcaster treats a join for a viewer it already knows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinDisposition {
    /// New instance or newer epoch: the current negotiation is obsolete
    Supersede,
    /// Re-announcement of what the link already serves
    Duplicate,
}

pub fn classify_join(link_instance: &str, link_epoch: u32, instance: &str, epoch: u32) -> JoinDisposition {
    if instance != link_instance || epoch > link_epoch {
        JoinDisposition::Supersede
    } else {
        JoinDisposition::Duplicate
    }
}
