//! Per-document authoritative state
//!
//! A `Document` owns the one true copy of its content. `submit` is the sole
//! mutator: it transforms an incoming operation against everything accepted
//! since the author last synced, applies it, and advances the revision by
//! exactly one. Content always equals the seed content with every accepted
//! operation applied exactly once, in revision order.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tandem_core::{
    DocumentId, OperationId, Participant, ParticipantId, ParticipantUpdate, Revision,
};

use crate::CollabError;
use ot::{EditOp, Operation, OtError};

/// How many accepted operations are retained for transforming late arrivals.
/// A submit based on a revision older than this window is rejected as stale.
pub const DEFAULT_MAX_HISTORY: usize = 256;

/// An operation after acceptance: the transformed edits plus the revision
/// they produced. This, not the author's original, is what gets broadcast,
/// so every replica transforms and applies identically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptedOperation {
    pub id: OperationId,
    pub author: ParticipantId,
    /// The revision the author based the edit on, kept for tie-breaking.
    pub base_revision: Revision,
    /// Edits as actually applied (post-transform).
    pub edits: Vec<EditOp>,
    /// Document revision after this operation.
    pub revision: Revision,
}

impl AcceptedOperation {
    /// View as an operation, e.g. for transforming later arrivals against it.
    pub fn as_operation(&self) -> Operation {
        Operation {
            id: self.id,
            author: self.author,
            base_revision: self.base_revision,
            edits: self.edits.clone(),
        }
    }
}

/// Consistent point-in-time view of a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub content: String,
    pub revision: Revision,
    pub participants: Vec<Participant>,
}

/// Why a submit was not accepted.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum SubmitRejection {
    #[error("operation {0} was already applied")]
    Duplicate(OperationId),
    #[error("base revision {base} is ahead of document revision {current}")]
    FutureRevision { base: Revision, current: Revision },
    #[error("base revision {base} predates retained history (oldest transformable base: {oldest})")]
    Stale { base: Revision, oldest: Revision },
    #[error(transparent)]
    OutOfBounds(#[from] OtError),
}

/// Authoritative state for one shared document.
pub struct Document {
    id: DocumentId,
    content: String,
    revision: Revision,
    participants: HashMap<ParticipantId, Participant>,
    /// Recently accepted operations, newest at the back (transform window).
    history: VecDeque<AcceptedOperation>,
    /// Ids of the operations still in the transform window, for idempotent
    /// submits. Older duplicates carry a base revision the staleness check
    /// rejects before they could reapply.
    applied: HashSet<OperationId>,
    max_history: usize,
}

impl Document {
    pub fn new(id: DocumentId, seed_content: impl Into<String>) -> Self {
        Self::with_max_history(id, seed_content, DEFAULT_MAX_HISTORY)
    }

    pub fn with_max_history(
        id: DocumentId,
        seed_content: impl Into<String>,
        max_history: usize,
    ) -> Self {
        Self {
            id,
            content: seed_content.into(),
            revision: 0,
            participants: HashMap::new(),
            history: VecDeque::new(),
            applied: HashSet::new(),
            max_history,
        }
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// Point-in-time view; never exposes a partially applied revision
    /// (submit replaces content and bumps the revision in one step).
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            content: self.content.clone(),
            revision: self.revision,
            participants: self.participants.values().cloned().collect(),
        }
    }

    /// Accept an operation: transform it against everything accepted since
    /// its base revision, apply it, and advance the revision by one.
    ///
    /// The sole mutator of `content`/`revision`. An operation is either
    /// fully applied or not applied at all.
    pub fn submit(&mut self, op: Operation) -> Result<AcceptedOperation, SubmitRejection> {
        if self.applied.contains(&op.id) {
            return Err(SubmitRejection::Duplicate(op.id));
        }
        if op.base_revision > self.revision {
            return Err(SubmitRejection::FutureRevision {
                base: op.base_revision,
                current: self.revision,
            });
        }

        let mut edits = op.edits.clone();
        if op.base_revision < self.revision {
            // Transform against every intervening accepted operation, in
            // revision order.
            let oldest_transformable = self.oldest_transformable_base();
            if op.base_revision < oldest_transformable {
                return Err(SubmitRejection::Stale {
                    base: op.base_revision,
                    oldest: oldest_transformable,
                });
            }
            for past in self.history.iter().filter(|a| a.revision > op.base_revision) {
                let incoming_first =
                    (op.base_revision, op.author) < (past.base_revision, past.author);
                edits = ot::transform_edits(edits, &past.edits, incoming_first);
            }
        }

        let next_content = ot::apply_edits(&self.content, &edits)?;
        self.content = next_content;
        self.revision += 1;
        self.applied.insert(op.id);

        let accepted = AcceptedOperation {
            id: op.id,
            author: op.author,
            base_revision: op.base_revision,
            edits,
            revision: self.revision,
        };
        self.history.push_back(accepted.clone());
        while self.history.len() > self.max_history {
            // an id outside the window can only come back with a base
            // revision the staleness check rejects first, so dropping it
            // keeps submits idempotent without unbounded growth
            if let Some(evicted) = self.history.pop_front() {
                self.applied.remove(&evicted.id);
            }
        }

        if let Some(author) = self.participants.get_mut(&op.author) {
            author.touch();
        }

        tracing::debug!(
            doc = %self.id,
            revision = self.revision,
            author = %op.author,
            "accepted operation"
        );
        Ok(accepted)
    }

    /// The oldest base revision a submit can still be transformed from.
    fn oldest_transformable_base(&self) -> Revision {
        match self.history.front() {
            Some(front) => front.revision - 1,
            None => self.revision,
        }
    }

    pub fn add_participant(&mut self, participant: Participant) {
        tracing::debug!(doc = %self.id, participant = %participant.id, "participant joined");
        self.participants.insert(participant.id, participant);
    }

    /// Merge only the fields present in the update. Fails (recoverably) when
    /// the participant is unknown: the caller should repair via a snapshot
    /// rather than have the roster fabricate a partial identity.
    pub fn merge_participant_update(
        &mut self,
        update: &ParticipantUpdate,
    ) -> Result<bool, CollabError> {
        match self.participants.get_mut(&update.id) {
            Some(participant) => Ok(participant.merge(update)),
            None => Err(CollabError::RosterInconsistency(update.id)),
        }
    }

    pub fn remove_participant(&mut self, id: ParticipantId) -> bool {
        let removed = self.participants.remove(&id).is_some();
        if removed {
            tracing::debug!(doc = %self.id, participant = %id, "participant left");
        }
        removed
    }

    pub fn participant(&self, id: ParticipantId) -> Option<&Participant> {
        self.participants.get(&id)
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }
}
