//! Client session lifecycle
//!
//! Tracks, per document, where this connection stands: detached, waiting for
//! an identity (a joiner must pick a name before editing), synchronizing
//! from a snapshot, or live. While live, at most one locally-originated
//! operation is in flight; further local edits compose into a buffer that is
//! sent once the in-flight one is acknowledged. A reconnect drops both slots
//! rather than risk double-applying an edit the server may already hold.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use tandem_core::{DocumentId, ParticipantInfo, Revision};

use crate::document::AcceptedOperation;
use crate::protocol::ClientMessage;
use crate::CollabError;
use ot::{EditOp, Operation};

/// Where a document's session stands for this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocSessionState {
    /// Not participating; edits stay local.
    Detached,
    /// Joining an existing collaboration but no display identity yet;
    /// content editing is blocked.
    Prompting,
    /// Snapshot requested, not yet received.
    Syncing,
    /// Receiving operations and submitting local edits.
    Live,
}

#[derive(Debug)]
struct DocSession {
    state: DocSessionState,
    /// Last revision acknowledged by the engine.
    acked_revision: Revision,
    /// The one local operation awaiting acknowledgment.
    pending: Option<Operation>,
    /// Local edits made while `pending` is in flight.
    buffer: Option<Operation>,
}

impl DocSession {
    fn new(state: DocSessionState) -> Self {
        Self {
            state,
            acked_revision: 0,
            pending: None,
            buffer: None,
        }
    }

    fn discard_in_flight(&mut self) {
        if self.pending.is_some() || self.buffer.is_some() {
            info!("discarding unacknowledged local edits (resync)");
        }
        self.pending = None;
        self.buffer = None;
    }
}

/// Binds one connection to one participant identity across the documents it
/// has open.
pub struct SessionManager {
    identity: Option<ParticipantInfo>,
    /// Collaboration mode engaged (vs. solo local editing).
    is_active: bool,
    docs: HashMap<DocumentId, DocSession>,
}

impl SessionManager {
    /// A session that already knows who it is (e.g. the collaboration's
    /// creator); joins go straight to Syncing.
    pub fn new(identity: ParticipantInfo) -> Self {
        Self {
            identity: Some(identity),
            is_active: false,
            docs: HashMap::new(),
        }
    }

    /// A joiner that must still pick a display identity; joins sit in
    /// Prompting until `provide_identity`.
    pub fn prompting() -> Self {
        Self {
            identity: None,
            is_active: false,
            docs: HashMap::new(),
        }
    }

    pub fn identity(&self) -> Option<&ParticipantInfo> {
        self.identity.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    /// Turn collaboration mode on/off. Deactivating detaches every document;
    /// editing reverts to local-only.
    pub fn set_active(&mut self, active: bool) {
        self.is_active = active;
        if !active {
            for (doc, session) in self.docs.iter_mut() {
                debug!(doc = %doc, "detached (collaboration off)");
                session.state = DocSessionState::Detached;
                session.discard_in_flight();
            }
        }
    }

    pub fn state(&self, doc: &DocumentId) -> DocSessionState {
        self.docs
            .get(doc)
            .map(|s| s.state)
            .unwrap_or(DocSessionState::Detached)
    }

    pub fn acked_revision(&self, doc: &DocumentId) -> Revision {
        self.docs.get(doc).map(|s| s.acked_revision).unwrap_or(0)
    }

    /// Open a document. Returns the join message to send, or `None` while
    /// the identity prompt is still unanswered.
    pub fn join(&mut self, doc: DocumentId) -> Option<ClientMessage> {
        match &self.identity {
            Some(identity) => {
                self.docs
                    .insert(doc.clone(), DocSession::new(DocSessionState::Syncing));
                Some(ClientMessage::Join {
                    doc,
                    participant: identity.clone(),
                })
            }
            None => {
                self.docs
                    .insert(doc, DocSession::new(DocSessionState::Prompting));
                None
            }
        }
    }

    /// Supply the display identity a joiner was prompted for. Every document
    /// parked in Prompting proceeds to Syncing; the returned join messages
    /// must be sent.
    pub fn provide_identity(&mut self, identity: ParticipantInfo) -> Vec<ClientMessage> {
        self.identity = Some(identity.clone());
        let mut joins = Vec::new();
        for (doc, session) in self.docs.iter_mut() {
            if session.state == DocSessionState::Prompting {
                session.state = DocSessionState::Syncing;
                joins.push(ClientMessage::Join {
                    doc: doc.clone(),
                    participant: identity.clone(),
                });
            }
        }
        joins
    }

    /// A snapshot arrived: the document is now live at `revision`. Any edit
    /// still unacknowledged from before the snapshot is dropped, never
    /// replayed (the snapshot may already contain it).
    pub fn on_snapshot(&mut self, doc: &DocumentId, revision: Revision) {
        let session = self
            .docs
            .entry(doc.clone())
            .or_insert_with(|| DocSession::new(DocSessionState::Syncing));
        session.discard_in_flight();
        session.state = DocSessionState::Live;
        session.acked_revision = revision;
        debug!(doc = %doc, revision, "live");
    }

    /// Record a local edit. Returns the submit message when the edit can go
    /// out immediately; otherwise it is composed into the in-flight buffer.
    pub fn local_edit(
        &mut self,
        doc: &DocumentId,
        edits: Vec<EditOp>,
    ) -> Result<Option<ClientMessage>, CollabError> {
        let session = match self.docs.get_mut(doc) {
            Some(s) => s,
            // solo editing: nothing to send
            None => return Ok(None),
        };
        match session.state {
            DocSessionState::Detached => Ok(None),
            DocSessionState::Prompting => Err(CollabError::IdentityRequired),
            DocSessionState::Syncing => Err(CollabError::Syncing(doc.clone())),
            DocSessionState::Live => {
                let identity = self
                    .identity
                    .as_ref()
                    .ok_or(CollabError::IdentityRequired)?;
                let op = Operation::new(identity.id, session.acked_revision, edits);
                if session.pending.is_none() {
                    session.pending = Some(op.clone());
                    Ok(Some(ClientMessage::Submit {
                        doc: doc.clone(),
                        operation: op,
                    }))
                } else {
                    session.buffer = Some(match session.buffer.take() {
                        Some(buffered) => buffered.compose(op),
                        None => op,
                    });
                    Ok(None)
                }
            }
        }
    }

    /// The in-flight operation was accepted. Returns the buffered follow-up
    /// submit, when there is one.
    ///
    /// The acknowledged revision only ever moves forward: a lag-triggered
    /// snapshot can race ahead of a late ack on the wire, and regressing
    /// would make the next local edit claim a base the content is already
    /// past.
    pub fn on_ack(&mut self, doc: &DocumentId, revision: Revision) -> Option<ClientMessage> {
        let session = self.docs.get_mut(doc)?;
        session.acked_revision = session.acked_revision.max(revision);
        session.pending = None;
        let mut buffered = session.buffer.take()?;
        buffered.base_revision = session.acked_revision;
        session.pending = Some(buffered.clone());
        Some(ClientMessage::Submit {
            doc: doc.clone(),
            operation: buffered,
        })
    }

    /// A remote accepted operation arrived. Transforms it against the
    /// in-flight and buffered local edits (and them against it), so the
    /// local preview and the eventual server state converge. Returns the
    /// edits to apply to the local view.
    ///
    /// An operation at or below the acknowledged revision is already
    /// reflected in the local content (a snapshot and the broadcast stream
    /// can overlap around a join or a resync) and yields no edits; applying
    /// it again would diverge the replica permanently.
    pub fn on_remote_operation(
        &mut self,
        doc: &DocumentId,
        accepted: &AcceptedOperation,
    ) -> Vec<EditOp> {
        let Some(session) = self.docs.get_mut(doc) else {
            return accepted.edits.clone();
        };
        if session.state != DocSessionState::Live {
            // the snapshot that ends Syncing will already contain this
            return Vec::new();
        }
        if accepted.revision <= session.acked_revision {
            debug!(
                doc = %doc,
                revision = accepted.revision,
                acked = session.acked_revision,
                "operation already reflected; skipping"
            );
            return Vec::new();
        }
        session.acked_revision = accepted.revision;

        let mut remote = accepted.as_operation();
        for slot in [&mut session.pending, &mut session.buffer] {
            if let Some(local) = slot {
                let local_rebased = ot::transform_operation(local, &remote);
                let remote_rebased = ot::transform_operation(&remote, local);
                local.edits = local_rebased;
                // once transformed locally, the op targets the new revision;
                // the server must not transform it against `remote` again
                local.base_revision = accepted.revision;
                remote.edits = remote_rebased;
            }
        }
        remote.edits
    }

    /// The submit was rejected as stale or malformed: drop it and resync.
    pub fn on_rejected(&mut self, doc: &DocumentId) -> Option<ClientMessage> {
        let session = self.docs.get_mut(doc)?;
        warn!(doc = %doc, "submit rejected; resynchronizing from snapshot");
        session.discard_in_flight();
        session.state = DocSessionState::Syncing;
        Some(ClientMessage::Resync { doc: doc.clone() })
    }

    /// Transport dropped. Every live document goes back to Syncing and
    /// unacknowledged edits are discarded; the returned messages re-request
    /// snapshots once the transport is back.
    pub fn on_disconnect(&mut self) -> Vec<ClientMessage> {
        let mut resyncs = Vec::new();
        for (doc, session) in self.docs.iter_mut() {
            if matches!(session.state, DocSessionState::Live | DocSessionState::Syncing) {
                session.discard_in_flight();
                session.state = DocSessionState::Syncing;
                resyncs.push(ClientMessage::Resync { doc: doc.clone() });
            }
        }
        resyncs
    }

    /// Close a document for this connection.
    pub fn detach(&mut self, doc: &DocumentId) -> Option<ClientMessage> {
        let session = self.docs.remove(doc)?;
        let id = self.identity.as_ref()?.id;
        match session.state {
            DocSessionState::Detached | DocSessionState::Prompting => None,
            _ => Some(ClientMessage::Leave {
                doc: doc.clone(),
                participant: id,
            }),
        }
    }

    pub fn open_documents(&self) -> impl Iterator<Item = &DocumentId> {
        self.docs.keys()
    }

    pub fn has_pending(&self, doc: &DocumentId) -> bool {
        self.docs
            .get(doc)
            .map(|s| s.pending.is_some())
            .unwrap_or(false)
    }
}
