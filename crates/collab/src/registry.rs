//! Per-document serializer registry
//!
//! One tokio task per document id owns that document's `Document`; every
//! mutation flows through the task's command channel, so submits for the
//! same document are strictly ordered and never interleave. Documents are
//! created on first join (seeded from registered default content) and
//! disposed when the last participant leaves. Sessions on different
//! documents never block each other.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use tandem_core::{DocumentId, Participant, ParticipantId, ParticipantUpdate};

use crate::document::{AcceptedOperation, Document, Snapshot, SubmitRejection, DEFAULT_MAX_HISTORY};
use crate::CollabError;
use ot::Operation;

const COMMAND_BUFFER: usize = 64;
pub const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Event fanned out to every subscriber of one document.
#[derive(Debug, Clone)]
pub enum DocEvent {
    /// An operation was accepted; carries the transformed form.
    Operation(AcceptedOperation),
    /// A participant's live fields changed.
    Presence(ParticipantUpdate),
    /// A participant joined with a full identity.
    ParticipantJoined(Participant),
    /// A participant left.
    ParticipantLeft(ParticipantId),
}

enum DocCommand {
    Join {
        participant: Participant,
        reply: oneshot::Sender<Snapshot>,
    },
    Snapshot {
        reply: oneshot::Sender<Snapshot>,
    },
    Submit {
        op: Operation,
        reply: oneshot::Sender<Result<AcceptedOperation, SubmitRejection>>,
    },
    Presence {
        update: ParticipantUpdate,
    },
    Leave {
        participant: ParticipantId,
        reply: oneshot::Sender<usize>,
    },
}

/// Handle to one document's serializer task. Cheap to clone; all access is
/// serialized through the task's command channel.
#[derive(Clone)]
pub struct DocumentHandle {
    id: DocumentId,
    commands: mpsc::Sender<DocCommand>,
    events: broadcast::Sender<DocEvent>,
}

impl DocumentHandle {
    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    /// Add the participant and return a consistent snapshot in one step.
    pub async fn join(&self, participant: Participant) -> Result<Snapshot, CollabError> {
        let (reply, rx) = oneshot::channel();
        self.send(DocCommand::Join { participant, reply }).await?;
        rx.await.map_err(|_| self.closed())
    }

    pub async fn snapshot(&self) -> Result<Snapshot, CollabError> {
        let (reply, rx) = oneshot::channel();
        self.send(DocCommand::Snapshot { reply }).await?;
        rx.await.map_err(|_| self.closed())
    }

    /// Submit an operation for acceptance. The await spans only this
    /// document's serializer; other documents are unaffected.
    pub async fn submit(&self, op: Operation) -> Result<AcceptedOperation, CollabError> {
        let (reply, rx) = oneshot::channel();
        self.send(DocCommand::Submit { op, reply }).await?;
        let outcome = rx.await.map_err(|_| self.closed())?;
        Ok(outcome?)
    }

    /// Fire-and-forget presence update. Dropped (not queued) when the
    /// serializer is saturated; presence is visual-only and the next update
    /// supersedes this one anyway.
    pub fn update_presence(&self, update: ParticipantUpdate) {
        if let Err(err) = self.commands.try_send(DocCommand::Presence { update }) {
            debug!(doc = %self.id, "presence update dropped: {err}");
        }
    }

    /// Remove the participant; returns how many remain.
    pub async fn leave(&self, participant: ParticipantId) -> Result<usize, CollabError> {
        let (reply, rx) = oneshot::channel();
        self.send(DocCommand::Leave { participant, reply }).await?;
        rx.await.map_err(|_| self.closed())
    }

    /// Subscribe to this document's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<DocEvent> {
        self.events.subscribe()
    }

    async fn send(&self, cmd: DocCommand) -> Result<(), CollabError> {
        self.commands.send(cmd).await.map_err(|_| self.closed())
    }

    fn closed(&self) -> CollabError {
        CollabError::DocumentClosed(self.id.clone())
    }
}

struct DocEntry {
    handle: DocumentHandle,
    /// Connections currently holding this document open. Counted under the
    /// `docs` write lock, so open and dispose can never interleave.
    connections: usize,
}

/// Registry of live document serializers, keyed by document id.
pub struct DocumentRegistry {
    docs: RwLock<HashMap<DocumentId, DocEntry>>,
    /// Default content used when a document is first opened.
    seeds: RwLock<HashMap<DocumentId, String>>,
    max_history: usize,
    broadcast_capacity: usize,
}

impl DocumentRegistry {
    pub fn new(max_history: usize, broadcast_capacity: usize) -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            seeds: RwLock::new(HashMap::new()),
            max_history,
            broadcast_capacity,
        }
    }

    /// Register the content a document starts from when first opened. Seeding
    /// an already-open document is ignored; the live copy is authoritative.
    pub fn seed(&self, id: DocumentId, content: impl Into<String>) {
        if self.docs.read().contains_key(&id) {
            warn!(doc = %id, "seed ignored for open document");
            return;
        }
        self.seeds.write().insert(id, content.into());
    }

    /// Get the live handle, creating the serializer on first use. Every
    /// `open` counts one connection and must be paired with one `leave`.
    pub fn open(&self, id: &DocumentId) -> DocumentHandle {
        let mut docs = self.docs.write();
        if let Some(entry) = docs.get_mut(id) {
            entry.connections += 1;
            return entry.handle.clone();
        }

        let seed = self.seeds.read().get(id).cloned().unwrap_or_default();
        let document = Document::with_max_history(id.clone(), seed, self.max_history);
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (events, _) = broadcast::channel(self.broadcast_capacity);

        let handle = DocumentHandle {
            id: id.clone(),
            commands,
            events: events.clone(),
        };
        docs.insert(
            id.clone(),
            DocEntry {
                handle: handle.clone(),
                connections: 1,
            },
        );
        debug!(doc = %id, "document serializer started");

        tokio::spawn(run_document(document, command_rx, events));
        handle
    }

    pub fn get(&self, id: &DocumentId) -> Option<DocumentHandle> {
        self.docs.read().get(id).map(|entry| entry.handle.clone())
    }

    /// Remove the participant and release the connection's hold. The
    /// serializer is disposed when the last connection releases it; the
    /// decision is made under the same lock `open` counts under, so a
    /// concurrent open keeps the document alive.
    pub async fn leave(
        &self,
        id: &DocumentId,
        participant: ParticipantId,
    ) -> Result<(), CollabError> {
        let handle = self
            .get(id)
            .ok_or_else(|| CollabError::DocumentClosed(id.clone()))?;
        handle.leave(participant).await?;

        let mut docs = self.docs.write();
        if let Some(entry) = docs.get_mut(id) {
            entry.connections = entry.connections.saturating_sub(1);
            if entry.connections == 0 {
                docs.remove(id);
                debug!(doc = %id, "document serializer disposed (no connections)");
            }
        }
        Ok(())
    }

    pub fn open_documents(&self) -> Vec<DocumentId> {
        self.docs.read().keys().cloned().collect()
    }
}

impl Default for DocumentRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HISTORY, DEFAULT_BROADCAST_CAPACITY)
    }
}

/// The serializer loop: exclusive owner of one `Document`.
async fn run_document(
    mut document: Document,
    mut commands: mpsc::Receiver<DocCommand>,
    events: broadcast::Sender<DocEvent>,
) {
    while let Some(cmd) = commands.recv().await {
        match cmd {
            DocCommand::Join { participant, reply } => {
                document.add_participant(participant.clone());
                let _ = events.send(DocEvent::ParticipantJoined(participant));
                let _ = reply.send(document.snapshot());
            }
            DocCommand::Snapshot { reply } => {
                let _ = reply.send(document.snapshot());
            }
            DocCommand::Submit { op, reply } => {
                let outcome = document.submit(op);
                if let Ok(accepted) = &outcome {
                    let _ = events.send(DocEvent::Operation(accepted.clone()));
                } else if let Err(rejection) = &outcome {
                    debug!(doc = %document.id(), "submit rejected: {rejection}");
                }
                // a disconnected submitter does not affect the document; the
                // operation is already fully accepted or not applied at all
                let _ = reply.send(outcome);
            }
            DocCommand::Presence { update } => match document.merge_participant_update(&update) {
                Ok(true) => {
                    let _ = events.send(DocEvent::Presence(update));
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(doc = %document.id(), "presence update dropped: {err}");
                }
            },
            DocCommand::Leave { participant, reply } => {
                if document.remove_participant(participant) {
                    let _ = events.send(DocEvent::ParticipantLeft(participant));
                }
                let _ = reply.send(document.participant_count());
            }
        }
    }
    debug!(doc = %document.id(), "document serializer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use ot::EditOp;
    use tandem_core::{ParticipantColor, ParticipantInfo};

    fn participant(name: &str) -> Participant {
        Participant::new(ParticipantInfo::new(name, ParticipantColor::from_index(1)))
    }

    #[tokio::test]
    async fn test_join_creates_and_seeds_document() {
        let registry = DocumentRegistry::default();
        registry.seed(DocumentId::from("index.html"), "<html></html>");

        let handle = registry.open(&DocumentId::from("index.html"));
        let snap = handle.join(participant("ada")).await.unwrap();
        assert_eq!(snap.content, "<html></html>");
        assert_eq!(snap.revision, 0);
        assert_eq!(snap.participants.len(), 1);
    }

    #[tokio::test]
    async fn test_submits_are_serialized_and_broadcast() {
        let registry = DocumentRegistry::default();
        let id = DocumentId::from("main.rs");
        registry.seed(id.clone(), "abc");

        let handle = registry.open(&id);
        let ada = participant("ada");
        let grace = participant("grace");
        let (ada_id, grace_id) = (ada.id, grace.id);
        handle.join(ada).await.unwrap();
        let mut events = handle.subscribe();
        handle.join(grace).await.unwrap();

        // both writers base their edits on revision 0
        let a = handle
            .submit(Operation::insert(ada_id, 0, 1, "X"))
            .await
            .unwrap();
        let b = handle
            .submit(Operation::insert(grace_id, 0, 2, "Y"))
            .await
            .unwrap();
        assert_eq!(a.revision, 1);
        assert_eq!(b.revision, 2);
        assert_eq!(b.edits, vec![EditOp::insert(3, "Y")]);

        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.content, "aXbYc");

        // subscriber saw grace's join and both accepted operations in order
        assert!(matches!(events.recv().await.unwrap(), DocEvent::ParticipantJoined(_)));
        match events.recv().await.unwrap() {
            DocEvent::Operation(op) => assert_eq!(op.revision, 1),
            other => panic!("unexpected event: {other:?}"),
        }
        match events.recv().await.unwrap() {
            DocEvent::Operation(op) => assert_eq!(op.revision, 2),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disposed_on_last_leave() {
        let registry = DocumentRegistry::default();
        let id = DocumentId::from("style.css");

        let handle = registry.open(&id);
        let ada = participant("ada");
        let ada_id = ada.id;
        handle.join(ada).await.unwrap();
        assert_eq!(registry.open_documents(), vec![id.clone()]);

        registry.leave(&id, ada_id).await.unwrap();
        assert!(registry.get(&id).is_none());
    }

    #[tokio::test]
    async fn test_open_during_leave_keeps_document_alive() {
        let registry = DocumentRegistry::default();
        let id = DocumentId::from("main.rs");

        let first = registry.open(&id);
        let ada = participant("ada");
        let ada_id = ada.id;
        first.join(ada).await.unwrap();

        // a second connection arrives while the first is on its way out
        let second = registry.open(&id);
        registry.leave(&id, ada_id).await.unwrap();

        // the document must survive: the newcomer already holds it open
        assert!(registry.get(&id).is_some());
        let grace = participant("grace");
        let grace_id = grace.id;
        let snap = second.join(grace).await.unwrap();
        assert_eq!(snap.participants.len(), 1);

        // and there is exactly one serializer: both handles see one state
        registry.leave(&id, grace_id).await.unwrap();
        assert!(registry.get(&id).is_none());
    }

    #[tokio::test]
    async fn test_documents_are_independent() {
        let registry = DocumentRegistry::default();
        let a = registry.open(&DocumentId::from("a"));
        let b = registry.open(&DocumentId::from("b"));

        let author = ParticipantId::new();
        a.submit(Operation::insert(author, 0, 0, "a")).await.unwrap();
        b.submit(Operation::insert(author, 0, 0, "b")).await.unwrap();

        assert_eq!(a.snapshot().await.unwrap().content, "a");
        assert_eq!(b.snapshot().await.unwrap().content, "b");
    }

    #[tokio::test]
    async fn test_presence_requires_known_participant() {
        let registry = DocumentRegistry::default();
        let id = DocumentId::from("a");
        let handle = registry.open(&id);

        let ada = participant("ada");
        let ada_id = ada.id;
        handle.join(ada).await.unwrap();
        let mut events = handle.subscribe();

        // unknown participant: merged update is dropped, no event
        handle.update_presence(ParticipantUpdate::empty(ParticipantId::new()));
        // known participant: event fans out
        handle.update_presence(ParticipantUpdate::cursor(
            ada_id,
            tandem_core::CursorPosition { line: 1, column: 4 },
        ));

        match events.recv().await.unwrap() {
            DocEvent::Presence(update) => assert_eq!(update.id, ada_id),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
