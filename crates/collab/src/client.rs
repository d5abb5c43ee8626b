//! Collaboration client
//!
//! Ties the session state machine, the presence tracker and the content
//! cache to a transport. `CollabClient` is transport-generic so tests drive
//! it with a scripted transport; `WsTransport` is the real WebSocket one.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, warn};

use tandem_core::{
    CursorPosition, DocumentId, ParticipantColor, ParticipantId, ParticipantInfo,
    ParticipantUpdate, Revision, SelectionRange,
};

use crate::document::SubmitRejection;
use crate::presence::PresenceTracker;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::SessionManager;
use crate::sync::{DocumentCache, EditingSurface};
use crate::CollabError;
use ot::EditOp;

/// Message-oriented connection to the engine.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, message: ClientMessage) -> Result<(), CollabError>;
    /// Next message, or `None` once the connection is closed.
    async fn recv(&mut self) -> Option<ServerMessage>;
}

/// WebSocket transport: JSON text frames over tokio-tungstenite, with the
/// socket split into a reader and a writer task.
pub struct WsTransport {
    outgoing: mpsc::Sender<ClientMessage>,
    incoming: mpsc::Receiver<ServerMessage>,
}

impl WsTransport {
    pub async fn connect(url: &str) -> Result<Self, CollabError> {
        let (socket, _) = connect_async(url)
            .await
            .map_err(|e| CollabError::Transport(e.to_string()))?;
        let (mut sink, mut stream) = socket.split();

        let (outgoing, mut outgoing_rx) = mpsc::channel::<ClientMessage>(64);
        let (incoming_tx, incoming) = mpsc::channel::<ServerMessage>(64);

        tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(e) => {
                        error!(%e, "failed to encode message");
                        continue;
                    }
                };
                if sink.send(WsMessage::Text(json)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str(&text) {
                        Ok(message) => {
                            if incoming_tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(%e, "discarding malformed frame"),
                    },
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            // dropping incoming_tx surfaces the close to the client
        });

        Ok(Self { outgoing, incoming })
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, message: ClientMessage) -> Result<(), CollabError> {
        self.outgoing
            .send(message)
            .await
            .map_err(|_| CollabError::Transport("connection closed".into()))
    }

    async fn recv(&mut self) -> Option<ServerMessage> {
        self.incoming.recv().await
    }
}

/// What `poll` surfaces to the embedding editor.
#[derive(Debug)]
pub enum ClientEvent {
    /// A document finished (re)synchronizing and is live.
    Synced { doc: DocumentId, revision: Revision },
    /// A remote operation was applied locally.
    RemoteEdit { doc: DocumentId, edits: Vec<EditOp> },
    /// The engine accepted one of our submits.
    Acknowledged { doc: DocumentId, revision: Revision },
    /// Someone joined or left.
    RosterChanged { doc: DocumentId },
    /// A remote cursor or selection moved.
    PresenceChanged { doc: DocumentId },
    /// A submit was refused; a resync has been requested.
    Rejected {
        doc: DocumentId,
        rejection: SubmitRejection,
    },
    ServerError { message: String },
    Disconnected,
}

pub struct CollabClient<T: Transport> {
    transport: T,
    local_id: ParticipantId,
    session: SessionManager,
    presence: PresenceTracker,
    cache: DocumentCache,
}

impl<T: Transport> CollabClient<T> {
    /// Client for the collaboration's creator, whose identity is known up
    /// front.
    pub fn new(transport: T, identity: ParticipantInfo) -> Self {
        let local_id = identity.id;
        let mut session = SessionManager::new(identity);
        session.set_active(true);
        Self {
            transport,
            local_id,
            session,
            presence: PresenceTracker::new(local_id),
            cache: DocumentCache::new(),
        }
    }

    /// Client for a joiner who must still pick a display identity; joins
    /// queue up until `provide_identity`.
    pub fn joining(transport: T) -> Self {
        let local_id = ParticipantId::new();
        let mut session = SessionManager::prompting();
        session.set_active(true);
        Self {
            transport,
            local_id,
            session,
            presence: PresenceTracker::new(local_id),
            cache: DocumentCache::new(),
        }
    }

    pub fn local_id(&self) -> ParticipantId {
        self.local_id
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn cache(&self) -> &DocumentCache {
        &self.cache
    }

    pub async fn join(&mut self, doc: DocumentId) -> Result<(), CollabError> {
        if let Some(message) = self.session.join(doc) {
            self.transport.send(message).await?;
        }
        Ok(())
    }

    /// Answer the identity prompt. The identity keeps the connection's
    /// participant id, so presence filtering stays consistent.
    pub async fn provide_identity(
        &mut self,
        name: impl Into<String>,
        color: ParticipantColor,
    ) -> Result<(), CollabError> {
        let identity = ParticipantInfo::with_id(self.local_id, name, color);
        for message in self.session.provide_identity(identity) {
            self.transport.send(message).await?;
        }
        Ok(())
    }

    /// Seed the engine with content for a document it has never held.
    pub async fn seed_document(
        &mut self,
        doc: DocumentId,
        content: String,
    ) -> Result<(), CollabError> {
        self.transport
            .send(ClientMessage::SeedDocument { doc, content })
            .await
    }

    /// A local edit the surface has already applied. Submits it (or buffers
    /// it behind the in-flight one) and updates the cache.
    pub async fn edit(
        &mut self,
        doc: &DocumentId,
        edits: Vec<EditOp>,
        surface: &dyn EditingSurface,
    ) -> Result<(), CollabError> {
        if let Some(message) = self.session.local_edit(doc, edits)? {
            self.transport.send(message).await?;
        }
        self.cache.note_local(doc, surface);
        Ok(())
    }

    pub async fn move_cursor(
        &mut self,
        doc: &DocumentId,
        cursor: CursorPosition,
        selection: Option<SelectionRange>,
    ) -> Result<(), CollabError> {
        let identity = self
            .session
            .identity()
            .ok_or(CollabError::IdentityRequired)?;
        let mut update = ParticipantUpdate::cursor(identity.id, cursor);
        update.selection = selection;
        self.transport
            .send(ClientMessage::Presence {
                doc: doc.clone(),
                update,
            })
            .await
    }

    /// Switch the foreground document. Returns the text to display, after
    /// requesting a resync when the cached copy can no longer be trusted.
    pub async fn focus(
        &mut self,
        doc: DocumentId,
        surface: &mut dyn EditingSurface,
    ) -> Result<Option<String>, CollabError> {
        let text = self.cache.focus(doc.clone(), surface);
        if text.is_none() && self.cache.is_stale(&doc) {
            self.transport.send(ClientMessage::Resync { doc }).await?;
        }
        Ok(text)
    }

    pub async fn leave(&mut self, doc: &DocumentId) -> Result<(), CollabError> {
        if let Some(message) = self.session.detach(doc) {
            self.transport.send(message).await?;
        }
        self.presence.forget_document(doc);
        self.cache.forget(doc);
        Ok(())
    }

    /// Drive the connection: wait for the next engine message, fold it into
    /// local state and report what changed. Internal bookkeeping (no-op
    /// presence, follow-up submits) is absorbed without surfacing an event.
    pub async fn poll(
        &mut self,
        surface: &mut dyn EditingSurface,
    ) -> Result<ClientEvent, CollabError> {
        loop {
            let Some(message) = self.transport.recv().await else {
                self.session.on_disconnect();
                return Ok(ClientEvent::Disconnected);
            };
            match message {
                ServerMessage::Snapshot {
                    doc,
                    content,
                    revision,
                    participants,
                } => {
                    self.session.on_snapshot(&doc, revision);
                    self.presence.apply_snapshot(&doc, participants);
                    self.cache.apply_snapshot(&doc, &content, surface);
                    return Ok(ClientEvent::Synced { doc, revision });
                }
                ServerMessage::Ack {
                    doc,
                    operation_id,
                    revision,
                } => {
                    debug!(doc = %doc, %operation_id, revision, "acknowledged");
                    if let Some(followup) = self.session.on_ack(&doc, revision) {
                        self.transport.send(followup).await?;
                    }
                    return Ok(ClientEvent::Acknowledged { doc, revision });
                }
                ServerMessage::Operation { doc, operation } => {
                    let edits = self.session.on_remote_operation(&doc, &operation);
                    self.cache.apply_remote(&doc, &edits, surface);
                    return Ok(ClientEvent::RemoteEdit { doc, edits });
                }
                ServerMessage::Presence { doc, update } => {
                    if self.presence.merge_update(&doc, &update) {
                        return Ok(ClientEvent::PresenceChanged { doc });
                    }
                }
                ServerMessage::ParticipantJoined { doc, participant } => {
                    if self.presence.participant_joined(&doc, participant) {
                        return Ok(ClientEvent::RosterChanged { doc });
                    }
                }
                ServerMessage::ParticipantLeft { doc, participant } => {
                    if self.presence.participant_left(&doc, participant) {
                        return Ok(ClientEvent::RosterChanged { doc });
                    }
                }
                ServerMessage::Rejected {
                    doc,
                    operation_id,
                    rejection,
                } => {
                    warn!(doc = %doc, %operation_id, %rejection, "submit rejected");
                    if let Some(resync) = self.session.on_rejected(&doc) {
                        self.transport.send(resync).await?;
                    }
                    return Ok(ClientEvent::Rejected { doc, rejection });
                }
                ServerMessage::Error { message } => {
                    return Ok(ClientEvent::ServerError { message });
                }
            }
        }
    }

    /// Swap in a fresh transport after a disconnect and re-request
    /// snapshots for every open document.
    pub async fn reconnect(&mut self, transport: T) -> Result<(), CollabError> {
        self.transport = transport;
        let identity = self
            .session
            .identity()
            .cloned()
            .ok_or(CollabError::IdentityRequired)?;
        let docs: Vec<DocumentId> = self.session.open_documents().cloned().collect();
        for doc in docs {
            self.transport
                .send(ClientMessage::Join {
                    doc,
                    participant: identity.clone(),
                })
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use tandem_core::{OperationId, Participant, ParticipantColor, ParticipantId};

    use crate::document::AcceptedOperation;

    /// Replays a scripted sequence of engine messages and records sends.
    struct ScriptedTransport {
        incoming: VecDeque<ServerMessage>,
        sent: Arc<Mutex<Vec<ClientMessage>>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<ServerMessage>) -> (Self, Arc<Mutex<Vec<ClientMessage>>>) {
            let sent = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    incoming: script.into(),
                    sent: sent.clone(),
                },
                sent,
            )
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&mut self, message: ClientMessage) -> Result<(), CollabError> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        async fn recv(&mut self) -> Option<ServerMessage> {
            self.incoming.pop_front()
        }
    }

    #[derive(Default)]
    struct FakeSurface {
        text: String,
    }

    impl EditingSurface for FakeSurface {
        fn current_text(&self) -> String {
            self.text.clone()
        }

        fn replace_text(&mut self, text: &str) {
            self.text = text.to_owned();
        }

        fn apply_edits(&mut self, edits: &[EditOp]) -> bool {
            match ot::apply_edits(&self.text, edits) {
                Ok(updated) => {
                    self.text = updated;
                    true
                }
                Err(_) => false,
            }
        }
    }

    fn identity(name: &str) -> ParticipantInfo {
        ParticipantInfo::new(name, ParticipantColor::from_index(0))
    }

    fn snapshot(doc: &DocumentId, content: &str, revision: Revision) -> ServerMessage {
        ServerMessage::Snapshot {
            doc: doc.clone(),
            content: content.into(),
            revision,
            participants: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_join_syncs_from_snapshot() {
        let doc = DocumentId::from("main.rs");
        let (transport, sent) = ScriptedTransport::new(vec![snapshot(&doc, "hello", 5)]);
        let mut client = CollabClient::new(transport, identity("ada"));
        let mut surface = FakeSurface::default();

        client.join(doc.clone()).await.unwrap();
        client.focus(doc.clone(), &mut surface).await.unwrap();

        let event = client.poll(&mut surface).await.unwrap();
        assert!(matches!(event, ClientEvent::Synced { revision: 5, .. }));
        assert_eq!(surface.text, "hello");
        assert!(matches!(
            sent.lock().unwrap()[0],
            ClientMessage::Join { .. }
        ));
    }

    #[tokio::test]
    async fn test_remote_operation_reaches_the_surface() {
        let doc = DocumentId::from("main.rs");
        let remote = AcceptedOperation {
            id: OperationId::new(),
            author: ParticipantId::new(),
            base_revision: 5,
            edits: vec![EditOp::insert(5, "!")],
            revision: 6,
        };
        let (transport, _sent) = ScriptedTransport::new(vec![
            snapshot(&doc, "hello", 5),
            ServerMessage::Operation {
                doc: doc.clone(),
                operation: remote,
            },
        ]);
        let mut client = CollabClient::new(transport, identity("ada"));
        let mut surface = FakeSurface::default();
        client.join(doc.clone()).await.unwrap();
        client.focus(doc.clone(), &mut surface).await.unwrap();

        client.poll(&mut surface).await.unwrap();
        let event = client.poll(&mut surface).await.unwrap();
        assert!(matches!(event, ClientEvent::RemoteEdit { .. }));
        assert_eq!(surface.text, "hello!");
        assert_eq!(client.session().acked_revision(&doc), 6);
    }

    #[tokio::test]
    async fn test_rejection_triggers_resync() {
        let doc = DocumentId::from("main.rs");
        let op_id = OperationId::new();
        let (transport, sent) = ScriptedTransport::new(vec![
            snapshot(&doc, "abc", 10),
            ServerMessage::Rejected {
                doc: doc.clone(),
                operation_id: op_id,
                rejection: SubmitRejection::Stale {
                    base: 2,
                    oldest: 8,
                },
            },
        ]);
        let mut client = CollabClient::new(transport, identity("ada"));
        let mut surface = FakeSurface::default();
        client.join(doc.clone()).await.unwrap();
        client.focus(doc.clone(), &mut surface).await.unwrap();
        client.poll(&mut surface).await.unwrap();

        client
            .edit(&doc, vec![EditOp::insert(0, "x")], &surface)
            .await
            .unwrap();
        let event = client.poll(&mut surface).await.unwrap();
        assert!(matches!(event, ClientEvent::Rejected { .. }));
        assert!(!client.session().has_pending(&doc));
        assert!(matches!(
            sent.lock().unwrap().last(),
            Some(ClientMessage::Resync { .. })
        ));
    }

    #[tokio::test]
    async fn test_buffered_edit_follows_ack() {
        let doc = DocumentId::from("main.rs");
        let (transport, sent) = ScriptedTransport::new(vec![snapshot(&doc, "", 0)]);
        let mut client = CollabClient::new(transport, identity("ada"));
        let mut surface = FakeSurface::default();
        client.join(doc.clone()).await.unwrap();
        client.focus(doc.clone(), &mut surface).await.unwrap();
        client.poll(&mut surface).await.unwrap();

        surface.text = "a".into();
        client
            .edit(&doc, vec![EditOp::insert(0, "a")], &surface)
            .await
            .unwrap();
        surface.text = "ab".into();
        client
            .edit(&doc, vec![EditOp::insert(1, "b")], &surface)
            .await
            .unwrap();

        // only the first edit went out
        let submits = sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| matches!(m, ClientMessage::Submit { .. }))
            .count();
        assert_eq!(submits, 1);

        // ack of the first releases the buffered second
        let first_id = match &sent.lock().unwrap()[1] {
            ClientMessage::Submit { operation, .. } => operation.id,
            other => panic!("unexpected message: {other:?}"),
        };
        client.transport.incoming.push_back(ServerMessage::Ack {
            doc: doc.clone(),
            operation_id: first_id,
            revision: 1,
        });
        let event = client.poll(&mut surface).await.unwrap();
        assert!(matches!(event, ClientEvent::Acknowledged { revision: 1, .. }));

        let last = sent.lock().unwrap().last().cloned();
        match last {
            Some(ClientMessage::Submit { operation, .. }) => {
                assert_eq!(operation.base_revision, 1);
                assert_eq!(operation.edits, vec![EditOp::insert(1, "b")]);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_joiner_sends_join_only_after_identity() {
        let doc = DocumentId::from("main.rs");
        let (transport, sent) = ScriptedTransport::new(vec![]);
        let mut client = CollabClient::joining(transport);

        client.join(doc.clone()).await.unwrap();
        assert!(sent.lock().unwrap().is_empty());

        client
            .provide_identity("grace", ParticipantColor::from_index(2))
            .await
            .unwrap();
        match sent.lock().unwrap().as_slice() {
            [ClientMessage::Join { participant, .. }] => {
                assert_eq!(participant.id, client.local_id());
                assert_eq!(participant.name, "grace");
            }
            other => panic!("unexpected messages: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_presence_changes_surface_as_events() {
        let doc = DocumentId::from("main.rs");
        let peer = Participant::new(identity("grace"));
        let peer_id = peer.id;
        let (transport, _sent) = ScriptedTransport::new(vec![
            ServerMessage::ParticipantJoined {
                doc: doc.clone(),
                participant: peer,
            },
            ServerMessage::Presence {
                doc: doc.clone(),
                update: ParticipantUpdate::cursor(
                    peer_id,
                    CursorPosition { line: 3, column: 1 },
                ),
            },
        ]);
        let mut client = CollabClient::new(transport, identity("ada"));
        let mut surface = FakeSurface::default();

        let event = client.poll(&mut surface).await.unwrap();
        assert!(matches!(event, ClientEvent::RosterChanged { .. }));
        let event = client.poll(&mut surface).await.unwrap();
        assert!(matches!(event, ClientEvent::PresenceChanged { .. }));
        assert_eq!(client.presence().participant_count(&doc), 1);
    }
}
