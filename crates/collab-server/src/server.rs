//! WebSocket front of the synchronization engine
//!
//! One task per connection reads client frames; a writer task drains that
//! connection's outbound queue. Joining a document spawns a forwarder task
//! that turns the document's broadcast events into wire messages, skipping
//! events the connection itself caused. All document mutation goes through
//! the registry's per-document serializers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use collab::{
    ClientMessage, CollabError, DocEvent, DocumentHandle, DocumentRegistry, ServerMessage,
};
use tandem_core::{DocumentId, Participant, ParticipantId};

use crate::config::Config;

pub struct CollabServer {
    registry: Arc<DocumentRegistry>,
    bind_addr: String,
}

impl CollabServer {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let registry = Arc::new(DocumentRegistry::new(
            config.max_history,
            config.broadcast_capacity,
        ));
        for seed in &config.seeds {
            let content = std::fs::read_to_string(&seed.path).map_err(|e| {
                anyhow::anyhow!("reading seed {} for {}: {e}", seed.path.display(), seed.doc)
            })?;
            registry.seed(DocumentId::from(seed.doc.as_str()), content);
        }
        Ok(Self {
            registry,
            bind_addr: config.bind_addr.clone(),
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        info!(addr = %self.bind_addr, "collaboration engine listening");
        loop {
            let (stream, addr) = listener.accept().await?;
            let registry = self.registry.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(registry, stream, addr).await {
                    debug!(%addr, "connection ended: {err}");
                }
            });
        }
    }
}

/// A document this connection has joined.
struct JoinedDoc {
    handle: DocumentHandle,
    forwarder: JoinHandle<()>,
}

async fn handle_connection(
    registry: Arc<DocumentRegistry>,
    stream: TcpStream,
    addr: SocketAddr,
) -> anyhow::Result<()> {
    let socket = accept_async(stream).await?;
    info!(%addr, "client connected");
    let (mut sink, mut frames) = socket.split();

    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(256);
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(e) => {
                    warn!(%e, "failed to encode message");
                    continue;
                }
            };
            if sink.send(WsMessage::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut participant_id: Option<ParticipantId> = None;
    let mut joined: HashMap<DocumentId, JoinedDoc> = HashMap::new();

    while let Some(frame) = frames.next().await {
        let message = match frame {
            Ok(WsMessage::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => message,
                Err(e) => {
                    warn!(%addr, %e, "malformed frame");
                    let _ = out_tx
                        .send(ServerMessage::Error {
                            message: format!("malformed message: {e}"),
                        })
                        .await;
                    continue;
                }
            },
            Ok(WsMessage::Close(_)) => break,
            Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => continue,
            Ok(WsMessage::Binary(_)) => {
                warn!(%addr, "unexpected binary frame");
                continue;
            }
            Err(_) => break,
        };

        match message {
            ClientMessage::Join { doc, participant } => {
                participant_id = Some(participant.id);
                // re-joining a document this connection already holds must
                // not count a second open against the registry
                let handle = match joined.get(&doc) {
                    Some(existing) => existing.handle.clone(),
                    None => registry.open(&doc),
                };
                // subscribe before joining so no event between the snapshot
                // and the subscription is lost
                let events = handle.subscribe();
                let snapshot = handle.join(Participant::new(participant.clone())).await?;
                let forwarder = tokio::spawn(forward_events(
                    doc.clone(),
                    participant.id,
                    events,
                    handle.clone(),
                    out_tx.clone(),
                ));
                if let Some(previous) = joined.insert(
                    doc.clone(),
                    JoinedDoc { handle, forwarder },
                ) {
                    previous.forwarder.abort();
                }
                out_tx
                    .send(ServerMessage::Snapshot {
                        doc,
                        content: snapshot.content,
                        revision: snapshot.revision,
                        participants: snapshot.participants,
                    })
                    .await?;
            }
            ClientMessage::Submit { doc, operation } => {
                let Some(entry) = joined.get(&doc) else {
                    out_tx
                        .send(ServerMessage::Error {
                            message: format!("submit for unjoined document {doc}"),
                        })
                        .await?;
                    continue;
                };
                let operation_id = operation.id;
                match entry.handle.submit(operation).await {
                    Ok(accepted) => {
                        out_tx
                            .send(ServerMessage::Ack {
                                doc,
                                operation_id: accepted.id,
                                revision: accepted.revision,
                            })
                            .await?;
                    }
                    Err(CollabError::Rejected(rejection)) => {
                        out_tx
                            .send(ServerMessage::Rejected {
                                doc,
                                operation_id,
                                rejection,
                            })
                            .await?;
                    }
                    Err(err) => {
                        out_tx
                            .send(ServerMessage::Error {
                                message: err.to_string(),
                            })
                            .await?;
                    }
                }
            }
            ClientMessage::Presence { doc, update } => {
                if let Some(entry) = joined.get(&doc) {
                    entry.handle.update_presence(update);
                }
            }
            ClientMessage::Resync { doc } => {
                let Some(entry) = joined.get(&doc) else {
                    continue;
                };
                let snapshot = entry.handle.snapshot().await?;
                out_tx
                    .send(ServerMessage::Snapshot {
                        doc,
                        content: snapshot.content,
                        revision: snapshot.revision,
                        participants: snapshot.participants,
                    })
                    .await?;
            }
            ClientMessage::Leave { doc, participant } => {
                if let Some(entry) = joined.remove(&doc) {
                    entry.forwarder.abort();
                    if let Err(err) = registry.leave(&doc, participant).await {
                        debug!(doc = %doc, "leave after close: {err}");
                    }
                }
            }
            ClientMessage::SeedDocument { doc, content } => {
                registry.seed(doc, content);
            }
        }
    }

    // connection gone: detach from every joined document
    if let Some(id) = participant_id {
        for (doc, entry) in joined.drain() {
            entry.forwarder.abort();
            if let Err(err) = registry.leave(&doc, id).await {
                debug!(doc = %doc, "cleanup leave: {err}");
            }
        }
    }
    writer.abort();
    info!(%addr, "client disconnected");
    Ok(())
}

/// Pump one document's events to one connection, skipping events this
/// connection caused. A subscriber that lags past the broadcast buffer gets
/// a fresh snapshot instead of the missed events.
async fn forward_events(
    doc: DocumentId,
    own_id: ParticipantId,
    mut events: tokio::sync::broadcast::Receiver<DocEvent>,
    handle: DocumentHandle,
    out_tx: mpsc::Sender<ServerMessage>,
) {
    use tokio::sync::broadcast::error::RecvError;
    loop {
        let message = match events.recv().await {
            Ok(DocEvent::Operation(operation)) => {
                if operation.author == own_id {
                    continue;
                }
                ServerMessage::Operation {
                    doc: doc.clone(),
                    operation,
                }
            }
            Ok(DocEvent::Presence(update)) => {
                if update.id == own_id {
                    continue;
                }
                ServerMessage::Presence {
                    doc: doc.clone(),
                    update,
                }
            }
            Ok(DocEvent::ParticipantJoined(participant)) => {
                if participant.id == own_id {
                    continue;
                }
                ServerMessage::ParticipantJoined {
                    doc: doc.clone(),
                    participant,
                }
            }
            Ok(DocEvent::ParticipantLeft(participant)) => {
                if participant == own_id {
                    continue;
                }
                ServerMessage::ParticipantLeft {
                    doc: doc.clone(),
                    participant,
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(doc = %doc, skipped, "subscriber lagged; resynchronizing");
                match handle.snapshot().await {
                    Ok(snapshot) => ServerMessage::Snapshot {
                        doc: doc.clone(),
                        content: snapshot.content,
                        revision: snapshot.revision,
                        participants: snapshot.participants,
                    },
                    Err(_) => break,
                }
            }
            Err(RecvError::Closed) => break,
        };
        if out_tx.send(message).await.is_err() {
            break;
        }
    }
}
