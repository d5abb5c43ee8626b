//! # Tandem Collaboration
//!
//! Real-time multi-user document editing:
//! - revision-ordered operation transform for sync (no structural merge)
//! - one serializer task per document for strict per-document ordering
//! - presence awareness (cursors, selections, activity)
//! - WebSocket transport with a pluggable boundary
//!
//! The engine guarantees that every participant on a document observes the
//! same sequence of accepted operations in the same order, and that applying
//! that sequence yields byte-identical content at every replica.

pub mod client;
pub mod document;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod sync;

use tandem_core::{DocumentId, ParticipantId};

pub use client::{CollabClient, ClientEvent, Transport, WsTransport};
pub use document::{AcceptedOperation, Document, Snapshot, SubmitRejection};
pub use presence::PresenceTracker;
pub use protocol::{ClientMessage, ServerMessage};
pub use registry::{DocEvent, DocumentHandle, DocumentRegistry};
pub use session::{DocSessionState, SessionManager};
pub use sync::{DocumentCache, EditingSurface};

/// Collaboration error
#[derive(Debug, thiserror::Error)]
pub enum CollabError {
    /// A roster update referenced a participant the document does not know.
    #[error("unknown participant {0} in roster update")]
    RosterInconsistency(ParticipantId),
    /// The document's serializer is gone (closed or never opened).
    #[error("document {0} is not open")]
    DocumentClosed(DocumentId),
    /// The submit was not accepted by the document.
    #[error(transparent)]
    Rejected(#[from] SubmitRejection),
    /// Editing attempted before the joiner supplied a display identity.
    #[error("editing is blocked until a display identity is provided")]
    IdentityRequired,
    /// Local edit attempted while the document is (re)synchronizing.
    #[error("document {0} is still synchronizing")]
    Syncing(DocumentId),
    /// Connection lost or errored.
    #[error("transport error: {0}")]
    Transport(String),
    /// Unrecoverable setup failure; collaboration mode must be turned off.
    #[error("collaboration setup failed: {0}")]
    Fatal(String),
}
