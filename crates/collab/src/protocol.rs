//! Wire protocol
//!
//! JSON messages exchanged between clients and the synchronization engine,
//! tagged by a `type` field. The transport carries them as WebSocket text
//! frames; nothing here assumes WebSocket specifically.

use serde::{Deserialize, Serialize};

use tandem_core::{
    DocumentId, OperationId, Participant, ParticipantId, ParticipantInfo, ParticipantUpdate,
    Revision,
};

use crate::document::{AcceptedOperation, SubmitRejection};
use ot::Operation;

/// Client → engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join a document; the engine replies with a `Snapshot`.
    Join {
        doc: DocumentId,
        participant: ParticipantInfo,
    },
    /// Submit a local operation against `operation.base_revision`.
    Submit {
        doc: DocumentId,
        operation: Operation,
    },
    /// Cursor/selection movement; fire-and-forget.
    Presence {
        doc: DocumentId,
        update: ParticipantUpdate,
    },
    /// Request a fresh snapshot after a desync or reconnect.
    Resync { doc: DocumentId },
    Leave {
        doc: DocumentId,
        participant: ParticipantId,
    },
    /// Provide initial content for a document the engine has never seen.
    SeedDocument { doc: DocumentId, content: String },
}

/// Engine → client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Authoritative document state; answers `Join` and `Resync`.
    Snapshot {
        doc: DocumentId,
        content: String,
        revision: Revision,
        participants: Vec<Participant>,
    },
    /// The client's own submit was accepted at `revision`.
    Ack {
        doc: DocumentId,
        operation_id: OperationId,
        revision: Revision,
    },
    /// Another participant's operation, already transformed by the engine.
    Operation {
        doc: DocumentId,
        operation: AcceptedOperation,
    },
    Presence {
        doc: DocumentId,
        update: ParticipantUpdate,
    },
    ParticipantJoined {
        doc: DocumentId,
        participant: Participant,
    },
    ParticipantLeft {
        doc: DocumentId,
        participant: ParticipantId,
    },
    /// A submit the engine would not apply; the client should resync.
    Rejected {
        doc: DocumentId,
        operation_id: OperationId,
        rejection: SubmitRejection,
    },
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::ParticipantColor;
    use ot::EditOp;

    #[test]
    fn test_client_message_wire_shape() {
        let msg = ClientMessage::Submit {
            doc: DocumentId::from("main.rs"),
            operation: Operation::new(
                ParticipantId::new(),
                4,
                vec![EditOp::insert(0, "hi")],
            ),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "submit");
        assert_eq!(json["doc"], "main.rs");
        assert_eq!(json["operation"]["base_revision"], 4);
        assert_eq!(json["operation"]["edits"][0]["type"], "insert");
    }

    #[test]
    fn test_server_snapshot_round_trips() {
        let participant = Participant::new(ParticipantInfo::new(
            "ada",
            ParticipantColor::from_index(0),
        ));
        let msg = ServerMessage::Snapshot {
            doc: DocumentId::from("a"),
            content: "hello".into(),
            revision: 12,
            participants: vec![participant],
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: ServerMessage = serde_json::from_str(&json).unwrap();
        match back {
            ServerMessage::Snapshot {
                revision,
                participants,
                ..
            } => {
                assert_eq!(revision, 12);
                assert_eq!(participants.len(), 1);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_partial_presence_update_omits_absent_fields() {
        let msg = ClientMessage::Presence {
            doc: DocumentId::from("a"),
            update: ParticipantUpdate::cursor(
                ParticipantId::new(),
                tandem_core::CursorPosition { line: 1, column: 2 },
            ),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json["update"].get("selection").is_none());
        assert!(json["update"].get("name").is_none());
        assert_eq!(json["update"]["cursor"]["line"], 1);
    }
}
