//! Participant identity and live presence fields

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::color::ParticipantColor;
use crate::ParticipantId;

/// Cursor position in a document (0-indexed)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub line: usize,
    pub column: usize,
}

/// A participant's selection in a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub start: CursorPosition,
    pub end: CursorPosition,
}

/// Identity supplied once when joining: who this participant is and how to
/// render them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub id: ParticipantId,
    pub name: String,
    pub color: ParticipantColor,
}

impl ParticipantInfo {
    pub fn new(name: impl Into<String>, color: ParticipantColor) -> Self {
        Self::with_id(ParticipantId::new(), name, color)
    }

    /// Identity for an id that already exists elsewhere (e.g. a connection
    /// whose id was minted before the display name was chosen).
    pub fn with_id(id: ParticipantId, name: impl Into<String>, color: ParticipantColor) -> Self {
        Self {
            id,
            name: name.into(),
            color,
        }
    }
}

/// A participant as tracked on a document: fixed identity plus mutable live
/// fields (cursor, selection, last activity).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    pub color: ParticipantColor,
    pub cursor: Option<CursorPosition>,
    pub selection: Option<SelectionRange>,
    pub last_seen: DateTime<Utc>,
}

impl Participant {
    pub fn new(info: ParticipantInfo) -> Self {
        Self {
            id: info.id,
            name: info.name,
            color: info.color,
            cursor: None,
            selection: None,
            last_seen: Utc::now(),
        }
    }

    /// Build a provisional record from a partial update. The result may lack
    /// a real name or color; callers should prefer a snapshot refresh.
    pub fn from_update(update: &ParticipantUpdate) -> Self {
        Self {
            id: update.id,
            name: update.name.clone().unwrap_or_default(),
            color: update.color.unwrap_or_else(|| ParticipantColor::from_index(0)),
            cursor: update.cursor,
            selection: update.selection,
            last_seen: Utc::now(),
        }
    }

    /// Update last activity
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }

    /// Merge only the fields present in `update`. Absent fields are left
    /// untouched. Returns whether anything actually changed.
    pub fn merge(&mut self, update: &ParticipantUpdate) -> bool {
        debug_assert_eq!(self.id, update.id);
        let mut changed = false;
        if let Some(name) = &update.name {
            if *name != self.name {
                self.name = name.clone();
                changed = true;
            }
        }
        if let Some(color) = update.color {
            if color != self.color {
                self.color = color;
                changed = true;
            }
        }
        if let Some(cursor) = update.cursor {
            if self.cursor != Some(cursor) {
                self.cursor = Some(cursor);
                changed = true;
            }
        }
        if let Some(selection) = update.selection {
            if self.selection != Some(selection) {
                self.selection = Some(selection);
                changed = true;
            }
        }
        if changed {
            self.touch();
        }
        changed
    }
}

/// Partial participant update: only the fields present are merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantUpdate {
    pub id: ParticipantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<ParticipantColor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<SelectionRange>,
}

impl ParticipantUpdate {
    pub fn empty(id: ParticipantId) -> Self {
        Self {
            id,
            name: None,
            color: None,
            cursor: None,
            selection: None,
        }
    }

    pub fn cursor(id: ParticipantId, cursor: CursorPosition) -> Self {
        Self {
            cursor: Some(cursor),
            ..Self::empty(id)
        }
    }

    pub fn selection(id: ParticipantId, selection: SelectionRange) -> Self {
        Self {
            selection: Some(selection),
            ..Self::empty(id)
        }
    }
}
