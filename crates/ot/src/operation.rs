//! Text operations and their application

use serde::{Deserialize, Serialize};
use tandem_core::{OperationId, ParticipantId, Revision};

/// A primitive text edit. Positions and lengths are counted in characters,
/// not bytes, so multibyte text stays addressable from any client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EditOp {
    /// Insert text at position
    Insert { position: usize, text: String },
    /// Delete `len` characters starting at position
    Delete { position: usize, len: usize },
}

impl EditOp {
    pub fn insert(position: usize, text: impl Into<String>) -> Self {
        Self::Insert {
            position,
            text: text.into(),
        }
    }

    pub fn delete(position: usize, len: usize) -> Self {
        Self::Delete { position, len }
    }

    pub fn position(&self) -> usize {
        match self {
            Self::Insert { position, .. } => *position,
            Self::Delete { position, .. } => *position,
        }
    }

    /// An edit that would leave any text unchanged.
    pub fn is_noop(&self) -> bool {
        match self {
            Self::Insert { text, .. } => text.is_empty(),
            Self::Delete { len, .. } => *len == 0,
        }
    }
}

/// Error applying an edit to text
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum OtError {
    #[error("edit at position {position} (len {len}) is out of bounds for text of length {text_len}")]
    OutOfBounds {
        position: usize,
        len: usize,
        text_len: usize,
    },
}

/// An atomic, author-attributed edit with a declared base revision.
///
/// The id stays fixed for the operation's lifetime; the edits and base
/// revision are rewritten as the operation is rebased over concurrent,
/// already-accepted operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub author: ParticipantId,
    pub base_revision: Revision,
    /// Primitive edits, applied left-to-right against the text as it exists
    /// at application time.
    pub edits: Vec<EditOp>,
}

impl Operation {
    pub fn new(author: ParticipantId, base_revision: Revision, edits: Vec<EditOp>) -> Self {
        Self {
            id: OperationId::new(),
            author,
            base_revision,
            edits,
        }
    }

    pub fn insert(
        author: ParticipantId,
        base_revision: Revision,
        position: usize,
        text: impl Into<String>,
    ) -> Self {
        Self::new(author, base_revision, vec![EditOp::insert(position, text)])
    }

    pub fn delete(
        author: ParticipantId,
        base_revision: Revision,
        position: usize,
        len: usize,
    ) -> Self {
        Self::new(author, base_revision, vec![EditOp::delete(position, len)])
    }

    /// Sequential composition: applying `self.compose(later)` equals applying
    /// `self` and then `later`. The composed operation keeps this operation's
    /// id, author and base revision.
    pub fn compose(mut self, later: Operation) -> Operation {
        self.edits.extend(later.edits);
        self
    }
}

/// Apply an operation to `base`, yielding the new text.
///
/// Deterministic and pure: either every edit applies and the result is
/// returned, or the first out-of-bounds edit fails the whole operation and
/// `base` is untouched. Positions are never clamped.
pub fn apply(base: &str, op: &Operation) -> Result<String, OtError> {
    apply_edits(base, &op.edits)
}

/// Apply a sequence of primitive edits left-to-right.
pub fn apply_edits(base: &str, edits: &[EditOp]) -> Result<String, OtError> {
    let mut text = base.to_string();
    for edit in edits {
        apply_edit(&mut text, edit)?;
    }
    Ok(text)
}

fn apply_edit(text: &mut String, edit: &EditOp) -> Result<(), OtError> {
    let char_len = text.chars().count();
    match edit {
        EditOp::Insert { position, text: ins } => {
            let at = byte_offset(text, *position).ok_or(OtError::OutOfBounds {
                position: *position,
                len: ins.chars().count(),
                text_len: char_len,
            })?;
            text.insert_str(at, ins);
        }
        EditOp::Delete { position, len } => {
            let out_of_bounds = || OtError::OutOfBounds {
                position: *position,
                len: *len,
                text_len: char_len,
            };
            let start = byte_offset(text, *position).ok_or_else(out_of_bounds)?;
            let end = byte_offset(text, position + len).ok_or_else(out_of_bounds)?;
            text.replace_range(start..end, "");
        }
    }
    Ok(())
}

/// Byte offset of the `char_pos`-th character, or `None` when the position
/// is past the end of the text.
fn byte_offset(text: &str, char_pos: usize) -> Option<usize> {
    if char_pos == 0 {
        return Some(0);
    }
    let mut count = 0;
    for (offset, _) in text.char_indices() {
        if count == char_pos {
            return Some(offset);
        }
        count += 1;
    }
    // one past the last character addresses the end of the text
    (char_pos == count).then_some(text.len())
}
