//! Positional transformation of concurrent edits
//!
//! When two operations were produced against the same text, the one applied
//! second must have its positions adjusted so it still targets the author's
//! intended logical location. The adjustment is deterministic: every replica
//! that transforms the same pair the same way converges to identical text.

use crate::operation::{EditOp, Operation};

/// Tie-break for overlapping edits at the same position: the operation with
/// the lower `(base_revision, author)` key is treated as happening first.
pub fn sequenced_first(a: &Operation, b: &Operation) -> bool {
    (a.base_revision, a.author) < (b.base_revision, b.author)
}

/// Transform `incoming` against `applied`, an operation that has already
/// been accepted, yielding the edits `incoming` should perform on the text
/// that `applied` produced.
pub fn transform_operation(incoming: &Operation, applied: &Operation) -> Vec<EditOp> {
    transform_edits(
        incoming.edits.clone(),
        &applied.edits,
        sequenced_first(incoming, applied),
    )
}

/// Transform a sequence of edits against the edits of an already-applied
/// operation. `incoming_first` carries the tie-break decision for edits at
/// identical positions.
pub fn transform_edits(
    edits: Vec<EditOp>,
    applied: &[EditOp],
    incoming_first: bool,
) -> Vec<EditOp> {
    let mut edits = edits;
    for against in applied {
        edits = edits
            .iter()
            .flat_map(|edit| transform_edit(edit, against, incoming_first))
            .filter(|edit| !edit.is_noop())
            .collect();
    }
    edits
}

/// Transform a single edit against one already-applied edit.
///
/// Returns a (possibly empty) sequence because a delete crossing a
/// concurrent insert splits in two so the inserted text survives.
pub fn transform_edit(edit: &EditOp, against: &EditOp, edit_first: bool) -> Vec<EditOp> {
    match (edit, against) {
        (EditOp::Insert { position: p, text }, EditOp::Insert { position: q, text: other }) => {
            let shifted = *q < *p || (*q == *p && !edit_first);
            let position = if shifted {
                p + other.chars().count()
            } else {
                *p
            };
            vec![EditOp::insert(position, text.clone())]
        }
        (EditOp::Insert { position: p, text }, EditOp::Delete { position: q, len }) => {
            let position = if q + len <= *p {
                p - len
            } else if q < p {
                // insertion point fell inside the deleted range
                *q
            } else {
                *p
            };
            vec![EditOp::insert(position, text.clone())]
        }
        (EditOp::Delete { position: p, len }, EditOp::Insert { position: q, text }) => {
            let inserted = text.chars().count();
            if *q <= *p {
                vec![EditOp::delete(p + inserted, *len)]
            } else if *q < p + len {
                // the concurrent insert landed inside the range being
                // deleted; split around it so the inserted text survives
                let before = q - p;
                vec![
                    EditOp::delete(*p, before),
                    EditOp::delete(p + inserted, len - before),
                ]
            } else {
                vec![EditOp::delete(*p, *len)]
            }
        }
        (EditOp::Delete { position: p, len }, EditOp::Delete { position: q, len: other }) => {
            if q + other <= *p {
                vec![EditOp::delete(p - other, *len)]
            } else if p + len <= *q {
                vec![EditOp::delete(*p, *len)]
            } else {
                // ranges overlap: drop the part already deleted
                let overlap = (p + len).min(q + other) - p.max(q);
                let position = if q < p { *q } else { *p };
                vec![EditOp::delete(position, len - overlap)]
            }
        }
    }
}
