//! # Tandem OT
//!
//! Text operations and the positional transforms that keep concurrent edits
//! convergent. Everything here is pure and synchronous: an operation applied
//! to a string either yields a new string or fails without side effects, and
//! transforming an operation never touches any document state.

pub mod operation;
pub mod transform;

pub use operation::{apply, apply_edits, EditOp, Operation, OtError};
pub use transform::{sequenced_first, transform_edit, transform_edits, transform_operation};
