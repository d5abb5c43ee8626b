//! Document content synchronization
//!
//! Keeps one text per open document. The foreground document lives in the
//! editor's surface, which is the source of truth while it has focus;
//! background documents are held here and patched directly as accepted
//! operations arrive. A background patch that fails marks the copy stale so
//! the next focus triggers a resync instead of showing wrong text.

use std::collections::{HashMap, HashSet};

use tracing::warn;

use tandem_core::DocumentId;

use ot::{apply_edits, EditOp};

/// What the cache talks to for the foreground document. The editor component
/// behind this applies edits incrementally and reports its current text.
pub trait EditingSurface {
    fn current_text(&self) -> String;
    fn replace_text(&mut self, text: &str);
    fn apply_edits(&mut self, edits: &[EditOp]) -> bool;
}

/// Per-document content mirror for everything not currently on screen.
#[derive(Default)]
pub struct DocumentCache {
    contents: HashMap<DocumentId, String>,
    stale: HashSet<DocumentId>,
    active: Option<DocumentId>,
}

impl DocumentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<&DocumentId> {
        self.active.as_ref()
    }

    /// Focus `doc`: park the outgoing document's surface text in the cache
    /// and load the incoming one. Returns the text to show, or `None` when
    /// the cached copy is stale and must be refetched.
    pub fn focus(&mut self, doc: DocumentId, surface: &mut dyn EditingSurface) -> Option<String> {
        if let Some(prev) = self.active.take() {
            self.contents.insert(prev, surface.current_text());
        }
        if self.stale.contains(&doc) {
            self.active = Some(doc);
            return None;
        }
        let text = self.contents.get(&doc).cloned();
        if let Some(ref text) = text {
            surface.replace_text(text);
        }
        self.active = Some(doc);
        text
    }

    /// Seed or overwrite a document from an authoritative snapshot.
    pub fn apply_snapshot(
        &mut self,
        doc: &DocumentId,
        content: &str,
        surface: &mut dyn EditingSurface,
    ) {
        self.stale.remove(doc);
        self.contents.insert(doc.clone(), content.to_owned());
        if self.active.as_ref() == Some(doc) {
            surface.replace_text(content);
        }
    }

    /// Apply a remote operation's (already transformed) edits. The
    /// foreground document goes through the surface and the cache re-reads
    /// the surface afterwards; background documents are patched in place.
    pub fn apply_remote(
        &mut self,
        doc: &DocumentId,
        edits: &[EditOp],
        surface: &mut dyn EditingSurface,
    ) {
        if self.active.as_ref() == Some(doc) {
            if surface.apply_edits(edits) {
                self.contents.insert(doc.clone(), surface.current_text());
            } else {
                warn!(doc = %doc, "surface rejected remote edits; marking stale");
                self.stale.insert(doc.clone());
            }
            return;
        }
        let Some(text) = self.contents.get(doc) else {
            // never seen a snapshot for it; nothing to patch
            return;
        };
        match apply_edits(text, edits) {
            Ok(updated) => {
                self.contents.insert(doc.clone(), updated);
            }
            Err(err) => {
                // drop the op rather than corrupt the copy
                warn!(doc = %doc, %err, "background patch failed; marking stale");
                self.stale.insert(doc.clone());
            }
        }
    }

    /// Record a local edit already applied to the surface.
    pub fn note_local(&mut self, doc: &DocumentId, surface: &dyn EditingSurface) {
        if self.active.as_ref() == Some(doc) {
            self.contents.insert(doc.clone(), surface.current_text());
        }
    }

    pub fn content(&self, doc: &DocumentId) -> Option<&str> {
        self.contents.get(doc).map(String::as_str)
    }

    pub fn is_stale(&self, doc: &DocumentId) -> bool {
        self.stale.contains(doc)
    }

    pub fn forget(&mut self, doc: &DocumentId) {
        self.contents.remove(doc);
        self.stale.remove(doc);
        if self.active.as_ref() == Some(doc) {
            self.active = None;
        }
    }
}
