//! Participant presence
//!
//! Per-document rosters of who is connected, where their cursor is and what
//! they have selected. Updates are partial merges; a snapshot roster always
//! replaces whatever was accumulated. The local participant is filtered out
//! so the UI only ever renders remote peers.

use std::collections::HashMap;

use tracing::warn;

use tandem_core::{DocumentId, Participant, ParticipantId, ParticipantUpdate};

pub struct PresenceTracker {
    local_id: ParticipantId,
    rosters: HashMap<DocumentId, HashMap<ParticipantId, Participant>>,
}

impl PresenceTracker {
    pub fn new(local_id: ParticipantId) -> Self {
        Self {
            local_id,
            rosters: HashMap::new(),
        }
    }

    /// Replace a document's roster with the authoritative one from a
    /// snapshot. The local participant never enters the roster.
    pub fn apply_snapshot(&mut self, doc: &DocumentId, participants: Vec<Participant>) {
        let roster = participants
            .into_iter()
            .filter(|p| p.id != self.local_id)
            .map(|p| (p.id, p))
            .collect();
        self.rosters.insert(doc.clone(), roster);
    }

    /// Merge a partial update into the roster. Returns `true` when anything
    /// visible actually changed, so callers can skip redraws.
    ///
    /// An update for a participant no join announced gets a provisional
    /// entry rather than being dropped; the late join fills in the rest.
    pub fn merge_update(&mut self, doc: &DocumentId, update: &ParticipantUpdate) -> bool {
        if update.id == self.local_id {
            return false;
        }
        let roster = self.rosters.entry(doc.clone()).or_default();
        match roster.get_mut(&update.id) {
            Some(participant) => participant.merge(update),
            None => {
                warn!(doc = %doc, participant = %update.id, "presence for unknown participant; provisioning");
                roster.insert(update.id, Participant::from_update(update));
                true
            }
        }
    }

    /// A participant joined; merge rather than overwrite so any cursor that
    /// raced ahead of the join survives.
    pub fn participant_joined(&mut self, doc: &DocumentId, participant: Participant) -> bool {
        if participant.id == self.local_id {
            return false;
        }
        let roster = self.rosters.entry(doc.clone()).or_default();
        match roster.get_mut(&participant.id) {
            Some(existing) => {
                let changed = existing.name != participant.name || existing.color != participant.color;
                existing.name = participant.name;
                existing.color = participant.color;
                changed
            }
            None => {
                roster.insert(participant.id, participant);
                true
            }
        }
    }

    pub fn participant_left(&mut self, doc: &DocumentId, id: ParticipantId) -> bool {
        self.rosters
            .get_mut(doc)
            .map(|roster| roster.remove(&id).is_some())
            .unwrap_or(false)
    }

    /// Remote participants in the document, unordered.
    pub fn participants(&self, doc: &DocumentId) -> Vec<&Participant> {
        self.rosters
            .get(doc)
            .map(|roster| roster.values().collect())
            .unwrap_or_default()
    }

    pub fn participant_count(&self, doc: &DocumentId) -> usize {
        self.rosters.get(doc).map(HashMap::len).unwrap_or(0)
    }

    pub fn forget_document(&mut self, doc: &DocumentId) {
        self.rosters.remove(doc);
    }

    pub fn clear(&mut self) {
        self.rosters.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::{CursorPosition, ParticipantColor, ParticipantInfo};

    fn tracker() -> (PresenceTracker, DocumentId) {
        (
            PresenceTracker::new(ParticipantId::new()),
            DocumentId::from("main.rs"),
        )
    }

    fn peer(name: &str) -> Participant {
        Participant::new(ParticipantInfo::new(name, ParticipantColor::from_index(1)))
    }

    #[test]
    fn test_merge_reports_change() {
        let (mut tracker, doc) = tracker();
        let ada = peer("ada");
        tracker.apply_snapshot(&doc, vec![ada.clone()]);

        let update = ParticipantUpdate::cursor(ada.id, CursorPosition { line: 2, column: 5 });
        assert!(tracker.merge_update(&doc, &update));
        // the identical update again changes nothing
        assert!(!tracker.merge_update(&doc, &update));

        let moved = ParticipantUpdate::cursor(ada.id, CursorPosition { line: 3, column: 0 });
        assert!(tracker.merge_update(&doc, &moved));
    }

    #[test]
    fn test_partial_update_keeps_other_fields() {
        let (mut tracker, doc) = tracker();
        let ada = peer("ada");
        let id = ada.id;
        tracker.apply_snapshot(&doc, vec![ada]);

        tracker.merge_update(&doc, &ParticipantUpdate::cursor(id, CursorPosition { line: 1, column: 1 }));
        // a selection-only update must not clear the cursor
        let sel = ParticipantUpdate::selection(
            id,
            tandem_core::SelectionRange {
                start: CursorPosition { line: 1, column: 1 },
                end: CursorPosition { line: 1, column: 4 },
            },
        );
        tracker.merge_update(&doc, &sel);

        let roster = tracker.participants(&doc);
        let p = roster.iter().find(|p| p.id == id).unwrap();
        assert_eq!(p.cursor, Some(CursorPosition { line: 1, column: 1 }));
        assert!(p.selection.is_some());
    }

    #[test]
    fn test_unknown_participant_gets_provisional_entry() {
        let (mut tracker, doc) = tracker();
        let ghost = ParticipantId::new();
        let update = ParticipantUpdate::cursor(ghost, CursorPosition { line: 0, column: 0 });
        assert!(tracker.merge_update(&doc, &update));
        assert_eq!(tracker.participant_count(&doc), 1);

        // the late join fills in the identity without losing the cursor
        let mut joined = peer("ghost");
        joined.id = ghost;
        tracker.participant_joined(&doc, joined);
        let roster = tracker.participants(&doc);
        assert_eq!(roster[0].name, "ghost");
        assert!(roster[0].cursor.is_some());
    }

    #[test]
    fn test_snapshot_replaces_roster_and_filters_self() {
        let local = ParticipantId::new();
        let mut tracker = PresenceTracker::new(local);
        let doc = DocumentId::from("a");

        tracker.apply_snapshot(&doc, vec![peer("old")]);
        let mut me = peer("me");
        me.id = local;
        tracker.apply_snapshot(&doc, vec![peer("ada"), me]);

        let names: Vec<_> = tracker.participants(&doc).iter().map(|p| p.name.clone()).collect();
        assert_eq!(names, vec!["ada"]);
    }

    #[test]
    fn test_local_updates_are_ignored() {
        let local = ParticipantId::new();
        let mut tracker = PresenceTracker::new(local);
        let doc = DocumentId::from("a");
        let update = ParticipantUpdate::cursor(local, CursorPosition { line: 0, column: 0 });
        assert!(!tracker.merge_update(&doc, &update));
        assert_eq!(tracker.participant_count(&doc), 0);
    }

    #[test]
    fn test_participant_left_removes_entry() {
        let (mut tracker, doc) = tracker();
        let ada = peer("ada");
        let id = ada.id;
        tracker.apply_snapshot(&doc, vec![ada]);
        assert!(tracker.participant_left(&doc, id));
        assert!(!tracker.participant_left(&doc, id));
        assert_eq!(tracker.participant_count(&doc), 0);
    }
}
