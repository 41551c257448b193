//! Ordered in-memory bookmark collection
//!
//! Entries are kept sorted by `created_at`, newest first, with at most one
//! entry per id. Every mutation preserves both properties, so callers can
//! apply fetches, local writes and feed events in any order.

use crate::backend::ChangeEvent;
use crate::models::{Bookmark, BookmarkId};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookmarkCollection {
    entries: Vec<Bookmark>,
}

impl BookmarkCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bookmark> {
        self.entries.iter()
    }

    pub fn as_slice(&self) -> &[Bookmark] {
        &self.entries
    }

    pub fn get(&self, id: &BookmarkId) -> Option<&Bookmark> {
        self.entries.iter().find(|b| &b.id == id)
    }

    pub fn contains(&self, id: &BookmarkId) -> bool {
        self.position(id).is_some()
    }

    fn position(&self, id: &BookmarkId) -> Option<usize> {
        self.entries.iter().position(|b| &b.id == id)
    }

    /// Index where a bookmark belongs: before every entry that is not newer
    fn slot_for(&self, bookmark: &Bookmark) -> usize {
        self.entries
            .partition_point(|e| e.created_at > bookmark.created_at)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Replace everything with a fetched list
    ///
    /// The list is re-sorted and duplicate ids collapse to the first row.
    /// Rows with equal timestamps keep the order the store returned them in.
    pub fn replace_all(&mut self, rows: Vec<Bookmark>) {
        self.entries.clear();
        for row in rows {
            if !self.contains(&row.id) {
                let slot = self
                    .entries
                    .partition_point(|e| e.created_at >= row.created_at);
                self.entries.insert(slot, row);
            }
        }
    }

    /// Insert or replace by id, placing the entry first among equal timestamps
    ///
    /// Returns `true` if the id was not present before.
    pub fn upsert(&mut self, bookmark: Bookmark) -> bool {
        let existed = match self.position(&bookmark.id) {
            Some(idx) => {
                self.entries.remove(idx);
                true
            }
            None => false,
        };
        let slot = self.slot_for(&bookmark);
        self.entries.insert(slot, bookmark);
        !existed
    }

    /// Replace an existing entry; unknown ids are ignored
    pub fn update(&mut self, bookmark: Bookmark) -> bool {
        if !self.contains(&bookmark.id) {
            return false;
        }
        self.upsert(bookmark);
        true
    }

    pub fn remove(&mut self, id: &BookmarkId) -> Option<Bookmark> {
        self.position(id).map(|idx| self.entries.remove(idx))
    }

    /// Put back a bookmark removed earlier, unless the id reappeared meanwhile
    pub fn restore(&mut self, bookmark: Bookmark) -> bool {
        if self.contains(&bookmark.id) {
            return false;
        }
        self.upsert(bookmark)
    }

    /// Merge one change; returns whether the collection changed
    pub fn apply(&mut self, event: &ChangeEvent) -> bool {
        match event {
            ChangeEvent::Insert(b) => {
                if self.get(&b.id) == Some(b) {
                    return false;
                }
                self.upsert(b.clone());
                true
            }
            ChangeEvent::Update(b) => {
                if self.get(&b.id) == Some(b) {
                    return false;
                }
                self.update(b.clone())
            }
            ChangeEvent::Delete(d) => self.remove(&d.id).is_some(),
        }
    }

    pub fn to_vec(&self) -> Vec<Bookmark> {
        self.entries.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DeletedRecord;
    use crate::models::UserId;
    use chrono::{DateTime, TimeZone, Utc};
    use proptest::prelude::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn bookmark(id: &str, secs: i64) -> Bookmark {
        Bookmark {
            id: BookmarkId::from(id),
            owner_id: UserId::from("u1"),
            url: format!("https://{}.example.com", id),
            title: id.to_uppercase(),
            created_at: at(secs),
        }
    }

    fn ids(c: &BookmarkCollection) -> Vec<&str> {
        c.iter().map(|b| b.id.as_str()).collect()
    }

    fn assert_well_formed(c: &BookmarkCollection) {
        let slice = c.as_slice();
        for pair in slice.windows(2) {
            assert!(pair[0].created_at >= pair[1].created_at, "not sorted: {:?}", ids(c));
        }
        let mut seen: Vec<&BookmarkId> = slice.iter().map(|b| &b.id).collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), slice.len(), "duplicate ids: {:?}", ids(c));
    }

    #[test]
    fn test_replace_all_sorts_and_dedups() {
        let mut c = BookmarkCollection::new();
        c.replace_all(vec![bookmark("a", 1), bookmark("c", 3), bookmark("b", 2), bookmark("a", 9)]);
        assert_eq!(ids(&c), vec!["c", "b", "a"]);
        assert_eq!(c.get(&"a".into()).unwrap().created_at, at(1));
    }

    #[test]
    fn test_replace_all_keeps_store_order_among_ties() {
        let mut c = BookmarkCollection::new();
        c.replace_all(vec![bookmark("x", 9), bookmark("b", 5), bookmark("a", 5), bookmark("z", 1)]);
        assert_eq!(ids(&c), vec!["x", "b", "a", "z"]);
    }

    #[test]
    fn test_reload_matches_live_order_for_ties() {
        let mut live = BookmarkCollection::new();
        live.upsert(bookmark("a", 5));
        live.upsert(bookmark("b", 5));
        assert_eq!(ids(&live), vec!["b", "a"]);

        // The store answers newest first as well
        let mut reloaded = BookmarkCollection::new();
        reloaded.replace_all(live.to_vec());
        assert_eq!(ids(&reloaded), ids(&live));
    }

    #[test]
    fn test_upsert_new_goes_first_among_ties() {
        let mut c = BookmarkCollection::new();
        c.replace_all(vec![bookmark("a", 5), bookmark("b", 1)]);

        assert!(c.upsert(bookmark("n", 5)));
        assert_eq!(ids(&c), vec!["n", "a", "b"]);

        assert!(c.upsert(bookmark("m", 3)));
        assert_eq!(ids(&c), vec!["n", "a", "m", "b"]);
    }

    #[test]
    fn test_insert_same_id_adopts_server_timestamp() {
        let mut c = BookmarkCollection::new();
        c.replace_all(vec![bookmark("a", 5), bookmark("r", 4)]);

        let server = bookmark("r", 10);
        assert!(c.apply(&ChangeEvent::Insert(server)));
        assert_eq!(ids(&c), vec!["r", "a"]);
        assert_eq!(c.len(), 2);
        assert_eq!(c.get(&"r".into()).unwrap().created_at, at(10));
    }

    #[test]
    fn test_update_absent_is_noop() {
        let mut c = BookmarkCollection::new();
        c.replace_all(vec![bookmark("a", 1)]);
        let before = c.clone();

        assert!(!c.apply(&ChangeEvent::Update(bookmark("zz", 2))));
        assert_eq!(c, before);
    }

    #[test]
    fn test_update_replaces_fields() {
        let mut c = BookmarkCollection::new();
        c.replace_all(vec![bookmark("a", 1)]);

        let mut renamed = bookmark("a", 1);
        renamed.title = "Renamed".to_string();
        assert!(c.apply(&ChangeEvent::Update(renamed)));
        assert_eq!(c.get(&"a".into()).unwrap().title, "Renamed");
        let unchanged = c.as_slice()[0].clone();
        assert!(!c.apply(&ChangeEvent::Update(unchanged)));
    }

    #[test]
    fn test_delete_present_and_absent() {
        let mut c = BookmarkCollection::new();
        c.replace_all(vec![bookmark("a", 1), bookmark("b", 2)]);

        assert!(c.apply(&ChangeEvent::Delete(DeletedRecord::new("a"))));
        assert_eq!(ids(&c), vec!["b"]);
        assert!(!c.apply(&ChangeEvent::Delete(DeletedRecord::new("a"))));
        assert_eq!(ids(&c), vec!["b"]);
    }

    #[test]
    fn test_restore_only_when_absent() {
        let mut c = BookmarkCollection::new();
        c.replace_all(vec![bookmark("a", 3), bookmark("b", 2), bookmark("c", 1)]);

        let removed = c.remove(&"b".into()).unwrap();
        assert_eq!(ids(&c), vec!["a", "c"]);
        assert!(c.restore(removed.clone()));
        assert_eq!(ids(&c), vec!["a", "b", "c"]);
        assert!(!c.restore(removed));
        assert_eq!(c.len(), 3);
    }

    fn event_strategy() -> impl Strategy<Value = ChangeEvent> {
        let id = prop::sample::select(vec!["a", "b", "c", "d", "e", "f"]);
        (0u8..3, id, 0i64..5).prop_map(|(kind, id, secs)| match kind {
            0 => ChangeEvent::Insert(bookmark(id, secs)),
            1 => ChangeEvent::Update(bookmark(id, secs)),
            _ => ChangeEvent::Delete(DeletedRecord::new(id)),
        })
    }

    proptest! {
        #[test]
        fn prop_merges_keep_order_and_unique_ids(
            initial in prop::collection::vec((prop::sample::select(vec!["a", "b", "c", "x"]), 0i64..5), 0..6),
            events in prop::collection::vec(event_strategy(), 0..40),
        ) {
            let mut c = BookmarkCollection::new();
            c.replace_all(initial.into_iter().map(|(id, secs)| bookmark(id, secs)).collect());
            assert_well_formed(&c);

            for event in &events {
                c.apply(event);
                assert_well_formed(&c);
            }
        }

        #[test]
        fn prop_event_outcome_matches_kind(
            events in prop::collection::vec(event_strategy(), 1..30),
        ) {
            let mut c = BookmarkCollection::new();
            for event in &events {
                let had = c.contains(event.id());
                c.apply(event);
                match event {
                    ChangeEvent::Insert(b) => prop_assert_eq!(c.get(&b.id), Some(b)),
                    ChangeEvent::Update(b) => {
                        prop_assert_eq!(c.contains(&b.id), had);
                    }
                    ChangeEvent::Delete(d) => prop_assert!(!c.contains(&d.id)),
                }
            }
        }
    }
}
