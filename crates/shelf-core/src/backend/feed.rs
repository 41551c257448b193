//! Change feed message types

use std::fmt;

use tokio::sync::mpsc;

use crate::models::{Bookmark, BookmarkId, UserId};

/// Scope of a change feed subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerFilter {
    pub owner_id: UserId,
}

impl OwnerFilter {
    pub fn new(owner_id: UserId) -> Self {
        Self { owner_id }
    }

    /// Whether an event may be delivered to this subscriber
    ///
    /// Deletes always pass: the backing table does not include the owner
    /// column in delete payloads, so they cannot be filtered here.
    pub fn admits(&self, event: &ChangeEvent) -> bool {
        match event {
            ChangeEvent::Insert(b) | ChangeEvent::Update(b) => b.owner_id == self.owner_id,
            ChangeEvent::Delete(_) => true,
        }
    }
}

/// Row snapshot carried by a delete event
///
/// Only the primary key is guaranteed; `owner_id` is present only when the
/// backend happens to include it.
#[derive(Debug, Clone, PartialEq)]
pub struct DeletedRecord {
    pub id: BookmarkId,
    pub owner_id: Option<UserId>,
}

impl DeletedRecord {
    pub fn new(id: impl Into<BookmarkId>) -> Self {
        Self {
            id: id.into(),
            owner_id: None,
        }
    }
}

/// One row-level change
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Insert(Bookmark),
    Update(Bookmark),
    Delete(DeletedRecord),
}

impl ChangeEvent {
    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeEvent::Insert(_) => ChangeKind::Insert,
            ChangeEvent::Update(_) => ChangeKind::Update,
            ChangeEvent::Delete(_) => ChangeKind::Delete,
        }
    }

    /// Id of the affected row
    pub fn id(&self) -> &BookmarkId {
        match self {
            ChangeEvent::Insert(b) | ChangeEvent::Update(b) => &b.id,
            ChangeEvent::Delete(d) => &d.id,
        }
    }
}

/// Event kind without payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// Messages delivered on a subscription
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    /// A row changed
    Event(ChangeEvent),
    /// Transport lost; events may be missed until `Resumed`
    Dropped(String),
    /// Transport is back; anything between `Dropped` and now may be missing
    Resumed,
}

/// Receiving end of a change feed subscription
///
/// Dropping the subscription (or calling `unsubscribe`) closes the channel,
/// which the producing side observes through `mpsc::Sender::closed`.
#[derive(Debug)]
pub struct FeedSubscription {
    messages: mpsc::Receiver<FeedMessage>,
}

impl FeedSubscription {
    /// Create a subscription channel with the given buffer size
    pub fn channel(buffer: usize) -> (mpsc::Sender<FeedMessage>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self { messages: rx })
    }

    /// Next message, or `None` once the producer has stopped
    pub async fn next(&mut self) -> Option<FeedMessage> {
        self.messages.recv().await
    }

    /// Stop delivery; messages already buffered are discarded
    pub fn unsubscribe(&mut self) {
        self.messages.close();
        while self.messages.try_recv().is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn bookmark(id: &str, owner: &str) -> Bookmark {
        Bookmark {
            id: BookmarkId::from(id),
            owner_id: UserId::from(owner),
            url: "https://example.com".to_string(),
            title: "Example".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_filter_admits_own_rows_and_all_deletes() {
        let filter = OwnerFilter::new(UserId::from("u1"));

        assert!(filter.admits(&ChangeEvent::Insert(bookmark("a", "u1"))));
        assert!(!filter.admits(&ChangeEvent::Insert(bookmark("a", "u2"))));
        assert!(!filter.admits(&ChangeEvent::Update(bookmark("a", "u2"))));
        assert!(filter.admits(&ChangeEvent::Delete(DeletedRecord::new("zzz"))));
    }

    #[test]
    fn test_event_accessors() {
        let event = ChangeEvent::Delete(DeletedRecord::new("a"));
        assert_eq!(event.kind(), ChangeKind::Delete);
        assert_eq!(event.id().as_str(), "a");
        assert_eq!(ChangeKind::Insert.to_string(), "INSERT");
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_producer() {
        let (tx, mut sub) = FeedSubscription::channel(4);
        tx.send(FeedMessage::Resumed).await.unwrap();
        assert_eq!(sub.next().await, Some(FeedMessage::Resumed));

        sub.unsubscribe();
        assert!(tx.is_closed());
        assert!(tx.send(FeedMessage::Resumed).await.is_err());
    }
}
