//! Backend adapters
//!
//! The hosted service behind Shelf provides a record store (one
//! `bookmarks` table) and a change feed over it. Both are reached through
//! the traits in this module so the synchronizer never depends on a
//! concrete transport.
//!
//! ## Implementations
//!
//! - `local`: SQLite table plus an in-process change feed (offline use, tests)
//! - `rest`: PostgREST-style HTTP record store
//! - `realtime`: Phoenix-channel websocket change feed

pub mod feed;
pub mod local;
pub mod realtime;
pub mod rest;
mod schema;

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::models::{Bookmark, BookmarkId, BookmarkPatch, NewBookmark, UserId};

pub use feed::{ChangeEvent, ChangeKind, DeletedRecord, FeedMessage, FeedSubscription, OwnerFilter};
pub use local::LocalBackend;
pub use realtime::{RealtimeConfig, RealtimeFeed};
pub use rest::{RestConfig, RestStore};

/// CRUD access to the remote bookmarks table
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// All bookmarks of one owner, newest first
    async fn list_by_owner(&self, owner: &UserId) -> StoreResult<Vec<Bookmark>>;

    /// Insert a row; the store assigns `id` and `created_at`
    async fn insert(&self, record: NewBookmark) -> StoreResult<Bookmark>;

    /// Change url and/or title of one of `owner`'s rows
    ///
    /// Rows of other owners are reported as `NotFound`.
    async fn update(
        &self,
        owner: &UserId,
        id: &BookmarkId,
        patch: BookmarkPatch,
    ) -> StoreResult<Bookmark>;

    /// Delete one of `owner`'s rows by id
    ///
    /// Deleting a missing row succeeds. Rows of other owners are left alone.
    async fn delete_by_id(&self, owner: &UserId, id: &BookmarkId) -> StoreResult<()>;
}

/// Push notifications for row-level changes on the bookmarks table
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a subscription scoped to one owner
    ///
    /// The subscription yields events until it is dropped or
    /// unsubscribed. Transport interruptions are reported in-band as
    /// `FeedMessage::Dropped` / `FeedMessage::Resumed`.
    async fn subscribe(&self, filter: OwnerFilter) -> StoreResult<FeedSubscription>;
}
