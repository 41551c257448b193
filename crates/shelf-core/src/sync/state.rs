//! Synchronizer state machine
//!
//! `Synchronizer` holds the phase, the owner and the collection for one
//! view and decides how each input changes them. It performs no I/O: the
//! driver in `session` runs fetches and mutations and reports their
//! results back here.
//!
//! ```text
//! Uninitialized ──initialize──▶ Loading ──ok──▶ Subscribed
//!                                  │  ▲              │
//!                                err │  └──refresh───┘
//!                                  ▼
//!                               Errored ──initialize──▶ Loading
//!
//! any ──teardown──▶ Closed
//! ```

use std::fmt;

use serde::Serialize;
use tracing::debug;

use super::collection::BookmarkCollection;
use crate::backend::{ChangeEvent, DeletedRecord};
use crate::error::SyncError;
use crate::models::{Bookmark, BookmarkId, UserId};

/// Lifecycle phase of a synchronizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    /// No user yet, or signed out
    Uninitialized,
    /// Bulk fetch in flight; feed events are buffered
    Loading,
    /// Collection loaded and feed events applied as they arrive
    Subscribed,
    /// Last bulk fetch failed; collection is empty
    Errored,
    /// Torn down; no further changes
    Closed,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncPhase::Uninitialized => "uninitialized",
            SyncPhase::Loading => "loading",
            SyncPhase::Subscribed => "subscribed",
            SyncPhase::Errored => "errored",
            SyncPhase::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Identifies one bulk fetch; results carrying an older ticket are stale
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    generation: u64,
}

impl FetchTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// What happened to a fetch result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Collection replaced; `replayed` buffered events applied on top
    Installed { count: usize, replayed: usize },
    /// Superseded or torn down before the result arrived
    Stale,
}

/// What happened to a feed event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Applied,
    /// Merged but the collection was already up to date
    Unchanged,
    /// Held until the running fetch completes
    Buffered,
    /// Not for this view (wrong owner, or not subscribed)
    Ignored,
}

/// Immutable view published to observers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncSnapshot {
    pub phase: SyncPhase,
    pub owner: Option<UserId>,
    pub bookmarks: Vec<Bookmark>,
}

impl SyncSnapshot {
    /// Look up a bookmark by full id or id prefix
    ///
    /// An exact id wins over prefix matches. A blank id matches nothing.
    pub fn lookup(&self, id_or_prefix: &str) -> Lookup<'_> {
        let id_or_prefix = id_or_prefix.trim();
        if id_or_prefix.is_empty() {
            return Lookup::Missing;
        }
        if let Some(exact) = self.bookmarks.iter().find(|b| b.id.as_str() == id_or_prefix) {
            return Lookup::Found(exact);
        }

        let mut matches: Vec<&Bookmark> = self
            .bookmarks
            .iter()
            .filter(|b| b.id.as_str().starts_with(id_or_prefix))
            .collect();
        match matches.len() {
            0 => Lookup::Missing,
            1 => Lookup::Found(matches.remove(0)),
            _ => Lookup::Ambiguous(matches),
        }
    }

    /// Find a bookmark by full id or unique id prefix
    pub fn find(&self, id_or_prefix: &str) -> Option<&Bookmark> {
        match self.lookup(id_or_prefix) {
            Lookup::Found(bookmark) => Some(bookmark),
            Lookup::Missing | Lookup::Ambiguous(_) => None,
        }
    }
}

/// Result of `SyncSnapshot::lookup`
#[derive(Debug, PartialEq)]
pub enum Lookup<'a> {
    Found(&'a Bookmark),
    Missing,
    /// Every bookmark the prefix matches
    Ambiguous(Vec<&'a Bookmark>),
}

/// Current owner of the view
///
/// Set by `begin_initialize`, cleared by `reset`. The change feed
/// subscription that belongs to it is held by the driver next to this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub owner: UserId,
}

#[derive(Debug)]
pub struct Synchronizer {
    phase: SyncPhase,
    context: Option<SessionContext>,
    collection: BookmarkCollection,
    generation: u64,
    pending: Vec<ChangeEvent>,
    rollback_failed_deletes: bool,
}

impl Synchronizer {
    pub fn new(rollback_failed_deletes: bool) -> Self {
        Self {
            phase: SyncPhase::Uninitialized,
            context: None,
            collection: BookmarkCollection::new(),
            generation: 0,
            pending: Vec::new(),
            rollback_failed_deletes,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn owner(&self) -> Option<&UserId> {
        self.context.as_ref().map(|c| &c.owner)
    }

    pub fn collection(&self) -> &BookmarkCollection {
        &self.collection
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        SyncSnapshot {
            phase: self.phase,
            owner: self.owner().cloned(),
            bookmarks: self.collection.to_vec(),
        }
    }

    /// Owner required by a mutation
    pub fn require_owner(&self) -> Result<&UserId, SyncError> {
        if self.phase == SyncPhase::Closed {
            return Err(SyncError::Closed);
        }
        self.owner().ok_or(SyncError::AuthRequired)
    }

    /// Start a bulk fetch for `owner`
    ///
    /// Any fetch already running becomes stale. Switching owners empties
    /// the collection right away; a refresh for the same owner keeps the
    /// current entries visible until the new list arrives.
    pub fn begin_initialize(&mut self, owner: UserId) -> Result<FetchTicket, SyncError> {
        if self.phase == SyncPhase::Closed {
            return Err(SyncError::Closed);
        }
        if owner.is_blank() {
            return Err(SyncError::AuthRequired);
        }

        if self.owner() != Some(&owner) {
            self.collection.clear();
            self.context = Some(SessionContext { owner });
        }

        self.generation += 1;
        self.pending.clear();
        self.phase = SyncPhase::Loading;
        debug!("Fetch generation {} started", self.generation);

        Ok(FetchTicket {
            generation: self.generation,
        })
    }

    /// Whether a fetch with this ticket would still be installed
    pub fn is_current(&self, ticket: FetchTicket) -> bool {
        ticket.generation == self.generation && self.phase == SyncPhase::Loading
    }

    /// Install the result of a bulk fetch
    ///
    /// On success the collection is replaced and events buffered while
    /// loading are replayed in delivery order. On failure the view moves to
    /// `Errored` with an empty collection and the error is returned.
    pub fn complete_initialize(
        &mut self,
        ticket: FetchTicket,
        result: Result<Vec<Bookmark>, SyncError>,
    ) -> Result<FetchOutcome, SyncError> {
        if !self.is_current(ticket) {
            debug!(
                "Discarding fetch generation {} (current {}, {})",
                ticket.generation, self.generation, self.phase
            );
            return Ok(FetchOutcome::Stale);
        }

        match result {
            Ok(rows) => {
                let rows = match self.owner() {
                    Some(owner) => rows.into_iter().filter(|b| &b.owner_id == owner).collect(),
                    None => Vec::new(),
                };
                self.collection.replace_all(rows);
                self.phase = SyncPhase::Subscribed;

                let pending = std::mem::take(&mut self.pending);
                let replayed = pending.len();
                for event in pending {
                    self.apply_remote_event(event);
                }

                Ok(FetchOutcome::Installed {
                    count: self.collection.len(),
                    replayed,
                })
            }
            Err(e) => {
                self.collection.clear();
                self.pending.clear();
                self.phase = SyncPhase::Errored;
                Err(e)
            }
        }
    }

    /// Merge one change feed event
    ///
    /// Inserts and updates for another owner are dropped. Deletes carry no
    /// reliable owner, so they are applied by id alone: only ids already in
    /// the collection are affected, and those were owner-checked when they
    /// entered it.
    pub fn apply_remote_event(&mut self, event: ChangeEvent) -> EventOutcome {
        if let ChangeEvent::Insert(b) | ChangeEvent::Update(b) = &event {
            if self.owner() != Some(&b.owner_id) {
                return EventOutcome::Ignored;
            }
        }

        match self.phase {
            SyncPhase::Loading => {
                self.pending.push(event);
                EventOutcome::Buffered
            }
            SyncPhase::Subscribed => {
                if self.collection.apply(&event) {
                    EventOutcome::Applied
                } else {
                    EventOutcome::Unchanged
                }
            }
            _ => EventOutcome::Ignored,
        }
    }

    /// Add a record the store has confirmed
    pub fn insert_optimistic(&mut self, bookmark: Bookmark) -> Result<(), SyncError> {
        let owner = self.require_owner()?;
        if &bookmark.owner_id != owner {
            return Ok(());
        }

        match self.phase {
            SyncPhase::Subscribed => {
                self.collection.upsert(bookmark);
            }
            SyncPhase::Loading => self.pending.push(ChangeEvent::Insert(bookmark)),
            _ => {}
        }
        Ok(())
    }

    /// Replace a record after the store confirmed an update
    pub fn update_confirmed(&mut self, bookmark: Bookmark) -> Result<(), SyncError> {
        self.require_owner()?;
        match self.phase {
            SyncPhase::Subscribed => {
                self.collection.update(bookmark);
            }
            SyncPhase::Loading => self.pending.push(ChangeEvent::Update(bookmark)),
            _ => {}
        }
        Ok(())
    }

    /// Remove an entry before the store acknowledges the delete
    ///
    /// Returns the removed entry so a failed delete can be rolled back.
    pub fn remove_optimistic(&mut self, id: &BookmarkId) -> Result<Option<Bookmark>, SyncError> {
        self.require_owner()?;
        let removed = self.collection.remove(id);
        if self.phase == SyncPhase::Loading {
            self.pending
                .push(ChangeEvent::Delete(DeletedRecord::new(id.clone())));
        }
        Ok(removed)
    }

    /// Put back an entry whose delete the store rejected
    ///
    /// Does nothing when rollback is disabled, the owner changed, or the
    /// view is no longer live.
    pub fn rollback_delete(&mut self, bookmark: Bookmark) -> bool {
        if !self.rollback_failed_deletes || self.owner() != Some(&bookmark.owner_id) {
            return false;
        }

        match self.phase {
            SyncPhase::Subscribed => self.collection.restore(bookmark),
            SyncPhase::Loading => {
                self.pending.push(ChangeEvent::Insert(bookmark));
                true
            }
            _ => false,
        }
    }

    /// Release everything and refuse further work; idempotent
    pub fn teardown(&mut self) -> bool {
        if self.phase == SyncPhase::Closed {
            return false;
        }
        self.generation += 1;
        self.pending.clear();
        self.phase = SyncPhase::Closed;
        true
    }

    /// Forget the owner and collection after sign-out
    pub fn reset(&mut self) {
        if self.phase == SyncPhase::Closed {
            return;
        }
        self.generation += 1;
        self.pending.clear();
        self.collection.clear();
        self.context = None;
        self.phase = SyncPhase::Uninitialized;
    }
}
