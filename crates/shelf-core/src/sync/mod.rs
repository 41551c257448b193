//! Live collection synchronizer
//!
//! Keeps an ordered in-memory list of one user's bookmarks consistent with
//! the record store while local writes and change feed events arrive in any
//! order.
//!
//! ## Layers
//!
//! - `collection`: the sorted, id-unique list and its merge rules
//! - `state`: phase machine deciding how fetches, writes and events apply
//! - `session`: driver task running the I/O and publishing snapshots
//!
//! ## Usage
//!
//! ```ignore
//! let (sync, mut events) = LiveSync::spawn(store, feed, SyncOptions::default());
//! sync.initialize(user_id).await?;
//! sync.add("example.com", "Example").await?;
//! for bookmark in sync.snapshot().bookmarks { ... }
//! ```

mod collection;
mod session;
mod state;

pub use collection::BookmarkCollection;
pub use session::{LiveSync, SyncEvent, SyncOptions};
pub use state::{
    EventOutcome, FetchOutcome, FetchTicket, Lookup, SessionContext, SyncPhase, SyncSnapshot,
    Synchronizer,
};
