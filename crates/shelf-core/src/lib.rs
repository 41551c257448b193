//! Shelf Core Library
//!
//! This crate provides the core functionality for Shelf, a bookmark manager
//! whose list stays live across every session of a user.
//!
//! # Architecture
//!
//! - **Record store**: the `bookmarks` table, reached through `RecordStore`
//! - **Change feed**: row-level push notifications, reached through `ChangeFeed`
//! - **Live sync**: a driver task merging fetches, local writes and feed
//!   events into one ordered collection
//!
//! # Quick Start
//!
//! ```text
//! let backend = Arc::new(LocalBackend::open(&config.database_path())?);
//! let (sync, _events) = LiveSync::spawn(backend.clone(), backend, SyncOptions::from(&config));
//!
//! sync.initialize(UserId::from("u1")).await?;
//! sync.add("example.com", "Example").await?;
//!
//! for bookmark in sync.snapshot().bookmarks {
//!     println!("{} {}", bookmark.title, bookmark.url);
//! }
//! ```
//!
//! # Modules
//!
//! - `models`: Bookmarks, users and form validation
//! - `backend`: Record store and change feed adapters (SQLite, REST, realtime)
//! - `identity`: Stored session and auth state changes
//! - `sync`: Live collection synchronizer
//! - `config`: Application configuration

pub mod backend;
pub mod config;
pub mod error;
pub mod identity;
pub mod models;
pub mod sync;

pub use backend::{ChangeEvent, ChangeFeed, FeedMessage, LocalBackend, OwnerFilter, RecordStore};
pub use config::{BackendKind, Config};
pub use error::{StoreError, SyncError};
pub use identity::{IdentityProvider, Session, SessionIdentity};
pub use models::{Bookmark, BookmarkId, BookmarkPatch, NewBookmark, User, UserId, ValidationError};
pub use sync::{LiveSync, Lookup, SyncEvent, SyncOptions, SyncPhase, SyncSnapshot};
