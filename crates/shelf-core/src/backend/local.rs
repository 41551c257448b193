//! Local SQLite backend
//!
//! Implements both `RecordStore` and `ChangeFeed` on top of a single SQLite
//! table. Writes made through this backend are published on an in-process
//! broadcast channel. Commits from other connections (another `shelf`
//! process on the same database) are picked up by polling
//! `PRAGMA data_version` and diffing the subscriber's rows. Inserts and
//! updates are filtered by owner; deletes published in-process carry only
//! the row id.
//!
//! Useful offline and as the backend for tests (`open_in_memory`).

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

use super::feed::{ChangeEvent, DeletedRecord, FeedMessage, FeedSubscription, OwnerFilter};
use super::schema::{init_schema, needs_init};
use super::{ChangeFeed, RecordStore};
use crate::error::{StoreError, StoreResult};
use crate::models::{Bookmark, BookmarkId, BookmarkPatch, NewBookmark, UserId};

/// Capacity of the broadcast channel carrying row changes
const CHANGE_BUFFER: usize = 256;

/// Capacity of each subscriber's delivery channel
const FEED_BUFFER: usize = 64;

/// How often an on-disk feed checks for commits from other connections
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How long a write waits for another connection's lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type SharedConnection = Arc<Mutex<Connection>>;

/// SQLite-backed record store with a change feed
pub struct LocalBackend {
    conn: SharedConnection,
    changes: broadcast::Sender<ChangeEvent>,
    /// `None` when no other connection can reach the database
    poll_interval: Option<Duration>,
}

impl LocalBackend {
    /// Open or create the database at `path`
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database at {:?}", path))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("Failed to set SQLite busy timeout")?;

        if needs_init(&conn) {
            init_schema(&conn).context("Failed to initialize SQLite schema")?;
        }

        Ok(Self::from_connection(conn, Some(DEFAULT_POLL_INTERVAL)))
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self::from_connection(conn, None))
    }

    /// Check for commits from other connections at this interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    fn from_connection(conn: Connection, poll_interval: Option<Duration>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            conn: Arc::new(Mutex::new(conn)),
            changes,
            poll_interval,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        lock(&self.conn)
    }

    fn publish(&self, event: ChangeEvent) {
        // No subscribers is fine
        let _ = self.changes.send(event);
    }

    /// Number of bookmarks stored for one owner
    pub fn count_by_owner(&self, owner: &UserId) -> StoreResult<i64> {
        let conn = self.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM bookmarks WHERE user_id = ?",
            params![owner.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn get(
        &self,
        conn: &Connection,
        owner: &UserId,
        id: &BookmarkId,
    ) -> StoreResult<Option<Bookmark>> {
        let row = conn
            .query_row(
                "SELECT id, user_id, url, title, created_at FROM bookmarks
                 WHERE id = ? AND user_id = ?",
                params![id.as_str(), owner.as_str()],
                BookmarkRow::from_row,
            )
            .optional()?;

        row.map(BookmarkRow::hydrate).transpose()
    }
}

fn lock(conn: &SharedConnection) -> MutexGuard<'_, Connection> {
    // A panic while holding the lock cannot leave SQLite half-written
    conn.lock().unwrap_or_else(|e| e.into_inner())
}

fn rows_by_owner(conn: &Connection, owner: &UserId) -> StoreResult<Vec<Bookmark>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, url, title, created_at FROM bookmarks
         WHERE user_id = ? ORDER BY created_at DESC, rowid DESC",
    )?;

    let rows = stmt
        .query_map(params![owner.as_str()], BookmarkRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter().map(BookmarkRow::hydrate).collect()
}

/// Counter that changes whenever another connection commits
fn data_version(conn: &Connection) -> StoreResult<i64> {
    Ok(conn.query_row("PRAGMA data_version", [], |row| row.get(0))?)
}

#[async_trait]
impl RecordStore for LocalBackend {
    async fn list_by_owner(&self, owner: &UserId) -> StoreResult<Vec<Bookmark>> {
        let conn = self.lock();
        rows_by_owner(&conn, owner)
    }

    async fn insert(&self, record: NewBookmark) -> StoreResult<Bookmark> {
        let now = Utc::now().timestamp_millis();
        let bookmark = Bookmark {
            id: BookmarkId::new(Uuid::new_v4().to_string()),
            owner_id: record.owner_id,
            url: record.url,
            title: record.title,
            created_at: millis_to_datetime(now)?,
        };

        {
            let conn = self.lock();
            conn.execute(
                "INSERT INTO bookmarks (id, user_id, url, title, created_at) VALUES (?, ?, ?, ?, ?)",
                params![
                    bookmark.id.as_str(),
                    bookmark.owner_id.as_str(),
                    bookmark.url,
                    bookmark.title,
                    now,
                ],
            )?;
        }

        debug!("Inserted bookmark {} for {}", bookmark.id, bookmark.owner_id);
        self.publish(ChangeEvent::Insert(bookmark.clone()));
        Ok(bookmark)
    }

    async fn update(
        &self,
        owner: &UserId,
        id: &BookmarkId,
        patch: BookmarkPatch,
    ) -> StoreResult<Bookmark> {
        let updated = {
            let conn = self.lock();
            let mut bookmark = self
                .get(&conn, owner, id)?
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

            patch.apply_to(&mut bookmark);
            conn.execute(
                "UPDATE bookmarks SET url = ?, title = ? WHERE id = ? AND user_id = ?",
                params![bookmark.url, bookmark.title, id.as_str(), owner.as_str()],
            )?;
            bookmark
        };

        self.publish(ChangeEvent::Update(updated.clone()));
        Ok(updated)
    }

    async fn delete_by_id(&self, owner: &UserId, id: &BookmarkId) -> StoreResult<()> {
        let removed = {
            let conn = self.lock();
            conn.execute(
                "DELETE FROM bookmarks WHERE id = ? AND user_id = ?",
                params![id.as_str(), owner.as_str()],
            )?
        };

        if removed > 0 {
            debug!("Deleted bookmark {}", id);
            self.publish(ChangeEvent::Delete(DeletedRecord::new(id.clone())));
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for LocalBackend {
    async fn subscribe(&self, filter: OwnerFilter) -> StoreResult<FeedSubscription> {
        let changes = self.changes.subscribe();
        let (tx, subscription) = FeedSubscription::channel(FEED_BUFFER);

        // Baseline taken now, so commits made after subscribing show up as changes
        let watcher = match self.poll_interval {
            Some(interval) => {
                let conn = self.lock();
                let version = data_version(&conn)?;
                let rows = rows_by_owner(&conn, &filter.owner_id)?;
                Some(CommitWatcher::new(Arc::clone(&self.conn), interval, version, rows))
            }
            None => None,
        };

        tokio::spawn(run_feed(filter, changes, watcher, tx));
        Ok(subscription)
    }
}

/// Deliver in-process changes and, if watching, commits from elsewhere
async fn run_feed(
    filter: OwnerFilter,
    mut changes: broadcast::Receiver<ChangeEvent>,
    mut watcher: Option<CommitWatcher>,
    tx: mpsc::Sender<FeedMessage>,
) {
    loop {
        tokio::select! {
            _ = tx.closed() => break,

            received = changes.recv() => match received {
                Ok(event) => {
                    if !filter.admits(&event) {
                        continue;
                    }
                    if let Some(ref mut watcher) = watcher {
                        watcher.track(&event);
                    }
                    if tx.send(FeedMessage::Event(event)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Local change feed lagged, {} changes missed", missed);
                    let dropped = FeedMessage::Dropped(format!("{} changes missed", missed));
                    if tx.send(dropped).await.is_err() || tx.send(FeedMessage::Resumed).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    let _ = tx
                        .send(FeedMessage::Dropped("local backend closed".to_string()))
                        .await;
                    break;
                }
            },

            _ = next_poll(&mut watcher) => {
                let Some(ref mut watcher) = watcher else { continue };
                let mut open = true;
                for msg in watcher.poll(&filter.owner_id) {
                    if tx.send(msg).await.is_err() {
                        open = false;
                        break;
                    }
                }
                if !open {
                    break;
                }
            }
        }
    }
    debug!("Local change feed for {} closed", filter.owner_id);
}

async fn next_poll(watcher: &mut Option<CommitWatcher>) {
    match watcher {
        Some(watcher) => {
            watcher.ticks.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Detects commits made through other connections to the same database
struct CommitWatcher {
    conn: SharedConnection,
    ticks: Interval,
    version: i64,
    /// The subscriber's rows as last delivered
    known: HashMap<BookmarkId, Bookmark>,
    /// Set while the database cannot be read
    failing: bool,
}

impl CommitWatcher {
    fn new(conn: SharedConnection, interval: Duration, version: i64, rows: Vec<Bookmark>) -> Self {
        let mut ticks = tokio::time::interval(interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            conn,
            ticks,
            version,
            known: rows.into_iter().map(|b| (b.id.clone(), b)).collect(),
            failing: false,
        }
    }

    /// Keep the baseline in step with events delivered in-process
    fn track(&mut self, event: &ChangeEvent) {
        match event {
            ChangeEvent::Insert(b) | ChangeEvent::Update(b) => {
                self.known.insert(b.id.clone(), b.clone());
            }
            ChangeEvent::Delete(d) => {
                self.known.remove(&d.id);
            }
        }
    }

    /// Messages for whatever other connections committed since the last poll
    fn poll(&mut self, owner: &UserId) -> Vec<FeedMessage> {
        let read = {
            let conn = lock(&self.conn);
            data_version(&conn).and_then(|version| {
                if version == self.version && !self.failing {
                    Ok(None)
                } else {
                    rows_by_owner(&conn, owner).map(|rows| Some((version, rows)))
                }
            })
        };

        match read {
            Ok(None) => Vec::new(),
            Ok(Some((version, rows))) => {
                self.version = version;
                if self.failing {
                    // The subscriber reloads everything after a resume
                    self.failing = false;
                    self.known = rows.into_iter().map(|b| (b.id.clone(), b)).collect();
                    return vec![FeedMessage::Resumed];
                }
                self.diff(owner, rows)
                    .into_iter()
                    .map(FeedMessage::Event)
                    .collect()
            }
            Err(e) if self.failing => {
                debug!("Local database still unreadable: {}", e);
                Vec::new()
            }
            Err(e) => {
                warn!("Local change feed cannot read the database: {}", e);
                self.failing = true;
                vec![FeedMessage::Dropped(e.to_string())]
            }
        }
    }

    /// Changes between the known rows and a fresh read, oldest insert first
    fn diff(&mut self, owner: &UserId, rows: Vec<Bookmark>) -> Vec<ChangeEvent> {
        let fresh: HashMap<BookmarkId, Bookmark> =
            rows.into_iter().map(|b| (b.id.clone(), b)).collect();

        let mut events: Vec<ChangeEvent> = self
            .known
            .keys()
            .filter(|id| !fresh.contains_key(*id))
            .map(|id| {
                ChangeEvent::Delete(DeletedRecord {
                    id: id.clone(),
                    owner_id: Some(owner.clone()),
                })
            })
            .collect();

        let mut inserts = Vec::new();
        for (id, row) in fresh.iter() {
            match self.known.get(id) {
                None => inserts.push(row.clone()),
                Some(known) if known != row => events.push(ChangeEvent::Update(row.clone())),
                Some(_) => {}
            }
        }
        inserts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        events.extend(inserts.into_iter().map(ChangeEvent::Insert));

        self.known = fresh;
        events
    }
}

/// Raw row as read from SQLite
struct BookmarkRow {
    id: String,
    user_id: String,
    url: String,
    title: String,
    created_at: i64,
}

impl BookmarkRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            url: row.get(2)?,
            title: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    fn hydrate(self) -> StoreResult<Bookmark> {
        Ok(Bookmark {
            id: BookmarkId::new(self.id),
            owner_id: UserId::new(self.user_id),
            url: self.url,
            title: self.title,
            created_at: millis_to_datetime(self.created_at)?,
        })
    }
}

fn millis_to_datetime(millis: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::Decode(format!("timestamp out of range: {}", millis)))
}
