//! End-to-end scenarios for the live sync driver
//!
//! `ScriptedStore` lets a test hold fetches and deletes until it opens a
//! gate, and `ManualFeed` lets it push change feed messages by hand.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::{mpsc, watch};

use shelf_core::backend::{
    ChangeEvent, ChangeFeed, DeletedRecord, FeedMessage, FeedSubscription, LocalBackend,
    OwnerFilter, RecordStore,
};
use shelf_core::error::{StoreError, StoreResult, SyncError};
use shelf_core::identity::{IdentityProvider, Session, SessionIdentity};
use shelf_core::models::{Bookmark, BookmarkId, BookmarkPatch, NewBookmark, User, UserId};
use shelf_core::sync::{LiveSync, SyncEvent, SyncOptions, SyncPhase, SyncSnapshot};

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn bookmark(id: &str, owner: &str, secs: i64) -> Bookmark {
    Bookmark {
        id: BookmarkId::from(id),
        owner_id: UserId::from(owner),
        url: format!("https://{}.example.com", id),
        title: id.to_uppercase(),
        created_at: at(secs),
    }
}

fn ids(snapshot: &SyncSnapshot) -> Vec<&str> {
    snapshot.bookmarks.iter().map(|b| b.id.as_str()).collect()
}

/// Wait until a published snapshot satisfies `pred`
async fn until(sync: &LiveSync, pred: impl FnMut(&SyncSnapshot) -> bool) -> SyncSnapshot {
    let mut rx = sync.watch();
    let snapshot = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(pred))
        .await
        .expect("timed out waiting for snapshot")
        .expect("driver stopped")
        .clone();
    snapshot
}

/// Record store whose fetches and deletes wait for an open gate
struct ScriptedStore {
    rows: Mutex<Vec<Bookmark>>,
    gate: watch::Sender<bool>,
    fail_deletes: AtomicBool,
    fetches: AtomicUsize,
    next_id: AtomicUsize,
}

impl ScriptedStore {
    fn new(rows: Vec<Bookmark>, open: bool) -> Arc<Self> {
        let (gate, _) = watch::channel(open);
        Arc::new(Self {
            rows: Mutex::new(rows),
            gate,
            fail_deletes: AtomicBool::new(false),
            fetches: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
        })
    }

    fn set_open(&self, open: bool) {
        self.gate.send_replace(open);
    }

    fn set_rows(&self, rows: Vec<Bookmark>) {
        *self.rows.lock().unwrap() = rows;
    }

    async fn wait_open(&self) {
        let mut rx = self.gate.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

#[async_trait]
impl RecordStore for ScriptedStore {
    async fn list_by_owner(&self, owner: &UserId) -> StoreResult<Vec<Bookmark>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.wait_open().await;
        let mut rows: Vec<Bookmark> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|b| &b.owner_id == owner)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn insert(&self, record: NewBookmark) -> StoreResult<Bookmark> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let row = Bookmark {
            id: BookmarkId::new(format!("new-{}", n)),
            owner_id: record.owner_id,
            url: record.url,
            title: record.title,
            created_at: Utc::now(),
        };
        self.rows.lock().unwrap().push(row.clone());
        Ok(row)
    }

    async fn update(
        &self,
        owner: &UserId,
        id: &BookmarkId,
        patch: BookmarkPatch,
    ) -> StoreResult<Bookmark> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .iter_mut()
            .find(|b| &b.id == id && &b.owner_id == owner)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        patch.apply_to(row);
        Ok(row.clone())
    }

    async fn delete_by_id(&self, owner: &UserId, id: &BookmarkId) -> StoreResult<()> {
        self.wait_open().await;
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StoreError::from_status(500, "delete failed"));
        }
        self.rows
            .lock()
            .unwrap()
            .retain(|b| !(&b.id == id && &b.owner_id == owner));
        Ok(())
    }
}

/// Change feed driven by the test
#[derive(Default)]
struct ManualFeed {
    sender: Mutex<Option<mpsc::Sender<FeedMessage>>>,
    subscribes: AtomicUsize,
}

impl ManualFeed {
    async fn push(&self, msg: FeedMessage) {
        let sender = self.sender.lock().unwrap().clone().expect("not subscribed");
        sender.send(msg).await.expect("subscription closed");
    }

    fn is_released(&self) -> bool {
        match self.sender.lock().unwrap().as_ref() {
            Some(sender) => sender.is_closed(),
            None => true,
        }
    }
}

#[async_trait]
impl ChangeFeed for ManualFeed {
    async fn subscribe(&self, _filter: OwnerFilter) -> StoreResult<FeedSubscription> {
        let (tx, subscription) = FeedSubscription::channel(16);
        *self.sender.lock().unwrap() = Some(tx);
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        Ok(subscription)
    }
}

fn spawn_scripted(
    store: &Arc<ScriptedStore>,
    options: SyncOptions,
) -> (LiveSync, mpsc::Receiver<SyncEvent>, Arc<ManualFeed>) {
    let feed = Arc::new(ManualFeed::default());
    let (sync, events) = LiveSync::spawn(store.clone(), feed.clone(), options);
    (sync, events, feed)
}

#[tokio::test]
async fn test_insert_then_remote_delete_leaves_empty() {
    let backend = Arc::new(LocalBackend::open_in_memory().unwrap());
    let (sync, _events) = LiveSync::spawn(backend.clone(), backend.clone(), SyncOptions::default());

    assert_eq!(sync.initialize(UserId::from("u1")).await.unwrap(), 0);

    let added = sync.add("https://a.com", "A").await.unwrap();
    let snapshot = sync.snapshot();
    assert_eq!(snapshot.bookmarks.len(), 1);
    assert_eq!(snapshot.bookmarks[0].id, added.id);

    // Another session deletes it
    backend
        .delete_by_id(&UserId::from("u1"), &added.id)
        .await
        .unwrap();
    let snapshot = until(&sync, |s| s.bookmarks.is_empty()).await;
    assert_eq!(snapshot.phase, SyncPhase::Subscribed);
}

#[tokio::test]
async fn test_changes_from_another_connection_reach_open_view() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let path = temp_dir.path().join("shelf.db");
    let open = || {
        Arc::new(
            LocalBackend::open(&path)
                .unwrap()
                .with_poll_interval(Duration::from_millis(20)),
        )
    };

    let watching = open();
    let (view, _events) = LiveSync::spawn(watching.clone(), watching, SyncOptions::default());
    view.initialize(UserId::from("u1")).await.unwrap();

    let writing = open();
    let (other, _other_events) = LiveSync::spawn(writing.clone(), writing, SyncOptions::default());
    other.initialize(UserId::from("u1")).await.unwrap();

    let added = other.add("https://a.com", "A").await.unwrap();
    let snapshot = until(&view, |s| s.bookmarks.len() == 1).await;
    assert_eq!(snapshot.bookmarks[0].id, added.id);

    other.delete(added.id).await.unwrap();
    until(&view, |s| s.bookmarks.is_empty()).await;
}

#[tokio::test]
async fn test_remote_insert_lands_at_head() {
    let backend = Arc::new(LocalBackend::open_in_memory().unwrap());
    let (sync, _events) = LiveSync::spawn(backend.clone(), backend.clone(), SyncOptions::default());
    sync.initialize(UserId::from("u1")).await.unwrap();
    sync.add("https://a.com", "A").await.unwrap();

    let remote = NewBookmark::from_form(UserId::from("u1"), "b.com", "B").unwrap();
    let b = backend.insert(remote).await.unwrap();

    let snapshot = until(&sync, |s| s.bookmarks.len() == 2).await;
    assert_eq!(snapshot.bookmarks[0].id, b.id);

    // Other users' rows never show up
    let foreign = NewBookmark::from_form(UserId::from("u2"), "c.com", "C").unwrap();
    backend.insert(foreign).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sync.snapshot().bookmarks.len(), 2);
}

#[tokio::test]
async fn test_teardown_discards_inflight_fetch() {
    let store = ScriptedStore::new(vec![bookmark("a", "u1", 1)], false);
    let (sync, _events, feed) = spawn_scripted(&store, SyncOptions::default());

    let pending = {
        let sync = sync.clone();
        tokio::spawn(async move { sync.initialize(UserId::from("u1")).await })
    };
    until(&sync, |s| s.phase == SyncPhase::Loading).await;

    sync.teardown().await;
    assert!(feed.is_released());

    store.set_open(true);
    let result = pending.await.unwrap();
    assert!(matches!(result, Err(SyncError::Closed)));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.fetches.load(Ordering::SeqCst), 1);
    let snapshot = sync.snapshot();
    assert_eq!(snapshot.phase, SyncPhase::Closed);
    assert!(snapshot.bookmarks.is_empty());
}

#[tokio::test]
async fn test_fetch_timeout_is_errored_and_retryable() {
    let store = ScriptedStore::new(vec![bookmark("a", "u1", 1)], false);
    let options = SyncOptions {
        fetch_timeout: Duration::from_millis(50),
        ..SyncOptions::default()
    };
    let (sync, mut events, feed) = spawn_scripted(&store, options);

    let result = sync.initialize(UserId::from("u1")).await;
    assert!(matches!(result, Err(SyncError::FetchTimeout(_))));
    let snapshot = sync.snapshot();
    assert_eq!(snapshot.phase, SyncPhase::Errored);
    assert!(snapshot.bookmarks.is_empty());
    assert!(feed.is_released());

    let mut saw_error = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SyncEvent::Error(SyncError::FetchTimeout(_))) {
            saw_error = true;
        }
    }
    assert!(saw_error);

    store.set_open(true);
    assert_eq!(sync.initialize(UserId::from("u1")).await.unwrap(), 1);
    assert_eq!(sync.snapshot().phase, SyncPhase::Subscribed);
    assert_eq!(feed.subscribes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_fetch_failure_reports_store_error() {
    struct BrokenStore;

    #[async_trait]
    impl RecordStore for BrokenStore {
        async fn list_by_owner(&self, _owner: &UserId) -> StoreResult<Vec<Bookmark>> {
            Err(StoreError::Unauthorized("JWT expired".to_string()))
        }
        async fn insert(&self, _record: NewBookmark) -> StoreResult<Bookmark> {
            Err(StoreError::Unauthorized("JWT expired".to_string()))
        }
        async fn update(
            &self,
            _owner: &UserId,
            id: &BookmarkId,
            _patch: BookmarkPatch,
        ) -> StoreResult<Bookmark> {
            Err(StoreError::NotFound(id.to_string()))
        }
        async fn delete_by_id(&self, _owner: &UserId, _id: &BookmarkId) -> StoreResult<()> {
            Ok(())
        }
    }

    let feed = Arc::new(ManualFeed::default());
    let (sync, _events) = LiveSync::spawn(Arc::new(BrokenStore), feed, SyncOptions::default());

    let err = sync.initialize(UserId::from("u1")).await.unwrap_err();
    assert!(matches!(err, SyncError::FetchFailed(StoreError::Unauthorized(_))));
    assert!(err.recovery_suggestion().unwrap().contains("login"));
    assert_eq!(sync.snapshot().phase, SyncPhase::Errored);

    // A failed insert never enters the collection
    let err = sync.add("https://a.com", "A").await.unwrap_err();
    assert!(matches!(err, SyncError::MutationFailed(_)));
    assert!(sync.snapshot().bookmarks.is_empty());
}

#[tokio::test]
async fn test_delete_is_optimistic_and_rolls_back() {
    let store = ScriptedStore::new(vec![bookmark("a", "u1", 2), bookmark("b", "u1", 1)], true);
    let (sync, _events, _feed) = spawn_scripted(&store, SyncOptions::default());
    sync.initialize(UserId::from("u1")).await.unwrap();

    store.set_open(false);
    store.fail_deletes.store(true, Ordering::SeqCst);
    let pending = {
        let sync = sync.clone();
        tokio::spawn(async move { sync.delete(BookmarkId::from("a")).await })
    };

    // Gone before the store answers
    let snapshot = until(&sync, |s| s.bookmarks.len() == 1).await;
    assert_eq!(ids(&snapshot), vec!["b"]);

    store.set_open(true);
    let result = pending.await.unwrap();
    assert!(matches!(result, Err(SyncError::MutationFailed(_))));

    let snapshot = until(&sync, |s| s.bookmarks.len() == 2).await;
    assert_eq!(ids(&snapshot), vec!["a", "b"]);
}

#[tokio::test]
async fn test_delete_without_rollback_stays_removed() {
    let store = ScriptedStore::new(vec![bookmark("a", "u1", 2)], true);
    let options = SyncOptions {
        rollback_failed_deletes: false,
        ..SyncOptions::default()
    };
    let (sync, _events, _feed) = spawn_scripted(&store, options);
    sync.initialize(UserId::from("u1")).await.unwrap();

    store.fail_deletes.store(true, Ordering::SeqCst);
    assert!(sync.delete(BookmarkId::from("a")).await.is_err());
    assert!(sync.snapshot().bookmarks.is_empty());
}

#[tokio::test]
async fn test_delete_of_absent_id_is_noop() {
    let store = ScriptedStore::new(vec![bookmark("a", "u1", 2)], true);
    let (sync, _events, _feed) = spawn_scripted(&store, SyncOptions::default());
    sync.initialize(UserId::from("u1")).await.unwrap();

    sync.delete(BookmarkId::from("zz")).await.unwrap();
    assert_eq!(ids(&sync.snapshot()), vec!["a"]);
}

#[tokio::test]
async fn test_events_during_loading_are_applied_after_fetch() {
    let store = ScriptedStore::new(vec![bookmark("a", "u1", 1), bookmark("c", "u1", 3)], false);
    let (sync, _events, feed) = spawn_scripted(&store, SyncOptions::default());

    let pending = {
        let sync = sync.clone();
        tokio::spawn(async move { sync.initialize(UserId::from("u1")).await })
    };
    until(&sync, |s| s.phase == SyncPhase::Loading).await;

    feed.push(FeedMessage::Event(ChangeEvent::Insert(bookmark("b", "u1", 5))))
        .await;
    feed.push(FeedMessage::Event(ChangeEvent::Delete(DeletedRecord::new("a"))))
        .await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(sync.snapshot().bookmarks.is_empty());

    store.set_open(true);
    pending.await.unwrap().unwrap();

    let snapshot = until(&sync, |s| s.bookmarks.len() == 2).await;
    assert_eq!(ids(&snapshot), vec!["b", "c"]);
}

#[tokio::test]
async fn test_feed_events_merge_in_order() {
    let store = ScriptedStore::new(vec![bookmark("a", "u1", 1)], true);
    let (sync, mut events, feed) = spawn_scripted(&store, SyncOptions::default());
    sync.initialize(UserId::from("u1")).await.unwrap();

    // Unknown update and foreign insert are ignored
    feed.push(FeedMessage::Event(ChangeEvent::Update(bookmark("zz", "u1", 9))))
        .await;
    feed.push(FeedMessage::Event(ChangeEvent::Insert(bookmark("x", "u2", 9))))
        .await;

    let mut renamed = bookmark("a", "u1", 1);
    renamed.title = "Renamed".to_string();
    feed.push(FeedMessage::Event(ChangeEvent::Update(renamed))).await;
    feed.push(FeedMessage::Event(ChangeEvent::Insert(bookmark("b", "u1", 2))))
        .await;

    let snapshot = until(&sync, |s| s.bookmarks.len() == 2).await;
    assert_eq!(ids(&snapshot), vec!["b", "a"]);
    assert_eq!(snapshot.bookmarks[1].title, "Renamed");

    let mut remote = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::Remote(change) = event {
            remote.push(change.id().to_string());
        }
    }
    assert_eq!(remote, vec!["a", "b"]);
}

#[tokio::test]
async fn test_resume_triggers_refetch() {
    let store = ScriptedStore::new(vec![], true);
    let (sync, mut events, feed) = spawn_scripted(&store, SyncOptions::default());
    sync.initialize(UserId::from("u1")).await.unwrap();

    feed.push(FeedMessage::Dropped("connection reset".to_string()))
        .await;
    store.set_rows(vec![bookmark("missed", "u1", 4)]);
    feed.push(FeedMessage::Resumed).await;

    let snapshot = until(&sync, |s| {
        s.phase == SyncPhase::Subscribed && s.bookmarks.len() == 1
    })
    .await;
    assert_eq!(ids(&snapshot), vec!["missed"]);
    assert_eq!(store.fetches.load(Ordering::SeqCst), 2);
    assert_eq!(feed.subscribes.load(Ordering::SeqCst), 1);

    let mut dropped = false;
    let mut resumed = false;
    while let Ok(event) = events.try_recv() {
        match event {
            SyncEvent::Error(SyncError::SubscriptionDropped(reason)) => {
                assert_eq!(reason, "connection reset");
                dropped = true;
            }
            SyncEvent::FeedResumed => resumed = true,
            _ => {}
        }
    }
    assert!(dropped && resumed);
}

#[tokio::test]
async fn test_follows_sign_in_and_out() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let identity = SessionIdentity::with_path(temp_dir.path().join("session.json")).unwrap();
    let store = ScriptedStore::new(
        vec![bookmark("a", "u1", 1), bookmark("b", "u2", 1)],
        true,
    );
    let (sync, _events, feed) = spawn_scripted(&store, SyncOptions::default());
    let follower = sync.follow(identity.watch());

    identity
        .sign_in(Session::for_user(User::new("u1")))
        .await
        .unwrap();
    let snapshot = until(&sync, |s| s.phase == SyncPhase::Subscribed).await;
    assert_eq!(ids(&snapshot), vec!["a"]);

    identity
        .sign_in(Session::for_user(User::new("u2")))
        .await
        .unwrap();
    let snapshot = until(&sync, |s| s.owner == Some(UserId::from("u2")) && s.phase == SyncPhase::Subscribed).await;
    assert_eq!(ids(&snapshot), vec!["b"]);
    assert_eq!(feed.subscribes.load(Ordering::SeqCst), 2);

    identity.sign_out().await.unwrap();
    let snapshot = until(&sync, |s| s.phase == SyncPhase::Uninitialized).await;
    assert!(snapshot.bookmarks.is_empty());
    assert!(feed.is_released());

    sync.teardown().await;
    follower.abort();
}

#[tokio::test]
async fn test_follow_resets_open_view_when_already_signed_out() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let identity = SessionIdentity::with_path(temp_dir.path().join("session.json")).unwrap();
    let store = ScriptedStore::new(vec![bookmark("a", "u1", 1)], true);
    let (sync, _events, feed) = spawn_scripted(&store, SyncOptions::default());
    sync.initialize(UserId::from("u1")).await.unwrap();

    // No session on disk: the follower's first look already says signed out
    let follower = sync.follow(identity.watch());
    let snapshot = until(&sync, |s| s.phase == SyncPhase::Uninitialized).await;
    assert!(snapshot.bookmarks.is_empty());
    assert!(feed.is_released());

    sync.teardown().await;
    follower.abort();
}
