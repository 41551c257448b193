//! Live sync driver task
//!
//! One task owns the `Synchronizer`. Callers send it commands through a
//! `LiveSync` handle and watch immutable snapshots; the task serializes
//! commands, change feed messages and fetch/mutation completions through a
//! single `select!` loop so the collection never needs a lock.
//!
//! Fetches and store writes run on their own tasks and report back through
//! a completion channel. A fetch result is installed only if its ticket is
//! still current, which makes `teardown` safe while requests are in flight.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::state::{EventOutcome, FetchOutcome, FetchTicket, SyncPhase, SyncSnapshot, Synchronizer};
use crate::backend::{ChangeEvent, ChangeFeed, FeedMessage, FeedSubscription, OwnerFilter, RecordStore};
use crate::config::Config;
use crate::error::SyncError;
use crate::models::{Bookmark, BookmarkId, BookmarkPatch, NewBookmark, User, UserId};

/// Behavior settings for the driver
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Upper bound for one bulk fetch
    pub fetch_timeout: Duration,
    /// Restore an entry whose delete the store rejected
    pub rollback_failed_deletes: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(10),
            rollback_failed_deletes: true,
        }
    }
}

impl From<&Config> for SyncOptions {
    fn from(config: &Config) -> Self {
        Self {
            fetch_timeout: config.fetch_timeout(),
            rollback_failed_deletes: config.rollback_failed_deletes,
        }
    }
}

/// Notifications emitted by the driver
#[derive(Debug)]
pub enum SyncEvent {
    /// Phase changed
    PhaseChanged(SyncPhase),
    /// A bulk fetch was installed
    Loaded { count: usize },
    /// A change feed event altered the collection
    Remote(ChangeEvent),
    /// The change feed is back after an interruption
    FeedResumed,
    /// A failure not tied to a caller's request
    Error(SyncError),
}

type Reply<T> = oneshot::Sender<Result<T, SyncError>>;

enum Command {
    Initialize { owner: UserId, reply: Reply<usize> },
    Refresh { reply: Reply<usize> },
    Add { url: String, title: String, reply: Reply<Bookmark> },
    Update { id: BookmarkId, patch: BookmarkPatch, reply: Reply<Bookmark> },
    Delete { id: BookmarkId, reply: Reply<()> },
    Reset { reply: Reply<()> },
    Teardown { reply: Reply<()> },
}

/// Results coming back from spawned store calls
enum Completion {
    Fetched {
        ticket: FetchTicket,
        result: Result<Vec<Bookmark>, SyncError>,
    },
    Inserted {
        result: Result<Bookmark, SyncError>,
        reply: Reply<Bookmark>,
    },
    Updated {
        result: Result<Bookmark, SyncError>,
        reply: Reply<Bookmark>,
    },
    Deleted {
        removed: Option<Bookmark>,
        result: Result<(), SyncError>,
        reply: Reply<()>,
    },
}

/// Handle to a running driver task
///
/// Cheap to clone. The task stops once every handle is dropped.
#[derive(Clone)]
pub struct LiveSync {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<SyncSnapshot>,
}

impl LiveSync {
    /// Spawn the driver task
    ///
    /// Returns the handle and the receiver for driver events. Events are
    /// dropped, not queued, when the receiver falls behind.
    pub fn spawn(
        store: Arc<dyn RecordStore>,
        feed: Arc<dyn ChangeFeed>,
        options: SyncOptions,
    ) -> (Self, mpsc::Receiver<SyncEvent>) {
        let (command_tx, command_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(64);
        let sync = Synchronizer::new(options.rollback_failed_deletes);
        let (snapshot_tx, snapshot_rx) = watch::channel(sync.snapshot());

        let driver = Driver {
            sync,
            store,
            feed,
            options,
            subscription: None,
            waiters: Vec::new(),
            event_tx,
            snapshot_tx,
        };
        tokio::spawn(driver.run(command_rx));

        (
            Self {
                commands: command_tx,
                snapshots: snapshot_rx,
            },
            event_rx,
        )
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, SyncError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| SyncError::Closed)?;
        response.await.map_err(|_| SyncError::Closed)?
    }

    /// Load the user's bookmarks and follow their changes
    ///
    /// Resolves once the list is installed (returning its size) or the
    /// fetch failed.
    pub async fn initialize(&self, owner: UserId) -> Result<usize, SyncError> {
        self.request(|reply| Command::Initialize { owner, reply }).await
    }

    /// Re-run initialization for the current user
    pub async fn refresh(&self) -> Result<usize, SyncError> {
        self.request(|reply| Command::Refresh { reply }).await
    }

    /// Validate form input, store it and add the confirmed record
    pub async fn add(&self, url: &str, title: &str) -> Result<Bookmark, SyncError> {
        let (url, title) = (url.to_string(), title.to_string());
        self.request(|reply| Command::Add { url, title, reply }).await
    }

    pub async fn update(&self, id: BookmarkId, patch: BookmarkPatch) -> Result<Bookmark, SyncError> {
        self.request(|reply| Command::Update { id, patch, reply }).await
    }

    /// Remove locally at once, then delete in the store
    pub async fn delete(&self, id: BookmarkId) -> Result<(), SyncError> {
        self.request(|reply| Command::Delete { id, reply }).await
    }

    /// Forget the current user (sign-out)
    pub async fn reset(&self) -> Result<(), SyncError> {
        self.request(|reply| Command::Reset { reply }).await
    }

    /// Release the subscription and close the view; idempotent
    pub async fn teardown(&self) {
        match self.request(|reply| Command::Teardown { reply }).await {
            Ok(()) | Err(SyncError::Closed) => {}
            Err(e) => warn!("Teardown failed: {}", e),
        }
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver that sees every published snapshot
    pub fn watch(&self) -> watch::Receiver<SyncSnapshot> {
        self.snapshots.clone()
    }

    /// Wait until the view leaves `Loading`
    pub async fn settled(&self) -> SyncSnapshot {
        let mut rx = self.snapshots.clone();
        if rx.wait_for(|s| s.phase != SyncPhase::Loading).await.is_err() {
            debug!("Driver stopped while loading");
        }
        let snapshot = rx.borrow().clone();
        snapshot
    }

    /// Initialize on sign-in and reset on sign-out
    ///
    /// Starts from the view's current owner, so an already open view is only
    /// reloaded or reset when the signed-in user differs from it. The
    /// returned task runs until the identity provider goes away or the
    /// driver stops.
    pub fn follow(&self, mut users: watch::Receiver<Option<User>>) -> JoinHandle<()> {
        let handle = self.clone();
        let mut current = self.snapshot().owner;
        tokio::spawn(async move {
            loop {
                let owner = users.borrow_and_update().as_ref().map(|u| u.id.clone());
                if owner != current {
                    let result = match owner.clone() {
                        Some(id) => {
                            info!("Signed in as {}, loading bookmarks", id);
                            handle.initialize(id).await.map(|_| ())
                        }
                        None => {
                            info!("Signed out, clearing bookmarks");
                            handle.reset().await
                        }
                    };
                    match result {
                        Err(SyncError::Closed) => break,
                        Err(e) => debug!("Auth change handling failed: {}", e),
                        Ok(()) => {}
                    }
                    current = owner;
                }

                if users.changed().await.is_err() {
                    break;
                }
            }
        })
    }
}

/// State owned by the driver task
struct Driver {
    sync: Synchronizer,
    store: Arc<dyn RecordStore>,
    feed: Arc<dyn ChangeFeed>,
    options: SyncOptions,
    /// Feed subscription for the current owner
    subscription: Option<FeedSubscription>,
    /// Callers waiting for the running fetch
    waiters: Vec<Reply<usize>>,
    event_tx: mpsc::Sender<SyncEvent>,
    snapshot_tx: watch::Sender<SyncSnapshot>,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let (done_tx, mut done_rx) = mpsc::channel::<Completion>(16);

        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd, &done_tx).await,
                        None => break,
                    }
                }

                Some(done) = done_rx.recv() => self.handle_completion(done),

                msg = next_feed_message(&mut self.subscription) => {
                    self.handle_feed(msg, &done_tx).await;
                }
            }
        }

        self.teardown();
        debug!("Live sync driver stopped");
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.sync.snapshot());
    }

    fn emit(&self, event: SyncEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            debug!("Dropping sync event: {}", e);
        }
    }

    fn set_phase_published(&self, before: SyncPhase) {
        if self.sync.phase() != before {
            info!("Sync phase {} -> {}", before, self.sync.phase());
            self.emit(SyncEvent::PhaseChanged(self.sync.phase()));
        }
        self.publish();
    }

    async fn handle_command(&mut self, cmd: Command, done_tx: &mpsc::Sender<Completion>) {
        match cmd {
            Command::Initialize { owner, reply } => {
                self.waiters.push(reply);
                self.start_fetch(owner, done_tx).await;
            }

            Command::Refresh { reply } => match self.sync.require_owner() {
                Ok(owner) => {
                    let owner = owner.clone();
                    self.waiters.push(reply);
                    self.start_fetch(owner, done_tx).await;
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },

            Command::Add { url, title, reply } => {
                let record = self
                    .sync
                    .require_owner()
                    .cloned()
                    .and_then(|owner| NewBookmark::from_form(owner, &url, &title).map_err(SyncError::from));
                let record = match record {
                    Ok(record) => record,
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return;
                    }
                };

                let store = Arc::clone(&self.store);
                let done_tx = done_tx.clone();
                tokio::spawn(async move {
                    let result = store.insert(record).await.map_err(SyncError::MutationFailed);
                    let _ = done_tx.send(Completion::Inserted { result, reply }).await;
                });
            }

            Command::Update { id, patch, reply } => {
                let owner = match self.sync.require_owner() {
                    Ok(owner) => owner.clone(),
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return;
                    }
                };
                let patch = match normalize_patch(patch) {
                    Ok(patch) => patch,
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return;
                    }
                };

                let store = Arc::clone(&self.store);
                let done_tx = done_tx.clone();
                tokio::spawn(async move {
                    let result = store
                        .update(&owner, &id, patch)
                        .await
                        .map_err(SyncError::MutationFailed);
                    let _ = done_tx.send(Completion::Updated { result, reply }).await;
                });
            }

            Command::Delete { id, reply } => {
                let owner = match self.sync.require_owner() {
                    Ok(owner) => owner.clone(),
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return;
                    }
                };
                let removed = match self.sync.remove_optimistic(&id) {
                    Ok(removed) => removed,
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return;
                    }
                };
                if removed.is_some() {
                    self.publish();
                }

                let store = Arc::clone(&self.store);
                let done_tx = done_tx.clone();
                tokio::spawn(async move {
                    let result = store
                        .delete_by_id(&owner, &id)
                        .await
                        .map_err(SyncError::MutationFailed);
                    let _ = done_tx
                        .send(Completion::Deleted {
                            removed,
                            result,
                            reply,
                        })
                        .await;
                });
            }

            Command::Reset { reply } => {
                let before = self.sync.phase();
                self.release_subscription();
                self.sync.reset();
                self.fail_waiters(SyncError::AuthRequired);
                self.set_phase_published(before);
                let _ = reply.send(Ok(()));
            }

            Command::Teardown { reply } => {
                self.teardown();
                let _ = reply.send(Ok(()));
            }
        }
    }

    /// Open the feed (if needed) and spawn the bulk fetch
    async fn start_fetch(&mut self, owner: UserId, done_tx: &mpsc::Sender<Completion>) {
        let before = self.sync.phase();
        let switching = self.sync.owner() != Some(&owner);

        let ticket = match self.sync.begin_initialize(owner.clone()) {
            Ok(ticket) => ticket,
            Err(e) => {
                self.fail_waiters(e);
                return;
            }
        };

        if switching {
            self.release_subscription();
        }

        // Subscribe first so nothing committed during the fetch is missed
        if self.subscription.is_none() {
            match self.feed.subscribe(OwnerFilter::new(owner.clone())).await {
                Ok(subscription) => self.subscription = Some(subscription),
                Err(e) => {
                    let error = SyncError::SubscriptionDropped(e.to_string());
                    self.finish_fetch(ticket, Err(error));
                    self.set_phase_published(before);
                    return;
                }
            }
        }
        self.set_phase_published(before);

        let store = Arc::clone(&self.store);
        let timeout = self.options.fetch_timeout;
        let done_tx = done_tx.clone();
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, store.list_by_owner(&owner)).await {
                Ok(Ok(rows)) => Ok(rows),
                Ok(Err(e)) => Err(SyncError::FetchFailed(e)),
                Err(_) => Err(SyncError::FetchTimeout(timeout)),
            };
            let _ = done_tx.send(Completion::Fetched { ticket, result }).await;
        });
    }

    fn handle_completion(&mut self, done: Completion) {
        match done {
            Completion::Fetched { ticket, result } => {
                let before = self.sync.phase();
                self.finish_fetch(ticket, result);
                self.set_phase_published(before);
            }

            Completion::Inserted { result, reply } => {
                if let Ok(ref bookmark) = result {
                    match self.sync.insert_optimistic(bookmark.clone()) {
                        Ok(()) => self.publish(),
                        Err(e) => debug!("Not adding {}: {}", bookmark.id, e),
                    }
                }
                let _ = reply.send(result);
            }

            Completion::Updated { result, reply } => {
                if let Ok(ref bookmark) = result {
                    if self.sync.update_confirmed(bookmark.clone()).is_ok() {
                        self.publish();
                    }
                }
                let _ = reply.send(result);
            }

            Completion::Deleted {
                removed,
                result,
                reply,
            } => {
                if let (Err(e), Some(bookmark)) = (&result, removed) {
                    warn!("Delete of {} failed: {}", bookmark.id, e);
                    if self.sync.rollback_delete(bookmark) {
                        self.publish();
                    }
                }
                let _ = reply.send(result);
            }
        }
    }

    /// Hand a fetch result to the synchronizer and answer waiters
    fn finish_fetch(&mut self, ticket: FetchTicket, result: Result<Vec<Bookmark>, SyncError>) {
        match self.sync.complete_initialize(ticket, result) {
            Ok(FetchOutcome::Installed { count, replayed }) => {
                debug!("Installed {} bookmarks ({} buffered events)", count, replayed);
                self.emit(SyncEvent::Loaded { count });
                for waiter in self.waiters.drain(..) {
                    let _ = waiter.send(Ok(count));
                }
            }
            Ok(FetchOutcome::Stale) => {}
            Err(e) => {
                warn!("Initialization failed: {}", e);
                self.release_subscription();
                self.emit(SyncEvent::Error(e.share()));
                self.fail_waiters(e);
            }
        }
    }

    async fn handle_feed(&mut self, msg: Option<FeedMessage>, done_tx: &mpsc::Sender<Completion>) {
        match msg {
            Some(FeedMessage::Event(event)) => {
                let kind = event.kind();
                let id = event.id().clone();
                match self.sync.apply_remote_event(event.clone()) {
                    EventOutcome::Applied => {
                        debug!("Applied remote {} {}", kind, id);
                        self.publish();
                        self.emit(SyncEvent::Remote(event));
                    }
                    EventOutcome::Buffered => debug!("Buffered remote {} {}", kind, id),
                    EventOutcome::Unchanged | EventOutcome::Ignored => {}
                }
            }

            Some(FeedMessage::Dropped(reason)) => {
                warn!("Change feed dropped: {}", reason);
                self.emit(SyncEvent::Error(SyncError::SubscriptionDropped(reason)));
            }

            Some(FeedMessage::Resumed) => {
                self.emit(SyncEvent::FeedResumed);
                // Changes made during the outage were not delivered
                if let Some(owner) = self.sync.owner().cloned() {
                    info!("Change feed resumed, reloading bookmarks");
                    self.start_fetch(owner, done_tx).await;
                }
            }

            None => {
                warn!("Change feed ended");
                self.subscription = None;
                self.emit(SyncEvent::Error(SyncError::SubscriptionDropped(
                    "change feed ended".to_string(),
                )));
            }
        }
    }

    fn release_subscription(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }

    fn fail_waiters(&mut self, error: SyncError) {
        let mut waiters = std::mem::take(&mut self.waiters);
        let last = waiters.pop();
        for waiter in waiters {
            let _ = waiter.send(Err(error.share()));
        }
        if let Some(waiter) = last {
            let _ = waiter.send(Err(error));
        }
    }

    fn teardown(&mut self) {
        let before = self.sync.phase();
        self.release_subscription();
        if self.sync.teardown() {
            self.fail_waiters(SyncError::Closed);
            self.set_phase_published(before);
        }
    }
}

/// Next feed message, or never if there is no subscription
async fn next_feed_message(subscription: &mut Option<FeedSubscription>) -> Option<FeedMessage> {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}

/// Validate and normalize the URL of an update
fn normalize_patch(mut patch: BookmarkPatch) -> Result<BookmarkPatch, SyncError> {
    if let Some(url) = patch.url.take() {
        patch.url = Some(crate::models::normalize_url(&url)?);
    }
    if let Some(title) = patch.title.take() {
        let title = title.trim();
        if title.is_empty() {
            return Err(crate::models::ValidationError::MissingFields.into());
        }
        patch.title = Some(title.to_string());
    }
    Ok(patch)
}
