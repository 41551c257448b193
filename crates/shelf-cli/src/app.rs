//! Wiring from configuration to a live bookmark view

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::mpsc;
use tracing::debug;

use shelf_core::backend::{RealtimeConfig, RealtimeFeed, RestConfig, RestStore};
use shelf_core::{
    BackendKind, ChangeFeed, Config, IdentityProvider, LiveSync, LocalBackend, RecordStore,
    SessionIdentity, SyncError, SyncEvent, SyncOptions, User,
};

/// Loaded configuration plus the stored session
pub struct App {
    pub config: Config,
    pub identity: SessionIdentity,
}

impl App {
    pub fn new(config: Config) -> Result<Self> {
        let identity = SessionIdentity::new(&config).context("Failed to read session")?;
        Ok(Self { config, identity })
    }

    /// The signed-in user, or an error telling how to sign in
    pub async fn require_user(&self) -> Result<User> {
        match self.identity.current_user().await? {
            Some(user) => Ok(user),
            None => Err(explain(SyncError::AuthRequired)),
        }
    }

    /// Record store and change feed for the configured backend
    pub fn backends(&self) -> Result<(Arc<dyn RecordStore>, Arc<dyn ChangeFeed>)> {
        match self.config.backend {
            BackendKind::Local => {
                let backend = Arc::new(LocalBackend::open(&self.config.database_path())?);
                debug!("Using local database {:?}", self.config.database_path());
                let store: Arc<dyn RecordStore> = backend.clone();
                let feed: Arc<dyn ChangeFeed> = backend;
                Ok((store, feed))
            }
            BackendKind::Hosted => {
                let (url, key) = self.config.hosted_credentials()?;
                let Some(token) = self.identity.access_token()? else {
                    bail!(
                        "The hosted backend needs an access token. Sign in with:\n  \
                         shelf login --token <access token>"
                    );
                };

                let mut rest = RestConfig::new(url, key).with_access_token(token.clone());
                rest.timeout = self.config.fetch_timeout();
                let store = RestStore::new(rest).context("Failed to create HTTP client")?;

                let mut realtime = RealtimeConfig::new(url, key).with_access_token(token);
                realtime.initial_reconnect_delay =
                    std::time::Duration::from_secs(self.config.reconnect_initial_secs.max(1));
                realtime.max_reconnect_delay =
                    std::time::Duration::from_secs(self.config.reconnect_max_secs.max(1));
                debug!("Using hosted backend at {}", url);

                let store: Arc<dyn RecordStore> = Arc::new(store);
                let feed: Arc<dyn ChangeFeed> = Arc::new(RealtimeFeed::new(realtime));
                Ok((store, feed))
            }
        }
    }

    /// Start a synchronizer for the signed-in user and wait for the first load
    pub async fn open_view(&self) -> Result<(LiveSync, mpsc::Receiver<SyncEvent>)> {
        let user = self.require_user().await?;
        let (store, feed) = self.backends()?;
        let (sync, events) = LiveSync::spawn(store, feed, SyncOptions::from(&self.config));

        sync.initialize(user.id).await.map_err(explain)?;
        Ok((sync, events))
    }
}

/// Turn a sync error into a message with its recovery hint
pub fn explain(error: SyncError) -> anyhow::Error {
    match error.recovery_suggestion() {
        Some(hint) => anyhow!("{}\n{}", error, hint),
        None => anyhow!(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelf_core::Session;
    use tempfile::TempDir;

    fn local_app(temp_dir: &TempDir) -> App {
        let config = Config {
            data_dir: temp_dir.path().to_path_buf(),
            ..Config::default()
        };
        App::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_open_view_requires_login() {
        let temp_dir = TempDir::new().unwrap();
        let app = local_app(&temp_dir);

        let err = app.open_view().await.err().expect("login required");
        assert!(err.to_string().contains("shelf login"));
    }

    #[tokio::test]
    async fn test_open_view_local() {
        let temp_dir = TempDir::new().unwrap();
        let app = local_app(&temp_dir);
        app.identity
            .sign_in(Session::for_user(User::new("u1")))
            .await
            .unwrap();

        let (sync, _events) = app.open_view().await.unwrap();
        sync.add("example.com", "Example").await.unwrap();
        assert_eq!(sync.snapshot().bookmarks.len(), 1);
        sync.teardown().await;

        // Stored on disk for the next command
        let (sync, _events) = app.open_view().await.unwrap();
        assert_eq!(sync.snapshot().bookmarks[0].url, "https://example.com");
        sync.teardown().await;
    }

    #[tokio::test]
    async fn test_hosted_backend_needs_settings_and_token() {
        let temp_dir = TempDir::new().unwrap();
        let mut app = local_app(&temp_dir);
        app.config.backend = BackendKind::Hosted;
        assert!(app.backends().is_err());

        app.config.api_url = Some("https://abc.supabase.co".to_string());
        app.config.api_key = Some("anon".to_string());
        let err = app.backends().err().unwrap();
        assert!(err.to_string().contains("--token"));
    }

    #[test]
    fn test_explain_adds_hint() {
        let err = explain(SyncError::AuthRequired);
        assert!(err.to_string().contains("shelf login"));
        let err = explain(SyncError::Closed);
        assert_eq!(err.to_string(), "Bookmark view is closed");
    }
}
