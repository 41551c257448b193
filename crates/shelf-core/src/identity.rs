//! Identity and session management
//!
//! Shelf does not run OAuth flows itself. A session issued by the identity
//! provider (or, for the local backend, a bare user id) is stored in
//! `session.json` in the data directory, and everything that needs an owner
//! reads the current user from here.
//!
//! Sessions built from an access token take the user from the token's JWT
//! claims (`sub`, `email`, `exp`). The signature is not checked locally;
//! the hosted backend verifies it on every request.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::Config;
use crate::models::{User, UserId};

/// Access to the signed-in user
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// The current user, or `None` when signed out or the session expired
    async fn current_user(&self) -> Result<Option<User>>;

    /// Store a new session and announce the user
    async fn sign_in(&self, session: Session) -> Result<User>;

    /// Forget the session and announce the sign-out
    async fn sign_out(&self) -> Result<()>;

    /// Receives the current user on every auth state change
    fn watch(&self) -> watch::Receiver<Option<User>>;
}

/// A stored session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub user: User,
    /// Bearer token for the hosted backend
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Session without a token (local backend)
    pub fn for_user(user: User) -> Self {
        Self {
            user,
            access_token: None,
            expires_at: None,
        }
    }

    /// Session from an access token issued by the identity provider
    pub fn from_access_token(token: &str) -> Result<Self> {
        let claims = decode_claims(token)?;
        if claims.sub.trim().is_empty() {
            bail!("Access token has no subject");
        }

        let expires_at = claims.exp.and_then(|exp| DateTime::from_timestamp(exp, 0));

        Ok(Self {
            user: User {
                id: UserId::new(claims.sub),
                email: claims.email,
            },
            access_token: Some(token.to_string()),
            expires_at,
        })
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| exp <= Utc::now())
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    exp: Option<i64>,
}

fn decode_claims(token: &str) -> Result<Claims> {
    let payload = token
        .split('.')
        .nth(1)
        .context("Access token is not a JWT")?;

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .context("Access token payload is not valid base64")?;

    serde_json::from_slice(&bytes).context("Access token payload is not valid JSON")
}

/// File-backed identity provider
pub struct SessionIdentity {
    path: PathBuf,
    state: watch::Sender<Option<User>>,
}

impl SessionIdentity {
    /// Session stored in the configured data directory
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_path(config.session_path())
    }

    /// Session stored at a specific path
    pub fn with_path(path: PathBuf) -> Result<Self> {
        let user = load_session(&path)?
            .filter(|s| !s.is_expired())
            .map(|s| s.user);
        let (state, _) = watch::channel(user);
        Ok(Self { path, state })
    }

    /// The stored session, if any and not expired
    pub fn session(&self) -> Result<Option<Session>> {
        Ok(load_session(&self.path)?.filter(|s| !s.is_expired()))
    }

    /// Bearer token of the stored session
    pub fn access_token(&self) -> Result<Option<String>> {
        Ok(self.session()?.and_then(|s| s.access_token))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn announce(&self, user: Option<User>) {
        self.state.send_if_modified(|current| {
            if *current == user {
                false
            } else {
                *current = user;
                true
            }
        });
    }
}

#[async_trait]
impl IdentityProvider for SessionIdentity {
    async fn current_user(&self) -> Result<Option<User>> {
        // Another process may have signed in or out since we last looked
        let user = self.session()?.map(|s| s.user);
        self.announce(user.clone());
        Ok(user)
    }

    async fn sign_in(&self, session: Session) -> Result<User> {
        if session.user.id.is_blank() {
            bail!("Cannot sign in without a user id");
        }
        if session.is_expired() {
            bail!("Session has already expired");
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        let json = serde_json::to_string_pretty(&session).context("Failed to serialize session")?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("Failed to write session file {:?}", self.path))?;

        info!("Signed in as {}", session.user.id);
        self.announce(Some(session.user.clone()));
        Ok(session.user)
    }

    async fn sign_out(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)
                .with_context(|| format!("Failed to remove session file {:?}", self.path))?;
        }
        debug!("Session cleared");
        self.announce(None);
        Ok(())
    }

    fn watch(&self) -> watch::Receiver<Option<User>> {
        self.state.subscribe()
    }
}

fn load_session(path: &Path) -> Result<Option<Session>> {
    if !path.exists() {
        return Ok(None);
    }

    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read session file {:?}", path))?;
    let session = serde_json::from_str(&json)
        .with_context(|| format!("Failed to parse session file {:?}", path))?;
    Ok(Some(session))
}
