//! Data models for Shelf
//!
//! Defines the bookmark row as stored by the record store, the insert and
//! update requests sent to it, and the signed-in user.
//!
//! Field names follow the backing table (`user_id`, `created_at`) so the
//! same types deserialize straight from REST responses and change-feed
//! payloads.

use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque bookmark identifier, assigned by the record store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookmarkId(String);

impl BookmarkId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BookmarkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BookmarkId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for BookmarkId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of the user owning a bookmark
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for ids that cannot name a real user
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A saved bookmark
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bookmark {
    /// Store-assigned identifier
    pub id: BookmarkId,
    /// Owning user
    #[serde(rename = "user_id")]
    pub owner_id: UserId,
    /// Normalized absolute URL
    pub url: String,
    /// Display title
    pub title: String,
    /// Store-assigned insertion time, the sort key
    pub created_at: DateTime<Utc>,
}

impl Bookmark {
    /// First eight characters of the id, for listings
    pub fn short_id(&self) -> &str {
        let id = self.id.as_str();
        match id.char_indices().nth(8) {
            Some((idx, _)) => &id[..idx],
            None => id,
        }
    }
}

/// Insert request: a bookmark before the store assigns id and timestamp
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewBookmark {
    #[serde(rename = "user_id")]
    pub owner_id: UserId,
    pub url: String,
    pub title: String,
}

impl NewBookmark {
    /// Build an insert request from raw form input
    ///
    /// Both fields must be filled in, the URL must look like a web address,
    /// and a missing scheme is replaced with `https://`.
    pub fn from_form(owner_id: UserId, url: &str, title: &str) -> Result<Self, ValidationError> {
        let url = url.trim();
        let title = title.trim();

        if url.is_empty() || title.is_empty() {
            return Err(ValidationError::MissingFields);
        }

        Ok(Self {
            owner_id,
            url: normalize_url(url)?,
            title: title.to_string(),
        })
    }
}

/// Partial update; `id` and owner can never change
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BookmarkPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl BookmarkPatch {
    pub fn is_empty(&self) -> bool {
        self.url.is_none() && self.title.is_none()
    }

    /// Apply the patch to a bookmark in place
    pub fn apply_to(&self, bookmark: &mut Bookmark) {
        if let Some(ref url) = self.url {
            bookmark.url = url.clone();
        }
        if let Some(ref title) = self.title {
            bookmark.title = title.clone();
        }
    }
}

/// The signed-in user as reported by the identity provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    #[serde(default)]
    pub email: Option<String>,
}

impl User {
    pub fn new(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            email: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

/// Rejected form input
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Please fill in all fields")]
    MissingFields,

    #[error("Please enter a valid URL (e.g., https://example.com): '{0}'")]
    InvalidUrl(String),
}

fn url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(https?://)?([\da-z.-]+)\.([a-z.]{2,6})([/\w .-]*)*/?$")
            .expect("URL pattern is a valid regex")
    })
}

/// Validate a URL and prefix it with `https://` when it has no scheme
pub fn normalize_url(input: &str) -> Result<String, ValidationError> {
    let input = input.trim();
    if !url_pattern().is_match(input) {
        return Err(ValidationError::InvalidUrl(input.to_string()));
    }

    if input.starts_with("http://") || input.starts_with("https://") {
        Ok(input.to_string())
    } else {
        Ok(format!("https://{}", input))
    }
}
