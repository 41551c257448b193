//! Command handlers

pub mod auth;
pub mod bookmark;
pub mod config;
pub mod status;
pub mod watch;
