//! Error taxonomy for the scraping engine

use std::collections::HashMap;
use thiserror::Error;

use crate::worker::QueryResult;

/// Fatal errors surfaced to the caller.
///
/// Per-query failures (missed responses, decode misses, navigation hiccups)
/// are never represented here; they degrade to unresolved results and the
/// run continues.
#[derive(Error, Debug)]
pub enum ScrapeError {
    #[error("Proxy unreachable: {0}")]
    ProxyUnreachable(String),

    #[error("No eligible proxy in pool: {0}")]
    ProxyUnavailable(String),

    #[error("Failed to start browser: {0}")]
    BrowserStartFailed(String),

    #[error("Remote-debugging endpoint never became reachable: {0}")]
    AttachTimeout(String),

    #[error("No working tabs: {0}")]
    NoWorkingTabs(String),

    #[error("Authentication required for account '{0}' - log in manually and retry")]
    AuthenticationRequired(String),

    #[error("Unknown account: {0}")]
    UnknownAccount(String),

    #[error("Browser connection lost: {0}")]
    ConnectionLost(String),

    /// The run died mid-flight; whatever was already collected rides along
    /// so the caller never loses paid-for results.
    #[error("Run aborted: {reason}")]
    Aborted {
        reason: String,
        partial: HashMap<String, QueryResult>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ScrapeError> for String {
    fn from(err: ScrapeError) -> String {
        err.to_string()
    }
}
