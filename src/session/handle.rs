//! Live browser session handle

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use chromiumoxide::browser::Browser;
use chromiumoxide::page::Page;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::ScrapeError;
use crate::proxy::{ProxyLease, ProxyLeaseManager};
use crate::session::forwarder::AuthForwarder;

/// Descriptive facts about a session, fixed at launch.
#[derive(Debug, Clone)]
pub struct SessionMeta {
    pub account: String,
    pub profile_dir: PathBuf,
    /// Egress IP observed by the preflight check, when one ran
    pub egress_ip: Option<String>,
    /// DevTools endpoint for attached sessions
    pub debug_endpoint: Option<String>,
}

/// One running browser bound to an account profile and, optionally, a
/// leased proxy. The orchestrator must call `release` on every exit path;
/// the profile directory itself is durable and never deleted here.
pub struct SessionHandle {
    browser: Mutex<Option<Browser>>,
    page: Page,
    handler_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    child: Mutex<Option<tokio::process::Child>>,
    forwarder: Mutex<Option<AuthForwarder>>,
    lease: Option<ProxyLease>,
    pool: Arc<ProxyLeaseManager>,
    alive: Arc<AtomicBool>,
    released: AtomicBool,
    pub meta: SessionMeta,
}

impl SessionHandle {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        browser: Browser,
        page: Page,
        handler_task: JoinHandle<()>,
        child: Option<tokio::process::Child>,
        forwarder: Option<AuthForwarder>,
        lease: Option<ProxyLease>,
        pool: Arc<ProxyLeaseManager>,
        alive: Arc<AtomicBool>,
        meta: SessionMeta,
    ) -> Self {
        Self {
            browser: Mutex::new(Some(browser)),
            page,
            handler_task: parking_lot::Mutex::new(Some(handler_task)),
            child: Mutex::new(child),
            forwarder: Mutex::new(forwarder),
            lease,
            pool,
            alive,
            released: AtomicBool::new(false),
            meta,
        }
    }

    /// Whether the CDP event loop is still running. Flips to false the
    /// moment the browser disconnects or exits.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.released.load(Ordering::SeqCst)
    }

    /// The initial page, used for cookie restore and login verification.
    pub fn page(&self) -> &Page {
        &self.page
    }

    pub fn proxy(&self) -> Option<&ProxyLease> {
        self.lease.as_ref()
    }

    /// Open a fresh tab on about:blank.
    pub async fn new_tab(&self) -> Result<Page, ScrapeError> {
        if !self.is_alive() {
            return Err(ScrapeError::ConnectionLost(
                "browser handler has exited".to_string(),
            ));
        }
        let guard = self.browser.lock().await;
        let browser = guard
            .as_ref()
            .ok_or_else(|| ScrapeError::ConnectionLost("session already released".to_string()))?;
        browser
            .new_page("about:blank")
            .await
            .map_err(|e| ScrapeError::ConnectionLost(e.to_string()))
    }

    /// Tear the session down: tabs, browser, helper processes, then the
    /// proxy lease, in that order. Idempotent; later calls are no-ops.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.alive.store(false, Ordering::SeqCst);

        if let Some(mut browser) = self.browser.lock().await.take() {
            if let Ok(pages) = browser.pages().await {
                for page in pages {
                    let _ = page.close().await;
                }
            }
            let _ = browser.close().await;
            let _ = browser.kill().await;
        }

        if let Some(task) = self.handler_task.lock().take() {
            task.abort();
        }

        if let Some(mut forwarder) = self.forwarder.lock().await.take() {
            forwarder.stop();
        }

        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }

        if let Some(ref lease) = self.lease {
            self.pool.release(lease);
        }

        info!("Session for account '{}' released", self.meta.account);
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if !self.released.load(Ordering::SeqCst) {
            warn!(
                "Session for account '{}' dropped without release",
                self.meta.account
            );
        }
    }
}
