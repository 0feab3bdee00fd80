//! Login-state verification and cookie carry-over
//!
//! The engine never performs logins. It restores previously captured
//! cookies into a fresh browser context, checks that the target page shows
//! a logged-in user, and writes the (possibly rotated) cookies back after a
//! successful run. When verification fails the run aborts so an operator
//! can log the account in manually.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, SetCookiesParams, TimeSinceEpoch,
};
use chromiumoxide::page::Page;
use tracing::{debug, info, warn};

use crate::account::{AccountStore, CookieRecord};
use crate::site::SiteAdapter;

pub struct AuthManager {
    adapter: Arc<SiteAdapter>,
}

impl AuthManager {
    pub fn new(adapter: Arc<SiteAdapter>) -> Self {
        Self { adapter }
    }

    /// Inject saved cookies when the live context carries none for the
    /// service domain. Must run before the first navigation to the target
    /// page so the session cookie is already present.
    pub async fn restore_cookies(&self, page: &Page, account: &str, store: &dyn AccountStore) {
        let live = page.get_cookies().await.unwrap_or_default();
        if live
            .iter()
            .any(|c| c.domain.contains(&self.adapter.cookie_domain))
        {
            debug!(
                "Profile for '{}' already holds service cookies; not restoring",
                account
            );
            return;
        }

        let Some(saved) = store.load_cookies(account) else {
            debug!("No saved cookies for account '{}'", account);
            return;
        };
        if saved.is_empty() {
            return;
        }

        let params: Vec<CookieParam> = saved.iter().filter_map(cookie_param).collect();
        let count = params.len();
        match page.execute(SetCookiesParams::new(params)).await {
            Ok(_) => info!("Restored {} cookies for account '{}'", count, account),
            Err(e) => warn!("Cookie restore failed for '{}': {}", account, e),
        }
    }

    /// Poll the page for a logged-in marker. A redirect into the login flow
    /// is a definitive "no"; otherwise keep looking until the page renders
    /// one of the profile markers or the wait runs out.
    pub async fn verify(&self, page: &Page, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        loop {
            if let Ok(Some(url)) = page.url().await {
                if self.adapter.is_login_url(&url) {
                    debug!("Login redirect detected: {}", url);
                    return false;
                }
            }

            if page
                .find_element(self.adapter.logged_in_selector.as_str())
                .await
                .is_ok()
            {
                return true;
            }
            if page
                .find_element(self.adapter.profile_selector.as_str())
                .await
                .is_ok()
            {
                return true;
            }

            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// Capture the service-domain cookies and hand them to the store. Runs
    /// after a successful scrape so rotated session cookies survive.
    pub async fn persist_cookies(&self, page: &Page, account: &str, store: &dyn AccountStore) {
        let cookies = match page.get_cookies().await {
            Ok(c) => c,
            Err(e) => {
                warn!("Could not read cookies for '{}': {}", account, e);
                return;
            }
        };

        let records: Vec<CookieRecord> = cookies
            .iter()
            .filter(|c| c.domain.contains(&self.adapter.cookie_domain))
            .map(|c| CookieRecord {
                name: c.name.clone(),
                value: c.value.clone(),
                domain: c.domain.clone(),
                path: c.path.clone(),
                secure: c.secure,
                http_only: c.http_only,
                // CDP reports -1 for session cookies
                expires: if c.expires < 0.0 { None } else { Some(c.expires) },
            })
            .collect();

        // An empty capture would clobber a previously good snapshot
        if records.is_empty() {
            debug!("No service cookies to persist for '{}'", account);
            return;
        }
        store.save_cookies(account, &records);
    }
}

fn cookie_param(record: &CookieRecord) -> Option<CookieParam> {
    let mut builder = CookieParam::builder()
        .name(record.name.as_str())
        .value(record.value.as_str())
        .domain(record.domain.as_str())
        .path(record.path.as_str())
        .secure(record.secure)
        .http_only(record.http_only);
    if let Some(expires) = record.expires {
        builder = builder.expires(TimeSinceEpoch::new(expires));
    }
    builder.build().ok()
}
