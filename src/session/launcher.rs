//! Session startup: spawn a managed browser or attach to a debug port

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chromiumoxide::browser::{Browser, BrowserConfig};
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::account::AccountProfile;
use crate::error::ScrapeError;
use crate::proxy::{ProxyLease, ProxyLeaseManager, ProxyRecord};
use crate::session::forwarder::AuthForwarder;
use crate::session::handle::{SessionHandle, SessionMeta};

/// How the launcher obtains a browser for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LaunchMode {
    /// Spawn Chrome bound to the durable profile directory
    Persistent,
    /// Connect to an already-running Chrome over its DevTools port,
    /// starting one if the port is silent
    Attach,
}

/// The proxy binding for one session: a pooled lease, or a free-standing
/// record parsed from an inline string (which has nothing to release).
pub struct SessionProxy {
    pub record: ProxyRecord,
    pub lease: Option<ProxyLease>,
}

impl From<ProxyLease> for SessionProxy {
    fn from(lease: ProxyLease) -> Self {
        Self {
            record: lease.proxy.clone(),
            lease: Some(lease),
        }
    }
}

impl From<ProxyRecord> for SessionProxy {
    fn from(record: ProxyRecord) -> Self {
        Self {
            record,
            lease: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub headless: bool,
    pub chrome_path: Option<PathBuf>,
    pub window_width: u32,
    pub window_height: u32,
    /// IP-echo endpoint hit through the proxy before spending a browser on it
    pub preflight_url: String,
    pub preflight_timeout: Duration,
    pub launch_timeout: Duration,
    /// Fixed debug port for attach mode; derived from the account name when absent
    pub attach_port: Option<u16>,
    pub attach_timeout: Duration,
    pub attach_poll: Duration,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_path: None,
            window_width: 1920,
            window_height: 1080,
            preflight_url: "https://api.ipify.org?format=json".to_string(),
            preflight_timeout: Duration::from_secs(10),
            launch_timeout: Duration::from_secs(45),
            attach_port: None,
            attach_timeout: Duration::from_secs(10),
            attach_poll: Duration::from_millis(200),
        }
    }
}

/// Builds ready-to-use sessions. Owns no state beyond its options and the
/// pool reference it needs for returning leases on failed launches.
pub struct SessionLauncher {
    options: LaunchOptions,
    pool: Arc<ProxyLeaseManager>,
}

impl SessionLauncher {
    pub fn new(options: LaunchOptions, pool: Arc<ProxyLeaseManager>) -> Self {
        Self { options, pool }
    }

    /// Launch a session for `account`. On any failure the proxy lease (if
    /// present) goes back to the pool before the error is returned.
    pub async fn launch(
        &self,
        account: &AccountProfile,
        proxy: Option<SessionProxy>,
        mode: LaunchMode,
    ) -> Result<SessionHandle, ScrapeError> {
        let profile_dir = account.resolve_profile_dir();
        if let Err(e) = std::fs::create_dir_all(&profile_dir) {
            self.abandon(&proxy, None);
            return Err(ScrapeError::Io(e));
        }

        // Validate the proxy before spending a browser launch on it.
        // SOCKS endpoints skip this; the browser validates them lazily.
        let mut egress_ip = None;
        if let Some(ref p) = proxy {
            if !p.record.scheme.is_socks() {
                match preflight(
                    &p.record,
                    &self.options.preflight_url,
                    self.options.preflight_timeout,
                )
                .await
                {
                    Ok(ip) => {
                        info!("Proxy {} egress IP: {}", p.record.id, ip);
                        self.pool.record_check(&p.record.id, &ip);
                        egress_ip = Some(ip);
                    }
                    Err(e) => {
                        self.abandon(&proxy, None);
                        return Err(ScrapeError::ProxyUnreachable(e));
                    }
                }
            }
        }

        // Attach mode cannot hand credentials to an externally-started
        // Chrome, so authenticated proxies force a managed launch.
        let mode = match mode {
            LaunchMode::Attach
                if proxy
                    .as_ref()
                    .map(|p| p.record.has_credentials())
                    .unwrap_or(false) =>
            {
                warn!(
                    "Proxy for account '{}' needs credentials; using a managed browser instead of attaching",
                    account.name
                );
                LaunchMode::Persistent
            }
            m => m,
        };

        // Authenticated HTTP proxies go through a local forwarder because
        // --proxy-server takes no credentials.
        let mut forwarder = None;
        let proxy_arg = match proxy {
            Some(ref p) if p.record.has_credentials() && !p.record.scheme.is_socks() => {
                match AuthForwarder::start(&p.record).await {
                    Ok(fwd) => {
                        let url = fwd.local_url();
                        forwarder = Some(fwd);
                        Some(url)
                    }
                    Err(e) => {
                        self.abandon(&proxy, None);
                        return Err(ScrapeError::ProxyUnreachable(format!(
                            "credential forwarder failed to start: {}",
                            e
                        )));
                    }
                }
            }
            Some(ref p) => Some(p.record.server_url()),
            None => None,
        };

        match mode {
            LaunchMode::Persistent => {
                self.launch_persistent(account, proxy, forwarder, &profile_dir, proxy_arg, egress_ip)
                    .await
            }
            LaunchMode::Attach => {
                self.launch_attached(account, proxy, forwarder, &profile_dir, proxy_arg, egress_ip)
                    .await
            }
        }
    }

    async fn launch_persistent(
        &self,
        account: &AccountProfile,
        proxy: Option<SessionProxy>,
        mut forwarder: Option<AuthForwarder>,
        profile_dir: &PathBuf,
        proxy_arg: Option<String>,
        egress_ip: Option<String>,
    ) -> Result<SessionHandle, ScrapeError> {
        let config = match self.browser_config(profile_dir, proxy_arg.as_deref()) {
            Ok(c) => c,
            Err(e) => {
                self.abandon(&proxy, forwarder.as_mut());
                return Err(e);
            }
        };

        let launched =
            tokio::time::timeout(self.options.launch_timeout, Browser::launch(config)).await;
        let (browser, handler) = match launched {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                self.abandon(&proxy, forwarder.as_mut());
                return Err(ScrapeError::BrowserStartFailed(e.to_string()));
            }
            Err(_) => {
                self.abandon(&proxy, forwarder.as_mut());
                return Err(ScrapeError::BrowserStartFailed(format!(
                    "browser did not come up within {:?}",
                    self.options.launch_timeout
                )));
            }
        };

        self.assemble(
            account, browser, handler, None, forwarder, proxy, profile_dir, egress_ip, None,
        )
        .await
    }

    async fn launch_attached(
        &self,
        account: &AccountProfile,
        proxy: Option<SessionProxy>,
        mut forwarder: Option<AuthForwarder>,
        profile_dir: &PathBuf,
        proxy_arg: Option<String>,
        egress_ip: Option<String>,
    ) -> Result<SessionHandle, ScrapeError> {
        let port = self
            .options
            .attach_port
            .unwrap_or_else(|| derive_debug_port(&account.name));
        let endpoint = format!("http://127.0.0.1:{}/json/version", port);

        let mut child = None;
        let ws_url = match fetch_ws_url(&endpoint).await {
            Some(ws) => {
                info!("Reusing running browser at {}", endpoint);
                ws
            }
            None => {
                let spawned =
                    self.spawn_debug_chrome(profile_dir, proxy_arg.as_deref(), port);
                let mut spawned = match spawned {
                    Ok(c) => c,
                    Err(e) => {
                        self.abandon(&proxy, forwarder.as_mut());
                        return Err(e);
                    }
                };

                let deadline = Instant::now() + self.options.attach_timeout;
                let ws = loop {
                    if let Some(ws) = fetch_ws_url(&endpoint).await {
                        break Some(ws);
                    }
                    if Instant::now() >= deadline {
                        break None;
                    }
                    tokio::time::sleep(self.options.attach_poll).await;
                };

                match ws {
                    Some(ws) => {
                        child = Some(spawned);
                        ws
                    }
                    None => {
                        let _ = spawned.start_kill();
                        let _ = spawned.wait().await;
                        self.abandon(&proxy, forwarder.as_mut());
                        return Err(ScrapeError::AttachTimeout(endpoint));
                    }
                }
            }
        };

        let (browser, handler) = match Browser::connect(ws_url).await {
            Ok(pair) => pair,
            Err(e) => {
                if let Some(mut c) = child.take() {
                    let _ = c.start_kill();
                    let _ = c.wait().await;
                }
                self.abandon(&proxy, forwarder.as_mut());
                return Err(ScrapeError::BrowserStartFailed(format!(
                    "devtools connect failed: {}",
                    e
                )));
            }
        };

        self.assemble(
            account,
            browser,
            handler,
            child,
            forwarder,
            proxy,
            profile_dir,
            egress_ip,
            Some(endpoint),
        )
        .await
    }

    /// Shared tail of both launch paths: drive the CDP event loop, claim a
    /// first page, and wrap everything in a handle.
    #[allow(clippy::too_many_arguments)]
    async fn assemble(
        &self,
        account: &AccountProfile,
        browser: Browser,
        mut handler: chromiumoxide::Handler,
        child: Option<tokio::process::Child>,
        mut forwarder: Option<AuthForwarder>,
        proxy: Option<SessionProxy>,
        profile_dir: &PathBuf,
        egress_ip: Option<String>,
        debug_endpoint: Option<String>,
    ) -> Result<SessionHandle, ScrapeError> {
        let alive = Arc::new(AtomicBool::new(true));
        let alive_flag = alive.clone();
        let account_name = account.name.clone();
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
            alive_flag.store(false, Ordering::SeqCst);
            debug!("Browser event loop for '{}' ended", account_name);
        });

        // Reuse the browser's startup tab; close any session-restore extras.
        let mut pages = browser.pages().await.unwrap_or_default();
        let page = if pages.is_empty() {
            match browser.new_page("about:blank").await {
                Ok(p) => p,
                Err(e) => {
                    handler_task.abort();
                    self.abandon(&proxy, forwarder.as_mut());
                    return Err(ScrapeError::BrowserStartFailed(format!(
                        "no usable page: {}",
                        e
                    )));
                }
            }
        } else {
            let first = pages.remove(0);
            for extra in pages {
                let _ = extra.close().await;
            }
            first
        };

        let meta = SessionMeta {
            account: account.name.clone(),
            profile_dir: profile_dir.clone(),
            egress_ip,
            debug_endpoint,
        };
        info!(
            "Session up for account '{}' (profile {:?})",
            account.name, profile_dir
        );

        Ok(SessionHandle::new(
            browser,
            page,
            handler_task,
            child,
            forwarder,
            proxy.and_then(|p| p.lease),
            self.pool.clone(),
            alive,
            meta,
        ))
    }

    fn browser_config(
        &self,
        profile_dir: &PathBuf,
        proxy_arg: Option<&str>,
    ) -> Result<BrowserConfig, ScrapeError> {
        let chrome = self
            .options
            .chrome_path
            .clone()
            .or_else(find_chrome)
            .ok_or_else(|| {
                ScrapeError::BrowserStartFailed(
                    "Chrome/Chromium executable not found; install it or set chrome_path"
                        .to_string(),
                )
            })?;

        let mut builder = BrowserConfig::builder();
        if self.options.headless {
            builder = builder.arg("--headless=new");
        } else {
            builder = builder.with_head();
        }

        builder = builder
            .chrome_executable(chrome)
            .user_data_dir(profile_dir)
            .window_size(self.options.window_width, self.options.window_height)
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-session-crashed-bubble")
            .arg("--disable-restore-session-state")
            .arg("--disable-notifications");

        if let Some(server) = proxy_arg {
            builder = builder.arg(format!("--proxy-server={}", server));
        }

        builder.build().map_err(ScrapeError::BrowserStartFailed)
    }

    fn spawn_debug_chrome(
        &self,
        profile_dir: &PathBuf,
        proxy_arg: Option<&str>,
        port: u16,
    ) -> Result<tokio::process::Child, ScrapeError> {
        let chrome = self
            .options
            .chrome_path
            .clone()
            .or_else(find_chrome)
            .ok_or_else(|| {
                ScrapeError::BrowserStartFailed(
                    "Chrome/Chromium executable not found; install it or set chrome_path"
                        .to_string(),
                )
            })?;

        let mut cmd = tokio::process::Command::new(chrome);
        cmd.arg(format!("--remote-debugging-port={}", port))
            .arg(format!("--user-data-dir={}", profile_dir.display()))
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        if self.options.headless {
            cmd.arg("--headless=new");
        }
        if let Some(server) = proxy_arg {
            cmd.arg(format!("--proxy-server={}", server));
        }
        cmd.arg("about:blank")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        cmd.spawn()
            .map_err(|e| ScrapeError::BrowserStartFailed(format!("failed to spawn chrome: {}", e)))
    }

    fn abandon(&self, proxy: &Option<SessionProxy>, forwarder: Option<&mut AuthForwarder>) {
        if let Some(fwd) = forwarder {
            fwd.stop();
        }
        if let Some(p) = proxy {
            if let Some(ref lease) = p.lease {
                self.pool.release(lease);
            }
        }
    }
}

/// Hit the IP-echo endpoint through the proxy and return the egress IP.
async fn preflight(
    record: &ProxyRecord,
    url: &str,
    timeout: Duration,
) -> Result<String, String> {
    let mut proxy = reqwest::Proxy::all(record.server_url()).map_err(|e| e.to_string())?;
    if record.has_credentials() {
        proxy = proxy.basic_auth(
            record.username.as_deref().unwrap_or_default(),
            record.password.as_deref().unwrap_or_default(),
        );
    }
    let client = reqwest::Client::builder()
        .proxy(proxy)
        .timeout(timeout)
        .build()
        .map_err(|e| e.to_string())?;

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| format!("preflight through {} failed: {}", record.label, e))?;
    if !response.status().is_success() {
        return Err(format!("preflight returned HTTP {}", response.status()));
    }
    let value: serde_json::Value = response
        .json()
        .await
        .map_err(|e| format!("preflight body unreadable: {}", e))?;
    value
        .get("ip")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| "preflight response carried no ip field".to_string())
}

/// Query the DevTools version endpoint for the browser websocket URL.
async fn fetch_ws_url(endpoint: &str) -> Option<String> {
    let client = reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(2))
        .build()
        .ok()?;
    let value: serde_json::Value = client.get(endpoint).send().await.ok()?.json().await.ok()?;
    value
        .get("webSocketDebuggerUrl")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// Stable per-account debug port in 9222..9734.
fn derive_debug_port(account: &str) -> u16 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    account.hash(&mut hasher);
    9222 + (hasher.finish() % 512) as u16
}

/// Find Chrome/Chromium on the system.
fn find_chrome() -> Option<PathBuf> {
    let candidates: Vec<PathBuf> = if cfg!(target_os = "windows") {
        let mut paths = vec![
            PathBuf::from(r"C:\Program Files\Google\Chrome\Application\chrome.exe"),
            PathBuf::from(r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe"),
        ];
        if let Ok(local) = std::env::var("LOCALAPPDATA") {
            paths.push(PathBuf::from(local).join(r"Google\Chrome\Application\chrome.exe"));
        }
        paths
    } else if cfg!(target_os = "macos") {
        vec![
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
            PathBuf::from("/Applications/Chromium.app/Contents/MacOS/Chromium"),
        ]
    } else {
        vec![
            PathBuf::from("/usr/bin/google-chrome"),
            PathBuf::from("/usr/bin/google-chrome-stable"),
            PathBuf::from("/usr/bin/chromium"),
            PathBuf::from("/usr/bin/chromium-browser"),
            PathBuf::from("/snap/bin/chromium"),
        ]
    };

    candidates.into_iter().find(|p| p.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyScheme;

    #[test]
    fn test_debug_port_is_stable_and_in_range() {
        let a = derive_debug_port("alpha");
        let b = derive_debug_port("alpha");
        let c = derive_debug_port("beta");
        assert_eq!(a, b);
        assert!((9222..9734).contains(&a));
        assert!((9222..9734).contains(&c));
    }

    #[test]
    fn test_session_proxy_from_record_has_no_lease() {
        let record = ProxyRecord::new("p", ProxyScheme::Http, "h", 8080);
        let proxy: SessionProxy = record.into();
        assert!(proxy.lease.is_none());
    }

    #[test]
    fn test_default_options() {
        let options = LaunchOptions::default();
        assert!(options.headless);
        assert!(options.attach_port.is_none());
        assert!(options.attach_poll < options.attach_timeout);
    }
}
