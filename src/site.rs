//! Site adapter contract
//!
//! Selectors, URL patterns and payload field names for the target
//! search-statistics service. Versioned separately from the engine: the
//! defaults below track the current page layout, and a deployment can load
//! an updated adapter from JSON without touching the engine.

use serde::{Deserialize, Serialize};

/// Everything the engine needs to know about the target site.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteAdapter {
    /// Page each tab navigates to before submitting queries
    pub base_url: String,
    /// Substring matched against response URLs to pick out the stats API
    pub api_path: String,
    /// Query input field
    pub input_selector: String,
    /// Submit button (empty = submit via Enter key only)
    pub submit_selector: String,
    /// Element present only when a user is logged in
    pub logged_in_selector: String,
    /// Secondary profile indicator element
    pub profile_selector: String,
    /// URL fragments that identify a redirect to the login/passport flow
    pub login_url_markers: Vec<String>,
    /// Field in the outgoing request payload that carries the search term
    pub search_term_field: String,
    /// Top-level field holding the total frequency count
    pub total_field: String,
    /// Cookie domain that marks an authenticated profile
    pub cookie_domain: String,
}

impl Default for SiteAdapter {
    fn default() -> Self {
        Self {
            base_url: "https://wordstat.yandex.ru/".to_string(),
            api_path: "/stat/words".to_string(),
            input_selector: "input[name='text']".to_string(),
            submit_selector: "button[type='submit']".to_string(),
            logged_in_selector: ".b-user-menu".to_string(),
            profile_selector: ".b-user-menu__username".to_string(),
            login_url_markers: vec![
                "passport.".to_string(),
                "/auth".to_string(),
            ],
            search_term_field: "searchValue".to_string(),
            total_field: "totalCount".to_string(),
            cookie_domain: "yandex".to_string(),
        }
    }
}

impl SiteAdapter {
    /// Whether a response URL belongs to the stats API.
    pub fn matches_api(&self, url: &str) -> bool {
        url.contains(&self.api_path)
    }

    /// Whether a page URL is a redirect into the login flow.
    pub fn is_login_url(&self, url: &str) -> bool {
        self.login_url_markers.iter().any(|m| url.contains(m.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_url_matching() {
        let adapter = SiteAdapter::default();
        assert!(adapter.matches_api("https://wordstat.yandex.ru/stat/words?x=1"));
        assert!(!adapter.matches_api("https://wordstat.yandex.ru/static/app.js"));
    }

    #[test]
    fn test_login_url_detection() {
        let adapter = SiteAdapter::default();
        assert!(adapter.is_login_url("https://passport.yandex.ru/auth?retpath=x"));
        assert!(!adapter.is_login_url("https://wordstat.yandex.ru/"));
    }
}
