use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::models::mcp_server_oauth_token::OAuthTokenSet;

/// A browser window the extraction strategy can drive.
///
/// Implementations own the actual page; this side only navigates, watches the
/// URL and runs the extraction script once the page is authenticated.
#[async_trait]
pub trait BrowsingContext: Send + Sync {
    async fn navigate(&self, url: &Url) -> Result<(), String>;
    async fn current_url(&self) -> Option<Url>;
    async fn evaluate(&self, script: &str) -> Option<Value>;
}

/// Token extraction from a logged-in web session, for providers without a
/// usable OAuth app
#[derive(Debug, Clone)]
pub struct BrowserExtraction {
    pub login_url: String,
    /// Hosts (and their subdomains) the context may visit
    pub allowed_domains: Vec<String>,
    /// Extraction only runs once the page URL starts with this
    pub authenticated_url_prefix: String,
    /// Must evaluate to `{"access_token": .., "refresh_token": ..}` or null
    pub extraction_script: String,
    pub poll_interval: Duration,
    pub max_polls: u32,
}

impl BrowserExtraction {
    pub fn is_allowed(&self, url: &Url) -> bool {
        if url.scheme() != "https" {
            return false;
        }
        let Some(host) = url.host_str() else {
            return false;
        };
        self.allowed_domains
            .iter()
            .any(|domain| host == domain || host.ends_with(&format!(".{domain}")))
    }

    pub fn is_authenticated(&self, url: &Url) -> bool {
        self.is_allowed(url) && url.as_str().starts_with(&self.authenticated_url_prefix)
    }

    /// Drive `context` through login and pull tokens out of the session.
    /// Any failure or a departure from the allow-list yields `None`.
    pub async fn extract_tokens(&self, context: &dyn BrowsingContext) -> Option<OAuthTokenSet> {
        let login_url = Url::parse(&self.login_url).ok()?;
        if !self.is_allowed(&login_url) {
            warn!("Login URL {login_url} is outside the allowed domains");
            return None;
        }

        if let Err(e) = context.navigate(&login_url).await {
            warn!("Failed to open {login_url}: {e}");
            return None;
        }

        for _ in 0..self.max_polls {
            if let Some(current) = context.current_url().await {
                if !self.is_allowed(&current) {
                    warn!("Browsing context left the allowed domains ({current}), aborting");
                    return None;
                }
                if self.is_authenticated(&current) {
                    debug!("Authenticated page reached, extracting tokens");
                    let extracted = context.evaluate(&self.extraction_script).await?;
                    return parse_extracted_tokens(&extracted);
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        debug!("Gave up waiting for an authenticated page");
        None
    }
}

fn parse_extracted_tokens(value: &Value) -> Option<OAuthTokenSet> {
    let access_token = value
        .get("access_token")?
        .as_str()
        .filter(|t| !t.is_empty())?
        .to_string();
    let refresh_token = value
        .get("refresh_token")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string);

    Some(OAuthTokenSet {
        access_token,
        refresh_token,
        expires_at: None,
    })
}
