use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use sea_orm::DatabaseConnection;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::models::mcp_server::SandboxedServerConfig;
use crate::models::mcp_server_oauth_token::{Model as OAuthTokenModel, OAuthTokenSet};
use crate::sandbox::error::{Result, SandboxError};

pub mod browser;
pub mod pkce;
pub mod providers;

use browser::BrowserExtraction;
use pkce::PkceChallenge;

/// Capability every credential strategy offers the credential provider
#[async_trait]
pub trait CredentialStrategy: Send + Sync {
    fn can_refresh(&self, tokens: &OAuthTokenSet) -> bool;

    async fn refresh(&self, tokens: &OAuthTokenSet) -> Result<OAuthTokenSet>;
}

/// Authorization-code flow against a regular OAuth 2.0 provider
#[derive(Debug, Clone)]
pub struct StandardOAuth {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub client_id: String,
    pub scopes: Vec<String>,
    pub requires_pkce: bool,
    pub extra_authorization_params: Vec<(String, String)>,
    pub http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

impl StandardOAuth {
    /// Build the URL the user is sent to, with a fresh PKCE pair when the
    /// provider requires one. The verifier must be kept for the code exchange.
    pub fn authorization_url(
        &self,
        redirect_uri: &str,
        state: &str,
    ) -> Result<(Url, Option<PkceChallenge>)> {
        let mut url = Url::parse(&self.authorization_endpoint).map_err(|e| {
            SandboxError::OAuthResolutionFailed(format!("Invalid authorization endpoint: {e}"))
        })?;
        let pkce = self.requires_pkce.then(PkceChallenge::generate);

        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", &self.client_id)
                .append_pair("redirect_uri", redirect_uri)
                .append_pair("response_type", "code")
                .append_pair("scope", &self.scopes.join(" "))
                .append_pair("state", state);
            if let Some(pkce) = &pkce {
                query
                    .append_pair("code_challenge", &pkce.code_challenge)
                    .append_pair("code_challenge_method", &pkce.code_challenge_method);
            }
            for (key, value) in &self.extra_authorization_params {
                query.append_pair(key, value);
            }
        }

        Ok((url, pkce))
    }
}

#[async_trait]
impl CredentialStrategy for StandardOAuth {
    fn can_refresh(&self, tokens: &OAuthTokenSet) -> bool {
        tokens.is_refreshable()
    }

    async fn refresh(&self, tokens: &OAuthTokenSet) -> Result<OAuthTokenSet> {
        let refresh_token = tokens.refresh_token.clone().ok_or_else(|| {
            SandboxError::OAuthResolutionFailed("No refresh token available".to_string())
        })?;

        let response = self
            .http
            .post(&self.token_endpoint)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", self.client_id.as_str()),
            ])
            .send()
            .await
            .map_err(|e| SandboxError::OAuthResolutionFailed(format!("Token refresh failed: {e}")))?;

        if !response.status().is_success() {
            // Only the status is logged, bodies may echo credentials
            return Err(SandboxError::OAuthResolutionFailed(format!(
                "Token refresh failed with status {}",
                response.status()
            )));
        }

        let refreshed: TokenResponse = response.json().await.map_err(|e| {
            SandboxError::OAuthResolutionFailed(format!("Failed to parse token response: {e}"))
        })?;

        Ok(OAuthTokenSet {
            access_token: refreshed.access_token,
            refresh_token: refreshed.refresh_token.or(Some(refresh_token)),
            expires_at: refreshed
                .expires_in
                .map(|secs| Utc::now() + ChronoDuration::seconds(secs)),
        })
    }
}

#[async_trait]
impl CredentialStrategy for BrowserExtraction {
    fn can_refresh(&self, _tokens: &OAuthTokenSet) -> bool {
        false
    }

    async fn refresh(&self, _tokens: &OAuthTokenSet) -> Result<OAuthTokenSet> {
        Err(SandboxError::OAuthResolutionFailed(
            "Session tokens cannot be refreshed, sign in again".to_string(),
        ))
    }
}

#[derive(Debug, Clone)]
pub enum ProviderStrategy {
    Standard(StandardOAuth),
    BrowserExtraction(BrowserExtraction),
}

#[async_trait]
impl CredentialStrategy for ProviderStrategy {
    fn can_refresh(&self, tokens: &OAuthTokenSet) -> bool {
        match self {
            ProviderStrategy::Standard(strategy) => strategy.can_refresh(tokens),
            ProviderStrategy::BrowserExtraction(strategy) => strategy.can_refresh(tokens),
        }
    }

    async fn refresh(&self, tokens: &OAuthTokenSet) -> Result<OAuthTokenSet> {
        match self {
            ProviderStrategy::Standard(strategy) => strategy.refresh(tokens).await,
            ProviderStrategy::BrowserExtraction(strategy) => strategy.refresh(tokens).await,
        }
    }
}

/// Environment variables a provider's tokens are injected as
#[derive(Debug, Clone)]
pub struct TokenEnvNames {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expiry: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OAuthProviderDefinition {
    pub name: String,
    pub strategy: ProviderStrategy,
    pub env: TokenEnvNames,
}

impl OAuthProviderDefinition {
    pub fn token_env(&self, tokens: &OAuthTokenSet) -> HashMap<String, String> {
        let mut env = HashMap::from([(self.env.access_token.clone(), tokens.access_token.clone())]);

        if let (Some(key), Some(value)) = (&self.env.refresh_token, &tokens.refresh_token) {
            env.insert(key.clone(), value.clone());
        }
        if let (Some(key), Some(expires_at)) = (&self.env.expiry, tokens.expires_at) {
            env.insert(key.clone(), expires_at.timestamp_millis().to_string());
        }

        env
    }
}

/// Resolves, refreshes and persists the tokens sandboxes are started with
#[derive(Clone)]
pub struct OAuthCredentialProvider {
    db: Arc<DatabaseConnection>,
    providers: Arc<HashMap<String, OAuthProviderDefinition>>,
}

impl OAuthCredentialProvider {
    pub fn new(db: Arc<DatabaseConnection>, definitions: Vec<OAuthProviderDefinition>) -> Self {
        let providers = definitions
            .into_iter()
            .map(|definition| (definition.name.clone(), definition))
            .collect();

        Self {
            db,
            providers: Arc::new(providers),
        }
    }

    pub fn with_default_providers(db: Arc<DatabaseConnection>) -> Self {
        Self::new(db, providers::default_providers())
    }

    pub fn provider(&self, name: &str) -> Option<&OAuthProviderDefinition> {
        self.providers.get(name)
    }

    /// Valid tokens are returned as-is, expired but refreshable tokens are
    /// refreshed and persisted, anything else resolves to `None`.
    pub async fn resolve_tokens(
        &self,
        config: &SandboxedServerConfig,
    ) -> Result<Option<OAuthTokenSet>> {
        let Some(oauth) = &config.oauth else {
            return Ok(None);
        };
        let Some(tokens) = config.oauth_tokens.as_ref() else {
            debug!("🔑 [{}] No OAuth tokens stored", config.id);
            return Ok(None);
        };

        if !tokens.is_expired(Utc::now()) {
            return Ok(Some(tokens.clone()));
        }

        let provider = self.provider(&oauth.provider).ok_or_else(|| {
            SandboxError::OAuthResolutionFailed(format!("Unknown OAuth provider {}", oauth.provider))
        })?;

        if !provider.strategy.can_refresh(tokens) {
            info!("🔑 [{}] OAuth tokens expired and cannot be refreshed", config.id);
            return Ok(None);
        }

        info!("🔑 [{}] Refreshing expired OAuth tokens", config.id);
        let refreshed = provider.strategy.refresh(tokens).await.map_err(|e| {
            warn!("🔑 [{}] Token refresh failed: {e}", config.id);
            e
        })?;

        self.store_tokens(&config.id, &refreshed).await?;
        Ok(Some(refreshed))
    }

    /// Environment entries for the tokens of `config`'s provider
    pub fn token_env(
        &self,
        config: &SandboxedServerConfig,
        tokens: &OAuthTokenSet,
    ) -> HashMap<String, String> {
        config
            .oauth
            .as_ref()
            .and_then(|oauth| self.provider(&oauth.provider))
            .map(|provider| provider.token_env(tokens))
            .unwrap_or_default()
    }

    pub async fn store_tokens(&self, server_id: &str, tokens: &OAuthTokenSet) -> Result<()> {
        OAuthTokenModel::save_tokens(&self.db, server_id, tokens).await?;
        Ok(())
    }

    pub async fn clear_tokens(&self, server_id: &str) -> Result<()> {
        OAuthTokenModel::delete_tokens(&self.db, server_id).await?;
        Ok(())
    }

    pub fn authorization_url(
        &self,
        provider: &str,
        redirect_uri: &str,
        state: &str,
    ) -> Result<(Url, Option<PkceChallenge>)> {
        match self.provider(provider).map(|p| &p.strategy) {
            Some(ProviderStrategy::Standard(standard)) => {
                standard.authorization_url(redirect_uri, state)
            }
            Some(ProviderStrategy::BrowserExtraction(_)) => Err(SandboxError::OAuthResolutionFailed(
                format!("Provider {provider} signs in through the browser"),
            )),
            None => Err(SandboxError::OAuthResolutionFailed(format!(
                "Unknown OAuth provider {provider}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::mcp_server::{Model as MCPServerModel, OAuthRequirement};
    use crate::test_fixtures::{database, spawn_token_endpoint, standard_provider};
    use chrono::TimeZone;
    use rstest::rstest;
    use std::sync::atomic::Ordering;

    fn gmail_config(tokens: Option<OAuthTokenSet>) -> SandboxedServerConfig {
        let mut config = SandboxedServerConfig::simple("gmail", "npx", &[]);
        config.oauth = Some(OAuthRequirement {
            provider: "google".to_string(),
            required: true,
        });
        config.oauth_tokens = tokens;
        config
    }

    fn expired(refresh_token: Option<&str>) -> OAuthTokenSet {
        OAuthTokenSet {
            access_token: "old".to_string(),
            refresh_token: refresh_token.map(str::to_string),
            expires_at: Some(Utc::now() - ChronoDuration::minutes(5)),
        }
    }

    #[rstest]
    #[tokio::test]
    async fn test_valid_tokens_are_returned(#[future] database: Arc<DatabaseConnection>) {
        let provider = OAuthCredentialProvider::with_default_providers(database.await);
        let tokens = OAuthTokenSet {
            access_token: "fresh".to_string(),
            refresh_token: None,
            expires_at: Some(Utc::now() + ChronoDuration::hours(1)),
        };

        let resolved = provider
            .resolve_tokens(&gmail_config(Some(tokens.clone())))
            .await
            .unwrap();
        assert_eq!(resolved, Some(tokens));
    }

    #[rstest]
    #[tokio::test]
    async fn test_missing_or_unrefreshable_tokens_resolve_to_none(
        #[future] database: Arc<DatabaseConnection>,
    ) {
        let provider = OAuthCredentialProvider::with_default_providers(database.await);

        assert_eq!(provider.resolve_tokens(&gmail_config(None)).await.unwrap(), None);
        assert_eq!(
            provider
                .resolve_tokens(&gmail_config(Some(expired(None))))
                .await
                .unwrap(),
            None
        );
    }

    #[rstest]
    #[tokio::test]
    async fn test_expired_tokens_are_refreshed_and_persisted(
        #[future] database: Arc<DatabaseConnection>,
    ) {
        let db = database.await;
        let (token_url, hits) = spawn_token_endpoint(true).await;
        let provider = OAuthCredentialProvider::new(db.clone(), vec![standard_provider(&token_url)]);
        let config = gmail_config(Some(expired(Some("refresh-1"))));
        MCPServerModel::save_config(&db, &config).await.unwrap();

        let resolved = provider.resolve_tokens(&config).await.unwrap().unwrap();

        assert_eq!(resolved.access_token, "refreshed-access-token");
        assert_eq!(resolved.refresh_token.as_deref(), Some("refresh-1"));
        assert!(!resolved.is_expired(Utc::now()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let stored = OAuthTokenModel::load_tokens(&db, "gmail").await.unwrap().unwrap();
        assert_eq!(stored.access_token, resolved.access_token);
        assert_eq!(stored.refresh_token, resolved.refresh_token);
    }

    #[rstest]
    #[tokio::test]
    async fn test_failed_refresh_is_an_error(#[future] database: Arc<DatabaseConnection>) {
        let (token_url, hits) = spawn_token_endpoint(false).await;
        let provider = OAuthCredentialProvider::new(database.await, vec![standard_provider(&token_url)]);

        let err = provider
            .resolve_tokens(&gmail_config(Some(expired(Some("refresh-1")))))
            .await
            .unwrap_err();

        assert!(matches!(err, SandboxError::OAuthResolutionFailed(_)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn test_authorization_url_has_pkce(#[future] database: Arc<DatabaseConnection>) {
        let provider = OAuthCredentialProvider::with_default_providers(database.await);

        let (url, pkce) = provider
            .authorization_url("google", "http://localhost:54587/callback", "state-1")
            .unwrap();
        let pkce = pkce.unwrap();
        let params: HashMap<String, String> = url.query_pairs().into_owned().collect();

        assert_eq!(params.get("code_challenge"), Some(&pkce.code_challenge));
        assert_eq!(params.get("code_challenge_method").map(String::as_str), Some("S256"));
        assert_eq!(params.get("state").map(String::as_str), Some("state-1"));
        assert_eq!(params.get("response_type").map(String::as_str), Some("code"));

        assert!(provider.authorization_url("slack", "http://x", "s").is_err());
        assert!(provider.authorization_url("nope", "http://x", "s").is_err());
    }

    #[rstest]
    #[tokio::test]
    async fn test_token_env(#[future] database: Arc<DatabaseConnection>) {
        let provider = OAuthCredentialProvider::with_default_providers(database.await);
        let tokens = OAuthTokenSet {
            access_token: "a".to_string(),
            refresh_token: Some("r".to_string()),
            expires_at: Some(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()),
        };

        let env = provider.token_env(&gmail_config(None), &tokens);

        assert_eq!(env.get("GOOGLE_ACCESS_TOKEN").map(String::as_str), Some("a"));
        assert_eq!(env.get("GOOGLE_REFRESH_TOKEN").map(String::as_str), Some("r"));
        assert_eq!(
            env.get("GOOGLE_TOKEN_EXPIRY").map(String::as_str),
            Some("1893456000000")
        );
    }
}
