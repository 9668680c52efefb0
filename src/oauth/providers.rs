use std::time::Duration;

use super::browser::BrowserExtraction;
use super::{OAuthProviderDefinition, ProviderStrategy, StandardOAuth, TokenEnvNames};

pub const GOOGLE_AUTHORIZATION_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const GOOGLE_TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";

const GOOGLE_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/gmail.modify",
    "https://www.googleapis.com/auth/gmail.settings.basic",
];

const SLACK_EXTRACTION_SCRIPT: &str = r#"(() => {
  const config = JSON.parse(localStorage.getItem('localConfig_v2') || '{}');
  const team = Object.values(config.teams || {})[0];
  const cookie = document.cookie.split('; ').find((c) => c.startsWith('d='));
  if (!team || !team.token) return null;
  return { access_token: team.token, refresh_token: cookie ? decodeURIComponent(cookie.slice(2)) : null };
})()"#;

pub fn default_providers() -> Vec<OAuthProviderDefinition> {
    let google_client_id = std::env::var("ARCHESTRA_GOOGLE_CLIENT_ID").unwrap_or_default();
    vec![google(google_client_id, GOOGLE_TOKEN_ENDPOINT.to_string()), slack()]
}

pub fn google(client_id: String, token_endpoint: String) -> OAuthProviderDefinition {
    OAuthProviderDefinition {
        name: "google".to_string(),
        strategy: ProviderStrategy::Standard(StandardOAuth {
            authorization_endpoint: GOOGLE_AUTHORIZATION_ENDPOINT.to_string(),
            token_endpoint,
            client_id,
            scopes: GOOGLE_SCOPES.iter().map(|s| s.to_string()).collect(),
            requires_pkce: true,
            extra_authorization_params: vec![
                ("access_type".to_string(), "offline".to_string()),
                ("prompt".to_string(), "consent".to_string()),
            ],
            http: reqwest::Client::new(),
        }),
        env: TokenEnvNames {
            access_token: "GOOGLE_ACCESS_TOKEN".to_string(),
            refresh_token: Some("GOOGLE_REFRESH_TOKEN".to_string()),
            expiry: Some("GOOGLE_TOKEN_EXPIRY".to_string()),
        },
    }
}

pub fn slack() -> OAuthProviderDefinition {
    OAuthProviderDefinition {
        name: "slack".to_string(),
        strategy: ProviderStrategy::BrowserExtraction(BrowserExtraction {
            login_url: "https://app.slack.com/signin".to_string(),
            allowed_domains: vec!["slack.com".to_string()],
            authenticated_url_prefix: "https://app.slack.com/client/".to_string(),
            extraction_script: SLACK_EXTRACTION_SCRIPT.to_string(),
            poll_interval: Duration::from_millis(500),
            max_polls: 600,
        }),
        env: TokenEnvNames {
            access_token: "SLACK_MCP_XOXC_TOKEN".to_string(),
            refresh_token: Some("SLACK_MCP_XOXD_TOKEN".to_string()),
            expiry: None,
        },
    }
}
