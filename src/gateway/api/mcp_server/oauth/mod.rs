use chrono::DateTime;
use sea_orm::DatabaseConnection;
use std::collections::HashMap;
use tracing::{debug, error, info};
use url::Url;

use crate::gateway::websocket::{
    OAuthErrorWebSocketPayload, OAuthSuccessWebSocketPayload, Service as WebSocketService,
    WebSocketMessage,
};
use crate::models::mcp_server::Model as MCPServerModel;
use crate::models::mcp_server_oauth_token::OAuthTokenSet;
use crate::sandbox::SandboxManager;

/// Tokens delivered to the callback URL for one catalog connector
#[derive(Debug, Clone, PartialEq)]
pub struct OAuthCallback {
    pub mcp_server_catalog_id: String,
    pub tokens: OAuthTokenSet,
}

/// Why a callback could not be accepted, with the connector when known
#[derive(Debug, Clone, PartialEq)]
pub struct OAuthCallbackError {
    pub mcp_server_catalog_id: Option<String>,
    pub message: String,
}

impl OAuthCallbackError {
    fn new(mcp_server_catalog_id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            mcp_server_catalog_id,
            message: message.into(),
        }
    }
}

/// Parse `...?mcp_catalog_connector_id=..&access_token=..&refresh_token=..&expiry_date=..`.
/// `expiry_date` is epoch milliseconds.
pub fn parse_oauth_callback(url: &str) -> Result<OAuthCallback, OAuthCallbackError> {
    let parsed_url = Url::parse(url)
        .map_err(|e| OAuthCallbackError::new(None, format!("Invalid OAuth callback URL: {e}")))?;

    let query_params: HashMap<String, String> = parsed_url.query_pairs().into_owned().collect();

    let mcp_server_catalog_id = query_params
        .get("mcp_catalog_connector_id")
        .filter(|id| !id.is_empty())
        .cloned()
        .ok_or_else(|| OAuthCallbackError::new(None, "Missing mcp_catalog_connector_id"))?;

    if let Some(error) = query_params.get("error") {
        return Err(OAuthCallbackError::new(
            Some(mcp_server_catalog_id.clone()),
            format!("OAuth error for {mcp_server_catalog_id}: {error}"),
        ));
    }

    let access_token = query_params
        .get("access_token")
        .filter(|token| !token.is_empty())
        .cloned()
        .ok_or_else(|| {
            OAuthCallbackError::new(Some(mcp_server_catalog_id.clone()), "Missing access_token")
        })?;

    let expires_at = match query_params.get("expiry_date") {
        Some(expiry) => {
            let millis: i64 = expiry.parse().map_err(|_| {
                OAuthCallbackError::new(
                    Some(mcp_server_catalog_id.clone()),
                    format!("Invalid expiry_date {expiry}"),
                )
            })?;
            DateTime::from_timestamp_millis(millis)
        }
        None => None,
    };

    Ok(OAuthCallback {
        tokens: OAuthTokenSet {
            access_token,
            refresh_token: query_params
                .get("refresh_token")
                .filter(|token| !token.is_empty())
                .cloned(),
            expires_at,
        },
        mcp_server_catalog_id,
    })
}

/// Store the tokens from an OAuth callback and (re)start the server they
/// belong to. Installs the catalog connector first when it is not installed.
pub async fn handle_oauth_callback(
    db: &DatabaseConnection,
    manager: &SandboxManager,
    websocket_service: &WebSocketService,
    url: &str,
) -> Result<String, OAuthCallbackError> {
    debug!("Received OAuth callback");

    let result = complete_oauth_callback(db, manager, url).await;
    match &result {
        Ok(mcp_server_catalog_id) => {
            info!("🔑 OAuth success for {mcp_server_catalog_id}");
            websocket_service.broadcast(WebSocketMessage::OAuthSuccess(
                OAuthSuccessWebSocketPayload {
                    mcp_server_catalog_id: mcp_server_catalog_id.clone(),
                },
            ));
        }
        Err(e) => {
            error!("🔑 {}", e.message);
            websocket_service.broadcast(WebSocketMessage::OAuthError(OAuthErrorWebSocketPayload {
                mcp_server_catalog_id: e.mcp_server_catalog_id.clone(),
                error: e.message.clone(),
            }));
        }
    }
    result
}

async fn complete_oauth_callback(
    db: &DatabaseConnection,
    manager: &SandboxManager,
    url: &str,
) -> Result<String, OAuthCallbackError> {
    let OAuthCallback {
        mcp_server_catalog_id,
        tokens,
    } = parse_oauth_callback(url)?;
    let fail = |message: String| OAuthCallbackError::new(Some(mcp_server_catalog_id.clone()), message);

    let installed = MCPServerModel::load_config(db, &mcp_server_catalog_id)
        .await
        .map_err(|e| fail(format!("Failed to load {mcp_server_catalog_id}: {e}")))?;

    if installed.is_none() {
        let entry = MCPServerModel::find_catalog_entry(&mcp_server_catalog_id)
            .await
            .map_err(&fail)?
            .ok_or_else(|| fail(format!("Unknown catalog connector {mcp_server_catalog_id}")))?;
        MCPServerModel::save_config(db, &entry.to_config())
            .await
            .map_err(|e| fail(format!("Failed to save {mcp_server_catalog_id}: {e}")))?;
    }

    manager
        .credentials()
        .store_tokens(&mcp_server_catalog_id, &tokens)
        .await
        .map_err(|e| fail(format!("Failed to store tokens: {e}")))?;

    manager
        .restart_server(&mcp_server_catalog_id)
        .await
        .map_err(|e| fail(format!("Failed to start {mcp_server_catalog_id}: {e}")))?;

    Ok(mcp_server_catalog_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::mcp_server_oauth_token::Model as OAuthTokenModel;
    use crate::sandbox::state::SandboxState;
    use crate::test_fixtures::{sandbox_harness, SandboxHarness};
    use chrono::{TimeZone, Utc};
    use rstest::rstest;

    #[test]
    fn test_parse_callback() {
        let callback = parse_oauth_callback(
            "archestra-ai://oauth-callback?mcp_catalog_connector_id=gmail&access_token=a1&refresh_token=r1&expiry_date=1893456000000",
        )
        .unwrap();

        assert_eq!(callback.mcp_server_catalog_id, "gmail");
        assert_eq!(callback.tokens.access_token, "a1");
        assert_eq!(callback.tokens.refresh_token.as_deref(), Some("r1"));
        assert_eq!(
            callback.tokens.expires_at,
            Some(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap())
        );
    }

    #[rstest]
    #[case("not a url", None)]
    #[case("archestra-ai://oauth-callback?access_token=a1", None)]
    #[case(
        "archestra-ai://oauth-callback?mcp_catalog_connector_id=gmail&error=access_denied",
        Some("gmail")
    )]
    #[case("archestra-ai://oauth-callback?mcp_catalog_connector_id=gmail", Some("gmail"))]
    #[case(
        "archestra-ai://oauth-callback?mcp_catalog_connector_id=gmail&access_token=a&expiry_date=soon",
        Some("gmail")
    )]
    fn test_parse_callback_errors(#[case] url: &str, #[case] connector: Option<&str>) {
        let err = parse_oauth_callback(url).unwrap_err();
        assert_eq!(err.mcp_server_catalog_id.as_deref(), connector);
    }

    #[rstest]
    #[tokio::test]
    async fn test_callback_installs_and_starts(#[future] sandbox_harness: SandboxHarness) {
        let harness = sandbox_harness.await;
        harness.runtime.set_tools("gmail", &["search_emails"]);
        let websocket = WebSocketService::new();
        let mut events = websocket.broadcast_tx.subscribe();

        let id = handle_oauth_callback(
            &harness.db,
            &harness.manager,
            &websocket,
            "archestra-ai://oauth-callback?mcp_catalog_connector_id=gmail&access_token=a1&refresh_token=r1",
        )
        .await
        .unwrap();

        assert_eq!(id, "gmail");
        let stored = OAuthTokenModel::load_tokens(&harness.db, "gmail")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.access_token, "a1");
        assert_eq!(
            harness.manager.instance("gmail").await.unwrap().state,
            SandboxState::Running
        );
        let spec = harness.runtime.last_spec("gmail").unwrap();
        assert_eq!(spec.env.get("GOOGLE_ACCESS_TOKEN").map(String::as_str), Some("a1"));
        assert!(matches!(
            events.recv().await.unwrap(),
            WebSocketMessage::OAuthSuccess(_)
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn test_callback_error_is_broadcast(#[future] sandbox_harness: SandboxHarness) {
        let harness = sandbox_harness.await;
        let websocket = WebSocketService::new();
        let mut events = websocket.broadcast_tx.subscribe();

        let result = handle_oauth_callback(
            &harness.db,
            &harness.manager,
            &websocket,
            "archestra-ai://oauth-callback?mcp_catalog_connector_id=gmail&error=access_denied",
        )
        .await;

        assert!(result.is_err());
        match events.recv().await.unwrap() {
            WebSocketMessage::OAuthError(payload) => {
                assert_eq!(payload.mcp_server_catalog_id.as_deref(), Some("gmail"));
            }
            other => panic!("Unexpected message {other:?}"),
        }
        assert!(harness.manager.instance("gmail").await.is_none());
    }
}
