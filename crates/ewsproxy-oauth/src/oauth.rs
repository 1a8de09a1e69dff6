//! Provider endpoint configuration, wire types, and the refresh-grant exchange.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AuthError, Result};

/// Default client id: the Outlook desktop application.
pub const DEFAULT_CLIENT_ID: &str = "d3590ed6-52b3-4102-aeff-aad2292ab01c";

/// Default device-code endpoint template (Microsoft identity platform v2.0).
pub const DEFAULT_DEVICE_CODE_URL: &str =
    "https://login.microsoftonline.com/{tenant}/oauth2/v2.0/devicecode";

/// Default token endpoint template (Microsoft identity platform v2.0).
pub const DEFAULT_TOKEN_URL: &str =
    "https://login.microsoftonline.com/{tenant}/oauth2/v2.0/token";

/// Default scope: EWS delegated access plus a refresh token.
pub const DEFAULT_SCOPE: &str =
    "https://outlook.office365.com/EWS.AccessAsUser.All offline_access";

/// Grant type for device-code polling (RFC 8628).
pub const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Per-request timeout so a hung call cannot stall a loop indefinitely.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// OAuth provider configuration.
///
/// Endpoint URLs are templates with a `{tenant}` placeholder substituted
/// once per call.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub device_code_url: String,
    pub token_url: String,
    pub scope: String,
}

impl ProviderConfig {
    /// Config for the Microsoft identity platform with the Outlook
    /// desktop client id and the EWS scope.
    pub fn microsoft(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            client_secret: None,
            device_code_url: DEFAULT_DEVICE_CODE_URL.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            scope: DEFAULT_SCOPE.to_string(),
        }
    }

    /// Device-code endpoint with the tenant substituted.
    pub fn device_code_endpoint(&self) -> String {
        self.device_code_url.replace("{tenant}", &self.tenant_id)
    }

    /// Token endpoint with the tenant substituted.
    pub fn token_endpoint(&self) -> String {
        self.token_url.replace("{tenant}", &self.tenant_id)
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self::microsoft("common")
    }
}

/// Build the shared HTTP client used for all provider calls.
pub fn http_client() -> Result<reqwest::Client> {
    let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
    Ok(client)
}

/// RFC 8628 device authorization response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCodeResponse {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default)]
    pub expires_in: u64,
    #[serde(default = "default_interval")]
    pub interval: u64,
    /// Human-readable sign-in instructions. Some providers omit this.
    #[serde(default)]
    pub message: String,
}

fn default_interval() -> u64 {
    5
}

/// Token endpoint response, shared by the poll and refresh grants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: String,
    /// Absent on refresh means "keep the existing refresh token".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl TokenResponse {
    /// The terminal error message, preferring the description when present.
    pub fn error_message(&self) -> Option<&str> {
        match (&self.error, &self.error_description) {
            (Some(_), Some(desc)) if !desc.is_empty() => Some(desc),
            (Some(err), _) if !err.is_empty() => Some(err),
            _ => None,
        }
    }
}

/// Exchange a refresh token for a new access token.
pub async fn refresh_access_token(
    client: &reqwest::Client,
    config: &ProviderConfig,
    refresh_token: &str,
) -> Result<TokenResponse> {
    let mut form: Vec<(&str, &str)> = vec![
        ("client_id", &config.client_id),
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
    ];
    if let Some(secret) = &config.client_secret {
        form.push(("client_secret", secret));
    }

    let response = client
        .post(config.token_endpoint())
        .form(&form)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(AuthError::Rejected {
            status: status.as_u16(),
            body,
        });
    }

    let token: TokenResponse = response
        .json()
        .await
        .map_err(|e| AuthError::Protocol(format!("refresh response: {e}")))?;

    if let Some(msg) = token.error_message() {
        return Err(AuthError::Denied(msg.to_string()));
    }
    if token.access_token.is_empty() {
        return Err(AuthError::Protocol(
            "refresh response missing access_token".to_string(),
        ));
    }

    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(server: &MockServer) -> ProviderConfig {
        ProviderConfig {
            tenant_id: "contoso".to_string(),
            client_id: "client-1".to_string(),
            client_secret: None,
            device_code_url: format!("{}/{{tenant}}/devicecode", server.uri()),
            token_url: format!("{}/{{tenant}}/token", server.uri()),
            scope: "test-scope".to_string(),
        }
    }

    #[test]
    fn tenant_is_substituted_into_endpoints() {
        let config = ProviderConfig::microsoft("contoso");
        assert_eq!(
            config.device_code_endpoint(),
            "https://login.microsoftonline.com/contoso/oauth2/v2.0/devicecode"
        );
        assert_eq!(
            config.token_endpoint(),
            "https://login.microsoftonline.com/contoso/oauth2/v2.0/token"
        );
    }

    #[test]
    fn default_config_uses_common_tenant() {
        let config = ProviderConfig::default();
        assert_eq!(config.tenant_id, "common");
        assert_eq!(config.client_id, DEFAULT_CLIENT_ID);
        assert!(config.client_secret.is_none());
    }

    #[test]
    fn device_code_response_defaults_interval() {
        let json = r#"{"device_code":"D","user_code":"U","verification_uri":"https://x"}"#;
        let parsed: DeviceCodeResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.interval, 5);
        assert!(parsed.message.is_empty());
    }

    #[test]
    fn token_response_error_message_prefers_description() {
        let json = r#"{"error":"invalid_grant","error_description":"token revoked"}"#;
        let parsed: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.error_message(), Some("token revoked"));

        let json = r#"{"error":"invalid_grant"}"#;
        let parsed: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.error_message(), Some("invalid_grant"));

        let json = r#"{"access_token":"A"}"#;
        let parsed: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.error_message(), None);
    }

    #[tokio::test]
    async fn refresh_sends_form_encoded_grant() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/contoso/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=R1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "A1",
                "refresh_token": "R2",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let config = test_config(&server);
        let token = refresh_access_token(&http_client().unwrap(), &config, "R1")
            .await
            .unwrap();
        assert_eq!(token.access_token, "A1");
        assert_eq!(token.refresh_token.as_deref(), Some("R2"));
    }

    #[tokio::test]
    async fn refresh_non_200_is_rejected_with_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(400).set_body_string(r#"{"error":"invalid_grant"}"#),
            )
            .mount(&server)
            .await;

        let config = test_config(&server);
        let err = refresh_access_token(&http_client().unwrap(), &config, "R1")
            .await
            .unwrap_err();
        match err {
            AuthError::Rejected { status, body } => {
                assert_eq!(status, 400);
                assert!(body.contains("invalid_grant"));
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn refresh_200_with_error_field_is_denied() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "error": "interaction_required",
                "error_description": "user must sign in again"
            })))
            .mount(&server)
            .await;

        let config = test_config(&server);
        let err = refresh_access_token(&http_client().unwrap(), &config, "R1")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Denied(msg) if msg.contains("sign in again")));
    }
}
