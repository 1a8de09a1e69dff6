//! OAuth 2.0 Device Authorization Grant (RFC 8628).
//!
//! Issues the device-code request and polls the token endpoint until the
//! operator completes interactive sign-in or the provider returns a
//! terminal error.

use std::time::Duration;

use crate::error::{AuthError, Result};
use crate::oauth::{DEVICE_CODE_GRANT, DeviceCodeResponse, ProviderConfig, TokenResponse};

/// Request a device code from the tenant-scoped device-code endpoint.
pub async fn request_device_code(
    client: &reqwest::Client,
    config: &ProviderConfig,
) -> Result<DeviceCodeResponse> {
    let mut form: Vec<(&str, &str)> = vec![
        ("client_id", &config.client_id),
        ("scope", &config.scope),
    ];
    if let Some(secret) = &config.client_secret {
        form.push(("client_secret", secret));
    }

    let response = client
        .post(config.device_code_endpoint())
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

    response
        .json()
        .await
        .map_err(|e| AuthError::Protocol(format!("device code response: {e}")))
}

/// The sign-in instructions to show the operator.
///
/// Providers usually send a ready-made `message`; when they don't, one is
/// synthesized from the verification URI and user code.
pub fn operator_prompt(device: &DeviceCodeResponse) -> String {
    if !device.message.is_empty() {
        device.message.clone()
    } else {
        format!(
            "To sign in, open {} and enter the code {}",
            device.verification_uri, device.user_code
        )
    }
}

/// Poll the token endpoint until the operator completes sign-in.
///
/// One request per server-specified interval. Transport failures and
/// `authorization_pending` are the expected steady state and never abort
/// the flow; any other error field is terminal. There is no overall
/// deadline here — the provider returns a terminal error once the device
/// code itself expires.
pub async fn poll_for_tokens(
    client: &reqwest::Client,
    config: &ProviderConfig,
    device: &DeviceCodeResponse,
) -> Result<TokenResponse> {
    let interval = Duration::from_secs(device.interval);
    let endpoint = config.token_endpoint();

    loop {
        tokio::time::sleep(interval).await;

        let mut form: Vec<(&str, &str)> = vec![
            ("client_id", &config.client_id),
            ("grant_type", DEVICE_CODE_GRANT),
            ("device_code", &device.device_code),
        ];
        if let Some(secret) = &config.client_secret {
            form.push(("client_secret", secret));
        }

        let response = match client.post(&endpoint).form(&form).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(err = %e, "transient network error while polling, will retry");
                continue;
            }
        };

        // Pending responses arrive with a 4xx status; the body decides.
        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => {
                tracing::debug!(err = %e, "failed to read poll response, will retry");
                continue;
            }
        };
        let token: TokenResponse = match serde_json::from_str(&body) {
            Ok(t) => t,
            Err(e) => {
                tracing::debug!(err = %e, "unparseable poll response, will retry");
                continue;
            }
        };

        if token.error.as_deref() == Some("authorization_pending") {
            tracing::trace!("authorization pending, operator has not signed in yet");
            continue;
        }
        if let Some(msg) = token.error_message() {
            return Err(AuthError::Denied(msg.to_string()));
        }
        if !token.access_token.is_empty() {
            return Ok(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::http_client;
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

    fn test_device(interval: u64) -> DeviceCodeResponse {
        DeviceCodeResponse {
            device_code: "D1".to_string(),
            user_code: "ABC-123".to_string(),
            verification_uri: "https://microsoft.com/devicelogin".to_string(),
            expires_in: 600,
            interval,
            message: String::new(),
        }
    }

    #[tokio::test]
    async fn issuance_posts_client_id_and_scope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/contoso/devicecode"))
            .and(body_string_contains("client_id=client-1"))
            .and(body_string_contains("scope=test-scope"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "device_code": "D1",
                "user_code": "ABC-123",
                "verification_uri": "https://microsoft.com/devicelogin",
                "expires_in": 600,
                "interval": 5,
                "message": "Go sign in"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let config = test_config(&server);
        let device = request_device_code(&http_client().unwrap(), &config).await.unwrap();
        assert_eq!(device.device_code, "D1");
        assert_eq!(device.interval, 5);
        assert_eq!(device.message, "Go sign in");
    }

    #[tokio::test]
    async fn issuance_non_200_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad client"))
            .mount(&server)
            .await;

        let config = test_config(&server);
        let err = request_device_code(&http_client().unwrap(), &config)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Rejected { status: 401, .. }));
    }

    #[tokio::test]
    async fn issuance_malformed_body_is_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let config = test_config(&server);
        let err = request_device_code(&http_client().unwrap(), &config)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Protocol(_)));
    }

    #[tokio::test]
    async fn poll_retries_through_pending_then_succeeds() {
        let server = MockServer::start().await;

        // First three polls: authorization_pending (as Microsoft sends it,
        // a 400 with an error body). Fourth: the token.
        Mock::given(method("POST"))
            .and(path("/contoso/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "authorization_pending"
            })))
            .up_to_n_times(3)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/contoso/token"))
            .and(body_string_contains("device_code=D1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "A1",
                "refresh_token": "R1",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;

        let config = test_config(&server);
        let token = poll_for_tokens(&http_client().unwrap(), &config, &test_device(0))
            .await
            .unwrap();
        assert_eq!(token.access_token, "A1");
        assert_eq!(token.refresh_token.as_deref(), Some("R1"));

        let polls = server.received_requests().await.unwrap();
        assert_eq!(polls.len(), 4);
    }

    #[tokio::test]
    async fn poll_waits_one_interval_per_tick() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/contoso/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "authorization_pending"
            })))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/contoso/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "A1",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;

        let config = test_config(&server);
        let started = std::time::Instant::now();
        let token = poll_for_tokens(&http_client().unwrap(), &config, &test_device(1))
            .await
            .unwrap();
        // Three ticks, each preceded by a one-second sleep.
        assert!(started.elapsed() >= Duration::from_millis(2900));
        assert_eq!(token.access_token, "A1");
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn poll_terminal_error_is_denied() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "expired_token",
                "error_description": "the device code has expired"
            })))
            .mount(&server)
            .await;

        let config = test_config(&server);
        let err = poll_for_tokens(&http_client().unwrap(), &config, &test_device(0))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Denied(msg) if msg.contains("expired")));
    }

    #[tokio::test]
    async fn poll_swallows_malformed_bodies() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("<html>oops</html>"))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "A1",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;

        let config = test_config(&server);
        let token = poll_for_tokens(&http_client().unwrap(), &config, &test_device(0))
            .await
            .unwrap();
        assert_eq!(token.access_token, "A1");
    }

    #[test]
    fn operator_prompt_prefers_provider_message() {
        let mut device = test_device(5);
        assert!(operator_prompt(&device).contains("ABC-123"));
        assert!(operator_prompt(&device).contains("devicelogin"));

        device.message = "Use the code XYZ".to_string();
        assert_eq!(operator_prompt(&device), "Use the code XYZ");
    }
}
