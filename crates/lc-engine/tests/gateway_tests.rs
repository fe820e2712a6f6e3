//! HTTP gateway client tests (wiremock)

use std::sync::Arc;
use std::time::Duration;

use wiremock::matchers::{body_partial_json, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use lc_common::{GatewayCredentials, Settings};
use lc_engine::{EmailGateway, GatewayError, HttpEmailGateway, HttpGatewayConfig, SendEmailRequest};
use lc_store::{SettingsCache, SettingsRepository, InMemoryStore};

async fn gateway_for(server: &MockServer) -> HttpEmailGateway {
    let store = Arc::new(InMemoryStore::new());
    let settings = Settings {
        gateway: GatewayCredentials {
            api_key: "key-123".to_string(),
            sender_name: "Cadence".to_string(),
            sender_email: "noreply@cadence.dev".to_string(),
        },
        ..Settings::default()
    };
    SettingsRepository::update(store.as_ref(), &settings)
        .await
        .unwrap();

    let cache = Arc::new(SettingsCache::with_default_ttl(store));
    HttpEmailGateway::new(
        HttpGatewayConfig {
            base_url: server.uri(),
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(2),
            credential_cache_ttl: Duration::from_secs(60),
        },
        cache,
    )
    .unwrap()
}

fn request() -> SendEmailRequest {
    SendEmailRequest {
        to_email: "jane@example.com".to_string(),
        to_name: Some("Jane".to_string()),
        subject: "Hello".to_string(),
        html_content: "<p>hi</p>".to_string(),
        idempotency_key: "lead:initial-email:0".to_string(),
    }
}

#[tokio::test]
async fn send_posts_smtp_email_with_credentials_and_idempotency() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/smtp/email"))
        .and(header("api-key", "key-123"))
        .and(header("X-Idempotency-Key", "lead:initial-email:0"))
        .and(header_exists("content-type"))
        .and(body_partial_json(serde_json::json!({
            "sender": {"email": "noreply@cadence.dev", "name": "Cadence"},
            "to": [{"email": "jane@example.com", "name": "Jane"}],
            "subject": "Hello",
            "htmlContent": "<p>hi</p>"
        })))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(serde_json::json!({"messageId": "m-42"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let gateway = gateway_for(&server).await;
    let result = gateway.send(&request()).await.unwrap();
    assert_eq!(result.message_id, "m-42");
}

#[tokio::test]
async fn rate_limit_maps_to_retryable_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/smtp/email"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .mount(&server)
        .await;

    let gateway = gateway_for(&server).await;
    let err = gateway.send(&request()).await.unwrap_err();
    assert!(matches!(err, GatewayError::RateLimited(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn server_error_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/smtp/email"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let gateway = gateway_for(&server).await;
    let err = gateway.send(&request()).await.unwrap_err();
    assert!(matches!(err, GatewayError::Transient(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn client_error_is_config_and_not_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/smtp/email"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad sender"))
        .mount(&server)
        .await;

    let gateway = gateway_for(&server).await;
    let err = gateway.send(&request()).await.unwrap_err();
    assert!(matches!(err, GatewayError::Config(_)));
    assert!(!err.is_retryable());
}
