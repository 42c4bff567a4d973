use serde_json::json;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use deviant_core::{OAuthClient, OAuthError};

#[test]
fn authorize_url_includes_required_params() {
    let client = OAuthClient::with_base_url("https://oauth.example", "client-id", "secret")
        .expect("client should build");
    let url = client
        .authorize_url(
            "http://127.0.0.1:8123/callback",
            Some("browse gallery"),
            Some("state-1"),
        )
        .expect("url should build");

    assert_eq!(url.path(), "/oauth2/authorize");
    let query = url.query().unwrap_or_default();
    assert!(query.contains("response_type=code"));
    assert!(query.contains("client_id=client-id"));
    assert!(query.contains("redirect_uri=http%3A%2F%2F127.0.0.1%3A8123%2Fcallback"));
    assert!(query.contains("scope=browse+gallery"));
    assert!(query.contains("state=state-1"));
}

#[tokio::test]
async fn exchange_code_posts_form_data() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .and(header("accept", "application/json"))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains("code=auth-code"))
        .and(body_string_contains("client_id=client-id"))
        .and(body_string_contains("client_secret=secret"))
        .and(body_string_contains(
            "redirect_uri=http%3A%2F%2F127.0.0.1%3A8123%2Fcallback",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "token",
            "token_type": "Bearer",
            "expires_in": 3600,
            "refresh_token": "refresh",
            "scope": "browse gallery"
        })))
        .mount(&server)
        .await;

    let client = OAuthClient::with_base_url(&server.uri(), "client-id", "secret").unwrap();
    let token = client
        .exchange_code("auth-code", "http://127.0.0.1:8123/callback")
        .await
        .unwrap();

    assert_eq!(token.access_token.as_deref(), Some("token"));
    assert_eq!(token.refresh_token.as_deref(), Some("refresh"));
    assert_eq!(token.expires_in, Some(3600));
}

#[tokio::test]
async fn refresh_token_trims_and_posts_grant() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=refresh-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "token",
            "expires_in": 3600
        })))
        .mount(&server)
        .await;

    let client = OAuthClient::with_base_url(&server.uri(), "client-id", "secret").unwrap();
    let token = client.refresh_token(" refresh-1\n").await.unwrap();

    assert_eq!(token.access_token.as_deref(), Some("token"));
    assert_eq!(token.refresh_token, None);
}

#[tokio::test]
async fn refresh_token_surfaces_error_status() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid_client"))
        .mount(&server)
        .await;

    let client = OAuthClient::with_base_url(&server.uri(), "client-id", "secret").unwrap();
    let err = client
        .refresh_token("refresh-1")
        .await
        .expect_err("expected api error");

    match err {
        OAuthError::Api { status, body } => {
            assert_eq!(status.as_u16(), 401);
            assert_eq!(body, "invalid_client");
        }
        other => panic!("unexpected error: {other}"),
    }
}
