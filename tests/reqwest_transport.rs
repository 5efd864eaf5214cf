use std::sync::Arc;
use std::time::Duration;

use http::{HeaderMap, Method};
use mailapi_rs::core::headers::HEADER_SESSION_ID;
use mailapi_rs::transport::build_request;
use mailapi_rs::{
    ApiService, Credential, CredentialStore, InMemoryCredentialStore, RequestSpec, ReqwestTransport,
    Transport, TransportError,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn sends_query_parameters_and_reads_json() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/mail/v4/messages"))
        .and(query_param("Page", "2"))
        .and(header("x-custom", "yes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"Code": 1000, "Total": 3})))
        .expect(1)
        .mount(&server)
        .await;

    let transport = ReqwestTransport::new().expect("transport");
    let spec = RequestSpec::get("/mail/v4/messages").with_parameters(json!({"Page": 2}));
    let mut headers = HeaderMap::new();
    headers.insert("x-custom", "yes".parse().unwrap());
    let request = build_request(&format!("{}/api", server.uri()), &spec, headers, Duration::from_secs(5))
        .expect("request");

    let response = transport.send(request).await.expect("response");
    assert_eq!(response.status, 200);
    assert_eq!(response.json().unwrap()["Total"], 3);
}

#[tokio::test]
async fn slow_responses_map_to_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let transport = ReqwestTransport::new().expect("transport");
    let request = build_request(
        &server.uri(),
        &RequestSpec::get("/slow"),
        HeaderMap::new(),
        Duration::from_millis(50),
    )
    .expect("request");

    let error = transport.send(request).await.unwrap_err();
    assert!(matches!(error, TransportError::Timeout(_)), "{error:?}");
    assert!(error.is_connectivity());
}

#[tokio::test]
async fn refused_connections_map_to_connect() {
    let transport = ReqwestTransport::new().expect("transport");
    let request = build_request(
        "http://127.0.0.1:1",
        &RequestSpec::new(Method::GET, "/"),
        HeaderMap::new(),
        Duration::from_secs(5),
    )
    .expect("request");

    let error = transport.send(request).await.unwrap_err();
    assert!(matches!(error, TransportError::Connect(_)), "{error:?}");
}

#[tokio::test]
async fn expired_token_is_refreshed_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/core/v4/users"))
        .and(header("authorization", "Bearer stale"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"Code": 401, "Error": "Expired"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/core/v4/users"))
        .and(header("authorization", "Bearer fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"Code": 1000, "User": {"Name": "alice"}})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/v4/refresh"))
        .and(header(HEADER_SESSION_ID, "uid-1"))
        .and(body_partial_json(json!({"RefreshToken": "r1", "GrantType": "refresh_token"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Code": 1000,
            "AccessToken": "fresh",
            "RefreshToken": "r2",
            "Scopes": ["full", "self"]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(InMemoryCredentialStore::with_credential(Credential::new("uid-1", "stale", "r1")));
    let service = ApiService::builder()
        .with_base_url(format!("{}/api", server.uri()))
        .with_credential_store(store.clone())
        .with_session_id("uid-1")
        .build()
        .expect("service");

    let response = service
        .execute(RequestSpec::get("/core/v4/users"))
        .await
        .expect("response");

    assert_eq!(response.json()["User"]["Name"], "alice");
    let stored = store.credential("uid-1").expect("credential");
    assert_eq!(stored.access_token, "fresh");
    assert_eq!(stored.refresh_token, "r2");
    assert_eq!(stored.scopes, vec!["full".to_string(), "self".to_string()]);
}
