// End-to-end tests: real gateway listener, real upstream, real HTTP client
//
// These tests verify that allowed requests reach the upstream with the target
// path and query merged in, client identity appended, bodies streamed through,
// and redirects handed back to the client instead of being followed.

mod helpers;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use helpers::EchoUpstream;
use policy_gate::gateway::{self, Gateway};
use policy_gate::metrics::GatewayMetrics;
use policy_gate::policy::loader::parse_policies;
use policy_gate::policy::PolicySet;
use policy_gate::proxy::UpstreamForwarder;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Serve `policies` in front of `target` on an ephemeral port.
async fn start_gateway(target: &str, policies: &str) -> SocketAddr {
    let set = PolicySet::compile(parse_policies(policies).expect("Failed to parse policies"))
        .expect("Failed to compile policies");
    let forwarder = UpstreamForwarder::new(
        Url::parse(target).expect("Invalid target"),
        Some(Duration::from_secs(10)),
    )
    .expect("Failed to build forwarder");
    let gateway = Arc::new(Gateway::new(
        Arc::new(forwarder),
        Arc::new(GatewayMetrics::new().expect("Failed to build metrics")),
        CancellationToken::new(),
    ));
    let router = gateway::router(&set, gateway);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind gateway");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .ok();
    });
    addr
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

async fn json(response: reqwest::Response) -> Value {
    let bytes = response.bytes().await.expect("Failed to read body");
    serde_json::from_slice(&bytes).expect("Upstream answers JSON")
}

#[tokio::test]
async fn test_allowed_request_reaches_upstream() {
    let upstream = EchoUpstream::start().await;
    let gateway = start_gateway(
        &upstream.url("/base?token=t"),
        r#"[{ "path": "/users/{id}", "expr": "url.params.id == \"42\"" }]"#,
    )
    .await;

    let response = client()
        .get(format!("http://{gateway}/users/42?a=1&a=2"))
        .header("x-api-key", "secret")
        .header("x-forwarded-for", "10.1.1.1")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.headers()["x-upstream"], "echo");

    let echoed = json(response).await;
    assert_eq!(echoed["method"], "GET");
    assert_eq!(echoed["path"], "/base/users/42");
    assert_eq!(echoed["query"], "token=t&a=1&a=2");
    assert_eq!(echoed["headers"]["x-api-key"][0], "secret");
    assert_eq!(echoed["headers"]["x-forwarded-for"][0], "10.1.1.1, 127.0.0.1");
    assert_eq!(
        echoed["headers"]["host"][0],
        upstream.addr.to_string().as_str()
    );
    assert_eq!(upstream.hits(), 1);
}

#[tokio::test]
async fn test_request_body_is_streamed_upstream() {
    let upstream = EchoUpstream::start().await;
    let gateway = start_gateway(
        &upstream.url("/"),
        r#"[{ "path": "/upload", "expr": "\"Content-Type\" in req.header" }]"#,
    )
    .await;

    let response = client()
        .post(format!("http://{gateway}/upload"))
        .header("content-type", "text/plain")
        .body("hello upstream")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let echoed = json(response).await;
    assert_eq!(echoed["method"], "POST");
    assert_eq!(echoed["path"], "/upload");
    assert_eq!(echoed["body"], "hello upstream");
}

#[tokio::test]
async fn test_denied_request_never_reaches_upstream() {
    let upstream = EchoUpstream::start().await;
    let gateway = start_gateway(
        &upstream.url("/"),
        r#"[{ "path": "/admin", "expr": "\"X-Api-Key\" in req.header" }]"#,
    )
    .await;

    let response = client()
        .delete(format!("http://{gateway}/admin"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);
    assert!(response.bytes().await.unwrap().is_empty());
    assert_eq!(upstream.hits(), 0);
}

#[tokio::test]
async fn test_upstream_redirect_is_returned_not_followed() {
    let upstream = EchoUpstream::start().await;
    let gateway = start_gateway(
        &upstream.url("/"),
        r#"[{ "path": "/redirect", "expr": "true" }]"#,
    )
    .await;

    let response = client()
        .get(format!("http://{gateway}/redirect"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::FOUND);
    assert_eq!(response.headers()["location"], "/elsewhere");
    assert_eq!(upstream.hits(), 1);
}

#[tokio::test]
async fn test_unreachable_upstream_is_bad_gateway() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = closed.local_addr().unwrap();
    drop(closed);

    let gateway = start_gateway(
        &format!("http://{addr}"),
        r#"[{ "path": "/admin", "expr": "true" }]"#,
    )
    .await;

    let response = client()
        .get(format!("http://{gateway}/admin"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_GATEWAY);
}
