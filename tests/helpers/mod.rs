pub mod forwarder;
pub mod upstream;

pub use forwarder::{ForwardedRequest, RecordingForwarder};
pub use upstream::EchoUpstream;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use policy_gate::gateway::{self, Gateway};
use policy_gate::metrics::GatewayMetrics;
use policy_gate::policy::loader::parse_policies;
use policy_gate::policy::PolicySet;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

/// Router built from a policies document, wired to a recording forwarder and
/// its own metrics registry.
pub struct TestGateway {
    pub router: Router,
    pub forwarder: Arc<RecordingForwarder>,
    pub metrics: Arc<GatewayMetrics>,
}

impl TestGateway {
    pub fn new(policies: &str) -> Self {
        let definitions = parse_policies(policies).expect("Failed to parse policies");
        let set = PolicySet::compile(definitions).expect("Failed to compile policies");

        let forwarder = Arc::new(RecordingForwarder::default());
        let metrics = Arc::new(GatewayMetrics::new().expect("Failed to build metrics"));
        let gateway = Arc::new(Gateway::new(
            forwarder.clone(),
            metrics.clone(),
            CancellationToken::new(),
        ));

        Self {
            router: gateway::router(&set, gateway),
            forwarder,
            metrics,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("Router is infallible")
    }

    pub async fn get(&self, uri: &str) -> StatusCode {
        self.send(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .status()
    }

    /// Value of an unlabelled metric line in the Prometheus rendering.
    pub fn metric(&self, name: &str) -> Option<String> {
        self.metrics
            .render()
            .lines()
            .find(|l| l.starts_with(name) && l[name.len()..].starts_with(' '))
            .and_then(|l| l.split_whitespace().nth(1))
            .map(str::to_string)
    }
}

pub async fn body_bytes(response: Response) -> axum::body::Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read body")
}
