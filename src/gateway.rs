use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::rejection::RawPathParamsRejection;
use axum::extract::{RawPathParams, State};
use axum::http::{Request, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::metrics::{track_requests, GatewayMetrics};
use crate::policy::context::RequestContext;
use crate::policy::{Decision, Policy, PolicySet};
use crate::proxy::Forwarder;

/// State shared by every route: where allowed requests go, where outcomes are
/// counted, and the token that aborts evaluations on shutdown.
pub struct Gateway {
    forwarder: Arc<dyn Forwarder>,
    metrics: Arc<GatewayMetrics>,
    shutdown: CancellationToken,
}

impl Gateway {
    pub fn new(
        forwarder: Arc<dyn Forwarder>,
        metrics: Arc<GatewayMetrics>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            forwarder,
            metrics,
            shutdown,
        }
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    /// Evaluate `policy` for one matched request and act on the decision.
    ///
    /// Denials answer 403 and evaluation errors answer 500, both with an empty
    /// body; only an explicit allow reaches the forwarder.
    ///
    /// Evaluation runs synchronously on the request task, so the request cannot
    /// be dropped while a policy is being evaluated and no per-request deadline
    /// applies. The evaluation token is a child of the shutdown token: only
    /// server shutdown cancels it. Evaluation cost is bounded by the compiler's
    /// nesting limit and the size of the request.
    pub async fn handle(
        &self,
        index: usize,
        policy: &Policy,
        params: BTreeMap<String, String>,
        request: Request<Body>,
    ) -> Response {
        let (parts, body) = request.into_parts();
        let context = RequestContext::from_parts(&parts, params);
        let cancel = self.shutdown.child_token();

        match policy.decide(&context, &cancel) {
            Decision::Allow => {
                tracing::debug!(policy = index, route = policy.path(), uri = %parts.uri, "Request allowed");
                self.forwarder
                    .forward(Request::from_parts(parts, body))
                    .await
            }
            Decision::Deny => {
                self.metrics.record_denied();
                tracing::info!(
                    policy = index,
                    route = policy.path(),
                    method = %parts.method,
                    uri = %parts.uri,
                    "Request denied by policy"
                );
                StatusCode::FORBIDDEN.into_response()
            }
            Decision::Error(error) => {
                self.metrics.record_denied();
                tracing::warn!(
                    policy = index,
                    route = policy.path(),
                    method = %parts.method,
                    uri = %parts.uri,
                    %error,
                    "Policy evaluation failed; rejecting request"
                );
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

#[derive(Clone)]
struct RouteState {
    index: usize,
    policy: Arc<Policy>,
    gateway: Arc<Gateway>,
}

async fn gate(
    State(route): State<RouteState>,
    params: Result<RawPathParams, RawPathParamsRejection>,
    request: Request<Body>,
) -> Response {
    let params = match params {
        Ok(params) => params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        Err(rejection) => {
            tracing::debug!(%rejection, "Path parameters unavailable, using none");
            BTreeMap::new()
        }
    };
    route
        .gateway
        .handle(route.index, &route.policy, params, request)
        .await
}

/// One route per policy, every HTTP method. Unmatched paths fall through to
/// the default 404. All responses pass through the request-metrics middleware.
pub fn router(policies: &PolicySet, gateway: Arc<Gateway>) -> Router {
    let mut router = Router::new();
    for (index, policy) in policies.iter().enumerate() {
        tracing::info!(policy = index, route = policy.path(), "Registered route");
        let state = RouteState {
            index,
            policy: Arc::clone(policy),
            gateway: Arc::clone(&gateway),
        };
        router = router.route(policy.path(), any(gate).with_state(state));
    }

    router
        .layer(middleware::from_fn_with_state(
            Arc::clone(gateway.metrics()),
            track_requests,
        ))
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingForwarder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Forwarder for CountingForwarder {
        async fn forward(&self, _request: Request<Body>) -> Response {
            self.calls.fetch_add(1, Ordering::SeqCst);
            StatusCode::OK.into_response()
        }
    }

    fn gateway(forwarder: Arc<CountingForwarder>, shutdown: CancellationToken) -> Gateway {
        Gateway::new(
            forwarder,
            Arc::new(GatewayMetrics::new().unwrap()),
            shutdown,
        )
    }

    fn request(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn compiled(path: &str, expr: &str) -> Policy {
        let mut policy = Policy::new(path, expr);
        policy.compile().unwrap();
        policy
    }

    #[tokio::test]
    async fn test_uncompiled_policy_rejects_with_500() {
        let forwarder = Arc::new(CountingForwarder::default());
        let gateway = gateway(forwarder.clone(), CancellationToken::new());
        let policy = Policy::new("/admin", "true");

        let response = gateway
            .handle(0, &policy, BTreeMap::new(), request("/admin"))
            .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(forwarder.calls.load(Ordering::SeqCst), 0);
        assert!(gateway
            .metrics()
            .render()
            .contains("http_request_denied_total 1"));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_evaluation() {
        let forwarder = Arc::new(CountingForwarder::default());
        let shutdown = CancellationToken::new();
        let gateway = gateway(forwarder.clone(), shutdown.clone());
        let policy = compiled("/admin", "true");

        shutdown.cancel();
        let response = gateway
            .handle(0, &policy, BTreeMap::new(), request("/admin"))
            .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(forwarder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_params_reach_context() {
        let forwarder = Arc::new(CountingForwarder::default());
        let gateway = gateway(forwarder.clone(), CancellationToken::new());
        let policy = compiled("/users/{id}", r#"url.params.id == "42""#);

        let params = BTreeMap::from([("id".to_string(), "42".to_string())]);
        let allowed = gateway.handle(0, &policy, params, request("/users/42")).await;
        assert_eq!(allowed.status(), StatusCode::OK);

        let params = BTreeMap::from([("id".to_string(), "7".to_string())]);
        let denied = gateway.handle(0, &policy, params, request("/users/7")).await;
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);

        assert_eq!(forwarder.calls.load(Ordering::SeqCst), 1);
    }
}
