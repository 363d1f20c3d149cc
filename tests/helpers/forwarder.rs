use std::sync::Mutex;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, Method, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use policy_gate::proxy::Forwarder;

#[derive(Debug, Clone)]
pub struct ForwardedRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

/// Stands in for the upstream: remembers what was forwarded and answers 200.
#[derive(Default)]
pub struct RecordingForwarder {
    requests: Mutex<Vec<ForwardedRequest>>,
}

impl RecordingForwarder {
    pub fn requests(&self) -> Vec<ForwardedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Forwarder for RecordingForwarder {
    async fn forward(&self, request: Request<Body>) -> Response {
        let (parts, _body) = request.into_parts();
        self.requests.lock().unwrap().push(ForwardedRequest {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
        });
        (StatusCode::OK, "forwarded").into_response()
    }
}
