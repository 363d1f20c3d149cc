//! Single-host reverse proxy used for allowed requests.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, HttpBody};
use axum::extract::ConnectInfo;
use axum::http::header::{HeaderName, CONNECTION, HOST};
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use url::Url;

use crate::errors::GateError;

/// Headers meaningful only for a single transport hop. Never forwarded in
/// either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Sends an allowed request onwards and produces the response for the client.
#[async_trait]
pub trait Forwarder: Send + Sync + 'static {
    async fn forward(&self, request: Request<Body>) -> Response;
}

#[derive(Debug, Clone)]
pub struct UpstreamForwarder {
    client: reqwest::Client,
    target: Url,
}

impl UpstreamForwarder {
    pub fn new(target: Url, timeout: Option<Duration>) -> Result<Self, GateError> {
        let mut builder = reqwest::Client::builder().redirect(reqwest::redirect::Policy::none());
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
            target,
        })
    }

    pub fn target(&self) -> &Url {
        &self.target
    }
}

#[async_trait]
impl Forwarder for UpstreamForwarder {
    async fn forward(&self, request: Request<Body>) -> Response {
        let (parts, body) = request.into_parts();
        let url = rewrite_url(&self.target, &parts.uri);

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(HOST);
        if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
            append_forwarded_for(&mut headers, *addr);
        }

        let mut upstream = self
            .client
            .request(parts.method, url.clone())
            .headers(headers);
        if HttpBody::size_hint(&body).exact() != Some(0) {
            upstream = upstream.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        match upstream.send().await {
            Ok(response) => relay(response),
            Err(e) => {
                tracing::error!(error = %e, %url, "Upstream request failed");
                StatusCode::BAD_GATEWAY.into_response()
            }
        }
    }
}

/// Stream the upstream response back without buffering.
fn relay(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    strip_hop_by_hop(&mut headers);

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Target scheme and host; target path joined with the request path by a
/// single slash; target and request queries joined with `&`.
pub fn rewrite_url(target: &Url, uri: &Uri) -> Url {
    let mut url = target.clone();
    url.set_path(&join_paths(target.path(), uri.path()));

    let query = match (
        target.query().filter(|q| !q.is_empty()),
        uri.query().filter(|q| !q.is_empty()),
    ) {
        (Some(t), Some(r)) => Some(format!("{t}&{r}")),
        (Some(q), None) | (None, Some(q)) => Some(q.to_string()),
        (None, None) => None,
    };
    url.set_query(query.as_deref());
    url
}

pub fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

/// Remove hop-by-hop headers, including any listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, client: SocketAddr) {
    let ip = client.ip().to_string();
    let prior: Vec<&str> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    let value = if prior.is_empty() {
        ip
    } else {
        format!("{}, {}", prior.join(", "), ip)
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}
