use std::collections::BTreeMap;

use axum::http::request::Parts;
use axum::http::HeaderMap;
use percent_encoding::percent_decode_str;

use crate::policy::types::{Value, Variable};

/// Typed snapshot of the request attributes a policy can see.
///
/// Built fresh for every request and dropped with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    path: Value,
    params: Value,
    query: Value,
    header: Value,
}

impl RequestContext {
    pub fn new(
        path: impl Into<String>,
        params: BTreeMap<String, String>,
        query: BTreeMap<String, Vec<String>>,
        header: BTreeMap<String, Vec<String>>,
    ) -> Self {
        Self {
            path: Value::String(path.into()),
            params: Value::Map(
                params
                    .into_iter()
                    .map(|(k, v)| (k, Value::String(v)))
                    .collect(),
            ),
            query: multi_map(query),
            header: multi_map(header),
        }
    }

    /// Extract the context from request head and router-supplied path parameters.
    ///
    /// `url.path` is percent-decoded, the same form the router hands out for
    /// captured parameters.
    pub fn from_parts(parts: &Parts, params: BTreeMap<String, String>) -> Self {
        Self::new(
            decode_path(parts.uri.path()),
            params,
            parse_query(parts.uri.query().unwrap_or_default()),
            collect_headers(&parts.headers),
        )
    }

    pub fn get(&self, var: Variable) -> &Value {
        match var {
            Variable::UrlPath => &self.path,
            Variable::UrlParams => &self.params,
            Variable::UrlQuery => &self.query,
            Variable::ReqHeader => &self.header,
        }
    }
}

/// Invalid UTF-8 after decoding is replaced rather than rejected.
pub fn decode_path(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}

fn multi_map(entries: BTreeMap<String, Vec<String>>) -> Value {
    Value::Map(
        entries
            .into_iter()
            .map(|(k, values)| (k, Value::strings(values)))
            .collect(),
    )
}

/// Parse a raw query string, keeping every occurrence of a repeated key in order.
pub fn parse_query(raw: &str) -> BTreeMap<String, Vec<String>> {
    let mut query: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
        query
            .entry(key.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    query
}

/// Collect headers under their canonical names, one value per occurrence.
pub fn collect_headers(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for name in headers.keys() {
        let values = headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned());
        out.entry(canonical_header_key(name.as_str()))
            .or_default()
            .extend(values);
    }
    out
}

/// Canonical MIME form: first letter and every letter after `-` upper-cased,
/// the rest lower-cased (`x-api-key` becomes `X-Api-Key`).
pub fn canonical_header_key(name: &str) -> String {
    let mut upper = true;
    name.chars()
        .map(|c| {
            let out = if upper {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            };
            upper = c == '-';
            out
        })
        .collect()
}
