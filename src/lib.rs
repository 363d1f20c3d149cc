//! policy-gate - policy-guarded reverse proxy
//!
//! Every route is bound to a boolean expression over the request's path, path
//! parameters, query and headers. Requests are forwarded to a single upstream
//! only when their route's expression evaluates to `true`.
//! It exposes all modules for testing purposes.

pub mod errors;
pub mod gateway;
pub mod metrics;
pub mod policy;
pub mod proxy;
pub mod settings;
pub mod web;
