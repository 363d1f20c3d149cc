use miette::Diagnostic;
use thiserror::Error;

use crate::policy::errors::PolicyError;

#[derive(Debug, Error, Diagnostic)]
pub enum GateError {
    #[error("I/O error: {0}")]
    #[diagnostic(code(policy_gate::io))]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    #[diagnostic(code(policy_gate::config))]
    Config(#[from] config::ConfigError),

    #[error("Invalid target URL `{url}`: {reason}")]
    #[diagnostic(
        code(policy_gate::target_url),
        help("Pass an absolute http(s) URL, e.g. --target-url http://127.0.0.1:9000")
    )]
    TargetUrl { url: String, reason: String },

    #[error("Invalid listen address `{addr}`: {reason}")]
    #[diagnostic(
        code(policy_gate::listen_addr),
        help("Use host:port, e.g. 0.0.0.0:8000, localhost:8000 or :8000")
    )]
    ListenAddr { addr: String, reason: String },

    #[error("No policies file configured")]
    #[diagnostic(
        code(policy_gate::missing_policies_file),
        help("Set --policies-file or policy.policies_file in the config file")
    )]
    MissingPoliciesFile,

    #[error(transparent)]
    #[diagnostic(transparent)]
    Policy(#[from] PolicyError),

    #[error("Failed to build upstream client: {0}")]
    #[diagnostic(code(policy_gate::client))]
    Client(#[from] reqwest::Error),

    #[error("Failed to build metrics recorder: {0}")]
    #[diagnostic(code(policy_gate::metrics))]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error("Failed to bind {what} listener on {addr}")]
    #[diagnostic(code(policy_gate::bind))]
    Bind {
        what: &'static str,
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },
}
