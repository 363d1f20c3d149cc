use miette::{IntoDiagnostic, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::errors::GateError;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub server: Server,
    pub proxy: Proxy,
    pub policy: PolicySource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    /// Address for proxied traffic. `:8000` binds all interfaces.
    pub listen_addr: String,
    /// Address serving `GET /metrics`
    pub metrics_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Proxy {
    /// Upstream every allowed request is forwarded to, e.g. http://127.0.0.1:9000/api
    pub target_url: Option<String>,
    /// Whole-request timeout for upstream calls. Unset means no timeout.
    pub upstream_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PolicySource {
    /// JSON policies file (comments and trailing commas allowed)
    pub policies_file: Option<PathBuf>,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8000".to_string(),
            metrics_addr: "0.0.0.0:4000".to_string(),
        }
    }
}

/// Command-line flags that take precedence over the config file and environment.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct Overrides {
    /// Address to listen for proxy requests
    #[arg(long)]
    pub listen_addr: Option<String>,
    /// Address to expose the /metrics endpoint
    #[arg(long)]
    pub metrics_addr: Option<String>,
    /// Path to the policies file
    #[arg(long)]
    pub policies_file: Option<PathBuf>,
    /// Upstream URL to provide access to
    #[arg(long)]
    pub target_url: Option<String>,
}

impl Settings {
    pub fn load(path: &str) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("server.listen_addr", Server::default().listen_addr)
            .into_diagnostic()?
            .set_default("server.metrics_addr", Server::default().metrics_addr)
            .into_diagnostic()?;

        // Optional file
        if Path::new(path).exists() {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Environment overrides: POLICY_GATE__PROXY__TARGET_URL=http://..., etc.
        builder =
            builder.add_source(config::Environment::with_prefix("POLICY_GATE").separator("__"));

        let cfg = builder.build().into_diagnostic()?;
        let s: Settings = cfg.try_deserialize().into_diagnostic()?;
        Ok(s)
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(addr) = overrides.listen_addr {
            self.server.listen_addr = addr;
        }
        if let Some(addr) = overrides.metrics_addr {
            self.server.metrics_addr = addr;
        }
        if let Some(file) = overrides.policies_file {
            self.policy.policies_file = Some(file);
        }
        if let Some(url) = overrides.target_url {
            self.proxy.target_url = Some(url);
        }
    }

    pub async fn listen_socket_addr(&self) -> std::result::Result<SocketAddr, GateError> {
        resolve_listen_addr(&self.server.listen_addr).await
    }

    pub async fn metrics_socket_addr(&self) -> std::result::Result<SocketAddr, GateError> {
        resolve_listen_addr(&self.server.metrics_addr).await
    }

    /// Validated upstream URL: absolute, http or https, with a host.
    pub fn target(&self) -> std::result::Result<Url, GateError> {
        let raw = self
            .proxy
            .target_url
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| GateError::TargetUrl {
                url: String::new(),
                reason: "no target URL configured".to_string(),
            })?;

        let invalid = |reason: String| GateError::TargetUrl {
            url: raw.to_string(),
            reason,
        };
        let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme `{}`", url.scheme())));
        }
        if url.host_str().is_none() {
            return Err(invalid("missing host".to_string()));
        }
        Ok(url)
    }

    pub fn policies_path(&self) -> std::result::Result<&Path, GateError> {
        self.policy
            .policies_file
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or(GateError::MissingPoliciesFile)
    }

    pub fn upstream_timeout(&self) -> Option<Duration> {
        self.proxy
            .upstream_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// Accepts `host:port` as well as the port-only form `:port`. Host names are
/// resolved and the first address returned is used.
pub async fn resolve_listen_addr(addr: &str) -> std::result::Result<SocketAddr, GateError> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    let invalid = |reason: String| GateError::ListenAddr {
        addr: addr.to_string(),
        reason,
    };
    let resolved = tokio::net::lookup_host(full.as_str())
        .await
        .map_err(|e| invalid(e.to_string()))?
        .next()
        .ok_or_else(|| invalid("host name resolved to no addresses".to_string()));
    resolved
}
