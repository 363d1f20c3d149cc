//! Listener wiring: the proxy listener answers policy-guarded routes, a second
//! listener exposes `GET /metrics`. Both stop on Ctrl-C or SIGTERM.
use std::net::SocketAddr;
use std::sync::Arc;

use miette::IntoDiagnostic;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::errors::GateError;
use crate::gateway::{self, Gateway};
use crate::metrics::{self, GatewayMetrics};
use crate::policy::PolicySet;
use crate::proxy::UpstreamForwarder;
use crate::settings::Settings;

pub async fn serve(settings: &Settings, target: Url, policies: PolicySet) -> miette::Result<()> {
    let listen_addr = settings.listen_socket_addr().await?;
    let metrics_addr = settings.metrics_socket_addr().await?;

    let metrics = Arc::new(GatewayMetrics::new()?);
    let forwarder = UpstreamForwarder::new(target, settings.upstream_timeout())?;
    tracing::info!(target = %forwarder.target(), "Forwarding allowed requests");

    let shutdown = CancellationToken::new();
    let gateway = Arc::new(Gateway::new(
        Arc::new(forwarder),
        Arc::clone(&metrics),
        shutdown.clone(),
    ));
    let router = gateway::router(&policies, gateway);

    let metrics_listener = bind("metrics", metrics_addr).await?;
    tracing::info!(%metrics_addr, "Metrics endpoint listening");
    let metrics_server = tokio::spawn({
        let router = metrics::router(Arc::clone(&metrics));
        let stop = shutdown.clone();
        async move {
            axum::serve(metrics_listener, router)
                .with_graceful_shutdown(stop.cancelled_owned())
                .await
        }
    });
    let upkeep = tokio::spawn(Arc::clone(&metrics).run_upkeep());

    let listener = bind("proxy", listen_addr).await?;
    tracing::info!(%listen_addr, policies = policies.len(), "Proxy listening");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
    .await
    .into_diagnostic()?;

    // The proxy can also stop on its own; make sure the metrics side follows.
    shutdown.cancel();
    upkeep.abort();
    metrics_server.await.into_diagnostic()?.into_diagnostic()?;
    tracing::info!("Shut down cleanly");
    Ok(())
}

async fn bind(what: &'static str, addr: SocketAddr) -> Result<TcpListener, GateError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| GateError::Bind { what, addr, source })
}

/// Resolves on Ctrl-C or SIGTERM and cancels `token`, aborting any policy
/// evaluation still in progress.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining connections");
    token.cancel();
}
