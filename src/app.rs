use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{sync::watch, task::JoinSet};

use crate::{
    config, front, logging, net,
    tunnel::{
        Endpoint, Protocol, ProtocolOptions, Role, TunnelError,
        transport::{self, TransportOptions},
    },
};

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config: Option<PathBuf>,
    pub role: Option<Role>,
    pub uri: Option<String>,
}

pub async fn run(cli: CliOverrides) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(cli.config.clone())?;

    let (mut cfg, loaded) = if resolved.path.is_file() {
        let cfg = config::load_config(&resolved.path)
            .with_context(|| format!("load config: {}", resolved.path.display()))?;
        (cfg, true)
    } else if matches!(
        resolved.source,
        config::ConfigPathSource::Flag | config::ConfigPathSource::Env
    ) {
        anyhow::bail!("config: {} does not exist", resolved.path.display());
    } else {
        (config::Config::default(), false)
    };

    if let Some(role) = cli.role {
        cfg.tunnel.role = Some(role);
    }
    if let Some(uri) = cli.uri.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
        cfg.tunnel.uri = uri.to_string();
    }

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if !loaded {
        tracing::info!(path = %resolved.path.display(), source = %resolved.source, "config: no file found; using defaults and flags");
    }

    let Some(role) = cfg.tunnel.role else {
        anyhow::bail!("config: tunnel.role is required (server|client; or pass --role)");
    };
    if cfg.tunnel.uri.is_empty() {
        anyhow::bail!("config: tunnel.uri is required (or pass --uri)");
    }

    if !cfg.metrics_addr.is_empty() {
        let addr: SocketAddr = net::normalize_bind_addr(&cfg.metrics_addr)
            .parse()
            .with_context(|| format!("invalid metrics_addr: {}", cfg.metrics_addr))?;
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("metrics: install Prometheus exporter")?;
    }

    let delegate = transport::transport_by_name(
        &cfg.tunnel.transport,
        &TransportOptions {
            tls: cfg.tunnel.tls.clone(),
        },
    )?;

    tracing::info!(
        config = %resolved.path.display(),
        role = %role,
        uri = %cfg.tunnel.uri,
        transport = delegate.scheme(),
        request_timeout = %humantime::format_duration(cfg.tunnel.request_timeout),
        idle_timeout = %humantime::format_duration(cfg.tunnel.idle_timeout),
        metrics_addr = %cfg.metrics_addr,
        "drbfire: starting"
    );

    let protocol = Arc::new(Protocol::new(ProtocolOptions {
        role: Some(role),
        delegate: Some(delegate),
        request_timeout: cfg.tunnel.request_timeout,
        handshake_timeout: cfg.tunnel.handshake_timeout,
        idle_timeout: cfg.tunnel.idle_timeout,
    }));

    let endpoint = Arc::new(protocol.open_server(&cfg.tunnel.uri).await?);
    tracing::info!(uri = %endpoint.uri(), role = %role, "drbfire: endpoint ready");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    {
        let endpoint = endpoint.clone();
        let protocol = protocol.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { serve_endpoint(endpoint, protocol, shutdown).await });
    }

    // The inside peer demonstrates the reverse direction once: it asks the
    // outside peer to call back into it through the tunnel.
    if role == Role::Client {
        let protocol = protocol.clone();
        let own = endpoint.uri();
        tasks.spawn(async move {
            match front::call(&protocol, &own, &format!("CALLBACK {own}")).await {
                Ok(reply) => tracing::info!(reply = %reply, "drbfire: callback through tunnel"),
                Err(err) => {
                    let err = format!("{err:#}");
                    tracing::warn!(err = %err, "drbfire: callback failed");
                }
            }
            Ok(())
        });
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or the accept loop ending.
    let mut result = Ok(());
    loop {
        tokio::select! {
            _ = shutdown_signal() => {
                tracing::info!("shutdown: signal");
                break;
            }
            res = tasks.join_next() => match res {
                None => break,
                Some(Ok(Ok(()))) => continue,
                Some(Ok(Err(err))) => {
                    result = Err(err);
                    break;
                }
                Some(Err(join_err)) => {
                    result = Err(join_err.into());
                    break;
                }
            },
        }
    }

    let _ = shutdown_tx.send(true);
    endpoint.close().await;

    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    result
}

async fn serve_endpoint(
    endpoint: Arc<Endpoint>,
    protocol: Arc<Protocol>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        let st = tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            res = endpoint.accept() => match res {
                Ok(st) => st,
                Err(TunnelError::Closed) => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                    anyhow::bail!("tunnel: endpoint {} closed", endpoint.uri());
                }
                Err(err) if err.is_retryable() => {
                    tracing::warn!(err = %err, "tunnel: accept failed; retrying");
                    continue;
                }
                Err(err) => return Err(err.into()),
            },
        };

        let protocol = protocol.clone();
        tokio::spawn(async move {
            let started = std::time::Instant::now();
            match front::serve(st, &protocol).await {
                Ok(()) => tracing::debug!(
                    elapsed = %humantime::format_duration(started.elapsed()),
                    "front: session ended"
                ),
                Err(err) => {
                    let err = format!("{err:#}");
                    tracing::debug!(err = %err, "front: session failed");
                }
            }
        });
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
