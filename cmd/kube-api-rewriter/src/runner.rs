//! Process runner.
//!
//! Builds every server from [`Config`], runs them side by side and stops
//! them together: on SIGINT/SIGTERM, or as soon as any one of them exits.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use api_rewriter::{Rewriter, RuleTable};
use axum::Router;
use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use rewrite_proxy::{CertManager, CertWatcher, Proxy, ProxyMode, ProxyTarget};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::{Config, WebhookProxyConfig};
use crate::error::RunnerError;
use crate::monitoring::{self, Readiness};

/// Time given to in-flight requests at shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// One listener and what it serves.
#[derive(Debug)]
struct Server {
    name: &'static str,
    addr: SocketAddr,
    router: Router,
    tls: Option<RustlsConfig>,
    proxy: bool,
}

/// Everything built from the configuration, ready to serve.
#[derive(Debug)]
pub struct Runner {
    servers: Vec<Server>,
    readiness: Readiness,
    // Held for the process lifetime; dropping it stops certificate reloads.
    _cert_watcher: Option<CertWatcher>,
}

impl Runner {
    /// Loads rules and TLS material and builds the servers. Any failure here
    /// is fatal.
    pub async fn new(config: &Config) -> Result<Self, RunnerError> {
        let rules = Arc::new(match &config.rules_path {
            Some(path) => RuleTable::from_file(path)?,
            None => RuleTable::bundled()?,
        });
        info!(
            rules = rules.len(),
            source = %config.rules_path.as_ref().map_or_else(|| "bundled".to_string(), |p| p.display().to_string()),
            "Loaded rewrite rules"
        );

        let mut servers = Vec::new();
        let mut registries = Vec::new();
        let mut cert_watcher = None;

        if let Some(client) = &config.client {
            let target = ProxyTarget::kubernetes(&client.api_url, client.token_file.clone(), client.ca_file.as_deref())?;
            let proxy = Proxy::new(ProxyMode::Client, Rewriter::new(Arc::clone(&rules)), target)?
                .with_timeout(config.request_timeout);
            registries.push(proxy.metrics().registry().clone());
            info!(listen = %client.listen, target = %client.api_url, "Client proxy configured");
            servers.push(Server {
                name: "client proxy",
                addr: client.listen,
                router: Arc::new(proxy).router(),
                tls: None,
                proxy: true,
            });
        } else {
            info!("Client proxy disabled: CLIENT_PROXY=no");
        }

        if let Some(webhook) = &config.webhook {
            let (server, watcher) = webhook_server(webhook, &rules, config.request_timeout, &mut registries).await?;
            servers.push(server);
            cert_watcher = watcher;
        } else {
            info!("Webhook proxy disabled: WEBHOOK_ADDRESS is empty or WEBHOOK_PROXY=no");
        }

        if servers.is_empty() {
            return Err(RunnerError::NoProxy);
        }

        let readiness = Readiness::default();
        servers.push(Server {
            name: "monitoring",
            addr: config.monitoring_address,
            router: monitoring::router(registries, readiness.clone()),
            tls: None,
            proxy: false,
        });
        if let Some(addr) = config.pprof_address {
            servers.push(Server {
                name: "profiling",
                addr,
                router: monitoring::profiling_router(),
                tls: None,
                proxy: false,
            });
        }

        Ok(Self {
            servers,
            readiness,
            _cert_watcher: cert_watcher,
        })
    }

    /// Serves until a signal arrives or a server stops, then shuts every
    /// server down within [`SHUTDOWN_GRACE`].
    pub async fn run(self) -> Result<(), RunnerError> {
        let mut tasks = JoinSet::new();
        let mut handles = Vec::new();
        let mut proxies = Vec::new();

        for server in self.servers {
            let handle = Handle::new();
            handles.push(handle.clone());
            if server.proxy {
                proxies.push((server.name, server.addr, handle.clone()));
            }
            let Server { name, addr, router, tls, .. } = server;
            tasks.spawn(async move {
                let service = router.into_make_service();
                let result = match tls {
                    Some(tls) => axum_server::bind_rustls(addr, tls).handle(handle).serve(service).await,
                    None => axum_server::bind(addr).handle(handle).serve(service).await,
                };
                (name, result)
            });
        }

        let stop = tokio::select! {
            () = shutdown_signal() => Stop::Signal,
            bound = wait_listening(&proxies) => match bound {
                Ok(()) => {
                    self.readiness.set_ready();
                    info!("All proxies listening");
                    tokio::select! {
                        () = shutdown_signal() => Stop::Signal,
                        Some(exit) = tasks.join_next() => Stop::Exit(exit),
                    }
                }
                Err(err) => Stop::Bind(err),
            },
        };

        let mut failures = Vec::new();
        match stop {
            Stop::Signal => info!("Shutdown signal received"),
            Stop::Bind(err) => {
                error!(error = %err, "Listener failed");
                failures.push(err.to_string());
            }
            Stop::Exit(exit) => failures.extend(describe_exit(exit)),
        }

        for handle in &handles {
            handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
        }
        let drained = tokio::time::timeout(SHUTDOWN_GRACE + Duration::from_secs(1), async {
            while let Some(exit) = tasks.join_next().await {
                failures.extend(describe_exit(exit));
            }
        })
        .await;
        if drained.is_err() {
            warn!("Servers did not stop within the grace period");
            tasks.abort_all();
        }

        if failures.is_empty() {
            info!("Stopped");
            Ok(())
        } else {
            Err(RunnerError::Servers(failures))
        }
    }
}

async fn webhook_server(
    webhook: &WebhookProxyConfig,
    rules: &Arc<RuleTable>,
    timeout: Duration,
    registries: &mut Vec<prometheus::Registry>,
) -> Result<(Server, Option<CertWatcher>), RunnerError> {
    let target = ProxyTarget::webhook(&webhook.target_url, webhook.insecure_skip_verify)?;
    let proxy = Proxy::new(ProxyMode::Webhook, Rewriter::new(Arc::clone(rules)), target)?.with_timeout(timeout);
    registries.push(proxy.metrics().registry().clone());

    let (tls, watcher) = match &webhook.tls {
        Some(files) => {
            let manager = Arc::new(CertManager::load(&files.cert_file, &files.key_file).await?);
            (Some(manager.rustls_config()), Some(manager.spawn()))
        }
        None => {
            warn!("Webhook proxy listens without TLS: WEBHOOK_CERT_FILE is unset");
            (None, None)
        }
    };
    info!(
        listen = %webhook.listen,
        target = %webhook.target_url,
        tls = tls.is_some(),
        "Webhook proxy configured"
    );

    let server = Server {
        name: "webhook proxy",
        addr: webhook.listen,
        router: Arc::new(proxy).router(),
        tls,
        proxy: true,
    };
    Ok((server, watcher))
}

/// Resolves once every proxy listener is bound. A listener that fails to
/// bind is reported as [`RunnerError::Bind`].
async fn wait_listening(proxies: &[(&'static str, SocketAddr, Handle<SocketAddr>)]) -> Result<(), RunnerError> {
    for (server, addr, handle) in proxies {
        match handle.listening().await {
            Some(local) => info!(server, addr = %local, "Listening"),
            None => {
                return Err(RunnerError::Bind {
                    server,
                    addr: *addr,
                });
            }
        }
    }
    Ok(())
}

type Exit = (&'static str, std::io::Result<()>);

/// Why serving stopped.
enum Stop {
    Signal,
    Bind(RunnerError),
    Exit(Result<Exit, tokio::task::JoinError>),
}

fn describe_exit(exit: Result<Exit, tokio::task::JoinError>) -> Option<String> {
    match exit {
        Ok((name, Ok(()))) => {
            info!(server = name, "Server stopped");
            None
        }
        Ok((name, Err(e))) => {
            error!(server = name, error = %e, "Server failed");
            Some(format!("{name}: {e}"))
        }
        Err(e) if e.is_cancelled() => None,
        Err(e) => {
            error!(error = %e, "Server task panicked");
            Some(e.to_string())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for SIGINT");
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
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
