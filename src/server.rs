use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as HttpBuilder;
use hyper_util::service::TowerToHyperService;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::health::Readiness;

/// In-flight admission requests get this long to finish after shutdown starts.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn bind(addr: &str, name: &str) -> Result<TcpListener, String> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| format!("invalid {name} address '{addr}': {e}"))?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| format!("failed to bind {name} on {addr}: {e}"))?;
    info!(%addr, "{name} listening");
    Ok(listener)
}

/// Resolves with the name of the first termination signal received.
pub async fn termination_signal() -> io::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.map(|()| "SIGINT"),
            _ = sigterm.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.map(|()| "CTRL+C")
    }
}

/// Broadcasts shutdown once a termination signal arrives. A failure to install
/// the handlers shuts the servers down too.
pub async fn forward_shutdown(shutdown_tx: watch::Sender<bool>) {
    match termination_signal().await {
        Ok(name) => info!(signal = name, "starting graceful shutdown"),
        Err(e) => error!("failed to listen for termination signals: {e}"),
    }
    let _ = shutdown_tx.send(true);
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender counts as shutdown.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn serve_connection(stream: TcpStream, remote_addr: SocketAddr, acceptor: TlsAcceptor, router: Router) {
    let tls_stream = match acceptor.accept(stream).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(%remote_addr, "TLS handshake failed: {e}");
            return;
        }
    };

    let service = TowerToHyperService::new(router.into_service());
    if let Err(e) = HttpBuilder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(tls_stream), service)
        .await
    {
        debug!(%remote_addr, "connection closed with error: {e}");
    }
}

/// HTTPS accept loop for the admission endpoint. Readiness is held while the
/// listener accepts; on shutdown open connections are drained, then aborted.
pub async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    router: Router,
    readiness: Readiness,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    readiness.set(true);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote_addr)) => {
                    connections.spawn(serve_connection(stream, remote_addr, acceptor.clone(), router.clone()));
                }
                Err(e) => error!("failed to accept TCP connection: {e}"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = wait_for_shutdown(&mut shutdown) => break,
        }
    }

    readiness.set(false);
    drop(listener);
    info!(in_flight = connections.len(), "webhook listener closed, draining connections");

    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(remaining = connections.len(), "drain timed out, aborting connections");
        connections.abort_all();
    }
}

/// Plain HTTP listener for probes and metrics.
pub async fn serve_http(listener: TcpListener, router: Router, mut shutdown: watch::Receiver<bool>) {
    let result = axum::serve(listener, router)
        .with_graceful_shutdown(async move { wait_for_shutdown(&mut shutdown).await })
        .await;
    if let Err(e) = result {
        error!("HTTP server error: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health;
    use prometheus_client::registry::Registry;
    use rustls::server::{ClientHello, ResolvesServerCert};
    use rustls::sign::CertifiedKey;
    use rustls::ServerConfig;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[derive(Debug)]
    struct NoCertificate;

    impl ResolvesServerCert for NoCertificate {
        fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
            None
        }
    }

    fn acceptor() -> TlsAcceptor {
        let config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(NoCertificate));
        TlsAcceptor::from(Arc::new(config))
    }

    #[tokio::test]
    async fn test_bind_rejects_bad_address() {
        let err = bind("not-an-address", "webhook").await.unwrap_err();
        assert!(err.contains("invalid webhook address"), "{err}");
    }

    #[tokio::test]
    async fn test_http_server_serves_probes_until_shutdown() {
        let listener = bind("127.0.0.1:0", "metrics").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let readiness = Readiness::default();
        readiness.set(true);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(serve_http(
            listener,
            health::router(Registry::default(), readiness),
            shutdown_rx,
        ));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /readyz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.ends_with("ok"), "{response}");

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_tls_server_tracks_readiness_and_stops() {
        let listener = bind("127.0.0.1:0", "webhook").await.unwrap();
        let readiness = Readiness::default();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(serve_tls(
            listener,
            acceptor(),
            Router::new(),
            readiness.clone(),
            shutdown_rx,
        ));

        for _ in 0..100 {
            if readiness.is_ready() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(readiness.is_ready());

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
        assert!(!readiness.is_ready());
    }

    #[tokio::test]
    async fn test_dropped_sender_stops_server() {
        let listener = bind("127.0.0.1:0", "metrics").await.unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(serve_http(listener, Router::new(), shutdown_rx));
        drop(shutdown_tx);
        tokio::time::timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
    }
}
