//! Accepting proxy server
//!
//! Listens on the configured TCP or TLS port and hands every accepted
//! client to a fresh mediator with its own session, bus pair and attached
//! plugins.

use crate::bus::EventBus;
use crate::mediator::{Mediator, MediatorSettings};
use crate::plugins::{PluginContext, PluginRegistry};
use crate::session::Session;
use crate::tls::create_tls_acceptor;
use crate::upstream::{BoxedSocket, UpstreamAddr};
use imaproxy_common::{Config, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

/// The accepting side of the proxy, one per worker
pub struct ProxyServer {
    config: Arc<Config>,
    plugins: PluginRegistry,
    upstream: UpstreamAddr,
    tls_acceptor: Option<TlsAcceptor>,
    session_counter: AtomicU64,
    open_connections: Arc<AtomicUsize>,
    worker: Option<u32>,
}

impl ProxyServer {
    /// Build the server: parse the upstream URL, load listener TLS
    /// material when configured, and resolve the plugin list.
    pub fn new(config: Arc<Config>, worker: Option<u32>) -> Result<Self> {
        let upstream = UpstreamAddr::parse(&config.proxy.imap_server)?;
        let tls_acceptor = if config.tls.ssl {
            Some(create_tls_acceptor(&config.tls)?)
        } else {
            None
        };
        let plugins = PluginRegistry::from_config(&config.plugins);
        if plugins.is_empty() {
            warn!("No plugins loaded; traffic passes through unmodified");
        }

        Ok(Self {
            config,
            plugins,
            upstream,
            tls_acceptor,
            session_counter: AtomicU64::new(0),
            open_connections: Arc::new(AtomicUsize::new(0)),
            worker,
        })
    }

    /// Bind the listen socket. Workers all bind the same port, so the
    /// pre-forked configuration turns on port reuse.
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.proxy.bind_port));
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        #[cfg(unix)]
        if self.config.process.workers > 0 {
            socket.set_reuseport(true)?;
        }
        socket.bind(addr)?;
        let listener = socket.listen(1024)?;

        let scheme = if self.tls_acceptor.is_some() { "imaps" } else { "imap" };
        info!(
            "Listening on {} ({}), proxying to {}:{}",
            listener.local_addr()?,
            scheme,
            self.upstream.host,
            self.upstream.port
        );
        Ok(listener)
    }

    /// Accept connections until the shutdown signal flips
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Stopped accepting connections");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            server.handle_connection(stream, addr).await;
                        });
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
            }
        }
        Ok(())
    }

    /// Connections still in flight, for drain-on-shutdown
    pub fn open_connections(&self) -> usize {
        self.open_connections.load(Ordering::SeqCst)
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let id = self.session_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let open = self.open_connections.fetch_add(1, Ordering::SeqCst) + 1;
        let connection_log = self.config.proxy.connection_log;
        if connection_log {
            info!(
                "Connection established from {}; open connections: {}",
                addr, open
            );
        }

        stream.set_nodelay(true).ok();
        let client: BoxedSocket = match &self.tls_acceptor {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(tls) => {
                    if connection_log {
                        let (_, conn) = tls.get_ref();
                        if let (Some(suite), Some(version)) =
                            (conn.negotiated_cipher_suite(), conn.protocol_version())
                        {
                            info!("Using {:?} ; {:?}", suite.suite(), version);
                        }
                    }
                    Box::new(tls)
                }
                Err(e) => {
                    error!("TLS handshake with {} failed: {}", addr, e);
                    self.open_connections.fetch_sub(1, Ordering::SeqCst);
                    return;
                }
            },
            None => Box::new(stream),
        };

        let mut session = Session::new(id, self.worker);
        let client_bus = EventBus::new("client");
        let server_bus = EventBus::new("server");
        let ctx = PluginContext {
            client_bus: client_bus.clone(),
            server_bus: server_bus.clone(),
            debug_log: self.config.logging.debug_log,
        };
        self.plugins.attach_all(&ctx, &mut session);

        let settings = MediatorSettings {
            upstream_host: self.upstream.host.clone(),
            read_timeout: Duration::from_secs(self.config.proxy.upstream_timeout_secs),
            connection_log,
        };
        let mut mediator = Mediator::new(
            session,
            client_bus,
            server_bus,
            self.open_connections.clone(),
            settings,
        );
        mediator.client_connected();

        let verify_certs = !self.config.proxy.tls_nocheck_certs;
        match self
            .upstream
            .connect(verify_certs, self.config.proxy.keep_alive)
            .await
        {
            Ok(upstream) => {
                mediator.server_connected();
                mediator.run(client, upstream).await;
            }
            Err(e) => mediator.abort(&e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    /// Minimal IMAP-ish upstream: greets, then answers NOOP
    async fn fake_upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    stream
                        .write_all(b"* OK [CAPABILITY IMAP4rev1 SORT] ready\r\n")
                        .await
                        .ok();
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                        if buf[..n].windows(4).any(|w| w == b"NOOP") {
                            stream.write_all(b"a1 OK NOOP completed\r\n").await.ok();
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_proxy_round_trip_over_tcp() {
        let upstream_addr = fake_upstream().await;

        let mut config = Config::default();
        config.proxy.imap_server = format!("imap://127.0.0.1:{}", upstream_addr.port());
        config.proxy.bind_port = 0;
        config.proxy.connection_log = false;

        let server = Arc::new(ProxyServer::new(Arc::new(config), None).unwrap());
        let listener = server.bind().await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(server.clone().run(listener, shutdown_rx));

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();

        let mut buf = vec![0u8; 1024];
        let n = timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"* OK [CAPABILITY IMAP4rev1 SORT] ready\r\n");

        client.write_all(b"a1 NOOP\r\n").await.unwrap();
        let n = timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"a1 OK NOOP completed\r\n");

        drop(client);
        shutdown_tx.send(true).unwrap();
        timeout(Duration::from_secs(5), run).await.unwrap().unwrap().unwrap();

        // Give the connection task a moment to finish its bookkeeping.
        for _ in 0..50 {
            if server.open_connections() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.open_connections(), 0);
    }
}
