//! Per-connection mediation
//!
//! One mediator per accepted client. It pumps bytes in both directions,
//! frames each direction's traffic, publishes every framed chunk on the
//! matching bus, and honors the rewrites and suppressions listeners left
//! on the event. Every byte either forwards, forwards rewritten, or is
//! suppressed by a listener; nothing is dropped silently.

use crate::bus::{Event, EventBus, CONNECT_EVENT, DISCONNECT_EVENT};
use crate::proto::framer::Framer;
use crate::session::Session;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{error, info, warn};

const READ_BUFFER_SIZE: usize = 8192;

/// Per-connection knobs handed down from the acceptor
#[derive(Debug, Clone)]
pub struct MediatorSettings {
    /// Upstream host name, for log lines
    pub upstream_host: String,
    /// Upstream read timeout
    pub read_timeout: Duration,
    /// Emit per-connection lifecycle log lines
    pub connection_log: bool,
}

/// Why the proxying loop ended
enum CloseReason {
    ClientClosed,
    UpstreamClosed,
    UpstreamTimeout,
    ClientError(std::io::Error),
    UpstreamError(std::io::Error),
}

/// The per-connection protocol mediator
pub struct Mediator {
    session: Session,
    client_bus: Arc<EventBus>,
    server_bus: Arc<EventBus>,
    open_connections: Arc<AtomicUsize>,
    settings: MediatorSettings,
    /// Carry-over for split client commands
    carry: Vec<u8>,
}

impl Mediator {
    pub fn new(
        session: Session,
        client_bus: Arc<EventBus>,
        server_bus: Arc<EventBus>,
        open_connections: Arc<AtomicUsize>,
        settings: MediatorSettings,
    ) -> Self {
        Self {
            session,
            client_bus,
            server_bus,
            open_connections,
            settings,
            carry: Vec::new(),
        }
    }

    /// The client side is up
    pub fn client_connected(&mut self) {
        let mut event = Event::pseudo(CONNECT_EVENT);
        self.client_bus
            .emit(CONNECT_EVENT, &mut self.session, &mut event);
    }

    /// The upstream side is up
    pub fn server_connected(&mut self) {
        let mut event = Event::pseudo(CONNECT_EVENT);
        self.server_bus
            .emit(CONNECT_EVENT, &mut self.session, &mut event);
    }

    /// Tear down a connection whose upstream never came up
    pub fn abort(mut self, reason: &str) {
        error!(
            "Upstream connection for session {} failed: {}",
            self.session.display_id(),
            reason
        );
        self.finish(None);
    }

    /// Pump both directions until either side closes or fails
    pub async fn run<C, U>(mut self, client: C, upstream: U)
    where
        C: AsyncRead + AsyncWrite + Unpin,
        U: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut client_rd, mut client_wr) = tokio::io::split(client);
        let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream);
        let mut client_buf = vec![0u8; READ_BUFFER_SIZE];
        let mut upstream_buf = vec![0u8; READ_BUFFER_SIZE];

        let reason = loop {
            tokio::select! {
                read = client_rd.read(&mut client_buf) => match read {
                    Ok(0) => break CloseReason::ClientClosed,
                    Ok(n) => {
                        let bytes = client_buf[..n].to_vec();
                        if let Err(e) = self
                            .on_client_data(bytes, &mut upstream_wr, &mut client_wr)
                            .await
                        {
                            break CloseReason::UpstreamError(e);
                        }
                    }
                    Err(e) => break CloseReason::ClientError(e),
                },
                read = tokio::time::timeout(
                    self.settings.read_timeout,
                    upstream_rd.read(&mut upstream_buf),
                ) => match read {
                    Err(_) => break CloseReason::UpstreamTimeout,
                    Ok(Ok(0)) => break CloseReason::UpstreamClosed,
                    Ok(Ok(n)) => {
                        let bytes = upstream_buf[..n].to_vec();
                        if let Err(e) = self
                            .on_upstream_data(bytes, &mut upstream_wr, &mut client_wr)
                            .await
                        {
                            break CloseReason::ClientError(e);
                        }
                    }
                    Ok(Err(e)) => break CloseReason::UpstreamError(e),
                },
            }
        };

        let _ = client_wr.shutdown().await;
        let _ = upstream_wr.shutdown().await;
        self.finish(Some(reason));
    }

    /// Frame and dispatch client bytes, then write whatever the listeners
    /// left standing
    async fn on_client_data<W, V>(
        &mut self,
        bytes: Vec<u8>,
        upstream_wr: &mut W,
        client_wr: &mut V,
    ) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
        V: AsyncWrite + Unpin,
    {
        let mut pending = std::mem::take(&mut self.carry);
        pending.extend_from_slice(&bytes);

        while !pending.is_empty() {
            let frame = Framer::frame_command(&pending);
            if !frame.descriptor.write {
                // Split tag; wait for the rest before emitting anything.
                self.carry = pending;
                return Ok(());
            }

            let rest = pending.split_off(frame.consumed);
            let mut event = Event::new(frame.descriptor, pending);
            self.client_bus.dispatch(&mut self.session, &mut event);

            if let Some(result) = event.result.take() {
                upstream_wr.write_all(&result).await?;
            } else if event.write {
                upstream_wr.write_all(&event.payload).await?;
            }
            flush_queues(&mut event, upstream_wr, client_wr).await?;

            pending = rest;
        }
        Ok(())
    }

    /// Frame and dispatch upstream bytes toward the client. No literal
    /// handling and no carry buffer on this direction; `write` always
    /// starts true.
    async fn on_upstream_data<W, V>(
        &mut self,
        bytes: Vec<u8>,
        upstream_wr: &mut W,
        client_wr: &mut V,
    ) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
        V: AsyncWrite + Unpin,
    {
        let mut event = Event::new(Framer::classify(&bytes), bytes);
        self.server_bus.dispatch(&mut self.session, &mut event);

        if let Some(result) = event.result.take() {
            client_wr.write_all(&result).await?;
        } else if event.write {
            client_wr.write_all(&event.payload).await?;
        }
        flush_queues(&mut event, upstream_wr, client_wr).await
    }

    /// Close-time bookkeeping. Runs exactly once per connection: the
    /// counter decrement and the disconnect events are guarded by the
    /// session's `connected` flag.
    fn finish(&mut self, reason: Option<CloseReason>) {
        if !self.session.connected {
            return;
        }
        self.session.connected = false;
        let open = self.open_connections.fetch_sub(1, Ordering::SeqCst) - 1;

        match reason {
            Some(CloseReason::ClientClosed) => {
                if self.settings.connection_log {
                    info!("Client connection closed; open connections: {}", open);
                }
            }
            Some(CloseReason::UpstreamClosed) => {
                if self.settings.connection_log {
                    info!(
                        "Disconnected from {}; open connections: {}",
                        self.settings.upstream_host, open
                    );
                }
            }
            Some(CloseReason::UpstreamTimeout) => {
                warn!(
                    "Upstream read timed out for session {}; open connections: {}",
                    self.session.display_id(),
                    open
                );
            }
            Some(CloseReason::ClientError(e)) => {
                error!(
                    "Client connection error on session {}: {}; open connections: {}",
                    self.session.display_id(),
                    e,
                    open
                );
            }
            Some(CloseReason::UpstreamError(e)) => {
                error!(
                    "Upstream connection error on session {}: {}; open connections: {}",
                    self.session.display_id(),
                    e,
                    open
                );
            }
            None => {}
        }

        let mut event = Event::pseudo(DISCONNECT_EVENT);
        self.client_bus
            .emit(DISCONNECT_EVENT, &mut self.session, &mut event);
        let mut event = Event::pseudo(DISCONNECT_EVENT);
        self.server_bus
            .emit(DISCONNECT_EVENT, &mut self.session, &mut event);
    }
}

/// Write out whatever listeners queued for either side during dispatch
async fn flush_queues<W, V>(
    event: &mut Event,
    upstream_wr: &mut W,
    client_wr: &mut V,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    V: AsyncWrite + Unpin,
{
    for chunk in event.to_upstream.drain(..) {
        upstream_wr.write_all(&chunk).await?;
    }
    for chunk in event.to_client.drain(..) {
        client_wr.write_all(&chunk).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::{CapabilityRewriter, FolderFilter, PluginContext, ProxyPlugin};
    use tokio::io::DuplexStream;
    use tokio::time::timeout;

    struct Harness {
        client: DuplexStream,
        upstream: DuplexStream,
        open: Arc<AtomicUsize>,
        handle: tokio::task::JoinHandle<()>,
    }

    const TICK: Duration = Duration::from_millis(50);

    fn settings() -> MediatorSettings {
        MediatorSettings {
            upstream_host: "upstream.test".to_string(),
            read_timeout: Duration::from_secs(60),
            connection_log: false,
        }
    }

    fn start(plugins: &[&dyn ProxyPlugin]) -> Harness {
        let (client, client_end) = tokio::io::duplex(4096);
        let (upstream, upstream_end) = tokio::io::duplex(4096);

        let client_bus = EventBus::new("client");
        let server_bus = EventBus::new("server");
        let mut session = Session::new(1, None);
        let ctx = PluginContext {
            client_bus: client_bus.clone(),
            server_bus: server_bus.clone(),
            debug_log: false,
        };
        for plugin in plugins {
            plugin.attach(&ctx, &mut session);
        }

        let open = Arc::new(AtomicUsize::new(1));
        let mut mediator = Mediator::new(
            session,
            client_bus,
            server_bus,
            open.clone(),
            settings(),
        );
        mediator.client_connected();
        mediator.server_connected();
        let handle = tokio::spawn(mediator.run(client_end, upstream_end));

        Harness {
            client,
            upstream,
            open,
            handle,
        }
    }

    async fn read_some(stream: &mut DuplexStream) -> Vec<u8> {
        let mut buf = vec![0u8; 4096];
        let n = timeout(TICK * 20, stream.read(&mut buf))
            .await
            .expect("read timed out")
            .expect("read failed");
        buf.truncate(n);
        buf
    }

    async fn assert_quiet(stream: &mut DuplexStream) {
        let mut buf = [0u8; 64];
        assert!(timeout(TICK, stream.read(&mut buf)).await.is_err());
    }

    #[tokio::test]
    async fn test_plain_forward_both_directions() {
        let mut h = start(&[]);

        h.client.write_all(b"a001 NOOP\r\n").await.unwrap();
        assert_eq!(read_some(&mut h.upstream).await, b"a001 NOOP\r\n");

        h.upstream
            .write_all(b"a001 OK NOOP completed\r\n")
            .await
            .unwrap();
        assert_eq!(read_some(&mut h.client).await, b"a001 OK NOOP completed\r\n");

        drop(h.client);
        h.handle.await.unwrap();
        assert_eq!(h.open.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_split_tag_reassembly() {
        let mut h = start(&[]);

        h.client.write_all(b"a0").await.unwrap();
        assert_quiet(&mut h.upstream).await;

        h.client.write_all(b"02 LIST \"\" \"*\"\r\n").await.unwrap();
        assert_eq!(read_some(&mut h.upstream).await, b"a002 LIST \"\" \"*\"\r\n");
    }

    #[tokio::test]
    async fn test_pipelined_commands_in_one_read() {
        let mut h = start(&[]);

        h.client
            .write_all(b"a1 NOOP\r\na2 CAPABILITY\r\n")
            .await
            .unwrap();
        let mut collected = Vec::new();
        while collected.len() < 24 {
            collected.extend(read_some(&mut h.upstream).await);
        }
        assert_eq!(collected, b"a1 NOOP\r\na2 CAPABILITY\r\n");
    }

    #[tokio::test]
    async fn test_deflate_stripped_on_the_wire() {
        let mut h = start(&[&CapabilityRewriter]);

        h.upstream
            .write_all(b"* CAPABILITY IMAP4rev1 COMPRESS=DEFLATE SORT METADATA\r\n")
            .await
            .unwrap();
        assert_eq!(
            read_some(&mut h.client).await,
            b"* CAPABILITY IMAP4rev1 SORT METADATA\r\n"
        );
    }

    #[tokio::test]
    async fn test_listing_filtered_end_to_end() {
        let mut h = start(&[&CapabilityRewriter, &FolderFilter]);

        h.upstream
            .write_all(b"* OK [CAPABILITY IMAP4rev1 ANNOTATEMORE] ready\r\n")
            .await
            .unwrap();
        assert_eq!(
            read_some(&mut h.client).await,
            b"* OK [CAPABILITY IMAP4rev1 ANNOTATEMORE] ready\r\n"
        );

        h.client.write_all(b"a003 LSUB \"\" \"*\"\r\n").await.unwrap();
        assert_eq!(read_some(&mut h.upstream).await, b"a003 LSUB \"\" \"*\"\r\n");

        // The listing is buffered; the proxy injects the folder-type
        // request instead of answering the client.
        h.upstream
            .write_all(
                b"* LSUB () \"/\" INBOX\r\n* LSUB () \"/\" Calendar\r\n* LSUB () \"/\" shared/Team\r\na003 OK Completed\r\n",
            )
            .await
            .unwrap();
        assert_eq!(
            read_some(&mut h.upstream).await,
            b"Aa003 GETANNOTATION \"*\" \"/vendor/kolab/folder-type\" (\"value.priv\" \"value.shared\")\r\n"
        );
        assert_quiet(&mut h.client).await;

        h.upstream
            .write_all(
                b"* ANNOTATION \"Calendar\" \"/vendor/kolab/folder-type\" (\"value.priv\" \"event\" \"value.shared\" NIL)\r\n\
                  * ANNOTATION \"INBOX\" \"/vendor/kolab/folder-type\" (\"value.priv\" \"mail\" \"value.shared\" NIL)\r\n",
            )
            .await
            .unwrap();
        assert_quiet(&mut h.client).await;

        h.upstream.write_all(b"Aa003 OK Completed\r\n").await.unwrap();
        assert_eq!(
            read_some(&mut h.client).await,
            b"* LSUB () \"/\" INBOX\r\na003 OK Completed (filtered by IMAProxy)\r\n"
        );
    }

    #[tokio::test]
    async fn test_upstream_close_tears_down_once() {
        let mut h = start(&[]);

        h.client.write_all(b"a1 NOOP\r\n").await.unwrap();
        read_some(&mut h.upstream).await;

        drop(h.upstream);
        h.handle.await.unwrap();
        assert_eq!(h.open.load(Ordering::SeqCst), 0);

        // The client end sees EOF once the proxy is done.
        let mut buf = [0u8; 16];
        let n = timeout(TICK * 20, h.client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_disconnect_event_published() {
        let (client, client_end) = tokio::io::duplex(4096);
        let (_upstream, upstream_end) = tokio::io::duplex(4096);

        let client_bus = EventBus::new("client");
        let server_bus = EventBus::new("server");
        let session = Session::new(1, None);

        let seen = Arc::new(AtomicUsize::new(0));
        for bus in [&client_bus, &server_bus] {
            let seen = seen.clone();
            bus.on(DISCONNECT_EVENT, move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
            });
        }

        let open = Arc::new(AtomicUsize::new(1));
        let mediator = Mediator::new(session, client_bus, server_bus, open, settings());
        let handle = tokio::spawn(mediator.run(client_end, upstream_end));

        drop(client);
        handle.await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_upstream_timeout_closes_both_sides() {
        let (mut client, client_end) = tokio::io::duplex(4096);
        let (mut upstream, upstream_end) = tokio::io::duplex(4096);

        let open = Arc::new(AtomicUsize::new(1));
        let mediator = Mediator::new(
            Session::new(1, None),
            EventBus::new("client"),
            EventBus::new("server"),
            open.clone(),
            MediatorSettings {
                upstream_host: "upstream.test".to_string(),
                read_timeout: Duration::from_millis(50),
                connection_log: false,
            },
        );
        let handle = tokio::spawn(mediator.run(client_end, upstream_end));

        handle.await.unwrap();
        assert_eq!(open.load(Ordering::SeqCst), 0);

        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        assert_eq!(upstream.read(&mut buf).await.unwrap(), 0);
    }
}
