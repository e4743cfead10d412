//! The server-side web forwarder.
//!
//! Terminates the HTTP(S) hop at the network edge: accumulates the
//! request head, insists it looks like a WebSocket handshake, routes
//! by URL path to the SSH or trojan backend, forwards the head
//! verbatim, and relays bytes from then on. The `101` the client
//! eventually sees is produced by the server-mode tunnel proxy
//! behind the SSH backend address.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rustls::pki_types::ServerName;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::timeout,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, info, warn};

use crate::{
    config::{ForwarderConfig, ProxyKind},
    pipe::{Direction, IoStream, Relay},
    resolver::resolve_addr,
    tls,
    util::{contains_ignore_ascii_case, find},
};

const NOT_WEBSOCKET_RESPONSE: &[u8] =
    b"HTTP/1.1 500 Internal Server Error\r\nConnection: close\r\n\r\nNo valid websocket request";

const TLS_ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared forwarder state; cloned into each per-connection task.
#[derive(Clone)]
pub struct WebForwarder {
    shared: Arc<Shared>,
}

struct Shared {
    cfg: ForwarderConfig,
    connector: TlsConnector,
    next_conn_id: AtomicU64,
}

impl WebForwarder {
    pub fn new(cfg: ForwarderConfig) -> Self {
        let connector = TlsConnector::from(Arc::new(tls::build_insecure_client_config()));
        WebForwarder {
            shared: Arc::new(Shared {
                cfg,
                connector,
                next_conn_id: AtomicU64::new(0),
            }),
        }
    }

    /// Bind the plain and TLS listeners and accept until Ctrl-C.
    /// TLS material comes from the operator pair, an exe-adjacent
    /// pair, or a generated self-signed chain, in that order.
    pub async fn run(&self) -> Result<()> {
        let cfg = &self.shared.cfg;

        let http_addr = resolve_addr(&cfg.http_address).await?;
        let https_addr = resolve_addr(&cfg.https_address).await?;

        let (chain, key) = tls::obtain_server_tls(&cfg.cert_file, &cfg.key_file)?;
        let acceptor = TlsAcceptor::from(Arc::new(tls::build_server_config(chain, key)?));

        let http_listener = TcpListener::bind(http_addr)
            .await
            .with_context(|| format!("cannot bind {http_addr}"))?;
        info!("TCP listen on {}", cfg.http_address);

        let https_listener = TcpListener::bind(https_addr)
            .await
            .with_context(|| format!("cannot bind {https_addr}"))?;
        info!("Secure TCP listen on {}", cfg.https_address);

        tokio::select! {
            res = async {
                tokio::try_join!(
                    self.serve(http_listener),
                    self.serve_tls(https_listener, acceptor),
                )
                .map(|_| ())
            } => res,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received (Ctrl-C). Closing forwarder.");
                Ok(())
            }
        }
    }

    /// Accept loop for the plain listener. Public so tests can drive
    /// an ephemeral listener directly.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.accept_loop(listener, None).await
    }

    /// Accept loop for the TLS listener.
    pub async fn serve_tls(&self, listener: TcpListener, acceptor: TlsAcceptor) -> Result<()> {
        self.accept_loop(listener, Some(acceptor)).await
    }

    async fn accept_loop(&self, listener: TcpListener, acceptor: Option<TlsAcceptor>) -> Result<()> {
        loop {
            let (sock, peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Failed to accept connection {e}");
                    continue;
                }
            };
            let conn_id = self.shared.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
            let forwarder = self.clone();
            let acceptor = acceptor.clone();

            tokio::spawn(async move {
                let secure = acceptor.is_some();
                let stream: IoStream = match acceptor {
                    Some(acceptor) => {
                        match timeout(TLS_ACCEPT_TIMEOUT, acceptor.accept(sock)).await {
                            Ok(Ok(accepted)) => Box::new(accepted),
                            Ok(Err(e)) => {
                                warn!("CONN #{conn_id} TLS handshake failed {e}");
                                return;
                            }
                            Err(_) => {
                                warn!("CONN #{conn_id} TLS handshake timed out");
                                return;
                            }
                        }
                    }
                    None => Box::new(sock),
                };

                if let Err(e) = forwarder
                    .handle_connection(conn_id, stream, secure)
                    .await
                {
                    error!("CONN #{conn_id} from {peer_addr} ended with error {e:#}");
                }
            });
        }
    }

    async fn handle_connection(
        &self,
        conn_id: u64,
        mut client: IoStream,
        secure: bool,
    ) -> Result<()> {
        let cfg = &self.shared.cfg;

        info!("CONN #{conn_id} opened");

        let head = match read_request_head(&mut client, cfg.buffer_size).await {
            Ok(head) => head,
            Err(e) => {
                debug!("CONN #{conn_id} closed before a request arrived: {e}");
                return Ok(());
            }
        };

        if !contains_ignore_ascii_case(&head, b"upgrade: websocket") {
            debug!("CONN #{conn_id} no valid websocket request");
            let _ = client.write_all(NOT_WEBSOCKET_RESPONSE).await;
            return Ok(());
        }

        let (kind, head) = self.classify(head);
        let backend_address = match kind {
            ProxyKind::Ssh => &cfg.backend_address,
            ProxyKind::Trojan => &cfg.trojan_address,
        };

        info!("CONN #{conn_id} websocket session routed to {backend_address} ({kind:?})");

        let mut backend = self
            .dial_backend(backend_address, secure, kind)
            .await
            .with_context(|| format!("cannot connect to backend '{backend_address}'"))?;

        let relay = Relay::new(cfg.buffer_size);

        // The backend consumes the head itself: the server-mode
        // tunnel answers it with a 101, a trojan endpoint reads it
        // as websocket framing front-matter.
        backend.write_all(&head).await?;
        relay.count(Direction::Outbound, head.len() as u64);

        let (sent, received) = relay.pipe(client, backend).await;
        info!("CONN #{conn_id} closed ({sent} bytes sent, {received} bytes received)");
        Ok(())
    }

    /// Route by request target: a target containing the configured
    /// trojan path picks the trojan backend and gets its target
    /// rewritten to that path; anything else is treated as SSH and
    /// forwarded untouched. An empty trojan path disables trojan
    /// routing entirely.
    fn classify(&self, head: Vec<u8>) -> (ProxyKind, Vec<u8>) {
        let trojan_path = &self.shared.cfg.trojan_path;
        if trojan_path.is_empty() {
            return (ProxyKind::Ssh, head);
        }

        let eol = head
            .iter()
            .position(|&b| b == b'\r' || b == b'\n')
            .unwrap_or(head.len());
        let Ok(request_line) = std::str::from_utf8(&head[..eol]) else {
            return (ProxyKind::Ssh, head);
        };

        let mut fields: Vec<&str> = request_line.split_whitespace().collect();
        let is_trojan = fields
            .get(1)
            .is_some_and(|target| target.contains(trojan_path.as_str()));
        if !is_trojan {
            return (ProxyKind::Ssh, head);
        }

        fields[1] = trojan_path;
        let mut rewritten = fields.join(" ").into_bytes();
        rewritten.extend_from_slice(&head[eol..]);
        (ProxyKind::Trojan, rewritten)
    }

    /// SSH over a plain inbound hop stays plaintext; everything else
    /// dials the backend over TLS with verification disabled and the
    /// configured SNI.
    async fn dial_backend(
        &self,
        address: &str,
        secure: bool,
        kind: ProxyKind,
    ) -> Result<IoStream> {
        let tcp = TcpStream::connect(address).await?;
        if !secure && kind == ProxyKind::Ssh {
            return Ok(Box::new(tcp));
        }

        let sni = &self.shared.cfg.sni_host;
        let server_name = ServerName::try_from(sni.clone())
            .map_err(|_| anyhow::anyhow!("invalid SNI host '{sni}'"))?;
        let stream = self.shared.connector.connect(server_name, tcp).await?;
        Ok(Box::new(stream))
    }
}

/// Accumulate the request head until the blank line that ends it, a
/// full buffer, or end-of-stream. Everything read is returned, so a
/// client that pipelines bytes past the head loses nothing — the
/// whole buffer is forwarded to the backend.
async fn read_request_head(stream: &mut IoStream, buffer_size: usize) -> Result<Vec<u8>> {
    let mut head = Vec::new();
    let mut buffer = vec![0u8; buffer_size];

    while head.len() < buffer_size {
        let want = buffer_size - head.len();
        let n = stream.read(&mut buffer[..want]).await?;
        if n == 0 {
            break;
        }
        head.extend_from_slice(&buffer[..n]);
        if find(&head, b"\r\n\r\n").is_some() || find(&head, b"\n\n").is_some() {
            break;
        }
    }

    if head.is_empty() {
        bail!("end of stream");
    }
    Ok(head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ForwarderConfig;

    fn forwarder(trojan_path: &str) -> WebForwarder {
        WebForwarder::new(ForwarderConfig {
            trojan_path: trojan_path.to_string(),
            sni_host: "cdn.example".to_string(),
            ..ForwarderConfig::default()
        })
    }

    #[test]
    fn plain_request_classifies_as_ssh() {
        let head = b"GET / HTTP/1.1\r\nUpgrade: websocket\r\n\r\n".to_vec();
        let (kind, rewritten) = forwarder("/trojan").classify(head.clone());
        assert_eq!(kind, ProxyKind::Ssh);
        assert_eq!(rewritten, head);
    }

    #[test]
    fn trojan_path_classifies_and_rewrites_target() {
        let head = b"GET /trojan/extra HTTP/1.1\r\nUpgrade: websocket\r\n\r\n".to_vec();
        let (kind, rewritten) = forwarder("/trojan").classify(head);
        assert_eq!(kind, ProxyKind::Trojan);
        assert_eq!(
            rewritten,
            b"GET /trojan HTTP/1.1\r\nUpgrade: websocket\r\n\r\n"
        );
    }

    #[test]
    fn empty_trojan_path_disables_routing() {
        let head = b"GET / HTTP/1.1\r\nUpgrade: websocket\r\n\r\n".to_vec();
        let (kind, _) = forwarder("").classify(head);
        assert_eq!(kind, ProxyKind::Ssh);
    }

    #[tokio::test]
    async fn head_accumulates_across_small_reads() {
        let (mut client, server) = tokio::io::duplex(8);
        let mut server: IoStream = Box::new(server);

        let writer = tokio::spawn(async move {
            client
                .write_all(b"GET / HTTP/1.1\r\nUpgrade: websocket\r\n\r\n")
                .await
                .unwrap();
            client
        });

        let head = read_request_head(&mut server, 1024).await.unwrap();
        assert_eq!(&head, b"GET / HTTP/1.1\r\nUpgrade: websocket\r\n\r\n");
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn head_read_stops_at_buffer_size() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut server: IoStream = Box::new(server);

        // The writer stays open; the reader must not wait for EOF.
        let writer = tokio::spawn(async move {
            client.write_all(&[b'x'; 64]).await.unwrap();
            client
        });

        let head = read_request_head(&mut server, 16).await.unwrap();
        assert_eq!(head.len(), 16);
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn empty_stream_is_an_error() {
        let (client, server) = tokio::io::duplex(8);
        let mut server: IoStream = Box::new(server);
        drop(client);
        assert!(read_request_head(&mut server, 1024).await.is_err());
    }
}
