//! The tunnel proxy: a per-connection state machine that edits the
//! first request/response exchange and relays everything after it.
//!
//! In client mode the first buffer from the local application is
//! rewritten into the masquerade payload (`ssh` kind) or into a
//! wss-addressed request (`trojan` kind), and the first buffer back
//! from the remote swaps a `101` status line for the operator's
//! inbound payload. In server mode the proxy answers a WebSocket
//! upgrade itself and only then opens the reverse copy direction,
//! acting as a half-open relay during the handshake.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::{Context, Result};
use rustls::pki_types::ServerName;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    net::{TcpListener, TcpStream},
    time::timeout,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{error, info, warn};

use crate::{
    config::{ProxyKind, TunnelConfig},
    payload::{self, ServerHost},
    pipe::{Direction, IoStream, Relay},
    resolver::resolve_addr,
    tls,
    util::{contains_ignore_ascii_case, find, replace_bytes, request_target, split_lines},
};

/// Reply written back to the client when the server-mode proxy sees
/// a WebSocket upgrade request.
const WS_UPGRADE_RESPONSE: &[u8] =
    b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";

const TLS_ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared per-process tunnel state; cheap to clone into the task
/// spawned for each accepted connection.
#[derive(Clone)]
pub struct TunnelProxy {
    shared: Arc<Shared>,
}

struct Shared {
    cfg: TunnelConfig,
    outbound_payload: Vec<u8>,
    inbound_payload: Vec<u8>,
    connector: Option<TlsConnector>,
    acceptor: Option<TlsAcceptor>,
    next_conn_id: AtomicU64,
}

impl TunnelProxy {
    /// Build a proxy from its effective configuration. Expands both
    /// payload templates once and, depending on mode, prepares the
    /// TLS dialer or the TLS listener material. TLS material
    /// failures are fatal; an unparseable server host only costs the
    /// `[host]`/`[host_port]` expansion.
    pub fn new(cfg: TunnelConfig) -> Result<Self> {
        let server_host = if cfg.server_host.is_empty() {
            None
        } else {
            match cfg.server_host.parse::<ServerHost>() {
                Ok(host) => Some(host),
                Err(e) => {
                    warn!("cannot parse server host '{}': {e}", cfg.server_host);
                    None
                }
            }
        };

        let outbound_payload =
            payload::expand(&cfg.outbound_payload, server_host.as_ref(), &cfg.sni_host);
        let inbound_payload =
            payload::expand_inbound(&cfg.inbound_payload, server_host.as_ref(), &cfg.sni_host);

        let connector = (cfg.tls_enabled && !cfg.server_proxy_mode)
            .then(|| TlsConnector::from(Arc::new(tls::build_insecure_client_config())));

        let acceptor = if cfg.tls_enabled && cfg.server_proxy_mode {
            let (chain, key) = tls::obtain_server_tls(&cfg.cert_file, &cfg.key_file)?;
            Some(TlsAcceptor::from(Arc::new(tls::build_server_config(
                chain, key,
            )?)))
        } else {
            None
        };

        Ok(TunnelProxy {
            shared: Arc::new(Shared {
                cfg,
                outbound_payload,
                inbound_payload,
                connector,
                acceptor,
                next_conn_id: AtomicU64::new(0),
            }),
        })
    }

    /// Resolve and bind the local address, then accept until Ctrl-C.
    pub async fn run(&self) -> Result<()> {
        let cfg = &self.shared.cfg;

        let local = resolve_addr(&cfg.local_address).await?;
        resolve_addr(&cfg.remote_address).await?;
        if !cfg.server_host.is_empty() && !cfg.disable_server_resolve {
            // Validation only; payload expansion keeps the host name.
            resolve_addr(&cfg.server_host).await?;
        }

        let listener = TcpListener::bind(local)
            .await
            .with_context(|| format!("cannot bind {local}"))?;
        info!(
            "tunnel-proxy proxying from {} to {}",
            cfg.local_address, cfg.remote_address
        );

        tokio::select! {
            res = self.serve(listener) => res,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received (Ctrl-C). Closing proxy.");
                Ok(())
            }
        }
    }

    /// Accept loop: assign connection IDs and spawn one task per
    /// accepted connection. Public so tests can drive an ephemeral
    /// listener directly.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (sock, peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Failed to accept connection {e}");
                    continue;
                }
            };
            let conn_id = self.shared.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
            let proxy = self.clone();

            tokio::spawn(async move {
                if let Err(e) = proxy.handle_connection(conn_id, sock).await {
                    error!("CONN #{conn_id} from {peer_addr} ended with error {e:#}");
                }
            });
        }
    }

    /// One connection end-to-end: optional TLS accept, dial the
    /// remote, run the editing copy loops until both sides stop.
    async fn handle_connection(&self, conn_id: u64, sock: TcpStream) -> Result<()> {
        let cfg = &self.shared.cfg;

        let client: IoStream = match &self.shared.acceptor {
            Some(acceptor) => {
                let accepted = timeout(TLS_ACCEPT_TIMEOUT, acceptor.accept(sock))
                    .await
                    .context("TLS handshake timed out")?
                    .context("TLS handshake failed")?;
                Box::new(accepted)
            }
            None => Box::new(sock),
        };

        let remote = self
            .dial_remote()
            .await
            .with_context(|| format!("cannot dial remote connection '{}'", cfg.remote_address))?;

        info!(
            "CONN #{conn_id} opened {} >> {}",
            cfg.local_address, cfg.remote_address
        );

        let relay = Relay::new(cfg.buffer_size);
        let (client_read, client_write) = tokio::io::split(client);
        let (remote_read, remote_write) = tokio::io::split(remote);

        if cfg.server_proxy_mode {
            self.server_mode_connection(
                conn_id,
                &relay,
                client_read,
                client_write,
                remote_read,
                remote_write,
            )
            .await;
        } else {
            let inbound = {
                let proxy = self.clone();
                let relay = relay.clone();
                tokio::spawn(async move {
                    proxy
                        .inbound_loop(conn_id, &relay, remote_read, client_write)
                        .await;
                })
            };
            self.outbound_loop(conn_id, &relay, client_read, remote_write)
                .await;
            let _ = inbound.await;
        }

        let (sent, received) = relay.bytes();
        info!("CONN #{conn_id} closed ({sent} bytes sent, {received} bytes received)");
        Ok(())
    }

    async fn dial_remote(&self) -> Result<IoStream> {
        let cfg = &self.shared.cfg;
        let tcp = TcpStream::connect(&cfg.remote_address).await?;

        match &self.shared.connector {
            Some(connector) => {
                let server_name = ServerName::try_from(cfg.sni_host.clone())
                    .map_err(|_| anyhow::anyhow!("invalid SNI host '{}'", cfg.sni_host))?;
                Ok(Box::new(connector.connect(server_name, tcp).await?))
            }
            None => Ok(Box::new(tcp)),
        }
    }

    /// Client-mode forward direction: edit the first buffer, then
    /// hand the rest to the relay.
    async fn outbound_loop(
        &self,
        conn_id: u64,
        relay: &Relay,
        mut src: ReadHalf<IoStream>,
        mut dst: WriteHalf<IoStream>,
    ) {
        let mut buffer = vec![0u8; self.shared.cfg.buffer_size];
        let n = tokio::select! {
            _ = relay.closed() => 0,
            read = src.read(&mut buffer) => read.unwrap_or(0),
        };
        if n == 0 {
            relay.shutdown();
            let _ = dst.shutdown().await;
            return;
        }

        let mut chunk = buffer[..n].to_vec();
        self.edit_outbound(conn_id, &mut chunk);
        if dst.write_all(&chunk).await.is_err() {
            relay.shutdown();
            return;
        }
        relay.count(Direction::Outbound, chunk.len() as u64);

        relay.run(src, dst, Direction::Outbound).await;
    }

    /// Client-mode reverse direction with its one-shot `101` edit.
    async fn inbound_loop(
        &self,
        conn_id: u64,
        relay: &Relay,
        mut src: ReadHalf<IoStream>,
        mut dst: WriteHalf<IoStream>,
    ) {
        let mut buffer = vec![0u8; self.shared.cfg.buffer_size];
        let n = tokio::select! {
            _ = relay.closed() => 0,
            read = src.read(&mut buffer) => read.unwrap_or(0),
        };
        if n == 0 {
            relay.shutdown();
            let _ = dst.shutdown().await;
            return;
        }

        let mut chunk = buffer[..n].to_vec();
        self.edit_inbound(conn_id, &mut chunk);
        if dst.write_all(&chunk).await.is_err() {
            relay.shutdown();
            return;
        }
        relay.count(Direction::Inbound, chunk.len() as u64);

        relay.run(src, dst, Direction::Inbound).await;
    }

    /// Server-mode connection body. Only the forward direction runs
    /// at first; a WebSocket upgrade is answered directly back to
    /// the client and the reverse direction starts only after that
    /// write, so no backend byte can overtake the `101`.
    async fn server_mode_connection(
        &self,
        conn_id: u64,
        relay: &Arc<Relay>,
        mut client_read: ReadHalf<IoStream>,
        client_write: WriteHalf<IoStream>,
        remote_read: ReadHalf<IoStream>,
        mut remote_write: WriteHalf<IoStream>,
    ) {
        // Reverse halves stay parked until (and unless) the upgrade
        // arrives; holding them keeps the client socket open while
        // the relay runs half-open.
        let mut reverse = Some((remote_read, client_write));
        let mut inbound_task = None;

        let mut buffer = vec![0u8; self.shared.cfg.buffer_size];
        let n = tokio::select! {
            _ = relay.closed() => 0,
            read = client_read.read(&mut buffer) => read.unwrap_or(0),
        };
        if n == 0 {
            relay.shutdown();
            let _ = remote_write.shutdown().await;
            return;
        }

        if contains_ignore_ascii_case(&buffer[..n], b"upgrade: websocket") {
            info!("CONN #{conn_id} connection upgrade to WebSocket");
            if let Some((remote_read, mut client_write)) = reverse.take() {
                if client_write.write_all(WS_UPGRADE_RESPONSE).await.is_err() {
                    relay.shutdown();
                    return;
                }
                relay.count(Direction::Outbound, WS_UPGRADE_RESPONSE.len() as u64);

                let relay_task = relay.clone();
                inbound_task = Some(tokio::spawn(async move {
                    relay_task
                        .run(remote_read, client_write, Direction::Inbound)
                        .await;
                }));
            }
        } else {
            // Not an upgrade: forward as-is and stay half-open, the
            // reverse direction never starts.
            if remote_write.write_all(&buffer[..n]).await.is_err() {
                relay.shutdown();
                return;
            }
            relay.count(Direction::Outbound, n as u64);
        }

        relay
            .run(client_read, remote_write, Direction::Outbound)
            .await;
        if let Some(task) = inbound_task {
            let _ = task.await;
        }
        drop(reverse);
    }

    /// One-shot outbound edit on the first client buffer.
    fn edit_outbound(&self, conn_id: u64, chunk: &mut Vec<u8>) {
        let cfg = &self.shared.cfg;
        let Some(first_line) = split_lines(chunk).into_iter().next().map(|l| l.to_vec()) else {
            return;
        };

        match cfg.proxy_kind {
            ProxyKind::Ssh => {
                if find(&first_line, b"CONNECT ").is_some() {
                    *chunk = self.shared.outbound_payload.clone();
                    info!(
                        "CONN #{conn_id} request replaced with payload:\n{}",
                        String::from_utf8_lossy(chunk)
                    );
                }
            }
            ProxyKind::Trojan => {
                let Some(target) = request_target(&first_line) else {
                    return;
                };
                let needle = format!(" {target} ");
                let replacement = format!(" wss://{}{} ", cfg.sni_host, target);
                *chunk = replace_bytes(chunk, needle.as_bytes(), replacement.as_bytes());
                info!(
                    "CONN #{conn_id} request target rewritten to wss://{}{}",
                    cfg.sni_host, target
                );
            }
        }
    }

    /// One-shot inbound edit on the first remote buffer: an ssh-kind
    /// tunnel swaps a `101` status line for the inbound payload.
    fn edit_inbound(&self, conn_id: u64, chunk: &mut Vec<u8>) {
        if self.shared.cfg.proxy_kind != ProxyKind::Ssh {
            return;
        }
        let lines = split_lines(chunk);
        let Some(first_line) = lines.first() else {
            return;
        };
        if find(first_line, b" 101 ").is_none() {
            return;
        }

        let status: Vec<u8> = self
            .shared
            .inbound_payload
            .iter()
            .copied()
            .filter(|&b| b != b'\r' && b != b'\n')
            .collect();

        let mut rewritten: Vec<Vec<u8>> = Vec::with_capacity(lines.len());
        rewritten.push(status);
        rewritten.extend(lines[1..].iter().map(|l| l.to_vec()));
        *chunk = rewritten.join(&b"\r\n"[..]);
        info!(
            "CONN #{conn_id} response replaced with payload:\n{}",
            String::from_utf8_lossy(chunk)
        );
    }
}
