//! CLI flags, JSON config-file overrides, and log-level routing.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use tracing_subscriber::filter::LevelFilter;

use crate::pipe::DEFAULT_BUFFER_SIZE;

/// Application protocol being tunneled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    /// Plain TCP to an SSH daemon.
    Ssh,
    /// TLS-wrapped stream per the trojan convention.
    Trojan,
}

/// Map the numeric `--lv` scale onto a tracing level. Per-connection
/// I/O noise sits at debug, so level 3 keeps steady-state logs to
/// connection lifecycle lines only.
pub fn level_filter(lv: u8) -> LevelFilter {
    match lv {
        0 | 1 => LevelFilter::OFF,
        2 => LevelFilter::ERROR,
        3 => LevelFilter::INFO,
        4 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Parse a CLI surface, remapping clap's parse-failure exit code to
/// the fatal-startup code this tool family uses.
pub fn parse_cli<T: Parser>() -> T {
    match T::try_parse() {
        Ok(cli) => cli,
        Err(err) if err.use_stderr() => {
            let _ = err.print();
            std::process::exit(1);
        }
        // --help / --version
        Err(err) => err.exit(),
    }
}

#[derive(Parser, Debug)]
#[command(name = "tunnel-proxy", version, about = "WebSocket-masquerading TCP tunnel proxy")]
pub struct TunnelCli {
    /// Local bind host:port
    #[arg(short = 'l', long = "local", default_value = "127.0.0.1:8082")]
    pub local: String,

    /// Remote dial host:port
    #[arg(short = 'r', long = "remote", default_value = "127.0.0.1:443")]
    pub remote: String,

    /// Origin server host:port used for payload expansion
    #[arg(short = 's', long = "server-host", default_value = "")]
    pub server_host: String,

    /// Skip resolving the origin server host
    #[arg(long = "dsr")]
    pub disable_server_resolve: bool,

    /// Run in server proxy mode
    #[arg(long = "sv")]
    pub server_mode: bool,

    /// Outbound payload template
    #[arg(long = "op", default_value = "")]
    pub outbound_payload: String,

    /// Inbound payload template
    #[arg(long = "ip", default_value = "")]
    pub inbound_payload: String,

    /// Relay buffer size in bytes
    #[arg(long = "bs", default_value_t = DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,

    /// Enable TLS on the proxied hop
    #[arg(long = "tls")]
    pub tls: bool,

    /// SNI override, required with --tls
    #[arg(long = "sni", default_value = "")]
    pub sni: String,

    /// JSON config file; non-empty values override the CLI
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// TLS certificate PEM (server mode listener)
    #[arg(long = "cert", default_value = "")]
    pub cert: String,

    /// TLS key PEM (server mode listener)
    #[arg(long = "key", default_value = "")]
    pub key: String,

    /// Proxy kind
    #[arg(short = 'k', long = "kind", value_enum, default_value = "ssh")]
    pub kind: ProxyKind,

    /// Log level 1-5
    #[arg(long = "lv", default_value_t = 3)]
    pub log_level: u8,
}

/// JSON config file for the tunnel binary. Keys are a superset of
/// the CLI flags; only present, non-empty/non-zero values override.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TunnelFileConfig {
    pub local_address: String,
    pub remote_address: String,
    pub server_host: String,
    pub disable_server_resolve: bool,
    pub server_proxy_mode: bool,
    pub outbound_payload: String,
    pub inbound_payload: String,
    pub buffer_size: usize,
    pub tls_enabled: bool,
    pub sni_host: String,
    pub cert_file: String,
    pub key_file: String,
    pub proxy_kind: Option<ProxyKind>,
    pub log_level: u8,
}

/// Effective tunnel settings after CLI + config-file merge.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub local_address: String,
    pub remote_address: String,
    pub server_host: String,
    pub disable_server_resolve: bool,
    pub server_proxy_mode: bool,
    pub outbound_payload: String,
    pub inbound_payload: String,
    pub buffer_size: usize,
    pub tls_enabled: bool,
    pub sni_host: String,
    pub cert_file: String,
    pub key_file: String,
    pub proxy_kind: ProxyKind,
    pub log_level: u8,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        TunnelConfig {
            local_address: "127.0.0.1:8082".to_string(),
            remote_address: "127.0.0.1:443".to_string(),
            server_host: String::new(),
            disable_server_resolve: false,
            server_proxy_mode: false,
            outbound_payload: String::new(),
            inbound_payload: String::new(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            tls_enabled: false,
            sni_host: String::new(),
            cert_file: String::new(),
            key_file: String::new(),
            proxy_kind: ProxyKind::Ssh,
            log_level: 3,
        }
    }
}

impl TunnelConfig {
    pub fn from_cli(cli: TunnelCli) -> Result<Self> {
        let mut cfg = TunnelConfig {
            local_address: cli.local,
            remote_address: cli.remote,
            server_host: cli.server_host,
            disable_server_resolve: cli.disable_server_resolve,
            server_proxy_mode: cli.server_mode,
            outbound_payload: cli.outbound_payload,
            inbound_payload: cli.inbound_payload,
            buffer_size: cli.buffer_size,
            tls_enabled: cli.tls,
            sni_host: cli.sni,
            cert_file: cli.cert,
            key_file: cli.key,
            proxy_kind: cli.kind,
            log_level: cli.log_level,
        };

        if let Some(path) = &cli.config {
            let json = fs::read_to_string(path)
                .with_context(|| format!("cannot read config file {}", path.display()))?;
            let file: TunnelFileConfig = serde_json::from_str(&json)
                .with_context(|| format!("cannot parse config file {}", path.display()))?;
            cfg.apply_overrides(file);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_overrides(&mut self, file: TunnelFileConfig) {
        override_string(&mut self.local_address, file.local_address);
        override_string(&mut self.remote_address, file.remote_address);
        override_string(&mut self.server_host, file.server_host);
        override_string(&mut self.outbound_payload, file.outbound_payload);
        override_string(&mut self.inbound_payload, file.inbound_payload);
        override_string(&mut self.sni_host, file.sni_host);
        override_string(&mut self.cert_file, file.cert_file);
        override_string(&mut self.key_file, file.key_file);
        if file.disable_server_resolve {
            self.disable_server_resolve = true;
        }
        if file.server_proxy_mode {
            self.server_proxy_mode = true;
        }
        if file.tls_enabled {
            self.tls_enabled = true;
        }
        if file.buffer_size != 0 {
            self.buffer_size = file.buffer_size;
        }
        if let Some(kind) = file.proxy_kind {
            self.proxy_kind = kind;
        }
        if file.log_level != 0 {
            self.log_level = file.log_level;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.tls_enabled && self.sni_host.is_empty() {
            bail!("--sni is required when TLS is enabled");
        }
        if self.buffer_size == 0 {
            bail!("buffer size must be non-zero");
        }
        Ok(())
    }
}

#[derive(Parser, Debug)]
#[command(name = "web-forwarder", version, about = "HTTP(S) edge forwarder for WebSocket tunnels")]
pub struct ForwarderCli {
    /// HTTP listen host:port
    #[arg(short = 'l', long = "listen", default_value = "0.0.0.0:80")]
    pub http: String,

    /// HTTPS listen host:port
    #[arg(long = "ln", default_value = "0.0.0.0:443")]
    pub https: String,

    /// SSH backend host:port
    #[arg(short = 'b', long = "backend", default_value = "127.0.0.1:8082")]
    pub backend: String,

    /// Trojan backend host:port
    #[arg(short = 't', long = "trojan-backend", default_value = "127.0.0.1:433")]
    pub trojan_backend: String,

    /// Trojan URL path; empty disables trojan routing
    #[arg(long = "tp", default_value = "")]
    pub trojan_path: String,

    /// SNI sent on TLS backend dials
    #[arg(long = "sni", required = true)]
    pub sni: String,

    /// TLS certificate PEM for the HTTPS listener
    #[arg(long = "cert", default_value = "")]
    pub cert: String,

    /// TLS key PEM for the HTTPS listener
    #[arg(long = "key", default_value = "")]
    pub key: String,

    /// Log level 1-5
    #[arg(long = "lv", default_value_t = 3)]
    pub log_level: u8,
}

/// Effective forwarder settings.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    pub http_address: String,
    pub https_address: String,
    pub backend_address: String,
    pub trojan_address: String,
    pub trojan_path: String,
    pub sni_host: String,
    pub cert_file: String,
    pub key_file: String,
    pub buffer_size: usize,
    pub log_level: u8,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        ForwarderConfig {
            http_address: "0.0.0.0:80".to_string(),
            https_address: "0.0.0.0:443".to_string(),
            backend_address: "127.0.0.1:8082".to_string(),
            trojan_address: "127.0.0.1:433".to_string(),
            trojan_path: String::new(),
            sni_host: String::new(),
            cert_file: String::new(),
            key_file: String::new(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            log_level: 3,
        }
    }
}

impl From<ForwarderCli> for ForwarderConfig {
    fn from(cli: ForwarderCli) -> Self {
        ForwarderConfig {
            http_address: cli.http,
            https_address: cli.https,
            backend_address: cli.backend,
            trojan_address: cli.trojan_backend,
            trojan_path: cli.trojan_path,
            sni_host: cli.sni,
            cert_file: cli.cert,
            key_file: cli.key,
            buffer_size: DEFAULT_BUFFER_SIZE,
            log_level: cli.log_level,
        }
    }
}

fn override_string(target: &mut String, value: String) {
    if !value.is_empty() {
        *target = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> TunnelCli {
        TunnelCli::try_parse_from(args).unwrap()
    }

    #[test]
    fn tunnel_defaults() {
        let cfg = TunnelConfig::from_cli(cli(&["tunnel-proxy"])).unwrap();
        assert_eq!(cfg.local_address, "127.0.0.1:8082");
        assert_eq!(cfg.remote_address, "127.0.0.1:443");
        assert_eq!(cfg.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(cfg.proxy_kind, ProxyKind::Ssh);
        assert_eq!(cfg.log_level, 3);
        assert!(!cfg.server_proxy_mode);
    }

    #[test]
    fn kind_parses_from_flag() {
        let cfg = TunnelConfig::from_cli(cli(&["tunnel-proxy", "-k", "trojan"])).unwrap();
        assert_eq!(cfg.proxy_kind, ProxyKind::Trojan);
    }

    #[test]
    fn tls_without_sni_is_fatal() {
        assert!(TunnelConfig::from_cli(cli(&["tunnel-proxy", "--tls"])).is_err());
        assert!(
            TunnelConfig::from_cli(cli(&["tunnel-proxy", "--tls", "--sni", "cdn.example"]))
                .is_ok()
        );
    }

    #[test]
    fn file_values_override_cli() {
        let mut cfg = TunnelConfig::from_cli(cli(&["tunnel-proxy", "-l", "127.0.0.1:9000"]))
            .unwrap();
        let file: TunnelFileConfig = serde_json::from_str(
            r#"{
                "local_address": "0.0.0.0:1234",
                "server_proxy_mode": true,
                "buffer_size": 4096,
                "proxy_kind": "trojan"
            }"#,
        )
        .unwrap();
        cfg.apply_overrides(file);

        assert_eq!(cfg.local_address, "0.0.0.0:1234");
        assert!(cfg.server_proxy_mode);
        assert_eq!(cfg.buffer_size, 4096);
        assert_eq!(cfg.proxy_kind, ProxyKind::Trojan);
        // Untouched fields keep their CLI values.
        assert_eq!(cfg.remote_address, "127.0.0.1:443");
    }

    #[test]
    fn empty_file_values_do_not_override() {
        let mut cfg =
            TunnelConfig::from_cli(cli(&["tunnel-proxy", "-r", "10.0.0.1:8443"])).unwrap();
        cfg.apply_overrides(TunnelFileConfig::default());
        assert_eq!(cfg.remote_address, "10.0.0.1:8443");
        assert_eq!(cfg.buffer_size, DEFAULT_BUFFER_SIZE);
    }

    #[test]
    fn level_filter_mapping() {
        assert_eq!(level_filter(1), LevelFilter::OFF);
        assert_eq!(level_filter(2), LevelFilter::ERROR);
        assert_eq!(level_filter(3), LevelFilter::INFO);
        assert_eq!(level_filter(4), LevelFilter::DEBUG);
        assert_eq!(level_filter(5), LevelFilter::TRACE);
    }

    #[test]
    fn forwarder_requires_sni() {
        assert!(ForwarderCli::try_parse_from(["web-forwarder"]).is_err());
        let cli =
            ForwarderCli::try_parse_from(["web-forwarder", "--sni", "cdn.example"]).unwrap();
        let cfg = ForwarderConfig::from(cli);
        assert_eq!(cfg.sni_host, "cdn.example");
        assert_eq!(cfg.backend_address, "127.0.0.1:8082");
    }
}
