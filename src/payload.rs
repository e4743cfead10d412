//! Operator-supplied payload templates and their token expansion.
//!
//! Templates carry the bytes that replace the first request
//! (outbound) or first response (inbound) of a tunneled connection.
//! Four tokens are recognised: `[host]`, `[host_port]`, `[sni]` and
//! `[crlf]`. Unknown tokens pass through verbatim, and expansion is
//! idempotent — expanded values never re-introduce tokens.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Context, Error};

/// Inbound template used when the operator supplies none.
const DEFAULT_INBOUND_PAYLOAD: &str = "HTTP/1.1 200 Connection Established[crlf][crlf]";

/// Origin server advertised in expanded payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHost {
    pub host_name: String,
    pub port: u16,
}

impl FromStr for ServerHost {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("cannot parse server host port '{s}'"))?;
        if host.is_empty() {
            return Err(anyhow!("cannot parse server host port '{s}'"));
        }
        let port = port
            .parse::<u16>()
            .with_context(|| format!("cannot parse server port '{port}'"))?;
        Ok(ServerHost {
            host_name: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for ServerHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_name, self.port)
    }
}

/// Expand an outbound payload template.
pub fn expand(template: &str, server_host: Option<&ServerHost>, sni: &str) -> Vec<u8> {
    let mut payload = template.to_string();
    if let Some(host) = server_host {
        payload = payload.replace("[host]", &host.host_name);
        payload = payload.replace("[host_port]", &host.to_string());
    }
    if !sni.is_empty() {
        payload = payload.replace("[sni]", sni);
    }
    payload.replace("[crlf]", "\r\n").into_bytes()
}

/// Expand an inbound payload template, falling back to the stock
/// `200 Connection Established` response when the template is empty.
pub fn expand_inbound(template: &str, server_host: Option<&ServerHost>, sni: &str) -> Vec<u8> {
    let template = if template.is_empty() {
        DEFAULT_INBOUND_PAYLOAD
    } else {
        template
    };
    expand(template, server_host, sni)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> ServerHost {
        ServerHost {
            host_name: "example.org".to_string(),
            port: 443,
        }
    }

    #[test]
    fn parses_host_port() {
        let parsed: ServerHost = "example.org:443".parse().unwrap();
        assert_eq!(parsed, host());
    }

    #[test]
    fn rejects_unparseable_host() {
        assert!("example.org".parse::<ServerHost>().is_err());
        assert!(":443".parse::<ServerHost>().is_err());
        assert!("example.org:http".parse::<ServerHost>().is_err());
    }

    #[test]
    fn expands_all_tokens() {
        let expanded = expand(
            "GET / HTTP/1.1[crlf]Host: [host][crlf]X: [host_port] [sni][crlf][crlf]",
            Some(&host()),
            "cdn.example",
        );
        assert_eq!(
            expanded,
            b"GET / HTTP/1.1\r\nHost: example.org\r\nX: example.org:443 cdn.example\r\n\r\n"
        );
    }

    #[test]
    fn unknown_tokens_pass_through() {
        let expanded = expand("[nope] [host]", Some(&host()), "");
        assert_eq!(expanded, b"[nope] example.org");
    }

    #[test]
    fn tokens_left_alone_without_values() {
        // No server host and no SNI: those tokens stay unexpanded.
        let expanded = expand("[host] [sni][crlf]", None, "");
        assert_eq!(expanded, b"[host] [sni]\r\n");
    }

    #[test]
    fn expansion_is_idempotent() {
        let once = expand("GET / HTTP/1.1[crlf]Host: [host][crlf][crlf]", Some(&host()), "sni");
        let twice = expand(
            std::str::from_utf8(&once).unwrap(),
            Some(&host()),
            "sni",
        );
        assert_eq!(once, twice);
    }

    #[test]
    fn empty_inbound_template_defaults() {
        assert_eq!(
            expand_inbound("", None, ""),
            b"HTTP/1.1 200 Connection Established\r\n\r\n"
        );
    }

    #[test]
    fn explicit_inbound_template_wins() {
        assert_eq!(
            expand_inbound("HTTP/1.1 200 OK[crlf][crlf]", None, ""),
            b"HTTP/1.1 200 OK\r\n\r\n"
        );
    }
}
