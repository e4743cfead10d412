//! `host:port` resolution with fail-fast semantics.

use std::net::SocketAddr;

use anyhow::{bail, Context, Result};
use tokio::net::lookup_host;

/// Resolve a `host:port` string to a socket address.
///
/// Empty input is rejected outright; anything else goes through the
/// system resolver and the first result wins.
pub async fn resolve_addr(addr: &str) -> Result<SocketAddr> {
    if addr.is_empty() {
        bail!("empty address");
    }

    lookup_host(addr)
        .await
        .with_context(|| format!("cannot resolve address '{addr}'"))?
        .next()
        .with_context(|| format!("address '{addr}' resolved to nothing"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_literal_addr() {
        let addr = resolve_addr("127.0.0.1:8082").await.unwrap();
        assert_eq!(addr, "127.0.0.1:8082".parse().unwrap());
    }

    #[tokio::test]
    async fn rejects_empty_input() {
        let err = resolve_addr("").await.unwrap_err();
        assert!(err.to_string().contains("empty address"));
    }

    #[tokio::test]
    async fn rejects_missing_port() {
        assert!(resolve_addr("127.0.0.1").await.is_err());
    }

    #[tokio::test]
    async fn rejects_bad_port() {
        assert!(resolve_addr("127.0.0.1:notaport").await.is_err());
    }
}
