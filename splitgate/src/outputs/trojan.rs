use std::net::IpAddr;
use std::time::Duration;

use anyhow::{Context as _, Result};
use sha2::{Digest as _, Sha224};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpStream;

use super::listen_tproxy;
use crate::tlsconn;

pub(super) struct Params {
    pub server: String,
    pub password: String,
    pub insecure: bool,
    pub sni: String,
}

/// Relays diverted connections through a trojan server.
///
/// The protocol is a TLS stream that opens with
/// `hex(SHA-224(password)) CRLF CONNECT <addr> <port> CRLF` followed by raw
/// payload; to the outside it is indistinguishable from HTTPS.
pub(super) async fn serve(port: u16, params: Params) -> Result<()> {
    let listener = listen_tproxy(port)?;
    let params = std::sync::Arc::new(params);

    loop {
        let (local, peer) = listener.accept().await.context("Failed to accept")?;
        let params = std::sync::Arc::clone(&params);

        tokio::spawn(async move {
            if let Err(e) = relay(local, &params).await {
                tracing::warn!(%peer, "trojan relay failed: {e:#}");
            }
        });
    }
}

/// How long we wait for the client's first bytes before sending the header
/// alone. Coalescing them hides the header's length pattern and saves a
/// round trip.
const FIRST_PACKET_WAIT: Duration = Duration::from_millis(100);

async fn relay(mut local: TcpStream, params: &Params) -> Result<()> {
    let destination = local.local_addr().context("No original destination")?;

    let mut remote = tlsconn::connect(&params.server, &params.sni, params.insecure).await?;

    let mut request = Vec::with_capacity(128);
    request.extend_from_slice(hex::encode(Sha224::digest(params.password.as_bytes())).as_bytes());
    request.extend_from_slice(b"\r\n");

    request.push(1); // CONNECT
    match destination.ip() {
        IpAddr::V4(ip) => {
            request.push(1);
            request.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            request.push(4);
            request.extend_from_slice(&ip.octets());
        }
    }
    request.extend_from_slice(&destination.port().to_be_bytes());
    request.extend_from_slice(b"\r\n");

    let mut first = [0u8; 512];
    if let Ok(Ok(n)) = tokio::time::timeout(FIRST_PACKET_WAIT, local.read(&mut first)).await {
        request.extend_from_slice(&first[..n]);
    }

    remote
        .write_all(&request)
        .await
        .context("Failed to write trojan request")?;

    tokio::io::copy_bidirectional(&mut local, &mut remote)
        .await
        .context("Relay failed")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_is_hex_encoded_sha224() {
        // Trojan servers compare against hex(SHA-224(password)): 56 hex
        // digits, stable across connections.
        let hashed = hex::encode(Sha224::digest(b"password"));

        assert_eq!(hashed.len(), 56);
        assert!(hashed.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(hashed, hex::encode(Sha224::digest(b"password")));
        assert_ne!(hashed, hex::encode(Sha224::digest(b"other")));
    }
}
