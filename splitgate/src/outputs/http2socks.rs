use anyhow::{Context as _, Result, bail};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::net::TcpStream;
use url::Url;

use super::{listen_tproxy, socks5};
use crate::tlsconn;

/// Relays through an HTTP server that upgrades authenticated CONNECT
/// requests into a raw SOCKS5 stream.
pub(super) async fn serve(port: u16, server: String, token: String) -> Result<()> {
    let url = Url::parse(&server).with_context(|| format!("Bad server URL `{server}`"))?;
    let listener = listen_tproxy(port)?;

    loop {
        let (local, peer) = listener.accept().await.context("Failed to accept")?;
        let url = url.clone();
        let token = token.clone();

        tokio::spawn(async move {
            if let Err(e) = relay(local, &url, &token).await {
                tracing::warn!(%peer, "http2socks relay failed: {e:#}");
            }
        });
    }
}

async fn relay(mut local: TcpStream, url: &Url, token: &str) -> Result<()> {
    let destination = local.local_addr().context("No original destination")?;

    let host = url.host_str().context("Server URL has no host")?;
    let port = url
        .port_or_known_default()
        .context("Server URL has no port")?;
    let addr = format!("{host}:{port}");

    match url.scheme() {
        "https" => {
            let mut remote = tlsconn::connect(&addr, "", false).await?;
            open(&mut remote, url, token).await?;
            socks5::connect(&mut remote, destination).await?;
            tokio::io::copy_bidirectional(&mut local, &mut remote).await?;
        }
        "http" => {
            let mut remote = TcpStream::connect(&addr)
                .await
                .with_context(|| format!("Failed to connect to {addr}"))?;
            open(&mut remote, url, token).await?;
            socks5::connect(&mut remote, destination).await?;
            tokio::io::copy_bidirectional(&mut local, &mut remote).await?;
        }
        other => bail!("Unsupported server URL scheme `{other}`"),
    }

    Ok(())
}

/// Sends the authenticated CONNECT and waits for the 200 that hands the raw
/// stream over.
async fn open<S>(stream: &mut S, url: &Url, token: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let host = url.host_str().context("Server URL has no host")?;
    let path = url.path();

    let request = format!(
        "CONNECT {path} HTTP/1.1\r\nHost: {host}\r\nAuthorization: Bearer {token}\r\n\r\n"
    );
    stream
        .write_all(request.as_bytes())
        .await
        .context("Failed to send CONNECT")?;

    let head = read_response_head(stream).await?;
    let status_line = head.lines().next().unwrap_or_default();
    if !status_line.contains(" 200 ") && !status_line.ends_with(" 200") {
        bail!("Server refused the tunnel: {status_line}");
    }

    Ok(())
}

async fn read_response_head<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];

    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > 8 * 1024 {
            bail!("Response header too large");
        }

        stream
            .read_exact(&mut byte)
            .await
            .context("Connection closed mid-header")?;
        head.push(byte[0]);
    }

    Ok(String::from_utf8_lossy(&head).into_owned())
}
