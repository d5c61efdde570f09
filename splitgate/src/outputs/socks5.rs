use std::net::SocketAddr;

use anyhow::{Context as _, Result, bail};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::net::TcpStream;

use super::listen_tproxy;

/// Relays every diverted connection through a SOCKS5 server (RFC 1928,
/// no authentication).
pub(super) async fn serve(port: u16, server: String) -> Result<()> {
    let listener = listen_tproxy(port)?;

    loop {
        let (local, peer) = listener.accept().await.context("Failed to accept")?;
        let server = server.clone();

        tokio::spawn(async move {
            if let Err(e) = relay(local, &server).await {
                tracing::warn!(%peer, "socks5 relay failed: {e:#}");
            }
        });
    }
}

async fn relay(mut local: TcpStream, server: &str) -> Result<()> {
    let destination = local.local_addr().context("No original destination")?;

    let mut remote = TcpStream::connect(server)
        .await
        .with_context(|| format!("Failed to connect to SOCKS5 server {server}"))?;

    connect(&mut remote, destination).await?;

    tokio::io::copy_bidirectional(&mut local, &mut remote)
        .await
        .context("Relay failed")?;

    Ok(())
}

/// Performs the SOCKS5 greeting and CONNECT on an established stream.
///
/// Shared with the http2socks output, which speaks SOCKS5 over an upgraded
/// HTTP connection.
pub(super) async fn connect<S>(stream: &mut S, destination: SocketAddr) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Greeting: version 5, one method, no authentication.
    stream.write_all(&[5, 1, 0]).await?;

    let mut chosen = [0u8; 2];
    stream.read_exact(&mut chosen).await?;
    if chosen != [5, 0] {
        bail!("SOCKS5 server requires authentication");
    }

    // CONNECT with the raw destination address.
    let mut request = vec![5, 1, 0];
    match destination.ip() {
        std::net::IpAddr::V4(ip) => {
            request.push(1);
            request.extend_from_slice(&ip.octets());
        }
        std::net::IpAddr::V6(ip) => {
            request.push(4);
            request.extend_from_slice(&ip.octets());
        }
    }
    request.extend_from_slice(&destination.port().to_be_bytes());
    stream.write_all(&request).await?;

    // Reply: VER REP RSV ATYP BND.ADDR BND.PORT.
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[1] != 0 {
        bail!("SOCKS5 CONNECT failed with code {}", head[1]);
    }

    let addr_len = match head[3] {
        1 => 4,
        4 => 16,
        3 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            usize::from(len[0])
        }
        other => bail!("SOCKS5 server sent unknown address type {other}"),
    };

    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn speaks_the_connect_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [5, 1, 0]);
            stream.write_all(&[5, 0]).await.unwrap();

            let mut request = [0u8; 10]; // v4 CONNECT
            stream.read_exact(&mut request).await.unwrap();
            assert_eq!(&request[..4], &[5, 1, 0, 1]);
            assert_eq!(&request[4..8], &[1, 2, 3, 4]);
            assert_eq!(u16::from_be_bytes([request[8], request[9]]), 443);

            stream
                .write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        connect(&mut stream, "1.2.3.4:443".parse().unwrap())
            .await
            .unwrap();

        server.await.unwrap();
    }

    #[tokio::test]
    async fn rejects_servers_that_want_auth() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&[5, 2]).await.unwrap(); // username/password required
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let err = connect(&mut stream, "1.2.3.4:443".parse().unwrap())
            .await
            .unwrap_err();

        assert!(format!("{err}").contains("authentication"));
    }
}
