//! Proxy outputs: TCP listeners on the TPROXY port that relay each diverted
//! connection through one concrete egress protocol.
//!
//! The steering rules preserve the original destination, so an accepted
//! connection's *local* address is where the client actually wanted to go.

use std::net::{Ipv4Addr, SocketAddr};

use anyhow::{Context as _, Result, bail};
use netplane::TPROXY_PORT;
use tokio::net::TcpListener;

use crate::envcfg;

mod http2socks;
mod socks5;
mod ssh;
mod trojan;

pub(crate) async fn run(kind: &str) -> Result<()> {
    match kind {
        "socks5" => socks5::serve(TPROXY_PORT, envcfg::required("SOCKS5_SERVER")?).await,
        "trojan" => {
            trojan::serve(
                TPROXY_PORT,
                trojan::Params {
                    server: envcfg::required("TROJAN_SERVER")?,
                    password: envcfg::required("TROJAN_PASSWORD")?,
                    insecure: envcfg::required_flag("TROJAN_INSECURE")?,
                    sni: envcfg::required("TROJAN_SNI")?,
                },
            )
            .await
        }
        "http2socks" => {
            http2socks::serve(
                TPROXY_PORT,
                envcfg::required("SERVER")?,
                envcfg::required("TOKEN")?,
            )
            .await
        }
        "ssh" => {
            ssh::serve(
                TPROXY_PORT,
                envcfg::required("SSH_SERVER")?,
                envcfg::required("SSH_USERNAME")?,
                envcfg::required("SSH_PASSWORD")?,
            )
            .await
        }
        other => bail!("Unknown proxy output `{other}`"),
    }
}

/// Binds the TPROXY listener.
///
/// `IP_TRANSPARENT` lets the socket accept connections whose destination is
/// not a local address; the mangle rules route them here. See
/// <https://www.kernel.org/doc/Documentation/networking/tproxy.txt>.
pub(super) fn listen_tproxy(port: u16) -> Result<TcpListener> {
    use nix::sys::socket::setsockopt;
    use nix::sys::socket::sockopt::IpTransparent;
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .context("Failed to create socket")?;

    setsockopt(&socket, IpTransparent, &true).context("Failed to set IP_TRANSPARENT")?;
    socket
        .set_reuse_address(true)
        .context("Failed to set SO_REUSEADDR")?;

    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    socket
        .bind(&addr.into())
        .with_context(|| format!("Failed to bind {addr}"))?;
    socket.listen(1024).context("Failed to listen")?;
    socket
        .set_nonblocking(true)
        .context("Failed to set socket as non-blocking")?;

    let listener =
        TcpListener::from_std(socket.into()).context("Failed to convert std to tokio listener")?;

    tracing::info!(%addr, "Listening for diverted connections");

    Ok(listener)
}
