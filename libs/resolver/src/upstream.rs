use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{TcpStream, UdpSocket};

/// The two upstream resolvers.
///
/// The direct upstream is queried over UDP: it sits in a reliable part of the
/// network and latency is all that matters. The proxy upstream is queried
/// over TCP, which survives the interference that plain UDP answers from it
/// would not.
#[derive(Debug, Clone)]
pub struct Upstreams {
    direct: SocketAddr,
    proxy: SocketAddr,
}

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(2);

impl Upstreams {
    pub fn new(direct: &str, proxy: &str) -> Result<Self> {
        Ok(Self {
            direct: parse_upstream(direct)
                .with_context(|| format!("Bad direct upstream `{direct}`"))?,
            proxy: parse_upstream(proxy)
                .with_context(|| format!("Bad proxy upstream `{proxy}`"))?,
        })
    }

    /// One UDP exchange with the direct upstream, message passed verbatim.
    pub async fn exchange_direct(&self, payload: &[u8]) -> Result<Vec<u8>> {
        tokio::time::timeout(EXCHANGE_TIMEOUT, udp_exchange(self.direct, payload))
            .await
            .with_context(|| format!("UDP exchange with {} timed out", self.direct))?
    }

    /// One TCP exchange with the proxy upstream, message passed verbatim.
    pub async fn exchange_proxy(&self, payload: &[u8]) -> Result<Vec<u8>> {
        tokio::time::timeout(EXCHANGE_TIMEOUT, tcp_exchange(self.proxy, payload))
            .await
            .with_context(|| format!("TCP exchange with {} timed out", self.proxy))?
    }
}

async fn udp_exchange(server: SocketAddr, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() < 2 {
        bail!("Message too short to carry a transaction id");
    }

    let bind_addr: SocketAddr = match server {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind_addr)
        .await
        .context("Failed to bind UDP socket")?;
    socket
        .connect(server)
        .await
        .context("Failed to connect UDP socket")?;

    socket.send(payload).await.context("Failed to send query")?;

    // On the public Internet, any MTU > 1500 is very unlikely so 2000 is a safe bet.
    let mut buffer = vec![0u8; 2000];
    loop {
        let len = socket
            .recv(&mut buffer)
            .await
            .context("Failed to receive response")?;

        // A stray datagram with the wrong transaction id is not our answer.
        if len >= 2 && buffer[..2] == payload[..2] {
            buffer.truncate(len);
            return Ok(buffer);
        }
    }
}

/// DNS over TCP prefixes each message with a big-endian `u16` length,
/// see <https://datatracker.ietf.org/doc/html/rfc1035#section-4.2.2>.
async fn tcp_exchange(server: SocketAddr, payload: &[u8]) -> Result<Vec<u8>> {
    let length = u16::try_from(payload.len())
        .context("Message too large for TCP transport")?
        .to_be_bytes();

    let mut stream = TcpStream::connect(server)
        .await
        .with_context(|| format!("Failed to connect to {server}"))?;

    stream
        .write_all(&length)
        .await
        .context("Failed to write length header")?;
    stream
        .write_all(payload)
        .await
        .context("Failed to write query")?;

    let mut length = [0u8; 2];
    stream
        .read_exact(&mut length)
        .await
        .context("Failed to read length header")?;

    let mut buffer = vec![0u8; usize::from(u16::from_be_bytes(length))];
    stream
        .read_exact(&mut buffer)
        .await
        .context("Failed to read response")?;

    Ok(buffer)
}

/// Accepts `ip` or `ip:port`; a bare address gets the DNS port.
fn parse_upstream(value: &str) -> Result<SocketAddr> {
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }

    let ip = value
        .parse::<IpAddr>()
        .context("Neither a socket address nor a plain IP")?;

    Ok(SocketAddr::new(ip, 53))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_addresses_default_to_port_53() {
        assert_eq!(
            parse_upstream("223.5.5.5").unwrap(),
            "223.5.5.5:53".parse().unwrap()
        );
        assert_eq!(
            parse_upstream("240c::6666").unwrap(),
            "[240c::6666]:53".parse().unwrap()
        );
    }

    #[test]
    fn explicit_ports_are_kept() {
        assert_eq!(
            parse_upstream("127.0.0.1:5353").unwrap(),
            "127.0.0.1:5353".parse().unwrap()
        );
    }

    #[test]
    fn hostnames_are_rejected() {
        assert!(parse_upstream("dns.example.com").is_err());
    }
}
