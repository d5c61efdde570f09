use std::io::{ErrorKind, Read as _};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::net::TcpStream;

use super::listen_tproxy;

struct Params {
    server: String,
    username: String,
    password: String,
}

/// Relays diverted connections through SSH `direct-tcpip` channels.
///
/// libssh2 sessions are not usable from two threads at once, so each
/// connection gets its own session and runs entirely on the blocking pool.
pub(super) async fn serve(
    port: u16,
    server: String,
    username: String,
    password: String,
) -> Result<()> {
    let params = Arc::new(Params {
        server,
        username,
        password,
    });

    // Fail fast on bad credentials instead of once per connection.
    {
        let params = Arc::clone(&params);
        tokio::task::spawn_blocking(move || open_session(&params).map(drop))
            .await
            .context("SSH probe task failed")??;
    }

    let listener = listen_tproxy(port)?;

    loop {
        let (local, peer) = listener.accept().await.context("Failed to accept")?;
        let params = Arc::clone(&params);

        tokio::task::spawn_blocking(move || {
            if let Err(e) = relay(local, &params) {
                tracing::warn!(%peer, "ssh relay failed: {e:#}");
            }
        });
    }
}

fn open_session(params: &Params) -> Result<ssh2::Session> {
    let tcp = std::net::TcpStream::connect(&params.server)
        .with_context(|| format!("Failed to connect to SSH server {}", params.server))?;

    let mut session = ssh2::Session::new().context("Failed to create SSH session")?;
    session.set_tcp_stream(tcp);
    session.handshake().context("SSH handshake failed")?;

    // TODO: Verify the host key against a known_hosts file.
    session
        .userauth_password(&params.username, &params.password)
        .context("SSH authentication failed")?;

    Ok(session)
}

fn relay(local: TcpStream, params: &Params) -> Result<()> {
    let destination = local.local_addr().context("No original destination")?;

    let local = local.into_std().context("Failed to unwrap stream")?;

    let session = open_session(params)?;
    let mut channel = session
        .channel_direct_tcpip(&destination.ip().to_string(), destination.port(), None)
        .with_context(|| format!("Failed to open channel to {destination}"))?;

    pump(&local, &session, &mut channel)
}

const IDLE_WAIT: Duration = Duration::from_millis(5);

/// Full-duplex copy between the client socket and the SSH channel.
///
/// A channel cannot be split, so one loop services both directions with the
/// session in non-blocking mode.
fn pump(
    mut local: &std::net::TcpStream,
    session: &ssh2::Session,
    channel: &mut ssh2::Channel,
) -> Result<()> {
    local
        .set_nonblocking(true)
        .context("Failed to make stream non-blocking")?;
    session.set_blocking(false);

    let mut buffer = [0u8; 16 * 1024];
    let mut local_eof = false;

    loop {
        let mut progressed = false;

        if !local_eof {
            match local.read(&mut buffer) {
                Ok(0) => {
                    local_eof = true;
                    let _ = channel.send_eof();
                }
                Ok(n) => {
                    write_all_retrying(&mut *channel, &buffer[..n])
                        .context("Failed to write to channel")?;
                    progressed = true;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(e).context("Failed to read from client"),
            }
        }

        match channel.read(&mut buffer) {
            Ok(0) => break, // Remote side is done.
            Ok(n) => {
                write_all_retrying(&mut local, &buffer[..n])
                    .context("Failed to write to client")?;
                progressed = true;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if local_eof && channel.eof() {
                    break;
                }
            }
            Err(e) => return Err(e).context("Failed to read from channel"),
        }

        if !progressed {
            std::thread::sleep(IDLE_WAIT);
        }
    }

    let _ = local.shutdown(std::net::Shutdown::Write);

    Ok(())
}

/// `write_all` over a non-blocking writer.
fn write_all_retrying(mut dst: impl std::io::Write, mut buf: &[u8]) -> std::io::Result<()> {
    while !buf.is_empty() {
        match dst.write(buf) {
            Ok(0) => return Err(std::io::ErrorKind::WriteZero.into()),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == ErrorKind::WouldBlock => std::thread::sleep(IDLE_WAIT),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }

    Ok(())
}
