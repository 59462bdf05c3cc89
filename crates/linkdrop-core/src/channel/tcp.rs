//! TCP transport for the channel.
//!
//! TCP has no message boundaries, so every [`WireMessage`] travels in the
//! envelope described in [`crate::protocol`]. A writer task drains the
//! outbound queue and a reader task feeds inbound events; either one
//! failing closes the link.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Channel, ChannelEvent, Link, Outbound};
use crate::error::{Error, Result};
use crate::protocol::{self, WireMessage};
use crate::DEFAULT_TCP_PORT;

/// Parse a host address string into a `SocketAddr`.
///
/// Accepts formats:
/// - `IP` (e.g., `192.168.1.100`) - uses default port 52530
/// - `IP:PORT` (e.g., `192.168.1.100:52540`) - uses specified port
/// - `[IPv6]` (e.g., `[::1]`) - uses default port 52530
/// - `[IPv6]:PORT` (e.g., `[::1]:52540`) - uses specified port
///
/// # Examples
///
/// ```
/// use linkdrop_core::channel::tcp::parse_host_address;
///
/// let addr = parse_host_address("192.168.1.100").unwrap();
/// assert_eq!(addr.port(), 52530);
///
/// let addr = parse_host_address("192.168.1.100:52540").unwrap();
/// assert_eq!(addr.port(), 52540);
/// ```
///
/// # Errors
///
/// Returns an error if the host string cannot be parsed.
pub fn parse_host_address(host: &str) -> Result<SocketAddr> {
    let host = host.trim();
    let invalid = || {
        Error::InvalidInput(format!(
            "Invalid host format '{host}'. Use IP or IP:PORT (e.g., 192.168.1.100 or 192.168.1.100:52530)"
        ))
    };

    if let Ok(addr) = host.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Some(inner) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        let ip: IpAddr = inner.parse().map_err(|_| invalid())?;
        return Ok(SocketAddr::new(ip, DEFAULT_TCP_PORT));
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_TCP_PORT));
    }

    match host.rsplit_once(':') {
        Some((ip_part, port_part)) if !ip_part.contains(':') => {
            let ip: IpAddr = ip_part.parse().map_err(|_| invalid())?;
            let port: u16 = port_part.parse().map_err(|_| {
                Error::InvalidInput(format!(
                    "Invalid port '{port_part}'. Port must be a number between 1 and 65535"
                ))
            })?;
            Ok(SocketAddr::new(ip, port))
        }
        _ => Err(invalid()),
    }
}

/// Configure TCP keep-alive on a socket.
///
/// - Start probing after 10 seconds of idle time
/// - Send probes every 5 seconds
fn configure_tcp_keepalive(stream: &TcpStream) -> Result<()> {
    let socket_ref = SockRef::from(stream);

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(10))
        .with_interval(Duration::from_secs(5));

    socket_ref
        .set_tcp_keepalive(&keepalive)
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;

    tracing::debug!("TCP keep-alive enabled on socket");
    Ok(())
}

/// Connect to a listening peer.
///
/// # Errors
///
/// Returns [`Error::ConnectTimeout`] if the connection is not established
/// within `timeout`, or an I/O error if it is refused.
pub async fn connect(addr: SocketAddr, low_threshold: usize, timeout: Duration) -> Result<Link> {
    tracing::info!(%addr, "Connecting");

    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::ConnectTimeout(duration_ms(timeout)))??;

    Ok(from_stream(stream, low_threshold))
}

/// Accept one peer on `listener`.
///
/// # Errors
///
/// Returns an error if accepting fails.
pub async fn accept(listener: &TcpListener, low_threshold: usize) -> Result<(Link, SocketAddr)> {
    let (stream, peer) = listener.accept().await?;
    tracing::info!(%peer, "Accepted connection");
    Ok((from_stream(stream, low_threshold), peer))
}

/// Wrap an established stream as a [`Link`].
///
/// The link reports [`ChannelEvent::Open`] immediately. Must be called
/// within a Tokio runtime.
#[must_use]
pub fn from_stream(stream: TcpStream, low_threshold: usize) -> Link {
    if let Err(e) = configure_tcp_keepalive(&stream) {
        tracing::warn!("Failed to configure TCP keep-alive: {e}");
    }
    let _ = stream.set_nodelay(true);

    let closed = CancellationToken::new();
    let (channel, outbound) = Channel::with_close_token(low_threshold, closed.clone());
    let (events_tx, events) = mpsc::unbounded_channel();
    let _ = events_tx.send(ChannelEvent::Open);

    let (reader, writer) = stream.into_split();
    tokio::spawn(write_loop(writer, outbound, closed.clone()));
    tokio::spawn(read_loop(reader, events_tx, closed));

    Link { channel, events }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut outbound: Outbound, closed: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            () = closed.cancelled() => {
                // Messages queued before the close still go out.
                while let Some(message) = outbound.try_recv() {
                    if !write_message(&mut writer, &outbound, &message).await {
                        break;
                    }
                }
                break;
            }
            message = outbound.recv() => {
                let Some(message) = message else { break };
                if !write_message(&mut writer, &outbound, &message).await {
                    break;
                }
            }
        }
    }

    closed.cancel();
    let _ = writer.shutdown().await;
    tracing::debug!("TCP writer stopped");
}

async fn write_message(
    writer: &mut OwnedWriteHalf,
    outbound: &Outbound,
    message: &WireMessage,
) -> bool {
    let len = message.len();
    let written = protocol::write_frame(writer, message).await;
    outbound.release(len);
    if let Err(e) = written {
        tracing::warn!("Failed to write frame: {e}");
        return false;
    }
    true
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    events: mpsc::UnboundedSender<ChannelEvent>,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = closed.cancelled() => break,
            frame = protocol::read_frame(&mut reader) => match frame {
                Ok(message) => {
                    if events.send(ChannelEvent::Message(message)).is_err() {
                        break;
                    }
                }
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    tracing::debug!("Peer closed the connection");
                    break;
                }
                Err(e) => {
                    tracing::warn!("Failed to read frame: {e}");
                    break;
                }
            },
        }
    }

    closed.cancel();
    let _ = events.send(ChannelEvent::Closed);
    tracing::debug!("TCP reader stopped");
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_ipv4_only() {
        let addr = parse_host_address("192.168.1.100").unwrap();
        assert_eq!(addr.ip().to_string(), "192.168.1.100");
        assert_eq!(addr.port(), DEFAULT_TCP_PORT);
    }

    #[test]
    fn test_parse_host_ipv4_with_port() {
        let addr = parse_host_address("192.168.1.100:52540").unwrap();
        assert_eq!(addr.port(), 52540);
    }

    #[test]
    fn test_parse_host_ipv6_brackets() {
        let addr = parse_host_address("[::1]").unwrap();
        assert_eq!(addr.ip().to_string(), "::1");
        assert_eq!(addr.port(), DEFAULT_TCP_PORT);
    }

    #[test]
    fn test_parse_host_ipv6_with_port() {
        let addr = parse_host_address("[2001:db8::1]:52540").unwrap();
        assert_eq!(addr.ip().to_string(), "2001:db8::1");
        assert_eq!(addr.port(), 52540);
    }

    #[test]
    fn test_parse_host_invalid() {
        assert!(parse_host_address("not-an-ip").is_err());
        assert!(parse_host_address("192.168.1.100:abc").is_err());
        assert!(parse_host_address("192.168.1.256").is_err());
    }

    #[test]
    fn test_parse_host_whitespace() {
        let addr = parse_host_address("  10.0.0.7  ").unwrap();
        assert_eq!(addr.ip().to_string(), "10.0.0.7");
    }

    #[tokio::test]
    async fn test_tcp_link_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let server_task = tokio::spawn(async move { accept(&listener, 1024).await });
        let client = connect(addr, 1024, Duration::from_secs(5))
            .await
            .expect("connect");
        let (mut server, _) = server_task.await.expect("join").expect("accept");

        assert_eq!(server.events.recv().await, Some(ChannelEvent::Open));

        client.channel.send_text("hello").expect("send");
        client.channel.send_binary(vec![1, 2, 3]).expect("send");

        assert_eq!(
            server.events.recv().await,
            Some(ChannelEvent::Message(WireMessage::Text("hello".to_string())))
        );
        assert_eq!(
            server.events.recv().await,
            Some(ChannelEvent::Message(WireMessage::Binary(vec![1, 2, 3])))
        );

        client.channel.close();
        assert_eq!(server.events.recv().await, Some(ChannelEvent::Closed));
    }

    #[tokio::test]
    async fn test_close_flushes_queued_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let server_task = tokio::spawn(async move { accept(&listener, 1024).await });
        let client = connect(addr, 1024, Duration::from_secs(5))
            .await
            .expect("connect");
        let (mut server, _) = server_task.await.expect("join").expect("accept");
        assert_eq!(server.events.recv().await, Some(ChannelEvent::Open));

        client.channel.send_text("last words").expect("send");
        client.channel.close();

        assert_eq!(
            server.events.recv().await,
            Some(ChannelEvent::Message(WireMessage::Text("last words".to_string())))
        );
        assert_eq!(server.events.recv().await, Some(ChannelEvent::Closed));
    }
}
