// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::errors::{Error, Result};
use log::debug;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpStream, UdpSocket, lookup_host};
use tokio::time::{Duration, Instant, sleep, timeout};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

const DEFAULT_HOST: &str = "localhost";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
    Udp,
    Udp4,
    Udp6,
}

impl Network {
    pub fn is_udp(self) -> bool {
        matches!(self, Network::Udp | Network::Udp4 | Network::Udp6)
    }

    fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            Network::Tcp | Network::Udp => true,
            Network::Tcp4 | Network::Udp4 => addr.is_ipv4(),
            Network::Tcp6 | Network::Udp6 => addr.is_ipv6(),
        }
    }
}

impl std::str::FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            "udp" => Ok(Network::Udp),
            "udp4" => Ok(Network::Udp4),
            "udp6" => Ok(Network::Udp6),
            other => Err(Error::InvalidNetwork(other.to_string())),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
            Network::Udp => "udp",
            Network::Udp4 => "udp4",
            Network::Udp6 => "udp6",
        };
        write!(f, "{s}")
    }
}

/// Expand a bare port (`8080`) or a host-less address (`:8080`) to
/// `localhost:<port>`; anything else must be `host:port`.
pub fn normalize_address(address: &str) -> Result<String> {
    let invalid = |reason: &str| Error::InvalidAddress {
        address: address.to_string(),
        reason: reason.to_string(),
    };

    let address = address.trim();
    if address.is_empty() {
        return Err(invalid("empty address"));
    }

    let (host, port) = match address.rsplit_once(':') {
        None => (DEFAULT_HOST, address),
        Some(("", port)) => (DEFAULT_HOST, port),
        Some((host, port)) => (host, port),
    };
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        return Err(invalid("IPv6 hosts must be written in brackets, e.g. [::1]:8080"));
    }
    port.parse::<u16>()
        .map_err(|_| invalid("port must be a number between 0 and 65535"))?;

    Ok(format!("{host}:{port}"))
}

/// Polls an address until something accepts a connection on it.
#[derive(Debug, Clone, Copy)]
pub struct PortWaiter {
    interval: Duration,
}

impl Default for PortWaiter {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl PortWaiter {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Retry connecting to `address` over `network` until one attempt succeeds
    /// or `wait` elapses. The probe connection is closed without sending data.
    ///
    /// A UDP endpoint has no handshake, so a UDP probe sends one empty
    /// datagram and counts the absence of a port-unreachable reply within the
    /// poll interval as readiness.
    pub async fn wait(&self, network: &str, address: &str, wait: Duration) -> Result<()> {
        let network: Network = network.parse()?;
        let target = normalize_address(address)?;
        let started = Instant::now();
        let deadline = started + wait;
        let mut last_error: Option<io::Error> = None;
        let mut attempts: u32 = 0;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            attempts += 1;
            match timeout(remaining, probe(network, &target, self.interval)).await {
                Ok(Ok(addr)) => {
                    debug!(
                        "{network} {target} accepted a connection on {addr} after {attempts} attempt(s)"
                    );
                    return Ok(());
                }
                Ok(Err(e)) => {
                    debug!("{network} {target} not ready (attempt {attempts}): {e}");
                    last_error = Some(e);
                }
                Err(_) => {
                    // Keep the last real refusal over the cut-short attempt.
                    last_error = last_error.or_else(|| {
                        Some(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "connection attempt did not complete before the deadline",
                        ))
                    });
                    break;
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            sleep(self.interval.min(remaining)).await;
        }

        Err(Error::ReadinessTimeout {
            network: network.to_string(),
            address: target,
            elapsed: started.elapsed(),
            last_error,
        })
    }
}

async fn probe(network: Network, target: &str, udp_wait: Duration) -> io::Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = lookup_host(target)
        .await?
        .filter(|addr| network.accepts(addr))
        .collect();

    let mut last_error = None;
    for addr in addrs {
        let attempt = if network.is_udp() {
            probe_udp(addr, udp_wait).await
        } else {
            TcpStream::connect(addr).await.map(drop)
        };
        match attempt {
            Ok(()) => return Ok(addr),
            Err(e) => last_error = Some(e),
        }
    }

    Err(last_error.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{target} has no {network} address"),
        )
    }))
}

async fn probe_udp(addr: SocketAddr, wait: Duration) -> io::Result<()> {
    let local = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(addr).await?;
    socket.send(&[]).await?;

    let mut buf = [0u8; 1];
    match timeout(wait, socket.recv(&mut buf)).await {
        Ok(Err(e)) => Err(e),
        Ok(Ok(_)) | Err(_) => Ok(()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn closed_tcp_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address("8080").unwrap(), "localhost:8080");
        assert_eq!(normalize_address(":9999").unwrap(), "localhost:9999");
        assert_eq!(normalize_address("127.0.0.1:80").unwrap(), "127.0.0.1:80");
        assert_eq!(normalize_address("[::1]:443").unwrap(), "[::1]:443");
        assert_eq!(normalize_address(" 8080 ").unwrap(), "localhost:8080");
    }

    #[test]
    fn test_normalize_address_rejects_garbage() {
        for bad in ["", "http", "localhost:", "host:99999", "host:port", "::1:80", "::1", "fe80::1:443"] {
            assert!(
                matches!(normalize_address(bad), Err(Error::InvalidAddress { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_network_parse() {
        assert_eq!("tcp".parse::<Network>().unwrap(), Network::Tcp);
        assert_eq!("udp6".parse::<Network>().unwrap(), Network::Udp6);
        assert!(Network::Udp4.is_udp());
        assert!(!Network::Tcp.is_udp());
        assert!(matches!(
            "unix".parse::<Network>(),
            Err(Error::InvalidNetwork(n)) if n == "unix"
        ));
    }

    #[tokio::test]
    async fn test_wait_succeeds_on_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let waiter = PortWaiter::default();
        waiter
            .wait("tcp", &addr.to_string(), Duration::from_secs(2))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_listener_that_appears_later() {
        let port = closed_tcp_port().await;
        let server = tokio::spawn(async move {
            sleep(Duration::from_millis(200)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            let _ = listener.accept().await;
        });

        let waiter = PortWaiter::new(Duration::from_millis(20));
        let started = Instant::now();
        waiter
            .wait("tcp4", &format!("127.0.0.1:{port}"), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(150));
        server.abort();
    }

    #[tokio::test]
    async fn test_wait_times_out_with_last_error() {
        let port = closed_tcp_port().await;
        let waiter = PortWaiter::new(Duration::from_millis(20));

        let started = Instant::now();
        let err = waiter
            .wait("tcp", &format!("127.0.0.1:{port}"), Duration::from_millis(200))
            .await
            .unwrap_err();
        let took = started.elapsed();

        match err {
            Error::ReadinessTimeout {
                network,
                elapsed,
                last_error,
                ..
            } => {
                assert_eq!(network, "tcp");
                assert!(elapsed >= Duration::from_millis(200));
                let last_error = last_error.expect("last connection error should be kept");
                assert_eq!(last_error.kind(), io::ErrorKind::ConnectionRefused);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(took < Duration::from_secs(1), "took {took:?}");
    }

    #[tokio::test]
    async fn test_wait_rejects_bad_network() {
        let err = PortWaiter::default()
            .wait("sctp", "8080", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidNetwork(_)));
    }

    #[tokio::test]
    async fn test_wait_rejects_unbracketed_ipv6() {
        let started = Instant::now();
        let err = PortWaiter::default()
            .wait("tcp6", "::1:80", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAddress { .. }), "{err}");
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_family_filter_without_match() {
        let err = PortWaiter::new(Duration::from_millis(10))
            .wait("tcp6", "127.0.0.1:1", Duration::from_millis(50))
            .await
            .unwrap_err();
        match err {
            Error::ReadinessTimeout { last_error, .. } => {
                assert_eq!(last_error.unwrap().kind(), io::ErrorKind::AddrNotAvailable);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_udp_bound_socket_is_ready() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        PortWaiter::new(Duration::from_millis(20))
            .wait("udp", &addr.to_string(), Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_udp_closed_port_is_not_ready() {
        let port = {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            socket.local_addr().unwrap().port()
        };
        let err = PortWaiter::new(Duration::from_millis(50))
            .wait("udp4", &format!("127.0.0.1:{port}"), Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReadinessTimeout { .. }));
    }
}
