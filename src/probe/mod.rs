//! Probe module for server liveness checks.
//!
//! Supports STUN, TURN, NTP, and MQTT probes. Each probe performs the
//! smallest handshake that proves the server speaks its protocol, bounded
//! by a single timeout and never retried. A TURN server that challenges
//! for credentials gets one authenticated Allocate inside that timeout.

mod mqtt;
mod ntp;
mod stun;
mod turn;

pub use mqtt::*;
pub use ntp::*;
pub use stun::*;
pub use turn::*;

use crate::uptime::{Credentials, FailureReason, ProbeResult, ServerId, ServerKind};

use chrono::Utc;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::UdpSocket;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ProbeError {
    /// The failure category recorded against the server.
    pub fn reason(&self) -> FailureReason {
        match self {
            ProbeError::Timeout(_) => FailureReason::Timeout,
            ProbeError::ConnectionRefused(_) => FailureReason::ConnectionRefused,
            ProbeError::MalformedResponse(_) => FailureReason::MalformedResponse,
            ProbeError::Protocol(_) => FailureReason::ProtocolError,
        }
    }

    pub(crate) fn from_io(err: io::Error, timeout: Duration) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ProbeError::Timeout(timeout),
            io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData => {
                ProbeError::MalformedResponse(err.to_string())
            }
            // Unreachable hosts and resets are as good as a refusal here.
            _ => ProbeError::ConnectionRefused(err.to_string()),
        }
    }
}

/// Something that can check one server. The worker loop is generic over this.
pub trait Prober: Send + Sync {
    /// `credentials` are only used by protocols that authenticate.
    fn probe(
        &self,
        server: &ServerId,
        credentials: Option<&Credentials>,
    ) -> impl Future<Output = ProbeResult> + Send;
}

/// Probes real servers over the network.
#[derive(Debug, Clone)]
pub struct NetworkProber {
    timeout: Duration,
}

impl NetworkProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Prober for NetworkProber {
    async fn probe(&self, server: &ServerId, credentials: Option<&Credentials>) -> ProbeResult {
        let checked_at = Utc::now();
        match run_probe(server, credentials, self.timeout).await {
            Ok(latency_ms) => {
                tracing::debug!("Probe: {} up in {:.1} ms", server, latency_ms);
                ProbeResult::success(server.clone(), latency_ms, checked_at)
            }
            Err(e) => {
                tracing::debug!("Probe: {} failed: {}", server, e);
                ProbeResult::failure(server.clone(), e.reason(), checked_at)
            }
        }
    }
}

/// Run the probe matching the server's kind.
///
/// Returns round-trip latency in milliseconds on success.
pub async fn run_probe(
    server: &ServerId,
    credentials: Option<&Credentials>,
    timeout: Duration,
) -> Result<f64, ProbeError> {
    let check = async {
        let addr = resolve_address(&server.host, server.port, timeout).await?;
        match server.kind {
            ServerKind::Stun => run_stun_probe(addr, timeout).await,
            ServerKind::Turn => run_turn_probe(addr, credentials, timeout).await,
            ServerKind::Ntp => run_ntp_probe(addr, timeout).await,
            ServerKind::Mqtt => run_mqtt_probe(addr, timeout).await,
        }
    };

    let latency = tokio::time::timeout(timeout, check)
        .await
        .map_err(|_| ProbeError::Timeout(timeout))??;

    // Enforce timeout check
    if latency >= timeout.as_secs_f64() * 1000.0 {
        return Err(ProbeError::Timeout(timeout));
    }

    Ok(latency)
}

/// Resolve a host name (or literal address) to the first socket address.
async fn resolve_address(host: &str, port: u16, timeout: Duration) -> Result<SocketAddr, ProbeError> {
    let trimmed = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = trimmed.parse() {
        return Ok(SocketAddr::new(ip, port));
    }

    let mut addrs = tokio::net::lookup_host((trimmed, port))
        .await
        .map_err(|e| ProbeError::from_io(e, timeout))?;

    addrs
        .next()
        .ok_or_else(|| ProbeError::ConnectionRefused(format!("no addresses found for {}", host)))
}

/// Verdict of a UDP reply check.
pub(crate) enum Reply<T = ()> {
    /// Not an answer to our request; keep listening.
    Ignore,
    Done(Result<T, ProbeError>),
}

/// Bind an ephemeral socket of the right family and connect it to `addr`.
pub(crate) async fn connect_udp(addr: SocketAddr, timeout: Duration) -> Result<UdpSocket, ProbeError> {
    let bind: SocketAddr = if addr.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let socket = UdpSocket::bind(bind)
        .await
        .map_err(|e| ProbeError::from_io(e, timeout))?;
    socket
        .connect(addr)
        .await
        .map_err(|e| ProbeError::from_io(e, timeout))?;
    Ok(socket)
}

/// Send one datagram on a connected socket and wait for the reply `check`
/// accepts.
///
/// Returns the time from send to the accepted reply along with what `check`
/// made of it. The caller bounds the whole exchange with a timeout.
pub(crate) async fn udp_request<T, F>(
    socket: &UdpSocket,
    request: &[u8],
    timeout: Duration,
    mut check: F,
) -> Result<(Duration, T), ProbeError>
where
    F: FnMut(&[u8]) -> Reply<T>,
{
    let start = Instant::now();
    socket
        .send(request)
        .await
        .map_err(|e| ProbeError::from_io(e, timeout))?;

    let mut buf = [0u8; 1500];
    loop {
        let n = socket
            .recv(&mut buf)
            .await
            .map_err(|e| ProbeError::from_io(e, timeout))?;
        let elapsed = start.elapsed();

        match check(&buf[..n]) {
            Reply::Ignore => continue,
            Reply::Done(result) => return result.map(|value| (elapsed, value)),
        }
    }
}

/// One request, one accepted reply, on a fresh socket.
pub(crate) async fn udp_exchange<F>(
    addr: SocketAddr,
    request: &[u8],
    timeout: Duration,
    check: F,
) -> Result<Duration, ProbeError>
where
    F: FnMut(&[u8]) -> Reply,
{
    let socket = connect_udp(addr, timeout).await?;
    let (elapsed, ()) = udp_request(&socket, request, timeout, check).await?;
    Ok(elapsed)
}

fn millis(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64() * 1000.0
}
