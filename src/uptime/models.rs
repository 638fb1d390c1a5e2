//! Core record types shared by the dealer and the workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Weight given to the newest latency sample in the rolling average.
const LATENCY_SMOOTHING: f64 = 0.3;

/// The protocols a monitored server can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    Stun,
    Turn,
    Mqtt,
    Ntp,
}

impl ServerKind {
    pub const ALL: [ServerKind; 4] = [
        ServerKind::Stun,
        ServerKind::Turn,
        ServerKind::Mqtt,
        ServerKind::Ntp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServerKind::Stun => "stun",
            ServerKind::Turn => "turn",
            ServerKind::Mqtt => "mqtt",
            ServerKind::Ntp => "ntp",
        }
    }

    /// Well-known port, used when a catalog row leaves the port blank.
    pub fn default_port(&self) -> u16 {
        match self {
            ServerKind::Stun | ServerKind::Turn => 3478,
            ServerKind::Mqtt => 1883,
            ServerKind::Ntp => 123,
        }
    }
}

impl fmt::Display for ServerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stun" => Ok(ServerKind::Stun),
            "turn" => Ok(ServerKind::Turn),
            "mqtt" => Ok(ServerKind::Mqtt),
            "ntp" => Ok(ServerKind::Ntp),
            other => Err(format!("unknown server kind: {}", other)),
        }
    }
}

/// Identity of a monitored endpoint. Never changes once a record exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerId {
    pub kind: ServerKind,
    pub host: String,
    pub port: u16,
}

impl ServerId {
    pub fn new(kind: ServerKind, host: impl Into<String>, port: u16) -> Self {
        Self {
            kind,
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.kind, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.kind, self.host, self.port)
        }
    }
}

/// Long-term credentials a catalog row carries for its server.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    /// `None` when both fields are blank.
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Option<Self> {
        let (user, password) = (user.into(), password.into());
        if user.is_empty() && password.is_empty() {
            return None;
        }
        Some(Self { user, password })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

/// Why a probe did not establish liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Timeout,
    ConnectionRefused,
    MalformedResponse,
    ProtocolError,
}

/// Outcome of one probe against one server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub server: ServerId,
    pub success: bool,
    /// Round-trip latency in milliseconds, present on success.
    #[serde(default)]
    pub latency_ms: Option<f64>,
    #[serde(default)]
    pub failure: Option<FailureReason>,
    pub checked_at: DateTime<Utc>,
}

impl ProbeResult {
    pub fn success(server: ServerId, latency_ms: f64, checked_at: DateTime<Utc>) -> Self {
        Self {
            server,
            success: true,
            latency_ms: Some(latency_ms),
            failure: None,
            checked_at,
        }
    }

    pub fn failure(server: ServerId, reason: FailureReason, checked_at: DateTime<Utc>) -> Self {
        Self {
            server,
            success: false,
            latency_ms: None,
            failure: Some(reason),
            checked_at,
        }
    }
}

/// Aggregate reliability statistics for one server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerStats {
    pub attempts: u64,
    pub successes: u64,
    pub last_latency_ms: Option<f64>,
    /// Exponentially weighted latency over successful checks.
    pub avg_latency_ms: Option<f64>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
    /// Length of the current run of successful checks, in seconds.
    pub uptime_secs: u64,
    /// Longest run of successful checks ever seen, in seconds.
    pub max_uptime_secs: u64,
    /// When the current run was last extended.
    pub last_uptime: Option<DateTime<Utc>>,
}

impl ServerStats {
    pub fn failures(&self) -> u64 {
        self.attempts.saturating_sub(self.successes)
    }
}

/// One monitored endpoint and everything known about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: ServerId,
    pub stats: ServerStats,
}

impl ServerRecord {
    pub fn new(id: ServerId) -> Self {
        Self {
            id,
            stats: ServerStats::default(),
        }
    }

    /// Fold a probe result into the statistics.
    ///
    /// Returns `false` without touching anything when the result is not newer
    /// than the last attempt already recorded.
    pub fn apply(&mut self, result: &ProbeResult) -> bool {
        let at = result.checked_at;
        if let Some(last) = self.stats.last_attempt {
            if at <= last {
                return false;
            }
        }

        let stats = &mut self.stats;
        if result.success {
            let extended = stats
                .last_uptime
                .map(|prev| (at - prev).num_seconds().max(0) as u64)
                .unwrap_or(0);
            stats.uptime_secs += extended;
            stats.max_uptime_secs = stats.max_uptime_secs.max(stats.uptime_secs);
            stats.last_uptime = Some(at);
            stats.last_success = Some(at);
            stats.successes += 1;

            if let Some(latency) = result.latency_ms.filter(|l| l.is_finite() && *l >= 0.0) {
                stats.last_latency_ms = Some(latency);
                stats.avg_latency_ms = Some(match stats.avg_latency_ms {
                    Some(avg) => avg + LATENCY_SMOOTHING * (latency - avg),
                    None => latency,
                });
            }
        } else {
            stats.uptime_secs = 0;
            stats.last_uptime = None;
        }

        stats.attempts += 1;
        stats.last_attempt = Some(at);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    #[test]
    fn test_credentials_hide_password() {
        assert_eq!(Credentials::new("", ""), None);
        let creds = Credentials::new("alice", "hunter2").unwrap();
        let debug = format!("{:?}", creds);
        assert!(debug.contains("alice"));
        assert!(!debug.contains("hunter2"));
        assert!(Credentials::new("", "only-password").is_some());
    }

    fn stun() -> ServerId {
        ServerId::new(ServerKind::Stun, "stun.example.net", 3478)
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("STUN".parse::<ServerKind>().unwrap(), ServerKind::Stun);
        assert_eq!(" ntp ".parse::<ServerKind>().unwrap(), ServerKind::Ntp);
        assert!("pnp".parse::<ServerKind>().is_err());
    }

    #[test]
    fn test_server_id_display() {
        assert_eq!(stun().to_string(), "stun://stun.example.net:3478");
        let v6 = ServerId::new(ServerKind::Ntp, "2001:db8::1", 123);
        assert_eq!(v6.to_string(), "ntp://[2001:db8::1]:123");
    }

    #[test]
    fn test_apply_tracks_uptime_streaks() {
        let mut record = ServerRecord::new(stun());

        assert!(record.apply(&ProbeResult::success(stun(), 40.0, at(0))));
        assert!(record.apply(&ProbeResult::success(stun(), 20.0, at(3600))));
        assert_eq!(record.stats.uptime_secs, 3600);
        assert_eq!(record.stats.max_uptime_secs, 3600);
        assert_eq!(record.stats.last_latency_ms, Some(20.0));
        assert!((record.stats.avg_latency_ms.unwrap() - 34.0).abs() < 1e-9);

        assert!(record.apply(&ProbeResult::failure(stun(), FailureReason::Timeout, at(7200))));
        assert_eq!(record.stats.uptime_secs, 0);
        assert_eq!(record.stats.max_uptime_secs, 3600);
        assert_eq!(record.stats.attempts, 3);
        assert_eq!(record.stats.successes, 2);
        assert_eq!(record.stats.failures(), 1);
        assert_eq!(record.stats.last_success, Some(at(3600)));
        assert_eq!(record.stats.last_attempt, Some(at(7200)));

        // A new streak starts counting from the first success after the failure.
        assert!(record.apply(&ProbeResult::success(stun(), 20.0, at(10800))));
        assert_eq!(record.stats.uptime_secs, 0);
    }

    #[test]
    fn test_apply_discards_stale_results() {
        let mut record = ServerRecord::new(stun());
        assert!(record.apply(&ProbeResult::success(stun(), 40.0, at(100))));
        let before = record.clone();

        assert!(!record.apply(&ProbeResult::failure(stun(), FailureReason::Timeout, at(50))));
        assert!(!record.apply(&ProbeResult::success(stun(), 10.0, at(100))));
        assert_eq!(record, before);
    }

    #[test]
    fn test_probe_result_json_shape() {
        let result = ProbeResult::failure(stun(), FailureReason::ConnectionRefused, at(0));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["server"]["kind"], "stun");
        assert_eq!(json["failure"], "connection_refused");
        assert_eq!(json["success"], false);
    }
}
