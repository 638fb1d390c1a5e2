//! Configuration module for dogdorm.
//!
//! Loads configuration from environment variables with sensible defaults.

use crate::distributor::DistributorConfig;
use crate::worker::WorkerConfig;

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Which halves of the system this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dealer plus in-process workers.
    All,
    Dealer,
    Worker,
}

impl Role {
    pub fn runs_dealer(&self) -> bool {
        matches!(self, Role::All | Role::Dealer)
    }

    pub fn runs_workers(&self) -> bool {
        matches!(self, Role::All | Role::Worker)
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(Role::All),
            "dealer" => Ok(Role::Dealer),
            "worker" => Ok(Role::Worker),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub role: Role,
    /// HTTP port for the dealer API (default: 8000)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "monitor.sqlite3")
    pub db_path: String,
    /// Directory holding the `<kind>_v4.csv` / `<kind>_v6.csv` server lists
    pub catalog_dir: String,
    /// Dealer base URL for workers; defaults to the local dealer
    pub dealer_url: Option<String>,
    pub worker_count: usize,
    pub batch_size: usize,
    /// Largest batch a worker may request
    pub max_batch_size: usize,
    /// Seconds between two checks of the same server
    pub monitor_frequency: u64,
    /// Seconds a worker has to report an assignment, on top of one probe
    /// timeout per assigned server
    pub assignment_deadline: u64,
    /// Seconds between database snapshots
    pub snapshot_interval: u64,
    /// Seconds a worker sleeps between cycles
    pub poll_interval: u64,
    /// Per-probe timeout in seconds
    pub probe_timeout: u64,
    /// Enables `GET /sql_export`
    pub debug_export: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            role: Role::All,
            http_port: 8000,
            db_path: "monitor.sqlite3".to_string(),
            catalog_dir: "server_lists".to_string(),
            dealer_url: None,
            worker_count: 100,
            batch_size: 10,
            max_batch_size: 100,
            monitor_frequency: 3600,
            assignment_deadline: 120,
            snapshot_interval: 60,
            poll_interval: 3600,
            probe_timeout: 5,
            debug_export: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Every field has a `DOGDORM_` variable, e.g. `DOGDORM_HTTP_PORT` or
    /// `DOGDORM_DB_PATH`. Values that fail to parse keep the default.
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(role) = parse_var(&lookup, "DOGDORM_ROLE") {
            cfg.role = role;
        }
        if let Some(port) = parse_var(&lookup, "DOGDORM_HTTP_PORT") {
            cfg.http_port = port;
        }
        if let Some(db_path) = lookup("DOGDORM_DB_PATH") {
            cfg.db_path = db_path;
        }
        if let Some(dir) = lookup("DOGDORM_CATALOG_DIR") {
            cfg.catalog_dir = dir;
        }
        if let Some(url) = lookup("DOGDORM_DEALER_URL").filter(|u| !u.trim().is_empty()) {
            cfg.dealer_url = Some(url);
        }
        if let Some(count) = parse_var(&lookup, "DOGDORM_WORKER_COUNT") {
            cfg.worker_count = count;
        }
        if let Some(max) = parse_var(&lookup, "DOGDORM_MAX_BATCH_SIZE").filter(|n: &usize| *n > 0) {
            cfg.max_batch_size = max;
        }
        if let Some(size) = parse_var(&lookup, "DOGDORM_BATCH_SIZE").filter(|n: &usize| *n > 0) {
            cfg.batch_size = size;
        }
        if let Some(secs) = parse_var(&lookup, "DOGDORM_MONITOR_FREQUENCY") {
            cfg.monitor_frequency = secs;
        }
        if let Some(secs) = parse_var(&lookup, "DOGDORM_ASSIGNMENT_DEADLINE").filter(|n: &u64| *n > 0) {
            cfg.assignment_deadline = secs;
        }
        if let Some(secs) = parse_var(&lookup, "DOGDORM_SNAPSHOT_INTERVAL").filter(|n: &u64| *n > 0) {
            cfg.snapshot_interval = secs;
        }
        if let Some(secs) = parse_var(&lookup, "DOGDORM_POLL_INTERVAL") {
            cfg.poll_interval = secs;
        }
        if let Some(secs) = parse_var(&lookup, "DOGDORM_PROBE_TIMEOUT").filter(|n: &u64| *n > 0) {
            cfg.probe_timeout = secs;
        }
        if let Some(flag) = lookup("DOGDORM_DEBUG_EXPORT").and_then(|v| parse_bool(&v)) {
            cfg.debug_export = flag;
        }

        cfg.batch_size = cfg.batch_size.min(cfg.max_batch_size);
        cfg
    }

    pub fn dealer_url(&self) -> String {
        self.dealer_url
            .clone()
            .unwrap_or_else(|| format!("http://127.0.0.1:{}", self.http_port))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout)
    }

    pub fn distributor_config(&self) -> DistributorConfig {
        DistributorConfig {
            deadline: chrono::Duration::seconds(self.assignment_deadline as i64),
            per_server: chrono::Duration::seconds(self.probe_timeout as i64),
            recheck_after: chrono::Duration::seconds(self.monitor_frequency as i64),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            batch_size: self.batch_size,
            poll_interval: Duration::from_secs(self.poll_interval),
            ..WorkerConfig::default()
        }
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|v| v.trim().parse().ok())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.role, Role::All);
        assert_eq!(cfg.http_port, 8000);
        assert_eq!(cfg.db_path, "monitor.sqlite3");
        assert_eq!(cfg.worker_count, 100);
        assert_eq!(cfg.dealer_url(), "http://127.0.0.1:8000");
        assert!(!cfg.debug_export);
    }

    #[test]
    fn test_env_overrides() {
        let cfg = from_pairs(&[
            ("DOGDORM_ROLE", "Worker"),
            ("DOGDORM_HTTP_PORT", "9000"),
            ("DOGDORM_DEALER_URL", "http://dealer:8000"),
            ("DOGDORM_BATCH_SIZE", "25"),
            ("DOGDORM_MONITOR_FREQUENCY", "0"),
            ("DOGDORM_DEBUG_EXPORT", "yes"),
        ]);
        assert_eq!(cfg.role, Role::Worker);
        assert!(!cfg.role.runs_dealer());
        assert_eq!(cfg.http_port, 9000);
        assert_eq!(cfg.dealer_url(), "http://dealer:8000");
        assert_eq!(cfg.worker_config().batch_size, 25);
        assert_eq!(cfg.distributor_config().recheck_after, chrono::Duration::zero());
        assert!(cfg.debug_export);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let cfg = from_pairs(&[
            ("DOGDORM_ROLE", "boss"),
            ("DOGDORM_HTTP_PORT", "http"),
            ("DOGDORM_BATCH_SIZE", "0"),
            ("DOGDORM_PROBE_TIMEOUT", "-3"),
            ("DOGDORM_DEBUG_EXPORT", "maybe"),
        ]);
        assert_eq!(cfg.role, Role::All);
        assert_eq!(cfg.http_port, 8000);
        assert_eq!(cfg.batch_size, 10);
        assert_eq!(cfg.probe_timeout(), Duration::from_secs(5));
        assert!(!cfg.debug_export);
    }

    #[test]
    fn test_batch_size_capped_by_max() {
        let cfg = from_pairs(&[("DOGDORM_BATCH_SIZE", "500"), ("DOGDORM_MAX_BATCH_SIZE", "50")]);
        assert_eq!(cfg.batch_size, 50);
    }

    #[test]
    fn test_large_batches_of_dead_servers_are_recorded() {
        use crate::distributor::WorkDistributor;
        use crate::uptime::{FailureReason, ProbeResult, ScoreParams, ServerId, ServerKind, UptimeStore};
        use chrono::{TimeZone, Utc};
        use std::sync::Arc;

        let cfg = from_pairs(&[("DOGDORM_BATCH_SIZE", "50")]);
        assert_eq!(cfg.batch_size, 50);

        let uptime = Arc::new(UptimeStore::new(ScoreParams::default()));
        uptime.insert_catalog(
            (0..60).map(|i| ServerId::new(ServerKind::Stun, format!("dead{:02}", i), 3478)),
        );
        let distributor = WorkDistributor::new(uptime.clone(), cfg.distributor_config());

        let mut now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        for _ in 0..2 {
            let assignment = distributor.request_batch("w", cfg.batch_size, now).unwrap();
            // Every probe runs into the full timeout before the report goes out.
            let probing = assignment.identities.len() as u64 * cfg.probe_timeout;
            let done = now + chrono::Duration::seconds(probing as i64);
            let results = assignment
                .identities
                .iter()
                .map(|id| ProbeResult::failure(id.clone(), FailureReason::Timeout, done))
                .collect();
            assert!(distributor.report(assignment.assignment_id, results, done).is_ok());
            now = done;
        }

        for record in uptime.snapshot() {
            assert_eq!(record.stats.attempts, 1, "{} never recorded", record.id);
        }
    }
}
