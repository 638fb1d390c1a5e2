//! Reliability scoring.
//!
//! A score lies in `[0, 1]` and is the product of four factors:
//!
//! - the success ratio `successes / attempts`;
//! - an uptime factor `0.5 + 0.5 * uptime / max_uptime`, which drops to one
//!   half right after a failure and recovers as the new streak grows;
//! - a confidence factor `1 - exp(-attempts / confidence_checks)` so a few
//!   lucky checks do not outrank a long clean history;
//! - a freshness factor that stays at 1 while the last attempt is younger
//!   than `fresh_for` and then halves every `half_life`, so records nobody
//!   has checked in a while decay toward unknown (0).
//!
//! Servers that have never been checked score 0.

use super::models::ServerStats;
use chrono::{DateTime, Duration, Utc};

/// Tuning knobs for [`reliability_score`].
#[derive(Debug, Clone, Copy)]
pub struct ScoreParams {
    pub confidence_checks: f64,
    pub fresh_for: Duration,
    pub half_life: Duration,
}

impl Default for ScoreParams {
    fn default() -> Self {
        Self {
            confidence_checks: 50.0,
            fresh_for: Duration::hours(3),
            half_life: Duration::hours(24),
        }
    }
}

/// Compute the reliability score of a server as seen at `now`.
pub fn reliability_score(stats: &ServerStats, now: DateTime<Utc>, params: &ScoreParams) -> f64 {
    if stats.attempts == 0 {
        return 0.0;
    }

    let attempts = stats.attempts as f64;
    let success_ratio = (stats.successes.min(stats.attempts) as f64) / attempts;

    let uptime_ratio = if stats.max_uptime_secs > 0 {
        (stats.uptime_secs as f64 / stats.max_uptime_secs as f64).clamp(0.0, 1.0)
    } else {
        0.0
    };

    let confidence = if params.confidence_checks > 0.0 {
        1.0 - (-attempts / params.confidence_checks).exp()
    } else {
        1.0
    };

    let freshness = match stats.last_attempt {
        Some(last) => freshness(now - last, params),
        None => 0.0,
    };

    let score = success_ratio * (0.5 * uptime_ratio + 0.5) * confidence * freshness;
    if score.is_finite() {
        score.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn freshness(age: Duration, params: &ScoreParams) -> f64 {
    let overdue = age - params.fresh_for;
    if overdue <= Duration::zero() {
        return 1.0;
    }

    let half_life = params.half_life.num_seconds();
    if half_life <= 0 {
        return 0.0;
    }

    0.5f64.powf(overdue.num_seconds() as f64 / half_life as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn stats(attempts: u64, successes: u64, uptime: u64, max_uptime: u64) -> ServerStats {
        ServerStats {
            attempts,
            successes,
            uptime_secs: uptime,
            max_uptime_secs: max_uptime,
            last_attempt: Some(now()),
            ..Default::default()
        }
    }

    #[test]
    fn test_unchecked_scores_zero() {
        let params = ScoreParams::default();
        assert_eq!(reliability_score(&ServerStats::default(), now(), &params), 0.0);
    }

    #[test]
    fn test_all_failures_score_zero() {
        let params = ScoreParams::default();
        assert_eq!(reliability_score(&stats(10, 0, 0, 0), now(), &params), 0.0);
    }

    #[test]
    fn test_recent_failure_lowers_score() {
        let params = ScoreParams::default();
        let healthy = stats(100, 99, 7200, 7200);
        let just_failed = stats(100, 99, 0, 7200);
        let a = reliability_score(&healthy, now(), &params);
        let b = reliability_score(&just_failed, now(), &params);
        assert!(a > b, "{} should exceed {}", a, b);
        assert!(a <= 1.0);
    }

    #[test]
    fn test_more_history_raises_confidence() {
        let params = ScoreParams::default();
        let few = reliability_score(&stats(2, 2, 3600, 3600), now(), &params);
        let many = reliability_score(&stats(200, 200, 3600, 3600), now(), &params);
        assert!(many > few);
    }

    #[test]
    fn test_stale_records_decay() {
        let params = ScoreParams::default();
        let s = stats(100, 100, 3600, 3600);
        let fresh = reliability_score(&s, now(), &params);
        let within_grace = reliability_score(&s, now() + Duration::hours(2), &params);
        let one_half_life = reliability_score(
            &s,
            now() + params.fresh_for + params.half_life,
            &params,
        );
        let ancient = reliability_score(&s, now() + Duration::days(365), &params);

        assert_eq!(fresh, within_grace);
        assert!((one_half_life - fresh / 2.0).abs() < 1e-9);
        assert!(ancient < 1e-3);
    }
}
