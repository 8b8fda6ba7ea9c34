//! Per-(capability, provider, model) health state.
//!
//! Consecutive failures mark a candidate unhealthy; quota errors start a
//! cooldown window. The [`crate::pool::ModelPool`] consults this tracker
//! when rotating candidates.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use regex::Regex;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// True when the status/body indicate a quota or rate-limit condition.
pub fn is_quota_error(status: Option<u16>, body: &str) -> bool {
    if status == Some(429) {
        return true;
    }
    static QUOTA_RE: OnceLock<Regex> = OnceLock::new();
    let re = QUOTA_RE.get_or_init(|| {
        Regex::new(r"(?i)quota|rate.?limit|resource.?exhausted|too many requests|billing")
            .expect("static regex")
    });
    re.is_match(body)
}

/// Extract a cooldown from a provider message. Honors a `retry-after: N`
/// (seconds) hint when present; otherwise [`DEFAULT_COOLDOWN`].
pub fn parse_cooldown_duration(message: &str) -> Duration {
    static RETRY_RE: OnceLock<Regex> = OnceLock::new();
    let re = RETRY_RE.get_or_init(|| {
        Regex::new(r"(?i)retry[-_ ]after[:=]?\s*(\d+)").expect("static regex")
    });
    if let Some(caps) = re.captures(message) {
        if let Ok(secs) = caps[1].parse::<u64>() {
            return Duration::from_secs(secs.max(1));
        }
    }
    DEFAULT_COOLDOWN
}

#[derive(Debug, Clone, Default)]
struct HealthState {
    failure_count: u32,
    last_failure: Option<DateTime<Utc>>,
    cooldown_until: Option<DateTime<Utc>>,
}

type Key = (String, String, String);

pub struct HealthTracker {
    failure_threshold: u32,
    states: RwLock<HashMap<Key, HealthState>>,
}

impl HealthTracker {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            states: RwLock::new(HashMap::new()),
        }
    }

    fn key(capability: &str, provider_id: &str, model: &str) -> Key {
        (
            capability.to_owned(),
            provider_id.to_owned(),
            model.to_owned(),
        )
    }

    /// A success resets failures and clears any cooldown.
    pub fn mark_healthy(&self, capability: &str, provider_id: &str, model: &str) {
        let mut states = self.states.write();
        states.remove(&Self::key(capability, provider_id, model));
    }

    /// Record a failure. Quota conditions additionally start a cooldown
    /// derived from the reason (Retry-After hint or the 60 s default).
    pub fn mark_unhealthy(
        &self,
        capability: &str,
        provider_id: &str,
        model: &str,
        reason: &str,
        status: Option<u16>,
    ) {
        let now = Utc::now();
        let mut states = self.states.write();
        let state = states
            .entry(Self::key(capability, provider_id, model))
            .or_default();
        state.failure_count += 1;
        state.last_failure = Some(now);

        if is_quota_error(status, reason) {
            let cooldown = parse_cooldown_duration(reason);
            let until = now + chrono::Duration::from_std(cooldown).unwrap_or_default();
            state.cooldown_until = Some(until);
            tracing::warn!(
                capability,
                provider_id,
                model,
                cooldown_secs = cooldown.as_secs(),
                "model entered quota cooldown"
            );
        }
    }

    /// Healthy = cooldown (if any) has passed and consecutive failures are
    /// under the threshold.
    pub fn is_provider_healthy(&self, capability: &str, provider_id: &str, model: &str) -> bool {
        let states = self.states.read();
        let Some(state) = states.get(&Self::key(capability, provider_id, model)) else {
            return true;
        };
        if let Some(until) = state.cooldown_until {
            if until > Utc::now() {
                return false;
            }
        }
        state.failure_count < self.failure_threshold
    }

    /// Current consecutive-failure count (diagnostics).
    pub fn failure_count(&self, capability: &str, provider_id: &str, model: &str) -> u32 {
        self.states
            .read()
            .get(&Self::key(capability, provider_id, model))
            .map(|s| s.failure_count)
            .unwrap_or(0)
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_detection() {
        assert!(is_quota_error(Some(429), ""));
        assert!(is_quota_error(None, "monthly quota exceeded"));
        assert!(is_quota_error(Some(500), "Rate limit reached for model"));
        assert!(is_quota_error(None, "RESOURCE_EXHAUSTED"));
        assert!(!is_quota_error(Some(500), "internal server error"));
        assert!(!is_quota_error(None, "connection reset"));
    }

    #[test]
    fn cooldown_parsing() {
        assert_eq!(parse_cooldown_duration("retry-after: 30"), Duration::from_secs(30));
        assert_eq!(parse_cooldown_duration("Retry-After=120"), Duration::from_secs(120));
        assert_eq!(parse_cooldown_duration("no hint here"), DEFAULT_COOLDOWN);
        // Zero is clamped to something positive.
        assert_eq!(parse_cooldown_duration("retry-after: 0"), Duration::from_secs(1));
    }

    #[test]
    fn failures_accumulate_until_threshold() {
        let tracker = HealthTracker::new(3);
        assert!(tracker.is_provider_healthy("router", "gw", "m1"));
        tracker.mark_unhealthy("router", "gw", "m1", "boom", Some(500));
        tracker.mark_unhealthy("router", "gw", "m1", "boom", Some(500));
        assert!(tracker.is_provider_healthy("router", "gw", "m1"));
        tracker.mark_unhealthy("router", "gw", "m1", "boom", Some(500));
        assert!(!tracker.is_provider_healthy("router", "gw", "m1"));
    }

    #[test]
    fn mark_healthy_resets() {
        let tracker = HealthTracker::new(1);
        tracker.mark_unhealthy("router", "gw", "m1", "boom", Some(500));
        assert!(!tracker.is_provider_healthy("router", "gw", "m1"));
        tracker.mark_healthy("router", "gw", "m1");
        assert!(tracker.is_provider_healthy("router", "gw", "m1"));
        assert_eq!(tracker.failure_count("router", "gw", "m1"), 0);
    }

    #[test]
    fn quota_error_starts_cooldown_on_first_failure() {
        let tracker = HealthTracker::new(5);
        tracker.mark_unhealthy("router", "gw", "m1", "quota exceeded", Some(429));
        // Below failure threshold but cooling down.
        assert!(!tracker.is_provider_healthy("router", "gw", "m1"));
    }

    #[test]
    fn keys_are_scoped_per_capability() {
        let tracker = HealthTracker::new(1);
        tracker.mark_unhealthy("router", "gw", "m1", "boom", Some(500));
        assert!(!tracker.is_provider_healthy("router", "gw", "m1"));
        assert!(tracker.is_provider_healthy("extractor", "gw", "m1"));
    }
}
