//! Tier usage limits backed by windowed cache counters.
//!
//! Messages count per billing period (calendar month, or the billing-cycle
//! anchor for paid tiers); file uploads and image generations count per
//! UTC day; anonymous guests count per IP per day. Counter TTLs extend 24
//! hours past the reset so a slow clock never loses a window. Cache
//! failures fail open.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use cortex_cache::SharedCache;
use cortex_domain::config::{LimitsConfig, TierLimits};
use cortex_domain::error::{Error, LimitExceeded, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tier service contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// External subscription lookup. The production deployment calls the
/// user/tier service; [`StaticTierService`] serves the single binary.
#[async_trait::async_trait]
pub trait TierService: Send + Sync {
    async fn tier_for(&self, user_id: &str) -> String;
    /// Day-of-month the billing cycle starts on, for paid tiers.
    async fn billing_anchor_day(&self, user_id: &str) -> Option<u32>;
}

pub struct StaticTierService {
    default_tier: String,
    overrides: HashMap<String, String>,
}

impl StaticTierService {
    pub fn new(default_tier: impl Into<String>) -> Self {
        Self {
            default_tier: default_tier.into(),
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, user_id: impl Into<String>, tier: impl Into<String>) -> Self {
        self.overrides.insert(user_id.into(), tier.into());
        self
    }
}

#[async_trait::async_trait]
impl TierService for StaticTierService {
    async fn tier_for(&self, user_id: &str) -> String {
        self.overrides
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| self.default_tier.clone())
    }

    async fn billing_anchor_day(&self, _user_id: &str) -> Option<u32> {
        None
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Period windows
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Anchor a day-of-month within a (year, month), clamping to month length.
fn clamped_date(year: i32, month: u32, day: u32) -> NaiveDate {
    let mut d = day;
    loop {
        if let Some(date) = NaiveDate::from_ymd_opt(year, month, d) {
            return date;
        }
        d -= 1;
    }
}

/// Calendar-month window: key `YYYY-MM`, reset at the first of next month.
pub fn month_period(now: DateTime<Utc>) -> (String, DateTime<Utc>) {
    let key = now.format("%Y-%m").to_string();
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    let reset = Utc
        .with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .expect("first of month is always valid");
    (key, reset)
}

/// Billing-cycle window anchored on `anchor_day`: key is the cycle start
/// date, reset at the next cycle start.
pub fn billing_period(now: DateTime<Utc>, anchor_day: u32) -> (String, DateTime<Utc>) {
    let today = now.date_naive();
    let this_month_anchor = clamped_date(today.year(), today.month(), anchor_day);
    let start = if this_month_anchor <= today {
        this_month_anchor
    } else if today.month() == 1 {
        clamped_date(today.year() - 1, 12, anchor_day)
    } else {
        clamped_date(today.year(), today.month() - 1, anchor_day)
    };
    let next = if start.month() == 12 {
        clamped_date(start.year() + 1, 1, anchor_day)
    } else {
        clamped_date(start.year(), start.month() + 1, anchor_day)
    };
    let reset = Utc
        .from_local_datetime(&next.and_hms_opt(0, 0, 0).expect("midnight is valid"))
        .single()
        .expect("UTC has no gaps");
    (start.format("%Y-%m-%d").to_string(), reset)
}

/// UTC-day window: key `YYYY-MM-DD`, reset at next midnight.
pub fn day_period(now: DateTime<Utc>) -> (String, DateTime<Utc>) {
    let key = now.format("%Y-%m-%d").to_string();
    let next = now.date_naive() + chrono::Duration::days(1);
    let reset = Utc
        .from_local_datetime(&next.and_hms_opt(0, 0, 0).expect("midnight is valid"))
        .single()
        .expect("UTC has no gaps");
    (key, reset)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// UsageLimiter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct UsageLimiter {
    cache: Arc<dyn SharedCache>,
    tiers: Arc<dyn TierService>,
    limits: LimitsConfig,
}

impl UsageLimiter {
    pub fn new(
        cache: Arc<dyn SharedCache>,
        tiers: Arc<dyn TierService>,
        limits: LimitsConfig,
    ) -> Self {
        Self {
            cache,
            tiers,
            limits,
        }
    }

    fn tier_limits(&self, tier: &str) -> Option<TierLimits> {
        self.limits.tiers.get(tier).copied()
    }

    fn upgrade_target(&self, tier: &str) -> Option<String> {
        // Suggest the cheapest tier with a strictly higher message cap.
        let current = self.tier_limits(tier)?.monthly_messages;
        self.limits
            .tiers
            .iter()
            .filter(|(_, l)| l.monthly_messages > current)
            .min_by_key(|(_, l)| l.monthly_messages)
            .map(|(name, _)| name.clone())
    }

    /// Core check: read, reject at the cap, otherwise increment and push
    /// the TTL past the reset. Any cache failure allows the request.
    async fn check_and_increment(
        &self,
        key: &str,
        limit: u64,
        reset_at: DateTime<Utc>,
        error_code: &str,
        upgrade_to: Option<String>,
    ) -> Result<()> {
        let used = match self.cache.get(key).await {
            Ok(Some(raw)) => raw.parse::<u64>().unwrap_or(0),
            Ok(None) => 0,
            Err(e) => {
                tracing::warn!(key, error = %e, "usage counter read failed, allowing request");
                return Ok(());
            }
        };
        if used >= limit {
            return Err(Error::LimitExceeded(LimitExceeded {
                error_code: error_code.to_owned(),
                limit,
                used,
                reset_at,
                upgrade_to,
            }));
        }

        if let Err(e) = self.cache.incr(key, 1).await {
            tracing::warn!(key, error = %e, "usage counter increment failed");
            return Ok(());
        }
        let ttl = (reset_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
            + Duration::from_secs(24 * 60 * 60);
        if let Err(e) = self.cache.expire(key, ttl).await {
            tracing::warn!(key, error = %e, "usage counter ttl refresh failed");
        }
        Ok(())
    }

    /// One user message against the monthly (or billing-cycle) cap.
    pub async fn check_message(&self, user_id: &str) -> Result<()> {
        let tier = self.tiers.tier_for(user_id).await;
        let Some(limits) = self.tier_limits(&tier) else {
            return Ok(());
        };
        let now = Utc::now();
        let (period_key, reset_at) = if limits.billing_cycle {
            match self.tiers.billing_anchor_day(user_id).await {
                Some(day) => billing_period(now, day),
                None => month_period(now),
            }
        } else {
            month_period(now)
        };
        let key = format!("messages:{user_id}:{period_key}");
        self.check_and_increment(
            &key,
            limits.monthly_messages,
            reset_at,
            "monthly_messages_exceeded",
            self.upgrade_target(&tier),
        )
        .await
    }

    pub async fn check_file_upload(&self, user_id: &str) -> Result<()> {
        let tier = self.tiers.tier_for(user_id).await;
        let Some(limits) = self.tier_limits(&tier) else {
            return Ok(());
        };
        let (date, reset_at) = day_period(Utc::now());
        let key = format!("file_uploads:{user_id}:{date}");
        self.check_and_increment(
            &key,
            limits.daily_file_uploads,
            reset_at,
            "daily_file_uploads_exceeded",
            self.upgrade_target(&tier),
        )
        .await
    }

    pub async fn check_image_generation(&self, user_id: &str) -> Result<()> {
        let tier = self.tiers.tier_for(user_id).await;
        let Some(limits) = self.tier_limits(&tier) else {
            return Ok(());
        };
        let (date, reset_at) = day_period(Utc::now());
        let key = format!("image_gens:{user_id}:{date}");
        self.check_and_increment(
            &key,
            limits.daily_image_generations,
            reset_at,
            "daily_image_generations_exceeded",
            self.upgrade_target(&tier),
        )
        .await
    }

    /// Anonymous guests are capped per IP per UTC day.
    pub async fn check_anonymous(&self, ip: &str) -> Result<()> {
        let (date, reset_at) = day_period(Utc::now());
        let key = format!("anon_messages:{ip}:{date}");
        self.check_and_increment(
            &key,
            self.limits.anon_daily_messages,
            reset_at,
            "anonymous_messages_exceeded",
            None,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortex_cache::MemoryCache;

    fn limiter(cache: Arc<MemoryCache>) -> UsageLimiter {
        let mut limits = LimitsConfig::default();
        limits
            .tiers
            .get_mut("free")
            .expect("free tier configured")
            .monthly_messages = 3;
        limits.anon_daily_messages = 2;
        UsageLimiter::new(cache, Arc::new(StaticTierService::new("free")), limits)
    }

    #[tokio::test]
    async fn messages_reject_at_cap_with_payload() {
        let cache = Arc::new(MemoryCache::new());
        let lim = limiter(cache);
        for _ in 0..3 {
            lim.check_message("u1").await.unwrap();
        }
        let err = lim.check_message("u1").await.unwrap_err();
        match err {
            Error::LimitExceeded(payload) => {
                assert_eq!(payload.error_code, "monthly_messages_exceeded");
                assert_eq!(payload.limit, 3);
                assert_eq!(payload.used, 3);
                assert_eq!(payload.upgrade_to.as_deref(), Some("pro"));
                assert!(payload.reset_at > Utc::now());
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn users_count_independently() {
        let cache = Arc::new(MemoryCache::new());
        let lim = limiter(cache);
        for _ in 0..3 {
            lim.check_message("u1").await.unwrap();
        }
        lim.check_message("u2").await.unwrap();
    }

    #[tokio::test]
    async fn anonymous_cap_per_ip() {
        let cache = Arc::new(MemoryCache::new());
        let lim = limiter(cache);
        lim.check_anonymous("10.0.0.1").await.unwrap();
        lim.check_anonymous("10.0.0.1").await.unwrap();
        assert!(lim.check_anonymous("10.0.0.1").await.is_err());
        lim.check_anonymous("10.0.0.2").await.unwrap();
    }

    #[tokio::test]
    async fn unknown_tier_is_unlimited() {
        let cache = Arc::new(MemoryCache::new());
        let mut limits = LimitsConfig::default();
        limits.tiers.clear();
        let lim = UsageLimiter::new(cache, Arc::new(StaticTierService::new("vip")), limits);
        for _ in 0..50 {
            lim.check_message("u1").await.unwrap();
        }
    }

    #[test]
    fn month_period_key_and_reset() {
        let now = Utc.with_ymd_and_hms(2026, 12, 15, 10, 0, 0).unwrap();
        let (key, reset) = month_period(now);
        assert_eq!(key, "2026-12");
        assert_eq!(reset, Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn billing_period_anchors_mid_month() {
        let now = Utc.with_ymd_and_hms(2026, 8, 10, 10, 0, 0).unwrap();
        let (key, reset) = billing_period(now, 15);
        // Anchor not yet reached this month: cycle started July 15.
        assert_eq!(key, "2026-07-15");
        assert_eq!(reset, Utc.with_ymd_and_hms(2026, 8, 15, 0, 0, 0).unwrap());

        let later = Utc.with_ymd_and_hms(2026, 8, 20, 10, 0, 0).unwrap();
        let (key, _) = billing_period(later, 15);
        assert_eq!(key, "2026-08-15");
    }

    #[test]
    fn billing_period_clamps_short_months() {
        let now = Utc.with_ymd_and_hms(2026, 2, 27, 10, 0, 0).unwrap();
        let (key, reset) = billing_period(now, 31);
        assert_eq!(key, "2026-01-31");
        // February 2026 clamps the anchor to the 28th.
        assert_eq!(reset, Utc.with_ymd_and_hms(2026, 2, 28, 0, 0, 0).unwrap());
    }

    #[test]
    fn day_period_rolls_at_midnight() {
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 23, 59, 0).unwrap();
        let (key, reset) = day_period(now);
        assert_eq!(key, "2026-08-01");
        assert_eq!(reset, Utc.with_ymd_and_hms(2026, 8, 2, 0, 0, 0).unwrap());
    }
}
