//! Cron-driven routine execution with distributed single-fire locking.
//!
//! Every tick, each instance evaluates due schedules. For a schedule due
//! at minute bucket `b`, an instance first takes
//! `schedule-lock:<id>:<b>` in the shared cache (TTL 5 minutes, owned by
//! its `instance_id`); losing the race means another instance is handling
//! this minute. The lock is released by compare-and-delete, never a blind
//! delete.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cortex_cache::SharedCache;
use cortex_domain::error::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::cron::CronSchedule;
use cortex_stores::persist;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub user_id: String,
    pub name: String,
    /// Five-field cron expression (without the timezone envelope).
    pub cron: String,
    pub timezone: String,
    /// Template merged into the routine input; `__user_id__` is injected
    /// at fire time.
    #[serde(default)]
    pub input_template: Value,
    pub enabled: bool,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_runs: u64,
    #[serde(default)]
    pub successful_runs: u64,
    #[serde(default)]
    pub failed_runs: u64,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    pub fn new(
        user_id: impl Into<String>,
        name: impl Into<String>,
        cron: impl Into<String>,
        timezone: impl Into<String>,
    ) -> Result<Self> {
        let cron = cron.into();
        let timezone = timezone.into();
        let parsed = CronSchedule::parse(&CronSchedule::envelope(&timezone, &cron))?;
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            name: name.into(),
            cron,
            timezone,
            input_template: Value::Object(Default::default()),
            enabled: true,
            last_run_at: None,
            next_run_at: parsed.next_after(&now),
            total_runs: 0,
            successful_runs: 0,
            failed_runs: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn cron_schedule(&self) -> Result<CronSchedule> {
        CronSchedule::parse(&CronSchedule::envelope(&self.timezone, &self.cron))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub schedule_id: Uuid,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default, Serialize, Deserialize)]
struct ScheduleState {
    schedules: HashMap<Uuid, Schedule>,
    executions: Vec<ExecutionRecord>,
}

pub struct ScheduleStore {
    path: Option<PathBuf>,
    state: RwLock<ScheduleState>,
}

impl ScheduleStore {
    pub fn new(state_path: Option<&Path>) -> Self {
        let path = persist::store_path(state_path, "schedules.json");
        let state = path
            .as_deref()
            .map(persist::load_or_default)
            .unwrap_or_default();
        Self {
            path,
            state: RwLock::new(state),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(None)
    }

    fn flush(&self, state: &ScheduleState) {
        if let Some(path) = &self.path {
            persist::save(path, state);
        }
    }

    pub fn insert(&self, schedule: Schedule) -> Result<()> {
        let mut state = self.state.write();
        if state.schedules.contains_key(&schedule.id) {
            return Err(Error::Validation(format!(
                "schedule {} already exists",
                schedule.id
            )));
        }
        state.schedules.insert(schedule.id, schedule);
        self.flush(&state);
        Ok(())
    }

    pub fn get(&self, user_id: &str, id: &Uuid) -> Result<Schedule> {
        self.state
            .read()
            .schedules
            .get(id)
            .filter(|s| s.user_id == user_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("schedule {id}")))
    }

    pub fn update<F>(&self, id: &Uuid, f: F) -> Result<Schedule>
    where
        F: FnOnce(&mut Schedule),
    {
        let mut state = self.state.write();
        let schedule = state
            .schedules
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("schedule {id}")))?;
        f(schedule);
        schedule.updated_at = Utc::now();
        let snapshot = schedule.clone();
        self.flush(&state);
        Ok(snapshot)
    }

    /// Enabled schedules whose `next_run_at` has passed (or was never
    /// computed).
    pub fn due(&self, now: DateTime<Utc>) -> Vec<Schedule> {
        self.state
            .read()
            .schedules
            .values()
            .filter(|s| s.enabled && s.next_run_at.map_or(true, |t| t <= now))
            .cloned()
            .collect()
    }

    /// Only enabled schedules consume the per-user quota; paused ones
    /// do not.
    pub fn count_user_schedules(&self, user_id: &str) -> usize {
        self.state
            .read()
            .schedules
            .values()
            .filter(|s| s.user_id == user_id && s.enabled)
            .count()
    }

    pub fn record_execution(&self, record: ExecutionRecord) {
        let mut state = self.state.write();
        state.executions.push(record);
        self.flush(&state);
    }

    pub fn finish_execution(
        &self,
        execution_id: &Uuid,
        success: bool,
        output: Option<String>,
        error: Option<String>,
    ) {
        let mut state = self.state.write();
        if let Some(rec) = state.executions.iter_mut().find(|r| r.id == *execution_id) {
            rec.finished_at = Some(Utc::now());
            rec.success = Some(success);
            rec.output = output;
            rec.error = error;
        }
        self.flush(&state);
    }

    pub fn executions_for(&self, schedule_id: &Uuid) -> Vec<ExecutionRecord> {
        self.state
            .read()
            .executions
            .iter()
            .filter(|r| r.schedule_id == *schedule_id)
            .cloned()
            .collect()
    }
}

/// Insert a schedule after checking the per-tier quota. Only enabled
/// schedules count; paused ones never consume quota.
pub async fn create_schedule_with_quota(
    store: &ScheduleStore,
    tiers: &dyn crate::limiter::TierService,
    limits: &cortex_domain::config::LimitsConfig,
    schedule: Schedule,
) -> Result<()> {
    if schedule.enabled {
        let tier = tiers.tier_for(&schedule.user_id).await;
        let cap = limits
            .schedules_per_user
            .get(&tier)
            .copied()
            .unwrap_or(u32::MAX);
        let used = store.count_user_schedules(&schedule.user_id) as u32;
        if used >= cap {
            return Err(Error::Validation(format!(
                "schedule limit reached for tier {tier}: {used}/{cap} enabled"
            )));
        }
    }
    store.insert(schedule)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Workflow execution seam: the gateway wires this to the orchestrator's
/// routine entry point.
#[async_trait::async_trait]
pub trait RoutineExecutor: Send + Sync {
    async fn execute(&self, schedule: &Schedule, input: Value) -> Result<String>;
}

pub struct Scheduler {
    store: Arc<ScheduleStore>,
    cache: Arc<dyn SharedCache>,
    executor: Arc<dyn RoutineExecutor>,
    instance_id: String,
    lock_ttl: Duration,
}

impl Scheduler {
    pub fn new(
        store: Arc<ScheduleStore>,
        cache: Arc<dyn SharedCache>,
        executor: Arc<dyn RoutineExecutor>,
        instance_id: impl Into<String>,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            executor,
            instance_id: instance_id.into(),
            lock_ttl,
        }
    }

    fn lock_key(schedule_id: &Uuid, now: DateTime<Utc>) -> String {
        let minute_bucket = now.timestamp() / 60;
        format!("schedule-lock:{schedule_id}:{minute_bucket}")
    }

    /// Evaluate due schedules once. Returns how many executions this
    /// instance fired.
    pub async fn tick(&self, now: DateTime<Utc>) -> usize {
        let due = self.store.due(now);
        let mut fired = 0usize;
        for schedule in due {
            match self.fire(&schedule, now).await {
                Ok(true) => fired += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(schedule_id = %schedule.id, error = %e, "schedule tick failed");
                }
            }
        }
        fired
    }

    /// Run one schedule under the minute-bucket lock. `Ok(false)` means
    /// another instance holds this minute.
    async fn fire(&self, schedule: &Schedule, now: DateTime<Utc>) -> Result<bool> {
        let lock_key = Self::lock_key(&schedule.id, now);
        let acquired = self
            .cache
            .acquire_lock(&lock_key, &self.instance_id, self.lock_ttl)
            .await?;
        if !acquired {
            tracing::debug!(
                schedule_id = %schedule.id,
                "schedule already being executed by another instance"
            );
            return Ok(false);
        }

        // Build the routine input from the template and inject the owner.
        let mut input = match &schedule.input_template {
            Value::Object(map) => map.clone(),
            _ => Default::default(),
        };
        input.insert(
            "__user_id__".to_owned(),
            Value::String(schedule.user_id.clone()),
        );
        let input = Value::Object(input);

        let execution = ExecutionRecord {
            id: Uuid::new_v4(),
            schedule_id: schedule.id,
            user_id: schedule.user_id.clone(),
            started_at: now,
            finished_at: None,
            success: None,
            output: None,
            error: None,
        };
        let execution_id = execution.id;
        self.store.record_execution(execution);

        tracing::info!(
            schedule_id = %schedule.id,
            instance_id = %self.instance_id,
            name = %schedule.name,
            "firing scheduled routine"
        );
        let outcome = self.executor.execute(schedule, input).await;

        let next_run_at = schedule
            .cron_schedule()
            .ok()
            .and_then(|c| c.next_after(&now));
        match &outcome {
            Ok(output) => {
                self.store
                    .finish_execution(&execution_id, true, Some(output.clone()), None);
                let _ = self.store.update(&schedule.id, |s| {
                    s.last_run_at = Some(now);
                    s.next_run_at = next_run_at;
                    s.total_runs += 1;
                    s.successful_runs += 1;
                    s.last_error = None;
                });
            }
            Err(e) => {
                let message = e.to_string();
                self.store
                    .finish_execution(&execution_id, false, None, Some(message.clone()));
                let _ = self.store.update(&schedule.id, |s| {
                    s.last_run_at = Some(now);
                    s.next_run_at = next_run_at;
                    s.total_runs += 1;
                    s.failed_runs += 1;
                    s.last_error = Some(message);
                });
            }
        }

        // Compare-and-delete keyed on our instance id; if the TTL already
        // expired and someone else holds the key, this is a no-op.
        if !self
            .cache
            .compare_and_delete(&lock_key, &self.instance_id)
            .await?
        {
            tracing::warn!(
                schedule_id = %schedule.id,
                "schedule lock expired before release"
            );
        }
        Ok(true)
    }

    /// Long-running tick loop. Honors the tick interval from config.
    pub async fn run(self: Arc<Self>, tick_interval: Duration) {
        let mut interval = tokio::time::interval(tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            self.tick(Utc::now()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortex_cache::MemoryCache;
    use parking_lot::Mutex;

    struct CountingExecutor {
        calls: Mutex<Vec<Value>>,
        fail: bool,
    }

    impl CountingExecutor {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail,
            })
        }
    }

    #[async_trait::async_trait]
    impl RoutineExecutor for CountingExecutor {
        async fn execute(&self, _schedule: &Schedule, input: Value) -> Result<String> {
            self.calls.lock().push(input);
            if self.fail {
                Err(Error::Other("routine blew up".into()))
            } else {
                Ok("done".into())
            }
        }
    }

    fn due_schedule(user: &str) -> Schedule {
        let mut s = Schedule::new(user, "daily digest", "0 9 * * *", "UTC").unwrap();
        s.next_run_at = Some(Utc::now() - chrono::Duration::minutes(1));
        s
    }

    #[tokio::test]
    async fn fires_due_schedule_and_records_outcome() {
        let store = Arc::new(ScheduleStore::in_memory());
        let cache = Arc::new(MemoryCache::new());
        let executor = CountingExecutor::new(false);
        let schedule = due_schedule("u1");
        let sid = schedule.id;
        store.insert(schedule).unwrap();

        let scheduler = Scheduler::new(
            store.clone(),
            cache,
            executor.clone(),
            "inst-a",
            Duration::from_secs(300),
        );
        assert_eq!(scheduler.tick(Utc::now()).await, 1);

        let s = store.get("u1", &sid).unwrap();
        assert_eq!(s.total_runs, 1);
        assert_eq!(s.successful_runs, 1);
        assert!(s.last_run_at.is_some());
        assert!(s.next_run_at.unwrap() > Utc::now());

        // Input template injection.
        let calls = executor.calls.lock();
        assert_eq!(calls[0]["__user_id__"], "u1");

        let executions = store.executions_for(&sid);
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].success, Some(true));
    }

    #[tokio::test]
    async fn single_fire_across_instances() {
        let store = Arc::new(ScheduleStore::in_memory());
        let cache: Arc<MemoryCache> = Arc::new(MemoryCache::new());
        let executor = CountingExecutor::new(false);
        let schedule = due_schedule("u1");
        let sid = schedule.id;
        store.insert(schedule).unwrap();

        let a = Scheduler::new(
            store.clone(),
            cache.clone(),
            executor.clone(),
            "inst-a",
            Duration::from_secs(300),
        );
        let b = Scheduler::new(
            store.clone(),
            cache,
            executor.clone(),
            "inst-b",
            Duration::from_secs(300),
        );

        let now = Utc::now();
        let schedule = store.get("u1", &sid).unwrap();
        // Instance A wins the minute; B sees the lock and skips.
        assert!(a.fire(&schedule, now).await.unwrap());
        assert!(!b.fire(&schedule, now).await.unwrap());
        assert_eq!(executor.calls.lock().len(), 1);
        assert_eq!(store.executions_for(&sid).len(), 1);
    }

    #[tokio::test]
    async fn failed_routine_counts_and_keeps_error() {
        let store = Arc::new(ScheduleStore::in_memory());
        let cache = Arc::new(MemoryCache::new());
        let executor = CountingExecutor::new(true);
        let schedule = due_schedule("u1");
        let sid = schedule.id;
        store.insert(schedule).unwrap();

        let scheduler = Scheduler::new(
            store.clone(),
            cache,
            executor,
            "inst-a",
            Duration::from_secs(300),
        );
        scheduler.tick(Utc::now()).await;

        let s = store.get("u1", &sid).unwrap();
        assert_eq!(s.failed_runs, 1);
        assert!(s.last_error.as_deref().unwrap().contains("routine blew up"));
        let executions = store.executions_for(&sid);
        assert_eq!(executions[0].success, Some(false));
    }

    #[tokio::test]
    async fn disabled_schedules_never_fire_and_do_not_count() {
        let store = Arc::new(ScheduleStore::in_memory());
        let mut schedule = due_schedule("u1");
        schedule.enabled = false;
        store.insert(schedule).unwrap();
        store.insert(due_schedule("u1")).unwrap();

        assert_eq!(store.count_user_schedules("u1"), 1);
        assert_eq!(store.due(Utc::now()).len(), 1);
    }

    #[tokio::test]
    async fn lock_release_allows_next_bucket() {
        let store = Arc::new(ScheduleStore::in_memory());
        let cache: Arc<MemoryCache> = Arc::new(MemoryCache::new());
        let executor = CountingExecutor::new(false);
        let schedule = due_schedule("u1");
        let sid = schedule.id;
        store.insert(schedule).unwrap();

        let scheduler = Scheduler::new(
            store.clone(),
            cache,
            executor.clone(),
            "inst-a",
            Duration::from_secs(300),
        );
        let t0 = Utc::now();
        let s = store.get("u1", &sid).unwrap();
        assert!(scheduler.fire(&s, t0).await.unwrap());
        // A different minute bucket gets a fresh lock.
        let t1 = t0 + chrono::Duration::minutes(1);
        let s = store.get("u1", &sid).unwrap();
        assert!(scheduler.fire(&s, t1).await.unwrap());
        assert_eq!(executor.calls.lock().len(), 2);
    }

    #[test]
    fn invalid_cron_is_rejected_at_creation() {
        assert!(Schedule::new("u1", "bad", "not a cron", "UTC").is_err());
        assert!(Schedule::new("u1", "bad tz", "0 9 * * *", "Mars/Olympus").is_err());
    }

    #[tokio::test]
    async fn schedule_quota_counts_enabled_only() {
        use crate::limiter::StaticTierService;
        use cortex_domain::config::LimitsConfig;

        let store = ScheduleStore::in_memory();
        let tiers = StaticTierService::new("free");
        let mut limits = LimitsConfig::default();
        limits.schedules_per_user.insert("free".into(), 2);

        for i in 0..2 {
            let s = Schedule::new("u1", format!("s{i}"), "0 9 * * *", "UTC").unwrap();
            create_schedule_with_quota(&store, &tiers, &limits, s)
                .await
                .unwrap();
        }
        let third = Schedule::new("u1", "s2", "0 9 * * *", "UTC").unwrap();
        assert!(create_schedule_with_quota(&store, &tiers, &limits, third)
            .await
            .is_err());

        // A paused schedule slips under the quota.
        let mut paused = Schedule::new("u1", "paused", "0 9 * * *", "UTC").unwrap();
        paused.enabled = false;
        create_schedule_with_quota(&store, &tiers, &limits, paused)
            .await
            .unwrap();
    }
}
