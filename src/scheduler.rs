use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::limits::{SCHEDULED_HORIZON, SCHEDULER_INTERVAL};
use crate::model::Horizon;
use crate::provision::Provisioner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerError {
    AlreadyRunning,
    NotRunning,
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerError::AlreadyRunning => write!(f, "scheduler is already running"),
            SchedulerError::NotRunning => write!(f, "scheduler is not running"),
        }
    }
}

impl std::error::Error for SchedulerError {}

enum SchedulerState {
    Idle,
    Running(RunningTimer),
}

struct RunningTimer {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Recurring provisioning timer with an explicit start/stop lifecycle.
///
/// Each instance owns its own timer, so tests can build isolated schedulers.
pub struct Scheduler {
    provisioner: Provisioner,
    interval: Duration,
    horizon: Horizon,
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    pub fn new(provisioner: Provisioner, interval: Duration, horizon: Horizon) -> Self {
        Self {
            provisioner,
            interval,
            horizon,
            state: Mutex::new(SchedulerState::Idle),
        }
    }

    /// Daily `twoWeeks` pass.
    pub fn daily(provisioner: Provisioner) -> Self {
        Self::new(provisioner, SCHEDULER_INTERVAL, SCHEDULED_HORIZON)
    }

    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arm the timer. The first pass runs one full interval from now.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut state = self.lock_state();
        if matches!(*state, SchedulerState::Running(_)) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_timer(
            self.provisioner.clone(),
            self.interval,
            self.horizon,
            cancel.clone(),
        ));
        *state = SchedulerState::Running(RunningTimer { cancel, handle });
        metrics::gauge!(crate::observability::SCHEDULER_ACTIVE).set(1.0);
        info!(
            "scheduler started: {} every {:?}",
            self.horizon, self.interval
        );
        Ok(())
    }

    /// Disarm the timer. A pass already running is left to finish; no new
    /// pass starts after this returns.
    pub fn stop(&self) -> Result<(), SchedulerError> {
        let mut state = self.lock_state();
        let SchedulerState::Running(timer) = std::mem::replace(&mut *state, SchedulerState::Idle)
        else {
            return Err(SchedulerError::NotRunning);
        };
        timer.cancel.cancel();
        // dropping the handle detaches the task; it exits at its next select
        drop(timer.handle);
        metrics::gauge!(crate::observability::SCHEDULER_ACTIVE).set(0.0);
        info!("scheduler stopped");
        Ok(())
    }

    pub fn status(&self) -> bool {
        matches!(*self.lock_state(), SchedulerState::Running(_))
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let SchedulerState::Running(timer) = &*self.lock_state() {
            timer.cancel.cancel();
        }
    }
}

async fn run_timer(
    provisioner: Provisioner,
    period: Duration,
    horizon: Horizon,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        fire(&provisioner, horizon).await;
    }
    debug!("scheduler timer exited");
}

/// One scheduled pass. Failures are logged and dropped; the next tick is the
/// only retry.
async fn fire(provisioner: &Provisioner, horizon: Horizon) {
    match provisioner.provision(horizon).await {
        Ok(report) => debug!(
            "scheduled provisioning done: {} dates seeded",
            report.dates_seeded
        ),
        Err(e) => error!("scheduled provisioning ({horizon}) failed: {e}"),
    }
    if let Err(e) = provisioner.store().maintain().await {
        warn!("store maintenance after scheduled provisioning failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DateOverride, DefaultLimit, LimitCount};
    use crate::store::{LimitStore, StoreError, WalStore};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotcap_test_scheduler");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    /// Counts provisioning passes and maintenance calls; can be told to fail
    /// every read.
    struct CountingStore {
        inner: WalStore,
        passes: AtomicUsize,
        maintained: AtomicUsize,
        fail: bool,
    }

    impl CountingStore {
        fn new(name: &str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                inner: WalStore::open_default(test_wal_path(name)).unwrap(),
                passes: AtomicUsize::new(0),
                maintained: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl LimitStore for CountingStore {
        async fn list_defaults(&self) -> Result<Vec<DefaultLimit>, StoreError> {
            self.passes.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(StoreError::WalError("connection refused".into()));
            }
            self.inner.list_defaults().await
        }
        async fn insert_defaults(&self, items: &[DefaultLimit]) -> Result<(), StoreError> {
            self.inner.insert_defaults(items).await
        }
        async fn update_defaults(
            &self,
            changes: &BTreeMap<String, LimitCount>,
        ) -> Result<usize, StoreError> {
            self.inner.update_defaults(changes).await
        }
        async fn list_overrides_from(
            &self,
            from: NaiveDate,
        ) -> Result<Vec<DateOverride>, StoreError> {
            self.inner.list_overrides_from(from).await
        }
        async fn date_exists(&self, date: NaiveDate) -> Result<bool, StoreError> {
            Ok(self.inner.date_exists(date))
        }
        async fn insert_date_if_absent(&self, date: NaiveDate) -> Result<(), StoreError> {
            self.inner.insert_date_if_absent(date).await
        }
        async fn insert_override(
            &self,
            date: NaiveDate,
            time_slot: &str,
            limit_count: LimitCount,
        ) -> Result<(), StoreError> {
            self.inner.insert_override(date, time_slot, limit_count).await
        }
        async fn override_exists(
            &self,
            date: NaiveDate,
            time_slot: &str,
        ) -> Result<bool, StoreError> {
            Ok(self.inner.override_exists(date, time_slot).await)
        }
        async fn update_override(
            &self,
            date: NaiveDate,
            time_slot: &str,
            limit_count: LimitCount,
        ) -> Result<usize, StoreError> {
            self.inner.update_override(date, time_slot, limit_count).await
        }
        async fn maintain(&self) -> Result<(), StoreError> {
            self.maintained.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn scheduler_over(store: Arc<CountingStore>, interval: Duration) -> Scheduler {
        Scheduler::new(Provisioner::new(store), interval, Horizon::TwoWeeks)
    }

    #[tokio::test]
    async fn lifecycle_reports_conflicts() {
        let store = CountingStore::new("lifecycle.wal", false);
        let scheduler = scheduler_over(store, Duration::from_secs(3600));

        assert!(!scheduler.status());
        scheduler.start().unwrap();
        assert!(scheduler.status());
        assert_eq!(scheduler.start(), Err(SchedulerError::AlreadyRunning));
        assert!(scheduler.status());

        scheduler.stop().unwrap();
        assert!(!scheduler.status());
        assert_eq!(scheduler.stop(), Err(SchedulerError::NotRunning));

        // restartable after a stop
        scheduler.start().unwrap();
        assert!(scheduler.status());
        scheduler.stop().unwrap();
    }

    #[tokio::test]
    async fn separate_instances_do_not_share_state() {
        let a = scheduler_over(CountingStore::new("isolated_a.wal", false), Duration::from_secs(3600));
        let b = scheduler_over(CountingStore::new("isolated_b.wal", false), Duration::from_secs(3600));
        a.start().unwrap();
        assert!(a.status());
        assert!(!b.status());
        assert_eq!(b.stop(), Err(SchedulerError::NotRunning));
        a.stop().unwrap();
    }

    #[tokio::test]
    async fn first_pass_waits_one_interval() {
        let store = CountingStore::new("first_pass.wal", false);
        let scheduler = scheduler_over(store.clone(), Duration::from_millis(200));
        scheduler.start().unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.passes.load(Ordering::SeqCst), 0);
        scheduler.stop().unwrap();
    }

    #[tokio::test]
    async fn timer_provisions_window_and_runs_maintenance() {
        let store = CountingStore::new("fires.wal", false);
        store
            .insert_defaults(&[DefaultLimit::new("09:00", 5)])
            .await
            .unwrap();
        let scheduler = scheduler_over(store.clone(), Duration::from_millis(20));
        scheduler.start().unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.stop().unwrap();

        assert!(store.passes.load(Ordering::SeqCst) >= 1);
        assert!(store.maintained.load(Ordering::SeqCst) >= 1);
        let today = crate::provision::today();
        assert!(store.inner.date_exists(today));
        assert_eq!(store.inner.get_override(today, "09:00").await, Some(5));
    }

    #[tokio::test]
    async fn no_passes_after_stop() {
        let store = CountingStore::new("stop_halts.wal", false);
        let scheduler = scheduler_over(store.clone(), Duration::from_millis(20));
        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.stop().unwrap();

        // let an in-flight pass settle, then the count must hold still
        tokio::time::sleep(Duration::from_millis(50)).await;
        let settled = store.passes.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.passes.load(Ordering::SeqCst), settled);
    }

    #[tokio::test]
    async fn failed_pass_is_swallowed_and_retried_next_tick() {
        let store = CountingStore::new("failing.wal", true);
        let scheduler = scheduler_over(store.clone(), Duration::from_millis(20));
        scheduler.start().unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(scheduler.status());
        assert!(store.passes.load(Ordering::SeqCst) >= 2);
        scheduler.stop().unwrap();
    }
}
