use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::model::{days_between, Horizon, LimitCount};
use crate::store::{LimitStore, StoreError};

/// Today's date on the process clock, local calendar.
pub fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

/// Outcome of one provisioning pass over `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionReport {
    pub horizon: Horizon,
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// Dates that already had at least one override and were left alone.
    pub dates_skipped: usize,
    /// Dates that received at least one new override.
    pub dates_seeded: usize,
    pub rows_inserted: usize,
    /// Inserts lost to a concurrent writer of the same `(date, time_slot)`.
    pub rows_conflicted: usize,
}

impl ProvisionReport {
    fn new(horizon: Horizon, start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            horizon,
            start,
            end,
            dates_skipped: 0,
            dates_seeded: 0,
            rows_inserted: 0,
            rows_conflicted: 0,
        }
    }
}

/// Back-fills dates in a rolling window with the current default limits.
///
/// Seed-once: a date with any override is never touched again, so later
/// changes to the defaults do not propagate to dates already provisioned.
#[derive(Clone)]
pub struct Provisioner {
    store: Arc<dyn LimitStore>,
}

impl Provisioner {
    pub fn new(store: Arc<dyn LimitStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn LimitStore> {
        &self.store
    }

    pub async fn provision(&self, horizon: Horizon) -> Result<ProvisionReport, StoreError> {
        self.provision_from(today(), horizon).await
    }

    /// Seed every date in `[start, horizon.end_from(start))` that has no
    /// override yet. Writes are sequential; a `DuplicateKey` on one row is a
    /// lost race with another pass and is skipped, any other store error
    /// aborts the pass.
    pub async fn provision_from(
        &self,
        start: NaiveDate,
        horizon: Horizon,
    ) -> Result<ProvisionReport, StoreError> {
        let result = self.run_pass(start, horizon).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(crate::observability::PROVISION_RUNS_TOTAL, "status" => status)
            .increment(1);
        result
    }

    async fn run_pass(
        &self,
        start: NaiveDate,
        horizon: Horizon,
    ) -> Result<ProvisionReport, StoreError> {
        let end = horizon.end_from(start);
        let mut report = ProvisionReport::new(horizon, start, end);

        let defaults: BTreeMap<String, LimitCount> = self
            .store
            .list_defaults()
            .await?
            .into_iter()
            .map(|d| (d.time_slot, d.limit_count))
            .collect();
        if defaults.is_empty() {
            warn!("provisioning {start}..{end} with no default limits; dates are recorded without overrides");
        }

        let provisioned: BTreeSet<NaiveDate> = self
            .store
            .list_overrides_from(start)
            .await?
            .into_iter()
            .map(|o| o.date)
            .collect();

        for date in days_between(start, end) {
            if provisioned.contains(&date) {
                report.dates_skipped += 1;
                continue;
            }
            self.store.insert_date_if_absent(date).await?;
            if defaults.is_empty() {
                continue;
            }
            self.seed_date(date, &defaults, &mut report).await?;
        }

        metrics::counter!(crate::observability::PROVISION_ROWS_INSERTED_TOTAL)
            .increment(report.rows_inserted as u64);
        metrics::counter!(crate::observability::PROVISION_ROWS_CONFLICTED_TOTAL)
            .increment(report.rows_conflicted as u64);
        info!(
            "provisioned {horizon} window {start}..{end}: {} dates seeded, {} rows inserted, {} skipped dates, {} conflicts",
            report.dates_seeded, report.rows_inserted, report.dates_skipped, report.rows_conflicted
        );
        Ok(report)
    }

    async fn seed_date(
        &self,
        date: NaiveDate,
        defaults: &BTreeMap<String, LimitCount>,
        report: &mut ProvisionReport,
    ) -> Result<(), StoreError> {
        let mut inserted = 0;
        for (slot, count) in defaults {
            match self.store.insert_override(date, slot, *count).await {
                Ok(()) => inserted += 1,
                Err(e) if e.is_duplicate_key() => {
                    debug!("provision {date} {slot}: already present, skipping");
                    report.rows_conflicted += 1;
                }
                Err(e) => return Err(e),
            }
        }

        if inserted > 0 {
            report.dates_seeded += 1;
            report.rows_inserted += inserted;
        }
        Ok(())
    }
}
