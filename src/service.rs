use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tracing::info;

use crate::limits::{DEFAULT_TRIGGER_HORIZON, MAX_BATCH_SIZE, MAX_TIME_SLOT_LEN};
use crate::model::{DefaultLimit, Horizon, LimitCount, UnknownHorizon};
use crate::provision::{today, ProvisionReport, Provisioner};
use crate::scheduler::{Scheduler, SchedulerError};
use crate::store::{LimitStore, StoreError};
use crate::view::{year_month, DayLimits, MonthLimits, MonthlyView};

/// Override limits keyed by date, then by time slot.
pub type DateLimits = BTreeMap<NaiveDate, DayLimits>;

#[derive(Debug)]
pub enum LimitError {
    Store(StoreError),
    InvalidArgument(String),
    NotFound(String),
    Conflict(String),
}

impl fmt::Display for LimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitError::Store(e) => write!(f, "{e}"),
            LimitError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            LimitError::NotFound(what) => write!(f, "not found: {what}"),
            LimitError::Conflict(msg) => write!(f, "conflict: {msg}"),
        }
    }
}

impl std::error::Error for LimitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LimitError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for LimitError {
    fn from(e: StoreError) -> Self {
        LimitError::Store(e)
    }
}

impl From<UnknownHorizon> for LimitError {
    fn from(e: UnknownHorizon) -> Self {
        LimitError::InvalidArgument(e.to_string())
    }
}

impl From<SchedulerError> for LimitError {
    fn from(e: SchedulerError) -> Self {
        LimitError::Conflict(e.to_string())
    }
}

// ── Input validation ─────────────────────────────────────

pub fn parse_date(s: &str) -> Result<NaiveDate, LimitError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        // chrono accepts unpadded fields; only the canonical form is allowed
        .filter(|d| d.format("%Y-%m-%d").to_string() == s)
        .ok_or_else(|| LimitError::InvalidArgument(format!("malformed date {s:?}, expected YYYY-MM-DD")))
}

/// Validate a `YYYY-MM` month key.
pub fn parse_month(s: &str) -> Result<String, LimitError> {
    let first = format!("{s}-01");
    match parse_date(&first) {
        Ok(date) if year_month(date) == s => Ok(s.to_string()),
        _ => Err(LimitError::InvalidArgument(format!(
            "malformed month {s:?}, expected YYYY-MM"
        ))),
    }
}

pub fn validate_time_slot(slot: &str) -> Result<(), LimitError> {
    if slot.is_empty() {
        return Err(LimitError::InvalidArgument("time slot must not be empty".into()));
    }
    if slot.len() > MAX_TIME_SLOT_LEN {
        return Err(LimitError::InvalidArgument(format!(
            "time slot {slot:?} is longer than {MAX_TIME_SLOT_LEN} bytes"
        )));
    }
    Ok(())
}

fn check_batch(len: usize) -> Result<(), LimitError> {
    if len > MAX_BATCH_SIZE {
        return Err(LimitError::InvalidArgument(format!(
            "{len} entries in one call, at most {MAX_BATCH_SIZE} allowed"
        )));
    }
    Ok(())
}

fn validate_date_limits(limits: &DateLimits) -> Result<(), LimitError> {
    check_batch(limits.values().map(|slots| slots.len()).sum())?;
    limits
        .values()
        .flat_map(|slots| slots.keys())
        .try_for_each(|slot| validate_time_slot(slot))
}

// ── Views ────────────────────────────────────────────────

/// Which part of the upcoming override view a query asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewScope {
    All,
    Month(String),
    Date(NaiveDate),
}

impl ViewScope {
    /// A date scope wins over a month scope when both are given.
    pub fn parse(month: Option<&str>, date: Option<&str>) -> Result<Self, LimitError> {
        if let Some(date) = date {
            return Ok(ViewScope::Date(parse_date(date)?));
        }
        if let Some(month) = month {
            return Ok(ViewScope::Month(parse_month(month)?));
        }
        Ok(ViewScope::All)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitView {
    All(MonthlyView),
    Month { year_month: String, days: MonthLimits },
    Date { date: NaiveDate, slots: DayLimits },
}

impl LimitView {
    /// `(year_month, date, time_slot, limit_count)` rows in key order.
    pub fn rows(&self) -> Vec<(String, NaiveDate, String, LimitCount)> {
        fn day_rows(
            out: &mut Vec<(String, NaiveDate, String, LimitCount)>,
            date: NaiveDate,
            slots: &DayLimits,
        ) {
            let ym = year_month(date);
            out.extend(
                slots
                    .iter()
                    .map(|(slot, count)| (ym.clone(), date, slot.clone(), *count)),
            );
        }

        let mut out = Vec::new();
        match self {
            LimitView::All(view) => {
                for (_, days) in view.months() {
                    for (date, slots) in days {
                        day_rows(&mut out, *date, slots);
                    }
                }
            }
            LimitView::Month { days, .. } => {
                for (date, slots) in days {
                    day_rows(&mut out, *date, slots);
                }
            }
            LimitView::Date { date, slots } => day_rows(&mut out, *date, slots),
        }
        out
    }
}

// ── Service ──────────────────────────────────────────────

/// The operations the wire layer exposes, over one shared store.
pub struct LimitService {
    store: Arc<dyn LimitStore>,
    provisioner: Provisioner,
    scheduler: Scheduler,
}

impl LimitService {
    /// Service with the daily `twoWeeks` scheduler.
    pub fn new(store: Arc<dyn LimitStore>) -> Self {
        let provisioner = Provisioner::new(store.clone());
        let scheduler = Scheduler::daily(provisioner.clone());
        Self {
            store,
            provisioner,
            scheduler,
        }
    }

    pub fn with_schedule(store: Arc<dyn LimitStore>, interval: Duration, horizon: Horizon) -> Self {
        let provisioner = Provisioner::new(store.clone());
        let scheduler = Scheduler::new(provisioner.clone(), interval, horizon);
        Self {
            store,
            provisioner,
            scheduler,
        }
    }

    pub fn store(&self) -> &Arc<dyn LimitStore> {
        &self.store
    }

    pub async fn get_defaults(&self) -> Result<BTreeMap<String, LimitCount>, LimitError> {
        Ok(self
            .store
            .list_defaults()
            .await?
            .into_iter()
            .map(|d| (d.time_slot, d.limit_count))
            .collect())
    }

    pub async fn get_view(&self, scope: ViewScope) -> Result<LimitView, LimitError> {
        self.view_from(today(), scope).await
    }

    /// View of overrides dated `from` onwards, sliced to `scope`. A scoped
    /// request with no rows is `NotFound`; an unscoped one may be empty.
    pub async fn view_from(&self, from: NaiveDate, scope: ViewScope) -> Result<LimitView, LimitError> {
        let mut view = MonthlyView::build(self.store.list_overrides_from(from).await?);
        match scope {
            ViewScope::All => Ok(LimitView::All(view)),
            ViewScope::Month(ym) => match view.take_month(&ym) {
                Some(days) => Ok(LimitView::Month {
                    year_month: ym,
                    days,
                }),
                None => Err(LimitError::NotFound(format!("month {ym}"))),
            },
            ViewScope::Date(date) => match view.date(date) {
                Some(slots) => Ok(LimitView::Date {
                    date,
                    slots: slots.clone(),
                }),
                None => Err(LimitError::NotFound(format!("date {date}"))),
            },
        }
    }

    pub async fn create_defaults(
        &self,
        items: Vec<DefaultLimit>,
    ) -> Result<Vec<DefaultLimit>, LimitError> {
        check_batch(items.len())?;
        items
            .iter()
            .try_for_each(|item| validate_time_slot(&item.time_slot))?;
        self.store.insert_defaults(&items).await?;
        info!("created {} default limits", items.len());
        Ok(items)
    }

    /// Returns how many time slots were changed; unknown slots are skipped.
    pub async fn update_defaults(
        &self,
        changes: &BTreeMap<String, LimitCount>,
    ) -> Result<usize, LimitError> {
        check_batch(changes.len())?;
        changes.keys().try_for_each(|slot| validate_time_slot(slot))?;
        Ok(self.store.update_defaults(changes).await?)
    }

    /// Insert overrides date by date, creating each calendar date first.
    /// Returns the number of overrides written.
    pub async fn create_overrides(&self, limits: &DateLimits) -> Result<usize, LimitError> {
        validate_date_limits(limits)?;
        let mut created = 0;
        for (date, slots) in limits {
            self.store.insert_date_if_absent(*date).await?;
            for (slot, count) in slots {
                self.store.insert_override(*date, slot, *count).await?;
                created += 1;
            }
        }
        info!("created {created} date overrides");
        Ok(created)
    }

    /// Every `(date, time_slot)` must already exist; otherwise nothing is
    /// written and the first missing pair is reported.
    pub async fn update_overrides(&self, limits: &DateLimits) -> Result<usize, LimitError> {
        validate_date_limits(limits)?;
        for (date, slots) in limits {
            for slot in slots.keys() {
                if !self.store.override_exists(*date, slot).await? {
                    return Err(LimitError::NotFound(format!("date_limits({date}, {slot})")));
                }
            }
        }

        let mut updated = 0;
        for (date, slots) in limits {
            for (slot, count) in slots {
                updated += self.store.update_override(*date, slot, *count).await?;
            }
        }
        Ok(updated)
    }

    /// Provision now. `None` uses the two-month horizon.
    pub async fn trigger_provision(
        &self,
        horizon: Option<&str>,
    ) -> Result<ProvisionReport, LimitError> {
        self.trigger_provision_from(today(), horizon).await
    }

    pub async fn trigger_provision_from(
        &self,
        start: NaiveDate,
        horizon: Option<&str>,
    ) -> Result<ProvisionReport, LimitError> {
        let horizon = match horizon {
            Some(token) => token.parse::<Horizon>()?,
            None => DEFAULT_TRIGGER_HORIZON,
        };
        Ok(self.provisioner.provision_from(start, horizon).await?)
    }

    pub fn scheduler_start(&self) -> Result<(), LimitError> {
        Ok(self.scheduler.start()?)
    }

    pub fn scheduler_stop(&self) -> Result<(), LimitError> {
        Ok(self.scheduler.stop()?)
    }

    pub fn scheduler_status(&self) -> bool {
        self.scheduler.status()
    }
}
