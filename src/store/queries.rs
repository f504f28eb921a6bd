use chrono::NaiveDate;

use crate::model::*;

use super::{SharedDayState, StoreError, WalStore};

impl WalStore {
    pub async fn list_defaults(&self) -> Result<Vec<DefaultLimit>, StoreError> {
        Ok(self
            .defaults
            .read()
            .await
            .iter()
            .map(|(slot, count)| DefaultLimit::new(slot.clone(), *count))
            .collect())
    }

    /// Day handles with `date >= from`, sorted by date. Arcs are cloned out so
    /// no DashMap shard lock is held while awaiting the day locks.
    pub(super) fn days_in_order(&self, from: NaiveDate) -> Vec<SharedDayState> {
        let mut days: Vec<(NaiveDate, SharedDayState)> = self
            .days
            .iter()
            .filter(|e| *e.key() >= from)
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        days.sort_by_key(|(date, _)| *date);
        days.into_iter().map(|(_, ds)| ds).collect()
    }

    pub async fn list_overrides_from(&self, from: NaiveDate) -> Result<Vec<DateOverride>, StoreError> {
        let mut rows = Vec::new();
        for day in self.days_in_order(from) {
            rows.extend(day.read().await.overrides());
        }
        Ok(rows)
    }

    pub fn date_exists(&self, date: NaiveDate) -> bool {
        self.days.contains_key(&date)
    }

    pub fn date_count(&self) -> usize {
        self.days.len()
    }

    pub async fn override_exists(&self, date: NaiveDate, time_slot: &str) -> bool {
        match self.day(&date) {
            Some(day) => day.read().await.slots.contains_key(time_slot),
            None => false,
        }
    }

    pub async fn get_override(&self, date: NaiveDate, time_slot: &str) -> Option<LimitCount> {
        let day = self.day(&date)?;
        let guard = day.read().await;
        guard.slots.get(time_slot).copied()
    }
}
