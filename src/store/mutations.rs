use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::RwLock;

use crate::model::*;

use super::{apply_to_defaults, StoreError, WalStore};

impl WalStore {
    pub async fn insert_defaults(&self, items: &[DefaultLimit]) -> Result<(), StoreError> {
        let _shared = self.gate.read().await;
        let mut defaults = self.defaults.write().await;
        for item in items {
            if defaults.contains_key(&item.time_slot) {
                return Err(StoreError::DuplicateKey(format!(
                    "default_limits({})",
                    item.time_slot
                )));
            }
            let event = Event::DefaultAdded {
                time_slot: item.time_slot.clone(),
                limit_count: item.limit_count,
            };
            self.wal_append(&event).await?;
            apply_to_defaults(&mut defaults, &event);
        }
        Ok(())
    }

    /// Time slots without a default are skipped, not created.
    pub async fn update_defaults(
        &self,
        changes: &BTreeMap<String, LimitCount>,
    ) -> Result<usize, StoreError> {
        let _shared = self.gate.read().await;
        let mut defaults = self.defaults.write().await;
        let mut affected = 0;
        for (slot, count) in changes {
            if !defaults.contains_key(slot) {
                continue;
            }
            let event = Event::DefaultUpdated {
                time_slot: slot.clone(),
                limit_count: *count,
            };
            self.wal_append(&event).await?;
            apply_to_defaults(&mut defaults, &event);
            affected += 1;
        }
        Ok(affected)
    }

    pub async fn insert_date_if_absent(&self, date: NaiveDate) -> Result<(), StoreError> {
        let _shared = self.gate.read().await;
        if self.days.contains_key(&date) {
            return Ok(());
        }
        // Two racing callers may both log DateAdded; replay and the entry
        // below both collapse that to one date.
        self.wal_append(&Event::DateAdded { date }).await?;
        self.days
            .entry(date)
            .or_insert_with(|| Arc::new(RwLock::new(DayState::new(date))));
        Ok(())
    }

    pub async fn insert_override(
        &self,
        date: NaiveDate,
        time_slot: &str,
        limit_count: LimitCount,
    ) -> Result<(), StoreError> {
        let _shared = self.gate.read().await;
        let day = self.day(&date).ok_or(StoreError::MissingDate(date))?;
        let mut guard = day.write().await;
        if guard.slots.contains_key(time_slot) {
            return Err(StoreError::DuplicateKey(format!(
                "date_limits({date}, {time_slot})"
            )));
        }

        let event = Event::OverrideAdded {
            date,
            time_slot: time_slot.to_string(),
            limit_count,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Returns rows affected: 0 when the date or time slot has no override.
    pub async fn update_override(
        &self,
        date: NaiveDate,
        time_slot: &str,
        limit_count: LimitCount,
    ) -> Result<usize, StoreError> {
        let _shared = self.gate.read().await;
        let Some(day) = self.day(&date) else {
            return Ok(0);
        };
        let mut guard = day.write().await;
        if !guard.slots.contains_key(time_slot) {
            return Ok(0);
        }

        let event = Event::OverrideUpdated {
            date,
            time_slot: time_slot.to_string(),
            limit_count,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(1)
    }
}
