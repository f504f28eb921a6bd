mod error;
mod mutations;
mod queries;

pub use error::StoreError;

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::info;

use crate::limits::DEFAULT_COMPACT_THRESHOLD;
use crate::model::*;
use crate::wal::Wal;

/// Storage contract for default limits, calendar dates and per-date overrides.
///
/// Every call may fail with a `StoreError`. Updates report rows affected and
/// never create rows; uniqueness is enforced by the store, not pre-checked by
/// callers.
#[async_trait]
pub trait LimitStore: Send + Sync {
    async fn list_defaults(&self) -> Result<Vec<DefaultLimit>, StoreError>;

    /// Insert each item in order. Stops at the first time slot that already
    /// has a default, leaving earlier items in place.
    async fn insert_defaults(&self, items: &[DefaultLimit]) -> Result<(), StoreError>;

    async fn update_defaults(
        &self,
        changes: &BTreeMap<String, LimitCount>,
    ) -> Result<usize, StoreError>;

    /// Overrides with `date >= from`, ordered by `(date, time_slot)`.
    async fn list_overrides_from(&self, from: NaiveDate) -> Result<Vec<DateOverride>, StoreError>;

    async fn date_exists(&self, date: NaiveDate) -> Result<bool, StoreError>;

    async fn insert_date_if_absent(&self, date: NaiveDate) -> Result<(), StoreError>;

    async fn insert_override(
        &self,
        date: NaiveDate,
        time_slot: &str,
        limit_count: LimitCount,
    ) -> Result<(), StoreError>;

    async fn override_exists(&self, date: NaiveDate, time_slot: &str) -> Result<bool, StoreError>;

    async fn update_override(
        &self,
        date: NaiveDate,
        time_slot: &str,
        limit_count: LimitCount,
    ) -> Result<usize, StoreError>;

    /// Housekeeping run after each scheduled provisioning pass.
    async fn maintain(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

pub type SharedDayState = Arc<RwLock<DayState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Blocks for the first append, drains whatever else is already
/// queued, and commits the whole batch with a single fsync. A non-append
/// command ends the batch and runs after it.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_command(&mut wal, cmd);
            continue;
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_command(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let append_err = batch
        .iter()
        .map(|(event, _)| wal.append_buffered(event))
        .find_map(Result::err);
    // Flush even after a failed append so half-written bytes don't leak into
    // the next batch; every sender in this batch is told it failed.
    let flush_err = wal.flush_sync().err();
    let result = match append_err.or(flush_err) {
        Some(e) => Err(e),
        None => Ok(()),
    };

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_command(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
    }
}

// ── Event application ────────────────────────────────────

fn apply_to_defaults(defaults: &mut BTreeMap<String, LimitCount>, event: &Event) {
    match event {
        Event::DefaultAdded {
            time_slot,
            limit_count,
        } => {
            defaults.insert(time_slot.clone(), *limit_count);
        }
        Event::DefaultUpdated {
            time_slot,
            limit_count,
        } => {
            if let Some(current) = defaults.get_mut(time_slot) {
                *current = *limit_count;
            }
        }
        Event::DateAdded { .. } | Event::OverrideAdded { .. } | Event::OverrideUpdated { .. } => {}
    }
}

/// Apply an override event to its day (caller holds the lock).
fn apply_to_day(ds: &mut DayState, event: &Event) {
    match event {
        Event::OverrideAdded {
            time_slot,
            limit_count,
            ..
        } => {
            ds.slots.insert(time_slot.clone(), *limit_count);
        }
        Event::OverrideUpdated {
            time_slot,
            limit_count,
            ..
        } => {
            if let Some(current) = ds.slots.get_mut(time_slot) {
                *current = *limit_count;
            }
        }
        // DateAdded is handled at the DashMap level, defaults elsewhere
        Event::DateAdded { .. } | Event::DefaultAdded { .. } | Event::DefaultUpdated { .. } => {}
    }
}

fn event_date(event: &Event) -> Option<NaiveDate> {
    match event {
        Event::DateAdded { date }
        | Event::OverrideAdded { date, .. }
        | Event::OverrideUpdated { date, .. } => Some(*date),
        Event::DefaultAdded { .. } | Event::DefaultUpdated { .. } => None,
    }
}

/// `LimitStore` kept in memory and made durable by a write-ahead log.
///
/// Calendar dates live in a `DashMap`; the presence of a key is the date
/// record, and its `DayState` holds that date's overrides behind a per-date
/// lock. Uniqueness checks run under the owning write lock, so concurrent
/// writers of one key see one success and one `DuplicateKey`.
pub struct WalStore {
    pub(super) defaults: RwLock<BTreeMap<String, LimitCount>>,
    pub(super) days: DashMap<NaiveDate, SharedDayState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold it shared; compaction holds it exclusively so the
    /// snapshot can't miss a write that is already in the log.
    pub(super) gate: RwLock<()>,
    compact_threshold: u64,
}

impl WalStore {
    /// Replay the log at `wal_path` and start its writer task. Must be called
    /// from within a tokio runtime.
    pub fn open(wal_path: PathBuf, compact_threshold: u64) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let mut wal = Wal::open(&wal_path)?;
        wal.set_appends_since_compact(events.len() as u64);
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut defaults = BTreeMap::new();
        let mut days: BTreeMap<NaiveDate, DayState> = BTreeMap::new();
        for event in &events {
            match event_date(event) {
                None => apply_to_defaults(&mut defaults, event),
                Some(date) => {
                    if let Event::DateAdded { .. } = event {
                        days.entry(date).or_insert_with(|| DayState::new(date));
                    } else if let Some(ds) = days.get_mut(&date) {
                        apply_to_day(ds, event);
                    }
                }
            }
        }

        info!(
            "replayed {} WAL events from {}: {} defaults, {} dates",
            events.len(),
            wal_path.display(),
            defaults.len(),
            days.len()
        );

        Ok(Self {
            defaults: RwLock::new(defaults),
            days: days
                .into_iter()
                .map(|(date, ds)| (date, Arc::new(RwLock::new(ds))))
                .collect(),
            wal_tx,
            gate: RwLock::new(()),
            compact_threshold,
        })
    }

    pub fn open_default(wal_path: PathBuf) -> io::Result<Self> {
        Self::open(wal_path, DEFAULT_COMPACT_THRESHOLD)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    /// WAL-append then apply to the locked day.
    pub(super) async fn persist_and_apply(
        &self,
        ds: &mut DayState,
        event: &Event,
    ) -> Result<(), StoreError> {
        self.wal_append(event).await?;
        apply_to_day(ds, event);
        Ok(())
    }

    pub(super) fn day(&self, date: &NaiveDate) -> Option<SharedDayState> {
        self.days.get(date).map(|e| e.value().clone())
    }

    pub async fn appends_since_compact(&self) -> Result<u64, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))
    }

    /// Rewrite the log as the minimal event list that recreates current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _exclusive = self.gate.write().await;
        let events = self.snapshot_events().await;
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))?;

        info!("compacted WAL to {count} events");
        Ok(())
    }

    /// Compact once the log has grown past the configured threshold.
    pub async fn maybe_compact(&self) -> Result<bool, StoreError> {
        if self.appends_since_compact().await? < self.compact_threshold {
            return Ok(false);
        }
        self.compact().await?;
        Ok(true)
    }

    async fn snapshot_events(&self) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .defaults
            .read()
            .await
            .iter()
            .map(|(slot, count)| Event::DefaultAdded {
                time_slot: slot.clone(),
                limit_count: *count,
            })
            .collect();

        for day in self.days_in_order(NaiveDate::MIN) {
            let guard = day.read().await;
            events.push(Event::DateAdded { date: guard.date });
            events.extend(guard.overrides().map(|o| Event::OverrideAdded {
                date: o.date,
                time_slot: o.time_slot,
                limit_count: o.limit_count,
            }));
        }
        events
    }
}

#[async_trait]
impl LimitStore for WalStore {
    async fn list_defaults(&self) -> Result<Vec<DefaultLimit>, StoreError> {
        WalStore::list_defaults(self).await
    }

    async fn insert_defaults(&self, items: &[DefaultLimit]) -> Result<(), StoreError> {
        WalStore::insert_defaults(self, items).await
    }

    async fn update_defaults(
        &self,
        changes: &BTreeMap<String, LimitCount>,
    ) -> Result<usize, StoreError> {
        WalStore::update_defaults(self, changes).await
    }

    async fn list_overrides_from(&self, from: NaiveDate) -> Result<Vec<DateOverride>, StoreError> {
        WalStore::list_overrides_from(self, from).await
    }

    async fn date_exists(&self, date: NaiveDate) -> Result<bool, StoreError> {
        Ok(WalStore::date_exists(self, date))
    }

    async fn insert_date_if_absent(&self, date: NaiveDate) -> Result<(), StoreError> {
        WalStore::insert_date_if_absent(self, date).await
    }

    async fn insert_override(
        &self,
        date: NaiveDate,
        time_slot: &str,
        limit_count: LimitCount,
    ) -> Result<(), StoreError> {
        WalStore::insert_override(self, date, time_slot, limit_count).await
    }

    async fn override_exists(&self, date: NaiveDate, time_slot: &str) -> Result<bool, StoreError> {
        Ok(WalStore::override_exists(self, date, time_slot).await)
    }

    async fn update_override(
        &self,
        date: NaiveDate,
        time_slot: &str,
        limit_count: LimitCount,
    ) -> Result<usize, StoreError> {
        WalStore::update_override(self, date, time_slot, limit_count).await
    }

    async fn maintain(&self) -> Result<(), StoreError> {
        self.maybe_compact().await.map(|_| ())
    }
}
