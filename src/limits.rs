use std::time::Duration;

use crate::model::Horizon;

/// Longest accepted time-slot label, in bytes.
pub const MAX_TIME_SLOT_LEN: usize = 32;

/// Most rows accepted by a single create/update call.
pub const MAX_BATCH_SIZE: usize = 1000;

/// How often the background scheduler provisions the rolling window.
pub const SCHEDULER_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Window the background scheduler keeps populated.
pub const SCHEDULED_HORIZON: Horizon = Horizon::TwoWeeks;

/// Window used by an ad-hoc provisioning trigger that names none.
pub const DEFAULT_TRIGGER_HORIZON: Horizon = Horizon::TwoMonths;

/// WAL appends tolerated before the log is rewritten as a snapshot.
pub const DEFAULT_COMPACT_THRESHOLD: u64 = 1000;
