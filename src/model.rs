use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Days, NaiveDate};
use serde::{Deserialize, Serialize};

/// Capacity value for a time slot. Non-negative by construction.
pub type LimitCount = u32;

/// Fallback capacity for a time slot when no date-specific override exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultLimit {
    pub time_slot: String,
    pub limit_count: LimitCount,
}

impl DefaultLimit {
    pub fn new(time_slot: impl Into<String>, limit_count: LimitCount) -> Self {
        Self {
            time_slot: time_slot.into(),
            limit_count,
        }
    }
}

/// Effective capacity for one date/time-slot pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateOverride {
    pub date: NaiveDate,
    pub time_slot: String,
    pub limit_count: LimitCount,
}

impl DateOverride {
    pub fn new(date: NaiveDate, time_slot: impl Into<String>, limit_count: LimitCount) -> Self {
        Self {
            date,
            time_slot: time_slot.into(),
            limit_count,
        }
    }
}

/// Everything the store knows about a single calendar date.
///
/// The existence of a `DayState` is the calendar-date marker; `slots` holds the
/// overrides for that date and may be empty.
#[derive(Debug, Clone)]
pub struct DayState {
    pub date: NaiveDate,
    /// Overrides keyed by time slot, ordered for stable listing.
    pub slots: BTreeMap<String, LimitCount>,
}

impl DayState {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            slots: BTreeMap::new(),
        }
    }

    pub fn overrides(&self) -> impl Iterator<Item = DateOverride> + '_ {
        self.slots
            .iter()
            .map(|(slot, count)| DateOverride::new(self.date, slot.clone(), *count))
    }
}

/// Forward-looking span over which provisioning back-fills missing dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Horizon {
    OneWeek,
    TwoWeeks,
    OneMonth,
    TwoMonths,
}

impl Horizon {
    pub const ALL: [Horizon; 4] = [
        Horizon::OneWeek,
        Horizon::TwoWeeks,
        Horizon::OneMonth,
        Horizon::TwoMonths,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Horizon::OneWeek => "oneWeek",
            Horizon::TwoWeeks => "twoWeeks",
            Horizon::OneMonth => "oneMonth",
            Horizon::TwoMonths => "twoMonths",
        }
    }

    /// Exclusive end of the window that starts at `start`.
    ///
    /// Month steps keep the day-of-month and let it overflow into the following
    /// month (2027-01-31 + 1 month = 2027-03-03).
    pub fn end_from(&self, start: NaiveDate) -> NaiveDate {
        match self {
            Horizon::OneWeek => add_days(start, 7),
            Horizon::TwoWeeks => add_days(start, 14),
            Horizon::OneMonth => add_months_overflowing(start, 1),
            Horizon::TwoMonths => add_months_overflowing(start, 2),
        }
    }
}

impl fmt::Display for Horizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Horizon {
    type Err = UnknownHorizon;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Horizon::ALL
            .into_iter()
            .find(|h| h.as_str() == s)
            .ok_or_else(|| UnknownHorizon(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownHorizon(pub String);

impl fmt::Display for UnknownHorizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unsupported horizon: {} (expected oneWeek, twoWeeks, oneMonth or twoMonths)",
            self.0
        )
    }
}

impl std::error::Error for UnknownHorizon {}

fn add_days(date: NaiveDate, days: u64) -> NaiveDate {
    date.checked_add_days(Days::new(days)).unwrap_or(NaiveDate::MAX)
}

fn add_months_overflowing(date: NaiveDate, months: u32) -> NaiveDate {
    let total = date.month0() + months;
    let year = date.year() + (total / 12) as i32;
    let month = total % 12 + 1;
    match NaiveDate::from_ymd_opt(year, month, 1) {
        Some(first) => add_days(first, u64::from(date.day0())),
        None => NaiveDate::MAX,
    }
}

/// Iterate `[start, end)` one calendar day at a time.
pub fn days_between(start: NaiveDate, end: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    start.iter_days().take_while(move |d| *d < end)
}

/// Flat event types; this is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    DefaultAdded {
        time_slot: String,
        limit_count: LimitCount,
    },
    DefaultUpdated {
        time_slot: String,
        limit_count: LimitCount,
    },
    DateAdded {
        date: NaiveDate,
    },
    OverrideAdded {
        date: NaiveDate,
        time_slot: String,
        limit_count: LimitCount,
    },
    OverrideUpdated {
        date: NaiveDate,
        time_slot: String,
        limit_count: LimitCount,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn horizon_tokens() {
        for h in Horizon::ALL {
            assert_eq!(h.as_str().parse::<Horizon>().unwrap(), h);
        }
        assert_eq!("twoWeeks".parse::<Horizon>(), Ok(Horizon::TwoWeeks));
    }

    #[test]
    fn horizon_rejects_unknown_token() {
        let err = "threeWeeks".parse::<Horizon>().unwrap_err();
        assert_eq!(err, UnknownHorizon("threeWeeks".into()));
        assert!(err.to_string().contains("threeWeeks"));
        // tokens are case-sensitive
        assert!("oneweek".parse::<Horizon>().is_err());
    }

    #[test]
    fn week_horizons_add_days() {
        assert_eq!(Horizon::OneWeek.end_from(d("2026-10-16")), d("2026-10-23"));
        assert_eq!(Horizon::TwoWeeks.end_from(d("2026-12-25")), d("2027-01-08"));
    }

    #[test]
    fn month_horizon_keeps_day_of_month() {
        assert_eq!(Horizon::OneMonth.end_from(d("2026-10-16")), d("2026-11-16"));
        assert_eq!(Horizon::TwoMonths.end_from(d("2026-11-30")), d("2027-01-30"));
    }

    #[test]
    fn month_horizon_overflows_short_months() {
        assert_eq!(Horizon::OneMonth.end_from(d("2027-01-31")), d("2027-03-03"));
        // leap year
        assert_eq!(Horizon::OneMonth.end_from(d("2028-01-31")), d("2028-03-02"));
        assert_eq!(Horizon::TwoMonths.end_from(d("2026-12-31")), d("2027-03-03"));
    }

    #[test]
    fn days_between_is_half_open() {
        let days: Vec<_> = days_between(d("2026-02-27"), d("2026-03-02")).collect();
        assert_eq!(days, vec![d("2026-02-27"), d("2026-02-28"), d("2026-03-01")]);
        assert_eq!(days_between(d("2026-03-02"), d("2026-03-02")).count(), 0);
    }

    #[test]
    fn day_state_lists_overrides_in_slot_order() {
        let mut ds = DayState::new(d("2026-10-20"));
        ds.slots.insert("14:00".into(), 2);
        ds.slots.insert("09:00".into(), 5);
        let rows: Vec<_> = ds.overrides().collect();
        assert_eq!(
            rows,
            vec![
                DateOverride::new(d("2026-10-20"), "09:00", 5),
                DateOverride::new(d("2026-10-20"), "14:00", 2),
            ]
        );
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::OverrideAdded {
            date: d("2026-10-20"),
            time_slot: "09:00".into(),
            limit_count: 4,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
