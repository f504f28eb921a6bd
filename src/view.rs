use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::model::{DateOverride, LimitCount};

/// Limits for one date, keyed by time slot.
pub type DayLimits = BTreeMap<String, LimitCount>;

/// Limits for one month, keyed by date.
pub type MonthLimits = BTreeMap<NaiveDate, DayLimits>;

/// Override limits grouped `year-month → date → time slot → count`.
///
/// Built fresh for each query and never shared. A missing key means "no
/// data"; a present slot with a count of 0 is an explicit zero-capacity record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonthlyView {
    months: BTreeMap<String, MonthLimits>,
}

impl MonthlyView {
    pub fn build<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = DateOverride>,
    {
        let mut months: BTreeMap<String, MonthLimits> = BTreeMap::new();
        for row in rows {
            months
                .entry(year_month(row.date))
                .or_default()
                .entry(row.date)
                .or_default()
                .insert(row.time_slot, row.limit_count);
        }
        Self { months }
    }

    pub fn is_empty(&self) -> bool {
        self.months.is_empty()
    }

    /// Slice for one `YYYY-MM` month.
    pub fn month(&self, year_month: &str) -> Option<&MonthLimits> {
        self.months.get(year_month)
    }

    pub fn take_month(&mut self, year_month: &str) -> Option<MonthLimits> {
        self.months.remove(year_month)
    }

    pub fn date(&self, date: NaiveDate) -> Option<&DayLimits> {
        self.months.get(&year_month(date))?.get(&date)
    }

    pub fn months(&self) -> impl Iterator<Item = (&str, &MonthLimits)> {
        self.months.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Flatten back to rows, ordered by `(date, time_slot)`.
    pub fn rows(&self) -> impl Iterator<Item = DateOverride> + '_ {
        self.months.values().flat_map(|days| {
            days.iter().flat_map(|(date, slots)| {
                slots
                    .iter()
                    .map(|(slot, count)| DateOverride::new(*date, slot.clone(), *count))
            })
        })
    }
}

/// `YYYY-MM` key for the month containing `date`.
pub fn year_month(date: NaiveDate) -> String {
    date.format("%Y-%m").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn sample() -> Vec<DateOverride> {
        vec![
            DateOverride::new(d("2026-10-30"), "09:00", 5),
            DateOverride::new(d("2026-10-30"), "14:00", 0),
            DateOverride::new(d("2026-10-31"), "09:00", 4),
            DateOverride::new(d("2026-11-02"), "09:00", 3),
        ]
    }

    #[test]
    fn groups_by_month_then_date_then_slot() {
        let view = MonthlyView::build(sample());

        let months: Vec<_> = view.months().map(|(m, days)| (m, days.len())).collect();
        assert_eq!(months, vec![("2026-10", 2), ("2026-11", 1)]);

        let oct30 = view.date(d("2026-10-30")).unwrap();
        assert_eq!(oct30.get("09:00"), Some(&5));
        assert_eq!(oct30.get("14:00"), Some(&0));
    }

    #[test]
    fn zero_capacity_is_distinct_from_absent() {
        let view = MonthlyView::build(sample());
        let oct30 = view.date(d("2026-10-30")).unwrap();
        assert_eq!(oct30.get("14:00"), Some(&0));
        assert_eq!(oct30.get("18:00"), None);
        assert!(view.date(d("2026-11-01")).is_none());
    }

    #[test]
    fn month_slice_by_key() {
        let view = MonthlyView::build(sample());
        let nov = view.month("2026-11").unwrap();
        assert_eq!(nov.keys().copied().collect::<Vec<_>>(), vec![d("2026-11-02")]);
        assert!(view.month("2026-12").is_none());
        assert!(view.month("2026-1").is_none());
    }

    #[test]
    fn input_order_does_not_change_result() {
        let mut reversed = sample();
        reversed.reverse();
        assert_eq!(MonthlyView::build(sample()), MonthlyView::build(reversed));
    }

    #[test]
    fn empty_input_builds_empty_view() {
        let view = MonthlyView::build(Vec::new());
        assert!(view.is_empty());
        assert_eq!(view.rows().count(), 0);
    }

    #[test]
    fn rows_flatten_in_date_slot_order() {
        let view = MonthlyView::build(sample().into_iter().rev());
        assert_eq!(view.rows().collect::<Vec<_>>(), sample());
    }

    #[test]
    fn later_row_for_same_key_wins() {
        let view = MonthlyView::build(vec![
            DateOverride::new(d("2026-10-30"), "09:00", 5),
            DateOverride::new(d("2026-10-30"), "09:00", 6),
        ]);
        assert_eq!(view.date(d("2026-10-30")).unwrap().get("09:00"), Some(&6));
    }
}
