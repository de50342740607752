//! Work-hour split for fill-work reports.

use chrono::{Duration, NaiveTime};
use rust_decimal::prelude::*;

/// Hours per report counted as regular time; the rest is overtime.
pub const REGULAR_HOURS: i64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkHours {
    pub regular: Decimal,
    pub overtime: Decimal,
}

impl WorkHours {
    pub fn total(&self) -> Decimal {
        self.regular + self.overtime
    }
}

/// Span between `start` and `end`, where an end before the start falls on
/// the next day.
pub fn span(start: NaiveTime, end: NaiveTime) -> Duration {
    let span = end - start;
    if span < Duration::zero() {
        span + Duration::days(1)
    } else {
        span
    }
}

/// Split a shift into regular and overtime hours after taking off the
/// break. Both parts are rounded to two decimals and never negative.
pub fn split_hours(start: NaiveTime, end: NaiveTime, break_hours: Option<Decimal>) -> WorkHours {
    let seconds = Decimal::from(span(start, end).num_seconds());
    let worked = (seconds / Decimal::from(3600) - break_hours.unwrap_or(Decimal::ZERO)).max(Decimal::ZERO);
    let regular_cap = Decimal::from(REGULAR_HOURS);
    let regular = worked.min(regular_cap);
    WorkHours {
        regular: regular.round_dp(2),
        overtime: (worked - regular).round_dp(2),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_day_shift_within_regular() {
        let hours = split_hours(t(8, 0), t(12, 30), None);
        assert_eq!(hours.regular, Decimal::new(450, 2));
        assert_eq!(hours.overtime, Decimal::ZERO);
    }

    #[test]
    fn test_long_shift_spills_into_overtime() {
        let hours = split_hours(t(8, 0), t(19, 0), Some(Decimal::ONE));
        assert_eq!(hours.regular, Decimal::from(8));
        assert_eq!(hours.overtime, Decimal::from(2));
        assert_eq!(hours.total(), Decimal::from(10));
    }

    #[test]
    fn test_night_shift_crosses_midnight() {
        assert_eq!(span(t(22, 0), t(2, 0)), Duration::hours(4));
        let hours = split_hours(t(22, 0), t(2, 0), None);
        assert_eq!(hours.regular, Decimal::from(4));
    }

    #[test]
    fn test_break_longer_than_shift_clamps_to_zero() {
        let hours = split_hours(t(8, 0), t(8, 30), Some(Decimal::from(2)));
        assert_eq!(hours.total(), Decimal::ZERO);
    }

    #[test]
    fn test_rounds_to_two_decimals() {
        let hours = split_hours(t(8, 0), t(8, 20), None);
        assert_eq!(hours.regular, Decimal::new(33, 2));
    }
}
