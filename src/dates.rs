//! Calendar arithmetic helpers used by the date picker and scheduler.

use chrono::{Datelike, NaiveDate};

/// Signed distance in months from `from` to `to`, ignoring the day component.
/// Positive when `to` is in a later month.
pub fn month_difference(from: NaiveDate, to: NaiveDate) -> i32 {
    let years = to.year() - from.year();
    let months = to.month() as i32 - from.month() as i32;
    years * 12 + months
}

/// Number of days in the month containing `date`.
pub fn days_in_month(date: NaiveDate) -> u32 {
    let (next_year, next_month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    let first_of_next = NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .expect("month arithmetic stays in range");
    first_of_next
        .signed_duration_since(first_of_month(date))
        .num_days() as u32
}

/// First day of the month containing `date`.
pub fn first_of_month(date: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(date.year(), date.month(), 1).expect("day 1 always exists")
}

/// First day of the month after the one containing `date`.
pub fn first_of_next_month(date: NaiveDate) -> NaiveDate {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).expect("day 1 always exists")
}
