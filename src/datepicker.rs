//! Driver for the booking form's Angular calendar widget.
//!
//! The calendar renders a fixed 7x6 day grid with no per-day ids, so day
//! cells are addressed by computed grid position: locate the cell showing
//! "1", then offset from it. Day states are encoded purely in CSS classes;
//! any class outside the known set means the portal markup changed and the
//! whole run must stop rather than guess.

use chrono::{Datelike, NaiveDate};
use thiserror::Error;

use crate::backend::{BrowserBackend, Locator};
use crate::dates::{days_in_month, first_of_next_month, month_difference};
use crate::session::{PortalSession, SessionError};

/// Container of the calendar dropdown inside the booking form.
const PICKER_ROOT: &str = "//*[@id=\"appointmentForm\"]/div[7]/div/div";

/// Month abbreviations as the portal renders them in the calendar header.
const MONTH_ABBREVIATIONS: [&str; 12] = [
    "ene", "feb", "mar", "abr", "may", "jun", "jul", "ago", "sep", "oct", "nov", "dic",
];

const GRID_COLUMNS: usize = 7;
const GRID_ROWS: usize = 6;

/// Known day-cell classes. Exact-match: the markup is generated and never
/// carries extra classes.
const DAY_AVAILABLE: &str = "day ng-binding ng-scope";
const DAY_DISABLED: &str = "day ng-binding ng-scope disabled";
const DAY_PAST: &str = "day ng-binding ng-scope past disabled";
const DAY_CURRENT: &str = "day ng-binding ng-scope current disabled";

#[derive(Debug, Error)]
pub enum DatePickerError {
    #[error("unknown month abbreviation '{0}' in calendar header")]
    UnknownMonthAbbreviation(String),
    #[error("malformed calendar header text '{0}'")]
    MalformedHeader(String),
    #[error("day cell has unknown class '{0}'")]
    UnknownDayState(String),
    #[error("day 1 not found in calendar grid")]
    FirstDayNotFound,
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Parse the calendar header ("2022 jun") into the first of that month.
pub fn parse_year_month(header: &str) -> Result<NaiveDate, DatePickerError> {
    let header = header.trim();
    let mut parts = header.split_whitespace();
    let (Some(year_part), Some(abbreviation), None) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(DatePickerError::MalformedHeader(header.to_string()));
    };
    let year: i32 = year_part
        .parse()
        .map_err(|_| DatePickerError::MalformedHeader(header.to_string()))?;
    let month = MONTH_ABBREVIATIONS
        .iter()
        .position(|&m| m == abbreviation)
        .ok_or_else(|| DatePickerError::UnknownMonthAbbreviation(abbreviation.to_string()))?
        as u32
        + 1;
    NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| DatePickerError::MalformedHeader(header.to_string()))
}

/// Grid position of `day` (1-based), given the position of day 1.
pub fn day_position(day: u32, first: (usize, usize)) -> (usize, usize) {
    let offset = first.0 + day as usize - 1;
    (offset % GRID_COLUMNS, first.1 + offset / GRID_COLUMNS)
}

/// The calendar widget on an open booking page.
pub struct DatePicker<'a, B: BrowserBackend> {
    session: &'a PortalSession<B>,
}

impl<'a, B: BrowserBackend> DatePicker<'a, B> {
    pub fn new(session: &'a PortalSession<B>) -> Self {
        Self { session }
    }

    fn toggle_locator() -> Locator {
        Locator::xpath(format!("{PICKER_ROOT}/button"))
    }

    fn header_locator() -> Locator {
        Locator::xpath(format!("{PICKER_ROOT}/ul/div/table/thead/tr[1]/th[2]"))
    }

    fn arrow_locator(forward: bool) -> Locator {
        let cell = if forward { 3 } else { 1 };
        Locator::xpath(format!("{PICKER_ROOT}/ul/div/table/thead/tr[1]/th[{cell}]"))
    }

    fn day_locator(x: usize, y: usize) -> Locator {
        Locator::xpath(format!(
            "{PICKER_ROOT}/ul/div/table/tbody/tr[{}]/td[{}]",
            y + 1,
            x + 1
        ))
    }

    pub async fn is_open(&self) -> Result<bool, DatePickerError> {
        let class = self
            .session
            .attribute(&Locator::xpath(PICKER_ROOT.to_string()), "class")
            .await?
            .unwrap_or_default();
        Ok(class == "dropdown open")
    }

    pub async fn open(&self) -> Result<(), DatePickerError> {
        if !self.is_open().await? {
            self.session.click(&Self::toggle_locator()).await?;
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<(), DatePickerError> {
        if self.is_open().await? {
            self.session.click(&Self::toggle_locator()).await?;
        }
        Ok(())
    }

    /// First of the month the calendar currently displays.
    pub async fn current_year_month(&self) -> Result<NaiveDate, DatePickerError> {
        let header = self.session.text(&Self::header_locator()).await?;
        parse_year_month(&header)
    }

    /// Step the calendar to the month containing `target` via arrow clicks.
    pub async fn go_to(&self, target: NaiveDate) -> Result<(), DatePickerError> {
        let current = self.current_year_month().await?;
        let difference = month_difference(current, target);
        let arrow = Self::arrow_locator(difference > 0);
        for _ in 0..difference.unsigned_abs() {
            self.session.click(&arrow).await?;
        }
        Ok(())
    }

    /// Availability of `day` in the displayed month, by day-cell class.
    async fn is_day_available(&self, day: u32) -> Result<bool, DatePickerError> {
        let first = self.position_of_first_day().await?;
        let (x, y) = day_position(day, first);
        let class = self
            .session
            .attribute(&Self::day_locator(x, y), "class")
            .await?
            .unwrap_or_default();
        match class.as_str() {
            DAY_AVAILABLE => Ok(true),
            DAY_DISABLED | DAY_PAST | DAY_CURRENT => Ok(false),
            other => Err(DatePickerError::UnknownDayState(other.to_string())),
        }
    }

    /// Availability of an exact date, stepping the calendar there first.
    pub async fn is_date_available(&self, date: NaiveDate) -> Result<bool, DatePickerError> {
        self.go_to(date).await?;
        self.is_day_available(date.day()).await
    }

    /// Click the cell for `date`, stepping the calendar there first.
    pub async fn pick(&self, date: NaiveDate) -> Result<(), DatePickerError> {
        self.go_to(date).await?;
        let first = self.position_of_first_day().await?;
        let (x, y) = day_position(date.day(), first);
        self.session.click(&Self::day_locator(x, y)).await?;
        Ok(())
    }

    /// Earliest available day in `[from, before)`, scanning month by month.
    /// `None` when the range is empty or fully booked.
    pub async fn first_available_day(
        &self,
        from: NaiveDate,
        before: NaiveDate,
    ) -> Result<Option<NaiveDate>, DatePickerError> {
        if from >= before {
            return Ok(None);
        }
        self.go_to(from).await?;
        let mut current = NaiveDate::from_ymd_opt(from.year(), from.month(), 1)
            .unwrap_or(from);
        while current < before {
            let month_start = if current.year() == from.year() && current.month() == from.month()
            {
                from.day()
            } else {
                1
            };
            let month_end =
                if current.year() == before.year() && current.month() == before.month() {
                    before.day()
                } else {
                    days_in_month(current) + 1
                };

            for day in month_start..month_end {
                if self.is_day_available(day).await? {
                    let found = NaiveDate::from_ymd_opt(current.year(), current.month(), day)
                        .ok_or(DatePickerError::FirstDayNotFound)?;
                    return Ok(Some(found));
                }
            }

            current = first_of_next_month(current);
            self.session
                .click(&Self::arrow_locator(true))
                .await
                .map_err(DatePickerError::from)?;
        }
        Ok(None)
    }

    /// Locate the cell showing "1". Scanned in row order, so the displayed
    /// month's day 1 is found before the next month's leading filler.
    async fn position_of_first_day(&self) -> Result<(usize, usize), DatePickerError> {
        for y in 0..GRID_ROWS {
            for x in 0..GRID_COLUMNS {
                let text = self.session.text(&Self::day_locator(x, y)).await?;
                if text.trim().parse::<u32>() == Ok(1) {
                    return Ok((x, y));
                }
            }
        }
        Err(DatePickerError::FirstDayNotFound)
    }
}
