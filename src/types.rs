//! Value types shared across the bot.
//!
//! `LocationInfo`, `PersonInfo` and `AppointmentInfo` are plain immutable
//! values describing what to book; `AppointmentWorkInfo` is the mutable
//! scheduling cursor the control loop keeps per tracked request.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// A bookable service + venue pair. Equality is by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocationInfo {
    pub service: String,
    pub center: String,
}

impl LocationInfo {
    pub fn new(service: impl Into<String>, center: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            center: center.into(),
        }
    }
}

impl fmt::Display for LocationInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "service: '{}', center: '{}'", self.service, self.center)
    }
}

/// Applicant details written verbatim into the personal-data form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonInfo {
    pub name: String,
    pub surname: String,
    #[serde(rename = "documentType")]
    pub document_type: String,
    pub document: String,
    #[serde(rename = "phoneNumber")]
    pub phone_number: String,
    pub email: String,
}

impl fmt::Display for PersonInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "name: '{} {}', document: '{} {}'",
            self.name, self.surname, self.document_type, self.document
        )
    }
}

/// One unit of "what to book".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentInfo {
    pub location: LocationInfo,
    pub person: PersonInfo,
}

impl fmt::Display for AppointmentInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.location, self.person)
    }
}

/// Mutable scheduling cursor for one tracked request.
///
/// `existing_appointment` is refreshed every poll cycle from the portal's
/// appointment list; the derived [`before_date`](Self::before_date) is the
/// exclusive upper bound any replacement slot must beat.
#[derive(Debug, Clone)]
pub struct AppointmentWorkInfo {
    pub info: AppointmentInfo,
    before_date_original: NaiveDate,
    pub existing_appointment: Option<NaiveDateTime>,
}

impl AppointmentWorkInfo {
    pub fn new(info: AppointmentInfo, before_date: NaiveDate) -> Self {
        Self {
            info,
            before_date_original: before_date,
            existing_appointment: None,
        }
    }

    /// Exclusive upper bound for the slot search: the date of the booking we
    /// already hold, or the caller-supplied deadline when none is held.
    pub fn before_date(&self) -> NaiveDate {
        self.existing_appointment
            .map(|dt| dt.date())
            .unwrap_or(self.before_date_original)
    }
}

/// Outcome of one scheduling cycle for one tracked request, pushed to the
/// notifier as human-readable text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingOutcome {
    /// No date earlier than the bound was available.
    NoBetterDate,
    /// A new booking was created and verified at the given time.
    Created(NaiveDateTime),
    /// A date was found but cancelling the old booking failed.
    CancelFailed(NaiveDate),
    /// A date was found but creating/verifying the booking failed.
    CreateFailed(NaiveDate),
}
