//! The polling control loop.
//!
//! Every cycle, for each tracked request: refresh the booking we currently
//! hold, search for a slot strictly earlier than the bound, and if one
//! exists cancel-then-rebook and verify the result against the portal's own
//! list. A cycle that finds nothing better is a success; cancel or create
//! failures fail the pass, which is retried under an exponential backoff
//! instead of waiting for the next poll.
//!
//! The scheduler talks to the portal through [`BookingPortal`] so the loop
//! logic is testable without a browser; [`PagePortal`] is the production
//! implementation over the two page objects.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use thiserror::Error;
use tokio::sync::watch;

use crate::appointments::{AppointmentsError, AppointmentsPage};
use crate::backend::BrowserBackend;
use crate::config::{BackoffPolicy, TrackedEntry};
use crate::creation::{CreationError, CreationPage};
use crate::logging::BotLogger;
use crate::notify::{Notifier, StatusSource};
use crate::session::{PortalSession, SessionError};
use crate::types::{AppointmentInfo, AppointmentWorkInfo, BookingOutcome, LocationInfo};

#[derive(Debug, Error)]
pub enum PortalError {
    #[error(transparent)]
    Appointments(#[from] AppointmentsError),
    #[error(transparent)]
    Creation(#[from] CreationError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Portal operations the control loop needs, one cycle's worth.
#[async_trait]
pub trait BookingPortal: Send + Sync {
    /// Time of the booking currently held for `location`, per the portal's
    /// own list.
    async fn existing_appointment(
        &self,
        document: &str,
        location: &LocationInfo,
    ) -> Result<Option<NaiveDateTime>, PortalError>;

    /// Earliest bookable date strictly before `before`.
    async fn first_available_date(
        &self,
        location: &LocationInfo,
        before: NaiveDate,
    ) -> Result<Option<NaiveDate>, PortalError>;

    /// Cancel the held booking. `Ok(false)` when the portal lists none.
    async fn cancel_appointment(
        &self,
        document: &str,
        location: &LocationInfo,
    ) -> Result<bool, PortalError>;

    /// Book `info` on exactly `date`, returning the confirmed slot.
    async fn create_appointment(
        &self,
        info: &AppointmentInfo,
        date: NaiveDate,
    ) -> Result<Option<NaiveDateTime>, PortalError>;

    /// Tear down any live browser state after a failed pass.
    async fn recover(&self);
}

/// Production portal over the two page objects sharing one browser.
pub struct PagePortal<B: BrowserBackend> {
    session: Arc<PortalSession<B>>,
    creation: CreationPage<B>,
    appointments: AppointmentsPage<B>,
    logger: Arc<BotLogger>,
}

impl<B: BrowserBackend> PagePortal<B> {
    pub fn new(
        session: Arc<PortalSession<B>>,
        creation: CreationPage<B>,
        appointments: AppointmentsPage<B>,
        logger: Arc<BotLogger>,
    ) -> Self {
        Self {
            session,
            creation,
            appointments,
            logger,
        }
    }
}

#[async_trait]
impl<B: BrowserBackend> BookingPortal for PagePortal<B> {
    async fn existing_appointment(
        &self,
        document: &str,
        location: &LocationInfo,
    ) -> Result<Option<NaiveDateTime>, PortalError> {
        self.appointments.open(document).await?;
        let found = self.appointments.find(location).await?;
        Ok(found.map(|appointment| appointment.time))
    }

    async fn first_available_date(
        &self,
        location: &LocationInfo,
        before: NaiveDate,
    ) -> Result<Option<NaiveDate>, PortalError> {
        Ok(self.creation.first_available_date(location, before).await?)
    }

    async fn cancel_appointment(
        &self,
        document: &str,
        location: &LocationInfo,
    ) -> Result<bool, PortalError> {
        // Re-query first: the listed rows go stale across page activity.
        self.appointments.open(document).await?;
        Ok(self.appointments.cancel(location).await?)
    }

    async fn create_appointment(
        &self,
        info: &AppointmentInfo,
        date: NaiveDate,
    ) -> Result<Option<NaiveDateTime>, PortalError> {
        Ok(self.creation.create_appointment(info, date).await?)
    }

    async fn recover(&self) {
        self.logger
            .warn("scheduler", "recovering: closing browser session");
        if let Err(err) = self.session.close().await {
            self.logger
                .warn("scheduler", format!("browser close during recovery failed: {err}"));
        }
    }
}

/// Shared view of the tracked requests, answering subscriber queries.
pub struct SchedulerStatus {
    entries: Arc<Mutex<Vec<AppointmentWorkInfo>>>,
}

impl StatusSource for SchedulerStatus {
    fn status_lines(&self) -> Vec<String> {
        let entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries
            .iter()
            .map(|work| match work.existing_appointment {
                Some(time) => {
                    format!("Info: {}. Current appointment date: {time}.", work.info)
                }
                None => format!("Info: {}. Now we have no appointment.", work.info),
            })
            .collect()
    }
}

/// The polling scheduler driving one portal for a set of tracked requests.
pub struct Scheduler<P: BookingPortal> {
    portal: P,
    notifier: Arc<dyn Notifier>,
    entries: Arc<Mutex<Vec<AppointmentWorkInfo>>>,
    poll_delay: Duration,
    backoff: BackoffPolicy,
    logger: Arc<BotLogger>,
}

impl<P: BookingPortal> Scheduler<P> {
    pub fn new(
        portal: P,
        notifier: Arc<dyn Notifier>,
        entries: Vec<TrackedEntry>,
        poll_delay: Duration,
        backoff: BackoffPolicy,
        logger: Arc<BotLogger>,
    ) -> Self {
        let entries = entries
            .into_iter()
            .map(|entry| AppointmentWorkInfo::new(entry.appointment, entry.before_date))
            .collect();
        Self {
            portal,
            notifier,
            entries: Arc::new(Mutex::new(entries)),
            poll_delay,
            backoff,
            logger,
        }
    }

    /// Status handle to hand to the notifier's subscriber loop.
    pub fn status(&self) -> Arc<SchedulerStatus> {
        Arc::new(SchedulerStatus {
            entries: Arc::clone(&self.entries),
        })
    }

    fn entry_count(&self) -> usize {
        match self.entries.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    fn entry_at(&self, index: usize) -> Option<AppointmentWorkInfo> {
        match self.entries.lock() {
            Ok(guard) => guard.get(index).cloned(),
            Err(poisoned) => poisoned.into_inner().get(index).cloned(),
        }
    }

    fn store_entry(&self, index: usize, work: AppointmentWorkInfo) {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(slot) = entries.get_mut(index) {
            *slot = work;
        }
    }

    /// Run until `shutdown` flips to true. Clean passes wait the poll
    /// delay; failed passes retry under the backoff policy, which resets on
    /// the next clean pass.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut consecutive_failures: u32 = 0;
        loop {
            let clean = self.run_pass().await;
            let delay = if clean {
                consecutive_failures = 0;
                self.poll_delay
            } else {
                let delay = self.backoff.delay_for(consecutive_failures);
                consecutive_failures = consecutive_failures.saturating_add(1);
                self.logger.warn(
                    "scheduler",
                    format!(
                        "pass failed ({consecutive_failures} in a row), retrying in {delay:?}"
                    ),
                );
                delay
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    // A dropped sender counts as shutdown too.
                    if changed.is_err() || *shutdown.borrow() {
                        self.logger.info("scheduler", "shutdown requested");
                        return;
                    }
                }
            }
        }
    }

    /// One pass over every tracked request. Returns whether all of them
    /// completed without failure.
    pub async fn run_pass(&self) -> bool {
        let mut clean = true;
        for index in 0..self.entry_count() {
            let Some(mut work) = self.entry_at(index) else { break };
            match self.run_entry(&mut work).await {
                Ok(outcome) => {
                    self.store_entry(index, work);
                    match outcome {
                        BookingOutcome::NoBetterDate | BookingOutcome::Created(_) => {}
                        BookingOutcome::CancelFailed(_) | BookingOutcome::CreateFailed(_) => {
                            clean = false;
                        }
                    }
                }
                Err(err) => {
                    self.store_entry(index, work);
                    self.logger
                        .error("scheduler", format!("pass failed with error: {err}"));
                    self.portal.recover().await;
                    clean = false;
                }
            }
        }
        clean
    }

    /// One scheduling cycle for one tracked request.
    async fn run_entry(
        &self,
        work: &mut AppointmentWorkInfo,
    ) -> Result<BookingOutcome, PortalError> {
        let document = work.info.person.document.clone();
        let location = work.info.location.clone();

        let held = self
            .portal
            .existing_appointment(&document, &location)
            .await?;
        if held.is_none() && work.existing_appointment.is_some() {
            self.logger.warn(
                "scheduler",
                format!("booking for {location} disappeared since last check"),
            );
            self.notifier
                .broadcast("Warning: existing appointment was removed since last check.")
                .await;
        }
        work.existing_appointment = held;

        let before = work.before_date();
        let Some(date) = self
            .portal
            .first_available_date(&location, before)
            .await?
        else {
            self.logger
                .debug("scheduler", format!("no date before {before} for {location}"));
            return Ok(BookingOutcome::NoBetterDate);
        };

        self.logger
            .info("scheduler", format!("found available date {date} for {location}"));
        self.notifier
            .broadcast(&format!("Found available date {date}."))
            .await;

        if work.existing_appointment.is_some() {
            let cancelled = self.portal.cancel_appointment(&document, &location).await?;
            if !cancelled {
                self.notifier
                    .broadcast("Error: appointment was not cancelled, but it exists.")
                    .await;
                return Ok(BookingOutcome::CancelFailed(date));
            }
            work.existing_appointment = None;
        }

        let Some(created) = self.portal.create_appointment(&work.info, date).await? else {
            self.notifier
                .broadcast(&format!(
                    "Error: appointment was not created but a date was found: {date}."
                ))
                .await;
            return Ok(BookingOutcome::CreateFailed(date));
        };

        // Trust the portal's list over the wizard's confirmation.
        let verified = self
            .portal
            .existing_appointment(&document, &location)
            .await?;
        if verified == Some(created) {
            work.existing_appointment = Some(created);
            self.logger.info(
                "scheduler",
                format!("created appointment at {created} for {location}"),
            );
            self.notifier
                .broadcast(&format!(
                    "New appointment created! Date: {created}. Info: {}.",
                    work.info
                ))
                .await;
            Ok(BookingOutcome::Created(created))
        } else {
            self.notifier
                .broadcast(&format!(
                    "Error: appointment was not created but a date was found: {date}."
                ))
                .await;
            Ok(BookingOutcome::CreateFailed(date))
        }
    }
}
