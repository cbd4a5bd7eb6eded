//! Page object for the portal's booking wizard.
//!
//! The wizard is one long Angular form: service and venue dropdowns, the
//! calendar, a time dropdown and the personal-data fields. The portal
//! frequently serves the page half-initialised (service dropdown left with
//! only its placeholder), so every reload validates the form and retries.
//!
//! "No slots for this venue" is not an error here: the portal reports it
//! through an informational dialog, which maps to `Ok(false)`/`Ok(None)`
//! results. Errors are reserved for broken pages and dead browsers.

use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use std::sync::Arc;
use thiserror::Error;

use crate::backend::{BrowserBackend, Locator};
use crate::datepicker::{DatePicker, DatePickerError};
use crate::dialog::{DialogError, DialogTiming, DialogWatcher};
use crate::logging::BotLogger;
use crate::page::PageShell;
use crate::session::{PortalSession, SessionError};
use crate::types::{AppointmentInfo, LocationInfo, PersonInfo};

const SERVICE: Locator = Locator::Id("servicios");
const CENTER: Locator = Locator::Id("centros");
const TIME: Locator = Locator::Id("hora");
const NAME: Locator = Locator::Id("nameInput");
const SURNAME: Locator = Locator::Id("surnameInput");
const DOCUMENT_TYPE: Locator = Locator::Id("tipoDocumentos");
const DOCUMENT: Locator = Locator::Id("nifInput");
const PHONE: Locator = Locator::Id("tlfnoInput");
const EMAIL: Locator = Locator::Id("emailInput");

const SUBMIT_BUTTON: &str = "//*[@id=\"appointmentForm\"]/div[20]/div/button[1]";

/// Reloads attempted before declaring the page broken.
const RELOAD_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
pub enum CreationError {
    /// The service dropdown never populated; the portal is serving a broken
    /// page.
    #[error("booking page loaded without services after {0} attempts")]
    LoadedWrong(u32),
    /// A time option did not match `HH:mm`; the markup changed.
    #[error("unexpected time option format '{0}'")]
    TimeFormat(String),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Dialog(#[from] DialogError),
    #[error(transparent)]
    DatePicker(#[from] DatePickerError),
}

/// Earliest date that could still be "today" anywhere in the world. The
/// portal renders dates in its own timezone, which we do not know; starting
/// the search at UTC-12 can never skip a valid slot.
pub fn earliest_local_today() -> NaiveDate {
    (Utc::now() - ChronoDuration::hours(12)).date_naive()
}

/// The booking wizard, bound to its own tab.
pub struct CreationPage<B: BrowserBackend> {
    shell: PageShell<B>,
    timing: DialogTiming,
    logger: Arc<BotLogger>,
}

impl<B: BrowserBackend> CreationPage<B> {
    pub fn new(
        session: Arc<PortalSession<B>>,
        url: impl Into<String>,
        timing: DialogTiming,
        logger: Arc<BotLogger>,
    ) -> Self {
        Self {
            shell: PageShell::new(session, url, Arc::clone(&logger)),
            timing,
            logger,
        }
    }

    fn session(&self) -> &PortalSession<B> {
        self.shell.session()
    }

    fn dialogs(&self) -> DialogWatcher<'_, B> {
        DialogWatcher::new(self.session(), self.timing.clone())
    }

    pub async fn is_open(&self) -> bool {
        self.shell.is_open().await
    }

    /// Ensure the wizard is open in its tab; navigates only when needed.
    pub async fn open(&self) -> Result<(), CreationError> {
        if self.shell.open().await? {
            self.validate_form().await?;
        } else {
            self.shell.activate().await?;
        }
        Ok(())
    }

    /// Re-navigate and wait for a usable form.
    pub async fn reload(&self) -> Result<(), CreationError> {
        self.shell.open().await?;
        self.shell.reload().await?;
        self.validate_form().await
    }

    pub async fn close(&self) -> Result<(), CreationError> {
        self.shell.close().await?;
        Ok(())
    }

    /// Wait for the page to settle and the service dropdown to carry real
    /// options, re-navigating while it does not.
    async fn validate_form(&self) -> Result<(), CreationError> {
        for attempt in 0..RELOAD_ATTEMPTS {
            self.dialogs().settle().await?;
            if self.shell.select_field(SERVICE).len().await? > 1 {
                return Ok(());
            }
            self.logger.warn(
                "creation",
                format!("booking page loaded without services (attempt {})", attempt + 1),
            );
            self.shell.reload().await?;
        }
        Err(CreationError::LoadedWrong(RELOAD_ATTEMPTS))
    }

    /// Select service and venue. `Ok(false)` when the portal answers with an
    /// informational dialog (location not bookable right now).
    pub async fn select_location(&self, location: &LocationInfo) -> Result<bool, CreationError> {
        self.shell.select_field(SERVICE).select_label(&location.service).await?;
        self.dialogs().settle().await?;

        // Clearing first forces the change event even when the venue is
        // already selected from a previous pass.
        let center = self.shell.select_field(CENTER);
        center.select_index(0).await?;
        center.select_label(&location.center).await?;
        self.dialogs().settle().await?;

        match self.dialogs().informational().await? {
            Some(dialog) => {
                self.logger.info(
                    "creation",
                    format!("location rejected: {} ({location})", dialog.content()),
                );
                self.dialogs().close(&dialog).await?;
                Ok(false)
            }
            None => Ok(true),
        }
    }

    /// Earliest bookable date for `location` strictly before `before`.
    pub async fn first_available_date(
        &self,
        location: &LocationInfo,
        before: NaiveDate,
    ) -> Result<Option<NaiveDate>, CreationError> {
        self.reload().await?;
        if !self.select_location(location).await? {
            return Ok(None);
        }
        let picker = DatePicker::new(self.session());
        picker.open().await?;
        let found = picker
            .first_available_day(earliest_local_today(), before)
            .await?;
        picker.close().await?;
        Ok(found)
    }

    /// Pick `date` in the calendar and take the first offered time slot.
    /// `Ok(None)` when the date is not available after all or every slot of
    /// the day is rejected.
    pub async fn select_date_and_time(
        &self,
        date: NaiveDate,
    ) -> Result<Option<NaiveDateTime>, CreationError> {
        let picker = DatePicker::new(self.session());
        picker.open().await?;
        if !picker.is_date_available(date).await? {
            picker.close().await?;
            return Ok(None);
        }
        picker.pick(date).await?;
        let time = self.select_first_available_time().await?;
        picker.close().await?;
        Ok(time.map(|t| date.and_time(t)))
    }

    /// Select the first real option of the time dropdown. The leading
    /// placeholder has an empty label and is skipped.
    async fn select_first_available_time(&self) -> Result<Option<NaiveTime>, CreationError> {
        let field = self.shell.select_field(TIME);
        let options = field.options().await?;
        let Some(option) = options.iter().find(|o| !o.label.trim().is_empty()) else {
            return Ok(None);
        };
        let label = option.label.trim().to_string();
        field.select_index(option.index).await?;
        self.dialogs().settle().await?;

        if let Some(dialog) = self.dialogs().informational().await? {
            self.logger.info(
                "creation",
                format!("time slot rejected: {}", dialog.content()),
            );
            self.dialogs().close(&dialog).await?;
            return Ok(None);
        }
        let time = NaiveTime::parse_from_str(&label, "%H:%M")
            .map_err(|_| CreationError::TimeFormat(label))?;
        Ok(Some(time))
    }

    /// Select location, date and time in one go.
    pub async fn set_location_and_datetime(
        &self,
        location: &LocationInfo,
        date: NaiveDate,
    ) -> Result<Option<NaiveDateTime>, CreationError> {
        self.open().await?;
        if !self.select_location(location).await? {
            return Ok(None);
        }
        self.select_date_and_time(date).await
    }

    /// Fill the personal-data fields verbatim.
    pub async fn fill_personal_info(&self, person: &PersonInfo) -> Result<(), CreationError> {
        self.open().await?;
        self.shell.text_field(NAME).set(&person.name).await?;
        self.shell.text_field(SURNAME).set(&person.surname).await?;
        self.shell
            .select_field(DOCUMENT_TYPE)
            .select_label(&person.document_type)
            .await?;
        self.shell.text_field(DOCUMENT).set(&person.document).await?;
        self.shell.text_field(PHONE).set(&person.phone_number).await?;
        self.shell.text_field(EMAIL).set(&person.email).await?;
        Ok(())
    }

    /// Submit the form. Success means the portal raised no dialog and
    /// navigated away from the wizard.
    pub async fn submit(&self) -> Result<bool, CreationError> {
        self.shell.activate().await?;
        self.session()
            .click(&Locator::xpath(SUBMIT_BUTTON.to_string()))
            .await?;

        if let Some(dialog) = self.dialogs().informational().await? {
            self.logger
                .warn("creation", format!("submit rejected: {}", dialog.content()));
            self.dialogs().close(&dialog).await?;
            return Ok(false);
        }
        Ok(self.session().current_url().await? != self.shell.url())
    }

    /// Book `info` on exactly `date`. Returns the confirmed slot time, or
    /// `None` when the date turned out to be unavailable or the submit was
    /// rejected.
    pub async fn create_appointment(
        &self,
        info: &AppointmentInfo,
        date: NaiveDate,
    ) -> Result<Option<NaiveDateTime>, CreationError> {
        self.reload().await?;
        let Some(booked_at) = self.set_location_and_datetime(&info.location, date).await? else {
            return Ok(None);
        };
        self.fill_personal_info(&info.person).await?;
        if self.submit().await? {
            self.logger
                .info("creation", format!("appointment submitted for {booked_at}"));
            self.reload().await?;
            Ok(Some(booked_at))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, SelectOption, TabHandle};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Form-level scripted backend: selects and text inputs keyed by
    /// locator, a settable URL, and an optional dialog raised by the next
    /// submit click.
    #[derive(Default)]
    struct FormState {
        selects: HashMap<String, Vec<String>>,
        selected: HashMap<String, usize>,
        inputs: HashMap<String, String>,
        url: String,
        windows: Vec<String>,
        next_window: u32,
        /// Dialog content raised after the next submit/center select.
        dialog_on_submit: Option<String>,
        dialog_on_center: Option<String>,
        dialog_active: Option<String>,
        url_after_submit: Option<String>,
        service_options_after_reload: Option<Vec<String>>,
        reloads: u32,
    }

    #[derive(Default)]
    struct FormBackend {
        state: Mutex<FormState>,
    }

    impl FormBackend {
        fn booking_page() -> Self {
            let backend = FormBackend::default();
            {
                let mut state = backend.state.lock().unwrap();
                state.windows = vec!["w0".into()];
                state.next_window = 1;
                state.selects.insert(
                    "#servicios".into(),
                    vec!["".into(), "PADRON CP".into(), "ATENCION".into()],
                );
                state.selects.insert(
                    "#centros".into(),
                    vec!["".into(), "OAC TABACALERA".into(), "JUNTA ABASTOS".into()],
                );
                state
                    .selects
                    .insert("#hora".into(), vec!["".into(), "09:30".into(), "10:00".into()]);
                state.selects.insert(
                    "#tipoDocumentos".into(),
                    vec!["".into(), "Pasaporte".into(), "NIE".into()],
                );
            }
            backend
        }
    }

    #[async_trait]
    impl BrowserBackend for FormBackend {
        async fn launch(&self) -> Result<TabHandle, BackendError> {
            let mut state = self.state.lock().unwrap();
            state.windows = vec!["w0".into()];
            Ok(TabHandle("w0".into()))
        }
        async fn shutdown(&self) -> Result<(), BackendError> {
            self.state.lock().unwrap().windows.clear();
            Ok(())
        }
        async fn windows(&self) -> Result<Vec<TabHandle>, BackendError> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .windows
                .iter()
                .cloned()
                .map(TabHandle)
                .collect())
        }
        async fn open_window(&self) -> Result<TabHandle, BackendError> {
            let mut state = self.state.lock().unwrap();
            let id = format!("w{}", state.next_window);
            state.next_window += 1;
            state.windows.push(id.clone());
            Ok(TabHandle(id))
        }
        async fn switch_window(&self, _tab: &TabHandle) -> Result<(), BackendError> {
            Ok(())
        }
        async fn close_window(&self, tab: &TabHandle) -> Result<(), BackendError> {
            self.state.lock().unwrap().windows.retain(|w| w != &tab.0);
            Ok(())
        }
        async fn active_window(&self) -> Result<TabHandle, BackendError> {
            let state = self.state.lock().unwrap();
            Ok(TabHandle(state.windows[0].clone()))
        }
        async fn navigate(&self, url: &str) -> Result<(), BackendError> {
            let mut state = self.state.lock().unwrap();
            state.url = url.to_string();
            state.reloads += 1;
            // Scripted pages populate only on the second navigation.
            if state.reloads >= 2 {
                if let Some(options) = state.service_options_after_reload.take() {
                    state.selects.insert("#servicios".into(), options);
                }
            }
            Ok(())
        }
        async fn current_url(&self) -> Result<String, BackendError> {
            Ok(self.state.lock().unwrap().url.clone())
        }

        async fn text(&self, locator: &Locator) -> Result<String, BackendError> {
            let key = locator.to_string();
            let state = self.state.lock().unwrap();
            if let Some(content) = &state.dialog_active {
                if key == "/html/body/div[1]/div[2]/div[2]/span" {
                    return Ok(content.clone());
                }
            }
            Err(BackendError::ElementNotFound(key))
        }

        async fn attribute(
            &self,
            locator: &Locator,
            _name: &str,
        ) -> Result<Option<String>, BackendError> {
            let key = locator.to_string();
            let state = self.state.lock().unwrap();
            if state.dialog_active.is_some() {
                if key == "/html/body/div[1]" {
                    return Ok(Some("custom-dialog ng-scope".into()));
                }
                if key == "/html/body/div[1]/div[2]/div[1]" {
                    return Ok(Some("custom-dialog-header information".into()));
                }
            }
            Err(BackendError::ElementNotFound(key))
        }

        async fn click(&self, locator: &Locator) -> Result<(), BackendError> {
            let key = locator.to_string();
            let mut state = self.state.lock().unwrap();
            if key == SUBMIT_BUTTON {
                if let Some(content) = state.dialog_on_submit.take() {
                    state.dialog_active = Some(content);
                } else if let Some(url) = state.url_after_submit.take() {
                    state.url = url;
                }
                return Ok(());
            }
            if key.contains("/div[2]/div[3]/button[") {
                state.dialog_active = None;
                return Ok(());
            }
            Ok(())
        }

        async fn clear_and_type(
            &self,
            locator: &Locator,
            text: &str,
        ) -> Result<(), BackendError> {
            self.state
                .lock()
                .unwrap()
                .inputs
                .insert(locator.to_string(), text.to_string());
            Ok(())
        }

        async fn select_options(
            &self,
            locator: &Locator,
        ) -> Result<Vec<SelectOption>, BackendError> {
            let key = locator.to_string();
            let state = self.state.lock().unwrap();
            state
                .selects
                .get(&key)
                .map(|labels| {
                    labels
                        .iter()
                        .enumerate()
                        .map(|(index, label)| SelectOption {
                            index,
                            label: label.clone(),
                        })
                        .collect()
                })
                .ok_or(BackendError::ElementNotFound(key))
        }

        async fn selected_option(
            &self,
            locator: &Locator,
        ) -> Result<Option<SelectOption>, BackendError> {
            let key = locator.to_string();
            let state = self.state.lock().unwrap();
            let labels = state
                .selects
                .get(&key)
                .ok_or(BackendError::ElementNotFound(key.clone()))?;
            Ok(state.selected.get(&key).map(|&index| SelectOption {
                index,
                label: labels[index].clone(),
            }))
        }

        async fn select_by_index(
            &self,
            locator: &Locator,
            index: usize,
        ) -> Result<(), BackendError> {
            let key = locator.to_string();
            let mut state = self.state.lock().unwrap();
            if !state.selects.contains_key(&key) {
                return Err(BackendError::ElementNotFound(key));
            }
            state.selected.insert(key, index);
            Ok(())
        }

        async fn select_by_label(
            &self,
            locator: &Locator,
            label: &str,
        ) -> Result<(), BackendError> {
            let key = locator.to_string();
            let mut state = self.state.lock().unwrap();
            let labels = state
                .selects
                .get(&key)
                .ok_or(BackendError::ElementNotFound(key.clone()))?;
            let index = labels
                .iter()
                .position(|l| l == label)
                .ok_or_else(|| BackendError::InvalidElement(format!("no option '{label}'")))?;
            let raised = if key == "#centros" {
                state.dialog_on_center.take()
            } else {
                None
            };
            if let Some(content) = raised {
                state.dialog_active = Some(content);
            }
            state.selected.insert(key, index);
            Ok(())
        }

    }

    const URL: &str = "http://portal.example/#!/newAppointment/";

    fn fast_timing() -> DialogTiming {
        DialogTiming {
            pre_delay: Duration::ZERO,
            poll_interval: Duration::ZERO,
            max_empty_polls: 1,
        }
    }

    fn page(backend: FormBackend) -> CreationPage<FormBackend> {
        let session = Arc::new(PortalSession::new(backend, BotLogger::disabled()));
        CreationPage::new(session, URL, fast_timing(), BotLogger::disabled())
    }

    fn location() -> LocationInfo {
        LocationInfo::new("PADRON CP", "OAC TABACALERA")
    }

    fn person() -> PersonInfo {
        PersonInfo {
            name: "Name".into(),
            surname: "Surname".into(),
            document_type: "Pasaporte".into(),
            document: "761234566".into(),
            phone_number: "681123456".into(),
            email: "email@email.com".into(),
        }
    }

    #[tokio::test]
    async fn reload_retries_until_services_populate() {
        let backend = FormBackend::booking_page();
        {
            let mut state = backend.state.lock().unwrap();
            // First load: placeholder only. After one re-navigation the
            // dropdown populates.
            state.service_options_after_reload =
                Some(vec!["".into(), "PADRON CP".into(), "ATENCION".into()]);
            state.selects.insert("#servicios".into(), vec!["".into()]);
        }
        let page = page(backend);
        page.open().await.expect("opens after retry");
    }

    #[tokio::test]
    async fn reload_gives_up_on_permanently_broken_page() {
        let backend = FormBackend::booking_page();
        backend
            .state
            .lock()
            .unwrap()
            .selects
            .insert("#servicios".into(), vec!["".into()]);
        let page = page(backend);
        let err = page.open().await.unwrap_err();
        assert!(matches!(err, CreationError::LoadedWrong(_)));
    }

    #[tokio::test]
    async fn select_location_sets_both_dropdowns() {
        let page = page(FormBackend::booking_page());
        page.open().await.unwrap();
        let accepted = page.select_location(&location()).await.unwrap();
        assert!(accepted);

        let state = page.session().backend().state.lock().unwrap();
        assert_eq!(state.selected["#servicios"], 1);
        assert_eq!(state.selected["#centros"], 1);
    }

    #[tokio::test]
    async fn select_location_reports_portal_rejection() {
        let backend = FormBackend::booking_page();
        backend.state.lock().unwrap().dialog_on_center =
            Some("No hay citas disponibles".into());
        let page = page(backend);
        page.open().await.unwrap();

        let accepted = page.select_location(&location()).await.unwrap();
        assert!(!accepted);
        // The dialog must have been dismissed.
        assert!(page
            .session()
            .backend()
            .state
            .lock()
            .unwrap()
            .dialog_active
            .is_none());
    }

    #[tokio::test]
    async fn fill_personal_info_writes_every_field() {
        let page = page(FormBackend::booking_page());
        page.open().await.unwrap();
        page.fill_personal_info(&person()).await.unwrap();

        let state = page.session().backend().state.lock().unwrap();
        assert_eq!(state.inputs["#nameInput"], "Name");
        assert_eq!(state.inputs["#surnameInput"], "Surname");
        assert_eq!(state.inputs["#nifInput"], "761234566");
        assert_eq!(state.inputs["#tlfnoInput"], "681123456");
        assert_eq!(state.inputs["#emailInput"], "email@email.com");
        assert_eq!(state.selected["#tipoDocumentos"], 1);
    }

    #[tokio::test]
    async fn submit_succeeds_when_url_moves_and_no_dialog() {
        let backend = FormBackend::booking_page();
        backend.state.lock().unwrap().url_after_submit =
            Some("http://portal.example/#!/confirmed".into());
        let page = page(backend);
        page.open().await.unwrap();
        assert!(page.submit().await.unwrap());
    }

    #[tokio::test]
    async fn submit_fails_when_dialog_appears() {
        let backend = FormBackend::booking_page();
        backend.state.lock().unwrap().dialog_on_submit = Some("Error de cita".into());
        let page = page(backend);
        page.open().await.unwrap();
        assert!(!page.submit().await.unwrap());
    }

    #[tokio::test]
    async fn submit_fails_when_url_does_not_move() {
        let page = page(FormBackend::booking_page());
        page.open().await.unwrap();
        assert!(!page.submit().await.unwrap());
    }

    #[tokio::test]
    async fn first_time_option_is_parsed_strictly() {
        let page = page(FormBackend::booking_page());
        page.open().await.unwrap();
        let time = page.select_first_available_time().await.unwrap();
        assert_eq!(time, Some(NaiveTime::from_hms_opt(9, 30, 0).unwrap()));
    }

    #[tokio::test]
    async fn malformed_time_option_is_fatal() {
        let backend = FormBackend::booking_page();
        backend
            .state
            .lock()
            .unwrap()
            .selects
            .insert("#hora".into(), vec!["".into(), "9.30 AM".into()]);
        let page = page(backend);
        page.open().await.unwrap();
        let err = page.select_first_available_time().await.unwrap_err();
        assert!(matches!(err, CreationError::TimeFormat(_)));
    }

    #[tokio::test]
    async fn empty_time_dropdown_yields_none() {
        let backend = FormBackend::booking_page();
        backend
            .state
            .lock()
            .unwrap()
            .selects
            .insert("#hora".into(), vec!["".into()]);
        let page = page(backend);
        page.open().await.unwrap();
        assert!(page.select_first_available_time().await.unwrap().is_none());
    }
}
