//! Page object for the portal's existing-appointments query.
//!
//! The page asks for a document number and renders the matching bookings as
//! table cells with no count anywhere, so listing probes cell indices until
//! one is missing. Row fields are free text with fixed prefixes; a row that
//! stops matching them means the portal markup changed and is reported as
//! an error rather than skipped.

use std::sync::Arc;

use chrono::NaiveDateTime;
use thiserror::Error;

use crate::backend::{BackendError, BrowserBackend, Locator};
use crate::dialog::{DialogError, DialogTiming, DialogWatcher};
use crate::logging::BotLogger;
use crate::page::PageShell;
use crate::session::{PortalSession, SessionError};
use crate::types::LocationInfo;

const DOCUMENT_FIELD: Locator = Locator::Id("nif");
const SUBMIT_BUTTON: &str =
    "/html/body/div[2]/div/div[3]/div/div/div[1]/div[2]/form/div[3]/button";
/// Results pane. Hidden until a document query ran; visible on a freshly
/// opened page it means the page rendered wrong.
const RESULTS_PANE: &str = "/html/body/div[2]/div/div[3]/div/div/div[2]";
const ROWS_ROOT: &str = "/html/body/div[2]/div/div[3]/div/div/div[2]/div[2]/table/tbody/tr[1]";
const RELOAD_ATTEMPTS: u32 = 5;

const CENTER_PREFIX: &str = "Centre: ";
const SERVICE_PREFIX: &str = "Servici: ";
const ROW_TIME_FORMAT: &str = "%d/%m/%Y - %H:%M";

#[derive(Debug, Error)]
pub enum AppointmentsError {
    /// A row rendered without the expected prefixes or time format.
    #[error("malformed appointment row: {0}")]
    MalformedRow(String),
    /// The query page never reached its expected initial state.
    #[error("query page rendered wrong after {0} reloads")]
    LoadedWrong(u32),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Dialog(#[from] DialogError),
}

/// One booking as listed by the portal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalAppointment {
    pub time: NaiveDateTime,
    pub location: LocationInfo,
    /// Cell index the row was read from, used to address its buttons.
    index: usize,
}

impl PortalAppointment {
    pub fn matches(&self, location: &LocationInfo) -> bool {
        &self.location == location
    }
}

/// The appointments-query page, bound to its own tab.
pub struct AppointmentsPage<B: BrowserBackend> {
    shell: PageShell<B>,
    timing: DialogTiming,
    logger: Arc<BotLogger>,
}

impl<B: BrowserBackend> AppointmentsPage<B> {
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

    fn row_locator(index: usize, suffix: &str) -> Locator {
        Locator::xpath(format!("{ROWS_ROOT}/td[{}]{suffix}", index + 1))
    }

    pub async fn is_open(&self) -> bool {
        self.shell.is_open().await
    }

    /// Open the page and run the query for `document`. Always re-navigates:
    /// the listed rows go stale whenever bookings change.
    pub async fn open(&self, document: &str) -> Result<(), AppointmentsError> {
        self.shell.open().await?;
        self.shell.reload().await?;
        self.validate_initial_state().await?;

        self.shell.text_field(DOCUMENT_FIELD).set(document).await?;
        self.session()
            .click(&Locator::xpath(SUBMIT_BUTTON.to_string()))
            .await?;
        self.dialogs().settle().await?;
        Ok(())
    }

    pub async fn close(&self) -> Result<(), AppointmentsError> {
        self.shell.close().await?;
        Ok(())
    }

    /// Wait for the page to settle in its expected initial state: the
    /// document field present and the results pane still hidden.
    /// Re-navigates while it is not.
    async fn validate_initial_state(&self) -> Result<(), AppointmentsError> {
        for attempt in 0..RELOAD_ATTEMPTS {
            self.dialogs().settle().await?;
            let form_ready = self.session().element_exists(&DOCUMENT_FIELD).await?;
            let results_shown = self
                .session()
                .element_exists(&Locator::xpath(RESULTS_PANE.to_string()))
                .await?;
            if form_ready && !results_shown {
                return Ok(());
            }
            self.logger.warn(
                "appointments",
                format!("query page rendered wrong, reloading (attempt {})", attempt + 1),
            );
            self.shell.reload().await?;
        }
        Err(AppointmentsError::LoadedWrong(RELOAD_ATTEMPTS))
    }

    /// All bookings currently listed, probing cells until one is missing.
    pub async fn list(&self) -> Result<Vec<PortalAppointment>, AppointmentsError> {
        self.shell.activate().await?;
        let mut appointments = Vec::new();
        let mut index = 0;
        loop {
            match self.read_row(index).await {
                Ok(appointment) => appointments.push(appointment),
                Err(AppointmentsError::Session(SessionError::Backend(
                    BackendError::ElementNotFound(_),
                ))) => break,
                Err(err) => return Err(err),
            }
            index += 1;
        }
        Ok(appointments)
    }

    /// The listed booking for `location`, if any.
    pub async fn find(
        &self,
        location: &LocationInfo,
    ) -> Result<Option<PortalAppointment>, AppointmentsError> {
        let appointments = self.list().await?;
        Ok(appointments.into_iter().find(|a| a.matches(location)))
    }

    /// Cancel the listed booking for `location`. `Ok(false)` when no such
    /// booking is listed.
    pub async fn cancel(&self, location: &LocationInfo) -> Result<bool, AppointmentsError> {
        let Some(appointment) = self.find(location).await? else {
            self.logger.warn(
                "appointments",
                format!("nothing to cancel for {location}"),
            );
            return Ok(false);
        };

        self.session()
            .click(&Self::row_locator(appointment.index, "/div/button[1]"))
            .await?;
        if let Some(dialog) = self.dialogs().informational().await? {
            self.dialogs().confirm(&dialog).await?;
        }
        self.dialogs().settle().await?;
        self.logger.info(
            "appointments",
            format!("cancelled {} at {}", location, appointment.time),
        );
        Ok(true)
    }

    async fn read_row(&self, index: usize) -> Result<PortalAppointment, AppointmentsError> {
        let time_text = self
            .session()
            .text(&Self::row_locator(index, "/p[1]"))
            .await?;
        let time = NaiveDateTime::parse_from_str(time_text.trim(), ROW_TIME_FORMAT)
            .map_err(|_| AppointmentsError::MalformedRow(time_text.clone()))?;

        let center_text = self
            .session()
            .text(&Self::row_locator(index, "/p[2]"))
            .await?;
        let center = center_text
            .strip_prefix(CENTER_PREFIX)
            .ok_or_else(|| AppointmentsError::MalformedRow(center_text.clone()))?;

        let service_text = self
            .session()
            .text(&Self::row_locator(index, "/p[3]"))
            .await?;
        let service = service_text
            .strip_prefix(SERVICE_PREFIX)
            .ok_or_else(|| AppointmentsError::MalformedRow(service_text.clone()))?;

        Ok(PortalAppointment {
            time,
            location: LocationInfo::new(service, center),
            index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SelectOption, TabHandle};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scripted query page: a list of rows, a document input and a remove
    /// confirmation dialog.
    #[derive(Default)]
    struct ListState {
        rows: Vec<(String, String, String)>,
        document: String,
        clicks: Vec<String>,
        dialog_active: bool,
        windows: Vec<String>,
        next_window: u32,
        submitted: bool,
        /// While positive, the results pane shows up before any query ran;
        /// each navigation decrements it.
        misrenders: u32,
    }

    #[derive(Default)]
    struct ListBackend {
        state: Mutex<ListState>,
    }

    impl ListBackend {
        fn with_rows(rows: &[(&str, &str, &str)]) -> Self {
            let backend = ListBackend::default();
            {
                let mut state = backend.state.lock().unwrap();
                state.windows = vec!["w0".into()];
                state.next_window = 1;
                state.rows = rows
                    .iter()
                    .map(|(t, c, s)| (t.to_string(), c.to_string(), s.to_string()))
                    .collect();
            }
            backend
        }
    }

    #[async_trait]
    impl BrowserBackend for ListBackend {
        async fn launch(&self) -> Result<TabHandle, BackendError> {
            self.state.lock().unwrap().windows = vec!["w0".into()];
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
        async fn navigate(&self, _url: &str) -> Result<(), BackendError> {
            let mut state = self.state.lock().unwrap();
            state.misrenders = state.misrenders.saturating_sub(1);
            Ok(())
        }
        async fn current_url(&self) -> Result<String, BackendError> {
            Ok(String::new())
        }

        async fn text(&self, locator: &Locator) -> Result<String, BackendError> {
            let key = locator.to_string();
            let state = self.state.lock().unwrap();
            if state.dialog_active && key == "/html/body/div[1]/div[2]/div[2]/span" {
                return Ok("Seguro que desea eliminar la cita?".into());
            }
            if key == "#nif" {
                return Ok(String::new());
            }
            if key == RESULTS_PANE {
                return if state.submitted || state.misrenders > 0 {
                    Ok(String::new())
                } else {
                    Err(BackendError::ElementNotFound(key))
                };
            }
            for (index, (time, center, service)) in state.rows.iter().enumerate() {
                let root = format!("{ROWS_ROOT}/td[{}]", index + 1);
                if key == format!("{root}/p[1]") {
                    return Ok(time.clone());
                }
                if key == format!("{root}/p[2]") {
                    return Ok(format!("Centre: {center}"));
                }
                if key == format!("{root}/p[3]") {
                    return Ok(format!("Servici: {service}"));
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
            if state.dialog_active {
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
            state.clicks.push(key.clone());
            if key == SUBMIT_BUTTON {
                state.submitted = true;
            }
            if key.ends_with("/div/button[1]") {
                state.dialog_active = true;
            }
            if key.contains("/div[2]/div[3]/button[1]") {
                // Confirmed: drop the first matching row.
                state.dialog_active = false;
                if !state.rows.is_empty() {
                    state.rows.remove(0);
                }
            }
            Ok(())
        }

        async fn clear_and_type(
            &self,
            locator: &Locator,
            text: &str,
        ) -> Result<(), BackendError> {
            if locator.to_string() == "#nif" {
                self.state.lock().unwrap().document = text.to_string();
                return Ok(());
            }
            Err(BackendError::ElementNotFound(locator.to_string()))
        }

        async fn select_options(
            &self,
            locator: &Locator,
        ) -> Result<Vec<SelectOption>, BackendError> {
            Err(BackendError::ElementNotFound(locator.to_string()))
        }
        async fn selected_option(
            &self,
            locator: &Locator,
        ) -> Result<Option<SelectOption>, BackendError> {
            Err(BackendError::ElementNotFound(locator.to_string()))
        }
        async fn select_by_index(
            &self,
            locator: &Locator,
            _index: usize,
        ) -> Result<(), BackendError> {
            Err(BackendError::ElementNotFound(locator.to_string()))
        }
        async fn select_by_label(
            &self,
            locator: &Locator,
            _label: &str,
        ) -> Result<(), BackendError> {
            Err(BackendError::ElementNotFound(locator.to_string()))
        }
    }

    fn fast_timing() -> DialogTiming {
        DialogTiming {
            pre_delay: Duration::ZERO,
            poll_interval: Duration::ZERO,
            max_empty_polls: 1,
        }
    }

    fn page(backend: ListBackend) -> AppointmentsPage<ListBackend> {
        let session = Arc::new(PortalSession::new(backend, BotLogger::disabled()));
        AppointmentsPage::new(
            session,
            "http://portal.example/#!/queryAppoinment",
            fast_timing(),
            BotLogger::disabled(),
        )
    }

    fn rows() -> Vec<(&'static str, &'static str, &'static str)> {
        vec![
            ("02/05/2022 - 09:30", "OAC TABACALERA", "PADRON CP"),
            ("13/06/2022 - 10:00", "JUNTA DE DISTRITO ABASTOS", "PADRON CP"),
        ]
    }

    #[tokio::test]
    async fn open_submits_the_document() {
        let page = page(ListBackend::with_rows(&[]));
        page.open("761234566").await.unwrap();

        let state = page.session().backend().state.lock().unwrap();
        assert_eq!(state.document, "761234566");
        assert!(state.clicks.iter().any(|c| c == SUBMIT_BUTTON));
    }

    #[tokio::test]
    async fn wrongly_rendered_query_page_is_reloaded() {
        // Results pane visible before any query: misrendered. The first
        // two navigations (open + reload) still see it; the validation
        // reload clears it.
        let backend = ListBackend::with_rows(&rows());
        backend.state.lock().unwrap().misrenders = 3;
        let page = page(backend);

        page.open("761234566").await.unwrap();

        let state = page.session().backend().state.lock().unwrap();
        assert!(state.submitted);
        assert_eq!(state.misrenders, 0);
    }

    #[tokio::test]
    async fn persistently_broken_query_page_is_an_error() {
        let backend = ListBackend::with_rows(&rows());
        backend.state.lock().unwrap().misrenders = u32::MAX;
        let page = page(backend);

        let err = page.open("761234566").await.unwrap_err();
        assert!(matches!(err, AppointmentsError::LoadedWrong(_)));
        assert!(!page.session().backend().state.lock().unwrap().submitted);
    }

    #[tokio::test]
    async fn list_parses_rows_until_first_missing() {
        let page = page(ListBackend::with_rows(&rows()));
        page.open("761234566").await.unwrap();

        let listed = page.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(
            listed[0].location,
            LocationInfo::new("PADRON CP", "OAC TABACALERA")
        );
        assert_eq!(
            listed[0].time,
            NaiveDateTime::parse_from_str("02/05/2022 - 09:30", ROW_TIME_FORMAT).unwrap()
        );
    }

    #[tokio::test]
    async fn empty_list_is_ok() {
        let page = page(ListBackend::with_rows(&[]));
        page.open("761234566").await.unwrap();
        assert!(page.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_row_time_is_an_error() {
        let backend =
            ListBackend::with_rows(&[("2022-05-02 09:30", "OAC TABACALERA", "PADRON CP")]);
        let page = page(backend);
        page.open("761234566").await.unwrap();
        let err = page.list().await.unwrap_err();
        assert!(matches!(err, AppointmentsError::MalformedRow(_)));
    }

    #[tokio::test]
    async fn find_matches_service_and_center() {
        let page = page(ListBackend::with_rows(&rows()));
        page.open("761234566").await.unwrap();

        let found = page
            .find(&LocationInfo::new("PADRON CP", "JUNTA DE DISTRITO ABASTOS"))
            .await
            .unwrap();
        assert!(found.is_some());

        let missing = page
            .find(&LocationInfo::new("PADRON CP", "JUNTA DE DISTRITO MARITIMO"))
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn cancel_clicks_remove_and_confirms_dialog() {
        let page = page(ListBackend::with_rows(&rows()));
        page.open("761234566").await.unwrap();

        let removed = page
            .cancel(&LocationInfo::new("PADRON CP", "OAC TABACALERA"))
            .await
            .unwrap();
        assert!(removed);

        let state = page.session().backend().state.lock().unwrap();
        assert!(state
            .clicks
            .iter()
            .any(|c| c.ends_with("td[1]/div/button[1]")));
        assert!(!state.dialog_active);
        assert_eq!(state.rows.len(), 1);
    }

    #[tokio::test]
    async fn cancel_reports_missing_booking() {
        let page = page(ListBackend::with_rows(&rows()));
        page.open("761234566").await.unwrap();

        let removed = page
            .cancel(&LocationInfo::new("PADRON CP", "NOWHERE"))
            .await
            .unwrap();
        assert!(!removed);
    }
}
