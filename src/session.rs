//! Tab-aware browser session.
//!
//! [`PortalSession`] owns the browser through a [`BrowserBackend`] and gives
//! page objects a notion of logical tabs over native windows. It absorbs two
//! classes of faults the portal work keeps running into: the browser process
//! dying under us (the session self-heals by discarding the dead handle and
//! reporting "not open" so callers re-open), and the active native window
//! vanishing (the session falls back to any remaining window).

use std::sync::Arc;

use thiserror::Error;

use crate::backend::{BackendError, BrowserBackend, Locator, SelectOption, TabHandle};
use crate::logging::BotLogger;

/// Errors surfaced by [`PortalSession`].
#[derive(Debug, Error)]
pub enum SessionError {
    /// The browser is not running; the caller is expected to re-open.
    #[error("browser session is not open")]
    NotOpen,
    #[error("tab does not exist: {0}")]
    NoSuchTab(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Tab-aware, self-healing wrapper around a [`BrowserBackend`].
pub struct PortalSession<B: BrowserBackend> {
    backend: B,
    logger: Arc<BotLogger>,
}

impl<B: BrowserBackend> PortalSession<B> {
    pub fn new(backend: B, logger: Arc<BotLogger>) -> Self {
        Self { backend, logger }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Whether the browser is running with at least one window.
    ///
    /// A probe that fails with a session fault discards the dead process
    /// handle; the session then reports "not open" instead of erroring.
    pub async fn is_open(&self) -> bool {
        match self.backend.windows().await {
            Ok(windows) => !windows.is_empty(),
            Err(err) if err.is_session_fault() => {
                self.logger
                    .warn("session", format!("browser unreachable, discarding: {err}"));
                let _ = self.backend.shutdown().await;
                false
            }
            Err(_) => false,
        }
    }

    /// Launch a fresh browser, tearing down any previous one first.
    pub async fn open(&self) -> Result<TabHandle, SessionError> {
        if self.is_open().await {
            self.close().await?;
        }
        let tab = self.backend.launch().await?;
        self.logger.info("session", format!("browser opened, tab {tab}"));
        Ok(tab)
    }

    /// Tear down every tab and the browser process. A no-op when already
    /// closed or unreachable.
    pub async fn close(&self) -> Result<(), SessionError> {
        if !self.is_open().await {
            return Ok(());
        }
        self.backend.shutdown().await?;
        self.logger.info("session", "browser closed");
        Ok(())
    }

    /// Re-synchronise the active window after external tab closure: if the
    /// active native window is gone, fall back to any remaining one.
    async fn fix_tabs(&self) -> Result<(), SessionError> {
        if !self.is_open().await {
            return Ok(());
        }
        match self.backend.active_window().await {
            Ok(_) => Ok(()),
            Err(BackendError::NoSuchWindow(_)) => {
                let windows = self.backend.windows().await?;
                match windows.first() {
                    Some(first) => {
                        self.logger.warn(
                            "session",
                            format!("active window vanished, falling back to {first}"),
                        );
                        self.backend.switch_window(first).await?;
                        Ok(())
                    }
                    None => Ok(()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn tab_exists(&self, tab: &TabHandle) -> bool {
        self.fix_tabs().await.ok();
        match self.backend.windows().await {
            Ok(windows) => windows.contains(tab),
            Err(_) => false,
        }
    }

    /// Open a new tab. With no browser running this is equivalent to
    /// opening a fresh session.
    pub async fn create_tab(&self) -> Result<TabHandle, SessionError> {
        self.fix_tabs().await?;
        if self.is_open().await {
            Ok(self.backend.open_window().await?)
        } else {
            self.open().await
        }
    }

    pub async fn set_active_tab(&self, tab: &TabHandle) -> Result<(), SessionError> {
        self.fix_tabs().await?;
        if !self.tab_exists(tab).await {
            return Err(SessionError::NoSuchTab(tab.0.clone()));
        }
        self.backend.switch_window(tab).await?;
        Ok(())
    }

    /// Close one tab; closing the last tab tears the whole session down.
    pub async fn close_tab(&self, tab: &TabHandle) -> Result<(), SessionError> {
        self.fix_tabs().await?;
        if !self.tab_exists(tab).await {
            return Err(SessionError::NoSuchTab(tab.0.clone()));
        }
        let windows = self.backend.windows().await?;
        if windows.len() == 1 {
            self.close().await
        } else {
            self.backend.close_window(tab).await?;
            self.fix_tabs().await
        }
    }

    pub async fn current_tab(&self) -> Result<Option<TabHandle>, SessionError> {
        self.fix_tabs().await?;
        if !self.is_open().await {
            return Ok(None);
        }
        Ok(Some(self.backend.active_window().await?))
    }

    pub async fn navigate(&self, url: &str) -> Result<(), SessionError> {
        self.fix_tabs().await?;
        if !self.is_open().await {
            return Err(SessionError::NotOpen);
        }
        self.backend.navigate(url).await?;
        Ok(())
    }

    pub async fn current_url(&self) -> Result<String, SessionError> {
        self.fix_tabs().await?;
        if !self.is_open().await {
            return Err(SessionError::NotOpen);
        }
        Ok(self.backend.current_url().await?)
    }

    pub async fn element_exists(&self, locator: &Locator) -> Result<bool, SessionError> {
        match self.text(locator).await {
            Ok(_) => Ok(true),
            Err(SessionError::Backend(BackendError::ElementNotFound(_))) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn text(&self, locator: &Locator) -> Result<String, SessionError> {
        self.fix_tabs().await?;
        Ok(self.backend.text(locator).await?)
    }

    pub async fn attribute(
        &self,
        locator: &Locator,
        name: &str,
    ) -> Result<Option<String>, SessionError> {
        self.fix_tabs().await?;
        Ok(self.backend.attribute(locator, name).await?)
    }

    pub async fn click(&self, locator: &Locator) -> Result<(), SessionError> {
        self.fix_tabs().await?;
        Ok(self.backend.click(locator).await?)
    }

    pub async fn clear_and_type(
        &self,
        locator: &Locator,
        text: &str,
    ) -> Result<(), SessionError> {
        self.fix_tabs().await?;
        Ok(self.backend.clear_and_type(locator, text).await?)
    }

    pub async fn select_options(
        &self,
        locator: &Locator,
    ) -> Result<Vec<SelectOption>, SessionError> {
        self.fix_tabs().await?;
        Ok(self.backend.select_options(locator).await?)
    }

    pub async fn selected_option(
        &self,
        locator: &Locator,
    ) -> Result<Option<SelectOption>, SessionError> {
        self.fix_tabs().await?;
        Ok(self.backend.selected_option(locator).await?)
    }

    pub async fn select_by_index(
        &self,
        locator: &Locator,
        index: usize,
    ) -> Result<(), SessionError> {
        self.fix_tabs().await?;
        Ok(self.backend.select_by_index(locator, index).await?)
    }

    pub async fn select_by_label(
        &self,
        locator: &Locator,
        label: &str,
    ) -> Result<(), SessionError> {
        self.fix_tabs().await?;
        Ok(self.backend.select_by_label(locator, label).await?)
    }

}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Minimal scripted backend: a window list plus a reachability flag.
    #[derive(Default)]
    pub(crate) struct FakeBackend {
        pub state: Mutex<FakeState>,
    }

    #[derive(Default)]
    pub(crate) struct FakeState {
        pub windows: Vec<String>,
        pub active: Option<String>,
        pub reachable: bool,
        pub next_id: u32,
        pub shutdowns: usize,
        pub url: String,
    }

    impl FakeBackend {
        pub fn launched() -> Self {
            let backend = FakeBackend::default();
            {
                let mut state = backend.state.lock().unwrap();
                state.reachable = true;
                state.windows = vec!["w0".into()];
                state.active = Some("w0".into());
                state.next_id = 1;
            }
            backend
        }

        fn check(state: &FakeState) -> Result<(), BackendError> {
            if state.reachable {
                Ok(())
            } else {
                Err(BackendError::Unreachable("process gone".into()))
            }
        }
    }

    #[async_trait]
    impl BrowserBackend for FakeBackend {
        async fn launch(&self) -> Result<TabHandle, BackendError> {
            let mut state = self.state.lock().unwrap();
            let id = format!("w{}", state.next_id);
            state.next_id += 1;
            state.reachable = true;
            state.windows = vec![id.clone()];
            state.active = Some(id.clone());
            Ok(TabHandle(id))
        }

        async fn shutdown(&self) -> Result<(), BackendError> {
            let mut state = self.state.lock().unwrap();
            state.shutdowns += 1;
            state.windows.clear();
            state.active = None;
            state.reachable = false;
            Ok(())
        }

        async fn windows(&self) -> Result<Vec<TabHandle>, BackendError> {
            let state = self.state.lock().unwrap();
            Self::check(&state)?;
            Ok(state.windows.iter().cloned().map(TabHandle).collect())
        }

        async fn open_window(&self) -> Result<TabHandle, BackendError> {
            let mut state = self.state.lock().unwrap();
            Self::check(&state)?;
            let id = format!("w{}", state.next_id);
            state.next_id += 1;
            state.windows.push(id.clone());
            Ok(TabHandle(id))
        }

        async fn switch_window(&self, tab: &TabHandle) -> Result<(), BackendError> {
            let mut state = self.state.lock().unwrap();
            Self::check(&state)?;
            if !state.windows.contains(&tab.0) {
                return Err(BackendError::NoSuchWindow(tab.0.clone()));
            }
            state.active = Some(tab.0.clone());
            Ok(())
        }

        async fn close_window(&self, tab: &TabHandle) -> Result<(), BackendError> {
            let mut state = self.state.lock().unwrap();
            Self::check(&state)?;
            state.windows.retain(|w| w != &tab.0);
            if state.active.as_deref() == Some(tab.0.as_str()) {
                state.active = None;
            }
            Ok(())
        }

        async fn active_window(&self) -> Result<TabHandle, BackendError> {
            let state = self.state.lock().unwrap();
            Self::check(&state)?;
            match &state.active {
                Some(active) if state.windows.contains(active) => {
                    Ok(TabHandle(active.clone()))
                }
                Some(active) => Err(BackendError::NoSuchWindow(active.clone())),
                None => Err(BackendError::NoSuchWindow("<none>".into())),
            }
        }

        async fn navigate(&self, url: &str) -> Result<(), BackendError> {
            let mut state = self.state.lock().unwrap();
            Self::check(&state)?;
            state.url = url.to_string();
            Ok(())
        }

        async fn current_url(&self) -> Result<String, BackendError> {
            let state = self.state.lock().unwrap();
            Self::check(&state)?;
            Ok(state.url.clone())
        }

        async fn text(&self, locator: &Locator) -> Result<String, BackendError> {
            Err(BackendError::ElementNotFound(locator.to_string()))
        }

        async fn attribute(
            &self,
            locator: &Locator,
            _name: &str,
        ) -> Result<Option<String>, BackendError> {
            Err(BackendError::ElementNotFound(locator.to_string()))
        }

        async fn click(&self, locator: &Locator) -> Result<(), BackendError> {
            Err(BackendError::ElementNotFound(locator.to_string()))
        }

        async fn clear_and_type(
            &self,
            locator: &Locator,
            _text: &str,
        ) -> Result<(), BackendError> {
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

    fn session(backend: FakeBackend) -> PortalSession<FakeBackend> {
        PortalSession::new(backend, BotLogger::disabled())
    }

    #[tokio::test]
    async fn unreachable_browser_reports_not_open_and_discards_handle() {
        let backend = FakeBackend::launched();
        backend.state.lock().unwrap().reachable = false;
        let session = session(backend);

        assert!(!session.is_open().await);
        // Discarding the dead handle goes through shutdown.
        assert_eq!(session.backend().state.lock().unwrap().shutdowns, 1);
    }

    #[tokio::test]
    async fn fix_tabs_falls_back_to_remaining_window() {
        let backend = FakeBackend::launched();
        let session = session(backend);
        let second = session.create_tab().await.unwrap();
        session.set_active_tab(&second).await.unwrap();

        // Simulate the active window being closed externally.
        {
            let mut state = session.backend().state.lock().unwrap();
            state.windows.retain(|w| w != &second.0);
        }

        let current = session.current_tab().await.unwrap().unwrap();
        assert_eq!(current, TabHandle("w0".into()));
    }

    #[tokio::test]
    async fn create_tab_with_no_session_opens_fresh_browser() {
        let session = session(FakeBackend::default());
        assert!(!session.is_open().await);
        let tab = session.create_tab().await.unwrap();
        assert!(session.tab_exists(&tab).await);
        assert!(session.is_open().await);
    }

    #[tokio::test]
    async fn closing_last_tab_closes_session() {
        let backend = FakeBackend::launched();
        let session = session(backend);
        let only = session.current_tab().await.unwrap().unwrap();
        session.close_tab(&only).await.unwrap();
        assert!(!session.is_open().await);
    }

    #[tokio::test]
    async fn set_active_tab_rejects_unknown_handle() {
        let backend = FakeBackend::launched();
        let session = session(backend);
        let err = session
            .set_active_tab(&TabHandle("nope".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NoSuchTab(_)));
    }

    #[tokio::test]
    async fn element_exists_maps_not_found_to_false() {
        let backend = FakeBackend::launched();
        let session = session(backend);
        let exists = session
            .element_exists(&Locator::Id("nif"))
            .await
            .unwrap();
        assert!(!exists);
    }
}
