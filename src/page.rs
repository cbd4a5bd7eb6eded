//! Page-object plumbing shared by the booking and appointment-list pages.
//!
//! [`PageShell`] owns one logical tab bound to one portal URL and keeps
//! `open`/`close` idempotent, recreating the tab when it vanished under us.
//! [`TextField`] and [`SelectField`] are throwaway views created per call;
//! they hold only a locator, so every interaction re-resolves the element
//! and nothing goes stale across the portal's re-renders.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::backend::{BrowserBackend, Locator, SelectOption, TabHandle};
use crate::logging::BotLogger;
use crate::session::{PortalSession, SessionError};

/// Attempts at applying a select before giving up on a re-rendering list.
const SELECT_RETRIES: u32 = 3;
const SELECT_RETRY_PAUSE: Duration = Duration::from_millis(200);

/// One logical tab bound to one portal URL.
pub struct PageShell<B: BrowserBackend> {
    session: Arc<PortalSession<B>>,
    url: String,
    tab: Mutex<Option<TabHandle>>,
    logger: Arc<BotLogger>,
}

impl<B: BrowserBackend> PageShell<B> {
    pub fn new(session: Arc<PortalSession<B>>, url: impl Into<String>, logger: Arc<BotLogger>) -> Self {
        Self {
            session,
            url: url.into(),
            tab: Mutex::new(None),
            logger,
        }
    }

    pub fn session(&self) -> &PortalSession<B> {
        &self.session
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn is_open(&self) -> bool {
        let tab = self.tab.lock().await;
        match tab.as_ref() {
            Some(handle) => self.session.tab_exists(handle).await,
            None => false,
        }
    }

    /// Open the page in its own tab. Already-open pages are left alone;
    /// a recorded tab that vanished is silently recreated. Returns whether
    /// a navigation actually happened.
    pub async fn open(&self) -> Result<bool, SessionError> {
        let mut tab = self.tab.lock().await;
        if let Some(handle) = tab.as_ref() {
            if self.session.tab_exists(handle).await {
                return Ok(false);
            }
            self.logger
                .warn("page", format!("tab {handle} vanished, reopening {}", self.url));
            *tab = None;
        }
        let handle = self.session.create_tab().await?;
        self.session.set_active_tab(&handle).await?;
        self.session.navigate(&self.url).await?;
        self.logger.debug("page", format!("opened {} in tab {handle}", self.url));
        *tab = Some(handle);
        Ok(true)
    }

    /// Focus the page's tab, failing when the page is not open.
    pub async fn activate(&self) -> Result<(), SessionError> {
        let tab = self.tab.lock().await;
        match tab.as_ref() {
            Some(handle) => self.session.set_active_tab(handle).await,
            None => Err(SessionError::NotOpen),
        }
    }

    /// Re-navigate the already-open page.
    pub async fn reload(&self) -> Result<(), SessionError> {
        self.activate().await?;
        self.session.navigate(&self.url).await
    }

    /// Close the page's tab. A no-op when already closed.
    pub async fn close(&self) -> Result<(), SessionError> {
        let mut tab = self.tab.lock().await;
        if let Some(handle) = tab.take() {
            if self.session.tab_exists(&handle).await {
                self.session.close_tab(&handle).await?;
            }
        }
        Ok(())
    }

    pub fn text_field(&self, locator: Locator) -> TextField<'_, B> {
        TextField {
            session: &self.session,
            locator,
        }
    }

    pub fn select_field(&self, locator: Locator) -> SelectField<'_, B> {
        SelectField {
            session: &self.session,
            locator,
        }
    }
}

/// A text input addressed by locator, re-resolved on every interaction.
pub struct TextField<'a, B: BrowserBackend> {
    session: &'a PortalSession<B>,
    locator: Locator,
}

impl<B: BrowserBackend> TextField<'_, B> {
    pub async fn set(&self, text: &str) -> Result<(), SessionError> {
        self.session.clear_and_type(&self.locator, text).await
    }

    pub async fn value(&self) -> Result<String, SessionError> {
        Ok(self
            .session
            .attribute(&self.locator, "value")
            .await?
            .unwrap_or_default())
    }
}

/// A `<select>` addressed by locator, re-resolved on every interaction.
///
/// Selection is verified after the fact and retried a few times: the portal
/// repopulates its dropdowns asynchronously and a select applied mid-render
/// can be lost.
pub struct SelectField<'a, B: BrowserBackend> {
    session: &'a PortalSession<B>,
    locator: Locator,
}

impl<B: BrowserBackend> SelectField<'_, B> {
    pub async fn options(&self) -> Result<Vec<SelectOption>, SessionError> {
        self.session.select_options(&self.locator).await
    }

    pub async fn len(&self) -> Result<usize, SessionError> {
        Ok(self.options().await?.len())
    }

    pub async fn selected(&self) -> Result<Option<SelectOption>, SessionError> {
        self.session.selected_option(&self.locator).await
    }

    pub async fn select_label(&self, label: &str) -> Result<(), SessionError> {
        for attempt in 0..SELECT_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(SELECT_RETRY_PAUSE).await;
            }
            self.session.select_by_label(&self.locator, label).await?;
            match self.selected().await? {
                Some(option) if option.label == label => return Ok(()),
                _ => continue,
            }
        }
        Err(SessionError::Backend(
            crate::backend::BackendError::InvalidElement(format!(
                "option '{label}' did not stick on {}",
                self.locator
            )),
        ))
    }

    pub async fn select_index(&self, index: usize) -> Result<(), SessionError> {
        for attempt in 0..SELECT_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(SELECT_RETRY_PAUSE).await;
            }
            self.session.select_by_index(&self.locator, index).await?;
            match self.selected().await? {
                Some(option) if option.index == index => return Ok(()),
                _ => continue,
            }
        }
        Err(SessionError::Backend(
            crate::backend::BackendError::InvalidElement(format!(
                "option {index} did not stick on {}",
                self.locator
            )),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::FakeBackend;

    fn shell(backend: FakeBackend) -> PageShell<FakeBackend> {
        let session = Arc::new(PortalSession::new(backend, BotLogger::disabled()));
        PageShell::new(session, "http://portal.example/#!/page", BotLogger::disabled())
    }

    #[tokio::test]
    async fn open_is_idempotent() {
        let shell = shell(FakeBackend::launched());
        assert!(shell.open().await.unwrap());
        assert!(shell.is_open().await);
        // Second open must not navigate again or spawn another tab.
        assert!(!shell.open().await.unwrap());
        let windows = shell.session().backend().state.lock().unwrap().windows.len();
        assert_eq!(windows, 2); // initial window + page tab
    }

    #[tokio::test]
    async fn open_recreates_vanished_tab() {
        let shell = shell(FakeBackend::launched());
        shell.open().await.unwrap();
        // Drop the page's tab behind its back.
        {
            let mut state = shell.session().backend().state.lock().unwrap();
            let last = state.windows.pop().unwrap();
            assert_ne!(last, "w0");
        }
        assert!(!shell.is_open().await);
        assert!(shell.open().await.unwrap());
        assert!(shell.is_open().await);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let shell = shell(FakeBackend::launched());
        shell.open().await.unwrap();
        shell.close().await.unwrap();
        assert!(!shell.is_open().await);
        shell.close().await.unwrap();
    }

    #[tokio::test]
    async fn reload_requires_open_page() {
        let shell = shell(FakeBackend::launched());
        let err = shell.reload().await.unwrap_err();
        assert!(matches!(err, SessionError::NotOpen));
    }

    #[tokio::test]
    async fn reload_navigates_current_tab() {
        let shell = shell(FakeBackend::launched());
        shell.open().await.unwrap();
        shell.reload().await.unwrap();
        let url = shell.session().backend().state.lock().unwrap().url.clone();
        assert_eq!(url, "http://portal.example/#!/page");
    }
}
