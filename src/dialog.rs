//! Modal-dialog protocol for the portal.
//!
//! Every navigation or click on the portal can spawn Angular modal dialogs:
//! transient "loading" overlays while a request is in flight, and
//! informational dialogs that block the page until dismissed. Dialog roots
//! are direct children of `<body>` with no stable ids, so detection scans
//! the body's divs and classifies each by class markers.
//!
//! The settle protocol: wait a quiet period, then poll until no loading
//! dialog has been seen for a configured number of consecutive probes.
//! Informational dialogs are probed twice before concluding none appeared,
//! since the portal sometimes raises them a beat after loading clears.

use std::time::Duration;

use thiserror::Error;

use crate::backend::{BrowserBackend, Locator};
use crate::session::{PortalSession, SessionError};

/// Class marker of a transient loading overlay.
const LOADING_MARKER: &str = "custom-dialog-loading";
/// Class markers of an informational dialog's header element.
const INFO_HEADER_MARKER: &str = "custom-dialog-header";
const INFO_KIND_MARKER: &str = "information";

/// Body divs scanned before concluding no dialog is present.
const MAX_BODY_DIVS: usize = 16;
/// Hard cap on settle polls; past this the page is declared stuck.
const MAX_SETTLE_POLLS: u32 = 600;

#[derive(Debug, Error)]
pub enum DialogError {
    /// Loading dialogs kept appearing past the hard poll cap.
    #[error("page did not settle: loading dialogs still present after {0} polls")]
    SettleTimeout(u32),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Timing knobs for the settle protocol.
#[derive(Debug, Clone)]
pub struct DialogTiming {
    pub pre_delay: Duration,
    pub poll_interval: Duration,
    pub max_empty_polls: u32,
}

impl Default for DialogTiming {
    fn default() -> Self {
        Self {
            pre_delay: Duration::from_millis(500),
            poll_interval: Duration::from_millis(250),
            max_empty_polls: 4,
        }
    }
}

/// An informational dialog currently blocking the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoDialog {
    root: String,
    pub content: String,
}

impl InfoDialog {
    pub fn content(&self) -> &str {
        &self.content
    }
}

enum Sighting {
    Loading,
    Info(String),
}

/// Dialog detection and dismissal on one portal tab.
pub struct DialogWatcher<'a, B: BrowserBackend> {
    session: &'a PortalSession<B>,
    timing: DialogTiming,
}

impl<'a, B: BrowserBackend> DialogWatcher<'a, B> {
    pub fn new(session: &'a PortalSession<B>, timing: DialogTiming) -> Self {
        Self { session, timing }
    }

    /// Block until no loading dialog has been seen for
    /// `max_empty_polls` consecutive probes.
    pub async fn settle(&self) -> Result<(), DialogError> {
        tokio::time::sleep(self.timing.pre_delay).await;
        let mut empty_polls = 0;
        let mut polls = 0;
        loop {
            if polls >= MAX_SETTLE_POLLS {
                return Err(DialogError::SettleTimeout(polls));
            }
            polls += 1;
            match self.scan().await? {
                Some(Sighting::Loading) => empty_polls = 0,
                _ => {
                    empty_polls += 1;
                    if empty_polls >= self.timing.max_empty_polls {
                        return Ok(());
                    }
                }
            }
            tokio::time::sleep(self.timing.poll_interval).await;
        }
    }

    /// Settle, then look for an informational dialog. Probed twice because
    /// the portal sometimes raises the dialog a beat after loading clears.
    pub async fn informational(&self) -> Result<Option<InfoDialog>, DialogError> {
        self.settle().await?;
        for attempt in 0..2 {
            if attempt > 0 {
                tokio::time::sleep(self.timing.poll_interval).await;
            }
            if let Some(Sighting::Info(root)) = self.scan().await? {
                let content = self.read_content(&root).await?;
                return Ok(Some(InfoDialog { root, content }));
            }
        }
        Ok(None)
    }

    /// Dismiss an informational dialog via its close button. Single-button
    /// dialogs put close where two-button dialogs put confirm.
    pub async fn close(&self, dialog: &InfoDialog) -> Result<(), DialogError> {
        let second = Locator::xpath(format!("{}/div[2]/div[3]/button[2]", dialog.root));
        match self.session.click(&second).await {
            Ok(()) => Ok(()),
            Err(SessionError::Backend(crate::backend::BackendError::ElementNotFound(_))) => {
                let first = Locator::xpath(format!("{}/div[2]/div[3]/button[1]", dialog.root));
                self.session.click(&first).await?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Accept a confirmation dialog via its first button.
    pub async fn confirm(&self, dialog: &InfoDialog) -> Result<(), DialogError> {
        let button = Locator::xpath(format!("{}/div[2]/div[3]/button[1]", dialog.root));
        self.session.click(&button).await?;
        Ok(())
    }

    /// One probe over the body's direct div children. Loading dialogs win
    /// over informational ones.
    async fn scan(&self) -> Result<Option<Sighting>, DialogError> {
        let mut info: Option<String> = None;
        for index in 1..=MAX_BODY_DIVS {
            let root = format!("/html/body/div[{index}]");
            let class = match self
                .session
                .attribute(&Locator::xpath(root.clone()), "class")
                .await
            {
                Ok(value) => value.unwrap_or_default(),
                Err(SessionError::Backend(
                    crate::backend::BackendError::ElementNotFound(_),
                )) => break,
                Err(err) => return Err(err.into()),
            };
            if class.contains(LOADING_MARKER) {
                return Ok(Some(Sighting::Loading));
            }
            if info.is_none() && self.is_informational(&root).await? {
                info = Some(root);
            }
        }
        Ok(info.map(Sighting::Info))
    }

    async fn is_informational(&self, root: &str) -> Result<bool, DialogError> {
        let header = Locator::xpath(format!("{root}/div[2]/div[1]"));
        match self.session.attribute(&header, "class").await {
            Ok(Some(class)) => {
                Ok(class.contains(INFO_HEADER_MARKER) && class.contains(INFO_KIND_MARKER))
            }
            Ok(None) => Ok(false),
            Err(SessionError::Backend(crate::backend::BackendError::ElementNotFound(_))) => {
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Dialog text lives in a span for most dialogs, in a second paragraph
    /// for a few.
    async fn read_content(&self, root: &str) -> Result<String, DialogError> {
        let span = Locator::xpath(format!("{root}/div[2]/div[2]/span"));
        match self.session.text(&span).await {
            Ok(text) => Ok(text),
            Err(SessionError::Backend(crate::backend::BackendError::ElementNotFound(_))) => {
                let paragraph = Locator::xpath(format!("{root}/div[2]/div[2]/p[2]"));
                Ok(self.session.text(&paragraph).await?)
            }
            Err(err) => Err(err.into()),
        }
    }
}
