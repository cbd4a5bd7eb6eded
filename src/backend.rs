//! Browser capability boundary.
//!
//! The bot never talks to a browser library directly; everything goes
//! through [`BrowserBackend`], a narrow capability trait covering window
//! management, navigation and element-level reads/clicks/typing. The
//! production implementation lives in [`crate::runtime`]; tests substitute
//! scripted mocks.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

/// Opaque identifier for one native browser window.
///
/// Handles are owned by exactly one page object; the session layer only
/// checks existence and switches between them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TabHandle(pub String);

impl fmt::Display for TabHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Declarative element locator on the active window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Locator {
    Id(&'static str),
    XPath(String),
}

impl Locator {
    pub fn xpath(path: impl Into<String>) -> Self {
        Locator::XPath(path.into())
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Id(id) => write!(f, "#{id}"),
            Locator::XPath(path) => f.write_str(path),
        }
    }
}

/// One `<option>` of a select element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectOption {
    pub index: usize,
    pub label: String,
}

/// Errors surfaced by a [`BrowserBackend`].
#[derive(Debug, Error)]
pub enum BackendError {
    /// The locator matched nothing. Callers use this as a signal (end of a
    /// list, dialog absent), so it must stay distinguishable.
    #[error("element not found: {0}")]
    ElementNotFound(String),
    /// The referenced window no longer exists.
    #[error("no such window: {0}")]
    NoSuchWindow(String),
    /// The browser process cannot be reached at all.
    #[error("browser unreachable: {0}")]
    Unreachable(String),
    /// The element exists but is not the kind of control the operation
    /// expects (e.g. select ops on a non-select element).
    #[error("unexpected element state: {0}")]
    InvalidElement(String),
    #[error("script execution failed: {0}")]
    Script(String),
    #[error("browser backend error: {0}")]
    Message(String),
}

impl BackendError {
    /// Whether this error means the browser process itself is gone, as
    /// opposed to a page-level condition.
    pub fn is_session_fault(&self) -> bool {
        matches!(self, BackendError::Unreachable(_))
    }
}

/// Raw browser operations consumed by the session layer.
///
/// All element operations act on the currently active window. Locator-based
/// access re-resolves on every call; there are no persistent element
/// references to go stale across navigation.
#[async_trait]
pub trait BrowserBackend: Send + Sync {
    /// Launch (or relaunch) the browser, returning the initial window.
    async fn launch(&self) -> Result<TabHandle, BackendError>;

    /// Tear down every window and the browser process.
    async fn shutdown(&self) -> Result<(), BackendError>;

    /// All currently open windows. Used as the reachability probe: an
    /// unreachable browser must return [`BackendError::Unreachable`].
    async fn windows(&self) -> Result<Vec<TabHandle>, BackendError>;

    /// Open a new blank window without focusing it.
    async fn open_window(&self) -> Result<TabHandle, BackendError>;

    async fn switch_window(&self, tab: &TabHandle) -> Result<(), BackendError>;

    async fn close_window(&self, tab: &TabHandle) -> Result<(), BackendError>;

    async fn active_window(&self) -> Result<TabHandle, BackendError>;

    async fn navigate(&self, url: &str) -> Result<(), BackendError>;

    async fn current_url(&self) -> Result<String, BackendError>;

    /// Visible text of the first element matching `locator`.
    async fn text(&self, locator: &Locator) -> Result<String, BackendError>;

    /// Attribute value of the first element matching `locator`, or `None`
    /// when the attribute is absent on an existing element.
    async fn attribute(
        &self,
        locator: &Locator,
        name: &str,
    ) -> Result<Option<String>, BackendError>;

    async fn click(&self, locator: &Locator) -> Result<(), BackendError>;

    /// Clear the field matching `locator` and type `text` into it.
    async fn clear_and_type(&self, locator: &Locator, text: &str) -> Result<(), BackendError>;

    /// Options of the select element matching `locator`, in DOM order.
    async fn select_options(&self, locator: &Locator) -> Result<Vec<SelectOption>, BackendError>;

    /// Currently selected option of the select matching `locator`.
    async fn selected_option(
        &self,
        locator: &Locator,
    ) -> Result<Option<SelectOption>, BackendError>;

    async fn select_by_index(&self, locator: &Locator, index: usize)
        -> Result<(), BackendError>;

    async fn select_by_label(&self, locator: &Locator, label: &str) -> Result<(), BackendError>;
}
