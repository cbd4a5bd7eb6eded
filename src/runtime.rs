//! Chromiumoxide-based browser backend.
//!
//! Production implementation of [`BrowserBackend`](crate::backend::BrowserBackend)
//! driving a locally launched Chrome over CDP. Element access goes through
//! small injected scripts rather than persistent node handles, so every
//! call re-resolves its locator against the live DOM and nothing goes stale
//! across the portal's page rewrites.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chromiumoxide::{
    browser::{Browser, BrowserConfig},
    page::Page as ChromiumPage,
};
use futures_util::StreamExt;
use serde_json::Value as JsonValue;
use tokio::{sync::Mutex, task::JoinHandle};

use crate::backend::{BackendError, BrowserBackend, Locator, SelectOption, TabHandle};
use crate::config::BotConfig;
use crate::logging::BotLogger;

pub struct ChromiumBackend {
    headless: bool,
    chrome_executable: Option<PathBuf>,
    state: Mutex<Option<RuntimeState>>,
    logger: Arc<BotLogger>,
}

struct RuntimeState {
    browser: Arc<Browser>,
    handler: JoinHandle<()>,
    pages: HashMap<String, ChromiumPage>,
    active: Option<String>,
}

impl ChromiumBackend {
    pub fn new(
        headless: bool,
        chrome_executable: Option<PathBuf>,
        logger: Arc<BotLogger>,
    ) -> Self {
        Self {
            headless,
            chrome_executable,
            state: Mutex::new(None),
            logger,
        }
    }

    pub fn from_config(config: &BotConfig, logger: Arc<BotLogger>) -> Self {
        Self::new(config.headless, config.chrome_executable.clone(), logger)
    }

    fn build_config(&self) -> Result<BrowserConfig, BackendError> {
        let mut builder = BrowserConfig::builder();
        if let Some(path) = &self.chrome_executable {
            builder = builder.chrome_executable(path);
        }
        let builder = if self.headless {
            builder
        } else {
            builder.with_head()
        };
        builder.build().map_err(BackendError::Message)
    }

    async fn current_browser(&self) -> Result<Arc<Browser>, BackendError> {
        let guard = self.state.lock().await;
        guard
            .as_ref()
            .map(|state| Arc::clone(&state.browser))
            .ok_or_else(not_running)
    }

    /// Re-list the browser's pages, updating the local map. Returns the
    /// window ids in the browser's own order.
    async fn refresh_pages(&self) -> Result<Vec<String>, BackendError> {
        let browser = self.current_browser().await?;
        let pages = browser
            .pages()
            .await
            .map_err(|err| BackendError::Unreachable(err.to_string()))?;

        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or_else(not_running)?;
        let mut ids = Vec::with_capacity(pages.len());
        state.pages.clear();
        for page in pages {
            let id = page.target_id().as_ref().to_string();
            ids.push(id.clone());
            state.pages.insert(id, page);
        }
        Ok(ids)
    }

    async fn active_page(&self) -> Result<ChromiumPage, BackendError> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or_else(not_running)?;
        let id = state
            .active
            .clone()
            .ok_or_else(|| BackendError::NoSuchWindow("<no active window>".into()))?;
        state
            .pages
            .get(&id)
            .cloned()
            .ok_or(BackendError::NoSuchWindow(id))
    }

    async fn eval(&self, script: &str) -> Result<JsonValue, BackendError> {
        let page = self.active_page().await?;
        let result = page
            .evaluate(script)
            .await
            .map_err(|err| BackendError::Script(err.to_string()))?;
        Ok(result.value().cloned().unwrap_or(JsonValue::Null))
    }

    /// Run `body` with `el` bound to the element `locator` resolves to.
    /// `body` must return the eval protocol object (see [`interpret_eval`]).
    async fn eval_element(
        &self,
        locator: &Locator,
        body: &str,
    ) -> Result<JsonValue, BackendError> {
        let script = format!(
            "(function() {{ const el = {lookup}; \
             if (!el) return {{ ok: false, error: 'not_found' }}; {body} }})()",
            lookup = element_lookup(locator),
        );
        let value = self.eval(&script).await?;
        interpret_eval(locator, value)
    }
}

#[async_trait]
impl BrowserBackend for ChromiumBackend {
    async fn launch(&self) -> Result<TabHandle, BackendError> {
        // Reuse a live browser; replace a dead one.
        if self.current_browser().await.is_ok() {
            match self.refresh_pages().await {
                Ok(ids) if !ids.is_empty() => return Ok(TabHandle(ids[0].clone())),
                _ => {
                    self.logger
                        .warn("runtime", "existing browser unreachable, relaunching");
                    self.shutdown().await?;
                }
            }
        }

        let config = self.build_config()?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|err| BackendError::Message(err.to_string()))?;
        let browser = Arc::new(browser);

        let handler_logger = Arc::clone(&self.logger);
        let handler = tokio::spawn(async move {
            while let Some(result) = handler.next().await {
                if let Err(err) = result {
                    handler_logger.warn("runtime", format!("cdp handler error: {err}"));
                }
            }
        });

        let mut pages = browser
            .pages()
            .await
            .map_err(|err| BackendError::Message(err.to_string()))?;
        if pages.is_empty() {
            let page = browser
                .new_page("about:blank")
                .await
                .map_err(|err| BackendError::Message(err.to_string()))?;
            pages.push(page);
        }

        let first_id = pages[0].target_id().as_ref().to_string();
        let page_map = pages
            .into_iter()
            .map(|page| (page.target_id().as_ref().to_string(), page))
            .collect();

        let mut guard = self.state.lock().await;
        *guard = Some(RuntimeState {
            browser,
            handler,
            pages: page_map,
            active: Some(first_id.clone()),
        });
        self.logger.info("runtime", "browser launched");
        Ok(TabHandle(first_id))
    }

    async fn shutdown(&self) -> Result<(), BackendError> {
        let state = {
            let mut guard = self.state.lock().await;
            guard.take()
        };
        if let Some(state) = state {
            state.handler.abort();
            drop(state.pages);
            drop(state.browser);
            self.logger.info("runtime", "browser shut down");
        }
        Ok(())
    }

    async fn windows(&self) -> Result<Vec<TabHandle>, BackendError> {
        let ids = self.refresh_pages().await?;
        Ok(ids.into_iter().map(TabHandle).collect())
    }

    async fn open_window(&self) -> Result<TabHandle, BackendError> {
        let browser = self.current_browser().await?;
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|err| BackendError::Message(err.to_string()))?;
        let id = page.target_id().as_ref().to_string();

        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or_else(not_running)?;
        state.pages.insert(id.clone(), page);
        Ok(TabHandle(id))
    }

    async fn switch_window(&self, tab: &TabHandle) -> Result<(), BackendError> {
        let page = {
            let guard = self.state.lock().await;
            let state = guard.as_ref().ok_or_else(not_running)?;
            state
                .pages
                .get(&tab.0)
                .cloned()
                .ok_or_else(|| BackendError::NoSuchWindow(tab.0.clone()))?
        };
        page.bring_to_front()
            .await
            .map_err(|err| BackendError::Message(err.to_string()))?;

        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or_else(not_running)?;
        state.active = Some(tab.0.clone());
        Ok(())
    }

    async fn close_window(&self, tab: &TabHandle) -> Result<(), BackendError> {
        let page = {
            let mut guard = self.state.lock().await;
            let state = guard.as_mut().ok_or_else(not_running)?;
            let page = state
                .pages
                .remove(&tab.0)
                .ok_or_else(|| BackendError::NoSuchWindow(tab.0.clone()))?;
            if state.active.as_deref() == Some(tab.0.as_str()) {
                state.active = None;
            }
            page
        };
        page.close()
            .await
            .map_err(|err| BackendError::Message(err.to_string()))?;
        Ok(())
    }

    async fn active_window(&self) -> Result<TabHandle, BackendError> {
        let active = {
            let guard = self.state.lock().await;
            let state = guard.as_ref().ok_or_else(not_running)?;
            state
                .active
                .clone()
                .ok_or_else(|| BackendError::NoSuchWindow("<no active window>".into()))?
        };
        // The window may have died underneath us.
        let ids = self.refresh_pages().await?;
        if ids.iter().any(|id| *id == active) {
            Ok(TabHandle(active))
        } else {
            Err(BackendError::NoSuchWindow(active))
        }
    }

    async fn navigate(&self, url: &str) -> Result<(), BackendError> {
        let page = self.active_page().await?;
        page.goto(url)
            .await
            .map_err(|err| BackendError::Message(err.to_string()))?;
        Ok(())
    }

    async fn current_url(&self) -> Result<String, BackendError> {
        let page = self.active_page().await?;
        let url = page
            .url()
            .await
            .map_err(|err| BackendError::Message(err.to_string()))?;
        Ok(url.unwrap_or_default())
    }

    async fn text(&self, locator: &Locator) -> Result<String, BackendError> {
        let value = self
            .eval_element(
                locator,
                "return { ok: true, value: el.innerText !== undefined ? el.innerText : el.textContent };",
            )
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn attribute(
        &self,
        locator: &Locator,
        name: &str,
    ) -> Result<Option<String>, BackendError> {
        let body = format!(
            "return {{ ok: true, value: el.getAttribute({}) }};",
            js_string(name)
        );
        let value = self.eval_element(locator, &body).await?;
        Ok(value.as_str().map(str::to_string))
    }

    async fn click(&self, locator: &Locator) -> Result<(), BackendError> {
        self.eval_element(locator, "el.click(); return { ok: true, value: null };")
            .await?;
        Ok(())
    }

    async fn clear_and_type(&self, locator: &Locator, text: &str) -> Result<(), BackendError> {
        // The portal is an Angular app: it only sees values that arrive
        // with input/change events.
        let body = format!(
            "el.focus(); el.value = ''; el.value = {}; \
             el.dispatchEvent(new Event('input', {{ bubbles: true }})); \
             el.dispatchEvent(new Event('change', {{ bubbles: true }})); \
             return {{ ok: true, value: null }};",
            js_string(text)
        );
        self.eval_element(locator, &body).await?;
        Ok(())
    }

    async fn select_options(&self, locator: &Locator) -> Result<Vec<SelectOption>, BackendError> {
        let value = self
            .eval_element(
                locator,
                "if (el.tagName !== 'SELECT') return { ok: false, error: 'invalid', message: 'not a select element' }; \
                 return { ok: true, value: Array.from(el.options).map(function(o, i) { return { index: i, label: o.text.trim() }; }) };",
            )
            .await?;
        parse_options(locator, value)
    }

    async fn selected_option(
        &self,
        locator: &Locator,
    ) -> Result<Option<SelectOption>, BackendError> {
        let value = self
            .eval_element(
                locator,
                "if (el.tagName !== 'SELECT') return { ok: false, error: 'invalid', message: 'not a select element' }; \
                 if (el.selectedIndex < 0) return { ok: true, value: null }; \
                 return { ok: true, value: { index: el.selectedIndex, label: el.options[el.selectedIndex].text.trim() } };",
            )
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        Ok(parse_options(locator, JsonValue::Array(vec![value]))?.into_iter().next())
    }

    async fn select_by_index(
        &self,
        locator: &Locator,
        index: usize,
    ) -> Result<(), BackendError> {
        let body = format!(
            "if (el.tagName !== 'SELECT') return {{ ok: false, error: 'invalid', message: 'not a select element' }}; \
             if ({index} >= el.options.length) return {{ ok: false, error: 'invalid', message: 'option index {index} out of range' }}; \
             el.selectedIndex = {index}; \
             el.dispatchEvent(new Event('change', {{ bubbles: true }})); \
             return {{ ok: true, value: null }};"
        );
        self.eval_element(locator, &body).await?;
        Ok(())
    }

    async fn select_by_label(&self, locator: &Locator, label: &str) -> Result<(), BackendError> {
        let body = format!(
            "if (el.tagName !== 'SELECT') return {{ ok: false, error: 'invalid', message: 'not a select element' }}; \
             const wanted = {label}; \
             const match = Array.from(el.options).findIndex(function(o) {{ return o.text.trim() === wanted; }}); \
             if (match < 0) return {{ ok: false, error: 'invalid', message: 'no option labelled ' + wanted }}; \
             el.selectedIndex = match; \
             el.dispatchEvent(new Event('change', {{ bubbles: true }})); \
             return {{ ok: true, value: null }};",
            label = js_string(label)
        );
        self.eval_element(locator, &body).await?;
        Ok(())
    }
}

fn not_running() -> BackendError {
    BackendError::Unreachable("browser is not running".into())
}

/// JS string literal for `value`, correctly escaped.
fn js_string(value: &str) -> String {
    JsonValue::String(value.to_string()).to_string()
}

/// JS expression resolving `locator` to an element or null.
fn element_lookup(locator: &Locator) -> String {
    match locator {
        Locator::Id(id) => format!("document.getElementById({})", js_string(id)),
        Locator::XPath(path) => format!(
            "document.evaluate({}, document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null).singleNodeValue",
            js_string(path)
        ),
    }
}

/// Decode the `{ ok, value }` / `{ ok, error, message }` protocol every
/// injected element script returns.
fn interpret_eval(locator: &Locator, value: JsonValue) -> Result<JsonValue, BackendError> {
    let ok = value.get("ok").and_then(JsonValue::as_bool);
    if ok == Some(true) {
        return Ok(value.get("value").cloned().unwrap_or(JsonValue::Null));
    }
    let error = value
        .get("error")
        .and_then(JsonValue::as_str)
        .unwrap_or("malformed result");
    match error {
        "not_found" => Err(BackendError::ElementNotFound(locator.to_string())),
        "invalid" => {
            let message = value
                .get("message")
                .and_then(JsonValue::as_str)
                .unwrap_or("unexpected element");
            Err(BackendError::InvalidElement(format!("{locator}: {message}")))
        }
        other => Err(BackendError::Script(format!("{locator}: {other}"))),
    }
}

fn parse_options(
    locator: &Locator,
    value: JsonValue,
) -> Result<Vec<SelectOption>, BackendError> {
    let raw = value.as_array().ok_or_else(|| {
        BackendError::Script(format!("{locator}: select options result is not an array"))
    })?;
    let mut options = Vec::with_capacity(raw.len());
    for entry in raw {
        let index = entry
            .get("index")
            .and_then(JsonValue::as_u64)
            .ok_or_else(|| {
                BackendError::Script(format!("{locator}: select option without index"))
            })?;
        let label = entry
            .get("label")
            .and_then(JsonValue::as_str)
            .unwrap_or_default();
        options.push(SelectOption {
            index: index as usize,
            label: label.to_string(),
        });
    }
    Ok(options)
}
