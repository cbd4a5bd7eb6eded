//! Unattended re-booking bot for the Valencia "cita previa" portal.
//!
//! The portal exposes no API, so every operation is performed against the
//! rendered page through a real browser. The crate is layered bottom-up:
//! a [`backend::BrowserBackend`] capability trait (implemented for
//! chromiumoxide in [`runtime`]), a tab-aware self-healing
//! [`session::PortalSession`], the modal-dialog protocol in [`dialog`],
//! page objects ([`creation`], [`appointments`], [`datepicker`]) and the
//! top-level polling [`scheduler`].

pub mod appointments;
pub mod backend;
pub mod config;
pub mod creation;
pub mod datepicker;
pub mod dates;
pub mod dialog;
pub mod logging;
pub mod notify;
pub mod page;
pub mod runtime;
pub mod scheduler;
pub mod session;
pub mod types;
