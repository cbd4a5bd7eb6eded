//! Appointment re-booking daemon.
//!
//! Loads the tracked requests from the entries file, launches a Chrome
//! instance and polls the Valencia "cita previa" portal until interrupted.
//!
//! Usage:
//!   $ CITABOT_TELEGRAM_BOT_TOKEN=... cargo run --bin citabot -- --show-browser
//!   $ cargo run --bin citabot -- --entries my-entries.json --once

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use citabot::appointments::AppointmentsPage;
use citabot::config::BotConfig;
use citabot::creation::CreationPage;
use citabot::dialog::DialogTiming;
use citabot::logging::{BotLogger, LogConfig, LogLevel};
use citabot::notify::{Notifier, NullNotifier, TelegramNotifier};
use citabot::runtime::ChromiumBackend;
use citabot::scheduler::{PagePortal, Scheduler};
use citabot::session::PortalSession;
use clap::Parser;
use log::info;
use tokio::sync::watch;

#[derive(Parser)]
#[command(
    name = "citabot",
    author,
    version,
    about = "Polls the Valencia cita previa portal and re-books appointments to earlier dates"
)]
struct Cli {
    /// Increase log verbosity (pass multiple times for DEBUG).
    #[arg(long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to the tracked-entries JSON file.
    #[arg(long)]
    entries: Option<PathBuf>,

    /// Show the launched browser window.
    #[arg(long)]
    show_browser: bool,

    /// Path to the Chrome/Chromium executable.
    #[arg(long)]
    chrome: Option<PathBuf>,

    /// Run a single polling pass and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_env_logger();

    let cli = Cli::parse();

    let mut config = BotConfig::from_env().context("invalid environment configuration")?;
    if let Some(entries) = cli.entries {
        config.entries_path = entries;
    }
    if cli.show_browser {
        config.headless = false;
    }
    if let Some(chrome) = cli.chrome {
        config.chrome_executable = Some(chrome);
    }

    let entries = citabot::config::load_entries(&config.entries_path).with_context(|| {
        format!("cannot load entries from {}", config.entries_path.display())
    })?;
    info!("tracking {} appointment request(s)", entries.len());

    let logger = BotLogger::with_config(LogConfig {
        max_level: if cli.verbose > 0 {
            LogLevel::Debug
        } else {
            LogLevel::Info
        },
        file_path: config.log_file.clone(),
        max_file_bytes: config.log_max_file_bytes,
        ..LogConfig::default()
    });

    let timing = DialogTiming {
        pre_delay: config.dialog_pre_delay,
        poll_interval: config.dialog_poll_interval,
        max_empty_polls: config.dialog_max_empty_polls,
    };

    let backend = ChromiumBackend::from_config(&config, Arc::clone(&logger));
    let session = Arc::new(PortalSession::new(backend, Arc::clone(&logger)));
    let creation = CreationPage::new(
        Arc::clone(&session),
        config.new_appointment_url.clone(),
        timing.clone(),
        Arc::clone(&logger),
    );
    let appointments = AppointmentsPage::new(
        Arc::clone(&session),
        config.query_appointment_url.clone(),
        timing,
        Arc::clone(&logger),
    );
    let portal = PagePortal::new(
        Arc::clone(&session),
        creation,
        appointments,
        Arc::clone(&logger),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let telegram = match &config.telegram_bot_token {
        Some(token) => Some(Arc::new(
            TelegramNotifier::new(
                token.clone(),
                config.telegram_subscribers_path.clone(),
                Arc::clone(&logger),
            )
            .context("cannot initialise telegram notifier")?,
        )),
        None => None,
    };
    let notifier: Arc<dyn Notifier> = match &telegram {
        Some(telegram) => Arc::clone(telegram) as Arc<dyn Notifier>,
        None => Arc::new(NullNotifier),
    };

    let scheduler = Scheduler::new(
        portal,
        Arc::clone(&notifier),
        entries,
        config.poll_delay,
        config.backoff.clone(),
        Arc::clone(&logger),
    );

    if let Some(telegram) = telegram {
        let status = scheduler.status();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move {
            telegram.run_update_loop(status, rx).await;
        });
    }

    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = shutdown_tx.send(true);
            }
        });
    }

    notifier.broadcast("Bot started.").await;
    logger.info("main", "bot started");

    if cli.once {
        let clean = scheduler.run_pass().await;
        info!("single pass finished, clean: {clean}");
    } else {
        scheduler.run(shutdown_rx).await;
    }

    notifier.broadcast("Bot stopped.").await;
    if let Err(err) = session.close().await {
        logger.warn("main", format!("browser close on shutdown failed: {err}"));
    }
    logger.info("main", "bot stopped");
    Ok(())
}

fn init_env_logger() {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "info");
    }

    let _ = env_logger::Builder::from_env(env_logger::Env::default())
        .format_timestamp_secs()
        .try_init();
}
