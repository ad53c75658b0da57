//! feedwatch — follow public accounts from a chat and get their new posts.
//!
//! ## Architecture overview
//!
//! ```text
//!  chat ──► bot/ ──► tracker.rs ──► store/ ◄── poll.rs ──► diff.rs
//!            ▲          │             │           │
//!            │          ▼             ▼           ▼
//!            │       source/     state file    notify.rs ──► chat
//!            └──────── replies ◄──────────────────┘
//! ```
//!
//! * **`source/`** — the `SourceAdapter` trait, the timeline API adapter and
//!   the RSS mirror adapter.
//! * **`store/`** — subscriptions, consumers and cursors, persisted to a
//!   JSON snapshot after every change.
//! * **`diff`** — finds the items newer than a cursor in a fetched window.
//! * **`poll`** — the scheduler: one fetch per source per tick, fan-out,
//!   then the cursor commit.
//! * **`notify`** — renders items and hands them to the chat transport.
//! * **`tracker`** — subscribe, unsubscribe, list and search.
//! * **`bot/`** — the chat front-end that turns messages into tracker calls.
//! * **`main`** — reads the environment, wires everything together and
//!   handles signals.

mod bot;
mod config;
mod diff;
mod error;
mod notify;
mod poll;
mod retry;
mod source;
mod store;
mod tracker;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bot::telegram::{self, TelegramClient};
use config::{Backend, Config};
use notify::Notifier;
use poll::PollScheduler;
use source::{RssAdapter, SourceAdapter, XAdapter};
use store::{JsonFilePersistence, SubscriptionStore};
use tracker::Tracker;

fn build_adapter(backend: &Backend) -> Result<Arc<dyn SourceAdapter>> {
    let adapter: Arc<dyn SourceAdapter> = match backend {
        Backend::X {
            api_base,
            bearer_token,
            token_file,
        } => Arc::new(
            XAdapter::new(api_base.as_str(), bearer_token.as_str(), token_file.clone())
                .context("building timeline API client")?,
        ),
        Backend::Rss { base } => {
            Arc::new(RssAdapter::new(base.as_str()).context("building RSS client")?)
        }
    };
    Ok(adapter)
}

/// Reload credentials on SIGHUP until shutdown.
#[cfg(unix)]
fn spawn_reload_handler(
    scheduler: Arc<PollScheduler>,
    shutdown: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("registering SIGHUP handler")?;
    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!("SIGHUP received, reloading credentials");
                    if let Err(e) = scheduler.refresh_and_resume().await {
                        error!(error = %e, "credential reload failed");
                    }
                }
            }
        }
    }))
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                    _ = sigterm.recv() => info!("received SIGTERM"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "could not register SIGTERM handler"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "could not listen for ctrl-c");
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "feedwatch=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // -- configuration -------------------------------------------------------
    let config = Config::from_env().context("reading configuration")?;

    let adapter = build_adapter(&config.backend)?;
    // A configured token file is authoritative, even at startup.
    if let Backend::X {
        token_file: Some(path),
        ..
    } = &config.backend
    {
        adapter
            .refresh_credentials()
            .await
            .with_context(|| format!("reading bearer token from {}", path.display()))?;
    }

    // -- state ---------------------------------------------------------------
    let persistence = Arc::new(JsonFilePersistence::new(config.state_file.clone()));
    let store = Arc::new(
        SubscriptionStore::open(persistence)
            .await
            .with_context(|| format!("loading {}", config.state_file.display()))?,
    );
    let subscriptions = store.list_all().await.len();
    info!(
        backend = adapter.label(),
        state_file = %config.state_file.display(),
        subscriptions,
        "state loaded"
    );

    // -- wiring --------------------------------------------------------------
    let telegram = Arc::new(
        TelegramClient::new(telegram::DEFAULT_API_BASE, &config.telegram_token)
            .context("building bot API client")?,
    );
    let notifier = Notifier::new(telegram.clone());
    let scheduler = Arc::new(PollScheduler::new(
        store.clone(),
        adapter.clone(),
        notifier.clone(),
        config.scheduler(),
    ));
    let tracker = Arc::new(Tracker::new(store, adapter, config.window));

    let shutdown = CancellationToken::new();

    let poller = tokio::spawn({
        let scheduler = scheduler.clone();
        let shutdown = shutdown.clone();
        async move { scheduler.run(shutdown).await }
    });
    let front_end = tokio::spawn(bot::run(telegram, tracker, notifier, shutdown.clone()));

    #[cfg(unix)]
    let reload = spawn_reload_handler(scheduler, shutdown.clone())?;

    // -- run until signalled -------------------------------------------------
    wait_for_shutdown_signal().await;
    info!("shutting down; waiting for in-flight work");
    shutdown.cancel();

    let (poller, front_end) = tokio::join!(poller, front_end);
    poller.context("poll scheduler task panicked")?;
    front_end.context("chat front-end task panicked")?;
    #[cfg(unix)]
    reload.await.context("reload task panicked")?;

    info!("stopped");
    Ok(())
}
