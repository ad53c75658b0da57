//! Chat front-end.
//!
//! Long-polls the bot API, parses each text message into a [`Command`],
//! runs it against the [`Tracker`] and sends the reply lines back to the
//! chat that asked.

mod command;
pub mod telegram;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use command::{parse, Command};
use telegram::TelegramClient;

use crate::notify::{render_baseline, Notifier};
use crate::store::ConsumerId;
use crate::tracker::{report_command_error, Subscribed, Target, Tracker};

/// Pause after a failed `getUpdates` before trying again.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

pub const HELP: &str = "Send @username to follow an account.\n\
Send @username followed by some words to find its most recent post containing them.\n\
/list shows who you follow.\n\
/unsubscribe @username stops following one account, /unsubscribe all stops everything.";

/// Run one command for `consumer` and produce the reply lines, in order.
pub async fn respond(tracker: &Tracker, consumer: &ConsumerId, command: Command) -> Vec<String> {
    match command {
        Command::Help => vec![HELP.to_string()],
        Command::Usage(usage) => vec![format!("Usage: {usage}")],
        Command::Unknown(verb) => vec![format!("Unknown command {verb}. Send /help for usage.")],

        Command::List => {
            let sources = tracker.list_subscriptions(consumer).await;
            if sources.is_empty() {
                vec!["You are not following anyone.".to_string()]
            } else {
                let lines: Vec<String> = sources.iter().map(|s| format!("@{s}")).collect();
                vec![format!("Following:\n{}", lines.join("\n"))]
            }
        }

        Command::Subscribe(raw) => match tracker.subscribe(consumer, &raw).await {
            Ok(Subscribed::Created { source, baseline }) => render_baseline(&source, &baseline),
            Ok(Subscribed::AlreadySubscribed { source }) => {
                vec![format!("You already follow @{source}.")]
            }
            Err(e) => {
                report_command_error(&e);
                vec![e.user_message()]
            }
        },

        Command::Unsubscribe(target) => {
            let all = target == Target::All;
            let requested = match &target {
                Target::Source(raw) => raw.trim().trim_start_matches('@').to_string(),
                Target::All => String::new(),
            };
            match tracker.unsubscribe(consumer, target).await {
                Ok(removed) if removed.is_empty() && all => {
                    vec!["You were not following anyone.".to_string()]
                }
                Ok(removed) if removed.is_empty() => {
                    vec![format!("@{requested} is not in your list.")]
                }
                Ok(removed) => {
                    let names: Vec<String> = removed.iter().map(|s| format!("@{s}")).collect();
                    vec![format!("Stopped following {}.", names.join(", "))]
                }
                Err(e) => {
                    report_command_error(&e);
                    vec![e.user_message()]
                }
            }
        }

        Command::Search { source, query } => match tracker.search_recent(&source, &query).await {
            Ok(Some(item)) => vec![item.permalink],
            Ok(None) => vec![format!(
                "No recent post from {source} matches \"{query}\"."
            )],
            Err(e) => {
                report_command_error(&e);
                vec![e.user_message()]
            }
        },
    }
}

/// Serve chat commands until `shutdown` fires.
///
/// Messages are handled one at a time in arrival order, so one chat's
/// commands always apply in the order they were sent.
pub async fn run(
    client: Arc<TelegramClient>,
    tracker: Arc<Tracker>,
    notifier: Notifier,
    shutdown: CancellationToken,
) {
    info!("chat front-end started");
    let mut offset = 0;

    loop {
        let updates = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = client.get_updates(offset) => result,
        };

        let updates = match updates {
            Ok(updates) => updates,
            Err(e) => {
                warn!(error = %e, "getUpdates failed");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                }
                continue;
            }
        };

        for update in updates {
            offset = offset.max(update.update_id + 1);
            let Some((consumer, text)) = update.text_message() else {
                continue;
            };
            let Some(command) = parse(&text) else {
                continue;
            };
            debug!(consumer = %consumer, ?command, "command");

            for line in respond(&tracker, &consumer, command).await {
                if let Err(e) = notifier.send_text(&consumer, &line).await {
                    warn!(consumer = %consumer, error = %e, "reply failed");
                    break;
                }
            }
        }
    }

    info!("chat front-end stopped");
}
