//! Live view of the bookmark list

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use shelf_core::{IdentityProvider, SyncEvent, SyncPhase};

use crate::app::App;
use crate::output::Output;

/// How often the stored session is re-read to notice `shelf logout`
const SESSION_CHECK_INTERVAL: Duration = Duration::from_secs(2);

/// Why the watch loop ended
#[derive(Debug, PartialEq, Eq)]
enum Stop {
    Interrupted,
    SignedOut,
    Closed,
}

/// Print the list, then every change until interrupted or signed out
pub async fn watch(app: &App, output: &Output) -> Result<()> {
    let (sync, mut events) = app.open_view().await?;
    let follower = sync.follow(app.identity.watch());

    output.print_bookmarks(&sync.snapshot().bookmarks);
    output.message("Watching for changes. Press Ctrl-C to stop.");

    let stop = follow_changes(
        &app.identity,
        &mut events,
        output,
        SESSION_CHECK_INTERVAL,
        tokio::signal::ctrl_c(),
    )
    .await;
    debug!("Watch stopped: {:?}", stop);
    if stop == Stop::SignedOut {
        output.message("Signed out. Stopped watching.");
    }

    follower.abort();
    sync.teardown().await;
    Ok(())
}

async fn follow_changes<F, T>(
    identity: &dyn IdentityProvider,
    events: &mut mpsc::Receiver<SyncEvent>,
    output: &Output,
    check_every: Duration,
    interrupt: F,
) -> Stop
where
    F: Future<Output = T>,
{
    tokio::pin!(interrupt);
    let mut session_check = tokio::time::interval(check_every);
    session_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut interrupt => {
                debug!("Interrupted");
                return Stop::Interrupted;
            }
            _ = session_check.tick() => {
                // Re-reading the session announces a sign-out to the follower
                if let Err(e) = identity.current_user().await {
                    warn!("Failed to read session: {:#}", e);
                }
            }
            event = events.recv() => {
                let Some(event) = event else { return Stop::Closed };
                match event {
                    SyncEvent::Remote(change) => output.print_change(&change),
                    SyncEvent::FeedResumed => output.message("Reconnected, reloading bookmarks"),
                    SyncEvent::Loaded { count } => debug!("Reloaded {} bookmarks", count),
                    SyncEvent::Error(e) => match e.recovery_suggestion() {
                        Some(hint) => output.warn(&format!("{}\n{}", e, hint)),
                        None => output.warn(&e.to_string()),
                    },
                    SyncEvent::PhaseChanged(SyncPhase::Uninitialized) => return Stop::SignedOut,
                    SyncEvent::PhaseChanged(SyncPhase::Closed) => return Stop::Closed,
                    SyncEvent::PhaseChanged(phase) => debug!("Phase: {}", phase),
                }
            }
        }
    }
}
