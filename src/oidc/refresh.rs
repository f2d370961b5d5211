//! Background silent refresh task.
//!
//! Sleeps until the held access token reaches its refresh point, announces
//! `token_expires`, and asks the client for a silent refresh.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::client::OAuthService;
use super::events::OAuthEvent;

/// Spawn the refresh timer. Runs until aborted.
pub fn spawn_silent_refresh_task(service: OAuthService) -> JoinHandle<()> {
    let mut events = service.subscribe();

    tokio::spawn(async move {
        // Token set (by stored_at) whose refresh point was already handled.
        let mut handled: Option<DateTime<Utc>> = None;

        loop {
            let due = next_refresh(&service).filter(|(stored_at, _)| handled != Some(*stored_at));

            match due {
                Some((stored_at, wait)) => {
                    debug!(wait_secs = wait.as_secs(), "Silent refresh scheduled");
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {
                            handled = Some(stored_at);
                            service.emit(OAuthEvent::TokenExpires);
                            match service.silent_refresh().await {
                                Ok(()) => info!("Silent refresh completed"),
                                Err(e) => warn!(error = %e, "Silent refresh failed"),
                            }
                        }
                        event = events.recv() => {
                            if event.is_none() {
                                break;
                            }
                        }
                    }
                }
                None => {
                    // Nothing to refresh until tokens change
                    if events.recv().await.is_none() {
                        break;
                    }
                }
            }
        }

        debug!("Silent refresh task stopped");
    })
}

/// Stored-at marker and remaining wait for the current token set.
fn next_refresh(service: &OAuthService) -> Option<(DateTime<Utc>, Duration)> {
    let tokens = service.tokens()?;
    let factor = service.config().ok()?.timeout_factor;
    let wait = (tokens.refresh_due_at(factor) - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO);
    Some((tokens.stored_at, wait))
}
