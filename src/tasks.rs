use std::time::Duration;

use crate::AppState;

/// Spawns a long-lived tokio task that wakes up every 60 seconds and runs
/// all scheduled maintenance work. Errors are logged inside each step and
/// never fatal — a transient failure should not take the server down.
pub fn spawn_background_tasks(state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;

            // 1. Delete uploads whose expiry has passed. The sweeper holds
            //    its own single-flight flag, so a slow sweep simply causes
            //    the next ticks to no-op.
            state.sweeper.tick(&state).await;

            // 2. Discard chunk sessions that have been idle past the
            //    timeout; their clients are not coming back.
            let discarded = state.chunks.sweep_idle().await;
            if discarded > 0 {
                tracing::info!("discarded {discarded} idle chunk sessions");
            }
        }
    });
}
