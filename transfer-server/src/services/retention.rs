use crate::state::AppState;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Operator recorded in the audit log for scheduled purges
pub const RETENTION_OPERATOR: &str = "system:retention";

/// Purge down to the configured retention every `every`.
pub fn start_retention_service(state: Arc<AppState>, every: Duration, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // The first tick fires immediately; wait one full period instead.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let transfer = state.transfer.clone();
                    match tokio::task::spawn_blocking(move || transfer.purge(None, RETENTION_OPERATOR)).await {
                        Ok(Ok(result)) if !result.deleted_filenames.is_empty() => {
                            tracing::info!(
                                deleted = result.deleted_filenames.len(),
                                kept = result.kept_count,
                                "[Retention] Scheduled purge removed archives"
                            );
                        }
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => tracing::warn!("[Retention] Scheduled purge failed: {}", e),
                        Err(e) => tracing::error!("[Retention] Scheduled purge task panicked: {}", e),
                    }
                }
            }
        }
        tracing::info!("Retention service stopped");
    });
}
