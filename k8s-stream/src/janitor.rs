use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::metrics_consts::STORE_RECORDS_PURGED;
use crate::store::LocalStore;

/// Periodically evict expired records so entries nobody reads again do not pile up.
pub async fn cleanup_loop(
    store: Arc<dyn LocalStore>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        match store.purge_expired() {
            Ok(0) => {}
            Ok(purged) => {
                debug!(purged, "purged expired store records");
                counter!(STORE_RECORDS_PURGED).increment(purged as u64);
            }
            Err(error) => error!("failed to purge expired store records: {}", error),
        }
    }
}
