use std::sync::Arc;

use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::enricher::Enricher;
use crate::error::PipelineError;
use crate::event::EnrichedEvent;
use crate::metrics_consts::{EVENTS_FORWARDED, NOTIFICATIONS_FAILED, NOTIFICATIONS_RECEIVED};
use crate::notification::{Notification, Operation, WatchedObject};

/// Entry point for watch callbacks. Processes one notification at a time and feeds the batcher.
pub struct Handler {
    enricher: Arc<Enricher>,
    sender: mpsc::Sender<EnrichedEvent>,
}

impl Handler {
    pub fn new(enricher: Arc<Enricher>, sender: mpsc::Sender<EnrichedEvent>) -> Self {
        Self { enricher, sender }
    }

    pub async fn on_add(&self, object: WatchedObject) {
        self.dispatch(Notification::new(Operation::Added, object))
            .await
    }

    /// The previous state is not used, enrichment always works from the latest object.
    pub async fn on_update(&self, _old: Option<WatchedObject>, new: WatchedObject) {
        self.dispatch(Notification::new(Operation::Updated, new))
            .await
    }

    pub async fn on_delete(&self, object: WatchedObject) {
        self.dispatch(Notification::new(Operation::Deleted, object))
            .await
    }

    async fn dispatch(&self, notification: Notification) {
        let kind = notification.kind();
        let op = notification.op();
        counter!(NOTIFICATIONS_RECEIVED, "kind" => kind, "op" => op.to_string()).increment(1);

        if let Err(err) = self.handle(&notification).await {
            error!(
                kind,
                %op,
                identity = %notification.identity(),
                "failed to process notification: {}",
                err
            );
            counter!(NOTIFICATIONS_FAILED, "kind" => kind).increment(1);
        }
    }

    /// Enrich and forward a single notification.
    pub async fn handle(&self, notification: &Notification) -> Result<(), PipelineError> {
        let Some(enriched) = self.enricher.enrich(notification).await? else {
            return Ok(());
        };

        debug!(id = %enriched.id, reason = %enriched.reason, "forwarding event");
        self.sender
            .send(enriched)
            .await
            .map_err(|_| PipelineError::BatcherClosed)?;
        counter!(EVENTS_FORWARDED, "kind" => notification.kind()).increment(1);

        Ok(())
    }
}
