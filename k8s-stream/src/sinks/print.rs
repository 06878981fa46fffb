use async_trait::async_trait;
use tracing::info;

use crate::event::EnrichedEvent;
use crate::sinks::{EventSink, SinkError, SinkRecord};

/// Logs every event instead of shipping it anywhere. Handy for local runs.
pub struct PrintSink {}

#[async_trait]
impl EventSink for PrintSink {
    async fn deliver(&self, run_id: &str, events: Vec<EnrichedEvent>) -> Result<(), SinkError> {
        let span = tracing::span!(
            tracing::Level::INFO,
            "batch of events",
            run_id,
            size = events.len()
        );
        let _enter = span.enter();

        for event in &events {
            let line = serde_json::to_string(&SinkRecord { uid: run_id, event })?;
            info!("event: {}", line);
        }

        Ok(())
    }
}
