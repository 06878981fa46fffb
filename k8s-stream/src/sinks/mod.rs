use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::event::EnrichedEvent;

pub mod http;
pub mod kafka;
pub mod print;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("event {0} is too big to be produced")]
    EventTooBig(String),
    #[error("kafka produce failed: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
    #[error("kafka did not acknowledge the write before the message timeout")]
    AckTimeout,
    #[error("http delivery failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Receiver of flushed batches. Implementations own transport and serialization.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, run_id: &str, events: Vec<EnrichedEvent>) -> Result<(), SinkError>;
}

/// Wire shape of a single forwarded event.
#[derive(Debug, Serialize)]
pub struct SinkRecord<'a> {
    pub uid: &'a str,
    pub event: &'a EnrichedEvent,
}

/// Wire shape of a whole batch.
#[derive(Debug, Serialize)]
pub struct SinkBatch<'a> {
    pub uid: &'a str,
    pub events: &'a [EnrichedEvent],
}
