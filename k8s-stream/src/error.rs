use thiserror::Error;

use crate::cluster::ClusterError;
use crate::store::StoreError;

/// Errors that abort the processing of a single notification.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("local store error: {0}")]
    Store(#[from] StoreError),
    #[error("cluster lookup failed: {0}")]
    Cluster(#[from] ClusterError),
    #[error("batcher input channel is closed")]
    BatcherClosed,
}

/// Enumeration of errors raised while validating configuration at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} is not a valid sink, expected one of: print, kafka, http")]
    UnknownSink(String),
    #[error("BATCH_SIZE must be greater than zero")]
    ZeroBatchSize,
    #[error("CHANNEL_CAPACITY must be greater than zero")]
    ZeroChannelCapacity,
    #[error("BATCH_INTERVAL must be greater than zero")]
    ZeroBatchInterval,
    #[error("STORE_CLEANUP_INTERVAL_SECS must be greater than zero")]
    ZeroCleanupInterval,
    #[error("SINK_URL is required when SINK=http")]
    MissingSinkUrl,
}
