pub mod batch;
pub mod cluster;
pub mod config;
pub mod dedup;
pub mod enricher;
pub mod error;
pub mod event;
pub mod handler;
pub mod janitor;
pub mod metrics;
pub mod metrics_consts;
pub mod notification;
pub mod pipeline;
pub mod reverse_index;
pub mod sinks;
pub mod store;
pub mod watch;
