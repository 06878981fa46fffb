use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::batch::Batcher;
use crate::cluster::ClusterApi;
use crate::config::Config;
use crate::dedup::Deduplicator;
use crate::enricher::Enricher;
use crate::handler::Handler;
use crate::sinks::EventSink;
use crate::store::LocalStore;
use crate::watch::Dispatcher;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub run_id: String,
    pub batch_size: usize,
    pub batch_interval: Duration,
    pub channel_capacity: usize,
    pub object_cache_ttl_secs: i64,
    pub dedup_ttl_secs: i64,
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        Self {
            run_id: config.run_id(),
            batch_size: config.batch_size,
            batch_interval: config.batch_interval.0,
            channel_capacity: config.channel_capacity,
            object_cache_ttl_secs: config.object_cache_ttl_secs,
            dedup_ttl_secs: config.dedup_ttl_secs,
        }
    }
}

/// The two halves of a wired pipeline: the watch-facing dispatcher and the sink-facing batcher,
/// connected by a bounded channel.
pub struct Pipeline {
    pub dispatcher: Dispatcher,
    pub batcher: Batcher,
}

impl Pipeline {
    pub fn build(
        settings: PipelineSettings,
        store: Arc<dyn LocalStore>,
        cluster: Arc<dyn ClusterApi>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(settings.channel_capacity);

        let dedup = Deduplicator::new(store.clone(), settings.dedup_ttl_secs);
        let enricher = Enricher::new(store, cluster, dedup, settings.object_cache_ttl_secs);
        let handler = Handler::new(Arc::new(enricher), sender);

        let batcher = Batcher::new(
            settings.run_id,
            settings.batch_size,
            settings.batch_interval,
            sink,
            receiver,
        );

        Self {
            dispatcher: Dispatcher::new(handler),
            batcher,
        }
    }
}
