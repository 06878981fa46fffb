pub const NOTIFICATIONS_RECEIVED: &str = "k8s_stream_notifications_received_total";
pub const NOTIFICATIONS_SKIPPED: &str = "k8s_stream_notifications_skipped_total";
pub const NOTIFICATIONS_FAILED: &str = "k8s_stream_notifications_failed_total";
pub const DUPLICATES_DROPPED: &str = "k8s_stream_duplicates_dropped_total";
pub const EVENTS_FORWARDED: &str = "k8s_stream_events_forwarded_total";
pub const ENRICHMENT_LOOKUP_FAILED: &str = "k8s_stream_enrichment_lookup_failed_total";
pub const OBJECT_CACHE_HITS: &str = "k8s_stream_object_cache_hits_total";
pub const OBJECT_CACHE_MISSES: &str = "k8s_stream_object_cache_misses_total";
pub const ENRICHMENT_TIME: &str = "k8s_stream_enrichment_duration_seconds";
pub const WATCH_ERRORS: &str = "k8s_stream_watch_errors_total";
pub const PENDING_EVENTS: &str = "k8s_stream_batch_pending_events";
pub const BATCHES_FLUSHED: &str = "k8s_stream_batches_flushed_total";
pub const BATCH_SIZE: &str = "k8s_stream_batch_size_events";
pub const BATCH_DELIVERY_TIME: &str = "k8s_stream_batch_delivery_duration_seconds";
pub const SINK_ERRORS: &str = "k8s_stream_sink_errors_total";
pub const EVENTS_DROPPED: &str = "k8s_stream_events_dropped_total";
pub const STORE_RECORDS_PURGED: &str = "k8s_stream_store_records_purged_total";
