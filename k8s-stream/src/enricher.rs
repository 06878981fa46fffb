use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::core::v1::{Event, ObjectReference, Pod, Service};
use kube::ResourceExt;
use serde_json::Value;
use tracing::{debug, warn};

use crate::cluster::{ClusterApi, ResolvedObject};
use crate::dedup::{is_newer, Deduplicator};
use crate::error::PipelineError;
use crate::event::{pod_summary, EnrichedEvent, IMPACTED_SERVICES};
use crate::metrics_consts::{
    DUPLICATES_DROPPED, ENRICHMENT_LOOKUP_FAILED, ENRICHMENT_TIME, NOTIFICATIONS_SKIPPED,
    OBJECT_CACHE_HITS, OBJECT_CACHE_MISSES,
};
use crate::notification::{service_identity, Notification, Operation};
use crate::reverse_index::{ReverseIndex, SERVICE_TABLE};
use crate::store::{LocalStore, StoreError, StoreExt};

pub const SERVICE_PODS_TABLE: &str = "service-pods";
pub const OBJECTS_TABLE: &str = "objects";
pub const NODES_TABLE: &str = "nodes";

/// Namespaces whose events are never forwarded.
pub const IGNORED_EVENT_NAMESPACES: [&str; 3] =
    ["kube-system", "kubernetes", "kubernetes-dashboard"];
/// Namespaces whose services are never forwarded.
pub const IGNORED_SERVICE_NAMESPACES: [&str; 2] = ["kube-system", "kubernetes-dashboard"];

/// Turns notifications into enriched records, maintaining the reverse index on the way.
pub struct Enricher {
    store: Arc<dyn LocalStore>,
    cluster: Arc<dyn ClusterApi>,
    dedup: Deduplicator,
    reverse_index: ReverseIndex,
    /// Expiry for cached involved objects and node addresses.
    object_cache_ttl: i64,
}

impl Enricher {
    pub fn new(
        store: Arc<dyn LocalStore>,
        cluster: Arc<dyn ClusterApi>,
        dedup: Deduplicator,
        object_cache_ttl: i64,
    ) -> Self {
        Self {
            reverse_index: ReverseIndex::new(store.clone()),
            store,
            cluster,
            dedup,
            object_cache_ttl,
        }
    }

    pub fn reverse_index(&self) -> &ReverseIndex {
        &self.reverse_index
    }

    /// Enrich a notification. `Ok(None)` means it was filtered out or already processed.
    ///
    /// A returned record has already been marked as processed, so it must be forwarded exactly
    /// once.
    pub async fn enrich(
        &self,
        notification: &Notification,
    ) -> Result<Option<EnrichedEvent>, PipelineError> {
        let start = Instant::now();
        let kind = notification.kind();

        let result = match notification {
            Notification::ResourceEvent { event, .. } => self.enrich_event(event).await,
            Notification::ServiceChange { op, service } => self.enrich_service(*op, service).await,
        };

        metrics::histogram!(ENRICHMENT_TIME, "kind" => kind).record(start.elapsed().as_secs_f64());
        result
    }

    async fn enrich_event(&self, event: &Event) -> Result<Option<EnrichedEvent>, PipelineError> {
        let namespace = event.namespace().unwrap_or_default();
        if IGNORED_EVENT_NAMESPACES.contains(&namespace.as_str()) {
            metrics::counter!(NOTIFICATIONS_SKIPPED, "kind" => "event", "reason" => "namespace")
                .increment(1);
            return Ok(None);
        }

        let Some(identity) = event.uid().filter(|uid| !uid.is_empty()) else {
            warn!(%namespace, name = %event.name_any(), "dropping event without a uid");
            metrics::counter!(NOTIFICATIONS_SKIPPED, "kind" => "event", "reason" => "missing_uid")
                .increment(1);
            return Ok(None);
        };

        if self.dedup.already_processed(&identity)? {
            debug!(%identity, "event already processed");
            metrics::counter!(DUPLICATES_DROPPED, "kind" => "event").increment(1);
            return Ok(None);
        }

        let reference = &event.involved_object;
        let object = self.resolve_object(reference).await?;

        let source = event.source.clone().unwrap_or_default();
        let host = source.host.unwrap_or_default();
        let address = if host.is_empty() {
            Vec::new()
        } else {
            self.resolve_node_address(&host).await?
        };

        let mut enriched = EnrichedEvent {
            id: identity.clone(),
            timestamp: event
                .metadata
                .creation_timestamp
                .as_ref()
                .map(|t| t.0.timestamp())
                .unwrap_or_else(|| chrono::Utc::now().timestamp()),
            component: source.component.unwrap_or_default(),
            host,
            message: event.message.clone().unwrap_or_default(),
            namespace,
            reason: event.reason.clone().unwrap_or_default(),
            reference_uid: reference.uid.clone().unwrap_or_default(),
            reference_namespace: reference.namespace.clone().unwrap_or_default(),
            reference_name: reference.name.clone().unwrap_or_default(),
            reference_kind: reference.kind.clone().unwrap_or_default(),
            reference_version: reference.api_version.clone().unwrap_or_default(),
            address,
            ..Default::default()
        };

        if let Some(object) = object {
            if let Some(ns) = object.metadata.namespace.clone() {
                enriched.reference_namespace = ns;
            }
            enriched.reference_kind = object.kind.clone();
            enriched.object_uid = object.metadata.uid.clone().unwrap_or_default();
            enriched.labels = object.metadata.labels.clone().unwrap_or_default();
            enriched.annotations = object.metadata.annotations.clone().unwrap_or_default();

            if let Some(pod) = object.pod.as_ref().filter(|_| object.is_pod()) {
                enriched.pod = self.pod_details(pod);
            }
        }

        self.dedup.mark_processed(&identity, None)?;
        Ok(Some(enriched))
    }

    async fn enrich_service(
        &self,
        op: Operation,
        service: &Service,
    ) -> Result<Option<EnrichedEvent>, PipelineError> {
        let namespace = service.namespace().unwrap_or_default();
        let name = service.name_any();
        if IGNORED_SERVICE_NAMESPACES.contains(&namespace.as_str())
            || (namespace == "default" && name == "kubernetes")
        {
            metrics::counter!(NOTIFICATIONS_SKIPPED, "kind" => "service", "reason" => "namespace")
                .increment(1);
            return Ok(None);
        }

        let uid = service.uid().unwrap_or_default();
        let version = service.resource_version().unwrap_or_default();
        let version_key = format!("{namespace}/{uid}");

        let recorded = self.dedup.latest_version(&version_key)?;
        if !is_newer(&version, recorded.as_deref()) {
            debug!(
                service = %name,
                %version,
                recorded = recorded.as_deref().unwrap_or_default(),
                "service version already processed"
            );
            metrics::counter!(DUPLICATES_DROPPED, "kind" => "service").increment(1);
            return Ok(None);
        }

        // The version record can expire or be lost independently of the versioned identity.
        let identity = service_identity(service);
        if self.dedup.already_processed(&identity)? {
            debug!(service = %name, %identity, "service identity already processed");
            metrics::counter!(DUPLICATES_DROPPED, "kind" => "service").increment(1);
            return Ok(None);
        }

        self.store.set_json(SERVICE_TABLE, &uid, service)?;

        let pods = self.cluster.resolve_pods_for_service(service).await?;

        let summaries: Vec<BTreeMap<String, Value>> = pods.iter().map(pod_summary).collect();
        self.store.set_json(SERVICE_PODS_TABLE, &uid, &summaries)?;

        for pod in &pods {
            match pod.uid() {
                Some(pod_uid) => self.reverse_index.add(&pod_uid, &uid)?,
                None => warn!(pod = %pod.name_any(), "selected pod has no uid, not indexing"),
            }
        }

        let pod_map = pods
            .iter()
            .zip(summaries)
            .map(|(pod, summary)| (pod.name_any(), Value::Object(summary.into_iter().collect())))
            .collect();

        let tag = op.service_tag();
        let enriched = EnrichedEvent {
            id: identity,
            timestamp: chrono::Utc::now().timestamp(),
            component: name,
            message: tag.to_owned(),
            namespace,
            reason: tag.to_owned(),
            reference_version: version.clone(),
            object_uid: uid,
            labels: service.labels().clone(),
            annotations: service.annotations().clone(),
            pod: pod_map,
            ..Default::default()
        };

        self.dedup.mark_processed(&version_key, Some(&version))?;
        self.dedup.mark_processed(&enriched.id, Some(&version))?;
        Ok(Some(enriched))
    }

    fn pod_details(&self, pod: &Pod) -> BTreeMap<String, Value> {
        let mut details = pod_summary(pod);
        let uid = pod.uid().unwrap_or_default();

        match self.reverse_index.impacted_services(&uid) {
            Ok(services) => {
                details.insert(IMPACTED_SERVICES.to_owned(), Value::from(services));
            }
            Err(error) => warn!(pod_uid = %uid, "failed to list impacted services: {}", error),
        }
        details
    }

    /// Involved object from the cache, falling back to the API. A failed lookup yields `None`.
    async fn resolve_object(
        &self,
        reference: &ObjectReference,
    ) -> Result<Option<ResolvedObject>, StoreError> {
        let key = object_cache_key(reference);

        if let Some(cached) = self.store.get_json::<ResolvedObject>(OBJECTS_TABLE, &key)? {
            metrics::counter!(OBJECT_CACHE_HITS, "table" => OBJECTS_TABLE).increment(1);
            return Ok(Some(cached));
        }
        metrics::counter!(OBJECT_CACHE_MISSES, "table" => OBJECTS_TABLE).increment(1);

        match self.cluster.resolve_object(reference).await {
            Ok(object) => {
                self.store
                    .set_json_with_ttl(OBJECTS_TABLE, &key, &object, self.object_cache_ttl)?;
                Ok(Some(object))
            }
            Err(error) => {
                warn!(%key, "failed to resolve involved object: {}", error);
                metrics::counter!(ENRICHMENT_LOOKUP_FAILED, "lookup" => "object").increment(1);
                Ok(None)
            }
        }
    }

    /// Node addresses from the cache, falling back to the API. A failed lookup yields no addresses.
    async fn resolve_node_address(&self, hostname: &str) -> Result<Vec<String>, StoreError> {
        if let Some(cached) = self.store.get_json::<Vec<String>>(NODES_TABLE, hostname)? {
            metrics::counter!(OBJECT_CACHE_HITS, "table" => NODES_TABLE).increment(1);
            return Ok(cached);
        }
        metrics::counter!(OBJECT_CACHE_MISSES, "table" => NODES_TABLE).increment(1);

        match self.cluster.resolve_node_address(hostname).await {
            Ok(addresses) => {
                self.store.set_json_with_ttl(
                    NODES_TABLE,
                    hostname,
                    &addresses,
                    self.object_cache_ttl,
                )?;
                Ok(addresses)
            }
            Err(error) => {
                warn!(hostname, "failed to resolve node address: {}", error);
                metrics::counter!(ENRICHMENT_LOOKUP_FAILED, "lookup" => "node").increment(1);
                Ok(Vec::new())
            }
        }
    }
}

/// Cache key for an involved object: its uid when present, its coordinates otherwise.
pub fn object_cache_key(reference: &ObjectReference) -> String {
    match reference.uid.as_deref().filter(|uid| !uid.is_empty()) {
        Some(uid) => uid.to_owned(),
        None => format!(
            "{}/{}/{}/{}",
            reference.api_version.as_deref().unwrap_or("v1"),
            reference.kind.as_deref().unwrap_or_default(),
            reference.namespace.as_deref().unwrap_or_default(),
            reference.name.as_deref().unwrap_or_default(),
        ),
    }
}
