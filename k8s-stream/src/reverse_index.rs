use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use tracing::warn;

use crate::store::{LocalStore, StoreError, StoreExt};

pub const SERVICE_TABLE: &str = "service";

/// Each pod owns a table listing the uids of the services that selected it. One record per
/// membership means adding a service is a single upsert, so concurrent service updates touching
/// the same pod never overwrite each other.
pub fn pod_service_table(pod_uid: &str) -> String {
    format!("pod-service-{pod_uid}")
}

/// Pod → services lookup maintained from service changes.
///
/// Memberships are never removed when a service stops selecting a pod.
#[derive(Clone)]
pub struct ReverseIndex {
    store: Arc<dyn LocalStore>,
}

impl ReverseIndex {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    pub fn add(&self, pod_uid: &str, service_uid: &str) -> Result<(), StoreError> {
        self.store
            .set_json(&pod_service_table(pod_uid), service_uid, &true)
    }

    pub fn service_uids(&self, pod_uid: &str) -> Result<Vec<String>, StoreError> {
        self.store.list_by_prefix(&pod_service_table(pod_uid), "")
    }

    /// Names of the services known to select `pod_uid`. Services that cannot be resolved are
    /// logged and left out.
    pub fn impacted_services(&self, pod_uid: &str) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();

        for service_uid in self.service_uids(pod_uid)? {
            match self.store.get_json::<Service>(SERVICE_TABLE, &service_uid) {
                Ok(Some(service)) => names.push(service.name_any()),
                Ok(None) => {
                    warn!(pod_uid, %service_uid, "indexed service has no stored record");
                }
                Err(error) => {
                    warn!(pod_uid, %service_uid, "failed to resolve indexed service: {}", error);
                }
            }
        }

        Ok(names)
    }
}
