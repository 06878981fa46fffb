//! Point lookups against the Kubernetes API.
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, ObjectReference, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind, ListParams};
use kube::discovery::Scope;
use kube::{Api, Client, ResourceExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("object reference is missing its {0}")]
    IncompleteReference(&'static str),
    #[error("request to the kubernetes API timed out after {0:?}")]
    Timeout(Duration),
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

/// An involved object after resolution. Pods are kept typed since they feed the pod map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedObject {
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<Pod>,
}

impl ResolvedObject {
    pub fn from_pod(pod: Pod) -> Self {
        Self {
            kind: "Pod".to_owned(),
            metadata: pod.metadata.clone(),
            pod: Some(pod),
        }
    }

    pub fn is_pod(&self) -> bool {
        self.kind.eq_ignore_ascii_case("pod")
    }
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn resolve_object(&self, reference: &ObjectReference)
        -> Result<ResolvedObject, ClusterError>;

    async fn resolve_node_address(&self, hostname: &str) -> Result<Vec<String>, ClusterError>;

    async fn resolve_pods_for_service(&self, service: &Service) -> Result<Vec<Pod>, ClusterError>;
}

/// Split `apps/v1` into group and version; core resources have an empty group.
pub fn parse_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

/// Render a service selector as a label selector query. `None` when the service selects nothing.
pub fn label_selector(selector: Option<&BTreeMap<String, String>>) -> Option<String> {
    let selector = selector.filter(|s| !s.is_empty())?;
    Some(
        selector
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(","),
    )
}

pub struct KubeClusterApi {
    client: Client,
    request_timeout: Duration,
}

impl KubeClusterApi {
    pub fn new(client: Client, request_timeout: Duration) -> Self {
        Self {
            client,
            request_timeout,
        }
    }

    async fn bounded<T, F>(&self, request: F) -> Result<T, ClusterError>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        tokio::time::timeout(self.request_timeout, request)
            .await
            .map_err(|_| ClusterError::Timeout(self.request_timeout))?
            .map_err(ClusterError::from)
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn resolve_object(
        &self,
        reference: &ObjectReference,
    ) -> Result<ResolvedObject, ClusterError> {
        let kind = reference
            .kind
            .as_deref()
            .ok_or(ClusterError::IncompleteReference("kind"))?;
        let name = reference
            .name
            .as_deref()
            .ok_or(ClusterError::IncompleteReference("name"))?;
        let api_version = reference.api_version.as_deref().unwrap_or("v1");
        let namespace = reference.namespace.as_deref();

        if kind == "Pod" && api_version == "v1" {
            let api: Api<Pod> = match namespace {
                Some(ns) => Api::namespaced(self.client.clone(), ns),
                None => Api::default_namespaced(self.client.clone()),
            };
            let pod = self.bounded(api.get(name)).await?;
            return Ok(ResolvedObject::from_pod(pod));
        }

        let (group, version) = parse_api_version(api_version);
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let (resource, capabilities) = self
            .bounded(kube::discovery::pinned_kind(&self.client, &gvk))
            .await?;

        let api: Api<DynamicObject> = match (&capabilities.scope, namespace) {
            (Scope::Namespaced, Some(ns)) => {
                Api::namespaced_with(self.client.clone(), ns, &resource)
            }
            _ => Api::all_with(self.client.clone(), &resource),
        };
        let object = self.bounded(api.get(name)).await?;

        Ok(dynamic_to_resolved(object, &resource))
    }

    async fn resolve_node_address(&self, hostname: &str) -> Result<Vec<String>, ClusterError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let node = self.bounded(api.get(hostname)).await?;

        Ok(node
            .status
            .and_then(|status| status.addresses)
            .unwrap_or_default()
            .into_iter()
            .map(|address| address.address)
            .collect())
    }

    async fn resolve_pods_for_service(&self, service: &Service) -> Result<Vec<Pod>, ClusterError> {
        let selector = service.spec.as_ref().and_then(|spec| spec.selector.as_ref());
        let Some(selector) = label_selector(selector) else {
            return Ok(Vec::new());
        };

        let api: Api<Pod> = match service.namespace() {
            Some(ns) => Api::namespaced(self.client.clone(), &ns),
            None => Api::default_namespaced(self.client.clone()),
        };
        let pods = self
            .bounded(api.list(&ListParams::default().labels(&selector)))
            .await?;

        Ok(pods.items)
    }
}

fn dynamic_to_resolved(object: DynamicObject, resource: &ApiResource) -> ResolvedObject {
    let kind = object
        .types
        .as_ref()
        .map(|types| types.kind.clone())
        .unwrap_or_else(|| resource.kind.clone());

    ResolvedObject {
        kind,
        metadata: object.metadata,
        pod: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_api_version() {
        assert_eq!(parse_api_version("v1"), ("", "v1"));
        assert_eq!(parse_api_version("apps/v1"), ("apps", "v1"));
        assert_eq!(
            parse_api_version("batch.volcano.sh/v1alpha1"),
            ("batch.volcano.sh", "v1alpha1")
        );
    }

    #[test]
    fn test_label_selector() {
        assert_eq!(label_selector(None), None);
        assert_eq!(label_selector(Some(&BTreeMap::new())), None);

        let selector = BTreeMap::from([
            ("tier".to_owned(), "web".to_owned()),
            ("app".to_owned(), "shop".to_owned()),
        ]);
        assert_eq!(
            label_selector(Some(&selector)).as_deref(),
            Some("app=shop,tier=web")
        );
    }

    #[test]
    fn test_resolved_pod_keeps_metadata() {
        let pod = Pod {
            metadata: ObjectMeta {
                uid: Some("p-1".to_owned()),
                ..Default::default()
            },
            ..Default::default()
        };
        let resolved = ResolvedObject::from_pod(pod);

        assert!(resolved.is_pod());
        assert_eq!(resolved.metadata.uid.as_deref(), Some("p-1"));
        assert_eq!(resolved.pod.unwrap().uid().as_deref(), Some("p-1"));
    }
}
