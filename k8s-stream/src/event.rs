use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Key under which pod records list the services selecting them.
pub const IMPACTED_SERVICES: &str = "impacted_services";

/// Denormalized record handed to the batcher and, eventually, the sink.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnrichedEvent {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub component: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reference_uid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reference_namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reference_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reference_kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reference_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub object_uid: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub address: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pod: BTreeMap<String, Value>,
}

impl EnrichedEvent {
    /// Services recorded on the pod map, if any.
    pub fn impacted_services(&self) -> Option<Vec<String>> {
        let services = self.pod.get(IMPACTED_SERVICES)?.as_array()?;
        Some(
            services
                .iter()
                .filter_map(|s| s.as_str().map(str::to_owned))
                .collect(),
        )
    }
}

/// The handful of pod attributes carried on enriched records.
pub fn pod_summary(pod: &Pod) -> BTreeMap<String, Value> {
    let status = pod.status.as_ref();
    let start_time = status
        .and_then(|s| s.start_time.as_ref())
        .map(|t| Value::String(t.0.to_rfc3339()))
        .unwrap_or(Value::Null);

    BTreeMap::from([
        ("uid".to_owned(), json!(pod.uid().unwrap_or_default())),
        ("name".to_owned(), json!(pod.name_any())),
        ("namespace".to_owned(), json!(pod.namespace().unwrap_or_default())),
        ("start_time".to_owned(), start_time),
        ("ip".to_owned(), json!(status.and_then(|s| s.pod_ip.clone()))),
        ("host_ip".to_owned(), json!(status.and_then(|s| s.host_ip.clone()))),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_eq;
    use chrono::{TimeZone, Utc};
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    #[test]
    fn test_empty_fields_are_omitted() {
        let event = EnrichedEvent {
            id: "e-1".to_owned(),
            timestamp: 1700000000,
            reason: "BackOff".to_owned(),
            ..Default::default()
        };

        assert_json_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"id": "e-1", "timestamp": 1700000000, "reason": "BackOff"})
        );
    }

    #[test]
    fn test_pod_summary() {
        let pod = Pod {
            metadata: ObjectMeta {
                uid: Some("p-1".to_owned()),
                name: Some("web-0".to_owned()),
                namespace: Some("shop".to_owned()),
                ..Default::default()
            },
            status: Some(PodStatus {
                start_time: Some(Time(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())),
                pod_ip: Some("10.0.0.7".to_owned()),
                host_ip: Some("192.168.1.4".to_owned()),
                ..Default::default()
            }),
            ..Default::default()
        };

        assert_json_eq!(
            serde_json::to_value(pod_summary(&pod)).unwrap(),
            json!({
                "uid": "p-1",
                "name": "web-0",
                "namespace": "shop",
                "start_time": "2024-03-01T12:00:00+00:00",
                "ip": "10.0.0.7",
                "host_ip": "192.168.1.4",
            })
        );
    }

    #[test]
    fn test_impacted_services_accessor() {
        let mut event = EnrichedEvent::default();
        assert_eq!(event.impacted_services(), None);

        event
            .pod
            .insert(IMPACTED_SERVICES.to_owned(), json!(["frontend", "backend"]));
        assert_eq!(
            event.impacted_services(),
            Some(vec!["frontend".to_owned(), "backend".to_owned()])
        );
    }
}
