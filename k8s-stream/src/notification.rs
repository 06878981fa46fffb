use std::fmt;

use k8s_openapi::api::core::v1::{Event, Service};
use kube::ResourceExt;

/// The kind of change the watch layer observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Added,
    Updated,
    Deleted,
}

impl Operation {
    /// Tag used as message and reason on service records.
    pub fn service_tag(&self) -> &'static str {
        match self {
            Operation::Added => "addedService",
            Operation::Updated => "updatedService",
            Operation::Deleted => "deletedService",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Added => "added",
            Operation::Updated => "updated",
            Operation::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

/// An object delivered by one of the watches.
#[derive(Debug, Clone)]
pub enum WatchedObject {
    Event(Box<Event>),
    Service(Box<Service>),
}

impl WatchedObject {
    pub fn uid(&self) -> Option<String> {
        match self {
            WatchedObject::Event(event) => event.uid(),
            WatchedObject::Service(service) => service.uid(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WatchedObject::Event(_) => "Event",
            WatchedObject::Service(_) => "Service",
        }
    }
}

impl From<Event> for WatchedObject {
    fn from(event: Event) -> Self {
        WatchedObject::Event(Box::new(event))
    }
}

impl From<Service> for WatchedObject {
    fn from(service: Service) -> Self {
        WatchedObject::Service(Box::new(service))
    }
}

/// A single observed change, tagged by the entity kind it concerns.
#[derive(Debug, Clone)]
pub enum Notification {
    ResourceEvent { op: Operation, event: Box<Event> },
    ServiceChange { op: Operation, service: Box<Service> },
}

impl Notification {
    pub fn new(op: Operation, object: WatchedObject) -> Self {
        match object {
            WatchedObject::Event(event) => Notification::ResourceEvent { op, event },
            WatchedObject::Service(service) => Notification::ServiceChange { op, service },
        }
    }

    pub fn op(&self) -> Operation {
        match self {
            Notification::ResourceEvent { op, .. } | Notification::ServiceChange { op, .. } => *op,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Notification::ResourceEvent { .. } => "event",
            Notification::ServiceChange { .. } => "service",
        }
    }

    /// Identity used for deduplication. Service identities carry the resource version.
    pub fn identity(&self) -> String {
        match self {
            Notification::ResourceEvent { event, .. } => event.uid().unwrap_or_default(),
            Notification::ServiceChange { service, .. } => service_identity(service),
        }
    }
}

pub fn service_identity(service: &Service) -> String {
    format!(
        "{}-{}",
        service.uid().unwrap_or_default(),
        service.resource_version().unwrap_or_default()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn test_identity_by_kind() {
        let event = Event {
            metadata: ObjectMeta {
                uid: Some("e-1".to_owned()),
                ..Default::default()
            },
            ..Default::default()
        };
        let service = Service {
            metadata: ObjectMeta {
                uid: Some("s-1".to_owned()),
                resource_version: Some("17".to_owned()),
                ..Default::default()
            },
            ..Default::default()
        };

        let n = Notification::new(Operation::Deleted, event.into());
        assert_eq!(n.identity(), "e-1");
        assert_eq!(n.op(), Operation::Deleted);
        assert_eq!(n.kind(), "event");

        let n = Notification::new(Operation::Updated, service.into());
        assert_eq!(n.identity(), "s-1-17");
        assert_eq!(n.kind(), "service");
    }

    #[test]
    fn test_service_tags() {
        assert_eq!(Operation::Added.service_tag(), "addedService");
        assert_eq!(Operation::Updated.service_tag(), "updatedService");
        assert_eq!(Operation::Deleted.service_tag(), "deletedService");
        assert_eq!(Operation::Deleted.to_string(), "deleted");
    }
}
