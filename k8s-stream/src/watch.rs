//! Adapts kube-runtime watchers to add/update/delete callbacks.
use std::collections::{HashMap, HashSet};
use std::fmt::Display;

use futures::stream::{BoxStream, Stream, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Event, Service};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::handler::Handler;
use crate::metrics_consts::WATCH_ERRORS;
use crate::notification::WatchedObject;

#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// Object created or modified, or listed during a (re)sync.
    Apply(WatchedObject),
    Delete(WatchedObject),
    /// A relist of `kind` started.
    Init(&'static str),
    /// The relist of `kind` finished, every live object has been applied.
    InitDone(&'static str),
}

impl WatchEvent {
    pub fn lift<K: Into<WatchedObject>>(event: watcher::Event<K>, kind: &'static str) -> Self {
        match event {
            watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => {
                WatchEvent::Apply(obj.into())
            }
            watcher::Event::Delete(obj) => WatchEvent::Delete(obj.into()),
            watcher::Event::Init => WatchEvent::Init(kind),
            watcher::Event::InitDone => WatchEvent::InitDone(kind),
        }
    }
}

/// Cluster-wide Event and Service watches merged into one stream. Watch errors are retried with
/// backoff by kube-runtime and surface as `Err` items.
pub fn watch_stream(client: Client) -> BoxStream<'static, Result<WatchEvent, watcher::Error>> {
    let events = watcher(Api::<Event>::all(client.clone()), watcher::Config::default())
        .default_backoff()
        .map_ok(|event| WatchEvent::lift(event, "Event"));
    let services = watcher(Api::<Service>::all(client), watcher::Config::default())
        .default_backoff()
        .map_ok(|event| WatchEvent::lift(event, "Service"));

    futures::stream::select(events, services).boxed()
}

type ObjectKey = (&'static str, String);

/// Feeds watch events to the handler, in order, remembering objects to tell adds from updates.
pub struct Dispatcher {
    handler: Handler,
    known: HashMap<ObjectKey, WatchedObject>,
    relisting: HashMap<&'static str, HashSet<String>>,
}

impl Dispatcher {
    pub fn new(handler: Handler) -> Self {
        Self {
            handler,
            known: HashMap::new(),
            relisting: HashMap::new(),
        }
    }

    /// Run until the stream ends or `shutdown` fires. The handler is dropped on return, which
    /// closes the batcher's input.
    pub async fn run<S, E>(mut self, stream: S, shutdown: CancellationToken)
    where
        S: Stream<Item = Result<WatchEvent, E>>,
        E: Display,
    {
        let mut stream = std::pin::pin!(stream);

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutdown requested, stopping watches");
                    break;
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(event)) => self.process(event).await,
                Some(Err(err)) => {
                    warn!("watch error: {}", err);
                    counter!(WATCH_ERRORS).increment(1);
                }
                None => {
                    warn!("watch streams ended");
                    break;
                }
            }
        }
    }

    pub async fn process(&mut self, event: WatchEvent) {
        match event {
            WatchEvent::Apply(object) => self.apply(object).await,
            WatchEvent::Delete(object) => {
                if let Some(uid) = object.uid() {
                    self.known.remove(&(object.kind(), uid));
                }
                self.handler.on_delete(object).await;
            }
            WatchEvent::Init(kind) => {
                debug!(kind, "relist started");
                self.relisting.insert(kind, HashSet::new());
            }
            WatchEvent::InitDone(kind) => self.finish_relist(kind).await,
        }
    }

    async fn apply(&mut self, object: WatchedObject) {
        let Some(uid) = object.uid() else {
            self.handler.on_add(object).await;
            return;
        };
        let kind = object.kind();

        if let Some(seen) = self.relisting.get_mut(kind) {
            seen.insert(uid.clone());
        }

        match self.known.insert((kind, uid), object.clone()) {
            Some(old) => self.handler.on_update(Some(old), object).await,
            None => self.handler.on_add(object).await,
        }
    }

    /// Objects known before a relist that it did not return were deleted while disconnected.
    async fn finish_relist(&mut self, kind: &'static str) {
        let Some(seen) = self.relisting.remove(kind) else {
            return;
        };

        let gone: Vec<ObjectKey> = self
            .known
            .keys()
            .filter(|(k, uid)| *k == kind && !seen.contains(uid))
            .cloned()
            .collect();
        debug!(kind, listed = seen.len(), gone = gone.len(), "relist finished");

        for key in gone {
            if let Some(object) = self.known.remove(&key) {
                self.handler.on_delete(object).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterApi, ClusterError, ResolvedObject};
    use crate::dedup::Deduplicator;
    use crate::enricher::Enricher;
    use crate::event::EnrichedEvent;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{ObjectReference, Pod};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct EmptyCluster;

    #[async_trait]
    impl ClusterApi for EmptyCluster {
        async fn resolve_object(
            &self,
            _: &ObjectReference,
        ) -> Result<ResolvedObject, ClusterError> {
            Err(ClusterError::IncompleteReference("kind"))
        }

        async fn resolve_node_address(&self, _: &str) -> Result<Vec<String>, ClusterError> {
            Ok(Vec::new())
        }

        async fn resolve_pods_for_service(&self, _: &Service) -> Result<Vec<Pod>, ClusterError> {
            Ok(Vec::new())
        }
    }

    fn dispatcher() -> (Dispatcher, mpsc::Receiver<EnrichedEvent>) {
        let store = Arc::new(MemoryStore::new());
        let enricher = Enricher::new(
            store.clone(),
            Arc::new(EmptyCluster),
            Deduplicator::new(store, 0),
            60,
        );
        let (tx, rx) = mpsc::channel(32);
        (Dispatcher::new(Handler::new(Arc::new(enricher), tx)), rx)
    }

    fn event(uid: &str) -> WatchedObject {
        Event {
            metadata: ObjectMeta {
                uid: Some(uid.to_owned()),
                namespace: Some("shop".to_owned()),
                ..Default::default()
            },
            reason: Some("Created".to_owned()),
            ..Default::default()
        }
        .into()
    }

    fn service(uid: &str, version: &str) -> WatchedObject {
        Service {
            metadata: ObjectMeta {
                uid: Some(uid.to_owned()),
                name: Some("frontend".to_owned()),
                namespace: Some("shop".to_owned()),
                resource_version: Some(version.to_owned()),
                ..Default::default()
            },
            ..Default::default()
        }
        .into()
    }

    async fn drain(mut rx: mpsc::Receiver<EnrichedEvent>) -> Vec<(String, String)> {
        let mut out = Vec::new();
        while let Some(e) = rx.recv().await {
            out.push((e.id, e.reason));
        }
        out
    }

    fn ok(events: Vec<WatchEvent>) -> impl Stream<Item = Result<WatchEvent, String>> {
        futures::stream::iter(events.into_iter().map(Ok))
    }

    #[test]
    fn test_lift_watcher_events() {
        let lifted = WatchEvent::lift(watcher::Event::InitApply(Service::default()), "Service");
        assert!(matches!(lifted, WatchEvent::Apply(WatchedObject::Service(_))));

        let lifted = WatchEvent::lift(watcher::Event::<Event>::Init, "Event");
        assert!(matches!(lifted, WatchEvent::Init("Event")));

        let lifted = WatchEvent::lift(watcher::Event::Delete(Event::default()), "Event");
        assert!(matches!(lifted, WatchEvent::Delete(WatchedObject::Event(_))));
    }

    #[tokio::test]
    async fn test_add_then_update_of_an_event_forwards_once() {
        let (dispatcher, rx) = dispatcher();

        let stream = ok(vec![
            WatchEvent::Apply(event("e-1")),
            WatchEvent::Apply(event("e-1")),
            WatchEvent::Delete(event("e-1")),
        ]);
        dispatcher.run(stream, CancellationToken::new()).await;

        assert_eq!(drain(rx).await, vec![("e-1".to_owned(), "Created".to_owned())]);
    }

    #[tokio::test]
    async fn test_service_operations_are_tagged() {
        let (dispatcher, rx) = dispatcher();

        let stream = ok(vec![
            WatchEvent::Apply(service("s-1", "1")),
            WatchEvent::Apply(service("s-1", "2")),
            WatchEvent::Delete(service("s-1", "3")),
        ]);
        dispatcher.run(stream, CancellationToken::new()).await;

        assert_eq!(
            drain(rx).await,
            vec![
                ("s-1-1".to_owned(), "addedService".to_owned()),
                ("s-1-2".to_owned(), "updatedService".to_owned()),
                ("s-1-3".to_owned(), "deletedService".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn test_relist_deletes_vanished_objects() {
        let (dispatcher, rx) = dispatcher();

        let stream = ok(vec![
            WatchEvent::Apply(service("s-1", "1")),
            WatchEvent::Apply(service("s-2", "1")),
            WatchEvent::Init("Service"),
            WatchEvent::Apply(service("s-2", "4")),
            WatchEvent::InitDone("Service"),
        ]);
        dispatcher.run(stream, CancellationToken::new()).await;

        // s-1 was deleted while the watch was down; its last known version was already
        // forwarded, so the synthetic delete is dropped.
        assert_eq!(
            drain(rx).await,
            vec![
                ("s-1-1".to_owned(), "addedService".to_owned()),
                ("s-2-1".to_owned(), "addedService".to_owned()),
                ("s-2-4".to_owned(), "updatedService".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn test_watch_errors_do_not_stop_the_loop() {
        let (dispatcher, rx) = dispatcher();

        let stream = futures::stream::iter(vec![
            Err("connection reset".to_owned()),
            Ok(WatchEvent::Apply(event("e-1"))),
        ]);
        dispatcher.run(stream, CancellationToken::new()).await;

        assert_eq!(drain(rx).await.len(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_stops_the_loop() {
        let (dispatcher, rx) = dispatcher();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        dispatcher.run(futures::stream::pending::<Result<WatchEvent, String>>(), shutdown).await;

        assert!(drain(rx).await.is_empty());
    }
}
