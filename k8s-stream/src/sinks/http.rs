use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use reqwest::{header, Client};
use tracing::debug;

use crate::event::EnrichedEvent;
use crate::metrics_consts::SINK_ERRORS;
use crate::sinks::{EventSink, SinkBatch, SinkError};

/// POSTs each batch as one JSON document to a collector endpoint.
pub struct HttpSink {
    client: Client,
    url: String,
}

impl HttpSink {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, SinkError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        let client = Client::builder()
            .default_headers(headers)
            .user_agent("k8s-stream")
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            url: url.to_owned(),
        })
    }
}

#[async_trait]
impl EventSink for HttpSink {
    async fn deliver(&self, run_id: &str, events: Vec<EnrichedEvent>) -> Result<(), SinkError> {
        let body = serde_json::to_vec(&SinkBatch {
            uid: run_id,
            events: &events,
        })?;

        let response = self
            .client
            .post(&self.url)
            .body(body)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .inspect_err(|_| {
                counter!(SINK_ERRORS, "sink" => "http").increment(1);
            })?;

        debug!(status = %response.status(), size = events.len(), "batch posted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn event(id: &str) -> EnrichedEvent {
        EnrichedEvent {
            id: id.to_owned(),
            reason: "Killing".to_owned(),
            namespace: "shop".to_owned(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_batch_is_posted_as_one_document() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/events")
                    .header("content-type", "application/json")
                    .json_body_partial(
                        json!({
                            "uid": "run-1",
                            "events": [{"id": "e-1"}, {"id": "e-2"}]
                        })
                        .to_string(),
                    );
                then.status(200);
            })
            .await;

        let sink = HttpSink::new(&server.url("/events"), Duration::from_secs(5)).unwrap();
        sink.deliver("run-1", vec![event("e-1"), event("e-2")])
            .await
            .expect("batch is accepted");

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_status_fails_the_batch() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/events");
                then.status(503);
            })
            .await;

        let sink = HttpSink::new(&server.url("/events"), Duration::from_secs(5)).unwrap();
        let err = sink.deliver("run-1", vec![event("e-1")]).await.unwrap_err();

        assert!(matches!(err, SinkError::Http(_)));
        mock.assert_async().await;
    }
}
