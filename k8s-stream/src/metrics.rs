use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Routes for scraping and probes. Readiness and liveness only report that the process is serving.
pub fn app(recorder_handle: Option<PrometheusHandle>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(|| std::future::ready("ok")))
        .route("/_liveness", get(|| std::future::ready("ok")))
        .route(
            "/metrics",
            get(move || match recorder_handle {
                Some(ref handle) => std::future::ready(handle.render()),
                None => std::future::ready("no metrics recorder installed".to_owned()),
            }),
        )
        .layer(axum::middleware::from_fn(track_metrics))
}

pub async fn index() -> &'static str {
    "k8s-stream"
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)?
        .install_recorder()
}

/// Middleware to record some common HTTP metrics
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn get_body(router: Router, uri: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_probes() {
        for uri in ["/_readiness", "/_liveness"] {
            assert_eq!(get_body(app(None), uri).await, (StatusCode::OK, "ok".to_owned()));
        }
        assert_eq!(get_body(app(None), "/").await.1, "k8s-stream");
    }

    #[tokio::test]
    async fn test_metrics_without_recorder() {
        let (status, body) = get_body(app(None), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "no metrics recorder installed");
    }
}
