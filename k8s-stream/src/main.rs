//! Watch cluster Events and Services, enrich them, and forward them in batches.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use envconfig::Envconfig;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use k8s_stream::cluster::KubeClusterApi;
use k8s_stream::config::{Config, SinkKind};
use k8s_stream::janitor::cleanup_loop;
use k8s_stream::metrics::{app, serve, setup_metrics_recorder};
use k8s_stream::pipeline::{Pipeline, PipelineSettings};
use k8s_stream::sinks::http::HttpSink;
use k8s_stream::sinks::kafka::KafkaSink;
use k8s_stream::sinks::print::PrintSink;
use k8s_stream::sinks::EventSink;
use k8s_stream::store::{LocalStore, MemoryStore};
use k8s_stream::watch::watch_stream;

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

async fn shutdown(token: CancellationToken) {
    let mut term = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!("failed to register SIGTERM handler: {}", e);
            return;
        }
    };
    let mut interrupt = match signal::unix::signal(signal::unix::SignalKind::interrupt()) {
        Ok(interrupt) => interrupt,
        Err(e) => {
            error!("failed to register SIGINT handler: {}", e);
            return;
        }
    };

    tokio::select! {
        _ = term.recv() => info!("received SIGTERM"),
        _ = interrupt.recv() => info!("received SIGINT"),
    }
    token.cancel();
}

fn build_sink(config: &Config) -> Result<Arc<dyn EventSink>> {
    let sink: Arc<dyn EventSink> = match config.sink {
        SinkKind::Print => Arc::new(PrintSink {}),
        SinkKind::Kafka => {
            Arc::new(KafkaSink::new(&config.kafka).context("failed to create kafka sink")?)
        }
        SinkKind::Http => {
            let url = config.sink_url.as_deref().unwrap_or_default();
            let sink = HttpSink::new(url, config.request_timeout.0)
                .context("failed to create http sink")?;
            Arc::new(sink)
        }
    };
    Ok(sink)
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    info!("starting k8s-stream");

    let config = Config::init_from_env().context("failed to load configuration from env")?;
    config.validate().context("invalid configuration")?;

    let settings = PipelineSettings::from(&config);
    info!(run_id = %settings.run_id, sink = ?config.sink, "configuration loaded");

    let recorder_handle = setup_metrics_recorder().context("failed to install metrics recorder")?;
    let bind = config.bind();
    tokio::spawn(async move {
        if let Err(e) = serve(app(Some(recorder_handle)), &bind).await {
            error!("failed to serve metrics on {}: {}", bind, e);
        }
    });

    let client = kube::Client::try_default()
        .await
        .context("failed to create kubernetes client")?;
    let cluster = Arc::new(KubeClusterApi::new(client.clone(), config.request_timeout.0));
    let sink = build_sink(&config)?;
    let store: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());

    let token = CancellationToken::new();
    tokio::spawn(shutdown(token.clone()));
    let janitor = tokio::spawn(cleanup_loop(
        store.clone(),
        Duration::from_secs(config.store_cleanup_interval_secs),
        token.clone(),
    ));

    let Pipeline {
        dispatcher,
        batcher,
    } = Pipeline::build(settings, store, cluster, sink);
    let batcher = tokio::spawn(batcher.run());

    dispatcher.run(watch_stream(client), token.clone()).await;
    token.cancel();

    // The dispatcher is gone, so the batcher sees its input close and flushes what is pending.
    match tokio::time::timeout(config.shutdown_timeout.0, batcher).await {
        Ok(Ok(())) => info!("batcher drained"),
        Ok(Err(e)) => error!("batcher task failed: {}", e),
        Err(_) => warn!(
            "batcher did not drain within {:?}, pending events are lost",
            config.shutdown_timeout.0
        ),
    }
    if let Err(e) = janitor.await {
        error!("store janitor task failed: {}", e);
    }

    info!("k8s-stream stopped");
    Ok(())
}
