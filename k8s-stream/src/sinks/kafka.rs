use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, gauge};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, Instrument};

use crate::config::KafkaConfig;
use crate::event::EnrichedEvent;
use crate::metrics_consts::SINK_ERRORS;
use crate::sinks::{EventSink, SinkError, SinkRecord};

struct KafkaContext;

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        gauge!("k8s_stream_kafka_callback_queue_depth").set(stats.replyq as f64);
        gauge!("k8s_stream_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("k8s_stream_kafka_producer_queue_depth_limit").set(stats.msg_max as f64);
        gauge!("k8s_stream_kafka_producer_queue_bytes").set(stats.msg_size as f64);
        gauge!("k8s_stream_kafka_producer_queue_bytes_limit").set(stats.msg_size_max as f64);

        for (_, stats) in stats.brokers {
            let id_string = format!("{}", stats.nodeid);
            gauge!("k8s_stream_kafka_broker_requests_pending", "broker" => id_string.clone())
                .set(stats.outbuf_cnt as f64);
            counter!("k8s_stream_kafka_broker_tx_errors_total", "broker" => id_string.clone())
                .absolute(stats.txerrs);
            counter!("k8s_stream_kafka_broker_rx_errors_total", "broker" => id_string)
                .absolute(stats.rxerrs);
        }
    }
}

/// Produces one record per event, keyed by event id so retries of the same event land together.
#[derive(Clone)]
pub struct KafkaSink {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl KafkaSink {
    pub fn new(config: &KafkaConfig) -> Result<KafkaSink, KafkaError> {
        info!("connecting to Kafka brokers at {}...", config.kafka_hosts);

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            );

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka configuration: {:?}", client_config);
        let producer: FutureProducer<KafkaContext> =
            client_config.create_with_context(KafkaContext)?;

        // Ping the cluster to make sure we can reach brokers, fail after 10 seconds
        drop(producer.client().fetch_metadata(
            Some("__consumer_offsets"),
            Timeout::After(Duration::new(10, 0)),
        )?);
        info!("connected to Kafka brokers");

        Ok(KafkaSink {
            producer,
            topic: config.kafka_topic.clone(),
        })
    }

    fn kafka_send(&self, run_id: &str, event: &EnrichedEvent) -> Result<DeliveryFuture, SinkError> {
        let payload = serde_json::to_string(&SinkRecord { uid: run_id, event })?;

        match self.producer.send_result(FutureRecord {
            topic: self.topic.as_str(),
            payload: Some(&payload),
            partition: None,
            key: Some(&event.id),
            timestamp: None,
            headers: None,
        }) {
            Ok(ack) => Ok(ack),
            Err((e, _)) => match e.rdkafka_error_code() {
                Some(RDKafkaErrorCode::MessageSizeTooLarge) => {
                    Err(SinkError::EventTooBig(event.id.clone()))
                }
                _ => Err(SinkError::Kafka(e)),
            },
        }
    }

    async fn process_ack(id: String, delivery: DeliveryFuture) -> Result<(), SinkError> {
        match delivery.await {
            // Cancelled due to timeout while retrying
            Err(_) => Err(SinkError::AckTimeout),
            Ok(Err((KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge), _))) => {
                Err(SinkError::EventTooBig(id))
            }
            Ok(Err((err, _))) => Err(SinkError::Kafka(err)),
            Ok(Ok(_)) => Ok(()),
        }
    }
}

#[async_trait]
impl EventSink for KafkaSink {
    async fn deliver(&self, run_id: &str, events: Vec<EnrichedEvent>) -> Result<(), SinkError> {
        let mut set = JoinSet::new();

        for event in &events {
            // Enqueue sequentially to keep the batch order in the producer queue
            let ack = self.kafka_send(run_id, event)?;
            set.spawn(Self::process_ack(event.id.clone(), ack));
        }

        // Await on all the produce promises, fail batch on first failure
        async move {
            while let Some(res) = set.join_next().await {
                match res {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => {
                        set.abort_all();
                        counter!(SINK_ERRORS, "sink" => "kafka").increment(1);
                        return Err(err);
                    }
                    Err(err) => {
                        set.abort_all();
                        error!("join error while waiting on Kafka ACK: {:?}", err);
                        return Err(SinkError::AckTimeout);
                    }
                }
            }
            Ok(())
        }
        .instrument(info_span!("ack_wait_many"))
        .await
    }
}
