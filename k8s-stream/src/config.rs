use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

use crate::error::ConfigError;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    /// Identifies this pipeline instance in every payload sent to the sink.
    pub run_id: Option<String>,

    #[envconfig(default = "100")]
    pub batch_size: usize,

    #[envconfig(default = "10000")]
    pub batch_interval: EnvMsDuration,

    #[envconfig(default = "1000")]
    pub channel_capacity: usize,

    #[envconfig(default = "5000")]
    pub request_timeout: EnvMsDuration,

    #[envconfig(default = "5000")]
    pub shutdown_timeout: EnvMsDuration,

    #[envconfig(default = "60")]
    pub object_cache_ttl_secs: i64,

    #[envconfig(default = "0")]
    pub dedup_ttl_secs: i64,

    #[envconfig(default = "60")]
    pub store_cleanup_interval_secs: u64,

    #[envconfig(default = "print")]
    pub sink: SinkKind,

    pub sink_url: Option<String>,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,
}

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "kafka:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "k8s_events")]
    pub kafka_topic: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32,

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::ZeroChannelCapacity);
        }
        if self.batch_interval.0.is_zero() {
            return Err(ConfigError::ZeroBatchInterval);
        }
        if self.store_cleanup_interval_secs == 0 {
            return Err(ConfigError::ZeroCleanupInterval);
        }
        if self.sink == SinkKind::Http && self.sink_url.as_deref().unwrap_or_default().is_empty() {
            return Err(ConfigError::MissingSinkUrl);
        }
        Ok(())
    }

    /// Configured run id, or a fresh one per process start.
    pub fn run_id(&self) -> String {
        match self.run_id.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => id.to_owned(),
            None => uuid::Uuid::now_v7().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Print,
    Kafka,
    Http,
}

impl FromStr for SinkKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "print" => Ok(SinkKind::Print),
            "kafka" => Ok(SinkKind::Kafka),
            "http" => Ok(SinkKind::Http),
            _ => Err(ConfigError::UnknownSink(s.to_owned())),
        }
    }
}
