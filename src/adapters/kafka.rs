//! Kafka-backed queue adapter for the offline path.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};
use tracing::{debug, info, warn};

use crate::domain::task::{TranscodeRequest, TranscodeResult};
use crate::error::{Error, Result};
use crate::ports::queue::{Delivery, RequestSource, ResultSink};

pub const REQUEST_TOPIC: &str = "stream.transcode.request";
pub const RESULT_TOPIC: &str = "stream.transcode.result";

/// Broker list and topic postfix, parsed from the `QUEUE_CONFIG` string
/// `broker1,broker2;postfix` (the postfix part is optional).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub brokers: Vec<String>,
    pub postfix: String,
    pub client_id: String,
    pub region: String,
}

impl QueueConfig {
    pub fn parse(config: &str, client_id: &str, region: &str) -> Result<Self> {
        let (brokers_part, postfix) = match config.split_once(';') {
            Some((brokers, postfix)) => (brokers, postfix.to_string()),
            None => (config, String::new()),
        };

        let brokers: Vec<String> = brokers_part
            .split(',')
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(str::to_string)
            .collect();
        if brokers.is_empty() {
            return Err(Error::Config(format!("no brokers in queue config {config:?}")));
        }

        Ok(Self {
            brokers,
            postfix,
            client_id: client_id.to_string(),
            region: region.to_string(),
        })
    }

    /// Topic name with the configured postfix applied.
    pub fn topic(&self, base: &str) -> String {
        if self.postfix.is_empty() {
            base.to_string()
        } else {
            format!("{base}.{}", self.postfix)
        }
    }

    fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }
}

/// Consumer of the transcode request topic. Offsets are committed
/// explicitly after processing; the broker may therefore redeliver.
pub struct KafkaRequestSource {
    consumer: StreamConsumer,
    topic: String,
}

impl KafkaRequestSource {
    pub fn new(config: &QueueConfig) -> Result<Self> {
        let topic = config.topic(REQUEST_TOPIC);
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", config.bootstrap_servers())
            .set("group.id", format!("{}-transcode", config.client_id))
            .set("client.id", &config.client_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            // Transcodes routinely outlive the default poll interval.
            .set("max.poll.interval.ms", "1800000")
            .create()?;
        consumer.subscribe(&[&topic])?;

        info!(topic = %topic, brokers = %config.bootstrap_servers(), "request consumer ready");
        Ok(Self { consumer, topic })
    }
}

#[async_trait]
impl RequestSource for KafkaRequestSource {
    async fn recv(&self) -> Result<Delivery> {
        loop {
            let message = self.consumer.recv().await?;
            let partition = message.partition();
            let offset = message.offset();

            let Some(payload) = message.payload() else {
                warn!(partition, offset, "empty message skipped");
                continue;
            };

            match serde_json::from_slice::<TranscodeRequest>(payload) {
                Ok(request) => {
                    debug!(partition, offset, blob = %request.blob_id, "request received");
                    return Ok(Delivery {
                        request,
                        partition,
                        offset,
                    });
                }
                Err(e) => {
                    warn!(partition, offset, error = %e, "undecodable message skipped");
                }
            }
        }
    }

    async fn commit(&self, delivery: &Delivery) -> Result<()> {
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(
            &self.topic,
            delivery.partition,
            Offset::Offset(delivery.offset + 1),
        )?;
        self.consumer.commit(&offsets, CommitMode::Sync)?;
        Ok(())
    }
}

/// Publisher of transcode results, keyed by workspace so one workspace's
/// results stay ordered.
pub struct KafkaResultSink {
    producer: FutureProducer,
    topic: String,
}

impl KafkaResultSink {
    pub fn new(config: &QueueConfig) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", config.bootstrap_servers())
            .set("client.id", &config.client_id)
            .set("message.timeout.ms", "30000")
            .create()?;

        Ok(Self {
            producer,
            topic: config.topic(RESULT_TOPIC),
        })
    }
}

#[async_trait]
impl ResultSink for KafkaResultSink {
    async fn publish(&self, result: &TranscodeResult) -> Result<()> {
        let payload = serde_json::to_vec(result)?;
        let record = FutureRecord::to(&self.topic)
            .key(&result.workspace_uuid)
            .payload(&payload);

        self.producer
            .send(record, Duration::from_secs(30))
            .await
            .map_err(|(e, _)| Error::Kafka(e))?;

        debug!(topic = %self.topic, blob = %result.blob_id, "result published");
        Ok(())
    }
}
