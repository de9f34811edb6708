use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::topic_partition_list::TopicPartitionList;
use rdkafka::{ClientConfig, Offset};
use tracing::{info, warn};

use crate::config::Config;
use crate::drain::DlqSource;
use crate::lag::{PartitionLag, aggregate_lag};
use crate::model::{DlqRecord, TopicPartition};

/// Group-managed consumer over the configured dead-letter topics. Records
/// are handed to the drain loop as raw bytes; commits and lag checks run on
/// the blocking pool because librdkafka performs them synchronously.
pub struct DlqConsumer {
    consumer: Arc<StreamConsumer>,
    lag_topic: String,
    partitions: Vec<i32>,
    poll_window: Duration,
    batch_size: usize,
    op_timeout: Duration,
}

impl DlqConsumer {
    /// Connect to the cluster, subscribe to every configured topic, and
    /// discover the partition set backlog is measured against.
    pub async fn connect(config: &Config) -> Result<Self> {
        if config.kafka_key_deserializer != "bytes" || config.kafka_value_deserializer != "bytes" {
            warn!(
                key = %config.kafka_key_deserializer,
                value = %config.kafka_value_deserializer,
                "deserializer settings are recorded but not applied; records are read as raw bytes"
            );
        }

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.kafka_brokers)
            .set("group.id", &config.kafka_group_id)
            .set(
                "enable.auto.commit",
                config.kafka_enable_auto_commit.to_string(),
            )
            .set("auto.offset.reset", &config.kafka_auto_offset_reset)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .create()
            .context("create kafka consumer")?;

        let topics: Vec<&str> = config.kafka_topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topics)
            .with_context(|| format!("subscribe to {}", config.kafka_topics.join(", ")))?;

        let consumer = Arc::new(consumer);
        let op_timeout = Duration::from_millis(config.kafka_op_timeout_ms);
        let lag_topic = config.lag_topic().to_string();
        let partitions =
            fetch_partition_ids(Arc::clone(&consumer), &lag_topic, op_timeout).await?;
        info!(
            topic = %lag_topic,
            partitions = partitions.len(),
            group = %config.kafka_group_id,
            "consumer connected"
        );

        Ok(Self {
            consumer,
            lag_topic,
            partitions,
            poll_window: Duration::from_millis(config.poll_window_ms),
            batch_size: config.batch_size,
            op_timeout,
        })
    }

    /// One row per partition of the drained topic: high watermark plus the
    /// group's committed offset, if it has one.
    async fn partition_lags(&self) -> Result<Vec<PartitionLag>> {
        let consumer = Arc::clone(&self.consumer);
        let topic = self.lag_topic.clone();
        let partitions = self.partitions.clone();
        let timeout = self.op_timeout;
        tokio::task::spawn_blocking(move || -> Result<Vec<PartitionLag>> {
            let mut tpl = TopicPartitionList::new();
            for partition in &partitions {
                tpl.add_partition(&topic, *partition);
            }
            let committed = consumer
                .committed_offsets(tpl, timeout)
                .context("fetch committed offsets")?;

            let mut lags = Vec::with_capacity(partitions.len());
            for element in committed.elements() {
                let (_, high) = consumer
                    .fetch_watermarks(&topic, element.partition(), timeout)
                    .with_context(|| {
                        format!("fetch watermarks for {}[{}]", topic, element.partition())
                    })?;
                let committed_offset = match element.offset() {
                    Offset::Offset(offset) => Some(offset),
                    _ => None,
                };
                lags.push(PartitionLag {
                    partition: element.partition(),
                    end_offset: high,
                    committed: committed_offset,
                });
            }
            Ok(lags)
        })
        .await
        .context("join lag check task")?
    }
}

#[async_trait]
impl DlqSource for DlqConsumer {
    async fn poll_batch(&self) -> Result<Vec<DlqRecord>> {
        let mut records = Vec::new();
        let window = tokio::time::timeout(self.poll_window, std::future::pending::<()>());
        tokio::pin!(window);

        loop {
            if records.len() >= self.batch_size {
                break;
            }
            tokio::select! {
                biased;

                _ = &mut window => {
                    break;
                }

                message = self.consumer.recv() => {
                    let message = message.context("receive from dead-letter topics")?;
                    records.push(DlqRecord {
                        topic: message.topic().to_string(),
                        partition: message.partition(),
                        offset: message.offset(),
                        key: message.key().map(<[u8]>::to_vec),
                        // rdkafka hands back None for tombstones and other
                        // payload-less records
                        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                    });
                }
            }
        }
        Ok(records)
    }

    async fn commit(&self, partition: &TopicPartition, offset: i64) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&partition.topic, partition.partition, Offset::Offset(offset))
            .with_context(|| format!("stage commit for {partition}"))?;

        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync))
            .await
            .context("join commit task")?
            .with_context(|| format!("commit offset {offset} for {partition}"))?;
        Ok(())
    }

    async fn remaining_lag(&self) -> Result<u64> {
        Ok(aggregate_lag(&self.partition_lags().await?))
    }
}

async fn fetch_partition_ids(
    consumer: Arc<StreamConsumer>,
    topic: &str,
    timeout: Duration,
) -> Result<Vec<i32>> {
    let topic_name = topic.to_string();
    let ids = tokio::task::spawn_blocking(move || -> Result<Vec<i32>> {
        let metadata = consumer
            .fetch_metadata(Some(&topic_name), timeout)
            .with_context(|| format!("fetch metadata for {topic_name}"))?;
        let topic_metadata = metadata
            .topics()
            .iter()
            .find(|candidate| candidate.name() == topic_name)
            .ok_or_else(|| anyhow!("topic {topic_name} not found in cluster metadata"))?;
        Ok(topic_metadata
            .partitions()
            .iter()
            .map(|partition| partition.id())
            .collect())
    })
    .await
    .context("join metadata task")??;

    if ids.is_empty() {
        return Err(anyhow!("topic {topic} has no partitions"));
    }
    Ok(ids)
}
