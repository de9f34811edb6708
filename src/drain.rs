use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::event::EventProcessor;
use crate::model::{DlqRecord, TopicPartition};

/// What the drain loop needs from Kafka: one poll window's worth of records,
/// per-partition synchronous commits, and the group's remaining backlog.
/// Implemented by [`crate::consumer::DlqConsumer`] in production and by
/// scripted fakes in tests.
#[async_trait]
pub trait DlqSource {
    /// Collect records for up to one poll window. An empty batch is a normal
    /// outcome when the window elapses with nothing ready.
    async fn poll_batch(&self) -> Result<Vec<DlqRecord>>;

    /// Synchronously commit `offset` (the next offset to consume) for one
    /// partition.
    async fn commit(&self, partition: &TopicPartition, offset: i64) -> Result<()>;

    /// Aggregate consumer-group backlog across the drained topic's
    /// partitions.
    async fn remaining_lag(&self) -> Result<u64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The consumer group's backlog reached zero.
    Drained,
    /// Shutdown was requested before the backlog reached zero.
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub outcome: DrainOutcome,
    pub records_drained: u64,
    pub cycles: u64,
}

/// Consume, process, and commit until the consumer group's backlog reaches
/// zero, then stop.
///
/// Each partition's slice of a batch is committed only after every record in
/// the slice has been processed, so a processing error leaves the partition
/// uncommitted and a rerun resumes from the last committed offset. The
/// backlog is re-measured after every batch, including empty ones.
pub async fn drain<S, P>(
    source: &S,
    processor: &P,
    shutdown: &CancellationToken,
) -> Result<DrainReport>
where
    S: DlqSource,
    P: EventProcessor,
{
    let mut records_drained = 0u64;
    let mut cycles = 0u64;

    loop {
        let batch = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!(records_drained, cycles, "shutdown requested, stopping drain");
                return Ok(DrainReport {
                    outcome: DrainOutcome::Interrupted,
                    records_drained,
                    cycles,
                });
            }
            batch = source.poll_batch() => batch?,
        };
        cycles += 1;

        for (partition, records) in group_by_partition(batch) {
            let next_offset = match records.last() {
                Some(last) => last.offset + 1,
                None => continue,
            };
            for record in &records {
                processor.process(record).await?;
            }
            source.commit(&partition, next_offset).await?;
            records_drained += records.len() as u64;
            debug!(
                %partition,
                committed = next_offset,
                records = records.len(),
                "partition batch committed"
            );
        }

        let lag = source.remaining_lag().await?;
        if lag == 0 {
            info!(records_drained, cycles, "backlog drained");
            return Ok(DrainReport {
                outcome: DrainOutcome::Drained,
                records_drained,
                cycles,
            });
        }
        debug!(lag, "backlog remains");
    }
}

/// Group a batch by partition, preserving the offset order records arrived
/// in within each partition.
fn group_by_partition(records: Vec<DlqRecord>) -> BTreeMap<TopicPartition, Vec<DlqRecord>> {
    let mut grouped: BTreeMap<TopicPartition, Vec<DlqRecord>> = BTreeMap::new();
    for record in records {
        grouped
            .entry(record.topic_partition())
            .or_default()
            .push(record);
    }
    grouped
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::event::EventLogger;

    struct FakeSource {
        batches: Mutex<VecDeque<Vec<DlqRecord>>>,
        lags: Mutex<VecDeque<u64>>,
        commits: Mutex<Vec<(TopicPartition, i64)>>,
        block_when_empty: bool,
    }

    impl FakeSource {
        fn new(batches: Vec<Vec<DlqRecord>>, lags: Vec<u64>) -> Self {
            Self {
                batches: Mutex::new(batches.into()),
                lags: Mutex::new(lags.into()),
                commits: Mutex::new(Vec::new()),
                block_when_empty: false,
            }
        }

        fn blocking_when_empty(mut self) -> Self {
            self.block_when_empty = true;
            self
        }

        fn commits(&self) -> Vec<(TopicPartition, i64)> {
            self.commits.lock().unwrap().clone()
        }

        fn unpolled_batches(&self) -> usize {
            self.batches.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl DlqSource for FakeSource {
        async fn poll_batch(&self) -> Result<Vec<DlqRecord>> {
            let next = self.batches.lock().unwrap().pop_front();
            match next {
                Some(batch) => Ok(batch),
                None if self.block_when_empty => std::future::pending().await,
                None => Ok(Vec::new()),
            }
        }

        async fn commit(&self, partition: &TopicPartition, offset: i64) -> Result<()> {
            self.commits.lock().unwrap().push((partition.clone(), offset));
            Ok(())
        }

        async fn remaining_lag(&self) -> Result<u64> {
            Ok(self.lags.lock().unwrap().pop_front().unwrap_or(0))
        }
    }

    fn record(topic: &str, partition: i32, offset: i64) -> DlqRecord {
        DlqRecord {
            topic: topic.to_string(),
            partition,
            offset,
            key: None,
            payload: format!(r#"{{"id":"evt-{offset}"}}"#).into_bytes(),
        }
    }

    #[tokio::test]
    async fn drains_until_backlog_reaches_zero() {
        let source = FakeSource::new(
            vec![
                vec![
                    record("orders.dlq", 0, 7),
                    record("orders.dlq", 0, 8),
                    record("orders.dlq", 0, 9),
                ],
                vec![record("orders.dlq", 0, 10)],
            ],
            vec![0],
        );
        let shutdown = CancellationToken::new();

        let report = drain(&source, &EventLogger, &shutdown).await.unwrap();

        assert_eq!(report.outcome, DrainOutcome::Drained);
        assert_eq!(report.records_drained, 3);
        assert_eq!(report.cycles, 1);
        assert_eq!(
            source.commits(),
            vec![(TopicPartition::new("orders.dlq", 0), 10)]
        );
        // zero lag stops the loop before the next poll
        assert_eq!(source.unpolled_batches(), 1);
    }

    #[tokio::test]
    async fn keeps_polling_while_backlog_remains() {
        let source = FakeSource::new(
            vec![
                vec![record("orders.dlq", 0, 0)],
                vec![record("orders.dlq", 0, 1)],
            ],
            vec![1, 0],
        );
        let shutdown = CancellationToken::new();

        let report = drain(&source, &EventLogger, &shutdown).await.unwrap();

        assert_eq!(report.outcome, DrainOutcome::Drained);
        assert_eq!(report.records_drained, 2);
        assert_eq!(report.cycles, 2);
        assert_eq!(
            source.commits(),
            vec![
                (TopicPartition::new("orders.dlq", 0), 1),
                (TopicPartition::new("orders.dlq", 0), 2),
            ]
        );
    }

    #[tokio::test]
    async fn empty_poll_still_runs_the_lag_check() {
        let source = FakeSource::new(
            vec![Vec::new(), vec![record("orders.dlq", 0, 3)]],
            vec![1, 0],
        );
        let shutdown = CancellationToken::new();

        let report = drain(&source, &EventLogger, &shutdown).await.unwrap();

        assert_eq!(report.outcome, DrainOutcome::Drained);
        assert_eq!(report.cycles, 2);
        assert_eq!(
            source.commits(),
            vec![(TopicPartition::new("orders.dlq", 0), 4)]
        );
    }

    #[tokio::test]
    async fn commits_partitions_independently() {
        let source = FakeSource::new(
            vec![vec![
                record("orders.dlq", 0, 4),
                record("orders.dlq", 1, 9),
                record("orders.dlq", 0, 5),
            ]],
            vec![0],
        );
        let shutdown = CancellationToken::new();

        let report = drain(&source, &EventLogger, &shutdown).await.unwrap();

        assert_eq!(report.records_drained, 3);
        assert_eq!(
            source.commits(),
            vec![
                (TopicPartition::new("orders.dlq", 0), 6),
                (TopicPartition::new("orders.dlq", 1), 10),
            ]
        );
    }

    #[test]
    fn grouping_keeps_offset_order_within_each_partition() {
        let grouped = group_by_partition(vec![
            record("orders.dlq", 1, 3),
            record("orders.dlq", 0, 5),
            record("orders.dlq", 1, 4),
            record("orders.dlq", 0, 6),
        ]);
        let offsets: Vec<(TopicPartition, Vec<i64>)> = grouped
            .into_iter()
            .map(|(tp, records)| (tp, records.iter().map(|r| r.offset).collect()))
            .collect();
        assert_eq!(
            offsets,
            vec![
                (TopicPartition::new("orders.dlq", 0), vec![5, 6]),
                (TopicPartition::new("orders.dlq", 1), vec![3, 4]),
            ]
        );
    }

    #[tokio::test]
    async fn already_caught_up_run_performs_no_commits() {
        let source = FakeSource::new(vec![Vec::new()], vec![0]);
        let shutdown = CancellationToken::new();

        let report = drain(&source, &EventLogger, &shutdown).await.unwrap();

        assert_eq!(report.outcome, DrainOutcome::Drained);
        assert_eq!(report.records_drained, 0);
        assert_eq!(report.cycles, 1);
        assert!(source.commits().is_empty());
    }

    #[tokio::test]
    async fn decode_fault_aborts_the_run_before_commit() {
        let mut bad = record("orders.dlq", 0, 8);
        bad.payload = b"not json".to_vec();
        let source = FakeSource::new(
            vec![vec![record("orders.dlq", 0, 7), bad, record("orders.dlq", 0, 9)]],
            vec![0],
        );
        let shutdown = CancellationToken::new();

        let result = drain(&source, &EventLogger, &shutdown).await;

        assert!(result.is_err());
        assert!(source.commits().is_empty());
    }

    #[tokio::test]
    async fn shutdown_before_the_first_poll_interrupts_immediately() {
        let source = FakeSource::new(Vec::new(), Vec::new()).blocking_when_empty();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let report = drain(&source, &EventLogger, &shutdown).await.unwrap();

        assert_eq!(report.outcome, DrainOutcome::Interrupted);
        assert_eq!(report.records_drained, 0);
        assert!(source.commits().is_empty());
    }

    #[tokio::test]
    async fn shutdown_wakes_a_blocked_poll() {
        let source = FakeSource::new(Vec::new(), Vec::new()).blocking_when_empty();
        let shutdown = CancellationToken::new();
        let canceller = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let report = drain(&source, &EventLogger, &shutdown).await.unwrap();

        assert_eq!(report.outcome, DrainOutcome::Interrupted);
        assert_eq!(report.records_drained, 0);
    }
}
