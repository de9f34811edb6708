/// Backlog snapshot for one partition of the tracked topic: the broker's end
/// offset (high watermark) next to the group's committed offset, which is
/// `None` when the group has never committed on that partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionLag {
    pub partition: i32,
    pub end_offset: i64,
    pub committed: Option<i64>,
}

impl PartitionLag {
    /// Remaining records on this partition. A partition without a committed
    /// offset contributes nothing, and a committed offset past the end
    /// offset (truncated log, stale metadata) clamps to zero rather than
    /// going negative.
    pub fn lag(&self) -> u64 {
        match self.committed {
            Some(committed) if self.end_offset > committed => (self.end_offset - committed) as u64,
            _ => 0,
        }
    }
}

pub fn aggregate_lag(partitions: &[PartitionLag]) -> u64 {
    partitions.iter().map(PartitionLag::lag).sum()
}
