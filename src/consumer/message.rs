//! Records, partition coordinates and offset commit tokens

use crate::consumer::error::SourceResult;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// A topic/partition pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    /// Topic name
    pub topic: String,
    /// Partition number
    pub partition: i32,
}

impl TopicPartition {
    /// Create a topic/partition pair
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// A topic/partition with an offset attached
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPartitionOffset {
    /// Topic/partition
    pub topic_partition: TopicPartition,
    /// Offset within the partition
    pub offset: i64,
}

impl TopicPartitionOffset {
    /// Create a topic/partition/offset triple
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic_partition: TopicPartition::new(topic, partition),
            offset,
        }
    }
}

/// A record delivered by the broker
#[derive(Debug, Clone, PartialEq)]
pub struct Message<K, V> {
    /// Topic the record was read from
    pub topic: String,
    /// Partition the record was read from
    pub partition: i32,
    /// Offset of the record
    pub offset: i64,
    /// Deserialized key
    pub key: K,
    /// Deserialized value
    pub value: V,
    /// Broker timestamp in milliseconds, when available
    pub timestamp: Option<i64>,
}

impl<K, V> Message<K, V> {
    /// Topic/partition of this record
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

/// Coordinates of a consumed record within a consumer group
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionOffset {
    /// Consumer group the record was read for
    pub group_id: String,
    /// Topic
    pub topic: String,
    /// Partition
    pub partition: i32,
    /// Offset of the consumed record
    pub offset: i64,
}

impl PartitionOffset {
    /// Position to record in the group: the next offset to read
    pub fn next_offset(&self) -> TopicPartitionOffset {
        TopicPartitionOffset::new(self.topic.clone(), self.partition, self.offset + 1)
    }
}

/// Commit operation supplied by the client adapter
///
/// Offsets passed in are the positions to store, i.e. one past the last
/// processed record.
pub trait Committer: Send + Sync {
    /// Durably record the given positions for the consumer group
    fn commit(&self, offsets: &[TopicPartitionOffset]) -> SourceResult<()>;
}

/// Commit token handed downstream together with each record
///
/// The stage never commits by itself. Committing more than once is a no-op.
pub struct CommittableOffset {
    partition_offset: PartitionOffset,
    committer: Arc<dyn Committer>,
    committed: AtomicBool,
}

impl CommittableOffset {
    /// Bind a token to a record's coordinates and a commit operation
    pub fn new(partition_offset: PartitionOffset, committer: Arc<dyn Committer>) -> Self {
        Self {
            partition_offset,
            committer,
            committed: AtomicBool::new(false),
        }
    }

    /// Coordinates this token commits
    pub fn partition_offset(&self) -> &PartitionOffset {
        &self.partition_offset
    }

    /// Whether `commit` already succeeded
    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::Acquire)
    }

    /// Commit this record's offset
    pub fn commit(&self) -> SourceResult<()> {
        if self.committed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self
            .committer
            .commit(&[self.partition_offset.next_offset()]);
        if result.is_err() {
            // allow the consumer to try again
            self.committed.store(false, Ordering::Release);
        }
        result
    }
}

impl fmt::Debug for CommittableOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommittableOffset")
            .field("partition_offset", &self.partition_offset)
            .field("committed", &self.is_committed())
            .finish()
    }
}

/// A record together with its commit token
#[derive(Debug)]
pub struct CommittableMessage<K, V> {
    /// The record
    pub record: Message<K, V>,
    /// Token committing this record's offset
    pub committable_offset: CommittableOffset,
}

/// Accumulates commit tokens and commits the highest offset per partition
#[derive(Default)]
pub struct CommittableOffsetBatch {
    offsets: BTreeMap<TopicPartition, (i64, Arc<dyn Committer>)>,
}

impl CommittableOffsetBatch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a token; keeps the highest offset seen for its partition
    ///
    /// The committer of the token with the highest offset is kept with it, so
    /// a partition re-read by a newer client commits through that client.
    pub fn add(&mut self, offset: &CommittableOffset) {
        let po = offset.partition_offset();
        let key = TopicPartition::new(po.topic.clone(), po.partition);
        match self.offsets.get_mut(&key) {
            Some((current, _)) if *current >= po.offset => {}
            Some(entry) => *entry = (po.offset, offset.committer.clone()),
            None => {
                self.offsets
                    .insert(key, (po.offset, offset.committer.clone()));
            }
        }
    }

    /// Builder-style `add`
    pub fn updated(mut self, offset: &CommittableOffset) -> Self {
        self.add(offset);
        self
    }

    /// Number of partitions in the batch
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// Whether the batch holds no offsets
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Highest offset collected per partition
    pub fn offsets(&self) -> BTreeMap<TopicPartition, i64> {
        self.offsets
            .iter()
            .map(|(tp, (offset, _))| (tp.clone(), *offset))
            .collect()
    }

    /// Commit every partition once, grouped by committer
    pub fn commit(&self) -> SourceResult<()> {
        let mut groups: Vec<(Arc<dyn Committer>, Vec<TopicPartitionOffset>)> = Vec::new();
        for (tp, (offset, committer)) in &self.offsets {
            let position = TopicPartitionOffset {
                topic_partition: tp.clone(),
                offset: offset + 1,
            };
            let target = Arc::as_ptr(committer) as *const ();
            match groups
                .iter_mut()
                .find(|(c, _)| Arc::as_ptr(c) as *const () == target)
            {
                Some((_, positions)) => positions.push(position),
                None => groups.push((committer.clone(), vec![position])),
            }
        }
        for (committer, positions) in groups {
            debug!("Committing batch of {} partition offsets", positions.len());
            committer.commit(&positions)?;
        }
        Ok(())
    }
}

impl fmt::Debug for CommittableOffsetBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommittableOffsetBatch")
            .field("offsets", &self.offsets())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::error::SourceError;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingCommitter {
        calls: Mutex<Vec<Vec<TopicPartitionOffset>>>,
        fail: AtomicBool,
    }

    impl Committer for RecordingCommitter {
        fn commit(&self, offsets: &[TopicPartitionOffset]) -> SourceResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SourceError::Commit("broker unavailable".to_string()));
            }
            self.calls.lock().push(offsets.to_vec());
            Ok(())
        }
    }

    fn token(committer: &Arc<RecordingCommitter>, partition: i32, offset: i64) -> CommittableOffset {
        CommittableOffset::new(
            PartitionOffset {
                group_id: "group".to_string(),
                topic: "events".to_string(),
                partition,
                offset,
            },
            committer.clone(),
        )
    }

    #[test]
    fn test_commit_stores_next_offset_once() {
        let committer = Arc::new(RecordingCommitter::default());
        let offset = token(&committer, 0, 41);

        offset.commit().unwrap();
        offset.commit().unwrap();

        let calls = committer.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], vec![TopicPartitionOffset::new("events", 0, 42)]);
        assert!(offset.is_committed());
    }

    #[test]
    fn test_failed_commit_can_be_retried() {
        let committer = Arc::new(RecordingCommitter::default());
        committer.fail.store(true, Ordering::SeqCst);
        let offset = token(&committer, 0, 7);

        assert!(offset.commit().is_err());
        assert!(!offset.is_committed());

        committer.fail.store(false, Ordering::SeqCst);
        offset.commit().unwrap();
        assert_eq!(committer.calls.lock().len(), 1);
    }

    #[test]
    fn test_batch_keeps_highest_offset_per_partition() {
        let committer = Arc::new(RecordingCommitter::default());
        let batch = CommittableOffsetBatch::new()
            .updated(&token(&committer, 0, 5))
            .updated(&token(&committer, 0, 9))
            .updated(&token(&committer, 0, 7))
            .updated(&token(&committer, 1, 3));

        assert_eq!(batch.len(), 2);
        batch.commit().unwrap();

        let calls = committer.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0],
            vec![
                TopicPartitionOffset::new("events", 0, 10),
                TopicPartitionOffset::new("events", 1, 4),
            ]
        );
    }

    #[test]
    fn test_batch_commits_through_committer_of_highest_offset() {
        let old_client = Arc::new(RecordingCommitter::default());
        let new_client = Arc::new(RecordingCommitter::default());
        let batch = CommittableOffsetBatch::new()
            .updated(&token(&old_client, 0, 5))
            .updated(&token(&new_client, 0, 9))
            .updated(&token(&old_client, 0, 7));

        batch.commit().unwrap();

        assert!(old_client.calls.lock().is_empty());
        assert_eq!(
            *new_client.calls.lock(),
            vec![vec![TopicPartitionOffset::new("events", 0, 10)]]
        );
    }
}
