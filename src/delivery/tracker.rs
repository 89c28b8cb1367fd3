//! Outbound payload-group tracking.

use crate::identity::NodeId;
use crate::protocol::MessageId;
use std::time::{Duration, Instant};

/// Tracks acknowledgement state for one outbound payload group.
///
/// Chunk bytes are retained for the group's lifetime so retransmit
/// requests can replay the original chunk by index. The tracker is
/// terminal when every chunk is acknowledged or the retry budget is
/// exhausted.
pub struct OutgoingTracker {
    group_id: MessageId,
    target: NodeId,
    chunks: Vec<Vec<u8>>,
    acknowledged: Vec<bool>,
    retry_count: u32,
    created_at: Instant,
}

impl OutgoingTracker {
    /// Create a tracker over the group's chunks.
    pub fn new(group_id: MessageId, target: NodeId, chunks: Vec<Vec<u8>>) -> Self {
        let total = chunks.len();
        Self {
            group_id,
            target,
            chunks,
            acknowledged: vec![false; total],
            retry_count: 0,
            created_at: Instant::now(),
        }
    }

    /// Group id.
    pub fn group_id(&self) -> MessageId {
        self.group_id
    }

    /// Destination node.
    pub fn target(&self) -> NodeId {
        self.target
    }

    /// Number of chunks in the group.
    pub fn total_chunks(&self) -> u32 {
        self.chunks.len() as u32
    }

    /// Mark a chunk acknowledged. Idempotent; re-acknowledging a set index
    /// is a no-op. Returns false for out-of-range indices.
    pub fn acknowledge(&mut self, index: u32) -> bool {
        match self.acknowledged.get_mut(index as usize) {
            Some(bit) => {
                *bit = true;
                true
            }
            None => false,
        }
    }

    /// Whether every chunk has been acknowledged.
    pub fn is_complete(&self) -> bool {
        self.acknowledged.iter().all(|bit| *bit)
    }

    /// Number of acknowledged chunks.
    pub fn acknowledged_count(&self) -> u32 {
        self.acknowledged.iter().filter(|bit| **bit).count() as u32
    }

    /// Indices whose acknowledgement is still outstanding.
    pub fn missing_chunks(&self) -> Vec<u32> {
        self.acknowledged
            .iter()
            .enumerate()
            .filter(|(_, bit)| !**bit)
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// The retained bytes of one chunk.
    pub fn chunk(&self, index: u32) -> Option<&[u8]> {
        self.chunks.get(index as usize).map(|c| c.as_slice())
    }

    /// Bump the retry counter, returning the new value.
    pub fn increment_retry(&mut self) -> u32 {
        self.retry_count += 1;
        self.retry_count
    }

    /// Current retry count.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Time since the group was registered.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(chunks: usize) -> OutgoingTracker {
        OutgoingTracker::new(
            MessageId::generate(),
            NodeId::from_bytes([1; 16]),
            (0..chunks).map(|i| vec![i as u8; 8]).collect(),
        )
    }

    #[test]
    fn test_complete_after_all_acks() {
        let mut t = tracker(3);
        assert!(!t.is_complete());
        t.acknowledge(0);
        t.acknowledge(1);
        assert!(!t.is_complete());
        t.acknowledge(2);
        assert!(t.is_complete());
        assert_eq!(t.acknowledged_count(), 3);
    }

    #[test]
    fn test_ack_idempotent() {
        let mut t = tracker(2);
        t.acknowledge(0);
        t.acknowledge(0);
        assert_eq!(t.acknowledged_count(), 1);
        assert_eq!(t.missing_chunks(), vec![1]);
    }

    #[test]
    fn test_ack_out_of_range() {
        let mut t = tracker(2);
        assert!(!t.acknowledge(5));
        assert_eq!(t.acknowledged_count(), 0);
    }

    #[test]
    fn test_missing_chunks() {
        let mut t = tracker(4);
        t.acknowledge(1);
        t.acknowledge(3);
        assert_eq!(t.missing_chunks(), vec![0, 2]);
    }

    #[test]
    fn test_chunk_bytes_retained() {
        let t = tracker(3);
        assert_eq!(t.chunk(1), Some(&[1u8; 8][..]));
        assert!(t.chunk(9).is_none());
    }

    #[test]
    fn test_retry_counter() {
        let mut t = tracker(1);
        assert_eq!(t.retry_count(), 0);
        assert_eq!(t.increment_retry(), 1);
        assert_eq!(t.increment_retry(), 2);
    }
}
