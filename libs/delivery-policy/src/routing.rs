//! Deterministic routing helpers.

use uuid::Uuid;

/// Which executor a message's handler runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ExecutorKind {
    /// Per-stream FIFO.
    Serial,
    /// Bounded concurrency, no ordering guarantee.
    Parallel,
}

/// What to do when an envelope exceeds the configured size limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SizeLimitAction {
    /// Log and proceed.
    Warn,
    /// Fail the dispatch before persistence.
    Block,
    /// Proceed silently.
    Ignore,
}

/// Partition for a stream id: little-endian u32 of the id's leading bytes
/// modulo the partition count. Stable across processes and restarts.
pub fn partition_for_stream(stream_id: Uuid, partition_count: i32) -> i32 {
    if partition_count <= 1 {
        return 0;
    }
    let bytes = stream_id.as_bytes();
    let head = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    (head % partition_count as u32) as i32
}

/// Fallback topic for a message type: the simple type name, lowercased.
/// `"ProductCreated, Inventory"` routes to `"productcreated"`.
pub fn default_topic(message_type: &str) -> String {
    message_type
        .split(',')
        .next()
        .unwrap_or(message_type)
        .trim()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_is_stable_and_in_range() {
        let stream = Uuid::now_v7();
        let first = partition_for_stream(stream, 8);
        for _ in 0..10 {
            assert_eq!(partition_for_stream(stream, 8), first);
        }
        assert!((0..8).contains(&first));
    }

    #[test]
    fn single_partition_is_always_zero() {
        assert_eq!(partition_for_stream(Uuid::now_v7(), 1), 0);
        assert_eq!(partition_for_stream(Uuid::now_v7(), 0), 0);
    }

    #[test]
    fn different_streams_spread_across_partitions() {
        let hits: std::collections::HashSet<i32> = (0..64)
            .map(|_| partition_for_stream(Uuid::new_v4(), 4))
            .collect();
        assert!(hits.len() > 1, "64 random streams landed on one partition");
    }

    #[test]
    fn default_topic_uses_the_simple_type_name() {
        assert_eq!(default_topic("ProductCreated, Inventory"), "productcreated");
        assert_eq!(default_topic("OrderPlaced"), "orderplaced");
    }
}
