//! Replicable log store seam and an in-memory implementation
//!
//! The replication core never interprets log records beyond their framing:
//! every entry is a 12 byte header (`u32` payload length, `u64` term, both
//! big endian) followed by the payload. Positions are byte offsets into the
//! logical log, so an entry at position `p` with payload length `n` is
//! followed by the next entry at `p + 12 + n`.

use crate::error::{ReplicationError, Result};
use crate::partition::TopicPartitionGroup;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Size of the per-entry header
pub const ENTRY_HEADER_SIZE: usize = 12;

/// Log storage as consumed by replication.
///
/// Implementations must keep `left_position <= commit_position <=
/// right_position` at all times.
pub trait ReplicableStore: Send + Sync {
    /// First readable position
    fn left_position(&self) -> u64;

    /// End of the log, where the next entry will be written
    fn right_position(&self) -> u64;

    /// Highest position known to be committed
    fn commit_position(&self) -> u64;

    /// Truncate the log so that it ends at `position`
    fn set_right_position(&self, position: u64) -> Result<()>;

    /// Drop every entry and restart the log, empty, at `position`
    fn clear(&self, position: u64) -> Result<()>;

    /// Advance the commit position. Never moves it backwards.
    fn commit(&self, position: u64);

    /// Read whole entries starting at `position`, at most `max_len` bytes
    /// unless the first entry alone is larger
    fn read_entry_buffer(&self, position: u64, max_len: usize) -> Result<Bytes>;

    /// Append framed entries, returning the new right position
    fn append_entry_buffer(&self, entries: &[u8]) -> Result<u64>;

    /// Term of the entry starting at `position`
    fn get_entry_term(&self, position: u64) -> Result<u64>;

    /// Position `delta` entries away from `position`
    fn position(&self, position: u64, delta: i64) -> Result<u64>;
}

/// Supplies the replicable store of a partition group
pub trait StoreProvider: Send + Sync {
    fn replicable_store(&self, tpg: &TopicPartitionGroup) -> Option<Arc<dyn ReplicableStore>>;
}

/// Frame one entry
pub fn encode_entry(term: u64, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(ENTRY_HEADER_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_u64(term);
    buf.put_slice(payload);
    buf.freeze()
}

/// Split a buffer of framed entries into `(term, total entry length)` pairs
pub fn decode_entry_headers(mut entries: &[u8]) -> Result<Vec<(u64, usize)>> {
    let mut headers = Vec::new();
    while entries.has_remaining() {
        if entries.remaining() < ENTRY_HEADER_SIZE {
            return Err(ReplicationError::CorruptData(format!(
                "truncated entry header: {} bytes",
                entries.remaining()
            )));
        }
        let len = entries.get_u32() as usize;
        let term = entries.get_u64();
        if entries.remaining() < len {
            return Err(ReplicationError::CorruptData(format!(
                "entry payload truncated: need {}, have {}",
                len,
                entries.remaining()
            )));
        }
        entries.advance(len);
        headers.push((term, ENTRY_HEADER_SIZE + len));
    }
    Ok(headers)
}

#[derive(Debug, Default)]
struct LogState {
    left: u64,
    right: u64,
    commit: u64,
    /// Bytes of `[left, right)`
    data: Vec<u8>,
    /// Entry start position to term
    index: BTreeMap<u64, u64>,
}

impl LogState {
    fn out_of_range(&self, position: u64) -> ReplicationError {
        ReplicationError::PositionOutOfRange {
            position,
            left: self.left,
            right: self.right,
        }
    }

    fn is_boundary(&self, position: u64) -> bool {
        position == self.right || self.index.contains_key(&position)
    }

    fn offset(&self, position: u64) -> usize {
        (position - self.left) as usize
    }
}

/// In-memory `ReplicableStore`
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<LogState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty log whose first entry will be written at `position`
    pub fn starting_at(position: u64) -> Self {
        let store = Self::default();
        {
            let mut state = store.state.write();
            state.left = position;
            state.right = position;
            state.commit = position;
        }
        store
    }

    /// Append one entry written locally by the leader, returning its position
    pub fn append(&self, term: u64, payload: &[u8]) -> u64 {
        let entry = encode_entry(term, payload);
        let mut state = self.state.write();
        let position = state.right;
        state.data.extend_from_slice(&entry);
        state.index.insert(position, term);
        state.right += entry.len() as u64;
        position
    }

    /// Discard entries before `position` (retention)
    pub fn compact(&self, position: u64) -> Result<()> {
        let mut state = self.state.write();
        if position < state.left || position > state.commit || !state.is_boundary(position) {
            return Err(state.out_of_range(position));
        }
        let prefix = state.offset(position);
        state.data.drain(..prefix);
        state.index = state.index.split_off(&position);
        state.left = position;
        Ok(())
    }

    /// Positions of every entry currently held
    pub fn entry_positions(&self) -> Vec<u64> {
        self.state.read().index.keys().copied().collect()
    }
}

impl ReplicableStore for MemoryStore {
    fn left_position(&self) -> u64 {
        self.state.read().left
    }

    fn right_position(&self) -> u64 {
        self.state.read().right
    }

    fn commit_position(&self) -> u64 {
        self.state.read().commit
    }

    fn set_right_position(&self, position: u64) -> Result<()> {
        let mut state = self.state.write();
        if position < state.left || position > state.right {
            return Err(state.out_of_range(position));
        }
        if !state.is_boundary(position) {
            return Err(ReplicationError::CorruptData(format!(
                "position {} is not an entry boundary",
                position
            )));
        }
        let keep = state.offset(position);
        state.data.truncate(keep);
        let _truncated = state.index.split_off(&position);
        state.right = position;
        state.commit = state.commit.min(position);
        Ok(())
    }

    fn clear(&self, position: u64) -> Result<()> {
        let mut state = self.state.write();
        state.data.clear();
        state.index.clear();
        state.left = position;
        state.right = position;
        state.commit = position;
        Ok(())
    }

    fn commit(&self, position: u64) {
        let mut state = self.state.write();
        let position = position.min(state.right);
        if position > state.commit {
            state.commit = position;
        }
    }

    fn read_entry_buffer(&self, position: u64, max_len: usize) -> Result<Bytes> {
        let state = self.state.read();
        if position < state.left || position > state.right {
            return Err(state.out_of_range(position));
        }
        if position == state.right {
            return Ok(Bytes::new());
        }
        if !state.index.contains_key(&position) {
            return Err(ReplicationError::CorruptData(format!(
                "position {} is not an entry boundary",
                position
            )));
        }

        let start = state.offset(position);
        let mut end = start;
        for (&entry_position, _) in state.index.range(position..) {
            let entry_start = state.offset(entry_position);
            let header = &state.data[entry_start..entry_start + ENTRY_HEADER_SIZE];
            let len = ENTRY_HEADER_SIZE
                + u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
            if end > start && end - start + len > max_len {
                break;
            }
            end = entry_start + len;
        }
        Ok(Bytes::copy_from_slice(&state.data[start..end]))
    }

    fn append_entry_buffer(&self, entries: &[u8]) -> Result<u64> {
        let headers = decode_entry_headers(entries)?;
        let mut state = self.state.write();
        let mut position = state.right;
        for (term, len) in headers {
            state.index.insert(position, term);
            position += len as u64;
        }
        state.data.extend_from_slice(entries);
        state.right = position;
        Ok(position)
    }

    fn get_entry_term(&self, position: u64) -> Result<u64> {
        let state = self.state.read();
        state
            .index
            .get(&position)
            .copied()
            .ok_or_else(|| state.out_of_range(position))
    }

    fn position(&self, position: u64, delta: i64) -> Result<u64> {
        let state = self.state.read();
        if !state.is_boundary(position) || position < state.left {
            return Err(state.out_of_range(position));
        }
        let steps = delta.unsigned_abs() as usize;
        let found = if delta < 0 {
            state.index.range(..position).rev().nth(steps - 1).map(|(p, _)| *p)
        } else if delta > 0 {
            state
                .index
                .range(position..)
                .map(|(p, _)| *p)
                .chain(std::iter::once(state.right))
                .nth(steps)
        } else {
            Some(position)
        };
        found.ok_or_else(|| state.out_of_range(position))
    }
}

/// `StoreProvider` over registered in-memory stores
#[derive(Debug, Default)]
pub struct MemoryStoreProvider {
    stores: DashMap<TopicPartitionGroup, Arc<MemoryStore>>,
}

impl MemoryStoreProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a store, replacing any previous one for the same group
    pub fn register(&self, tpg: TopicPartitionGroup, store: Arc<MemoryStore>) {
        self.stores.insert(tpg, store);
    }

    pub fn get(&self, tpg: &TopicPartitionGroup) -> Option<Arc<MemoryStore>> {
        self.stores.get(tpg).map(|e| e.value().clone())
    }
}

impl StoreProvider for MemoryStoreProvider {
    fn replicable_store(&self, tpg: &TopicPartitionGroup) -> Option<Arc<dyn ReplicableStore>> {
        self.get(tpg).map(|s| s as Arc<dyn ReplicableStore>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_terms(terms: &[u64]) -> MemoryStore {
        let store = MemoryStore::new();
        for (i, term) in terms.iter().enumerate() {
            store.append(*term, format!("entry-{}", i).as_bytes());
        }
        store
    }

    // "entry-N" payloads are 7 bytes, so each entry is 19 bytes
    const ENTRY: u64 = ENTRY_HEADER_SIZE as u64 + 7;

    #[test]
    fn test_append_and_positions() {
        let store = store_with_terms(&[1, 1, 2]);
        assert_eq!(store.left_position(), 0);
        assert_eq!(store.right_position(), 3 * ENTRY);
        assert_eq!(store.entry_positions(), vec![0, ENTRY, 2 * ENTRY]);
        assert_eq!(store.get_entry_term(2 * ENTRY).unwrap(), 2);
        assert!(store.get_entry_term(5).is_err());
    }

    #[test]
    fn test_previous_and_next_position() {
        let store = store_with_terms(&[1, 1, 2]);
        assert_eq!(store.position(2 * ENTRY, -1).unwrap(), ENTRY);
        assert_eq!(store.position(3 * ENTRY, -1).unwrap(), 2 * ENTRY);
        assert_eq!(store.position(3 * ENTRY, -3).unwrap(), 0);
        assert!(store.position(0, -1).is_err());
        assert_eq!(store.position(0, 2).unwrap(), 2 * ENTRY);
        assert_eq!(store.position(2 * ENTRY, 1).unwrap(), 3 * ENTRY);
        assert!(store.position(7, -1).is_err());
    }

    #[test]
    fn test_read_is_bounded_by_whole_entries() {
        let store = store_with_terms(&[1, 1, 1]);

        let buf = store.read_entry_buffer(0, 2 * ENTRY as usize + 5).unwrap();
        assert_eq!(buf.len() as u64, 2 * ENTRY);

        // The first entry is always returned even if larger than max_len
        let buf = store.read_entry_buffer(ENTRY, 1).unwrap();
        assert_eq!(buf.len() as u64, ENTRY);

        assert!(store.read_entry_buffer(3 * ENTRY, 1024).unwrap().is_empty());
        assert!(store.read_entry_buffer(3, 1024).is_err());
    }

    #[test]
    fn test_replicate_buffer_into_follower() {
        let leader = store_with_terms(&[1, 2, 2]);
        let follower = MemoryStore::new();

        let buf = leader.read_entry_buffer(0, 1024).unwrap();
        let right = follower.append_entry_buffer(&buf).unwrap();

        assert_eq!(right, leader.right_position());
        assert_eq!(follower.entry_positions(), leader.entry_positions());
        assert_eq!(follower.get_entry_term(ENTRY).unwrap(), 2);
    }

    #[test]
    fn test_corrupt_buffer_is_rejected() {
        let store = MemoryStore::new();
        let mut buf = encode_entry(1, b"payload").to_vec();
        buf.truncate(buf.len() - 2);

        assert!(matches!(
            store.append_entry_buffer(&buf),
            Err(ReplicationError::CorruptData(_))
        ));
        assert_eq!(store.right_position(), 0);
    }

    #[test]
    fn test_truncate_and_commit() {
        let store = store_with_terms(&[1, 1, 1]);
        store.commit(3 * ENTRY);
        assert_eq!(store.commit_position(), 3 * ENTRY);

        store.set_right_position(ENTRY).unwrap();
        assert_eq!(store.right_position(), ENTRY);
        assert_eq!(store.commit_position(), ENTRY);
        assert_eq!(store.entry_positions(), vec![0]);

        // Commit is monotonic and capped at the right position
        store.commit(0);
        assert_eq!(store.commit_position(), ENTRY);
        store.commit(100 * ENTRY);
        assert_eq!(store.commit_position(), ENTRY);

        assert!(store.set_right_position(ENTRY + 3).is_err());
    }

    #[test]
    fn test_compact_and_clear() {
        let store = store_with_terms(&[1, 1, 1]);
        store.commit(2 * ENTRY);
        store.compact(ENTRY).unwrap();
        assert_eq!(store.left_position(), ENTRY);
        assert!(store.read_entry_buffer(0, 1024).is_err());
        assert_eq!(store.position(2 * ENTRY, -1).unwrap(), ENTRY);

        // Cannot compact past the commit position
        assert!(store.compact(3 * ENTRY).is_err());

        store.clear(10 * ENTRY).unwrap();
        assert_eq!(store.left_position(), 10 * ENTRY);
        assert_eq!(store.right_position(), 10 * ENTRY);
        assert_eq!(store.commit_position(), 10 * ENTRY);
    }

    #[test]
    fn test_store_provider() {
        let provider = MemoryStoreProvider::new();
        let tpg = TopicPartitionGroup::new("orders", 1);
        assert!(provider.replicable_store(&tpg).is_none());

        provider.register(tpg.clone(), Arc::new(MemoryStore::starting_at(64)));
        let store = provider.replicable_store(&tpg).unwrap();
        assert_eq!(store.left_position(), 64);
    }
}
