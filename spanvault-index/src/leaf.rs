// Copyright 2025 SpanVault (https://github.com/spanvault)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Leaf strategies
//!
//! The terminal nodes of an indexing tree. Three strategies exist:
//!
//! - [`DirectLeaf`] holds live records by reference and supports exact
//!   get/remove. This is the buffer's tree.
//! - [`ArrayDescriptorLeaf`] holds one descriptor slot per record id,
//!   keeping single-element addressability on disk.
//! - [`RangeDescriptorLeaf`] folds completed writes into cumulative byte
//!   ranges, splitting at a maximum range size. Far lower overhead, no
//!   single-element retrieval.
//!
//! Each descriptor leaf owns one write channel, allocated from the tree's
//! shared [`ChannelAllocator`] when the leaf is created.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use spanvault_core::{
    Descriptor, DescriptorSlot, RecordQuery, Result, TelemetryRecord, VaultError,
    WriteReservation,
};

/// Default maximum size of one cumulative byte range: 8 MB.
pub const DEFAULT_MAX_RANGE_SIZE: u64 = 8 * 1024 * 1024;

/// Rough heap cost of one concurrent-map entry (key, value, bucket slot).
const MAP_ENTRY_OVERHEAD: u64 = 48;

/// Rough fixed cost of a leaf itself.
const LEAF_BASE_SIZE: u64 = 96;

/// A terminal tree component.
///
/// `Context` is per-tree state shared by every leaf of the strategy; the
/// tree passes it to [`Leaf::new`] whenever a put creates a missing leaf.
pub trait Leaf: Send + Sync + 'static {
    type Context: Send + Sync + Default;
    /// What a put hands back to the caller.
    type Handle;
    /// What queries return.
    type Element: Clone + Send;

    fn new(context: &Self::Context) -> Self;

    fn put(&self, record: &Arc<TelemetryRecord>) -> Result<Self::Handle>;

    /// Exact lookup of the stored representation of `record`.
    fn get(&self, record: &TelemetryRecord) -> Option<Self::Element>;

    /// Exact removal; returns the removed representation when addressable.
    fn remove(&self, record: &TelemetryRecord) -> Option<Self::Element>;

    /// Append every stored element matching `query` to `out`.
    fn query(&self, query: &RecordQuery, out: &mut Vec<Self::Element>);

    /// Number of stored entries (including in-flight reservations).
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Estimated heap footprint of the leaf structure itself, excluding
    /// record payloads (those are accounted by the buffer analyzer).
    fn byte_size(&self) -> u64;
}

/// A leaf strategy that can be snapshotted into the on-disk index file.
pub trait PersistentLeaf: Leaf {
    type Snapshot: Serialize + for<'de> Deserialize<'de> + Send;

    fn snapshot(&self) -> Self::Snapshot;

    fn restore(context: &Self::Context, snapshot: Self::Snapshot) -> Self;
}

// ---------------------------------------------------------------------------
// DirectLeaf
// ---------------------------------------------------------------------------

/// Live-buffer leaf: record references keyed by record id.
#[derive(Debug, Default)]
pub struct DirectLeaf {
    records: DashMap<u64, Arc<TelemetryRecord>>,
}

impl Leaf for DirectLeaf {
    type Context = ();
    type Handle = ();
    type Element = Arc<TelemetryRecord>;

    fn new(_context: &()) -> Self {
        Self::default()
    }

    fn put(&self, record: &Arc<TelemetryRecord>) -> Result<()> {
        match self.records.entry(record.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(VaultError::DuplicateId(record.id)),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(record));
                Ok(())
            }
        }
    }

    fn get(&self, record: &TelemetryRecord) -> Option<Arc<TelemetryRecord>> {
        self.records.get(&record.id).map(|entry| Arc::clone(entry.value()))
    }

    fn remove(&self, record: &TelemetryRecord) -> Option<Arc<TelemetryRecord>> {
        self.records.remove(&record.id).map(|(_, stored)| stored)
    }

    fn query(&self, query: &RecordQuery, out: &mut Vec<Arc<TelemetryRecord>>) {
        for entry in self.records.iter() {
            if query.matches(entry.value()) {
                out.push(Arc::clone(entry.value()));
            }
        }
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn byte_size(&self) -> u64 {
        LEAF_BASE_SIZE + self.records.len() as u64 * MAP_ENTRY_OVERHEAD
    }
}

// ---------------------------------------------------------------------------
// Descriptor leaves
// ---------------------------------------------------------------------------

/// Hands out write-channel ids, one per descriptor leaf.
#[derive(Debug, Default)]
pub struct ChannelAllocator {
    next: AtomicU32,
}

impl ChannelAllocator {
    pub fn allocate(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Ensure future allocations land above `channel_id`. Used when a
    /// persisted tree is restored.
    pub fn bump_past(&self, channel_id: u32) {
        self.next.fetch_max(channel_id + 1, Ordering::Relaxed);
    }
}

/// Shared context of the descriptor leaf strategies.
#[derive(Debug)]
pub struct DescriptorLeafContext {
    pub allocator: ChannelAllocator,
    /// Split threshold for [`RangeDescriptorLeaf`] ranges.
    pub max_range_size: u64,
}

impl Default for DescriptorLeafContext {
    fn default() -> Self {
        Self {
            allocator: ChannelAllocator::default(),
            max_range_size: DEFAULT_MAX_RANGE_SIZE,
        }
    }
}

/// Storage leaf keeping one descriptor slot per record id.
///
/// Queries return only populated descriptors; a reservation whose write is
/// still in flight stays invisible to readers.
#[derive(Debug)]
pub struct ArrayDescriptorLeaf {
    channel_id: u32,
    slots: DashMap<u64, WriteReservation>,
}

impl ArrayDescriptorLeaf {
    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }
}

impl Leaf for ArrayDescriptorLeaf {
    type Context = DescriptorLeafContext;
    type Handle = WriteReservation;
    type Element = Descriptor;

    fn new(context: &DescriptorLeafContext) -> Self {
        Self {
            channel_id: context.allocator.allocate(),
            slots: DashMap::new(),
        }
    }

    fn put(&self, record: &Arc<TelemetryRecord>) -> Result<WriteReservation> {
        match self.slots.entry(record.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(VaultError::DuplicateId(record.id)),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let slot: WriteReservation =
                    Arc::new(DescriptorSlot::new(self.channel_id, record.id));
                vacant.insert(Arc::clone(&slot));
                Ok(slot)
            }
        }
    }

    fn get(&self, record: &TelemetryRecord) -> Option<Descriptor> {
        self.slots
            .get(&record.id)
            .and_then(|slot| slot.descriptor())
    }

    fn remove(&self, record: &TelemetryRecord) -> Option<Descriptor> {
        self.slots
            .remove(&record.id)
            .and_then(|(_, slot)| slot.descriptor())
    }

    fn query(&self, _query: &RecordQuery, out: &mut Vec<Descriptor>) {
        // Record-level predicates cannot be applied here: the payload lives
        // on disk. The tree descent has already constrained the indexed
        // dimensions; everything else is the external reader's concern.
        for entry in self.slots.iter() {
            if let Some(descriptor) = entry.value().descriptor() {
                out.push(descriptor);
            }
        }
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    fn byte_size(&self) -> u64 {
        LEAF_BASE_SIZE + self.slots.len() as u64 * MAP_ENTRY_OVERHEAD
    }
}

/// Serialized form of an [`ArrayDescriptorLeaf`].
///
/// Only populated slots are persisted; an unpopulated reservation is an
/// unfinished write and does not survive a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArrayLeafSnapshot {
    pub channel_id: u32,
    pub entries: Vec<(u64, Descriptor)>,
}

impl PersistentLeaf for ArrayDescriptorLeaf {
    type Snapshot = ArrayLeafSnapshot;

    fn snapshot(&self) -> ArrayLeafSnapshot {
        let mut entries: Vec<(u64, Descriptor)> = self
            .slots
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .descriptor()
                    .map(|descriptor| (*entry.key(), descriptor))
            })
            .collect();
        entries.sort_unstable_by_key(|&(id, _)| id);
        ArrayLeafSnapshot {
            channel_id: self.channel_id,
            entries,
        }
    }

    fn restore(context: &DescriptorLeafContext, snapshot: ArrayLeafSnapshot) -> Self {
        context.allocator.bump_past(snapshot.channel_id);
        let slots = DashMap::new();
        for (record_id, descriptor) in snapshot.entries {
            let slot = DescriptorSlot::new(snapshot.channel_id, record_id);
            slot.populate(descriptor.position, descriptor.size);
            slots.insert(record_id, Arc::new(slot));
        }
        Self {
            channel_id: snapshot.channel_id,
            slots,
        }
    }
}

/// Storage leaf tracking only cumulative byte ranges.
///
/// Completed writes are folded into the trailing range while it stays below
/// the maximum range size; adjacency is required, so out-of-order
/// completions open a new range. Elements can only be read back as a batch.
#[derive(Debug)]
pub struct RangeDescriptorLeaf {
    channel_id: u32,
    max_range_size: u64,
    ranges: Mutex<Vec<Descriptor>>,
    /// Reservations whose writes have not completed yet. Drained into
    /// `ranges` on the next coalesce.
    pending: Mutex<Vec<WriteReservation>>,
}

impl RangeDescriptorLeaf {
    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    /// Fold every populated pending reservation into the range list.
    fn coalesce(&self) {
        let mut pending = self.pending.lock();
        if pending.iter().all(|slot| !slot.is_populated()) {
            return;
        }

        let mut completed: Vec<Descriptor> = Vec::new();
        pending.retain(|slot| match slot.descriptor() {
            Some(descriptor) => {
                completed.push(descriptor);
                false
            }
            None => true,
        });

        let mut ranges = self.ranges.lock();
        completed.sort_unstable();
        for descriptor in completed {
            match ranges.last_mut() {
                Some(last)
                    if last.joinable_with(&descriptor)
                        && last.size + descriptor.size <= self.max_range_size =>
                {
                    last.size += descriptor.size;
                }
                _ => ranges.push(descriptor),
            }
        }
    }
}

impl Leaf for RangeDescriptorLeaf {
    type Context = DescriptorLeafContext;
    type Handle = WriteReservation;
    type Element = Descriptor;

    fn new(context: &DescriptorLeafContext) -> Self {
        Self {
            channel_id: context.allocator.allocate(),
            max_range_size: context.max_range_size,
            ranges: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
        }
    }

    fn put(&self, record: &Arc<TelemetryRecord>) -> Result<WriteReservation> {
        let slot: WriteReservation = Arc::new(DescriptorSlot::new(self.channel_id, record.id));
        self.pending.lock().push(Arc::clone(&slot));
        Ok(slot)
    }

    /// Not addressable: ranges do not remember element boundaries.
    fn get(&self, _record: &TelemetryRecord) -> Option<Descriptor> {
        None
    }

    /// Not addressable.
    fn remove(&self, _record: &TelemetryRecord) -> Option<Descriptor> {
        None
    }

    fn query(&self, _query: &RecordQuery, out: &mut Vec<Descriptor>) {
        self.coalesce();
        out.extend(self.ranges.lock().iter().copied());
    }

    fn len(&self) -> usize {
        self.ranges.lock().len() + self.pending.lock().len()
    }

    fn byte_size(&self) -> u64 {
        let descriptors =
            (self.ranges.lock().len() + self.pending.lock().len()) as u64;
        LEAF_BASE_SIZE + descriptors * std::mem::size_of::<Descriptor>() as u64
    }
}

/// Serialized form of a [`RangeDescriptorLeaf`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeLeafSnapshot {
    pub channel_id: u32,
    pub ranges: Vec<Descriptor>,
}

impl PersistentLeaf for RangeDescriptorLeaf {
    type Snapshot = RangeLeafSnapshot;

    fn snapshot(&self) -> RangeLeafSnapshot {
        self.coalesce();
        RangeLeafSnapshot {
            channel_id: self.channel_id,
            ranges: self.ranges.lock().clone(),
        }
    }

    fn restore(context: &DescriptorLeafContext, snapshot: RangeLeafSnapshot) -> Self {
        context.allocator.bump_past(snapshot.channel_id);
        Self {
            channel_id: snapshot.channel_id,
            max_range_size: context.max_range_size,
            ranges: Mutex::new(snapshot.ranges),
            pending: Mutex::new(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spanvault_core::{RecordPayload, TimerStats};

    fn record(id: u64) -> Arc<TelemetryRecord> {
        Arc::new(TelemetryRecord::new(
            id,
            10,
            20,
            1_000,
            RecordPayload::Timer(TimerStats::single(5)),
        ))
    }

    #[test]
    fn test_direct_leaf_put_get_remove() {
        let leaf = DirectLeaf::new(&());
        let stored = record(1);
        leaf.put(&stored).unwrap();

        assert!(leaf.get(&stored).is_some());
        assert_eq!(leaf.len(), 1);

        let removed = leaf.remove(&stored).unwrap();
        assert_eq!(removed.id, 1);
        assert!(leaf.is_empty());
        assert!(leaf.get(&stored).is_none());
    }

    #[test]
    fn test_direct_leaf_rejects_duplicate_id() {
        let leaf = DirectLeaf::new(&());
        leaf.put(&record(1)).unwrap();
        assert_eq!(leaf.put(&record(1)), Err(VaultError::DuplicateId(1)));
        assert_eq!(leaf.len(), 1);
    }

    #[test]
    fn test_array_leaf_hides_unpopulated_slots() {
        let context = DescriptorLeafContext::default();
        let leaf = ArrayDescriptorLeaf::new(&context);
        let stored = record(1);
        let reservation = leaf.put(&stored).unwrap();

        assert_eq!(leaf.get(&stored), None);
        let mut out = Vec::new();
        leaf.query(&RecordQuery::new(), &mut out);
        assert!(out.is_empty());

        reservation.populate(0, 128);
        assert_eq!(
            leaf.get(&stored),
            Some(Descriptor::new(leaf.channel_id(), 0, 128))
        );
        leaf.query(&RecordQuery::new(), &mut out);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_array_leaf_snapshot_round_trip() {
        let context = DescriptorLeafContext::default();
        let leaf = ArrayDescriptorLeaf::new(&context);
        for id in 1..=3u64 {
            let reservation = leaf.put(&record(id)).unwrap();
            if id != 3 {
                reservation.populate(id * 100, 50);
            }
        }

        let snapshot = leaf.snapshot();
        // The in-flight reservation for id 3 is dropped.
        assert_eq!(snapshot.entries.len(), 2);

        let restored = ArrayDescriptorLeaf::restore(&context, snapshot);
        assert_eq!(restored.len(), 2);
        assert_eq!(
            restored.get(&record(1)),
            Some(Descriptor::new(leaf.channel_id(), 100, 50))
        );
        // The allocator never reuses a restored channel.
        assert!(context.allocator.allocate() > leaf.channel_id());
    }

    #[test]
    fn test_range_leaf_merges_adjacent_writes() {
        let context = DescriptorLeafContext::default();
        let leaf = RangeDescriptorLeaf::new(&context);

        let first = leaf.put(&record(1)).unwrap();
        let second = leaf.put(&record(2)).unwrap();
        first.populate(0, 100);
        second.populate(100, 50);

        let mut out = Vec::new();
        leaf.query(&RecordQuery::new(), &mut out);
        assert_eq!(out, vec![Descriptor::new(leaf.channel_id(), 0, 150)]);
    }

    #[test]
    fn test_range_leaf_splits_at_max_range_size() {
        let context = DescriptorLeafContext {
            allocator: ChannelAllocator::default(),
            max_range_size: 120,
        };
        let leaf = RangeDescriptorLeaf::new(&context);

        let first = leaf.put(&record(1)).unwrap();
        let second = leaf.put(&record(2)).unwrap();
        first.populate(0, 100);
        second.populate(100, 50);

        let mut out = Vec::new();
        leaf.query(&RecordQuery::new(), &mut out);
        assert_eq!(
            out,
            vec![
                Descriptor::new(leaf.channel_id(), 0, 100),
                Descriptor::new(leaf.channel_id(), 100, 50),
            ]
        );
    }

    #[test]
    fn test_range_leaf_keeps_gap_separate() {
        let context = DescriptorLeafContext::default();
        let leaf = RangeDescriptorLeaf::new(&context);

        let first = leaf.put(&record(1)).unwrap();
        let third = leaf.put(&record(3)).unwrap();
        first.populate(0, 100);
        // A hole at [100, 200): the write for record 2 failed.
        third.populate(200, 40);

        let mut out = Vec::new();
        leaf.query(&RecordQuery::new(), &mut out);
        assert_eq!(
            out,
            vec![
                Descriptor::new(leaf.channel_id(), 0, 100),
                Descriptor::new(leaf.channel_id(), 200, 40),
            ]
        );
    }

    #[test]
    fn test_range_leaf_is_not_addressable() {
        let context = DescriptorLeafContext::default();
        let leaf = RangeDescriptorLeaf::new(&context);
        let stored = record(1);
        let reservation = leaf.put(&stored).unwrap();
        reservation.populate(0, 10);

        assert_eq!(leaf.get(&stored), None);
        assert_eq!(leaf.remove(&stored), None);
    }

    #[test]
    fn test_distinct_leaves_get_distinct_channels() {
        let context = DescriptorLeafContext::default();
        let a = ArrayDescriptorLeaf::new(&context);
        let b = ArrayDescriptorLeaf::new(&context);
        assert_ne!(a.channel_id(), b.channel_id());
    }
}
