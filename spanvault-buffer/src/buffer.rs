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

//! The evicting buffer
//!
//! Appends are O(1) and never wait for analysis, indexing, or eviction.
//! The pipeline methods ([`analyze_pending`](EvictingBuffer::analyze_pending),
//! [`index_pending`](EvictingBuffer::index_pending)) are normally driven by
//! the [`BufferWorkers`](crate::worker::BufferWorkers) threads; tests call
//! them directly for deterministic control.
//!
//! Size accounting: `current_size` is the sum of analyzed element sizes
//! minus evicted ones, plus the indexing tree's own footprint as of the
//! last maintenance pass. Occupancy is `current_size / initial_capacity`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use spanvault_core::{
    RecordQuery, Result, TelemetryRecord, WritePinRegistry,
};
use spanvault_index::{default_live_chain, DirectLeaf, IndexingTree};
use tracing::{debug, warn};

use crate::arena::{SlotArena, SlotState};
use crate::estimator::{DefaultSizeEstimator, SizeEstimator};
use crate::properties::BufferProperties;

/// Counter snapshot of a buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferStats {
    pub inserted_elements: u64,
    pub evicted_elements: u64,
    pub current_size: u64,
    pub tree_size: u64,
    pub occupancy: f64,
    pub pending_analysis: u64,
    pub pending_indexing: u64,
}

enum EvictOutcome {
    /// Slot already evicted by an earlier pass.
    AlreadyGone,
    /// Oldest unanalyzed element reached; nothing behind it is removable.
    Stop,
    /// Element referenced by an in-flight write; retried on a later pass.
    Pinned,
    Evicted {
        record: Arc<TelemetryRecord>,
        size: u64,
        was_indexed: bool,
    },
}

/// The live working set: evicting, size-accounted, queryable.
pub struct EvictingBuffer {
    properties: BufferProperties,
    arena: SlotArena,
    tree: Arc<IndexingTree<DirectLeaf>>,
    estimator: Box<dyn SizeEstimator>,
    pins: Arc<WritePinRegistry>,

    inserted: AtomicU64,
    evicted: AtomicU64,
    /// Sum of analyzed element sizes minus evicted ones.
    payload_size: AtomicU64,
    /// Tree footprint as of the last maintenance pass.
    tree_size: AtomicU64,
    added_since_maintenance: AtomicU64,

    /// Cursor of the next slot to analyze. Written by the analyzer only.
    analyze_cursor: AtomicU64,
    /// Cursor of the next slot to index. Written by the indexer only.
    index_cursor: AtomicU64,
    /// Oldest non-evicted slot. Written under `eviction_lock` only.
    evict_cursor: AtomicU64,

    eviction_lock: Mutex<()>,
    signal_lock: Mutex<()>,
    signal: Condvar,
}

impl EvictingBuffer {
    pub fn new(properties: BufferProperties) -> Result<Self> {
        Self::with_parts(
            properties,
            Box::new(DefaultSizeEstimator),
            Arc::new(WritePinRegistry::new()),
        )
    }

    /// Full constructor: custom estimator and a pin registry shared with
    /// the storage writer.
    pub fn with_parts(
        properties: BufferProperties,
        estimator: Box<dyn SizeEstimator>,
        pins: Arc<WritePinRegistry>,
    ) -> Result<Self> {
        properties.validate()?;
        let tree = IndexingTree::new(default_live_chain(properties.time_bucket_us))?;
        Ok(Self {
            properties,
            arena: SlotArena::new(),
            tree: Arc::new(tree),
            estimator,
            pins,
            inserted: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            payload_size: AtomicU64::new(0),
            tree_size: AtomicU64::new(0),
            added_since_maintenance: AtomicU64::new(0),
            analyze_cursor: AtomicU64::new(0),
            index_cursor: AtomicU64::new(0),
            evict_cursor: AtomicU64::new(0),
            eviction_lock: Mutex::new(()),
            signal_lock: Mutex::new(()),
            signal: Condvar::new(),
        })
    }

    pub fn properties(&self) -> &BufferProperties {
        &self.properties
    }

    /// The registry the storage writer pins in-flight records through.
    pub fn pins(&self) -> Arc<WritePinRegistry> {
        Arc::clone(&self.pins)
    }

    /// Append one record. O(1), never waits for the background pipeline.
    pub fn put(&self, record: TelemetryRecord) -> u64 {
        let index = self.arena.append(Arc::new(record));
        self.inserted.fetch_add(1, Ordering::Relaxed);
        self.notify_workers();
        index
    }

    /// Number of records ever inserted.
    pub fn len(&self) -> u64 {
        self.inserted.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The record at an arena index, while the buffer still owns it.
    pub fn record_at(&self, index: u64) -> Option<Arc<TelemetryRecord>> {
        self.arena.with_slot(index, |slot| slot.record()).flatten()
    }

    /// Lifecycle tag of an arena slot.
    pub fn state_at(&self, index: u64) -> Option<SlotState> {
        self.arena.with_slot(index, |slot| slot.state())
    }

    pub fn current_size(&self) -> u64 {
        self.payload_size.load(Ordering::Relaxed) + self.tree_size.load(Ordering::Relaxed)
    }

    pub fn occupancy(&self) -> f64 {
        self.current_size() as f64 / self.properties.initial_capacity as f64
    }

    /// True once occupancy has crossed the eviction threshold.
    pub fn should_evict(&self) -> bool {
        self.occupancy() > self.properties.eviction_occupancy_threshold
    }

    pub fn stats(&self) -> BufferStats {
        let tail = self.arena.len();
        BufferStats {
            inserted_elements: self.inserted.load(Ordering::Relaxed),
            evicted_elements: self.evicted.load(Ordering::Relaxed),
            current_size: self.current_size(),
            tree_size: self.tree_size.load(Ordering::Relaxed),
            occupancy: self.occupancy(),
            pending_analysis: tail - self.analyze_cursor.load(Ordering::Relaxed),
            pending_indexing: self.analyze_cursor.load(Ordering::Relaxed)
                - self.index_cursor.load(Ordering::Relaxed),
        }
    }

    /// Query the live tree. Only indexed elements are visible.
    pub fn query(&self, query: &RecordQuery) -> Vec<Arc<TelemetryRecord>> {
        self.tree.query(query)
    }

    // -- background pipeline ------------------------------------------------

    /// Analyze every pending slot in insertion order: estimate, apply the
    /// expansion margin, account. Returns the number of slots processed.
    ///
    /// Estimation failures degrade to size zero; the pipeline never stalls.
    pub fn analyze_pending(&self) -> u64 {
        let rate = self
            .properties
            .expansion_rate(self.properties.initial_capacity);
        let mut processed = 0;

        loop {
            let index = self.analyze_cursor.load(Ordering::Acquire);
            if index >= self.arena.len() {
                break;
            }

            let advanced = self.arena.with_slot(index, |slot| {
                match slot.state() {
                    // Reserved by a producer whose store is not visible
                    // yet; analysis is in order, so wait.
                    SlotState::Empty => false,
                    SlotState::Inserted => {
                        let size = match slot.record() {
                            Some(record) => match self.estimator.estimate(&record) {
                                Ok(estimate) => (estimate as f64 * (1.0 + rate)).round() as u64,
                                Err(error) => {
                                    warn!(record_id = record.id, %error,
                                        "size estimation failed, accounting zero");
                                    0
                                }
                            },
                            None => 0,
                        };
                        slot.set_size(size);
                        if slot.try_advance(SlotState::Inserted, SlotState::Analyzed) {
                            self.payload_size.fetch_add(size, Ordering::Relaxed);
                            self.added_since_maintenance.fetch_add(size, Ordering::Relaxed);
                        }
                        true
                    }
                    _ => true,
                }
            });

            match advanced {
                Some(true) | None => {
                    self.analyze_cursor.store(index + 1, Ordering::Release);
                    processed += 1;
                }
                Some(false) => break,
            }
        }

        if processed > 0 {
            self.notify_workers();
        }
        processed
    }

    /// Insert every analyzed-but-unindexed slot into the live tree, in
    /// order. Returns the number of slots processed.
    ///
    /// Fail-open: an element whose tree insert fails is logged and still
    /// marked indexed, trading that element's queryability for a pipeline
    /// that never stalls.
    pub fn index_pending(&self) -> u64 {
        let mut processed = 0;

        loop {
            let index = self.index_cursor.load(Ordering::Acquire);
            if index >= self.analyze_cursor.load(Ordering::Acquire) {
                break;
            }

            let advanced = self.arena.with_slot(index, |slot| {
                match slot.state() {
                    SlotState::Analyzed => {
                        // The record cell lock serializes this against
                        // eviction of the same slot.
                        let cell = slot.lock_record();
                        if slot.state() != SlotState::Analyzed {
                            return true;
                        }
                        if let Some(record) = cell.as_ref() {
                            if let Err(error) = self.tree.put(record) {
                                warn!(record_id = record.id, %error, "live indexing failed");
                            }
                        }
                        slot.try_advance(SlotState::Analyzed, SlotState::Indexed);
                        true
                    }
                    SlotState::Empty | SlotState::Inserted => false,
                    _ => true,
                }
            });

            match advanced {
                Some(true) | None => {
                    self.index_cursor.store(index + 1, Ordering::Release);
                    processed += 1;
                }
                Some(false) => break,
            }
        }
        processed
    }

    /// Evict from the oldest end until the configured fragment of the
    /// capacity is freed or nothing removable remains. Only one eviction
    /// runs at a time; a contending caller returns immediately.
    ///
    /// Elements pinned by an in-flight write are skipped and retried on a
    /// later pass. Returns the number of bytes freed.
    pub fn evict(&self) -> u64 {
        let Some(_guard) = self.eviction_lock.try_lock() else {
            return 0;
        };

        let target = self.properties.eviction_target_bytes();
        let analyzed_limit = self.analyze_cursor.load(Ordering::Acquire);
        let mut index = self.evict_cursor.load(Ordering::Acquire);
        let mut freed = 0u64;
        let mut removed = 0u64;
        let mut first_pinned: Option<u64> = None;

        while freed < target && index < analyzed_limit {
            let outcome = self
                .arena
                .with_slot(index, |slot| self.try_evict_slot(slot))
                .unwrap_or(EvictOutcome::AlreadyGone);

            match outcome {
                EvictOutcome::Stop => break,
                EvictOutcome::AlreadyGone => {}
                EvictOutcome::Pinned => {
                    if first_pinned.is_none() {
                        first_pinned = Some(index);
                    }
                }
                EvictOutcome::Evicted {
                    record,
                    size,
                    was_indexed,
                } => {
                    if was_indexed {
                        self.tree.get_and_remove(&record);
                    }
                    self.payload_size.fetch_sub(size, Ordering::Relaxed);
                    self.evicted.fetch_add(1, Ordering::Relaxed);
                    freed += size;
                    removed += 1;
                }
            }
            index += 1;
        }

        // Advance the cursor over the contiguous evicted prefix and drop
        // fully evicted chunks. A pinned survivor caps the advance.
        let stop = first_pinned.unwrap_or(index);
        let mut cursor = self.evict_cursor.load(Ordering::Acquire);
        while cursor < stop {
            let gone = self
                .arena
                .with_slot(cursor, |slot| slot.state() == SlotState::Evicted)
                .unwrap_or(true);
            if !gone {
                break;
            }
            cursor += 1;
        }
        self.evict_cursor.store(cursor, Ordering::Release);
        self.arena.release_before(cursor);

        if removed > 0 {
            debug!(removed, freed, "buffer eviction pass");
        }
        freed
    }

    fn try_evict_slot(&self, slot: &crate::arena::Slot) -> EvictOutcome {
        match slot.state() {
            SlotState::Evicted => EvictOutcome::AlreadyGone,
            SlotState::Empty | SlotState::Inserted => EvictOutcome::Stop,
            _ => {
                let mut cell = slot.lock_record();
                let state = slot.state();
                if state != SlotState::Analyzed && state != SlotState::Indexed {
                    return EvictOutcome::AlreadyGone;
                }
                let Some(record) = cell.clone() else {
                    return EvictOutcome::AlreadyGone;
                };
                if self.pins.is_pinned(record.id) {
                    return EvictOutcome::Pinned;
                }
                if !slot.try_advance(state, SlotState::Evicted) {
                    return EvictOutcome::AlreadyGone;
                }
                *cell = None;
                EvictOutcome::Evicted {
                    record,
                    size: slot.size(),
                    was_indexed: state == SlotState::Indexed,
                }
            }
        }
    }

    // -- maintenance --------------------------------------------------------

    /// Run a maintenance pass if enough new bytes accumulated since the
    /// last one. Returns whether a pass ran.
    pub fn maintenance_if_due(&self) -> bool {
        if self.added_since_maintenance.load(Ordering::Relaxed)
            <= self.properties.maintenance_threshold_bytes()
        {
            return false;
        }
        self.run_maintenance();
        true
    }

    /// Prune empty tree branches and fold the tree's own footprint into
    /// the buffer's size accounting.
    pub fn run_maintenance(&self) {
        self.added_since_maintenance.store(0, Ordering::Relaxed);
        self.tree.clean_parallel(self.properties.cleanup_threads);
        let tree_size = self.tree.component_size();
        self.tree_size.store(tree_size, Ordering::Relaxed);
        debug!(tree_size, "buffer maintenance pass");
    }

    // -- worker signaling ---------------------------------------------------

    pub(crate) fn notify_workers(&self) {
        self.signal.notify_all();
    }

    /// Bounded wait for new work; the poll loop of the background workers.
    pub(crate) fn wait_for_work(&self, timeout: Duration) {
        let mut guard = self.signal_lock.lock();
        let _ = self.signal.wait_for(&mut guard, timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::FixedSizeEstimator;
    use spanvault_core::{RecordPayload, TimerStats};

    fn byte_buffer(capacity: u64, threshold: f64, fragment: f64) -> EvictingBuffer {
        let properties = BufferProperties {
            initial_capacity: capacity,
            eviction_occupancy_threshold: threshold,
            eviction_fragment: fragment,
            // Exact accounting in tests: no safety margin.
            min_expansion_rate: 0.0,
            max_expansion_rate: 0.0,
            ..BufferProperties::default()
        };
        EvictingBuffer::with_parts(
            properties,
            Box::new(FixedSizeEstimator::new(1)),
            Arc::new(WritePinRegistry::new()),
        )
        .unwrap()
    }

    fn record(id: u64) -> TelemetryRecord {
        TelemetryRecord::new(id, 10, 20, 1_000, RecordPayload::Timer(TimerStats::single(5)))
    }

    fn fill(buffer: &EvictingBuffer, count: u64) {
        for id in 0..count {
            buffer.put(record(id));
        }
        buffer.analyze_pending();
        buffer.index_pending();
    }

    #[test]
    fn test_put_preserves_insertion_order() {
        let buffer = byte_buffer(1_000, 0.95, 0.25);
        for id in 0..50 {
            buffer.put(record(id));
        }

        for index in 0..50 {
            assert_eq!(buffer.record_at(index).unwrap().id, index);
        }
        assert_eq!(buffer.record_at(50), None);
        assert_eq!(buffer.len(), 50);
    }

    #[test]
    fn test_size_accounting_with_unit_estimator() {
        let buffer = byte_buffer(1_000, 0.95, 0.25);
        for id in 0..100 {
            buffer.put(record(id));
        }
        assert_eq!(buffer.current_size(), 0);

        assert_eq!(buffer.analyze_pending(), 100);
        assert_eq!(buffer.current_size(), 100);
        assert_eq!(buffer.stats().pending_analysis, 0);
    }

    #[test]
    fn test_indexing_makes_elements_queryable() {
        let buffer = byte_buffer(1_000, 0.95, 0.25);
        for id in 0..10 {
            buffer.put(record(id));
        }
        buffer.analyze_pending();
        assert!(buffer.query(&RecordQuery::new()).is_empty());

        assert_eq!(buffer.index_pending(), 10);
        assert_eq!(buffer.query(&RecordQuery::new()).len(), 10);
        assert_eq!(buffer.state_at(0), Some(SlotState::Indexed));
    }

    #[test]
    fn test_eviction_threshold_scenario() {
        let buffer = byte_buffer(100, 0.99, 0.5);

        fill(&buffer, 99);
        assert!((buffer.occupancy() - 0.99).abs() < 1e-12);
        assert!(!buffer.should_evict());

        buffer.put(record(99));
        buffer.analyze_pending();
        buffer.index_pending();
        assert!((buffer.occupancy() - 1.0).abs() < 1e-12);
        assert!(buffer.should_evict());

        buffer.evict();
        assert_eq!(buffer.current_size(), 50);
        let stats = buffer.stats();
        assert_eq!(stats.evicted_elements, 50);
        assert_eq!(stats.inserted_elements, 100);
    }

    #[test]
    fn test_eviction_removes_oldest_first() {
        let buffer = byte_buffer(100, 0.99, 0.5);
        fill(&buffer, 100);
        buffer.evict();

        // The oldest 50 are gone from buffer and tree.
        for index in 0..50 {
            assert_eq!(buffer.state_at(index), Some(SlotState::Evicted));
            assert_eq!(buffer.record_at(index), None);
        }
        let survivors = buffer.query(&RecordQuery::new());
        assert_eq!(survivors.len(), 50);
        assert!(survivors.iter().all(|r| r.id >= 50));
    }

    #[test]
    fn test_eviction_never_increases_size() {
        let buffer = byte_buffer(100, 0.5, 0.1);
        fill(&buffer, 60);
        let before = buffer.current_size();
        let freed = buffer.evict();
        assert!(freed > 0);
        assert!(buffer.current_size() <= before);
        assert_eq!(buffer.current_size(), before - freed);
    }

    #[test]
    fn test_eviction_skips_pinned_elements() {
        let buffer = byte_buffer(100, 0.99, 0.5);
        let pins = buffer.pins();
        fill(&buffer, 100);

        let pin = pins.pin(0);
        buffer.evict();

        // Record 0 survives; the pass still freed its 50 bytes from
        // records 1..=50.
        assert!(buffer.record_at(0).is_some());
        assert_eq!(buffer.stats().evicted_elements, 50);
        assert_eq!(buffer.state_at(1), Some(SlotState::Evicted));

        drop(pin);
        buffer.evict();
        assert_eq!(buffer.record_at(0), None);
    }

    #[test]
    fn test_eviction_stops_at_unanalyzed_elements() {
        let buffer = byte_buffer(100, 0.99, 0.5);
        fill(&buffer, 100);
        // Ten more inserts that are never analyzed.
        for id in 100..110 {
            buffer.put(record(id));
        }

        buffer.evict();
        assert_eq!(buffer.stats().evicted_elements, 50);
        for index in 100..110 {
            assert_eq!(buffer.state_at(index), Some(SlotState::Inserted));
        }
    }

    #[test]
    fn test_estimation_failure_degrades_to_zero() {
        struct FailingEstimator;
        impl SizeEstimator for FailingEstimator {
            fn estimate(&self, _record: &TelemetryRecord) -> Result<u64> {
                Err(spanvault_core::VaultError::SizeEstimation(
                    "broken".to_string(),
                ))
            }
        }

        let properties = BufferProperties {
            initial_capacity: 100,
            ..BufferProperties::default()
        };
        let buffer = EvictingBuffer::with_parts(
            properties,
            Box::new(FailingEstimator),
            Arc::new(WritePinRegistry::new()),
        )
        .unwrap();

        buffer.put(record(1));
        assert_eq!(buffer.analyze_pending(), 1);
        assert_eq!(buffer.current_size(), 0);
        assert_eq!(buffer.state_at(0), Some(SlotState::Analyzed));

        // The element still reaches the tree.
        buffer.index_pending();
        assert_eq!(buffer.query(&RecordQuery::new()).len(), 1);
    }

    #[test]
    fn test_maintenance_folds_tree_size_into_accounting() {
        let properties = BufferProperties {
            initial_capacity: 10_000,
            maintenance_fraction: 0.0001,
            min_expansion_rate: 0.0,
            max_expansion_rate: 0.0,
            ..BufferProperties::default()
        };
        let buffer = EvictingBuffer::with_parts(
            properties,
            Box::new(FixedSizeEstimator::new(10)),
            Arc::new(WritePinRegistry::new()),
        )
        .unwrap();

        for id in 0..10 {
            buffer.put(record(id));
        }
        buffer.analyze_pending();
        buffer.index_pending();
        let payload_only = buffer.current_size();

        assert!(buffer.maintenance_if_due());
        assert!(buffer.current_size() > payload_only);
        assert!(buffer.stats().tree_size > 0);

        // Counter was reset: an immediate second pass is not due.
        assert!(!buffer.maintenance_if_due());
    }

    #[test]
    fn test_query_by_dimension() {
        let buffer = byte_buffer(10_000, 0.95, 0.25);
        for id in 0..20 {
            buffer.put(TelemetryRecord::new(
                id,
                id % 2,
                20,
                1_000,
                RecordPayload::Timer(TimerStats::single(5)),
            ));
        }
        buffer.analyze_pending();
        buffer.index_pending();

        assert_eq!(buffer.query(&RecordQuery::new().platform(0)).len(), 10);
        assert_eq!(buffer.query(&RecordQuery::new().platform(1)).len(), 10);
        assert_eq!(buffer.query(&RecordQuery::new()).len(), 20);
    }
}
