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

//! Storage tree handler
//!
//! The seam between writer tasks and the persisted indexing tree: tasks
//! reserve a descriptor slot here before any resource acquisition, and
//! queries resolve descriptors for the external reader. Generic over the
//! descriptor leaf strategy: array leaves for addressable storage, range
//! leaves for batch-only retrieval at lower overhead.

use std::path::Path;
use std::sync::Arc;

use spanvault_core::{Descriptor, RecordQuery, TelemetryRecord, WriteReservation};
use spanvault_index::{
    default_storage_chain, ArrayDescriptorLeaf, DescriptorLeafContext, IndexingTree, KeyExtractor,
    PersistentLeaf,
};

use crate::error::WriteError;
use crate::index_file;

/// Reserves descriptor slots in the persisted tree for writer tasks.
pub struct StorageTreeHandler<L = ArrayDescriptorLeaf>
where
    L: PersistentLeaf<
        Context = DescriptorLeafContext,
        Handle = WriteReservation,
        Element = Descriptor,
    >,
{
    tree: IndexingTree<L>,
}

impl<L> StorageTreeHandler<L>
where
    L: PersistentLeaf<
        Context = DescriptorLeafContext,
        Handle = WriteReservation,
        Element = Descriptor,
    >,
{
    /// Handler over the default storage chain (platform → kind → sensor).
    pub fn new() -> Result<Self, WriteError> {
        Self::with_chain(default_storage_chain())
    }

    pub fn with_chain(extractors: Vec<Box<dyn KeyExtractor>>) -> Result<Self, WriteError> {
        let tree = IndexingTree::new(extractors)?;
        Ok(Self { tree })
    }

    /// Shared leaf context: the channel allocator and range split size.
    pub fn context(&self) -> &DescriptorLeafContext {
        self.tree.context()
    }

    /// Reserve a slot for `record`. A failure here aborts the write task
    /// before it touches any other resource.
    pub fn reserve(&self, record: &Arc<TelemetryRecord>) -> Result<WriteReservation, WriteError> {
        Ok(self.tree.put(record)?)
    }

    /// Descriptor of an already-persisted record, when addressable.
    pub fn get(&self, record: &TelemetryRecord) -> Option<Descriptor> {
        self.tree.get(record)
    }

    /// Remove a record's descriptor, when addressable.
    pub fn remove(&self, record: &TelemetryRecord) -> Option<Descriptor> {
        self.tree.get_and_remove(record)
    }

    /// Resolve every persisted descriptor the query's dimensions select.
    pub fn query(&self, query: &RecordQuery) -> Vec<Descriptor> {
        self.tree.query(query)
    }

    /// Entries currently tracked, including in-flight reservations.
    pub fn reserved_count(&self) -> usize {
        self.tree.record_count()
    }

    /// Persist the tree to the index file at `path`. In-flight
    /// reservations are not included: an unfinished write does not
    /// survive a restart.
    pub fn save_index(&self, path: impl AsRef<Path>) -> Result<(), WriteError> {
        index_file::save_index(&self.tree.snapshot(), path)
    }

    /// Reopen a persisted tree from the index file, with the default
    /// storage chain.
    pub fn load_index(path: impl AsRef<Path>) -> Result<Self, WriteError> {
        Self::load_index_with_chain(path, default_storage_chain())
    }

    pub fn load_index_with_chain(
        path: impl AsRef<Path>,
        extractors: Vec<Box<dyn KeyExtractor>>,
    ) -> Result<Self, WriteError> {
        let snapshot = index_file::load_index(path)?;
        let tree =
            IndexingTree::restore(extractors, DescriptorLeafContext::default(), snapshot)?;
        Ok(Self { tree })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spanvault_core::{RecordPayload, TimerStats};
    use spanvault_index::RangeDescriptorLeaf;

    fn record(id: u64, platform: u64) -> Arc<TelemetryRecord> {
        Arc::new(TelemetryRecord::new(
            id,
            platform,
            20,
            1_000,
            RecordPayload::Timer(TimerStats::single(5)),
        ))
    }

    #[test]
    fn test_reserve_then_populate_then_query() {
        let handler: StorageTreeHandler = StorageTreeHandler::new().unwrap();
        let stored = record(1, 10);
        let reservation = handler.reserve(&stored).unwrap();

        // Invisible until the write completes.
        assert!(handler.query(&RecordQuery::new()).is_empty());
        assert_eq!(handler.get(&stored), None);

        reservation.populate(0, 64);
        let descriptors = handler.query(&RecordQuery::new().platform(10));
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].size, 64);
        assert_eq!(handler.get(&stored), Some(descriptors[0]));
    }

    #[test]
    fn test_duplicate_reservation_fails() {
        let handler: StorageTreeHandler = StorageTreeHandler::new().unwrap();
        handler.reserve(&record(1, 10)).unwrap();
        assert!(matches!(
            handler.reserve(&record(1, 10)),
            Err(WriteError::Reservation(_))
        ));
    }

    #[test]
    fn test_range_leaf_handler_is_not_addressable() {
        let handler: StorageTreeHandler<RangeDescriptorLeaf> =
            StorageTreeHandler::with_chain(default_storage_chain()).unwrap();
        let stored = record(1, 10);
        let reservation = handler.reserve(&stored).unwrap();
        reservation.populate(0, 64);

        assert_eq!(handler.get(&stored), None);
        assert_eq!(handler.query(&RecordQuery::new()).len(), 1);
    }

    #[test]
    fn test_index_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.svx");

        let handler: StorageTreeHandler = StorageTreeHandler::new().unwrap();
        for id in 0..5 {
            let reservation = handler.reserve(&record(id, id % 2)).unwrap();
            reservation.populate(id * 100, 80);
        }
        // One unfinished write that must not survive.
        handler.reserve(&record(99, 0)).unwrap();
        handler.save_index(&path).unwrap();

        let reopened: StorageTreeHandler = StorageTreeHandler::load_index(&path).unwrap();
        assert_eq!(reopened.reserved_count(), 5);

        let mut original = handler.query(&RecordQuery::new());
        let mut restored = reopened.query(&RecordQuery::new());
        original.sort_unstable();
        restored.sort_unstable();
        assert_eq!(original, restored);
    }
}
