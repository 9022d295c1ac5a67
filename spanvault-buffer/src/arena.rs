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

//! Slot arena
//!
//! The buffer's backing store: a growable sequence of fixed-size chunks
//! addressed by a monotonically increasing global slot index. Insertion
//! order is index order, so "next element" is index + 1 and the background
//! walkers are plain cursors; there is no linked pointer graph to
//! synchronize.
//!
//! Each slot carries a one-way state tag. `Empty` only exists between
//! reserving an index and storing the record; the public lifecycle is
//! Inserted → Analyzed → Indexed → Evicted, advanced by compare-and-swap
//! so every transition happens exactly once.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};
use spanvault_core::TelemetryRecord;

/// Slots per chunk. Eviction releases whole chunks once every slot in
/// them is evicted.
pub const CHUNK_SIZE: u64 = 1024;

/// Lifecycle tag of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SlotState {
    /// Index reserved, record not yet visible.
    Empty = 0,
    Inserted = 1,
    Analyzed = 2,
    Indexed = 3,
    Evicted = 4,
}

impl SlotState {
    fn from_u8(value: u8) -> SlotState {
        match value {
            0 => SlotState::Empty,
            1 => SlotState::Inserted,
            2 => SlotState::Analyzed,
            3 => SlotState::Indexed,
            _ => SlotState::Evicted,
        }
    }
}

/// One element slot.
#[derive(Debug)]
pub struct Slot {
    record: Mutex<Option<Arc<TelemetryRecord>>>,
    state: AtomicU8,
    /// Analyzed size including the expansion margin. Written once by the
    /// analyzer.
    size_bytes: AtomicU64,
}

impl Slot {
    fn new() -> Self {
        Self {
            record: Mutex::new(None),
            state: AtomicU8::new(SlotState::Empty as u8),
            size_bytes: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> SlotState {
        SlotState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Advance the tag by exactly one legal transition. Returns `false`
    /// when another walker moved the slot first.
    pub fn try_advance(&self, from: SlotState, to: SlotState) -> bool {
        debug_assert!(from < to);
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn store_record(&self, record: Arc<TelemetryRecord>) {
        *self.record.lock() = Some(record);
        self.state.store(SlotState::Inserted as u8, Ordering::Release);
    }

    /// Snapshot of the record reference, if still owned by the slot.
    pub fn record(&self) -> Option<Arc<TelemetryRecord>> {
        self.record.lock().clone()
    }

    /// Lock the record cell. The indexer and the evictor serialize their
    /// state + tree transitions through this lock.
    pub fn lock_record(&self) -> MutexGuard<'_, Option<Arc<TelemetryRecord>>> {
        self.record.lock()
    }

    pub fn set_size(&self, size: u64) {
        self.size_bytes.store(size, Ordering::Release);
    }

    pub fn size(&self) -> u64 {
        self.size_bytes.load(Ordering::Acquire)
    }
}

struct Chunk {
    slots: Box<[Slot]>,
}

impl Chunk {
    fn new() -> Arc<Self> {
        let slots: Vec<Slot> = (0..CHUNK_SIZE).map(|_| Slot::new()).collect();
        Arc::new(Self {
            slots: slots.into_boxed_slice(),
        })
    }
}

struct ChunkList {
    /// Chunk index of `chunks[0]`; earlier chunks were released.
    first_chunk: u64,
    chunks: VecDeque<Arc<Chunk>>,
}

/// Growable chunked slot storage with a single append cursor.
pub struct SlotArena {
    chunks: RwLock<ChunkList>,
    tail: AtomicU64,
}

impl Default for SlotArena {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotArena {
    pub fn new() -> Self {
        Self {
            chunks: RwLock::new(ChunkList {
                first_chunk: 0,
                chunks: VecDeque::new(),
            }),
            tail: AtomicU64::new(0),
        }
    }

    /// Number of slots ever appended; the next index to be assigned.
    pub fn len(&self) -> u64 {
        self.tail.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserve the next index and store `record` there. The tail cursor is
    /// the single mutation point, so concurrent producers interleave
    /// safely.
    pub fn append(&self, record: Arc<TelemetryRecord>) -> u64 {
        let index = self.tail.fetch_add(1, Ordering::AcqRel);
        let chunk = self.chunk_for(index, true).expect("appended chunk exists");
        chunk.slots[(index % CHUNK_SIZE) as usize].store_record(record);
        index
    }

    /// Run `f` on the slot at `index`. Returns `None` when the index was
    /// never assigned or its chunk has been released.
    pub fn with_slot<T>(&self, index: u64, f: impl FnOnce(&Slot) -> T) -> Option<T> {
        if index >= self.len() {
            return None;
        }
        let chunk = self.chunk_for(index, false)?;
        Some(f(&chunk.slots[(index % CHUNK_SIZE) as usize]))
    }

    fn chunk_for(&self, index: u64, create: bool) -> Option<Arc<Chunk>> {
        let chunk_index = index / CHUNK_SIZE;
        {
            let list = self.chunks.read();
            if chunk_index < list.first_chunk {
                return None;
            }
            let offset = (chunk_index - list.first_chunk) as usize;
            if let Some(chunk) = list.chunks.get(offset) {
                return Some(Arc::clone(chunk));
            }
        }
        if !create {
            return None;
        }

        let mut list = self.chunks.write();
        if chunk_index < list.first_chunk {
            return None;
        }
        while list.first_chunk + list.chunks.len() as u64 <= chunk_index {
            list.chunks.push_back(Chunk::new());
        }
        let offset = (chunk_index - list.first_chunk) as usize;
        Some(Arc::clone(&list.chunks[offset]))
    }

    /// Release every chunk that lies entirely below `index`. Called by
    /// eviction once the oldest slots are all evicted.
    pub fn release_before(&self, index: u64) {
        let keep_from = index / CHUNK_SIZE;
        let mut list = self.chunks.write();
        while list.first_chunk < keep_from && !list.chunks.is_empty() {
            list.chunks.pop_front();
            list.first_chunk += 1;
        }
    }

    /// Number of chunks currently held.
    pub fn chunk_count(&self) -> usize {
        self.chunks.read().chunks.len()
    }
}
