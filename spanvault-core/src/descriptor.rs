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

//! Persisted-byte descriptors
//!
//! A [`Descriptor`] locates a serialized record inside a write channel:
//! `(channel_id, position, size)`. Writer tasks reserve a [`DescriptorSlot`]
//! before any I/O happens; the final extent is populated exactly once, when
//! the asynchronous write completes. Readers only ever see populated slots.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// Locator for a contiguous run of persisted bytes.
///
/// Ordering is by `(channel_id, position, size)`, which the derived impls
/// provide through field order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Descriptor {
    pub channel_id: u32,
    pub position: u64,
    pub size: u64,
}

impl Descriptor {
    pub fn new(channel_id: u32, position: u64, size: u64) -> Self {
        Self {
            channel_id,
            position,
            size,
        }
    }

    /// First byte past this descriptor.
    pub fn end(&self) -> u64 {
        self.position + self.size
    }

    /// True when `other` starts exactly where this descriptor ends, in the
    /// same channel.
    pub fn joinable_with(&self, other: &Descriptor) -> bool {
        self.channel_id == other.channel_id && self.end() == other.position
    }
}

/// Reservation for a descriptor whose bytes are not yet written.
///
/// The channel is fixed when the slot is reserved; `(position, size)` are
/// set exactly once by the write-completion callback. Population is
/// idempotent-hostile on purpose: a second attempt is rejected.
#[derive(Debug)]
pub struct DescriptorSlot {
    channel_id: u32,
    record_id: u64,
    extent: OnceLock<(u64, u64)>,
}

/// Shared handle to a reserved slot, held by the tree leaf and the writer.
pub type WriteReservation = std::sync::Arc<DescriptorSlot>;

impl DescriptorSlot {
    pub fn new(channel_id: u32, record_id: u64) -> Self {
        Self {
            channel_id,
            record_id,
            extent: OnceLock::new(),
        }
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    /// Id of the record this slot was reserved for.
    pub fn record_id(&self) -> u64 {
        self.record_id
    }

    /// Set the final extent. Returns `false` if the slot was already
    /// populated.
    pub fn populate(&self, position: u64, size: u64) -> bool {
        self.extent.set((position, size)).is_ok()
    }

    pub fn is_populated(&self) -> bool {
        self.extent.get().is_some()
    }

    /// The finished descriptor, or `None` while the write is in flight.
    pub fn descriptor(&self) -> Option<Descriptor> {
        self.extent
            .get()
            .map(|&(position, size)| Descriptor::new(self.channel_id, position, size))
    }
}
