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

//! In-flight write pins
//!
//! Writer tasks pin a record id for the duration of a persistence attempt.
//! Buffer eviction consults the registry and skips pinned elements, so a
//! record is never unlinked while its bytes are still being serialized or
//! written.

use std::sync::Arc;

use dashmap::DashMap;

/// Shared pin counts keyed by record id.
#[derive(Debug, Default)]
pub struct WritePinRegistry {
    pins: DashMap<u64, u32>,
}

impl WritePinRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `record_id` until the returned guard drops. Pins nest: a record
    /// is released once every guard for it is gone.
    pub fn pin(self: &Arc<Self>, record_id: u64) -> WritePin {
        *self.pins.entry(record_id).or_insert(0) += 1;
        WritePin {
            registry: Arc::clone(self),
            record_id,
        }
    }

    pub fn is_pinned(&self, record_id: u64) -> bool {
        self.pins.get(&record_id).map_or(false, |count| *count > 0)
    }

    /// Number of distinct pinned record ids.
    pub fn pinned_records(&self) -> usize {
        self.pins.len()
    }

    fn release(&self, record_id: u64) {
        if let Some(mut entry) = self.pins.get_mut(&record_id) {
            *entry -= 1;
            if *entry == 0 {
                drop(entry);
                self.pins.remove_if(&record_id, |_, count| *count == 0);
            }
        }
    }
}

/// RAII pin on one record id.
#[derive(Debug)]
pub struct WritePin {
    registry: Arc<WritePinRegistry>,
    record_id: u64,
}

impl WritePin {
    pub fn record_id(&self) -> u64 {
        self.record_id
    }
}

impl Drop for WritePin {
    fn drop(&mut self) {
        self.registry.release(self.record_id);
    }
}
