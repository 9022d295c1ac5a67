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

//! SpanVault Live Buffer
//!
//! The bounded, size-accounted in-memory working set. Producers append
//! telemetry records; a background analyzer sizes them, a background
//! indexer makes them queryable through the live indexing tree, and
//! occupancy-driven eviction keeps the buffer inside its configured
//! capacity, oldest first.

pub mod arena;
pub mod buffer;
pub mod estimator;
pub mod properties;
pub mod worker;

pub use arena::{SlotArena, SlotState};
pub use buffer::{BufferStats, EvictingBuffer};
pub use estimator::{DefaultSizeEstimator, FixedSizeEstimator, SizeEstimator};
pub use properties::BufferProperties;
pub use worker::BufferWorkers;
