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

//! SpanVault Core
//!
//! Fundamental data structures shared across the SpanVault data plane:
//! the telemetry record model, the query request, persisted-byte
//! descriptors, and the in-flight write pin registry.

pub mod descriptor;
pub mod error;
pub mod pins;
pub mod query;
pub mod record;

pub use descriptor::{Descriptor, DescriptorSlot, WriteReservation};
pub use error::{Result, VaultError};
pub use pins::{WritePin, WritePinRegistry};
pub use query::{QueryField, RecordQuery, Restriction, RestrictionOp};
pub use record::{
    ExceptionEvent, RecordKind, RecordPayload, TelemetryRecord, TimerStats,
};
