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

//! Shared error types for the data plane

use thiserror::Error;

/// Result type for data-plane operations.
pub type Result<T> = std::result::Result<T, VaultError>;

/// Errors raised by the buffer and indexing layers.
///
/// Per-element failures are recovered locally by the background pipelines;
/// only structural violations (duplicate ids, invalid configuration)
/// propagate to callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VaultError {
    #[error("size estimation failed: {0}")]
    SizeEstimation(String),

    #[error("indexing failed: {0}")]
    Indexing(String),

    #[error("no index key available at tree level {level}")]
    KeyUnavailable { level: usize },

    #[error("duplicate record id in leaf: {0}")]
    DuplicateId(u64),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
