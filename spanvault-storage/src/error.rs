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

//! Storage write-path error types

use std::time::Duration;

use spanvault_core::VaultError;
use thiserror::Error;

/// Errors of the persistence write path.
///
/// `Backpressure` is expected control flow, not an incident; everything
/// else marks one failed task without affecting other in-flight work.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("persisted volume cap reached")]
    Backpressure,

    #[error("no serializer available within {0:?}")]
    SerializerUnavailable(Duration),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("channel write failed: {0}")]
    ChannelWrite(String),

    #[error("descriptor reservation failed: {0}")]
    Reservation(#[from] VaultError),

    #[error("writer is shut down")]
    ShutDown,

    #[error("index file invalid: {0}")]
    IndexFile(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
