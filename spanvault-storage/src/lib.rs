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

//! SpanVault Storage Layer
//!
//! Durable persistence for selected telemetry records: serialization
//! through a bounded pool, asynchronous appends to per-channel data files
//! with callback completion, descriptor reservation in the persisted
//! indexing tree, and the on-disk index file for reopening.
//!
//! ## Write path
//!
//! ```text
//! StorageWriter::write
//! ├── reserve descriptor slot (StorageTreeHandler)
//! ├── backpressure check (persisted-volume cap)
//! ├── acquire pooled serializer → frame bytes (bincode + crc32)
//! └── submit to channel I/O thread
//!     └── completion: populate slot, account persisted bytes
//! ```
//!
//! Every failure exit releases exactly the resources it acquired and
//! reports through the `write_failed` counter; one bad task never touches
//! other in-flight work.

pub mod channel;
pub mod error;
pub mod index_file;
pub mod serializer;
pub mod tree_handler;
pub mod writer;

pub use channel::{WriteChannel, WriteChannelManager};
pub use error::WriteError;
pub use index_file::{load_index, save_index};
pub use serializer::{
    decode_frame, encode_frame, BincodeSerializer, PooledSerializer, RecordSerializer,
    SerializerPool, StoredRecord, WriteMetadata, RECORD_SCHEMA_VERSION,
};
pub use tree_handler::StorageTreeHandler;
pub use writer::{StorageWriter, StorageWriterConfig, WriterStats};
