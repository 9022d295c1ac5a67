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

//! Record serialization and the bounded serializer pool
//!
//! The wire format of one persisted record is a self-checking frame:
//!
//! ```text
//! [body_len: u32 LE][body: bincode(StoredRecord)][crc32(body): u32 LE]
//! ```
//!
//! Serializers are pooled because implementations may carry scratch
//! state; acquisition blocks with a timeout, so a writer task is
//! interruptible while waiting on an exhausted pool.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use byteorder::{ByteOrder, LittleEndian};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use spanvault_core::TelemetryRecord;

use crate::error::WriteError;

/// Version stamped into every persisted record body.
pub const RECORD_SCHEMA_VERSION: u8 = 1;

/// Frame overhead: leading length and trailing checksum.
const FRAME_OVERHEAD: usize = 8;

/// Metadata written alongside every persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteMetadata {
    pub schema_version: u8,
    /// Wall-clock write time in microseconds since the Unix epoch.
    pub written_at_us: u64,
}

impl WriteMetadata {
    pub fn now() -> Self {
        let written_at_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_micros() as u64)
            .unwrap_or(0);
        Self {
            schema_version: RECORD_SCHEMA_VERSION,
            written_at_us,
        }
    }
}

/// The unit that round-trips through a channel: record plus metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub metadata: WriteMetadata,
    pub record: TelemetryRecord,
}

/// Serializes records into frames and back, with deterministic
/// round-trips.
pub trait RecordSerializer: Send {
    fn serialize(
        &mut self,
        record: &TelemetryRecord,
        metadata: &WriteMetadata,
        out: &mut Vec<u8>,
    ) -> Result<(), WriteError>;

    fn deserialize(&self, frame: &[u8]) -> Result<StoredRecord, WriteError>;
}

/// Wrap a serialized body into a checksummed frame.
pub fn encode_frame(body: &[u8], out: &mut Vec<u8>) {
    let mut header = [0u8; 4];
    LittleEndian::write_u32(&mut header, body.len() as u32);
    out.extend_from_slice(&header);
    out.extend_from_slice(body);

    let mut trailer = [0u8; 4];
    LittleEndian::write_u32(&mut trailer, crc32fast::hash(body));
    out.extend_from_slice(&trailer);
}

/// Unwrap and verify a frame, returning the body slice.
pub fn decode_frame(frame: &[u8]) -> Result<&[u8], WriteError> {
    if frame.len() < FRAME_OVERHEAD {
        return Err(WriteError::Serialization(format!(
            "frame of {} bytes is shorter than the frame overhead",
            frame.len()
        )));
    }
    let body_len = LittleEndian::read_u32(&frame[..4]) as usize;
    if frame.len() != body_len + FRAME_OVERHEAD {
        return Err(WriteError::Serialization(format!(
            "frame length {} does not match header length {}",
            frame.len(),
            body_len + FRAME_OVERHEAD
        )));
    }
    let body = &frame[4..4 + body_len];
    let expected = LittleEndian::read_u32(&frame[4 + body_len..]);
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(WriteError::Serialization(format!(
            "frame checksum mismatch: stored {expected:08x}, computed {actual:08x}"
        )));
    }
    Ok(body)
}

/// The shipped serializer: bincode body inside the standard frame.
#[derive(Debug, Default)]
pub struct BincodeSerializer {
    scratch: Vec<u8>,
}

impl RecordSerializer for BincodeSerializer {
    fn serialize(
        &mut self,
        record: &TelemetryRecord,
        metadata: &WriteMetadata,
        out: &mut Vec<u8>,
    ) -> Result<(), WriteError> {
        let stored = StoredRecord {
            metadata: *metadata,
            record: record.clone(),
        };
        self.scratch.clear();
        bincode::serialize_into(&mut self.scratch, &stored)
            .map_err(|error| WriteError::Serialization(error.to_string()))?;
        out.reserve(self.scratch.len() + FRAME_OVERHEAD);
        encode_frame(&self.scratch, out);
        Ok(())
    }

    fn deserialize(&self, frame: &[u8]) -> Result<StoredRecord, WriteError> {
        let body = decode_frame(frame)?;
        bincode::deserialize(body)
            .map_err(|error| WriteError::Serialization(error.to_string()))
    }
}

/// Bounded pool of serializers.
///
/// Acquisition waits up to the configured timeout, then fails with
/// [`WriteError::SerializerUnavailable`]. The returned guard puts its
/// serializer back when dropped, on every exit path.
pub struct SerializerPool {
    slots: Receiver<Box<dyn RecordSerializer>>,
    returns: Sender<Box<dyn RecordSerializer>>,
    capacity: usize,
    acquire_timeout: Duration,
}

impl SerializerPool {
    /// A pool of `capacity` serializers built by `factory`.
    pub fn new(
        capacity: usize,
        acquire_timeout: Duration,
        factory: impl Fn() -> Box<dyn RecordSerializer>,
    ) -> Self {
        let capacity = capacity.max(1);
        let (returns, slots) = bounded(capacity);
        for _ in 0..capacity {
            // The channel was sized for exactly this many.
            let _ = returns.send(factory());
        }
        Self {
            slots,
            returns,
            capacity,
            acquire_timeout,
        }
    }

    /// A pool of [`BincodeSerializer`]s.
    pub fn bincode(capacity: usize, acquire_timeout: Duration) -> Self {
        Self::new(capacity, acquire_timeout, || {
            Box::new(BincodeSerializer::default())
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Serializers currently idle in the pool.
    pub fn available(&self) -> usize {
        self.slots.len()
    }

    /// Take a serializer, waiting up to the pool timeout.
    pub fn acquire(&self) -> Result<PooledSerializer<'_>, WriteError> {
        match self.slots.recv_timeout(self.acquire_timeout) {
            Ok(serializer) => Ok(PooledSerializer {
                serializer: Some(serializer),
                returns: &self.returns,
            }),
            Err(RecvTimeoutError::Timeout) => {
                Err(WriteError::SerializerUnavailable(self.acquire_timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(WriteError::ShutDown),
        }
    }
}

/// RAII guard around a pooled serializer.
pub struct PooledSerializer<'pool> {
    serializer: Option<Box<dyn RecordSerializer>>,
    returns: &'pool Sender<Box<dyn RecordSerializer>>,
}

impl std::ops::Deref for PooledSerializer<'_> {
    type Target = dyn RecordSerializer;

    fn deref(&self) -> &Self::Target {
        self.serializer
            .as_deref()
            .expect("serializer present until drop")
    }
}

impl std::ops::DerefMut for PooledSerializer<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.serializer
            .as_deref_mut()
            .expect("serializer present until drop")
    }
}

impl Drop for PooledSerializer<'_> {
    fn drop(&mut self) {
        if let Some(serializer) = self.serializer.take() {
            // Capacity matches the number of outstanding guards, so the
            // send cannot overflow; a disconnected pool is being dropped.
            let _ = self.returns.send(serializer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use spanvault_core::{RecordPayload, TimerStats};

    fn record(id: u64) -> TelemetryRecord {
        TelemetryRecord::new(
            id,
            10,
            20,
            1_000,
            RecordPayload::Sql {
                statement: "SELECT * FROM spans".to_string(),
                parameters: vec!["1".to_string()],
                stats: TimerStats::single(250),
            },
        )
    }

    #[test]
    fn test_frame_round_trip() {
        let mut serializer = BincodeSerializer::default();
        let metadata = WriteMetadata::now();
        let mut frame = Vec::new();
        serializer.serialize(&record(7), &metadata, &mut frame).unwrap();

        let stored = serializer.deserialize(&frame).unwrap();
        assert_eq!(stored.record, record(7));
        assert_eq!(stored.metadata, metadata);
    }

    #[test]
    fn test_corrupted_frame_rejected() {
        let mut serializer = BincodeSerializer::default();
        let mut frame = Vec::new();
        serializer
            .serialize(&record(7), &WriteMetadata::now(), &mut frame)
            .unwrap();

        let mid = frame.len() / 2;
        frame[mid] ^= 0xFF;
        assert!(matches!(
            serializer.deserialize(&frame),
            Err(WriteError::Serialization(_))
        ));

        assert!(matches!(
            serializer.deserialize(&[1, 2, 3]),
            Err(WriteError::Serialization(_))
        ));
    }

    #[test]
    fn test_pool_acquire_and_return() {
        let pool = SerializerPool::bincode(2, Duration::from_millis(50));
        assert_eq!(pool.available(), 2);

        let first = pool.acquire().unwrap();
        let _second = pool.acquire().unwrap();
        assert_eq!(pool.available(), 0);

        drop(first);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_pool_exhaustion_times_out() {
        let pool = SerializerPool::bincode(1, Duration::from_millis(20));
        let _held = pool.acquire().unwrap();

        match pool.acquire() {
            Err(WriteError::SerializerUnavailable(timeout)) => {
                assert_eq!(timeout, Duration::from_millis(20));
            }
            Err(other) => panic!("expected pool exhaustion, got {other:?}"),
            Ok(_) => panic!("expected pool exhaustion, got a serializer"),
        };
    }

    #[test]
    fn test_pooled_serializer_is_usable_through_the_guard() {
        let pool = SerializerPool::bincode(1, Duration::from_millis(50));
        let mut guard = pool.acquire().unwrap();
        let mut frame = Vec::new();
        guard
            .serialize(&record(1), &WriteMetadata::now(), &mut frame)
            .unwrap();
        assert!(frame.len() > FRAME_OVERHEAD);
    }

    proptest! {
        #[test]
        fn prop_descriptor_like_round_trip(
            id in any::<u64>(),
            platform in any::<u64>(),
            sensor in any::<u64>(),
            timestamp in any::<u64>(),
            duration in any::<u64>(),
        ) {
            let mut serializer = BincodeSerializer::default();
            let original = TelemetryRecord::new(
                id,
                platform,
                sensor,
                timestamp,
                RecordPayload::Timer(TimerStats::single(duration)),
            );
            let mut frame = Vec::new();
            serializer
                .serialize(&original, &WriteMetadata::now(), &mut frame)
                .unwrap();
            let stored = serializer.deserialize(&frame).unwrap();
            prop_assert_eq!(stored.record, original);
        }
    }
}
