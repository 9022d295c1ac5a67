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

//! The storage writer
//!
//! Persists selected records asynchronously. Each write task walks a
//! fixed sequence (reserve, backpressure check, serializer acquisition,
//! serialization, channel submission) and every exit path releases
//! exactly the resources it acquired, exactly once (the serializer guard
//! and the write pin are RAII; the frame buffer is owned by the task).
//!
//! Failures are isolated per task and surface through counters and logs:
//! persistence is best-effort, a failed write reduces completeness
//! without touching other in-flight work. The reserved descriptor slot is
//! populated only by the completion callback, so readers never observe a
//! half-written record.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use spanvault_core::{
    Descriptor, DescriptorSlot, TelemetryRecord, WritePinRegistry, WriteReservation,
};
use spanvault_index::{ArrayDescriptorLeaf, DescriptorLeafContext, PersistentLeaf};
use tracing::{debug, warn};

use crate::channel::WriteChannelManager;
use crate::error::WriteError;
use crate::serializer::{encode_frame, SerializerPool, WriteMetadata};
use crate::tree_handler::StorageTreeHandler;

/// Storage writer configuration.
#[derive(Debug, Clone)]
pub struct StorageWriterConfig {
    /// Directory of the channel data files and the index file.
    pub data_dir: PathBuf,
    /// Persisted-volume cap; tasks beyond it are rejected up front.
    pub max_persisted_bytes: u64,
    /// Bounded serializer pool size.
    pub serializer_pool_size: usize,
    /// How long a task waits for a serializer before giving up.
    pub serializer_timeout: Duration,
    /// Writer task worker threads.
    pub writer_threads: usize,
}

impl StorageWriterConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            max_persisted_bytes: 4 * 1024 * 1024 * 1024,
            serializer_pool_size: 4,
            serializer_timeout: Duration::from_secs(5),
            writer_threads: 2,
        }
    }
}

/// Counter snapshot of a writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub backpressure_rejected: u64,
    pub persisted_bytes: u64,
}

enum WriteTask {
    Record(Arc<TelemetryRecord>),
    Artifact {
        bytes: Vec<u8>,
        slot: WriteReservation,
    },
}

struct WriterInner<L>
where
    L: PersistentLeaf<
        Context = DescriptorLeafContext,
        Handle = WriteReservation,
        Element = Descriptor,
    >,
{
    config: StorageWriterConfig,
    handler: StorageTreeHandler<L>,
    pool: SerializerPool,
    channels: WriteChannelManager,
    pins: Arc<WritePinRegistry>,

    submitted: AtomicU64,
    backpressure_rejected: AtomicU64,
    // Shared with completion callbacks that outlive the task scope.
    completed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    persisted_bytes: Arc<AtomicU64>,
}

/// Asynchronous persistence writer over a persisted indexing tree.
pub struct StorageWriter<L = ArrayDescriptorLeaf>
where
    L: PersistentLeaf<
        Context = DescriptorLeafContext,
        Handle = WriteReservation,
        Element = Descriptor,
    >,
{
    inner: Arc<WriterInner<L>>,
    tasks: Mutex<Option<Sender<WriteTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Channel of the non-indexed artifact path.
    artifact_channel: u32,
}

impl<L> StorageWriter<L>
where
    L: PersistentLeaf<
            Context = DescriptorLeafContext,
            Handle = WriteReservation,
            Element = Descriptor,
        > + 'static,
{
    /// Open a writer with a fresh tree handler over the default chain.
    pub fn open(config: StorageWriterConfig) -> Result<Self, WriteError> {
        let handler = StorageTreeHandler::with_chain(spanvault_index::default_storage_chain())?;
        Self::with_parts(config, handler, Arc::new(WritePinRegistry::new()))
    }

    /// Full constructor: an explicit handler (custom chain or one restored
    /// from an index file) and the pin registry shared with the buffer.
    pub fn with_parts(
        config: StorageWriterConfig,
        handler: StorageTreeHandler<L>,
        pins: Arc<WritePinRegistry>,
    ) -> Result<Self, WriteError> {
        let channels = WriteChannelManager::open(&config.data_dir)?;
        let pool = SerializerPool::bincode(config.serializer_pool_size, config.serializer_timeout);
        let artifact_channel = handler.context().allocator.allocate();

        let inner = Arc::new(WriterInner {
            config,
            handler,
            pool,
            channels,
            pins,
            submitted: AtomicU64::new(0),
            backpressure_rejected: AtomicU64::new(0),
            completed: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
            persisted_bytes: Arc::new(AtomicU64::new(0)),
        });

        let (tasks, receiver) = unbounded::<WriteTask>();
        let thread_count = inner.config.writer_threads.max(1);
        let mut workers = Vec::with_capacity(thread_count);
        for worker in 0..thread_count {
            let inner = Arc::clone(&inner);
            let receiver: Receiver<WriteTask> = receiver.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("spanvault-writer-{worker}"))
                    .spawn(move || {
                        for task in receiver.iter() {
                            match task {
                                WriteTask::Record(record) => inner.process_record(record),
                                WriteTask::Artifact { bytes, slot } => {
                                    inner.process_artifact(bytes, slot)
                                }
                            }
                        }
                    })?,
            );
        }

        Ok(Self {
            inner,
            tasks: Mutex::new(Some(tasks)),
            workers: Mutex::new(workers),
            artifact_channel,
        })
    }

    /// Enqueue a record write task. Never blocks on I/O.
    pub fn write(&self, record: Arc<TelemetryRecord>) -> Result<(), WriteError> {
        match self.tasks.lock().as_ref() {
            Some(tasks) => {
                self.inner.submitted.fetch_add(1, Ordering::Relaxed);
                tasks
                    .send(WriteTask::Record(record))
                    .map_err(|_| WriteError::ShutDown)
            }
            None => Err(WriteError::ShutDown),
        }
    }

    /// The companion non-indexed path: persist an ancillary payload
    /// through the same channel primitive, without touching any tree.
    /// The returned slot is populated once the bytes are on disk.
    pub fn write_artifact(&self, payload: Vec<u8>) -> Result<WriteReservation, WriteError> {
        let slot: WriteReservation = Arc::new(DescriptorSlot::new(self.artifact_channel, 0));
        match self.tasks.lock().as_ref() {
            Some(tasks) => {
                self.inner.submitted.fetch_add(1, Ordering::Relaxed);
                tasks
                    .send(WriteTask::Artifact {
                        bytes: payload,
                        slot: Arc::clone(&slot),
                    })
                    .map_err(|_| WriteError::ShutDown)?;
                Ok(slot)
            }
            None => Err(WriteError::ShutDown),
        }
    }

    pub fn stats(&self) -> WriterStats {
        WriterStats {
            submitted: self.inner.submitted.load(Ordering::Relaxed),
            completed: self.inner.completed.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            backpressure_rejected: self.inner.backpressure_rejected.load(Ordering::Relaxed),
            persisted_bytes: self.inner.persisted_bytes.load(Ordering::Relaxed),
        }
    }

    pub fn handler(&self) -> &StorageTreeHandler<L> {
        &self.inner.handler
    }

    pub fn channels(&self) -> &WriteChannelManager {
        &self.inner.channels
    }

    /// Serializers currently idle in the pool.
    pub fn pool_available(&self) -> usize {
        self.inner.pool.available()
    }

    /// Persist the tree's index file under the data directory.
    pub fn save_index(&self) -> Result<(), WriteError> {
        self.inner
            .handler
            .save_index(self.inner.config.data_dir.join("index.svx"))
    }

    /// Drain all queued tasks and in-flight channel writes, then stop the
    /// worker threads. After `close` returns, every completion has run.
    pub fn close(&self) {
        drop(self.tasks.lock().take());
        for worker in self.workers.lock().drain(..) {
            let _ = worker.join();
        }
        self.inner.channels.close();
        debug!("storage writer closed");
    }
}

impl<L> Drop for StorageWriter<L>
where
    L: PersistentLeaf<
        Context = DescriptorLeafContext,
        Handle = WriteReservation,
        Element = Descriptor,
    >,
{
    fn drop(&mut self) {
        self.close();
    }
}

impl<L> WriterInner<L>
where
    L: PersistentLeaf<
        Context = DescriptorLeafContext,
        Handle = WriteReservation,
        Element = Descriptor,
    >,
{
    /// One record write task, steps in order; every early return releases
    /// exactly what was acquired before it.
    fn process_record(&self, record: Arc<TelemetryRecord>) {
        // The pin keeps buffer eviction away while the record is being
        // serialized; dropped with the task scope.
        let _pin = self.pins.pin(record.id);

        // 1. Reserve the descriptor slot. Nothing else has been touched,
        //    so a failure aborts the task outright.
        let reservation = match self.handler.reserve(&record) {
            Ok(reservation) => reservation,
            Err(error) => {
                self.write_failed(record.id, &error);
                return;
            }
        };

        // 2. Backpressure: expected control flow, checked before any
        //    resource acquisition.
        if self.persisted_bytes.load(Ordering::Relaxed) >= self.config.max_persisted_bytes {
            self.backpressure_rejected.fetch_add(1, Ordering::Relaxed);
            debug!(record_id = record.id, "write rejected by persisted-volume cap");
            return;
        }

        // 3. Bounded, interruptible serializer acquisition.
        let mut serializer = match self.pool.acquire() {
            Ok(serializer) => serializer,
            Err(error) => {
                self.write_failed(record.id, &error);
                return;
            }
        };

        // 4. Serialize into the task-owned frame buffer. The guard
        //    returns the serializer on every path from here on.
        let mut frame = Vec::new();
        if let Err(error) = serializer.serialize(&record, &WriteMetadata::now(), &mut frame) {
            self.write_failed(record.id, &error);
            return;
        }
        drop(serializer);

        // 5. Submit for asynchronous write.
        let channel = match self.channels.channel(reservation.channel_id()) {
            Ok(channel) => channel,
            Err(error) => {
                self.write_failed(record.id, &error);
                return;
            }
        };

        let record_id = record.id;
        let completed = Arc::clone(&self.completed);
        let failed = Arc::clone(&self.failed);
        let persisted_bytes = Arc::clone(&self.persisted_bytes);
        let completion_slot = Arc::clone(&reservation);
        let completion = Box::new(move |outcome: Result<(u64, u64), WriteError>| match outcome {
            // 6. Populate the reserved descriptor only now; readers never
            //    observe the slot before this.
            Ok((position, size)) => {
                completion_slot.populate(position, size);
                persisted_bytes.fetch_add(size, Ordering::Relaxed);
                completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                warn!(record_id, %error, "asynchronous channel write failed");
                failed.fetch_add(1, Ordering::Relaxed);
            }
        });

        if let Err(error) = channel.submit(frame, completion) {
            self.write_failed(record_id, &error);
        }
    }

    /// The non-indexed write path: frame and append, no tree involved.
    fn process_artifact(&self, bytes: Vec<u8>, slot: WriteReservation) {
        if self.persisted_bytes.load(Ordering::Relaxed) >= self.config.max_persisted_bytes {
            self.backpressure_rejected.fetch_add(1, Ordering::Relaxed);
            debug!("artifact write rejected by persisted-volume cap");
            return;
        }

        let mut frame = Vec::with_capacity(bytes.len() + 8);
        encode_frame(&bytes, &mut frame);

        let channel = match self.channels.channel(slot.channel_id()) {
            Ok(channel) => channel,
            Err(error) => {
                self.artifact_failed(&error);
                return;
            }
        };

        let completed = Arc::clone(&self.completed);
        let failed = Arc::clone(&self.failed);
        let persisted_bytes = Arc::clone(&self.persisted_bytes);
        let completion = Box::new(move |outcome: Result<(u64, u64), WriteError>| match outcome {
            Ok((position, size)) => {
                slot.populate(position, size);
                persisted_bytes.fetch_add(size, Ordering::Relaxed);
                completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                warn!(%error, "artifact channel write failed");
                failed.fetch_add(1, Ordering::Relaxed);
            }
        });

        if let Err(error) = channel.submit(frame, completion) {
            self.artifact_failed(&error);
        }
    }

    fn write_failed(&self, record_id: u64, error: &WriteError) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        warn!(record_id, %error, "write task failed");
    }

    fn artifact_failed(&self, error: &WriteError) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        warn!(%error, "artifact write task failed");
    }
}
