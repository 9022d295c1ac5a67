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

//! Write channels
//!
//! A channel is one append-only data file (`data-<id>.svd`) with a
//! dedicated I/O thread. Submitting a write never blocks: the job queue
//! is unbounded and the submitting thread returns as soon as the job is
//! enqueued. The I/O thread appends, advances the channel position, and
//! runs the completion callback with the final `(position, size)`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use spanvault_core::Descriptor;
use tracing::{debug, warn};

use crate::error::WriteError;

/// Completion callback of one asynchronous write.
pub type WriteCompletion = Box<dyn FnOnce(Result<(u64, u64), WriteError>) + Send>;

struct WriteJob {
    bytes: Vec<u8>,
    completion: WriteCompletion,
}

/// One append-only write target with its I/O thread.
pub struct WriteChannel {
    id: u32,
    /// `None` once the channel is closed; dropping the sender ends the
    /// I/O thread after the queue drains.
    jobs: Mutex<Option<Sender<WriteJob>>>,
    /// Next append position; advanced by the I/O thread on success.
    position: Arc<AtomicU64>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WriteChannel {
    fn open(id: u32, path: PathBuf) -> Result<Self, WriteError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let start = file.seek(SeekFrom::End(0))?;
        let position = Arc::new(AtomicU64::new(start));

        let (jobs, receiver) = unbounded::<WriteJob>();
        let thread_position = Arc::clone(&position);
        let thread_path = path.clone();
        let worker = std::thread::Builder::new()
            .name(format!("spanvault-channel-{id}"))
            .spawn(move || {
                debug!(channel = id, "channel i/o thread started");
                for job in receiver.iter() {
                    let at = thread_position.load(Ordering::Acquire);
                    let size = job.bytes.len() as u64;
                    match file.write_all(&job.bytes) {
                        Ok(()) => {
                            thread_position.store(at + size, Ordering::Release);
                            (job.completion)(Ok((at, size)));
                        }
                        Err(error) => {
                            // A partial append leaves the file longer than
                            // the accounted position; resync so later
                            // writes stay addressable.
                            if let Ok(metadata) = std::fs::metadata(&thread_path) {
                                thread_position.store(metadata.len(), Ordering::Release);
                            }
                            (job.completion)(Err(WriteError::ChannelWrite(error.to_string())));
                        }
                    }
                }
                if let Err(error) = file.flush() {
                    warn!(channel = id, %error, "channel flush on shutdown failed");
                }
                debug!(channel = id, "channel i/o thread stopped");
            })?;

        Ok(Self {
            id,
            jobs: Mutex::new(Some(jobs)),
            position,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Bytes appended so far.
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    /// Enqueue an asynchronous append. Returns immediately; `completion`
    /// runs on the I/O thread once the bytes are written (or failed).
    pub fn submit(&self, bytes: Vec<u8>, completion: WriteCompletion) -> Result<(), WriteError> {
        match self.jobs.lock().as_ref() {
            Some(jobs) => jobs
                .send(WriteJob { bytes, completion })
                .map_err(|_| WriteError::ShutDown),
            None => Err(WriteError::ShutDown),
        }
    }

    /// Stop accepting jobs, drain the queue, and join the I/O thread.
    fn close(&self) {
        drop(self.jobs.lock().take());
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

/// Owns every write channel under one data directory.
pub struct WriteChannelManager {
    directory: PathBuf,
    channels: DashMap<u32, Arc<WriteChannel>>,
}

impl WriteChannelManager {
    /// Open a manager over `directory`, creating it as needed.
    pub fn open(directory: impl AsRef<Path>) -> Result<Self, WriteError> {
        let directory = directory.as_ref().to_path_buf();
        std::fs::create_dir_all(&directory)?;
        Ok(Self {
            directory,
            channels: DashMap::new(),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn data_path(&self, channel_id: u32) -> PathBuf {
        self.directory.join(format!("data-{channel_id}.svd"))
    }

    /// The channel for `channel_id`, opened on first use.
    pub fn channel(&self, channel_id: u32) -> Result<Arc<WriteChannel>, WriteError> {
        if let Some(channel) = self.channels.get(&channel_id) {
            return Ok(Arc::clone(channel.value()));
        }
        match self.channels.entry(channel_id) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => Ok(Arc::clone(occupied.get())),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let channel = Arc::new(WriteChannel::open(
                    channel_id,
                    self.data_path(channel_id),
                )?);
                vacant.insert(Arc::clone(&channel));
                Ok(channel)
            }
        }
    }

    /// Number of channels opened so far.
    pub fn open_channels(&self) -> usize {
        self.channels.len()
    }

    /// Read back the bytes a descriptor points at. Used by tests and the
    /// artifact path; bulk record retrieval belongs to the external
    /// reader.
    pub fn read(&self, descriptor: &Descriptor) -> Result<Vec<u8>, WriteError> {
        let mut file = File::open(self.data_path(descriptor.channel_id))?;
        file.seek(SeekFrom::Start(descriptor.position))?;
        let mut bytes = vec![0u8; descriptor.size as usize];
        file.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    /// Drain and join every channel. Afterwards all completions have run.
    pub fn close(&self) {
        for entry in self.channels.iter() {
            entry.value().close();
        }
    }
}

impl Drop for WriteChannelManager {
    fn drop(&mut self) {
        self.close();
    }
}
