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

//! Background workers
//!
//! Exactly one analyzer and one indexer thread per buffer. Both park on
//! the buffer's work signal with a bounded timeout when idle, never busy
//! spinning. The analyzer doubles as the maintenance and eviction
//! detector, since it is the thread that moves occupancy.
//!
//! Shutdown is cooperative: a flag plus a wake-up, then a join. Work on
//! the current element finishes; nothing is rolled back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::debug;

use crate::buffer::EvictingBuffer;

/// Handles of a buffer's background threads. Stops and joins on drop.
pub struct BufferWorkers {
    shutdown: Arc<AtomicBool>,
    buffer: Arc<EvictingBuffer>,
    analyzer: Option<JoinHandle<()>>,
    indexer: Option<JoinHandle<()>>,
}

impl BufferWorkers {
    /// Spawn the analyzer and indexer for `buffer`.
    pub fn spawn(buffer: Arc<EvictingBuffer>) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let poll = Duration::from_millis(buffer.properties().worker_poll_ms);

        let analyzer = {
            let buffer = Arc::clone(&buffer);
            let shutdown = Arc::clone(&shutdown);
            std::thread::Builder::new()
                .name("spanvault-analyzer".to_string())
                .spawn(move || {
                    debug!("analyzer started");
                    while !shutdown.load(Ordering::Acquire) {
                        let processed = buffer.analyze_pending();
                        buffer.maintenance_if_due();
                        if buffer.should_evict() {
                            buffer.evict();
                        }
                        if processed == 0 {
                            buffer.wait_for_work(poll);
                        }
                    }
                    debug!("analyzer stopped");
                })
                .expect("spawn analyzer thread")
        };

        let indexer = {
            let buffer = Arc::clone(&buffer);
            let shutdown = Arc::clone(&shutdown);
            std::thread::Builder::new()
                .name("spanvault-indexer".to_string())
                .spawn(move || {
                    debug!("indexer started");
                    while !shutdown.load(Ordering::Acquire) {
                        if buffer.index_pending() == 0 {
                            buffer.wait_for_work(poll);
                        }
                    }
                    debug!("indexer stopped");
                })
                .expect("spawn indexer thread")
        };

        Self {
            shutdown,
            buffer,
            analyzer: Some(analyzer),
            indexer: Some(indexer),
        }
    }

    /// Signal both workers and join them. Idempotent.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.buffer.notify_workers();
        if let Some(handle) = self.analyzer.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.indexer.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BufferWorkers {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::FixedSizeEstimator;
    use crate::properties::BufferProperties;
    use spanvault_core::{RecordPayload, RecordQuery, TelemetryRecord, TimerStats, WritePinRegistry};
    use std::time::Instant;

    fn wait_until(deadline: Duration, condition: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn test_buffer(capacity: u64) -> Arc<EvictingBuffer> {
        let properties = BufferProperties {
            initial_capacity: capacity,
            min_expansion_rate: 0.0,
            max_expansion_rate: 0.0,
            worker_poll_ms: 20,
            ..BufferProperties::default()
        };
        Arc::new(
            EvictingBuffer::with_parts(
                properties,
                Box::new(FixedSizeEstimator::new(1)),
                Arc::new(WritePinRegistry::new()),
            )
            .unwrap(),
        )
    }

    fn record(id: u64) -> TelemetryRecord {
        TelemetryRecord::new(id, 10, 20, 1_000, RecordPayload::Timer(TimerStats::single(5)))
    }

    #[test]
    fn test_workers_drain_the_pipeline() {
        let buffer = test_buffer(10_000);
        let _workers = BufferWorkers::spawn(Arc::clone(&buffer));

        for id in 0..200 {
            buffer.put(record(id));
        }

        assert!(wait_until(Duration::from_secs(5), || {
            buffer.query(&RecordQuery::new()).len() == 200
        }));
        assert_eq!(buffer.current_size(), 200);
    }

    #[test]
    fn test_workers_trigger_eviction() {
        let buffer = test_buffer(100);
        let _workers = BufferWorkers::spawn(Arc::clone(&buffer));

        for id in 0..150 {
            buffer.put(record(id));
        }

        // Occupancy crossed 0.95, so the analyzer must evict down.
        assert!(wait_until(Duration::from_secs(5), || {
            buffer.stats().evicted_elements > 0
        }));
        assert!(wait_until(Duration::from_secs(5), || {
            !buffer.should_evict()
        }));
    }

    #[test]
    fn test_shutdown_joins_and_halts_progress() {
        let buffer = test_buffer(10_000);
        let mut workers = BufferWorkers::spawn(Arc::clone(&buffer));

        buffer.put(record(1));
        assert!(wait_until(Duration::from_secs(5), || {
            buffer.stats().pending_analysis == 0
        }));

        workers.stop();
        // Stopped workers make no further progress.
        buffer.put(record(2));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(buffer.stats().pending_analysis, 1);

        // Second stop is a no-op.
        workers.stop();
    }
}
