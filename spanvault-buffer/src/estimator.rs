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

//! Record size estimation
//!
//! An explicit per-payload accounting contract: struct layout plus the
//! heap bytes hanging off it. No reflective traversal: what is counted
//! is written down here and covered by tests; the buffer's expansion rate
//! absorbs the remaining variance (allocator slack, map growth).

use std::mem::size_of;
use std::sync::Arc;

use spanvault_core::{RecordPayload, Result, TelemetryRecord};

/// Heap cost of the `Arc` control block in front of a shared record.
const ARC_OVERHEAD: u64 = 16;

/// Stack-side cost of a `String` stored inside a collection.
const STRING_HEADER: u64 = size_of::<String>() as u64;

/// Estimates the in-memory footprint of one record.
pub trait SizeEstimator: Send + Sync {
    fn estimate(&self, record: &TelemetryRecord) -> Result<u64>;
}

/// The shipped estimator: struct layout plus payload heap bytes.
#[derive(Debug, Default)]
pub struct DefaultSizeEstimator;

impl DefaultSizeEstimator {
    fn payload_heap_bytes(payload: &RecordPayload) -> u64 {
        match payload {
            RecordPayload::Timer(_) => 0,
            RecordPayload::Sql {
                statement,
                parameters,
                ..
            } => {
                statement.len() as u64
                    + parameters
                        .iter()
                        .map(|p| STRING_HEADER + p.len() as u64)
                        .sum::<u64>()
            }
            RecordPayload::HttpTimer {
                uri,
                request_method,
                ..
            } => uri.len() as u64 + request_method.len() as u64,
            RecordPayload::Exception {
                throwable_type,
                error_message,
                stack_trace,
                ..
            } => {
                throwable_type.len() as u64
                    + error_message.as_ref().map_or(0, |m| m.len() as u64)
                    + stack_trace.as_ref().map_or(0, |t| t.len() as u64)
            }
            RecordPayload::InvocationSequence { .. } => 0,
        }
    }
}

impl SizeEstimator for DefaultSizeEstimator {
    fn estimate(&self, record: &TelemetryRecord) -> Result<u64> {
        let record_size = size_of::<TelemetryRecord>() as u64;
        Ok(ARC_OVERHEAD + record_size + Self::payload_heap_bytes(&record.payload))
    }
}

/// Test estimator with a constant per-record size.
#[derive(Debug)]
pub struct FixedSizeEstimator {
    size: u64,
}

impl FixedSizeEstimator {
    pub fn new(size: u64) -> Self {
        Self { size }
    }
}

impl SizeEstimator for FixedSizeEstimator {
    fn estimate(&self, _record: &TelemetryRecord) -> Result<u64> {
        Ok(self.size)
    }
}

/// Convenience for the common trait-object form.
pub type SharedEstimator = Arc<dyn SizeEstimator>;

#[cfg(test)]
mod tests {
    use super::*;
    use spanvault_core::{RecordPayload, TimerStats};

    fn estimate(payload: RecordPayload) -> u64 {
        DefaultSizeEstimator
            .estimate(&TelemetryRecord::new(1, 10, 20, 0, payload))
            .unwrap()
    }

    #[test]
    fn test_timer_is_the_baseline() {
        let timer = estimate(RecordPayload::Timer(TimerStats::single(5)));
        assert_eq!(
            timer,
            ARC_OVERHEAD + size_of::<TelemetryRecord>() as u64
        );
    }

    #[test]
    fn test_sql_counts_statement_and_parameters() {
        let baseline = estimate(RecordPayload::Timer(TimerStats::single(5)));
        let sql = estimate(RecordPayload::Sql {
            statement: "SELECT * FROM orders".to_string(),
            parameters: vec!["42".to_string()],
            stats: TimerStats::single(5),
        });
        assert_eq!(sql, baseline + 20 + STRING_HEADER + 2);
    }

    #[test]
    fn test_exception_counts_optional_fields() {
        let bare = estimate(RecordPayload::Exception {
            throwable_type: "E".to_string(),
            error_message: None,
            stack_trace: None,
            event: spanvault_core::ExceptionEvent::Created,
        });
        let full = estimate(RecordPayload::Exception {
            throwable_type: "E".to_string(),
            error_message: Some("boom".to_string()),
            stack_trace: Some("at main".to_string()),
            event: spanvault_core::ExceptionEvent::Created,
        });
        assert_eq!(full, bare + 4 + 7);
    }

    #[test]
    fn test_fixed_estimator() {
        let estimator = FixedSizeEstimator::new(1);
        let record = TelemetryRecord::new(1, 10, 20, 0, RecordPayload::Timer(TimerStats::single(5)));
        assert_eq!(estimator.estimate(&record).unwrap(), 1);
    }
}
