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

//! Telemetry record model
//!
//! A [`TelemetryRecord`] is the fundamental unit of data in SpanVault: one
//! finalized measurement streamed by an agent. Identity and the indexable
//! attributes (platform, sensor, method, timestamp) are immutable once the
//! record enters the data plane.

use serde::{Deserialize, Serialize};

/// Classification of a record, the discriminant of [`RecordPayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecordKind {
    Timer,
    Sql,
    HttpTimer,
    Exception,
    InvocationSequence,
}

impl RecordKind {
    /// All kinds, in discriminant order. Used by tests and fan-out queries.
    pub const ALL: [RecordKind; 5] = [
        RecordKind::Timer,
        RecordKind::Sql,
        RecordKind::HttpTimer,
        RecordKind::Exception,
        RecordKind::InvocationSequence,
    ];
}

/// Aggregated timing values carried by measurement payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerStats {
    /// Number of measurements folded into this record.
    pub count: u64,
    /// Sum of all measured durations in microseconds.
    pub total_duration_us: u64,
    /// Smallest measured duration in microseconds.
    pub min_duration_us: u64,
    /// Largest measured duration in microseconds.
    pub max_duration_us: u64,
}

impl TimerStats {
    pub fn single(duration_us: u64) -> Self {
        Self {
            count: 1,
            total_duration_us: duration_us,
            min_duration_us: duration_us,
            max_duration_us: duration_us,
        }
    }

    /// Average duration in microseconds, zero when no measurements exist.
    pub fn avg_duration_us(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.total_duration_us / self.count
        }
    }
}

/// Lifecycle stage of a captured exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExceptionEvent {
    Created,
    Passed,
    Handled,
}

/// The typed body of a telemetry record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordPayload {
    /// Plain method timing.
    Timer(TimerStats),
    /// SQL statement execution timing.
    Sql {
        statement: String,
        parameters: Vec<String>,
        stats: TimerStats,
    },
    /// HTTP request timing.
    HttpTimer {
        uri: String,
        request_method: String,
        status: u16,
        stats: TimerStats,
    },
    /// Captured exception event.
    Exception {
        throwable_type: String,
        error_message: Option<String>,
        stack_trace: Option<String>,
        event: ExceptionEvent,
    },
    /// Rolled-up invocation sequence (a captured call tree root).
    InvocationSequence {
        child_count: u64,
        duration_us: u64,
        timer_count: u64,
        sql_count: u64,
    },
}

impl RecordPayload {
    pub fn kind(&self) -> RecordKind {
        match self {
            RecordPayload::Timer(_) => RecordKind::Timer,
            RecordPayload::Sql { .. } => RecordKind::Sql,
            RecordPayload::HttpTimer { .. } => RecordKind::HttpTimer,
            RecordPayload::Exception { .. } => RecordKind::Exception,
            RecordPayload::InvocationSequence { .. } => RecordKind::InvocationSequence,
        }
    }

    /// Timing values, when this payload carries any.
    pub fn stats(&self) -> Option<&TimerStats> {
        match self {
            RecordPayload::Timer(stats) => Some(stats),
            RecordPayload::Sql { stats, .. } => Some(stats),
            RecordPayload::HttpTimer { stats, .. } => Some(stats),
            _ => None,
        }
    }
}

/// One finalized telemetry measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Unique record id assigned by the ingestion layer.
    pub id: u64,
    /// Identifies the monitored JVM/process instance.
    pub platform_ident: u64,
    /// Identifies the sensor that produced the record.
    pub sensor_type_ident: u64,
    /// Instrumented method, when the sensor is method-scoped.
    pub method_ident: Option<u64>,
    /// Capture time in microseconds since the Unix epoch.
    pub timestamp_us: u64,
    /// The typed measurement body.
    pub payload: RecordPayload,
}

impl TelemetryRecord {
    pub fn new(
        id: u64,
        platform_ident: u64,
        sensor_type_ident: u64,
        timestamp_us: u64,
        payload: RecordPayload,
    ) -> Self {
        Self {
            id,
            platform_ident,
            sensor_type_ident,
            method_ident: None,
            timestamp_us,
            payload,
        }
    }

    pub fn with_method(mut self, method_ident: u64) -> Self {
        self.method_ident = Some(method_ident);
        self
    }

    pub fn kind(&self) -> RecordKind {
        self.payload.kind()
    }

    /// SQL statement text, for SQL records.
    pub fn sql(&self) -> Option<&str> {
        match &self.payload {
            RecordPayload::Sql { statement, .. } => Some(statement.as_str()),
            _ => None,
        }
    }

    /// True for invocation sequences that captured no nested calls.
    /// Non-invocation records are never "without children".
    pub fn is_invocation_without_children(&self) -> bool {
        matches!(
            self.payload,
            RecordPayload::InvocationSequence { child_count: 0, .. }
        )
    }
}
