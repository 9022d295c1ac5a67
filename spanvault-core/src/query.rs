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

//! Query request against the live buffer or the storage index
//!
//! A [`RecordQuery`] constrains any subset of the indexed dimensions; the
//! indexing tree descends only constrained dimensions and fans out across
//! the rest. Field restrictions beyond equality/range are expressed as
//! [`Restriction`] predicates applied at the leaves.

use serde::{Deserialize, Serialize};

use crate::record::{RecordKind, TelemetryRecord};

/// Record field a [`Restriction`] compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryField {
    Id,
    PlatformIdent,
    SensorTypeIdent,
    MethodIdent,
    Timestamp,
    TotalDurationUs,
    AvgDurationUs,
    Count,
}

/// Comparison operator of a [`Restriction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestrictionOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// A single field predicate applied to candidate records at the leaves.
///
/// Restrictions are a closed set of comparable fields rather than boxed
/// closures so a query stays serializable end to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Restriction {
    pub field: QueryField,
    pub op: RestrictionOp,
    pub value: u64,
}

impl Restriction {
    pub fn new(field: QueryField, op: RestrictionOp, value: u64) -> Self {
        Self { field, op, value }
    }

    fn field_value(&self, record: &TelemetryRecord) -> Option<u64> {
        match self.field {
            QueryField::Id => Some(record.id),
            QueryField::PlatformIdent => Some(record.platform_ident),
            QueryField::SensorTypeIdent => Some(record.sensor_type_ident),
            QueryField::MethodIdent => record.method_ident,
            QueryField::Timestamp => Some(record.timestamp_us),
            QueryField::TotalDurationUs => record.payload.stats().map(|s| s.total_duration_us),
            QueryField::AvgDurationUs => record.payload.stats().map(|s| s.avg_duration_us()),
            QueryField::Count => record.payload.stats().map(|s| s.count),
        }
    }

    /// A record without the referenced field never matches.
    pub fn matches(&self, record: &TelemetryRecord) -> bool {
        let Some(value) = self.field_value(record) else {
            return false;
        };
        match self.op {
            RestrictionOp::Eq => value == self.value,
            RestrictionOp::Ne => value != self.value,
            RestrictionOp::Gt => value > self.value,
            RestrictionOp::Ge => value >= self.value,
            RestrictionOp::Lt => value < self.value,
            RestrictionOp::Le => value <= self.value,
        }
    }
}

/// Query over the indexed record dimensions.
///
/// Unset fields leave their dimension unconstrained. Empty `kinds` /
/// `include_ids` collections mean "all".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordQuery {
    pub platform_ident: Option<u64>,
    pub sensor_type_ident: Option<u64>,
    pub method_ident: Option<u64>,
    pub kinds: Vec<RecordKind>,
    pub from_timestamp_us: Option<u64>,
    pub to_timestamp_us: Option<u64>,
    pub min_id: Option<u64>,
    pub include_ids: Vec<u64>,
    pub exclude_ids: Vec<u64>,
    pub only_invocations_without_children: bool,
    pub sql: Option<String>,
    pub restrictions: Vec<Restriction>,
}

impl RecordQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to one platform.
    pub fn platform(mut self, platform_ident: u64) -> Self {
        self.platform_ident = Some(platform_ident);
        self
    }

    /// Restrict to one sensor type.
    pub fn sensor_type(mut self, sensor_type_ident: u64) -> Self {
        self.sensor_type_ident = Some(sensor_type_ident);
        self
    }

    /// Restrict to one instrumented method.
    pub fn method(mut self, method_ident: u64) -> Self {
        self.method_ident = Some(method_ident);
        self
    }

    /// Add a record kind; the query matches any of the added kinds.
    pub fn kind(mut self, kind: RecordKind) -> Self {
        self.kinds.push(kind);
        self
    }

    /// Restrict to the closed capture-time range `[from, to]`.
    pub fn time_range(mut self, from_us: u64, to_us: u64) -> Self {
        self.from_timestamp_us = Some(from_us);
        self.to_timestamp_us = Some(to_us);
        self
    }

    /// Only records with `id >= min_id`.
    pub fn min_id(mut self, min_id: u64) -> Self {
        self.min_id = Some(min_id);
        self
    }

    pub fn include_id(mut self, id: u64) -> Self {
        self.include_ids.push(id);
        self
    }

    pub fn exclude_id(mut self, id: u64) -> Self {
        self.exclude_ids.push(id);
        self
    }

    /// Only invocation sequences that captured no nested calls.
    pub fn without_children(mut self) -> Self {
        self.only_invocations_without_children = true;
        self
    }

    /// Restrict SQL records to an exact statement text.
    pub fn sql(mut self, statement: impl Into<String>) -> Self {
        self.sql = Some(statement.into());
        self
    }

    pub fn restriction(mut self, restriction: Restriction) -> Self {
        self.restrictions.push(restriction);
        self
    }

    /// Check a candidate record against every constraint of this query.
    pub fn matches(&self, record: &TelemetryRecord) -> bool {
        if let Some(platform) = self.platform_ident {
            if record.platform_ident != platform {
                return false;
            }
        }

        if let Some(sensor) = self.sensor_type_ident {
            if record.sensor_type_ident != sensor {
                return false;
            }
        }

        if let Some(method) = self.method_ident {
            if record.method_ident != Some(method) {
                return false;
            }
        }

        if !self.kinds.is_empty() && !self.kinds.contains(&record.kind()) {
            return false;
        }

        if let Some(from) = self.from_timestamp_us {
            if record.timestamp_us < from {
                return false;
            }
        }

        if let Some(to) = self.to_timestamp_us {
            if record.timestamp_us > to {
                return false;
            }
        }

        if let Some(min_id) = self.min_id {
            if record.id < min_id {
                return false;
            }
        }

        if !self.include_ids.is_empty() && !self.include_ids.contains(&record.id) {
            return false;
        }

        if self.exclude_ids.contains(&record.id) {
            return false;
        }

        if self.only_invocations_without_children && !record.is_invocation_without_children() {
            return false;
        }

        if let Some(ref sql) = self.sql {
            if record.sql() != Some(sql.as_str()) {
                return false;
            }
        }

        self.restrictions.iter().all(|r| r.matches(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{RecordPayload, TimerStats};

    fn timer_record(id: u64, platform: u64, sensor: u64, timestamp: u64) -> TelemetryRecord {
        TelemetryRecord::new(
            id,
            platform,
            sensor,
            timestamp,
            RecordPayload::Timer(TimerStats::single(100)),
        )
    }

    #[test]
    fn test_empty_query_matches_everything() {
        let query = RecordQuery::new();
        assert!(query.matches(&timer_record(1, 10, 20, 1000)));
        assert!(query.matches(&timer_record(2, 11, 21, 2000)));
    }

    #[test]
    fn test_dimension_constraints() {
        let query = RecordQuery::new().platform(10).sensor_type(20);
        assert!(query.matches(&timer_record(1, 10, 20, 1000)));
        assert!(!query.matches(&timer_record(2, 10, 21, 1000)));
        assert!(!query.matches(&timer_record(3, 11, 20, 1000)));
    }

    #[test]
    fn test_time_range_is_closed() {
        let query = RecordQuery::new().time_range(1000, 2000);
        assert!(query.matches(&timer_record(1, 10, 20, 1000)));
        assert!(query.matches(&timer_record(2, 10, 20, 2000)));
        assert!(!query.matches(&timer_record(3, 10, 20, 999)));
        assert!(!query.matches(&timer_record(4, 10, 20, 2001)));
    }

    #[test]
    fn test_include_exclude_ids() {
        let query = RecordQuery::new().include_id(1).include_id(2).exclude_id(2);
        assert!(query.matches(&timer_record(1, 10, 20, 1000)));
        assert!(!query.matches(&timer_record(2, 10, 20, 1000)));
        assert!(!query.matches(&timer_record(3, 10, 20, 1000)));
    }

    #[test]
    fn test_method_constraint_requires_method() {
        let query = RecordQuery::new().method(7);
        let with_method = timer_record(1, 10, 20, 1000).with_method(7);
        assert!(query.matches(&with_method));
        assert!(!query.matches(&timer_record(2, 10, 20, 1000)));
    }

    #[test]
    fn test_restriction_on_duration() {
        let query = RecordQuery::new().restriction(Restriction::new(
            QueryField::TotalDurationUs,
            RestrictionOp::Ge,
            100,
        ));
        assert!(query.matches(&timer_record(1, 10, 20, 1000)));

        let slow = RecordQuery::new().restriction(Restriction::new(
            QueryField::TotalDurationUs,
            RestrictionOp::Gt,
            100,
        ));
        assert!(!slow.matches(&timer_record(1, 10, 20, 1000)));
    }

    #[test]
    fn test_restriction_missing_field_never_matches() {
        // Timer records have no method ident here, so any MethodIdent
        // restriction must fail regardless of operator.
        let query = RecordQuery::new().restriction(Restriction::new(
            QueryField::MethodIdent,
            RestrictionOp::Ne,
            999,
        ));
        assert!(!query.matches(&timer_record(1, 10, 20, 1000)));
    }

    #[test]
    fn test_sql_constraint() {
        let record = TelemetryRecord::new(
            1,
            10,
            20,
            1000,
            RecordPayload::Sql {
                statement: "SELECT * FROM users".to_string(),
                parameters: vec![],
                stats: TimerStats::single(10),
            },
        );
        assert!(RecordQuery::new().sql("SELECT * FROM users").matches(&record));
        assert!(!RecordQuery::new().sql("SELECT 1").matches(&record));
        assert!(!RecordQuery::new()
            .sql("SELECT 1")
            .matches(&timer_record(2, 10, 20, 1000)));
    }
}
