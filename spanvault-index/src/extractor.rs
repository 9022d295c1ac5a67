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

//! Key extractors
//!
//! An [`IndexingTree`](crate::tree::IndexingTree) is shaped by an ordered
//! chain of extractors, one per level. Each extractor derives the key for a
//! record going in and the set of constrained keys for a query coming back
//! out. Dispatch is plain trait objects composed at construction time.

use std::hash::Hasher;

use spanvault_core::{RecordQuery, TelemetryRecord};
use twox_hash::XxHash64;

use crate::key::{IndexKey, KeySelection};

/// Default time-bucket width: 15 seconds.
pub const DEFAULT_TIME_BUCKET_US: u64 = 15_000_000;

/// Widest time range a query may enumerate bucket-by-bucket before the
/// level falls back to a full fan-out.
const MAX_ENUMERATED_BUCKETS: u64 = 4096;

/// Derives one tree level's key from records and queries.
pub trait KeyExtractor: Send + Sync {
    /// Key of `record` at this level, `None` when the record lacks the
    /// attribute (the tree rejects such records for this chain).
    fn key(&self, record: &TelemetryRecord) -> Option<IndexKey>;

    /// Keys a query constrains at this level.
    fn keys(&self, query: &RecordQuery) -> KeySelection;
}

/// Level keyed by the monitored platform.
#[derive(Debug, Default)]
pub struct PlatformExtractor;

impl KeyExtractor for PlatformExtractor {
    fn key(&self, record: &TelemetryRecord) -> Option<IndexKey> {
        Some(IndexKey::Platform(record.platform_ident))
    }

    fn keys(&self, query: &RecordQuery) -> KeySelection {
        match query.platform_ident {
            Some(platform) => KeySelection::One(IndexKey::Platform(platform)),
            None => KeySelection::All,
        }
    }
}

/// Level keyed by the record kind (object type).
#[derive(Debug, Default)]
pub struct KindExtractor;

impl KeyExtractor for KindExtractor {
    fn key(&self, record: &TelemetryRecord) -> Option<IndexKey> {
        Some(IndexKey::Kind(record.kind()))
    }

    fn keys(&self, query: &RecordQuery) -> KeySelection {
        if query.kinds.is_empty() {
            KeySelection::All
        } else {
            KeySelection::from_keys(query.kinds.iter().map(|&k| IndexKey::Kind(k)).collect())
        }
    }
}

/// Level keyed by the producing sensor type.
#[derive(Debug, Default)]
pub struct SensorTypeExtractor;

impl KeyExtractor for SensorTypeExtractor {
    fn key(&self, record: &TelemetryRecord) -> Option<IndexKey> {
        Some(IndexKey::Sensor(record.sensor_type_ident))
    }

    fn keys(&self, query: &RecordQuery) -> KeySelection {
        match query.sensor_type_ident {
            Some(sensor) => KeySelection::One(IndexKey::Sensor(sensor)),
            None => KeySelection::All,
        }
    }
}

/// Level keyed by the instrumented method. Records without a method ident
/// cannot be indexed by a chain containing this level.
#[derive(Debug, Default)]
pub struct MethodExtractor;

impl KeyExtractor for MethodExtractor {
    fn key(&self, record: &TelemetryRecord) -> Option<IndexKey> {
        record.method_ident.map(IndexKey::Method)
    }

    fn keys(&self, query: &RecordQuery) -> KeySelection {
        match query.method_ident {
            Some(method) => KeySelection::One(IndexKey::Method(method)),
            None => KeySelection::All,
        }
    }
}

/// Level keyed by aligned capture-time buckets.
#[derive(Debug)]
pub struct TimestampExtractor {
    bucket_width_us: u64,
}

impl TimestampExtractor {
    pub fn new(bucket_width_us: u64) -> Self {
        // A zero width would fold every record into bucket 0.
        Self {
            bucket_width_us: bucket_width_us.max(1),
        }
    }

    fn bucket(&self, timestamp_us: u64) -> u64 {
        timestamp_us / self.bucket_width_us
    }
}

impl Default for TimestampExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_TIME_BUCKET_US)
    }
}

impl KeyExtractor for TimestampExtractor {
    fn key(&self, record: &TelemetryRecord) -> Option<IndexKey> {
        Some(IndexKey::TimeBucket(self.bucket(record.timestamp_us)))
    }

    fn keys(&self, query: &RecordQuery) -> KeySelection {
        match (query.from_timestamp_us, query.to_timestamp_us) {
            (Some(from), Some(to)) if from <= to => {
                let first = self.bucket(from);
                let last = self.bucket(to);
                if last - first >= MAX_ENUMERATED_BUCKETS {
                    return KeySelection::All;
                }
                KeySelection::from_keys(
                    (first..=last).map(IndexKey::TimeBucket).collect(),
                )
            }
            (Some(_), Some(_)) => KeySelection::Many(vec![]),
            // A half-open range cannot be enumerated; the leaves filter it.
            _ => KeySelection::All,
        }
    }
}

/// Level keyed by the hashed SQL statement text. Only SQL records carry
/// this attribute.
#[derive(Debug, Default)]
pub struct SqlStatementExtractor;

fn sql_hash(statement: &str) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(statement.as_bytes());
    hasher.finish()
}

impl KeyExtractor for SqlStatementExtractor {
    fn key(&self, record: &TelemetryRecord) -> Option<IndexKey> {
        record.sql().map(|statement| IndexKey::Sql(sql_hash(statement)))
    }

    fn keys(&self, query: &RecordQuery) -> KeySelection {
        match query.sql {
            Some(ref statement) => KeySelection::One(IndexKey::Sql(sql_hash(statement))),
            None => KeySelection::All,
        }
    }
}

/// The chain the live buffer indexes with:
/// platform → kind → sensor type → time bucket.
pub fn default_live_chain(bucket_width_us: u64) -> Vec<Box<dyn KeyExtractor>> {
    vec![
        Box::new(PlatformExtractor),
        Box::new(KindExtractor),
        Box::new(SensorTypeExtractor),
        Box::new(TimestampExtractor::new(bucket_width_us)),
    ]
}

/// The chain the persisted store indexes with:
/// platform → kind → sensor type.
///
/// Storage partitions coarser than the live tree; the time dimension is
/// resolved by the external reader after descriptor retrieval.
pub fn default_storage_chain() -> Vec<Box<dyn KeyExtractor>> {
    vec![
        Box::new(PlatformExtractor),
        Box::new(KindExtractor),
        Box::new(SensorTypeExtractor),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use spanvault_core::{RecordPayload, TimerStats};

    fn record(timestamp: u64) -> TelemetryRecord {
        TelemetryRecord::new(1, 10, 20, timestamp, RecordPayload::Timer(TimerStats::single(5)))
    }

    #[test]
    fn test_platform_extractor() {
        let extractor = PlatformExtractor;
        assert_eq!(extractor.key(&record(0)), Some(IndexKey::Platform(10)));
        assert_eq!(
            extractor.keys(&RecordQuery::new().platform(10)),
            KeySelection::One(IndexKey::Platform(10))
        );
        assert_eq!(extractor.keys(&RecordQuery::new()), KeySelection::All);
    }

    #[test]
    fn test_method_extractor_requires_method() {
        let extractor = MethodExtractor;
        assert_eq!(extractor.key(&record(0)), None);
        assert_eq!(
            extractor.key(&record(0).with_method(7)),
            Some(IndexKey::Method(7))
        );
    }

    #[test]
    fn test_time_buckets_enumerated() {
        let extractor = TimestampExtractor::new(1_000);
        assert_eq!(extractor.key(&record(2_500)), Some(IndexKey::TimeBucket(2)));

        let keys = extractor.keys(&RecordQuery::new().time_range(1_000, 3_999));
        assert_eq!(
            keys,
            KeySelection::Many(vec![
                IndexKey::TimeBucket(1),
                IndexKey::TimeBucket(2),
                IndexKey::TimeBucket(3),
            ])
        );
    }

    #[test]
    fn test_time_range_inverted_matches_nothing() {
        let extractor = TimestampExtractor::new(1_000);
        assert_eq!(
            extractor.keys(&RecordQuery::new().time_range(5_000, 1_000)),
            KeySelection::Many(vec![])
        );
    }

    #[test]
    fn test_time_range_too_wide_falls_back_to_fan_out() {
        let extractor = TimestampExtractor::new(1);
        assert_eq!(
            extractor.keys(&RecordQuery::new().time_range(0, 1_000_000)),
            KeySelection::All
        );
    }

    #[test]
    fn test_sql_extractor_hashes_consistently() {
        let extractor = SqlStatementExtractor;
        let sql_record = TelemetryRecord::new(
            1,
            10,
            20,
            0,
            RecordPayload::Sql {
                statement: "SELECT 1".to_string(),
                parameters: vec![],
                stats: TimerStats::single(5),
            },
        );
        let from_record = extractor.key(&sql_record).unwrap();
        let from_query = match extractor.keys(&RecordQuery::new().sql("SELECT 1")) {
            KeySelection::One(key) => key,
            other => panic!("expected one key, got {other:?}"),
        };
        assert_eq!(from_record, from_query);
        assert_eq!(extractor.key(&record(0)), None);
    }
}
