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

//! Index keys
//!
//! Keys are derived from record attributes by the extractor chain, never
//! stored on the record itself. One [`IndexKey`] variant exists per
//! indexable dimension.

use serde::{Deserialize, Serialize};
use spanvault_core::RecordKind;

/// A single-level key inside the indexing tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexKey {
    Platform(u64),
    Kind(RecordKind),
    Sensor(u64),
    Method(u64),
    /// Capture time divided by the extractor's bucket width.
    TimeBucket(u64),
    /// XxHash64 of the SQL statement text.
    Sql(u64),
}

/// The keys a query constrains at one tree level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySelection {
    /// Dimension unconstrained: fan out across every child.
    All,
    One(IndexKey),
    Many(Vec<IndexKey>),
}

impl KeySelection {
    /// Collapse a key list to the simplest selection.
    pub fn from_keys(mut keys: Vec<IndexKey>) -> Self {
        match keys.len() {
            1 => KeySelection::One(keys.remove(0)),
            _ => KeySelection::Many(keys),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_keys_collapses_single() {
        assert_eq!(
            KeySelection::from_keys(vec![IndexKey::Platform(1)]),
            KeySelection::One(IndexKey::Platform(1))
        );
        assert_eq!(
            KeySelection::from_keys(vec![]),
            KeySelection::Many(vec![])
        );
    }

    #[test]
    fn test_keys_distinguish_dimension() {
        // Same numeric value, different dimension: must not collide.
        assert_ne!(IndexKey::Platform(5), IndexKey::Sensor(5));
        assert_ne!(IndexKey::Method(5), IndexKey::TimeBucket(5));
    }
}
