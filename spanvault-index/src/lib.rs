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

//! SpanVault Indexing Tree
//!
//! A generic N-level indexing tree keyed by an ordered chain of
//! key-extractors. The same tree serves the live buffer (records held by
//! reference) and the on-disk store (descriptor leaves), selected through
//! the [`Leaf`] strategy type parameter.

pub mod extractor;
pub mod key;
pub mod leaf;
pub mod tree;

pub use extractor::{
    default_live_chain, default_storage_chain, KeyExtractor, KindExtractor, MethodExtractor,
    PlatformExtractor, SensorTypeExtractor, SqlStatementExtractor, TimestampExtractor,
    DEFAULT_TIME_BUCKET_US,
};
pub use key::{IndexKey, KeySelection};
pub use leaf::{
    ArrayDescriptorLeaf, ArrayLeafSnapshot, ChannelAllocator, DescriptorLeafContext, DirectLeaf,
    Leaf, PersistentLeaf, RangeDescriptorLeaf, RangeLeafSnapshot, DEFAULT_MAX_RANGE_SIZE,
};
pub use tree::{IndexingTree, TreeSnapshot};
