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

//! The indexing tree
//!
//! An N-level tree shaped by an ordered extractor chain. Every level below
//! the last is a branch; the last level holds leaves of the configured
//! strategy. Branch children live in sharded concurrent maps, so puts and
//! queries on unrelated keys never contend.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use spanvault_core::{RecordQuery, Result, TelemetryRecord, VaultError};
use tracing::debug;

use crate::extractor::KeyExtractor;
use crate::key::{IndexKey, KeySelection};
use crate::leaf::{Leaf, PersistentLeaf};

/// Rough fixed cost of a branch and its children map.
const BRANCH_BASE_SIZE: u64 = 128;

/// Rough heap cost of one child entry in a branch.
const CHILD_ENTRY_OVERHEAD: u64 = 56;

enum Node<L> {
    Branch(Branch<L>),
    Leaf(L),
}

struct Branch<L> {
    children: DashMap<IndexKey, Arc<Node<L>>>,
}

impl<L> Branch<L> {
    fn new() -> Self {
        Self {
            children: DashMap::new(),
        }
    }
}

/// Generic N-level indexing tree.
///
/// The extractor chain is fixed at construction; its length is the tree
/// depth. `L` selects the leaf strategy (direct references for the live
/// buffer, descriptor leaves for storage).
pub struct IndexingTree<L: Leaf> {
    extractors: Vec<Box<dyn KeyExtractor>>,
    context: L::Context,
    root: Branch<L>,
}

impl<L: Leaf> IndexingTree<L> {
    /// Build a tree with the strategy's default context.
    ///
    /// The chain must not be empty: a zero-level tree has nowhere to hang
    /// leaves.
    pub fn new(extractors: Vec<Box<dyn KeyExtractor>>) -> Result<Self> {
        Self::with_context(extractors, L::Context::default())
    }

    pub fn with_context(
        extractors: Vec<Box<dyn KeyExtractor>>,
        context: L::Context,
    ) -> Result<Self> {
        if extractors.is_empty() {
            return Err(VaultError::InvalidConfig(
                "indexing tree needs at least one key extractor".to_string(),
            ));
        }
        Ok(Self {
            extractors,
            context,
            root: Branch::new(),
        })
    }

    /// Tree depth, the length of the extractor chain.
    pub fn depth(&self) -> usize {
        self.extractors.len()
    }

    pub fn context(&self) -> &L::Context {
        &self.context
    }

    /// Derive the full key path of a record, failing on the first level
    /// whose extractor yields nothing.
    fn key_path(&self, record: &TelemetryRecord) -> Result<Vec<IndexKey>> {
        self.extractors
            .iter()
            .enumerate()
            .map(|(level, extractor)| {
                extractor
                    .key(record)
                    .ok_or(VaultError::KeyUnavailable { level })
            })
            .collect()
    }

    /// Insert a record, creating branches and the leaf as needed, and
    /// return the leaf's handle (a write reservation for descriptor
    /// leaves).
    pub fn put(&self, record: &Arc<TelemetryRecord>) -> Result<L::Handle> {
        let path = self.key_path(record)?;
        let last = path.len() - 1;

        let mut current: Option<Arc<Node<L>>> = None;
        for (level, key) in path.into_iter().enumerate() {
            let children = match current.as_deref() {
                None => &self.root.children,
                Some(Node::Branch(branch)) => &branch.children,
                // Levels beyond the chain length do not exist.
                Some(Node::Leaf(_)) => unreachable!("leaf above the last tree level"),
            };
            let child = children
                .entry(key)
                .or_insert_with(|| {
                    if level == last {
                        Arc::new(Node::Leaf(L::new(&self.context)))
                    } else {
                        Arc::new(Node::Branch(Branch::new()))
                    }
                })
                .clone();
            current = Some(child);
        }

        match current.as_deref() {
            Some(Node::Leaf(leaf)) => leaf.put(record),
            _ => unreachable!("put always terminates at a leaf"),
        }
    }

    /// Locate the leaf a record belongs to, without creating anything.
    fn find_leaf(&self, record: &TelemetryRecord) -> Option<Arc<Node<L>>> {
        let path = self.key_path(record).ok()?;

        let mut current: Option<Arc<Node<L>>> = None;
        for key in path {
            let children = match current.as_deref() {
                None => &self.root.children,
                Some(Node::Branch(branch)) => &branch.children,
                Some(Node::Leaf(_)) => return None,
            };
            let next = children.get(&key)?.clone();
            current = Some(next);
        }
        current
    }

    /// Exact lookup of the stored representation of `record`.
    pub fn get(&self, record: &TelemetryRecord) -> Option<L::Element> {
        match self.find_leaf(record).as_deref() {
            Some(Node::Leaf(leaf)) => leaf.get(record),
            _ => None,
        }
    }

    /// Exact removal, used by dedup checks and buffer eviction. The leaf
    /// stays in place even when emptied; `clean` prunes it later.
    pub fn get_and_remove(&self, record: &TelemetryRecord) -> Option<L::Element> {
        match self.find_leaf(record).as_deref() {
            Some(Node::Leaf(leaf)) => leaf.remove(record),
            _ => None,
        }
    }

    /// Run a query: descend constrained dimensions, fan out across
    /// unconstrained ones, filter at the leaves. Sibling subtrees never
    /// overlap, so results concatenate without deduplication.
    pub fn query(&self, query: &RecordQuery) -> Vec<L::Element> {
        let mut out = Vec::new();
        self.query_branch(&self.root, 0, query, &mut out);
        out
    }

    fn query_branch(
        &self,
        branch: &Branch<L>,
        level: usize,
        query: &RecordQuery,
        out: &mut Vec<L::Element>,
    ) {
        match self.extractors[level].keys(query) {
            KeySelection::All => {
                for entry in branch.children.iter() {
                    self.query_node(entry.value(), level, query, out);
                }
            }
            KeySelection::One(key) => {
                if let Some(node) = branch.children.get(&key) {
                    self.query_node(node.value(), level, query, out);
                }
            }
            KeySelection::Many(keys) => {
                for key in keys {
                    if let Some(node) = branch.children.get(&key) {
                        self.query_node(node.value(), level, query, out);
                    }
                }
            }
        }
    }

    fn query_node(
        &self,
        node: &Arc<Node<L>>,
        level: usize,
        query: &RecordQuery,
        out: &mut Vec<L::Element>,
    ) {
        match node.as_ref() {
            Node::Branch(child) => self.query_branch(child, level + 1, query, out),
            Node::Leaf(leaf) => leaf.query(query, out),
        }
    }

    /// Total number of stored entries across all leaves.
    pub fn record_count(&self) -> usize {
        Self::count_branch(&self.root)
    }

    fn count_branch(branch: &Branch<L>) -> usize {
        branch
            .children
            .iter()
            .map(|entry| match entry.value().as_ref() {
                Node::Branch(child) => Self::count_branch(child),
                Node::Leaf(leaf) => leaf.len(),
            })
            .sum()
    }

    /// Estimated heap footprint of the tree structure itself, excluding
    /// record payloads. The buffer folds this into its own size accounting
    /// so the index cost is not invisible.
    pub fn component_size(&self) -> u64 {
        Self::size_branch(&self.root)
    }

    fn size_branch(branch: &Branch<L>) -> u64 {
        let mut size = BRANCH_BASE_SIZE;
        for entry in branch.children.iter() {
            size += CHILD_ENTRY_OVERHEAD;
            size += match entry.value().as_ref() {
                Node::Branch(child) => Self::size_branch(child),
                Node::Leaf(leaf) => leaf.byte_size(),
            };
        }
        size
    }

    /// Prune empty leaves and dangling branches.
    pub fn clean(&self) {
        Self::clean_branch(&self.root);
    }

    fn clean_branch(branch: &Branch<L>) {
        branch.children.retain(|_, node| match node.as_ref() {
            Node::Branch(child) => {
                Self::clean_branch(child);
                !child.children.is_empty()
            }
            Node::Leaf(leaf) => !leaf.is_empty(),
        });
    }

    /// Prune with a bounded number of worker threads, one top-level subtree
    /// set per worker. Used by buffer maintenance on large trees.
    pub fn clean_parallel(&self, threads: usize) {
        let subtrees: Vec<Arc<Node<L>>> = self
            .root
            .children
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        if subtrees.is_empty() {
            return;
        }

        let threads = threads.clamp(1, subtrees.len());
        debug!(subtrees = subtrees.len(), threads, "tree cleanup pass");
        let chunk_size = subtrees.len().div_ceil(threads);
        std::thread::scope(|scope| {
            for chunk in subtrees.chunks(chunk_size) {
                scope.spawn(move || {
                    for node in chunk {
                        if let Node::Branch(child) = node.as_ref() {
                            Self::clean_branch(child);
                        }
                    }
                });
            }
        });

        self.root.children.retain(|_, node| match node.as_ref() {
            Node::Branch(child) => !child.children.is_empty(),
            Node::Leaf(leaf) => !leaf.is_empty(),
        });
    }
}

/// Serialized shape of a tree: one entry per leaf, keyed by its full path.
#[derive(Debug, Serialize, Deserialize)]
pub struct TreeSnapshot<S> {
    pub entries: Vec<(Vec<IndexKey>, S)>,
}

impl<L: PersistentLeaf> IndexingTree<L> {
    /// Capture every leaf with its key path for the on-disk index file.
    pub fn snapshot(&self) -> TreeSnapshot<L::Snapshot> {
        let mut entries = Vec::new();
        let mut path = Vec::with_capacity(self.depth());
        Self::snapshot_branch(&self.root, &mut path, &mut entries);
        TreeSnapshot { entries }
    }

    fn snapshot_branch(
        branch: &Branch<L>,
        path: &mut Vec<IndexKey>,
        entries: &mut Vec<(Vec<IndexKey>, L::Snapshot)>,
    ) {
        for entry in branch.children.iter() {
            path.push(*entry.key());
            match entry.value().as_ref() {
                Node::Branch(child) => Self::snapshot_branch(child, path, entries),
                Node::Leaf(leaf) => entries.push((path.clone(), leaf.snapshot())),
            }
            path.pop();
        }
    }

    /// Rebuild a tree from a snapshot, inserting leaves directly by key
    /// path. Paths must match the extractor chain's depth.
    pub fn restore(
        extractors: Vec<Box<dyn KeyExtractor>>,
        context: L::Context,
        snapshot: TreeSnapshot<L::Snapshot>,
    ) -> Result<Self> {
        let tree = Self::with_context(extractors, context)?;
        for (path, leaf_snapshot) in snapshot.entries {
            if path.len() != tree.depth() {
                return Err(VaultError::InvalidConfig(format!(
                    "snapshot path depth {} does not match tree depth {}",
                    path.len(),
                    tree.depth()
                )));
            }
            tree.insert_leaf(&path, L::restore(&tree.context, leaf_snapshot))?;
        }
        Ok(tree)
    }

    fn insert_leaf(&self, path: &[IndexKey], leaf: L) -> Result<()> {
        let last = path.len() - 1;
        let mut current: Option<Arc<Node<L>>> = None;
        for (level, key) in path.iter().enumerate() {
            let children = match current.as_deref() {
                None => &self.root.children,
                Some(Node::Branch(branch)) => &branch.children,
                Some(Node::Leaf(_)) => {
                    return Err(VaultError::InvalidConfig(
                        "snapshot contains conflicting leaf paths".to_string(),
                    ))
                }
            };
            if level == last {
                match children.entry(*key) {
                    dashmap::mapref::entry::Entry::Occupied(_) => {
                        return Err(VaultError::InvalidConfig(
                            "snapshot contains duplicate leaf paths".to_string(),
                        ))
                    }
                    dashmap::mapref::entry::Entry::Vacant(vacant) => {
                        vacant.insert(Arc::new(Node::Leaf(leaf)));
                        return Ok(());
                    }
                }
            }
            let child = children
                .entry(*key)
                .or_insert_with(|| Arc::new(Node::Branch(Branch::new())))
                .clone();
            current = Some(child);
        }
        unreachable!("insert_leaf returns from the last level")
    }
}
