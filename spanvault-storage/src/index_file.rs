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

//! The on-disk index file
//!
//! Holds the serialized persisted tree so a store can be reopened without
//! scanning the data files:
//!
//! ```text
//! [magic: u32 BE][version: u16 BE][body_len: u64 BE]
//! [body: bincode(TreeSnapshot)][crc32(body): u32 BE]
//! ```
//!
//! Wrong magic, an unknown version, or a checksum mismatch all reject the
//! file. A corrupt index must fail loudly, not deserialize into garbage.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use spanvault_index::TreeSnapshot;

use crate::error::WriteError;

/// Format identification marker of the index file ("SVXI").
const INDEX_MAGIC: u32 = 0x5356_5849;

/// Current index file format version.
const INDEX_VERSION: u16 = 1;

/// Write a tree snapshot to the index file at `path`, replacing any
/// previous one.
pub fn save_index<S: Serialize>(
    snapshot: &TreeSnapshot<S>,
    path: impl AsRef<Path>,
) -> Result<(), WriteError> {
    let body = bincode::serialize(snapshot)
        .map_err(|error| WriteError::Serialization(error.to_string()))?;

    let mut out = BufWriter::new(File::create(path)?);
    out.write_u32::<BigEndian>(INDEX_MAGIC)?;
    out.write_u16::<BigEndian>(INDEX_VERSION)?;
    out.write_u64::<BigEndian>(body.len() as u64)?;
    out.write_all(&body)?;
    out.write_u32::<BigEndian>(crc32fast::hash(&body))?;
    out.flush()?;
    Ok(())
}

/// Load a tree snapshot from the index file at `path`.
pub fn load_index<S: DeserializeOwned>(
    path: impl AsRef<Path>,
) -> Result<TreeSnapshot<S>, WriteError> {
    let mut input = BufReader::new(File::open(path)?);

    let magic = input.read_u32::<BigEndian>()?;
    if magic != INDEX_MAGIC {
        return Err(WriteError::IndexFile(format!(
            "bad magic {magic:08x}, expected {INDEX_MAGIC:08x}"
        )));
    }
    let version = input.read_u16::<BigEndian>()?;
    if version != INDEX_VERSION {
        return Err(WriteError::IndexFile(format!(
            "unsupported version {version}, expected {INDEX_VERSION}"
        )));
    }

    let body_len = input.read_u64::<BigEndian>()? as usize;
    let mut body = vec![0u8; body_len];
    input.read_exact(&mut body)?;

    let expected = input.read_u32::<BigEndian>()?;
    let actual = crc32fast::hash(&body);
    if expected != actual {
        return Err(WriteError::IndexFile(format!(
            "checksum mismatch: stored {expected:08x}, computed {actual:08x}"
        )));
    }

    bincode::deserialize(&body).map_err(|error| WriteError::IndexFile(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use spanvault_core::Descriptor;
    use spanvault_index::{ArrayLeafSnapshot, IndexKey};

    fn sample_snapshot() -> TreeSnapshot<ArrayLeafSnapshot> {
        TreeSnapshot {
            entries: vec![(
                vec![IndexKey::Platform(10), IndexKey::Sensor(20)],
                ArrayLeafSnapshot {
                    channel_id: 0,
                    entries: vec![(1, Descriptor::new(0, 0, 128))],
                },
            )],
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.svx");
        save_index(&sample_snapshot(), &path).unwrap();

        let loaded: TreeSnapshot<ArrayLeafSnapshot> = load_index(&path).unwrap();
        assert_eq!(loaded.entries.len(), 1);
        assert_eq!(loaded.entries[0].0, vec![IndexKey::Platform(10), IndexKey::Sensor(20)]);
        assert_eq!(
            loaded.entries[0].1.entries,
            vec![(1, Descriptor::new(0, 0, 128))]
        );
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.svx");
        std::fs::write(&path, b"not an index file at all").unwrap();

        match load_index::<ArrayLeafSnapshot>(&path) {
            Err(WriteError::IndexFile(message)) => assert!(message.contains("bad magic")),
            other => panic!("expected bad-magic rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_corrupted_body_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.svx");
        save_index(&sample_snapshot(), &path).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        match load_index::<ArrayLeafSnapshot>(&path) {
            Err(WriteError::IndexFile(message)) => {
                assert!(message.contains("checksum mismatch"))
            }
            other => panic!("expected checksum rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.svx");
        assert!(matches!(
            load_index::<ArrayLeafSnapshot>(&path),
            Err(WriteError::Io(_))
        ));
    }
}
