//! Volume catalog: records which cartridge holds each chunk of each
//! archive. Backed by an embedded ordered key-value store (`sled`) with one
//! tree per archive, so `iterate` can walk chunks in id order without a
//! secondary index.

use std::path::Path;
use std::sync::Arc;

use sled::{Db, Transactional};

use crate::error::StorageError;

const REGISTRY_TREE: &str = "_archives";

fn tree_name(archive: &str) -> String {
    format!("archive:{archive}")
}

fn chunk_key(chunk_id: u64) -> [u8; 8] {
    chunk_id.to_be_bytes()
}

#[derive(Clone)]
pub struct Catalog {
    db: Db,
}

impl Catalog {
    pub fn open(path: &Path) -> Result<Catalog, StorageError> {
        let db = sled::open(path).map_err(|err| StorageError::Catalog(err.to_string()))?;
        Ok(Catalog { db })
    }

    /// Register a brand new archive. Fails if an archive with this name has
    /// already been created (even if it has since been fully retrieved).
    pub fn create(&self, archive: &str) -> Result<(), StorageError> {
        let registry = self
            .db
            .open_tree(REGISTRY_TREE)
            .map_err(|err| StorageError::Catalog(err.to_string()))?;

        let inserted = registry
            .compare_and_swap(archive.as_bytes(), None as Option<&[u8]>, Some(b"1".as_slice()))
            .map_err(|err| StorageError::Catalog(err.to_string()))?;

        if inserted.is_err() {
            return Err(StorageError::Catalog(format!(
                "archive '{archive}' already exists"
            )));
        }

        // Touching the tree up front makes `iterate` on a freshly created,
        // still-empty archive return an empty sequence rather than an error.
        self.db
            .open_tree(tree_name(archive))
            .map_err(|err| StorageError::Catalog(err.to_string()))?;

        Ok(())
    }

    /// Record that `chunk_id` of `archive` landed on cartridge `serial`.
    /// Atomic with respect to other appends to the same archive.
    pub fn append(&self, archive: &str, chunk_id: u64, serial: &str) -> Result<(), StorageError> {
        let tree = self
            .db
            .open_tree(tree_name(archive))
            .map_err(|err| StorageError::Catalog(err.to_string()))?;

        let registry = self
            .db
            .open_tree(REGISTRY_TREE)
            .map_err(|err| StorageError::Catalog(err.to_string()))?;

        (&tree, &registry)
            .transaction(|(tree, _registry)| {
                tree.insert(&chunk_key(chunk_id)[..], serial.as_bytes())?;
                Ok(())
            })
            .map_err(|err: sled::transaction::TransactionError<()>| {
                StorageError::Catalog(err.to_string())
            })?;

        Ok(())
    }

    /// All `(chunk_id, serial)` pairs for `archive`, in ascending chunk-id
    /// order, as of the moment this call started (sled's default isolation
    /// already gives snapshot reads for a single-tree scan).
    pub fn iterate(&self, archive: &str) -> Result<Vec<(u64, String)>, StorageError> {
        let tree = self
            .db
            .open_tree(tree_name(archive))
            .map_err(|err| StorageError::Catalog(err.to_string()))?;

        let mut out = Vec::new();
        for entry in tree.iter() {
            let (key, value) = entry.map_err(|err| StorageError::Catalog(err.to_string()))?;
            let id = u64::from_be_bytes(key.as_ref().try_into().map_err(|_| {
                StorageError::Catalog("corrupt catalog key (not 8 bytes)".to_string())
            })?);
            let serial = String::from_utf8(value.to_vec())
                .map_err(|_| StorageError::Catalog("corrupt catalog value (not utf8)".to_string()))?;
            out.push((id, serial));
        }
        Ok(out)
    }
}

/// Wraps a [`Catalog`] in an `Arc` for components that need a cheaply
/// cloneable handle (e.g. per-drive writers).
pub type SharedCatalog = Arc<Catalog>;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_then_append_then_iterate_round_trip() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();

        catalog.create("myarchive").unwrap();
        catalog.append("myarchive", 0, "VOL001").unwrap();
        catalog.append("myarchive", 1, "VOL001").unwrap();
        catalog.append("myarchive", 2, "VOL002").unwrap();

        let entries = catalog.iterate("myarchive").unwrap();
        assert_eq!(
            entries,
            vec![
                (0, "VOL001".to_string()),
                (1, "VOL001".to_string()),
                (2, "VOL002".to_string()),
            ]
        );
    }

    #[test]
    fn create_twice_fails() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        catalog.create("dup").unwrap();
        assert!(catalog.create("dup").is_err());
    }

    #[test]
    fn iterate_unknown_archive_is_empty() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        assert_eq!(catalog.iterate("never-created").unwrap(), Vec::new());
    }
}
