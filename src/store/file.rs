//! File-backed document store.
//!
//! Layout: `<root>/<collection>/<id>.json`, each file holding the document
//! and its version. Writes go to a temp file and are renamed into place.

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use super::{DocumentStore, Result, StoreError, Stored};

/// On-disk envelope around a document.
#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u64,
    document: Value,
}

/// Document store keeping one JSON file per document.
///
/// All writes in a process are serialized through one lock, which makes the
/// version check and the write a single step for that process.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        debug!(root = %root.display(), "Opened file document store");

        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn collection_dir(&self, collection: &str) -> Result<PathBuf> {
        check_segment(collection)?;
        Ok(self.root.join(collection))
    }

    fn document_path(&self, collection: &str, id: &str) -> Result<PathBuf> {
        check_segment(id)?;
        Ok(self.collection_dir(collection)?.join(format!("{id}.json")))
    }

    async fn read(&self, collection: &str, id: &str) -> Result<Stored<Value>> {
        let path = self.document_path(collection, id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::not_found(collection, id));
            }
            Err(e) => return Err(e.into()),
        };

        let envelope: Envelope =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Malformed {
                collection: collection.to_string(),
                id: id.to_string(),
                source,
            })?;

        Ok(Stored {
            version: envelope.version,
            document: envelope.document,
        })
    }

    async fn write(&self, collection: &str, id: &str, envelope: &Envelope) -> Result<()> {
        let dir = self.collection_dir(collection)?;
        tokio::fs::create_dir_all(&dir).await?;

        let path = self.document_path(collection, id)?;
        let tmp = dir.join(format!(".{id}.json.tmp"));
        let bytes = serde_json::to_vec_pretty(envelope).map_err(|source| {
            StoreError::Malformed {
                collection: collection.to_string(),
                id: id.to_string(),
                source,
            }
        })?;

        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// Reject ids that would escape the collection directory.
fn check_segment(segment: &str) -> Result<()> {
    let valid = !segment.is_empty()
        && !segment.starts_with('.')
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');

    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidId(segment.to_string()))
    }
}

#[async_trait]
impl DocumentStore for FileStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Stored<Value>> {
        self.read(collection, id).await
    }

    async fn query(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Stored<Value>>> {
        let docs = self.list(collection).await?;
        Ok(docs
            .into_iter()
            .filter(|stored| stored.document.get(field) == Some(value))
            .collect())
    }

    async fn list(&self, collection: &str) -> Result<Vec<Stored<Value>>> {
        let dir = self.collection_dir(collection)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        ids.sort();

        let mut docs = Vec::with_capacity(ids.len());
        for id in ids {
            match self.read(collection, &id).await {
                Ok(stored) => docs.push(stored),
                // Deleted between listing and reading
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(docs)
    }

    async fn create(&self, collection: &str, id: &str, document: Value) -> Result<u64> {
        let _guard = self.write_lock.lock().await;

        match self.read(collection, id).await {
            Ok(_) => return Err(StoreError::conflict(collection, id)),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        self.write(
            collection,
            id,
            &Envelope {
                version: 1,
                document,
            },
        )
        .await?;
        Ok(1)
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        expected_version: u64,
        document: Value,
    ) -> Result<u64> {
        let _guard = self.write_lock.lock().await;

        let current = self.read(collection, id).await?;
        if current.version != expected_version {
            return Err(StoreError::conflict(collection, id));
        }

        let version = current.version + 1;
        self.write(collection, id, &Envelope { version, document })
            .await?;
        Ok(version)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let path = self.document_path(collection, id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::not_found(collection, id)),
            Err(e) => Err(e.into()),
        }
    }
}
