use crate::index::CosineIndex;
use crate::journal::{Journal, JournalError};
use curio_core::model::Modality;
use rkyv::ser::{serializers::AllocSerializer, Serializer};
use rkyv::{Archive, Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

#[derive(Error, Debug)]
pub enum VectorError {
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),
    #[error("Serialization error")]
    Serialization,
    #[error("Deserialization error")]
    Deserialization,
    #[error("unknown collection: {0}")]
    UnknownCollection(String),
    #[error("dimensionality mismatch: collection expects {expected}, got {got}")]
    DimsMismatch { expected: u32, got: u32 },
    #[error("Conflict: {0}")]
    Conflict(String),
}

/// Payload mirrored from the registry onto each vector row. A strict subset
/// of the authoritative fields; the registry wins on conflict.
#[derive(
    Archive,
    Deserialize,
    Serialize,
    Debug,
    Clone,
    PartialEq,
    serde::Serialize,
    serde::Deserialize,
)]
#[archive(check_bytes)]
pub struct VectorPayload {
    pub container_id: String,
    pub document_id: String,
    pub modality: Modality,
    pub title: String,
    pub uri: String,
    pub ingested_at_ms: i64,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[archive(check_bytes)]
enum VectorLogEntry {
    CreateCollection {
        name: String,
        dims: u32,
    },
    DropCollection {
        name: String,
    },
    Upsert {
        collection: String,
        chunk_id: String,
        vector: Vec<f32>,
        payload: VectorPayload,
    },
    Delete {
        collection: String,
        chunk_id: String,
    },
    /// Shadow-refresh commit: the shadow collection atomically takes over the
    /// target name.
    Swap {
        shadow: String,
        target: String,
    },
}

struct Collection {
    dims: u32,
    index: CosineIndex,
    payloads: HashMap<String, VectorPayload>,
}

impl Collection {
    fn new(dims: u32) -> Self {
        Self {
            dims,
            index: CosineIndex::new(),
            payloads: HashMap::new(),
        }
    }
}

/// Container-scoped dense vector collections with idempotent, chunk-keyed
/// upserts. Durability is its own journal, separate from the registry, so a
/// crash between the two stores is healed by retrying the upsert.
pub struct VectorStore {
    journal: Mutex<Journal>,
    collections: RwLock<HashMap<String, Collection>>,
}

impl VectorStore {
    pub async fn open(journal_path: impl AsRef<Path>) -> Result<Self, VectorError> {
        let (journal, frames) = Journal::open(journal_path).await?;

        let mut collections: HashMap<String, Collection> = HashMap::new();
        for (_seq, data) in frames {
            let archived = rkyv::check_archived_root::<VectorLogEntry>(&data[..])
                .map_err(|_| VectorError::Deserialization)?;
            let entry: VectorLogEntry = archived
                .deserialize(&mut rkyv::Infallible)
                .map_err(|_| VectorError::Deserialization)?;
            apply_entry(&mut collections, entry);
        }

        Ok(Self {
            journal: Mutex::new(journal),
            collections: RwLock::new(collections),
        })
    }

    async fn log(&self, entry: &VectorLogEntry) -> Result<(), VectorError> {
        let mut serializer = AllocSerializer::<1024>::default();
        serializer
            .serialize_value(entry)
            .map_err(|_| VectorError::Serialization)?;
        let bytes = serializer.into_serializer().into_inner();

        let mut journal = self.journal.lock().await;
        journal.append(&bytes).await?;
        journal.commit().await?;
        Ok(())
    }

    /// Idempotent: re-creating with identical dims is a no-op; different dims
    /// is a conflict because embedder dims are immutable on a live
    /// collection.
    pub async fn create_collection(&self, name: &str, dims: u32) -> Result<(), VectorError> {
        let mut collections = self.collections.write().await;
        if let Some(existing) = collections.get(name) {
            if existing.dims == dims {
                return Ok(());
            }
            return Err(VectorError::Conflict(format!(
                "collection {} exists with dims {}",
                name, existing.dims
            )));
        }

        self.log(&VectorLogEntry::CreateCollection {
            name: name.to_string(),
            dims,
        })
        .await?;
        collections.insert(name.to_string(), Collection::new(dims));
        Ok(())
    }

    pub async fn drop_collection(&self, name: &str) -> Result<(), VectorError> {
        let mut collections = self.collections.write().await;
        if !collections.contains_key(name) {
            return Ok(());
        }
        self.log(&VectorLogEntry::DropCollection {
            name: name.to_string(),
        })
        .await?;
        collections.remove(name);
        Ok(())
    }

    pub async fn collection_exists(&self, name: &str) -> bool {
        self.collections.read().await.contains_key(name)
    }

    pub async fn collection_dims(&self, name: &str) -> Option<u32> {
        self.collections.read().await.get(name).map(|c| c.dims)
    }

    /// Keyed by chunk id, so crash-restart re-upserts are safe.
    pub async fn upsert(
        &self,
        collection: &str,
        chunk_id: &str,
        vector: Vec<f32>,
        payload: VectorPayload,
    ) -> Result<(), VectorError> {
        let mut collections = self.collections.write().await;
        let col = collections
            .get_mut(collection)
            .ok_or_else(|| VectorError::UnknownCollection(collection.to_string()))?;
        if vector.len() as u32 != col.dims {
            return Err(VectorError::DimsMismatch {
                expected: col.dims,
                got: vector.len() as u32,
            });
        }

        self.log(&VectorLogEntry::Upsert {
            collection: collection.to_string(),
            chunk_id: chunk_id.to_string(),
            vector: vector.clone(),
            payload: payload.clone(),
        })
        .await?;

        col.index.insert(chunk_id, vector);
        col.payloads.insert(chunk_id.to_string(), payload);
        Ok(())
    }

    pub async fn delete(&self, collection: &str, chunk_id: &str) -> Result<(), VectorError> {
        let mut collections = self.collections.write().await;
        let Some(col) = collections.get_mut(collection) else {
            return Ok(());
        };
        if col.index.get(chunk_id).is_none() {
            return Ok(());
        }

        self.log(&VectorLogEntry::Delete {
            collection: collection.to_string(),
            chunk_id: chunk_id.to_string(),
        })
        .await?;

        col.index.delete(chunk_id);
        col.payloads.remove(chunk_id);
        Ok(())
    }

    pub async fn get(
        &self,
        collection: &str,
        chunk_id: &str,
    ) -> Option<(Vec<f32>, VectorPayload)> {
        let collections = self.collections.read().await;
        let col = collections.get(collection)?;
        let vector = col.index.get(chunk_id)?.clone();
        let payload = col.payloads.get(chunk_id)?.clone();
        Some((vector, payload))
    }

    pub async fn search(
        &self,
        collection: &str,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<(String, f32)>, VectorError> {
        let collections = self.collections.read().await;
        let col = collections
            .get(collection)
            .ok_or_else(|| VectorError::UnknownCollection(collection.to_string()))?;
        Ok(col.index.search(query, k))
    }

    pub async fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map(|c| c.index.len())
            .unwrap_or(0)
    }

    pub async fn count_for_document(&self, collection: &str, document_id: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map(|c| {
                c.payloads
                    .values()
                    .filter(|p| p.document_id == document_id)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Copy one row onto a new chunk id; used when a canonical chunk is
    /// deleted and a deduped peer takes over its vector.
    pub async fn reassign(
        &self,
        collection: &str,
        from_chunk: &str,
        to_chunk: &str,
    ) -> Result<bool, VectorError> {
        let moved = {
            let collections = self.collections.read().await;
            let Some(col) = collections.get(collection) else {
                return Ok(false);
            };
            match (col.index.get(from_chunk), col.payloads.get(from_chunk)) {
                (Some(vector), Some(payload)) => Some((vector.clone(), payload.clone())),
                _ => None,
            }
        };

        let Some((vector, payload)) = moved else {
            return Ok(false);
        };
        self.upsert(collection, to_chunk, vector, payload).await?;
        self.delete(collection, from_chunk).await?;
        Ok(true)
    }

    pub async fn swap_collections(&self, shadow: &str, target: &str) -> Result<(), VectorError> {
        let mut collections = self.collections.write().await;
        if !collections.contains_key(shadow) {
            return Err(VectorError::UnknownCollection(shadow.to_string()));
        }

        self.log(&VectorLogEntry::Swap {
            shadow: shadow.to_string(),
            target: target.to_string(),
        })
        .await?;

        if let Some(col) = collections.remove(shadow) {
            collections.insert(target.to_string(), col);
        }
        Ok(())
    }

    /// Full row dump for export packaging.
    pub async fn rows(&self, collection: &str) -> Vec<(String, Vec<f32>, VectorPayload)> {
        let collections = self.collections.read().await;
        let Some(col) = collections.get(collection) else {
            return Vec::new();
        };
        let mut out: Vec<(String, Vec<f32>, VectorPayload)> = col
            .payloads
            .iter()
            .filter_map(|(chunk_id, payload)| {
                col.index
                    .get(chunk_id)
                    .map(|vector| (chunk_id.clone(), vector.clone(), payload.clone()))
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub async fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

fn apply_entry(collections: &mut HashMap<String, Collection>, entry: VectorLogEntry) {
    match entry {
        VectorLogEntry::CreateCollection { name, dims } => {
            collections.entry(name).or_insert_with(|| Collection::new(dims));
        }
        VectorLogEntry::DropCollection { name } => {
            collections.remove(&name);
        }
        VectorLogEntry::Upsert {
            collection,
            chunk_id,
            vector,
            payload,
        } => {
            if let Some(col) = collections.get_mut(&collection) {
                col.index.insert(chunk_id.clone(), vector);
                col.payloads.insert(chunk_id, payload);
            }
        }
        VectorLogEntry::Delete {
            collection,
            chunk_id,
        } => {
            if let Some(col) = collections.get_mut(&collection) {
                col.index.delete(&chunk_id);
                col.payloads.remove(&chunk_id);
            }
        }
        VectorLogEntry::Swap { shadow, target } => {
            if let Some(col) = collections.remove(&shadow) {
                collections.insert(target, col);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn payload(doc: &str) -> VectorPayload {
        VectorPayload {
            container_id: "ct_1".to_string(),
            document_id: doc.to_string(),
            modality: Modality::Text,
            title: "t".to_string(),
            uri: "inline://t".to_string(),
            ingested_at_ms: 0,
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_by_chunk_id() {
        let dir = tempdir().unwrap();
        let store = VectorStore::open(dir.path().join("vector.journal")).await.unwrap();
        store.create_collection("c_ct_1", 2).await.unwrap();

        store
            .upsert("c_ct_1", "ch_1", vec![1.0, 0.0], payload("doc_1"))
            .await
            .unwrap();
        store
            .upsert("c_ct_1", "ch_1", vec![1.0, 0.0], payload("doc_1"))
            .await
            .unwrap();

        assert_eq!(store.count("c_ct_1").await, 1);
    }

    #[tokio::test]
    async fn create_collection_conflicts_on_dims_change() {
        let dir = tempdir().unwrap();
        let store = VectorStore::open(dir.path().join("vector.journal")).await.unwrap();
        store.create_collection("c_ct_1", 4).await.unwrap();
        store.create_collection("c_ct_1", 4).await.unwrap();

        let err = store.create_collection("c_ct_1", 8).await.unwrap_err();
        assert!(matches!(err, VectorError::Conflict(_)));
    }

    #[tokio::test]
    async fn dims_mismatch_is_rejected() {
        let dir = tempdir().unwrap();
        let store = VectorStore::open(dir.path().join("vector.journal")).await.unwrap();
        store.create_collection("c_ct_1", 2).await.unwrap();

        let err = store
            .upsert("c_ct_1", "ch_1", vec![1.0, 0.0, 0.0], payload("doc_1"))
            .await
            .unwrap_err();
        assert!(matches!(err, VectorError::DimsMismatch { .. }));
    }

    #[tokio::test]
    async fn rows_survive_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vector.journal");

        {
            let store = VectorStore::open(&path).await.unwrap();
            store.create_collection("c_ct_1", 2).await.unwrap();
            store
                .upsert("c_ct_1", "ch_1", vec![1.0, 0.0], payload("doc_1"))
                .await
                .unwrap();
        }

        let store = VectorStore::open(&path).await.unwrap();
        let hits = store.search("c_ct_1", &[1.0, 0.0], 1).await.unwrap();
        assert_eq!(hits[0].0, "ch_1");
    }

    #[tokio::test]
    async fn swap_replaces_target_collection() {
        let dir = tempdir().unwrap();
        let store = VectorStore::open(dir.path().join("vector.journal")).await.unwrap();
        store.create_collection("c_ct_1", 2).await.unwrap();
        store.create_collection("c_ct_1__shadow", 4).await.unwrap();
        store
            .upsert(
                "c_ct_1__shadow",
                "ch_1",
                vec![1.0, 0.0, 0.0, 0.0],
                payload("doc_1"),
            )
            .await
            .unwrap();

        store.swap_collections("c_ct_1__shadow", "c_ct_1").await.unwrap();

        assert!(!store.collection_exists("c_ct_1__shadow").await);
        assert_eq!(store.collection_dims("c_ct_1").await, Some(4));
        assert_eq!(store.count("c_ct_1").await, 1);
    }

    #[tokio::test]
    async fn reassign_moves_vector_between_chunk_ids() {
        let dir = tempdir().unwrap();
        let store = VectorStore::open(dir.path().join("vector.journal")).await.unwrap();
        store.create_collection("c_ct_1", 2).await.unwrap();
        store
            .upsert("c_ct_1", "ch_old", vec![0.5, 0.5], payload("doc_1"))
            .await
            .unwrap();

        assert!(store.reassign("c_ct_1", "ch_old", "ch_new").await.unwrap());
        assert!(store.get("c_ct_1", "ch_old").await.is_none());
        assert!(store.get("c_ct_1", "ch_new").await.is_some());
    }
}
