//! LanceDB-backed vector collections.
//!
//! Each collection is one table keyed by deterministic chunk ids, plus a row
//! set in the shared `meta` table recording its manifest (bound embedding
//! and reranker model ids, dimension, normalization). The table is the
//! authoritative store for chunk text: the reranker reads passages from
//! here, not from the sparse index.

use std::sync::Arc;

use arrow_array::cast::AsArray;
use arrow_array::{
    FixedSizeListArray, Int32Array, RecordBatch, RecordBatchIterator, StringArray,
    TimestampMillisecondArray,
};
use chrono::Utc;
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{connect, Connection, DistanceType};
use tracing::{debug, info};

use rcpdb_core::error::{Error, Result};
use rcpdb_core::types::{Chunk, ChunkId, ChunkingMethod};

use crate::schema::{build_chunk_schema, build_meta_schema};

const META_TABLE: &str = "meta";

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionManifest {
    pub embedding_model: String,
    pub reranker_model: String,
    pub dim: usize,
    /// Whether stored vectors are L2-normalized (cosine over unit vectors).
    pub normalized: bool,
}

#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

pub struct VectorStore {
    conn: Connection,
}

impl VectorStore {
    pub async fn open(uri: &str) -> Result<Self> {
        let conn = connect(uri)
            .execute()
            .await
            .map_err(|e| Error::External(format!("lancedb connect: {}", e)))?;
        Ok(Self { conn })
    }

    /// Create the collection table on first use and pin its manifest. On an
    /// existing collection the manifest must match; a different embedding
    /// model or dimension is a configuration error, not a silent re-bind.
    pub async fn ensure_collection(
        &self,
        collection: &str,
        manifest: &CollectionManifest,
    ) -> Result<()> {
        match self.manifest(collection).await? {
            Some(existing) => {
                if existing != *manifest {
                    return Err(Error::Config(format!(
                        "collection '{}' is bound to model '{}' (dim {}), requested '{}' (dim {})",
                        collection,
                        existing.embedding_model,
                        existing.dim,
                        manifest.embedding_model,
                        manifest.dim
                    )));
                }
            }
            None => {
                let names = self.table_names().await?;
                if !names.contains(&collection.to_string()) {
                    let schema = build_chunk_schema(manifest.dim);
                    let iter = RecordBatchIterator::new(vec![].into_iter(), schema);
                    self.conn
                        .create_table(collection, Box::new(iter))
                        .execute()
                        .await
                        .map_err(|e| Error::External(format!("create table: {}", e)))?;
                }
                self.put_manifest(collection, manifest).await?;
                info!(
                    collection,
                    model = %manifest.embedding_model,
                    dim = manifest.dim,
                    "collection created"
                );
            }
        }
        Ok(())
    }

    /// The manifest bound to a collection, if the collection exists.
    pub async fn manifest(&self, collection: &str) -> Result<Option<CollectionManifest>> {
        let embedding_model = self.get_meta(&meta_key(collection, "embedding_model")).await?;
        let reranker_model = self.get_meta(&meta_key(collection, "reranker_model")).await?;
        let dim = self.get_meta(&meta_key(collection, "embedding_dim")).await?;
        let normalized = self.get_meta(&meta_key(collection, "normalized")).await?;
        match (embedding_model, reranker_model, dim, normalized) {
            (Some(embedding_model), Some(reranker_model), Some(dim), Some(normalized)) => {
                let dim = dim
                    .parse::<usize>()
                    .map_err(|_| Error::Internal(format!("bad dim in manifest: {}", dim)))?;
                Ok(Some(CollectionManifest {
                    embedding_model,
                    reranker_model,
                    dim,
                    normalized: normalized == "true",
                }))
            }
            _ => Ok(None),
        }
    }

    /// Manifest of an existing collection; `NotFound` otherwise.
    pub async fn require_manifest(&self, collection: &str) -> Result<CollectionManifest> {
        self.manifest(collection)
            .await?
            .ok_or_else(|| Error::NotFound(format!("collection '{}'", collection)))
    }

    /// Upsert chunk rows in bounded batches. Existing ids are overwritten,
    /// so replays after a crash converge instead of duplicating.
    pub async fn upsert_chunks(
        &self,
        collection: &str,
        chunks: &[Chunk],
        embeddings: &[Vec<f32>],
        batch_size: usize,
    ) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        if chunks.len() != embeddings.len() {
            return Err(Error::Internal(format!(
                "chunk/embedding count mismatch: {} vs {}",
                chunks.len(),
                embeddings.len()
            )));
        }
        let manifest = self.require_manifest(collection).await?;
        for vector in embeddings {
            if vector.len() != manifest.dim {
                return Err(Error::Config(format!(
                    "embedding dimension {} does not match collection '{}' (dim {})",
                    vector.len(),
                    collection,
                    manifest.dim
                )));
            }
        }

        let table = self.open_table(collection).await?;
        let batch_size = batch_size.max(1);
        for (chunk_window, embedding_window) in chunks
            .chunks(batch_size)
            .zip(embeddings.chunks(batch_size))
        {
            let record_batch = chunks_to_record_batch(chunk_window, embedding_window, manifest.dim)?;
            let schema = record_batch.schema();
            let reader = Box::new(RecordBatchIterator::new(
                vec![Ok(record_batch)].into_iter(),
                schema,
            ));
            let mut merge = table.merge_insert(&["id"]);
            merge.when_matched_update_all(None).when_not_matched_insert_all();
            merge
                .execute(reader)
                .await
                .map_err(|e| Error::External(format!("upsert: {}", e)))?;
        }
        debug!(collection, rows = chunks.len(), "upserted chunks");
        Ok(())
    }

    /// Nearest chunks by cosine similarity, best first.
    pub async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let manifest = self.require_manifest(collection).await?;
        if vector.len() != manifest.dim {
            return Err(Error::Config(format!(
                "query dimension {} does not match collection '{}' (dim {})",
                vector.len(),
                collection,
                manifest.dim
            )));
        }
        let table = self.open_table(collection).await?;
        let mut stream = table
            .vector_search(vector.to_vec())
            .map_err(|e| Error::External(format!("vector search: {}", e)))?
            .distance_type(DistanceType::Cosine)
            .limit(top_k)
            .execute()
            .await
            .map_err(|e| Error::External(format!("vector search: {}", e)))?;

        let mut out = Vec::new();
        while let Some(batch) = stream
            .try_next()
            .await
            .map_err(|e| Error::External(format!("vector search stream: {}", e)))?
        {
            let distances = batch
                .column_by_name("_distance")
                .and_then(|c| c.as_any().downcast_ref::<arrow_array::Float32Array>())
                .ok_or_else(|| Error::Internal("missing _distance column".into()))?
                .clone();
            for (i, chunk) in rows_to_chunks(&batch)?.into_iter().enumerate() {
                out.push(ScoredChunk {
                    chunk,
                    score: 1.0 - distances.value(i),
                });
            }
        }
        out.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        out.truncate(top_k);
        Ok(out)
    }

    /// Fetch chunk rows by id (order is not preserved).
    pub async fn get_by_ids(&self, collection: &str, ids: &[ChunkId]) -> Result<Vec<Chunk>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let table = self.open_table(collection).await?;
        let id_list = ids
            .iter()
            .map(|id| format!("'{}'", id.replace('\'', "''")))
            .collect::<Vec<_>>()
            .join(",");
        let mut stream = table
            .query()
            .only_if(format!("id IN ({})", id_list))
            .execute()
            .await
            .map_err(|e| Error::External(format!("id lookup: {}", e)))?;
        let mut out = Vec::new();
        while let Some(batch) = stream
            .try_next()
            .await
            .map_err(|e| Error::External(format!("id lookup stream: {}", e)))?
        {
            out.extend(rows_to_chunks(&batch)?);
        }
        Ok(out)
    }

    /// Resume check: has any chunk of this source document been indexed?
    pub async fn contains_source(&self, collection: &str, source_id: &str) -> Result<bool> {
        let table = self.open_table(collection).await?;
        let filter = format!("source_id = '{}'", source_id.replace('\'', "''"));
        let count = table
            .count_rows(Some(filter))
            .await
            .map_err(|e| Error::External(format!("source lookup: {}", e)))?;
        Ok(count > 0)
    }

    pub async fn count(&self, collection: &str) -> Result<usize> {
        let table = self.open_table(collection).await?;
        table
            .count_rows(None)
            .await
            .map_err(|e| Error::External(format!("count: {}", e)))
    }

    /// Collection names (the shared meta table is not a collection).
    pub async fn list_collections(&self) -> Result<Vec<String>> {
        Ok(self
            .table_names()
            .await?
            .into_iter()
            .filter(|name| name != META_TABLE)
            .collect())
    }

    pub async fn delete_collection(&self, collection: &str) -> Result<()> {
        let names = self.table_names().await?;
        if !names.contains(&collection.to_string()) {
            return Err(Error::NotFound(format!("collection '{}'", collection)));
        }
        self.conn
            .drop_table(collection)
            .await
            .map_err(|e| Error::External(format!("drop table: {}", e)))?;
        if names.contains(&META_TABLE.to_string()) {
            let meta = self.open_table(META_TABLE).await?;
            meta.delete(&format!("key LIKE '{}:%'", collection.replace('\'', "''")))
                .await
                .map_err(|e| Error::External(format!("manifest cleanup: {}", e)))?;
        }
        info!(collection, "collection deleted");
        Ok(())
    }

    async fn table_names(&self) -> Result<Vec<String>> {
        self.conn
            .table_names()
            .execute()
            .await
            .map_err(|e| Error::External(format!("table names: {}", e)))
    }

    async fn open_table(&self, name: &str) -> Result<lancedb::Table> {
        let names = self.table_names().await?;
        if !names.contains(&name.to_string()) {
            return Err(Error::NotFound(format!("collection '{}'", name)));
        }
        self.conn
            .open_table(name)
            .execute()
            .await
            .map_err(|e| Error::External(format!("open table: {}", e)))
    }

    async fn put_manifest(&self, collection: &str, manifest: &CollectionManifest) -> Result<()> {
        self.set_meta(&meta_key(collection, "embedding_model"), &manifest.embedding_model)
            .await?;
        self.set_meta(&meta_key(collection, "reranker_model"), &manifest.reranker_model)
            .await?;
        self.set_meta(&meta_key(collection, "embedding_dim"), &manifest.dim.to_string())
            .await?;
        self.set_meta(
            &meta_key(collection, "normalized"),
            if manifest.normalized { "true" } else { "false" },
        )
        .await
    }

    async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let names = self.table_names().await?;
        if !names.contains(&META_TABLE.to_string()) {
            let iter = RecordBatchIterator::new(vec![].into_iter(), build_meta_schema());
            self.conn
                .create_table(META_TABLE, Box::new(iter))
                .execute()
                .await
                .map_err(|e| Error::External(format!("create meta table: {}", e)))?;
        }
        let table = self.open_table(META_TABLE).await?;
        let batch = RecordBatch::try_new(
            build_meta_schema(),
            vec![
                Arc::new(StringArray::from(vec![key.to_string()])),
                Arc::new(StringArray::from(vec![value.to_string()])),
                Arc::new(TimestampMillisecondArray::from(vec![
                    Utc::now().timestamp_millis(),
                ])),
            ],
        )
        .map_err(|e| Error::Internal(format!("meta batch: {}", e)))?;
        let reader = Box::new(RecordBatchIterator::new(
            vec![Ok(batch)].into_iter(),
            build_meta_schema(),
        ));
        let mut merge = table.merge_insert(&["key"]);
        merge.when_matched_update_all(None).when_not_matched_insert_all();
        merge
            .execute(reader)
            .await
            .map_err(|e| Error::External(format!("meta upsert: {}", e)))?;
        Ok(())
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let names = self.table_names().await?;
        if !names.contains(&META_TABLE.to_string()) {
            return Ok(None);
        }
        let table = self.open_table(META_TABLE).await?;
        let mut stream = table
            .query()
            .only_if(format!("key = '{}'", key.replace('\'', "''")))
            .execute()
            .await
            .map_err(|e| Error::External(format!("meta lookup: {}", e)))?;
        while let Some(batch) = stream
            .try_next()
            .await
            .map_err(|e| Error::External(format!("meta stream: {}", e)))?
        {
            if batch.num_rows() == 0 {
                continue;
            }
            let values = str_column(&batch, "value")?;
            return Ok(Some(values.value(0).to_string()));
        }
        Ok(None)
    }
}

fn meta_key(collection: &str, field: &str) -> String {
    format!("{}:{}", collection, field)
}

fn chunks_to_record_batch(
    chunks: &[Chunk],
    embeddings: &[Vec<f32>],
    dim: usize,
) -> Result<RecordBatch> {
    let mut ids = Vec::with_capacity(chunks.len());
    let mut source_ids = Vec::with_capacity(chunks.len());
    let mut section_numbers = Vec::with_capacity(chunks.len());
    let mut section_titles = Vec::with_capacity(chunks.len());
    let mut chunk_indices = Vec::with_capacity(chunks.len());
    let mut methods = Vec::with_capacity(chunks.len());
    let mut texts = Vec::with_capacity(chunks.len());
    let mut vectors: Vec<Option<Vec<Option<f32>>>> = Vec::with_capacity(chunks.len());

    for (chunk, vector) in chunks.iter().zip(embeddings.iter()) {
        ids.push(chunk.chunk_id.clone());
        source_ids.push(chunk.source_id.clone());
        section_numbers.push(chunk.section_number.clone());
        section_titles.push(chunk.section_title.clone());
        chunk_indices.push(chunk.chunk_index as i32);
        methods.push(chunk.chunking_method.as_str().to_string());
        texts.push(chunk.text.clone());
        vectors.push(Some(vector.iter().map(|&x| Some(x)).collect()));
    }

    RecordBatch::try_new(
        build_chunk_schema(dim),
        vec![
            Arc::new(StringArray::from(ids)),
            Arc::new(StringArray::from(source_ids)),
            Arc::new(StringArray::from(section_numbers)),
            Arc::new(StringArray::from(section_titles)),
            Arc::new(Int32Array::from(chunk_indices)),
            Arc::new(StringArray::from(methods)),
            Arc::new(StringArray::from(texts)),
            Arc::new(FixedSizeListArray::from_iter_primitive::<
                arrow_array::types::Float32Type,
                _,
                _,
            >(vectors.into_iter(), dim as i32)),
        ],
    )
    .map_err(|e| Error::Internal(format!("record batch: {}", e)))
}

fn rows_to_chunks(batch: &RecordBatch) -> Result<Vec<Chunk>> {
    let ids = str_column(batch, "id")?;
    let source_ids = str_column(batch, "source_id")?;
    let section_numbers = str_column(batch, "section_number")?;
    let section_titles = str_column(batch, "section_title")?;
    let texts = str_column(batch, "text")?;
    let methods = str_column(batch, "chunking_method")?;
    let chunk_indices = batch
        .column_by_name("chunk_index")
        .and_then(|c| c.as_any().downcast_ref::<Int32Array>())
        .ok_or_else(|| Error::Internal("missing chunk_index column".into()))?;

    let mut out = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        out.push(Chunk {
            chunk_id: ids.value(i).to_string(),
            source_id: source_ids.value(i).to_string(),
            section_number: section_numbers.value(i).to_string(),
            section_title: section_titles.value(i).to_string(),
            chunk_index: chunk_indices.value(i) as usize,
            chunking_method: methods.value(i).parse::<ChunkingMethod>()?,
            text: texts.value(i).to_string(),
        });
    }
    Ok(out)
}

fn str_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .map(|c| c.as_string::<i32>())
        .ok_or_else(|| Error::Internal(format!("missing {} column", name)))
}
