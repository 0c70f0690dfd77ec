use anyhow::{anyhow, Context, Result};
use arrow_array::{Array, FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator, StringArray};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use lancedb::query::{ExecutableQuery, QueryBase};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use super::vector_store::VectorStore;
use crate::embeddings::EmbeddingModel;
use crate::types::{Passage, ScoredPassage};

/// Max ids per `IN (...)` predicate.
const ID_BATCH: usize = 50;

/// Vector store backed by one LanceDB table. The table is created on first
/// insert, once the embedding dimension is known.
pub struct LanceVectorStore {
    db: lancedb::Connection,
    table_name: String,
    embeddings: Arc<dyn EmbeddingModel>,
}

impl LanceVectorStore {
    pub async fn open(path: &Path, table_name: &str, embeddings: Arc<dyn EmbeddingModel>) -> Result<Self> {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create LanceDB dir {}", path.display()))?;
        let uri = path
            .to_str()
            .ok_or_else(|| anyhow!("LanceDB path is not valid UTF-8: {}", path.display()))?;
        let db = lancedb::connect(uri)
            .execute()
            .await
            .context("Failed to connect to LanceDB")?;

        Ok(Self {
            db,
            table_name: table_name.to_string(),
            embeddings,
        })
    }

    fn schema(dimension: usize) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("text", DataType::Utf8, false),
            Field::new("metadata_json", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    dimension as i32,
                ),
                true,
            ),
        ]))
    }

    async fn open_table(&self) -> Result<Option<lancedb::Table>> {
        let names = self.db.table_names().execute().await?;
        if !names.contains(&self.table_name) {
            return Ok(None);
        }
        let table = self
            .db
            .open_table(&self.table_name)
            .execute()
            .await
            .with_context(|| format!("Failed to open table {}", self.table_name))?;
        Ok(Some(table))
    }
}

fn id_predicates(ids: &[String]) -> Vec<String> {
    ids.chunks(ID_BATCH)
        .map(|chunk| {
            let id_list: Vec<String> = chunk
                .iter()
                .map(|id| format!("'{}'", id.replace('\'', "''")))
                .collect();
            format!("id IN ({})", id_list.join(", "))
        })
        .collect()
}

fn build_batch(passages: &[Passage], ids: &[String], vectors: Vec<Vec<f32>>) -> Result<RecordBatch> {
    let dimension = vectors.first().map(Vec::len).unwrap_or(0);
    if dimension == 0 || vectors.iter().any(|v| v.len() != dimension) {
        return Err(anyhow!("Embedding vectors are empty or have inconsistent dimensions"));
    }
    let schema = LanceVectorStore::schema(dimension);

    let texts: Vec<&str> = passages.iter().map(|p| p.text.as_str()).collect();
    let metadata_jsons: Vec<String> = passages
        .iter()
        .map(|p| serde_json::to_string(&p.metadata))
        .collect::<Result<_, _>>()
        .context("Failed to serialize passage metadata")?;

    let flat: Vec<f32> = vectors.into_iter().flatten().collect();
    let vector_array = FixedSizeListArray::new(
        Arc::new(Field::new("item", DataType::Float32, true)),
        dimension as i32,
        Arc::new(Float32Array::from(flat)) as Arc<dyn Array>,
        None,
    );

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(ids.to_vec())) as Arc<dyn Array>,
            Arc::new(StringArray::from(texts)),
            Arc::new(StringArray::from(metadata_jsons)),
            Arc::new(vector_array) as Arc<dyn Array>,
        ],
    )
    .context("Failed to create RecordBatch")
}

fn passages_from_batches(batches: &[RecordBatch]) -> Vec<(Passage, Option<f32>)> {
    let mut out = Vec::new();
    for batch in batches {
        let ids = batch.column_by_name("id").and_then(|c| c.as_any().downcast_ref::<StringArray>());
        let texts = batch.column_by_name("text").and_then(|c| c.as_any().downcast_ref::<StringArray>());
        let metadata = batch
            .column_by_name("metadata_json")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>());
        let distances = batch
            .column_by_name("_distance")
            .and_then(|c| c.as_any().downcast_ref::<Float32Array>());

        let (Some(ids), Some(texts)) = (ids, texts) else {
            continue;
        };

        for i in 0..batch.num_rows() {
            let metadata: HashMap<String, serde_json::Value> = metadata
                .and_then(|m| serde_json::from_str(m.value(i)).ok())
                .unwrap_or_default();
            let passage = Passage {
                id: Some(ids.value(i).to_string()),
                text: texts.value(i).to_string(),
                metadata,
            };
            out.push((passage, distances.map(|d| (1.0 - d.value(i)).max(0.0))));
        }
    }
    out
}

#[async_trait]
impl VectorStore for LanceVectorStore {
    async fn add_documents(&self, passages: Vec<Passage>, ids: Vec<String>) -> Result<Vec<String>> {
        if passages.len() != ids.len() {
            return Err(anyhow!("Got {} passages but {} ids", passages.len(), ids.len()));
        }
        if passages.is_empty() {
            return Ok(ids);
        }

        let texts: Vec<String> = passages.iter().map(|p| p.text.clone()).collect();
        let vectors = self.embeddings.embed_documents(&texts).await?;
        let batch = build_batch(&passages, &ids, vectors)?;
        let schema = batch.schema();
        let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);

        match self.open_table().await? {
            Some(table) => {
                table
                    .add(Box::new(reader))
                    .execute()
                    .await
                    .context("Failed to insert chunks")?;
            }
            None => {
                self.db
                    .create_table(&self.table_name, Box::new(reader))
                    .execute()
                    .await
                    .with_context(|| format!("Failed to create table {}", self.table_name))?;
            }
        }

        tracing::debug!(table = %self.table_name, count = ids.len(), "Inserted chunks into LanceDB");
        Ok(ids)
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        let Some(table) = self.open_table().await? else {
            return Ok(());
        };
        for predicate in id_predicates(ids) {
            table.delete(&predicate).await.context("LanceDB delete failed")?;
        }
        Ok(())
    }

    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Passage>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let Some(table) = self.open_table().await? else {
            return Ok(Vec::new());
        };

        let mut passages = Vec::new();
        for predicate in id_predicates(ids) {
            let results = table
                .query()
                .only_if(predicate)
                .execute()
                .await
                .context("LanceDB ID lookup failed")?;
            let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results).await?;
            passages.extend(passages_from_batches(&batches).into_iter().map(|(p, _)| p));
        }
        Ok(passages)
    }

    async fn similarity_search(&self, query: &str, k: usize) -> Result<Vec<ScoredPassage>> {
        let Some(table) = self.open_table().await? else {
            return Ok(Vec::new());
        };
        let vector = self.embeddings.embed_query(query).await?;

        let results = table
            .query()
            .nearest_to(vector.as_slice())?
            .distance_type(lancedb::DistanceType::Cosine)
            .limit(k)
            .execute()
            .await
            .context("LanceDB vector search failed")?;

        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results).await?;
        Ok(passages_from_batches(&batches)
            .into_iter()
            .map(|(passage, score)| ScoredPassage {
                passage,
                score: score.unwrap_or(0.0),
            })
            .collect())
    }

    fn embeddings(&self) -> Arc<dyn EmbeddingModel> {
        Arc::clone(&self.embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_predicates_batch_and_escape() {
        let ids: Vec<String> = (0..51).map(|i| format!("id{}", i)).collect();
        let predicates = id_predicates(&ids);
        assert_eq!(predicates.len(), 2);
        assert!(predicates[1].contains("'id50'"));

        let quoted = id_predicates(&["o'brien".to_string()]);
        assert_eq!(quoted[0], "id IN ('o''brien')");
    }

    #[test]
    fn test_build_batch_rejects_ragged_vectors() {
        let passages = vec![Passage::new("a"), Passage::new("b")];
        let ids = vec!["1".to_string(), "2".to_string()];
        assert!(build_batch(&passages, &ids, vec![vec![1.0, 0.0], vec![1.0]]).is_err());
        let batch = build_batch(&passages, &ids, vec![vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        assert_eq!(batch.num_rows(), 2);

        let round = passages_from_batches(&[batch]);
        assert_eq!(round[1].0.id.as_deref(), Some("2"));
        assert!(round[1].1.is_none());
    }
}
