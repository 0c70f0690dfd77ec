use anyhow::{Context, Result};
use std::collections::HashMap;
use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, Occur, Query, TermQuery};
use tantivy::schema::{
    self, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, Value as TantivyValue, STORED,
    STRING,
};
use tantivy::tokenizer::{RemoveLongFilter, TextAnalyzer, WhitespaceTokenizer};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};

use crate::processing::TextNormalizer;
use crate::types::{Passage, ScoredPassage};

/// Tokens are produced by [`TextNormalizer`] before indexing, so the index only
/// splits on whitespace.
const TOKENIZER_NAME: &str = "normalized";

struct Fields {
    id: schema::Field,
    text: schema::Field,
    terms: schema::Field,
    metadata: schema::Field,
}

/// Immutable in-RAM BM25 index over normalized chunks.
pub struct LexicalIndex {
    reader: IndexReader,
    fields: Fields,
    normalizer: TextNormalizer,
    k: usize,
    len: usize,
}

impl LexicalIndex {
    fn build_schema() -> (Schema, Fields) {
        let mut sb = Schema::builder();
        let indexing = TextFieldIndexing::default()
            .set_tokenizer(TOKENIZER_NAME)
            .set_index_option(IndexRecordOption::WithFreqsAndPositions);
        let id = sb.add_text_field("id", STRING | STORED);
        let text = sb.add_text_field("text", STORED);
        let terms = sb.add_text_field("terms", TextOptions::default().set_indexing_options(indexing));
        let metadata = sb.add_text_field("metadata_json", STORED);
        (
            sb.build(),
            Fields {
                id,
                text,
                terms,
                metadata,
            },
        )
    }

    /// Normalize and index every passage. `k` is the default result count.
    pub fn build(passages: &[Passage], normalizer: TextNormalizer, k: usize) -> Result<Self> {
        let (schema, fields) = Self::build_schema();
        let index = Index::create_in_ram(schema);
        index.tokenizers().register(
            TOKENIZER_NAME,
            TextAnalyzer::builder(WhitespaceTokenizer::default())
                .filter(RemoveLongFilter::limit(255))
                .build(),
        );

        let mut writer: IndexWriter = index
            .writer_with_num_threads(1, 20_000_000)
            .context("Failed to create Tantivy writer")?;

        for (i, passage) in passages.iter().enumerate() {
            let id = passage.id.clone().unwrap_or_else(|| i.to_string());
            let terms = normalizer.normalize(&passage.text).join(" ");
            let metadata = serde_json::to_string(&passage.metadata).context("Failed to serialize metadata")?;
            writer.add_document(doc!(
                fields.id => id,
                fields.text => passage.text.as_str(),
                fields.terms => terms,
                fields.metadata => metadata,
            ))?;
        }
        writer.commit().context("Tantivy commit failed")?;

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .context("Failed to create Tantivy reader")?;

        Ok(Self {
            reader,
            fields,
            normalizer,
            k,
            len: passages.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Top `k` passages for the query.
    pub fn search(&self, query: &str) -> Result<Vec<ScoredPassage>> {
        self.search_top(query, self.k)
    }

    pub fn search_top(&self, query: &str, k: usize) -> Result<Vec<ScoredPassage>> {
        let mut tokens = self.normalizer.normalize(query);
        tokens.sort();
        tokens.dedup();
        if tokens.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let clauses: Vec<(Occur, Box<dyn Query>)> = tokens
            .iter()
            .map(|token| {
                let term = Term::from_field_text(self.fields.terms, token);
                let query: Box<dyn Query> = Box::new(TermQuery::new(term, IndexRecordOption::WithFreqs));
                (Occur::Should, query)
            })
            .collect();
        let query = BooleanQuery::new(clauses);

        let searcher = self.reader.searcher();
        let top_docs = searcher.search(&query, &TopDocs::with_limit(k))?;

        let mut results = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let doc: TantivyDocument = searcher.doc(address)?;
            let text = doc
                .get_first(self.fields.text)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let id = doc
                .get_first(self.fields.id)
                .and_then(|v| v.as_str())
                .map(str::to_string);
            let metadata: HashMap<String, serde_json::Value> = doc
                .get_first(self.fields.metadata)
                .and_then(|v| v.as_str())
                .and_then(|m| serde_json::from_str(m).ok())
                .unwrap_or_default();

            results.push(ScoredPassage {
                passage: Passage { id, text, metadata },
                score,
            });
        }
        Ok(results)
    }
}
