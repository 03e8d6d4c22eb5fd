//! A full-text index kept in lockstep with the MVCC store, grounded on the
//! original Python `KatamariSearch` (a Whoosh schema/index pair) but built
//! on `tantivy`, the ecosystem's embedded full-text engine, since the
//! teacher workspace carries no search dependency of its own.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{Field, INDEXED, OwnedValue, Schema, SchemaBuilder, FAST, STORED, STRING, TEXT};
use tantivy::{doc, Index, IndexReader, IndexWriter, TantivyDocument};

use crate::error::{CResult, Error};

/// The declared type of a schema field, mirroring the field kinds the
/// original search schema recognised.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SchemaFieldKind {
    Text,
    Keyword,
    DateTime,
    Numeric,
    Boolean,
    Id,
}

/// A document to index, keyed by field name. The id field (named by
/// whichever schema entry is `SchemaFieldKind::Id`) and the `version`
/// must be present; `timestamp` defaults to "now" if absent.
#[derive(Clone, Debug)]
pub struct IndexDocument {
    pub fields: HashMap<String, Value>,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SearchResult {
    pub id: String,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub fields: HashMap<String, Value>,
}

struct FieldHandle {
    field: Field,
    kind: SchemaFieldKind,
}

pub struct SearchIndex {
    index: Index,
    writer: Mutex<IndexWriter>,
    reader: IndexReader,
    schema: Schema,
    id_field_name: String,
    fields: HashMap<String, FieldHandle>,
    timestamp_field: Field,
    version_field: Field,
}

const WRITER_HEAP_BYTES: usize = 50_000_000;

impl SearchIndex {
    /// Builds the tantivy schema from a caller-declared field map. Exactly
    /// one field must be declared `Id`; it becomes the document's primary
    /// key for upserts.
    pub fn new(
        schema_def: HashMap<String, SchemaFieldKind>,
        index_dir: Option<&Path>,
    ) -> CResult<Self> {
        let id_fields: Vec<&String> = schema_def
            .iter()
            .filter(|(_, kind)| **kind == SchemaFieldKind::Id)
            .map(|(name, _)| name)
            .collect();
        if id_fields.len() != 1 {
            return Err(Error::SchemaError(format!(
                "expected exactly one Id field, found {}",
                id_fields.len()
            )));
        }
        let id_field_name = id_fields[0].clone();

        let mut builder = SchemaBuilder::new();
        let mut fields = HashMap::new();
        for (name, kind) in schema_def.iter() {
            let field = match kind {
                SchemaFieldKind::Id => builder.add_text_field(name, STRING | STORED),
                SchemaFieldKind::Text => builder.add_text_field(name, TEXT | STORED),
                SchemaFieldKind::Keyword => builder.add_text_field(name, STRING | STORED),
                SchemaFieldKind::DateTime => {
                    builder.add_date_field(name, STORED | FAST | INDEXED)
                }
                SchemaFieldKind::Numeric => builder.add_f64_field(name, STORED | FAST | INDEXED),
                SchemaFieldKind::Boolean => builder.add_u64_field(name, STORED | FAST),
            };
            fields.insert(name.clone(), FieldHandle { field, kind: *kind });
        }
        let timestamp_field = builder.add_date_field("timestamp", STORED | FAST);
        let version_field = builder.add_u64_field("version", STORED | FAST);
        let schema = builder.build();

        let index = match index_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                Index::open_or_create(tantivy::directory::MmapDirectory::open(dir)
                    .map_err(|e| Error::Search(e.to_string()))?, schema.clone())
                    .map_err(|e| Error::Search(e.to_string()))?
            }
            None => Index::create_in_ram(schema.clone()),
        };
        let writer = index.writer(WRITER_HEAP_BYTES).map_err(|e| Error::Search(e.to_string()))?;
        let reader = index.reader().map_err(|e| Error::Search(e.to_string()))?;

        Ok(Self {
            index,
            writer: Mutex::new(writer),
            reader,
            schema,
            id_field_name,
            fields,
            timestamp_field,
            version_field,
        })
    }

    fn id_field(&self) -> Field {
        self.fields.get(&self.id_field_name).expect("id field registered in new()").field
    }

    /// Replaces any existing document sharing the same id (matching
    /// Whoosh's `update_document`), without committing. The caller batches
    /// commits via `flush`.
    pub fn upsert(&self, doc: IndexDocument) -> CResult<()> {
        let id_value = doc
            .fields
            .get(&self.id_field_name)
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::SchemaError("document missing id field value".to_string()))?
            .to_string();

        let mut tantivy_doc = TantivyDocument::default();
        for (name, handle) in self.fields.iter() {
            let Some(value) = doc.fields.get(name) else { continue };
            add_field_value(&mut tantivy_doc, handle, value)?;
        }
        tantivy_doc.add_date(
            self.timestamp_field,
            tantivy::DateTime::from_timestamp_millis(doc.timestamp.timestamp_millis()),
        );
        tantivy_doc.add_u64(self.version_field, doc.version);

        let mut writer = self.writer.lock().unwrap();
        writer.delete_term(tantivy::Term::from_field_text(self.id_field(), &id_value));
        writer.add_document(tantivy_doc).map_err(|e| Error::Search(e.to_string()))?;
        Ok(())
    }

    pub fn delete(&self, id: &str) -> CResult<()> {
        let mut writer = self.writer.lock().unwrap();
        writer.delete_term(tantivy::Term::from_field_text(self.id_field(), id));
        Ok(())
    }

    /// Commits buffered writes and makes them visible to subsequent
    /// searches. Called by the ORM's background indexing queue once per
    /// drained batch, and directly by tests wanting read-your-writes.
    pub fn flush(&self) -> CResult<()> {
        {
            let mut writer = self.writer.lock().unwrap();
            writer.commit().map_err(|e| Error::Search(e.to_string()))?;
        }
        self.reader.reload().map_err(|e| Error::Search(e.to_string()))?;
        Ok(())
    }

    /// Parses `query_str` against every `Text`/`Keyword`/`Id` field and
    /// returns matches visible as of `tx_start_time` (or all matches if
    /// `None`), after applying equality `filters` and optional
    /// sorting/clustering by a stored field name.
    pub fn search(
        &self,
        query_str: &str,
        tx_start_time: Option<DateTime<Utc>>,
        filters: &HashMap<String, Value>,
        sort_by: Option<&str>,
        cluster_by: Option<&str>,
    ) -> CResult<Vec<SearchResult>> {
        let queryable: Vec<Field> = self
            .fields
            .values()
            .filter(|h| matches!(h.kind, SchemaFieldKind::Text | SchemaFieldKind::Keyword | SchemaFieldKind::Id))
            .map(|h| h.field)
            .collect();
        let mut parser = QueryParser::for_index(&self.index, queryable);
        parser.set_conjunction_by_default();
        let preprocessed = preprocess_date_fragments(query_str);
        let query = parser.parse_query(&preprocessed).map_err(|e| Error::Search(e.to_string()))?;

        let searcher = self.reader.searcher();
        let top_docs = searcher
            .search(&query, &TopDocs::with_limit(10_000))
            .map_err(|e| Error::Search(e.to_string()))?;

        let mut results = Vec::new();
        for (_score, addr) in top_docs {
            let doc: TantivyDocument =
                searcher.doc(addr).map_err(|e| Error::Search(e.to_string()))?;
            let result = self.decode(&doc)?;

            if let Some(cutoff) = tx_start_time {
                if result.timestamp > cutoff {
                    continue;
                }
            }
            if !passes_filters(&result, filters) {
                continue;
            }
            results.push(result);
        }

        if let Some(field) = sort_by {
            results.sort_by(|a, b| sort_key(a, field).partial_cmp(&sort_key(b, field)).unwrap());
        }

        if let Some(field) = cluster_by {
            return Ok(cluster(results, field));
        }
        Ok(results)
    }

    fn decode(&self, doc: &TantivyDocument) -> CResult<SearchResult> {
        let mut fields = HashMap::new();
        let mut id = None;
        let mut version = 0u64;
        let mut timestamp = Utc::now();

        for (name, handle) in self.fields.iter() {
            if let Some(v) = doc.get_first(handle.field) {
                let value = owned_to_json(v);
                if *name == self.id_field_name {
                    id = value.as_str().map(|s| s.to_string());
                }
                fields.insert(name.clone(), value);
            }
        }
        if let Some(v) = doc.get_first(self.version_field) {
            if let OwnedValue::U64(n) = v {
                version = n;
            }
        }
        if let Some(v) = doc.get_first(self.timestamp_field) {
            if let OwnedValue::Date(d) = v {
                timestamp = Utc
                    .timestamp_millis_opt(d.into_timestamp_millis())
                    .single()
                    .unwrap_or_else(Utc::now);
            }
        }

        Ok(SearchResult {
            id: id.ok_or_else(|| Error::SchemaError("indexed document missing id".to_string()))?,
            version,
            timestamp,
            fields,
        })
    }
}

/// Rewrites bare `YYYY-MM-DD` date tokens in a query string (standalone, or
/// inside a `field:[A TO B]` range) into full RFC 3339 instants via `chrono`,
/// anchoring a bare date at midnight UTC, before the string reaches
/// tantivy's own query parser (which otherwise requires a complete
/// timestamp for date range queries).
fn preprocess_date_fragments(query_str: &str) -> String {
    let date_token =
        Regex::new(r"\d{4}-\d{2}-\d{2}(?:T[\d:.]+(?:Z|[+-]\d{2}:?\d{2})?)?").expect("static pattern is valid");
    date_token
        .replace_all(query_str, |caps: &regex::Captures| {
            let token = &caps[0];
            if let Ok(dt) = DateTime::parse_from_rfc3339(token) {
                return dt.with_timezone(&Utc).to_rfc3339();
            }
            // Bare date with no time component: anchor at midnight UTC.
            match format!("{token}T00:00:00Z").parse::<DateTime<Utc>>() {
                Ok(dt) => dt.to_rfc3339(),
                Err(_) => token.to_string(),
            }
        })
        .into_owned()
}

fn add_field_value(doc: &mut TantivyDocument, handle: &FieldHandle, value: &Value) -> CResult<()> {
    match handle.kind {
        SchemaFieldKind::Id | SchemaFieldKind::Text | SchemaFieldKind::Keyword => {
            if let Some(s) = value.as_str() {
                doc.add_text(handle.field, s);
            }
        }
        SchemaFieldKind::DateTime => {
            if let Some(s) = value.as_str() {
                if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                    doc.add_date(
                        handle.field,
                        tantivy::DateTime::from_timestamp_millis(dt.timestamp_millis()),
                    );
                }
            }
        }
        SchemaFieldKind::Numeric => {
            if let Some(n) = value.as_f64() {
                doc.add_f64(handle.field, n);
            }
        }
        SchemaFieldKind::Boolean => {
            if let Some(b) = value.as_bool() {
                doc.add_u64(handle.field, if b { 1 } else { 0 });
            }
        }
    }
    Ok(())
}

fn owned_to_json(v: &OwnedValue) -> Value {
    match v {
        OwnedValue::Str(s) => Value::String(s.clone()),
        OwnedValue::U64(n) => Value::from(*n),
        OwnedValue::I64(n) => Value::from(*n),
        OwnedValue::F64(n) => serde_json::Number::from_f64(*n).map(Value::Number).unwrap_or(Value::Null),
        OwnedValue::Bool(b) => Value::Bool(*b),
        OwnedValue::Date(d) => Value::from(d.into_timestamp_millis()),
        _ => Value::Null,
    }
}

fn passes_filters(result: &SearchResult, filters: &HashMap<String, Value>) -> bool {
    filters.iter().all(|(k, v)| result.fields.get(k) == Some(v))
}

fn sort_key(result: &SearchResult, field: &str) -> f64 {
    match result.fields.get(field) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.len() as f64,
        Some(Value::Bool(b)) => if *b { 1.0 } else { 0.0 },
        _ => 0.0,
    }
}

fn cluster(results: Vec<SearchResult>, field: &str) -> Vec<SearchResult> {
    // Clustering groups by the named field while preserving first-seen
    // group order; callers that need the grouped shape read `fields[field]`
    // off the flattened, now-adjacent results.
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<SearchResult>> = HashMap::new();
    for r in results {
        let key = r.fields.get(field).map(|v| v.to_string()).unwrap_or_default();
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(r);
    }
    order.into_iter().flat_map(|k| groups.remove(&k).unwrap_or_default()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_index() -> SearchIndex {
        let mut schema = HashMap::new();
        schema.insert("id".to_string(), SchemaFieldKind::Id);
        schema.insert("title".to_string(), SchemaFieldKind::Text);
        schema.insert("category".to_string(), SchemaFieldKind::Keyword);
        schema.insert("price".to_string(), SchemaFieldKind::Numeric);
        SearchIndex::new(schema, None).unwrap()
    }

    fn doc(id: &str, title: &str, category: &str, price: f64) -> IndexDocument {
        let mut fields = HashMap::new();
        fields.insert("id".to_string(), json!(id));
        fields.insert("title".to_string(), json!(title));
        fields.insert("category".to_string(), json!(category));
        fields.insert("price".to_string(), json!(price));
        IndexDocument { fields, version: 1, timestamp: Utc::now() }
    }

    #[test]
    fn upsert_then_search_finds_document() {
        let index = make_index();
        index.upsert(doc("a1", "red widget", "widgets", 9.99)).unwrap();
        index.flush().unwrap();

        let results = index.search("widget", None, &HashMap::new(), None, None).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "a1");
    }

    #[test]
    fn delete_removes_from_results() {
        let index = make_index();
        index.upsert(doc("a1", "red widget", "widgets", 9.99)).unwrap();
        index.flush().unwrap();
        index.delete("a1").unwrap();
        index.flush().unwrap();

        let results = index.search("widget", None, &HashMap::new(), None, None).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn upsert_replaces_previous_version() {
        let index = make_index();
        index.upsert(doc("a1", "red widget", "widgets", 9.99)).unwrap();
        index.flush().unwrap();
        index.upsert(doc("a1", "blue widget", "widgets", 12.0)).unwrap();
        index.flush().unwrap();

        let results = index.search("widget", None, &HashMap::new(), None, None).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].fields.get("title"), Some(&json!("blue widget")));
    }

    #[test]
    fn schema_without_id_field_is_rejected() {
        let mut schema = HashMap::new();
        schema.insert("title".to_string(), SchemaFieldKind::Text);
        assert!(SearchIndex::new(schema, None).is_err());
    }

    #[test]
    fn numeric_range_query_returns_empty_rather_than_erroring() {
        let mut schema = HashMap::new();
        schema.insert("id".to_string(), SchemaFieldKind::Id);
        schema.insert("level".to_string(), SchemaFieldKind::Numeric);
        let index = SearchIndex::new(schema, None).unwrap();

        let mut fields = HashMap::new();
        fields.insert("id".to_string(), json!("a1"));
        fields.insert("level".to_string(), json!(1.0));
        index.upsert(IndexDocument { fields, version: 1, timestamp: Utc::now() }).unwrap();
        index.flush().unwrap();

        let results = index.search("level:[4 TO 10]", None, &HashMap::new(), None, None).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn preprocess_date_fragments_anchors_bare_dates_at_midnight_utc() {
        let rewritten = preprocess_date_fragments("created:[2024-01-01 TO 2024-01-05]");
        assert!(rewritten.contains("2024-01-01T00:00:00+00:00"));
        assert!(rewritten.contains("2024-01-05T00:00:00+00:00"));
    }

    #[test]
    fn preprocess_date_fragments_normalizes_offset_to_utc() {
        let rewritten = preprocess_date_fragments("created:2024-01-02T03:04:05+02:00");
        assert_eq!(rewritten, "created:2024-01-02T01:04:05+00:00");
    }
}
