//! SQLite backend.
//!
//! Vectors live in BLOB columns as little-endian f32. Two scalar functions
//! are registered on every connection:
//!
//! - `vec_distance(a, b, metric)`: `1 - cos` for `cosine`, `-dot` for `ip`,
//!   Euclidean distance for `l2`; NULL if either side is NULL.
//! - `keyword_rank(text, query)`: full-text relevance of `text` for
//!   `query`, positive iff any query term occurs in `text`.
//!
//! SQLite has no ANN index type, so `ensure_vector_index` records the
//! request in the `sift_vector_indexes` table and searches scan the table.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::{Connection, OptionalExtension, params_from_iter};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::store::{SimilarityQuery, StoredRecord, VectorStore};
use crate::value::{
    Metric, Row, SqlValue, cell_to_json, decode_vector, validate_column_type, validate_identifier,
};

/// Registry of requested vector indexes.
pub const INDEX_REGISTRY_TABLE: &str = "sift_vector_indexes";

/// A [`VectorStore`] on a single SQLite connection.
pub struct SqliteVectorStore {
    conn: Mutex<Connection>,
}

impl SqliteVectorStore {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        info!("Opened vector store at {}", path.display());
        Self::from_connection(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Wrap an existing connection, registering the scalar functions.
    pub fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")?;
        register_functions(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Every `(table, column, metric)` passed to `ensure_vector_index`.
    pub async fn vector_indexes(&self) -> Result<Vec<(String, String, Metric)>> {
        let conn = self.conn.lock().await;
        if !table_exists(&conn, INDEX_REGISTRY_TABLE)? {
            return Ok(Vec::new());
        }
        let mut stmt = conn.prepare(&format!(
            "SELECT table_name, column_name, metric FROM {INDEX_REGISTRY_TABLE} ORDER BY table_name, column_name, metric"
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?;

        let mut indexes = Vec::new();
        for row in rows {
            let (table, column, metric) = row?;
            indexes.push((table, column, metric.parse()?));
        }
        Ok(indexes)
    }
}

fn user_error(e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::UserFunctionError(Box::new(e))
}

fn register_functions(conn: &Connection) -> Result<()> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;

    conn.create_scalar_function("vec_distance", 3, flags, |ctx: &Context<'_>| {
        let a: Option<Vec<u8>> = ctx.get(0)?;
        let b: Option<Vec<u8>> = ctx.get(1)?;
        let metric: String = ctx.get(2)?;
        let (Some(a), Some(b)) = (a, b) else {
            return Ok(None);
        };
        let metric: Metric = metric.parse().map_err(user_error)?;
        let a = decode_vector(&a).map_err(user_error)?;
        let b = decode_vector(&b).map_err(user_error)?;
        let distance = metric.distance(&a, &b).map_err(user_error)?;
        Ok(Some(f64::from(distance)))
    })?;

    conn.create_scalar_function("keyword_rank", 2, flags, |ctx: &Context<'_>| {
        let text: Option<String> = ctx.get(0)?;
        let query: Option<String> = ctx.get(1)?;
        Ok(match (text, query) {
            (Some(text), Some(query)) => keyword_rank(&text, &query),
            _ => 0.0,
        })
    })?;

    Ok(())
}

/// Lowercase alphanumeric terms.
fn terms(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

/// `ts_rank`-style relevance: the mean over distinct query terms of
/// `ln(1 + tf)`, where `tf` is the term's frequency in `text`. Zero when no
/// query term occurs.
pub fn keyword_rank(text: &str, query: &str) -> f64 {
    let query_terms: HashSet<String> = terms(query).collect();
    if query_terms.is_empty() {
        return 0.0;
    }

    let mut tf: HashMap<String, usize> = HashMap::new();
    for term in terms(text) {
        if query_terms.contains(&term) {
            *tf.entry(term).or_insert(0) += 1;
        }
    }

    let total: f64 = tf.values().map(|&n| (1.0 + n as f64).ln()).sum();
    total / query_terms.len() as f64
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?",
            [table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    Ok(names.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn query_rows(conn: &Connection, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
    let mut stmt = conn.prepare(sql)?;
    let names: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
    let mut rows = stmt.query(params_from_iter(params.iter()))?;

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut map = Row::new();
        for (i, name) in names.iter().enumerate() {
            map.insert(name.clone(), cell_to_json(row.get_ref(i)?));
        }
        out.push(map);
    }
    Ok(out)
}

fn similarity_sql(query: &SimilarityQuery) -> String {
    let columns = if query.meta_cols.is_empty() {
        "t.*".to_string()
    } else {
        query
            .meta_cols
            .iter()
            .map(|c| format!("t.{c}"))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let extra = query
        .where_clause
        .as_deref()
        .map(|w| format!(" AND ({w})"))
        .unwrap_or_default();

    format!(
        "SELECT {columns}, t.{id} AS id, vec_distance(t.{col}, ?, ?) AS distance \
         FROM {table} AS t \
         WHERE t.{col} IS NOT NULL{extra} \
         ORDER BY distance ASC \
         LIMIT ?",
        id = query.id_col,
        col = query.column,
        table = query.table,
    )
}

fn record_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let columns = table_columns(conn, table)?;
    if columns.is_empty() {
        return Err(StoreError::Validation(format!("table {table} does not exist")));
    }
    let has = |name: &str| columns.iter().any(|c| c == name);
    if !has("id") || !has("embedding") {
        return Err(StoreError::Validation(format!(
            "table {table} needs id and embedding columns"
        )));
    }
    Ok(columns)
}

fn write_rows(conn: &Connection, table: &str, columns: &[String], records: &[StoredRecord]) -> Result<usize> {
    let now = chrono::Utc::now().to_rfc3339();
    let mut written = 0;
    for record in records {
        let mut names: Vec<&str> = Vec::with_capacity(columns.len());
        let mut values: Vec<SqlValue> = Vec::with_capacity(columns.len());
        for column in columns {
            let value = match column.as_str() {
                "id" => SqlValue::from(record.id.as_str()),
                "embedding" => SqlValue::Vector(record.vector.clone()),
                "doc_id" => SqlValue::from(record.doc_id.clone()),
                "chunk_index" => SqlValue::from(record.chunk_index),
                "metadata" => SqlValue::Text(serde_json::to_string(&record.metadata)?),
                "created_at" => record
                    .metadata
                    .get("created_at")
                    .map_or_else(|| SqlValue::from(now.as_str()), SqlValue::from),
                other => match record.metadata.get(other) {
                    Some(v) => SqlValue::from(v),
                    None => continue,
                },
            };
            names.push(column);
            values.push(value);
        }

        let placeholders = vec!["?"; names.len()].join(", ");
        let sql = format!(
            "INSERT OR REPLACE INTO {table} ({}) VALUES ({placeholders})",
            names.join(", ")
        );
        written += conn.execute(&sql, params_from_iter(values.iter()))?;
    }
    Ok(written)
}

fn insert_sync(conn: &mut Connection, table: &str, records: &[StoredRecord]) -> Result<usize> {
    let columns = record_columns(conn, table)?;
    let tx = conn.transaction()?;
    let written = write_rows(&tx, table, &columns, records)?;
    tx.commit()?;
    Ok(written)
}

fn replace_document_sync(
    conn: &mut Connection,
    table: &str,
    doc_id: &str,
    records: &[StoredRecord],
) -> Result<(usize, usize)> {
    let columns = record_columns(conn, table)?;
    if !columns.iter().any(|c| c == "doc_id") {
        return Err(StoreError::Validation(format!("table {table} has no doc_id column")));
    }
    let tx = conn.transaction()?;
    let removed = tx.execute(&format!("DELETE FROM {table} WHERE doc_id = ?"), [doc_id])?;
    let written = write_rows(&tx, table, &columns, records)?;
    tx.commit()?;
    Ok((removed, written))
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn exec_sql(&self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        let conn = self.conn.lock().await;
        Ok(conn.execute(sql, params_from_iter(params.iter()))?)
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        let conn = self.conn.lock().await;
        query_rows(&conn, sql, params)
    }

    async fn similarity_search(&self, query: &SimilarityQuery) -> Result<Vec<Row>> {
        query.validate()?;
        let sql = similarity_sql(query);

        let mut params = Vec::with_capacity(query.where_params.len() + 3);
        params.push(SqlValue::Vector(query.vector.clone()));
        params.push(SqlValue::from(query.metric.as_str()));
        params.extend(query.where_params.iter().cloned());
        params.push(SqlValue::from(query.k));

        let conn = self.conn.lock().await;
        let mut rows = query_rows(&conn, &sql, &params)?;
        drop(conn);

        for row in &mut rows {
            if query.column != "id" {
                row.remove(&query.column);
            }
        }
        debug!(
            "similarity_search on {}.{} ({}) returned {} rows",
            query.table,
            query.column,
            query.metric,
            rows.len()
        );
        Ok(rows)
    }

    async fn create_table(&self, name: &str, columns: &[(&str, &str)]) -> Result<()> {
        validate_identifier(name, "table")?;
        if columns.is_empty() {
            return Err(StoreError::Validation(format!("table {name} needs at least one column")));
        }
        let mut defs = Vec::with_capacity(columns.len());
        for (column, ty) in columns {
            validate_identifier(column, "column")?;
            validate_column_type(ty)?;
            defs.push(format!("{column} {}", ty.trim()));
        }

        let sql = format!("CREATE TABLE IF NOT EXISTS {name} ({})", defs.join(", "));
        let conn = self.conn.lock().await;
        conn.execute_batch(&sql)?;
        debug!("Ensured table {name}");
        Ok(())
    }

    async fn ensure_vector_index(&self, table: &str, column: &str, metric: Metric) -> Result<()> {
        validate_identifier(table, "table")?;
        validate_identifier(column, "column")?;

        let conn = self.conn.lock().await;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {INDEX_REGISTRY_TABLE} (
                table_name TEXT NOT NULL,
                column_name TEXT NOT NULL,
                metric TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (table_name, column_name, metric)
            )"
        ))?;
        let inserted = conn.execute(
            &format!(
                "INSERT OR IGNORE INTO {INDEX_REGISTRY_TABLE} (table_name, column_name, metric, created_at) VALUES (?, ?, ?, ?)"
            ),
            rusqlite::params![table, column, metric.as_str(), chrono::Utc::now().to_rfc3339()],
        )?;
        if inserted > 0 {
            info!("Registered {metric} vector index on {table}.{column}");
        }
        Ok(())
    }

    async fn insert_records(&self, table: &str, records: &[StoredRecord]) -> Result<usize> {
        validate_identifier(table, "table")?;
        if records.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock().await;
        let written = insert_sync(&mut conn, table, records)?;
        debug!("Inserted {written} records into {table}");
        Ok(written)
    }

    async fn replace_document(&self, table: &str, doc_id: &str, records: &[StoredRecord]) -> Result<(usize, usize)> {
        validate_identifier(table, "table")?;
        let mut conn = self.conn.lock().await;
        let (removed, written) = replace_document_sync(&mut conn, table, doc_id, records)?;
        debug!("Replaced {removed} rows of {doc_id} with {written} in {table}");
        Ok((removed, written))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RECORD_COLUMNS;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn store_with_rows() -> SqliteVectorStore {
        let store = SqliteVectorStore::open_in_memory().unwrap();
        store.create_table("chunks", RECORD_COLUMNS).await.unwrap();
        let records = vec![
            StoredRecord::new("a", vec![1.0, 0.0]).with_field("content", "red apples"),
            StoredRecord::new("b", vec![0.0, 1.0]).with_field("content", "green pears"),
            StoredRecord::new("c", vec![0.7, 0.7]).with_field("content", "apples and pears"),
        ];
        store.insert_records("chunks", &records).await.unwrap();
        store
    }

    #[test]
    fn test_keyword_rank() {
        assert_eq!(keyword_rank("nothing here", "apple"), 0.0);
        assert_eq!(keyword_rank("anything", "  ...  "), 0.0);

        let one = keyword_rank("apple pie", "apple");
        let two = keyword_rank("apple apple pie", "apple");
        assert!(one > 0.0);
        assert!(two > one);

        // Matching more of the query terms ranks higher.
        let partial = keyword_rank("apple pie", "apple crumble");
        let full = keyword_rank("apple crumble", "apple crumble");
        assert!(full > partial);
        assert!((keyword_rank("Apple", "apple") - 2f64.ln()).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_similarity_search_orders_by_distance() {
        let store = store_with_rows().await;
        let query = SimilarityQuery::new("chunks", vec![1.0, 0.0], 2).with_meta_cols(["content"]);

        let rows = store.similarity_search(&query).await.unwrap();

        let ids: Vec<&str> = rows.iter().filter_map(|r| r["id"].as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert!(rows[0]["distance"].as_f64().unwrap() < rows[1]["distance"].as_f64().unwrap());
        assert_eq!(rows[0]["content"], json!("red apples"));
        assert!(!rows[0].contains_key("embedding"));
    }

    #[tokio::test]
    async fn test_similarity_search_with_where_and_metrics() {
        let store = store_with_rows().await;
        let query = SimilarityQuery::new("chunks", vec![1.0, 0.0], 5)
            .with_metric(Metric::L2)
            .with_where("content LIKE ?", vec![SqlValue::from("%pears%")]);

        let rows = store.similarity_search(&query).await.unwrap();

        let ids: Vec<&str> = rows.iter().filter_map(|r| r["id"].as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn test_similarity_search_rejects_bad_identifiers() {
        let store = store_with_rows().await;
        let query = SimilarityQuery::new("chunks;DROP TABLE chunks", vec![1.0], 1);
        assert!(matches!(
            store.similarity_search(&query).await,
            Err(StoreError::InvalidIdentifier { .. })
        ));
        let query = SimilarityQuery::new("chunks", vec![1.0], 1).with_meta_cols(["content--"]);
        assert!(store.similarity_search(&query).await.is_err());
    }

    #[tokio::test]
    async fn test_ensure_vector_index_is_idempotent() {
        let store = store_with_rows().await;
        store.ensure_vector_index("chunks", "embedding", Metric::Cosine).await.unwrap();
        store.ensure_vector_index("chunks", "embedding", Metric::Cosine).await.unwrap();
        store.ensure_vector_index("chunks", "embedding", Metric::L2).await.unwrap();

        let indexes = store.vector_indexes().await.unwrap();
        assert_eq!(
            indexes,
            vec![
                ("chunks".to_string(), "embedding".to_string(), Metric::Cosine),
                ("chunks".to_string(), "embedding".to_string(), Metric::L2),
            ]
        );
    }

    #[tokio::test]
    async fn test_insert_records_upserts_and_maps_columns() {
        let store = SqliteVectorStore::open_in_memory().unwrap();
        let mut columns = RECORD_COLUMNS.to_vec();
        columns.push(("category", "TEXT"));
        store.create_table("docs", &columns).await.unwrap();

        let record = StoredRecord::new("d1_chunk_0", vec![0.5, 0.5])
            .with_document("d1", 0)
            .with_field("content", "first")
            .with_field("category", "news");
        store.insert_records("docs", &[record.clone()]).await.unwrap();
        let updated = record.with_field("content", "second");
        store.insert_records("docs", &[updated]).await.unwrap();

        let rows = store
            .query("SELECT id, doc_id, chunk_index, content, category, metadata FROM docs", &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["doc_id"], json!("d1"));
        assert_eq!(rows[0]["chunk_index"], json!(0));
        assert_eq!(rows[0]["content"], json!("second"));
        assert_eq!(rows[0]["category"], json!("news"));
        let metadata: serde_json::Value =
            serde_json::from_str(rows[0]["metadata"].as_str().unwrap()).unwrap();
        assert_eq!(metadata["category"], json!("news"));
    }

    #[tokio::test]
    async fn test_replace_document_swaps_rows_atomically() {
        let store = SqliteVectorStore::open_in_memory().unwrap();
        let mut columns = RECORD_COLUMNS.to_vec();
        columns.push(("category", "TEXT NOT NULL"));
        store.create_table("docs", &columns).await.unwrap();

        let chunk = |doc: &str, i: usize| {
            StoredRecord::new(format!("{doc}_chunk_{i}"), vec![1.0, 0.0])
                .with_document(doc, i)
                .with_field("category", "news")
        };
        let old = vec![chunk("d1", 0), chunk("d1", 1), chunk("d1", 2), chunk("d2", 0)];
        store.insert_records("docs", &old).await.unwrap();

        let (removed, written) = store
            .replace_document("docs", "d1", &[chunk("d1", 0)])
            .await
            .unwrap();
        assert_eq!((removed, written), (3, 1));

        // The second record violates NOT NULL, so the delete is rolled back too.
        let uncategorized = StoredRecord::new("d1_chunk_1", vec![1.0, 0.0]).with_document("d1", 1);
        let err = store
            .replace_document("docs", "d1", &[chunk("d1", 0), uncategorized])
            .await;
        assert!(err.is_err());

        let rows = store.query("SELECT id FROM docs ORDER BY id", &[]).await.unwrap();
        let ids: Vec<&str> = rows.iter().filter_map(|r| r["id"].as_str()).collect();
        assert_eq!(ids, vec!["d1_chunk_0", "d2_chunk_0"]);
    }

    #[tokio::test]
    async fn test_insert_into_missing_table_fails() {
        let store = SqliteVectorStore::open_in_memory().unwrap();
        let err = store
            .insert_records("missing", &[StoredRecord::new("x", vec![1.0])])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn test_exec_sql_counts_rows() {
        let store = store_with_rows().await;
        let removed = store
            .exec_sql("DELETE FROM chunks WHERE id IN (?, ?)", &[SqlValue::from("a"), SqlValue::from("b")])
            .await
            .unwrap();
        assert_eq!(removed, 2);
    }

    #[tokio::test]
    async fn test_create_table_validates() {
        let store = SqliteVectorStore::open_in_memory().unwrap();
        assert!(store.create_table("ok_table", &[("id", "TEXT")]).await.is_ok());
        assert!(store.create_table("bad table", &[("id", "TEXT")]).await.is_err());
        assert!(store.create_table("t", &[("id", "TEXT); DROP TABLE x; --")]).await.is_err());
        assert!(store.create_table("t", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_an_error() {
        let store = store_with_rows().await;
        let query = SimilarityQuery::new("chunks", vec![1.0, 0.0, 0.0], 1);
        assert!(store.similarity_search(&query).await.is_err());
    }
}
