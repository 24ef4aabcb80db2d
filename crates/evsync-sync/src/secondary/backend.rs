//! Upsert/select/delete access to the secondary relational backend.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOp {
    Upsert,
    Select,
    Delete,
}

impl BackendOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::Select => "select",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for BackendOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{op} on {table} failed: {source}")]
    Request {
        op: BackendOp,
        table: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{op} on {table} returned {status}: {message}")]
    Api {
        op: BackendOp,
        table: String,
        status: u16,
        message: String,
    },
    #[error("decoding {table} rows: {message}")]
    Decode { table: String, message: String },
    #[error("injected {op} failure on {table}")]
    Injected { op: BackendOp, table: String },
}

/// The four calls the normalizer needs. Every call is atomic on its own;
/// nothing spans calls.
#[async_trait]
pub trait SecondaryBackend: Send + Sync {
    /// Insert rows, merging into existing rows that match on the
    /// comma-separated `on_conflict` columns.
    async fn upsert(
        &self,
        table: &str,
        rows: &[JsonValue],
        on_conflict: &str,
    ) -> Result<(), BackendError>;

    async fn select_in(
        &self,
        table: &str,
        columns: &[&str],
        column: &str,
        values: &[JsonValue],
    ) -> Result<Vec<JsonValue>, BackendError>;

    async fn select_eq(
        &self,
        table: &str,
        columns: &[&str],
        column: &str,
        value: &str,
    ) -> Result<Vec<JsonValue>, BackendError>;

    /// Delete rows whose `column` is in `values`, returning how many went.
    async fn delete_in(
        &self,
        table: &str,
        column: &str,
        values: &[JsonValue],
    ) -> Result<u64, BackendError>;
}

/// Supabase-style PostgREST endpoint at `{url}/rest/v1/{table}`.
pub struct PostgrestBackend {
    client: reqwest::Client,
    base_url: String,
    page_size: usize,
}

impl std::fmt::Debug for PostgrestBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgrestBackend")
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// `in.(…)` filter value. Strings are double-quoted so commas and
/// parentheses inside ids cannot split the list.
fn in_filter(values: &[JsonValue]) -> String {
    let items: Vec<String> = values
        .iter()
        .map(|value| match value {
            JsonValue::String(s) => {
                format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
            }
            other => other.to_string(),
        })
        .collect();
    format!("in.({})", items.join(","))
}

impl PostgrestBackend {
    pub const CLIENT_INFO: &'static str = concat!("evsync/", env!("CARGO_PKG_VERSION"));
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
    /// Rows per select page. Matches the default PostgREST `max_rows` cap,
    /// so a capped server never truncates a page silently.
    pub const DEFAULT_PAGE_SIZE: usize = 1000;

    pub fn new(url: &str, key: &str) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "apikey",
            HeaderValue::from_str(key).context("secondary key is not a valid header value")?,
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {key}"))
                .context("secondary key is not a valid header value")?,
        );
        headers.insert("X-Client-Info", HeaderValue::from_static(Self::CLIENT_INFO));
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Self::DEFAULT_TIMEOUT)
            .build()
            .context("building secondary backend client")?;
        Ok(Self {
            client,
            base_url: url.trim_end_matches('/').to_string(),
            page_size: Self::DEFAULT_PAGE_SIZE,
        })
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn endpoint(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    async fn send(
        &self,
        op: BackendOp,
        table: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, BackendError> {
        let response = request.send().await.map_err(|source| BackendError::Request {
            op,
            table: table.to_string(),
            source,
        })?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(BackendError::Api {
            op,
            table: table.to_string(),
            status: status.as_u16(),
            message,
        })
    }

    /// Read every page of a select, ordered by `id` so offsets stay stable.
    /// A short page ends the read.
    async fn select_pages<F>(&self, table: &str, build: F) -> Result<Vec<JsonValue>, BackendError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut rows = Vec::new();
        loop {
            let request = build()
                .query(&[("order", "id.asc")])
                .query(&[("limit", self.page_size), ("offset", rows.len())]);
            let response = self.send(BackendOp::Select, table, request).await?;
            let page = Self::rows(table, response).await?;
            let done = page.len() < self.page_size;
            rows.extend(page);
            if done {
                debug!(table, rows = rows.len(), "secondary select");
                return Ok(rows);
            }
        }
    }

    async fn rows(table: &str, response: reqwest::Response) -> Result<Vec<JsonValue>, BackendError> {
        response
            .json::<Vec<JsonValue>>()
            .await
            .map_err(|err| BackendError::Decode {
                table: table.to_string(),
                message: err.to_string(),
            })
    }
}

#[async_trait]
impl SecondaryBackend for PostgrestBackend {
    async fn upsert(
        &self,
        table: &str,
        rows: &[JsonValue],
        on_conflict: &str,
    ) -> Result<(), BackendError> {
        if rows.is_empty() {
            return Ok(());
        }
        let request = self
            .client
            .post(self.endpoint(table))
            .query(&[("on_conflict", on_conflict)])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(rows);
        let span = info_span!("secondary_upsert", table, rows = rows.len());
        self.send(BackendOp::Upsert, table, request)
            .instrument(span)
            .await?;
        Ok(())
    }

    async fn select_in(
        &self,
        table: &str,
        columns: &[&str],
        column: &str,
        values: &[JsonValue],
    ) -> Result<Vec<JsonValue>, BackendError> {
        if values.is_empty() {
            return Ok(Vec::new());
        }
        let filter = in_filter(values);
        self.select_pages(table, || {
            self.client
                .get(self.endpoint(table))
                .query(&[("select", columns.join(","))])
                .query(&[(column, filter.as_str())])
        })
        .await
    }

    async fn select_eq(
        &self,
        table: &str,
        columns: &[&str],
        column: &str,
        value: &str,
    ) -> Result<Vec<JsonValue>, BackendError> {
        let filter = format!("eq.{value}");
        self.select_pages(table, || {
            self.client
                .get(self.endpoint(table))
                .query(&[("select", columns.join(","))])
                .query(&[(column, filter.as_str())])
        })
        .await
    }

    async fn delete_in(
        &self,
        table: &str,
        column: &str,
        values: &[JsonValue],
    ) -> Result<u64, BackendError> {
        if values.is_empty() {
            return Ok(0);
        }
        let request = self
            .client
            .delete(self.endpoint(table))
            .query(&[(column, in_filter(values))])
            .header("Prefer", "return=representation");
        let response = self.send(BackendOp::Delete, table, request).await?;
        let deleted = Self::rows(table, response).await?.len() as u64;
        debug!(table, column, deleted, "secondary delete");
        Ok(deleted)
    }
}

type Row = JsonMap<String, JsonValue>;

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, Vec<Row>>,
    next_id: i64,
    failures: HashSet<(BackendOp, String)>,
}

impl MemoryState {
    fn check(&self, op: BackendOp, table: &str) -> Result<(), BackendError> {
        if self.failures.contains(&(op, table.to_string())) {
            return Err(BackendError::Injected {
                op,
                table: table.to_string(),
            });
        }
        Ok(())
    }
}

fn project(row: &Row, columns: &[&str]) -> JsonValue {
    let projected: Row = columns
        .iter()
        .filter_map(|c| row.get(*c).map(|v| (c.to_string(), v.clone())))
        .collect();
    JsonValue::Object(projected)
}

/// Backend kept in process memory. It assigns its own integer `id`s the way
/// the remote one does, and can be told to fail a given call.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    state: Mutex<MemoryState>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `op` on `table` fail until [`Self::clear_failures`].
    pub async fn fail_on(&self, op: BackendOp, table: &str) {
        self.state
            .lock()
            .await
            .failures
            .insert((op, table.to_string()));
    }

    pub async fn clear_failures(&self) {
        self.state.lock().await.failures.clear();
    }

    /// Snapshot of a table's rows in insertion order.
    pub async fn rows(&self, table: &str) -> Vec<JsonValue> {
        self.state
            .lock()
            .await
            .tables
            .get(table)
            .map(|rows| rows.iter().cloned().map(JsonValue::Object).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SecondaryBackend for InMemoryBackend {
    async fn upsert(
        &self,
        table: &str,
        rows: &[JsonValue],
        on_conflict: &str,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        state.check(BackendOp::Upsert, table)?;
        let keys: Vec<&str> = on_conflict.split(',').map(str::trim).collect();

        let mut incoming = Vec::with_capacity(rows.len());
        for row in rows {
            let JsonValue::Object(row) = row else {
                return Err(BackendError::Decode {
                    table: table.to_string(),
                    message: format!("expected an object row, got {row}"),
                });
            };
            incoming.push(row.clone());
        }

        let mut next_id = state.next_id;
        let stored = state.tables.entry(table.to_string()).or_default();
        for row in incoming {
            let existing = stored
                .iter_mut()
                .find(|s| keys.iter().all(|k| s.get(*k).is_some() && s.get(*k) == row.get(*k)));
            match existing {
                Some(current) => current.extend(row),
                None => {
                    let mut row = row;
                    if !row.contains_key("id") {
                        next_id += 1;
                        row.insert("id".into(), JsonValue::from(next_id));
                    }
                    stored.push(row);
                }
            }
        }
        state.next_id = next_id;
        Ok(())
    }

    async fn select_in(
        &self,
        table: &str,
        columns: &[&str],
        column: &str,
        values: &[JsonValue],
    ) -> Result<Vec<JsonValue>, BackendError> {
        let state = self.state.lock().await;
        state.check(BackendOp::Select, table)?;
        Ok(state
            .tables
            .get(table)
            .into_iter()
            .flatten()
            .filter(|row| row.get(column).is_some_and(|v| values.contains(v)))
            .map(|row| project(row, columns))
            .collect())
    }

    async fn select_eq(
        &self,
        table: &str,
        columns: &[&str],
        column: &str,
        value: &str,
    ) -> Result<Vec<JsonValue>, BackendError> {
        let state = self.state.lock().await;
        state.check(BackendOp::Select, table)?;
        Ok(state
            .tables
            .get(table)
            .into_iter()
            .flatten()
            .filter(|row| row.get(column).and_then(JsonValue::as_str) == Some(value))
            .map(|row| project(row, columns))
            .collect())
    }

    async fn delete_in(
        &self,
        table: &str,
        column: &str,
        values: &[JsonValue],
    ) -> Result<u64, BackendError> {
        let mut state = self.state.lock().await;
        state.check(BackendOp::Delete, table)?;
        let Some(rows) = state.tables.get_mut(table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|row| !row.get(column).is_some_and(|v| values.contains(v)));
        Ok((before - rows.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    /// Answer one JSON body per connection and return each request line.
    async fn serve_pages(pages: Vec<JsonValue>) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut lines = Vec::new();
            for page in pages {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut raw = Vec::new();
                let mut buf = [0u8; 4096];
                while !String::from_utf8_lossy(&raw).contains("\r\n\r\n") {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    raw.extend_from_slice(&buf[..n]);
                }
                let request = String::from_utf8_lossy(&raw).to_string();
                lines.push(request.lines().next().unwrap_or_default().to_string());
                let body = page.to_string();
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
            }
            lines
        });
        (format!("http://{addr}"), handle)
    }

    #[test]
    fn in_filter_quotes_strings_and_keeps_numbers_bare() {
        assert_eq!(in_filter(&[json!(1), json!(22)]), "in.(1,22)");
        assert_eq!(
            in_filter(&[json!("venue_ab"), json!("a,\"b\"")]),
            r#"in.("venue_ab","a,\"b\"")"#
        );
    }

    #[test]
    fn endpoint_joins_rest_path() {
        let backend = PostgrestBackend::new("https://x.supabase.co/", "key").unwrap();
        assert_eq!(backend.endpoint("events"), "https://x.supabase.co/rest/v1/events");
    }

    #[tokio::test]
    async fn select_reads_every_page_until_a_short_one() {
        let (base, server) = serve_pages(vec![
            json!([{ "id": 1, "external_id": "event_a" }, { "id": 2, "external_id": "event_b" }]),
            json!([{ "id": 3, "external_id": "event_c" }, { "id": 4, "external_id": "event_d" }]),
            json!([{ "id": 5, "external_id": "event_e" }]),
        ])
        .await;
        let backend = PostgrestBackend::new(&base, "key").unwrap().with_page_size(2);

        let rows = backend
            .select_eq("events", &["id", "external_id"], "source", "x")
            .await
            .unwrap();
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[4]["external_id"], "event_e");

        let lines = server.await.unwrap();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("source=eq.x"));
        assert!(lines[0].contains("order=id.asc"));
        assert!(lines[0].contains("limit=2&offset=0"));
        assert!(lines[2].contains("limit=2&offset=4"));
    }

    #[tokio::test]
    async fn memory_upsert_merges_on_conflict_columns_and_assigns_ids() {
        let backend = InMemoryBackend::new();
        backend
            .upsert(
                "venues",
                &[
                    json!({"external_id": "v1", "name": "Hall"}),
                    json!({"external_id": "v2", "name": "Pub"}),
                ],
                "external_id",
            )
            .await
            .unwrap();
        backend
            .upsert("venues", &[json!({"external_id": "v1", "name": "Big Hall"})], "external_id")
            .await
            .unwrap();

        let rows = backend.rows("venues").await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], json!({"external_id": "v1", "name": "Big Hall", "id": 1}));

        let selected = backend
            .select_in("venues", &["id", "external_id"], "external_id", &[json!("v2")])
            .await
            .unwrap();
        assert_eq!(selected, vec![json!({"id": 2, "external_id": "v2"})]);
    }

    #[tokio::test]
    async fn memory_composite_conflict_and_delete() {
        let backend = InMemoryBackend::new();
        let links = [json!({"event_id": 1, "tag_id": 7}), json!({"event_id": 1, "tag_id": 7})];
        backend.upsert("event_tags", &links, "event_id,tag_id").await.unwrap();
        assert_eq!(backend.rows("event_tags").await.len(), 1);

        let deleted = backend.delete_in("event_tags", "event_id", &[json!(1)]).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(backend.delete_in("missing", "id", &[json!(1)]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn injected_failures_hit_only_the_named_call() {
        let backend = InMemoryBackend::new();
        backend.fail_on(BackendOp::Delete, "events").await;
        let err = backend.delete_in("events", "id", &[json!(1)]).await.unwrap_err();
        assert!(matches!(err, BackendError::Injected { op: BackendOp::Delete, .. }));
        assert!(backend.upsert("events", &[json!({"external_id": "e"})], "external_id").await.is_ok());

        backend.clear_failures().await;
        assert!(backend.delete_in("events", "id", &[json!(1)]).await.is_ok());
    }
}
