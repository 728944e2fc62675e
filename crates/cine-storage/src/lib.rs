//! Catalog API gateway + relational upsert store.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use cine_core::{Cell, Collection, Record};
use reqwest::StatusCode;
use serde_json::{json, Value as JsonValue};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::query_builder::Separated;
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "cine-storage";

const TOKEN_FIELDS: [&str; 2] = ["access_token", "token"];

/// Postgres accepts at most this many bind parameters per statement.
const MAX_BIND_PARAMS: usize = 65_535;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("request to {url} failed after {attempts} attempt(s): {source}")]
    Transport {
        url: String,
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Server-side failures are retried; 4xx answers are final.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() || err.is_decode() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub multiplier: Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            multiplier: Duration::from_secs(1),
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(20),
        }
    }
}

impl BackoffPolicy {
    /// Wait before the retry that follows the zero-based `attempt_index`.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.multiplier.saturating_mul(factor);
        delay.clamp(self.min_delay, self.max_delay.max(self.min_delay))
    }
}

#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl ApiClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Unauthenticated API handle. The only thing it can do is trade credentials
/// for an [`AuthenticatedApi`].
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    backoff: BackoffPolicy,
}

impl ApiClient {
    pub fn new(config: ApiClientConfig) -> Result<Self, GatewayError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().map_err(GatewayError::Client)?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            backoff: config.backoff,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn authenticate(
        self,
        user: &str,
        password: &str,
    ) -> Result<AuthenticatedApi, GatewayError> {
        let url = format!("{}/auth", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&json!({ "user": user, "password": password }))
            .send()
            .await
            .map_err(|source| GatewayError::Transport {
                url: url.clone(),
                attempts: 1,
                source,
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(GatewayError::Auth(format!("{url} answered {status}")));
        }

        let body: JsonValue = resp
            .json()
            .await
            .map_err(|err| GatewayError::Auth(format!("auth response is not JSON: {err}")))?;

        let token = TOKEN_FIELDS
            .iter()
            .filter_map(|field| body.get(*field))
            .find_map(token_text)
            .ok_or_else(|| {
                GatewayError::Auth("auth response does not contain access_token/token".into())
            })?;

        info!(base_url = %self.base_url, "authenticated against catalog api");
        Ok(AuthenticatedApi {
            client: self.client,
            base_url: self.base_url,
            token,
            backoff: self.backoff,
        })
    }
}

fn token_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) if n.as_f64() != Some(0.0) => Some(n.to_string()),
        _ => None,
    }
}

/// Read-only view of the catalog API used by the ETL driver.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch_json(&self, path: &str) -> Result<JsonValue, GatewayError>;
}

/// API handle carrying the bearer credential obtained at login.
#[derive(Clone)]
pub struct AuthenticatedApi {
    client: reqwest::Client,
    base_url: String,
    token: String,
    backoff: BackoffPolicy,
}

impl std::fmt::Debug for AuthenticatedApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticatedApi")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl AuthenticatedApi {
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_with_retry(&self, path: &str) -> Result<JsonValue, GatewayError> {
        let url = format!("{}{}", self.base_url, path);
        let max_attempts = self.backoff.max_attempts.max(1);
        let mut attempt = 0usize;

        loop {
            attempt += 1;
            let failure = match self.client.get(&url).bearer_auth(&self.token).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        match resp.json::<JsonValue>().await {
                            Ok(value) => return Ok(value),
                            Err(err) => err,
                        }
                    } else {
                        if classify_status(status) == RetryDisposition::NonRetryable
                            || attempt >= max_attempts
                        {
                            return Err(GatewayError::HttpStatus {
                                status: status.as_u16(),
                                url,
                            });
                        }
                        let delay = self.backoff.delay_for_attempt(attempt - 1);
                        warn!(%status, attempt, delay_ms = delay.as_millis() as u64, "retrying after server error");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                }
                Err(err) => err,
            };

            if classify_reqwest_error(&failure) == RetryDisposition::NonRetryable
                || attempt >= max_attempts
            {
                return Err(GatewayError::Transport {
                    url,
                    attempts: attempt,
                    source: failure,
                });
            }
            let delay = self.backoff.delay_for_attempt(attempt - 1);
            warn!(error = %failure, attempt, delay_ms = delay.as_millis() as u64, "retrying after transport error");
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl CatalogSource for AuthenticatedApi {
    async fn fetch_json(&self, path: &str) -> Result<JsonValue, GatewayError> {
        let span = info_span!("api_get", path);
        async {
            let value = self.get_with_retry(path).await?;
            debug!("fetched");
            Ok::<_, GatewayError>(value)
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("collection {collection} has no column {field} to key on")]
    UnknownKeyField { collection: String, field: String },
    #[error("row {row} for {collection} does not match the declared columns")]
    RowShape { collection: String, row: usize },
    #[error("upsert into {collection} failed: {source}")]
    Database {
        collection: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("connecting to database: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("collection {collection} is missing columns {missing:?}")]
    SchemaMismatch {
        collection: String,
        missing: Vec<String>,
    },
}

/// Insert-or-update sink. One call is atomic for its collection.
#[async_trait]
pub trait UpsertStore: Send + Sync {
    /// Returns the number of distinct rows written. Empty input is a no-op.
    async fn upsert(
        &self,
        collection: &Collection,
        rows: Vec<Vec<Cell>>,
        key_fields: &[&str],
    ) -> Result<u64, StoreError>;
}

pub async fn upsert_records<R: Record>(
    store: &dyn UpsertStore,
    rows: &[R],
    key_fields: &[&str],
) -> Result<u64, StoreError> {
    let cells = rows.iter().map(Record::cells).collect();
    store.upsert(R::COLLECTION, cells, key_fields).await
}

/// Validate keys and row shapes, then collapse rows sharing a key.
/// The last occurrence wins but keeps the position of the first.
pub fn prepare_batch(
    collection: &Collection,
    rows: Vec<Vec<Cell>>,
    key_fields: &[&str],
) -> Result<Vec<Vec<Cell>>, StoreError> {
    let key_indexes = key_fields
        .iter()
        .map(|field| {
            collection
                .column_index(field)
                .ok_or_else(|| StoreError::UnknownKeyField {
                    collection: collection.name.to_string(),
                    field: field.to_string(),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut positions: HashMap<Vec<String>, usize> = HashMap::new();
    let mut out: Vec<Vec<Cell>> = Vec::with_capacity(rows.len());
    for (row_no, row) in rows.into_iter().enumerate() {
        let shape_ok = row.len() == collection.columns.len()
            && row
                .iter()
                .zip(collection.columns)
                .all(|(cell, column)| cell.kind() == column.kind);
        if !shape_ok {
            return Err(StoreError::RowShape {
                collection: collection.name.to_string(),
                row: row_no,
            });
        }

        let key = key_indexes.iter().map(|&i| row[i].key_repr()).collect::<Vec<_>>();
        match positions.get(&key) {
            Some(&pos) => out[pos] = row,
            None => {
                positions.insert(key, out.len());
                out.push(row);
            }
        }
    }
    Ok(out)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn qualified_table(schema: Option<&str>, collection: &Collection) -> String {
    match schema {
        Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(collection.name)),
        None => quote_ident(collection.name),
    }
}

fn push_cell<'args>(b: &mut Separated<'_, 'args, Postgres, &'static str>, cell: &Cell) {
    match cell {
        Cell::BigInt(v) => b.push_bind(*v),
        Cell::Double(v) => b.push_bind(*v),
        Cell::Text(v) => b.push_bind(v.clone()),
        Cell::Date(v) => b.push_bind(*v),
        Cell::Timestamp(v) => b.push_bind(*v),
        Cell::Json(v) => b.push_bind(Json(v.clone())),
    };
}

/// `INSERT .. VALUES .. ON CONFLICT (keys) DO UPDATE SET <non-key> = EXCLUDED.<non-key>`.
/// Collections made only of key columns get `DO NOTHING`.
pub fn build_upsert_statement<'args>(
    table: &str,
    collection: &Collection,
    rows: &[Vec<Cell>],
    key_fields: &[&str],
) -> QueryBuilder<'args, Postgres> {
    let columns = collection
        .column_names()
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(", ");
    let mut qb = QueryBuilder::new(format!("INSERT INTO {table} ({columns}) "));
    qb.push_values(rows, |mut b, row| {
        for cell in row {
            push_cell(&mut b, cell);
        }
    });

    let keys = key_fields
        .iter()
        .map(|k| quote_ident(k))
        .collect::<Vec<_>>()
        .join(", ");
    let updates = collection
        .column_names()
        .filter(|name| !key_fields.contains(name))
        .map(|name| {
            let q = quote_ident(name);
            format!("{q} = EXCLUDED.{q}")
        })
        .collect::<Vec<_>>();

    qb.push(format!(" ON CONFLICT ({keys}) "));
    if updates.is_empty() {
        qb.push("DO NOTHING");
    } else {
        qb.push(format!("DO UPDATE SET {}", updates.join(", ")));
    }
    qb
}

#[derive(Debug, Clone)]
pub struct PgUpsertStore {
    pool: PgPool,
    schema: Option<String>,
}

impl PgUpsertStore {
    pub fn new(pool: PgPool, schema: Option<String>) -> Self {
        Self { pool, schema }
    }

    pub async fn connect(database_url: &str, schema: Option<String>) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .test_before_acquire(true)
            .connect(database_url)
            .await
            .map_err(StoreError::Connect)?;
        Ok(Self::new(pool, schema))
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// Compare declared columns with `information_schema`. Only column names
    /// are checked; integer widths and text flavours are left to the DBA.
    pub async fn verify_collections(&self, collections: &[&Collection]) -> Result<(), StoreError> {
        for collection in collections {
            let rows = sqlx::query(
                r#"
                SELECT column_name::text AS column_name
                  FROM information_schema.columns
                 WHERE table_schema = COALESCE($1, current_schema())
                   AND table_name = $2
                "#,
            )
            .bind(self.schema.as_deref())
            .bind(collection.name)
            .fetch_all(&self.pool)
            .await
            .map_err(|source| StoreError::Database {
                collection: collection.name.to_string(),
                source,
            })?;

            let present = rows
                .iter()
                .map(|row| row.try_get::<String, _>("column_name"))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|source| StoreError::Database {
                    collection: collection.name.to_string(),
                    source,
                })?;
            let missing = collection
                .column_names()
                .filter(|name| !present.iter().any(|p| p == name))
                .map(str::to_string)
                .collect::<Vec<_>>();
            if !missing.is_empty() {
                return Err(StoreError::SchemaMismatch {
                    collection: collection.name.to_string(),
                    missing,
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl UpsertStore for PgUpsertStore {
    async fn upsert(
        &self,
        collection: &Collection,
        rows: Vec<Vec<Cell>>,
        key_fields: &[&str],
    ) -> Result<u64, StoreError> {
        let rows = prepare_batch(collection, rows, key_fields)?;
        if rows.is_empty() {
            return Ok(0);
        }

        let db_err = |source: sqlx::Error| StoreError::Database {
            collection: collection.name.to_string(),
            source,
        };
        let table = qualified_table(self.schema.as_deref(), collection);
        let rows_per_statement = (MAX_BIND_PARAMS / collection.columns.len().max(1)).max(1);

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for chunk in rows.chunks(rows_per_statement) {
            let mut qb = build_upsert_statement(&table, collection, chunk, key_fields);
            qb.build().execute(&mut *tx).await.map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;

        debug!(collection = collection.name, rows = rows.len(), "upsert committed");
        Ok(rows.len() as u64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpsertCall {
    pub collection: String,
    pub rows: usize,
}

/// Process-local store with the same keyed overwrite semantics as Postgres.
/// Backs `--dry-run` and the pipeline tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, BTreeMap<Vec<String>, Vec<Cell>>>,
    calls: Vec<UpsertCall>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn row_count(&self, collection: &str) -> usize {
        let state = self.state.lock().await;
        state.tables.get(collection).map(BTreeMap::len).unwrap_or(0)
    }

    /// Rows ordered by their key representation.
    pub async fn rows(&self, collection: &str) -> Vec<Vec<Cell>> {
        let state = self.state.lock().await;
        state
            .tables
            .get(collection)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn calls(&self) -> Vec<UpsertCall> {
        self.state.lock().await.calls.clone()
    }
}

#[async_trait]
impl UpsertStore for MemoryStore {
    async fn upsert(
        &self,
        collection: &Collection,
        rows: Vec<Vec<Cell>>,
        key_fields: &[&str],
    ) -> Result<u64, StoreError> {
        let rows = prepare_batch(collection, rows, key_fields)?;
        let key_indexes = key_fields
            .iter()
            .filter_map(|k| collection.column_index(k))
            .collect::<Vec<_>>();

        let mut state = self.state.lock().await;
        state.calls.push(UpsertCall {
            collection: collection.name.to_string(),
            rows: rows.len(),
        });
        if rows.is_empty() {
            return Ok(0);
        }

        let written = rows.len() as u64;
        let table = state.tables.entry(collection.name.to_string()).or_default();
        for row in rows {
            let key = key_indexes.iter().map(|&i| row[i].key_repr()).collect();
            table.insert(key, row);
        }
        Ok(written)
    }
}
