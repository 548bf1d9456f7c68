//! SQLite-backed store.
//!
//! One connection guarded by a mutex; every call runs on tokio's blocking
//! pool. Timestamps are stored as fixed-width RFC 3339 text so range
//! filters and ordering work on the text column directly.
//!
//! `analysis_results.work_item_id` is the table's primary key, so a second
//! result for the same item is rejected by the schema itself.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pipeline::{
    AnalysisOrigin, AnalysisResult, Categories, Confidence, Insight, InsightPage, InsightQuery,
    InsightReader, PolarityScore, SentimentFilter, StoreError, Timestamp, WorkItem, WorkItemId,
    WorkPayload, WorkState, WorkStore,
};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use tracing::{debug, info};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS work_items (
    id               TEXT PRIMARY KEY,
    text             TEXT NOT NULL,
    author           TEXT,
    metadata         TEXT,
    state            TEXT NOT NULL
                     CHECK (state IN ('pending', 'processing', 'completed', 'failed')),
    submitted_at     TEXT NOT NULL,
    occurred_at      TEXT NOT NULL,
    state_changed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_work_items_state_submitted
    ON work_items(state, submitted_at);
CREATE INDEX IF NOT EXISTS idx_work_items_state_changed
    ON work_items(state, state_changed_at);
CREATE INDEX IF NOT EXISTS idx_work_items_occurred
    ON work_items(occurred_at);

CREATE TABLE IF NOT EXISTS analysis_results (
    work_item_id TEXT PRIMARY KEY REFERENCES work_items(id),
    polarity     REAL NOT NULL CHECK (polarity BETWEEN -1.0 AND 1.0),
    categories   TEXT NOT NULL,
    confidence   REAL NOT NULL CHECK (confidence BETWEEN 0.0 AND 1.0),
    explanation  TEXT,
    raw_response TEXT NOT NULL,
    origin       TEXT NOT NULL,
    created_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_analysis_results_confidence
    ON analysis_results(confidence);
CREATE INDEX IF NOT EXISTS idx_analysis_results_polarity
    ON analysis_results(polarity);
";

const ITEM_COLUMNS: &str =
    "id, text, author, metadata, state, submitted_at, occurred_at, state_changed_at";

const RESULT_COLUMNS: &str =
    "work_item_id, polarity, categories, confidence, explanation, raw_response, origin, created_at";

/// Durable store on a single SQLite database file.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path` and applies the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(db)?;
        let journal: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(db)?;
        info!(path = %path.display(), journal = %journal, "opened sqlite store");
        Self::init(conn)
    }

    /// A private in-memory database, discarded on drop.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(db)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON").map_err(db)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(db)?;
        conn.execute_batch(SCHEMA).map_err(db)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|p| p.into_inner());
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable {
            message: format!("store task failed: {e}"),
        })?
    }

    /// Number of items currently in `state`.
    pub async fn count(&self, state: WorkState) -> Result<usize, StoreError> {
        self.with_conn(move |conn| {
            let n: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM work_items WHERE state = ?1",
                    params![state.as_str()],
                    |row| row.get(0),
                )
                .map_err(db)?;
            Ok(n.max(0) as usize)
        })
        .await
    }
}

fn db(err: rusqlite::Error) -> StoreError {
    StoreError::Unavailable {
        message: err.to_string(),
    }
}

fn corrupt(message: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        message: message.into(),
    }
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

struct ItemRow {
    id: String,
    text: String,
    author: Option<String>,
    metadata: Option<String>,
    state: String,
    submitted_at: String,
    occurred_at: String,
    state_changed_at: String,
}

impl ItemRow {
    /// Reads the columns of [`ITEM_COLUMNS`] starting at `offset`.
    fn read(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(offset)?,
            text: row.get(offset + 1)?,
            author: row.get(offset + 2)?,
            metadata: row.get(offset + 3)?,
            state: row.get(offset + 4)?,
            submitted_at: row.get(offset + 5)?,
            occurred_at: row.get(offset + 6)?,
            state_changed_at: row.get(offset + 7)?,
        })
    }

    fn into_item(self) -> Result<WorkItem, StoreError> {
        let id = WorkItemId::parse(&self.id).ok_or_else(|| corrupt(format!("bad id {}", self.id)))?;
        let mut payload =
            WorkPayload::from_text(&self.text).ok_or_else(|| corrupt(format!("item {id} has blank text")))?;
        payload.author = self.author;
        payload.metadata = self
            .metadata
            .map(|m| serde_json::from_str(&m))
            .transpose()
            .map_err(|e| corrupt(format!("item {id} metadata: {e}")))?;
        Ok(WorkItem {
            id,
            payload,
            state: WorkState::parse(&self.state)
                .ok_or_else(|| corrupt(format!("item {id} has state {}", self.state)))?,
            submitted_at: timestamp(&self.submitted_at)?,
            occurred_at: timestamp(&self.occurred_at)?,
            state_changed_at: timestamp(&self.state_changed_at)?,
        })
    }
}

struct ResultRow {
    work_item_id: String,
    polarity: f64,
    categories: String,
    confidence: f64,
    explanation: Option<String>,
    raw_response: String,
    origin: String,
    created_at: String,
}

impl ResultRow {
    fn read(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            work_item_id: row.get(offset)?,
            polarity: row.get(offset + 1)?,
            categories: row.get(offset + 2)?,
            confidence: row.get(offset + 3)?,
            explanation: row.get(offset + 4)?,
            raw_response: row.get(offset + 5)?,
            origin: row.get(offset + 6)?,
            created_at: row.get(offset + 7)?,
        })
    }

    fn into_result(self) -> Result<AnalysisResult, StoreError> {
        let work_item_id = WorkItemId::parse(&self.work_item_id)
            .ok_or_else(|| corrupt(format!("bad id {}", self.work_item_id)))?;
        let categories: Categories = serde_json::from_str(&self.categories)
            .map_err(|e| corrupt(format!("result {work_item_id} categories: {e}")))?;
        Ok(AnalysisResult {
            work_item_id,
            polarity: PolarityScore::new(self.polarity)
                .ok_or_else(|| corrupt(format!("result {work_item_id} polarity out of range")))?,
            categories,
            confidence: Confidence::new(self.confidence)
                .ok_or_else(|| corrupt(format!("result {work_item_id} confidence out of range")))?,
            explanation: self.explanation,
            raw_response: self.raw_response,
            origin: AnalysisOrigin::parse(&self.origin)
                .ok_or_else(|| corrupt(format!("result {work_item_id} origin {}", self.origin)))?,
            created_at: timestamp(&self.created_at)?,
        })
    }
}

fn timestamp(text: &str) -> Result<Timestamp, StoreError> {
    Timestamp::parse_rfc3339(text).ok_or_else(|| corrupt(format!("bad timestamp {text}")))
}

// ---------------------------------------------------------------------------
// Statements shared by several operations
// ---------------------------------------------------------------------------

fn current_state(conn: &Connection, id: WorkItemId) -> Result<Option<WorkState>, StoreError> {
    let state: Option<String> = conn
        .query_row(
            "SELECT state FROM work_items WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .map_err(db)?;
    state
        .map(|s| WorkState::parse(&s).ok_or_else(|| corrupt(format!("item {id} has state {s}"))))
        .transpose()
}

fn transition(
    conn: &Connection,
    id: WorkItemId,
    expected: WorkState,
    next: WorkState,
) -> Result<(), StoreError> {
    if !expected.can_transition_to(next) {
        return Err(StoreError::InvalidTransition {
            from: expected,
            to: next,
        });
    }
    let changed = conn
        .execute(
            "UPDATE work_items SET state = ?1, state_changed_at = ?2
             WHERE id = ?3 AND state = ?4",
            params![
                next.as_str(),
                Timestamp::now().to_rfc3339(),
                id.to_string(),
                expected.as_str()
            ],
        )
        .map_err(db)?;
    if changed == 1 {
        return Ok(());
    }
    match current_state(conn, id)? {
        None => Err(StoreError::NotFound(id)),
        Some(actual) => Err(StoreError::StateConflict {
            id,
            expected,
            actual,
        }),
    }
}

fn insert_result(tx: &Transaction<'_>, result: &AnalysisResult) -> Result<(), StoreError> {
    let id = result.work_item_id;
    if current_state(tx, id)?.is_none() {
        return Err(StoreError::NotFound(id));
    }
    let exists: Option<i64> = tx
        .query_row(
            "SELECT 1 FROM analysis_results WHERE work_item_id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .map_err(db)?;
    if exists.is_some() {
        return Err(StoreError::DuplicateResult(id));
    }

    let categories = serde_json::to_string(&result.categories)
        .map_err(|e| corrupt(format!("result {id} categories: {e}")))?;
    tx.execute(
        &format!("INSERT INTO analysis_results ({RESULT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
        params![
            id.to_string(),
            result.polarity.as_f64(),
            categories,
            result.confidence.as_f64(),
            result.explanation,
            result.raw_response,
            result.origin.as_str(),
            result.created_at.to_rfc3339(),
        ],
    )
    .map_err(db)?;
    Ok(())
}

/// `WHERE` clause and bound values shared by the count and page queries.
fn insight_filter(query: &InsightQuery) -> (String, Vec<rusqlite::types::Value>) {
    use rusqlite::types::Value;

    let mut clause = String::from("w.occurred_at >= ?1 AND w.occurred_at <= ?2");
    let mut values = vec![
        Value::Text(query.start.to_rfc3339()),
        Value::Text(query.end.to_rfc3339()),
    ];
    if let Some(min) = query.min_confidence {
        values.push(Value::Real(min.as_f64()));
        clause.push_str(&format!(" AND r.confidence >= ?{}", values.len()));
    }
    if let Some(sentiment) = query.sentiment {
        values.push(Value::Real(SentimentFilter::NEUTRAL_BAND));
        let n = values.len();
        clause.push_str(&match sentiment {
            SentimentFilter::Positive => format!(" AND r.polarity > ?{n}"),
            SentimentFilter::Negative => format!(" AND r.polarity < -?{n}"),
            SentimentFilter::Neutral => format!(" AND r.polarity BETWEEN -?{n} AND ?{n}"),
        });
    }
    (clause, values)
}

// ---------------------------------------------------------------------------
// Trait implementations
// ---------------------------------------------------------------------------

#[async_trait]
impl WorkStore for SqliteStore {
    async fn create(&self, item: WorkItem) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let metadata = item
                .payload
                .metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| corrupt(format!("item {} metadata: {e}", item.id)))?;
            conn.execute(
                &format!("INSERT INTO work_items ({ITEM_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
                params![
                    item.id.to_string(),
                    item.payload.text,
                    item.payload.author,
                    metadata,
                    item.state.as_str(),
                    item.submitted_at.to_rfc3339(),
                    item.occurred_at.to_rfc3339(),
                    item.state_changed_at.to_rfc3339(),
                ],
            )
            .map_err(|e| {
                let duplicate = matches!(
                    &e,
                    rusqlite::Error::SqliteFailure(failure, _)
                        if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                );
                if duplicate {
                    StoreError::AlreadyExists(item.id)
                } else {
                    db(e)
                }
            })?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, StoreError> {
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {ITEM_COLUMNS} FROM work_items WHERE id = ?1"),
                params![id.to_string()],
                |row| ItemRow::read(row, 0),
            )
            .optional()
            .map_err(db)?
            .map(ItemRow::into_item)
            .transpose()
        })
        .await
    }

    async fn find_by_state(
        &self,
        state: WorkState,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {ITEM_COLUMNS} FROM work_items
                     WHERE state = ?1
                     ORDER BY submitted_at ASC, rowid ASC
                     LIMIT ?2"
                ))
                .map_err(db)?;
            let rows = stmt
                .query_map(
                    params![state.as_str(), i64::try_from(limit).unwrap_or(i64::MAX)],
                    |row| ItemRow::read(row, 0),
                )
                .map_err(db)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db)?;
            rows.into_iter().map(ItemRow::into_item).collect()
        })
        .await
    }

    async fn update_state(
        &self,
        id: WorkItemId,
        expected: WorkState,
        next: WorkState,
    ) -> Result<(), StoreError> {
        self.with_conn(move |conn| transition(conn, id, expected, next))
            .await
    }

    async fn create_result(&self, result: AnalysisResult) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(db)?;
            insert_result(&tx, &result)?;
            tx.commit().map_err(db)
        })
        .await
    }

    async fn result_for(&self, id: WorkItemId) -> Result<Option<AnalysisResult>, StoreError> {
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {RESULT_COLUMNS} FROM analysis_results WHERE work_item_id = ?1"),
                params![id.to_string()],
                |row| ResultRow::read(row, 0),
            )
            .optional()
            .map_err(db)?
            .map(ResultRow::into_result)
            .transpose()
        })
        .await
    }

    async fn complete(&self, result: AnalysisResult) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(db)?;
            insert_result(&tx, &result)?;
            transition(&tx, result.work_item_id, WorkState::Processing, WorkState::Completed)?;
            tx.commit().map_err(db)
        })
        .await
    }

    async fn requeue_stale(&self, older_than: Timestamp) -> Result<Vec<WorkItemId>, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(db)?;
            let ids: Vec<String> = {
                let mut stmt = tx
                    .prepare(
                        "SELECT id FROM work_items
                         WHERE state = 'processing' AND state_changed_at <= ?1",
                    )
                    .map_err(db)?;
                let ids = stmt
                    .query_map(params![older_than.to_rfc3339()], |row| row.get(0))
                    .map_err(db)?
                    .collect::<Result<Vec<String>, _>>()
                    .map_err(db)?;
                ids
            };
            let now = Timestamp::now().to_rfc3339();
            for id in &ids {
                tx.execute(
                    "UPDATE work_items SET state = 'pending', state_changed_at = ?1
                     WHERE id = ?2 AND state = 'processing'",
                    params![now, id],
                )
                .map_err(db)?;
            }
            tx.commit().map_err(db)?;
            debug!(count = ids.len(), "requeued stale items");
            ids.iter()
                .map(|id| WorkItemId::parse(id).ok_or_else(|| corrupt(format!("bad id {id}"))))
                .collect()
        })
        .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(db)?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl InsightReader for SqliteStore {
    async fn query_insights(&self, query: &InsightQuery) -> Result<InsightPage, StoreError> {
        let query = query.clone();
        self.with_conn(move |conn| {
            let (filter, mut values) = insight_filter(&query);
            let from = "FROM analysis_results r JOIN work_items w ON w.id = r.work_item_id";

            let total: i64 = conn
                .query_row(
                    &format!("SELECT COUNT(*) {from} WHERE {filter}"),
                    rusqlite::params_from_iter(values.iter()),
                    |row| row.get(0),
                )
                .map_err(db)?;

            values.push(rusqlite::types::Value::Integer(
                i64::try_from(query.limit).unwrap_or(i64::MAX),
            ));
            let limit_param = values.len();
            let w_columns = ITEM_COLUMNS
                .split(", ")
                .map(|c| format!("w.{c}"))
                .collect::<Vec<_>>()
                .join(", ");
            let r_columns = RESULT_COLUMNS
                .split(", ")
                .map(|c| format!("r.{c}"))
                .collect::<Vec<_>>()
                .join(", ");
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {w_columns}, {r_columns} {from}
                     WHERE {filter}
                     ORDER BY w.occurred_at DESC, w.rowid DESC
                     LIMIT ?{limit_param}"
                ))
                .map_err(db)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(values.iter()), |row| {
                    Ok((ItemRow::read(row, 0)?, ResultRow::read(row, 8)?))
                })
                .map_err(db)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db)?;

            let insights = rows
                .into_iter()
                .map(|(item, result)| {
                    Ok(Insight::from_parts(&item.into_item()?, &result.into_result()?))
                })
                .collect::<Result<Vec<_>, StoreError>>()?;
            Ok(InsightPage {
                insights,
                total_count: total.max(0) as usize,
            })
        })
        .await
    }
}
