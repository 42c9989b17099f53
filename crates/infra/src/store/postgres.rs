//! Postgres-backed request store.
//!
//! Safe to share between processes: every state change is a single
//! conditional `UPDATE` whose `WHERE` clause carries the expected status (and,
//! for outcome writes, the expected owner). A writer that lost the race sees
//! zero affected rows and reports it instead of overwriting.
//!
//! ## Schema
//!
//! `ensure_ready()` creates `executor_requests` and `executor_errors` if they
//! are missing. Statuses are stored as their upper-case names; contexts and
//! responses as `JSONB`.
//!
//! ## Runtime
//!
//! The store contract is synchronous (workers are OS threads), so the adapter
//! owns a small tokio runtime and blocks on it. Calling it from inside another
//! async runtime is rejected with `StoreError::Storage`.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Row};
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, instrument};
use uuid::Uuid;

use forgeexec_core::{
    CommandContext, ErrorId, ErrorRecord, Request, RequestId, RequestStatus, WorkerId,
};

use super::r#trait::{
    CancelResult, OutcomeWrite, RequestAdmin, RequestQuery, RequestStore, RequeueStore,
    StoreError, StoreResult,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS executor_requests (
        id           UUID PRIMARY KEY,
        command_name TEXT NOT NULL,
        context      JSONB NOT NULL DEFAULT '{}'::jsonb,
        business_key TEXT,
        status       TEXT NOT NULL,
        fire_time    TIMESTAMPTZ NOT NULL,
        owner        TEXT,
        retry_count  INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
        response     JSONB,
        created_at   TIMESTAMPTZ NOT NULL,
        updated_at   TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS executor_requests_poll_idx ON executor_requests (status, fire_time, id)",
    "CREATE INDEX IF NOT EXISTS executor_requests_business_key_idx ON executor_requests (business_key)",
    r#"
    CREATE TABLE IF NOT EXISTS executor_errors (
        id          UUID PRIMARY KEY,
        request_id  UUID NOT NULL,
        message     TEXT NOT NULL,
        detail      TEXT,
        occurred_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS executor_errors_request_idx ON executor_errors (request_id)",
];

const REQUEST_COLUMNS: &str = "id, command_name, context, business_key, status, fire_time, \
     owner, retry_count, response, created_at, updated_at";

/// Postgres request store.
///
/// Cheap to clone; clones share the pool and the runtime.
#[derive(Debug, Clone)]
pub struct PostgresRequestStore {
    pool: PgPool,
    runtime: Arc<Runtime>,
}

/// Optional predicates for request listings. `None` means "no constraint".
#[derive(Debug, Default)]
struct RequestFilter<'a> {
    statuses: Option<Vec<String>>,
    due_at: Option<DateTime<Utc>>,
    after: Option<DateTime<Utc>>,
    id: Option<Uuid>,
    business_key: Option<&'a str>,
    limit: Option<i64>,
    by_fire_time: bool,
}

impl PostgresRequestStore {
    /// Connect to `database_url` with a pool of at most `max_connections`.
    pub fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("forgeexec-pg")
            .enable_all()
            .build()
            .map_err(|e| StoreError::Storage(format!("failed to build tokio runtime: {e}")))?;

        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(max_connections)
                    .connect(database_url),
            )
            .map_err(|e| map_sqlx_error("connect", e))?;

        Ok(Self {
            pool,
            runtime: Arc::new(runtime),
        })
    }

    fn block_on<T>(&self, fut: impl Future<Output = StoreResult<T>>) -> StoreResult<T> {
        if Handle::try_current().is_ok() {
            return Err(StoreError::Storage(
                "PostgresRequestStore is blocking and cannot be called from an async context"
                    .to_string(),
            ));
        }
        self.runtime.block_on(fut)
    }

    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    #[instrument(
        skip(self, request),
        fields(request_id = %request.id, command = %request.command_name),
        err
    )]
    pub async fn insert_request(&self, request: Request) -> StoreResult<RequestId> {
        sqlx::query(
            r#"
            INSERT INTO executor_requests (
                id, command_name, context, business_key, status, fire_time,
                owner, retry_count, response, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(request.id.as_uuid())
        .bind(&request.command_name)
        .bind(request.context.clone().into_value())
        .bind(request.business_key.as_deref())
        .bind(request.status.as_str())
        .bind(request.fire_time)
        .bind(request.owner.as_ref().map(WorkerId::as_str))
        .bind(request.retry_count as i32)
        .bind(request.response.clone().map(CommandContext::into_value))
        .bind(request.created_at)
        .bind(request.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::AlreadyExists(request.id)
            } else {
                map_sqlx_error("insert_request", e)
            }
        })?;

        Ok(request.id)
    }

    #[instrument(skip(self, owner), fields(worker = %owner), err)]
    pub async fn claim_request(
        &self,
        id: RequestId,
        expected: RequestStatus,
        owner: &WorkerId,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Request>> {
        let sql = format!(
            "UPDATE executor_requests \
             SET status = $3, owner = $4, updated_at = $5 \
             WHERE id = $1 AND status = $2 AND fire_time <= $5 \
             RETURNING {REQUEST_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(expected.as_str())
            .bind(RequestStatus::Running.as_str())
            .bind(owner.as_str())
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_request", e))?;

        row.map(decode_request).transpose()
    }

    /// Apply an outcome and append its error record in one transaction.
    #[instrument(
        skip(self, owner, outcome),
        fields(worker = %owner, target = %outcome.target_status()),
        err
    )]
    pub async fn apply_outcome(
        &self,
        id: RequestId,
        owner: &WorkerId,
        outcome: OutcomeWrite,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let target = outcome.target_status();
        let (response, context, fire_time, retry_increment, error) = match outcome {
            OutcomeWrite::Done { response } => {
                (response.map(CommandContext::into_value), None, None, 0_i32, None)
            }
            OutcomeWrite::Rescheduled { context, fire_time } => {
                (None, Some(context.into_value()), Some(fire_time), 0, None)
            }
            OutcomeWrite::Retrying { fire_time, error } => {
                (None, None, Some(fire_time), 1, Some(error))
            }
            OutcomeWrite::Failed { error } => (None, None, None, 0, Some(error)),
        };

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let updated = sqlx::query(
            r#"
            UPDATE executor_requests
            SET status = $4,
                owner = NULL,
                updated_at = $5,
                response = COALESCE($6::jsonb, response),
                context = COALESCE($7::jsonb, context),
                fire_time = COALESCE($8::timestamptz, fire_time),
                retry_count = retry_count + $9
            WHERE id = $1 AND status = $2 AND owner = $3
            "#,
        )
        .bind(id.as_uuid())
        .bind(RequestStatus::Running.as_str())
        .bind(owner.as_str())
        .bind(target.as_str())
        .bind(now)
        .bind(response)
        .bind(context)
        .bind(fire_time)
        .bind(retry_increment)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("apply_outcome", e))?;

        if updated.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            debug!(request_id = %id, worker = %owner, "claim lost before outcome write");
            return Ok(false);
        }

        if let Some(error) = error {
            insert_error(&mut tx, &error).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(true)
    }

    #[instrument(skip(self), err)]
    pub async fn cancel_request(&self, id: RequestId, now: DateTime<Utc>) -> StoreResult<CancelResult> {
        let sql = format!(
            "UPDATE executor_requests \
             SET status = $3, owner = NULL, updated_at = $4 \
             WHERE id = $1 AND status = ANY($2) \
             RETURNING {REQUEST_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(status_names(&RequestStatus::CLAIMABLE))
            .bind(RequestStatus::Cancelled.as_str())
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("cancel_request", e))?;

        if let Some(row) = row {
            return Ok(CancelResult::Cancelled(decode_request(row)?));
        }

        let current = sqlx::query("SELECT status FROM executor_requests WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("cancel_request", e))?;

        match current {
            None => Ok(CancelResult::NotFound),
            Some(row) => {
                let status: String = row
                    .try_get("status")
                    .map_err(|e| StoreError::Decode(e.to_string()))?;
                Ok(CancelResult::NotCancellable(parse_status(&status)?))
            }
        }
    }

    #[instrument(skip(self), err)]
    pub async fn requeue_running(
        &self,
        id: Option<RequestId>,
        cutoff: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE executor_requests
            SET status = $2, owner = NULL, updated_at = $3
            WHERE status = $1
              AND ($4::uuid IS NULL OR id = $4)
              AND ($5::timestamptz IS NULL OR updated_at < $5)
            "#,
        )
        .bind(RequestStatus::Running.as_str())
        .bind(RequestStatus::Queued.as_str())
        .bind(now)
        .bind(id.map(|id| *id.as_uuid()))
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_running", e))?;

        Ok(result.rows_affected())
    }

    async fn select_requests(&self, filter: RequestFilter<'_>) -> StoreResult<Vec<Request>> {
        let order = if filter.by_fire_time { "fire_time ASC, id ASC" } else { "id ASC" };
        let sql = format!(
            "SELECT {REQUEST_COLUMNS} FROM executor_requests \
             WHERE ($1::text[] IS NULL OR status = ANY($1)) \
               AND ($2::timestamptz IS NULL OR fire_time <= $2) \
               AND ($3::timestamptz IS NULL OR fire_time > $3) \
               AND ($4::uuid IS NULL OR id = $4) \
               AND ($5::text IS NULL OR business_key = $5) \
             ORDER BY {order} \
             LIMIT $6"
        );

        let rows = sqlx::query(&sql)
            .bind(filter.statuses)
            .bind(filter.due_at)
            .bind(filter.after)
            .bind(filter.id)
            .bind(filter.business_key)
            .bind(filter.limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("select_requests", e))?;

        rows.into_iter().map(decode_request).collect()
    }

    async fn select_errors(&self, request_id: Option<RequestId>) -> StoreResult<Vec<ErrorRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, request_id, message, detail, occurred_at
            FROM executor_errors
            WHERE ($1::uuid IS NULL OR request_id = $1)
            ORDER BY occurred_at ASC, id ASC
            "#,
        )
        .bind(request_id.map(|id| *id.as_uuid()))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("select_errors", e))?;

        rows.iter()
            .map(|row| {
                ErrorRow::from_row(row)
                    .map(ErrorRecord::from)
                    .map_err(|e| StoreError::Decode(format!("error row: {e}")))
            })
            .collect()
    }

    #[instrument(skip(self), err)]
    pub async fn purge(&self, errors: bool) -> StoreResult<u64> {
        let result = if errors {
            sqlx::query("DELETE FROM executor_errors")
                .execute(&self.pool)
                .await
        } else {
            sqlx::query("DELETE FROM executor_requests WHERE status = ANY($1)")
                .bind(status_names(&RequestStatus::TERMINAL))
                .execute(&self.pool)
                .await
        }
        .map_err(|e| map_sqlx_error("purge", e))?;

        Ok(result.rows_affected())
    }
}

async fn insert_error(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    error: &ErrorRecord,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO executor_errors (id, request_id, message, detail, occurred_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(error.id.as_uuid())
    .bind(error.request_id.as_uuid())
    .bind(&error.message)
    .bind(error.detail.as_deref())
    .bind(error.occurred_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_error", e))?;
    Ok(())
}

fn status_names(statuses: &[RequestStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

fn parse_status(raw: &str) -> StoreResult<RequestStatus> {
    raw.parse()
        .map_err(|_| StoreError::Decode(format!("unknown request status '{raw}'")))
}

fn decode_request(row: PgRow) -> StoreResult<Request> {
    RequestRow::from_row(&row)
        .map_err(|e| StoreError::Decode(format!("request row: {e}")))?
        .try_into()
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            StoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Decode(format!("{operation}: {err}"))
        }
        _ => StoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}

// SQLx row types

#[derive(Debug)]
struct RequestRow {
    id: Uuid,
    command_name: String,
    context: serde_json::Value,
    business_key: Option<String>,
    status: String,
    fire_time: DateTime<Utc>,
    owner: Option<String>,
    retry_count: i32,
    response: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for RequestRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(RequestRow {
            id: row.try_get("id")?,
            command_name: row.try_get("command_name")?,
            context: row.try_get("context")?,
            business_key: row.try_get("business_key")?,
            status: row.try_get("status")?,
            fire_time: row.try_get("fire_time")?,
            owner: row.try_get("owner")?,
            retry_count: row.try_get("retry_count")?,
            response: row.try_get("response")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<RequestRow> for Request {
    type Error = StoreError;

    fn try_from(row: RequestRow) -> Result<Self, Self::Error> {
        let decode = |e: forgeexec_core::DomainError| StoreError::Decode(e.to_string());
        Ok(Request {
            id: RequestId::from_uuid(row.id),
            command_name: row.command_name,
            context: CommandContext::from_value(row.context).map_err(decode)?,
            business_key: row.business_key,
            status: parse_status(&row.status)?,
            fire_time: row.fire_time,
            owner: row.owner.map(WorkerId::new),
            retry_count: u32::try_from(row.retry_count)
                .map_err(|_| StoreError::Decode(format!("negative retry_count {}", row.retry_count)))?,
            response: row
                .response
                .map(CommandContext::from_value)
                .transpose()
                .map_err(decode)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug)]
struct ErrorRow {
    id: Uuid,
    request_id: Uuid,
    message: String,
    detail: Option<String>,
    occurred_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for ErrorRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ErrorRow {
            id: row.try_get("id")?,
            request_id: row.try_get("request_id")?,
            message: row.try_get("message")?,
            detail: row.try_get("detail")?,
            occurred_at: row.try_get("occurred_at")?,
        })
    }
}

impl From<ErrorRow> for ErrorRecord {
    fn from(row: ErrorRow) -> Self {
        ErrorRecord {
            id: ErrorId::from_uuid(row.id),
            request_id: RequestId::from_uuid(row.request_id),
            message: row.message,
            detail: row.detail,
            occurred_at: row.occurred_at,
        }
    }
}

// Synchronous store contract

impl RequestStore for PostgresRequestStore {
    fn ensure_ready(&self) -> StoreResult<()> {
        self.block_on(self.ensure_schema())
    }

    fn insert(&self, request: Request) -> StoreResult<RequestId> {
        self.block_on(self.insert_request(request))
    }

    fn eligible(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Request>> {
        self.block_on(self.select_requests(RequestFilter {
            statuses: Some(status_names(&RequestStatus::CLAIMABLE)),
            due_at: Some(now),
            limit: Some(i64::try_from(limit).unwrap_or(i64::MAX)),
            by_fire_time: true,
            ..Default::default()
        }))
    }

    fn claim(
        &self,
        id: RequestId,
        expected: RequestStatus,
        owner: &WorkerId,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Request>> {
        self.block_on(self.claim_request(id, expected, owner, now))
    }

    fn update_outcome(
        &self,
        id: RequestId,
        owner: &WorkerId,
        outcome: OutcomeWrite,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.block_on(self.apply_outcome(id, owner, outcome, now))
    }

    fn cancel(&self, id: RequestId, now: DateTime<Utc>) -> StoreResult<CancelResult> {
        self.block_on(self.cancel_request(id, now))
    }
}

impl RequestQuery for PostgresRequestStore {
    fn get(&self, id: RequestId) -> StoreResult<Option<Request>> {
        let found = self.block_on(self.select_requests(RequestFilter {
            id: Some(*id.as_uuid()),
            ..Default::default()
        }))?;
        Ok(found.into_iter().next())
    }

    fn all_requests(&self) -> StoreResult<Vec<Request>> {
        self.block_on(self.select_requests(RequestFilter::default()))
    }

    fn requests_by_status(&self, statuses: &[RequestStatus]) -> StoreResult<Vec<Request>> {
        self.block_on(self.select_requests(RequestFilter {
            statuses: Some(status_names(statuses)),
            ..Default::default()
        }))
    }

    fn future_queued(&self, now: DateTime<Utc>) -> StoreResult<Vec<Request>> {
        self.block_on(self.select_requests(RequestFilter {
            statuses: Some(status_names(&RequestStatus::CLAIMABLE)),
            after: Some(now),
            by_fire_time: true,
            ..Default::default()
        }))
    }

    fn pending(&self, now: DateTime<Utc>) -> StoreResult<Vec<Request>> {
        self.block_on(self.select_requests(RequestFilter {
            statuses: Some(status_names(&RequestStatus::CLAIMABLE)),
            due_at: Some(now),
            by_fire_time: true,
            ..Default::default()
        }))
    }

    fn pending_by_id(&self, id: RequestId, now: DateTime<Utc>) -> StoreResult<Option<Request>> {
        let found = self.block_on(self.select_requests(RequestFilter {
            statuses: Some(status_names(&RequestStatus::CLAIMABLE)),
            due_at: Some(now),
            id: Some(*id.as_uuid()),
            ..Default::default()
        }))?;
        Ok(found.into_iter().next())
    }

    fn by_business_key(&self, key: &str) -> StoreResult<Vec<Request>> {
        self.block_on(self.select_requests(RequestFilter {
            business_key: Some(key),
            ..Default::default()
        }))
    }

    fn errors(&self) -> StoreResult<Vec<ErrorRecord>> {
        self.block_on(self.select_errors(None))
    }

    fn errors_for(&self, id: RequestId) -> StoreResult<Vec<ErrorRecord>> {
        self.block_on(self.select_errors(Some(id)))
    }
}

impl RequestAdmin for PostgresRequestStore {
    fn clear_all_requests(&self) -> StoreResult<usize> {
        let count = self.block_on(self.purge(false))?;
        Ok(count as usize)
    }

    fn clear_all_errors(&self) -> StoreResult<usize> {
        let count = self.block_on(self.purge(true))?;
        Ok(count as usize)
    }
}

impl RequeueStore for PostgresRequestStore {
    fn requeue_stale(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> StoreResult<usize> {
        let count = self.block_on(self.requeue_running(None, Some(cutoff), now))?;
        Ok(count as usize)
    }

    fn requeue_by_id(&self, id: RequestId, now: DateTime<Utc>) -> StoreResult<bool> {
        let count = self.block_on(self.requeue_running(Some(id), None, now))?;
        Ok(count > 0)
    }
}
