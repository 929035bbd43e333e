//! Postgres-backed engine store.
//!
//! Stock counters live in typed columns so the database can enforce
//! `0 <= reserved <= total` on its own. Orders and restock requests are stored
//! as JSONB state next to a `version` column used for optimistic checks.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `Conflict` | Concurrent insert, or a second open restock request |
//! | Database (check violation) | `23514` | `Corrupt` | Counters outside `0 <= reserved <= total` |
//! | Database (serialization failure) | `40001` | `Conflict` | Concurrent transaction won |
//! | Database (other) | Any other | `Unavailable` | Other database errors |
//! | PoolClosed / Io / Tls | N/A | `Unavailable` | Connection failures |
//!
//! ## Runtime
//!
//! The store owns a tokio runtime and blocks on it, so the `EngineStore` methods
//! stay synchronous. Do not call them from inside an async task.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Runtime;
use tracing::{Span, instrument};
use uuid::Uuid;

use stockflow_core::{AggregateId, AggregateRoot, ExpectedVersion};
use stockflow_inventory::{
    InventoryTransaction, ProductId, StockLevel, StockRecord, TransactionId, TransactionKind,
};
use stockflow_purchasing::{RestockRequest, RestockRequestId};
use stockflow_sales::{Order, OrderId};

use super::{AuditRecord, EngineStore, StoreError, UnitOfWork};

/// Schema used by [`PostgresEngineStore::ensure_schema`].
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS stock_records (
    product_id        UUID PRIMARY KEY,
    total_quantity    BIGINT  NOT NULL CHECK (total_quantity >= 0),
    reserved_quantity BIGINT  NOT NULL CHECK (reserved_quantity >= 0),
    reorder_threshold BIGINT  NOT NULL CHECK (reorder_threshold >= 0),
    active            BOOLEAN NOT NULL,
    version           BIGINT  NOT NULL,
    CHECK (reserved_quantity <= total_quantity)
);

CREATE TABLE IF NOT EXISTS orders (
    order_id UUID PRIMARY KEY,
    status   TEXT   NOT NULL,
    state    JSONB  NOT NULL,
    version  BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS restock_requests (
    request_id UUID PRIMARY KEY,
    product_id UUID   NOT NULL,
    status     TEXT   NOT NULL,
    state      JSONB  NOT NULL,
    version    BIGINT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS restock_requests_one_open
    ON restock_requests (product_id)
    WHERE status IN ('pending', 'sent');

CREATE TABLE IF NOT EXISTS inventory_transactions (
    sequence           BIGSERIAL PRIMARY KEY,
    transaction_id     UUID        NOT NULL UNIQUE,
    product_id         UUID        NOT NULL,
    kind               TEXT        NOT NULL,
    delta              BIGINT      NOT NULL,
    total_before       BIGINT      NOT NULL,
    total_after        BIGINT      NOT NULL,
    reserved_before    BIGINT      NOT NULL,
    reserved_after     BIGINT      NOT NULL,
    reference_order_id UUID        NULL,
    occurred_at        TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS inventory_transactions_by_product
    ON inventory_transactions (product_id, sequence);
"#;

/// Postgres-backed engine store.
///
/// One SQL transaction per [`UnitOfWork`]. Stock rows are updated before audit
/// rows are inserted, so a product's audit sequence follows its write order.
#[derive(Debug)]
pub struct PostgresEngineStore {
    pool: PgPool,
    runtime: Runtime,
}

impl PostgresEngineStore {
    /// Connect using `DATABASE_URL`.
    pub fn from_env() -> Result<Self, StoreError> {
        let url = std::env::var("DATABASE_URL")
            .map_err(|_| StoreError::Unavailable("DATABASE_URL is not set".to_string()))?;
        Self::connect(&url, 10)
    }

    pub fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| StoreError::Unavailable(format!("failed to start runtime: {e}")))?;

        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(max_connections)
                    .connect(url),
            )
            .map_err(|e| map_sqlx_error("connect", e))?;

        Ok(Self { pool, runtime })
    }

    /// Create tables and indexes if they do not exist.
    pub fn ensure_schema(&self) -> Result<(), StoreError> {
        self.runtime
            .block_on(sqlx::raw_sql(SCHEMA).execute(&self.pool))
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    #[instrument(skip(self, unit), fields(
        stock_writes = unit.stock.len(),
        order_writes = unit.orders.len(),
        restock_writes = unit.restock_requests.len(),
        audit_entries = unit.audit.len(),
        committed_audit = tracing::field::Empty,
    ), err)]
    async fn commit_unit(&self, unit: UnitOfWork) -> Result<Vec<AuditRecord>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // Any early return drops `tx`, which rolls it back.
        for w in &unit.stock {
            write_stock(&mut tx, &w.record, w.expected).await?;
        }
        for w in &unit.orders {
            write_order(&mut tx, &w.order, w.expected).await?;
        }
        for w in &unit.restock_requests {
            write_restock_request(&mut tx, &w.request, w.expected).await?;
        }

        let mut committed = Vec::with_capacity(unit.audit.len());
        for entry in unit.audit {
            let sequence = insert_audit(&mut tx, &entry).await?;
            committed.push(AuditRecord {
                sequence,
                transaction: entry,
            });
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Span::current().record("committed_audit", committed.len());
        Ok(committed)
    }
}

impl EngineStore for PostgresEngineStore {
    fn load_stock(&self, product_id: ProductId) -> Result<Option<StockRecord>, StoreError> {
        let row = self
            .runtime
            .block_on(
                sqlx::query(
                    r#"
                    SELECT product_id, total_quantity, reserved_quantity,
                           reorder_threshold, active, version
                    FROM stock_records
                    WHERE product_id = $1
                    "#,
                )
                .bind(product_id.0.as_uuid())
                .fetch_optional(&self.pool),
            )
            .map_err(|e| map_sqlx_error("load_stock", e))?;

        row.map(|r| stock_from_row(&r)).transpose()
    }

    fn load_order(&self, order_id: OrderId) -> Result<Option<Order>, StoreError> {
        let row = self
            .runtime
            .block_on(
                sqlx::query("SELECT state FROM orders WHERE order_id = $1")
                    .bind(order_id.0.as_uuid())
                    .fetch_optional(&self.pool),
            )
            .map_err(|e| map_sqlx_error("load_order", e))?;

        row.map(|r| state_from_row(&r, "order")).transpose()
    }

    fn load_restock_request(
        &self,
        request_id: RestockRequestId,
    ) -> Result<Option<RestockRequest>, StoreError> {
        let row = self
            .runtime
            .block_on(
                sqlx::query("SELECT state FROM restock_requests WHERE request_id = $1")
                    .bind(request_id.0.as_uuid())
                    .fetch_optional(&self.pool),
            )
            .map_err(|e| map_sqlx_error("load_restock_request", e))?;

        row.map(|r| state_from_row(&r, "restock request")).transpose()
    }

    fn open_restock_request(
        &self,
        product_id: ProductId,
    ) -> Result<Option<RestockRequest>, StoreError> {
        let row = self
            .runtime
            .block_on(
                sqlx::query(
                    r#"
                    SELECT state FROM restock_requests
                    WHERE product_id = $1 AND status IN ('pending', 'sent')
                    "#,
                )
                .bind(product_id.0.as_uuid())
                .fetch_optional(&self.pool),
            )
            .map_err(|e| map_sqlx_error("open_restock_request", e))?;

        row.map(|r| state_from_row(&r, "restock request")).transpose()
    }

    fn product_ids(&self) -> Result<Vec<ProductId>, StoreError> {
        let rows = self
            .runtime
            .block_on(
                sqlx::query("SELECT product_id FROM stock_records ORDER BY product_id ASC")
                    .fetch_all(&self.pool),
            )
            .map_err(|e| map_sqlx_error("product_ids", e))?;

        rows.iter()
            .map(|r| {
                let id: Uuid = r.try_get("product_id").map_err(decode_error)?;
                Ok(ProductId::new(AggregateId::from_uuid(id)))
            })
            .collect()
    }

    fn audit_page(
        &self,
        product_id: ProductId,
        since: DateTime<Utc>,
        after_sequence: u64,
        limit: usize,
    ) -> Result<Vec<AuditRecord>, StoreError> {
        let rows = self
            .runtime
            .block_on(
                sqlx::query(
                    r#"
                    SELECT sequence, transaction_id, product_id, kind, delta,
                           total_before, total_after, reserved_before, reserved_after,
                           reference_order_id, occurred_at
                    FROM inventory_transactions
                    WHERE product_id = $1 AND occurred_at >= $2 AND sequence > $3
                    ORDER BY sequence ASC
                    LIMIT $4
                    "#,
                )
                .bind(product_id.0.as_uuid())
                .bind(since)
                .bind(after_sequence as i64)
                .bind(limit as i64)
                .fetch_all(&self.pool),
            )
            .map_err(|e| map_sqlx_error("audit_page", e))?;

        rows.iter().map(audit_from_row).collect()
    }

    fn commit(&self, unit: UnitOfWork) -> Result<Vec<AuditRecord>, StoreError> {
        if unit.is_empty() {
            return Ok(vec![]);
        }
        unit.ensure_distinct()?;
        self.runtime.block_on(self.commit_unit(unit))
    }
}

async fn write_stock(
    tx: &mut Transaction<'_, Postgres>,
    record: &StockRecord,
    expected: ExpectedVersion,
) -> Result<(), StoreError> {
    let level = record.level();
    let id = record.id_typed();

    let result = match expected {
        ExpectedVersion::Exact(0) => {
            sqlx::query(
                r#"
                INSERT INTO stock_records (
                    product_id, total_quantity, reserved_quantity,
                    reorder_threshold, active, version
                )
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (product_id) DO NOTHING
                "#,
            )
            .bind(id.0.as_uuid())
            .bind(level.total)
            .bind(level.reserved)
            .bind(record.reorder_threshold())
            .bind(record.is_active())
            .bind(record.version() as i64)
            .execute(&mut **tx)
            .await
        }
        ExpectedVersion::Exact(v) => {
            sqlx::query(
                r#"
                UPDATE stock_records
                SET total_quantity = $2, reserved_quantity = $3,
                    reorder_threshold = $4, active = $5, version = $6
                WHERE product_id = $1 AND version = $7
                "#,
            )
            .bind(id.0.as_uuid())
            .bind(level.total)
            .bind(level.reserved)
            .bind(record.reorder_threshold())
            .bind(record.is_active())
            .bind(record.version() as i64)
            .bind(v as i64)
            .execute(&mut **tx)
            .await
        }
        ExpectedVersion::Any => {
            sqlx::query(
                r#"
                INSERT INTO stock_records (
                    product_id, total_quantity, reserved_quantity,
                    reorder_threshold, active, version
                )
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (product_id) DO UPDATE SET
                    total_quantity = EXCLUDED.total_quantity,
                    reserved_quantity = EXCLUDED.reserved_quantity,
                    reorder_threshold = EXCLUDED.reorder_threshold,
                    active = EXCLUDED.active,
                    version = EXCLUDED.version
                "#,
            )
            .bind(id.0.as_uuid())
            .bind(level.total)
            .bind(level.reserved)
            .bind(record.reorder_threshold())
            .bind(record.is_active())
            .bind(record.version() as i64)
            .execute(&mut **tx)
            .await
        }
    }
    .map_err(|e| map_sqlx_error("write_stock", e))?;

    if result.rows_affected() == 0 {
        return Err(StoreError::Conflict(format!(
            "stock record {id}: expected {expected:?}"
        )));
    }
    Ok(())
}

/// Shared upsert for JSONB-state tables (`orders`, `restock_requests`).
async fn write_state(
    tx: &mut Transaction<'_, Postgres>,
    table: StateTable,
    id: Uuid,
    product_id: Option<Uuid>,
    status: &str,
    state: JsonValue,
    version: u64,
    expected: ExpectedVersion,
) -> Result<(), StoreError> {
    let (insert, update, upsert) = table.statements();

    let query = match expected {
        ExpectedVersion::Exact(0) => sqlx::query(insert),
        ExpectedVersion::Exact(_) => sqlx::query(update),
        ExpectedVersion::Any => sqlx::query(upsert),
    };

    let mut query = query.bind(id);
    if let StateTable::RestockRequests = table {
        query = query.bind(product_id);
    }
    query = query.bind(status).bind(state).bind(version as i64);
    if let ExpectedVersion::Exact(v) = expected {
        if v != 0 {
            query = query.bind(v as i64);
        }
    }

    let result = query
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error(table.operation(), e))?;

    if result.rows_affected() == 0 {
        return Err(StoreError::Conflict(format!(
            "{} {id}: expected {expected:?}",
            table.label()
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum StateTable {
    Orders,
    RestockRequests,
}

impl StateTable {
    fn label(self) -> &'static str {
        match self {
            StateTable::Orders => "order",
            StateTable::RestockRequests => "restock request",
        }
    }

    fn operation(self) -> &'static str {
        match self {
            StateTable::Orders => "write_order",
            StateTable::RestockRequests => "write_restock_request",
        }
    }

    /// `(insert, version-checked update, unconditional upsert)`.
    fn statements(self) -> (&'static str, &'static str, &'static str) {
        match self {
            StateTable::Orders => (
                r#"
                INSERT INTO orders (order_id, status, state, version)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (order_id) DO NOTHING
                "#,
                r#"
                UPDATE orders SET status = $2, state = $3, version = $4
                WHERE order_id = $1 AND version = $5
                "#,
                r#"
                INSERT INTO orders (order_id, status, state, version)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (order_id) DO UPDATE SET
                    status = EXCLUDED.status, state = EXCLUDED.state, version = EXCLUDED.version
                "#,
            ),
            // The partial unique index rejects a second open request with 23505.
            StateTable::RestockRequests => (
                r#"
                INSERT INTO restock_requests (request_id, product_id, status, state, version)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (request_id) DO NOTHING
                "#,
                r#"
                UPDATE restock_requests SET product_id = $2, status = $3, state = $4, version = $5
                WHERE request_id = $1 AND version = $6
                "#,
                r#"
                INSERT INTO restock_requests (request_id, product_id, status, state, version)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (request_id) DO UPDATE SET
                    product_id = EXCLUDED.product_id, status = EXCLUDED.status,
                    state = EXCLUDED.state, version = EXCLUDED.version
                "#,
            ),
        }
    }
}

async fn write_order(
    tx: &mut Transaction<'_, Postgres>,
    order: &Order,
    expected: ExpectedVersion,
) -> Result<(), StoreError> {
    let state = serde_json::to_value(order)
        .map_err(|e| StoreError::Corrupt(format!("order serialization failed: {e}")))?;
    write_state(
        tx,
        StateTable::Orders,
        *order.id_typed().0.as_uuid(),
        None,
        order.status().as_str(),
        state,
        order.version(),
        expected,
    )
    .await
}

async fn write_restock_request(
    tx: &mut Transaction<'_, Postgres>,
    request: &RestockRequest,
    expected: ExpectedVersion,
) -> Result<(), StoreError> {
    let product_id = request
        .product_id()
        .ok_or_else(|| StoreError::Corrupt("restock request has no product".to_string()))?;
    let state = serde_json::to_value(request)
        .map_err(|e| StoreError::Corrupt(format!("restock request serialization failed: {e}")))?;

    write_state(
        tx,
        StateTable::RestockRequests,
        *request.id_typed().0.as_uuid(),
        Some(*product_id.0.as_uuid()),
        request.status().as_str(),
        state,
        request.version(),
        expected,
    )
    .await
}

async fn insert_audit(
    tx: &mut Transaction<'_, Postgres>,
    entry: &InventoryTransaction,
) -> Result<u64, StoreError> {
    let row = sqlx::query(
        r#"
        INSERT INTO inventory_transactions (
            transaction_id, product_id, kind, delta,
            total_before, total_after, reserved_before, reserved_after,
            reference_order_id, occurred_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        RETURNING sequence
        "#,
    )
    .bind(entry.transaction_id.0)
    .bind(entry.product_id.0.as_uuid())
    .bind(entry.kind.as_str())
    .bind(entry.delta)
    .bind(entry.total_before)
    .bind(entry.total_after)
    .bind(entry.reserved_before)
    .bind(entry.reserved_after)
    .bind(entry.reference_order_id.map(|id| *id.as_uuid()))
    .bind(entry.occurred_at)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_audit", e))?;

    let sequence: i64 = row.try_get("sequence").map_err(decode_error)?;
    Ok(sequence as u64)
}

fn stock_from_row(row: &PgRow) -> Result<StockRecord, StoreError> {
    let id: Uuid = row.try_get("product_id").map_err(decode_error)?;
    let total: i64 = row.try_get("total_quantity").map_err(decode_error)?;
    let reserved: i64 = row.try_get("reserved_quantity").map_err(decode_error)?;
    let threshold: i64 = row.try_get("reorder_threshold").map_err(decode_error)?;
    let active: bool = row.try_get("active").map_err(decode_error)?;
    let version: i64 = row.try_get("version").map_err(decode_error)?;

    StockRecord::restore(
        ProductId::new(AggregateId::from_uuid(id)),
        StockLevel { total, reserved },
        threshold,
        active,
        version as u64,
    )
    .map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn state_from_row<T: serde::de::DeserializeOwned>(row: &PgRow, label: &str) -> Result<T, StoreError> {
    let state: JsonValue = row.try_get("state").map_err(decode_error)?;
    serde_json::from_value(state)
        .map_err(|e| StoreError::Corrupt(format!("failed to decode {label} state: {e}")))
}

fn audit_from_row(row: &PgRow) -> Result<AuditRecord, StoreError> {
    let sequence: i64 = row.try_get("sequence").map_err(decode_error)?;
    let transaction_id: Uuid = row.try_get("transaction_id").map_err(decode_error)?;
    let product_id: Uuid = row.try_get("product_id").map_err(decode_error)?;
    let kind: String = row.try_get("kind").map_err(decode_error)?;
    let reference_order_id: Option<Uuid> =
        row.try_get("reference_order_id").map_err(decode_error)?;

    let kind = TransactionKind::parse(&kind)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown transaction kind '{kind}'")))?;

    Ok(AuditRecord {
        sequence: sequence as u64,
        transaction: InventoryTransaction {
            transaction_id: TransactionId::from_uuid(transaction_id),
            product_id: ProductId::new(AggregateId::from_uuid(product_id)),
            kind,
            delta: row.try_get("delta").map_err(decode_error)?,
            total_before: row.try_get("total_before").map_err(decode_error)?,
            total_after: row.try_get("total_after").map_err(decode_error)?,
            reserved_before: row.try_get("reserved_before").map_err(decode_error)?,
            reserved_after: row.try_get("reserved_after").map_err(decode_error)?,
            reference_order_id: reference_order_id.map(AggregateId::from_uuid),
            occurred_at: row.try_get("occurred_at").map_err(decode_error)?,
        },
    })
}

fn decode_error(err: sqlx::Error) -> StoreError {
    StoreError::Corrupt(format!("failed to decode row: {err}"))
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("40001") => StoreError::Conflict(msg),
                Some("23514") => StoreError::Corrupt(msg),
                _ => StoreError::Unavailable(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::RowNotFound => {
            StoreError::Corrupt(format!("unexpected row not found in {operation}"))
        }
        _ => StoreError::Unavailable(format!("sqlx error in {operation}: {err}")),
    }
}
