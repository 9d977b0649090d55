//! Postgres-backed ledger store.
//!
//! Persists the journal, balances, reservations and alerts in PostgreSQL.
//! Per-key serialization uses `SELECT ... FOR UPDATE` on the balance row:
//! every writer locks the rows of the keys it touches, in ascending key
//! order, inside one transaction. A `lock_timeout` bounds the wait so a
//! contended writer fails with `Conflict` instead of queueing forever.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `LedgerError` as follows:
//!
//! | SQLx Error | PostgreSQL Error Code | LedgerError | Scenario |
//! |------------|----------------------|-------------|----------|
//! | Database (unique violation) | `23505` | `Conflict` | Concurrent writer got there first (sequence slot, or duplicate active alert) |
//! | Database (lock not available) | `55P03` | `Conflict` | `lock_timeout` expired waiting for a key's balance row |
//! | Database (check constraint violation) | `23514` | `Validation` | Data the domain layer should have rejected (e.g. negative on_hand) |
//! | Database (foreign key violation) | `23503` | `Validation` | Referential integrity violation |
//! | Database (other) | Any other | `Internal` | Other database errors |
//! | PoolClosed | N/A | `Internal` | Connection pool was closed |
//! | RowNotFound | N/A | `Internal` | Unexpected row not found |
//! | Other | N/A | `Internal` | Network errors, connection failures, etc. |
//!
//! ## Thread Safety
//!
//! `PostgresLedgerStore` is `Send + Sync` and shares a SQLx connection
//! pool. The sync `LedgerStore` impl bridges onto the async methods via
//! the ambient tokio runtime.

use chrono::Utc;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{Span, instrument, warn};

use stockledger_core::{
    AlertId, LedgerError, LedgerResult, MovementId, ReservationId, StockKey, VariantId, WarehouseId,
};
use stockledger_ledger::{
    AlertKind, AlertStatus, InventoryBalance, MovementDraft, MovementKind, Reference, Reservation,
    ReservationStatus, StockAlert, StockMovement, TransferDirection, TransferLeg, desired_alert,
};

use super::{
    AlertTransitions, FulfillCommit, LedgerQuery, LedgerStore, MovementCommit, ReservationCommit,
};
use crate::query::{AlertFilter, BalanceFilter, HistoryRange, Page, Pagination, ReservationFilter};

const CREATE_BALANCES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS stock_balances (
    variant_id UUID NOT NULL,
    warehouse_id UUID NOT NULL,
    on_hand BIGINT NOT NULL DEFAULT 0 CHECK (on_hand >= 0),
    allocated BIGINT NOT NULL DEFAULT 0 CHECK (allocated >= 0),
    version BIGINT NOT NULL DEFAULT 0,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (variant_id, warehouse_id)
)
"#;

const CREATE_MOVEMENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS stock_movements (
    movement_id UUID PRIMARY KEY,
    variant_id UUID NOT NULL,
    warehouse_id UUID NOT NULL,
    kind TEXT NOT NULL,
    qty BIGINT NOT NULL,
    unit_cost BIGINT,
    transfer_direction TEXT,
    counterparty_warehouse_id UUID,
    reference_kind TEXT NOT NULL,
    reference_id UUID NOT NULL,
    occurred_at TIMESTAMPTZ NOT NULL,
    recorded_at TIMESTAMPTZ NOT NULL,
    sequence BIGINT NOT NULL CHECK (sequence > 0),
    UNIQUE (variant_id, warehouse_id, sequence)
)
"#;

const CREATE_RESERVATIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS stock_reservations (
    reservation_id UUID PRIMARY KEY,
    variant_id UUID NOT NULL,
    warehouse_id UUID NOT NULL,
    qty BIGINT NOT NULL CHECK (qty > 0),
    reference_kind TEXT NOT NULL,
    reference_id UUID NOT NULL,
    status TEXT NOT NULL,
    fulfilled_movement_id UUID,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
)
"#;

const CREATE_ALERTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS stock_alerts (
    alert_id UUID PRIMARY KEY,
    variant_id UUID NOT NULL,
    warehouse_id UUID NOT NULL,
    kind TEXT NOT NULL,
    status TEXT NOT NULL,
    threshold BIGINT NOT NULL,
    observed_on_hand BIGINT NOT NULL,
    raised_at TIMESTAMPTZ NOT NULL,
    cleared_at TIMESTAMPTZ
)
"#;

const CREATE_MOVEMENTS_KEY_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_stock_movements_key_occurred
    ON stock_movements (variant_id, warehouse_id, occurred_at)
"#;

const CREATE_RESERVATIONS_KEY_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_stock_reservations_key
    ON stock_reservations (variant_id, warehouse_id)
"#;

/// At most one active alert per (key, kind), enforced by the database even
/// if two reconciliations race.
const CREATE_ALERTS_ACTIVE_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_stock_alerts_one_active
    ON stock_alerts (variant_id, warehouse_id, kind)
    WHERE status = 'active'
"#;

const SCHEMA: &[&str] = &[
    CREATE_BALANCES_TABLE,
    CREATE_MOVEMENTS_TABLE,
    CREATE_RESERVATIONS_TABLE,
    CREATE_ALERTS_TABLE,
    CREATE_MOVEMENTS_KEY_INDEX,
    CREATE_RESERVATIONS_KEY_INDEX,
    CREATE_ALERTS_ACTIVE_INDEX,
];

/// Bounded wait for balance row locks. Past this, writers fail with
/// `Conflict` (55P03) and the caller decides whether to retry.
const SET_LOCK_TIMEOUT: &str = "SET LOCAL lock_timeout = '2000ms'";

/// Postgres-backed ledger store.
///
/// All mutating methods run a single transaction that locks the balance
/// rows of the keys they touch (`SELECT ... FOR UPDATE`, ascending key
/// order), applies the domain state machines, and writes journal, balance,
/// reservation and alert rows together. Readers never lock.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the ledger tables and indexes if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn init_schema(&self) -> LedgerResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("init_schema", e))?;
        }
        Ok(())
    }

    /// Append a batch of drafts and apply them to the affected balances in
    /// one transaction.
    #[instrument(skip(self, drafts), fields(batch = drafts.len()), err)]
    pub async fn append_movements(
        &self,
        drafts: Vec<MovementDraft>,
    ) -> LedgerResult<MovementCommit> {
        if drafts.is_empty() {
            return Ok(MovementCommit {
                movements: vec![],
                balances: vec![],
            });
        }

        let span = Span::current();
        span.record("operation", "append_movements");

        let mut keys: Vec<StockKey> = drafts.iter().map(|d| d.key).collect();
        keys.sort();
        keys.dedup();

        let mut tx = self.begin().await?;

        // Lock balance rows in ascending key order, creating missing rows
        // first. This is the per-key write serialization.
        let mut staged: Vec<(StockKey, InventoryBalance)> = Vec::with_capacity(keys.len());
        for &key in &keys {
            staged.push((key, lock_balance(&mut tx, key).await?));
        }

        // Stage every draft before writing anything, so a failing draft
        // aborts the whole batch.
        for draft in &drafts {
            let Some((_, balance)) = staged.iter_mut().find(|(k, _)| *k == draft.key) else {
                return Err(LedgerError::internal("draft key missing from lock set"));
            };
            if let Err(err) = balance.apply_movement(draft) {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(err);
            }
        }

        let mut movements = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let sequence = next_sequence(&mut tx, draft.key).await?;
            let movement = StockMovement::commit(draft, sequence);
            insert_movement(&mut tx, &movement).await?;
            movements.push(movement);
        }

        for (key, balance) in &staged {
            if balance.available() < 0 {
                warn!(
                    key = %key,
                    available = balance.available(),
                    "adjustment drove available negative, outstanding holds exceed stock"
                );
            }
            save_balance(&mut tx, balance).await?;
        }

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;

        span.record("committed", movements.len());
        Ok(MovementCommit {
            movements,
            balances: staged.into_iter().map(|(_, b)| b).collect(),
        })
    }

    /// Persist a reservation and take its hold, atomically.
    #[instrument(
        skip(self, reservation),
        fields(reservation_id = %reservation.id, qty = reservation.qty),
        err
    )]
    pub async fn create_reservation(
        &self,
        reservation: Reservation,
    ) -> LedgerResult<ReservationCommit> {
        let mut tx = self.begin().await?;
        let mut balance = lock_balance(&mut tx, reservation.key).await?;

        if let Err(err) = balance.reserve(reservation.qty) {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(err);
        }

        insert_reservation(&mut tx, &reservation).await?;
        save_balance(&mut tx, &balance).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;

        Ok(ReservationCommit {
            balance: Some(balance),
            reservation,
            changed: true,
        })
    }

    /// Release a hold back to available stock.
    #[instrument(skip(self), err)]
    pub async fn release_reservation(
        &self,
        id: ReservationId,
    ) -> LedgerResult<ReservationCommit> {
        let mut tx = self.begin().await?;
        let (mut balance, mut reservation) = lock_reservation_scope(&mut tx, id).await?;

        let changed = reservation.release(Utc::now());
        if changed {
            if let Err(err) = balance.release_hold(reservation.qty) {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(err);
            }
            update_reservation(&mut tx, &reservation).await?;
            save_balance(&mut tx, &balance).await?;
            tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        } else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
        }

        Ok(ReservationCommit {
            balance: changed.then_some(balance),
            reservation,
            changed,
        })
    }

    /// Fulfill a hold: journal the OUT movement and drop `allocated` and
    /// `on_hand` together.
    #[instrument(skip(self), err)]
    pub async fn fulfill_reservation(&self, id: ReservationId) -> LedgerResult<FulfillCommit> {
        let mut tx = self.begin().await?;
        let (mut balance, mut reservation) = lock_reservation_scope(&mut tx, id).await?;

        let now = Utc::now();
        let draft = MovementDraft::issue(
            reservation.key,
            reservation.qty,
            None,
            Reference::reservation(*id.as_uuid()),
            now,
        )?;
        let sequence = next_sequence(&mut tx, reservation.key).await?;
        let movement = StockMovement::commit(draft, sequence);

        let changed = reservation.fulfill(movement.id, now);
        if !changed {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(FulfillCommit {
                reservation,
                movement: None,
                balance: None,
            });
        }

        if let Err(err) = balance.fulfill_hold(reservation.qty) {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(err);
        }

        insert_movement(&mut tx, &movement).await?;
        update_reservation(&mut tx, &reservation).await?;
        save_balance(&mut tx, &balance).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;

        Ok(FulfillCommit {
            balance: Some(balance),
            reservation,
            movement: Some(movement),
        })
    }

    /// Bring a key's alert rows in line with its committed balance.
    ///
    /// The balance row lock serializes reconciliations against writers, so
    /// the observation cannot go stale between read and apply. The partial
    /// unique index backs this up if two stores race anyway.
    #[instrument(skip(self), fields(key = %key), err)]
    pub async fn reconcile_alerts(
        &self,
        key: StockKey,
        threshold: i64,
    ) -> LedgerResult<AlertTransitions> {
        let mut tx = self.begin().await?;

        let Some(balance) = lock_balance_if_exists(&mut tx, key).await? else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(AlertTransitions::default());
        };

        let active = select_active_alerts(&mut tx, key).await?;
        let desired = desired_alert(balance.on_hand, threshold);
        let now = Utc::now();
        let mut transitions = AlertTransitions::default();

        for kind in AlertKind::ALL {
            let existing = active.iter().find(|a| a.kind == kind);
            match (desired == Some(kind), existing) {
                (true, None) => {
                    let alert = StockAlert::raise(key, kind, threshold, balance.on_hand, now);
                    insert_alert(&mut tx, &alert).await?;
                    transitions.raised.push(alert);
                }
                (false, Some(existing)) => {
                    let mut row = existing.clone();
                    row.clear(now);
                    clear_alert(&mut tx, &row).await?;
                    transitions.cleared.push(row);
                }
                _ => {}
            }
        }

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(transitions)
    }

    /// Read the committed balance for a key.
    pub async fn balance(&self, key: StockKey) -> LedgerResult<Option<InventoryBalance>> {
        let row = sqlx::query(
            r#"
            SELECT variant_id, warehouse_id, on_hand, allocated, version, updated_at
            FROM stock_balances
            WHERE variant_id = $1 AND warehouse_id = $2 AND version > 0
            "#,
        )
        .bind(*key.variant_id.as_uuid())
        .bind(*key.warehouse_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("balance", e))?;

        match row {
            Some(row) => Ok(Some(decode_balance(&row)?)),
            None => Ok(None),
        }
    }

    /// List balances matching the filter, ordered by stock key.
    pub async fn balances(
        &self,
        filter: &BalanceFilter,
        pagination: Pagination,
    ) -> LedgerResult<Page<InventoryBalance>> {
        let warehouse = filter.warehouse_id.map(|w| *w.as_uuid());
        let variant = filter.variant_id.map(|v| *v.as_uuid());

        let count_row = sqlx::query(
            r#"
            SELECT COUNT(*) as total
            FROM stock_balances
            WHERE version > 0
                AND ($1::uuid IS NULL OR warehouse_id = $1)
                AND ($2::uuid IS NULL OR variant_id = $2)
                AND ($3::bigint IS NULL OR on_hand - allocated <= $3)
            "#,
        )
        .bind(warehouse)
        .bind(variant)
        .bind(filter.available_at_most)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_balances", e))?;
        let total: i64 = count_row
            .try_get("total")
            .map_err(|e| decode_error("total", e))?;

        let rows = sqlx::query(
            r#"
            SELECT variant_id, warehouse_id, on_hand, allocated, version, updated_at
            FROM stock_balances
            WHERE version > 0
                AND ($1::uuid IS NULL OR warehouse_id = $1)
                AND ($2::uuid IS NULL OR variant_id = $2)
                AND ($3::bigint IS NULL OR on_hand - allocated <= $3)
            ORDER BY variant_id ASC, warehouse_id ASC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(warehouse)
        .bind(variant)
        .bind(filter.available_at_most)
        .bind(pagination.limit as i64)
        .bind(pagination.offset as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("balances", e))?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            items.push(decode_balance(&row)?);
        }
        Ok(Page::new(items, total as u64, pagination))
    }

    /// Read a key's journal within the range, ordered by sequence.
    pub async fn history(
        &self,
        key: StockKey,
        range: &HistoryRange,
    ) -> LedgerResult<Vec<StockMovement>> {
        let kind = range.kind.map(|k| k.as_str());
        let rows = sqlx::query(
            r#"
            SELECT movement_id, variant_id, warehouse_id, kind, qty, unit_cost,
                   transfer_direction, counterparty_warehouse_id,
                   reference_kind, reference_id, occurred_at, recorded_at, sequence
            FROM stock_movements
            WHERE variant_id = $1 AND warehouse_id = $2
                AND ($3::timestamptz IS NULL OR occurred_at >= $3)
                AND ($4::timestamptz IS NULL OR occurred_at <= $4)
                AND ($5::text IS NULL OR kind = $5)
            ORDER BY sequence ASC
            "#,
        )
        .bind(*key.variant_id.as_uuid())
        .bind(*key.warehouse_id.as_uuid())
        .bind(range.occurred_after)
        .bind(range.occurred_before)
        .bind(kind)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("history", e))?;

        let mut movements = Vec::with_capacity(rows.len());
        for row in rows {
            let decoded = MovementRow::from_row(&row).map_err(|e| decode_error("movement", e))?;
            movements.push(decoded.into_movement()?);
        }
        Ok(movements)
    }

    /// Read a reservation by id.
    pub async fn reservation(&self, id: ReservationId) -> LedgerResult<Option<Reservation>> {
        let row = sqlx::query(
            r#"
            SELECT reservation_id, variant_id, warehouse_id, qty, reference_kind, reference_id,
                   status, fulfilled_movement_id, created_at, updated_at
            FROM stock_reservations
            WHERE reservation_id = $1
            "#,
        )
        .bind(*id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reservation", e))?;

        match row {
            Some(row) => {
                let decoded =
                    ReservationRow::from_row(&row).map_err(|e| decode_error("reservation", e))?;
                Ok(Some(decoded.into_reservation()?))
            }
            None => Ok(None),
        }
    }

    /// List reservations matching the filter, newest first.
    pub async fn reservations(
        &self,
        filter: &ReservationFilter,
        pagination: Pagination,
    ) -> LedgerResult<Page<Reservation>> {
        let variant = filter.key.map(|k| *k.variant_id.as_uuid());
        let warehouse = filter.key.map(|k| *k.warehouse_id.as_uuid());
        let status = filter.status.map(|s| s.as_str());

        let count_row = sqlx::query(
            r#"
            SELECT COUNT(*) as total
            FROM stock_reservations
            WHERE ($1::uuid IS NULL OR variant_id = $1)
                AND ($2::uuid IS NULL OR warehouse_id = $2)
                AND ($3::text IS NULL OR status = $3)
            "#,
        )
        .bind(variant)
        .bind(warehouse)
        .bind(status)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_reservations", e))?;
        let total: i64 = count_row
            .try_get("total")
            .map_err(|e| decode_error("total", e))?;

        let rows = sqlx::query(
            r#"
            SELECT reservation_id, variant_id, warehouse_id, qty, reference_kind, reference_id,
                   status, fulfilled_movement_id, created_at, updated_at
            FROM stock_reservations
            WHERE ($1::uuid IS NULL OR variant_id = $1)
                AND ($2::uuid IS NULL OR warehouse_id = $2)
                AND ($3::text IS NULL OR status = $3)
            ORDER BY created_at DESC, reservation_id DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(variant)
        .bind(warehouse)
        .bind(status)
        .bind(pagination.limit as i64)
        .bind(pagination.offset as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reservations", e))?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let decoded =
                ReservationRow::from_row(&row).map_err(|e| decode_error("reservation", e))?;
            items.push(decoded.into_reservation()?);
        }
        Ok(Page::new(items, total as u64, pagination))
    }

    /// List alerts matching the filter, newest first.
    pub async fn alerts(
        &self,
        filter: &AlertFilter,
        pagination: Pagination,
    ) -> LedgerResult<Page<StockAlert>> {
        let warehouse = filter.warehouse_id.map(|w| *w.as_uuid());
        let kind = filter.kind.map(|k| k.as_str());
        let status = filter.status.map(|s| s.as_str());

        let count_row = sqlx::query(
            r#"
            SELECT COUNT(*) as total
            FROM stock_alerts
            WHERE ($1::uuid IS NULL OR warehouse_id = $1)
                AND ($2::text IS NULL OR kind = $2)
                AND ($3::text IS NULL OR status = $3)
            "#,
        )
        .bind(warehouse)
        .bind(kind)
        .bind(status)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_alerts", e))?;
        let total: i64 = count_row
            .try_get("total")
            .map_err(|e| decode_error("total", e))?;

        let rows = sqlx::query(
            r#"
            SELECT alert_id, variant_id, warehouse_id, kind, status, threshold,
                   observed_on_hand, raised_at, cleared_at
            FROM stock_alerts
            WHERE ($1::uuid IS NULL OR warehouse_id = $1)
                AND ($2::text IS NULL OR kind = $2)
                AND ($3::text IS NULL OR status = $3)
            ORDER BY raised_at DESC, alert_id DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(warehouse)
        .bind(kind)
        .bind(status)
        .bind(pagination.limit as i64)
        .bind(pagination.offset as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("alerts", e))?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let decoded = AlertRow::from_row(&row).map_err(|e| decode_error("alert", e))?;
            items.push(decoded.into_alert()?);
        }
        Ok(Page::new(items, total as u64, pagination))
    }

    async fn begin(&self) -> LedgerResult<Transaction<'static, Postgres>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        sqlx::query(SET_LOCK_TIMEOUT)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_lock_timeout", e))?;
        Ok(tx)
    }
}

/// Lock a key's balance row for the rest of the transaction, creating the
/// zero row first if the key has never been seen.
async fn lock_balance(
    tx: &mut Transaction<'_, Postgres>,
    key: StockKey,
) -> LedgerResult<InventoryBalance> {
    sqlx::query(
        r#"
        INSERT INTO stock_balances (variant_id, warehouse_id, on_hand, allocated, version, updated_at)
        VALUES ($1, $2, 0, 0, 0, NOW())
        ON CONFLICT (variant_id, warehouse_id) DO NOTHING
        "#,
    )
    .bind(*key.variant_id.as_uuid())
    .bind(*key.warehouse_id.as_uuid())
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("ensure_balance_row", e))?;

    let row = sqlx::query(
        r#"
        SELECT variant_id, warehouse_id, on_hand, allocated, version, updated_at
        FROM stock_balances
        WHERE variant_id = $1 AND warehouse_id = $2
        FOR UPDATE
        "#,
    )
    .bind(*key.variant_id.as_uuid())
    .bind(*key.warehouse_id.as_uuid())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("lock_balance", e))?;

    decode_balance(&row)
}

async fn lock_balance_if_exists(
    tx: &mut Transaction<'_, Postgres>,
    key: StockKey,
) -> LedgerResult<Option<InventoryBalance>> {
    let row = sqlx::query(
        r#"
        SELECT variant_id, warehouse_id, on_hand, allocated, version, updated_at
        FROM stock_balances
        WHERE variant_id = $1 AND warehouse_id = $2 AND version > 0
        FOR UPDATE
        "#,
    )
    .bind(*key.variant_id.as_uuid())
    .bind(*key.warehouse_id.as_uuid())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("lock_balance_if_exists", e))?;

    match row {
        Some(row) => Ok(Some(decode_balance(&row)?)),
        None => Ok(None),
    }
}

/// Resolve a reservation's key, lock that key's balance row, then re-read
/// the reservation under the lock.
///
/// Every writer of a reservation row holds its key's balance lock, so the
/// re-read is stable for the rest of the transaction.
async fn lock_reservation_scope(
    tx: &mut Transaction<'_, Postgres>,
    id: ReservationId,
) -> LedgerResult<(InventoryBalance, Reservation)> {
    let head = sqlx::query(
        "SELECT variant_id, warehouse_id FROM stock_reservations WHERE reservation_id = $1",
    )
    .bind(*id.as_uuid())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("find_reservation", e))?;

    let Some(head) = head else {
        return Err(LedgerError::not_found(format!("reservation {id}")));
    };
    let variant_id: uuid::Uuid = head
        .try_get("variant_id")
        .map_err(|e| decode_error("variant_id", e))?;
    let warehouse_id: uuid::Uuid = head
        .try_get("warehouse_id")
        .map_err(|e| decode_error("warehouse_id", e))?;
    let key = StockKey::new(
        VariantId::from_uuid(variant_id),
        WarehouseId::from_uuid(warehouse_id),
    );

    let balance = lock_balance(tx, key).await?;

    let row = sqlx::query(
        r#"
        SELECT reservation_id, variant_id, warehouse_id, qty, reference_kind, reference_id,
               status, fulfilled_movement_id, created_at, updated_at
        FROM stock_reservations
        WHERE reservation_id = $1
        FOR UPDATE
        "#,
    )
    .bind(*id.as_uuid())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("lock_reservation", e))?;
    let reservation = ReservationRow::from_row(&row)
        .map_err(|e| decode_error("reservation", e))?
        .into_reservation()?;

    Ok((balance, reservation))
}

async fn next_sequence(tx: &mut Transaction<'_, Postgres>, key: StockKey) -> LedgerResult<u64> {
    let row = sqlx::query(
        r#"
        SELECT COALESCE(MAX(sequence), 0) as current
        FROM stock_movements
        WHERE variant_id = $1 AND warehouse_id = $2
        "#,
    )
    .bind(*key.variant_id.as_uuid())
    .bind(*key.warehouse_id.as_uuid())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("next_sequence", e))?;

    let current: i64 = row
        .try_get("current")
        .map_err(|e| decode_error("current", e))?;
    Ok(current as u64 + 1)
}

async fn insert_movement(
    tx: &mut Transaction<'_, Postgres>,
    movement: &StockMovement,
) -> LedgerResult<()> {
    let (direction, counterparty) = match &movement.transfer {
        Some(leg) => (
            Some(leg.direction.as_str()),
            Some(*leg.counterparty.as_uuid()),
        ),
        None => (None, None),
    };

    sqlx::query(
        r#"
        INSERT INTO stock_movements (
            movement_id, variant_id, warehouse_id, kind, qty, unit_cost,
            transfer_direction, counterparty_warehouse_id,
            reference_kind, reference_id, occurred_at, recorded_at, sequence
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(*movement.id.as_uuid())
    .bind(*movement.key.variant_id.as_uuid())
    .bind(*movement.key.warehouse_id.as_uuid())
    .bind(movement.kind.as_str())
    .bind(movement.qty)
    .bind(movement.unit_cost)
    .bind(direction)
    .bind(counterparty)
    .bind(&movement.reference.kind)
    .bind(movement.reference.id)
    .bind(movement.occurred_at)
    .bind(movement.recorded_at)
    .bind(movement.sequence as i64)
    .execute(&mut **tx)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            LedgerError::conflict(format!(
                "concurrent append detected: sequence {} already exists for {}",
                movement.sequence, movement.key
            ))
        } else {
            map_sqlx_error("insert_movement", e)
        }
    })?;
    Ok(())
}

async fn save_balance(
    tx: &mut Transaction<'_, Postgres>,
    balance: &InventoryBalance,
) -> LedgerResult<()> {
    sqlx::query(
        r#"
        UPDATE stock_balances
        SET on_hand = $3, allocated = $4, version = $5, updated_at = $6
        WHERE variant_id = $1 AND warehouse_id = $2
        "#,
    )
    .bind(*balance.key.variant_id.as_uuid())
    .bind(*balance.key.warehouse_id.as_uuid())
    .bind(balance.on_hand)
    .bind(balance.allocated)
    .bind(balance.version as i64)
    .bind(balance.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("save_balance", e))?;
    Ok(())
}

async fn insert_reservation(
    tx: &mut Transaction<'_, Postgres>,
    reservation: &Reservation,
) -> LedgerResult<()> {
    sqlx::query(
        r#"
        INSERT INTO stock_reservations (
            reservation_id, variant_id, warehouse_id, qty, reference_kind, reference_id,
            status, fulfilled_movement_id, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(*reservation.id.as_uuid())
    .bind(*reservation.key.variant_id.as_uuid())
    .bind(*reservation.key.warehouse_id.as_uuid())
    .bind(reservation.qty)
    .bind(&reservation.reference.kind)
    .bind(reservation.reference.id)
    .bind(reservation.status.as_str())
    .bind(reservation.fulfilled_movement_id.map(|m| *m.as_uuid()))
    .bind(reservation.created_at)
    .bind(reservation.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_reservation", e))?;
    Ok(())
}

async fn update_reservation(
    tx: &mut Transaction<'_, Postgres>,
    reservation: &Reservation,
) -> LedgerResult<()> {
    sqlx::query(
        r#"
        UPDATE stock_reservations
        SET status = $2, fulfilled_movement_id = $3, updated_at = $4
        WHERE reservation_id = $1
        "#,
    )
    .bind(*reservation.id.as_uuid())
    .bind(reservation.status.as_str())
    .bind(reservation.fulfilled_movement_id.map(|m| *m.as_uuid()))
    .bind(reservation.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("update_reservation", e))?;
    Ok(())
}

async fn select_active_alerts(
    tx: &mut Transaction<'_, Postgres>,
    key: StockKey,
) -> LedgerResult<Vec<StockAlert>> {
    let rows = sqlx::query(
        r#"
        SELECT alert_id, variant_id, warehouse_id, kind, status, threshold,
               observed_on_hand, raised_at, cleared_at
        FROM stock_alerts
        WHERE variant_id = $1 AND warehouse_id = $2 AND status = 'active'
        "#,
    )
    .bind(*key.variant_id.as_uuid())
    .bind(*key.warehouse_id.as_uuid())
    .fetch_all(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("select_active_alerts", e))?;

    let mut alerts = Vec::with_capacity(rows.len());
    for row in rows {
        let decoded = AlertRow::from_row(&row).map_err(|e| decode_error("alert", e))?;
        alerts.push(decoded.into_alert()?);
    }
    Ok(alerts)
}

async fn insert_alert(tx: &mut Transaction<'_, Postgres>, alert: &StockAlert) -> LedgerResult<()> {
    sqlx::query(
        r#"
        INSERT INTO stock_alerts (
            alert_id, variant_id, warehouse_id, kind, status, threshold,
            observed_on_hand, raised_at, cleared_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(*alert.id.as_uuid())
    .bind(*alert.key.variant_id.as_uuid())
    .bind(*alert.key.warehouse_id.as_uuid())
    .bind(alert.kind.as_str())
    .bind(alert.status.as_str())
    .bind(alert.threshold)
    .bind(alert.observed_on_hand)
    .bind(alert.raised_at)
    .bind(alert.cleared_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_alert", e))?;
    Ok(())
}

async fn clear_alert(tx: &mut Transaction<'_, Postgres>, alert: &StockAlert) -> LedgerResult<()> {
    sqlx::query(
        r#"
        UPDATE stock_alerts
        SET status = $2, cleared_at = $3
        WHERE alert_id = $1
        "#,
    )
    .bind(*alert.id.as_uuid())
    .bind(alert.status.as_str())
    .bind(alert.cleared_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("clear_alert", e))?;
    Ok(())
}

/// Map SQLx errors onto the ledger error taxonomy.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());

            if let Some(code) = db_err.code() {
                match code.as_ref() {
                    // Unique violation: a concurrent writer got there first.
                    "23505" => LedgerError::conflict(msg),
                    // Lock timeout: the bounded wait for a key ran out.
                    "55P03" => LedgerError::conflict(msg),
                    // Check constraint: data the domain layer rejects too.
                    "23514" => LedgerError::validation(msg),
                    // Foreign key violation.
                    "23503" => LedgerError::validation(msg),
                    _ => LedgerError::internal(msg),
                }
            } else {
                LedgerError::internal(msg)
            }
        }
        sqlx::Error::PoolClosed => {
            LedgerError::internal(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::RowNotFound => {
            LedgerError::internal(format!("unexpected row not found in {operation}"))
        }
        _ => LedgerError::internal(format!("sqlx error in {operation}: {err}")),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

fn decode_error(what: &str, err: sqlx::Error) -> LedgerError {
    LedgerError::internal(format!("failed to decode {what}: {err}"))
}

fn decode_balance(row: &sqlx::postgres::PgRow) -> LedgerResult<InventoryBalance> {
    let decoded = BalanceRow::from_row(row).map_err(|e| decode_error("balance", e))?;
    Ok(decoded.into())
}

// SQLx row types

#[derive(Debug)]
struct BalanceRow {
    variant_id: uuid::Uuid,
    warehouse_id: uuid::Uuid,
    on_hand: i64,
    allocated: i64,
    version: i64,
    updated_at: chrono::DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for BalanceRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(BalanceRow {
            variant_id: row.try_get("variant_id")?,
            warehouse_id: row.try_get("warehouse_id")?,
            on_hand: row.try_get("on_hand")?,
            allocated: row.try_get("allocated")?,
            version: row.try_get("version")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl From<BalanceRow> for InventoryBalance {
    fn from(row: BalanceRow) -> Self {
        InventoryBalance {
            key: StockKey::new(
                VariantId::from_uuid(row.variant_id),
                WarehouseId::from_uuid(row.warehouse_id),
            ),
            on_hand: row.on_hand,
            allocated: row.allocated,
            version: row.version as u64,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug)]
struct MovementRow {
    movement_id: uuid::Uuid,
    variant_id: uuid::Uuid,
    warehouse_id: uuid::Uuid,
    kind: String,
    qty: i64,
    unit_cost: Option<i64>,
    transfer_direction: Option<String>,
    counterparty_warehouse_id: Option<uuid::Uuid>,
    reference_kind: String,
    reference_id: uuid::Uuid,
    occurred_at: chrono::DateTime<Utc>,
    recorded_at: chrono::DateTime<Utc>,
    sequence: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for MovementRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(MovementRow {
            movement_id: row.try_get("movement_id")?,
            variant_id: row.try_get("variant_id")?,
            warehouse_id: row.try_get("warehouse_id")?,
            kind: row.try_get("kind")?,
            qty: row.try_get("qty")?,
            unit_cost: row.try_get("unit_cost")?,
            transfer_direction: row.try_get("transfer_direction")?,
            counterparty_warehouse_id: row.try_get("counterparty_warehouse_id")?,
            reference_kind: row.try_get("reference_kind")?,
            reference_id: row.try_get("reference_id")?,
            occurred_at: row.try_get("occurred_at")?,
            recorded_at: row.try_get("recorded_at")?,
            sequence: row.try_get("sequence")?,
        })
    }
}

impl MovementRow {
    fn into_movement(self) -> LedgerResult<StockMovement> {
        let transfer = match (self.transfer_direction, self.counterparty_warehouse_id) {
            (Some(direction), Some(counterparty)) => Some(TransferLeg {
                direction: TransferDirection::from_str(&direction)?,
                counterparty: WarehouseId::from_uuid(counterparty),
            }),
            (None, None) => None,
            _ => {
                return Err(LedgerError::internal(format!(
                    "movement {} has a half-populated transfer leg",
                    self.movement_id
                )));
            }
        };

        Ok(StockMovement {
            id: MovementId::from_uuid(self.movement_id),
            key: StockKey::new(
                VariantId::from_uuid(self.variant_id),
                WarehouseId::from_uuid(self.warehouse_id),
            ),
            kind: MovementKind::from_str(&self.kind)?,
            qty: self.qty,
            unit_cost: self.unit_cost,
            transfer,
            reference: Reference::new(self.reference_kind, self.reference_id),
            occurred_at: self.occurred_at,
            recorded_at: self.recorded_at,
            sequence: self.sequence as u64,
        })
    }
}

#[derive(Debug)]
struct ReservationRow {
    reservation_id: uuid::Uuid,
    variant_id: uuid::Uuid,
    warehouse_id: uuid::Uuid,
    qty: i64,
    reference_kind: String,
    reference_id: uuid::Uuid,
    status: String,
    fulfilled_movement_id: Option<uuid::Uuid>,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for ReservationRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(ReservationRow {
            reservation_id: row.try_get("reservation_id")?,
            variant_id: row.try_get("variant_id")?,
            warehouse_id: row.try_get("warehouse_id")?,
            qty: row.try_get("qty")?,
            reference_kind: row.try_get("reference_kind")?,
            reference_id: row.try_get("reference_id")?,
            status: row.try_get("status")?,
            fulfilled_movement_id: row.try_get("fulfilled_movement_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl ReservationRow {
    fn into_reservation(self) -> LedgerResult<Reservation> {
        Ok(Reservation {
            id: ReservationId::from_uuid(self.reservation_id),
            key: StockKey::new(
                VariantId::from_uuid(self.variant_id),
                WarehouseId::from_uuid(self.warehouse_id),
            ),
            qty: self.qty,
            reference: Reference::new(self.reference_kind, self.reference_id),
            status: ReservationStatus::from_str(&self.status)?,
            fulfilled_movement_id: self.fulfilled_movement_id.map(MovementId::from_uuid),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug)]
struct AlertRow {
    alert_id: uuid::Uuid,
    variant_id: uuid::Uuid,
    warehouse_id: uuid::Uuid,
    kind: String,
    status: String,
    threshold: i64,
    observed_on_hand: i64,
    raised_at: chrono::DateTime<Utc>,
    cleared_at: Option<chrono::DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for AlertRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(AlertRow {
            alert_id: row.try_get("alert_id")?,
            variant_id: row.try_get("variant_id")?,
            warehouse_id: row.try_get("warehouse_id")?,
            kind: row.try_get("kind")?,
            status: row.try_get("status")?,
            threshold: row.try_get("threshold")?,
            observed_on_hand: row.try_get("observed_on_hand")?,
            raised_at: row.try_get("raised_at")?,
            cleared_at: row.try_get("cleared_at")?,
        })
    }
}

impl AlertRow {
    fn into_alert(self) -> LedgerResult<StockAlert> {
        Ok(StockAlert {
            id: AlertId::from_uuid(self.alert_id),
            key: StockKey::new(
                VariantId::from_uuid(self.variant_id),
                WarehouseId::from_uuid(self.warehouse_id),
            ),
            kind: AlertKind::from_str(&self.kind)?,
            status: AlertStatus::from_str(&self.status)?,
            threshold: self.threshold,
            observed_on_hand: self.observed_on_hand,
            raised_at: self.raised_at,
            cleared_at: self.cleared_at,
        })
    }
}

// Implement LedgerStore by bridging onto the async methods through the
// ambient tokio runtime, the same way embedders drive the pool.

impl LedgerStore for PostgresLedgerStore {
    fn append_movements(&self, drafts: Vec<MovementDraft>) -> LedgerResult<MovementCommit> {
        runtime_handle()?.block_on(self.append_movements(drafts))
    }

    fn create_reservation(&self, reservation: Reservation) -> LedgerResult<ReservationCommit> {
        runtime_handle()?.block_on(self.create_reservation(reservation))
    }

    fn release_reservation(&self, id: ReservationId) -> LedgerResult<ReservationCommit> {
        runtime_handle()?.block_on(self.release_reservation(id))
    }

    fn fulfill_reservation(&self, id: ReservationId) -> LedgerResult<FulfillCommit> {
        runtime_handle()?.block_on(self.fulfill_reservation(id))
    }

    fn reconcile_alerts(&self, key: StockKey, threshold: i64) -> LedgerResult<AlertTransitions> {
        runtime_handle()?.block_on(self.reconcile_alerts(key, threshold))
    }

    fn balance(&self, key: StockKey) -> LedgerResult<Option<InventoryBalance>> {
        runtime_handle()?.block_on(self.balance(key))
    }

    fn balances(
        &self,
        filter: &BalanceFilter,
        pagination: Pagination,
    ) -> LedgerResult<Page<InventoryBalance>> {
        runtime_handle()?.block_on(self.balances(filter, pagination))
    }

    fn history(&self, key: StockKey, range: &HistoryRange) -> LedgerResult<Vec<StockMovement>> {
        runtime_handle()?.block_on(self.history(key, range))
    }

    fn reservation(&self, id: ReservationId) -> LedgerResult<Option<Reservation>> {
        runtime_handle()?.block_on(self.reservation(id))
    }

    fn reservations(
        &self,
        filter: &ReservationFilter,
        pagination: Pagination,
    ) -> LedgerResult<Page<Reservation>> {
        runtime_handle()?.block_on(self.reservations(filter, pagination))
    }

    fn alerts(
        &self,
        filter: &AlertFilter,
        pagination: Pagination,
    ) -> LedgerResult<Page<StockAlert>> {
        runtime_handle()?.block_on(self.alerts(filter, pagination))
    }
}

fn runtime_handle() -> LedgerResult<tokio::runtime::Handle> {
    tokio::runtime::Handle::try_current().map_err(|_| {
        LedgerError::internal(
            "PostgresLedgerStore requires a tokio runtime; call from within a runtime context",
        )
    })
}

#[async_trait::async_trait]
impl LedgerQuery for PostgresLedgerStore {
    async fn balance(&self, key: StockKey) -> LedgerResult<Option<InventoryBalance>> {
        self.balance(key).await
    }

    async fn balances(
        &self,
        filter: &BalanceFilter,
        pagination: Pagination,
    ) -> LedgerResult<Page<InventoryBalance>> {
        self.balances(filter, pagination).await
    }

    async fn history(
        &self,
        key: StockKey,
        range: &HistoryRange,
    ) -> LedgerResult<Vec<StockMovement>> {
        self.history(key, range).await
    }

    async fn reservation(&self, id: ReservationId) -> LedgerResult<Option<Reservation>> {
        self.reservation(id).await
    }

    async fn reservations(
        &self,
        filter: &ReservationFilter,
        pagination: Pagination,
    ) -> LedgerResult<Page<Reservation>> {
        self.reservations(filter, pagination).await
    }

    async fn alerts(
        &self,
        filter: &AlertFilter,
        pagination: Pagination,
    ) -> LedgerResult<Page<StockAlert>> {
        self.alerts(filter, pagination).await
    }
}
