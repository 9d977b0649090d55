//! Storage backends for the stock ledger.
//!
//! A [`LedgerStore`] owns the committed state of one ledger: the movement
//! journal, the per-key balances, reservations and alerts. Every mutating
//! method is one transaction. The journal rows and the balance rows they
//! imply commit together or not at all, so readers never observe a journal
//! that disagrees with its balance.
//!
//! Writers to the same stock key serialize; writers to different keys
//! proceed in parallel. A writer that cannot acquire its key within the
//! store's bounded budget fails with [`LedgerError::Conflict`] rather than
//! waiting indefinitely.
//!
//! [`LedgerError::Conflict`]: stockledger_core::LedgerError::Conflict

pub mod memory;
pub mod postgres;

use stockledger_core::{LedgerResult, ReservationId, StockKey};
use stockledger_ledger::{
    InventoryBalance, MovementDraft, Reservation, StockAlert, StockMovement,
};

use crate::query::{AlertFilter, BalanceFilter, HistoryRange, Page, Pagination, ReservationFilter};

/// Outcome of committing a batch of movement drafts.
///
/// `movements` preserves draft order; `balances` carries the post-commit
/// balance of every key the batch touched.
#[derive(Debug, Clone)]
pub struct MovementCommit {
    pub movements: Vec<StockMovement>,
    pub balances: Vec<InventoryBalance>,
}

/// Outcome of creating or releasing a reservation.
#[derive(Debug, Clone)]
pub struct ReservationCommit {
    pub reservation: Reservation,
    /// Post-commit balance, present when this call changed it.
    pub balance: Option<InventoryBalance>,
    /// False when the call was an idempotent repeat and nothing moved.
    pub changed: bool,
}

/// Outcome of fulfilling a reservation.
#[derive(Debug, Clone)]
pub struct FulfillCommit {
    pub reservation: Reservation,
    /// The OUT movement journaled by this call. Absent when the
    /// reservation was already terminal; a fulfilled one keeps its
    /// original movement id on the reservation row.
    pub movement: Option<StockMovement>,
    /// Post-commit balance, present when this call changed it.
    pub balance: Option<InventoryBalance>,
}

/// Alert rows that changed state during one reconciliation.
#[derive(Debug, Clone, Default)]
pub struct AlertTransitions {
    pub raised: Vec<StockAlert>,
    pub cleared: Vec<StockAlert>,
}

impl AlertTransitions {
    pub fn is_empty(&self) -> bool {
        self.raised.is_empty() && self.cleared.is_empty()
    }
}

/// Transactional storage for movements, balances, reservations and alerts.
///
/// Implementations must uphold the ledger invariants at every commit
/// boundary: balances equal the sum of their journal, `available` equals
/// `on_hand - allocated`, and at most one active alert exists per
/// `(key, kind)`.
pub trait LedgerStore: Send + Sync {
    /// Appends a validated batch of drafts to the journal and applies them
    /// to the affected balances, atomically.
    ///
    /// A batch is all-or-nothing: if any draft fails admission (for example
    /// an OUT leg exceeding available stock), no row of the batch commits.
    /// Per-key sequence numbers are assigned here, contiguously from 1.
    fn append_movements(&self, drafts: Vec<MovementDraft>) -> LedgerResult<MovementCommit>;

    /// Persists a new reservation and increments `allocated` on its key,
    /// atomically. Fails with `InsufficientStock` when the requested
    /// quantity exceeds the key's available stock at commit time.
    fn create_reservation(&self, reservation: Reservation) -> LedgerResult<ReservationCommit>;

    /// Releases an active reservation and returns its hold to available
    /// stock. A reservation already in either terminal state is left
    /// untouched and comes back with `changed: false`.
    fn release_reservation(&self, id: ReservationId) -> LedgerResult<ReservationCommit>;

    /// Fulfills an active reservation: journals an OUT movement for the
    /// held quantity and drops `allocated` and `on_hand` together, leaving
    /// `available` unchanged. Repeats are no-ops carrying the original
    /// movement id; a fulfill landing on a released reservation journals
    /// nothing and carries none.
    fn fulfill_reservation(&self, id: ReservationId) -> LedgerResult<FulfillCommit>;

    /// Brings the alert rows for a key in line with its current balance,
    /// raising and clearing as needed under the at-most-one-active rule.
    fn reconcile_alerts(&self, key: StockKey, threshold: i64) -> LedgerResult<AlertTransitions>;

    /// Reads the committed balance for a key, `None` if never touched.
    fn balance(&self, key: StockKey) -> LedgerResult<Option<InventoryBalance>>;

    /// Lists committed balances matching the filter, ordered by stock key.
    fn balances(
        &self,
        filter: &BalanceFilter,
        pagination: Pagination,
    ) -> LedgerResult<Page<InventoryBalance>>;

    /// Reads a key's journal within the range, ordered by sequence ascending.
    fn history(&self, key: StockKey, range: &HistoryRange) -> LedgerResult<Vec<StockMovement>>;

    /// Reads a reservation by id.
    fn reservation(&self, id: ReservationId) -> LedgerResult<Option<Reservation>>;

    /// Lists reservations matching the filter, newest first.
    fn reservations(
        &self,
        filter: &ReservationFilter,
        pagination: Pagination,
    ) -> LedgerResult<Page<Reservation>>;

    /// Lists alerts matching the filter, newest first.
    fn alerts(&self, filter: &AlertFilter, pagination: Pagination)
        -> LedgerResult<Page<StockAlert>>;
}

/// Async read surface for embedders already running on a runtime.
///
/// Mirrors the read half of [`LedgerStore`] without blocking a runtime
/// thread. Only backends with a natively async driver implement this; the
/// in-memory store stays sync-only.
#[async_trait::async_trait]
pub trait LedgerQuery: Send + Sync {
    async fn balance(&self, key: StockKey) -> LedgerResult<Option<InventoryBalance>>;

    async fn balances(
        &self,
        filter: &BalanceFilter,
        pagination: Pagination,
    ) -> LedgerResult<Page<InventoryBalance>>;

    async fn history(&self, key: StockKey, range: &HistoryRange)
        -> LedgerResult<Vec<StockMovement>>;

    async fn reservation(&self, id: ReservationId) -> LedgerResult<Option<Reservation>>;

    async fn reservations(
        &self,
        filter: &ReservationFilter,
        pagination: Pagination,
    ) -> LedgerResult<Page<Reservation>>;

    async fn alerts(
        &self,
        filter: &AlertFilter,
        pagination: Pagination,
    ) -> LedgerResult<Page<StockAlert>>;
}

impl<S: LedgerStore + ?Sized> LedgerStore for std::sync::Arc<S> {
    fn append_movements(&self, drafts: Vec<MovementDraft>) -> LedgerResult<MovementCommit> {
        (**self).append_movements(drafts)
    }

    fn create_reservation(&self, reservation: Reservation) -> LedgerResult<ReservationCommit> {
        (**self).create_reservation(reservation)
    }

    fn release_reservation(&self, id: ReservationId) -> LedgerResult<ReservationCommit> {
        (**self).release_reservation(id)
    }

    fn fulfill_reservation(&self, id: ReservationId) -> LedgerResult<FulfillCommit> {
        (**self).fulfill_reservation(id)
    }

    fn reconcile_alerts(&self, key: StockKey, threshold: i64) -> LedgerResult<AlertTransitions> {
        (**self).reconcile_alerts(key, threshold)
    }

    fn balance(&self, key: StockKey) -> LedgerResult<Option<InventoryBalance>> {
        (**self).balance(key)
    }

    fn balances(
        &self,
        filter: &BalanceFilter,
        pagination: Pagination,
    ) -> LedgerResult<Page<InventoryBalance>> {
        (**self).balances(filter, pagination)
    }

    fn history(&self, key: StockKey, range: &HistoryRange) -> LedgerResult<Vec<StockMovement>> {
        (**self).history(key, range)
    }

    fn reservation(&self, id: ReservationId) -> LedgerResult<Option<Reservation>> {
        (**self).reservation(id)
    }

    fn reservations(
        &self,
        filter: &ReservationFilter,
        pagination: Pagination,
    ) -> LedgerResult<Page<Reservation>> {
        (**self).reservations(filter, pagination)
    }

    fn alerts(
        &self,
        filter: &AlertFilter,
        pagination: Pagination,
    ) -> LedgerResult<Page<StockAlert>> {
        (**self).alerts(filter, pagination)
    }
}
