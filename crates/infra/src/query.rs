//! Read-side query interface over the ledger store.
//!
//! This module provides read-only query capabilities for balances, movement
//! history, reservations and alerts. All list queries are paginated by
//! default and read committed state only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stockledger_core::{LedgerError, LedgerResult, ReservationId, StockKey, VariantId, WarehouseId};
use stockledger_ledger::{
    AlertKind, AlertStatus, InventoryBalance, MovementKind, Reservation, ReservationStatus,
    StockAlert, StockMovement,
};

use crate::store::LedgerStore;

/// Pagination parameters for list queries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of items to return.
    pub limit: u32,
    /// Offset for pagination (0-based).
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,  // Safe default
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).min(1000), // Cap at 1000 for safety
            offset: offset.unwrap_or(0),
        }
    }
}

/// One page of a list query result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    /// The items on this page.
    pub items: Vec<T>,
    /// Total number of items matching the filter (across all pages).
    pub total: u64,
    /// Pagination parameters used.
    pub pagination: Pagination,
    /// Whether there are more items available.
    pub has_more: bool,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64, pagination: Pagination) -> Self {
        let has_more = (pagination.offset as u64 + items.len() as u64) < total;
        Self { items, total, pagination, has_more }
    }

    /// Builds a page by slicing an already-filtered, already-sorted vector.
    pub fn from_vec(items: Vec<T>, pagination: Pagination) -> Self {
        let total = items.len() as u64;
        let start = (pagination.offset as usize).min(items.len());
        let end = (start + pagination.limit as usize).min(items.len());
        let page: Vec<T> = items.into_iter().skip(start).take(end - start).collect();
        Self::new(page, total, pagination)
    }
}

/// Filter criteria for balance listings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BalanceFilter {
    /// Filter by warehouse (optional).
    pub warehouse_id: Option<WarehouseId>,
    /// Filter by variant (optional).
    pub variant_id: Option<VariantId>,
    /// Only balances whose available quantity is at or below this value (optional).
    pub available_at_most: Option<i64>,
}

/// Bounds and filters for movement history queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryRange {
    /// Movements that occurred at or after this time (optional).
    pub occurred_after: Option<DateTime<Utc>>,
    /// Movements that occurred at or before this time (optional).
    pub occurred_before: Option<DateTime<Utc>>,
    /// Filter by movement kind (optional).
    pub kind: Option<MovementKind>,
}

impl HistoryRange {
    pub fn contains(&self, movement: &StockMovement) -> bool {
        if let Some(after) = self.occurred_after {
            if movement.occurred_at < after {
                return false;
            }
        }
        if let Some(before) = self.occurred_before {
            if movement.occurred_at > before {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if movement.kind != kind {
                return false;
            }
        }
        true
    }
}

/// Filter criteria for reservation listings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReservationFilter {
    /// Filter by stock key (optional).
    pub key: Option<StockKey>,
    /// Filter by status (optional).
    pub status: Option<ReservationStatus>,
}

/// Filter criteria for alert listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertFilter {
    /// Filter by warehouse (optional).
    pub warehouse_id: Option<WarehouseId>,
    /// Filter by alert kind (optional).
    pub kind: Option<AlertKind>,
    /// Filter by status. Defaults to active alerts only; set to `None` to
    /// include cleared history.
    pub status: Option<AlertStatus>,
}

impl Default for AlertFilter {
    fn default() -> Self {
        Self {
            warehouse_id: None,
            kind: None,
            status: Some(AlertStatus::Active),
        }
    }
}

/// Read facade over a ledger store.
///
/// Queries never take per-key write locks beyond what a single-row read
/// needs, and never observe uncommitted state.
#[derive(Debug, Clone)]
pub struct Queries<S> {
    store: S,
}

impl<S: LedgerStore> Queries<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Returns the committed balance for a key.
    ///
    /// A key no movement has ever touched reads as the zero balance rather
    /// than an error, since balances are derived state.
    pub fn get_balance(&self, key: StockKey) -> LedgerResult<InventoryBalance> {
        Ok(self
            .store
            .balance(key)?
            .unwrap_or_else(|| InventoryBalance::empty(key)))
    }

    /// Lists balances matching the filter, ordered by stock key.
    pub fn list_balances(
        &self,
        filter: &BalanceFilter,
        pagination: Pagination,
    ) -> LedgerResult<Page<InventoryBalance>> {
        self.store.balances(filter, pagination)
    }

    /// Returns the movement history for a key, ordered by sequence ascending.
    pub fn get_history(
        &self,
        key: StockKey,
        range: &HistoryRange,
    ) -> LedgerResult<Vec<StockMovement>> {
        self.store.history(key, range)
    }

    /// Returns a reservation by id.
    pub fn get_reservation(&self, id: ReservationId) -> LedgerResult<Reservation> {
        self.store
            .reservation(id)?
            .ok_or_else(|| LedgerError::not_found(format!("reservation {id}")))
    }

    /// Lists reservations matching the filter, newest first.
    pub fn list_reservations(
        &self,
        filter: &ReservationFilter,
        pagination: Pagination,
    ) -> LedgerResult<Page<Reservation>> {
        self.store.reservations(filter, pagination)
    }

    /// Lists alerts matching the filter, newest first. The default filter
    /// returns active alerts only.
    pub fn list_alerts(
        &self,
        filter: &AlertFilter,
        pagination: Pagination,
    ) -> LedgerResult<Page<StockAlert>> {
        self.store.alerts(filter, pagination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagination_defaults_and_cap() {
        let p = Pagination::default();
        assert_eq!(p.limit, 50);
        assert_eq!(p.offset, 0);

        let p = Pagination::new(Some(5000), Some(10));
        assert_eq!(p.limit, 1000);
        assert_eq!(p.offset, 10);

        let p = Pagination::new(None, None);
        assert_eq!(p.limit, 50);
    }

    #[test]
    fn test_page_from_vec_slices_and_flags_more() {
        let items: Vec<u32> = (0..10).collect();
        let page = Page::from_vec(items, Pagination { limit: 4, offset: 8 });
        assert_eq!(page.items, vec![8, 9]);
        assert_eq!(page.total, 10);
        assert!(!page.has_more);

        let items: Vec<u32> = (0..10).collect();
        let page = Page::from_vec(items, Pagination { limit: 4, offset: 0 });
        assert_eq!(page.items, vec![0, 1, 2, 3]);
        assert!(page.has_more);
    }

    #[test]
    fn test_page_new_has_more_boundary() {
        let page = Page::new(vec![1, 2, 3], 10, Pagination { limit: 3, offset: 0 });
        assert!(page.has_more);

        // offset + items reaching total exactly means the last page.
        let page = Page::new(vec![8, 9], 10, Pagination { limit: 3, offset: 8 });
        assert!(!page.has_more);
    }

    #[test]
    fn test_page_from_vec_offset_past_end() {
        let items: Vec<u32> = (0..3).collect();
        let page = Page::from_vec(items, Pagination { limit: 10, offset: 50 });
        assert!(page.items.is_empty());
        assert_eq!(page.total, 3);
        assert!(!page.has_more);
    }

    #[test]
    fn test_alert_filter_defaults_to_active() {
        let filter = AlertFilter::default();
        assert_eq!(filter.status, Some(AlertStatus::Active));
    }
}
