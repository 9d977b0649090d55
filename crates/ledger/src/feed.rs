//! Typed feed events published after commits.
//!
//! The feed is the integration point for notification layers and dashboards.
//! Delivery is best-effort and in-process; the journal and balance tables
//! remain the source of truth.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::WarehouseId;
use stockledger_events::{Event, WarehouseScoped};

use crate::alert::StockAlert;
use crate::balance::InventoryBalance;
use crate::movement::StockMovement;
use crate::reservation::Reservation;

/// A movement was journaled (one event per leg for transfers).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementRecorded {
    pub movement: StockMovement,
}

/// A balance row changed; carries the committed row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceUpdated {
    pub balance: InventoryBalance,
}

/// A reservation was created, released or fulfilled; the enclosing variant
/// says which. For fulfillments the reservation names its OUT movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationChanged {
    pub reservation: Reservation,
}

/// An alert was raised or cleared; the enclosing variant says which.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertChanged {
    pub alert: StockAlert,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    MovementRecorded(MovementRecorded),
    BalanceUpdated(BalanceUpdated),
    ReservationCreated(ReservationChanged),
    ReservationReleased(ReservationChanged),
    ReservationFulfilled(ReservationChanged),
    AlertRaised(AlertChanged),
    AlertCleared(AlertChanged),
}

impl Event for LedgerEvent {
    fn event_type(&self) -> &'static str {
        match self {
            LedgerEvent::MovementRecorded(_) => "ledger.movement.recorded",
            LedgerEvent::BalanceUpdated(_) => "ledger.balance.updated",
            LedgerEvent::ReservationCreated(_) => "ledger.reservation.created",
            LedgerEvent::ReservationReleased(_) => "ledger.reservation.released",
            LedgerEvent::ReservationFulfilled(_) => "ledger.reservation.fulfilled",
            LedgerEvent::AlertRaised(_) => "ledger.alert.raised",
            LedgerEvent::AlertCleared(_) => "ledger.alert.cleared",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            LedgerEvent::MovementRecorded(e) => e.movement.recorded_at,
            LedgerEvent::BalanceUpdated(e) => e.balance.updated_at,
            LedgerEvent::ReservationCreated(e)
            | LedgerEvent::ReservationReleased(e)
            | LedgerEvent::ReservationFulfilled(e) => e.reservation.updated_at,
            LedgerEvent::AlertRaised(e) => e.alert.raised_at,
            LedgerEvent::AlertCleared(e) => e.alert.cleared_at.unwrap_or(e.alert.raised_at),
        }
    }
}

impl WarehouseScoped for LedgerEvent {
    fn warehouse_id(&self) -> WarehouseId {
        match self {
            LedgerEvent::MovementRecorded(e) => e.movement.key.warehouse_id,
            LedgerEvent::BalanceUpdated(e) => e.balance.key.warehouse_id,
            LedgerEvent::ReservationCreated(e)
            | LedgerEvent::ReservationReleased(e)
            | LedgerEvent::ReservationFulfilled(e) => e.reservation.key.warehouse_id,
            LedgerEvent::AlertRaised(e) | LedgerEvent::AlertCleared(e) => {
                e.alert.key.warehouse_id
            }
        }
    }
}
