//! Reservations: soft holds against available stock.
//!
//! A reservation walks `Active -> Released` or `Active -> Fulfilled` and
//! never leaves a terminal state. Once terminal, both verbs are no-ops,
//! so callers can retry either of them after a timeout without harm.

use chrono::{DateTime, Utc};
use core::str::FromStr;
use serde::{Deserialize, Serialize};

use stockledger_core::{
    LedgerError, LedgerResult, MovementId, ReservationId, StockKey, VariantId, WarehouseId,
};

use crate::movement::Reference;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Active,
    Released,
    Fulfilled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Active => "active",
            ReservationStatus::Released => "released",
            ReservationStatus::Fulfilled => "fulfilled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Active)
    }
}

impl FromStr for ReservationStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ReservationStatus::Active),
            "released" => Ok(ReservationStatus::Released),
            "fulfilled" => Ok(ReservationStatus::Fulfilled),
            other => Err(LedgerError::validation(format!(
                "unknown reservation status '{other}'"
            ))),
        }
    }
}

/// Command: place a hold on available stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveStock {
    pub variant_id: VariantId,
    pub warehouse_id: WarehouseId,
    /// Positive quantity to hold.
    pub qty: i64,
    pub reference: Reference,
}

impl ReserveStock {
    pub fn key(&self) -> StockKey {
        StockKey::new(self.variant_id, self.warehouse_id)
    }

    pub fn validate(&self) -> LedgerResult<()> {
        if self.qty <= 0 {
            return Err(LedgerError::validation(format!(
                "reservation quantity must be positive, got {}",
                self.qty
            )));
        }
        Ok(())
    }
}

/// A hold against a single balance row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub key: StockKey,
    pub qty: i64,
    pub reference: Reference,
    pub status: ReservationStatus,
    /// Set when the reservation was fulfilled; names the OUT movement that
    /// journaled the issue.
    pub fulfilled_movement_id: Option<MovementId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    /// Fresh active hold. Admission against `available` happens in the
    /// store, in the same transaction as the insert.
    pub fn new(cmd: &ReserveStock, created_at: DateTime<Utc>) -> Self {
        Self {
            id: ReservationId::new(),
            key: cmd.key(),
            qty: cmd.qty,
            reference: cmd.reference.clone(),
            status: ReservationStatus::Active,
            fulfilled_movement_id: None,
            created_at,
            updated_at: created_at,
        }
    }

    /// Flip to Released. `true` means the transition happened and the hold
    /// must be returned to the balance; `false` means the reservation was
    /// already terminal and nothing changed.
    pub fn release(&mut self, at: DateTime<Utc>) -> bool {
        match self.status {
            ReservationStatus::Active => {
                self.status = ReservationStatus::Released;
                self.updated_at = at;
                true
            }
            ReservationStatus::Released | ReservationStatus::Fulfilled => false,
        }
    }

    /// Flip to Fulfilled, recording the OUT movement id. Semantics mirror
    /// `release`: a reservation already in either terminal state is left
    /// untouched.
    pub fn fulfill(&mut self, movement_id: MovementId, at: DateTime<Utc>) -> bool {
        match self.status {
            ReservationStatus::Active => {
                self.status = ReservationStatus::Fulfilled;
                self.fulfilled_movement_id = Some(movement_id);
                self.updated_at = at;
                true
            }
            ReservationStatus::Released | ReservationStatus::Fulfilled => false,
        }
    }
}

/// Outcome of fulfilling a reservation.
///
/// `movement_id` names the OUT movement that journaled the issue. It is
/// `None` only when the fulfill landed on an already-released hold, which
/// never journaled one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fulfillment {
    pub reservation: Reservation,
    pub movement_id: Option<MovementId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn test_command(qty: i64) -> ReserveStock {
        ReserveStock {
            variant_id: VariantId::new(),
            warehouse_id: WarehouseId::new(),
            qty,
            reference: Reference::order(Uuid::now_v7()),
        }
    }

    #[test]
    fn non_positive_quantity_is_rejected() {
        for qty in [0, -4] {
            let err = test_command(qty).validate().unwrap_err();
            match err {
                LedgerError::Validation(msg) => assert!(msg.contains("positive")),
                _ => panic!("Expected validation error"),
            }
        }
    }

    #[test]
    fn release_is_idempotent_from_released() {
        let mut reservation = Reservation::new(&test_command(3), Utc::now());

        assert!(reservation.release(Utc::now()));
        assert_eq!(reservation.status, ReservationStatus::Released);
        // Second release changes nothing.
        assert!(!reservation.release(Utc::now()));
    }

    #[test]
    fn fulfill_is_idempotent_from_fulfilled() {
        let mut reservation = Reservation::new(&test_command(3), Utc::now());
        let movement = MovementId::new();

        assert!(reservation.fulfill(movement, Utc::now()));
        assert_eq!(reservation.fulfilled_movement_id, Some(movement));

        // Repeat keeps the original movement id.
        assert!(!reservation.fulfill(MovementId::new(), Utc::now()));
        assert_eq!(reservation.fulfilled_movement_id, Some(movement));
    }

    #[test]
    fn terminal_states_absorb_the_opposite_verb() {
        let mut released = Reservation::new(&test_command(1), Utc::now());
        assert!(released.release(Utc::now()));
        let stamped = released.updated_at;

        // Fulfilling a released hold records nothing, not even a timestamp.
        assert!(!released.fulfill(MovementId::new(), Utc::now()));
        assert_eq!(released.status, ReservationStatus::Released);
        assert_eq!(released.fulfilled_movement_id, None);
        assert_eq!(released.updated_at, stamped);

        let mut fulfilled = Reservation::new(&test_command(1), Utc::now());
        let movement = MovementId::new();
        assert!(fulfilled.fulfill(movement, Utc::now()));

        assert!(!fulfilled.release(Utc::now()));
        assert_eq!(fulfilled.status, ReservationStatus::Fulfilled);
        assert_eq!(fulfilled.fulfilled_movement_id, Some(movement));
    }
}
