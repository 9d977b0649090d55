//! Reservation lifecycle orchestration.
//!
//! Reservations hold available stock for a pending order without touching
//! on-hand. The lifecycle is `active → released` or `active → fulfilled`,
//! both one-way; fulfillment converts the hold into an OUT movement in the
//! same store transaction that flips the status.
//!
//! A release or fulfill against a reservation already in a terminal state,
//! either one, is a quiet no-op: nothing changes and nothing is journaled,
//! so callers can retry both verbs freely after a timeout.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument, warn};

use stockledger_core::{LedgerError, LedgerResult, ReservationId};
use stockledger_events::EventBus;
use stockledger_ledger::{
    BalanceUpdated, CatalogPort, Fulfillment, LedgerEvent, MovementRecorded, Reservation,
    ReservationChanged, ReserveStock,
};

use crate::alerts::AlertEvaluator;
use crate::store::LedgerStore;

/// Write-side entry point for the reservation lifecycle.
pub struct Reservations<S, B> {
    store: S,
    bus: B,
    catalog: Arc<dyn CatalogPort>,
    evaluator: AlertEvaluator<S, B>,
}

impl<S, B> Reservations<S, B>
where
    S: LedgerStore + Clone,
    B: EventBus<LedgerEvent> + Clone,
{
    pub fn new(store: S, bus: B, catalog: Arc<dyn CatalogPort>) -> Self {
        let evaluator = AlertEvaluator::new(store.clone(), bus.clone(), Arc::clone(&catalog));
        Self {
            store,
            bus,
            catalog,
            evaluator,
        }
    }

    /// Place a hold against available stock.
    ///
    /// Admission is checked inside the store transaction that increments
    /// `allocated`, so concurrent requests cannot jointly oversell a key.
    /// Fails with `InsufficientStock` carrying the requested and available
    /// quantities when the key cannot cover the hold.
    #[instrument(skip(self, cmd), fields(variant_id = %cmd.variant_id, qty = cmd.qty))]
    pub fn create(&self, cmd: ReserveStock) -> LedgerResult<Reservation> {
        cmd.validate()?;
        if self.catalog.variant_thresholds(cmd.variant_id)?.is_none() {
            return Err(LedgerError::validation(format!(
                "unknown variant {}",
                cmd.variant_id
            )));
        }
        if !self.catalog.warehouse_exists(cmd.warehouse_id)? {
            return Err(LedgerError::validation(format!(
                "unknown warehouse {}",
                cmd.warehouse_id
            )));
        }

        let reservation = Reservation::new(&cmd, Utc::now());
        let commit = self.store.create_reservation(reservation)?;
        debug!(reservation_id = %commit.reservation.id, "reservation created");

        self.publish(LedgerEvent::ReservationCreated(ReservationChanged {
            reservation: commit.reservation.clone(),
        }));
        if let Some(balance) = &commit.balance {
            self.publish(LedgerEvent::BalanceUpdated(BalanceUpdated {
                balance: balance.clone(),
            }));
        }

        // Allocation moves available, not on_hand, so alert levels are
        // untouched here.
        Ok(commit.reservation)
    }

    /// Release a hold back to available stock.
    #[instrument(skip(self))]
    pub fn release(&self, id: ReservationId) -> LedgerResult<Reservation> {
        let commit = self.store.release_reservation(id)?;
        if commit.changed {
            debug!(reservation_id = %id, "reservation released");
            self.publish(LedgerEvent::ReservationReleased(ReservationChanged {
                reservation: commit.reservation.clone(),
            }));
            if let Some(balance) = &commit.balance {
                self.publish(LedgerEvent::BalanceUpdated(BalanceUpdated {
                    balance: balance.clone(),
                }));
            }
        }
        Ok(commit.reservation)
    }

    /// Convert a hold into an OUT movement.
    ///
    /// On the first call this journals an OUT for the held quantity and
    /// drops `allocated` and `on_hand` together, leaving `available` where
    /// it was. Repeats return the same reservation and movement id without
    /// journaling again, and a fulfill that lands on an already-released
    /// hold returns the dead reservation with no movement id at all.
    #[instrument(skip(self))]
    pub fn fulfill(&self, id: ReservationId) -> LedgerResult<Fulfillment> {
        let commit = self.store.fulfill_reservation(id)?;

        let movement_id = commit
            .movement
            .as_ref()
            .map(|m| m.id)
            .or(commit.reservation.fulfilled_movement_id);

        if let Some(movement) = &commit.movement {
            debug!(reservation_id = %id, movement_id = %movement.id, "reservation fulfilled");
            self.publish(LedgerEvent::ReservationFulfilled(ReservationChanged {
                reservation: commit.reservation.clone(),
            }));
            self.publish(LedgerEvent::MovementRecorded(MovementRecorded {
                movement: movement.clone(),
            }));
            if let Some(balance) = &commit.balance {
                self.publish(LedgerEvent::BalanceUpdated(BalanceUpdated {
                    balance: balance.clone(),
                }));
            }
            // Fulfillment lowers on_hand, so alert levels may have moved.
            self.evaluator.reconcile_or_warn(commit.reservation.key);
        }

        Ok(Fulfillment {
            reservation: commit.reservation,
            movement_id,
        })
    }

    fn publish(&self, event: LedgerEvent) {
        if let Err(err) = self.bus.publish(event) {
            warn!(error = ?err, "reservation event publication failed");
        }
    }
}
