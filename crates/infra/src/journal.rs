//! Movement journaling pipeline (application-level orchestration).
//!
//! The journal is the only write path for stock movements. Every command
//! runs the same pipeline:
//!
//! ```text
//! MovementCommand
//!   ↓
//! 1. Check the variant and touched warehouses against the catalog
//!   ↓
//! 2. Expand into validated drafts (two legs for a transfer)
//!   ↓
//! 3. Commit drafts + balance updates in one store transaction
//!   ↓
//! 4. Publish feed events (best-effort, after commit)
//!   ↓
//! 5. Reconcile alerts for every touched key (advisory)
//! ```
//!
//! Steps 1-3 are the operation; a failure anywhere in them commits nothing.
//! Steps 4-5 run after the commit and cannot undo it: publication failures
//! and alert failures are logged, never returned, because the journal and
//! balances are already the source of truth.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use stockledger_core::{LedgerError, LedgerResult};
use stockledger_events::EventBus;
use stockledger_ledger::{
    BalanceUpdated, CatalogPort, LedgerEvent, MovementCommand, MovementRecorded, StockMovement,
};

use crate::alerts::AlertEvaluator;
use crate::store::{LedgerStore, MovementCommit};

/// Write-side entry point for recording movements.
pub struct Journal<S, B> {
    store: S,
    bus: B,
    catalog: Arc<dyn CatalogPort>,
    evaluator: AlertEvaluator<S, B>,
}

impl<S, B> Journal<S, B>
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

    /// Record one movement command and return the journaled rows.
    ///
    /// Transfers return both legs, outbound first. The returned movements
    /// carry their committed per-key sequence numbers.
    #[instrument(skip(self, command), fields(variant_id = %command.variant_id()))]
    pub fn record(&self, command: MovementCommand) -> LedgerResult<Vec<StockMovement>> {
        // 1) Catalog checks
        let variant_id = command.variant_id();
        if self.catalog.variant_thresholds(variant_id)?.is_none() {
            return Err(LedgerError::validation(format!(
                "unknown variant {variant_id}"
            )));
        }
        for warehouse_id in command.warehouse_ids() {
            if !self.catalog.warehouse_exists(warehouse_id)? {
                return Err(LedgerError::validation(format!(
                    "unknown warehouse {warehouse_id}"
                )));
            }
        }

        // 2) Expand into drafts, 3) commit atomically
        let drafts = command.into_drafts()?;
        let commit = self.store.append_movements(drafts)?;
        debug!(
            movements = commit.movements.len(),
            keys = commit.balances.len(),
            "movement batch committed"
        );

        // 4) Publish after commit
        self.publish(&commit);

        // 5) Alerts (advisory)
        for balance in &commit.balances {
            self.evaluator.reconcile_or_warn(balance.key);
        }

        Ok(commit.movements)
    }

    fn publish(&self, commit: &MovementCommit) {
        for movement in &commit.movements {
            let event = LedgerEvent::MovementRecorded(MovementRecorded {
                movement: movement.clone(),
            });
            if let Err(err) = self.bus.publish(event) {
                warn!(error = ?err, "movement event publication failed");
            }
        }
        for balance in &commit.balances {
            let event = LedgerEvent::BalanceUpdated(BalanceUpdated {
                balance: balance.clone(),
            });
            if let Err(err) = self.bus.publish(event) {
                warn!(error = ?err, "balance event publication failed");
            }
        }
    }
}
