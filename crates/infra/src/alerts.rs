//! Alert reconciliation (advisory signals derived from balances).

use std::sync::Arc;

use tracing::{debug, warn};

use stockledger_core::{LedgerResult, StockKey};
use stockledger_events::EventBus;
use stockledger_ledger::{AlertChanged, CatalogPort, LedgerEvent};

use crate::store::{AlertTransitions, LedgerStore};

/// Keeps alert rows in line with committed balances.
///
/// Alerts are advisory. Evaluation runs after a balance commit, outside the
/// committing transaction, and its failures never fail the operation that
/// changed the balance. At most one active alert exists per `(key, kind)`;
/// the store enforces that while this component decides which transitions
/// are due and announces them on the feed.
pub struct AlertEvaluator<S, B> {
    store: S,
    bus: B,
    catalog: Arc<dyn CatalogPort>,
}

impl<S, B> AlertEvaluator<S, B>
where
    S: LedgerStore,
    B: EventBus<LedgerEvent>,
{
    pub fn new(store: S, bus: B, catalog: Arc<dyn CatalogPort>) -> Self {
        Self {
            store,
            bus,
            catalog,
        }
    }

    /// Reconcile a key's alerts against its committed balance.
    ///
    /// The low-stock threshold comes from the catalog: `reorder_point` when
    /// set, otherwise `min_stock_level`. A variant missing from the catalog
    /// reconciles with threshold 0, which leaves only out-of-stock alerting.
    pub fn reconcile(&self, key: StockKey) -> LedgerResult<AlertTransitions> {
        let threshold = self
            .catalog
            .variant_thresholds(key.variant_id)?
            .map(|t| t.low_stock_threshold())
            .unwrap_or(0);

        let transitions = self.store.reconcile_alerts(key, threshold)?;
        if !transitions.is_empty() {
            debug!(
                key = %key,
                raised = transitions.raised.len(),
                cleared = transitions.cleared.len(),
                "alert transitions applied"
            );
        }

        for alert in &transitions.raised {
            self.publish(LedgerEvent::AlertRaised(AlertChanged {
                alert: alert.clone(),
            }));
        }
        for alert in &transitions.cleared {
            self.publish(LedgerEvent::AlertCleared(AlertChanged {
                alert: alert.clone(),
            }));
        }

        Ok(transitions)
    }

    /// Reconcile, logging instead of propagating failures. Write paths use
    /// this so alerting cannot fail an already-committed operation.
    pub fn reconcile_or_warn(&self, key: StockKey) {
        if let Err(err) = self.reconcile(key) {
            warn!(key = %key, error = %err, "alert reconciliation failed");
        }
    }

    fn publish(&self, event: LedgerEvent) {
        if let Err(err) = self.bus.publish(event) {
            warn!(error = ?err, "alert event publication failed");
        }
    }
}
