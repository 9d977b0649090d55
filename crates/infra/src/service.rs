//! Engine assembly and configuration.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use stockledger_events::{EventBus, InMemoryEventBus};
use stockledger_ledger::{CatalogPort, LedgerEvent};

use crate::journal::Journal;
use crate::query::Queries;
use crate::reservations::Reservations;
use crate::store::LedgerStore;
use crate::store::memory::MemoryLedgerStore;

/// Runtime tuning for the engine.
///
/// Values come from the environment in deployments and from `Default` in
/// tests:
///
/// - `STOCKLEDGER_LOCK_RETRIES`: per-key lock attempts before a writer
///   gives up with `Conflict`.
/// - `STOCKLEDGER_LOCK_BACKOFF_MS`: pause between attempts, milliseconds.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub lock_retries: u32,
    pub lock_backoff: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            lock_retries: 40,
            lock_backoff: Duration::from_millis(5),
        }
    }
}

impl LedgerConfig {
    /// Read configuration from the environment, keeping the default (with
    /// a warning) for any malformed value.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            lock_retries: env_u32("STOCKLEDGER_LOCK_RETRIES", defaults.lock_retries),
            lock_backoff: Duration::from_millis(env_u64(
                "STOCKLEDGER_LOCK_BACKOFF_MS",
                defaults.lock_backoff.as_millis() as u64,
            )),
        }
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(var = name, value = %raw, "malformed value, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(var = name, value = %raw, "malformed value, using default");
            default
        }),
        Err(_) => default,
    }
}

/// The assembled ledger engine: journal, reservations, queries and feed
/// over one store, bus and catalog.
///
/// Everything is injected at construction; the engine holds no global
/// state, so embedders can run several ledgers side by side.
pub struct StockLedger<S, B> {
    store: S,
    bus: B,
    journal: Journal<S, B>,
    reservations: Reservations<S, B>,
    queries: Queries<S>,
}

/// Engine over in-memory storage and the in-process bus.
pub type MemoryStockLedger =
    StockLedger<Arc<MemoryLedgerStore>, Arc<InMemoryEventBus<LedgerEvent>>>;

impl MemoryStockLedger {
    /// Engine on in-memory storage with an in-process feed. The usual
    /// entry point for tests and embedded use.
    pub fn in_memory(catalog: Arc<dyn CatalogPort>) -> Self {
        Self::in_memory_with_config(catalog, LedgerConfig::default())
    }

    pub fn in_memory_with_config(catalog: Arc<dyn CatalogPort>, config: LedgerConfig) -> Self {
        let store = Arc::new(MemoryLedgerStore::with_lock_budget(
            config.lock_retries,
            config.lock_backoff,
        ));
        let bus = Arc::new(InMemoryEventBus::new());
        Self::new(store, bus, catalog)
    }
}

impl<S, B> StockLedger<S, B>
where
    S: LedgerStore + Clone,
    B: EventBus<LedgerEvent> + Clone,
{
    pub fn new(store: S, bus: B, catalog: Arc<dyn CatalogPort>) -> Self {
        Self {
            journal: Journal::new(store.clone(), bus.clone(), Arc::clone(&catalog)),
            reservations: Reservations::new(store.clone(), bus.clone(), Arc::clone(&catalog)),
            queries: Queries::new(store.clone()),
            store,
            bus,
        }
    }

    /// Write path for movements.
    pub fn journal(&self) -> &Journal<S, B> {
        &self.journal
    }

    /// Write path for the reservation lifecycle.
    pub fn reservations(&self) -> &Reservations<S, B> {
        &self.reservations
    }

    /// Read path.
    pub fn queries(&self) -> &Queries<S> {
        &self.queries
    }

    /// The feed bus. Subscribe here, or hand it to a `FeedWorker`, to
    /// consume committed-state events.
    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LedgerConfig::default();
        assert_eq!(config.lock_retries, 40);
        assert_eq!(config.lock_backoff, Duration::from_millis(5));
    }
}
