//! Infrastructure layer: storage backends, orchestration, queries, workers.

pub mod alerts;
pub mod journal;
pub mod query;
pub mod reservations;
pub mod service;
pub mod store;
pub mod workers;

#[cfg(test)]
mod integration_tests;

pub use alerts::AlertEvaluator;
pub use journal::Journal;
pub use query::{
    AlertFilter, BalanceFilter, HistoryRange, Page, Pagination, Queries, ReservationFilter,
};
pub use reservations::Reservations;
pub use service::{LedgerConfig, MemoryStockLedger, StockLedger};
pub use store::{
    AlertTransitions, FulfillCommit, LedgerQuery, LedgerStore, MovementCommit, ReservationCommit,
};
pub use store::memory::MemoryLedgerStore;
pub use store::postgres::PostgresLedgerStore;
pub use workers::feed_worker::{FeedWorker, WorkerHandle};
