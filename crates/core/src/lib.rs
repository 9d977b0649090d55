//! `stockledger-core` — foundation types for the stock ledger engine.
//!
//! This crate contains **pure types** only (identifiers, the balance key,
//! the error taxonomy). No storage or IO concerns.

pub mod error;
pub mod id;
pub mod key;

pub use error::{LedgerError, LedgerResult};
pub use id::{AlertId, MovementId, ReservationId, VariantId, WarehouseId};
pub use key::StockKey;
