//! Stock ledger domain model.
//!
//! This crate contains the business rules of the engine as deterministic
//! domain logic (no IO, no storage): movement commands and journal rows,
//! balance arithmetic, reservation state transitions, alert decisions, the
//! catalog port and the typed feed events.

pub mod alert;
pub mod balance;
pub mod catalog;
pub mod feed;
pub mod movement;
pub mod reservation;

pub use alert::{AlertKind, AlertStatus, StockAlert, desired_alert};
pub use balance::InventoryBalance;
pub use catalog::{CatalogPort, StaticCatalog, VariantThresholds};
pub use feed::{
    AlertChanged, BalanceUpdated, LedgerEvent, MovementRecorded, ReservationChanged,
};
pub use movement::{
    MovementCommand, MovementDraft, MovementKind, RecordAdjustment, RecordIssue,
    RecordReceipt, RecordTransfer, Reference, StockMovement, TransferDirection,
    TransferLeg,
};
pub use reservation::{Fulfillment, Reservation, ReservationStatus, ReserveStock};
