//! Advisory stock alerts.
//!
//! Alerts describe a balance condition; they never gate writes. The store
//! enforces at most one Active row per `(key, kind)`; `desired_alert` is the
//! reconciliation decision both backends share.

use chrono::{DateTime, Utc};
use core::str::FromStr;
use serde::{Deserialize, Serialize};

use stockledger_core::{AlertId, LedgerError, StockKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    OutOfStock,
    LowStock,
}

impl AlertKind {
    pub const ALL: [AlertKind; 2] = [AlertKind::OutOfStock, AlertKind::LowStock];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::OutOfStock => "out_of_stock",
            AlertKind::LowStock => "low_stock",
        }
    }
}

impl FromStr for AlertKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "out_of_stock" => Ok(AlertKind::OutOfStock),
            "low_stock" => Ok(AlertKind::LowStock),
            other => Err(LedgerError::validation(format!(
                "unknown alert kind '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Cleared,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Active => "active",
            AlertStatus::Cleared => "cleared",
        }
    }
}

impl FromStr for AlertStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AlertStatus::Active),
            "cleared" => Ok(AlertStatus::Cleared),
            other => Err(LedgerError::validation(format!(
                "unknown alert status '{other}'"
            ))),
        }
    }
}

/// One alert row. Raised rows flip to Cleared when the condition stops
/// holding; a later recurrence raises a fresh row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockAlert {
    pub id: AlertId,
    pub key: StockKey,
    pub kind: AlertKind,
    pub status: AlertStatus,
    /// Low-stock threshold in force when the alert was raised.
    pub threshold: i64,
    /// On-hand level observed when the alert was raised.
    pub observed_on_hand: i64,
    pub raised_at: DateTime<Utc>,
    pub cleared_at: Option<DateTime<Utc>>,
}

impl StockAlert {
    pub fn raise(
        key: StockKey,
        kind: AlertKind,
        threshold: i64,
        observed_on_hand: i64,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AlertId::new(),
            key,
            kind,
            status: AlertStatus::Active,
            threshold,
            observed_on_hand,
            raised_at: at,
            cleared_at: None,
        }
    }

    pub fn clear(&mut self, at: DateTime<Utc>) {
        self.status = AlertStatus::Cleared;
        self.cleared_at = Some(at);
    }

    pub fn is_active(&self) -> bool {
        self.status == AlertStatus::Active
    }
}

/// Which alert kind should be active for this on-hand level, if any.
///
/// - `OutOfStock` when the shelf is empty.
/// - `LowStock` when stock is positive but at or under the threshold
///   (a threshold of zero disables low-stock entirely).
///
/// The conditions are disjoint, so at most one kind is desired at a time;
/// reconciliation clears any active alert whose condition stopped holding.
pub fn desired_alert(on_hand: i64, threshold: i64) -> Option<AlertKind> {
    if on_hand == 0 {
        Some(AlertKind::OutOfStock)
    } else if threshold > 0 && on_hand > 0 && on_hand <= threshold {
        Some(AlertKind::LowStock)
    } else {
        None
    }
}
