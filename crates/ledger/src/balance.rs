//! Materialized balance rows and the single write path for their arithmetic.
//!
//! Every mutation of a balance row goes through the methods here; both store
//! backends call them inside the same transaction that writes the triggering
//! journal or reservation row, so the two backends cannot drift and a reader
//! never sees a movement without its balance effect.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{LedgerError, LedgerResult, StockKey};

use crate::movement::{MovementDraft, MovementKind};

/// Per-(variant, warehouse) stock position.
///
/// `available` is always derived (`on_hand - allocated`), never stored.
/// `version` increments once per committed transaction touching the row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryBalance {
    pub key: StockKey,
    /// Physical stock. Never negative.
    pub on_hand: i64,
    /// Stock held by active reservations. Never negative.
    pub allocated: i64,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl InventoryBalance {
    /// Fresh zero row; created lazily the first time a key is touched.
    pub fn empty(key: StockKey) -> Self {
        Self {
            key,
            on_hand: 0,
            allocated: 0,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    /// Stock not held by any reservation. May be negative after shrink
    /// adjustments (oversell); see `apply_movement`.
    pub fn available(&self) -> i64 {
        self.on_hand - self.allocated
    }

    /// Apply one journal draft to `on_hand`.
    ///
    /// Admission rules:
    /// - Out and outbound transfer legs require `qty <= available`;
    ///   allocated stock leaves only through fulfillment.
    /// - Adjustments may drive `available` negative but never `on_hand`.
    pub fn apply_movement(&mut self, draft: &MovementDraft) -> LedgerResult<()> {
        let delta = draft.signed_delta();

        if delta < 0 {
            let requested = -delta;
            match draft.kind {
                MovementKind::Out | MovementKind::Transfer => {
                    if requested > self.available() {
                        return Err(LedgerError::insufficient_stock(
                            requested,
                            self.available(),
                        ));
                    }
                }
                MovementKind::Adjust => {
                    if requested > self.on_hand {
                        return Err(LedgerError::validation(format!(
                            "adjustment of {delta} would take on-hand below zero (on_hand {})",
                            self.on_hand
                        )));
                    }
                }
                MovementKind::In => {}
            }
        }

        let next = self.on_hand.checked_add(delta).ok_or_else(|| {
            LedgerError::validation(format!("on-hand overflow applying delta {delta}"))
        })?;
        self.on_hand = next;
        self.touch();
        Ok(())
    }

    /// Take a hold: admission against `available` in the same critical
    /// section as the reservation insert.
    pub fn reserve(&mut self, qty: i64) -> LedgerResult<()> {
        if qty > self.available() {
            return Err(LedgerError::insufficient_stock(qty, self.available()));
        }
        self.allocated = self.allocated.checked_add(qty).ok_or_else(|| {
            LedgerError::validation(format!("allocation overflow adding {qty}"))
        })?;
        self.touch();
        Ok(())
    }

    /// Return a hold without moving stock (reservation released).
    pub fn release_hold(&mut self, qty: i64) -> LedgerResult<()> {
        if qty > self.allocated {
            return Err(LedgerError::internal(format!(
                "release of {qty} exceeds allocated {}",
                self.allocated
            )));
        }
        self.allocated -= qty;
        self.touch();
        Ok(())
    }

    /// Convert a hold into an issue: `allocated` and `on_hand` drop
    /// together, so `available` is unchanged by fulfillment.
    ///
    /// Fails with `InsufficientStock` when shrink adjustments have taken
    /// physical stock below the held quantity; `available` in the error
    /// reports `on_hand` since the hold itself is already counted.
    pub fn fulfill_hold(&mut self, qty: i64) -> LedgerResult<()> {
        if qty > self.allocated {
            return Err(LedgerError::internal(format!(
                "fulfillment of {qty} exceeds allocated {}",
                self.allocated
            )));
        }
        if qty > self.on_hand {
            return Err(LedgerError::insufficient_stock(qty, self.on_hand));
        }
        self.allocated -= qty;
        self.on_hand -= qty;
        self.touch();
        Ok(())
    }

    fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::movement::Reference;
    use proptest::prelude::*;
    use stockledger_core::{VariantId, WarehouseId};
    use uuid::Uuid;

    fn test_key() -> StockKey {
        StockKey::new(VariantId::new(), WarehouseId::new())
    }

    fn receipt(key: StockKey, qty: i64) -> MovementDraft {
        MovementDraft::receipt(key, qty, None, Reference::manual(Uuid::now_v7()), Utc::now())
            .unwrap()
    }

    fn issue(key: StockKey, qty: i64) -> MovementDraft {
        MovementDraft::issue(key, qty, None, Reference::manual(Uuid::now_v7()), Utc::now())
            .unwrap()
    }

    fn adjustment(key: StockKey, delta: i64) -> MovementDraft {
        MovementDraft::adjustment(
            key,
            delta,
            None,
            Reference::manual(Uuid::now_v7()),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn receipt_then_issue_round_trip() {
        let key = test_key();
        let mut balance = InventoryBalance::empty(key);

        balance.apply_movement(&receipt(key, 10)).unwrap();
        assert_eq!(balance.on_hand, 10);
        assert_eq!(balance.available(), 10);

        balance.apply_movement(&issue(key, 4)).unwrap();
        assert_eq!(balance.on_hand, 6);
        assert_eq!(balance.version, 2);
    }

    #[test]
    fn issue_beyond_available_is_rejected() {
        let key = test_key();
        let mut balance = InventoryBalance::empty(key);
        balance.apply_movement(&receipt(key, 5)).unwrap();
        balance.reserve(3).unwrap();

        // on_hand 5, allocated 3, available 2: an issue of 3 must fail.
        let err = balance.apply_movement(&issue(key, 3)).unwrap_err();
        match err {
            LedgerError::InsufficientStock {
                requested,
                available,
            } => {
                assert_eq!(requested, 3);
                assert_eq!(available, 2);
            }
            _ => panic!("Expected InsufficientStock"),
        }
        // Nothing was applied.
        assert_eq!(balance.on_hand, 5);
        assert_eq!(balance.allocated, 3);
    }

    #[test]
    fn adjustment_may_oversell_but_not_negative_on_hand() {
        let key = test_key();
        let mut balance = InventoryBalance::empty(key);
        balance.apply_movement(&receipt(key, 5)).unwrap();
        balance.reserve(5).unwrap();

        // Shrink below the allocation: available goes negative, on_hand stays valid.
        balance.apply_movement(&adjustment(key, -3)).unwrap();
        assert_eq!(balance.on_hand, 2);
        assert_eq!(balance.available(), -3);

        let err = balance.apply_movement(&adjustment(key, -3)).unwrap_err();
        match err {
            LedgerError::Validation(msg) => assert!(msg.contains("below zero")),
            _ => panic!("Expected validation error for negative on-hand"),
        }
    }

    #[test]
    fn reservation_admission_uses_available() {
        let key = test_key();
        let mut balance = InventoryBalance::empty(key);
        balance.apply_movement(&receipt(key, 10)).unwrap();

        balance.reserve(6).unwrap();
        let err = balance.reserve(5).unwrap_err();
        match err {
            LedgerError::InsufficientStock {
                requested,
                available,
            } => {
                assert_eq!(requested, 5);
                assert_eq!(available, 4);
            }
            _ => panic!("Expected InsufficientStock"),
        }
    }

    #[test]
    fn fulfillment_leaves_available_unchanged() {
        let key = test_key();
        let mut balance = InventoryBalance::empty(key);
        balance.apply_movement(&receipt(key, 10)).unwrap();
        balance.reserve(4).unwrap();

        let available_before = balance.available();
        balance.fulfill_hold(4).unwrap();
        assert_eq!(balance.on_hand, 6);
        assert_eq!(balance.allocated, 0);
        assert_eq!(balance.available(), available_before);
    }

    #[test]
    fn fulfillment_fails_when_physical_stock_was_adjusted_away() {
        let key = test_key();
        let mut balance = InventoryBalance::empty(key);
        balance.apply_movement(&receipt(key, 5)).unwrap();
        balance.reserve(5).unwrap();
        balance.apply_movement(&adjustment(key, -3)).unwrap();

        let err = balance.fulfill_hold(5).unwrap_err();
        match err {
            LedgerError::InsufficientStock {
                requested,
                available,
            } => {
                assert_eq!(requested, 5);
                assert_eq!(available, 2);
            }
            _ => panic!("Expected InsufficientStock"),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 512,
            ..ProptestConfig::default()
        })]

        /// Property: under any sequence of accepted operations, the row
        /// invariants hold: on_hand >= 0, allocated >= 0, available is the
        /// exact difference, and version counts the accepted mutations.
        #[test]
        fn accepted_operations_preserve_invariants(
            ops in prop::collection::vec((0u8..5u8, 1i64..1_000i64), 1..64)
        ) {
            let key = test_key();
            let mut balance = InventoryBalance::empty(key);
            let mut accepted = 0u64;

            for (op, qty) in ops {
                let result = match op {
                    0 => balance.apply_movement(&receipt(key, qty)),
                    1 => balance.apply_movement(&issue(key, qty)),
                    2 => balance.apply_movement(&adjustment(key, -qty)),
                    3 => balance.reserve(qty),
                    _ => {
                        let hold = qty.min(balance.allocated);
                        if hold > 0 {
                            balance.release_hold(hold)
                        } else {
                            continue;
                        }
                    }
                };
                if result.is_ok() {
                    accepted += 1;
                }

                prop_assert!(balance.on_hand >= 0);
                prop_assert!(balance.allocated >= 0);
                prop_assert_eq!(balance.available(), balance.on_hand - balance.allocated);
            }

            prop_assert_eq!(balance.version, accepted);
        }
    }
}
