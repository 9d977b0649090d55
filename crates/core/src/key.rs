//! Balance identity: one row per variant per warehouse.

use serde::{Deserialize, Serialize};

use crate::id::{VariantId, WarehouseId};

/// Identity of a single balance row, and the unit of write serialization.
///
/// The derived ordering (variant first, warehouse second) is the global
/// lock order: any transaction touching more than one key must acquire
/// them ascending, so two transfers over the same pair can never deadlock.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct StockKey {
    pub variant_id: VariantId,
    pub warehouse_id: WarehouseId,
}

impl StockKey {
    pub fn new(variant_id: VariantId, warehouse_id: WarehouseId) -> Self {
        Self {
            variant_id,
            warehouse_id,
        }
    }
}

impl core::fmt::Display for StockKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}@{}", self.variant_id, self.warehouse_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn key(variant: u128, warehouse: u128) -> StockKey {
        StockKey::new(
            VariantId::from_uuid(Uuid::from_u128(variant)),
            WarehouseId::from_uuid(Uuid::from_u128(warehouse)),
        )
    }

    #[test]
    fn orders_by_variant_then_warehouse() {
        assert!(key(1, 9) < key(2, 0));
        assert!(key(1, 1) < key(1, 2));
        assert_eq!(key(3, 3), key(3, 3));
    }

    proptest! {
        /// Ordering agrees with the (variant, warehouse) tuple ordering,
        /// so sorting keys yields one global acquisition order.
        #[test]
        fn ordering_matches_tuple_ordering(a in any::<(u128, u128)>(), b in any::<(u128, u128)>()) {
            let (ka, kb) = (key(a.0, a.1), key(b.0, b.1));
            prop_assert_eq!(ka.cmp(&kb), a.cmp(&b));
        }
    }
}
