//! Catalog port: the engine's read-only view of master data it does not own.
//!
//! Product variants and warehouses live in an external catalog. The engine
//! only needs existence checks and per-variant thresholds, so that is all
//! the port exposes; it is injected wherever needed, never a global.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

use stockledger_core::{LedgerError, LedgerResult, VariantId, WarehouseId};

/// Threshold configuration for one variant.
///
/// The engine-relevant fields are typed; whatever else the catalog tracks
/// for the variant rides along opaquely in `extensions` and is passed
/// through unmodified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantThresholds {
    /// Minimum stock level before the variant counts as low.
    pub min_stock_level: i64,
    /// Preferred reorder trigger; when set it supersedes `min_stock_level`
    /// as the low-stock threshold.
    pub reorder_point: Option<i64>,
    /// Suggested reorder size, carried for consumers of alert events.
    pub reorder_quantity: Option<i64>,
    /// Free-form catalog metadata the engine does not interpret.
    #[serde(default)]
    pub extensions: JsonMap<String, JsonValue>,
}

impl VariantThresholds {
    pub fn new(min_stock_level: i64) -> Self {
        Self {
            min_stock_level,
            reorder_point: None,
            reorder_quantity: None,
            extensions: JsonMap::new(),
        }
    }

    pub fn with_reorder_point(mut self, reorder_point: i64) -> Self {
        self.reorder_point = Some(reorder_point);
        self
    }

    /// The level at or under which stock counts as low. Zero disables
    /// low-stock alerts for the variant.
    pub fn low_stock_threshold(&self) -> i64 {
        self.reorder_point.unwrap_or(self.min_stock_level)
    }
}

/// Read-only master-data lookups the engine depends on.
pub trait CatalogPort: Send + Sync {
    /// Thresholds for a variant; `None` means the variant is unknown.
    fn variant_thresholds(&self, variant_id: VariantId)
    -> LedgerResult<Option<VariantThresholds>>;

    fn warehouse_exists(&self, warehouse_id: WarehouseId) -> LedgerResult<bool>;
}

impl<C> CatalogPort for Arc<C>
where
    C: CatalogPort + ?Sized,
{
    fn variant_thresholds(
        &self,
        variant_id: VariantId,
    ) -> LedgerResult<Option<VariantThresholds>> {
        (**self).variant_thresholds(variant_id)
    }

    fn warehouse_exists(&self, warehouse_id: WarehouseId) -> LedgerResult<bool> {
        (**self).warehouse_exists(warehouse_id)
    }
}

/// In-memory catalog for tests and embedding.
#[derive(Debug, Default)]
pub struct StaticCatalog {
    variants: RwLock<HashMap<VariantId, VariantThresholds>>,
    warehouses: RwLock<HashSet<WarehouseId>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_variant(
        &self,
        variant_id: VariantId,
        thresholds: VariantThresholds,
    ) -> LedgerResult<()> {
        self.variants
            .write()
            .map_err(|_| LedgerError::internal("catalog lock poisoned"))?
            .insert(variant_id, thresholds);
        Ok(())
    }

    pub fn register_warehouse(&self, warehouse_id: WarehouseId) -> LedgerResult<()> {
        self.warehouses
            .write()
            .map_err(|_| LedgerError::internal("catalog lock poisoned"))?
            .insert(warehouse_id);
        Ok(())
    }
}

impl CatalogPort for StaticCatalog {
    fn variant_thresholds(
        &self,
        variant_id: VariantId,
    ) -> LedgerResult<Option<VariantThresholds>> {
        let map = self
            .variants
            .read()
            .map_err(|_| LedgerError::internal("catalog lock poisoned"))?;
        Ok(map.get(&variant_id).cloned())
    }

    fn warehouse_exists(&self, warehouse_id: WarehouseId) -> LedgerResult<bool> {
        let set = self
            .warehouses
            .read()
            .map_err(|_| LedgerError::internal("catalog lock poisoned"))?;
        Ok(set.contains(&warehouse_id))
    }
}
