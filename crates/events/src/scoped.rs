use stockledger_core::WarehouseId;

/// Helper trait for warehouse-scoped messages.
///
/// Feed consumers are often per-site (a warehouse's notification screen, a
/// local replenishment job). Messages exposing their warehouse let workers
/// be pinned to one site and ignore the rest; transfer legs scope to the
/// warehouse whose balance they touched.
pub trait WarehouseScoped {
    fn warehouse_id(&self) -> WarehouseId;
}
