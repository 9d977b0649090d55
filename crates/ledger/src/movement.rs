//! Movement commands and journal rows.
//!
//! A movement is an immutable fact about stock entering, leaving or moving
//! between warehouses. Commands validate caller input and produce
//! `MovementDraft`s; the store assigns the per-key sequence at commit and
//! returns `StockMovement` rows. Journal rows are never updated or deleted.

use chrono::{DateTime, Utc};
use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stockledger_core::{
    LedgerError, LedgerResult, MovementId, StockKey, VariantId, WarehouseId,
};

/// What kind of stock movement a journal row records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MovementKind {
    /// Stock entering a warehouse (receipt).
    In,
    /// Stock leaving a warehouse (issue).
    Out,
    /// Correction with a signed delta (cycle count, damage, found stock).
    Adjust,
    /// One leg of a two-leg move between warehouses.
    Transfer,
}

impl MovementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementKind::In => "in",
            MovementKind::Out => "out",
            MovementKind::Adjust => "adjust",
            MovementKind::Transfer => "transfer",
        }
    }
}

impl FromStr for MovementKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in" => Ok(MovementKind::In),
            "out" => Ok(MovementKind::Out),
            "adjust" => Ok(MovementKind::Adjust),
            "transfer" => Ok(MovementKind::Transfer),
            other => Err(LedgerError::validation(format!(
                "unknown movement kind '{other}'"
            ))),
        }
    }
}

/// Which side of a transfer a leg records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Outbound,
    Inbound,
}

impl TransferDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferDirection::Outbound => "outbound",
            TransferDirection::Inbound => "inbound",
        }
    }
}

impl FromStr for TransferDirection {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "outbound" => Ok(TransferDirection::Outbound),
            "inbound" => Ok(TransferDirection::Inbound),
            other => Err(LedgerError::validation(format!(
                "unknown transfer direction '{other}'"
            ))),
        }
    }
}

/// Transfer metadata carried by each leg, making the row self-describing.
///
/// Both legs share the caller's `Reference`; `counterparty` names the other
/// warehouse, so `(reference, counterparty)` reconstructs the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLeg {
    pub direction: TransferDirection,
    pub counterparty: WarehouseId,
}

/// What caused a movement or reservation (order, transfer document, manual
/// correction, ...). The kind set is open; a few common ones have helpers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub kind: String,
    pub id: Uuid,
}

impl Reference {
    pub fn new(kind: impl Into<String>, id: Uuid) -> Self {
        Self {
            kind: kind.into(),
            id,
        }
    }

    pub fn order(id: Uuid) -> Self {
        Self::new("order", id)
    }

    pub fn purchase_order(id: Uuid) -> Self {
        Self::new("purchase_order", id)
    }

    pub fn transfer(id: Uuid) -> Self {
        Self::new("transfer", id)
    }

    pub fn manual(id: Uuid) -> Self {
        Self::new("manual", id)
    }

    pub fn reservation(id: Uuid) -> Self {
        Self::new("reservation", id)
    }
}

/// Command: record a receipt (stock in).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordReceipt {
    pub variant_id: VariantId,
    pub warehouse_id: WarehouseId,
    /// Positive quantity received.
    pub qty: i64,
    /// Acquisition cost per unit in minor currency units, when known.
    pub unit_cost: Option<i64>,
    pub reference: Reference,
    pub occurred_at: DateTime<Utc>,
}

/// Command: record an issue (stock out).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordIssue {
    pub variant_id: VariantId,
    pub warehouse_id: WarehouseId,
    /// Positive quantity issued.
    pub qty: i64,
    pub unit_cost: Option<i64>,
    pub reference: Reference,
    pub occurred_at: DateTime<Utc>,
}

/// Command: record a signed correction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordAdjustment {
    pub variant_id: VariantId,
    pub warehouse_id: WarehouseId,
    /// Signed delta; must not be zero.
    pub delta: i64,
    pub unit_cost: Option<i64>,
    pub reference: Reference,
    pub occurred_at: DateTime<Utc>,
}

/// Command: move stock between two warehouses of the same variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordTransfer {
    pub variant_id: VariantId,
    pub source_warehouse_id: WarehouseId,
    pub destination_warehouse_id: WarehouseId,
    /// Positive quantity moved.
    pub qty: i64,
    pub reference: Reference,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MovementCommand {
    Receipt(RecordReceipt),
    Issue(RecordIssue),
    Adjustment(RecordAdjustment),
    Transfer(RecordTransfer),
}

impl MovementCommand {
    /// Validate the command and produce the draft rows to journal.
    ///
    /// One draft for receipts/issues/adjustments; two for transfers
    /// (outbound leg first). Drafts from one command must be committed in
    /// one transaction.
    pub fn into_drafts(self) -> LedgerResult<Vec<MovementDraft>> {
        match self {
            MovementCommand::Receipt(cmd) => Ok(vec![MovementDraft::receipt(
                StockKey::new(cmd.variant_id, cmd.warehouse_id),
                cmd.qty,
                cmd.unit_cost,
                cmd.reference,
                cmd.occurred_at,
            )?]),
            MovementCommand::Issue(cmd) => Ok(vec![MovementDraft::issue(
                StockKey::new(cmd.variant_id, cmd.warehouse_id),
                cmd.qty,
                cmd.unit_cost,
                cmd.reference,
                cmd.occurred_at,
            )?]),
            MovementCommand::Adjustment(cmd) => Ok(vec![MovementDraft::adjustment(
                StockKey::new(cmd.variant_id, cmd.warehouse_id),
                cmd.delta,
                cmd.unit_cost,
                cmd.reference,
                cmd.occurred_at,
            )?]),
            MovementCommand::Transfer(cmd) => MovementDraft::transfer_pair(
                cmd.variant_id,
                cmd.source_warehouse_id,
                cmd.destination_warehouse_id,
                cmd.qty,
                cmd.reference,
                cmd.occurred_at,
            ),
        }
    }

    /// Warehouses this command touches (used for existence checks).
    pub fn warehouse_ids(&self) -> Vec<WarehouseId> {
        match self {
            MovementCommand::Receipt(c) => vec![c.warehouse_id],
            MovementCommand::Issue(c) => vec![c.warehouse_id],
            MovementCommand::Adjustment(c) => vec![c.warehouse_id],
            MovementCommand::Transfer(c) => {
                vec![c.source_warehouse_id, c.destination_warehouse_id]
            }
        }
    }

    pub fn variant_id(&self) -> VariantId {
        match self {
            MovementCommand::Receipt(c) => c.variant_id,
            MovementCommand::Issue(c) => c.variant_id,
            MovementCommand::Adjustment(c) => c.variant_id,
            MovementCommand::Transfer(c) => c.variant_id,
        }
    }
}

/// A validated movement that has not been journaled yet.
///
/// The store assigns the per-key `sequence` during commit and returns the
/// resulting `StockMovement`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementDraft {
    pub key: StockKey,
    pub kind: MovementKind,
    /// Positive magnitude for In/Out/Transfer; signed for Adjust.
    pub qty: i64,
    pub unit_cost: Option<i64>,
    pub transfer: Option<TransferLeg>,
    pub reference: Reference,
    pub occurred_at: DateTime<Utc>,
}

impl MovementDraft {
    pub fn receipt(
        key: StockKey,
        qty: i64,
        unit_cost: Option<i64>,
        reference: Reference,
        occurred_at: DateTime<Utc>,
    ) -> LedgerResult<Self> {
        require_positive_qty(qty)?;
        require_valid_cost(unit_cost)?;
        Ok(Self {
            key,
            kind: MovementKind::In,
            qty,
            unit_cost,
            transfer: None,
            reference,
            occurred_at,
        })
    }

    pub fn issue(
        key: StockKey,
        qty: i64,
        unit_cost: Option<i64>,
        reference: Reference,
        occurred_at: DateTime<Utc>,
    ) -> LedgerResult<Self> {
        require_positive_qty(qty)?;
        require_valid_cost(unit_cost)?;
        Ok(Self {
            key,
            kind: MovementKind::Out,
            qty,
            unit_cost,
            transfer: None,
            reference,
            occurred_at,
        })
    }

    pub fn adjustment(
        key: StockKey,
        delta: i64,
        unit_cost: Option<i64>,
        reference: Reference,
        occurred_at: DateTime<Utc>,
    ) -> LedgerResult<Self> {
        if delta == 0 {
            return Err(LedgerError::validation("adjustment delta must not be zero"));
        }
        require_valid_cost(unit_cost)?;
        Ok(Self {
            key,
            kind: MovementKind::Adjust,
            qty: delta,
            unit_cost,
            transfer: None,
            reference,
            occurred_at,
        })
    }

    /// Build both legs of a transfer: outbound from `source` first, then
    /// inbound to `destination`. Legs share the reference and timestamp.
    pub fn transfer_pair(
        variant_id: VariantId,
        source: WarehouseId,
        destination: WarehouseId,
        qty: i64,
        reference: Reference,
        occurred_at: DateTime<Utc>,
    ) -> LedgerResult<Vec<Self>> {
        require_positive_qty(qty)?;
        if source == destination {
            return Err(LedgerError::validation(
                "transfer source and destination must differ",
            ));
        }

        let outbound = Self {
            key: StockKey::new(variant_id, source),
            kind: MovementKind::Transfer,
            qty,
            unit_cost: None,
            transfer: Some(TransferLeg {
                direction: TransferDirection::Outbound,
                counterparty: destination,
            }),
            reference: reference.clone(),
            occurred_at,
        };
        let inbound = Self {
            key: StockKey::new(variant_id, destination),
            kind: MovementKind::Transfer,
            qty,
            unit_cost: None,
            transfer: Some(TransferLeg {
                direction: TransferDirection::Inbound,
                counterparty: source,
            }),
            reference,
            occurred_at,
        };

        Ok(vec![outbound, inbound])
    }

    /// Effect of this movement on `on_hand` for its key.
    pub fn signed_delta(&self) -> i64 {
        signed_delta(self.kind, self.qty, self.transfer.as_ref())
    }
}

/// A journaled movement (assigned its per-key sequence).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub id: MovementId,
    pub key: StockKey,
    pub kind: MovementKind,
    pub qty: i64,
    pub unit_cost: Option<i64>,
    pub transfer: Option<TransferLeg>,
    pub reference: Reference,
    /// Business time supplied by the caller.
    pub occurred_at: DateTime<Utc>,
    /// Commit time assigned by the store.
    pub recorded_at: DateTime<Utc>,
    /// Per-key position, 1-based, gapless. The linearization order of this
    /// key's history.
    pub sequence: u64,
}

impl StockMovement {
    /// Seal a draft into a journal row. Called by stores at commit, under
    /// the key's write serialization.
    pub fn commit(draft: MovementDraft, sequence: u64) -> Self {
        Self {
            id: MovementId::new(),
            key: draft.key,
            kind: draft.kind,
            qty: draft.qty,
            unit_cost: draft.unit_cost,
            transfer: draft.transfer,
            reference: draft.reference,
            occurred_at: draft.occurred_at,
            recorded_at: Utc::now(),
            sequence,
        }
    }

    pub fn signed_delta(&self) -> i64 {
        signed_delta(self.kind, self.qty, self.transfer.as_ref())
    }
}

fn signed_delta(kind: MovementKind, qty: i64, transfer: Option<&TransferLeg>) -> i64 {
    match kind {
        MovementKind::In => qty,
        MovementKind::Out => -qty,
        // Adjustment quantities are already signed.
        MovementKind::Adjust => qty,
        MovementKind::Transfer => match transfer.map(|t| t.direction) {
            Some(TransferDirection::Inbound) => qty,
            // Legs are built only through `transfer_pair`, so the leg is
            // always present; Outbound is the remaining case.
            _ => -qty,
        },
    }
}

fn require_positive_qty(qty: i64) -> LedgerResult<()> {
    if qty <= 0 {
        return Err(LedgerError::validation(format!(
            "quantity must be positive, got {qty}"
        )));
    }
    Ok(())
}

fn require_valid_cost(unit_cost: Option<i64>) -> LedgerResult<()> {
    if let Some(cost) = unit_cost {
        if cost < 0 {
            return Err(LedgerError::validation(format!(
                "unit cost must not be negative, got {cost}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_variant() -> VariantId {
        VariantId::new()
    }

    fn test_warehouse() -> WarehouseId {
        WarehouseId::new()
    }

    fn test_key() -> StockKey {
        StockKey::new(test_variant(), test_warehouse())
    }

    fn test_reference() -> Reference {
        Reference::manual(Uuid::now_v7())
    }

    #[test]
    fn receipt_produces_positive_delta() {
        let draft =
            MovementDraft::receipt(test_key(), 10, Some(250), test_reference(), Utc::now())
                .unwrap();
        assert_eq!(draft.kind, MovementKind::In);
        assert_eq!(draft.signed_delta(), 10);
    }

    #[test]
    fn issue_produces_negative_delta() {
        let draft =
            MovementDraft::issue(test_key(), 4, None, test_reference(), Utc::now()).unwrap();
        assert_eq!(draft.signed_delta(), -4);
    }

    #[test]
    fn zero_quantity_is_rejected() {
        let err = MovementDraft::receipt(test_key(), 0, None, test_reference(), Utc::now())
            .unwrap_err();
        match err {
            LedgerError::Validation(msg) => assert!(msg.contains("positive")),
            _ => panic!("Expected validation error for zero quantity"),
        }
    }

    #[test]
    fn negative_unit_cost_is_rejected() {
        let err = MovementDraft::receipt(test_key(), 1, Some(-5), test_reference(), Utc::now())
            .unwrap_err();
        match err {
            LedgerError::Validation(msg) => assert!(msg.contains("unit cost")),
            _ => panic!("Expected validation error for negative unit cost"),
        }
    }

    #[test]
    fn adjustment_keeps_sign_and_rejects_zero() {
        let down =
            MovementDraft::adjustment(test_key(), -3, None, test_reference(), Utc::now())
                .unwrap();
        assert_eq!(down.signed_delta(), -3);

        let err = MovementDraft::adjustment(test_key(), 0, None, test_reference(), Utc::now())
            .unwrap_err();
        match err {
            LedgerError::Validation(msg) => assert!(msg.contains("zero")),
            _ => panic!("Expected validation error for zero adjustment"),
        }
    }

    #[test]
    fn transfer_pair_builds_mirrored_legs() {
        let variant = test_variant();
        let source = test_warehouse();
        let destination = test_warehouse();
        let reference = Reference::transfer(Uuid::now_v7());

        let legs = MovementDraft::transfer_pair(
            variant,
            source,
            destination,
            7,
            reference.clone(),
            Utc::now(),
        )
        .unwrap();

        assert_eq!(legs.len(), 2);
        assert_eq!(legs[0].key, StockKey::new(variant, source));
        assert_eq!(legs[1].key, StockKey::new(variant, destination));
        assert_eq!(legs[0].signed_delta(), -7);
        assert_eq!(legs[1].signed_delta(), 7);
        assert_eq!(legs[0].reference, reference);
        assert_eq!(legs[1].reference, reference);
        assert_eq!(
            legs[0].transfer.unwrap().counterparty,
            destination,
        );
        assert_eq!(legs[1].transfer.unwrap().counterparty, source);
    }

    #[test]
    fn transfer_to_same_warehouse_is_rejected() {
        let warehouse = test_warehouse();
        let err = MovementDraft::transfer_pair(
            test_variant(),
            warehouse,
            warehouse,
            1,
            test_reference(),
            Utc::now(),
        )
        .unwrap_err();
        match err {
            LedgerError::Validation(msg) => assert!(msg.contains("differ")),
            _ => panic!("Expected validation error for same-warehouse transfer"),
        }
    }

    #[test]
    fn command_into_drafts_covers_all_kinds() {
        let variant = test_variant();
        let warehouse = test_warehouse();

        let drafts = MovementCommand::Receipt(RecordReceipt {
            variant_id: variant,
            warehouse_id: warehouse,
            qty: 5,
            unit_cost: None,
            reference: test_reference(),
            occurred_at: Utc::now(),
        })
        .into_drafts()
        .unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].kind, MovementKind::In);

        let drafts = MovementCommand::Transfer(RecordTransfer {
            variant_id: variant,
            source_warehouse_id: warehouse,
            destination_warehouse_id: test_warehouse(),
            qty: 2,
            reference: test_reference(),
            occurred_at: Utc::now(),
        })
        .into_drafts()
        .unwrap();
        assert_eq!(drafts.len(), 2);
    }

    #[test]
    fn movement_kind_round_trips_as_str() {
        for kind in [
            MovementKind::In,
            MovementKind::Out,
            MovementKind::Adjust,
            MovementKind::Transfer,
        ] {
            assert_eq!(kind.as_str().parse::<MovementKind>().unwrap(), kind);
        }
        assert!("teleport".parse::<MovementKind>().is_err());
    }

    proptest! {
        /// The two legs of any accepted transfer cancel out exactly.
        #[test]
        fn transfer_legs_sum_to_zero(qty in 1i64..1_000_000i64) {
            let legs = MovementDraft::transfer_pair(
                test_variant(),
                test_warehouse(),
                test_warehouse(),
                qty,
                test_reference(),
                Utc::now(),
            )
            .unwrap();
            prop_assert_eq!(legs[0].signed_delta() + legs[1].signed_delta(), 0);
        }

        /// Receipts always raise on-hand, issues always lower it.
        #[test]
        fn delta_sign_matches_kind(qty in 1i64..1_000_000i64) {
            let receipt = MovementDraft::receipt(
                test_key(), qty, None, test_reference(), Utc::now(),
            ).unwrap();
            let issue = MovementDraft::issue(
                test_key(), qty, None, test_reference(), Utc::now(),
            ).unwrap();
            prop_assert_eq!(receipt.signed_delta(), qty);
            prop_assert_eq!(issue.signed_delta(), -qty);
        }
    }
}
