use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::reference::is_valid_reference;
use stockledger_core::{
    Aggregate, AggregateRoot, DomainError, DomainResult, Entity, INVENTORY_PREFIX, Quantity,
    ShopId, UserId, typed_id,
};
use stockledger_events::{Event, StockEffect};
use stockledger_stock::ProductId;

typed_id!(
    /// Inventory (count session) identifier.
    InventoryId
);

typed_id!(
    /// Inventory item identifier.
    InventoryItemId
);

/// Count session lifecycle: Draft → InProgress → Validated, with Cancelled
/// reachable until validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InventoryStatus {
    Draft,
    InProgress,
    Validated,
    Cancelled,
}

impl InventoryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InventoryStatus::Draft => "draft",
            InventoryStatus::InProgress => "in_progress",
            InventoryStatus::Validated => "validated",
            InventoryStatus::Cancelled => "cancelled",
        }
    }

    pub fn can_count(self) -> bool {
        matches!(self, InventoryStatus::Draft | InventoryStatus::InProgress)
    }

    pub fn start(self) -> DomainResult<Self> {
        match self {
            InventoryStatus::Draft => Ok(InventoryStatus::InProgress),
            other => Err(DomainError::transition(format!(
                "only draft inventories can be started (status: {})",
                other.as_str()
            ))),
        }
    }

    pub fn validate(self) -> DomainResult<Self> {
        match self {
            InventoryStatus::InProgress => Ok(InventoryStatus::Validated),
            other => Err(DomainError::transition(format!(
                "only in-progress inventories can be validated (status: {})",
                other.as_str()
            ))),
        }
    }

    pub fn cancel(self) -> DomainResult<Self> {
        match self {
            InventoryStatus::Draft | InventoryStatus::InProgress => Ok(InventoryStatus::Cancelled),
            InventoryStatus::Validated => Err(DomainError::transition(
                "cannot cancel a validated inventory",
            )),
            InventoryStatus::Cancelled => {
                Err(DomainError::transition("inventory is already cancelled"))
            }
        }
    }
}

/// One counted product: the system quantity frozen at start and the physical count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItem {
    id: InventoryItemId,
    inventory_id: InventoryId,
    product_id: ProductId,
    system_quantity: Quantity,
    counted_quantity: Option<Quantity>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl InventoryItem {
    pub fn id_typed(&self) -> InventoryItemId {
        self.id
    }

    pub fn inventory_id(&self) -> InventoryId {
        self.inventory_id
    }

    pub fn product_id(&self) -> ProductId {
        self.product_id
    }

    pub fn system_quantity(&self) -> Quantity {
        self.system_quantity
    }

    pub fn counted_quantity(&self) -> Option<Quantity> {
        self.counted_quantity
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_counted(&self) -> bool {
        self.counted_quantity.is_some()
    }

    /// Counted minus system quantity; `None` until counted.
    pub fn difference(&self) -> Option<i64> {
        self.counted_quantity
            .map(|counted| counted.signed_difference(self.system_quantity))
    }
}

impl Entity for InventoryItem {
    type Id = InventoryItemId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// Stock of one product at the instant the session started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockSnapshot {
    pub item_id: InventoryItemId,
    pub product_id: ProductId,
    pub system_quantity: Quantity,
}

/// Physical count for one product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountEntry {
    pub product_id: ProductId,
    pub counted_quantity: Quantity,
}

/// Reconciliation the use-case applies to the product's stock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryAdjustment {
    pub product_id: ProductId,
    pub difference: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewInventory {
    pub inventory_id: InventoryId,
    pub shop_id: ShopId,
    pub reference: String,
    pub created_by: UserId,
}

/// Aggregate root: Inventory (owns its items).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    id: InventoryId,
    shop_id: ShopId,
    reference: String,
    status: InventoryStatus,
    started_at: Option<DateTime<Utc>>,
    validated_at: Option<DateTime<Utc>>,
    created_by: UserId,
    validated_by: Option<UserId>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    items: Vec<InventoryItem>,
    version: u64,
}

impl Inventory {
    /// Open a draft session. The reference must follow `INV-<YYYYMMDD>-<SUFFIX>`.
    pub fn create(new: NewInventory, at: DateTime<Utc>) -> DomainResult<Self> {
        if !is_valid_reference(INVENTORY_PREFIX, &new.reference) {
            return Err(DomainError::invalid_argument(format!(
                "invalid inventory reference '{}'",
                new.reference
            )));
        }

        Ok(Self {
            id: new.inventory_id,
            shop_id: new.shop_id,
            reference: new.reference,
            status: InventoryStatus::Draft,
            started_at: None,
            validated_at: None,
            created_by: new.created_by,
            validated_by: None,
            created_at: at,
            updated_at: at,
            items: Vec::new(),
            version: 0,
        })
    }

    pub fn id_typed(&self) -> InventoryId {
        self.id
    }

    pub fn shop_id(&self) -> ShopId {
        self.shop_id
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn status(&self) -> InventoryStatus {
        self.status
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn validated_at(&self) -> Option<DateTime<Utc>> {
        self.validated_at
    }

    pub fn created_by(&self) -> UserId {
        self.created_by
    }

    pub fn validated_by(&self) -> Option<UserId> {
        self.validated_by
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn items(&self) -> &[InventoryItem] {
        &self.items
    }

    pub fn item_for_product(&self, product_id: ProductId) -> Option<&InventoryItem> {
        self.items.iter().find(|i| i.product_id == product_id)
    }

    /// Sum of positive differences over counted items.
    pub fn total_positive_difference(&self) -> u64 {
        self.items
            .iter()
            .filter_map(InventoryItem::difference)
            .filter(|d| *d > 0)
            .map(|d| d.unsigned_abs())
            .sum()
    }

    /// Sum of the magnitudes of negative differences over counted items.
    pub fn total_negative_difference(&self) -> u64 {
        self.items
            .iter()
            .filter_map(InventoryItem::difference)
            .filter(|d| *d < 0)
            .map(|d| d.unsigned_abs())
            .sum()
    }

    /// Counted items whose stock must change on validation.
    pub fn pending_adjustments(&self) -> Vec<InventoryAdjustment> {
        self.items
            .iter()
            .filter_map(|item| {
                item.difference()
                    .filter(|d| *d != 0)
                    .map(|difference| InventoryAdjustment {
                        product_id: item.product_id,
                        difference,
                    })
            })
            .collect()
    }
}

impl AggregateRoot for Inventory {
    type Id = InventoryId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: StartInventory. The snapshot is read by the use-case under lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartInventory {
    pub snapshot: Vec<StockSnapshot>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordCounts (last write wins per product).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordCounts {
    pub counts: Vec<CountEntry>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ValidateInventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateInventory {
    pub validated_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelInventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelInventory {
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryCommand {
    Start(StartInventory),
    RecordCounts(RecordCounts),
    Validate(ValidateInventory),
    Cancel(CancelInventory),
}

/// Event: InventoryStarted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryStarted {
    pub inventory_id: InventoryId,
    pub snapshot: Vec<StockSnapshot>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: CountsRecorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountsRecorded {
    pub inventory_id: InventoryId,
    pub counts: Vec<CountEntry>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: InventoryValidated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryValidated {
    pub inventory_id: InventoryId,
    pub validated_by: UserId,
    pub adjustments: Vec<InventoryAdjustment>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: InventoryCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryCancelled {
    pub inventory_id: InventoryId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryEvent {
    Started(InventoryStarted),
    CountsRecorded(CountsRecorded),
    Validated(InventoryValidated),
    Cancelled(InventoryCancelled),
}

impl Event for InventoryEvent {
    fn event_type(&self) -> &'static str {
        match self {
            InventoryEvent::Started(_) => "inventory.session.started",
            InventoryEvent::CountsRecorded(_) => "inventory.session.counts_recorded",
            InventoryEvent::Validated(_) => "inventory.session.validated",
            InventoryEvent::Cancelled(_) => "inventory.session.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            InventoryEvent::Started(e) => e.occurred_at,
            InventoryEvent::CountsRecorded(e) => e.occurred_at,
            InventoryEvent::Validated(e) => e.occurred_at,
            InventoryEvent::Cancelled(e) => e.occurred_at,
        }
    }

    fn stock_effect(&self) -> StockEffect {
        match self {
            InventoryEvent::Validated(_) => StockEffect::Reconciliation,
            _ => StockEffect::None,
        }
    }
}

impl Aggregate for Inventory {
    type Command = InventoryCommand;
    type Event = InventoryEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            InventoryEvent::Started(e) => {
                self.status = InventoryStatus::InProgress;
                self.started_at = Some(e.occurred_at);
                self.items = e
                    .snapshot
                    .iter()
                    .map(|s| InventoryItem {
                        id: s.item_id,
                        inventory_id: self.id,
                        product_id: s.product_id,
                        system_quantity: s.system_quantity,
                        counted_quantity: None,
                        created_at: e.occurred_at,
                        updated_at: e.occurred_at,
                    })
                    .collect();
            }
            InventoryEvent::CountsRecorded(e) => {
                for entry in &e.counts {
                    if let Some(item) = self
                        .items
                        .iter_mut()
                        .find(|i| i.product_id == entry.product_id)
                    {
                        item.counted_quantity = Some(entry.counted_quantity);
                        item.updated_at = e.occurred_at;
                    }
                }
            }
            InventoryEvent::Validated(e) => {
                self.status = InventoryStatus::Validated;
                self.validated_at = Some(e.occurred_at);
                self.validated_by = Some(e.validated_by);
            }
            InventoryEvent::Cancelled(_) => {
                self.status = InventoryStatus::Cancelled;
            }
        }

        self.updated_at = event.occurred_at();
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            InventoryCommand::Start(cmd) => {
                self.status.start()?;
                let mut seen = BTreeSet::new();
                if let Some(dup) = cmd.snapshot.iter().find(|s| !seen.insert(s.product_id)) {
                    return Err(DomainError::invariant(format!(
                        "product {} appears twice in the inventory snapshot",
                        dup.product_id
                    )));
                }

                Ok(vec![InventoryEvent::Started(InventoryStarted {
                    inventory_id: self.id,
                    snapshot: cmd.snapshot.clone(),
                    occurred_at: cmd.occurred_at,
                })])
            }
            InventoryCommand::RecordCounts(cmd) => {
                if !self.status.can_count() {
                    return Err(DomainError::transition(format!(
                        "cannot record counts on a {} inventory",
                        self.status.as_str()
                    )));
                }
                if let Some(missing) = cmd
                    .counts
                    .iter()
                    .find(|c| self.item_for_product(c.product_id).is_none())
                {
                    return Err(DomainError::not_found(format!(
                        "product {} is not part of inventory {}",
                        missing.product_id, self.reference
                    )));
                }

                Ok(vec![InventoryEvent::CountsRecorded(CountsRecorded {
                    inventory_id: self.id,
                    counts: cmd.counts.clone(),
                    occurred_at: cmd.occurred_at,
                })])
            }
            InventoryCommand::Validate(cmd) => {
                self.status.validate()?;
                Ok(vec![InventoryEvent::Validated(InventoryValidated {
                    inventory_id: self.id,
                    validated_by: cmd.validated_by,
                    adjustments: self.pending_adjustments(),
                    occurred_at: cmd.occurred_at,
                })])
            }
            InventoryCommand::Cancel(cmd) => {
                self.status.cancel()?;
                Ok(vec![InventoryEvent::Cancelled(InventoryCancelled {
                    inventory_id: self.id,
                    occurred_at: cmd.occurred_at,
                })])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use stockledger_core::reference::format_reference;

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn draft() -> Inventory {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        Inventory::create(
            NewInventory {
                inventory_id: InventoryId::generate(),
                shop_id: ShopId::new(),
                reference: format_reference(INVENTORY_PREFIX, date, "AB12CD").unwrap(),
                created_by: UserId::new(),
            },
            test_time(),
        )
        .unwrap()
    }

    fn snapshot(product_id: ProductId, qty: u64) -> StockSnapshot {
        StockSnapshot {
            item_id: InventoryItemId::generate(),
            product_id,
            system_quantity: Quantity::new(qty),
        }
    }

    fn start(inv: &mut Inventory, snapshot: Vec<StockSnapshot>) {
        inv.execute(&InventoryCommand::Start(StartInventory {
            snapshot,
            occurred_at: test_time(),
        }))
        .unwrap();
    }

    fn count(inv: &mut Inventory, product_id: ProductId, qty: u64) -> DomainResult<()> {
        inv.execute(&InventoryCommand::RecordCounts(RecordCounts {
            counts: vec![CountEntry {
                product_id,
                counted_quantity: Quantity::new(qty),
            }],
            occurred_at: test_time(),
        }))
        .map(|_| ())
    }

    fn validate_cmd() -> InventoryCommand {
        InventoryCommand::Validate(ValidateInventory {
            validated_by: UserId::new(),
            occurred_at: test_time(),
        })
    }

    #[test]
    fn create_rejects_malformed_reference() {
        let err = Inventory::create(
            NewInventory {
                inventory_id: InventoryId::generate(),
                shop_id: ShopId::new(),
                reference: "INV-2024-XYZ".to_string(),
                created_by: UserId::new(),
            },
            test_time(),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::InvalidArgument(_)));
    }

    #[test]
    fn start_freezes_system_quantities() {
        let mut inv = draft();
        let a = ProductId::generate();
        let b = ProductId::generate();
        start(&mut inv, vec![snapshot(a, 10), snapshot(b, 5)]);

        assert_eq!(inv.status(), InventoryStatus::InProgress);
        assert!(inv.started_at().is_some());
        assert_eq!(inv.items().len(), 2);
        assert_eq!(inv.item_for_product(b).unwrap().system_quantity().value(), 5);
        assert_eq!(inv.item_for_product(a).unwrap().difference(), None);

        let again = inv.handle(&InventoryCommand::Start(StartInventory {
            snapshot: vec![],
            occurred_at: test_time(),
        }));
        assert!(matches!(again, Err(DomainError::InvalidStateTransition(_))));
    }

    #[test]
    fn duplicate_snapshot_product_is_rejected() {
        let inv = draft();
        let a = ProductId::generate();
        let err = inv
            .handle(&InventoryCommand::Start(StartInventory {
                snapshot: vec![snapshot(a, 1), snapshot(a, 2)],
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn counts_last_write_wins_and_unknown_product_is_not_found() {
        let mut inv = draft();
        let a = ProductId::generate();
        start(&mut inv, vec![snapshot(a, 50)]);

        count(&mut inv, a, 40).unwrap();
        count(&mut inv, a, 45).unwrap();
        assert_eq!(inv.item_for_product(a).unwrap().difference(), Some(-5));

        let err = count(&mut inv, ProductId::generate(), 1).unwrap_err();
        assert!(matches!(err, DomainError::NotFound(_)));
        assert_eq!(
            inv.item_for_product(a).unwrap().counted_quantity(),
            Some(Quantity::new(45))
        );
    }

    #[test]
    fn validate_lists_non_zero_counted_differences() {
        let mut inv = draft();
        let (a, b, c, d) = (
            ProductId::generate(),
            ProductId::generate(),
            ProductId::generate(),
            ProductId::generate(),
        );
        start(
            &mut inv,
            vec![snapshot(a, 10), snapshot(b, 5), snapshot(c, 7), snapshot(d, 3)],
        );
        count(&mut inv, a, 12).unwrap();
        count(&mut inv, b, 1).unwrap();
        count(&mut inv, c, 7).unwrap();

        assert_eq!(inv.total_positive_difference(), 2);
        assert_eq!(inv.total_negative_difference(), 4);

        let events = inv.execute(&validate_cmd()).unwrap();
        let InventoryEvent::Validated(validated) = &events[0] else {
            panic!("expected a validation event");
        };
        assert_eq!(events[0].stock_effect(), StockEffect::Reconciliation);
        assert_eq!(
            validated.adjustments,
            vec![
                InventoryAdjustment {
                    product_id: a,
                    difference: 2
                },
                InventoryAdjustment {
                    product_id: b,
                    difference: -4
                },
            ]
        );
        assert_eq!(inv.status(), InventoryStatus::Validated);
        assert!(inv.validated_at().is_some());
        assert!(inv.validated_by().is_some());
    }

    #[test]
    fn validated_inventory_is_frozen() {
        let mut inv = draft();
        let a = ProductId::generate();
        start(&mut inv, vec![snapshot(a, 1)]);
        inv.execute(&validate_cmd()).unwrap();

        assert!(matches!(
            inv.handle(&validate_cmd()),
            Err(DomainError::InvalidStateTransition(_))
        ));
        assert!(matches!(
            count(&mut inv, a, 3),
            Err(DomainError::InvalidStateTransition(_))
        ));
        assert!(
            inv.handle(&InventoryCommand::Cancel(CancelInventory {
                occurred_at: test_time()
            }))
            .is_err()
        );
    }

    #[test]
    fn validate_requires_in_progress() {
        let inv = draft();
        assert!(matches!(
            inv.handle(&validate_cmd()),
            Err(DomainError::InvalidStateTransition(_))
        ));
    }

    #[test]
    fn cancel_from_draft_and_in_progress() {
        let cancel = InventoryCommand::Cancel(CancelInventory {
            occurred_at: test_time(),
        });
        let mut a = draft();
        a.execute(&cancel).unwrap();
        assert_eq!(a.status(), InventoryStatus::Cancelled);
        assert!(a.handle(&cancel).is_err());

        let mut b = draft();
        start(&mut b, vec![]);
        b.execute(&cancel).unwrap();
        assert_eq!(b.status(), InventoryStatus::Cancelled);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: totals equal the sums of positive and negative differences, and
            /// their signed difference equals the net adjustment.
            #[test]
            fn totals_match_adjustments(
                rows in proptest::collection::vec((0u64..500, proptest::option::of(0u64..500)), 0..12)
            ) {
                let mut inv = draft();
                let products: Vec<ProductId> = rows.iter().map(|_| ProductId::generate()).collect();
                start(
                    &mut inv,
                    products.iter().zip(&rows).map(|(p, (sys, _))| snapshot(*p, *sys)).collect(),
                );
                for (p, (_, counted)) in products.iter().zip(&rows) {
                    if let Some(c) = counted {
                        count(&mut inv, *p, *c).unwrap();
                    }
                }

                let net: i64 = inv.pending_adjustments().iter().map(|a| a.difference).sum();
                prop_assert_eq!(
                    net,
                    inv.total_positive_difference() as i64 - inv.total_negative_difference() as i64
                );
                prop_assert!(inv.pending_adjustments().iter().all(|a| a.difference != 0));
            }
        }
    }
}
