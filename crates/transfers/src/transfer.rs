use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::reference::is_valid_reference;
use stockledger_core::{
    Aggregate, AggregateRoot, DomainError, DomainResult, Entity, PharmacyId, Quantity, ShopId,
    TRANSFER_PREFIX, UserId, typed_id,
};
use stockledger_events::{Event, StockEffect};
use stockledger_stock::ProductId;

typed_id!(
    /// Stock transfer identifier.
    StockTransferId
);

typed_id!(
    /// Stock transfer item identifier.
    StockTransferItemId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockTransferStatus {
    Draft,
    Validated,
    Cancelled,
}

impl StockTransferStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StockTransferStatus::Draft => "draft",
            StockTransferStatus::Validated => "validated",
            StockTransferStatus::Cancelled => "cancelled",
        }
    }

    pub fn can_be_edited(self) -> bool {
        self == StockTransferStatus::Draft
    }

    pub fn validate(self) -> DomainResult<Self> {
        match self {
            StockTransferStatus::Draft => Ok(StockTransferStatus::Validated),
            other => Err(DomainError::transition(format!(
                "only draft transfers can be validated (status: {})",
                other.as_str()
            ))),
        }
    }

    pub fn cancel(self) -> DomainResult<Self> {
        match self {
            StockTransferStatus::Draft => Ok(StockTransferStatus::Cancelled),
            StockTransferStatus::Validated => {
                Err(DomainError::transition("cannot cancel a validated transfer"))
            }
            StockTransferStatus::Cancelled => {
                Err(DomainError::transition("transfer is already cancelled"))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockTransferItem {
    id: StockTransferItemId,
    stock_transfer_id: StockTransferId,
    product_id: ProductId,
    quantity: Quantity,
    created_at: DateTime<Utc>,
}

impl StockTransferItem {
    pub fn id_typed(&self) -> StockTransferItemId {
        self.id
    }

    pub fn stock_transfer_id(&self) -> StockTransferId {
        self.stock_transfer_id
    }

    pub fn product_id(&self) -> ProductId {
        self.product_id
    }

    pub fn quantity(&self) -> Quantity {
        self.quantity
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl Entity for StockTransferItem {
    type Id = StockTransferItemId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// Quantity of one product to move, as frozen at validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLine {
    pub product_id: ProductId,
    pub quantity: Quantity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewStockTransfer {
    pub transfer_id: StockTransferId,
    pub pharmacy_id: PharmacyId,
    pub reference: String,
    pub from_shop_id: ShopId,
    pub to_shop_id: ShopId,
    pub created_by: UserId,
    pub notes: Option<String>,
}

/// Aggregate root: StockTransfer (owns its items).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockTransfer {
    id: StockTransferId,
    pharmacy_id: PharmacyId,
    reference: String,
    from_shop_id: ShopId,
    to_shop_id: ShopId,
    status: StockTransferStatus,
    created_by: UserId,
    validated_by: Option<UserId>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    validated_at: Option<DateTime<Utc>>,
    notes: Option<String>,
    items: Vec<StockTransferItem>,
    version: u64,
}

impl StockTransfer {
    pub fn create(new: NewStockTransfer, at: DateTime<Utc>) -> DomainResult<Self> {
        if new.from_shop_id == new.to_shop_id {
            return Err(DomainError::invalid_argument(
                "source and destination shops must differ",
            ));
        }
        if !is_valid_reference(TRANSFER_PREFIX, &new.reference) {
            return Err(DomainError::invalid_argument(format!(
                "invalid transfer reference '{}'",
                new.reference
            )));
        }

        Ok(Self {
            id: new.transfer_id,
            pharmacy_id: new.pharmacy_id,
            reference: new.reference,
            from_shop_id: new.from_shop_id,
            to_shop_id: new.to_shop_id,
            status: StockTransferStatus::Draft,
            created_by: new.created_by,
            validated_by: None,
            created_at: at,
            updated_at: at,
            validated_at: None,
            notes: new.notes.filter(|n| !n.trim().is_empty()),
            items: Vec::new(),
            version: 0,
        })
    }

    pub fn id_typed(&self) -> StockTransferId {
        self.id
    }

    pub fn pharmacy_id(&self) -> PharmacyId {
        self.pharmacy_id
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn from_shop_id(&self) -> ShopId {
        self.from_shop_id
    }

    pub fn to_shop_id(&self) -> ShopId {
        self.to_shop_id
    }

    pub fn status(&self) -> StockTransferStatus {
        self.status
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

    pub fn validated_at(&self) -> Option<DateTime<Utc>> {
        self.validated_at
    }

    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }

    pub fn items(&self) -> &[StockTransferItem] {
        &self.items
    }

    pub fn can_be_edited(&self) -> bool {
        self.status.can_be_edited()
    }

    pub fn item_for_product(&self, product_id: ProductId) -> Option<&StockTransferItem> {
        self.items.iter().find(|i| i.product_id == product_id)
    }

    fn ensure_editable(&self) -> DomainResult<()> {
        if self.can_be_edited() {
            Ok(())
        } else {
            Err(DomainError::transition(format!(
                "cannot edit a {} transfer",
                self.status.as_str()
            )))
        }
    }
}

impl AggregateRoot for StockTransfer {
    type Id = StockTransferId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: AddTransferItem. Adding a product already listed raises its quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddTransferItem {
    pub item_id: StockTransferItemId,
    pub product_id: ProductId,
    pub quantity: Quantity,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveTransferItem {
    pub product_id: ProductId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateTransfer {
    pub validated_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelTransfer {
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockTransferCommand {
    AddItem(AddTransferItem),
    RemoveItem(RemoveTransferItem),
    Validate(ValidateTransfer),
    Cancel(CancelTransfer),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferItemAdded {
    pub transfer_id: StockTransferId,
    pub item_id: StockTransferItemId,
    pub product_id: ProductId,
    pub quantity: Quantity,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferItemRemoved {
    pub transfer_id: StockTransferId,
    pub product_id: ProductId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: TransferValidated. `lines` is what the use-case moves between shops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferValidated {
    pub transfer_id: StockTransferId,
    pub from_shop_id: ShopId,
    pub to_shop_id: ShopId,
    pub validated_by: UserId,
    pub lines: Vec<TransferLine>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCancelled {
    pub transfer_id: StockTransferId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockTransferEvent {
    ItemAdded(TransferItemAdded),
    ItemRemoved(TransferItemRemoved),
    Validated(TransferValidated),
    Cancelled(TransferCancelled),
}

impl Event for StockTransferEvent {
    fn event_type(&self) -> &'static str {
        match self {
            StockTransferEvent::ItemAdded(_) => "transfers.transfer.item_added",
            StockTransferEvent::ItemRemoved(_) => "transfers.transfer.item_removed",
            StockTransferEvent::Validated(_) => "transfers.transfer.validated",
            StockTransferEvent::Cancelled(_) => "transfers.transfer.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            StockTransferEvent::ItemAdded(e) => e.occurred_at,
            StockTransferEvent::ItemRemoved(e) => e.occurred_at,
            StockTransferEvent::Validated(e) => e.occurred_at,
            StockTransferEvent::Cancelled(e) => e.occurred_at,
        }
    }

    fn stock_effect(&self) -> StockEffect {
        match self {
            StockTransferEvent::Validated(_) => StockEffect::Relocation,
            _ => StockEffect::None,
        }
    }
}

impl Aggregate for StockTransfer {
    type Command = StockTransferCommand;
    type Event = StockTransferEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            StockTransferEvent::ItemAdded(e) => {
                match self.items.iter_mut().find(|i| i.product_id == e.product_id) {
                    Some(item) => {
                        // Overflow was ruled out by `handle`.
                        item.quantity = item.quantity.add(e.quantity).unwrap_or(item.quantity);
                    }
                    None => self.items.push(StockTransferItem {
                        id: e.item_id,
                        stock_transfer_id: self.id,
                        product_id: e.product_id,
                        quantity: e.quantity,
                        created_at: e.occurred_at,
                    }),
                }
            }
            StockTransferEvent::ItemRemoved(e) => {
                self.items.retain(|i| i.product_id != e.product_id);
            }
            StockTransferEvent::Validated(e) => {
                self.status = StockTransferStatus::Validated;
                self.validated_by = Some(e.validated_by);
                self.validated_at = Some(e.occurred_at);
            }
            StockTransferEvent::Cancelled(_) => {
                self.status = StockTransferStatus::Cancelled;
            }
        }

        self.updated_at = event.occurred_at();
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            StockTransferCommand::AddItem(cmd) => {
                self.ensure_editable()?;
                if cmd.quantity.is_zero() {
                    return Err(DomainError::invalid_argument(
                        "transfer quantity must be positive",
                    ));
                }
                if let Some(existing) = self.item_for_product(cmd.product_id) {
                    existing.quantity.add(cmd.quantity)?;
                }

                Ok(vec![StockTransferEvent::ItemAdded(TransferItemAdded {
                    transfer_id: self.id,
                    item_id: cmd.item_id,
                    product_id: cmd.product_id,
                    quantity: cmd.quantity,
                    occurred_at: cmd.occurred_at,
                })])
            }
            StockTransferCommand::RemoveItem(cmd) => {
                self.ensure_editable()?;
                if self.item_for_product(cmd.product_id).is_none() {
                    return Err(DomainError::not_found(format!(
                        "product {} is not on transfer {}",
                        cmd.product_id, self.reference
                    )));
                }

                Ok(vec![StockTransferEvent::ItemRemoved(TransferItemRemoved {
                    transfer_id: self.id,
                    product_id: cmd.product_id,
                    occurred_at: cmd.occurred_at,
                })])
            }
            StockTransferCommand::Validate(cmd) => {
                self.status.validate()?;
                if self.items.is_empty() {
                    return Err(DomainError::invalid_argument(
                        "cannot validate a transfer without items",
                    ));
                }

                Ok(vec![StockTransferEvent::Validated(TransferValidated {
                    transfer_id: self.id,
                    from_shop_id: self.from_shop_id,
                    to_shop_id: self.to_shop_id,
                    validated_by: cmd.validated_by,
                    lines: self
                        .items
                        .iter()
                        .map(|i| TransferLine {
                            product_id: i.product_id,
                            quantity: i.quantity,
                        })
                        .collect(),
                    occurred_at: cmd.occurred_at,
                })])
            }
            StockTransferCommand::Cancel(cmd) => {
                self.status.cancel()?;
                Ok(vec![StockTransferEvent::Cancelled(TransferCancelled {
                    transfer_id: self.id,
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

    fn reference() -> String {
        let date = NaiveDate::from_ymd_opt(2024, 5, 2).unwrap();
        format_reference(TRANSFER_PREFIX, date, "Q7W8E9").unwrap()
    }

    fn new_transfer(from: ShopId, to: ShopId) -> NewStockTransfer {
        NewStockTransfer {
            transfer_id: StockTransferId::generate(),
            pharmacy_id: PharmacyId::new(),
            reference: reference(),
            from_shop_id: from,
            to_shop_id: to,
            created_by: UserId::new(),
            notes: Some("restock".to_string()),
        }
    }

    fn draft() -> StockTransfer {
        StockTransfer::create(new_transfer(ShopId::new(), ShopId::new()), test_time()).unwrap()
    }

    fn add(t: &mut StockTransfer, product_id: ProductId, qty: u64) -> DomainResult<()> {
        t.execute(&StockTransferCommand::AddItem(AddTransferItem {
            item_id: StockTransferItemId::generate(),
            product_id,
            quantity: Quantity::new(qty),
            occurred_at: test_time(),
        }))
        .map(|_| ())
    }

    fn validate_cmd() -> StockTransferCommand {
        StockTransferCommand::Validate(ValidateTransfer {
            validated_by: UserId::new(),
            occurred_at: test_time(),
        })
    }

    #[test]
    fn same_shop_is_rejected() {
        let shop = ShopId::new();
        let err = StockTransfer::create(new_transfer(shop, shop), test_time()).unwrap_err();
        assert!(matches!(err, DomainError::InvalidArgument(_)));
    }

    #[test]
    fn adding_a_listed_product_raises_its_quantity() {
        let mut t = draft();
        let p = ProductId::generate();
        add(&mut t, p, 3).unwrap();
        add(&mut t, p, 4).unwrap();
        assert_eq!(t.items().len(), 1);
        assert_eq!(t.items()[0].quantity().value(), 7);

        assert!(matches!(
            add(&mut t, p, 0),
            Err(DomainError::InvalidArgument(_))
        ));
    }

    #[test]
    fn remove_item_in_draft() {
        let mut t = draft();
        let p = ProductId::generate();
        add(&mut t, p, 3).unwrap();
        t.execute(&StockTransferCommand::RemoveItem(RemoveTransferItem {
            product_id: p,
            occurred_at: test_time(),
        }))
        .unwrap();
        assert!(t.items().is_empty());

        let missing = t.handle(&StockTransferCommand::RemoveItem(RemoveTransferItem {
            product_id: p,
            occurred_at: test_time(),
        }));
        assert!(matches!(missing, Err(DomainError::NotFound(_))));
    }

    #[test]
    fn validate_requires_items_and_emits_lines() {
        let mut t = draft();
        assert!(matches!(
            t.handle(&validate_cmd()),
            Err(DomainError::InvalidArgument(_))
        ));

        let p = ProductId::generate();
        add(&mut t, p, 5).unwrap();
        let events = t.execute(&validate_cmd()).unwrap();
        assert_eq!(events[0].stock_effect(), StockEffect::Relocation);
        let StockTransferEvent::Validated(v) = &events[0] else {
            panic!("expected a validation event");
        };
        assert_eq!(
            v.lines,
            vec![TransferLine {
                product_id: p,
                quantity: Quantity::new(5)
            }]
        );
        assert_eq!(t.status(), StockTransferStatus::Validated);
        assert!(t.validated_at().is_some());
        assert!(!t.can_be_edited());
    }

    #[test]
    fn validated_transfer_cannot_be_edited_or_cancelled() {
        let mut t = draft();
        let p = ProductId::generate();
        add(&mut t, p, 1).unwrap();
        t.execute(&validate_cmd()).unwrap();

        assert!(matches!(
            add(&mut t, p, 1),
            Err(DomainError::InvalidStateTransition(_))
        ));
        assert!(t.handle(&validate_cmd()).is_err());
        assert!(matches!(
            t.handle(&StockTransferCommand::Cancel(CancelTransfer {
                occurred_at: test_time()
            })),
            Err(DomainError::InvalidStateTransition(_))
        ));
    }

    #[test]
    fn cancel_draft_once() {
        let mut t = draft();
        let cancel = StockTransferCommand::Cancel(CancelTransfer {
            occurred_at: test_time(),
        });
        t.execute(&cancel).unwrap();
        assert_eq!(t.status(), StockTransferStatus::Cancelled);
        assert!(t.handle(&cancel).is_err());
        assert!(t.handle(&validate_cmd()).is_err());
    }
}
