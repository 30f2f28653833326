use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{
    Aggregate, AggregateRoot, CurrencyCode, DomainError, DomainResult, Entity, Quantity, ShopId,
    UserId, typed_id,
};
use stockledger_events::{Event, StockEffect};
use stockledger_stock::ProductId;

typed_id!(
    /// Purchase order identifier.
    PurchaseOrderId
);

typed_id!(
    /// Purchase order line identifier.
    PurchaseOrderLineId
);

typed_id!(
    /// Supplier identifier (supplier records live outside the stock engine).
    SupplierId
);

/// Purchase order status lifecycle.
///
/// ```text
/// Draft ──confirm──▶ Confirmed ──receive──▶ PartiallyReceived ──receive──▶ Received
///   │                   │  └────────────────receive (all lines)──────────────▲
///   └──cancel──▶ Cancelled ◀──cancel──┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseOrderStatus {
    Draft,
    Confirmed,
    PartiallyReceived,
    Received,
    Cancelled,
}

impl PurchaseOrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PurchaseOrderStatus::Draft => "draft",
            PurchaseOrderStatus::Confirmed => "confirmed",
            PurchaseOrderStatus::PartiallyReceived => "partially_received",
            PurchaseOrderStatus::Received => "received",
            PurchaseOrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PurchaseOrderStatus::Received | PurchaseOrderStatus::Cancelled
        )
    }

    /// Stock can be received against the order.
    pub fn can_receive(self) -> bool {
        matches!(
            self,
            PurchaseOrderStatus::Confirmed | PurchaseOrderStatus::PartiallyReceived
        )
    }

    pub fn confirm(self) -> DomainResult<Self> {
        match self {
            PurchaseOrderStatus::Draft => Ok(PurchaseOrderStatus::Confirmed),
            other => Err(DomainError::transition(format!(
                "only draft purchase orders can be confirmed (status: {})",
                other.as_str()
            ))),
        }
    }

    pub fn mark_partially_received(self) -> DomainResult<Self> {
        if self.can_receive() {
            Ok(PurchaseOrderStatus::PartiallyReceived)
        } else {
            Err(DomainError::transition(format!(
                "cannot mark a {} purchase order as partially received",
                self.as_str()
            )))
        }
    }

    pub fn mark_received(self) -> DomainResult<Self> {
        if self.can_receive() {
            Ok(PurchaseOrderStatus::Received)
        } else {
            Err(DomainError::transition(format!(
                "cannot mark a {} purchase order as received",
                self.as_str()
            )))
        }
    }

    /// Orders that have taken stock in can never be cancelled.
    pub fn cancel(self) -> DomainResult<Self> {
        match self {
            PurchaseOrderStatus::Draft | PurchaseOrderStatus::Confirmed => {
                Ok(PurchaseOrderStatus::Cancelled)
            }
            PurchaseOrderStatus::PartiallyReceived | PurchaseOrderStatus::Received => {
                Err(DomainError::transition(
                    "cannot cancel a purchase order that has received stock",
                ))
            }
            PurchaseOrderStatus::Cancelled => {
                Err(DomainError::transition("purchase order is already cancelled"))
            }
        }
    }
}

/// Purchase order line: one product, ordered and received quantities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrderLine {
    id: PurchaseOrderLineId,
    purchase_order_id: PurchaseOrderId,
    product_id: ProductId,
    ordered_quantity: Quantity,
    received_quantity: Quantity,
    unit_cost: Decimal,
    line_total: Decimal,
    created_at: DateTime<Utc>,
}

impl PurchaseOrderLine {
    fn new(
        id: PurchaseOrderLineId,
        purchase_order_id: PurchaseOrderId,
        product_id: ProductId,
        ordered_quantity: Quantity,
        unit_cost: Decimal,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            purchase_order_id,
            product_id,
            ordered_quantity,
            received_quantity: Quantity::ZERO,
            unit_cost,
            line_total: unit_cost * Decimal::from(ordered_quantity.value()),
            created_at,
        }
    }

    pub fn id_typed(&self) -> PurchaseOrderLineId {
        self.id
    }

    pub fn purchase_order_id(&self) -> PurchaseOrderId {
        self.purchase_order_id
    }

    pub fn product_id(&self) -> ProductId {
        self.product_id
    }

    pub fn ordered_quantity(&self) -> Quantity {
        self.ordered_quantity
    }

    pub fn received_quantity(&self) -> Quantity {
        self.received_quantity
    }

    pub fn unit_cost(&self) -> Decimal {
        self.unit_cost
    }

    pub fn line_total(&self) -> Decimal {
        self.line_total
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn remaining_quantity(&self) -> Quantity {
        self.ordered_quantity
            .subtract(self.received_quantity)
            .unwrap_or(Quantity::ZERO)
    }

    pub fn is_fully_received(&self) -> bool {
        self.received_quantity >= self.ordered_quantity
    }

    pub fn has_receipt(&self) -> bool {
        !self.received_quantity.is_zero()
    }

    /// Record delivered quantity. Fails without change if it would exceed the
    /// ordered quantity.
    pub fn register_reception(&mut self, quantity: Quantity) -> DomainResult<()> {
        if quantity.is_zero() {
            return Err(DomainError::invalid_argument(
                "received quantity must be positive",
            ));
        }
        let after = self.received_quantity.add(quantity)?;
        if after > self.ordered_quantity {
            return Err(DomainError::ExceedsOrderedQuantity {
                ordered: self.ordered_quantity.value(),
                received: self.received_quantity.value(),
                requested: quantity.value(),
            });
        }
        self.received_quantity = after;
        Ok(())
    }
}

impl Entity for PurchaseOrderLine {
    type Id = PurchaseOrderLineId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// Status implied by the lines' reception progress: `Received` when every line
/// is complete, `PartiallyReceived` when anything arrived, `None` otherwise.
pub fn derive_receipt_status(lines: &[PurchaseOrderLine]) -> Option<PurchaseOrderStatus> {
    if !lines.is_empty() && lines.iter().all(PurchaseOrderLine::is_fully_received) {
        Some(PurchaseOrderStatus::Received)
    } else if lines.iter().any(PurchaseOrderLine::has_receipt) {
        Some(PurchaseOrderStatus::PartiallyReceived)
    } else {
        None
    }
}

/// Input for opening a purchase order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPurchaseOrder {
    pub order_id: PurchaseOrderId,
    pub shop_id: ShopId,
    pub supplier_id: SupplierId,
    pub currency: CurrencyCode,
    pub expected_at: Option<DateTime<Utc>>,
    pub created_by: UserId,
}

/// Aggregate root: PurchaseOrder (owns its lines).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrder {
    id: PurchaseOrderId,
    shop_id: ShopId,
    supplier_id: SupplierId,
    status: PurchaseOrderStatus,
    total: Decimal,
    currency: CurrencyCode,
    ordered_at: Option<DateTime<Utc>>,
    expected_at: Option<DateTime<Utc>>,
    received_at: Option<DateTime<Utc>>,
    created_by: UserId,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    lines: Vec<PurchaseOrderLine>,
    version: u64,
}

impl PurchaseOrder {
    pub fn create(new: NewPurchaseOrder, at: DateTime<Utc>) -> Self {
        Self {
            id: new.order_id,
            shop_id: new.shop_id,
            supplier_id: new.supplier_id,
            status: PurchaseOrderStatus::Draft,
            total: Decimal::ZERO,
            currency: new.currency,
            ordered_at: None,
            expected_at: new.expected_at,
            received_at: None,
            created_by: new.created_by,
            created_at: at,
            updated_at: at,
            lines: Vec::new(),
            version: 0,
        }
    }

    pub fn id_typed(&self) -> PurchaseOrderId {
        self.id
    }

    pub fn shop_id(&self) -> ShopId {
        self.shop_id
    }

    pub fn supplier_id(&self) -> SupplierId {
        self.supplier_id
    }

    pub fn status(&self) -> PurchaseOrderStatus {
        self.status
    }

    pub fn total(&self) -> Decimal {
        self.total
    }

    pub fn currency(&self) -> &CurrencyCode {
        &self.currency
    }

    pub fn ordered_at(&self) -> Option<DateTime<Utc>> {
        self.ordered_at
    }

    pub fn expected_at(&self) -> Option<DateTime<Utc>> {
        self.expected_at
    }

    pub fn received_at(&self) -> Option<DateTime<Utc>> {
        self.received_at
    }

    pub fn created_by(&self) -> UserId {
        self.created_by
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn lines(&self) -> &[PurchaseOrderLine] {
        &self.lines
    }

    pub fn line_for_product(&self, product_id: ProductId) -> Option<&PurchaseOrderLine> {
        self.lines.iter().find(|l| l.product_id == product_id)
    }

    fn line_mut(&mut self, line_id: PurchaseOrderLineId) -> Option<&mut PurchaseOrderLine> {
        self.lines.iter_mut().find(|l| l.id == line_id)
    }
}

impl AggregateRoot for PurchaseOrder {
    type Id = PurchaseOrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: AddLine (only allowed in Draft).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddLine {
    pub line_id: PurchaseOrderLineId,
    pub product_id: ProductId,
    pub quantity: Quantity,
    pub unit_cost: Decimal,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ConfirmOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmOrder {
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReceiveLine (delivered quantity for one product).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveLine {
    pub product_id: ProductId,
    pub quantity: Quantity,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOrder {
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseOrderCommand {
    AddLine(AddLine),
    Confirm(ConfirmOrder),
    ReceiveLine(ReceiveLine),
    Cancel(CancelOrder),
}

/// Event: LineAdded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineAdded {
    pub order_id: PurchaseOrderId,
    pub line_id: PurchaseOrderLineId,
    pub product_id: ProductId,
    pub quantity: Quantity,
    pub unit_cost: Decimal,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderConfirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderConfirmed {
    pub order_id: PurchaseOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LineReceived.
///
/// Carries what the use-case needs to put the delivered quantity into stock
/// and to link the receiving batch back to the order line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineReceived {
    pub order_id: PurchaseOrderId,
    pub line_id: PurchaseOrderLineId,
    pub product_id: ProductId,
    pub quantity: Quantity,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderPartiallyReceived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPartiallyReceived {
    pub order_id: PurchaseOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderReceived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderReceived {
    pub order_id: PurchaseOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancelled {
    pub order_id: PurchaseOrderId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseOrderEvent {
    LineAdded(LineAdded),
    Confirmed(OrderConfirmed),
    LineReceived(LineReceived),
    PartiallyReceived(OrderPartiallyReceived),
    Received(OrderReceived),
    Cancelled(OrderCancelled),
}

impl Event for PurchaseOrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            PurchaseOrderEvent::LineAdded(_) => "purchasing.order.line_added",
            PurchaseOrderEvent::Confirmed(_) => "purchasing.order.confirmed",
            PurchaseOrderEvent::LineReceived(_) => "purchasing.order.line_received",
            PurchaseOrderEvent::PartiallyReceived(_) => "purchasing.order.partially_received",
            PurchaseOrderEvent::Received(_) => "purchasing.order.received",
            PurchaseOrderEvent::Cancelled(_) => "purchasing.order.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            PurchaseOrderEvent::LineAdded(e) => e.occurred_at,
            PurchaseOrderEvent::Confirmed(e) => e.occurred_at,
            PurchaseOrderEvent::LineReceived(e) => e.occurred_at,
            PurchaseOrderEvent::PartiallyReceived(e) => e.occurred_at,
            PurchaseOrderEvent::Received(e) => e.occurred_at,
            PurchaseOrderEvent::Cancelled(e) => e.occurred_at,
        }
    }

    fn stock_effect(&self) -> StockEffect {
        match self {
            PurchaseOrderEvent::LineReceived(_) => StockEffect::Inbound,
            _ => StockEffect::None,
        }
    }
}

impl Aggregate for PurchaseOrder {
    type Command = PurchaseOrderCommand;
    type Event = PurchaseOrderEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            PurchaseOrderEvent::LineAdded(e) => {
                let line = PurchaseOrderLine::new(
                    e.line_id,
                    self.id,
                    e.product_id,
                    e.quantity,
                    e.unit_cost,
                    e.occurred_at,
                );
                self.total += line.line_total;
                self.lines.push(line);
            }
            PurchaseOrderEvent::Confirmed(e) => {
                self.status = PurchaseOrderStatus::Confirmed;
                self.ordered_at = Some(e.occurred_at);
            }
            PurchaseOrderEvent::LineReceived(e) => {
                // Decided by `handle`, which already checked the ordered bound.
                if let Some(line) = self.line_mut(e.line_id) {
                    line.received_quantity = line
                        .received_quantity
                        .add(e.quantity)
                        .unwrap_or(line.ordered_quantity);
                }
            }
            PurchaseOrderEvent::PartiallyReceived(_) => {
                self.status = PurchaseOrderStatus::PartiallyReceived;
            }
            PurchaseOrderEvent::Received(e) => {
                self.status = PurchaseOrderStatus::Received;
                self.received_at = Some(e.occurred_at);
            }
            PurchaseOrderEvent::Cancelled(_) => {
                self.status = PurchaseOrderStatus::Cancelled;
            }
        }

        self.updated_at = event.occurred_at();
        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            PurchaseOrderCommand::AddLine(cmd) => self.handle_add_line(cmd),
            PurchaseOrderCommand::Confirm(cmd) => self.handle_confirm(cmd),
            PurchaseOrderCommand::ReceiveLine(cmd) => self.handle_receive(cmd),
            PurchaseOrderCommand::Cancel(cmd) => self.handle_cancel(cmd),
        }
    }
}

impl PurchaseOrder {
    fn handle_add_line(&self, cmd: &AddLine) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        if self.status != PurchaseOrderStatus::Draft {
            return Err(DomainError::transition(
                "cannot modify purchase order once confirmed",
            ));
        }
        if cmd.quantity.is_zero() {
            return Err(DomainError::invalid_argument(
                "ordered quantity must be positive",
            ));
        }
        if cmd.unit_cost.is_sign_negative() {
            return Err(DomainError::invalid_argument("unit cost cannot be negative"));
        }
        if self.line_for_product(cmd.product_id).is_some() {
            return Err(DomainError::invalid_argument(format!(
                "product {} already has a line on this order",
                cmd.product_id
            )));
        }

        Ok(vec![PurchaseOrderEvent::LineAdded(LineAdded {
            order_id: self.id,
            line_id: cmd.line_id,
            product_id: cmd.product_id,
            quantity: cmd.quantity,
            unit_cost: cmd.unit_cost,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_confirm(&self, cmd: &ConfirmOrder) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        self.status.confirm()?;
        if self.lines.is_empty() {
            return Err(DomainError::invalid_argument(
                "cannot confirm purchase order without lines",
            ));
        }

        Ok(vec![PurchaseOrderEvent::Confirmed(OrderConfirmed {
            order_id: self.id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_receive(&self, cmd: &ReceiveLine) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        if !self.status.can_receive() {
            return Err(DomainError::transition(format!(
                "cannot receive goods on a {} purchase order",
                self.status.as_str()
            )));
        }

        let line = self.line_for_product(cmd.product_id).ok_or_else(|| {
            DomainError::not_found(format!(
                "product {} is not on purchase order {}",
                cmd.product_id, self.id
            ))
        })?;

        // Validate the bound on a scratch copy; the order itself only changes in `apply`.
        let mut trial = line.clone();
        trial.register_reception(cmd.quantity)?;

        let received = PurchaseOrderEvent::LineReceived(LineReceived {
            order_id: self.id,
            line_id: line.id,
            product_id: cmd.product_id,
            quantity: cmd.quantity,
            occurred_at: cmd.occurred_at,
        });

        let mut after = self.clone();
        after.apply(&received);

        let mut events = vec![received];
        match derive_receipt_status(&after.lines) {
            Some(PurchaseOrderStatus::Received) => {
                self.status.mark_received()?;
                events.push(PurchaseOrderEvent::Received(OrderReceived {
                    order_id: self.id,
                    occurred_at: cmd.occurred_at,
                }));
            }
            Some(PurchaseOrderStatus::PartiallyReceived)
                if self.status != PurchaseOrderStatus::PartiallyReceived =>
            {
                self.status.mark_partially_received()?;
                events.push(PurchaseOrderEvent::PartiallyReceived(
                    OrderPartiallyReceived {
                        order_id: self.id,
                        occurred_at: cmd.occurred_at,
                    },
                ));
            }
            _ => {}
        }
        Ok(events)
    }

    fn handle_cancel(&self, cmd: &CancelOrder) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        self.status.cancel()?;
        Ok(vec![PurchaseOrderEvent::Cancelled(OrderCancelled {
            order_id: self.id,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn draft_order() -> PurchaseOrder {
        PurchaseOrder::create(
            NewPurchaseOrder {
                order_id: PurchaseOrderId::generate(),
                shop_id: ShopId::new(),
                supplier_id: SupplierId::generate(),
                currency: CurrencyCode::parse("USD").unwrap(),
                expected_at: None,
                created_by: UserId::new(),
            },
            test_time(),
        )
    }

    fn add_line(order: &mut PurchaseOrder, product_id: ProductId, quantity: u64) {
        order
            .execute(&PurchaseOrderCommand::AddLine(AddLine {
                line_id: PurchaseOrderLineId::generate(),
                product_id,
                quantity: Quantity::new(quantity),
                unit_cost: dec!(2.00),
                occurred_at: test_time(),
            }))
            .unwrap();
    }

    fn confirm(order: &mut PurchaseOrder) {
        order
            .execute(&PurchaseOrderCommand::Confirm(ConfirmOrder {
                occurred_at: test_time(),
            }))
            .unwrap();
    }

    fn receive(
        order: &mut PurchaseOrder,
        product_id: ProductId,
        quantity: u64,
    ) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        order.execute(&PurchaseOrderCommand::ReceiveLine(ReceiveLine {
            product_id,
            quantity: Quantity::new(quantity),
            occurred_at: test_time(),
        }))
    }

    #[test]
    fn add_line_computes_totals() {
        let mut order = draft_order();
        add_line(&mut order, ProductId::generate(), 100);
        add_line(&mut order, ProductId::generate(), 5);
        assert_eq!(order.lines()[0].line_total(), dec!(200.00));
        assert_eq!(order.total(), dec!(210.00));
        assert_eq!(order.version(), 2);
    }

    #[test]
    fn add_line_rejects_duplicates_and_negative_cost() {
        let mut order = draft_order();
        let product = ProductId::generate();
        add_line(&mut order, product, 10);

        let dup = order.handle(&PurchaseOrderCommand::AddLine(AddLine {
            line_id: PurchaseOrderLineId::generate(),
            product_id: product,
            quantity: Quantity::new(1),
            unit_cost: dec!(1),
            occurred_at: test_time(),
        }));
        assert!(matches!(dup, Err(DomainError::InvalidArgument(_))));

        let negative = order.handle(&PurchaseOrderCommand::AddLine(AddLine {
            line_id: PurchaseOrderLineId::generate(),
            product_id: ProductId::generate(),
            quantity: Quantity::new(1),
            unit_cost: dec!(-1),
            occurred_at: test_time(),
        }));
        assert!(matches!(negative, Err(DomainError::InvalidArgument(_))));
    }

    #[test]
    fn confirm_only_from_draft_and_sets_ordered_at() {
        let mut order = draft_order();
        let empty = order.handle(&PurchaseOrderCommand::Confirm(ConfirmOrder {
            occurred_at: test_time(),
        }));
        assert!(matches!(empty, Err(DomainError::InvalidArgument(_))));

        add_line(&mut order, ProductId::generate(), 10);
        confirm(&mut order);
        assert_eq!(order.status(), PurchaseOrderStatus::Confirmed);
        assert!(order.ordered_at().is_some());

        let again = order.handle(&PurchaseOrderCommand::Confirm(ConfirmOrder {
            occurred_at: test_time(),
        }));
        assert!(matches!(again, Err(DomainError::InvalidStateTransition(_))));
    }

    #[test]
    fn cannot_receive_before_confirmation() {
        let mut order = draft_order();
        let product = ProductId::generate();
        add_line(&mut order, product, 10);
        let err = receive(&mut order, product, 1).unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition(_)));
    }

    #[test]
    fn partial_then_full_reception() {
        let mut order = draft_order();
        let product = ProductId::generate();
        add_line(&mut order, product, 100);
        confirm(&mut order);

        let events = receive(&mut order, product, 60).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].stock_effect(), StockEffect::Inbound);
        assert_eq!(order.status(), PurchaseOrderStatus::PartiallyReceived);
        assert!(order.received_at().is_none());

        let events = receive(&mut order, product, 40).unwrap();
        assert!(matches!(events[1], PurchaseOrderEvent::Received(_)));
        assert_eq!(order.status(), PurchaseOrderStatus::Received);
        assert!(order.received_at().is_some());
        assert_eq!(order.lines()[0].received_quantity().value(), 100);

        assert!(matches!(
            receive(&mut order, product, 1),
            Err(DomainError::InvalidStateTransition(_))
        ));
    }

    #[test]
    fn over_reception_is_rejected_without_change() {
        let mut order = draft_order();
        let product = ProductId::generate();
        add_line(&mut order, product, 10);
        confirm(&mut order);
        receive(&mut order, product, 4).unwrap();
        let before = order.clone();

        let err = receive(&mut order, product, 7).unwrap_err();
        assert_eq!(
            err,
            DomainError::ExceedsOrderedQuantity {
                ordered: 10,
                received: 4,
                requested: 7
            }
        );
        assert_eq!(order, before);
    }

    #[test]
    fn unknown_product_is_not_found() {
        let mut order = draft_order();
        add_line(&mut order, ProductId::generate(), 10);
        confirm(&mut order);
        assert!(matches!(
            receive(&mut order, ProductId::generate(), 1),
            Err(DomainError::NotFound(_))
        ));
    }

    #[test]
    fn cancellation_guard() {
        let mut order = draft_order();
        let product = ProductId::generate();
        add_line(&mut order, product, 10);
        confirm(&mut order);
        receive(&mut order, product, 1).unwrap();

        let cancel = PurchaseOrderCommand::Cancel(CancelOrder {
            occurred_at: test_time(),
        });
        assert!(matches!(
            order.handle(&cancel),
            Err(DomainError::InvalidStateTransition(_))
        ));

        let mut fresh = draft_order();
        fresh.execute(&cancel).unwrap();
        assert_eq!(fresh.status(), PurchaseOrderStatus::Cancelled);
        assert!(fresh.handle(&cancel).is_err());
    }

    #[test]
    fn status_transitions_from_terminal_states_fail() {
        for status in [PurchaseOrderStatus::Draft, PurchaseOrderStatus::Cancelled] {
            assert!(status.mark_received().is_err());
            assert!(status.mark_partially_received().is_err());
        }
        assert!(PurchaseOrderStatus::Received.cancel().is_err());
        assert!(PurchaseOrderStatus::PartiallyReceived.cancel().is_err());
        assert_eq!(
            PurchaseOrderStatus::Confirmed.cancel().unwrap(),
            PurchaseOrderStatus::Cancelled
        );
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: received never exceeds ordered, and rejected receptions change nothing.
            #[test]
            fn reception_bound_holds(
                ordered in 1u64..200,
                attempts in proptest::collection::vec(1u64..120, 1..20)
            ) {
                let mut order = draft_order();
                let product = ProductId::generate();
                add_line(&mut order, product, ordered);
                confirm(&mut order);

                for qty in attempts {
                    let before = order.clone();
                    match receive(&mut order, product, qty) {
                        Ok(_) => {}
                        Err(_) => prop_assert_eq!(&order, &before),
                    }
                    let line = &order.lines()[0];
                    prop_assert!(line.received_quantity() <= line.ordered_quantity());
                }
            }

            /// Property: status is Received iff all lines complete, PartiallyReceived iff some
            /// but not all.
            #[test]
            fn status_derivation(pairs in proptest::collection::vec((1u64..50, 0u64..50), 1..6)) {
                let mut order = draft_order();
                let products: Vec<ProductId> = pairs.iter().map(|_| ProductId::generate()).collect();
                for (product, (ordered, _)) in products.iter().zip(&pairs) {
                    add_line(&mut order, *product, *ordered);
                }
                confirm(&mut order);
                for (product, (ordered, received)) in products.iter().zip(&pairs) {
                    let received = (*received).min(*ordered);
                    if received > 0 {
                        receive(&mut order, *product, received).unwrap();
                    }
                }

                let all = pairs.iter().all(|(o, r)| (*r).min(*o) == *o);
                let any = pairs.iter().any(|(o, r)| (*r).min(*o) > 0);
                let expected = if all {
                    PurchaseOrderStatus::Received
                } else if any {
                    PurchaseOrderStatus::PartiallyReceived
                } else {
                    PurchaseOrderStatus::Confirmed
                };
                prop_assert_eq!(order.status(), expected);
            }
        }
    }
}
