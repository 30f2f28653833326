//! Purchase order use-cases. Reception is the only one that touches stock.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{info, instrument};

use stockledger_core::{
    Aggregate, AggregateRoot, CurrencyCode, DomainError, ExpectedVersion, Quantity, ShopId, UserId,
};
use stockledger_events::{Event, StockEffect};
use stockledger_purchasing::{
    AddLine, CancelOrder, ConfirmOrder, NewPurchaseOrder, PurchaseOrder, PurchaseOrderCommand,
    PurchaseOrderEvent, PurchaseOrderId, PurchaseOrderLineId, ReceiveLine, SupplierId,
};
use stockledger_stock::{Lot, MovementContext, ProductId, ProductKey, StockMovement};

use super::{ServiceResult, StockService, finish, lock_position, persist};
use crate::store::{StockStore, StockTransaction};

/// Result of receiving a purchase order line.
#[derive(Debug, Clone)]
pub struct Reception {
    pub order: PurchaseOrder,
    pub movements: Vec<StockMovement>,
}

impl<S> StockService<S>
where
    S: StockStore,
{
    #[instrument(skip_all, fields(shop_id = %shop_id, supplier_id = %supplier_id), err)]
    pub async fn create_purchase_order(
        &self,
        shop_id: ShopId,
        supplier_id: SupplierId,
        currency: CurrencyCode,
        expected_at: Option<DateTime<Utc>>,
        actor: UserId,
    ) -> ServiceResult<PurchaseOrder> {
        let order = PurchaseOrder::create(
            NewPurchaseOrder {
                order_id: PurchaseOrderId::generate(),
                shop_id,
                supplier_id,
                currency,
                expected_at,
                created_by: actor,
            },
            self.clock.now(),
        );

        let mut tx = self.store.begin().await?;
        let outcome = tx.insert_purchase_order(&order).await.map_err(Into::into);
        finish(tx, "create_purchase_order", outcome).await?;

        info!(order_id = %order.id_typed(), "purchase order created");
        Ok(order)
    }

    /// Add a line for a product the shop stocks. Draft orders only.
    #[instrument(skip_all, fields(shop_id = %shop_id, order_id = %order_id, product_id = %product_id), err)]
    pub async fn add_purchase_order_line(
        &self,
        shop_id: ShopId,
        order_id: PurchaseOrderId,
        product_id: ProductId,
        quantity: Quantity,
        unit_cost: Decimal,
    ) -> ServiceResult<PurchaseOrder> {
        let command = PurchaseOrderCommand::AddLine(AddLine {
            line_id: PurchaseOrderLineId::generate(),
            product_id,
            quantity,
            unit_cost,
            occurred_at: self.clock.now(),
        });

        let key = ProductKey::new(shop_id, product_id);
        let mut tx = self.store.begin().await?;
        let outcome = add_line_in(&mut *tx, key, order_id, &command).await;
        let order = finish(tx, "add_purchase_order_line", outcome).await?;

        info!(order_id = %order_id, total = %order.total(), "purchase order line added");
        Ok(order)
    }

    #[instrument(skip_all, fields(shop_id = %shop_id, order_id = %order_id), err)]
    pub async fn confirm_purchase_order(
        &self,
        shop_id: ShopId,
        order_id: PurchaseOrderId,
    ) -> ServiceResult<PurchaseOrder> {
        let command = PurchaseOrderCommand::Confirm(ConfirmOrder {
            occurred_at: self.clock.now(),
        });

        let mut tx = self.store.begin().await?;
        let outcome = execute_order_command(&mut *tx, shop_id, order_id, &command).await;
        let order = finish(tx, "confirm_purchase_order", outcome).await?;

        info!(order_id = %order_id, "purchase order confirmed");
        Ok(order)
    }

    /// Receive `quantity` of a line: the line and order status move forward,
    /// the product's stock rises, and an IN movement referencing the order is
    /// appended. Batch-tracked products need the delivered lot.
    #[instrument(
        skip_all,
        fields(shop_id = %shop_id, order_id = %order_id, product_id = %product_id, quantity = %quantity),
        err
    )]
    pub async fn receive_purchase_order_line(
        &self,
        shop_id: ShopId,
        order_id: PurchaseOrderId,
        product_id: ProductId,
        quantity: Quantity,
        lot: Option<Lot>,
        actor: UserId,
    ) -> ServiceResult<Reception> {
        let now = self.clock.now();
        let command = PurchaseOrderCommand::ReceiveLine(ReceiveLine {
            product_id,
            quantity,
            occurred_at: now,
        });
        let ctx = MovementContext::new(order_id.to_string(), actor, now);

        let mut tx = self.store.begin().await?;
        let outcome = receive_in(&mut *tx, shop_id, order_id, &command, lot, &ctx).await;
        let reception = finish(tx, "receive_purchase_order_line", outcome).await?;

        info!(
            order_id = %order_id,
            status = reception.order.status().as_str(),
            movements = reception.movements.len(),
            "purchase order line received"
        );
        Ok(reception)
    }

    #[instrument(skip_all, fields(shop_id = %shop_id, order_id = %order_id), err)]
    pub async fn cancel_purchase_order(
        &self,
        shop_id: ShopId,
        order_id: PurchaseOrderId,
    ) -> ServiceResult<PurchaseOrder> {
        let command = PurchaseOrderCommand::Cancel(CancelOrder {
            occurred_at: self.clock.now(),
        });

        let mut tx = self.store.begin().await?;
        let outcome = execute_order_command(&mut *tx, shop_id, order_id, &command).await;
        let order = finish(tx, "cancel_purchase_order", outcome).await?;

        info!(order_id = %order_id, "purchase order cancelled");
        Ok(order)
    }
}

async fn lock_order(
    tx: &mut dyn StockTransaction,
    shop_id: ShopId,
    order_id: PurchaseOrderId,
) -> ServiceResult<PurchaseOrder> {
    tx.lock_purchase_order(shop_id, order_id)
        .await?
        .ok_or_else(|| DomainError::not_found(format!("purchase order {order_id}")).into())
}

/// Commands without stock effects: decide, apply, save.
async fn execute_order_command(
    tx: &mut dyn StockTransaction,
    shop_id: ShopId,
    order_id: PurchaseOrderId,
    command: &PurchaseOrderCommand,
) -> ServiceResult<PurchaseOrder> {
    let mut order = lock_order(tx, shop_id, order_id).await?;
    let loaded = order.version();
    order.execute(command)?;
    tx.update_purchase_order(&order, ExpectedVersion::Exact(loaded))
        .await?;
    Ok(order)
}

async fn add_line_in(
    tx: &mut dyn StockTransaction,
    key: ProductKey,
    order_id: PurchaseOrderId,
    command: &PurchaseOrderCommand,
) -> ServiceResult<PurchaseOrder> {
    let mut order = lock_order(tx, key.shop_id, order_id).await?;
    if tx.lock_product(key).await?.is_none() {
        return Err(DomainError::not_found(format!("product {key}")).into());
    }
    let loaded = order.version();
    order.execute(command)?;
    tx.update_purchase_order(&order, ExpectedVersion::Exact(loaded))
        .await?;
    Ok(order)
}

async fn receive_in(
    tx: &mut dyn StockTransaction,
    shop_id: ShopId,
    order_id: PurchaseOrderId,
    command: &PurchaseOrderCommand,
    lot: Option<Lot>,
    ctx: &MovementContext,
) -> ServiceResult<Reception> {
    let mut order = lock_order(tx, shop_id, order_id).await?;
    let loaded = order.version();
    let events = order.execute(command)?;

    let mut lot = lot;
    let mut positions = Vec::new();
    let mut movements = Vec::new();
    for event in events.iter().filter(|e| e.stock_effect() == StockEffect::Inbound) {
        let PurchaseOrderEvent::LineReceived(received) = event else {
            continue;
        };
        let key = ProductKey::new(shop_id, received.product_id);
        let mut position = lock_position(tx, key).await?;
        let lot = lot
            .take()
            .map(|l| l.with_purchase_origin(received.order_id.0, received.line_id.0));
        movements.push(position.receive(ctx, received.quantity, lot)?);
        positions.push(position);
    }

    persist(tx, positions.iter(), &movements).await?;
    tx.update_purchase_order(&order, ExpectedVersion::Exact(loaded))
        .await?;
    Ok(Reception { order, movements })
}
