//! Transfers between two shops of one pharmacy.

use chrono::NaiveDate;
use tracing::{info, instrument};

use stockledger_core::{
    Aggregate, AggregateRoot, DomainError, ExpectedVersion, PharmacyId, Quantity, ShopId,
    TRANSFER_PREFIX, UserId,
};
use stockledger_events::{Event, StockEffect};
use stockledger_stock::{MovementContext, ProductId, ProductKey, StockMovement};
use stockledger_transfers::{
    AddTransferItem, CancelTransfer, NewStockTransfer, RemoveTransferItem, StockTransfer,
    StockTransferCommand, StockTransferEvent, StockTransferId, StockTransferItemId,
    ValidateTransfer,
};

use super::{ServiceResult, StockService, finish, lock_positions, persist, position_mut};
use crate::store::{StockStore, StockTransaction};

/// Result of validating a transfer: OUT movements at the source shop and IN
/// movements at the destination, in item order.
#[derive(Debug, Clone)]
pub struct Relocation {
    pub transfer: StockTransfer,
    pub movements: Vec<StockMovement>,
}

impl<S> StockService<S>
where
    S: StockStore,
{
    #[instrument(skip_all, fields(pharmacy_id = %pharmacy_id, from = %from_shop_id, to = %to_shop_id), err)]
    pub async fn create_stock_transfer(
        &self,
        pharmacy_id: PharmacyId,
        from_shop_id: ShopId,
        to_shop_id: ShopId,
        actor: UserId,
        notes: Option<String>,
    ) -> ServiceResult<StockTransfer> {
        let reference = self
            .references
            .next_reference(TRANSFER_PREFIX, self.clock.today());
        let transfer = StockTransfer::create(
            NewStockTransfer {
                transfer_id: StockTransferId::generate(),
                pharmacy_id,
                reference,
                from_shop_id,
                to_shop_id,
                created_by: actor,
                notes,
            },
            self.clock.now(),
        )?;

        let mut tx = self.store.begin().await?;
        let outcome = tx.insert_transfer(&transfer).await.map_err(Into::into);
        finish(tx, "create_stock_transfer", outcome).await?;

        info!(transfer_id = %transfer.id_typed(), reference = transfer.reference(), "stock transfer created");
        Ok(transfer)
    }

    /// Add a product of the source shop; a product already listed has its
    /// quantity raised.
    #[instrument(skip_all, fields(pharmacy_id = %pharmacy_id, transfer_id = %transfer_id, product_id = %product_id), err)]
    pub async fn add_stock_transfer_item(
        &self,
        pharmacy_id: PharmacyId,
        transfer_id: StockTransferId,
        product_id: ProductId,
        quantity: Quantity,
    ) -> ServiceResult<StockTransfer> {
        let command = StockTransferCommand::AddItem(AddTransferItem {
            item_id: StockTransferItemId::generate(),
            product_id,
            quantity,
            occurred_at: self.clock.now(),
        });

        let mut tx = self.store.begin().await?;
        let outcome = add_item_in(&mut *tx, pharmacy_id, transfer_id, &command).await;
        let transfer = finish(tx, "add_stock_transfer_item", outcome).await?;

        info!(transfer_id = %transfer_id, items = transfer.items().len(), "stock transfer item added");
        Ok(transfer)
    }

    #[instrument(skip_all, fields(pharmacy_id = %pharmacy_id, transfer_id = %transfer_id, product_id = %product_id), err)]
    pub async fn remove_stock_transfer_item(
        &self,
        pharmacy_id: PharmacyId,
        transfer_id: StockTransferId,
        product_id: ProductId,
    ) -> ServiceResult<StockTransfer> {
        let command = StockTransferCommand::RemoveItem(RemoveTransferItem {
            product_id,
            occurred_at: self.clock.now(),
        });

        let mut tx = self.store.begin().await?;
        let outcome = execute_transfer_command(&mut *tx, pharmacy_id, transfer_id, &command).await;
        let transfer = finish(tx, "remove_stock_transfer_item", outcome).await?;

        info!(transfer_id = %transfer_id, items = transfer.items().len(), "stock transfer item removed");
        Ok(transfer)
    }

    /// Move every item from the source shop to the destination shop. Lots
    /// leave the source earliest expiry first and are recreated at the
    /// destination. Nothing is written unless every item moves.
    #[instrument(skip_all, fields(pharmacy_id = %pharmacy_id, transfer_id = %transfer_id), err)]
    pub async fn validate_stock_transfer(
        &self,
        pharmacy_id: PharmacyId,
        transfer_id: StockTransferId,
        actor: UserId,
    ) -> ServiceResult<Relocation> {
        let fallback = self.fallback_expiration(self.clock.today())?;
        let validate = ValidateTransfer {
            validated_by: actor,
            occurred_at: self.clock.now(),
        };

        let mut tx = self.store.begin().await?;
        let outcome = validate_in(&mut *tx, pharmacy_id, transfer_id, validate, fallback).await;
        let relocation = finish(tx, "validate_stock_transfer", outcome).await?;

        info!(
            transfer_id = %transfer_id,
            movements = relocation.movements.len(),
            "stock transfer validated"
        );
        Ok(relocation)
    }

    #[instrument(skip_all, fields(pharmacy_id = %pharmacy_id, transfer_id = %transfer_id), err)]
    pub async fn cancel_stock_transfer(
        &self,
        pharmacy_id: PharmacyId,
        transfer_id: StockTransferId,
    ) -> ServiceResult<StockTransfer> {
        let command = StockTransferCommand::Cancel(CancelTransfer {
            occurred_at: self.clock.now(),
        });

        let mut tx = self.store.begin().await?;
        let outcome = execute_transfer_command(&mut *tx, pharmacy_id, transfer_id, &command).await;
        let transfer = finish(tx, "cancel_stock_transfer", outcome).await?;

        info!(transfer_id = %transfer_id, "stock transfer cancelled");
        Ok(transfer)
    }
}

async fn lock_transfer(
    tx: &mut dyn StockTransaction,
    pharmacy_id: PharmacyId,
    transfer_id: StockTransferId,
) -> ServiceResult<StockTransfer> {
    tx.lock_transfer(pharmacy_id, transfer_id)
        .await?
        .ok_or_else(|| DomainError::not_found(format!("stock transfer {transfer_id}")).into())
}

async fn execute_transfer_command(
    tx: &mut dyn StockTransaction,
    pharmacy_id: PharmacyId,
    transfer_id: StockTransferId,
    command: &StockTransferCommand,
) -> ServiceResult<StockTransfer> {
    let mut transfer = lock_transfer(tx, pharmacy_id, transfer_id).await?;
    let loaded = transfer.version();
    transfer.execute(command)?;
    tx.update_transfer(&transfer, ExpectedVersion::Exact(loaded))
        .await?;
    Ok(transfer)
}

async fn add_item_in(
    tx: &mut dyn StockTransaction,
    pharmacy_id: PharmacyId,
    transfer_id: StockTransferId,
    command: &StockTransferCommand,
) -> ServiceResult<StockTransfer> {
    let mut transfer = lock_transfer(tx, pharmacy_id, transfer_id).await?;
    if let StockTransferCommand::AddItem(add) = command {
        let key = ProductKey::new(transfer.from_shop_id(), add.product_id);
        if tx.lock_product(key).await?.is_none() {
            return Err(DomainError::not_found(format!("product {key}")).into());
        }
    }
    let loaded = transfer.version();
    transfer.execute(command)?;
    tx.update_transfer(&transfer, ExpectedVersion::Exact(loaded))
        .await?;
    Ok(transfer)
}

async fn validate_in(
    tx: &mut dyn StockTransaction,
    pharmacy_id: PharmacyId,
    transfer_id: StockTransferId,
    validate: ValidateTransfer,
    fallback: NaiveDate,
) -> ServiceResult<Relocation> {
    let mut transfer = lock_transfer(tx, pharmacy_id, transfer_id).await?;
    let loaded = transfer.version();
    let ctx = MovementContext::new(
        transfer.reference(),
        validate.validated_by,
        validate.occurred_at,
    );
    let events = transfer.execute(&StockTransferCommand::Validate(validate))?;

    let relocations: Vec<_> = events
        .iter()
        .filter(|e| e.stock_effect() == StockEffect::Relocation)
        .filter_map(|e| match e {
            StockTransferEvent::Validated(validated) => Some(validated),
            _ => None,
        })
        .collect();

    let keys = relocations.iter().flat_map(|v| {
        v.lines.iter().flat_map(move |line| {
            [
                ProductKey::new(v.from_shop_id, line.product_id),
                ProductKey::new(v.to_shop_id, line.product_id),
            ]
        })
    });
    let mut positions = lock_positions(tx, keys).await?;

    let mut movements = Vec::new();
    for validated in &relocations {
        for line in &validated.lines {
            let source = ProductKey::new(validated.from_shop_id, line.product_id);
            let removal = position_mut(&mut positions, source)?.remove(&ctx, line.quantity)?;

            let destination = ProductKey::new(validated.to_shop_id, line.product_id);
            let inbound = position_mut(&mut positions, destination)?.receive_transfer(
                &ctx,
                line.quantity,
                &removal.consumed,
                fallback,
            )?;
            movements.push(removal.movement);
            movements.push(inbound);
        }
    }

    persist(tx, positions.values(), &movements).await?;
    tx.update_transfer(&transfer, ExpectedVersion::Exact(loaded))
        .await?;
    Ok(Relocation {
        transfer,
        movements,
    })
}
