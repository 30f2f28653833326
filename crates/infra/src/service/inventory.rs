//! Physical count sessions and the reconciliation they drive.

use chrono::NaiveDate;
use tracing::{info, instrument};

use stockledger_core::{
    Aggregate, AggregateRoot, DomainError, ExpectedVersion, INVENTORY_PREFIX, ShopId, UserId,
};
use stockledger_events::{Event, StockEffect};
use stockledger_inventory::{
    CancelInventory, CountEntry, Inventory, InventoryCommand, InventoryEvent, InventoryId,
    InventoryItemId, NewInventory, RecordCounts, StartInventory, StockSnapshot, ValidateInventory,
};
use stockledger_stock::{MovementContext, ProductKey, StockMovement};

use super::{ServiceResult, StockService, finish, lock_positions, persist, position_mut};
use crate::store::{StockStore, StockTransaction};

/// Result of validating a count session.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub inventory: Inventory,
    pub movements: Vec<StockMovement>,
}

impl<S> StockService<S>
where
    S: StockStore,
{
    /// Open a draft session with a fresh `INV-YYYYMMDD-XXXXXX` reference.
    #[instrument(skip_all, fields(shop_id = %shop_id), err)]
    pub async fn create_inventory(
        &self,
        shop_id: ShopId,
        actor: UserId,
    ) -> ServiceResult<Inventory> {
        let now = self.clock.now();
        let reference = self
            .references
            .next_reference(INVENTORY_PREFIX, self.clock.today());
        let inventory = Inventory::create(
            NewInventory {
                inventory_id: InventoryId::generate(),
                shop_id,
                reference,
                created_by: actor,
            },
            now,
        )?;

        let mut tx = self.store.begin().await?;
        let outcome = tx.insert_inventory(&inventory).await.map_err(Into::into);
        finish(tx, "create_inventory", outcome).await?;

        info!(inventory_id = %inventory.id_typed(), reference = inventory.reference(), "inventory created");
        Ok(inventory)
    }

    /// Snapshot every active product's stock and start counting.
    #[instrument(skip_all, fields(shop_id = %shop_id, inventory_id = %inventory_id), err)]
    pub async fn start_inventory(
        &self,
        shop_id: ShopId,
        inventory_id: InventoryId,
    ) -> ServiceResult<Inventory> {
        let now = self.clock.now();

        let mut tx = self.store.begin().await?;
        let outcome = start_in(&mut *tx, shop_id, inventory_id, now).await;
        let inventory = finish(tx, "start_inventory", outcome).await?;

        info!(inventory_id = %inventory_id, items = inventory.items().len(), "inventory started");
        Ok(inventory)
    }

    /// Record (or overwrite) counted quantities. Products outside the
    /// snapshot are rejected.
    #[instrument(skip_all, fields(shop_id = %shop_id, inventory_id = %inventory_id, counts = counts.len()), err)]
    pub async fn save_inventory_counts(
        &self,
        shop_id: ShopId,
        inventory_id: InventoryId,
        counts: Vec<CountEntry>,
    ) -> ServiceResult<Inventory> {
        let command = InventoryCommand::RecordCounts(RecordCounts {
            counts,
            occurred_at: self.clock.now(),
        });

        let mut tx = self.store.begin().await?;
        let outcome = execute_inventory_command(&mut *tx, shop_id, inventory_id, &command).await;
        let inventory = finish(tx, "save_inventory_counts", outcome).await?;

        info!(inventory_id = %inventory_id, "inventory counts saved");
        Ok(inventory)
    }

    /// Close the session and bring stock in line with the counts: one
    /// ADJUSTMENT movement per counted item whose count differs from its
    /// snapshot, all in one transaction.
    #[instrument(skip_all, fields(shop_id = %shop_id, inventory_id = %inventory_id), err)]
    pub async fn validate_inventory(
        &self,
        shop_id: ShopId,
        inventory_id: InventoryId,
        actor: UserId,
    ) -> ServiceResult<Reconciliation> {
        let now = self.clock.now();
        let fallback = self.fallback_expiration(self.clock.today())?;
        let validate = ValidateInventory {
            validated_by: actor,
            occurred_at: now,
        };

        let mut tx = self.store.begin().await?;
        let outcome = validate_in(&mut *tx, shop_id, inventory_id, validate, fallback).await;
        let reconciliation = finish(tx, "validate_inventory", outcome).await?;

        info!(
            inventory_id = %inventory_id,
            adjustments = reconciliation.movements.len(),
            positive = reconciliation.inventory.total_positive_difference(),
            negative = reconciliation.inventory.total_negative_difference(),
            "inventory validated"
        );
        Ok(reconciliation)
    }

    #[instrument(skip_all, fields(shop_id = %shop_id, inventory_id = %inventory_id), err)]
    pub async fn cancel_inventory(
        &self,
        shop_id: ShopId,
        inventory_id: InventoryId,
    ) -> ServiceResult<Inventory> {
        let command = InventoryCommand::Cancel(CancelInventory {
            occurred_at: self.clock.now(),
        });

        let mut tx = self.store.begin().await?;
        let outcome = execute_inventory_command(&mut *tx, shop_id, inventory_id, &command).await;
        let inventory = finish(tx, "cancel_inventory", outcome).await?;

        info!(inventory_id = %inventory_id, "inventory cancelled");
        Ok(inventory)
    }
}

async fn lock_inventory(
    tx: &mut dyn StockTransaction,
    shop_id: ShopId,
    inventory_id: InventoryId,
) -> ServiceResult<Inventory> {
    tx.lock_inventory(shop_id, inventory_id)
        .await?
        .ok_or_else(|| DomainError::not_found(format!("inventory {inventory_id}")).into())
}

async fn execute_inventory_command(
    tx: &mut dyn StockTransaction,
    shop_id: ShopId,
    inventory_id: InventoryId,
    command: &InventoryCommand,
) -> ServiceResult<Inventory> {
    let mut inventory = lock_inventory(tx, shop_id, inventory_id).await?;
    let loaded = inventory.version();
    inventory.execute(command)?;
    tx.update_inventory(&inventory, ExpectedVersion::Exact(loaded))
        .await?;
    Ok(inventory)
}

async fn start_in(
    tx: &mut dyn StockTransaction,
    shop_id: ShopId,
    inventory_id: InventoryId,
    now: chrono::DateTime<chrono::Utc>,
) -> ServiceResult<Inventory> {
    let mut inventory = lock_inventory(tx, shop_id, inventory_id).await?;
    let products = tx.lock_active_products(shop_id).await?;
    let snapshot = products
        .iter()
        .map(|p| StockSnapshot {
            item_id: InventoryItemId::generate(),
            product_id: p.id_typed(),
            system_quantity: p.stock(),
        })
        .collect();

    let loaded = inventory.version();
    inventory.execute(&InventoryCommand::Start(StartInventory {
        snapshot,
        occurred_at: now,
    }))?;
    tx.update_inventory(&inventory, ExpectedVersion::Exact(loaded))
        .await?;
    Ok(inventory)
}

async fn validate_in(
    tx: &mut dyn StockTransaction,
    shop_id: ShopId,
    inventory_id: InventoryId,
    validate: ValidateInventory,
    fallback: NaiveDate,
) -> ServiceResult<Reconciliation> {
    let mut inventory = lock_inventory(tx, shop_id, inventory_id).await?;
    let loaded = inventory.version();
    let ctx = MovementContext::new(
        inventory.reference(),
        validate.validated_by,
        validate.occurred_at,
    );
    let events = inventory.execute(&InventoryCommand::Validate(validate))?;

    let adjustments: Vec<_> = events
        .iter()
        .filter(|e| e.stock_effect() == StockEffect::Reconciliation)
        .filter_map(|e| match e {
            InventoryEvent::Validated(validated) => Some(validated.adjustments.clone()),
            _ => None,
        })
        .flatten()
        .collect();

    let mut positions = lock_positions(
        tx,
        adjustments
            .iter()
            .map(|a| ProductKey::new(shop_id, a.product_id)),
    )
    .await?;

    let mut movements = Vec::with_capacity(adjustments.len());
    for adjustment in &adjustments {
        let key = ProductKey::new(shop_id, adjustment.product_id);
        let position = position_mut(&mut positions, key)?;
        if let Some(movement) = position.adjust(&ctx, adjustment.difference, fallback)? {
            movements.push(movement);
        }
    }

    persist(tx, positions.values(), &movements).await?;
    tx.update_inventory(&inventory, ExpectedVersion::Exact(loaded))
        .await?;
    Ok(Reconciliation {
        inventory,
        movements,
    })
}
