//! Direct stock operations: catalogue seeding, stock in, stock out.

use tracing::{info, instrument};

use stockledger_core::{Quantity, UserId};
use stockledger_stock::{Lot, MovementContext, NewProduct, Product, ProductKey, Removal, StockMovement};

use super::{ServiceResult, StockService, finish, lock_position, persist};
use crate::store::{StockStore, StockTransaction};

impl<S> StockService<S>
where
    S: StockStore,
{
    /// Register a product's stock row in a shop. Stock starts at zero.
    #[instrument(skip_all, fields(key = %ProductKey::new(new.shop_id, new.product_id)), err)]
    pub async fn register_product(&self, new: NewProduct) -> ServiceResult<Product> {
        let product = Product::create(new, self.clock.now())?;

        let mut tx = self.store.begin().await?;
        let outcome = tx.insert_product(&product).await.map_err(Into::into);
        finish(tx, "register_product", outcome).await?;

        info!(key = %product.key(), code = product.code(), "product registered");
        Ok(product)
    }

    /// Stock entering outside a purchase order (opening balance, customer return).
    #[instrument(skip_all, fields(key = %key, quantity = %quantity, reference), err)]
    pub async fn add_stock(
        &self,
        key: ProductKey,
        quantity: Quantity,
        lot: Option<Lot>,
        reference: &str,
        actor: UserId,
    ) -> ServiceResult<StockMovement> {
        tracing::Span::current().record("reference", reference);
        let ctx = MovementContext::new(reference, actor, self.clock.now());

        let mut tx = self.store.begin().await?;
        let outcome = add_stock_in(&mut *tx, key, quantity, lot, &ctx).await;
        let movement = finish(tx, "add_stock", outcome).await?;

        info!(key = %key, quantity = %quantity, "stock added");
        Ok(movement)
    }

    /// Stock leaving outside the documented workflows (sale, write-off).
    /// Batches are drawn earliest expiry first.
    #[instrument(skip_all, fields(key = %key, quantity = %quantity, reference), err)]
    pub async fn remove_stock(
        &self,
        key: ProductKey,
        quantity: Quantity,
        reference: &str,
        actor: UserId,
    ) -> ServiceResult<Removal> {
        tracing::Span::current().record("reference", reference);
        let ctx = MovementContext::new(reference, actor, self.clock.now());

        let mut tx = self.store.begin().await?;
        let outcome = remove_stock_in(&mut *tx, key, quantity, &ctx).await;
        let removal = finish(tx, "remove_stock", outcome).await?;

        info!(key = %key, quantity = %quantity, lots = removal.consumed.len(), "stock removed");
        Ok(removal)
    }
}

async fn add_stock_in(
    tx: &mut dyn StockTransaction,
    key: ProductKey,
    quantity: Quantity,
    lot: Option<Lot>,
    ctx: &MovementContext,
) -> ServiceResult<StockMovement> {
    let mut position = lock_position(tx, key).await?;
    let movement = position.receive(ctx, quantity, lot)?;
    persist(tx, [&position], std::slice::from_ref(&movement)).await?;
    Ok(movement)
}

async fn remove_stock_in(
    tx: &mut dyn StockTransaction,
    key: ProductKey,
    quantity: Quantity,
    ctx: &MovementContext,
) -> ServiceResult<Removal> {
    let mut position = lock_position(tx, key).await?;
    let removal = position.remove(ctx, quantity)?;
    persist(tx, [&position], std::slice::from_ref(&removal.movement)).await?;
    Ok(removal)
}
