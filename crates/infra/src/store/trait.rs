use std::sync::Arc;

use thiserror::Error;

use stockledger_core::{ExpectedVersion, PharmacyId, ShopId};
use stockledger_inventory::{Inventory, InventoryId};
use stockledger_purchasing::{PurchaseOrder, PurchaseOrderId};
use stockledger_stock::{Product, ProductBatch, ProductKey, StockMovement};
use stockledger_transfers::{StockTransfer, StockTransferId};

use super::query::StockQuery;

/// Store operation error.
///
/// These are **infrastructure errors** (storage, concurrency, encoding) as
/// opposed to domain errors (state transitions, quantity guards).
#[derive(Debug, Error)]
pub enum StoreError {
    /// Optimistic version check failed or a row changed underneath the transaction.
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    /// Insert of a record that already exists.
    #[error("duplicate record: {0}")]
    Duplicate(String),

    /// A stored document or column could not be encoded/decoded.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The backend rejected the operation (connection, SQL, constraint).
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// One unit of work against the stock store.
///
/// `lock_*` methods read a record and hold it (row lock on Postgres, the store
/// mutex in memory) until commit or rollback. Callers lock several products in
/// ascending [`ProductKey`] order. `update_*` methods write a full aggregate
/// (with its children) after checking the stored version against `expected`.
#[async_trait::async_trait]
pub trait StockTransaction: Send {
    async fn insert_product(&mut self, product: &Product) -> Result<(), StoreError>;

    async fn lock_product(&mut self, key: ProductKey) -> Result<Option<Product>, StoreError>;

    /// Every active shop product, locked, ordered by product id.
    async fn lock_active_products(&mut self, shop_id: ShopId)
    -> Result<Vec<Product>, StoreError>;

    async fn update_product(
        &mut self,
        product: &Product,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError>;

    /// All batches of the product, active or not.
    async fn lock_batches(&mut self, key: ProductKey) -> Result<Vec<ProductBatch>, StoreError>;

    /// Insert or overwrite a batch. Batches are only written while their
    /// product row is locked.
    async fn save_batch(&mut self, batch: &ProductBatch) -> Result<(), StoreError>;

    /// Append ledger entries. Movements are never updated or deleted.
    async fn append_movements(&mut self, movements: &[StockMovement]) -> Result<(), StoreError>;

    async fn insert_purchase_order(&mut self, order: &PurchaseOrder) -> Result<(), StoreError>;

    async fn lock_purchase_order(
        &mut self,
        shop_id: ShopId,
        order_id: PurchaseOrderId,
    ) -> Result<Option<PurchaseOrder>, StoreError>;

    async fn update_purchase_order(
        &mut self,
        order: &PurchaseOrder,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError>;

    async fn insert_inventory(&mut self, inventory: &Inventory) -> Result<(), StoreError>;

    async fn lock_inventory(
        &mut self,
        shop_id: ShopId,
        inventory_id: InventoryId,
    ) -> Result<Option<Inventory>, StoreError>;

    async fn update_inventory(
        &mut self,
        inventory: &Inventory,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError>;

    async fn insert_transfer(&mut self, transfer: &StockTransfer) -> Result<(), StoreError>;

    async fn lock_transfer(
        &mut self,
        pharmacy_id: PharmacyId,
        transfer_id: StockTransferId,
    ) -> Result<Option<StockTransfer>, StoreError>;

    async fn update_transfer(
        &mut self,
        transfer: &StockTransfer,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Factory for transactions.
#[async_trait::async_trait]
pub trait StockStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StockTransaction>, StoreError>;
}

#[async_trait::async_trait]
impl<S> StockStore for Arc<S>
where
    S: StockStore + ?Sized,
{
    async fn begin(&self) -> Result<Box<dyn StockTransaction>, StoreError> {
        (**self).begin().await
    }
}

/// A store that can both run use-cases and answer reporting queries.
pub trait StockBackend: StockStore + StockQuery {}

impl<T> StockBackend for T where T: StockStore + StockQuery + ?Sized {}
