use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use stockledger_core::{AggregateRoot, ExpectedVersion, PharmacyId, ShopId};
use stockledger_inventory::{Inventory, InventoryId};
use stockledger_purchasing::{PurchaseOrder, PurchaseOrderId};
use stockledger_stock::{
    BatchId, MovementId, Product, ProductBatch, ProductKey, StockMovement, net_quantity,
};
use stockledger_transfers::{StockTransfer, StockTransferId};

use super::query::{BatchFilter, MovementFilter, MovementPage, Pagination, StockQuery};
use super::r#trait::{StockStore, StockTransaction, StoreError};

#[derive(Debug, Default, Clone)]
struct State {
    products: BTreeMap<ProductKey, Product>,
    batches: BTreeMap<BatchId, ProductBatch>,
    movements: Vec<StockMovement>,
    movement_ids: HashSet<MovementId>,
    purchase_orders: HashMap<PurchaseOrderId, PurchaseOrder>,
    inventories: HashMap<InventoryId, Inventory>,
    transfers: HashMap<StockTransferId, StockTransfer>,
}

/// In-memory stock store.
///
/// Intended for tests/dev. One async mutex serialises transactions; each
/// transaction works on a copy of the state that replaces the shared state on
/// commit. Not optimized for performance.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStockStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryStockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

struct InMemoryTransaction {
    guard: OwnedMutexGuard<State>,
    staged: State,
}

fn check_version(what: &str, expected: ExpectedVersion, actual: u64) -> Result<(), StoreError> {
    if expected.matches(actual) {
        Ok(())
    } else {
        Err(StoreError::Concurrency(format!(
            "{what}: expected {expected:?}, found {actual}"
        )))
    }
}

fn replace<K, V>(
    map: &mut HashMap<K, V>,
    key: K,
    value: &V,
    expected: ExpectedVersion,
    what: &str,
) -> Result<(), StoreError>
where
    K: Eq + std::hash::Hash + std::fmt::Display,
    V: AggregateRoot + Clone,
{
    let current = map
        .get(&key)
        .ok_or_else(|| StoreError::Concurrency(format!("{what} {key} does not exist")))?;
    check_version(what, expected, current.version())?;
    map.insert(key, value.clone());
    Ok(())
}

#[async_trait::async_trait]
impl StockTransaction for InMemoryTransaction {
    async fn insert_product(&mut self, product: &Product) -> Result<(), StoreError> {
        let key = product.key();
        if self.staged.products.contains_key(&key) {
            return Err(StoreError::Duplicate(format!("product {key}")));
        }
        self.staged.products.insert(key, product.clone());
        Ok(())
    }

    async fn lock_product(&mut self, key: ProductKey) -> Result<Option<Product>, StoreError> {
        Ok(self.staged.products.get(&key).cloned())
    }

    async fn lock_active_products(
        &mut self,
        shop_id: ShopId,
    ) -> Result<Vec<Product>, StoreError> {
        Ok(self
            .staged
            .products
            .values()
            .filter(|p| p.shop_id() == shop_id && p.is_active())
            .cloned()
            .collect())
    }

    async fn update_product(
        &mut self,
        product: &Product,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let key = product.key();
        let current = self
            .staged
            .products
            .get(&key)
            .ok_or_else(|| StoreError::Concurrency(format!("product {key} does not exist")))?;
        check_version("product", expected, current.version())?;
        self.staged.products.insert(key, product.clone());
        Ok(())
    }

    async fn lock_batches(&mut self, key: ProductKey) -> Result<Vec<ProductBatch>, StoreError> {
        Ok(self
            .staged
            .batches
            .values()
            .filter(|b| b.key() == key)
            .cloned()
            .collect())
    }

    async fn save_batch(&mut self, batch: &ProductBatch) -> Result<(), StoreError> {
        self.staged.batches.insert(batch.id_typed(), batch.clone());
        Ok(())
    }

    async fn append_movements(&mut self, movements: &[StockMovement]) -> Result<(), StoreError> {
        let mut fresh = HashSet::with_capacity(movements.len());
        for movement in movements {
            let id = movement.id();
            if self.staged.movement_ids.contains(&id) || !fresh.insert(id) {
                return Err(StoreError::Duplicate(format!("movement {id}")));
            }
        }
        self.staged.movement_ids.extend(fresh);
        self.staged.movements.extend_from_slice(movements);
        Ok(())
    }

    async fn insert_purchase_order(&mut self, order: &PurchaseOrder) -> Result<(), StoreError> {
        let id = order.id_typed();
        if self.staged.purchase_orders.contains_key(&id) {
            return Err(StoreError::Duplicate(format!("purchase order {id}")));
        }
        self.staged.purchase_orders.insert(id, order.clone());
        Ok(())
    }

    async fn lock_purchase_order(
        &mut self,
        shop_id: ShopId,
        order_id: PurchaseOrderId,
    ) -> Result<Option<PurchaseOrder>, StoreError> {
        Ok(self
            .staged
            .purchase_orders
            .get(&order_id)
            .filter(|o| o.shop_id() == shop_id)
            .cloned())
    }

    async fn update_purchase_order(
        &mut self,
        order: &PurchaseOrder,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        replace(
            &mut self.staged.purchase_orders,
            order.id_typed(),
            order,
            expected,
            "purchase order",
        )
    }

    async fn insert_inventory(&mut self, inventory: &Inventory) -> Result<(), StoreError> {
        let id = inventory.id_typed();
        if self.staged.inventories.contains_key(&id)
            || self
                .staged
                .inventories
                .values()
                .any(|i| i.reference() == inventory.reference())
        {
            return Err(StoreError::Duplicate(format!(
                "inventory {}",
                inventory.reference()
            )));
        }
        self.staged.inventories.insert(id, inventory.clone());
        Ok(())
    }

    async fn lock_inventory(
        &mut self,
        shop_id: ShopId,
        inventory_id: InventoryId,
    ) -> Result<Option<Inventory>, StoreError> {
        Ok(self
            .staged
            .inventories
            .get(&inventory_id)
            .filter(|i| i.shop_id() == shop_id)
            .cloned())
    }

    async fn update_inventory(
        &mut self,
        inventory: &Inventory,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        replace(
            &mut self.staged.inventories,
            inventory.id_typed(),
            inventory,
            expected,
            "inventory",
        )
    }

    async fn insert_transfer(&mut self, transfer: &StockTransfer) -> Result<(), StoreError> {
        let id = transfer.id_typed();
        if self.staged.transfers.contains_key(&id)
            || self
                .staged
                .transfers
                .values()
                .any(|t| t.reference() == transfer.reference())
        {
            return Err(StoreError::Duplicate(format!(
                "transfer {}",
                transfer.reference()
            )));
        }
        self.staged.transfers.insert(id, transfer.clone());
        Ok(())
    }

    async fn lock_transfer(
        &mut self,
        pharmacy_id: PharmacyId,
        transfer_id: StockTransferId,
    ) -> Result<Option<StockTransfer>, StoreError> {
        Ok(self
            .staged
            .transfers
            .get(&transfer_id)
            .filter(|t| t.pharmacy_id() == pharmacy_id)
            .cloned())
    }

    async fn update_transfer(
        &mut self,
        transfer: &StockTransfer,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        replace(
            &mut self.staged.transfers,
            transfer.id_typed(),
            transfer,
            expected,
            "transfer",
        )
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let InMemoryTransaction { mut guard, staged } = *self;
        *guard = staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl StockStore for InMemoryStockStore {
    async fn begin(&self) -> Result<Box<dyn StockTransaction>, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(InMemoryTransaction { guard, staged }))
    }
}

#[async_trait::async_trait]
impl StockQuery for InMemoryStockStore {
    async fn product(&self, key: ProductKey) -> Result<Option<Product>, StoreError> {
        Ok(self.state.lock().await.products.get(&key).cloned())
    }

    async fn products(&self, shop_id: ShopId) -> Result<Vec<Product>, StoreError> {
        let state = self.state.lock().await;
        let mut products: Vec<Product> = state
            .products
            .values()
            .filter(|p| p.shop_id() == shop_id)
            .cloned()
            .collect();
        products.sort_by(|a, b| a.code().cmp(b.code()));
        Ok(products)
    }

    async fn batches(&self, filter: BatchFilter) -> Result<Vec<ProductBatch>, StoreError> {
        let state = self.state.lock().await;
        let mut batches: Vec<ProductBatch> = state
            .batches
            .values()
            .filter(|b| filter.matches(b))
            .cloned()
            .collect();
        batches.sort_by_key(|b| b.fefo_key());
        Ok(batches)
    }

    async fn movements(
        &self,
        filter: MovementFilter,
        pagination: Pagination,
    ) -> Result<MovementPage, StoreError> {
        let state = self.state.lock().await;
        let matching: Vec<&StockMovement> = state
            .movements
            .iter()
            .filter(|m| filter.matches(m))
            .collect();
        let total = matching.len() as u64;
        let page = matching
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .cloned()
            .collect();
        Ok(MovementPage::new(page, total, pagination))
    }

    async fn movement_net(&self, key: ProductKey) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        Ok(net_quantity(state.movements.iter().filter(|m| m.key() == key)))
    }

    async fn purchase_order(
        &self,
        shop_id: ShopId,
        order_id: PurchaseOrderId,
    ) -> Result<Option<PurchaseOrder>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .purchase_orders
            .get(&order_id)
            .filter(|o| o.shop_id() == shop_id)
            .cloned())
    }

    async fn inventory(
        &self,
        shop_id: ShopId,
        inventory_id: InventoryId,
    ) -> Result<Option<Inventory>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .inventories
            .get(&inventory_id)
            .filter(|i| i.shop_id() == shop_id)
            .cloned())
    }

    async fn transfer(
        &self,
        pharmacy_id: PharmacyId,
        transfer_id: StockTransferId,
    ) -> Result<Option<StockTransfer>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .transfers
            .get(&transfer_id)
            .filter(|t| t.pharmacy_id() == pharmacy_id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use stockledger_core::{Quantity, UserId};
    use stockledger_stock::{MovementContext, NewProduct, ProductId, StockPosition};

    fn product(shop_id: ShopId) -> Product {
        Product::create(
            NewProduct {
                shop_id,
                product_id: ProductId::generate(),
                code: "PARA500".to_string(),
                name: "Paracetamol 500mg".to_string(),
                price: dec!(3.50),
                category_id: None,
                batch_tracked: false,
            },
            Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let store = InMemoryStockStore::new();
        let p = product(ShopId::new());

        let mut tx = store.begin().await.unwrap();
        tx.insert_product(&p).await.unwrap();
        tx.rollback().await.unwrap();
        assert!(store.product(p.key()).await.unwrap().is_none());

        let mut tx = store.begin().await.unwrap();
        tx.insert_product(&p).await.unwrap();
        drop(tx);
        assert!(store.product(p.key()).await.unwrap().is_none());

        let mut tx = store.begin().await.unwrap();
        tx.insert_product(&p).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.product(p.key()).await.unwrap(), Some(p));
    }

    #[tokio::test]
    async fn stale_product_version_is_rejected() {
        let store = InMemoryStockStore::new();
        let p = product(ShopId::new());
        let mut tx = store.begin().await.unwrap();
        tx.insert_product(&p).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let loaded = tx.lock_product(p.key()).await.unwrap().unwrap();
        let mut position = StockPosition::new(loaded, vec![]).unwrap();
        let ctx = MovementContext::new("OPENING", UserId::new(), Utc::now());
        position.receive(&ctx, Quantity::new(3), None).unwrap();
        let err = tx
            .update_product(
                position.product(),
                ExpectedVersion::Exact(position.loaded_version() + 1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Concurrency(_)));
    }

    #[tokio::test]
    async fn duplicate_product_insert_is_rejected() {
        let store = InMemoryStockStore::new();
        let p = product(ShopId::new());
        let mut tx = store.begin().await.unwrap();
        tx.insert_product(&p).await.unwrap();
        let err = tx.insert_product(&p).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
    }

    #[tokio::test]
    async fn duplicate_movement_append_is_rejected() {
        let store = InMemoryStockStore::new();
        let p = product(ShopId::new());
        let key = p.key();
        let mut position = StockPosition::new(p.clone(), vec![]).unwrap();
        let ctx = MovementContext::new("OPENING", UserId::new(), Utc::now());
        let first = position.receive(&ctx, Quantity::new(3), None).unwrap();
        let second = position.receive(&ctx, Quantity::new(2), None).unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.insert_product(&p).await.unwrap();
        tx.append_movements(std::slice::from_ref(&first)).await.unwrap();

        let err = tx
            .append_movements(&[second.clone(), first.clone()])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));

        let err = tx
            .append_movements(&[second.clone(), second.clone()])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));

        tx.append_movements(std::slice::from_ref(&second)).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let err = tx
            .append_movements(std::slice::from_ref(&first))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
        drop(tx);

        assert_eq!(store.movement_net(key).await.unwrap(), 5);
    }
}
