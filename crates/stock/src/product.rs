use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{AggregateRoot, DomainError, DomainResult, Quantity, ShopId, typed_id};

typed_id!(
    /// Catalogue product identifier, shared by the product's rows in every shop.
    ProductId
);

typed_id!(
    /// Product category identifier.
    CategoryId
);

/// Repository key of a product's stock row, and the lock-ordering key for
/// multi-product operations (shop first, then product).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProductKey {
    pub shop_id: ShopId,
    pub product_id: ProductId,
}

impl ProductKey {
    pub fn new(shop_id: ShopId, product_id: ProductId) -> Self {
        Self {
            shop_id,
            product_id,
        }
    }
}

impl core::fmt::Display for ProductKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.shop_id, self.product_id)
    }
}

/// Input for registering a product's stock row in a shop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProduct {
    pub shop_id: ShopId,
    pub product_id: ProductId,
    pub code: String,
    pub name: String,
    pub price: Decimal,
    pub category_id: Option<CategoryId>,
    pub batch_tracked: bool,
}

/// Aggregate root: a product's stock row in one shop.
///
/// `stock` is the authoritative on-hand quantity. It only changes through
/// [`crate::StockPosition`], which always emits the matching ledger movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    id: ProductId,
    shop_id: ShopId,
    code: String,
    name: String,
    price: Decimal,
    category_id: Option<CategoryId>,
    stock: Quantity,
    batch_tracked: bool,
    is_active: bool,
    version: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Product {
    /// Register a product with zero stock. Opening balances enter through the
    /// ledger like any other stock.
    pub fn create(new: NewProduct, at: DateTime<Utc>) -> DomainResult<Self> {
        if new.code.trim().is_empty() {
            return Err(DomainError::invalid_argument("product code cannot be empty"));
        }
        if new.name.trim().is_empty() {
            return Err(DomainError::invalid_argument("product name cannot be empty"));
        }
        if new.price.is_sign_negative() {
            return Err(DomainError::invalid_argument("price cannot be negative"));
        }

        Ok(Self {
            id: new.product_id,
            shop_id: new.shop_id,
            code: new.code.trim().to_string(),
            name: new.name.trim().to_string(),
            price: new.price,
            category_id: new.category_id,
            stock: Quantity::ZERO,
            batch_tracked: new.batch_tracked,
            is_active: true,
            version: 0,
            created_at: at,
            updated_at: at,
        })
    }

    pub fn id_typed(&self) -> ProductId {
        self.id
    }

    pub fn shop_id(&self) -> ShopId {
        self.shop_id
    }

    pub fn key(&self) -> ProductKey {
        ProductKey::new(self.shop_id, self.id)
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn price(&self) -> Decimal {
        self.price
    }

    pub fn category_id(&self) -> Option<CategoryId> {
        self.category_id
    }

    pub fn stock(&self) -> Quantity {
        self.stock
    }

    pub fn is_batch_tracked(&self) -> bool {
        self.batch_tracked
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// At or below the threshold.
    pub fn is_low_stock(&self, threshold: Quantity) -> bool {
        self.stock <= threshold
    }

    pub fn is_in_stock(&self) -> bool {
        !self.stock.is_zero()
    }

    pub fn deactivate(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        if !self.is_active {
            return Err(DomainError::transition("product is already inactive"));
        }
        self.is_active = false;
        self.touch(at);
        Ok(())
    }

    pub fn activate(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        if self.is_active {
            return Err(DomainError::transition("product is already active"));
        }
        self.is_active = true;
        self.touch(at);
        Ok(())
    }

    pub(crate) fn add_stock(&mut self, amount: Quantity, at: DateTime<Utc>) -> DomainResult<()> {
        self.stock = self.stock.add(amount)?;
        self.touch(at);
        Ok(())
    }

    pub(crate) fn remove_stock(&mut self, amount: Quantity, at: DateTime<Utc>) -> DomainResult<()> {
        self.stock = self.stock.subtract(amount)?;
        self.touch(at);
        Ok(())
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
        self.version += 1;
    }
}

impl AggregateRoot for Product {
    type Id = ProductId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn new_product(batch_tracked: bool) -> NewProduct {
        NewProduct {
            shop_id: ShopId::new(),
            product_id: ProductId::generate(),
            code: "PARA-500".to_string(),
            name: "Paracetamol 500mg".to_string(),
            price: dec!(2.50),
            category_id: None,
            batch_tracked,
        }
    }

    #[test]
    fn create_starts_with_zero_stock() {
        let product = Product::create(new_product(false), Utc::now()).unwrap();
        assert!(product.stock().is_zero());
        assert!(!product.is_in_stock());
        assert!(product.is_low_stock(Quantity::new(10)));
        assert_eq!(product.version(), 0);
    }

    #[test]
    fn create_rejects_negative_price_and_blank_fields() {
        let mut input = new_product(false);
        input.price = dec!(-0.01);
        assert!(matches!(
            Product::create(input, Utc::now()),
            Err(DomainError::InvalidArgument(_))
        ));

        let mut input = new_product(false);
        input.code = "  ".to_string();
        assert!(Product::create(input, Utc::now()).is_err());
    }

    #[test]
    fn remove_stock_never_goes_negative() {
        let mut product = Product::create(new_product(false), Utc::now()).unwrap();
        product.add_stock(Quantity::new(3), Utc::now()).unwrap();
        let err = product.remove_stock(Quantity::new(4), Utc::now()).unwrap_err();
        assert!(matches!(err, DomainError::InsufficientQuantity { .. }));
        assert_eq!(product.stock().value(), 3);
        assert_eq!(product.version(), 1);
    }

    #[test]
    fn low_stock_threshold_is_inclusive() {
        let mut product = Product::create(new_product(false), Utc::now()).unwrap();
        product.add_stock(Quantity::new(10), Utc::now()).unwrap();
        assert!(product.is_low_stock(Quantity::new(10)));
        assert!(!product.is_low_stock(Quantity::new(9)));
    }

    #[test]
    fn activation_toggles_are_guarded() {
        let mut product = Product::create(new_product(false), Utc::now()).unwrap();
        assert!(product.activate(Utc::now()).is_err());
        product.deactivate(Utc::now()).unwrap();
        assert!(!product.is_active());
        assert!(product.deactivate(Utc::now()).is_err());
    }
}
