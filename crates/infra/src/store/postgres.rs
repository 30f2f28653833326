//! Postgres-backed stock store.
//!
//! Aggregates (products, batches, purchase orders, inventories, transfers) are
//! stored as JSONB `state` documents next to the columns used for locking,
//! filtering and the optimistic version check. The ledger is relational:
//! `stock_movements` rows are insert-only, and a trigger rejects any UPDATE or
//! DELETE.
//!
//! ## Locking
//!
//! `lock_*` reads use `SELECT ... FOR UPDATE`, one product at a time, in the
//! order the caller asks for them. Callers lock in ascending `(shop_id,
//! product_id)` order, which rules out lock-order deadlocks between use-cases.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Duplicate` |
//! | Database (serialization failure / deadlock) | `40001` / `40P01` | `Concurrency` |
//! | Database (other) | Any other | `Backend` |
//! | ColumnDecode / Decode | N/A | `Serialization` |
//! | Other | N/A | `Backend` |

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};
use uuid::Uuid;

use stockledger_core::{AggregateRoot, ExpectedVersion, PharmacyId, Quantity, ShopId, UserId};
use stockledger_inventory::{Inventory, InventoryId};
use stockledger_purchasing::{PurchaseOrder, PurchaseOrderId};
use stockledger_stock::{
    Direction, MovementId, MovementType, Product, ProductBatch, ProductId, ProductKey,
    StockMovement,
};
use stockledger_transfers::{StockTransfer, StockTransferId};

use super::query::{BatchFilter, MovementFilter, MovementPage, Pagination, StockQuery};
use super::r#trait::{StockStore, StockTransaction, StoreError};

/// Idempotent DDL, applied in order by [`PostgresStockStore::ensure_schema`].
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS stock_products (
        shop_id UUID NOT NULL,
        product_id UUID NOT NULL,
        code TEXT NOT NULL,
        is_active BOOLEAN NOT NULL,
        version BIGINT NOT NULL,
        state JSONB NOT NULL,
        PRIMARY KEY (shop_id, product_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stock_batches (
        batch_id UUID PRIMARY KEY,
        shop_id UUID NOT NULL,
        product_id UUID NOT NULL,
        batch_number TEXT NOT NULL,
        quantity BIGINT NOT NULL CHECK (quantity >= 0),
        expiration_date DATE NOT NULL,
        is_active BOOLEAN NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        state JSONB NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS stock_batches_product_idx
        ON stock_batches (shop_id, product_id)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS stock_batches_expiry_idx
        ON stock_batches (shop_id, expiration_date)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stock_movements (
        seq BIGSERIAL UNIQUE,
        movement_id UUID PRIMARY KEY,
        shop_id UUID NOT NULL,
        product_id UUID NOT NULL,
        movement_type TEXT NOT NULL CHECK (movement_type IN ('in', 'out', 'adjustment')),
        direction TEXT NOT NULL CHECK (direction IN ('increase', 'decrease')),
        quantity BIGINT NOT NULL CHECK (quantity > 0),
        reference TEXT NOT NULL,
        created_by UUID NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS stock_movements_product_idx
        ON stock_movements (shop_id, product_id, created_at)
    "#,
    r#"
    CREATE OR REPLACE FUNCTION stock_movements_append_only() RETURNS trigger AS $$
    BEGIN
        RAISE EXCEPTION 'stock_movements is append-only (% rejected)', TG_OP;
    END;
    $$ LANGUAGE plpgsql
    "#,
    r#"DROP TRIGGER IF EXISTS stock_movements_append_only ON stock_movements"#,
    r#"
    CREATE TRIGGER stock_movements_append_only
        BEFORE UPDATE OR DELETE ON stock_movements
        FOR EACH ROW EXECUTE FUNCTION stock_movements_append_only()
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS purchase_orders (
        order_id UUID PRIMARY KEY,
        shop_id UUID NOT NULL,
        status TEXT NOT NULL,
        version BIGINT NOT NULL,
        state JSONB NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS inventories (
        inventory_id UUID PRIMARY KEY,
        shop_id UUID NOT NULL,
        reference TEXT NOT NULL UNIQUE,
        status TEXT NOT NULL,
        version BIGINT NOT NULL,
        state JSONB NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stock_transfers (
        transfer_id UUID PRIMARY KEY,
        pharmacy_id UUID NOT NULL,
        reference TEXT NOT NULL UNIQUE,
        from_shop_id UUID NOT NULL,
        to_shop_id UUID NOT NULL,
        status TEXT NOT NULL,
        version BIGINT NOT NULL,
        state JSONB NOT NULL
    )
    "#,
];

/// Postgres-backed stock store.
///
/// Uses the SQLx connection pool, which is thread-safe (Arc + Send + Sync).
/// Every use-case runs inside one database transaction.
#[derive(Debug, Clone)]
pub struct PostgresStockStore {
    pool: Arc<PgPool>,
}

impl PostgresStockStore {
    /// Create a store over an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a pool against `database_url`.
    #[instrument(skip(database_url), err)]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create tables, indexes and the append-only trigger if missing.
    #[instrument(skip(self), fields(statements), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Span::current().record("statements", SCHEMA.len());
        Ok(())
    }
}

struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PostgresTransaction {
    async fn fetch_document<T: DeserializeOwned>(
        &mut self,
        operation: &str,
        sql: &'static str,
        id: &Uuid,
        scope: &Uuid,
    ) -> Result<Option<T>, StoreError> {
        let row = sqlx::query(sql)
            .bind(id)
            .bind(scope)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        row.map(|r| decode_state(&r)).transpose()
    }

    /// Run a versioned UPDATE shaped `WHERE <id> = $1 AND <scope> = $2 AND
    /// ($6 IS NULL OR version = $6)` with `status = $3, version = $4, state = $5`.
    #[allow(clippy::too_many_arguments)]
    async fn update_document(
        &mut self,
        operation: &str,
        sql: &'static str,
        id: &Uuid,
        scope: &Uuid,
        status: &str,
        version: u64,
        state: serde_json::Value,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(sql)
            .bind(id)
            .bind(scope)
            .bind(status)
            .bind(to_i64(version, "version")?)
            .bind(state)
            .bind(expected_param(expected)?)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Concurrency(format!(
                "{operation}: {id} missing or not at {expected:?}"
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StockTransaction for PostgresTransaction {
    #[instrument(skip(self, product), fields(key = %product.key()), err)]
    async fn insert_product(&mut self, product: &Product) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO stock_products (shop_id, product_id, code, is_active, version, state)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(product.shop_id().as_uuid())
        .bind(product.id_typed().as_uuid())
        .bind(product.code())
        .bind(product.is_active())
        .bind(to_i64(product.version(), "version")?)
        .bind(encode_state(product)?)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_product", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key), err)]
    async fn lock_product(&mut self, key: ProductKey) -> Result<Option<Product>, StoreError> {
        self.fetch_document(
            "lock_product",
            r#"
            SELECT state FROM stock_products
            WHERE product_id = $1 AND shop_id = $2
            FOR UPDATE
            "#,
            key.product_id.as_uuid(),
            key.shop_id.as_uuid(),
        )
        .await
    }

    #[instrument(skip(self), fields(shop_id = %shop_id), err)]
    async fn lock_active_products(
        &mut self,
        shop_id: ShopId,
    ) -> Result<Vec<Product>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT state FROM stock_products
            WHERE shop_id = $1 AND is_active
            ORDER BY product_id
            FOR UPDATE
            "#,
        )
        .bind(shop_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("lock_active_products", e))?;
        rows.iter().map(decode_state).collect()
    }

    #[instrument(skip(self, product), fields(key = %product.key()), err)]
    async fn update_product(
        &mut self,
        product: &Product,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE stock_products
            SET code = $3, is_active = $4, version = $5, state = $6
            WHERE shop_id = $1 AND product_id = $2
              AND ($7::BIGINT IS NULL OR version = $7)
            "#,
        )
        .bind(product.shop_id().as_uuid())
        .bind(product.id_typed().as_uuid())
        .bind(product.code())
        .bind(product.is_active())
        .bind(to_i64(product.version(), "version")?)
        .bind(encode_state(product)?)
        .bind(expected_param(expected)?)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_product", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Concurrency(format!(
                "product {} missing or not at {expected:?}",
                product.key()
            )));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key), err)]
    async fn lock_batches(&mut self, key: ProductKey) -> Result<Vec<ProductBatch>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT state FROM stock_batches
            WHERE shop_id = $1 AND product_id = $2
            ORDER BY expiration_date, created_at, batch_id
            FOR UPDATE
            "#,
        )
        .bind(key.shop_id.as_uuid())
        .bind(key.product_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("lock_batches", e))?;
        rows.iter().map(decode_state).collect()
    }

    #[instrument(skip(self, batch), fields(batch_id = %batch.id_typed()), err)]
    async fn save_batch(&mut self, batch: &ProductBatch) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO stock_batches (
                batch_id, shop_id, product_id, batch_number, quantity,
                expiration_date, is_active, created_at, state
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (batch_id) DO UPDATE SET
                quantity = EXCLUDED.quantity,
                is_active = EXCLUDED.is_active,
                state = EXCLUDED.state
            "#,
        )
        .bind(batch.id_typed().as_uuid())
        .bind(batch.shop_id().as_uuid())
        .bind(batch.product_id().as_uuid())
        .bind(batch.batch_number())
        .bind(to_i64(batch.quantity().value(), "quantity")?)
        .bind(batch.expiration_date())
        .bind(batch.is_active())
        .bind(batch.created_at())
        .bind(encode_state(batch)?)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("save_batch", e))?;
        Ok(())
    }

    #[instrument(skip(self, movements), fields(count = movements.len()), err)]
    async fn append_movements(&mut self, movements: &[StockMovement]) -> Result<(), StoreError> {
        for movement in movements {
            sqlx::query(
                r#"
                INSERT INTO stock_movements (
                    movement_id, shop_id, product_id, movement_type, direction,
                    quantity, reference, created_by, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(movement.id().as_uuid())
            .bind(movement.shop_id().as_uuid())
            .bind(movement.product_id().as_uuid())
            .bind(movement.movement_type().as_str())
            .bind(movement.direction().as_str())
            .bind(to_i64(movement.quantity().value(), "quantity")?)
            .bind(movement.reference())
            .bind(movement.created_by().as_uuid())
            .bind(movement.created_at())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("append_movements", e))?;
        }
        Ok(())
    }

    #[instrument(skip(self, order), fields(order_id = %order.id_typed()), err)]
    async fn insert_purchase_order(&mut self, order: &PurchaseOrder) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO purchase_orders (order_id, shop_id, status, version, state)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(order.id_typed().as_uuid())
        .bind(order.shop_id().as_uuid())
        .bind(order.status().as_str())
        .bind(to_i64(order.version(), "version")?)
        .bind(encode_state(order)?)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_purchase_order", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(shop_id = %shop_id, order_id = %order_id), err)]
    async fn lock_purchase_order(
        &mut self,
        shop_id: ShopId,
        order_id: PurchaseOrderId,
    ) -> Result<Option<PurchaseOrder>, StoreError> {
        self.fetch_document(
            "lock_purchase_order",
            r#"
            SELECT state FROM purchase_orders
            WHERE order_id = $1 AND shop_id = $2
            FOR UPDATE
            "#,
            order_id.as_uuid(),
            shop_id.as_uuid(),
        )
        .await
    }

    #[instrument(skip(self, order), fields(order_id = %order.id_typed()), err)]
    async fn update_purchase_order(
        &mut self,
        order: &PurchaseOrder,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        self.update_document(
            "update_purchase_order",
            r#"
            UPDATE purchase_orders
            SET status = $3, version = $4, state = $5
            WHERE order_id = $1 AND shop_id = $2
              AND ($6::BIGINT IS NULL OR version = $6)
            "#,
            order.id_typed().as_uuid(),
            order.shop_id().as_uuid(),
            order.status().as_str(),
            order.version(),
            encode_state(order)?,
            expected,
        )
        .await
    }

    #[instrument(skip(self, inventory), fields(reference = inventory.reference()), err)]
    async fn insert_inventory(&mut self, inventory: &Inventory) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO inventories (inventory_id, shop_id, reference, status, version, state)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(inventory.id_typed().as_uuid())
        .bind(inventory.shop_id().as_uuid())
        .bind(inventory.reference())
        .bind(inventory.status().as_str())
        .bind(to_i64(inventory.version(), "version")?)
        .bind(encode_state(inventory)?)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_inventory", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(shop_id = %shop_id, inventory_id = %inventory_id), err)]
    async fn lock_inventory(
        &mut self,
        shop_id: ShopId,
        inventory_id: InventoryId,
    ) -> Result<Option<Inventory>, StoreError> {
        self.fetch_document(
            "lock_inventory",
            r#"
            SELECT state FROM inventories
            WHERE inventory_id = $1 AND shop_id = $2
            FOR UPDATE
            "#,
            inventory_id.as_uuid(),
            shop_id.as_uuid(),
        )
        .await
    }

    #[instrument(skip(self, inventory), fields(reference = inventory.reference()), err)]
    async fn update_inventory(
        &mut self,
        inventory: &Inventory,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        self.update_document(
            "update_inventory",
            r#"
            UPDATE inventories
            SET status = $3, version = $4, state = $5
            WHERE inventory_id = $1 AND shop_id = $2
              AND ($6::BIGINT IS NULL OR version = $6)
            "#,
            inventory.id_typed().as_uuid(),
            inventory.shop_id().as_uuid(),
            inventory.status().as_str(),
            inventory.version(),
            encode_state(inventory)?,
            expected,
        )
        .await
    }

    #[instrument(skip(self, transfer), fields(reference = transfer.reference()), err)]
    async fn insert_transfer(&mut self, transfer: &StockTransfer) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO stock_transfers (
                transfer_id, pharmacy_id, reference, from_shop_id, to_shop_id,
                status, version, state
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(transfer.id_typed().as_uuid())
        .bind(transfer.pharmacy_id().as_uuid())
        .bind(transfer.reference())
        .bind(transfer.from_shop_id().as_uuid())
        .bind(transfer.to_shop_id().as_uuid())
        .bind(transfer.status().as_str())
        .bind(to_i64(transfer.version(), "version")?)
        .bind(encode_state(transfer)?)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_transfer", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(pharmacy_id = %pharmacy_id, transfer_id = %transfer_id), err)]
    async fn lock_transfer(
        &mut self,
        pharmacy_id: PharmacyId,
        transfer_id: StockTransferId,
    ) -> Result<Option<StockTransfer>, StoreError> {
        self.fetch_document(
            "lock_transfer",
            r#"
            SELECT state FROM stock_transfers
            WHERE transfer_id = $1 AND pharmacy_id = $2
            FOR UPDATE
            "#,
            transfer_id.as_uuid(),
            pharmacy_id.as_uuid(),
        )
        .await
    }

    #[instrument(skip(self, transfer), fields(reference = transfer.reference()), err)]
    async fn update_transfer(
        &mut self,
        transfer: &StockTransfer,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        self.update_document(
            "update_transfer",
            r#"
            UPDATE stock_transfers
            SET status = $3, version = $4, state = $5
            WHERE transfer_id = $1 AND pharmacy_id = $2
              AND ($6::BIGINT IS NULL OR version = $6)
            "#,
            transfer.id_typed().as_uuid(),
            transfer.pharmacy_id().as_uuid(),
            transfer.status().as_str(),
            transfer.version(),
            encode_state(transfer)?,
            expected,
        )
        .await
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

#[async_trait::async_trait]
impl StockStore for PostgresStockStore {
    async fn begin(&self) -> Result<Box<dyn StockTransaction>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Box::new(PostgresTransaction { tx }))
    }
}

#[async_trait::async_trait]
impl StockQuery for PostgresStockStore {
    #[instrument(skip(self), fields(key = %key), err)]
    async fn product(&self, key: ProductKey) -> Result<Option<Product>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT state FROM stock_products
            WHERE shop_id = $1 AND product_id = $2
            "#,
        )
        .bind(key.shop_id.as_uuid())
        .bind(key.product_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("product", e))?;
        row.map(|r| decode_state(&r)).transpose()
    }

    #[instrument(skip(self), fields(shop_id = %shop_id), err)]
    async fn products(&self, shop_id: ShopId) -> Result<Vec<Product>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT state FROM stock_products
            WHERE shop_id = $1
            ORDER BY code
            "#,
        )
        .bind(shop_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("products", e))?;
        rows.iter().map(decode_state).collect()
    }

    #[instrument(skip(self, filter), fields(shop_id = %filter.shop_id), err)]
    async fn batches(&self, filter: BatchFilter) -> Result<Vec<ProductBatch>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT state FROM stock_batches
            WHERE shop_id = $1
              AND ($2::UUID IS NULL OR product_id = $2)
              AND ($3 OR is_active)
              AND ($4::DATE IS NULL OR expiration_date >= $4)
              AND ($5::DATE IS NULL OR expiration_date <= $5)
            ORDER BY expiration_date, created_at, batch_id
            "#,
        )
        .bind(filter.shop_id.as_uuid())
        .bind(filter.product_id.map(|p| *p.as_uuid()))
        .bind(filter.include_inactive)
        .bind(filter.expires_from)
        .bind(filter.expires_until)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("batches", e))?;
        rows.iter().map(decode_state).collect()
    }

    #[instrument(
        skip(self, filter),
        fields(
            shop_id = %filter.shop_id,
            limit = pagination.limit,
            offset = pagination.offset,
            returned = tracing::field::Empty
        ),
        err
    )]
    async fn movements(
        &self,
        filter: MovementFilter,
        pagination: Pagination,
    ) -> Result<MovementPage, StoreError> {
        const WHERE: &str = r#"
            WHERE shop_id = $1
              AND ($2::UUID IS NULL OR product_id = $2)
              AND ($3::TEXT IS NULL OR movement_type = $3)
              AND ($4::TEXT IS NULL OR reference = $4)
              AND ($5::TIMESTAMPTZ IS NULL OR created_at >= $5)
              AND ($6::TIMESTAMPTZ IS NULL OR created_at < $6)
        "#;

        let product_id = filter.product_id.map(|p| *p.as_uuid());
        let movement_type = filter.movement_type.map(MovementType::as_str);

        let count_sql = format!("SELECT COUNT(*) AS total FROM stock_movements {WHERE}");
        let total: i64 = sqlx::query(&count_sql)
            .bind(filter.shop_id.as_uuid())
            .bind(product_id)
            .bind(movement_type)
            .bind(filter.reference.as_deref())
            .bind(filter.created_from)
            .bind(filter.created_until)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_movements", e))?
            .try_get("total")
            .map_err(|e| map_sqlx_error("count_movements", e))?;

        let page_sql = format!(
            r#"
            SELECT movement_id, shop_id, product_id, movement_type, direction,
                   quantity, reference, created_by, created_at
            FROM stock_movements
            {WHERE}
            ORDER BY seq ASC
            LIMIT $7 OFFSET $8
            "#
        );
        let rows = sqlx::query(&page_sql)
            .bind(filter.shop_id.as_uuid())
            .bind(product_id)
            .bind(movement_type)
            .bind(filter.reference.as_deref())
            .bind(filter.created_from)
            .bind(filter.created_until)
            .bind(i64::from(pagination.limit))
            .bind(i64::from(pagination.offset))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("movements", e))?;

        let movements = rows
            .iter()
            .map(|row| MovementRow::from_row(row).and_then(StockMovement::try_from))
            .collect::<Result<Vec<_>, _>>()?;

        Span::current().record("returned", movements.len());
        Ok(MovementPage::new(
            movements,
            u64::try_from(total).unwrap_or(0),
            pagination,
        ))
    }

    #[instrument(skip(self), fields(key = %key), err)]
    async fn movement_net(&self, key: ProductKey) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(
                CASE WHEN direction = 'increase' THEN quantity ELSE -quantity END
            ), 0)::BIGINT AS net
            FROM stock_movements
            WHERE shop_id = $1 AND product_id = $2
            "#,
        )
        .bind(key.shop_id.as_uuid())
        .bind(key.product_id.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("movement_net", e))?;
        row.try_get("net")
            .map_err(|e| map_sqlx_error("movement_net", e))
    }

    #[instrument(skip(self), fields(shop_id = %shop_id, order_id = %order_id), err)]
    async fn purchase_order(
        &self,
        shop_id: ShopId,
        order_id: PurchaseOrderId,
    ) -> Result<Option<PurchaseOrder>, StoreError> {
        let row = sqlx::query("SELECT state FROM purchase_orders WHERE order_id = $1 AND shop_id = $2")
            .bind(order_id.as_uuid())
            .bind(shop_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("purchase_order", e))?;
        row.map(|r| decode_state(&r)).transpose()
    }

    #[instrument(skip(self), fields(shop_id = %shop_id, inventory_id = %inventory_id), err)]
    async fn inventory(
        &self,
        shop_id: ShopId,
        inventory_id: InventoryId,
    ) -> Result<Option<Inventory>, StoreError> {
        let row = sqlx::query("SELECT state FROM inventories WHERE inventory_id = $1 AND shop_id = $2")
            .bind(inventory_id.as_uuid())
            .bind(shop_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("inventory", e))?;
        row.map(|r| decode_state(&r)).transpose()
    }

    #[instrument(skip(self), fields(pharmacy_id = %pharmacy_id, transfer_id = %transfer_id), err)]
    async fn transfer(
        &self,
        pharmacy_id: PharmacyId,
        transfer_id: StockTransferId,
    ) -> Result<Option<StockTransfer>, StoreError> {
        let row = sqlx::query(
            "SELECT state FROM stock_transfers WHERE transfer_id = $1 AND pharmacy_id = $2",
        )
        .bind(transfer_id.as_uuid())
        .bind(pharmacy_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("transfer", e))?;
        row.map(|r| decode_state(&r)).transpose()
    }
}

fn encode_state<T: Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value)
        .map_err(|e| StoreError::Serialization(format!("state encoding failed: {e}")))
}

fn decode_state<T: DeserializeOwned>(row: &PgRow) -> Result<T, StoreError> {
    let state: serde_json::Value = row
        .try_get("state")
        .map_err(|e| map_sqlx_error("decode_state", e))?;
    serde_json::from_value(state)
        .map_err(|e| StoreError::Serialization(format!("state decoding failed: {e}")))
}

fn to_i64(value: u64, what: &str) -> Result<i64, StoreError> {
    i64::try_from(value)
        .map_err(|_| StoreError::Serialization(format!("{what} {value} does not fit in BIGINT")))
}

fn expected_param(expected: ExpectedVersion) -> Result<Option<i64>, StoreError> {
    match expected {
        ExpectedVersion::Any => Ok(None),
        ExpectedVersion::Exact(v) => to_i64(v, "expected version").map(Some),
    }
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Duplicate(msg),
                Some("40001") | Some("40P01") => StoreError::Concurrency(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Serialization(format!("decode error in {operation}: {err}"))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {operation}"))
        }
        _ => StoreError::Backend(format!("sqlx error in {operation}: {err}")),
    }
}

// SQLx row types

#[derive(Debug)]
struct MovementRow {
    movement_id: Uuid,
    shop_id: Uuid,
    product_id: Uuid,
    movement_type: String,
    direction: String,
    quantity: i64,
    reference: String,
    created_by: Uuid,
    created_at: DateTime<Utc>,
}

impl MovementRow {
    fn from_row(row: &PgRow) -> Result<Self, StoreError> {
        let read = |e: sqlx::Error| map_sqlx_error("decode_movement", e);
        Ok(MovementRow {
            movement_id: row.try_get("movement_id").map_err(read)?,
            shop_id: row.try_get("shop_id").map_err(read)?,
            product_id: row.try_get("product_id").map_err(read)?,
            movement_type: row.try_get("movement_type").map_err(read)?,
            direction: row.try_get("direction").map_err(read)?,
            quantity: row.try_get("quantity").map_err(read)?,
            reference: row.try_get("reference").map_err(read)?,
            created_by: row.try_get("created_by").map_err(read)?,
            created_at: row.try_get("created_at").map_err(read)?,
        })
    }
}

impl TryFrom<MovementRow> for StockMovement {
    type Error = StoreError;

    fn try_from(row: MovementRow) -> Result<Self, Self::Error> {
        let id = row.movement_id;
        let corrupt =
            |e: stockledger_core::DomainError| StoreError::Serialization(format!("movement {id}: {e}"));
        let movement_type = MovementType::parse(&row.movement_type).map_err(corrupt)?;
        let direction = Direction::parse(&row.direction).map_err(corrupt)?;
        let quantity = u64::try_from(row.quantity).map_err(|_| {
            StoreError::Serialization(format!(
                "movement {id} has negative quantity {}",
                row.quantity
            ))
        })?;

        Ok(StockMovement::restore(
            MovementId::from(row.movement_id),
            ShopId::from_uuid(row.shop_id),
            ProductId::from(row.product_id),
            movement_type,
            direction,
            Quantity::new(quantity),
            row.reference,
            UserId::from_uuid(row.created_by),
            row.created_at,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;
    use std::fmt;

    use sqlx::error::{DatabaseError, ErrorKind};

    #[derive(Debug)]
    struct CodedError(&'static str);

    impl fmt::Display for CodedError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "database error {}", self.0)
        }
    }

    impl std::error::Error for CodedError {}

    impl DatabaseError for CodedError {
        fn message(&self) -> &str {
            "could not serialize access"
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            Some(Cow::Borrowed(self.0))
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> ErrorKind {
            ErrorKind::Other
        }
    }

    fn database_error(code: &'static str) -> sqlx::Error {
        sqlx::Error::Database(Box::new(CodedError(code)))
    }

    fn row(movement_type: &str, direction: &str, quantity: i64) -> MovementRow {
        MovementRow {
            movement_id: Uuid::new_v4(),
            shop_id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            movement_type: movement_type.to_string(),
            direction: direction.to_string(),
            quantity,
            reference: "PO-7".to_string(),
            created_by: Uuid::new_v4(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn serialization_failure_and_deadlock_map_to_concurrency() {
        for code in ["40001", "40P01"] {
            let err = map_sqlx_error("save_batch", database_error(code));
            assert!(matches!(err, StoreError::Concurrency(_)), "{code}: {err:?}");
        }
    }

    #[test]
    fn unique_violation_maps_to_duplicate() {
        let err = map_sqlx_error("insert_product", database_error("23505"));
        assert!(matches!(err, StoreError::Duplicate(_)));
    }

    #[test]
    fn other_database_codes_map_to_backend() {
        let err = map_sqlx_error("append_movements", database_error("23514"));
        assert!(matches!(err, StoreError::Backend(msg) if msg.contains("append_movements")));
    }

    #[test]
    fn non_database_errors_map_by_kind() {
        assert!(matches!(
            map_sqlx_error("connect", sqlx::Error::PoolClosed),
            StoreError::Backend(_)
        ));
        assert!(matches!(
            map_sqlx_error("lock_product", sqlx::Error::RowNotFound),
            StoreError::Backend(_)
        ));
        assert!(matches!(
            map_sqlx_error("decode_movement", sqlx::Error::Decode("bad uuid".into())),
            StoreError::Serialization(_)
        ));
    }

    #[test]
    fn to_i64_rejects_values_past_bigint() {
        assert_eq!(to_i64(i64::MAX as u64, "version").unwrap(), i64::MAX);
        assert!(matches!(
            to_i64(i64::MAX as u64 + 1, "version"),
            Err(StoreError::Serialization(msg)) if msg.contains("version")
        ));
        assert!(matches!(
            expected_param(ExpectedVersion::Exact(u64::MAX)),
            Err(StoreError::Serialization(_))
        ));
        assert_eq!(expected_param(ExpectedVersion::Any).unwrap(), None);
    }

    #[test]
    fn movement_row_decodes_into_movement() {
        let source = row("out", "decrease", 4);
        let id = source.movement_id;
        let movement = StockMovement::try_from(source).unwrap();
        assert_eq!(*movement.id().as_uuid(), id);
        assert_eq!(movement.movement_type(), MovementType::Out);
        assert_eq!(movement.direction(), Direction::Decrease);
        assert_eq!(movement.quantity(), Quantity::new(4));
        assert_eq!(movement.reference(), "PO-7");
        assert_eq!(movement.signed_quantity(), -4);
    }

    #[test]
    fn corrupt_movement_rows_are_serialization_errors() {
        for source in [
            row("transfer", "increase", 1),
            row("in", "sideways", 1),
            row("in", "increase", -1),
        ] {
            assert!(matches!(
                StockMovement::try_from(source),
                Err(StoreError::Serialization(_))
            ));
        }
    }
}
