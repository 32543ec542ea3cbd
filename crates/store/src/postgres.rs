use std::collections::HashMap;

use async_trait::async_trait;
use common::{CorrelationId, CustomerId, Money, OrderId, ProductId};
use domain::{
    CustomerInfo, MovementKind, Order, OrderEventRecord, OrderStatus, Product, Reservation,
    ReservationOutcome, ReservationRejection, ReservedLine, StockMovement, StockRequest,
    Transaction,
};
use sqlx::{PgPool, Postgres, Row, postgres::PgRow};
use uuid::Uuid;

use crate::repository::{InventoryRepository, OrderRepository, PaymentRepository, merge_lines};
use crate::{Result, StoreError};

const ORDER_COLUMNS: &str = "id, correlation_id, customer_id, customer_email, customer_name, \
     items, total_cents, status, shipping_address, notes, created_at, updated_at";

const EVENT_COLUMNS: &str = "id, order_id, correlation_id, event_type, payload, created_at";

const PRODUCT_COLUMNS: &str =
    "id, sku, name, price_cents, quantity_available, quantity_reserved, is_active";

/// PostgreSQL-backed saga store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects a pool to `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_order(row: PgRow) -> Result<Order> {
        let status: String = row.try_get("status")?;
        Ok(Order {
            id: OrderId::from_uuid(row.try_get("id")?),
            correlation_id: CorrelationId::from_uuid(row.try_get("correlation_id")?),
            customer: CustomerInfo {
                id: CustomerId::from_uuid(row.try_get("customer_id")?),
                email: row.try_get("customer_email")?,
                name: row.try_get("customer_name")?,
            },
            items: serde_json::from_value(row.try_get("items")?)?,
            total_amount: Money::from_cents(row.try_get("total_cents")?),
            status: status.parse().map_err(StoreError::Corrupt)?,
            shipping_address: row.try_get("shipping_address")?,
            notes: row.try_get("notes")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_event(row: PgRow) -> Result<OrderEventRecord> {
        let event_type: String = row.try_get("event_type")?;
        Ok(OrderEventRecord {
            id: row.try_get("id")?,
            order_id: OrderId::from_uuid(row.try_get("order_id")?),
            correlation_id: CorrelationId::from_uuid(row.try_get("correlation_id")?),
            event_type: event_type.parse().map_err(StoreError::Corrupt)?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_product(row: PgRow) -> Result<Product> {
        Ok(Product {
            id: ProductId::from_uuid(row.try_get("id")?),
            sku: row.try_get("sku")?,
            name: row.try_get("name")?,
            price: Money::from_cents(row.try_get("price_cents")?),
            quantity_available: from_db(row.try_get("quantity_available")?)?,
            quantity_reserved: from_db(row.try_get("quantity_reserved")?)?,
            is_active: row.try_get("is_active")?,
        })
    }

    fn row_to_reservation(row: PgRow) -> Result<Reservation> {
        let status: String = row.try_get("status")?;
        Ok(Reservation {
            id: row.try_get("id")?,
            order_id: OrderId::from_uuid(row.try_get("order_id")?),
            product_id: ProductId::from_uuid(row.try_get("product_id")?),
            quantity: from_db(row.try_get("quantity")?)?,
            status: status.parse().map_err(StoreError::Corrupt)?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_transaction(row: PgRow) -> Result<Transaction> {
        let status: String = row.try_get("status")?;
        Ok(Transaction {
            id: row.try_get("id")?,
            order_id: OrderId::from_uuid(row.try_get("order_id")?),
            correlation_id: CorrelationId::from_uuid(row.try_get("correlation_id")?),
            amount: Money::from_cents(row.try_get("amount_cents")?),
            status: status.parse().map_err(StoreError::Corrupt)?,
            gateway_reference: row.try_get("gateway_reference")?,
            gateway_response: row.try_get("gateway_response")?,
            processed_at: row.try_get("processed_at")?,
        })
    }

    async fn insert_event<'c, E>(executor: E, event: &OrderEventRecord) -> Result<()>
    where
        E: sqlx::Executor<'c, Database = Postgres>,
    {
        sqlx::query(
            r#"
            INSERT INTO order_events (id, order_id, correlation_id, event_type, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.id)
        .bind(event.order_id.as_uuid())
        .bind(event.correlation_id.as_uuid())
        .bind(event.event_type.as_str())
        .bind(&event.payload)
        .bind(event.created_at)
        .execute(executor)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some("order_events_order_id_fkey")
            {
                return StoreError::OrderNotFound(event.order_id);
            }
            StoreError::Database(e)
        })?;
        Ok(())
    }
}

fn to_db(quantity: u32) -> Result<i32> {
    i32::try_from(quantity)
        .map_err(|_| StoreError::Corrupt(format!("quantity {quantity} out of range")))
}

fn from_db(value: i32) -> Result<u32> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative quantity {value}")))
}

#[async_trait]
impl OrderRepository for PostgresStore {
    async fn insert_order(&self, order: &Order, created: OrderEventRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO orders (id, correlation_id, customer_id, customer_email,
                                customer_name, items, total_cents, status,
                                shipping_address, notes, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(order.id.as_uuid())
        .bind(order.correlation_id.as_uuid())
        .bind(order.customer.id.as_uuid())
        .bind(&order.customer.email)
        .bind(&order.customer.name)
        .bind(serde_json::to_value(&order.items)?)
        .bind(order.total_amount.cents())
        .bind(order.status.as_str())
        .bind(&order.shipping_address)
        .bind(&order.notes)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some("orders_pkey")
            {
                return StoreError::DuplicateOrder(order.id);
            }
            StoreError::Database(e)
        })?;

        Self::insert_event(&mut *tx, &created).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>> {
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
            .bind(order_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_order).transpose()
    }

    async fn find_by_correlation(&self, correlation_id: CorrelationId) -> Result<Option<Order>> {
        let row = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE correlation_id = $1"
        ))
        .bind(correlation_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::row_to_order).transpose()
    }

    async fn transition_status(
        &self,
        order_id: OrderId,
        from: &[OrderStatus],
        to: OrderStatus,
        events: Vec<OrderEventRecord>,
    ) -> Result<Option<Order>> {
        let from: Vec<&str> = from.iter().map(|s| s.as_str()).collect();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE orders SET status = $1, updated_at = NOW()
            WHERE id = $2 AND status = ANY($3)
            RETURNING {ORDER_COLUMNS}
            "#
        ))
        .bind(to.as_str())
        .bind(order_id.as_uuid())
        .bind(&from)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let order = Self::row_to_order(row)?;

        for event in &events {
            Self::insert_event(&mut *tx, event).await?;
        }

        tx.commit().await?;
        Ok(Some(order))
    }

    async fn append_event(&self, event: OrderEventRecord) -> Result<()> {
        Self::insert_event(&self.pool, &event).await
    }

    async fn events_for_order(&self, order_id: OrderId) -> Result<Vec<OrderEventRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM order_events WHERE order_id = $1 ORDER BY created_at, seq"
        ))
        .bind(order_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn events_for_correlation(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<Vec<OrderEventRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM order_events \
             WHERE correlation_id = $1 ORDER BY created_at, seq"
        ))
        .bind(correlation_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_event).collect()
    }
}

#[async_trait]
impl InventoryRepository for PostgresStore {
    async fn upsert_product(&self, product: &Product) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO products (id, sku, name, price_cents, quantity_available,
                                  quantity_reserved, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                sku = EXCLUDED.sku,
                name = EXCLUDED.name,
                price_cents = EXCLUDED.price_cents,
                quantity_available = EXCLUDED.quantity_available,
                quantity_reserved = EXCLUDED.quantity_reserved,
                is_active = EXCLUDED.is_active
            "#,
        )
        .bind(product.id.as_uuid())
        .bind(&product.sku)
        .bind(&product.name)
        .bind(product.price.cents())
        .bind(to_db(product.quantity_available)?)
        .bind(to_db(product.quantity_reserved)?)
        .bind(product.is_active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_product(&self, product_id: ProductId) -> Result<Option<Product>> {
        let row = sqlx::query(&format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = $1"))
            .bind(product_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_product).transpose()
    }

    async fn reserve_all(
        &self,
        order_id: OrderId,
        lines: &[StockRequest],
    ) -> Result<ReservationOutcome> {
        let lines = merge_lines(lines);
        let ids: Vec<Uuid> = lines.iter().map(|l| l.product_id.as_uuid()).collect();
        let mut tx = self.pool.begin().await?;

        // Row locks in id order so concurrent reservations queue instead of deadlocking.
        let rows = sqlx::query(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE id = ANY($1) ORDER BY id FOR UPDATE"
        ))
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await?;
        let products: HashMap<ProductId, Product> = rows
            .into_iter()
            .map(|row| Self::row_to_product(row).map(|p| (p.id, p)))
            .collect::<Result<_>>()?;

        let existing = sqlx::query(
            r#"
            SELECT r.product_id, r.quantity, p.price_cents
            FROM reservations r JOIN products p ON p.id = r.product_id
            WHERE r.order_id = $1 AND r.status <> 'RELEASED'
            ORDER BY r.created_at
            "#,
        )
        .bind(order_id.as_uuid())
        .fetch_all(&mut *tx)
        .await?;
        if !existing.is_empty() {
            let lines = existing
                .into_iter()
                .map(|row| -> Result<ReservedLine> {
                    let quantity = from_db(row.try_get("quantity")?)?;
                    let unit_price = Money::from_cents(row.try_get("price_cents")?);
                    Ok(ReservedLine {
                        product_id: ProductId::from_uuid(row.try_get("product_id")?),
                        quantity,
                        unit_price,
                        line_total: unit_price.times(quantity),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            tx.commit().await?;
            return Ok(ReservationOutcome::Reserved(lines));
        }

        let mut rejection = None;
        for line in &lines {
            rejection = match products.get(&line.product_id) {
                None => Some(ReservationRejection::ProductNotFound {
                    product_id: line.product_id,
                }),
                Some(p) if !p.is_active => Some(ReservationRejection::ProductInactive {
                    product_id: line.product_id,
                }),
                Some(p) if p.available() < line.quantity => {
                    Some(ReservationRejection::InsufficientStock {
                        product_id: line.product_id,
                        requested: line.quantity,
                        available: p.available(),
                    })
                }
                Some(_) => None,
            };
            if rejection.is_some() {
                break;
            }
        }
        if let Some(rejection) = rejection {
            tx.rollback().await?;
            return Ok(ReservationOutcome::Rejected(rejection));
        }

        let mut reserved = Vec::with_capacity(lines.len());
        for line in &lines {
            let quantity = to_db(line.quantity)?;
            sqlx::query(
                "UPDATE products SET quantity_reserved = quantity_reserved + $1 WHERE id = $2",
            )
            .bind(quantity)
            .bind(line.product_id.as_uuid())
            .execute(&mut *tx)
            .await?;

            let reservation = Reservation::new(order_id, line.product_id, line.quantity);
            sqlx::query(
                r#"
                INSERT INTO reservations (id, order_id, product_id, quantity, status, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(reservation.id)
            .bind(order_id.as_uuid())
            .bind(line.product_id.as_uuid())
            .bind(quantity)
            .bind(reservation.status.as_str())
            .bind(reservation.created_at)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO stock_movements (product_id, order_id, kind, quantity) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(line.product_id.as_uuid())
            .bind(order_id.as_uuid())
            .bind(MovementKind::Reserve.as_str())
            .bind(quantity)
            .execute(&mut *tx)
            .await?;

            let unit_price = products
                .get(&line.product_id)
                .map(|p| p.price)
                .unwrap_or_default();
            reserved.push(ReservedLine {
                product_id: line.product_id,
                quantity: line.quantity,
                unit_price,
                line_total: unit_price.times(line.quantity),
            });
        }

        tx.commit().await?;
        Ok(ReservationOutcome::Reserved(reserved))
    }

    async fn reservations_for_order(&self, order_id: OrderId) -> Result<Vec<Reservation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, order_id, product_id, quantity, status, created_at
            FROM reservations WHERE order_id = $1 ORDER BY created_at
            "#,
        )
        .bind(order_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_reservation).collect()
    }

    async fn confirm_reservations(&self, order_id: OrderId) -> Result<usize> {
        let result = sqlx::query(
            "UPDATE reservations SET status = 'CONFIRMED' \
             WHERE order_id = $1 AND status = 'RESERVED'",
        )
        .bind(order_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn release_reservations(&self, order_id: OrderId) -> Result<usize> {
        let mut tx = self.pool.begin().await?;

        let released = sqlx::query(
            r#"
            UPDATE reservations SET status = 'RELEASED'
            WHERE order_id = $1 AND status = 'RESERVED'
            RETURNING product_id, quantity
            "#,
        )
        .bind(order_id.as_uuid())
        .fetch_all(&mut *tx)
        .await?;

        for row in &released {
            let product_id: Uuid = row.try_get("product_id")?;
            let quantity: i32 = row.try_get("quantity")?;

            sqlx::query(
                "UPDATE products SET quantity_reserved = GREATEST(quantity_reserved - $1, 0) \
                 WHERE id = $2",
            )
            .bind(quantity)
            .bind(product_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO stock_movements (product_id, order_id, kind, quantity) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(product_id)
            .bind(order_id.as_uuid())
            .bind(MovementKind::Release.as_str())
            .bind(quantity)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(released.len())
    }

    async fn stock_movements(&self, product_id: ProductId) -> Result<Vec<StockMovement>> {
        let rows = sqlx::query(
            r#"
            SELECT product_id, order_id, kind, quantity, created_at
            FROM stock_movements WHERE product_id = $1 ORDER BY id
            "#,
        )
        .bind(product_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<StockMovement> {
                let kind: String = row.try_get("kind")?;
                Ok(StockMovement {
                    product_id: ProductId::from_uuid(row.try_get("product_id")?),
                    order_id: OrderId::from_uuid(row.try_get("order_id")?),
                    kind: kind.parse().map_err(StoreError::Corrupt)?,
                    quantity: from_db(row.try_get("quantity")?)?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl PaymentRepository for PostgresStore {
    async fn record_transaction(&self, transaction: &Transaction) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transactions (id, order_id, correlation_id, amount_cents, status,
                                      gateway_reference, gateway_response, processed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(transaction.id)
        .bind(transaction.order_id.as_uuid())
        .bind(transaction.correlation_id.as_uuid())
        .bind(transaction.amount.cents())
        .bind(transaction.status.as_str())
        .bind(&transaction.gateway_reference)
        .bind(&transaction.gateway_response)
        .bind(transaction.processed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn transactions_for_order(&self, order_id: OrderId) -> Result<Vec<Transaction>> {
        let rows = sqlx::query(
            r#"
            SELECT id, order_id, correlation_id, amount_cents, status, gateway_reference,
                   gateway_response, processed_at
            FROM transactions WHERE order_id = $1 ORDER BY processed_at
            "#,
        )
        .bind(order_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_transaction).collect()
    }
}
