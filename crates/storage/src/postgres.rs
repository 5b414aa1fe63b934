use async_trait::async_trait;
use common::{CouponId, OrderId, ProductId, UserCouponId, UserId};
use domain::{
    Account, BalanceLedgerEntry, CartLine, Coupon, Money, NewOrder, NewUserCoupon, Order,
    OrderCoupon, OrderItem, OrderNumber, Payment, Product, StockLedgerEntry, UserCoupon,
};
use sqlx::{PgPool, Postgres, Row, postgres::PgRow};

use crate::uow::{Transaction, UnitOfWork};
use crate::{Result, StoreError};

const ORDER_COLUMNS: &str = "id, order_number, user_id, total_amount, discount_amount, \
     final_amount, status, user_coupon_id, idempotency_key, ordered_at, paid_at, cancelled_at, \
     cancellation_reason";

const COUPON_COLUMNS: &str = "id, code, name, kind, discount_value, minimum_order_amount, \
     maximum_discount_amount, total_quantity, issued_quantity, max_issue_per_user, \
     issue_start_at, issue_end_at, valid_from, valid_until, status, version";

const USER_COUPON_COLUMNS: &str =
    "id, user_id, coupon_id, grant_ordinal, status, issued_at, used_at, used_order_id";

/// PostgreSQL-backed unit of work.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies every migration under `migrations/`.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl UnitOfWork for PostgresStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction { tx }))
    }
}

/// One `sqlx` transaction. Dropping it rolls back.
pub struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

fn to_u32(value: i32, column: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} = {value}")))
}

fn to_i32(value: u32) -> Result<i32> {
    i32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{value} overflows INTEGER")))
}

fn parsed<T: std::str::FromStr>(raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn optional_money(row: &PgRow, column: &str) -> Result<Option<Money>> {
    Ok(row.try_get::<Option<i64>, _>(column)?.map(Money::new))
}

fn row_to_account(row: PgRow) -> Result<Account> {
    Ok(Account {
        id: UserId::new(row.try_get("id")?),
        name: row.try_get("name")?,
        balance: Money::new(row.try_get("balance")?),
    })
}

fn row_to_product(row: PgRow) -> Result<Product> {
    Ok(Product {
        id: ProductId::new(row.try_get("id")?),
        name: row.try_get("name")?,
        price: Money::new(row.try_get("price")?),
        stock: to_u32(row.try_get("stock")?, "stock")?,
        version: row.try_get("version")?,
    })
}

fn row_to_coupon(row: PgRow) -> Result<Coupon> {
    Ok(Coupon {
        id: CouponId::new(row.try_get("id")?),
        code: row.try_get("code")?,
        name: row.try_get("name")?,
        kind: parsed(row.try_get::<&str, _>("kind")?)?,
        discount_value: row.try_get("discount_value")?,
        minimum_order_amount: optional_money(&row, "minimum_order_amount")?,
        maximum_discount_amount: optional_money(&row, "maximum_discount_amount")?,
        total_quantity: to_u32(row.try_get("total_quantity")?, "total_quantity")?,
        issued_quantity: to_u32(row.try_get("issued_quantity")?, "issued_quantity")?,
        max_issue_per_user: to_u32(row.try_get("max_issue_per_user")?, "max_issue_per_user")?,
        issue_start_at: row.try_get("issue_start_at")?,
        issue_end_at: row.try_get("issue_end_at")?,
        valid_from: row.try_get("valid_from")?,
        valid_until: row.try_get("valid_until")?,
        status: parsed(row.try_get::<&str, _>("status")?)?,
        version: row.try_get("version")?,
    })
}

fn row_to_user_coupon(row: PgRow) -> Result<UserCoupon> {
    Ok(UserCoupon {
        id: UserCouponId::new(row.try_get("id")?),
        user_id: UserId::new(row.try_get("user_id")?),
        coupon_id: CouponId::new(row.try_get("coupon_id")?),
        grant_ordinal: to_u32(row.try_get("grant_ordinal")?, "grant_ordinal")?,
        status: parsed(row.try_get::<&str, _>("status")?)?,
        issued_at: row.try_get("issued_at")?,
        used_at: row.try_get("used_at")?,
        used_order_id: row.try_get::<Option<i64>, _>("used_order_id")?.map(OrderId::new),
    })
}

fn row_to_payment(row: PgRow) -> Result<Payment> {
    Ok(Payment {
        order_id: OrderId::new(row.try_get("order_id")?),
        amount: Money::new(row.try_get("amount")?),
        status: parsed(row.try_get::<&str, _>("status")?)?,
        paid_at: row.try_get("paid_at")?,
    })
}

fn row_to_order_coupon(row: PgRow) -> Result<OrderCoupon> {
    Ok(OrderCoupon {
        order_id: OrderId::new(row.try_get("order_id")?),
        user_coupon_id: UserCouponId::new(row.try_get("user_coupon_id")?),
        discount_amount: Money::new(row.try_get("discount_amount")?),
        applied_at: row.try_get("applied_at")?,
    })
}

fn row_to_stock_entry(row: PgRow) -> Result<StockLedgerEntry> {
    Ok(StockLedgerEntry {
        product_id: ProductId::new(row.try_get("product_id")?),
        order_id: row.try_get::<Option<i64>, _>("order_id")?.map(OrderId::new),
        movement: parsed(row.try_get::<&str, _>("movement")?)?,
        quantity: to_u32(row.try_get("quantity")?, "quantity")?,
        stock_before: to_u32(row.try_get("stock_before")?, "stock_before")?,
        stock_after: to_u32(row.try_get("stock_after")?, "stock_after")?,
        reason: row.try_get("reason")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_balance_entry(row: PgRow) -> Result<BalanceLedgerEntry> {
    Ok(BalanceLedgerEntry {
        user_id: UserId::new(row.try_get("user_id")?),
        order_id: row.try_get::<Option<i64>, _>("order_id")?.map(OrderId::new),
        movement: parsed(row.try_get::<&str, _>("movement")?)?,
        amount: Money::new(row.try_get("amount")?),
        balance_before: Money::new(row.try_get("balance_before")?),
        balance_after: Money::new(row.try_get("balance_after")?),
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
    })
}

impl PgTransaction {
    async fn load_order(&mut self, row: PgRow) -> Result<Order> {
        let id = OrderId::new(row.try_get("id")?);
        let item_rows = sqlx::query(
            "SELECT product_id, quantity, unit_price FROM order_items WHERE order_id = $1 ORDER BY line_no",
        )
        .bind(id.value())
        .fetch_all(&mut *self.tx)
        .await?;
        let items = item_rows
            .into_iter()
            .map(|r| {
                Ok(OrderItem {
                    product_id: ProductId::new(r.try_get("product_id")?),
                    quantity: to_u32(r.try_get("quantity")?, "quantity")?,
                    unit_price: Money::new(r.try_get("unit_price")?),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Order {
            id,
            order_number: parsed(row.try_get::<&str, _>("order_number")?)?,
            user_id: UserId::new(row.try_get("user_id")?),
            items,
            total_amount: Money::new(row.try_get("total_amount")?),
            discount_amount: Money::new(row.try_get("discount_amount")?),
            final_amount: Money::new(row.try_get("final_amount")?),
            status: parsed(row.try_get::<&str, _>("status")?)?,
            user_coupon_id: row
                .try_get::<Option<i64>, _>("user_coupon_id")?
                .map(UserCouponId::new),
            idempotency_key: row.try_get("idempotency_key")?,
            ordered_at: row.try_get("ordered_at")?,
            paid_at: row.try_get("paid_at")?,
            cancelled_at: row.try_get("cancelled_at")?,
            cancellation_reason: row.try_get("cancellation_reason")?,
        })
    }

    async fn order_where(&mut self, filter: &str, value: &str) -> Result<Option<Order>> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE {filter} = $1");
        let row = sqlx::query(&sql)
            .bind(value)
            .fetch_optional(&mut *self.tx)
            .await?;
        match row {
            Some(row) => Ok(Some(self.load_order(row).await?)),
            None => Ok(None),
        }
    }

    async fn account_row(&mut self, id: UserId, for_update: bool) -> Result<Option<Account>> {
        let sql = if for_update {
            "SELECT id, name, balance FROM accounts WHERE id = $1 FOR UPDATE"
        } else {
            "SELECT id, name, balance FROM accounts WHERE id = $1"
        };
        sqlx::query(sql)
            .bind(id.value())
            .fetch_optional(&mut *self.tx)
            .await?
            .map(row_to_account)
            .transpose()
    }

    async fn coupon_row(&mut self, id: CouponId, for_update: bool) -> Result<Option<Coupon>> {
        let lock = if for_update { " FOR UPDATE" } else { "" };
        let sql = format!("SELECT {COUPON_COLUMNS} FROM coupons WHERE id = $1{lock}");
        sqlx::query(&sql)
            .bind(id.value())
            .fetch_optional(&mut *self.tx)
            .await?
            .map(row_to_coupon)
            .transpose()
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn find_order(&mut self, id: OrderId) -> Result<Option<Order>> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.value())
            .fetch_optional(&mut *self.tx)
            .await?;
        match row {
            Some(row) => Ok(Some(self.load_order(row).await?)),
            None => Ok(None),
        }
    }

    async fn find_order_by_idempotency_key(&mut self, key: &str) -> Result<Option<Order>> {
        self.order_where("idempotency_key", key).await
    }

    async fn find_order_by_number(&mut self, number: &OrderNumber) -> Result<Option<Order>> {
        self.order_where("order_number", number.as_str()).await
    }

    async fn orders_for_user(&mut self, user_id: UserId) -> Result<Vec<Order>> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE user_id = $1 ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(user_id.value())
            .fetch_all(&mut *self.tx)
            .await?;
        let mut orders = Vec::with_capacity(rows.len());
        for row in rows {
            orders.push(self.load_order(row).await?);
        }
        Ok(orders)
    }

    async fn insert_order(&mut self, order: NewOrder) -> Result<Order> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO orders (order_number, user_id, total_amount, discount_amount, final_amount,
                                status, user_coupon_id, idempotency_key, ordered_at)
            VALUES ($1, $2, $3, $4, $5, 'PENDING', $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(order.order_number.as_str())
        .bind(order.user_id.value())
        .bind(order.amounts.total().amount())
        .bind(order.amounts.discount().amount())
        .bind(order.amounts.final_amount().amount())
        .bind(order.user_coupon_id.map(|id| id.value()))
        .bind(&order.idempotency_key)
        .bind(order.ordered_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(StoreError::from_db)?;

        for (line_no, item) in order.items.iter().enumerate() {
            sqlx::query(
                "INSERT INTO order_items (order_id, line_no, product_id, quantity, unit_price) VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(id)
            .bind(line_no as i32)
            .bind(item.product_id.value())
            .bind(to_i32(item.quantity)?)
            .bind(item.unit_price.amount())
            .execute(&mut *self.tx)
            .await?;
        }

        Ok(Order::from_new(OrderId::new(id), order))
    }

    async fn update_order(&mut self, order: &Order) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = $2, paid_at = $3, cancelled_at = $4, cancellation_reason = $5
            WHERE id = $1
            "#,
        )
        .bind(order.id.value())
        .bind(order.status.as_str())
        .bind(order.paid_at)
        .bind(order.cancelled_at)
        .bind(&order.cancellation_reason)
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::missing("Order", order.id));
        }
        Ok(())
    }

    async fn insert_payment(&mut self, payment: &Payment) -> Result<()> {
        sqlx::query("INSERT INTO payments (order_id, amount, status, paid_at) VALUES ($1, $2, $3, $4)")
            .bind(payment.order_id.value())
            .bind(payment.amount.amount())
            .bind(payment.status.as_str())
            .bind(payment.paid_at)
            .execute(&mut *self.tx)
            .await
            .map_err(StoreError::from_db)?;
        Ok(())
    }

    async fn find_payment(&mut self, order_id: OrderId) -> Result<Option<Payment>> {
        sqlx::query("SELECT order_id, amount, status, paid_at FROM payments WHERE order_id = $1")
            .bind(order_id.value())
            .fetch_optional(&mut *self.tx)
            .await?
            .map(row_to_payment)
            .transpose()
    }

    async fn update_payment(&mut self, payment: &Payment) -> Result<()> {
        let result = sqlx::query("UPDATE payments SET status = $2, paid_at = $3 WHERE order_id = $1")
            .bind(payment.order_id.value())
            .bind(payment.status.as_str())
            .bind(payment.paid_at)
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::missing("Payment", payment.order_id));
        }
        Ok(())
    }

    async fn find_account(&mut self, id: UserId) -> Result<Option<Account>> {
        self.account_row(id, false).await
    }

    async fn lock_account(&mut self, id: UserId) -> Result<Option<Account>> {
        self.account_row(id, true).await
    }

    async fn update_account(&mut self, account: &Account) -> Result<()> {
        let result = sqlx::query("UPDATE accounts SET balance = $2 WHERE id = $1")
            .bind(account.id.value())
            .bind(account.balance.amount())
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::missing("Account", account.id));
        }
        Ok(())
    }

    async fn find_product(&mut self, id: ProductId) -> Result<Option<Product>> {
        sqlx::query("SELECT id, name, price, stock, version FROM products WHERE id = $1")
            .bind(id.value())
            .fetch_optional(&mut *self.tx)
            .await?
            .map(row_to_product)
            .transpose()
    }

    async fn update_product(&mut self, product: &mut Product) -> Result<()> {
        let result = sqlx::query(
            "UPDATE products SET stock = $2, version = version + 1 WHERE id = $1 AND version = $3",
        )
        .bind(product.id.value())
        .bind(to_i32(product.stock)?)
        .bind(product.version)
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::conflict("Product", product.id));
        }
        product.version += 1;
        Ok(())
    }

    async fn cart_lines(&mut self, user_id: UserId) -> Result<Vec<CartLine>> {
        let rows = sqlx::query(
            "SELECT user_id, product_id, quantity FROM cart_lines WHERE user_id = $1 ORDER BY product_id",
        )
        .bind(user_id.value())
        .fetch_all(&mut *self.tx)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(CartLine {
                    user_id: UserId::new(row.try_get("user_id")?),
                    product_id: ProductId::new(row.try_get("product_id")?),
                    quantity: to_u32(row.try_get("quantity")?, "quantity")?,
                })
            })
            .collect()
    }

    async fn add_cart_line(&mut self, line: &CartLine) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cart_lines (user_id, product_id, quantity) VALUES ($1, $2, $3)
            ON CONFLICT (user_id, product_id)
            DO UPDATE SET quantity = cart_lines.quantity + EXCLUDED.quantity
            "#,
        )
        .bind(line.user_id.value())
        .bind(line.product_id.value())
        .bind(to_i32(line.quantity)?)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn clear_cart(&mut self, user_id: UserId) -> Result<()> {
        sqlx::query("DELETE FROM cart_lines WHERE user_id = $1")
            .bind(user_id.value())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn find_coupon(&mut self, id: CouponId) -> Result<Option<Coupon>> {
        self.coupon_row(id, false).await
    }

    async fn lock_coupon(&mut self, id: CouponId) -> Result<Option<Coupon>> {
        self.coupon_row(id, true).await
    }

    async fn update_coupon(&mut self, coupon: &mut Coupon) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE coupons SET issued_quantity = $2, status = $3, version = version + 1
            WHERE id = $1 AND version = $4
            "#,
        )
        .bind(coupon.id.value())
        .bind(to_i32(coupon.issued_quantity)?)
        .bind(coupon.status.as_str())
        .bind(coupon.version)
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::conflict("Coupon", coupon.id));
        }
        coupon.version += 1;
        Ok(())
    }

    async fn find_user_coupon(&mut self, id: UserCouponId) -> Result<Option<UserCoupon>> {
        let sql = format!("SELECT {USER_COUPON_COLUMNS} FROM user_coupons WHERE id = $1");
        sqlx::query(&sql)
            .bind(id.value())
            .fetch_optional(&mut *self.tx)
            .await?
            .map(row_to_user_coupon)
            .transpose()
    }

    async fn find_user_coupon_by_grant(
        &mut self,
        coupon_id: CouponId,
        user_id: UserId,
        grant_ordinal: u32,
    ) -> Result<Option<UserCoupon>> {
        let sql = format!(
            "SELECT {USER_COUPON_COLUMNS} FROM user_coupons \
             WHERE coupon_id = $1 AND user_id = $2 AND grant_ordinal = $3"
        );
        sqlx::query(&sql)
            .bind(coupon_id.value())
            .bind(user_id.value())
            .bind(to_i32(grant_ordinal)?)
            .fetch_optional(&mut *self.tx)
            .await?
            .map(row_to_user_coupon)
            .transpose()
    }

    async fn count_user_coupons(&mut self, coupon_id: CouponId, user_id: UserId) -> Result<u32> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM user_coupons WHERE coupon_id = $1 AND user_id = $2",
        )
        .bind(coupon_id.value())
        .bind(user_id.value())
        .fetch_one(&mut *self.tx)
        .await?;
        u32::try_from(count).map_err(|_| StoreError::Corrupt(format!("count = {count}")))
    }

    async fn insert_user_coupon(&mut self, new: NewUserCoupon) -> Result<UserCoupon> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO user_coupons (user_id, coupon_id, grant_ordinal, status, issued_at)
            VALUES ($1, $2, $3, 'ISSUED', $4)
            RETURNING id
            "#,
        )
        .bind(new.user_id.value())
        .bind(new.coupon_id.value())
        .bind(to_i32(new.grant_ordinal)?)
        .bind(new.issued_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(StoreError::from_db)?;
        Ok(UserCoupon::from_new(UserCouponId::new(id), new))
    }

    async fn update_user_coupon(&mut self, user_coupon: &UserCoupon) -> Result<()> {
        let result = sqlx::query(
            "UPDATE user_coupons SET status = $2, used_at = $3, used_order_id = $4 WHERE id = $1",
        )
        .bind(user_coupon.id.value())
        .bind(user_coupon.status.as_str())
        .bind(user_coupon.used_at)
        .bind(user_coupon.used_order_id.map(|id| id.value()))
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::missing("UserCoupon", user_coupon.id));
        }
        Ok(())
    }

    async fn attach_order_coupon(&mut self, record: &OrderCoupon) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO order_coupons (order_id, user_coupon_id, discount_amount, applied_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (order_id, user_coupon_id) DO NOTHING
            "#,
        )
        .bind(record.order_id.value())
        .bind(record.user_coupon_id.value())
        .bind(record.discount_amount.amount())
        .bind(record.applied_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_order_coupon(&mut self, order_id: OrderId) -> Result<Option<OrderCoupon>> {
        sqlx::query(
            "SELECT order_id, user_coupon_id, discount_amount, applied_at FROM order_coupons WHERE order_id = $1",
        )
        .bind(order_id.value())
        .fetch_optional(&mut *self.tx)
        .await?
        .map(row_to_order_coupon)
        .transpose()
    }

    async fn append_stock_ledger(&mut self, entry: &StockLedgerEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO stock_ledger (product_id, order_id, movement, quantity, stock_before,
                                      stock_after, reason, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.product_id.value())
        .bind(entry.order_id.map(|id| id.value()))
        .bind(entry.movement.as_str())
        .bind(to_i32(entry.quantity)?)
        .bind(to_i32(entry.stock_before)?)
        .bind(to_i32(entry.stock_after)?)
        .bind(&entry.reason)
        .bind(entry.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn append_balance_ledger(&mut self, entry: &BalanceLedgerEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO balance_ledger (user_id, order_id, movement, amount, balance_before,
                                        balance_after, description, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.user_id.value())
        .bind(entry.order_id.map(|id| id.value()))
        .bind(entry.movement.as_str())
        .bind(entry.amount.amount())
        .bind(entry.balance_before.amount())
        .bind(entry.balance_after.amount())
        .bind(&entry.description)
        .bind(entry.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn stock_ledger_for_order(&mut self, order_id: OrderId) -> Result<Vec<StockLedgerEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT product_id, order_id, movement, quantity, stock_before, stock_after, reason, created_at
            FROM stock_ledger WHERE order_id = $1 ORDER BY id
            "#,
        )
        .bind(order_id.value())
        .fetch_all(&mut *self.tx)
        .await?;
        rows.into_iter().map(row_to_stock_entry).collect()
    }

    async fn balance_ledger_for_order(
        &mut self,
        order_id: OrderId,
    ) -> Result<Vec<BalanceLedgerEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, order_id, movement, amount, balance_before, balance_after, description, created_at
            FROM balance_ledger WHERE order_id = $1 ORDER BY id
            "#,
        )
        .bind(order_id.value())
        .fetch_all(&mut *self.tx)
        .await?;
        rows.into_iter().map(row_to_balance_entry).collect()
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
