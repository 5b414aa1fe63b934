//! Unit of work: a transaction handle exposing every repository operation.

use async_trait::async_trait;
use common::{CouponId, OrderId, ProductId, UserCouponId, UserId};
use domain::{
    Account, BalanceLedgerEntry, CartLine, Coupon, NewOrder, NewUserCoupon, Order, OrderCoupon,
    OrderNumber, Payment, Product, StockLedgerEntry, UserCoupon,
};

use crate::Result;

/// Names of the unique constraints callers may need to recognise.
pub mod constraints {
    pub const ORDER_IDEMPOTENCY_KEY: &str = "orders_idempotency_key_key";
    pub const ORDER_NUMBER: &str = "orders_order_number_key";
    pub const USER_COUPON_GRANT: &str = "user_coupons_grant_key";
    pub const PAYMENT: &str = "payments_pkey";
}

/// Opens transactions.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Transaction>>;
}

/// One local transaction.
///
/// Writes become visible to other transactions only after [`Transaction::commit`].
/// Dropping the handle without committing rolls everything back and releases
/// row locks taken through `lock_*`.
#[async_trait]
pub trait Transaction: Send {
    // Orders
    async fn find_order(&mut self, id: OrderId) -> Result<Option<Order>>;
    async fn find_order_by_idempotency_key(&mut self, key: &str) -> Result<Option<Order>>;
    async fn find_order_by_number(&mut self, number: &OrderNumber) -> Result<Option<Order>>;
    async fn orders_for_user(&mut self, user_id: UserId) -> Result<Vec<Order>>;
    /// Inserts a pending order and assigns its id.
    async fn insert_order(&mut self, order: NewOrder) -> Result<Order>;
    async fn update_order(&mut self, order: &Order) -> Result<()>;

    // Payments
    async fn insert_payment(&mut self, payment: &Payment) -> Result<()>;
    async fn find_payment(&mut self, order_id: OrderId) -> Result<Option<Payment>>;
    async fn update_payment(&mut self, payment: &Payment) -> Result<()>;

    // Accounts
    async fn find_account(&mut self, id: UserId) -> Result<Option<Account>>;
    /// Reads the account and holds an exclusive row lock until the transaction ends.
    async fn lock_account(&mut self, id: UserId) -> Result<Option<Account>>;
    async fn update_account(&mut self, account: &Account) -> Result<()>;

    // Products
    async fn find_product(&mut self, id: ProductId) -> Result<Option<Product>>;
    /// Optimistic write: fails with `VersionConflict` unless the stored version
    /// equals `product.version`, then bumps the version on both sides.
    async fn update_product(&mut self, product: &mut Product) -> Result<()>;

    // Carts
    async fn cart_lines(&mut self, user_id: UserId) -> Result<Vec<CartLine>>;
    async fn add_cart_line(&mut self, line: &CartLine) -> Result<()>;
    async fn clear_cart(&mut self, user_id: UserId) -> Result<()>;

    // Coupons
    async fn find_coupon(&mut self, id: CouponId) -> Result<Option<Coupon>>;
    async fn lock_coupon(&mut self, id: CouponId) -> Result<Option<Coupon>>;
    async fn update_coupon(&mut self, coupon: &mut Coupon) -> Result<()>;

    // User coupons
    async fn find_user_coupon(&mut self, id: UserCouponId) -> Result<Option<UserCoupon>>;
    async fn find_user_coupon_by_grant(
        &mut self,
        coupon_id: CouponId,
        user_id: UserId,
        grant_ordinal: u32,
    ) -> Result<Option<UserCoupon>>;
    async fn count_user_coupons(&mut self, coupon_id: CouponId, user_id: UserId) -> Result<u32>;
    /// Fails with `Duplicate` when the (coupon, user, ordinal) grant exists.
    async fn insert_user_coupon(&mut self, new: NewUserCoupon) -> Result<UserCoupon>;
    async fn update_user_coupon(&mut self, user_coupon: &UserCoupon) -> Result<()>;

    // Order coupons
    /// Returns false when the record was already attached.
    async fn attach_order_coupon(&mut self, record: &OrderCoupon) -> Result<bool>;
    async fn find_order_coupon(&mut self, order_id: OrderId) -> Result<Option<OrderCoupon>>;

    // Ledgers
    async fn append_stock_ledger(&mut self, entry: &StockLedgerEntry) -> Result<()>;
    async fn append_balance_ledger(&mut self, entry: &BalanceLedgerEntry) -> Result<()>;
    async fn stock_ledger_for_order(&mut self, order_id: OrderId) -> Result<Vec<StockLedgerEntry>>;
    async fn balance_ledger_for_order(
        &mut self,
        order_id: OrderId,
    ) -> Result<Vec<BalanceLedgerEntry>>;

    async fn commit(self: Box<Self>) -> Result<()>;
}
