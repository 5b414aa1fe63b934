use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use common::{CouponId, OrderId, ProductId, UserCouponId, UserId};
use domain::{
    Account, BalanceLedgerEntry, CartLine, Coupon, NewOrder, NewUserCoupon, Order, OrderCoupon,
    OrderNumber, Payment, Product, StockLedgerEntry, UserCoupon,
};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::uow::{Transaction, UnitOfWork, constraints};
use crate::{Result, StoreError};

type RowLocks<K> = Mutex<HashMap<K, Arc<Mutex<()>>>>;

#[derive(Default)]
struct Data {
    orders: HashMap<OrderId, Order>,
    payments: HashMap<OrderId, Payment>,
    accounts: HashMap<UserId, Account>,
    products: HashMap<ProductId, Product>,
    carts: HashMap<UserId, Vec<CartLine>>,
    coupons: HashMap<CouponId, Coupon>,
    user_coupons: HashMap<UserCouponId, UserCoupon>,
    order_coupons: Vec<OrderCoupon>,
    stock_ledger: Vec<StockLedgerEntry>,
    balance_ledger: Vec<BalanceLedgerEntry>,
}

/// Row writes an [`InMemoryStore`] can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteTarget {
    Product,
    UserCoupon,
}

#[derive(Default)]
struct Tables {
    data: Mutex<Data>,
    account_locks: RowLocks<UserId>,
    coupon_locks: RowLocks<CouponId>,
    order_seq: AtomicI64,
    user_coupon_seq: AtomicI64,
    /// Writes still allowed per target before they start failing.
    write_failures: Mutex<HashMap<WriteTarget, u32>>,
}

/// In-memory unit of work for tests and single-process runs.
///
/// Transactions stage their writes privately and apply them in one step on
/// commit, after re-checking optimistic versions and unique keys. `lock_*`
/// calls take a per-row async mutex held until the transaction ends.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_account(&self, account: Account) {
        self.tables
            .data
            .lock()
            .await
            .accounts
            .insert(account.id, account);
    }

    pub async fn insert_product(&self, product: Product) {
        self.tables
            .data
            .lock()
            .await
            .products
            .insert(product.id, product);
    }

    pub async fn insert_coupon(&self, coupon: Coupon) {
        self.tables
            .data
            .lock()
            .await
            .coupons
            .insert(coupon.id, coupon);
    }

    pub async fn add_to_cart(&self, line: CartLine) {
        let mut data = self.tables.data.lock().await;
        merge_line(data.carts.entry(line.user_id).or_default(), line);
    }

    /// Grants a coupon directly, bypassing issuance.
    pub async fn grant_user_coupon(&self, new: NewUserCoupon) -> UserCoupon {
        let id = UserCouponId::new(self.tables.user_coupon_seq.fetch_add(1, Ordering::SeqCst) + 1);
        let user_coupon = UserCoupon::from_new(id, new);
        self.tables
            .data
            .lock()
            .await
            .user_coupons
            .insert(id, user_coupon.clone());
        user_coupon
    }

    /// Makes writes to `target` fail once `allowed` more of them went through.
    pub async fn fail_writes_after(&self, target: WriteTarget, allowed: u32) {
        self.tables.write_failures.lock().await.insert(target, allowed);
    }

    /// Makes every write to `target` fail, or none of them.
    pub async fn set_fail_on_write(&self, target: WriteTarget, fail: bool) {
        let mut failures = self.tables.write_failures.lock().await;
        if fail {
            failures.insert(target, 0);
        } else {
            failures.remove(&target);
        }
    }

    pub async fn account(&self, id: UserId) -> Option<Account> {
        self.tables.data.lock().await.accounts.get(&id).cloned()
    }

    pub async fn product(&self, id: ProductId) -> Option<Product> {
        self.tables.data.lock().await.products.get(&id).cloned()
    }

    pub async fn coupon(&self, id: CouponId) -> Option<Coupon> {
        self.tables.data.lock().await.coupons.get(&id).cloned()
    }

    pub async fn order(&self, id: OrderId) -> Option<Order> {
        self.tables.data.lock().await.orders.get(&id).cloned()
    }

    pub async fn orders(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self.tables.data.lock().await.orders.values().cloned().collect();
        orders.sort_by_key(|o| o.id);
        orders
    }

    pub async fn payment(&self, order_id: OrderId) -> Option<Payment> {
        self.tables.data.lock().await.payments.get(&order_id).cloned()
    }

    pub async fn user_coupon(&self, id: UserCouponId) -> Option<UserCoupon> {
        self.tables.data.lock().await.user_coupons.get(&id).cloned()
    }

    pub async fn user_coupons_of(&self, coupon_id: CouponId) -> Vec<UserCoupon> {
        let mut rows: Vec<UserCoupon> = self
            .tables
            .data
            .lock()
            .await
            .user_coupons
            .values()
            .filter(|uc| uc.coupon_id == coupon_id)
            .cloned()
            .collect();
        rows.sort_by_key(|uc| uc.id);
        rows
    }

    pub async fn cart(&self, user_id: UserId) -> Vec<CartLine> {
        self.tables
            .data
            .lock()
            .await
            .carts
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn order_coupon(&self, order_id: OrderId) -> Option<OrderCoupon> {
        self.tables
            .data
            .lock()
            .await
            .order_coupons
            .iter()
            .find(|oc| oc.order_id == order_id)
            .cloned()
    }

    pub async fn stock_ledger(&self) -> Vec<StockLedgerEntry> {
        self.tables.data.lock().await.stock_ledger.clone()
    }

    pub async fn balance_ledger(&self) -> Vec<BalanceLedgerEntry> {
        self.tables.data.lock().await.balance_ledger.clone()
    }
}

#[async_trait]
impl UnitOfWork for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(InMemoryTransaction {
            tables: Arc::clone(&self.tables),
            staged: Staged::default(),
            locked_accounts: HashSet::new(),
            locked_coupons: HashSet::new(),
            guards: Vec::new(),
        }))
    }
}

/// A staged row plus the version it was read at.
struct Versioned<T> {
    read_version: i64,
    row: T,
}

#[derive(Default)]
struct Staged {
    orders: HashMap<OrderId, Order>,
    inserted_orders: Vec<OrderId>,
    payments: HashMap<OrderId, Payment>,
    accounts: HashMap<UserId, Account>,
    products: HashMap<ProductId, Versioned<Product>>,
    coupons: HashMap<CouponId, Versioned<Coupon>>,
    cleared_carts: HashSet<UserId>,
    cart_lines: Vec<CartLine>,
    user_coupons: HashMap<UserCouponId, UserCoupon>,
    inserted_user_coupons: Vec<UserCouponId>,
    order_coupons: Vec<OrderCoupon>,
    stock_ledger: Vec<StockLedgerEntry>,
    balance_ledger: Vec<BalanceLedgerEntry>,
}

pub struct InMemoryTransaction {
    tables: Arc<Tables>,
    staged: Staged,
    locked_accounts: HashSet<UserId>,
    locked_coupons: HashSet<CouponId>,
    guards: Vec<OwnedMutexGuard<()>>,
}

async fn row_lock<K: Eq + Hash + Copy>(locks: &RowLocks<K>, key: K) -> OwnedMutexGuard<()> {
    let lock = Arc::clone(locks.lock().await.entry(key).or_default());
    lock.lock_owned().await
}

fn merge_line(lines: &mut Vec<CartLine>, line: CartLine) {
    match lines.iter_mut().find(|l| l.product_id == line.product_id) {
        Some(existing) => existing.quantity += line.quantity,
        None => lines.push(line),
    }
}

impl InMemoryTransaction {
    async fn check_write(&self, target: WriteTarget) -> Result<()> {
        let mut failures = self.tables.write_failures.lock().await;
        match failures.get_mut(&target) {
            None => Ok(()),
            Some(0) => Err(StoreError::Database(sqlx::Error::PoolTimedOut)),
            Some(left) => {
                *left -= 1;
                Ok(())
            }
        }
    }

    async fn committed_order_where(&self, pred: impl Fn(&Order) -> bool) -> Option<Order> {
        let data = self.tables.data.lock().await;
        data.orders
            .values()
            .filter(|o| !self.staged.orders.contains_key(&o.id))
            .find(|o| pred(*o))
            .cloned()
    }

    async fn order_where(&self, pred: impl Fn(&Order) -> bool) -> Option<Order> {
        if let Some(order) = self.staged.orders.values().find(|o| pred(*o)) {
            return Some(order.clone());
        }
        self.committed_order_where(pred).await
    }

    async fn user_coupons_where(&self, pred: impl Fn(&UserCoupon) -> bool) -> Vec<UserCoupon> {
        let data = self.tables.data.lock().await;
        let mut merged: HashMap<UserCouponId, UserCoupon> = data
            .user_coupons
            .iter()
            .map(|(id, uc)| (*id, uc.clone()))
            .collect();
        merged.extend(
            self.staged
                .user_coupons
                .iter()
                .map(|(id, uc)| (*id, uc.clone())),
        );
        let mut rows: Vec<UserCoupon> = merged.into_values().filter(|uc| pred(uc)).collect();
        rows.sort_by_key(|uc| uc.id);
        rows
    }
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    async fn find_order(&mut self, id: OrderId) -> Result<Option<Order>> {
        if let Some(order) = self.staged.orders.get(&id) {
            return Ok(Some(order.clone()));
        }
        Ok(self.tables.data.lock().await.orders.get(&id).cloned())
    }

    async fn find_order_by_idempotency_key(&mut self, key: &str) -> Result<Option<Order>> {
        Ok(self.order_where(|o| o.idempotency_key == key).await)
    }

    async fn find_order_by_number(&mut self, number: &OrderNumber) -> Result<Option<Order>> {
        Ok(self.order_where(|o| &o.order_number == number).await)
    }

    async fn orders_for_user(&mut self, user_id: UserId) -> Result<Vec<Order>> {
        let data = self.tables.data.lock().await;
        let mut merged: HashMap<OrderId, Order> = data
            .orders
            .values()
            .filter(|o| o.user_id == user_id)
            .map(|o| (o.id, o.clone()))
            .collect();
        drop(data);
        merged.extend(
            self.staged
                .orders
                .values()
                .filter(|o| o.user_id == user_id)
                .map(|o| (o.id, o.clone())),
        );
        let mut orders: Vec<Order> = merged.into_values().collect();
        orders.sort_by_key(|o| o.id);
        Ok(orders)
    }

    async fn insert_order(&mut self, order: NewOrder) -> Result<Order> {
        if self
            .order_where(|o| o.idempotency_key == order.idempotency_key)
            .await
            .is_some()
        {
            return Err(StoreError::duplicate(constraints::ORDER_IDEMPOTENCY_KEY));
        }
        if self
            .order_where(|o| o.order_number == order.order_number)
            .await
            .is_some()
        {
            return Err(StoreError::duplicate(constraints::ORDER_NUMBER));
        }
        let id = OrderId::new(self.tables.order_seq.fetch_add(1, Ordering::SeqCst) + 1);
        let order = Order::from_new(id, order);
        self.staged.orders.insert(id, order.clone());
        self.staged.inserted_orders.push(id);
        Ok(order)
    }

    async fn update_order(&mut self, order: &Order) -> Result<()> {
        if self.find_order(order.id).await?.is_none() {
            return Err(StoreError::missing("Order", order.id));
        }
        self.staged.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn insert_payment(&mut self, payment: &Payment) -> Result<()> {
        if self.find_payment(payment.order_id).await?.is_some() {
            return Err(StoreError::duplicate(constraints::PAYMENT));
        }
        self.staged.payments.insert(payment.order_id, payment.clone());
        Ok(())
    }

    async fn find_payment(&mut self, order_id: OrderId) -> Result<Option<Payment>> {
        if let Some(payment) = self.staged.payments.get(&order_id) {
            return Ok(Some(payment.clone()));
        }
        Ok(self.tables.data.lock().await.payments.get(&order_id).cloned())
    }

    async fn update_payment(&mut self, payment: &Payment) -> Result<()> {
        if self.find_payment(payment.order_id).await?.is_none() {
            return Err(StoreError::missing("Payment", payment.order_id));
        }
        self.staged.payments.insert(payment.order_id, payment.clone());
        Ok(())
    }

    async fn find_account(&mut self, id: UserId) -> Result<Option<Account>> {
        if let Some(account) = self.staged.accounts.get(&id) {
            return Ok(Some(account.clone()));
        }
        Ok(self.tables.data.lock().await.accounts.get(&id).cloned())
    }

    async fn lock_account(&mut self, id: UserId) -> Result<Option<Account>> {
        if self.locked_accounts.insert(id) {
            let guard = row_lock(&self.tables.account_locks, id).await;
            self.guards.push(guard);
        }
        self.find_account(id).await
    }

    async fn update_account(&mut self, account: &Account) -> Result<()> {
        if self.find_account(account.id).await?.is_none() {
            return Err(StoreError::missing("Account", account.id));
        }
        self.staged.accounts.insert(account.id, account.clone());
        Ok(())
    }

    async fn find_product(&mut self, id: ProductId) -> Result<Option<Product>> {
        if let Some(staged) = self.staged.products.get(&id) {
            return Ok(Some(staged.row.clone()));
        }
        Ok(self.tables.data.lock().await.products.get(&id).cloned())
    }

    async fn update_product(&mut self, product: &mut Product) -> Result<()> {
        self.check_write(WriteTarget::Product).await?;
        let (current, read_version) = match self.staged.products.get(&product.id) {
            Some(staged) => (staged.row.version, staged.read_version),
            None => {
                let data = self.tables.data.lock().await;
                let stored = data
                    .products
                    .get(&product.id)
                    .ok_or_else(|| StoreError::missing("Product", product.id))?;
                (stored.version, stored.version)
            }
        };
        if product.version != current {
            return Err(StoreError::conflict("Product", product.id));
        }
        product.version += 1;
        self.staged.products.insert(
            product.id,
            Versioned {
                read_version,
                row: product.clone(),
            },
        );
        Ok(())
    }

    async fn cart_lines(&mut self, user_id: UserId) -> Result<Vec<CartLine>> {
        let mut lines = if self.staged.cleared_carts.contains(&user_id) {
            Vec::new()
        } else {
            self.tables
                .data
                .lock()
                .await
                .carts
                .get(&user_id)
                .cloned()
                .unwrap_or_default()
        };
        for line in self.staged.cart_lines.iter().filter(|l| l.user_id == user_id) {
            merge_line(&mut lines, line.clone());
        }
        Ok(lines)
    }

    async fn add_cart_line(&mut self, line: &CartLine) -> Result<()> {
        self.staged.cart_lines.push(line.clone());
        Ok(())
    }

    async fn clear_cart(&mut self, user_id: UserId) -> Result<()> {
        self.staged.cleared_carts.insert(user_id);
        self.staged.cart_lines.retain(|l| l.user_id != user_id);
        Ok(())
    }

    async fn find_coupon(&mut self, id: CouponId) -> Result<Option<Coupon>> {
        if let Some(staged) = self.staged.coupons.get(&id) {
            return Ok(Some(staged.row.clone()));
        }
        Ok(self.tables.data.lock().await.coupons.get(&id).cloned())
    }

    async fn lock_coupon(&mut self, id: CouponId) -> Result<Option<Coupon>> {
        if self.locked_coupons.insert(id) {
            let guard = row_lock(&self.tables.coupon_locks, id).await;
            self.guards.push(guard);
        }
        self.find_coupon(id).await
    }

    async fn update_coupon(&mut self, coupon: &mut Coupon) -> Result<()> {
        let (current, read_version) = match self.staged.coupons.get(&coupon.id) {
            Some(staged) => (staged.row.version, staged.read_version),
            None => {
                let data = self.tables.data.lock().await;
                let stored = data
                    .coupons
                    .get(&coupon.id)
                    .ok_or_else(|| StoreError::missing("Coupon", coupon.id))?;
                (stored.version, stored.version)
            }
        };
        if coupon.version != current {
            return Err(StoreError::conflict("Coupon", coupon.id));
        }
        coupon.version += 1;
        self.staged.coupons.insert(
            coupon.id,
            Versioned {
                read_version,
                row: coupon.clone(),
            },
        );
        Ok(())
    }

    async fn find_user_coupon(&mut self, id: UserCouponId) -> Result<Option<UserCoupon>> {
        if let Some(uc) = self.staged.user_coupons.get(&id) {
            return Ok(Some(uc.clone()));
        }
        Ok(self.tables.data.lock().await.user_coupons.get(&id).cloned())
    }

    async fn find_user_coupon_by_grant(
        &mut self,
        coupon_id: CouponId,
        user_id: UserId,
        grant_ordinal: u32,
    ) -> Result<Option<UserCoupon>> {
        Ok(self
            .user_coupons_where(|uc| {
                uc.coupon_id == coupon_id
                    && uc.user_id == user_id
                    && uc.grant_ordinal == grant_ordinal
            })
            .await
            .into_iter()
            .next())
    }

    async fn count_user_coupons(&mut self, coupon_id: CouponId, user_id: UserId) -> Result<u32> {
        let rows = self
            .user_coupons_where(|uc| uc.coupon_id == coupon_id && uc.user_id == user_id)
            .await;
        Ok(u32::try_from(rows.len()).unwrap_or(u32::MAX))
    }

    async fn insert_user_coupon(&mut self, new: NewUserCoupon) -> Result<UserCoupon> {
        if self
            .find_user_coupon_by_grant(new.coupon_id, new.user_id, new.grant_ordinal)
            .await?
            .is_some()
        {
            return Err(StoreError::duplicate(constraints::USER_COUPON_GRANT));
        }
        let id = UserCouponId::new(self.tables.user_coupon_seq.fetch_add(1, Ordering::SeqCst) + 1);
        let user_coupon = UserCoupon::from_new(id, new);
        self.staged.user_coupons.insert(id, user_coupon.clone());
        self.staged.inserted_user_coupons.push(id);
        Ok(user_coupon)
    }

    async fn update_user_coupon(&mut self, user_coupon: &UserCoupon) -> Result<()> {
        self.check_write(WriteTarget::UserCoupon).await?;
        if self.find_user_coupon(user_coupon.id).await?.is_none() {
            return Err(StoreError::missing("UserCoupon", user_coupon.id));
        }
        self.staged
            .user_coupons
            .insert(user_coupon.id, user_coupon.clone());
        Ok(())
    }

    async fn attach_order_coupon(&mut self, record: &OrderCoupon) -> Result<bool> {
        let same = |oc: &OrderCoupon| {
            oc.order_id == record.order_id && oc.user_coupon_id == record.user_coupon_id
        };
        if self.staged.order_coupons.iter().any(same)
            || self.tables.data.lock().await.order_coupons.iter().any(same)
        {
            return Ok(false);
        }
        self.staged.order_coupons.push(record.clone());
        Ok(true)
    }

    async fn find_order_coupon(&mut self, order_id: OrderId) -> Result<Option<OrderCoupon>> {
        if let Some(oc) = self
            .staged
            .order_coupons
            .iter()
            .find(|oc| oc.order_id == order_id)
        {
            return Ok(Some(oc.clone()));
        }
        Ok(self
            .tables
            .data
            .lock()
            .await
            .order_coupons
            .iter()
            .find(|oc| oc.order_id == order_id)
            .cloned())
    }

    async fn append_stock_ledger(&mut self, entry: &StockLedgerEntry) -> Result<()> {
        self.staged.stock_ledger.push(entry.clone());
        Ok(())
    }

    async fn append_balance_ledger(&mut self, entry: &BalanceLedgerEntry) -> Result<()> {
        self.staged.balance_ledger.push(entry.clone());
        Ok(())
    }

    async fn stock_ledger_for_order(&mut self, order_id: OrderId) -> Result<Vec<StockLedgerEntry>> {
        let data = self.tables.data.lock().await;
        Ok(data
            .stock_ledger
            .iter()
            .chain(self.staged.stock_ledger.iter())
            .filter(|e| e.order_id == Some(order_id))
            .cloned()
            .collect())
    }

    async fn balance_ledger_for_order(
        &mut self,
        order_id: OrderId,
    ) -> Result<Vec<BalanceLedgerEntry>> {
        let data = self.tables.data.lock().await;
        Ok(data
            .balance_ledger
            .iter()
            .chain(self.staged.balance_ledger.iter())
            .filter(|e| e.order_id == Some(order_id))
            .cloned()
            .collect())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let InMemoryTransaction {
            tables,
            staged,
            guards,
            ..
        } = *self;
        // Row locks are released only after the writes are visible.
        let _guards = guards;
        let mut data = tables.data.lock().await;

        for (id, staged) in &staged.products {
            match data.products.get(id) {
                Some(stored) if stored.version == staged.read_version => {}
                _ => return Err(StoreError::conflict("Product", id)),
            }
        }
        for (id, staged) in &staged.coupons {
            match data.coupons.get(id) {
                Some(stored) if stored.version == staged.read_version => {}
                _ => return Err(StoreError::conflict("Coupon", id)),
            }
        }
        for id in &staged.inserted_orders {
            let Some(order) = staged.orders.get(id) else {
                continue;
            };
            if data
                .orders
                .values()
                .any(|o| o.idempotency_key == order.idempotency_key)
            {
                return Err(StoreError::duplicate(constraints::ORDER_IDEMPOTENCY_KEY));
            }
            if data
                .orders
                .values()
                .any(|o| o.order_number == order.order_number)
            {
                return Err(StoreError::duplicate(constraints::ORDER_NUMBER));
            }
        }
        for id in &staged.inserted_user_coupons {
            let Some(new) = staged.user_coupons.get(id) else {
                continue;
            };
            if data.user_coupons.values().any(|uc| {
                uc.coupon_id == new.coupon_id
                    && uc.user_id == new.user_id
                    && uc.grant_ordinal == new.grant_ordinal
            }) {
                return Err(StoreError::duplicate(constraints::USER_COUPON_GRANT));
            }
        }

        data.orders.extend(staged.orders);
        data.payments.extend(staged.payments);
        data.accounts.extend(staged.accounts);
        data.products
            .extend(staged.products.into_iter().map(|(id, v)| (id, v.row)));
        data.coupons
            .extend(staged.coupons.into_iter().map(|(id, v)| (id, v.row)));
        for user_id in staged.cleared_carts {
            data.carts.remove(&user_id);
        }
        for line in staged.cart_lines {
            merge_line(data.carts.entry(line.user_id).or_default(), line);
        }
        data.user_coupons.extend(staged.user_coupons);
        data.order_coupons.extend(staged.order_coupons);
        data.stock_ledger.extend(staged.stock_ledger);
        data.balance_ledger.extend(staged.balance_ledger);
        Ok(())
    }
}
