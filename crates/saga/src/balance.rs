//! Balance top-ups.

use std::sync::Arc;

use common::UserId;
use coordination::{LockManager, keys, with_lock};
use domain::{Account, BalanceLedgerEntry, BalanceMovement, DomainError, Money};
use storage::UnitOfWork;

use crate::error::{Result, SagaError};
use crate::settings::SagaSettings;

/// Credits balances under the owner's lease, so a top-up never interleaves
/// with a checkout or a debit of the same owner.
pub struct BalanceService {
    uow: Arc<dyn UnitOfWork>,
    locks: Arc<dyn LockManager>,
    settings: SagaSettings,
}

impl BalanceService {
    pub fn new(uow: Arc<dyn UnitOfWork>, locks: Arc<dyn LockManager>, settings: SagaSettings) -> Self {
        Self {
            uow,
            locks,
            settings,
        }
    }

    #[tracing::instrument(skip(self), fields(user_id = %user_id, amount = %amount))]
    pub async fn charge(&self, user_id: UserId, amount: Money) -> Result<Account> {
        if !amount.is_positive() {
            return Err(DomainError::InvalidAmount { amount }.into());
        }
        let account = with_lock(
            &self.locks,
            &keys::balance(user_id),
            self.settings.owner_lock_wait,
            self.settings.owner_lock_lease,
            || self.charge_once(user_id, amount),
        )
        .await?;
        tracing::info!(balance = %account.balance, "balance charged");
        Ok(account)
    }

    async fn charge_once(&self, user_id: UserId, amount: Money) -> Result<Account> {
        let mut tx = self.uow.begin().await?;
        let mut account = tx
            .lock_account(user_id)
            .await?
            .ok_or_else(|| SagaError::not_found("User", user_id))?;
        let before = account.balance;
        account.charge(amount)?;
        tx.update_account(&account).await?;
        tx.append_balance_ledger(&BalanceLedgerEntry::new(
            user_id,
            None,
            BalanceMovement::Charge,
            amount,
            before,
            account.balance,
            "balance top-up",
        ))
        .await?;
        tx.commit().await?;
        Ok(account)
    }

    pub async fn account(&self, user_id: UserId) -> Result<Account> {
        let mut tx = self.uow.begin().await?;
        tx.find_account(user_id)
            .await?
            .ok_or_else(|| SagaError::not_found("User", user_id))
    }
}
