// LEDGER ACCOUNT
// Per-party balance with position-counted locking
//
// SAFETY INVARIANTS:
// 1. Balance never goes below zero (debits are checked)
// 2. Credits never wrap (128-bit checked arithmetic)
// 3. A locked account cannot withdraw out of the system
// 4. Accounts are never deleted, only drained

use crate::ledger_types::{Amount, StakerId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccountError {
    #[error("Insufficient balance for {owner}: requested {requested}, available {available}")]
    InsufficientBalance {
        owner: StakerId,
        requested: Amount,
        available: Amount,
    },

    #[error("Account {0} is locked by an open position")]
    AccountLocked(StakerId),

    #[error("Balance overflow on account {0}")]
    BalanceOverflow(StakerId),

    #[error("Unknown account {0}")]
    UnknownAccount(StakerId),
}

/// Proof that a debit was applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebitReceipt {
    /// Debited account
    pub owner: StakerId,

    /// Amount removed
    pub amount: Amount,

    /// Balance left after the debit
    pub remaining: Amount,
}

/// A party's balance inside the ledger boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAccount {
    /// Owner identity
    owner: StakerId,

    /// Free balance in smallest units
    balance: Amount,

    /// Number of unsettled positions holding this account locked
    open_positions: u32,
}

impl LedgerAccount {
    pub fn new(owner: StakerId) -> Self {
        LedgerAccount {
            owner,
            balance: 0,
            open_positions: 0,
        }
    }

    pub fn owner(&self) -> &StakerId {
        &self.owner
    }

    pub fn balance(&self) -> Amount {
        self.balance
    }

    pub fn is_locked(&self) -> bool {
        self.open_positions > 0
    }

    pub fn open_positions(&self) -> u32 {
        self.open_positions
    }

    /// Remove `amount` from the balance
    pub fn debit(&mut self, amount: Amount) -> Result<DebitReceipt, AccountError> {
        if self.balance < amount {
            return Err(AccountError::InsufficientBalance {
                owner: self.owner.clone(),
                requested: amount,
                available: self.balance,
            });
        }

        self.balance -= amount;

        Ok(DebitReceipt {
            owner: self.owner.clone(),
            amount,
            remaining: self.balance,
        })
    }

    /// Add `amount` to the balance, returning the new balance
    pub fn credit(&mut self, amount: Amount) -> Result<Amount, AccountError> {
        self.balance = self
            .balance
            .checked_add(amount)
            .ok_or_else(|| AccountError::BalanceOverflow(self.owner.clone()))?;
        Ok(self.balance)
    }

    /// Hold the account for one more open position
    pub fn lock(&mut self) {
        self.open_positions = self.open_positions.saturating_add(1);
    }

    /// Release one open position
    pub fn unlock(&mut self) {
        self.open_positions = self.open_positions.saturating_sub(1);
    }

    /// Debit that leaves the system boundary. Refused while any position is open.
    pub fn withdraw(&mut self, amount: Amount) -> Result<DebitReceipt, AccountError> {
        if self.is_locked() {
            return Err(AccountError::AccountLocked(self.owner.clone()));
        }
        self.debit(amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn funded(amount: Amount) -> LedgerAccount {
        let mut account = LedgerAccount::new(StakerId::from("alice"));
        account.credit(amount).unwrap();
        account
    }

    #[test]
    fn test_debit_reduces_balance() {
        let mut account = funded(500);
        let receipt = account.debit(200).unwrap();

        assert_eq!(receipt.amount, 200);
        assert_eq!(receipt.remaining, 300);
        assert_eq!(account.balance(), 300);
    }

    #[test]
    fn test_debit_insufficient_balance() {
        let mut account = funded(50);
        let err = account.debit(51).unwrap_err();

        assert!(matches!(
            err,
            AccountError::InsufficientBalance { requested: 51, available: 50, .. }
        ));
        assert_eq!(account.balance(), 50);
    }

    #[test]
    fn test_credit_overflow_is_reported() {
        let mut account = funded(u128::MAX);
        assert!(matches!(account.credit(1), Err(AccountError::BalanceOverflow(_))));
        assert_eq!(account.balance(), u128::MAX);
    }

    #[test]
    fn test_locked_account_cannot_withdraw() {
        let mut account = funded(100);
        account.lock();
        account.lock();

        assert!(matches!(account.withdraw(10), Err(AccountError::AccountLocked(_))));

        account.unlock();
        assert!(account.is_locked());
        account.unlock();
        assert!(!account.is_locked());

        assert_eq!(account.withdraw(10).unwrap().remaining, 90);
    }

    #[test]
    fn test_unlock_never_underflows() {
        let mut account = funded(0);
        account.unlock();
        assert_eq!(account.open_positions(), 0);
    }
}
