// TOKEN CUSTODY
// Boundary between ledger balances and the external token holder
//
// SAFETY INVARIANTS:
// 1. A pull either moves the full amount into the ledger or nothing
// 2. A push either moves the full amount out or nothing
// 3. The ledger credits only after a successful pull and debits before a push

use crate::ledger_types::{Amount, StakerId};
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CustodyError {
    #[error("Wallet of {owner} holds {available}, requested {requested}")]
    InsufficientFunds {
        owner: StakerId,
        requested: Amount,
        available: Amount,
    },

    #[error("Custody balance overflow for {0}")]
    Overflow(StakerId),

    #[error("Custody transfer rejected: {0}")]
    Rejected(String),
}

/// External holder of the tokens backing ledger balances
pub trait TokenCustody: Send + Sync {
    /// Move `amount` from the owner's wallet into ledger custody
    fn pull(&self, owner: &StakerId, amount: Amount) -> Result<(), CustodyError>;

    /// Release `amount` from ledger custody to the owner's wallet
    fn push(&self, owner: &StakerId, amount: Amount) -> Result<(), CustodyError>;

    /// Release collected fees to the protocol treasury
    fn push_to_treasury(&self, amount: Amount) -> Result<(), CustodyError>;
}

/// Wallets held in memory, for tests and simulations
#[derive(Debug, Default)]
pub struct InMemoryCustody {
    wallets: Mutex<HashMap<StakerId, Amount>>,
    held: Mutex<Amount>,
    treasury: Mutex<Amount>,
}

impl InMemoryCustody {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint into an external wallet
    pub fn fund_wallet(&self, owner: &StakerId, amount: Amount) -> Result<Amount, CustodyError> {
        let mut wallets = self.wallets.lock();
        let wallet = wallets.entry(owner.clone()).or_insert(0);
        *wallet = wallet
            .checked_add(amount)
            .ok_or_else(|| CustodyError::Overflow(owner.clone()))?;
        Ok(*wallet)
    }

    pub fn wallet_balance(&self, owner: &StakerId) -> Amount {
        self.wallets.lock().get(owner).copied().unwrap_or(0)
    }

    /// Tokens currently inside the ledger
    pub fn held(&self) -> Amount {
        *self.held.lock()
    }

    /// Fees released to the treasury so far
    pub fn treasury_total(&self) -> Amount {
        *self.treasury.lock()
    }
}

impl TokenCustody for InMemoryCustody {
    fn pull(&self, owner: &StakerId, amount: Amount) -> Result<(), CustodyError> {
        let mut wallets = self.wallets.lock();
        let available = wallets.get(owner).copied().unwrap_or(0);
        if available < amount {
            return Err(CustodyError::InsufficientFunds {
                owner: owner.clone(),
                requested: amount,
                available,
            });
        }
        let mut held = self.held.lock();
        *held = held
            .checked_add(amount)
            .ok_or_else(|| CustodyError::Overflow(owner.clone()))?;
        wallets.insert(owner.clone(), available - amount);

        debug!("Pulled {} from wallet of {}", amount, owner);
        Ok(())
    }

    fn push(&self, owner: &StakerId, amount: Amount) -> Result<(), CustodyError> {
        // lock order: wallets, held, treasury
        let mut wallets = self.wallets.lock();
        let mut held = self.held.lock();
        if *held < amount {
            return Err(CustodyError::Rejected(format!(
                "custody holds {}, cannot release {}",
                *held, amount
            )));
        }
        let wallet = wallets.entry(owner.clone()).or_insert(0);
        *wallet = wallet
            .checked_add(amount)
            .ok_or_else(|| CustodyError::Overflow(owner.clone()))?;
        *held -= amount;

        debug!("Pushed {} to wallet of {}", amount, owner);
        Ok(())
    }

    fn push_to_treasury(&self, amount: Amount) -> Result<(), CustodyError> {
        let mut held = self.held.lock();
        if *held < amount {
            return Err(CustodyError::Rejected(format!(
                "custody holds {}, cannot release {} to treasury",
                *held, amount
            )));
        }
        let mut treasury = self.treasury.lock();
        *treasury = treasury
            .checked_add(amount)
            .ok_or_else(|| CustodyError::Rejected("treasury overflow".to_string()))?;
        *held -= amount;
        Ok(())
    }
}
