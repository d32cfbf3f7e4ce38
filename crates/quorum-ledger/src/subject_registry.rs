// SUBJECT REGISTRY
// Process-wide owner of every subject, account and the treasury
//
// SAFETY INVARIANTS:
// 1. Each subject is guarded by its own mutex; every operation on it runs inside that critical section
// 2. Lock order is subject -> account -> treasury, never the reverse
// 3. Map entries are cloned out of the DashMap before any mutex is taken
// 4. An operation that returns an error has not mutated any subject or account
// 5. Value only enters through custody pulls and only leaves through custody pushes

use crate::clock::Clock;
use crate::ledger_account::{AccountError, LedgerAccount};
use crate::ledger_config::SubjectConfig;
use crate::ledger_types::{Amount, Outcome, StakerId, SubjectId, Timestamp, VoteChoice};
use crate::payout_calculator::ClaimError;
use crate::resolution_engine::{DisputeError, ResolutionEngine, StateError, SubjectSnapshot, SubjectState};
use crate::stake_pool::StakeError;
use crate::state_storage::{RegistrySnapshot, SNAPSHOT_VERSION};
use crate::subject_capabilities::{Resolvable, Stakeable, Votable};
use crate::token_custody::{CustodyError, TokenCustody};
use crate::voting_round::VoteError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Owner id of the internal fee account
pub const TREASURY_ID: &str = "treasury";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Transfer amount must be greater than zero")]
    ZeroAmount,

    #[error("Account error: {0}")]
    Account(#[from] AccountError),

    #[error("Custody error: {0}")]
    Custody(#[from] CustodyError),
}

/// Returned by `open_subject`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectHandle {
    pub subject_id: SubjectId,
    pub created_at: Timestamp,
    pub config: SubjectConfig,
}

/// Summary kept after a settled subject leaves the live set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedSubject {
    pub subject_id: SubjectId,
    pub outcome: Outcome,
    pub total_staked: Amount,
    pub bounty: Amount,
    pub dispute_used: bool,
    pub total_paid: Amount,
    pub treasury_share: Amount,
    pub archived_at: Timestamp,
    /// Hex SHA-256 of the final subject record
    pub state_hash: String,
}

/// What one sweep pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub resolved: Vec<(SubjectId, Outcome)>,
    pub finalized: Vec<(SubjectId, Outcome)>,
    pub failures: Vec<(SubjectId, String)>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty() && self.finalized.is_empty() && self.failures.is_empty()
    }
}

type SubjectSlot = Arc<Mutex<ResolutionEngine>>;
type AccountSlot = Arc<Mutex<LedgerAccount>>;

pub struct SubjectRegistry {
    subjects: DashMap<SubjectId, SubjectSlot>,
    accounts: DashMap<StakerId, AccountSlot>,
    treasury: Mutex<LedgerAccount>,
    archive: DashMap<SubjectId, ArchivedSubject>,
    defaults: SubjectConfig,
    clock: Arc<dyn Clock>,
    custody: Arc<dyn TokenCustody>,
}

impl SubjectRegistry {
    pub fn new(defaults: SubjectConfig, clock: Arc<dyn Clock>, custody: Arc<dyn TokenCustody>) -> Self {
        SubjectRegistry {
            subjects: DashMap::new(),
            accounts: DashMap::new(),
            treasury: Mutex::new(LedgerAccount::new(StakerId::from(TREASURY_ID))),
            archive: DashMap::new(),
            defaults,
            clock,
            custody,
        }
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn defaults(&self) -> &SubjectConfig {
        &self.defaults
    }

    fn subject(&self, subject_id: &SubjectId) -> Option<SubjectSlot> {
        self.subjects.get(subject_id).map(|slot| Arc::clone(slot.value()))
    }

    fn account_slot(&self, owner: &StakerId) -> Option<AccountSlot> {
        self.accounts.get(owner).map(|slot| Arc::clone(slot.value()))
    }

    fn account_slot_or_create(&self, owner: &StakerId) -> AccountSlot {
        let slot = self
            .accounts
            .entry(owner.clone())
            .or_insert_with(|| Arc::new(Mutex::new(LedgerAccount::new(owner.clone()))));
        Arc::clone(slot.value())
    }

    /// Ids of live subjects, sorted
    pub fn subject_ids(&self) -> Vec<SubjectId> {
        let mut ids: Vec<SubjectId> = self.subjects.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Register a subject in `Open`. `None` applies the registry defaults.
    pub fn open_subject(
        &self,
        subject_id: SubjectId,
        config: Option<SubjectConfig>,
    ) -> Result<SubjectHandle, StateError> {
        let config = config.unwrap_or_else(|| self.defaults.clone());
        config
            .validate()
            .map_err(|e| StateError::InvalidConfig(e.to_string()))?;
        if self.archive.contains_key(&subject_id) {
            return Err(StateError::SubjectExists(subject_id));
        }

        let now = self.now();
        match self.subjects.entry(subject_id.clone()) {
            Entry::Occupied(_) => Err(StateError::SubjectExists(subject_id)),
            Entry::Vacant(slot) => {
                let engine = ResolutionEngine::new(subject_id.clone(), config.clone(), now);
                slot.insert(Arc::new(Mutex::new(engine)));

                info!("Subject {} opened at {}", subject_id, now);
                Ok(SubjectHandle {
                    subject_id,
                    created_at: now,
                    config,
                })
            }
        }
    }

    /// Pull tokens from custody into the staker's account, creating it on first use
    pub fn deposit(&self, owner: &StakerId, amount: Amount) -> Result<Amount, TransferError> {
        if amount == 0 {
            return Err(TransferError::ZeroAmount);
        }
        self.custody.pull(owner, amount)?;

        let slot = self.account_slot_or_create(owner);
        let mut account = slot.lock();
        match account.credit(amount) {
            Ok(balance) => {
                info!("Deposited {} for {}, balance {}", amount, owner, balance);
                Ok(balance)
            }
            Err(e) => {
                if let Err(push_err) = self.custody.push(owner, amount) {
                    warn!("Could not return rejected deposit of {} to {}: {}", amount, owner, push_err);
                }
                Err(e.into())
            }
        }
    }

    /// Move free balance back out through custody. Locked accounts cannot withdraw.
    pub fn withdraw(&self, owner: &StakerId, amount: Amount) -> Result<Amount, TransferError> {
        if amount == 0 {
            return Err(TransferError::ZeroAmount);
        }
        let slot = self
            .account_slot(owner)
            .ok_or_else(|| AccountError::UnknownAccount(owner.clone()))?;
        let mut account = slot.lock();
        let receipt = account.withdraw(amount)?;

        if let Err(e) = self.custody.push(owner, amount) {
            if let Err(credit_err) = account.credit(amount) {
                warn!("Could not restore {} to {}: {}", amount, owner, credit_err);
            }
            warn!("Withdrawal of {} by {} rejected by custody: {}", amount, owner, e);
            return Err(e.into());
        }

        info!("Withdrew {} for {}, balance {}", amount, owner, receipt.remaining);
        Ok(receipt.remaining)
    }

    pub fn stake(&self, subject_id: &SubjectId, staker: &StakerId, amount: Amount) -> Result<(), StakeError> {
        let slot = self
            .subject(subject_id)
            .ok_or_else(|| StakeError::UnknownSubject(subject_id.clone()))?;
        let mut engine = slot.lock();
        let account_slot = self
            .account_slot(staker)
            .ok_or_else(|| AccountError::UnknownAccount(staker.clone()))?;
        let mut account = account_slot.lock();

        engine.stake(&mut account, amount)
    }

    pub fn increase_stake(&self, subject_id: &SubjectId, staker: &StakerId, amount: Amount) -> Result<Amount, StakeError> {
        let slot = self
            .subject(subject_id)
            .ok_or_else(|| StakeError::UnknownSubject(subject_id.clone()))?;
        let mut engine = slot.lock();
        let account_slot = self
            .account_slot(staker)
            .ok_or_else(|| AccountError::UnknownAccount(staker.clone()))?;
        let mut account = account_slot.lock();

        engine.increase_stake(&mut account, amount)
    }

    pub fn fund_bounty(&self, subject_id: &SubjectId, funder: &StakerId, amount: Amount) -> Result<Amount, StakeError> {
        let slot = self
            .subject(subject_id)
            .ok_or_else(|| StakeError::UnknownSubject(subject_id.clone()))?;
        let mut engine = slot.lock();
        let account_slot = self
            .account_slot(funder)
            .ok_or_else(|| AccountError::UnknownAccount(funder.clone()))?;
        let mut account = account_slot.lock();

        engine.fund_bounty(&mut account, amount)
    }

    pub fn advance_to_voting(&self, subject_id: &SubjectId) -> Result<(), StateError> {
        let slot = self
            .subject(subject_id)
            .ok_or_else(|| StateError::UnknownSubject(subject_id.clone()))?;
        let mut engine = slot.lock();
        engine.advance_to_voting(self.now())
    }

    /// Record a vote; returns the outcome when the vote triggered resolution
    pub fn cast_vote(
        &self,
        subject_id: &SubjectId,
        staker: &StakerId,
        choice: VoteChoice,
    ) -> Result<Option<Outcome>, VoteError> {
        let slot = self
            .subject(subject_id)
            .ok_or_else(|| StateError::UnknownSubject(subject_id.clone()))?;
        let mut engine = slot.lock();
        let resolved = engine.cast_vote(staker, choice, self.now())?;
        self.settle_finalized(&mut engine);
        Ok(resolved)
    }

    pub fn try_resolve(&self, subject_id: &SubjectId) -> Option<Outcome> {
        let slot = self.subject(subject_id)?;
        let mut engine = slot.lock();
        let outcome = engine.try_resolve(self.now());
        self.settle_finalized(&mut engine);
        outcome
    }

    /// Resolve the primary round, failing with `ResolutionPending` before the trigger
    pub fn finalize(&self, subject_id: &SubjectId) -> Result<Outcome, StateError> {
        let slot = self
            .subject(subject_id)
            .ok_or_else(|| StateError::UnknownSubject(subject_id.clone()))?;
        let mut engine = slot.lock();
        engine.finalize(self.now())
    }

    pub fn open_dispute(&self, subject_id: &SubjectId, disputer: &StakerId, stake: Amount) -> Result<(), DisputeError> {
        let slot = self
            .subject(subject_id)
            .ok_or_else(|| DisputeError::UnknownSubject(subject_id.clone()))?;
        let mut engine = slot.lock();
        let account_slot = self
            .account_slot(disputer)
            .ok_or_else(|| AccountError::UnknownAccount(disputer.clone()))?;
        let mut account = account_slot.lock();

        engine.open_dispute(&mut account, stake, self.now())
    }

    pub fn finalize_dispute(&self, subject_id: &SubjectId) -> Result<Outcome, StateError> {
        let slot = self
            .subject(subject_id)
            .ok_or_else(|| StateError::UnknownSubject(subject_id.clone()))?;
        let mut engine = slot.lock();
        let outcome = engine.finalize_dispute(self.now())?;
        self.settle_finalized(&mut engine);
        Ok(outcome)
    }

    pub fn close_dispute_window(&self, subject_id: &SubjectId) -> Result<Outcome, StateError> {
        let slot = self
            .subject(subject_id)
            .ok_or_else(|| StateError::UnknownSubject(subject_id.clone()))?;
        let mut engine = slot.lock();
        let outcome = engine.close_dispute_window(self.now())?;
        self.settle_finalized(&mut engine);
        Ok(outcome)
    }

    /// Credit the staker's entitlement exactly once
    pub fn claim(&self, subject_id: &SubjectId, staker: &StakerId) -> Result<Amount, ClaimError> {
        let slot = self
            .subject(subject_id)
            .ok_or_else(|| ClaimError::UnknownSubject(subject_id.clone()))?;
        let mut engine = slot.lock();
        let amount = engine.claimable(staker)?;

        let account_slot = self.account_slot_or_create(staker);
        let mut account = account_slot.lock();
        account.credit(amount)?;
        let released = engine.mark_claimed(staker);
        for _ in 0..released {
            account.unlock();
        }

        info!("Staker {} claimed {} on {}", staker, amount, subject_id);
        Ok(amount)
    }

    /// Credit the treasury and release zero-entitlement positions of a finalized subject
    fn settle_finalized(&self, engine: &mut ResolutionEngine) {
        if let Some(share) = engine.pending_treasury_share() {
            match self.treasury.lock().credit(share) {
                Ok(_) => engine.mark_treasury_settled(),
                Err(e) => {
                    warn!("Treasury credit of {} from {} failed: {}", share, engine.subject_id(), e);
                    return;
                }
            }
        }

        for (staker, positions) in engine.release_unpaid_positions() {
            if let Some(slot) = self.account_slot(&staker) {
                let mut account = slot.lock();
                for _ in 0..positions {
                    account.unlock();
                }
            }
        }
    }

    pub fn get_status(&self, subject_id: &SubjectId) -> Result<SubjectSnapshot, StateError> {
        let slot = self
            .subject(subject_id)
            .ok_or_else(|| StateError::UnknownSubject(subject_id.clone()))?;
        let engine = slot.lock();
        Ok(engine.snapshot())
    }

    /// Clone of a live subject record, for audit
    pub fn subject_record(&self, subject_id: &SubjectId) -> Option<ResolutionEngine> {
        self.subject(subject_id).map(|slot| slot.lock().clone())
    }

    pub fn account(&self, owner: &StakerId) -> Option<LedgerAccount> {
        self.account_slot(owner).map(|slot| slot.lock().clone())
    }

    pub fn treasury_balance(&self) -> Amount {
        self.treasury.lock().balance()
    }

    /// Push collected fees to the custody treasury. `None` withdraws everything.
    pub fn withdraw_fees(&self, amount: Option<Amount>) -> Result<Amount, TransferError> {
        let mut treasury = self.treasury.lock();
        let amount = amount.unwrap_or_else(|| treasury.balance());
        if amount == 0 {
            return Err(TransferError::ZeroAmount);
        }
        treasury.debit(amount)?;

        if let Err(e) = self.custody.push_to_treasury(amount) {
            if let Err(credit_err) = treasury.credit(amount) {
                warn!("Could not restore {} to treasury: {}", amount, credit_err);
            }
            return Err(e.into());
        }

        info!("Withdrew {} in protocol fees", amount);
        Ok(amount)
    }

    /// Move a finalized, fully claimed subject out of the live set
    pub fn archive_subject(&self, subject_id: &SubjectId) -> Result<ArchivedSubject, StateError> {
        let slot = self
            .subject(subject_id)
            .ok_or_else(|| StateError::UnknownSubject(subject_id.clone()))?;
        let mut engine = slot.lock();
        self.settle_finalized(&mut engine);

        let outcome = match engine.state() {
            SubjectState::Finalized(outcome) if engine.is_fully_claimed() => outcome,
            _ => return Err(StateError::NotArchivable(subject_id.clone())),
        };
        if engine.pending_treasury_share().is_some() {
            return Err(StateError::NotArchivable(subject_id.clone()));
        }

        let (total_paid, treasury_share) = engine
            .payout()
            .map(|p| (p.total_entitled(), p.treasury_share()))
            .unwrap_or((0, 0));
        let archived = ArchivedSubject {
            subject_id: subject_id.clone(),
            outcome,
            total_staked: engine.pool().total_staked(),
            bounty: engine.bounty(),
            dispute_used: engine.dispute_used(),
            total_paid,
            treasury_share,
            archived_at: self.now(),
            state_hash: hex::encode(engine.state_hash()?),
        };

        self.archive.insert(subject_id.clone(), archived.clone());
        self.subjects.remove(subject_id);

        info!("Subject {} archived with outcome {}", subject_id, outcome);
        Ok(archived)
    }

    pub fn archived(&self, subject_id: &SubjectId) -> Option<ArchivedSubject> {
        self.archive.get(subject_id).map(|a| a.value().clone())
    }

    /// Resolve rounds whose trigger has been met and close elapsed dispute windows
    pub fn sweep(&self) -> SweepReport {
        let now = self.now();
        let slots: Vec<(SubjectId, SubjectSlot)> = self
            .subjects
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut report = SweepReport::default();
        for (subject_id, slot) in slots {
            let mut engine = slot.lock();

            let state = engine.state();
            if matches!(state, SubjectState::Voting | SubjectState::Disputed)
                && engine.round().trigger_met(engine.pool(), now)
            {
                match engine.try_resolve(now) {
                    Some(outcome) => {
                        report.resolved.push((subject_id.clone(), outcome));
                        // a dispute round finalizes directly
                        if state == SubjectState::Disputed {
                            report.finalized.push((subject_id.clone(), outcome));
                        }
                    }
                    None => report
                        .failures
                        .push((subject_id.clone(), format!("resolution failed in state {}", state))),
                }
            }

            if matches!(engine.dispute_window_closes_at(), Some(closes_at) if now >= closes_at) {
                match engine.close_dispute_window(now) {
                    Ok(outcome) => report.finalized.push((subject_id.clone(), outcome)),
                    Err(e) => {
                        warn!("Sweep could not finalize {}: {}", subject_id, e);
                        report.failures.push((subject_id.clone(), e.to_string()));
                    }
                }
            }

            self.settle_finalized(&mut engine);
        }

        if !report.is_empty() {
            info!(
                "Sweep at {}: {} resolved, {} finalized, {} failures",
                now,
                report.resolved.len(),
                report.finalized.len(),
                report.failures.len()
            );
        }
        report
    }

    /// Copy of every record, one subject lock at a time
    pub fn export_snapshot(&self) -> RegistrySnapshot {
        let mut subjects: Vec<ResolutionEngine> = self
            .subjects
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect::<Vec<_>>()
            .into_iter()
            .map(|slot| slot.lock().clone())
            .collect();
        subjects.sort_by(|a, b| a.subject_id().cmp(b.subject_id()));

        let mut accounts: Vec<LedgerAccount> = self
            .accounts
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect::<Vec<_>>()
            .into_iter()
            .map(|slot| slot.lock().clone())
            .collect();
        accounts.sort_by(|a, b| a.owner().cmp(b.owner()));

        let mut archive: Vec<ArchivedSubject> = self.archive.iter().map(|e| e.value().clone()).collect();
        archive.sort_by(|a, b| a.subject_id.cmp(&b.subject_id));

        RegistrySnapshot {
            version: SNAPSHOT_VERSION,
            taken_at: self.now(),
            defaults: self.defaults.clone(),
            subjects,
            accounts,
            treasury: self.treasury.lock().clone(),
            archive,
        }
    }

    /// Rebuild a registry from a decoded snapshot
    pub fn from_snapshot(
        snapshot: RegistrySnapshot,
        clock: Arc<dyn Clock>,
        custody: Arc<dyn TokenCustody>,
    ) -> Self {
        let registry = SubjectRegistry::new(snapshot.defaults, clock, custody);
        for engine in snapshot.subjects {
            registry
                .subjects
                .insert(engine.subject_id().clone(), Arc::new(Mutex::new(engine)));
        }
        for account in snapshot.accounts {
            registry
                .accounts
                .insert(account.owner().clone(), Arc::new(Mutex::new(account)));
        }
        for archived in snapshot.archive {
            registry.archive.insert(archived.subject_id.clone(), archived);
        }
        *registry.treasury.lock() = snapshot.treasury;
        registry
    }
}
