// STAKE POOL
// Stake aggregation for one subject with tri-state vote tracking
//
// SAFETY INVARIANTS:
// 1. total_staked == sum(entry.amount)
// 2. total_voted_for + total_voted_against <= total_staked
// 3. Each staker appears at most once per subject
// 4. No entries are accepted once the pool is frozen for voting

use crate::ledger_types::{Amount, StakerId, SubjectId, Vote, VoteChoice};
use crate::ledger_account::AccountError;
use crate::voting_round::VoteError;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StakeError {
    #[error("Subject {0} is not accepting stakes")]
    SubjectNotOpen(SubjectId),

    #[error("Staker {staker} already has a stake on {subject}")]
    DuplicateStaker { subject: SubjectId, staker: StakerId },

    #[error("Staker {staker} has no stake on {subject}")]
    NotStaked { subject: SubjectId, staker: StakerId },

    #[error("Stake amount must be greater than zero")]
    ZeroAmount,

    #[error("Unknown subject {0}")]
    UnknownSubject(SubjectId),

    #[error("Stake total overflow on {0}")]
    Overflow(SubjectId),

    #[error("Account error: {0}")]
    Account(#[from] AccountError),
}

/// One staker's position on a subject
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeEntry {
    /// Staker identity
    pub staker: StakerId,

    /// Locked amount
    pub amount: Amount,

    /// Recorded vote (Unset until cast)
    pub vote: Vote,
}

/// Every stake placed against one subject, in arrival order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakePool {
    subject_id: SubjectId,

    /// Entries in arrival order
    entries: Vec<StakeEntry>,

    /// staker -> position in `entries`
    index: BTreeMap<StakerId, usize>,

    total_staked: Amount,
    total_voted_for: Amount,
    total_voted_against: Amount,

    /// Set once the subject leaves `Open`
    frozen: bool,
}

impl StakePool {
    pub fn new(subject_id: SubjectId) -> Self {
        StakePool {
            subject_id,
            entries: Vec::new(),
            index: BTreeMap::new(),
            total_staked: 0,
            total_voted_for: 0,
            total_voted_against: 0,
            frozen: false,
        }
    }

    pub fn subject_id(&self) -> &SubjectId {
        &self.subject_id
    }

    pub fn entries(&self) -> &[StakeEntry] {
        &self.entries
    }

    pub fn entry(&self, staker: &StakerId) -> Option<&StakeEntry> {
        self.index.get(staker).map(|&i| &self.entries[i])
    }

    pub fn stake_of(&self, staker: &StakerId) -> Option<Amount> {
        self.entry(staker).map(|e| e.amount)
    }

    pub fn staker_count(&self) -> usize {
        self.entries.len()
    }

    pub fn total_staked(&self) -> Amount {
        self.total_staked
    }

    pub fn total_voted_for(&self) -> Amount {
        self.total_voted_for
    }

    pub fn total_voted_against(&self) -> Amount {
        self.total_voted_against
    }

    pub fn total_voted(&self) -> Amount {
        self.total_voted_for + self.total_voted_against
    }

    /// Number of stakers whose vote is set
    pub fn participant_count(&self) -> u32 {
        self.entries.iter().filter(|e| e.vote.is_set()).count() as u32
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Check that a new entry would be accepted, without mutating anything
    pub fn validate_new_stake(&self, staker: &StakerId, amount: Amount) -> Result<(), StakeError> {
        if self.frozen {
            return Err(StakeError::SubjectNotOpen(self.subject_id.clone()));
        }
        if amount == 0 {
            return Err(StakeError::ZeroAmount);
        }
        if self.index.contains_key(staker) {
            return Err(StakeError::DuplicateStaker {
                subject: self.subject_id.clone(),
                staker: staker.clone(),
            });
        }
        self.total_staked
            .checked_add(amount)
            .ok_or_else(|| StakeError::Overflow(self.subject_id.clone()))?;
        Ok(())
    }

    /// Append a new entry with an Unset vote
    pub fn add_entry(&mut self, staker: StakerId, amount: Amount) -> Result<(), StakeError> {
        self.validate_new_stake(&staker, amount)?;

        self.total_staked += amount;
        self.index.insert(staker.clone(), self.entries.len());
        self.entries.push(StakeEntry {
            staker,
            amount,
            vote: Vote::Unset,
        });
        Ok(())
    }

    /// Check that an existing entry can grow by `amount`
    pub fn validate_increase(&self, staker: &StakerId, amount: Amount) -> Result<(), StakeError> {
        if self.frozen {
            return Err(StakeError::SubjectNotOpen(self.subject_id.clone()));
        }
        if amount == 0 {
            return Err(StakeError::ZeroAmount);
        }
        let current = self.stake_of(staker).ok_or_else(|| StakeError::NotStaked {
            subject: self.subject_id.clone(),
            staker: staker.clone(),
        })?;
        current
            .checked_add(amount)
            .and_then(|_| self.total_staked.checked_add(amount))
            .ok_or_else(|| StakeError::Overflow(self.subject_id.clone()))?;
        Ok(())
    }

    /// Merge `amount` into the staker's existing entry, returning the new stake
    pub fn increase(&mut self, staker: &StakerId, amount: Amount) -> Result<Amount, StakeError> {
        self.validate_increase(staker, amount)?;

        let i = self.index[staker];
        self.entries[i].amount += amount;
        self.total_staked += amount;
        Ok(self.entries[i].amount)
    }

    /// Freeze the staker set. Fails with `false` if nobody staked.
    pub fn close_for_voting(&mut self) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        self.frozen = true;
        true
    }

    /// Record a vote for an existing staker, returning the vote's weight
    pub fn record_vote(&mut self, staker: &StakerId, choice: VoteChoice) -> Result<Amount, VoteError> {
        let i = *self.index.get(staker).ok_or_else(|| VoteError::NotEligible {
            subject: self.subject_id.clone(),
            staker: staker.clone(),
        })?;

        let entry = &mut self.entries[i];
        if entry.vote.is_set() {
            return Err(VoteError::AlreadyVoted {
                subject: self.subject_id.clone(),
                staker: staker.clone(),
            });
        }

        entry.vote = choice.into();
        match choice {
            VoteChoice::For => self.total_voted_for += entry.amount,
            VoteChoice::Against => self.total_voted_against += entry.amount,
        }

        debug!(
            "Vote {:?} recorded on {} by {} with weight {}",
            choice, self.subject_id, staker, entry.amount
        );

        Ok(entry.amount)
    }

    /// Clear every vote for a fresh round over the same weights
    pub fn reset_votes(&mut self) {
        for entry in &mut self.entries {
            entry.vote = Vote::Unset;
        }
        self.total_voted_for = 0;
        self.total_voted_against = 0;
    }

    /// Recompute the tallies from the entries and compare
    pub fn invariants_hold(&self) -> bool {
        let staked: Amount = self.entries.iter().map(|e| e.amount).sum();
        let voted_for: Amount = self
            .entries
            .iter()
            .filter(|e| e.vote == Vote::For)
            .map(|e| e.amount)
            .sum();
        let voted_against: Amount = self
            .entries
            .iter()
            .filter(|e| e.vote == Vote::Against)
            .map(|e| e.amount)
            .sum();

        staked == self.total_staked
            && voted_for == self.total_voted_for
            && voted_against == self.total_voted_against
            && self.total_voted() <= self.total_staked
            && self.index.len() == self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> StakePool {
        StakePool::new(SubjectId::from("subject-1"))
    }

    #[test]
    fn test_add_entries_keeps_order_and_totals() {
        let mut pool = pool();
        pool.add_entry(StakerId::from("a"), 100).unwrap();
        pool.add_entry(StakerId::from("b"), 200).unwrap();

        assert_eq!(pool.total_staked(), 300);
        assert_eq!(pool.entries()[0].staker, StakerId::from("a"));
        assert_eq!(pool.entries()[1].staker, StakerId::from("b"));
        assert!(pool.invariants_hold());
    }

    #[test]
    fn test_duplicate_staker_rejected() {
        let mut pool = pool();
        pool.add_entry(StakerId::from("a"), 100).unwrap();

        let err = pool.add_entry(StakerId::from("a"), 50).unwrap_err();
        assert!(matches!(err, StakeError::DuplicateStaker { .. }));
        assert_eq!(pool.total_staked(), 100);
    }

    #[test]
    fn test_increase_merges_into_entry() {
        let mut pool = pool();
        pool.add_entry(StakerId::from("a"), 100).unwrap();

        assert_eq!(pool.increase(&StakerId::from("a"), 25).unwrap(), 125);
        assert_eq!(pool.staker_count(), 1);
        assert_eq!(pool.total_staked(), 125);

        let err = pool.increase(&StakerId::from("b"), 25).unwrap_err();
        assert!(matches!(err, StakeError::NotStaked { .. }));
    }

    #[test]
    fn test_frozen_pool_rejects_stakes() {
        let mut pool = pool();
        assert!(!pool.close_for_voting());

        pool.add_entry(StakerId::from("a"), 100).unwrap();
        assert!(pool.close_for_voting());

        assert!(matches!(
            pool.add_entry(StakerId::from("b"), 10),
            Err(StakeError::SubjectNotOpen(_))
        ));
        assert!(matches!(
            pool.increase(&StakerId::from("a"), 10),
            Err(StakeError::SubjectNotOpen(_))
        ));
    }

    #[test]
    fn test_record_vote_and_reset() {
        let mut pool = pool();
        pool.add_entry(StakerId::from("a"), 100).unwrap();
        pool.add_entry(StakerId::from("b"), 300).unwrap();

        assert_eq!(pool.record_vote(&StakerId::from("a"), VoteChoice::For).unwrap(), 100);
        pool.record_vote(&StakerId::from("b"), VoteChoice::Against).unwrap();

        assert_eq!(pool.total_voted_for(), 100);
        assert_eq!(pool.total_voted_against(), 300);
        assert_eq!(pool.participant_count(), 2);

        assert!(matches!(
            pool.record_vote(&StakerId::from("a"), VoteChoice::Against),
            Err(VoteError::AlreadyVoted { .. })
        ));
        assert!(matches!(
            pool.record_vote(&StakerId::from("z"), VoteChoice::For),
            Err(VoteError::NotEligible { .. })
        ));

        pool.reset_votes();
        assert_eq!(pool.total_voted(), 0);
        assert_eq!(pool.participant_count(), 0);
        assert_eq!(pool.total_staked(), 400);
        assert!(pool.invariants_hold());
    }

    #[test]
    fn test_zero_stake_rejected() {
        let mut pool = pool();
        assert_eq!(pool.add_entry(StakerId::from("a"), 0), Err(StakeError::ZeroAmount));
    }
}
