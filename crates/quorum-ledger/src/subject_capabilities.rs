//! Capability traits the registry drives subjects through.

use crate::ledger_account::LedgerAccount;
use crate::ledger_types::{Amount, Outcome, StakerId, Timestamp, VoteChoice};
use crate::resolution_engine::{StateError, SubjectSnapshot, SubjectState};
use crate::stake_pool::StakeError;
use crate::voting_round::VoteError;

/// Accepts locked value against a subject while it is open
pub trait Stakeable {
    /// Debit and lock `account` for a new position
    fn stake(&mut self, account: &mut LedgerAccount, amount: Amount) -> Result<(), StakeError>;

    /// Grow an existing position, returning the merged stake
    fn increase_stake(&mut self, account: &mut LedgerAccount, amount: Amount) -> Result<Amount, StakeError>;

    /// Add to the reward pool, returning the total bounty
    fn fund_bounty(&mut self, funder: &mut LedgerAccount, amount: Amount) -> Result<Amount, StakeError>;

    /// Freeze the staker set and open the voting window
    fn advance_to_voting(&mut self, now: Timestamp) -> Result<(), StateError>;
}

/// Collects votes from stakers
pub trait Votable {
    /// Record a vote; returns the outcome if the vote triggered resolution
    fn cast_vote(&mut self, staker: &StakerId, choice: VoteChoice, now: Timestamp) -> Result<Option<Outcome>, VoteError>;
}

/// Produces an outcome once trigger conditions hold
pub trait Resolvable {
    fn state(&self) -> SubjectState;

    /// Resolve if possible. Already-decided subjects return their outcome unchanged.
    fn try_resolve(&mut self, now: Timestamp) -> Option<Outcome>;

    fn snapshot(&self) -> SubjectSnapshot;
}
