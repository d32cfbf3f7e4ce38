// VOTING ROUND
// Deadline-bound, stake-weighted vote collection and outcome computation
//
// SAFETY INVARIANTS:
// 1. Outcome is Undecided until the deadline passes or the fast path triggers
// 2. Once decided, the outcome is immutable; re-triggering is a no-op
// 3. Insufficient participation always resolves to Failed, never Passed
// 4. Exact-threshold ties pass (>=, not >)
// 5. Resolution is a pure function of the tallies: no hidden randomness

use crate::ledger_config::SubjectConfig;
use crate::ledger_types::{Amount, Outcome, StakerId, SubjectId, Timestamp, VoteChoice, BPS_DENOMINATOR};
use crate::resolution_engine::StateError;
use crate::stake_pool::StakePool;
use log::info;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VoteError {
    #[error("Staker {staker} has no stake on {subject}")]
    NotEligible { subject: SubjectId, staker: StakerId },

    #[error("Staker {staker} already voted on {subject}")]
    AlreadyVoted { subject: SubjectId, staker: StakerId },

    #[error("Voting closed on {0}")]
    VotingClosed(SubjectId),

    #[error("State error: {0}")]
    State(#[from] StateError),
}

/// Which round of a subject this is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundKind {
    /// First vote after staking closes
    Primary,
    /// Re-vote triggered by a dispute
    Dispute,
}

/// Tallies frozen at the moment of resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundTally {
    pub total_staked: Amount,
    pub voted_for: Amount,
    pub voted_against: Amount,
    pub participants: u32,

    /// Whether the weight quorum was reached
    pub quorum_met: bool,

    /// `voted_for * 100 / voted`, when quorum was met
    pub for_percentage: Option<u128>,

    /// Resolved early through the participant fast path
    pub fast_path: bool,

    pub resolved_at: Timestamp,
}

/// A single round of voting over a stake pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VotingRound {
    pub subject_id: SubjectId,

    pub kind: RoundKind,

    /// Set when the round starts accepting votes
    pub opened_at: Option<Timestamp>,

    /// Votes after this instant are rejected
    pub voting_deadline: Option<Timestamp>,

    /// Fast-path participant quorum
    pub min_participants: u32,

    /// Weight quorum (basis points of total stake)
    pub min_stake_bps: u32,

    /// "For" percentage required to pass
    pub supermajority_pct: u8,

    pub outcome: Outcome,

    pub tally: Option<RoundTally>,
}

impl VotingRound {
    pub fn new(subject_id: SubjectId, kind: RoundKind, config: &SubjectConfig) -> Self {
        VotingRound {
            subject_id,
            kind,
            opened_at: None,
            voting_deadline: None,
            min_participants: config.min_participants,
            min_stake_bps: config.min_stake_bps,
            supermajority_pct: config.supermajority_pct,
            outcome: Outcome::Undecided,
            tally: None,
        }
    }

    /// Start the voting window
    pub fn open(&mut self, now: Timestamp, duration_secs: u64) {
        self.opened_at = Some(now);
        self.voting_deadline = Some(now.saturating_add(duration_secs));
    }

    pub fn is_open_at(&self, now: Timestamp) -> bool {
        match self.voting_deadline {
            Some(deadline) => !self.outcome.is_decided() && now <= deadline,
            None => false,
        }
    }

    pub fn deadline_passed(&self, now: Timestamp) -> bool {
        matches!(self.voting_deadline, Some(deadline) if now >= deadline)
    }

    /// Record a vote from an eligible staker.
    ///
    /// Checked in order: `NotEligible`, `AlreadyVoted`, then `VotingClosed`.
    pub fn cast_vote(
        &self,
        pool: &mut StakePool,
        staker: &StakerId,
        choice: VoteChoice,
        now: Timestamp,
    ) -> Result<Amount, VoteError> {
        match pool.entry(staker) {
            None => {
                return Err(VoteError::NotEligible {
                    subject: self.subject_id.clone(),
                    staker: staker.clone(),
                })
            }
            Some(entry) if entry.vote.is_set() => {
                return Err(VoteError::AlreadyVoted {
                    subject: self.subject_id.clone(),
                    staker: staker.clone(),
                })
            }
            Some(_) => {}
        }
        if !self.is_open_at(now) {
            return Err(VoteError::VotingClosed(self.subject_id.clone()));
        }
        pool.record_vote(staker, choice)
    }

    /// Whether a resolution attempt would produce an outcome now
    pub fn trigger_met(&self, pool: &StakePool, now: Timestamp) -> bool {
        self.fast_path_met(pool) || self.deadline_passed(now)
    }

    fn fast_path_met(&self, pool: &StakePool) -> bool {
        pool.participant_count() >= self.min_participants && pool.total_staked() > 0
    }

    /// Compute the outcome this round would resolve to, without committing it
    pub fn evaluate(&self, pool: &StakePool, now: Timestamp) -> Option<(Outcome, RoundTally)> {
        if self.outcome.is_decided() || self.voting_deadline.is_none() {
            return None;
        }
        if !self.trigger_met(pool, now) {
            return None;
        }

        let (outcome, quorum_met, for_percentage) = tally_outcome(
            pool.total_staked(),
            pool.total_voted_for(),
            pool.total_voted_against(),
            self.min_stake_bps,
            self.supermajority_pct,
        );

        let tally = RoundTally {
            total_staked: pool.total_staked(),
            voted_for: pool.total_voted_for(),
            voted_against: pool.total_voted_against(),
            participants: pool.participant_count(),
            quorum_met,
            for_percentage,
            fast_path: !self.deadline_passed(now),
            resolved_at: now,
        };

        Some((outcome, tally))
    }

    /// Commit a previously evaluated outcome. Ignored once decided.
    pub fn record_outcome(&mut self, outcome: Outcome, tally: RoundTally) {
        if self.outcome.is_decided() || !outcome.is_decided() {
            return;
        }

        info!(
            "{:?} round on {} resolved {} (for {} / against {} of {} staked)",
            self.kind, self.subject_id, outcome, tally.voted_for, tally.voted_against, tally.total_staked
        );

        self.outcome = outcome;
        self.tally = Some(tally);
    }

    /// Evaluate and commit in one step
    pub fn try_resolve(&mut self, pool: &StakePool, now: Timestamp) -> Option<Outcome> {
        if self.outcome.is_decided() {
            return Some(self.outcome);
        }
        let (outcome, tally) = self.evaluate(pool, now)?;
        self.record_outcome(outcome, tally);
        Some(self.outcome)
    }
}

/// Quorum and supermajority rule.
///
/// Returns `(outcome, quorum_met, for_percentage)`. Never returns `Undecided`.
pub fn tally_outcome(
    total_staked: Amount,
    voted_for: Amount,
    voted_against: Amount,
    min_stake_bps: u32,
    supermajority_pct: u8,
) -> (Outcome, bool, Option<u128>) {
    if voted_for == 0 && voted_against == 0 {
        return (Outcome::Failed, false, None);
    }

    let voted = BigUint::from(voted_for) + BigUint::from(voted_against);

    // voted < total_staked * min_stake_fraction, cross-multiplied to stay exact
    let below_quorum = voted.clone() * BigUint::from(BPS_DENOMINATOR)
        < BigUint::from(total_staked) * BigUint::from(min_stake_bps);
    if below_quorum {
        return (Outcome::Failed, false, None);
    }

    // voted_for <= voted, so this is at most 100
    let scaled = BigUint::from(voted_for) * BigUint::from(100u32) / voted;
    let for_percentage = Amount::try_from(scaled).unwrap_or(100);

    let outcome = if for_percentage >= supermajority_pct as u128 {
        Outcome::Passed
    } else {
        Outcome::Failed
    };

    (outcome, true, Some(for_percentage))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(min_participants: u32, min_stake_bps: u32, supermajority_pct: u8) -> SubjectConfig {
        SubjectConfig {
            min_participants,
            min_stake_bps,
            supermajority_pct,
            voting_duration_secs: 100,
            ..SubjectConfig::default()
        }
    }

    fn pool_with(stakes: &[(&str, Amount)]) -> StakePool {
        let mut pool = StakePool::new(SubjectId::from("s"));
        for (staker, amount) in stakes {
            pool.add_entry(StakerId::from(*staker), *amount).unwrap();
        }
        pool.close_for_voting();
        pool
    }

    #[test]
    fn test_split_vote_below_supermajority_fails() {
        let mut pool = pool_with(&[("a", 100), ("b", 100), ("c", 200)]);
        let mut round = VotingRound::new(SubjectId::from("s"), RoundKind::Primary, &config(3, 5_000, 60));
        round.open(0, 100);

        round.cast_vote(&mut pool, &StakerId::from("a"), VoteChoice::For, 1).unwrap();
        round.cast_vote(&mut pool, &StakerId::from("b"), VoteChoice::For, 1).unwrap();
        assert_eq!(round.try_resolve(&pool, 1), None);

        round.cast_vote(&mut pool, &StakerId::from("c"), VoteChoice::Against, 1).unwrap();
        assert_eq!(round.try_resolve(&pool, 1), Some(Outcome::Failed));

        let tally = round.tally.as_ref().unwrap();
        assert_eq!(tally.for_percentage, Some(50));
        assert!(tally.quorum_met);
        assert!(tally.fast_path);
    }

    #[test]
    fn test_supermajority_passes() {
        let mut pool = pool_with(&[("a", 100), ("b", 200), ("c", 100)]);
        let mut round = VotingRound::new(SubjectId::from("s"), RoundKind::Primary, &config(3, 5_000, 60));
        round.open(0, 100);

        round.cast_vote(&mut pool, &StakerId::from("a"), VoteChoice::For, 5).unwrap();
        round.cast_vote(&mut pool, &StakerId::from("b"), VoteChoice::For, 5).unwrap();
        round.cast_vote(&mut pool, &StakerId::from("c"), VoteChoice::Against, 5).unwrap();

        assert_eq!(round.try_resolve(&pool, 5), Some(Outcome::Passed));
        assert_eq!(round.tally.as_ref().unwrap().for_percentage, Some(75));
    }

    #[test]
    fn test_quorum_failure_rejects_unanimous_for() {
        let mut pool = pool_with(&[("a", 100), ("b", 50), ("c", 250)]);
        let mut round = VotingRound::new(SubjectId::from("s"), RoundKind::Primary, &config(3, 5_000, 60));
        round.open(0, 100);

        round.cast_vote(&mut pool, &StakerId::from("a"), VoteChoice::For, 10).unwrap();
        round.cast_vote(&mut pool, &StakerId::from("b"), VoteChoice::For, 10).unwrap();

        // not enough participants for the fast path, deadline not reached
        assert_eq!(round.try_resolve(&pool, 99), None);
        assert_eq!(round.try_resolve(&pool, 100), Some(Outcome::Failed));

        let tally = round.tally.as_ref().unwrap();
        assert!(!tally.quorum_met);
        assert!(!tally.fast_path);
    }

    #[test]
    fn test_exact_threshold_is_inclusive() {
        assert_eq!(tally_outcome(100, 60, 40, 0, 60), (Outcome::Passed, true, Some(60)));
        assert_eq!(tally_outcome(100, 59, 41, 0, 60).0, Outcome::Failed);
    }

    #[test]
    fn test_no_votes_fails_even_without_weight_quorum() {
        assert_eq!(tally_outcome(100, 0, 0, 0, 0), (Outcome::Failed, false, None));
    }

    #[test]
    fn test_votes_after_deadline_rejected() {
        let mut pool = pool_with(&[("a", 100)]);
        let round = VotingRound::new(SubjectId::from("s"), RoundKind::Primary, &config(3, 0, 60));

        // not yet opened
        assert!(matches!(
            round.cast_vote(&mut pool, &StakerId::from("a"), VoteChoice::For, 0),
            Err(VoteError::VotingClosed(_))
        ));

        let mut round = round;
        round.open(10, 20);
        assert!(matches!(
            round.cast_vote(&mut pool, &StakerId::from("a"), VoteChoice::For, 31),
            Err(VoteError::VotingClosed(_))
        ));
        // the deadline instant itself still accepts votes
        assert!(round.cast_vote(&mut pool, &StakerId::from("a"), VoteChoice::For, 30).is_ok());
    }

    #[test]
    fn test_outcome_is_immutable() {
        let mut pool = pool_with(&[("a", 100), ("b", 100)]);
        let mut round = VotingRound::new(SubjectId::from("s"), RoundKind::Primary, &config(1, 0, 60));
        round.open(0, 10);

        round.cast_vote(&mut pool, &StakerId::from("a"), VoteChoice::Against, 1).unwrap();
        assert_eq!(round.try_resolve(&pool, 1), Some(Outcome::Failed));

        let tally = round.tally.clone().unwrap();
        round.record_outcome(Outcome::Passed, tally);
        assert_eq!(round.outcome, Outcome::Failed);
        assert_eq!(round.try_resolve(&pool, 50), Some(Outcome::Failed));
        assert!(matches!(
            round.cast_vote(&mut pool, &StakerId::from("b"), VoteChoice::For, 2),
            Err(VoteError::VotingClosed(_))
        ));
    }

    #[test]
    fn test_eligibility_checked_before_deadline() {
        let mut pool = pool_with(&[("a", 100), ("b", 100)]);
        let mut round = VotingRound::new(SubjectId::from("s"), RoundKind::Primary, &config(3, 0, 60));
        round.open(0, 10);
        round.cast_vote(&mut pool, &StakerId::from("a"), VoteChoice::For, 1).unwrap();

        assert!(matches!(
            round.cast_vote(&mut pool, &StakerId::from("stranger"), VoteChoice::For, 11),
            Err(VoteError::NotEligible { .. })
        ));
        assert!(matches!(
            round.cast_vote(&mut pool, &StakerId::from("a"), VoteChoice::Against, 11),
            Err(VoteError::AlreadyVoted { .. })
        ));
        assert!(matches!(
            round.cast_vote(&mut pool, &StakerId::from("b"), VoteChoice::For, 11),
            Err(VoteError::VotingClosed(_))
        ));
    }

    #[test]
    fn test_wide_tallies_stay_exact() {
        let e36 = 10u128.pow(36);
        let voted_for = 6 * e36 - 1;
        let voted_against = 4 * e36;

        // 59.99..% rounds down to 59 and misses a 60% threshold
        assert_eq!(
            tally_outcome(voted_for + voted_against, voted_for, voted_against, 0, 60),
            (Outcome::Failed, true, Some(59))
        );
        assert_eq!(
            tally_outcome(voted_for + 1 + voted_against, voted_for + 1, voted_against, 0, 60),
            (Outcome::Passed, true, Some(60))
        );
    }

    #[test]
    fn test_wide_quorum_boundary() {
        // total * 5_000 / 10_000 lands half a unit above 2^127 - 1
        let half = u128::MAX / 2;
        assert_eq!(tally_outcome(u128::MAX, half, 0, 5_000, 60), (Outcome::Failed, false, None));
        assert_eq!(
            tally_outcome(u128::MAX, half + 1, 0, 5_000, 60),
            (Outcome::Passed, true, Some(100))
        );
    }
}
