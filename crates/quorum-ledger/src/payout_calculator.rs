// PAYOUT CALCULATOR
// Proportional rewards for the winning side, slashing for the losing side
//
// SAFETY INVARIANTS:
// 1. Pure function of (pool, outcome, bounty, policy, dispute stake)
// 2. Conservation: everything that came in is either entitled to a party
//    or credited to the treasury (protocol fee + unallocated remainder)
// 3. Sum of rewards never exceeds the reward pool
// 4. Arithmetic is checked; overflow is an error, never a wrap

use crate::ledger_account::AccountError;
use crate::ledger_types::{apply_bps, mul_div, Amount, Outcome, StakerId, SubjectId, Vote};
use crate::stake_pool::StakePool;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PayoutError {
    #[error("Cannot compute payouts for an undecided outcome")]
    Undecided,

    #[error("Arithmetic overflow while computing payouts")]
    Overflow,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClaimError {
    #[error("Staker {staker} already claimed on {subject}")]
    AlreadyClaimed { subject: SubjectId, staker: StakerId },

    #[error("Nothing owed to {staker} on {subject}")]
    NothingOwed { subject: SubjectId, staker: StakerId },

    #[error("Subject {0} is not finalized")]
    NotResolved(SubjectId),

    #[error("Unknown subject {0}")]
    UnknownSubject(SubjectId),

    #[error("Account error: {0}")]
    Account(#[from] AccountError),
}

/// What happens to stakers who never voted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NonVoterPolicy {
    /// Stake returned in full, no reward
    #[default]
    Refund,
    /// Treated as a losing voter and slashed
    Slash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutPolicy {
    pub slash_bps: u32,
    pub protocol_fee_bps: u32,
    pub non_voter_policy: NonVoterPolicy,
}

/// Dispute bond taking part in settlement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeStake {
    pub disputer: StakerId,
    pub stake: Amount,
    /// The dispute round reversed the original outcome
    pub overturned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayoutRole {
    Winner,
    Loser,
    NonVoterRefunded,
    NonVoterSlashed,
    DisputerUpheld,
    DisputerForfeited,
}

/// Settlement of one position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutLine {
    pub staker: StakerId,
    pub stake: Amount,
    pub role: PayoutRole,
    pub slashed: Amount,
    pub reward: Amount,
    /// stake - slashed + reward
    pub entitlement: Amount,
}

/// Computed, not yet disbursed, settlement of a subject
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutSchedule {
    pub outcome: Outcome,
    pub lines: Vec<PayoutLine>,
    /// Per-party sum of line entitlements
    pub entitlements: BTreeMap<StakerId, Amount>,
    /// Stakes + bounty + dispute stake
    pub total_in: Amount,
    pub slashed_pool: Amount,
    pub bounty: Amount,
    /// slashed_pool + bounty
    pub distributable: Amount,
    pub protocol_fee: Amount,
    /// distributable - protocol_fee
    pub reward_pool: Amount,
    /// Combined weight of the winning side
    pub winning_weight: Amount,
    /// Rounding dust, or the whole reward pool when nobody won
    pub unallocated: Amount,
}

impl PayoutSchedule {
    pub fn entitlement_of(&self, staker: &StakerId) -> Amount {
        self.entitlements.get(staker).copied().unwrap_or(0)
    }

    pub fn total_entitled(&self) -> Amount {
        self.entitlements.values().sum()
    }

    /// Credited to the treasury on finalization
    pub fn treasury_share(&self) -> Amount {
        self.protocol_fee + self.unallocated
    }

    pub fn total_rewards(&self) -> Amount {
        self.lines.iter().map(|l| l.reward).sum()
    }

    pub fn is_conserved(&self) -> bool {
        self.total_entitled() + self.treasury_share() == self.total_in
            && self.total_rewards() <= self.reward_pool
    }
}

/// Stateless settlement rules
pub struct PayoutCalculator;

impl PayoutCalculator {
    pub fn compute(
        pool: &StakePool,
        outcome: Outcome,
        bounty: Amount,
        policy: &PayoutPolicy,
        dispute: Option<&DisputeStake>,
    ) -> Result<PayoutSchedule, PayoutError> {
        let winning = outcome.winning_vote().ok_or(PayoutError::Undecided)?;

        let mut lines = Vec::with_capacity(pool.staker_count() + 1);
        let mut slashed_pool: Amount = 0;
        let mut winning_weight: Amount = 0;

        for entry in pool.entries() {
            let role = if entry.vote == winning {
                PayoutRole::Winner
            } else if entry.vote != Vote::Unset {
                PayoutRole::Loser
            } else {
                match policy.non_voter_policy {
                    NonVoterPolicy::Refund => PayoutRole::NonVoterRefunded,
                    NonVoterPolicy::Slash => PayoutRole::NonVoterSlashed,
                }
            };

            let slashed = match role {
                PayoutRole::Loser | PayoutRole::NonVoterSlashed => {
                    apply_bps(entry.amount, policy.slash_bps).ok_or(PayoutError::Overflow)?
                }
                _ => 0,
            };

            if role == PayoutRole::Winner {
                winning_weight = checked_add(winning_weight, entry.amount)?;
            }
            slashed_pool = checked_add(slashed_pool, slashed)?;

            lines.push(PayoutLine {
                staker: entry.staker.clone(),
                stake: entry.amount,
                role,
                slashed,
                reward: 0,
                entitlement: entry.amount - slashed,
            });
        }

        let mut total_in = checked_add(pool.total_staked(), bounty)?;

        if let Some(dispute) = dispute {
            total_in = checked_add(total_in, dispute.stake)?;
            let line = if dispute.overturned {
                winning_weight = checked_add(winning_weight, dispute.stake)?;
                PayoutLine {
                    staker: dispute.disputer.clone(),
                    stake: dispute.stake,
                    role: PayoutRole::DisputerUpheld,
                    slashed: 0,
                    reward: 0,
                    entitlement: dispute.stake,
                }
            } else {
                slashed_pool = checked_add(slashed_pool, dispute.stake)?;
                PayoutLine {
                    staker: dispute.disputer.clone(),
                    stake: dispute.stake,
                    role: PayoutRole::DisputerForfeited,
                    slashed: dispute.stake,
                    reward: 0,
                    entitlement: 0,
                }
            };
            lines.push(line);
        }

        let distributable = checked_add(slashed_pool, bounty)?;
        let protocol_fee = apply_bps(distributable, policy.protocol_fee_bps).ok_or(PayoutError::Overflow)?;
        let reward_pool = distributable - protocol_fee;

        let mut distributed: Amount = 0;
        if winning_weight > 0 {
            for line in lines
                .iter_mut()
                .filter(|l| matches!(l.role, PayoutRole::Winner | PayoutRole::DisputerUpheld))
            {
                // stake <= winning_weight, so the share never exceeds reward_pool
                let reward = mul_div(line.stake, reward_pool, winning_weight).ok_or(PayoutError::Overflow)?;
                line.reward = reward;
                line.entitlement = checked_add(line.entitlement, reward)?;
                distributed += reward;
            }
        }

        let mut entitlements = BTreeMap::new();
        for line in &lines {
            let slot = entitlements.entry(line.staker.clone()).or_insert(0u128);
            *slot = checked_add(*slot, line.entitlement)?;
        }

        Ok(PayoutSchedule {
            outcome,
            lines,
            entitlements,
            total_in,
            slashed_pool,
            bounty,
            distributable,
            protocol_fee,
            reward_pool,
            winning_weight,
            unallocated: reward_pool - distributed,
        })
    }
}

fn checked_add(a: Amount, b: Amount) -> Result<Amount, PayoutError> {
    a.checked_add(b).ok_or(PayoutError::Overflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger_types::VoteChoice;

    fn policy(slash_bps: u32, protocol_fee_bps: u32, non_voter_policy: NonVoterPolicy) -> PayoutPolicy {
        PayoutPolicy {
            slash_bps,
            protocol_fee_bps,
            non_voter_policy,
        }
    }

    fn voted_pool(votes: &[(&str, Amount, Option<VoteChoice>)]) -> StakePool {
        let mut pool = StakePool::new(SubjectId::from("s"));
        for (staker, amount, _) in votes {
            pool.add_entry(StakerId::from(*staker), *amount).unwrap();
        }
        pool.close_for_voting();
        for (staker, _, choice) in votes {
            if let Some(choice) = choice {
                pool.record_vote(&StakerId::from(*staker), *choice).unwrap();
            }
        }
        pool
    }

    #[test]
    fn test_against_side_splits_slashed_for_stakes() {
        let pool = voted_pool(&[
            ("a", 100, Some(VoteChoice::For)),
            ("b", 100, Some(VoteChoice::For)),
            ("c", 200, Some(VoteChoice::Against)),
        ]);
        let schedule =
            PayoutCalculator::compute(&pool, Outcome::Failed, 0, &policy(10_000, 0, NonVoterPolicy::Refund), None)
                .unwrap();

        assert_eq!(schedule.entitlement_of(&StakerId::from("a")), 0);
        assert_eq!(schedule.entitlement_of(&StakerId::from("b")), 0);
        assert_eq!(schedule.entitlement_of(&StakerId::from("c")), 400);
        assert!(schedule.is_conserved());
    }

    #[test]
    fn test_partial_slash_with_fee() {
        let pool = voted_pool(&[
            ("a", 100, Some(VoteChoice::For)),
            ("b", 200, Some(VoteChoice::For)),
            ("c", 100, Some(VoteChoice::Against)),
        ]);
        // half of c's stake is slashed, 10% fee on the slashed pool
        let schedule =
            PayoutCalculator::compute(&pool, Outcome::Passed, 0, &policy(5_000, 1_000, NonVoterPolicy::Refund), None)
                .unwrap();

        assert_eq!(schedule.slashed_pool, 50);
        assert_eq!(schedule.protocol_fee, 5);
        assert_eq!(schedule.reward_pool, 45);
        // 100 * 45 / 300 = 15, 200 * 45 / 300 = 30
        assert_eq!(schedule.entitlement_of(&StakerId::from("a")), 115);
        assert_eq!(schedule.entitlement_of(&StakerId::from("b")), 230);
        assert_eq!(schedule.entitlement_of(&StakerId::from("c")), 50);
        assert_eq!(schedule.unallocated, 0);
        assert!(schedule.is_conserved());
    }

    #[test]
    fn test_rounding_dust_goes_to_treasury() {
        let pool = voted_pool(&[
            ("a", 1, Some(VoteChoice::For)),
            ("b", 1, Some(VoteChoice::For)),
            ("c", 1, Some(VoteChoice::For)),
            ("d", 10, Some(VoteChoice::Against)),
        ]);
        let schedule =
            PayoutCalculator::compute(&pool, Outcome::Passed, 0, &policy(10_000, 0, NonVoterPolicy::Refund), None)
                .unwrap();

        // each winner gets 10 * 1 / 3 = 3, one unit left over
        assert_eq!(schedule.entitlement_of(&StakerId::from("a")), 4);
        assert_eq!(schedule.unallocated, 1);
        assert_eq!(schedule.treasury_share(), 1);
        assert!(schedule.is_conserved());
    }

    #[test]
    fn test_non_voter_policies() {
        let pool = voted_pool(&[
            ("a", 100, Some(VoteChoice::For)),
            ("idle", 100, None),
        ]);

        let refund =
            PayoutCalculator::compute(&pool, Outcome::Passed, 0, &policy(10_000, 0, NonVoterPolicy::Refund), None)
                .unwrap();
        assert_eq!(refund.entitlement_of(&StakerId::from("idle")), 100);
        assert_eq!(refund.entitlement_of(&StakerId::from("a")), 100);

        let slash =
            PayoutCalculator::compute(&pool, Outcome::Passed, 0, &policy(10_000, 0, NonVoterPolicy::Slash), None)
                .unwrap();
        assert_eq!(slash.entitlement_of(&StakerId::from("idle")), 0);
        assert_eq!(slash.entitlement_of(&StakerId::from("a")), 200);
        assert!(slash.is_conserved());
    }

    #[test]
    fn test_no_winners_sends_reward_pool_to_treasury() {
        let pool = voted_pool(&[("a", 100, Some(VoteChoice::For)), ("b", 100, None)]);
        let schedule =
            PayoutCalculator::compute(&pool, Outcome::Failed, 40, &policy(10_000, 0, NonVoterPolicy::Refund), None)
                .unwrap();

        assert_eq!(schedule.winning_weight, 0);
        assert_eq!(schedule.entitlement_of(&StakerId::from("a")), 0);
        assert_eq!(schedule.entitlement_of(&StakerId::from("b")), 100);
        assert_eq!(schedule.unallocated, 140);
        assert!(schedule.is_conserved());
    }

    #[test]
    fn test_dispute_stake_upheld_and_forfeited() {
        let pool = voted_pool(&[
            ("a", 100, Some(VoteChoice::For)),
            ("b", 100, Some(VoteChoice::Against)),
        ]);
        let p = policy(10_000, 0, NonVoterPolicy::Refund);

        let upheld = DisputeStake {
            disputer: StakerId::from("d"),
            stake: 100,
            overturned: true,
        };
        let schedule = PayoutCalculator::compute(&pool, Outcome::Passed, 0, &p, Some(&upheld)).unwrap();
        // a and d share b's 100 by weight
        assert_eq!(schedule.entitlement_of(&StakerId::from("d")), 150);
        assert_eq!(schedule.entitlement_of(&StakerId::from("a")), 150);
        assert!(schedule.is_conserved());

        let forfeited = DisputeStake {
            overturned: false,
            ..upheld
        };
        let schedule = PayoutCalculator::compute(&pool, Outcome::Passed, 0, &p, Some(&forfeited)).unwrap();
        assert_eq!(schedule.entitlement_of(&StakerId::from("d")), 0);
        assert_eq!(schedule.entitlement_of(&StakerId::from("a")), 300);
        assert!(schedule.is_conserved());
    }

    #[test]
    fn test_token_scale_stakes_split_exactly() {
        let token: Amount = 10u128.pow(18);
        let pool = voted_pool(&[
            ("a", 100 * token, Some(VoteChoice::For)),
            ("b", 200 * token, Some(VoteChoice::For)),
            ("c", 150 * token, Some(VoteChoice::Against)),
        ]);
        let schedule =
            PayoutCalculator::compute(&pool, Outcome::Passed, 0, &policy(10_000, 500, NonVoterPolicy::Refund), None)
                .unwrap();

        // 150 slashed, 5% fee leaves 142.5 to share over 300 winning weight
        assert_eq!(schedule.protocol_fee, 75 * token / 10);
        assert_eq!(schedule.reward_pool, 1_425 * token / 10);
        assert_eq!(schedule.entitlement_of(&StakerId::from("a")), 1_475 * token / 10);
        assert_eq!(schedule.entitlement_of(&StakerId::from("b")), 295 * token);
        assert_eq!(schedule.entitlement_of(&StakerId::from("c")), 0);
        assert_eq!(schedule.unallocated, 0);
        assert!(schedule.is_conserved());
    }

    #[test]
    fn test_undecided_outcome_rejected() {
        let pool = voted_pool(&[("a", 100, Some(VoteChoice::For))]);
        let result =
            PayoutCalculator::compute(&pool, Outcome::Undecided, 0, &policy(0, 0, NonVoterPolicy::Refund), None);
        assert_eq!(result.unwrap_err(), PayoutError::Undecided);
    }
}
