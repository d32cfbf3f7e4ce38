// RESOLUTION ENGINE
// Per-subject state machine: Open -> Voting -> Resolved -> (Disputed -> Resolved)? -> Finalized
//
// SAFETY INVARIANTS:
// 1. Transitions only move forward, except the single Resolved -> Disputed -> Resolved cycle
// 2. At most one dispute per subject (dispute_used flag, independent of state)
// 3. Every operation validates before mutating; an error leaves the subject untouched
// 4. Payouts are computed at resolution but only disbursed after finalization
// 5. Every transition is recorded in a hash-chained history

use crate::ledger_account::{AccountError, LedgerAccount};
use crate::ledger_config::SubjectConfig;
use crate::ledger_types::{Amount, Outcome, StakerId, SubjectId, Timestamp, VoteChoice};
use crate::payout_calculator::{ClaimError, DisputeStake, PayoutCalculator, PayoutError, PayoutSchedule};
use crate::stake_pool::{StakeError, StakePool};
use crate::subject_capabilities::{Resolvable, Stakeable, Votable};
use crate::voting_round::{RoundKind, VoteError, VotingRound};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("Unknown subject {0}")]
    UnknownSubject(SubjectId),

    #[error("Subject {0} already exists")]
    SubjectExists(SubjectId),

    #[error("Operation {operation} not allowed on {subject} in state {state}")]
    InvalidState {
        subject: SubjectId,
        state: SubjectState,
        operation: &'static str,
    },

    #[error("Subject {0} has no stakers")]
    NoStakers(SubjectId),

    #[error("Resolution conditions not yet met on {0}")]
    ResolutionPending(SubjectId),

    #[error("Dispute window on {subject} open until {closes_at}")]
    DisputeWindowOpen { subject: SubjectId, closes_at: Timestamp },

    #[error("Subject {0} cannot be archived yet")]
    NotArchivable(SubjectId),

    #[error("Invalid subject config: {0}")]
    InvalidConfig(String),

    #[error("Payout error: {0}")]
    Payout(#[from] PayoutError),

    #[error("Account error: {0}")]
    Account(#[from] AccountError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DisputeError {
    #[error("Subject {0} has already been disputed")]
    DisputeAlreadyUsed(SubjectId),

    #[error("Dispute stake {offered} below required {required}")]
    InsufficientDisputeStake { required: Amount, offered: Amount },

    #[error("Subject {subject} cannot be disputed in state {state}")]
    WrongState { subject: SubjectId, state: SubjectState },

    #[error("Dispute window on {0} has closed")]
    DisputeWindowClosed(SubjectId),

    #[error("Unknown subject {0}")]
    UnknownSubject(SubjectId),

    #[error("Account error: {0}")]
    Account(#[from] AccountError),

    #[error("State error: {0}")]
    State(#[from] StateError),
}

/// Lifecycle state of a subject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubjectState {
    /// Accepting stakes
    Open,
    /// Accepting votes, deadline running
    Voting,
    /// Outcome decided, dispute window running
    Resolved(Outcome),
    /// Re-vote in progress
    Disputed,
    /// Outcome final, claims open
    Finalized(Outcome),
}

impl SubjectState {
    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            SubjectState::Resolved(o) | SubjectState::Finalized(o) => Some(*o),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SubjectState::Open => "Open",
            SubjectState::Voting => "Voting",
            SubjectState::Resolved(_) => "Resolved",
            SubjectState::Disputed => "Disputed",
            SubjectState::Finalized(_) => "Finalized",
        }
    }
}

impl fmt::Display for SubjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.outcome() {
            Some(outcome) => write!(f, "{}({})", self.name(), outcome),
            None => f.write_str(self.name()),
        }
    }
}

/// Record of a state transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: SubjectState,
    pub to: SubjectState,
    pub at: Timestamp,
    /// SHA-256 over the previous hash and this transition
    pub transition_hash: Vec<u8>,
}

/// The one dispute a subject may carry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeRecord {
    pub disputer: StakerId,
    pub stake: Amount,
    pub opened_at: Timestamp,
    /// Outcome being challenged
    pub original_outcome: Outcome,
    /// Outcome of the re-vote, once decided
    pub final_outcome: Option<Outcome>,
}

impl DisputeRecord {
    pub fn overturned(&self) -> Option<bool> {
        self.final_outcome.map(|o| o != self.original_outcome)
    }
}

/// Read-only view of a subject
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectSnapshot {
    pub subject_id: SubjectId,
    pub state: SubjectState,
    pub round: RoundKind,
    pub opened_at: Option<Timestamp>,
    pub voting_deadline: Option<Timestamp>,
    pub outcome: Outcome,
    pub staker_count: usize,
    pub participants: u32,
    pub total_staked: Amount,
    pub total_voted_for: Amount,
    pub total_voted_against: Amount,
    pub bounty: Amount,
    pub dispute_used: bool,
    pub dispute: Option<DisputeRecord>,
    pub resolved_at: Option<Timestamp>,
    pub dispute_window_closes_at: Option<Timestamp>,
    pub unclaimed_parties: usize,
}

/// State machine and settlement book for one subject
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionEngine {
    subject_id: SubjectId,
    config: SubjectConfig,
    state: SubjectState,
    created_at: Timestamp,

    pool: StakePool,

    /// Current round (the dispute round once a dispute opens)
    round: VotingRound,

    /// Primary round kept for audit after a dispute replaces it
    superseded_round: Option<VotingRound>,

    bounty: Amount,
    bounty_funders: BTreeMap<StakerId, Amount>,

    dispute_used: bool,
    dispute: Option<DisputeRecord>,

    resolved_at: Option<Timestamp>,

    /// Computed at resolution, disbursed through claims after finalization
    payout: Option<PayoutSchedule>,

    claims: BTreeMap<StakerId, bool>,

    /// Account locks this subject holds, per party
    locks_held: BTreeMap<StakerId, u32>,

    treasury_settled: bool,

    history: Vec<StateTransition>,
}

impl ResolutionEngine {
    /// Create a subject in `Open`. The config must already be validated.
    pub fn new(subject_id: SubjectId, config: SubjectConfig, now: Timestamp) -> Self {
        let round = VotingRound::new(subject_id.clone(), RoundKind::Primary, &config);
        ResolutionEngine {
            pool: StakePool::new(subject_id.clone()),
            subject_id,
            config,
            state: SubjectState::Open,
            created_at: now,
            round,
            superseded_round: None,
            bounty: 0,
            bounty_funders: BTreeMap::new(),
            dispute_used: false,
            dispute: None,
            resolved_at: None,
            payout: None,
            claims: BTreeMap::new(),
            locks_held: BTreeMap::new(),
            treasury_settled: false,
            history: Vec::new(),
        }
    }

    pub fn subject_id(&self) -> &SubjectId {
        &self.subject_id
    }

    pub fn config(&self) -> &SubjectConfig {
        &self.config
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn pool(&self) -> &StakePool {
        &self.pool
    }

    pub fn round(&self) -> &VotingRound {
        &self.round
    }

    pub fn superseded_round(&self) -> Option<&VotingRound> {
        self.superseded_round.as_ref()
    }

    pub fn bounty(&self) -> Amount {
        self.bounty
    }

    pub fn dispute(&self) -> Option<&DisputeRecord> {
        self.dispute.as_ref()
    }

    pub fn dispute_used(&self) -> bool {
        self.dispute_used
    }

    pub fn payout(&self) -> Option<&PayoutSchedule> {
        self.payout.as_ref()
    }

    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    pub fn dispute_window_closes_at(&self) -> Option<Timestamp> {
        match self.state {
            SubjectState::Resolved(_) if !self.dispute_used => self
                .resolved_at
                .map(|at| at.saturating_add(self.config.dispute_window_secs)),
            _ => None,
        }
    }

    fn invalid(&self, operation: &'static str) -> StateError {
        StateError::InvalidState {
            subject: self.subject_id.clone(),
            state: self.state,
            operation,
        }
    }

    fn validate_transition(&self, to: SubjectState) -> Result<(), StateError> {
        match (self.state, to) {
            (SubjectState::Open, SubjectState::Voting) => Ok(()),
            (SubjectState::Voting, SubjectState::Resolved(o)) if o.is_decided() => Ok(()),
            (SubjectState::Resolved(_), SubjectState::Disputed) if !self.dispute_used => Ok(()),
            (SubjectState::Disputed, SubjectState::Resolved(o)) if o.is_decided() => Ok(()),
            (SubjectState::Resolved(a), SubjectState::Finalized(b)) if a == b => Ok(()),
            _ => Err(self.invalid("transition")),
        }
    }

    fn transition_hash(&self, to: SubjectState, at: Timestamp) -> Vec<u8> {
        let mut hasher = Sha256::new();
        if let Some(previous) = self.history.last() {
            hasher.update(&previous.transition_hash);
        }
        hasher.update(self.subject_id.as_str().as_bytes());
        hasher.update(self.state.to_string().as_bytes());
        hasher.update(to.to_string().as_bytes());
        hasher.update(at.to_le_bytes());
        hasher.finalize().to_vec()
    }

    fn transition_state(&mut self, to: SubjectState, at: Timestamp) -> Result<(), StateError> {
        self.validate_transition(to)?;

        let transition_hash = self.transition_hash(to, at);
        let from = self.state;
        self.state = to;
        self.history.push(StateTransition {
            from,
            to,
            at,
            transition_hash,
        });

        info!("Subject {} transitioned from {} to {} at {}", self.subject_id, from, to, at);
        Ok(())
    }

    /// Resolve the primary round and compute (not disburse) entitlements
    pub fn finalize(&mut self, now: Timestamp) -> Result<Outcome, StateError> {
        if self.state != SubjectState::Voting {
            return Err(self.invalid("finalize"));
        }

        let (outcome, tally) = self
            .round
            .evaluate(&self.pool, now)
            .ok_or_else(|| StateError::ResolutionPending(self.subject_id.clone()))?;
        let schedule = PayoutCalculator::compute(
            &self.pool,
            outcome,
            self.bounty,
            &self.config.payout_policy(),
            None,
        )?;

        self.transition_state(SubjectState::Resolved(outcome), now)?;
        self.round.record_outcome(outcome, tally);
        self.resolved_at = Some(now);
        self.payout = Some(schedule);

        Ok(outcome)
    }

    /// Challenge a resolved outcome. Votes are reset and re-run from scratch.
    pub fn open_dispute(
        &mut self,
        disputer: &mut LedgerAccount,
        stake: Amount,
        now: Timestamp,
    ) -> Result<(), DisputeError> {
        if self.dispute_used {
            return Err(DisputeError::DisputeAlreadyUsed(self.subject_id.clone()));
        }
        let original_outcome = match self.state {
            SubjectState::Resolved(outcome) => outcome,
            state => {
                return Err(DisputeError::WrongState {
                    subject: self.subject_id.clone(),
                    state,
                })
            }
        };
        if matches!(self.dispute_window_closes_at(), Some(closes_at) if now >= closes_at) {
            return Err(DisputeError::DisputeWindowClosed(self.subject_id.clone()));
        }
        if stake < self.config.min_dispute_stake {
            return Err(DisputeError::InsufficientDisputeStake {
                required: self.config.min_dispute_stake,
                offered: stake,
            });
        }

        self.validate_transition(SubjectState::Disputed)?;

        disputer.debit(stake)?;
        self.transition_state(SubjectState::Disputed, now)?;
        disputer.lock();

        let mut round = VotingRound::new(self.subject_id.clone(), RoundKind::Dispute, &self.config);
        round.open(now, self.config.voting_duration_secs);
        self.superseded_round = Some(std::mem::replace(&mut self.round, round));
        self.pool.reset_votes();
        self.payout = None;
        self.dispute_used = true;
        *self.locks_held.entry(disputer.owner().clone()).or_insert(0) += 1;
        self.dispute = Some(DisputeRecord {
            disputer: disputer.owner().clone(),
            stake,
            opened_at: now,
            original_outcome,
            final_outcome: None,
        });

        info!(
            "Dispute opened on {} by {} with stake {} against outcome {}",
            self.subject_id,
            disputer.owner(),
            stake,
            original_outcome
        );
        Ok(())
    }

    /// Resolve the dispute round and finalize with dispute-aware payouts
    pub fn finalize_dispute(&mut self, now: Timestamp) -> Result<Outcome, StateError> {
        if self.state != SubjectState::Disputed {
            return Err(self.invalid("finalize_dispute"));
        }
        let record = self.dispute.clone().ok_or_else(|| self.invalid("finalize_dispute"))?;

        let (outcome, tally) = self
            .round
            .evaluate(&self.pool, now)
            .ok_or_else(|| StateError::ResolutionPending(self.subject_id.clone()))?;
        let dispute_stake = DisputeStake {
            disputer: record.disputer.clone(),
            stake: record.stake,
            overturned: outcome != record.original_outcome,
        };
        let schedule = PayoutCalculator::compute(
            &self.pool,
            outcome,
            self.bounty,
            &self.config.payout_policy(),
            Some(&dispute_stake),
        )?;

        self.transition_state(SubjectState::Resolved(outcome), now)?;
        self.transition_state(SubjectState::Finalized(outcome), now)?;
        self.round.record_outcome(outcome, tally);
        self.resolved_at = Some(now);
        self.payout = Some(schedule);
        if let Some(dispute) = self.dispute.as_mut() {
            dispute.final_outcome = Some(outcome);
        }

        info!(
            "Dispute on {} settled {} ({})",
            self.subject_id,
            outcome,
            if dispute_stake.overturned { "overturned" } else { "upheld" }
        );
        Ok(outcome)
    }

    /// Finalize an undisputed subject once its dispute window has elapsed
    pub fn close_dispute_window(&mut self, now: Timestamp) -> Result<Outcome, StateError> {
        let outcome = match self.state {
            SubjectState::Resolved(outcome) => outcome,
            _ => return Err(self.invalid("close_dispute_window")),
        };
        if let Some(closes_at) = self.dispute_window_closes_at() {
            if now < closes_at {
                return Err(StateError::DisputeWindowOpen {
                    subject: self.subject_id.clone(),
                    closes_at,
                });
            }
        }

        self.transition_state(SubjectState::Finalized(outcome), now)?;
        Ok(outcome)
    }

    pub fn is_finalized(&self) -> bool {
        matches!(self.state, SubjectState::Finalized(_))
    }

    /// Amount `staker` may claim right now
    pub fn claimable(&self, staker: &StakerId) -> Result<Amount, ClaimError> {
        let payout = match (&self.state, &self.payout) {
            (SubjectState::Finalized(_), Some(payout)) => payout,
            _ => return Err(ClaimError::NotResolved(self.subject_id.clone())),
        };
        if self.claims.get(staker).copied().unwrap_or(false) {
            return Err(ClaimError::AlreadyClaimed {
                subject: self.subject_id.clone(),
                staker: staker.clone(),
            });
        }
        match payout.entitlement_of(staker) {
            0 => Err(ClaimError::NothingOwed {
                subject: self.subject_id.clone(),
                staker: staker.clone(),
            }),
            amount => Ok(amount),
        }
    }

    /// Record a disbursed claim, returning how many account locks it released
    pub fn mark_claimed(&mut self, staker: &StakerId) -> u32 {
        self.claims.insert(staker.clone(), true);
        self.locks_held.remove(staker).unwrap_or(0)
    }

    /// Release locks of parties whose entitlement is zero. Only after finalization.
    pub fn release_unpaid_positions(&mut self) -> Vec<(StakerId, u32)> {
        let payout = match (&self.state, &self.payout) {
            (SubjectState::Finalized(_), Some(payout)) => payout,
            _ => return Vec::new(),
        };
        let unpaid: Vec<StakerId> = self
            .locks_held
            .keys()
            .filter(|staker| payout.entitlement_of(staker) == 0)
            .cloned()
            .collect();

        unpaid
            .into_iter()
            .filter_map(|staker| self.locks_held.remove(&staker).map(|n| (staker, n)))
            .collect()
    }

    /// Treasury share not yet credited, once finalized
    pub fn pending_treasury_share(&self) -> Option<Amount> {
        match (&self.state, &self.payout, self.treasury_settled) {
            (SubjectState::Finalized(_), Some(payout), false) => Some(payout.treasury_share()),
            _ => None,
        }
    }

    pub fn mark_treasury_settled(&mut self) {
        self.treasury_settled = true;
    }

    /// Finalized and every positive entitlement claimed
    pub fn is_fully_claimed(&self) -> bool {
        match (&self.state, &self.payout) {
            (SubjectState::Finalized(_), Some(payout)) => payout
                .entitlements
                .iter()
                .filter(|(_, amount)| **amount > 0)
                .all(|(staker, _)| self.claims.get(staker).copied().unwrap_or(false)),
            _ => false,
        }
    }

    fn unclaimed_parties(&self) -> usize {
        self.payout
            .as_ref()
            .map(|payout| {
                payout
                    .entitlements
                    .iter()
                    .filter(|(staker, amount)| **amount > 0 && !self.claims.get(*staker).copied().unwrap_or(false))
                    .count()
            })
            .unwrap_or(0)
    }

    /// SHA-256 over the full serialized subject
    pub fn state_hash(&self) -> Result<Vec<u8>, StateError> {
        let serialized = bincode::serialize(self).map_err(|e| StateError::Serialization(e.to_string()))?;
        let mut hasher = Sha256::new();
        hasher.update(&serialized);
        Ok(hasher.finalize().to_vec())
    }

    fn require_open(&self) -> Result<(), StakeError> {
        if self.state != SubjectState::Open {
            return Err(StakeError::SubjectNotOpen(self.subject_id.clone()));
        }
        Ok(())
    }
}

impl Stakeable for ResolutionEngine {
    fn stake(&mut self, account: &mut LedgerAccount, amount: Amount) -> Result<(), StakeError> {
        self.require_open()?;
        let staker = account.owner().clone();
        self.pool.validate_new_stake(&staker, amount)?;

        account.debit(amount)?;
        account.lock();
        // validated above under the same subject guard
        self.pool.add_entry(staker.clone(), amount)?;
        *self.locks_held.entry(staker.clone()).or_insert(0) += 1;

        info!("Staker {} staked {} on {}", staker, amount, self.subject_id);
        Ok(())
    }

    fn increase_stake(&mut self, account: &mut LedgerAccount, amount: Amount) -> Result<Amount, StakeError> {
        self.require_open()?;
        let staker = account.owner().clone();
        self.pool.validate_increase(&staker, amount)?;

        account.debit(amount)?;
        self.pool.increase(&staker, amount)
    }

    fn fund_bounty(&mut self, funder: &mut LedgerAccount, amount: Amount) -> Result<Amount, StakeError> {
        self.require_open()?;
        if amount == 0 {
            return Err(StakeError::ZeroAmount);
        }
        let total = self
            .bounty
            .checked_add(amount)
            .ok_or_else(|| StakeError::Overflow(self.subject_id.clone()))?;

        funder.debit(amount)?;
        self.bounty = total;
        *self.bounty_funders.entry(funder.owner().clone()).or_insert(0) += amount;

        info!("Bounty on {} raised to {} by {}", self.subject_id, total, funder.owner());
        Ok(total)
    }

    fn advance_to_voting(&mut self, now: Timestamp) -> Result<(), StateError> {
        if self.state != SubjectState::Open {
            return Err(self.invalid("advance_to_voting"));
        }
        if self.pool.staker_count() == 0 {
            return Err(StateError::NoStakers(self.subject_id.clone()));
        }

        self.transition_state(SubjectState::Voting, now)?;
        self.pool.close_for_voting();
        self.round.open(now, self.config.voting_duration_secs);
        Ok(())
    }
}

impl Votable for ResolutionEngine {
    fn cast_vote(&mut self, staker: &StakerId, choice: VoteChoice, now: Timestamp) -> Result<Option<Outcome>, VoteError> {
        if self.state == SubjectState::Open {
            return Err(VoteError::State(self.invalid("cast_vote")));
        }

        // a decided round reports VotingClosed after the eligibility checks
        self.round.cast_vote(&mut self.pool, staker, choice, now)?;

        // opportunistic resolution after every vote
        Ok(self.try_resolve(now))
    }
}

impl Resolvable for ResolutionEngine {
    fn state(&self) -> SubjectState {
        self.state
    }

    fn try_resolve(&mut self, now: Timestamp) -> Option<Outcome> {
        let attempt = match self.state {
            SubjectState::Open => return None,
            SubjectState::Resolved(outcome) | SubjectState::Finalized(outcome) => return Some(outcome),
            SubjectState::Voting => self.finalize(now),
            SubjectState::Disputed => self.finalize_dispute(now),
        };
        match attempt {
            Ok(outcome) => Some(outcome),
            Err(StateError::ResolutionPending(_)) => None,
            Err(e) => {
                warn!("Resolution of {} failed: {}", self.subject_id, e);
                None
            }
        }
    }

    fn snapshot(&self) -> SubjectSnapshot {
        SubjectSnapshot {
            subject_id: self.subject_id.clone(),
            state: self.state,
            round: self.round.kind,
            opened_at: self.round.opened_at,
            voting_deadline: self.round.voting_deadline,
            outcome: self.round.outcome,
            staker_count: self.pool.staker_count(),
            participants: self.pool.participant_count(),
            total_staked: self.pool.total_staked(),
            total_voted_for: self.pool.total_voted_for(),
            total_voted_against: self.pool.total_voted_against(),
            bounty: self.bounty,
            dispute_used: self.dispute_used,
            dispute: self.dispute.clone(),
            resolved_at: self.resolved_at,
            dispute_window_closes_at: self.dispute_window_closes_at(),
            unclaimed_parties: self.unclaimed_parties(),
        }
    }
}
