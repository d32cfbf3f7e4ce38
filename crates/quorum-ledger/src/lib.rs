//! QUORUM LEDGER
//!
//! Stake-weighted commit/vote/resolve engine:
//! - Stakers lock value against a subject
//! - Stakers vote; quorum and supermajority decide the outcome
//! - One dispute may re-run the vote
//! - Losers are slashed, winners share the slashed pool and any bounty

pub mod ledger_types;
pub mod ledger_account;
pub mod stake_pool;
pub mod voting_round;
pub mod payout_calculator;
pub mod resolution_engine;
pub mod subject_capabilities;
pub mod subject_registry;
pub mod resolution_sweeper;
pub mod ledger_config;
pub mod state_storage;
pub mod token_custody;
pub mod clock;

pub use ledger_types::{
    Amount, Timestamp, SubjectId, StakerId, Vote, VoteChoice, Outcome, BPS_DENOMINATOR,
};

pub use ledger_account::{LedgerAccount, DebitReceipt, AccountError};

pub use stake_pool::{StakePool, StakeEntry, StakeError};

pub use voting_round::{VotingRound, RoundKind, RoundTally, VoteError, tally_outcome};

pub use payout_calculator::{
    PayoutCalculator, PayoutSchedule, PayoutLine, PayoutRole, PayoutPolicy,
    NonVoterPolicy, DisputeStake, PayoutError, ClaimError,
};

pub use resolution_engine::{
    ResolutionEngine, SubjectState, SubjectSnapshot, StateTransition, DisputeRecord,
    StateError, DisputeError,
};

pub use subject_capabilities::{Stakeable, Votable, Resolvable};

pub use subject_registry::{
    SubjectRegistry, SubjectHandle, ArchivedSubject, SweepReport, TransferError, TREASURY_ID,
};

pub use resolution_sweeper::{ResolutionSweeper, SweeperHandle};

pub use ledger_config::{LedgerConfig, SubjectConfig, ConfigError};

pub use state_storage::{
    RegistrySnapshot, StorageError, encode_snapshot, decode_snapshot, save_snapshot, load_snapshot,
};

pub use token_custody::{TokenCustody, InMemoryCustody, CustodyError};

pub use clock::{Clock, MonotonicClock, ManualClock};

use std::sync::Arc;

/// Build a registry from loaded configuration, restoring the configured snapshot when one exists
pub fn init_registry(
    config: &LedgerConfig,
    clock: Arc<dyn Clock>,
    custody: Arc<dyn TokenCustody>,
) -> Result<SubjectRegistry, StorageError> {
    match &config.snapshot_path {
        Some(path) if path.exists() => {
            let snapshot = load_snapshot(path)?;
            log::info!(
                "Restored {} subjects and {} accounts from {}",
                snapshot.subjects.len(),
                snapshot.accounts.len(),
                path.display()
            );
            Ok(SubjectRegistry::from_snapshot(snapshot, clock, custody))
        }
        _ => Ok(SubjectRegistry::new(config.subject_defaults.clone(), clock, custody)),
    }
}
