//! Identifiers, amounts and vote/outcome enums shared by every ledger component.

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Smallest-unit token amount. 128 bits so credits never wrap silently.
pub type Amount = u128;

/// Seconds on the injected clock.
pub type Timestamp = u64;

/// Denominator for every basis-point fraction (10_000 = 100%).
pub const BPS_DENOMINATOR: u128 = 10_000;

/// Identifier of the thing being staked on (a contribution, task result or proposal)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectId(String);

impl SubjectId {
    pub fn new(id: impl Into<String>) -> Self {
        SubjectId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubjectId {
    fn from(id: &str) -> Self {
        SubjectId(id.to_string())
    }
}

impl From<String> for SubjectId {
    fn from(id: String) -> Self {
        SubjectId(id)
    }
}

/// Opaque identity of a staking party
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StakerId(String);

impl StakerId {
    pub fn new(id: impl Into<String>) -> Self {
        StakerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StakerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StakerId {
    fn from(id: &str) -> Self {
        StakerId(id.to_string())
    }
}

impl From<String> for StakerId {
    fn from(id: String) -> Self {
        StakerId(id)
    }
}

/// Recorded vote of a stake entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Vote {
    /// Staked but not (yet) voted
    #[default]
    Unset,
    For,
    Against,
}

impl Vote {
    pub fn is_set(&self) -> bool {
        !matches!(self, Vote::Unset)
    }
}

/// A choice a staker can actually cast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteChoice {
    For,
    Against,
}

impl From<VoteChoice> for Vote {
    fn from(choice: VoteChoice) -> Self {
        match choice {
            VoteChoice::For => Vote::For,
            VoteChoice::Against => Vote::Against,
        }
    }
}

/// Outcome of a voting round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Outcome {
    #[default]
    Undecided,
    Passed,
    Failed,
}

impl Outcome {
    pub fn is_decided(&self) -> bool {
        !matches!(self, Outcome::Undecided)
    }

    /// Vote that sits on the winning side of this outcome
    pub fn winning_vote(&self) -> Option<Vote> {
        match self {
            Outcome::Undecided => None,
            Outcome::Passed => Some(Vote::For),
            Outcome::Failed => Some(Vote::Against),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Undecided => "Undecided",
            Outcome::Passed => "Passed",
            Outcome::Failed => "Failed",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `a * b / c`, rounded down, over an unbounded intermediate.
///
/// `None` when `c` is zero or the quotient does not fit in an `Amount`.
pub fn mul_div(a: Amount, b: Amount, c: Amount) -> Option<Amount> {
    if c == 0 {
        return None;
    }
    let quotient = BigUint::from(a) * BigUint::from(b) / BigUint::from(c);
    Amount::try_from(quotient).ok()
}

/// `amount * bps / 10_000`, rounded down. `None` only when bps exceeds 100%
/// and the result no longer fits.
pub fn apply_bps(amount: Amount, bps: u32) -> Option<Amount> {
    mul_div(amount, bps as u128, BPS_DENOMINATOR)
}
