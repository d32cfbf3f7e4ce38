//! Subject and ledger configuration.
//!
//! Values are loaded with the `config` crate: an optional file (format picked
//! from its extension) layered under `QUORUM__*` environment variables, e.g.
//! `QUORUM__SUBJECT_DEFAULTS__MIN_PARTICIPANTS=5`.

use crate::ledger_types::{Amount, BPS_DENOMINATOR};
use crate::payout_calculator::{NonVoterPolicy, PayoutPolicy};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const ENV_PREFIX: &str = "QUORUM";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Rules applied to one subject for its whole lifetime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubjectConfig {
    /// Length of each voting round (primary and dispute)
    pub voting_duration_secs: u64,

    /// Participant count that allows early resolution
    pub min_participants: u32,

    /// Minimum share of staked weight that must vote (basis points)
    pub min_stake_bps: u32,

    /// Minimum "For" percentage of voted weight to pass (0..=100, inclusive)
    pub supermajority_pct: u8,

    /// Share of a losing stake that is slashed (basis points)
    pub slash_bps: u32,

    /// Protocol skim on the distributable pool (basis points)
    pub protocol_fee_bps: u32,

    /// Smallest stake accepted to open a dispute
    pub min_dispute_stake: Amount,

    /// Time after resolution during which a dispute may be opened
    pub dispute_window_secs: u64,

    /// Treatment of stakers who never voted
    pub non_voter_policy: NonVoterPolicy,
}

impl Default for SubjectConfig {
    fn default() -> Self {
        SubjectConfig {
            voting_duration_secs: 86_400,
            min_participants: 3,
            min_stake_bps: 5_000,
            supermajority_pct: 60,
            slash_bps: 10_000,
            protocol_fee_bps: 500,
            min_dispute_stake: 100,
            dispute_window_secs: 43_200,
            non_voter_policy: NonVoterPolicy::Refund,
        }
    }
}

impl SubjectConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.voting_duration_secs == 0 {
            return Err(invalid("voting_duration_secs", "must be greater than zero"));
        }
        if self.min_participants == 0 {
            return Err(invalid("min_participants", "must be at least one"));
        }
        if self.supermajority_pct > 100 {
            return Err(invalid("supermajority_pct", "must be within 0..=100"));
        }
        if self.min_dispute_stake == 0 {
            return Err(invalid("min_dispute_stake", "must be greater than zero"));
        }
        for (field, bps) in [
            ("min_stake_bps", self.min_stake_bps),
            ("slash_bps", self.slash_bps),
            ("protocol_fee_bps", self.protocol_fee_bps),
        ] {
            if bps as u128 > BPS_DENOMINATOR {
                return Err(invalid(field, "basis points cannot exceed 10000"));
            }
        }
        Ok(())
    }

    pub fn payout_policy(&self) -> PayoutPolicy {
        PayoutPolicy {
            slash_bps: self.slash_bps,
            protocol_fee_bps: self.protocol_fee_bps,
            non_voter_policy: self.non_voter_policy,
        }
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
}

/// Process-wide ledger settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Period of the background resolution sweep
    pub sweep_interval_ms: u64,

    /// Applied to subjects opened without an explicit config
    pub subject_defaults: SubjectConfig,

    /// Where snapshots are written, if durability is wanted
    pub snapshot_path: Option<PathBuf>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            sweep_interval_ms: 5_000,
            subject_defaults: SubjectConfig::default(),
            snapshot_path: None,
        }
    }
}

impl LedgerConfig {
    /// Load from an optional file plus `QUORUM__*` overrides, then validate
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let loaded: LedgerConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sweep_interval_ms == 0 {
            return Err(invalid("sweep_interval_ms", "must be greater than zero"));
        }
        self.subject_defaults.validate()
    }
}
