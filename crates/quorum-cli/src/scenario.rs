//! JSON scenario replay against an in-memory registry on a manual clock.

use anyhow::{Context, Result};
use quorum_ledger::{
    Amount, Clock, InMemoryCustody, ManualClock, Outcome, StakerId, SubjectConfig, SubjectId, SubjectRegistry,
    SubjectSnapshot, Timestamp, VoteChoice,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// One ledger operation. Externally tagged: `{"stake": {...}}` or `"sweep"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Mint into the external wallet and deposit it
    Fund { staker: StakerId, amount: Amount },
    Open {
        subject: SubjectId,
        #[serde(default)]
        config: Option<SubjectConfig>,
    },
    Stake { subject: SubjectId, staker: StakerId, amount: Amount },
    Increase { subject: SubjectId, staker: StakerId, amount: Amount },
    Bounty { subject: SubjectId, funder: StakerId, amount: Amount },
    Advance { subject: SubjectId },
    Vote { subject: SubjectId, staker: StakerId, choice: VoteChoice },
    Elapse { secs: u64 },
    Sweep,
    Resolve { subject: SubjectId },
    Dispute { subject: SubjectId, disputer: StakerId, stake: Amount },
    FinalizeDispute { subject: SubjectId },
    CloseWindow { subject: SubjectId },
    Claim { subject: SubjectId, staker: StakerId },
    Withdraw { staker: StakerId, amount: Amount },
    WithdrawFees,
    Archive { subject: SubjectId },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub start_time: Timestamp,
    /// Defaults for subjects opened without their own config
    #[serde(default)]
    pub config: Option<SubjectConfig>,
    pub steps: Vec<Step>,
}

impl Scenario {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading scenario {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing scenario {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepResult {
    Applied(String),
    Rejected(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub index: usize,
    pub at: Timestamp,
    pub step: Step,
    pub result: StepResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountLine {
    pub owner: StakerId,
    pub balance: Amount,
    pub open_positions: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub steps: Vec<StepRecord>,
    pub subjects: Vec<SubjectSnapshot>,
    pub accounts: Vec<AccountLine>,
    pub treasury: Amount,
    pub fees_withdrawn: Amount,
}

impl SimulationReport {
    pub fn rejected(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s.result, StepResult::Rejected(_)))
            .count()
    }
}

/// Registry plus the handles a scenario drives it through
pub struct Simulation {
    pub clock: Arc<ManualClock>,
    pub custody: Arc<InMemoryCustody>,
    pub registry: SubjectRegistry,
}

impl Simulation {
    pub fn new(defaults: SubjectConfig, start_time: Timestamp) -> Self {
        let clock = Arc::new(ManualClock::new(start_time));
        let custody = Arc::new(InMemoryCustody::new());
        let registry = SubjectRegistry::new(defaults, clock.clone(), custody.clone());
        Simulation {
            clock,
            custody,
            registry,
        }
    }

    /// Apply one step. Ledger rejections are results, not failures.
    pub fn apply(&self, step: &Step) -> StepResult {
        let outcome: std::result::Result<String, String> = match step {
            Step::Fund { staker, amount } => self
                .custody
                .fund_wallet(staker, *amount)
                .map_err(|e| e.to_string())
                .and_then(|_| self.registry.deposit(staker, *amount).map_err(|e| e.to_string()))
                .map(|balance| format!("{} balance {}", staker, balance)),
            Step::Open { subject, config } => self
                .registry
                .open_subject(subject.clone(), config.clone())
                .map(|handle| format!("opened {} at {}", handle.subject_id, handle.created_at))
                .map_err(|e| e.to_string()),
            Step::Stake { subject, staker, amount } => self
                .registry
                .stake(subject, staker, *amount)
                .map(|_| format!("{} staked {}", staker, amount))
                .map_err(|e| e.to_string()),
            Step::Increase { subject, staker, amount } => self
                .registry
                .increase_stake(subject, staker, *amount)
                .map(|total| format!("{} stake now {}", staker, total))
                .map_err(|e| e.to_string()),
            Step::Bounty { subject, funder, amount } => self
                .registry
                .fund_bounty(subject, funder, *amount)
                .map(|total| format!("bounty now {}", total))
                .map_err(|e| e.to_string()),
            Step::Advance { subject } => self
                .registry
                .advance_to_voting(subject)
                .map(|_| format!("{} voting", subject))
                .map_err(|e| e.to_string()),
            Step::Vote { subject, staker, choice } => self
                .registry
                .cast_vote(subject, staker, *choice)
                .map(|resolved| match resolved {
                    Some(outcome) => format!("{} voted {:?}; resolved {}", staker, choice, outcome),
                    None => format!("{} voted {:?}", staker, choice),
                })
                .map_err(|e| e.to_string()),
            Step::Elapse { secs } => Ok(format!("clock at {}", self.clock.advance(*secs))),
            Step::Sweep => {
                let report = self.registry.sweep();
                Ok(format!(
                    "{} resolved, {} finalized, {} failures",
                    report.resolved.len(),
                    report.finalized.len(),
                    report.failures.len()
                ))
            }
            Step::Resolve { subject } => match self.registry.try_resolve(subject) {
                Some(outcome) => Ok(format!("{} {}", subject, outcome)),
                None => Err(format!("{} not resolvable yet", subject)),
            },
            Step::Dispute { subject, disputer, stake } => self
                .registry
                .open_dispute(subject, disputer, *stake)
                .map(|_| format!("{} disputed {} with {}", disputer, subject, stake))
                .map_err(|e| e.to_string()),
            Step::FinalizeDispute { subject } => self
                .registry
                .finalize_dispute(subject)
                .map(|outcome| describe_final(subject, outcome))
                .map_err(|e| e.to_string()),
            Step::CloseWindow { subject } => self
                .registry
                .close_dispute_window(subject)
                .map(|outcome| describe_final(subject, outcome))
                .map_err(|e| e.to_string()),
            Step::Claim { subject, staker } => self
                .registry
                .claim(subject, staker)
                .map(|amount| format!("{} claimed {}", staker, amount))
                .map_err(|e| e.to_string()),
            Step::Withdraw { staker, amount } => self
                .registry
                .withdraw(staker, *amount)
                .map(|remaining| format!("{} withdrew {}, {} left", staker, amount, remaining))
                .map_err(|e| e.to_string()),
            Step::WithdrawFees => self
                .registry
                .withdraw_fees(None)
                .map(|amount| format!("{} fees to treasury", amount))
                .map_err(|e| e.to_string()),
            Step::Archive { subject } => self
                .registry
                .archive_subject(subject)
                .map(|archived| format!("archived {} ({})", subject, archived.state_hash))
                .map_err(|e| e.to_string()),
        };

        match outcome {
            Ok(detail) => {
                debug!("{}", detail);
                StepResult::Applied(detail)
            }
            Err(reason) => {
                warn!("step rejected: {}", reason);
                StepResult::Rejected(reason)
            }
        }
    }

    pub fn run(&self, steps: &[Step]) -> SimulationReport {
        let records = steps
            .iter()
            .enumerate()
            .map(|(index, step)| StepRecord {
                index,
                at: self.clock.now(),
                step: step.clone(),
                result: self.apply(step),
            })
            .collect();
        self.report(records)
    }

    fn report(&self, steps: Vec<StepRecord>) -> SimulationReport {
        let snapshot = self.registry.export_snapshot();
        let subjects = snapshot
            .subjects
            .iter()
            .filter_map(|engine| self.registry.get_status(engine.subject_id()).ok())
            .collect();
        let accounts = snapshot
            .accounts
            .iter()
            .map(|account| AccountLine {
                owner: account.owner().clone(),
                balance: account.balance(),
                open_positions: account.open_positions(),
            })
            .collect();

        SimulationReport {
            steps,
            subjects,
            accounts,
            treasury: snapshot.treasury.balance(),
            fees_withdrawn: self.custody.treasury_total(),
        }
    }
}

fn describe_final(subject: &SubjectId, outcome: Outcome) -> String {
    format!("{} finalized {}", subject, outcome)
}
