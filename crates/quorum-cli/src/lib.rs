//! Support code for the `quorum-cli` binary.

pub mod scenario;

pub use scenario::{Scenario, Simulation, SimulationReport, Step, StepRecord, StepResult};
