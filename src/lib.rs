//! # Predictive MOSA
//!
//! The core of a defect-prediction guided many-objective search for test
//! generation. Coverage goals located in methods predicted to be defective are
//! searched first; the remaining goals are held back until the search stops
//! making progress on the defective ones.
//!
//! # Architecture
//!
//! - `defect`: the defect weight model, loading per-method defect scores and
//!   classifying methods as buggy or not
//! - `goal` and `graph`: the coverage goals and the control dependencies among
//!   them, derived from externally supplied control flow data (`cfg`)
//! - `manager` and `predictive`: the goal frontier, which goals are objectives
//!   in each generation and when held goals are admitted
//! - `ranking`: preference sorting, diversity and survivor selection
//! - `search`: the generational loop and the collaborator interfaces it drives
//!
//! Solution representation, breeding and fitness computation belong to the
//! caller, through `VariationEngine` and `FitnessEvaluator`.

pub mod cfg;
pub mod config;
pub mod defect;
pub mod goal;
pub mod graph;
pub mod manager;
pub mod predictive;
pub mod ranking;
pub mod search;

pub use cfg::{
    BlockId, BranchId, BranchInventory, BranchSite, ControlDependency, ControlFlowIndex,
    ControlFlowProvider, MethodKey,
};
pub use config::{ConfigError, ConfigResult, SearchConfig, SignatureFormat};
pub use defect::{DefectError, DefectResult, MethodPool, MethodRecord, MethodRegistry};
pub use goal::{CodeLocation, Goal, GoalCatalog, GoalId, GoalKind, GoalTarget};
pub use graph::{AuxiliaryDependencies, GoalGraph};
pub use manager::{CoverageMaps, DynamicGoalManager, GoalFrontier, GoalManager};
pub use predictive::{AdmissionTrigger, CoverageBalancer, PredictiveGoalManager, TriggerCause};
pub use ranking::{Candidate, Fronts};
pub use search::{
    ExecutionTrace, FitnessEvaluator, GenerationBudget, SearchBudget, SearchLoop, SearchProgress,
    SearchReport, SearchStats, StoppingCondition, TimeBudget, TriggerReport, VariationEngine,
};
