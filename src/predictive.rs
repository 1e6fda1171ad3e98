//! Defect-prediction guided goal management
//!
//! The predictive manager searches the goals located in methods predicted to be
//! defective first. Every other goal is held back, together with its coverage
//! bookkeeping, until the admission trigger fires. From then on held goals
//! behave exactly like the others: roots and children of covered goals enter
//! the frontier, the rest follow as their parents get covered.
//!
//! # Architecture
//!
//! - `PredictiveGoalManager`: the partition into buggy and held goals, built on
//!   the shared `GoalFrontier`
//! - `AdmissionTrigger`: one-shot policy deciding when held goals are released,
//!   on stagnation of the uncovered buggy goals or when no buggy goal gets
//!   covered at all
//! - `CoverageBalancer`: optional collaborator adjusting the current goals
//!   before each ranking

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::cfg::ControlFlowProvider;
use crate::config::SearchConfig;
use crate::goal::{GoalCatalog, GoalId};
use crate::graph::{AuxiliaryDependencies, GoalGraph};
use crate::manager::{build_graph, method_goals, CoverageMaps, GoalFrontier, GoalManager};
use crate::ranking::Candidate;
use crate::search::FitnessEvaluator;

/// Collaborator rewriting the current goals before ranking
pub trait CoverageBalancer<S> {
    fn adjust(
        &mut self,
        catalog: &GoalCatalog,
        graph: &GoalGraph,
        current: &mut BTreeSet<GoalId>,
        population: &[Candidate<S>],
    );
}

/// Goal manager prioritising goals in defective methods
pub struct PredictiveGoalManager<S> {
    frontier: GoalFrontier<S>,
    /// Non-buggy goals not yet admitted
    held: BTreeSet<GoalId>,
    held_coverage: CoverageMaps,
    held_methods: BTreeSet<GoalId>,
    released: bool,
    balancer: Option<Box<dyn CoverageBalancer<S>>>,
}

impl<S: Clone> PredictiveGoalManager<S> {
    /// Partition the catalog and seed the frontier with the buggy roots.
    ///
    /// The graph spans every goal, so held goals keep their dependencies once
    /// admitted. `wiring` is applied before seeding.
    pub fn new(
        catalog: GoalCatalog,
        cfg: &dyn ControlFlowProvider,
        wiring: &[&dyn AuxiliaryDependencies],
    ) -> Self {
        let (buggy, held): (BTreeSet<GoalId>, BTreeSet<GoalId>) =
            catalog.ids().partition(|&goal| catalog.goal(goal).is_buggy());
        info!(
            "Total goals: {}, buggy goals: {}, non-buggy goals: {}",
            catalog.len(),
            buggy.len(),
            held.len()
        );

        let graph = build_graph(&catalog, cfg, wiring);
        let held_coverage = CoverageMaps::from_goals(&catalog, held.iter().copied());
        let held_methods = method_goals(&catalog, &held);
        let frontier = GoalFrontier::new(catalog, graph, buggy);

        info!(
            "Initial current goals: {}, uncovered goals: {}",
            frontier.current().len(),
            frontier.uncovered().len()
        );

        PredictiveGoalManager {
            frontier,
            held,
            held_coverage,
            held_methods,
            released: false,
            balancer: None,
        }
    }

    pub fn with_balancer(mut self, balancer: Box<dyn CoverageBalancer<S>>) -> Self {
        self.balancer = Some(balancer);
        self
    }

    /// Whether held goals have been released
    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn held_goals(&self) -> &BTreeSet<GoalId> {
        &self.held
    }
}

impl<S: Clone> GoalManager<S> for PredictiveGoalManager<S> {
    fn catalog(&self) -> &GoalCatalog {
        self.frontier.catalog()
    }

    fn graph(&self) -> &GoalGraph {
        self.frontier.graph()
    }

    fn current_goals(&self) -> &BTreeSet<GoalId> {
        self.frontier.current()
    }

    fn covered_goals(&self) -> &BTreeSet<GoalId> {
        self.frontier.covered()
    }

    fn uncovered_goals(&self) -> &BTreeSet<GoalId> {
        self.frontier.uncovered()
    }

    fn archive(&self) -> &BTreeMap<GoalId, S> {
        self.frontier.archive()
    }

    fn active_methods(&self) -> &BTreeSet<GoalId> {
        self.frontier.methods()
    }

    fn calculate_fitness(
        &mut self,
        candidates: &mut [Candidate<S>],
        evaluator: &mut dyn FitnessEvaluator<S>,
    ) -> usize {
        self.frontier.calculate_fitness(candidates, evaluator)
    }

    fn admit_held_goals(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;

        let held = std::mem::take(&mut self.held);
        let coverage = std::mem::take(&mut self.held_coverage);
        let methods = std::mem::take(&mut self.held_methods);
        self.frontier.admit(&held, coverage, &methods);

        info!(
            "Admitted {} non-buggy goals, current goals: {}, uncovered goals: {}",
            held.len(),
            self.frontier.current().len(),
            self.frontier.uncovered().len()
        );
        !held.is_empty()
    }

    fn held_goal_count(&self) -> usize {
        self.held.len()
    }

    fn adjust_current_goals(&mut self, population: &[Candidate<S>]) {
        if let Some(balancer) = self.balancer.as_mut() {
            self.frontier.adjust_current(|catalog, graph, current| {
                balancer.adjust(catalog, graph, current, population)
            });
        }
    }
}

impl<S> fmt::Debug for PredictiveGoalManager<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredictiveGoalManager")
            .field("held", &self.held.len())
            .field("released", &self.released)
            .field("balancer", &self.balancer.is_some())
            .finish_non_exhaustive()
    }
}

/// Why held goals were admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerCause {
    /// The search started without any buggy goal to work on
    NoBuggyGoals,
    /// The uncovered buggy goal count stayed the same for `generations`
    Stagnation { generations: u32, uncovered: usize },
    /// No buggy goal was covered within `generations`
    ZeroCoverage { generations: u32 },
}

impl fmt::Display for TriggerCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerCause::NoBuggyGoals => write!(f, "no buggy goals to start from"),
            TriggerCause::Stagnation { generations, uncovered } => write!(
                f,
                "{} uncovered buggy goals unchanged for {} generations",
                uncovered, generations
            ),
            TriggerCause::ZeroCoverage { generations } => {
                write!(f, "no buggy goal covered in {} generations", generations)
            }
        }
    }
}

/// One-shot admission policy, evaluated once per generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionTrigger {
    stagnation_threshold: u32,
    zero_coverage_threshold: u32,
    stagnant_generations: u32,
    last_uncovered: Option<usize>,
    buggy_covered: bool,
    fired: Option<TriggerCause>,
}

impl AdmissionTrigger {
    pub fn new(stagnation_threshold: u32, zero_coverage_threshold: u32) -> Self {
        AdmissionTrigger {
            stagnation_threshold,
            zero_coverage_threshold,
            stagnant_generations: 0,
            last_uncovered: None,
            buggy_covered: false,
            fired: None,
        }
    }

    pub fn from_config(config: &SearchConfig) -> Self {
        AdmissionTrigger::new(config.stagnation_threshold, config.zero_coverage_threshold)
    }

    /// Record the state after the initial evaluation
    pub fn prime(&mut self, uncovered_buggy: usize, covered_buggy: usize) {
        self.last_uncovered = Some(uncovered_buggy);
        self.buggy_covered = covered_buggy > 0;
    }

    /// Fire unconditionally, unless already fired
    pub fn force(&mut self, cause: TriggerCause) -> Option<TriggerCause> {
        if self.fired.is_some() {
            return None;
        }
        self.fired = Some(cause);
        Some(cause)
    }

    /// Update the policy with the state at the end of `generation`. Returns the
    /// cause the first time a condition is met, `None` otherwise.
    pub fn observe(
        &mut self,
        generation: u32,
        uncovered_buggy: usize,
        covered_buggy: usize,
    ) -> Option<TriggerCause> {
        if self.fired.is_some() {
            return None;
        }

        if self.last_uncovered == Some(uncovered_buggy) {
            self.stagnant_generations += 1;
        } else {
            self.stagnant_generations = 0;
            self.last_uncovered = Some(uncovered_buggy);
        }
        debug!(
            "Uncovered buggy goals: {}, stagnant generations: {}",
            uncovered_buggy, self.stagnant_generations
        );

        if self.stagnant_generations >= self.stagnation_threshold {
            return self.force(TriggerCause::Stagnation {
                generations: self.stagnant_generations,
                uncovered: uncovered_buggy,
            });
        }

        if covered_buggy > 0 {
            self.buggy_covered = true;
        }
        if !self.buggy_covered && generation >= self.zero_coverage_threshold {
            return self.force(TriggerCause::ZeroCoverage { generations: generation });
        }

        None
    }

    pub fn is_fired(&self) -> bool {
        self.fired.is_some()
    }

    pub fn cause(&self) -> Option<TriggerCause> {
        self.fired
    }

    pub fn stagnant_generations(&self) -> u32 {
        self.stagnant_generations
    }
}
