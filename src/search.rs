//! The generational search loop
//!
//! Each generation breeds offspring from the population, evaluates the union
//! against the current goals, ranks it, selects the survivors and updates the
//! goal frontier. The goal manager decides which goals are objectives; the loop
//! only evaluates the admission trigger and asks the manager to release held
//! goals when it fires.
//!
//! # Architecture
//!
//! - `VariationEngine`: collaborator owning the solution representation,
//!   producing the initial population and offspring
//! - `FitnessEvaluator`: collaborator computing the distance of a solution to a
//!   goal, and optionally the execution trace of a solution
//! - `StoppingCondition`: polled once per generation; `GenerationBudget`,
//!   `TimeBudget` and `SearchBudget` are provided
//! - `SearchLoop`: the state machine itself, with `SearchStats` for reporting

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::cfg::BranchId;
use crate::config::{ConfigResult, SearchConfig};
use crate::goal::{Goal, GoalId};
use crate::manager::GoalManager;
use crate::predictive::{AdmissionTrigger, TriggerCause};
use crate::ranking::{assign_epsilon_diversity, rank_by_preference, select_survivors, Candidate, Fronts};

/// Observations made while executing a solution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionTrace {
    /// Branches that evaluated to true
    pub covered_true: Vec<BranchId>,
    /// Branches that evaluated to false
    pub covered_false: Vec<BranchId>,
    /// Entered methods as `class.method`
    pub entered_methods: Vec<String>,
}

/// Computes fitness distances of solutions to goals
pub trait FitnessEvaluator<S> {
    /// Distance to covering `goal`, zero when covered
    fn distance(&mut self, solution: &S, goal: &Goal) -> f64;

    fn trace(&mut self, _solution: &S) -> Option<ExecutionTrace> {
        None
    }
}

/// Produces solutions
pub trait VariationEngine<S> {
    fn initial_population(&mut self, size: usize) -> Vec<S>;

    /// Offspring bred from the current population
    fn breed(&mut self, population: &[Candidate<S>]) -> Vec<S>;

    fn survivors_selected(&mut self, _population: &[Candidate<S>]) {}

    fn search_finished(&mut self, _population: &[Candidate<S>]) {}
}

/// Snapshot handed to stopping conditions
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchProgress {
    pub generation: u32,
    pub elapsed: Duration,
    pub evaluations: usize,
    pub covered_goals: usize,
    pub uncovered_goals: usize,
}

pub trait StoppingCondition {
    fn is_finished(&self, progress: &SearchProgress) -> bool;
}

impl<F> StoppingCondition for F
where
    F: Fn(&SearchProgress) -> bool,
{
    fn is_finished(&self, progress: &SearchProgress) -> bool {
        self(progress)
    }
}

/// Stop after a number of generations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationBudget(pub u32);

impl StoppingCondition for GenerationBudget {
    fn is_finished(&self, progress: &SearchProgress) -> bool {
        progress.generation >= self.0
    }
}

/// Stop once the wall-clock budget is spent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBudget(pub Duration);

impl StoppingCondition for TimeBudget {
    fn is_finished(&self, progress: &SearchProgress) -> bool {
        progress.elapsed >= self.0
    }
}

/// Finished as soon as any of its budgets is
#[derive(Default)]
pub struct SearchBudget {
    conditions: Vec<Box<dyn StoppingCondition>>,
}

impl SearchBudget {
    /// Budgets configured in `config`. Without any the search only ends when
    /// every goal is covered.
    pub fn from_config(config: &SearchConfig) -> Self {
        let mut budget = SearchBudget::default();
        if let Some(generations) = config.max_generations {
            budget = budget.with(GenerationBudget(generations));
        }
        if let Some(limit) = config.max_time() {
            budget = budget.with(TimeBudget(limit));
        }
        budget
    }

    pub fn with<C: StoppingCondition + 'static>(mut self, condition: C) -> Self {
        self.conditions.push(Box::new(condition));
        self
    }
}

impl StoppingCondition for SearchBudget {
    fn is_finished(&self, progress: &SearchProgress) -> bool {
        self.conditions
            .iter()
            .any(|condition| condition.is_finished(progress))
    }
}

/// When and why held goals were admitted
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TriggerReport {
    pub cause: TriggerCause,
    pub generation: u32,
    pub elapsed: Duration,
}

/// Statistics collected during a search
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchStats {
    pub generations: u32,
    /// Fitness distance evaluations
    pub evaluations: usize,
    pub trigger: Option<TriggerReport>,
    /// Time spent adjusting the current goals
    pub balancing_overhead: Duration,
}

/// Outcome of a finished search
#[derive(Debug, Clone)]
pub struct SearchReport<S> {
    /// First covering solution of each covered goal
    pub archive: BTreeMap<GoalId, S>,
    pub covered: BTreeSet<GoalId>,
    pub uncovered: BTreeSet<GoalId>,
    pub stats: SearchStats,
}

/// Many-objective search driven by a goal manager
#[derive(Debug)]
pub struct SearchLoop<S, M> {
    config: SearchConfig,
    manager: M,
    trigger: AdmissionTrigger,
    population: Vec<Candidate<S>>,
    /// Ranking of the current population
    fronts: Fronts,
    generation: u32,
    started: Instant,
    stats: SearchStats,
}

impl<S: Clone, M: GoalManager<S>> SearchLoop<S, M> {
    pub fn new(config: SearchConfig, manager: M) -> ConfigResult<Self> {
        config.validate()?;
        Ok(SearchLoop {
            trigger: AdmissionTrigger::from_config(&config),
            config,
            manager,
            population: Vec::new(),
            fronts: Fronts::default(),
            generation: 0,
            started: Instant::now(),
            stats: SearchStats::default(),
        })
    }

    /// Create, evaluate and rank the initial population
    pub fn initialize(
        &mut self,
        engine: &mut dyn VariationEngine<S>,
        evaluator: &mut dyn FitnessEvaluator<S>,
    ) {
        self.started = Instant::now();
        self.generation = 0;

        if self.manager.current_goals().is_empty() {
            if let Some(cause) = self.trigger.force(TriggerCause::NoBuggyGoals) {
                self.admit(cause);
            }
        }

        self.population = engine
            .initial_population(self.config.population_size)
            .into_iter()
            .map(Candidate::new)
            .collect();
        self.stats.evaluations += self
            .manager
            .calculate_fitness(&mut self.population, evaluator);
        self.rank_population();

        self.trigger.prime(
            self.manager.uncovered_buggy_count(),
            self.manager.covered_buggy_count(),
        );
        info!(
            "Initial population: {}, current goals: {}, covered goals: {}",
            self.population.len(),
            self.manager.current_goals().len(),
            self.manager.covered_goals().len()
        );
    }

    /// Run one generation
    pub fn evolve(
        &mut self,
        engine: &mut dyn VariationEngine<S>,
        evaluator: &mut dyn FitnessEvaluator<S>,
    ) {
        let offspring = engine.breed(&self.population);
        let mut union = std::mem::take(&mut self.population);
        union.extend(offspring.into_iter().map(Candidate::new));
        debug!("Union size: {}", union.len());

        self.stats.evaluations += self.manager.calculate_fitness(&mut union, evaluator);

        if self.config.balance_coverage {
            let start = Instant::now();
            self.manager.adjust_current_goals(&union);
            self.stats.balancing_overhead += start.elapsed();
        }

        let goals = self.current_goal_list();
        let fronts = rank_by_preference(&mut union, &goals);
        self.population = select_survivors(union, &fronts, self.config.population_size, &goals);
        self.rank_population();
        engine.survivors_selected(&self.population);

        self.generation += 1;
        self.stats.generations = self.generation;
        self.update_goals();

        debug!(
            "Generation {}: covered goals: {}, current goals: {}, uncovered goals: {}",
            self.generation,
            self.manager.covered_goals().len(),
            self.manager.current_goals().len(),
            self.manager.uncovered_goals().len()
        );
    }

    /// Initialize, then evolve until `stop` is satisfied or nothing is left to
    /// cover
    pub fn run(
        &mut self,
        engine: &mut dyn VariationEngine<S>,
        evaluator: &mut dyn FitnessEvaluator<S>,
        stop: &dyn StoppingCondition,
    ) -> SearchReport<S> {
        self.initialize(engine, evaluator);

        while !self.is_complete() && !stop.is_finished(&self.progress()) {
            self.evolve(engine, evaluator);
        }

        engine.search_finished(&self.population);
        if self.config.balance_coverage {
            info!(
                "Coverage balancing overhead: {:.3}s",
                self.stats.balancing_overhead.as_secs_f64()
            );
        }
        info!(
            "Search finished after {} generations: {} of {} goals covered",
            self.generation,
            self.manager.covered_goals().len(),
            self.manager.catalog().len()
        );

        self.report()
    }

    fn rank_population(&mut self) {
        let goals = self.current_goal_list();
        self.fronts = rank_by_preference(&mut self.population, &goals);
        for front in self.fronts.iter() {
            assign_epsilon_diversity(&mut self.population, front, &goals);
        }
    }

    fn update_goals(&mut self) {
        let cause = self.trigger.observe(
            self.generation,
            self.manager.uncovered_buggy_count(),
            self.manager.covered_buggy_count(),
        );
        if let Some(cause) = cause {
            self.admit(cause);
        }
    }

    /// Admit held goals; the trigger is reported only if something was held
    fn admit(&mut self, cause: TriggerCause) {
        if !self.manager.admit_held_goals() {
            debug!(
                "Trigger fired at generation {} with no held goals: {}",
                self.generation, cause
            );
            return;
        }

        let elapsed = self.started.elapsed();
        info!(
            "Admission triggered at generation {} after {:.2}s: {}",
            self.generation,
            elapsed.as_secs_f64(),
            cause
        );
        self.stats.trigger = Some(TriggerReport {
            cause,
            generation: self.generation,
            elapsed,
        });
    }

    fn current_goal_list(&self) -> Vec<GoalId> {
        self.manager.current_goals().iter().copied().collect()
    }

    /// No goal is left to search for, now or after admission
    pub fn is_complete(&self) -> bool {
        self.manager.uncovered_goals().is_empty() && self.manager.held_goal_count() == 0
    }

    pub fn progress(&self) -> SearchProgress {
        SearchProgress {
            generation: self.generation,
            elapsed: self.started.elapsed(),
            evaluations: self.stats.evaluations,
            covered_goals: self.manager.covered_goals().len(),
            uncovered_goals: self.manager.uncovered_goals().len(),
        }
    }

    pub fn report(&self) -> SearchReport<S> {
        SearchReport {
            archive: self.manager.archive().clone(),
            covered: self.manager.covered_goals().clone(),
            uncovered: self.manager.uncovered_goals().clone(),
            stats: self.stats.clone(),
        }
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    pub fn into_manager(self) -> M {
        self.manager
    }

    pub fn population(&self) -> &[Candidate<S>] {
        &self.population
    }

    pub fn fronts(&self) -> &Fronts {
        &self.fronts
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn trigger(&self) -> &AdmissionTrigger {
        &self.trigger
    }

    pub fn stats(&self) -> &SearchStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::ControlFlowIndex;
    use crate::goal::{GoalCatalog, GoalTarget};
    use crate::manager::DynamicGoalManager;
    use crate::predictive::PredictiveGoalManager;

    /// Solutions are integers; a solution covers goal `n` when it is at least `n`
    struct Threshold;

    impl FitnessEvaluator<u32> for Threshold {
        fn distance(&mut self, solution: &u32, goal: &Goal) -> f64 {
            let target = goal.id().0 as u32;
            if *solution >= target {
                0.0
            } else {
                f64::from(target - solution)
            }
        }
    }

    /// Each offspring is one more than the best solution so far
    struct Counter;

    impl VariationEngine<u32> for Counter {
        fn initial_population(&mut self, size: usize) -> Vec<u32> {
            vec![0; size]
        }

        fn breed(&mut self, population: &[Candidate<u32>]) -> Vec<u32> {
            let best = population.iter().map(|c| *c.solution()).max().unwrap_or(0);
            vec![best + 1]
        }
    }

    fn methods(buggy: usize, clean: usize) -> GoalCatalog {
        let targets = (0..buggy + clean)
            .map(|n| GoalTarget::method("A", &format!("m{}()V", n)))
            .collect();
        GoalCatalog::build(targets, |target| {
            let n: usize = target.location.method_name[1..]
                .trim_end_matches("()V")
                .parse()
                .unwrap();
            n < buggy
        })
    }

    fn config(population_size: usize) -> SearchConfig {
        SearchConfig {
            population_size,
            stagnation_threshold: 3,
            zero_coverage_threshold: 10,
            max_time_secs: None,
            ..SearchConfig::default()
        }
    }

    #[test]
    fn test_budgets() {
        let progress = SearchProgress {
            generation: 5,
            elapsed: Duration::from_secs(2),
            evaluations: 0,
            covered_goals: 0,
            uncovered_goals: 1,
        };
        assert!(GenerationBudget(5).is_finished(&progress));
        assert!(!GenerationBudget(6).is_finished(&progress));
        assert!(TimeBudget(Duration::from_secs(1)).is_finished(&progress));

        let budget = SearchBudget::default().with(GenerationBudget(10));
        assert!(!budget.is_finished(&progress));
        assert!(budget.with(TimeBudget(Duration::from_secs(2))).is_finished(&progress));

        let unlimited = SearchBudget::from_config(&config(4));
        assert!(!unlimited.is_finished(&progress));
    }

    #[test]
    fn test_run_covers_everything_with_dynamic_manager() {
        let manager: DynamicGoalManager<u32> =
            DynamicGoalManager::new(methods(4, 0), &ControlFlowIndex::new(), &[]);
        let mut search = SearchLoop::new(config(4), manager).unwrap();

        let report = search.run(&mut Counter, &mut Threshold, &GenerationBudget(20));

        assert_eq!(report.covered.len(), 4);
        assert!(report.uncovered.is_empty());
        assert_eq!(report.archive.get(&GoalId(3)), Some(&3));
        // generation 0 already covers goal 0
        assert_eq!(report.stats.generations, 3);
        assert!(report.stats.trigger.is_none());
    }

    #[test]
    fn test_no_buggy_goals_forces_admission() {
        let manager: PredictiveGoalManager<u32> =
            PredictiveGoalManager::new(methods(0, 3), &ControlFlowIndex::new(), &[]);
        let mut search = SearchLoop::new(config(2), manager).unwrap();

        search.initialize(&mut Counter, &mut Threshold);

        let trigger = search.stats().trigger.unwrap();
        assert_eq!(trigger.cause, TriggerCause::NoBuggyGoals);
        assert_eq!(trigger.generation, 0);
        assert_eq!(search.manager().current_goals().len(), 2);
        assert_eq!(search.population().len(), 2);
    }

    #[test]
    fn test_held_goals_follow_stagnation() {
        struct Stuck;

        impl VariationEngine<u32> for Stuck {
            fn initial_population(&mut self, size: usize) -> Vec<u32> {
                vec![0; size]
            }

            fn breed(&mut self, _population: &[Candidate<u32>]) -> Vec<u32> {
                vec![0]
            }
        }

        // goal 0 is covered at once, goal 1 never: the buggy count stalls
        let manager: PredictiveGoalManager<u32> =
            PredictiveGoalManager::new(methods(2, 2), &ControlFlowIndex::new(), &[]);
        let mut search = SearchLoop::new(config(2), manager).unwrap();

        search.run(&mut Stuck, &mut Threshold, &GenerationBudget(5));

        let trigger = search.stats().trigger.unwrap();
        assert_eq!(
            trigger.cause,
            TriggerCause::Stagnation { generations: 3, uncovered: 1 }
        );
        assert_eq!(trigger.generation, 3);
        assert_eq!(search.manager().held_goal_count(), 0);
        assert_eq!(search.generation(), 5);
        assert!(search.manager().current_goals().contains(&GoalId(3)));
    }

    /// Breeds one offspring per survivor, all of them copies
    struct Cloner;

    impl VariationEngine<u32> for Cloner {
        fn initial_population(&mut self, size: usize) -> Vec<u32> {
            vec![0; size]
        }

        fn breed(&mut self, population: &[Candidate<u32>]) -> Vec<u32> {
            population.iter().map(|c| *c.solution()).collect()
        }
    }

    #[test]
    fn test_population_stays_bounded_without_current_goals() {
        // the only buggy goal is covered at once, the held goal waits for the trigger
        let manager: PredictiveGoalManager<u32> =
            PredictiveGoalManager::new(methods(1, 1), &ControlFlowIndex::new(), &[]);
        let config = SearchConfig {
            stagnation_threshold: 50,
            ..config(4)
        };
        let mut search = SearchLoop::new(config, manager).unwrap();

        search.initialize(&mut Cloner, &mut Threshold);
        for _ in 0..6 {
            search.evolve(&mut Cloner, &mut Threshold);
            assert!(search.manager().current_goals().is_empty());
            assert_eq!(search.population().len(), 4);
        }
        assert_eq!(search.manager().held_goal_count(), 1);
        assert_eq!(search.fronts().total(), 4);
    }

    #[test]
    fn test_trigger_without_held_goals_is_not_reported() {
        struct Stuck;

        impl VariationEngine<u32> for Stuck {
            fn initial_population(&mut self, size: usize) -> Vec<u32> {
                vec![0; size]
            }

            fn breed(&mut self, _population: &[Candidate<u32>]) -> Vec<u32> {
                vec![0]
            }
        }

        let manager: DynamicGoalManager<u32> =
            DynamicGoalManager::new(methods(2, 0), &ControlFlowIndex::new(), &[]);
        let mut search = SearchLoop::new(config(2), manager).unwrap();

        let report = search.run(&mut Stuck, &mut Threshold, &GenerationBudget(5));

        assert!(search.trigger().is_fired());
        assert!(report.stats.trigger.is_none());
        assert_eq!(report.uncovered, BTreeSet::from([GoalId(1)]));
    }

    #[test]
    fn test_balancing_overhead_is_recorded() {
        let manager: DynamicGoalManager<u32> =
            DynamicGoalManager::new(methods(2, 0), &ControlFlowIndex::new(), &[]);
        let mut config = config(2);
        config.balance_coverage = true;
        let mut search = SearchLoop::new(config, manager).unwrap();

        let report = search.run(&mut Counter, &mut Threshold, &GenerationBudget(1));
        assert_eq!(report.stats.generations, 1);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let manager: DynamicGoalManager<u32> =
            DynamicGoalManager::new(methods(1, 0), &ControlFlowIndex::new(), &[]);
        assert!(SearchLoop::new(config(0), manager).is_err());
    }
}
