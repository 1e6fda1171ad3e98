//! Goal managers
//!
//! A goal manager owns the partition of the goals into covered, uncovered and
//! current (the goals used as search objectives this generation), updates it
//! from fitness evaluations and keeps the first solution covering each goal.
//!
//! # Architecture
//!
//! - `GoalManager`: the capability interface the search loop drives. Admission
//!   of held goals is part of it, so the loop never needs to know which kind of
//!   manager it runs.
//! - `GoalFrontier`: state and update rules shared by every manager. A goal
//!   enters the current set when it is a root or once one of its structural
//!   parents is covered.
//! - `CoverageMaps`: trace observations (branch outcomes, branchless method
//!   entries) mapped to the goals they cover.
//! - `DynamicGoalManager`: admits every goal from the start; holding nothing,
//!   its admission is a no-op.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use log::debug;

use crate::cfg::{BranchId, ControlFlowProvider};
use crate::goal::{GoalCatalog, GoalId, GoalKind};
use crate::graph::{AuxiliaryDependencies, GoalGraph};
use crate::ranking::Candidate;
use crate::search::{ExecutionTrace, FitnessEvaluator};

/// Capability interface of goal managers
pub trait GoalManager<S: Clone> {
    fn catalog(&self) -> &GoalCatalog;

    fn graph(&self) -> &GoalGraph;

    /// Goals used as objectives in the current generation
    fn current_goals(&self) -> &BTreeSet<GoalId>;

    fn covered_goals(&self) -> &BTreeSet<GoalId>;

    fn uncovered_goals(&self) -> &BTreeSet<GoalId>;

    /// First solution found covering each covered goal
    fn archive(&self) -> &BTreeMap<GoalId, S>;

    /// Uncovered method-coverage goals in play
    fn active_methods(&self) -> &BTreeSet<GoalId>;

    /// Evaluate candidates against the current goals, moving covered goals out
    /// of the frontier and their children in. Returns the number of distance
    /// evaluations performed.
    fn calculate_fitness(
        &mut self,
        candidates: &mut [Candidate<S>],
        evaluator: &mut dyn FitnessEvaluator<S>,
    ) -> usize;

    fn uncovered_buggy_count(&self) -> usize {
        let catalog = self.catalog();
        self.uncovered_goals()
            .iter()
            .filter(|&&goal| catalog.goal(goal).is_buggy())
            .count()
    }

    fn covered_buggy_count(&self) -> usize {
        let catalog = self.catalog();
        self.covered_goals()
            .iter()
            .filter(|&&goal| catalog.goal(goal).is_buggy())
            .count()
    }

    /// Release goals held back at construction. Returns whether anything was
    /// admitted; managers that hold nothing keep the default.
    fn admit_held_goals(&mut self) -> bool {
        false
    }

    /// Goals not yet admitted to the search
    fn held_goal_count(&self) -> usize {
        0
    }

    /// Hook run before ranking when coverage balancing is enabled
    fn adjust_current_goals(&mut self, _population: &[Candidate<S>]) {}
}

/// Build the dependency graph of a catalog and apply extra wiring
pub fn build_graph(
    catalog: &GoalCatalog,
    cfg: &dyn ControlFlowProvider,
    wiring: &[&dyn AuxiliaryDependencies],
) -> GoalGraph {
    let mut graph = GoalGraph::build(catalog, cfg);
    if !wiring.is_empty() {
        for dependencies in wiring {
            dependencies.wire(catalog, &mut graph);
        }
        graph.ensure_reachable();
    }
    graph
}

/// Trace observations mapped to goals
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoverageMaps {
    branch_true: HashMap<BranchId, GoalId>,
    branch_false: HashMap<BranchId, GoalId>,
    /// Keyed by `class.method`
    branchless: HashMap<String, GoalId>,
}

impl CoverageMaps {
    pub fn from_goals<I>(catalog: &GoalCatalog, goals: I) -> Self
    where
        I: IntoIterator<Item = GoalId>,
    {
        let mut maps = CoverageMaps::default();
        for id in goals {
            let goal = catalog.goal(id);
            match goal.kind() {
                GoalKind::Branch { branch, value: true } => {
                    maps.branch_true.insert(*branch, id);
                }
                GoalKind::Branch { branch, value: false } => {
                    maps.branch_false.insert(*branch, id);
                }
                GoalKind::BranchlessMethod => {
                    let location = goal.location();
                    let key = format!("{}.{}", location.class_name, location.method_name);
                    maps.branchless.insert(key, id);
                }
                _ => {}
            }
        }
        maps
    }

    pub fn merge(&mut self, other: CoverageMaps) {
        self.branch_true.extend(other.branch_true);
        self.branch_false.extend(other.branch_false);
        self.branchless.extend(other.branchless);
    }

    /// Goals covered by an execution trace
    pub fn goals_in(&self, trace: &ExecutionTrace) -> Vec<GoalId> {
        let branches = trace.covered_true.iter().filter_map(|b| self.branch_true.get(b));
        let falses = trace.covered_false.iter().filter_map(|b| self.branch_false.get(b));
        let methods = trace.entered_methods.iter().filter_map(|m| self.branchless.get(m));
        branches.chain(falses).chain(methods).copied().collect()
    }

    pub fn len(&self) -> usize {
        self.branch_true.len() + self.branch_false.len() + self.branchless.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Frontier state shared by the goal managers
#[derive(Debug, Clone)]
pub struct GoalFrontier<S> {
    catalog: GoalCatalog,
    graph: GoalGraph,
    /// Goals taking part in the search so far
    admitted: BTreeSet<GoalId>,
    current: BTreeSet<GoalId>,
    covered: BTreeSet<GoalId>,
    uncovered: BTreeSet<GoalId>,
    methods: BTreeSet<GoalId>,
    coverage: CoverageMaps,
    archive: BTreeMap<GoalId, S>,
}

impl<S: Clone> GoalFrontier<S> {
    /// Start a frontier with `admitted` uncovered and its roots current
    pub fn new(catalog: GoalCatalog, graph: GoalGraph, admitted: BTreeSet<GoalId>) -> Self {
        let current = graph
            .roots()
            .iter()
            .copied()
            .filter(|goal| admitted.contains(goal))
            .collect();
        let coverage = CoverageMaps::from_goals(&catalog, admitted.iter().copied());
        let methods = method_goals(&catalog, &admitted);

        GoalFrontier {
            uncovered: admitted.clone(),
            admitted,
            current,
            covered: BTreeSet::new(),
            methods,
            coverage,
            archive: BTreeMap::new(),
            catalog,
            graph,
        }
    }

    /// Admit more goals along with their buffered bookkeeping. Goals that are
    /// roots, or whose structural parent is already covered, become current.
    pub fn admit(
        &mut self,
        goals: &BTreeSet<GoalId>,
        coverage: CoverageMaps,
        methods: &BTreeSet<GoalId>,
    ) {
        self.admitted.extend(goals.iter().copied());
        self.uncovered
            .extend(goals.iter().copied().filter(|goal| !self.covered.contains(goal)));

        for &goal in goals {
            if self.covered.contains(&goal) {
                continue;
            }
            let reachable = self.graph.is_root(goal)
                || self
                    .graph
                    .parents(goal)
                    .iter()
                    .any(|parent| self.covered.contains(parent));
            if reachable {
                self.current.insert(goal);
            }
        }

        self.methods.extend(
            methods
                .iter()
                .copied()
                .filter(|goal| !self.covered.contains(goal)),
        );
        self.coverage.merge(coverage);
    }

    pub fn catalog(&self) -> &GoalCatalog {
        &self.catalog
    }

    pub fn graph(&self) -> &GoalGraph {
        &self.graph
    }

    pub fn admitted(&self) -> &BTreeSet<GoalId> {
        &self.admitted
    }

    pub fn current(&self) -> &BTreeSet<GoalId> {
        &self.current
    }

    /// Let `adjust` rewrite the current set. Goals it leaves there that are not
    /// uncovered are dropped afterwards.
    pub fn adjust_current<F>(&mut self, adjust: F)
    where
        F: FnOnce(&GoalCatalog, &GoalGraph, &mut BTreeSet<GoalId>),
    {
        adjust(&self.catalog, &self.graph, &mut self.current);
        let uncovered = &self.uncovered;
        self.current.retain(|goal| uncovered.contains(goal));
    }

    pub fn covered(&self) -> &BTreeSet<GoalId> {
        &self.covered
    }

    pub fn uncovered(&self) -> &BTreeSet<GoalId> {
        &self.uncovered
    }

    pub fn methods(&self) -> &BTreeSet<GoalId> {
        &self.methods
    }

    pub fn archive(&self) -> &BTreeMap<GoalId, S> {
        &self.archive
    }

    fn mark_covered(&mut self, goal: GoalId, solution: &S) -> bool {
        if !self.covered.insert(goal) {
            return false;
        }
        self.uncovered.remove(&goal);
        self.current.remove(&goal);
        self.methods.remove(&goal);
        self.archive.entry(goal).or_insert_with(|| solution.clone());
        true
    }

    fn is_open(&self, goal: GoalId) -> bool {
        self.admitted.contains(&goal) && !self.covered.contains(&goal)
    }

    pub fn calculate_fitness(
        &mut self,
        candidates: &mut [Candidate<S>],
        evaluator: &mut dyn FitnessEvaluator<S>,
    ) -> usize {
        let mut evaluations = 0;

        // goals entering the frontier late in a pass are still missing from
        // earlier candidates, so repeat until a pass evaluates nothing
        loop {
            let mut pass = 0;
            for candidate in candidates.iter_mut() {
                pass += self.evaluate(candidate, evaluator);
            }
            evaluations += pass;
            if pass == 0 {
                break;
            }
        }

        for candidate in candidates.iter_mut() {
            self.apply_trace(candidate, evaluator);
        }

        evaluations
    }

    fn evaluate(
        &mut self,
        candidate: &mut Candidate<S>,
        evaluator: &mut dyn FitnessEvaluator<S>,
    ) -> usize {
        let mut evaluations = 0;
        let mut queue: VecDeque<GoalId> = self
            .current
            .iter()
            .copied()
            .filter(|&goal| !candidate.has_fitness(goal))
            .collect();

        while let Some(goal) = queue.pop_front() {
            if candidate.has_fitness(goal) || !self.is_open(goal) {
                continue;
            }

            let distance = evaluator.distance(candidate.solution(), self.catalog.goal(goal));
            evaluations += 1;
            candidate.set_fitness(goal, distance);

            if distance == 0.0 {
                self.mark_covered(goal, candidate.solution());
                for &child in self.graph.children(goal) {
                    if self.is_open(child) {
                        self.current.insert(child);
                        queue.push_back(child);
                    }
                }
            } else {
                self.current.insert(goal);
            }
        }

        evaluations
    }

    fn apply_trace(&mut self, candidate: &mut Candidate<S>, evaluator: &mut dyn FitnessEvaluator<S>) {
        let Some(trace) = evaluator.trace(candidate.solution()) else {
            return;
        };

        for goal in self.coverage.goals_in(&trace) {
            if !self.is_open(goal) {
                continue;
            }
            debug!("{} covered by execution trace", goal);
            candidate.set_fitness(goal, 0.0);
            self.mark_covered(goal, candidate.solution());

            let children: Vec<GoalId> = self.graph.children(goal).iter().copied().collect();
            for child in children {
                if self.is_open(child) {
                    self.current.insert(child);
                }
            }
        }
    }
}

/// Method-coverage goals among `goals`
pub fn method_goals(catalog: &GoalCatalog, goals: &BTreeSet<GoalId>) -> BTreeSet<GoalId> {
    goals
        .iter()
        .copied()
        .filter(|&goal| matches!(catalog.goal(goal).kind(), GoalKind::Method))
        .collect()
}

/// Manager exposing the dynamic frontier over every goal at once
#[derive(Debug, Clone)]
pub struct DynamicGoalManager<S> {
    frontier: GoalFrontier<S>,
}

impl<S: Clone> DynamicGoalManager<S> {
    pub fn new(
        catalog: GoalCatalog,
        cfg: &dyn ControlFlowProvider,
        wiring: &[&dyn AuxiliaryDependencies],
    ) -> Self {
        let graph = build_graph(&catalog, cfg, wiring);
        let admitted = catalog.ids().collect();
        DynamicGoalManager {
            frontier: GoalFrontier::new(catalog, graph, admitted),
        }
    }
}

impl<S: Clone> GoalManager<S> for DynamicGoalManager<S> {
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{BlockId, ControlDependency, ControlFlowIndex, MethodKey};
    use crate::goal::{Goal, GoalTarget};

    /// Solutions are the sets of goals they cover
    struct Covers;

    impl FitnessEvaluator<Vec<usize>> for Covers {
        fn distance(&mut self, solution: &Vec<usize>, goal: &Goal) -> f64 {
            if solution.contains(&goal.id().0) {
                0.0
            } else {
                1.0
            }
        }
    }

    /// b0 (branch 0) -T-> b1 (branch 1), plus a branchless method
    fn setup() -> (GoalCatalog, ControlFlowIndex) {
        let m = MethodKey::new("A", "f(I)V");
        let mut cfg = ControlFlowIndex::new();
        cfg.add_block(&m, BlockId(0), Some(BranchId(0)));
        cfg.add_block(&m, BlockId(1), Some(BranchId(1)));
        cfg.add_dependency(
            &m,
            BlockId(1),
            BlockId(0),
            Some(ControlDependency { branch: BranchId(0), value: true }),
        );

        let catalog = GoalCatalog::build(
            vec![
                GoalTarget::branch("A", "f(I)V", BranchId(0), true),
                GoalTarget::branch("A", "f(I)V", BranchId(0), false),
                GoalTarget::branch("A", "f(I)V", BranchId(1), true),
                GoalTarget::branch("A", "f(I)V", BranchId(1), false),
                GoalTarget::branchless_method("A", "g()V"),
                GoalTarget::method("A", "g()V"),
            ],
            |_| true,
        );
        (catalog, cfg)
    }

    #[test]
    fn test_dynamic_manager_starts_from_roots() {
        let (catalog, cfg) = setup();
        let manager: DynamicGoalManager<Vec<usize>> = DynamicGoalManager::new(catalog, &cfg, &[]);

        let current: Vec<usize> = manager.current_goals().iter().map(|g| g.0).collect();
        assert_eq!(current, vec![0, 1, 4, 5]);
        assert_eq!(manager.uncovered_goals().len(), 6);
        assert_eq!(manager.active_methods(), &BTreeSet::from([GoalId(5)]));
    }

    #[test]
    fn test_covering_a_goal_admits_its_children() {
        let (catalog, cfg) = setup();
        let mut manager = DynamicGoalManager::new(catalog, &cfg, &[]);
        let mut candidates = vec![Candidate::new(vec![0usize])];

        let evaluations = manager.calculate_fitness(&mut candidates, &mut Covers);

        assert!(manager.covered_goals().contains(&GoalId(0)));
        assert!(!manager.current_goals().contains(&GoalId(0)));
        assert!(manager.current_goals().contains(&GoalId(2)));
        assert!(manager.current_goals().contains(&GoalId(3)));
        // 4 roots then the 2 children
        assert_eq!(evaluations, 6);
        assert_eq!(manager.archive().get(&GoalId(0)), Some(&vec![0usize]));
        assert_eq!(candidates[0].fitness(GoalId(2)), 1.0);
    }

    #[test]
    fn test_later_frontier_goals_are_evaluated_for_every_candidate() {
        let (catalog, cfg) = setup();
        let mut manager = DynamicGoalManager::new(catalog, &cfg, &[]);
        let mut candidates: Vec<Candidate<Vec<usize>>> =
            vec![Candidate::new(vec![]), Candidate::new(vec![0, 2])];

        manager.calculate_fitness(&mut candidates, &mut Covers);

        assert!(candidates[0].has_fitness(GoalId(3)));
        assert!(manager.covered_goals().contains(&GoalId(2)));
        assert!(manager.archive().get(&GoalId(2)).is_some());
        for goal in manager.current_goals() {
            assert!(!manager.covered_goals().contains(goal));
            assert!(manager.uncovered_goals().contains(goal));
        }
    }

    #[test]
    fn test_trace_marks_goals_covered() {
        struct Traced;

        impl FitnessEvaluator<Vec<usize>> for Traced {
            fn distance(&mut self, _solution: &Vec<usize>, _goal: &Goal) -> f64 {
                1.0
            }

            fn trace(&mut self, _solution: &Vec<usize>) -> Option<ExecutionTrace> {
                Some(ExecutionTrace {
                    covered_true: vec![BranchId(0)],
                    covered_false: vec![],
                    entered_methods: vec!["A.g()V".to_string()],
                })
            }
        }

        let (catalog, cfg) = setup();
        let mut manager = DynamicGoalManager::new(catalog, &cfg, &[]);
        let mut candidates: Vec<Candidate<Vec<usize>>> = vec![Candidate::new(vec![])];
        manager.calculate_fitness(&mut candidates, &mut Traced);

        assert_eq!(
            manager.covered_goals(),
            &BTreeSet::from([GoalId(0), GoalId(4)])
        );
        assert!(manager.current_goals().contains(&GoalId(2)));
        assert!(candidates[0].covers(GoalId(4)));
    }

    #[test]
    fn test_admission_is_a_no_op_without_held_goals() {
        let (catalog, cfg) = setup();
        let mut manager: DynamicGoalManager<Vec<usize>> = DynamicGoalManager::new(catalog, &cfg, &[]);
        let before = manager.current_goals().clone();

        assert!(!manager.admit_held_goals());
        assert_eq!(manager.held_goal_count(), 0);
        assert_eq!(manager.current_goals(), &before);
    }

    #[test]
    fn test_coverage_maps() {
        let (catalog, _) = setup();
        let mut maps = CoverageMaps::from_goals(&catalog, [GoalId(0), GoalId(1)]);
        assert_eq!(maps.len(), 2);

        maps.merge(CoverageMaps::from_goals(&catalog, [GoalId(4)]));
        let trace = ExecutionTrace {
            covered_true: vec![BranchId(0), BranchId(1)],
            covered_false: vec![BranchId(0)],
            entered_methods: vec!["A.g()V".to_string()],
        };
        assert_eq!(maps.goals_in(&trace), vec![GoalId(0), GoalId(1), GoalId(4)]);
    }
}
