//! Goal dependency graph
//!
//! A directed graph over goals where an edge `parent -> child` means the child
//! goal's branch is control dependent on the parent's branch outcome, with no
//! other goal in between. Goals that can be reached without passing any other
//! goal's branch are roots.
//!
//! Construction walks the control-dependence relation backwards from each
//! branch's basic block with an explicit stack. Each walk memoizes the
//! `(block, dependency)` pairs it has seen, so merge points and loops are
//! visited once. The walk stops at the first predecessor holding a branch; that
//! branch's outcome goal becomes a parent.
//!
//! The graph is built once per search and only read afterwards, apart from
//! criterion-specific wiring applied right after construction.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use log::debug;

use crate::cfg::{BlockId, ControlDependency, ControlFlowProvider, MethodKey};
use crate::goal::{GoalCatalog, GoalId};

static NO_GOALS: BTreeSet<GoalId> = BTreeSet::new();

/// Extra dependency edges for criteria that are not branches (lines,
/// statements, mutants...), supplied by whoever knows how they map to branches
pub trait AuxiliaryDependencies {
    fn wire(&self, catalog: &GoalCatalog, graph: &mut GoalGraph);
}

impl<F> AuxiliaryDependencies for F
where
    F: Fn(&GoalCatalog, &mut GoalGraph),
{
    fn wire(&self, catalog: &GoalCatalog, graph: &mut GoalGraph) {
        self(catalog, graph)
    }
}

/// Control dependency graph over coverage goals
#[derive(Debug, Clone, Default)]
pub struct GoalGraph {
    parents: BTreeMap<GoalId, BTreeSet<GoalId>>,
    children: BTreeMap<GoalId, BTreeSet<GoalId>>,
    roots: BTreeSet<GoalId>,
    /// Memoized transitive children
    descendants: RefCell<HashMap<GoalId, BTreeSet<GoalId>>>,
}

impl GoalGraph {
    /// Derive the dependencies among all goals of a catalog
    pub fn build(catalog: &GoalCatalog, cfg: &dyn ControlFlowProvider) -> Self {
        let mut graph = GoalGraph::default();

        for goal in catalog.iter() {
            let id = goal.id();
            graph.parents.entry(id).or_default();
            graph.children.entry(id).or_default();

            let Some((branch, _)) = goal.kind().branch() else {
                graph.roots.insert(id);
                continue;
            };
            let Some(site) = cfg.branch_site(branch) else {
                debug!("No control flow data for {}, treating it as a root", goal);
                graph.roots.insert(id);
                continue;
            };
            if site.root_dependent {
                graph.roots.insert(id);
                continue;
            }

            let mut linked = false;
            let mut reaches_entry = false;

            for (block, dependency) in parent_blocks(cfg, &site.method, site.block) {
                let Some(parent_branch) = cfg.branch_in_block(&site.method, block) else {
                    reaches_entry = true;
                    continue;
                };
                let Some(dependency) = dependency else {
                    reaches_entry = true;
                    continue;
                };

                match catalog.branch_goal(parent_branch, dependency.value) {
                    Some(parent) if parent != id => {
                        graph.add_edge(parent, id);
                        linked = true;
                    }
                    Some(_) => {}
                    None => debug!(
                        "Parent branch {} of {} is not a target",
                        parent_branch.0, goal
                    ),
                }
            }

            if reaches_entry || !linked {
                graph.roots.insert(id);
            }
        }

        graph.ensure_reachable();
        graph
    }

    fn add_edge(&mut self, parent: GoalId, child: GoalId) {
        self.children.entry(parent).or_default().insert(child);
        self.parents.entry(child).or_default().insert(parent);
        self.parents.entry(parent).or_default();
        self.children.entry(child).or_default();
    }

    /// Make `child` depend on `parent`. The child stops being a root.
    pub fn add_dependency(&mut self, parent: GoalId, child: GoalId) {
        if parent == child {
            return;
        }
        self.add_edge(parent, child);
        self.roots.remove(&child);
        self.descendants.borrow_mut().clear();
    }

    /// Promote every goal without a path from a root to a root
    pub fn ensure_reachable(&mut self) {
        let mut reached: HashSet<GoalId> = self.roots.iter().copied().collect();
        let mut queue: VecDeque<GoalId> = self.roots.iter().copied().collect();

        while let Some(goal) = queue.pop_front() {
            for &child in self.children(goal) {
                if reached.insert(child) {
                    queue.push_back(child);
                }
            }
        }

        let isolated: Vec<GoalId> = self
            .parents
            .keys()
            .copied()
            .filter(|goal| !reached.contains(goal))
            .collect();
        for goal in isolated {
            if reached.contains(&goal) {
                continue;
            }
            debug!("{} has no path from a root, promoting it to a root", goal);
            self.roots.insert(goal);
            // promoting one member of an isolated cycle reaches the rest
            let mut queue = VecDeque::from([goal]);
            while let Some(next) = queue.pop_front() {
                for &child in self.children(next) {
                    if reached.insert(child) {
                        queue.push_back(child);
                    }
                }
            }
            reached.insert(goal);
        }
    }

    pub fn roots(&self) -> &BTreeSet<GoalId> {
        &self.roots
    }

    pub fn is_root(&self, goal: GoalId) -> bool {
        self.roots.contains(&goal)
    }

    /// Direct structural parents
    pub fn parents(&self, goal: GoalId) -> &BTreeSet<GoalId> {
        self.parents.get(&goal).unwrap_or(&NO_GOALS)
    }

    /// Direct structural children
    pub fn children(&self, goal: GoalId) -> &BTreeSet<GoalId> {
        self.children.get(&goal).unwrap_or(&NO_GOALS)
    }

    /// Transitive children of a goal
    pub fn all_descendants(&self, goal: GoalId) -> BTreeSet<GoalId> {
        let mut memo = self.descendants.borrow_mut();
        self.collect_descendants(goal, &BTreeSet::new(), &mut memo)
    }

    fn collect_descendants(
        &self,
        goal: GoalId,
        ancestors: &BTreeSet<GoalId>,
        memo: &mut HashMap<GoalId, BTreeSet<GoalId>>,
    ) -> BTreeSet<GoalId> {
        let mut path = ancestors.clone();
        path.insert(goal);

        let mut descendants = BTreeSet::new();
        for &child in self.children(goal) {
            if path.contains(&child) {
                continue;
            }
            descendants.insert(child);

            match memo.get(&child) {
                Some(known) => descendants.extend(known.iter().copied()),
                None => {
                    let below = self.collect_descendants(child, &path, memo);
                    descendants.extend(below);
                }
            }
        }

        memo.entry(goal).or_insert_with(|| descendants.clone());
        descendants
    }

    /// Roots from which `goal` can be reached
    pub fn root_ancestors(&self, goal: GoalId) -> BTreeSet<GoalId> {
        let mut found = BTreeSet::new();
        let mut seen = HashSet::from([goal]);
        let mut stack = vec![goal];

        while let Some(next) = stack.pop() {
            if self.is_root(next) {
                found.insert(next);
            }
            for &parent in self.parents(next) {
                if seen.insert(parent) {
                    stack.push(parent);
                }
            }
        }

        found
    }

    pub fn goal_count(&self) -> usize {
        self.parents.len()
    }

    pub fn edge_count(&self) -> usize {
        self.children.values().map(BTreeSet::len).sum()
    }
}

/// Nearest control-dependence ancestors of `start` that hold a branch. A block
/// with no control dependence at all yields itself paired with `None`.
fn parent_blocks(
    cfg: &dyn ControlFlowProvider,
    method: &MethodKey,
    start: BlockId,
) -> Vec<(BlockId, Option<ControlDependency>)> {
    let mut found = Vec::new();
    let mut visited: HashSet<(BlockId, Option<ControlDependency>)> = HashSet::new();
    let mut stack = vec![start];

    while let Some(block) = stack.pop() {
        let parents = cfg.parents_with_cd(method, block);
        if parents.is_empty() {
            if visited.insert((block, None)) {
                found.push((block, None));
            }
            continue;
        }

        for pair in parents {
            if !visited.insert(pair) {
                continue;
            }
            let (parent, _) = pair;
            if cfg.branch_in_block(method, parent).is_some() {
                found.push(pair);
            } else {
                stack.push(parent);
            }
        }
    }

    found
}
