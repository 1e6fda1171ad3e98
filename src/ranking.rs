//! Ranking and survivor selection over the active goals
//!
//! All objectives are fitness distances to minimise, one per current goal. The
//! ranking is the preference sorting of many-objective search: front 0 holds,
//! for every goal, the candidate closest to covering it; the remaining
//! candidates are ordered by plain non-dominated sorting into fronts 1, 2, ...
//!
//! Within a front that does not fit the remaining capacity, candidates are
//! ordered by an epsilon-dominance diversity score: a candidate scores high
//! when it is among the few best on some goal.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::goal::GoalId;

/// A solution together with its per-goal fitness and ranking data
#[derive(Debug, Clone)]
pub struct Candidate<S> {
    solution: S,
    fitness: BTreeMap<GoalId, f64>,
    rank: usize,
    diversity: f64,
}

impl<S> Candidate<S> {
    pub fn new(solution: S) -> Self {
        Candidate {
            solution,
            fitness: BTreeMap::new(),
            rank: 0,
            diversity: 0.0,
        }
    }

    pub fn solution(&self) -> &S {
        &self.solution
    }

    pub fn into_solution(self) -> S {
        self.solution
    }

    /// Distance to covering `goal`; unevaluated goals are infinitely far
    pub fn fitness(&self, goal: GoalId) -> f64 {
        self.fitness.get(&goal).copied().unwrap_or(f64::INFINITY)
    }

    pub fn has_fitness(&self, goal: GoalId) -> bool {
        self.fitness.contains_key(&goal)
    }

    pub fn set_fitness(&mut self, goal: GoalId, distance: f64) {
        self.fitness.insert(goal, distance);
    }

    pub fn covers(&self, goal: GoalId) -> bool {
        self.fitness.get(&goal) == Some(&0.0)
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn diversity(&self) -> f64 {
        self.diversity
    }

    pub fn set_diversity(&mut self, diversity: f64) {
        self.diversity = diversity;
    }
}

/// Pareto dominance restricted to `goals`, all minimised
pub fn dominates<S>(a: &Candidate<S>, b: &Candidate<S>, goals: &[GoalId]) -> bool {
    let mut at_least_one_better = false;

    for &goal in goals {
        let (mine, theirs) = (a.fitness(goal), b.fitness(goal));
        if theirs < mine {
            return false;
        }
        if mine < theirs {
            at_least_one_better = true;
        }
    }

    at_least_one_better
}

/// Ordered fronts, as indices into the ranked candidate slice
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fronts {
    fronts: Vec<Vec<usize>>,
}

impl Fronts {
    pub fn from_vec(fronts: Vec<Vec<usize>>) -> Self {
        Fronts { fronts }
    }

    /// Members of front `index`; empty past the last front
    pub fn front(&self, index: usize) -> &[usize] {
        self.fronts.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.fronts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fronts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &[usize]> {
        self.fronts.iter().map(Vec::as_slice)
    }

    /// Number of ranked candidates
    pub fn total(&self) -> usize {
        self.fronts.iter().map(Vec::len).sum()
    }
}

/// Rank candidates against `goals` and record each candidate's front index.
///
/// With no goals front 0 is empty and every candidate lands in front 1, in
/// population order.
pub fn rank_by_preference<S>(candidates: &mut [Candidate<S>], goals: &[GoalId]) -> Fronts {
    if candidates.is_empty() {
        return Fronts::default();
    }
    if goals.is_empty() {
        for candidate in candidates.iter_mut() {
            candidate.rank = 1;
        }
        return Fronts::from_vec(vec![Vec::new(), (0..candidates.len()).collect()]);
    }

    let mut in_first = vec![false; candidates.len()];
    let mut first = Vec::new();
    for &goal in goals {
        let mut best: Option<usize> = None;
        for (index, candidate) in candidates.iter().enumerate() {
            let better = match best {
                None => true,
                Some(current) => candidate.fitness(goal) < candidates[current].fitness(goal),
            };
            if better {
                best = Some(index);
            }
        }
        if let Some(index) = best {
            if !in_first[index] {
                in_first[index] = true;
                first.push(index);
            }
        }
    }
    first.sort_unstable();

    let rest: Vec<usize> = (0..candidates.len()).filter(|&i| !in_first[i]).collect();
    let mut fronts = vec![first];
    fronts.extend(non_dominated_sort(candidates, &rest, goals));

    for (rank, front) in fronts.iter().enumerate() {
        for &index in front {
            candidates[index].rank = rank;
        }
    }

    Fronts::from_vec(fronts)
}

/// Fast non-dominated sorting of a subset of candidates
fn non_dominated_sort<S>(
    candidates: &[Candidate<S>],
    members: &[usize],
    goals: &[GoalId],
) -> Vec<Vec<usize>> {
    let n = members.len();
    let mut dominated_by_me: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut domination_count = vec![0usize; n];

    for p in 0..n {
        for q in (p + 1)..n {
            let (a, b) = (&candidates[members[p]], &candidates[members[q]]);
            if dominates(a, b, goals) {
                dominated_by_me[p].push(q);
                domination_count[q] += 1;
            } else if dominates(b, a, goals) {
                dominated_by_me[q].push(p);
                domination_count[p] += 1;
            }
        }
    }

    let mut fronts = Vec::new();
    let mut current: Vec<usize> = (0..n).filter(|&p| domination_count[p] == 0).collect();
    while !current.is_empty() {
        let mut next = Vec::new();
        for &p in &current {
            for &q in &dominated_by_me[p] {
                domination_count[q] -= 1;
                if domination_count[q] == 0 {
                    next.push(q);
                }
            }
        }
        next.sort_unstable();
        fronts.push(current.iter().map(|&p| members[p]).collect());
        current = next;
    }

    fronts
}

/// Epsilon-dominance diversity of the members of one front.
///
/// For each goal on which the front is not uniform, the members sharing the
/// minimum distance score `(|front| - |minimum set|) / |front|`; a member keeps
/// its best score over all goals.
pub fn assign_epsilon_diversity<S>(candidates: &mut [Candidate<S>], front: &[usize], goals: &[GoalId]) {
    for &index in front {
        candidates[index].diversity = 0.0;
    }
    if front.is_empty() {
        return;
    }

    let size = front.len() as f64;
    for &goal in goals {
        let mut min = f64::INFINITY;
        let mut max = 0.0_f64;
        let mut min_set: Vec<usize> = Vec::new();

        for &index in front {
            let value = candidates[index].fitness(goal);
            if value < min {
                min = value;
                min_set.clear();
                min_set.push(index);
            } else if value == min {
                min_set.push(index);
            }
            if value > max {
                max = value;
            }
        }

        if max == min {
            continue;
        }

        let score = (size - min_set.len() as f64) / size;
        for index in min_set {
            let candidate = &mut candidates[index];
            candidate.diversity = candidate.diversity.max(score);
        }
    }
}

/// Build the next population from ranked candidates.
///
/// Whole fronts are taken while they fit; the first front that does not fit is
/// cut by descending diversity. Capacity is never below the size of front 0,
/// and an empty front 0 is skipped.
pub fn select_survivors<S>(
    mut candidates: Vec<Candidate<S>>,
    fronts: &Fronts,
    population_size: usize,
    goals: &[GoalId],
) -> Vec<Candidate<S>> {
    let capacity = population_size.max(fronts.front(0).len());
    let mut remain = capacity;
    let mut chosen: Vec<usize> = Vec::with_capacity(capacity);

    let mut index = if fronts.front(0).is_empty() { 1 } else { 0 };
    let mut front = fronts.front(index);

    while remain > 0 && !front.is_empty() && front.len() <= remain {
        assign_epsilon_diversity(&mut candidates, front, goals);
        chosen.extend_from_slice(front);
        remain -= front.len();
        index += 1;
        front = fronts.front(index);
    }

    if remain > 0 && !front.is_empty() {
        assign_epsilon_diversity(&mut candidates, front, goals);
        let mut ordered = front.to_vec();
        ordered.sort_by(|&a, &b| {
            candidates[b]
                .diversity
                .partial_cmp(&candidates[a].diversity)
                .unwrap_or(Ordering::Equal)
        });
        chosen.extend(ordered.into_iter().take(remain));
    }

    let mut slots: Vec<Option<Candidate<S>>> = candidates.into_iter().map(Some).collect();
    chosen
        .into_iter()
        .filter_map(|index| slots.get_mut(index).and_then(Option::take))
        .collect()
}
