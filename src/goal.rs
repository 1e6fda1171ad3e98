//! Coverage goals
//!
//! Goals are created once from the externally supplied target list, classified
//! against the defect model, and never change afterwards. They live in a
//! `GoalCatalog` arena and are referred to everywhere else by `GoalId`.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cfg::BranchId;
use crate::defect::MethodRegistry;

/// Index of a goal in its catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GoalId(pub usize);

impl fmt::Display for GoalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "goal#{}", self.0)
    }
}

/// Code location a goal originates from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodeLocation {
    pub class_name: String,
    /// Method name in JVM descriptor notation, e.g. `push(Ljava/lang/Object;)V`
    pub method_name: String,
    pub line: Option<u32>,
}

impl CodeLocation {
    pub fn new(class_name: &str, method_name: &str) -> Self {
        CodeLocation {
            class_name: class_name.to_string(),
            method_name: method_name.to_string(),
            line: None,
        }
    }
}

/// Coverage criterion of a goal
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GoalKind {
    /// One outcome of a conditional branch
    Branch { branch: BranchId, value: bool },
    /// Entry of a method without branches
    BranchlessMethod,
    /// Method coverage
    Method,
    /// Line coverage
    Line { line: u32 },
    /// Any other criterion, identified by a criterion-specific key
    Criterion { criterion: String, key: String },
}

impl GoalKind {
    /// Whether defect scores apply to this kind of goal
    pub fn has_defect_data(&self) -> bool {
        matches!(
            self,
            GoalKind::Branch { .. } | GoalKind::BranchlessMethod | GoalKind::Method
        )
    }

    pub fn branch(&self) -> Option<(BranchId, bool)> {
        match *self {
            GoalKind::Branch { branch, value } => Some((branch, value)),
            _ => None,
        }
    }
}

/// A goal as supplied by the instrumentation, before classification
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GoalTarget {
    pub kind: GoalKind,
    pub location: CodeLocation,
}

impl GoalTarget {
    pub fn branch(class_name: &str, method_name: &str, branch: BranchId, value: bool) -> Self {
        GoalTarget {
            kind: GoalKind::Branch { branch, value },
            location: CodeLocation::new(class_name, method_name),
        }
    }

    pub fn branchless_method(class_name: &str, method_name: &str) -> Self {
        GoalTarget {
            kind: GoalKind::BranchlessMethod,
            location: CodeLocation::new(class_name, method_name),
        }
    }

    pub fn method(class_name: &str, method_name: &str) -> Self {
        GoalTarget {
            kind: GoalKind::Method,
            location: CodeLocation::new(class_name, method_name),
        }
    }

    pub fn line(class_name: &str, method_name: &str, line: u32) -> Self {
        let mut location = CodeLocation::new(class_name, method_name);
        location.line = Some(line);
        GoalTarget {
            kind: GoalKind::Line { line },
            location,
        }
    }

    pub fn criterion(class_name: &str, method_name: &str, criterion: &str, key: &str) -> Self {
        GoalTarget {
            kind: GoalKind::Criterion {
                criterion: criterion.to_string(),
                key: key.to_string(),
            },
            location: CodeLocation::new(class_name, method_name),
        }
    }
}

/// A classified, immutable coverage goal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    id: GoalId,
    kind: GoalKind,
    location: CodeLocation,
    buggy: bool,
}

impl Goal {
    pub fn id(&self) -> GoalId {
        self.id
    }

    pub fn kind(&self) -> &GoalKind {
        &self.kind
    }

    pub fn location(&self) -> &CodeLocation {
        &self.location
    }

    /// Buggy goals are searched from the start; the rest are held back until
    /// the admission trigger fires. Goals without defect data are always buggy.
    pub fn is_buggy(&self) -> bool {
        self.buggy
    }
}

impl fmt::Display for Goal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let location = format!("{}.{}", self.location.class_name, self.location.method_name);
        match &self.kind {
            GoalKind::Branch { branch, value } => {
                write!(f, "{} branch {} {}", location, branch.0, if *value { "T" } else { "F" })
            }
            GoalKind::BranchlessMethod => write!(f, "{} branchless", location),
            GoalKind::Method => write!(f, "{} method", location),
            GoalKind::Line { line } => write!(f, "{} line {}", location, line),
            GoalKind::Criterion { criterion, key } => write!(f, "{} {} {}", location, criterion, key),
        }
    }
}

/// Arena of every goal of a search
#[derive(Debug, Clone, Default)]
pub struct GoalCatalog {
    goals: Vec<Goal>,
    branch_goals: HashMap<(BranchId, bool), GoalId>,
}

impl GoalCatalog {
    /// Create goals from targets; `classify` decides buggy-ness of the goals
    /// that carry defect data
    pub fn build<F>(targets: Vec<GoalTarget>, mut classify: F) -> Self
    where
        F: FnMut(&GoalTarget) -> bool,
    {
        let mut catalog = GoalCatalog::default();

        for target in targets {
            let id = GoalId(catalog.goals.len());
            let buggy = if target.kind.has_defect_data() {
                classify(&target)
            } else {
                true
            };
            if let Some(key) = target.kind.branch() {
                catalog.branch_goals.entry(key).or_insert(id);
            }
            catalog.goals.push(Goal {
                id,
                kind: target.kind,
                location: target.location,
                buggy,
            });
        }

        catalog
    }

    /// Create goals classified by the defect model
    pub fn classify(targets: Vec<GoalTarget>, registry: &mut MethodRegistry) -> Self {
        Self::build(targets, |target| {
            registry.is_buggy(&target.location.class_name, &target.location.method_name)
        })
    }

    /// Panics on an id from another catalog
    pub fn goal(&self, id: GoalId) -> &Goal {
        &self.goals[id.0]
    }

    pub fn get(&self, id: GoalId) -> Option<&Goal> {
        self.goals.get(id.0)
    }

    /// Goal of a branch outcome, if it is a target
    pub fn branch_goal(&self, branch: BranchId, value: bool) -> Option<GoalId> {
        self.branch_goals.get(&(branch, value)).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Goal> {
        self.goals.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = GoalId> + '_ {
        self.goals.iter().map(|goal| goal.id)
    }

    pub fn len(&self) -> usize {
        self.goals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.goals.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_assigns_ids_and_classification() {
        let catalog = GoalCatalog::build(
            vec![
                GoalTarget::branch("A", "f()V", BranchId(1), true),
                GoalTarget::branch("A", "f()V", BranchId(1), false),
                GoalTarget::method("A", "g()V"),
                GoalTarget::line("A", "g()V", 12),
            ],
            |target| target.location.method_name == "f()V",
        );

        assert_eq!(catalog.len(), 4);
        assert_eq!(catalog.goal(GoalId(2)).id(), GoalId(2));
        assert!(catalog.goal(GoalId(0)).is_buggy());
        assert!(!catalog.goal(GoalId(2)).is_buggy());
        // no defect data for lines, never held back
        assert!(catalog.goal(GoalId(3)).is_buggy());
        assert_eq!(catalog.branch_goal(BranchId(1), false), Some(GoalId(1)));
        assert_eq!(catalog.branch_goal(BranchId(2), true), None);
    }

    #[test]
    fn test_display() {
        let catalog = GoalCatalog::build(
            vec![GoalTarget::branch("A", "f()V", BranchId(3), false)],
            |_| true,
        );
        assert_eq!(catalog.goal(GoalId(0)).to_string(), "A.f()V branch 3 F");
        assert_eq!(GoalId(0).to_string(), "goal#0");
    }
}
