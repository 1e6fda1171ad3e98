//! Control-flow collaborator model
//!
//! The search core never extracts control-flow graphs itself. It consumes them
//! through two traits:
//! - `ControlFlowProvider`: branch sites, control-dependence parents of a basic
//!   block, and the branch instruction (if any) a block ends with
//! - `BranchInventory`: per-class method listing and branch counts, used to
//!   enrich defect weights
//!
//! `ControlFlowIndex` is an in-memory implementation of both, filled in by
//! whatever component performs the instrumentation.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Identifier of a conditional branch instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BranchId(pub u32);

/// Identifier of a basic block, unique within its method
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u32);

/// Fully qualified method, with the method name in JVM descriptor notation
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MethodKey {
    pub class_name: String,
    pub method_name: String,
}

impl MethodKey {
    pub fn new(class_name: &str, method_name: &str) -> Self {
        MethodKey {
            class_name: class_name.to_string(),
            method_name: method_name.to_string(),
        }
    }

    /// `class.method(desc)`, the form used for defect lookups
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.class_name, self.method_name)
    }
}

/// Edge of the control-dependence relation: the block is reached when
/// `branch` evaluates to `value`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ControlDependency {
    pub branch: BranchId,
    pub value: bool,
}

/// Where a branch instruction lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchSite {
    pub method: MethodKey,
    pub block: BlockId,
    /// Reached unconditionally from the method entry
    pub root_dependent: bool,
}

/// Read-only view of control flow and control dependence
pub trait ControlFlowProvider {
    /// Location of a branch instruction
    fn branch_site(&self, branch: BranchId) -> Option<BranchSite>;

    /// Control-dependence parents of a block. An empty result means the block
    /// depends on nothing but the method entry.
    fn parents_with_cd(
        &self,
        method: &MethodKey,
        block: BlockId,
    ) -> Vec<(BlockId, Option<ControlDependency>)>;

    /// The branch instruction contained in a block, if any
    fn branch_in_block(&self, method: &MethodKey, block: BlockId) -> Option<BranchId>;
}

/// Per-class branch statistics
pub trait BranchInventory {
    /// Method names (JVM notation) of a class that have instrumentation data
    fn methods_in_class(&self, class_name: &str) -> Vec<String>;

    /// Number of branch instructions of a method
    fn branch_count(&self, class_name: &str, method_name: &str) -> usize;

    /// Branch instructions of a method
    fn branch_ids(&self, class_name: &str, method_name: &str) -> Vec<BranchId>;
}

#[derive(Debug, Clone, Default)]
struct BlockInfo {
    branch: Option<BranchId>,
    parents: Vec<(BlockId, Option<ControlDependency>)>,
}

#[derive(Debug, Clone, Default)]
struct MethodCfg {
    blocks: BTreeMap<BlockId, BlockInfo>,
}

/// In-memory control-flow data for a set of methods
#[derive(Debug, Clone, Default)]
pub struct ControlFlowIndex {
    methods: BTreeMap<MethodKey, MethodCfg>,
    sites: HashMap<BranchId, BranchSite>,
}

impl ControlFlowIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method with no blocks (a branchless method)
    pub fn add_method(&mut self, method: &MethodKey) {
        self.methods.entry(method.clone()).or_default();
    }

    /// Register a block; a block may end in at most one branch
    pub fn add_block(&mut self, method: &MethodKey, block: BlockId, branch: Option<BranchId>) {
        let info = self
            .methods
            .entry(method.clone())
            .or_default()
            .blocks
            .entry(block)
            .or_default();
        info.branch = branch;

        if let Some(branch) = branch {
            self.sites.entry(branch).or_insert(BranchSite {
                method: method.clone(),
                block,
                root_dependent: false,
            });
        }
    }

    /// Record that `child` is control dependent on `parent`
    pub fn add_dependency(
        &mut self,
        method: &MethodKey,
        child: BlockId,
        parent: BlockId,
        dependency: Option<ControlDependency>,
    ) {
        self.methods
            .entry(method.clone())
            .or_default()
            .blocks
            .entry(child)
            .or_default()
            .parents
            .push((parent, dependency));
    }

    /// Flag a branch as reachable without passing any other branch
    pub fn mark_root_dependent(&mut self, branch: BranchId) {
        if let Some(site) = self.sites.get_mut(&branch) {
            site.root_dependent = true;
        }
    }

    fn block(&self, method: &MethodKey, block: BlockId) -> Option<&BlockInfo> {
        self.methods.get(method).and_then(|cfg| cfg.blocks.get(&block))
    }
}

impl ControlFlowProvider for ControlFlowIndex {
    fn branch_site(&self, branch: BranchId) -> Option<BranchSite> {
        self.sites.get(&branch).cloned()
    }

    fn parents_with_cd(
        &self,
        method: &MethodKey,
        block: BlockId,
    ) -> Vec<(BlockId, Option<ControlDependency>)> {
        self.block(method, block)
            .map(|info| info.parents.clone())
            .unwrap_or_default()
    }

    fn branch_in_block(&self, method: &MethodKey, block: BlockId) -> Option<BranchId> {
        self.block(method, block).and_then(|info| info.branch)
    }
}

impl BranchInventory for ControlFlowIndex {
    fn methods_in_class(&self, class_name: &str) -> Vec<String> {
        self.methods
            .keys()
            .filter(|key| key.class_name == class_name)
            .map(|key| key.method_name.clone())
            .collect()
    }

    fn branch_count(&self, class_name: &str, method_name: &str) -> usize {
        self.branch_ids(class_name, method_name).len()
    }

    fn branch_ids(&self, class_name: &str, method_name: &str) -> Vec<BranchId> {
        let key = MethodKey::new(class_name, method_name);
        self.methods
            .get(&key)
            .map(|cfg| cfg.blocks.values().filter_map(|info| info.branch).collect())
            .unwrap_or_default()
    }
}
