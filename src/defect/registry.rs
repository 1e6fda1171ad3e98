//! Method pool registry
//!
//! One `MethodPool` per class under test, created on first use. Instrumentation
//! reports inner classes as classes of their own, so a lookup for `pkg.A$B`
//! (or `pkg.A.B`) resolves to the pool of `pkg.A` when one is registered.

use std::collections::BTreeMap;
use std::path::PathBuf;

use super::pool::MethodPool;
use super::DefectResult;
use crate::cfg::BranchInventory;
use crate::config::{SearchConfig, SignatureFormat};

/// Registered class owning `class_name`: an exact match, otherwise the
/// longest registered outer class `O` with `class_name` starting with `O.`
/// or `O$`.
pub fn resolve_owner<'a, I>(registered: I, class_name: &str) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut owner: Option<&'a str> = None;

    for candidate in registered {
        if candidate == class_name {
            return Some(candidate);
        }

        let is_outer = class_name
            .strip_prefix(candidate)
            .map_or(false, |rest| rest.starts_with('.') || rest.starts_with('$'));
        if is_outer && owner.map_or(true, |current| candidate.len() > current.len()) {
            owner = Some(candidate);
        }
    }

    owner
}

/// Pools of every class seen during a run
#[derive(Debug, Clone)]
pub struct MethodRegistry {
    source: Option<PathBuf>,
    format: SignatureFormat,
    pools: BTreeMap<String, MethodPool>,
}

impl MethodRegistry {
    pub fn new(source: Option<PathBuf>, format: SignatureFormat) -> Self {
        MethodRegistry {
            source,
            format,
            pools: BTreeMap::new(),
        }
    }

    pub fn from_config(config: &SearchConfig) -> Self {
        MethodRegistry::new(config.defect_scores_path.clone(), config.signature_format)
    }

    /// Key of the pool that serves `class_name`, if registered
    pub fn resolve_owner(&self, class_name: &str) -> Option<&str> {
        resolve_owner(self.pools.keys().map(String::as_str), class_name)
    }

    pub fn pool(&self, class_name: &str) -> Option<&MethodPool> {
        self.resolve_owner(class_name)
            .and_then(|owner| self.pools.get(owner))
    }

    /// Pool serving `class_name`, creating and loading it on first use
    pub fn pool_for(&mut self, class_name: &str) -> &mut MethodPool {
        let key = self
            .resolve_owner(class_name)
            .unwrap_or(class_name)
            .to_string();

        let source = &self.source;
        let format = self.format;
        self.pools
            .entry(key)
            .or_insert_with_key(|key| MethodPool::loaded(key, source.clone(), format))
    }

    /// Register a pool built elsewhere, replacing any pool of the same class
    pub fn insert(&mut self, pool: MethodPool) {
        self.pools.insert(pool.class_name().to_string(), pool);
    }

    /// Enrich a class's pool with branch data and derive its weights
    pub fn prepare_class(
        &mut self,
        class_name: &str,
        inventory: &dyn BranchInventory,
    ) -> DefectResult<()> {
        self.pool_for(class_name).prepare(inventory)
    }

    pub fn is_buggy(&mut self, class_name: &str, method_name: &str) -> bool {
        self.pool_for(class_name).is_buggy(class_name, method_name)
    }

    pub fn archive_probability(&mut self, class_name: &str, method_name: &str) -> f64 {
        self.pool_for(class_name)
            .archive_probability(class_name, method_name)
    }

    pub fn weight_of(&mut self, class_name: &str, method_name: &str) -> f64 {
        self.pool_for(class_name).weight_of(class_name, method_name)
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.pools.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_resolve_owner_exact_and_inner() {
        let registered = ["pkg.A", "pkg.B", "pkg.A$Inner"];

        assert_eq!(resolve_owner(registered.iter().copied(), "pkg.A"), Some("pkg.A"));
        assert_eq!(resolve_owner(registered.iter().copied(), "pkg.B$1"), Some("pkg.B"));
        assert_eq!(resolve_owner(registered.iter().copied(), "pkg.A.Other"), Some("pkg.A"));
        assert_eq!(
            resolve_owner(registered.iter().copied(), "pkg.A$Inner$Deep"),
            Some("pkg.A$Inner")
        );
    }

    #[test]
    fn test_resolve_owner_requires_separator() {
        let registered = ["pkg.A"];
        assert_eq!(resolve_owner(registered.iter().copied(), "pkg.AB"), None);
        assert_eq!(resolve_owner(registered.iter().copied(), "pkg"), None);
    }

    #[test]
    fn test_pools_created_lazily_and_shared_with_inner_classes() {
        let mut registry = MethodRegistry::new(None, SignatureFormat::Jvm);
        assert!(registry.is_empty());

        registry.pool_for("pkg.A");
        registry.pool_for("pkg.A$Inner");
        registry.pool_for("pkg.B");

        let classes: Vec<&str> = registry.classes().collect();
        assert_eq!(classes, vec!["pkg.A", "pkg.B"]);
        assert_eq!(registry.pool("pkg.A.Inner").unwrap().class_name(), "pkg.A");
    }

    #[test]
    fn test_registry_queries_go_through_owner_pool() {
        let mut pool = MethodPool::new("pkg.A", None, SignatureFormat::Jvm);
        pool.load_from_reader(Cursor::new(
            "pkg.A.f()V,1\npkg.A$In.g()V,0.5\n".to_string(),
        ))
        .unwrap();
        pool.calculate_archive_probabilities();

        let mut registry = MethodRegistry::new(None, SignatureFormat::Jvm);
        registry.insert(pool);

        assert!(registry.is_buggy("pkg.A", "f()V"));
        assert!(!registry.is_buggy("pkg.A$In", "g()V"));
        assert_eq!(registry.archive_probability("pkg.A$In", "g()V"), 0.5);
        assert!(!registry.is_buggy("pkg.Unknown", "h()V"));
        assert_eq!(registry.len(), 2);
    }
}
