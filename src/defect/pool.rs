//! Per-class method pool
//!
//! Lifecycle of a pool:
//! 1. `load_defect_scores` reads the rows of the table that belong to the class
//! 2. `enrich` attaches branch counts once instrumentation data exists, and
//!    records which instrumented name maps to which loaded record
//! 3. `calculate_weights`, `calculate_archive_probabilities` and
//!    `calculate_scale_down_factor` derive the prioritisation metrics
//!
//! `prepare` runs steps 2 and 3 in order.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;

use log::{debug, error, info, warn};

use super::method::MethodRecord;
use super::signature::{jvm_to_native, normalize_native};
use super::{DefectError, DefectResult};
use crate::cfg::BranchInventory;
use crate::config::SignatureFormat;

/// Defect records of one class under test
#[derive(Debug, Clone)]
pub struct MethodPool {
    class_name: String,
    source: Option<PathBuf>,
    format: SignatureFormat,

    /// Loaded records keyed by their (normalised) table identifier
    methods: BTreeMap<String, MethodRecord>,

    /// Instrumented `class.method(desc)` name to loaded key
    equivalent_names: BTreeMap<String, String>,

    default_weight: f64,
    total_branches: usize,
    scale_down_factor: f64,
    weights_ready: bool,
    reported_missing_table: bool,
}

impl MethodPool {
    /// Create an empty pool reading from `source` when loaded
    pub fn new(class_name: &str, source: Option<PathBuf>, format: SignatureFormat) -> Self {
        MethodPool {
            class_name: class_name.to_string(),
            source,
            format,
            methods: BTreeMap::new(),
            equivalent_names: BTreeMap::new(),
            default_weight: 0.0,
            total_branches: 0,
            scale_down_factor: 0.0,
            weights_ready: false,
            reported_missing_table: false,
        }
    }

    /// Create a pool and load its defect scores. A table that cannot be read
    /// leaves the pool empty.
    pub fn loaded(class_name: &str, source: Option<PathBuf>, format: SignatureFormat) -> Self {
        let mut pool = MethodPool::new(class_name, source, format);
        if let Err(e) = pool.load_defect_scores() {
            warn!("Could not load defect scores for {}: {}", class_name, e);
        }
        pool
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Replace the loaded records with the current contents of the table
    pub fn load_defect_scores(&mut self) -> DefectResult<usize> {
        self.methods = self.read_defect_table()?;
        self.weights_ready = false;
        Ok(self.methods.len())
    }

    /// Replace the loaded records with rows read from `reader`
    pub fn load_from_reader<R: BufRead>(&mut self, reader: R) -> DefectResult<usize> {
        self.methods = self.parse_rows(reader)?;
        self.weights_ready = false;
        Ok(self.methods.len())
    }

    fn read_defect_table(&mut self) -> DefectResult<BTreeMap<String, MethodRecord>> {
        let Some(path) = self.source.clone() else {
            self.report_missing_table("no defect table configured");
            return Ok(BTreeMap::new());
        };

        info!("Reading defect scores for {} from {}", self.class_name, path.display());
        match File::open(&path) {
            Ok(file) => self.parse_rows(BufReader::new(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.report_missing_table(&format!("{} does not exist", path.display()));
                Ok(BTreeMap::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn report_missing_table(&mut self, reason: &str) {
        if self.reported_missing_table {
            debug!("No defect data for {}: {}", self.class_name, reason);
        } else {
            warn!("No defect data for {}: {}", self.class_name, reason);
            self.reported_missing_table = true;
        }
    }

    fn parse_rows<R: BufRead>(&self, reader: R) -> DefectResult<BTreeMap<String, MethodRecord>> {
        let mut methods = BTreeMap::new();

        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let row = line.trim();
            if row.is_empty() {
                continue;
            }

            match self.parse_row(index + 1, row) {
                Ok(Some(record)) => {
                    methods.insert(record.name.clone(), record);
                }
                Ok(None) => {}
                Err(e) => warn!("Skipping defect table row: {}", e),
            }
        }

        Ok(methods)
    }

    /// Parse one `method,score` row; rows of other classes yield `None`
    fn parse_row(&self, line: usize, row: &str) -> DefectResult<Option<MethodRecord>> {
        // Generic parameters of native signatures may contain commas, the score never does
        let (name, score) = row.rsplit_once(',').ok_or_else(|| DefectError::MalformedRow {
            line,
            reason: format!("expected 'method,score' but found '{}'", row),
        })?;
        let name = name.trim();

        if !name.starts_with(&self.class_name) {
            return Ok(None);
        }

        let score: f64 = score.trim().parse().map_err(|_| DefectError::MalformedRow {
            line,
            reason: format!("invalid defect score '{}'", score.trim()),
        })?;
        if !(0.0..=1.0).contains(&score) {
            return Err(DefectError::MalformedRow {
                line,
                reason: format!("defect score {} outside [0, 1]", score),
            });
        }

        let name = match self.format {
            SignatureFormat::Jvm => name.to_string(),
            SignatureFormat::Native => normalize_native(name)?,
        };

        Ok(Some(MethodRecord::new(&name, score)))
    }

    /// Table key a fully qualified instrumented name should correspond to
    fn loaded_name_for(&self, qualified: &str) -> DefectResult<String> {
        match self.format {
            SignatureFormat::Jvm => Ok(qualified.to_string()),
            SignatureFormat::Native => Ok(jvm_to_native(qualified, &self.class_name)?),
        }
    }

    /// Attach branch data to the loaded records and compute the class's
    /// total branch count
    pub fn enrich(&mut self, inventory: &dyn BranchInventory) {
        let mut total_branches = 0;

        for method_name in inventory.methods_in_class(&self.class_name) {
            let branch_count = inventory.branch_count(&self.class_name, &method_name);
            total_branches += branch_count;

            let qualified = format!("{}.{}", self.class_name, method_name);
            let loaded_name = match self.loaded_name_for(&qualified) {
                Ok(name) => name,
                Err(e) => {
                    warn!("Cannot map {} to the defect table: {}", qualified, e);
                    continue;
                }
            };
            self.equivalent_names.insert(qualified.clone(), loaded_name.clone());

            match self.methods.get_mut(&loaded_name) {
                Some(record) => {
                    if branch_count == 0 {
                        warn!("Branch count is zero for the method: {}", loaded_name);
                    }
                    record.num_branches = branch_count;
                    record.instrumented_name = Some(qualified);
                    record.branch_ids = inventory.branch_ids(&self.class_name, &method_name);
                }
                None => debug!("No defect score for {}", loaded_name),
            }
        }

        self.total_branches = total_branches;
    }

    /// Normalise defect scores into weights and derive the default weight
    pub fn calculate_weights(&mut self) -> DefectResult<()> {
        self.weights_ready = false;
        self.default_weight = 0.0;

        if self.methods.is_empty() {
            return Ok(());
        }

        let score_sum: f64 = self.methods.values().map(|m| m.defect_score).sum();
        if score_sum == 0.0 {
            error!("Defect scores of class {} sum to zero, weights left at zero", self.class_name);
            for record in self.methods.values_mut() {
                record.norm_defect_score = 0.0;
                record.weight = 0.0;
            }
            return Err(DefectError::ZeroScoreSum {
                class_name: self.class_name.clone(),
            });
        }

        let mut norm_sum = 0.0;
        for record in self.methods.values_mut() {
            record.normalize(score_sum);
            norm_sum += record.norm_defect_score;
        }

        self.default_weight = norm_sum / self.methods.len() as f64;
        self.weights_ready = true;
        Ok(())
    }

    // TODO: derive the archive probability from weight and branch count once
    // the archive consumes it; for now it mirrors the raw defect score.
    pub fn calculate_archive_probabilities(&mut self) {
        for record in self.methods.values_mut() {
            record.archive_probability = record.defect_score;
        }
    }

    /// Ratio of zero-front tests to branches across the class. The per-method
    /// quotient is truncated before it is multiplied.
    pub fn calculate_scale_down_factor(&mut self) -> DefectResult<f64> {
        if !self.weights_ready || self.default_weight == 0.0 {
            return Err(DefectError::WeightsNotComputed {
                class_name: self.class_name.clone(),
            });
        }
        if self.total_branches == 0 {
            return Err(DefectError::NoBranchData {
                class_name: self.class_name.clone(),
            });
        }

        let mut tests_in_zero_front: i64 = 0;
        for record in self.methods.values() {
            tests_in_zero_front +=
                ((record.weight / self.default_weight) as i64) * record.num_branches as i64;
        }

        self.scale_down_factor = tests_in_zero_front as f64 / self.total_branches as f64;
        Ok(self.scale_down_factor)
    }

    /// Enrich, then derive weights, archive probabilities and the scale-down factor
    pub fn prepare(&mut self, inventory: &dyn BranchInventory) -> DefectResult<()> {
        self.enrich(inventory);
        self.calculate_weights()?;
        self.calculate_archive_probabilities();

        if self.methods.is_empty() {
            return Ok(());
        }
        match self.calculate_scale_down_factor() {
            Ok(factor) => debug!("Scale-down factor of {} is {}", self.class_name, factor),
            Err(DefectError::NoBranchData { .. }) => {
                debug!("No branches in {}, scale-down factor left at zero", self.class_name)
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn resolve_loaded(&self, name: &str) -> Option<String> {
        let loaded = self.equivalent_names.get(name).cloned().or_else(|| {
            // Method goals spell inner classes with '.', instrumentation with '$'
            self.equivalent_names
                .iter()
                .find(|(instrumented, _)| instrumented.replace('$', ".") == name)
                .map(|(_, loaded)| loaded.clone())
        })?;

        if self.methods.contains_key(&loaded) {
            Some(loaded)
        } else {
            None
        }
    }

    /// Replace the records with a fresh read of the table. Branch data of
    /// methods still present is kept; derived metrics are recomputed if they
    /// had been computed before.
    fn reload(&mut self) -> DefectResult<()> {
        let mut fresh = self.read_defect_table()?;
        for (key, record) in fresh.iter_mut() {
            if let Some(previous) = self.methods.remove(key) {
                record.num_branches = previous.num_branches;
                record.instrumented_name = previous.instrumented_name;
                record.branch_ids = previous.branch_ids;
            }
        }
        self.methods = fresh;
        for key in self.methods.keys() {
            self.equivalent_names.insert(key.clone(), key.clone());
        }

        if self.weights_ready {
            if let Err(e) = self.calculate_weights() {
                warn!("Reloaded defect scores of {} have no weights: {}", self.class_name, e);
                return Ok(());
            }
            self.calculate_archive_probabilities();
            if let Err(e) = self.calculate_scale_down_factor() {
                debug!("Scale-down factor of {} not recomputed: {}", self.class_name, e);
            }
        }
        Ok(())
    }

    /// Find the record for an instrumented `class.method(desc)` name. A miss
    /// reloads the table once and retries; a second miss is final.
    pub fn lookup(&mut self, name: &str) -> DefectResult<&MethodRecord> {
        let key = match self.resolve_loaded(name) {
            Some(key) => key,
            None => {
                debug!("Method {} was not found, reloading the defect score table", name);
                self.reload()?;
                self.resolve_loaded(name).ok_or_else(|| DefectError::MethodNotFound {
                    name: name.to_string(),
                })?
            }
        };

        self.methods.get(&key).ok_or(DefectError::MethodNotFound { name: key })
    }

    /// Whether a method is classified buggy; unknown methods are not
    pub fn is_buggy(&mut self, class_name: &str, method_name: &str) -> bool {
        let name = format!("{}.{}", class_name, method_name);
        match self.lookup(&name) {
            Ok(record) => record.is_buggy(),
            Err(e) => {
                debug!("Treating {} as non-buggy: {}", name, e);
                false
            }
        }
    }

    /// Archive probability of a method; unknown methods get zero
    pub fn archive_probability(&mut self, class_name: &str, method_name: &str) -> f64 {
        let name = format!("{}.{}", class_name, method_name);
        match self.lookup(&name) {
            Ok(record) => record.archive_probability,
            Err(e) => {
                debug!("No archive probability for {}: {}", name, e);
                0.0
            }
        }
    }

    /// Normalised weight of a method; unknown methods get zero
    pub fn weight_of(&mut self, class_name: &str, method_name: &str) -> f64 {
        let name = format!("{}.{}", class_name, method_name);
        self.lookup(&name).map(|record| record.weight).unwrap_or(0.0)
    }

    /// Number of tests the method should hold in the zero front: 1 or 0
    pub fn tests_in_zero_front(&mut self, class_name: &str, method_name: &str) -> usize {
        let default_weight = self.default_weight;
        let scale_down_factor = self.scale_down_factor;
        let name = format!("{}.{}", class_name, method_name);

        match self.lookup(&name) {
            Ok(record) => {
                let ratio = (record.weight / default_weight) as i64;
                let tests = (ratio as f64 / scale_down_factor).ceil() as i64;
                if tests > 0 {
                    1
                } else {
                    0
                }
            }
            Err(e) => {
                debug!("No zero-front test count for {}: {}", name, e);
                0
            }
        }
    }

    pub fn method(&self, loaded_name: &str) -> Option<&MethodRecord> {
        self.methods.get(loaded_name)
    }

    pub fn methods(&self) -> impl Iterator<Item = &MethodRecord> {
        self.methods.values()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn equivalent_name(&self, instrumented: &str) -> Option<&str> {
        self.equivalent_names.get(instrumented).map(String::as_str)
    }

    pub fn default_weight(&self) -> f64 {
        self.default_weight
    }

    pub fn total_branches(&self) -> usize {
        self.total_branches
    }

    pub fn scale_down_factor(&self) -> f64 {
        self.scale_down_factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{BlockId, BranchId, ControlFlowIndex, MethodKey};
    use std::io::{Cursor, Write};

    fn pool_from(rows: &str, class_name: &str) -> MethodPool {
        let mut pool = MethodPool::new(class_name, None, SignatureFormat::Jvm);
        pool.load_from_reader(Cursor::new(rows.to_string())).unwrap();
        pool
    }

    #[test]
    fn test_rows_filtered_by_class_prefix() {
        let pool = pool_from(
            "pkg.A.foo()V,1\npkg.B.bar()V,1\n\npkg.A.baz(I)I,0.25\n",
            "pkg.A",
        );
        assert_eq!(pool.len(), 2);
        assert!(pool.method("pkg.A.foo()V").is_some());
        assert!(pool.method("pkg.B.bar()V").is_none());
    }

    #[test]
    fn test_malformed_rows_are_skipped() {
        let pool = pool_from(
            "pkg.A.ok()V,0.5\npkg.A.noscore()V\npkg.A.nan()V,abc\npkg.A.big()V,1.5\n",
            "pkg.A",
        );
        assert_eq!(pool.len(), 1);
        assert!(pool.method("pkg.A.ok()V").is_some());
    }

    #[test]
    fn test_native_rows_are_normalised() {
        let mut pool = MethodPool::new("pkg.A", None, SignatureFormat::Native);
        pool.load_from_reader(Cursor::new(
            "pkg.A:run(Map<K,V>;String...;)void:,1\npkg.A:broken(,0.5\n".to_string(),
        ))
        .unwrap();
        assert_eq!(pool.len(), 1);
        assert!(pool.method("pkg.A:run(Map;String[];):").is_some());
    }

    #[test]
    fn test_weights_for_two_methods() {
        let mut pool = pool_from("A.m1()V,0.8\nA.m2()V,0.2\n", "A");
        pool.calculate_weights().unwrap();

        assert!((pool.method("A.m1()V").unwrap().norm_defect_score - 0.8).abs() < 1e-12);
        assert!((pool.method("A.m2()V").unwrap().norm_defect_score - 0.2).abs() < 1e-12);
        assert!((pool.default_weight() - 0.5).abs() < 1e-12);
        assert_eq!(pool.method("A.m1()V").unwrap().weight, pool.method("A.m1()V").unwrap().norm_defect_score);
    }

    #[test]
    fn test_normalised_scores_sum_to_one() {
        let mut pool = pool_from("A.a()V,0.3\nA.b()V,1\nA.c()V,0.05\nA.d()V,0\n", "A");
        pool.calculate_weights().unwrap();
        let sum: f64 = pool.methods().map(|m| m.norm_defect_score).sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_sum_is_an_error_not_nan() {
        let mut pool = pool_from("A.a()V,0\nA.b()V,0\n", "A");
        let err = pool.calculate_weights().unwrap_err();
        assert!(matches!(err, DefectError::ZeroScoreSum { .. }));
        for record in pool.methods() {
            assert_eq!(record.weight, 0.0);
        }
        assert_eq!(pool.default_weight(), 0.0);
    }

    #[test]
    fn test_archive_probability_mirrors_defect_score() {
        let mut pool = pool_from("A.a()V,0.4\n", "A");
        pool.calculate_archive_probabilities();
        assert_eq!(pool.archive_probability("A", "a()V"), 0.4);
        assert_eq!(pool.archive_probability("A", "missing()V"), 0.0);
    }

    fn inventory() -> ControlFlowIndex {
        let mut index = ControlFlowIndex::new();
        let m1 = MethodKey::new("A", "m1()V");
        index.add_block(&m1, BlockId(0), Some(BranchId(0)));
        index.add_block(&m1, BlockId(1), Some(BranchId(1)));
        index.add_block(&m1, BlockId(2), Some(BranchId(2)));
        let m2 = MethodKey::new("A", "m2()V");
        index.add_block(&m2, BlockId(0), Some(BranchId(3)));
        index
    }

    #[test]
    fn test_enrich_and_scale_down_factor() {
        let mut pool = pool_from("A.m1()V,0.8\nA.m2()V,0.2\n", "A");
        pool.prepare(&inventory()).unwrap();

        assert_eq!(pool.total_branches(), 4);
        assert_eq!(pool.method("A.m1()V").unwrap().num_branches, 3);
        assert_eq!(pool.method("A.m1()V").unwrap().instrumented_name.as_deref(), Some("A.m1()V"));
        // trunc(0.8 / 0.5) * 3 + trunc(0.2 / 0.5) * 1 = 3 over 4 branches
        assert!((pool.scale_down_factor() - 0.75).abs() < 1e-12);

        assert_eq!(pool.tests_in_zero_front("A", "m1()V"), 1);
        assert_eq!(pool.tests_in_zero_front("A", "m2()V"), 0);
        assert_eq!(pool.tests_in_zero_front("A", "nope()V"), 0);
    }

    #[test]
    fn test_scale_down_requires_weights() {
        let mut pool = pool_from("A.m1()V,0.8\n", "A");
        assert!(matches!(
            pool.calculate_scale_down_factor(),
            Err(DefectError::WeightsNotComputed { .. })
        ));
    }

    #[test]
    fn test_lookup_through_native_equivalence() {
        let mut pool = MethodPool::new("A", None, SignatureFormat::Native);
        pool.load_from_reader(Cursor::new("A:m1()void:,1\nA:m2()void:,0.2\n".to_string()))
            .unwrap();
        pool.enrich(&inventory());

        assert_eq!(pool.equivalent_name("A.m1()V"), Some("A:m1():"));
        assert!(pool.is_buggy("A", "m1()V"));
        assert!(!pool.is_buggy("A", "m2()V"));
    }

    #[test]
    fn test_inner_class_alias() {
        let mut pool = pool_from("A$Inner.go()V,1\n", "A");
        let mut index = ControlFlowIndex::new();
        index.add_block(&MethodKey::new("A$Inner", "go()V"), BlockId(0), None);
        pool.enrich(&index);
        // enrichment only covers the outer class, the reload fills in the identity map
        assert!(pool.is_buggy("A.Inner", "go()V"));
        assert!(pool.is_buggy("A$Inner", "go()V"));
    }

    #[test]
    fn test_lookup_reloads_once_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "A.early()V,0.5").unwrap();
        file.flush().unwrap();

        let mut pool = MethodPool::loaded("A", Some(file.path().to_path_buf()), SignatureFormat::Jvm);
        assert_eq!(pool.len(), 1);

        writeln!(file, "A.late()V,1").unwrap();
        file.flush().unwrap();

        assert_eq!(pool.lookup("A.late()V").unwrap().defect_score, 1.0);
        assert!(matches!(
            pool.lookup("A.never()V"),
            Err(DefectError::MethodNotFound { .. })
        ));
    }

    #[test]
    fn test_reload_replaces_records_and_keeps_branch_data() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "A.m1()V,0.5\nA.m2()V,0.5\nA.gone()V,1\n").unwrap();

        let mut pool = MethodPool::loaded("A", Some(file.path().to_path_buf()), SignatureFormat::Jvm);
        pool.prepare(&inventory()).unwrap();
        assert!(pool.is_buggy("A", "gone()V"));

        std::fs::write(file.path(), "A.m1()V,1\nA.m2()V,0.25\nA.late()V,0.25\n").unwrap();
        assert_eq!(pool.lookup("A.late()V").unwrap().defect_score, 0.25);

        assert_eq!(pool.len(), 3);
        assert!(pool.method("A.gone()V").is_none());
        let m1 = pool.method("A.m1()V").unwrap();
        assert_eq!(m1.defect_score, 1.0);
        assert_eq!(m1.num_branches, 3);
        assert_eq!(m1.branch_ids, vec![BranchId(0), BranchId(1), BranchId(2)]);
        assert_eq!(m1.instrumented_name.as_deref(), Some("A.m1()V"));
        // weights follow the fresh scores: 1 / 1.5
        assert!((m1.weight - 2.0 / 3.0).abs() < 1e-12);
        assert!((pool.default_weight() - 1.0 / 3.0).abs() < 1e-12);
        assert!(pool.is_buggy("A", "m1()V"));
    }

    #[test]
    fn test_missing_table_means_no_defect_data() {
        let mut pool = MethodPool::loaded(
            "A",
            Some(PathBuf::from("/nonexistent/defect-scores.csv")),
            SignatureFormat::Jvm,
        );
        assert!(pool.is_empty());
        assert!(!pool.is_buggy("A", "m1()V"));
        assert_eq!(pool.weight_of("A", "m1()V"), 0.0);
        assert!(pool.calculate_weights().is_ok());
        assert_eq!(pool.default_weight(), 0.0);
    }
}
