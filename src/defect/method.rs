use serde::{Deserialize, Serialize};

use crate::cfg::BranchId;

/// Defect prediction data for one method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodRecord {
    /// Identifier as loaded from the defect table (after normalisation)
    pub name: String,
    /// Raw defect score in `[0, 1]`
    pub defect_score: f64,
    /// Branch instructions in the method, set during enrichment
    pub num_branches: usize,
    /// `defect_score` divided by the class total
    pub norm_defect_score: f64,
    pub weight: f64,
    /// Currently equal to `defect_score`
    pub archive_probability: f64,
    /// JVM-notation name the instrumentation uses for this method
    pub instrumented_name: Option<String>,
    pub branch_ids: Vec<BranchId>,
}

impl MethodRecord {
    pub fn new(name: &str, defect_score: f64) -> Self {
        MethodRecord {
            name: name.to_string(),
            defect_score,
            num_branches: 0,
            norm_defect_score: 0.0,
            weight: 0.0,
            archive_probability: 0.0,
            instrumented_name: None,
            branch_ids: Vec::new(),
        }
    }

    /// Binary classification: only a score of exactly 1 is buggy
    pub fn is_buggy(&self) -> bool {
        self.defect_score == 1.0
    }

    pub(crate) fn normalize(&mut self, score_sum: f64) {
        self.norm_defect_score = self.defect_score / score_sum;
        self.weight = self.norm_defect_score;
    }
}
