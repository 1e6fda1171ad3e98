//! Defect weight model
//!
//! Turns an external per-method defect prediction table into the signals the
//! goal manager consumes: a binary buggy/non-buggy classification, normalised
//! weights and archive probabilities.
//!
//! # Architecture
//!
//! - `signature`: conversion between the JVM and native method notations
//! - `MethodRecord`: per-method scores, enriched with branch data
//! - `MethodPool`: the records of one class under test, with lookup-by-alias
//!   and a single reload-and-retry on misses
//! - `MethodRegistry`: owns one pool per class and resolves inner classes to
//!   their registered outer class
//!
//! The defect table is a comma separated file of `method,score` rows.

use std::io;

pub mod method;
pub mod pool;
pub mod registry;
pub mod signature;

pub use method::MethodRecord;
pub use pool::MethodPool;
pub use registry::{resolve_owner, MethodRegistry};
pub use signature::{jvm_to_native, normalize_native, SignatureError, SignatureResult};

/// Type alias for defect model results
pub type DefectResult<T> = Result<T, DefectError>;

/// Error types for the defect weight model
#[derive(Debug, thiserror::Error)]
pub enum DefectError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed defect table row {line}: {reason}")]
    MalformedRow { line: usize, reason: String },

    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error("Method does not exist in the method pool: {name}")]
    MethodNotFound { name: String },

    #[error("Defect scores of class {class_name} sum to zero")]
    ZeroScoreSum { class_name: String },

    #[error("No branch data for class {class_name}")]
    NoBranchData { class_name: String },

    #[error("Weights of class {class_name} have not been computed")]
    WeightsNotComputed { class_name: String },
}
