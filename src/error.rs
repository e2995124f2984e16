//! Error types for shoal

use std::collections::HashMap;

/// Result type alias for shoal operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for shoal
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
    /// Compare-and-swap conflict on a metadata write
    #[error("Metadata conflict: concurrent modification detected")]
    CasMismatch,
    /// A stored collection was written by a newer implementation
    #[error("Version too low: stored implVersion {stored} > runtime version {runtime}")]
    VersionTooLow { stored: String, runtime: String },
    /// Index type tag has no registered implementation
    #[error("Unknown index type: {0}")]
    UnknownIndexType(String),
    /// Index definition not found
    #[error("Index not found: {0}")]
    IndexNotFound(String),
    /// Planner error
    #[error("Planner error: {0}")]
    Planner(String),
    /// Feed error
    #[error("Feed error: {0}")]
    Feed(String),
    /// The partition identity changed out from under a consistency wait
    #[error("Partition rolled over: partition {partition}, expected uuid {expected}, current uuid {current}")]
    PartitionRolledOver {
        partition: String,
        expected: String,
        current: String,
    },
    /// Upstream asked for a rollback; pending waiters drain with this error
    #[error("Partition rollback: partition {partition}, rollback seq {rollback_seq}")]
    Rollback { partition: String, rollback_seq: u64 },
    /// Unsupported consistency level
    #[error("Unsupported consistency level: {0}")]
    UnsupportedConsistencyLevel(String),
    /// A consistency wait ended before the requested seq was reached
    #[error("Consistency wait {status}: startEndSeqs: {start_end_seqs:?}")]
    ConsistencyWait {
        /// Short status reason, like "timeout" or "cancelled"
        status: String,
        /// Keyed by partition, value is the (start, end) seq pair observed
        start_end_seqs: HashMap<String, (u64, u64)>,
    },
    /// Alias resolution visited too many targets, likely a cycle
    #[error("Alias cycle or too wide: alias {alias}, visited {visited} targets")]
    AliasCycleOrTooWide { alias: String, visited: usize },
    /// Alias target UUID did not match the live definition
    #[error("Alias target mismatch: target {target}, expected uuid {expected}, found {found}")]
    AliasTargetMismatch {
        target: String,
        expected: String,
        found: String,
    },
    /// Alias target type cannot be queried
    #[error("Unsupported alias target type: {target_type}, target {target}")]
    UnsupportedAliasTarget { target: String, target_type: String },
    /// Query error
    #[error("Query error: {0}")]
    Query(String),
    /// Remote partition call failed
    #[error("Remote error: {0}")]
    Remote(String),
    /// Rebalance error
    #[error("Rebalance error: {0}")]
    Rebalance(String),
    /// Operation was cancelled or timed out
    #[error("Operation cancelled")]
    Cancelled,
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Remote(e.to_string())
    }
}

impl Error {
    /// True when the error is a lost CAS race, which callers treat as a
    /// benign no-op rather than a failure.
    pub fn is_cas_mismatch(&self) -> bool {
        matches!(self, Error::CasMismatch)
    }
}
