use thiserror::Error;

/// Canonical MSQ error taxonomy used across crates.
///
/// Classification guidance:
/// - [`MsqError::StructuralInconsistency`]: a plan that references stages, mailboxes or
///   sender/receiver pairs that do not exist (planner/assignment defect)
/// - [`MsqError::UnsupportedTraversal`]: generic visitation reached a node that only the
///   matched exchange handling may expand
/// - [`MsqError::Planning`]: a dispatchable plan cannot be produced from the given inputs
/// - [`MsqError::InvalidConfig`]: config/environment/input-file contract violations
/// - [`MsqError::Io`]: raw filesystem IO failures from std APIs
///
/// None of these are transient; callers should not retry.
#[derive(Debug, Error)]
pub enum MsqError {
    /// A referenced stage, mailbox entry or sender/receiver pairing is absent.
    ///
    /// Examples:
    /// - mailbox-receive naming a sender stage that is not in the plan
    /// - producer worker without endpoints for one of its receiver stages
    /// - unary operator without an input
    #[error("structural inconsistency: {0}")]
    StructuralInconsistency(String),

    /// A lone exchange node was reached outside the send/receive handling.
    #[error("unsupported traversal: {0}")]
    UnsupportedTraversal(String),

    /// Stage fragmentation or worker assignment failures.
    ///
    /// Examples:
    /// - unknown table in cluster routing
    /// - no servers available for an intermediate stage
    #[error("planning error: {0}")]
    Planning(String),

    /// Invalid or inconsistent configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Standard MSQ result alias.
pub type Result<T> = std::result::Result<T, MsqError>;
