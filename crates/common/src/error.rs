use thiserror::Error;

/// Canonical brook error taxonomy used across crates.
///
/// Classification guidance:
/// - [`BrookError::Invalid`]: malformed plans/options and lifecycle misuse discovered
///   before or at graph validation
/// - [`BrookError::TypeError`]: schema mismatch at a graph edge, or expression
///   input/output type mismatch
/// - [`BrookError::NotImplemented`]: syntactically valid request for an input type or
///   shape the engine does not support
/// - [`BrookError::Execution`]: runtime operator/kernel evaluation failures, including
///   errors surfaced by upstream batch sources
/// - [`BrookError::Io`]: raw filesystem/network IO failures from std APIs
#[derive(Debug, Error)]
pub enum BrookError {
    /// Invalid plan topology, options, or lifecycle misuse.
    ///
    /// Examples:
    /// - empty plan, unbound output edge, source declared with inputs
    /// - starting a plan that has already run
    /// - aggregate spec with mismatched targets/names lengths
    #[error("invalid: {0}")]
    Invalid(String),

    /// Schema/type contract violations at graph edges or inside expressions.
    #[error("type error: {0}")]
    TypeError(String),

    /// Valid request for an input type the engine does not implement.
    ///
    /// Examples:
    /// - variance over half-float input
    /// - grouped aggregation with an array-producing kernel
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Runtime execution failures after the plan validated.
    ///
    /// Examples:
    /// - kernel state merge between incompatible kernels
    /// - upstream generator failures observed by a source node
    #[error("execution error: {0}")]
    Execution(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Clone for BrookError {
    fn clone(&self) -> Self {
        match self {
            Self::Invalid(m) => Self::Invalid(m.clone()),
            Self::TypeError(m) => Self::TypeError(m.clone()),
            Self::NotImplemented(m) => Self::NotImplemented(m.clone()),
            Self::Execution(m) => Self::Execution(m.clone()),
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }
}

/// Standard brook result alias.
pub type Result<T> = std::result::Result<T, BrookError>;
