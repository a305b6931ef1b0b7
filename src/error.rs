//! Error types for MeshQL.
//!
//! All errors are strongly typed using thiserror and grouped by the
//! phase that produced them: resolution errors come from the discovery
//! strategy chain, invocation errors from the operation invocation
//! pipeline. The top-level `MeshError` wraps both so callers can match
//! on specific conditions.

use thiserror::Error;

/// Errors raised while resolving a requested type through the
/// discovery strategy chain.
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// No strategy could produce a required type.
    #[error("No strategy could resolve type {type_name}")]
    Unresolved {
        /// The type that could not be produced.
        type_name: String,
    },

    /// More than one equally-specific candidate matched with no
    /// further tie-break. Never silently guessed.
    #[error("Ambiguous candidates for {type_name}: {}", candidates.join(", "))]
    AmbiguousCandidate {
        /// The type being resolved.
        type_name: String,
        /// The operations (or facts) that tied.
        candidates: Vec<String>,
    },

    /// A type transitively requires itself to resolve.
    #[error("Cycle detected while resolving {type_name}: {}", chain.join(" -> "))]
    Cycle {
        /// The type that re-entered the resolution stack.
        type_name: String,
        /// The resolution stack at the point of re-entry.
        chain: Vec<String>,
    },

    /// A `given {}` clause referenced a parameter with neither a
    /// caller-supplied argument nor a schema-declared constant.
    /// Raised before any remote call is attempted.
    #[error("Parameter '{parameter}' referenced in given clause has no argument and no schema constant")]
    MissingGivenBinding {
        /// The unbound parameter name.
        parameter: String,
    },

    /// A declared type was not present in the active schema
    /// (including inline types layered for the current query).
    #[error("Type {type_name} is not declared in the active schema")]
    UnknownType {
        /// The undeclared type name.
        type_name: String,
    },

    /// A derived-expression operand evaluated to a value the formula
    /// cannot operate on.
    #[error("Cannot evaluate expression for {type_name}: {reason}")]
    ExpressionFailed {
        /// The formula type being evaluated.
        type_name: String,
        /// Why the evaluation failed.
        reason: String,
    },
}

/// Errors raised inside the operation invocation pipeline.
#[derive(Debug, Error)]
pub enum InvocationError {
    /// A remote call failed. Propagates to the immediate caller of the
    /// invocation; sibling branches of a fan-out are unaffected.
    #[error("Invocation of {operation} failed: {message}")]
    Failure {
        /// The qualified operation name.
        operation: String,
        /// Transport-reported failure detail.
        message: String,
    },

    /// A policy rule condition's subject could not be resolved against
    /// the current context.
    #[error("Policy condition not evaluatable: {subject}")]
    PolicyNotEvaluatable {
        /// Description of the unresolvable subject.
        subject: String,
    },

    /// A cache reader observed the writer's terminal failure marker.
    #[error("Cached upstream invocation failed: {message}")]
    UpstreamFailed {
        /// The failure message recorded by the writer.
        message: String,
    },

    /// The backing cache store itself failed.
    #[error("Cache store error: {message}")]
    CacheStore {
        /// Backend-reported detail.
        message: String,
    },

    /// No protocol invoker is registered for the service's transport.
    #[error("No invoker registered for transport '{transport}'")]
    NoInvoker {
        /// The transport identifier declared on the service.
        transport: String,
    },

    /// The query's cancellation signal fired while the invocation was
    /// in flight.
    #[error("Invocation cancelled")]
    Cancelled,
}

/// Serialization failure while caching a single emitted item.
///
/// Never fatal: the failing item degrades to an uncached pass-through
/// and the failure is logged.
#[derive(Debug, Error)]
#[error("Failed to serialize item for cache key {key}: {message}")]
pub struct CacheWriteError {
    /// The cache key being written.
    pub key: String,
    /// The serializer's message.
    pub message: String,
}

/// Top-level error type for MeshQL.
#[derive(Debug, Error)]
pub enum MeshError {
    /// A discovery-chain failure.
    #[error("Resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    /// An invocation-pipeline failure.
    #[error("Invocation error: {0}")]
    Invocation(#[from] InvocationError),

    /// An unexpected internal condition.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the condition.
        message: String,
    },
}

impl MeshError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a resolution error.
    #[must_use]
    pub const fn is_resolution(&self) -> bool {
        matches!(self, Self::Resolution(_))
    }

    /// Returns true if this is an invocation error.
    #[must_use]
    pub const fn is_invocation(&self) -> bool {
        matches!(self, Self::Invocation(_))
    }

    /// Returns true if this error aborts a single-result query.
    ///
    /// Everything fatal to a required resolution is included here;
    /// gather-many resolutions instead omit the affected item.
    #[must_use]
    pub const fn is_fatal_for_single(&self) -> bool {
        match self {
            Self::Resolution(_) | Self::Internal { .. } => true,
            Self::Invocation(e) => !matches!(e, InvocationError::Cancelled),
        }
    }
}

/// Result type alias for MeshQL operations.
pub type MeshResult<T> = Result<T, MeshError>;
