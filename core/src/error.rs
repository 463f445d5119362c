//! Structured error types for Turnix
//!
//! Every error that can cross the RPC boundary maps to a stable wire code
//! via [`TurnixError::wire_code`]; transient failures advertise themselves
//! through [`TurnixError::retryable`].

use thiserror::Error;

/// Primary error type for Turnix operations
#[derive(Error, Debug)]
pub enum TurnixError {
    // =========================================================================
    // RPC / transport errors
    // =========================================================================
    /// Incoming frame exceeded the configured size cap
    #[error("frame too large: {size} bytes (cap {cap})")]
    FrameTooLarge { size: usize, cap: usize },

    /// No capability registered under the requested name
    #[error("capability not found: {capability}")]
    CapabilityNotFound { capability: String },

    /// Capability exists but does not implement the requested method
    #[error("capability '{capability}' does not support {op}")]
    CapabilityUnsupported { capability: String, op: &'static str },

    /// Object route did not resolve
    #[error("object not found: {object}")]
    ObjectNotFound { object: String },

    /// Unknown operation on a known route
    #[error("unknown op: {op}")]
    UnknownOp { op: String },

    /// Malformed request frame or arguments
    #[error("bad request: {message}")]
    BadRequest { message: String },

    /// Handler exceeded its budget
    #[error("operation timed out after {budget_ms}ms")]
    Timeout { budget_ms: u64 },

    /// Downstream service is not available right now
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String },

    // =========================================================================
    // Permission errors
    // =========================================================================
    /// Principal lacks (or exceeded) a grant for a capability family
    #[error("permission denied for '{family}': {detail}")]
    PermissionDenied { family: String, detail: String },

    // =========================================================================
    // Pack / resolution errors
    // =========================================================================
    /// No pack matched a selector
    #[error("no pack matched selector: {selector}")]
    PackNotFound { selector: String },

    /// Selector without an author matched packs from several authors
    #[error("ambiguous selector '{selector}': authors {authors:?}")]
    AmbiguousSelector { selector: String, authors: Vec<String> },

    /// Dependency closure revisited a pack on the traversal stack
    #[error("detected pack dependency cycle: {chain}")]
    DependencyCycle { chain: String },

    /// Two descriptors share the full identity tuple within one layer
    #[error("duplicate pack descriptor: {identity}")]
    DuplicateDescriptor { identity: String },

    /// Manifest failed to parse or normalize
    #[error("invalid manifest at {path}: {message}")]
    InvalidManifest { path: String, message: String },

    /// PackRefString failed to parse
    #[error("invalid pack selector '{selector}': {message}")]
    InvalidSelector { selector: String, message: String },

    // =========================================================================
    // Semver errors
    // =========================================================================
    /// Version string failed to parse
    #[error("invalid semantic version '{raw}': {message}")]
    InvalidVersion { raw: String, message: String },

    /// Requirement string failed to parse
    #[error("invalid version requirement '{raw}': {message}")]
    InvalidRange { raw: String, message: String },

    // =========================================================================
    // Memory errors
    // =========================================================================
    /// Write attempted on a read-only layer
    #[error("layer '{layer}' is read-only")]
    LayerReadOnly { layer: String },

    /// Key namespace referenced a layer that is not in the stack
    #[error("no layer named '{layer}'")]
    LayerNotFound { layer: String },

    /// No writable layer available for an unprefixed key
    #[error("no writable layer found")]
    NoWritableLayer,

    /// Commit protocol called on a malformed stack
    #[error("commit expects the transactional layer at index 0")]
    MalformedStack,

    /// Memory commit failed; the run was rolled back
    #[error("memory commit failed: {message}")]
    CommitFailed { message: String },

    // =========================================================================
    // Session / AppInstance errors
    // =========================================================================
    /// The main session cannot be destroyed directly
    #[error("cannot destroy main session '{session_id}'")]
    MainSessionProtected { session_id: String },

    /// A second main session was requested
    #[error("app instance '{app_instance_id}' already has main session '{session_id}'")]
    MainSessionExists {
        app_instance_id: String,
        session_id: String,
    },

    /// Session lookup failed
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    // =========================================================================
    // Pipeline / engine stream errors
    // =========================================================================
    /// The engine stream broke mid-run
    #[error("engine stream error: {message}")]
    EngineStream { message: String },

    /// A stage handler failed the run
    #[error("handler error at {stage}: {message}")]
    StageHandler { stage: String, message: String },

    // =========================================================================
    // Fatal / invariant errors
    // =========================================================================
    /// A state the engine promises can never happen, happened
    #[error("invariant violation: {message}")]
    InvariantViolation { message: String },

    /// Startup precondition failed; the process refuses to run
    #[error("fatal: {message}")]
    Fatal { message: String },

    // =========================================================================
    // External error wrappers
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TurnixError {
    /// Stable code string surfaced on the wire as `error.payload.code`.
    pub fn wire_code(&self) -> &'static str {
        match self {
            TurnixError::FrameTooLarge { .. } => "FRAME_TOO_LARGE",
            TurnixError::CapabilityNotFound { .. } => "CAPABILITY_NOT_FOUND",
            TurnixError::CapabilityUnsupported { .. } => "UNKNOWN_OP",
            TurnixError::ObjectNotFound { .. } => "OBJECT_NOT_FOUND",
            TurnixError::UnknownOp { .. } => "UNKNOWN_OP",
            TurnixError::BadRequest { .. } => "BAD_REQUEST",
            TurnixError::Timeout { .. } => "TIMEOUT",
            TurnixError::ServiceUnavailable { .. } => "SERVICE_UNAVAILABLE",
            TurnixError::PermissionDenied { .. } => "PERMISSION_DENIED",
            TurnixError::PackNotFound { .. } => "PACK_NOT_FOUND",
            TurnixError::AmbiguousSelector { .. } => "AMBIGUOUS_SELECTOR",
            TurnixError::DependencyCycle { .. } => "DEPENDENCY_CYCLE",
            TurnixError::DuplicateDescriptor { .. } => "DUPLICATE_DESCRIPTOR",
            TurnixError::InvalidManifest { .. } => "INVALID_MANIFEST",
            TurnixError::InvalidSelector { .. } => "BAD_REQUEST",
            TurnixError::InvalidVersion { .. } => "BAD_REQUEST",
            TurnixError::InvalidRange { .. } => "BAD_REQUEST",
            TurnixError::LayerReadOnly { .. }
            | TurnixError::LayerNotFound { .. }
            | TurnixError::NoWritableLayer
            | TurnixError::MalformedStack => "OBJECT_ERROR",
            TurnixError::CommitFailed { .. } => "OBJECT_ERROR",
            TurnixError::MainSessionProtected { .. } => "BAD_REQUEST",
            TurnixError::MainSessionExists { .. } => "BAD_REQUEST",
            TurnixError::SessionNotFound { .. } => "OBJECT_NOT_FOUND",
            TurnixError::EngineStream { .. } => "SERVICE_UNAVAILABLE",
            TurnixError::StageHandler { .. } => "OBJECT_CALL_FAIL_STAGE",
            TurnixError::InvariantViolation { .. } => "UNKNOWN_ERROR",
            TurnixError::Fatal { .. } => "UNKNOWN_ERROR",
            TurnixError::Io(_) => "UNKNOWN_ERROR",
            TurnixError::Json(_) => "BAD_REQUEST",
        }
    }

    /// Whether a client may retry the operation as-is.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            TurnixError::Timeout { .. }
                | TurnixError::ServiceUnavailable { .. }
                | TurnixError::EngineStream { .. }
        )
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        TurnixError::InvariantViolation {
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        TurnixError::BadRequest {
            message: message.into(),
        }
    }
}

/// Convenience result alias used throughout the engine
pub type Result<T> = std::result::Result<T, TurnixError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_are_stable() {
        let err = TurnixError::PermissionDenied {
            family: "chat".into(),
            detail: "missing grant".into(),
        };
        assert_eq!(err.wire_code(), "PERMISSION_DENIED");
        assert!(!err.retryable());

        let err = TurnixError::Timeout { budget_ms: 100 };
        assert_eq!(err.wire_code(), "TIMEOUT");
        assert!(err.retryable());

        let err = TurnixError::FrameTooLarge {
            size: 2_000_000,
            cap: 1_000_000,
        };
        assert_eq!(err.wire_code(), "FRAME_TOO_LARGE");
    }
}
