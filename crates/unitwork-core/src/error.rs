//! Error types for unit-of-work operations.

use crate::backend::OperationKind;
use crate::entity::LifecycleState;
use crate::value::{PrimaryKey, Value};
use std::fmt;

/// The primary error type for all unitwork operations.
#[derive(Debug)]
pub enum Error {
    /// Two distinct instances claim the same identity.
    ConflictingIdentity(IdentityConflict),
    /// A foreign key target has no resolvable identity.
    UnresolvableDependency(DependencyError),
    /// A backend insert/update/delete failed during commit.
    BackendOperation(BackendOperationError),
    /// The requested lifecycle transition is not allowed.
    InvalidStateTransition(StateTransitionError),
    /// Mapping metadata is invalid or missing.
    Metadata(MetadataError),
    /// The row was changed by someone else since it was read.
    OptimisticLock(OptimisticLockError),
    /// A previous commit failed; the session must be cleared or discarded.
    SessionFailed,
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug, Clone)]
pub struct IdentityConflict {
    pub entity_type: String,
    pub identity: PrimaryKey,
}

/// Why a foreign key could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyFailure {
    /// Target has no identity and is not scheduled for insertion.
    TargetNotScheduled,
    /// Required (non-nullable) foreign key is null.
    RequiredNull,
    /// Target is scheduled for removal while the referrer survives.
    TargetRemoved,
}

impl DependencyFailure {
    const fn describe(self) -> &'static str {
        match self {
            DependencyFailure::TargetNotScheduled => {
                "target has no identity and is not scheduled for insert"
            }
            DependencyFailure::RequiredNull => "required foreign key is null",
            DependencyFailure::TargetRemoved => "target is scheduled for removal",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DependencyError {
    pub entity_type: String,
    pub identity: Option<PrimaryKey>,
    pub field: String,
    pub target_type: String,
    pub reason: DependencyFailure,
}

#[derive(Debug)]
pub struct BackendOperationError {
    pub operation: OperationKind,
    pub entity_type: String,
    pub identity: Option<PrimaryKey>,
    pub source: Box<Error>,
}

#[derive(Debug, Clone)]
pub struct StateTransitionError {
    pub entity_type: String,
    pub state: LifecycleState,
    pub action: &'static str,
}

#[derive(Debug, Clone)]
pub struct MetadataError {
    pub entity_type: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct OptimisticLockError {
    pub entity_type: String,
    pub identity: PrimaryKey,
    pub expected: Value,
    pub actual: Value,
}

/// Result alias used throughout unitwork.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a metadata error.
    pub fn metadata(entity_type: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Metadata(MetadataError {
            entity_type: entity_type.into(),
            message: message.into(),
        })
    }

    /// Create an invalid-state-transition error.
    pub fn invalid_transition(
        entity_type: impl Into<String>,
        state: LifecycleState,
        action: &'static str,
    ) -> Self {
        Error::InvalidStateTransition(StateTransitionError {
            entity_type: entity_type.into(),
            state,
            action,
        })
    }

    /// Whether the session that produced this error can keep being used.
    ///
    /// Only invalid state transitions are caller mistakes the session survives;
    /// everything else that comes out of a commit poisons it.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::InvalidStateTransition(_))
    }

    /// The backend error wrapped by a `BackendOperation` failure, if any.
    pub fn backend_cause(&self) -> Option<&Error> {
        match self {
            Error::BackendOperation(e) => Some(&e.source),
            _ => None,
        }
    }
}

fn fmt_identity(identity: Option<&PrimaryKey>) -> String {
    identity.map_or_else(|| "<unassigned>".to_string(), ToString::to_string)
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ConflictingIdentity(e) => write!(
                f,
                "Conflicting identity: another {} instance is already registered with identity {}",
                e.entity_type, e.identity
            ),
            Error::UnresolvableDependency(e) => write!(
                f,
                "Unresolvable dependency: {}[{}].{} -> {}: {}",
                e.entity_type,
                fmt_identity(e.identity.as_ref()),
                e.field,
                e.target_type,
                e.reason.describe()
            ),
            Error::BackendOperation(e) => write!(
                f,
                "Backend {} failed for {}[{}]: {}",
                e.operation,
                e.entity_type,
                fmt_identity(e.identity.as_ref()),
                e.source
            ),
            Error::InvalidStateTransition(e) => write!(
                f,
                "Cannot {} a {} entity in state {:?}",
                e.action, e.entity_type, e.state
            ),
            Error::Metadata(e) => write!(f, "Metadata error for {}: {}", e.entity_type, e.message),
            Error::OptimisticLock(e) => write!(
                f,
                "Optimistic lock failed for {}[{}]: expected version {}, found {}",
                e.entity_type, e.identity, e.expected, e.actual
            ),
            Error::SessionFailed => write!(
                f,
                "Session is in a failed state after an aborted commit; clear or discard it"
            ),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::BackendOperation(e) => Some(e.source.as_ref()),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serde(e.to_string())
    }
}
