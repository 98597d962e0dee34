//! Error types for the reconciler

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Reconciler result type
pub type Result<T> = std::result::Result<T, ReconcileError>;

/// Result type for calls against the deployment service
pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// Errors that abort a reconciliation run before any per-target work starts
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// Malformed desired-state input
    #[error("Configuration error: {0}")]
    Config(String),

    /// The stack-set does not exist and no template was given to create it
    #[error("StackSet {0} not found (pass --template to create it)")]
    StackSetNotFound(String),

    /// Deployment service error while observing state
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),
}

impl ReconcileError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// How the operation serializer must react to a service error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Another operation holds the stack-set; wait and retry the same action
    Conflict,
    /// Throttling or network trouble; retry with bounded exponential backoff
    Transient,
    /// Never retried
    Fatal,
}

/// Closed classification of deployment service errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceErrorKind {
    /// An operation is already running against the stack-set
    OperationInProgress,
    /// The stack-set changed since the request was prepared
    StaleRequest,
    /// Request rate exceeded
    Throttled,
    /// Transport failure or client-side timeout
    Network,
    /// Service-side internal failure
    Unavailable,
    /// Template, parameters or request shape rejected
    Validation,
    /// Missing IAM permissions or bad credentials
    PermissionDenied,
    /// Named stack-set does not exist
    StackSetNotFound,
    /// Stack instance does not exist
    InstanceNotFound,
    /// Operation ID unknown to the service
    OperationNotFound,
    /// Stack-set name already taken
    AlreadyExists,
    /// Client-proposed operation ID was already used
    OperationIdInUse,
    /// Account or service quota reached
    LimitExceeded,
    /// Anything the client could not map
    Unknown,
}

impl ServiceErrorKind {
    /// Map an AWS error code onto a kind
    pub fn from_code(code: &str) -> Self {
        match code {
            "OperationInProgressException" | "ConcurrentModificationException" => {
                Self::OperationInProgress
            }
            "StaleRequestException" => Self::StaleRequest,
            "Throttling" | "ThrottlingException" | "RequestLimitExceeded"
            | "TooManyRequestsException" => Self::Throttled,
            "InternalFailure" | "InternalError" | "ServiceUnavailable" | "RequestTimeout" => {
                Self::Unavailable
            }
            "ValidationError" | "InvalidOperationException" | "InvalidParameterValue"
            | "InsufficientCapabilitiesException" => Self::Validation,
            "AccessDenied" | "AccessDeniedException" | "UnauthorizedOperation"
            | "ExpiredToken" | "ExpiredTokenException" | "InvalidClientTokenId" => {
                Self::PermissionDenied
            }
            "StackSetNotFoundException" => Self::StackSetNotFound,
            "StackInstanceNotFoundException" => Self::InstanceNotFound,
            "OperationNotFoundException" => Self::OperationNotFound,
            "NameAlreadyExistsException" | "CreatedButModifiedException" => Self::AlreadyExists,
            "OperationIdAlreadyExistsException" => Self::OperationIdInUse,
            "LimitExceededException" => Self::LimitExceeded,
            _ => Self::Unknown,
        }
    }

    /// Retry classification
    pub fn class(self) -> ErrorClass {
        match self {
            Self::OperationInProgress | Self::StaleRequest => ErrorClass::Conflict,
            Self::Throttled | Self::Network | Self::Unavailable => ErrorClass::Transient,
            Self::Validation
            | Self::PermissionDenied
            | Self::StackSetNotFound
            | Self::InstanceNotFound
            | Self::OperationNotFound
            | Self::AlreadyExists
            | Self::OperationIdInUse
            | Self::LimitExceeded
            | Self::Unknown => ErrorClass::Fatal,
        }
    }
}

impl fmt::Display for ServiceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OperationInProgress => "operation in progress",
            Self::StaleRequest => "stale request",
            Self::Throttled => "throttled",
            Self::Network => "network error",
            Self::Unavailable => "service unavailable",
            Self::Validation => "validation error",
            Self::PermissionDenied => "permission denied",
            Self::StackSetNotFound => "stack-set not found",
            Self::InstanceNotFound => "stack instance not found",
            Self::OperationNotFound => "operation not found",
            Self::AlreadyExists => "already exists",
            Self::OperationIdInUse => "operation ID already used",
            Self::LimitExceeded => "limit exceeded",
            Self::Unknown => "unknown error",
        };
        f.write_str(name)
    }
}

/// Error returned by a [`DeploymentService`](crate::service::DeploymentService) call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ServiceError {
    /// Classified kind
    pub kind: ServiceErrorKind,
    /// Raw service error code, when one was returned
    pub code: Option<String>,
    /// Human-readable message
    pub message: String,
}

impl ServiceError {
    /// Create an error of the given kind
    pub fn new(kind: ServiceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
        }
    }

    /// Create an error from a raw AWS error code
    pub fn from_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        Self {
            kind: ServiceErrorKind::from_code(&code),
            code: Some(code),
            message: message.into(),
        }
    }

    /// Another operation is running against the stack-set
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::OperationInProgress, message)
    }

    /// Create a transport error
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::Network, message)
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::Validation, message)
    }

    /// Retry classification of this error
    pub fn class(&self) -> ErrorClass {
        self.kind.class()
    }

    /// Whether the error means the requested resource is absent
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.kind,
            ServiceErrorKind::StackSetNotFound
                | ServiceErrorKind::InstanceNotFound
                | ServiceErrorKind::OperationNotFound
        )
    }
}
