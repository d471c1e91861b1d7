//! Error taxonomy shared by the store, the managers and the API
//! handlers.

use thiserror::Error;

/// Resource kinds that can be reported missing. Each maps to the ECS
/// exception name the API surfaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    Cluster,
    Service,
    Task,
    TaskDefinition,
    TaskSet,
    ContainerInstance,
}

impl ResourceKind {
    pub fn not_found_exception(&self) -> &'static str {
        match self {
            ResourceKind::Cluster => "ClusterNotFoundException",
            ResourceKind::Service => "ServiceNotFoundException",
            ResourceKind::Task => "InvalidParameterException",
            ResourceKind::TaskDefinition => "ClientException",
            ResourceKind::TaskSet => "TaskSetNotFoundException",
            ResourceKind::ContainerInstance => "InvalidParameterException",
        }
    }
}

#[derive(Error, Debug)]
pub enum EcsError {
    /// Malformed input, wrong enum values, unknown family: the caller's
    /// fault
    #[error("{0}")]
    Validation(String),

    #[error("{kind:?} not found: {name}")]
    NotFound { kind: ResourceKind, name: String },

    /// Optimistic-update version mismatch or concurrent create of the
    /// same identity
    #[error("conflict: {0}")]
    Conflict(String),

    /// Kubernetes API error that is neither not-found nor conflict
    #[error("dependency failure: {0}")]
    DependencyFailure(String),

    /// Network or timeout failure eligible for internal retry
    #[error("transient: {0}")]
    Transient(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Invariant violation, logged with context
    #[error("internal: {0}")]
    Internal(String),
}

impl EcsError {
    pub fn not_found(kind: ResourceKind, name: impl Into<String>) -> Self {
        EcsError::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// ECS exception kind for the wire shape
    /// `{"__type":"<Kind>Exception","message":"..."}`.
    pub fn exception_kind(&self) -> &'static str {
        match self {
            EcsError::Validation(_) => "InvalidParameterException",
            EcsError::NotFound { kind, .. } => kind.not_found_exception(),
            EcsError::Conflict(_) => "UpdateInProgressException",
            EcsError::DependencyFailure(_) => "ServerException",
            EcsError::Transient(_) => "ServerException",
            EcsError::Unsupported(_) => "UnsupportedFeatureException",
            EcsError::Internal(_) => "ServerException",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, EcsError::Transient(_))
    }
}

/// Classify a Kubernetes client error per the propagation policy:
/// connection-level problems are transient, everything that is not
/// not-found/conflict is a dependency failure.
impl From<kube::Error> for EcsError {
    fn from(e: kube::Error) -> Self {
        match &e {
            kube::Error::Api(ae) if ae.code == 404 => EcsError::NotFound {
                kind: ResourceKind::Task,
                name: ae.message.clone(),
            },
            kube::Error::Api(ae) if ae.code == 409 => EcsError::Conflict(ae.message.clone()),
            kube::Error::HyperError(_) | kube::Error::Service(_) => {
                EcsError::Transient(e.to_string())
            }
            _ => EcsError::DependencyFailure(e.to_string()),
        }
    }
}

impl From<anyhow::Error> for EcsError {
    fn from(e: anyhow::Error) -> Self {
        EcsError::Internal(format!("{:#}", e))
    }
}

pub type Result<T, E = EcsError> = std::result::Result<T, E>;
