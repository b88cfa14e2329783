//! Error types for the addon-manager operator

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Workflow template could not be parsed
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Operator misconfiguration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Addon spec failed validation
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Lifecycle workflow could not be built, submitted, or cleaned up
    #[error("Workflow error: {0}")]
    WorkflowError(String),

    /// One or more workload kinds could not be observed
    #[error("Observation error: {0}")]
    ObservationError(String),

    /// Install did not complete within the configured TTL
    #[error("TTL expired: {0}")]
    TtlExpired(String),

    /// A secret named in the addon spec does not exist
    #[error("Missing secret: {0}")]
    MissingSecret(String),

    /// Processing panicked; recovered at the top of the reconcile
    #[error("Reconcile panicked: {0}")]
    Panicked(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether the dispatch layer should retry with backoff.
    ///
    /// A recovered panic is not retried: the next watch event (or a
    /// steady-state requeue) picks the addon up again.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, Error::Panicked(_))
    }

    /// Short category used as a metrics label
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::SerializationError(_) | Error::YamlError(_) => "serialization",
            Error::ConfigError(_) => "config",
            Error::ValidationError(_) => "validation",
            Error::WorkflowError(_) => "workflow",
            Error::ObservationError(_) => "observation",
            Error::TtlExpired(_) => "ttl",
            Error::MissingSecret(_) => "secret",
            Error::Panicked(_) => "panic",
        }
    }
}
