//! Error types for the provider.
//!
//! Errors are categorized by the step that failed (configuration, marshaling,
//! or one of the Kubernetes REST verbs) and surface verbatim as diagnostics.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while serving provider operations.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The requested object was not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// A validation error occurred.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The requested resource or data source type is unknown.
    #[error("Unknown resource type: {0}")]
    UnknownResource(String),

    /// The provider is offline and the operation needs the cluster.
    #[error("Provider is offline: {0}")]
    Offline(String),

    /// A model could not be encoded as JSON or YAML.
    #[error("Unable to marshal {target}: {message}")]
    Marshal {
        /// The object being encoded.
        target: String,
        /// What went wrong.
        message: String,
    },

    /// A server response could not be decoded into the model.
    #[error("Unable to unmarshal {target}: {message}")]
    Unmarshal {
        /// The object being decoded.
        target: String,
        /// What went wrong.
        message: String,
    },

    /// A GET request failed.
    #[error("Unable to GET {target}: {source}")]
    Get {
        /// The object that was requested.
        target: String,
        /// The underlying client error.
        #[source]
        source: kube::Error,
    },

    /// A server-side apply PATCH request failed.
    #[error("Unable to PATCH {target}: {source}")]
    Patch {
        /// The object that was applied.
        target: String,
        /// The underlying client error.
        #[source]
        source: kube::Error,
    },

    /// A DELETE request failed.
    #[error("Unable to DELETE {target}: {source}")]
    Delete {
        /// The object that was deleted.
        target: String,
        /// The underlying client error.
        #[source]
        source: kube::Error,
    },

    /// The object was still present when the delete wait timed out.
    #[error("Timed out after {timeout:?} waiting for {target} to be deleted")]
    WaitTimeoutExceeded {
        /// The object being waited on.
        target: String,
        /// The configured timeout.
        timeout: Duration,
    },

    /// A JSON serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A YAML serialization/deserialization error occurred.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A gRPC transport error occurred.
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// Operation not implemented.
    #[error("Unimplemented: {0}")]
    Unimplemented(String),

    /// Invalid request from client.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ProviderError {
    /// Whether this error means the object does not exist on the server.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Get { source, .. } | Self::Delete { source, .. } => {
                crate::client::is_not_found(source)
            },
            _ => false,
        }
    }
}

/// Map a Kubernetes API status code onto the closest gRPC status.
fn api_status(code: u16, message: String) -> tonic::Status {
    match code {
        400 | 422 => tonic::Status::invalid_argument(message),
        401 => tonic::Status::unauthenticated(message),
        403 => tonic::Status::permission_denied(message),
        404 => tonic::Status::not_found(message),
        409 => tonic::Status::aborted(message),
        429 => tonic::Status::resource_exhausted(message),
        500..=599 => tonic::Status::unavailable(message),
        _ => tonic::Status::unknown(message),
    }
}

fn kube_status(source: &kube::Error, message: String) -> tonic::Status {
    match source {
        kube::Error::Api(response) => api_status(response.code, message),
        _ => tonic::Status::unavailable(message),
    }
}

impl From<ProviderError> for tonic::Status {
    fn from(err: ProviderError) -> Self {
        let message = err.to_string();
        match err {
            ProviderError::NotFound(_) => tonic::Status::not_found(message),
            ProviderError::Validation(_) => tonic::Status::invalid_argument(message),
            ProviderError::Configuration(_) => tonic::Status::failed_precondition(message),
            ProviderError::UnknownResource(_) => tonic::Status::not_found(message),
            ProviderError::Offline(_) => tonic::Status::failed_precondition(message),
            ProviderError::Marshal { .. } | ProviderError::Unmarshal { .. } => {
                tonic::Status::invalid_argument(message)
            },
            ProviderError::Get { source, .. }
            | ProviderError::Patch { source, .. }
            | ProviderError::Delete { source, .. } => kube_status(&source, message),
            ProviderError::WaitTimeoutExceeded { .. } => {
                tonic::Status::deadline_exceeded(message)
            },
            ProviderError::Serialization(_) | ProviderError::Yaml(_) => {
                tonic::Status::invalid_argument(message)
            },
            ProviderError::Io(_) => tonic::Status::internal(message),
            ProviderError::Transport(_) => tonic::Status::unavailable(message),
            ProviderError::Unimplemented(_) => tonic::Status::unimplemented(message),
            ProviderError::InvalidRequest(_) => tonic::Status::invalid_argument(message),
        }
    }
}
