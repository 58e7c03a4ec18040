//! Agent error types

use miette::Diagnostic;
use rudder_kube::{ErrorKind, KubeError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum AgentError {
    #[error(transparent)]
    #[diagnostic(code(rudder::agent::release))]
    Release(#[from] KubeError),

    #[error("Kubernetes API error: {0}")]
    #[diagnostic(code(rudder::agent::api))]
    Api(#[from] kube::Error),

    #[error("Chart repository error: {0}")]
    #[diagnostic(code(rudder::agent::repo))]
    Repo(#[from] rudder_repo::RepoError),

    #[error("ChartRelease {namespace}/{name} has no commit annotation")]
    #[diagnostic(
        code(rudder::agent::missing_commit),
        help("set the rudder.io/commit annotation on the resource")
    )]
    MissingCommit { namespace: String, name: String },

    #[error("Cannot encode {packet_type} payload: {source}")]
    #[diagnostic(code(rudder::agent::encode))]
    Encode {
        packet_type: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid {packet_type} payload: {source}")]
    #[diagnostic(code(rudder::agent::payload))]
    InvalidPayload {
        packet_type: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0} channel closed")]
    #[diagnostic(code(rudder::agent::channel))]
    ChannelClosed(&'static str),

    #[error("Invalid configuration: {0}")]
    #[diagnostic(code(rudder::agent::config))]
    Config(String),
}

impl AgentError {
    /// Release engine classification, when the error came from it
    pub fn release_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Release(e) => Some(e.kind()),
            _ => None,
        }
    }
}
