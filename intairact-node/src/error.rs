use std::io;
use std::net::SocketAddr;

use intairact_core::{ActionError, MappingError, RouteError, StatusCode};

use crate::transport::TransportError;

/// Engine-level error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The transport could not be bound; the engine stays stopped.
    #[error("cannot start on {addr}: {source}")]
    Startup {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The peer answered with a non-2xx status.
    #[error("peer answered {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    Action(ActionError),
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error("http client: {0}")]
    Client(String),
}

impl From<ActionError> for Error {
    fn from(e: ActionError) -> Self {
        match e {
            ActionError::Status { status, body } => Error::Status { status, body },
            other => Error::Action(other),
        }
    }
}
