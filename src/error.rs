use thiserror::Error;

use crate::{TransportError, ValueError};

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("[{0}] is not subscribed yet")]
    NotSubscribed(String),
    #[error("[{0}] was stopped and cannot be reused")]
    Stopped(String),
    #[error("[{0}] is already subscribed, restoring is only possible on a fresh device")]
    AlreadySubscribed(String),
    #[error("Unknown node [{0}]")]
    UnknownNode(String),
    #[error("Unknown property [{0}]")]
    UnknownProperty(String),
    #[error("The attributes of [{0}] are incomplete, no channel available")]
    ChannelNotReady(String),
    #[error("[{0}] is not settable")]
    NotSettable(String),
    #[error("Invalid command for [{topic}]: {source}")]
    InvalidValue {
        topic: String,
        #[source]
        source: ValueError,
    },
}
