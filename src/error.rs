use thiserror::Error;

use crate::transport::ResponseCode;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to create producer: {0}")]
    CreateProducer(String),

    #[error("Failed to create consumer: {0}")]
    CreateConsumer(String),

    #[error("Routing key missing for message")]
    RoutingKeyMissing,

    #[error("No route to any partition for key '{key}'")]
    NoRoute { key: String },

    #[error("Not connected to stream '{stream}'")]
    NotConnected { stream: String },

    #[error("Handle is already closed")]
    AlreadyClosed,

    #[error("Broker responded with {code:?}")]
    Broker { code: ResponseCode },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Invalid message format: {message}")]
    InvalidMessage { message: String },

    #[error("Timeout error: {message}")]
    Timeout { message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
