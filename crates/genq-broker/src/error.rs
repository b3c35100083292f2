use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("Connection attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("Not connected to broker")]
    NotConnected,

    #[error("Broker client has been shut down")]
    Shutdown,

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Unknown exchange: {0}")]
    UnknownExchange(String),

    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    #[error("Publish was not confirmed by the broker")]
    NotConfirmed,

    #[error("Message error: {0}")]
    Message(#[from] genq_core::TaskError),

    #[error("Gave up reconnecting after {0} attempts")]
    ReconnectExhausted(u32),
}

pub type Result<T> = std::result::Result<T, BrokerError>;
