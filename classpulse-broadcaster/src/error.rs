use thiserror::Error;

#[derive(Error, Debug)]
pub enum BroadcasterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Socket path error: {0}")]
    SocketPath(String),

    #[error("Relay error: {0}")]
    Relay(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Subscriber {0} is closed")]
    SubscriberClosed(uuid::Uuid),

    #[error("Server not started")]
    NotStarted,

    #[error("Server already running")]
    AlreadyRunning,
}

pub type Result<T> = std::result::Result<T, BroadcasterError>;
