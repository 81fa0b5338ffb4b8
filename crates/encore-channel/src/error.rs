/// Errors raised by a [`Channel`](crate::Channel) implementation.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The presence backend could not be reached or rejected a command.
    #[error("presence backend error: {0}")]
    Backend(String),

    /// A fan-out event could not be encoded or decoded.
    #[error("fan-out serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for ChannelError {
    fn from(e: redis::RedisError) -> Self {
        Self::Backend(e.to_string())
    }
}
