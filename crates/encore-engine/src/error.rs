/// Errors from the workflow engine gateway.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The request never got a response (connection refused, DNS, ...).
    #[error("engine request failed: {0}")]
    Request(String),

    #[error("engine request timed out")]
    Timeout,

    /// The engine answered with a non-success status.
    #[error("engine rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The engine's response body was not what we expected.
    #[error("unreadable engine response: {0}")]
    Decode(String),

    /// The run is unknown to the engine.
    #[error("unknown run: {0}")]
    UnknownRun(String),
}

/// Errors from the geocoder.
#[derive(Debug, thiserror::Error)]
pub enum GeocodeError {
    /// The place id resolved to nothing.
    #[error("place not found: {0}")]
    NotFound(String),

    #[error("geocoder request failed: {0}")]
    Request(String),

    #[error("geocoder request timed out")]
    Timeout,

    #[error("geocoder rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("unreadable geocoder response: {0}")]
    Decode(String),
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Request(e.to_string())
        }
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for GeocodeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Request(e.to_string())
        }
    }
}
