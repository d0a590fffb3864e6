use thiserror::Error;

/// Result type for HEOS operations
pub type Result<T> = std::result::Result<T, HeosError>;

/// Errors that can occur when interacting with HEOS players
#[derive(Error, Debug)]
pub enum HeosError {
    /// I/O error on the control socket or discovery socket
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Malformed XML document
    #[error("XML error: {0}")]
    Xml(String),

    /// Connection was closed unexpectedly
    #[error("Connection closed")]
    ConnectionClosed,

    /// Operation timed out
    #[error("Timeout")]
    Timeout,

    /// Command string could not be parsed
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Invalid or unexpected response
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Unknown service, action or device
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What was looked up (service, action, ...)
        kind: &'static str,
        /// Identifier that was not found
        id: String,
    },

    /// A required SOAP input argument was not supplied
    #[error("Missing argument {argument} for action {action}")]
    MissingArgument {
        /// Action being invoked
        action: String,
        /// Name of the missing input argument
        argument: String,
    },

    /// Non-200 response to a SOAP call
    #[error("HTTP status {status}: {body}")]
    HttpStatus {
        /// Status code returned by the device
        status: u16,
        /// Response body, as far as it could be read
        body: String,
    },

    /// SOAP fault returned inside the envelope
    #[error("SOAP fault {code}: {description}")]
    SoapFault {
        /// UPnP error code
        code: u16,
        /// Error description
        description: String,
    },

    /// Channel send/receive error
    #[error("Channel error: {0}")]
    ChannelError(String),
}

impl HeosError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        HeosError::NotFound {
            kind,
            id: id.into(),
        }
    }
}

impl From<xmltree::ParseError> for HeosError {
    fn from(e: xmltree::ParseError) -> Self {
        HeosError::Xml(e.to_string())
    }
}

impl From<quick_xml::DeError> for HeosError {
    fn from(e: quick_xml::DeError) -> Self {
        HeosError::Xml(e.to_string())
    }
}
