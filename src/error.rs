use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GenieError>;

/// Error kinds surfaced by the orchestration core.
///
/// Every variant renders with a stable kind prefix so callers can match on
/// the failure class without parsing the rest of the message.
#[derive(Error, Debug)]
pub enum GenieError {
    /// A required configuration value (typically an API key) is absent.
    #[error("configuration-missing: {0}")]
    ConfigurationMissing(String),

    /// A provider name or alias did not resolve to a registered factory.
    #[error("provider-unsupported: {0}")]
    ProviderUnsupported(String),

    /// Prompt template rendering failed.
    #[error("render-failure: {0}")]
    RenderFailure(String),

    /// The underlying transport or HTTP call failed.
    #[error("wire-failure: {0}")]
    Wire(String),

    /// Malformed JSON, an unmatched response, or an empty final model turn.
    #[error("protocol-violation: {0}")]
    Protocol(String),

    /// The model requested a tool with no registered handler.
    #[error("handler-missing: {0}")]
    HandlerMissing(String),

    /// A registered handler returned an error.
    #[error("handler-failure: {name}: {source}")]
    HandlerFailure {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// Tool arguments were non-empty, non-null JSON that failed to parse.
    #[error("tool-args-invalid: {0}")]
    ToolArgsInvalid(String),

    /// The tool loop hit its iteration ceiling without terminating.
    #[error("iteration-exhausted: exceeded maximum tool call iterations ({0})")]
    IterationExhausted(usize),

    /// A per-server MCP connect failed. Logged and skipped during init.
    #[error("mcp-server-unreachable: {0}")]
    ServerUnreachable(String),
}

impl GenieError {
    pub fn wire(message: impl Into<String>) -> Self {
        Self::Wire(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Whether retrying the same call might succeed.
    ///
    /// Only transport-level failures qualify; protocol violations, missing
    /// configuration, and handler errors are deterministic.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Wire(_) | Self::ServerUnreachable(_))
    }
}

impl From<reqwest::Error> for GenieError {
    fn from(err: reqwest::Error) -> Self {
        Self::Wire(err.to_string())
    }
}

impl From<std::io::Error> for GenieError {
    fn from(err: std::io::Error) -> Self {
        Self::Wire(err.to_string())
    }
}
