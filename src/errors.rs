use thiserror::Error;

/// Failure to obtain a snapshot of the mirrored surface.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CaptureError {
    #[error("capture unavailable: {0}")]
    Unavailable(String),

    #[error("capture timed out after {0} ms")]
    Timeout(u64),
}

impl CaptureError {
    pub fn is_retryable(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ModelError {
    #[error("model unavailable: {0}")]
    Unavailable(String),

    #[error("model rate limited: {0}")]
    RateLimited(String),

    #[error("model call timed out after {0} ms")]
    Timeout(u64),

    /// The endpoint answered but the completion carried no usable text.
    #[error("invalid model response: {0}")]
    InvalidResponse(String),

    /// The endpoint refused the request (4xx other than 408/429).
    #[error("model rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
}

impl ModelError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ModelError::Unavailable(_) | ModelError::RateLimited(_) | ModelError::Timeout(_)
        )
    }
}

/// Violations of the Thought/Action protocol.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParseError {
    #[error("response has no `Thought:` segment")]
    MissingThought,

    #[error("response has no `Action:` segment")]
    MissingAction,

    #[error("response has {0} action segments, expected exactly one")]
    MultipleActions(usize),

    #[error("malformed action call: {0}")]
    MalformedCall(String),

    #[error("unknown action `{0}`")]
    UnknownAction(String),

    #[error("invalid parameters for `{action}`: {reason}")]
    InvalidParameters { action: String, reason: String },
}

impl ParseError {
    /// Feedback appended to the prompt when the model is asked to try again.
    pub fn correction_notice(&self) -> String {
        format!(
            "Your previous reply could not be used: {self}. \
             Reply again with exactly one `Thought:` line followed by exactly one \
             `Action:` line containing a single call such as `click(x=0.5, y=0.5)`."
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutionError {
    #[error("execution failed: {0}")]
    Failed(String),

    /// The mirrored surface is gone; nothing further can be executed.
    #[error("target surface unreachable: {0}")]
    SurfaceUnreachable(String),
}

impl ExecutionError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExecutionError::SurfaceUnreachable(_))
    }
}

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("turn index {got} out of order, expected {expected}")]
    OutOfOrder { expected: u32, got: u32 },

    #[error("run log corrupt at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors reported synchronously to control-plane callers. They never change run state.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SupervisorError {
    #[error("unknown run: {0}")]
    UnknownRun(String),

    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

#[derive(Debug, Error)]
pub enum MirrorClawError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("Recorder error: {0}")]
    Recorder(#[from] RecorderError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TOML deserialize error: {0}")]
    TomlDe(#[from] toml::de::Error),
}

impl serde::Serialize for MirrorClawError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

pub type MirrorClawResult<T> = Result<T, MirrorClawError>;
