use thiserror::Error;

#[derive(Error, Debug)]
pub enum FilebaseError {
    #[error("Path parse error: {0}")]
    PathParse(String),

    #[error("Module load error for {path}: {message}")]
    ModuleLoad { path: String, message: String },

    #[error("Procedure not found: {0}")]
    ProcedureNotFound(String),

    #[error("Procedure '{name}' failed: {message}")]
    ProcedureInvocation { name: String, message: String },

    #[error("Channel protocol error: {0}")]
    ChannelProtocol(String),

    #[error("Call timed out after {0}ms")]
    CallTimeout(u64),

    #[error("Channel closed with calls in flight")]
    ChannelClosed,

    #[error("Render error for {path}: {message}")]
    Render { path: String, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FilebaseError {
    /// Shorthand for a `ModuleLoad` error on a path.
    pub fn module_load(path: impl std::fmt::Display, message: impl Into<String>) -> Self {
        FilebaseError::ModuleLoad {
            path: path.to_string(),
            message: message.into(),
        }
    }

    /// Shorthand for a `ProcedureInvocation` error.
    pub fn invocation(name: impl Into<String>, message: impl Into<String>) -> Self {
        FilebaseError::ProcedureInvocation {
            name: name.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FilebaseError>;
