/// Shared error type used across all agentgate crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config: {0}")]
    Config(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("store: {0}")]
    Store(String),

    #[error("cron: {0}")]
    Cron(String),

    #[error("channel {channel}: {message}")]
    Channel { channel: String, message: String },

    #[error("llm: {0}")]
    Llm(String),

    #[error("tool {tool}: {message}")]
    Tool { tool: String, message: String },

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
