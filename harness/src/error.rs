use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not read scenario: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not parse scenario: {0}")]
    Json(#[from] serde_json::Error),

    #[error("could not install logger: {0}")]
    Logger(#[from] log::SetLoggerError),

    #[error(transparent)]
    Config(#[from] curp::ConfigError),

    #[error("client {0} is not declared in the cluster")]
    Client(usize),

    #[error("client {0} has no replica to bind to")]
    Unbound(usize),

    #[error("`{command}` needs the {expected:?} variant")]
    Variant {
        command: &'static str,
        expected: curp::Variant,
    },

    #[error("{0} did not complete in time")]
    Timeout(String),
}
