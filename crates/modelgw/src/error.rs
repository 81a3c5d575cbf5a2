use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("model invocation failed: {0}")]
    InvocationFailed(String),
}

pub type Result<T> = std::result::Result<T, Error>;
