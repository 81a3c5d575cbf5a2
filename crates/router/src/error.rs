use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("model '{0}' is not present in the configured registry")]
    UnknownModel(String),
}

pub type Result<T> = std::result::Result<T, Error>;
