use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Handler Error - {0}")]
    Handler(String),

    #[error("Stage Error - {0}")]
    Stage(String),

    #[error("Batch Error - {0}")]
    Batch(String),
}
