use thiserror::Error;

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("poll option {index} out of range ({options} options)")]
    OptionOutOfRange { index: usize, options: usize },
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("http error: {0}")]
    Http(String),
    #[error("remote error: {0}")]
    Remote(String),
    #[error("decode error: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unknown session {0}")]
    UnknownSession(String),
    #[error(transparent)]
    Room(#[from] RoomError),
}
