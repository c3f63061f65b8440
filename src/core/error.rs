use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend queue is closed")]
    Closed,

    #[error("backend corruption: {0}")]
    Corruption(String),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("E_ID_ALREADY_IN_FLIGHT")]
    AlreadyInFlight,

    #[error("E_ID_NOT_IN_FLIGHT")]
    NotInFlight,

    #[error("E_INVALID: {0} out of range")]
    OutOfRange(&'static str),

    #[error("channel is exiting")]
    Exiting,

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}
