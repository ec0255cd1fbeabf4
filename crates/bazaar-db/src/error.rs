use thiserror::Error;

/// Error taxonomy shared by the REST layer and the realtime relay. The REST
/// layer maps each variant to a distinct HTTP status; the gateway maps them
/// to `send_rejected` reasons.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("not a participant of this chat")]
    Forbidden,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error(transparent)]
    Db(#[from] rusqlite::Error),

    #[error("{0}")]
    Internal(String),
}
