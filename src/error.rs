use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Bad signature on {0} message")]
    BadSignature(&'static str),

    #[error("Worker capacity exceeded")]
    CapacityExceeded,

    #[error("Job cancelled: {0}")]
    JobCancelled(uuid::Uuid),

    #[error("Chain append failed: {0}")]
    ChainAppend(String),

    #[error("Node store failure: {0}")]
    Storage(String),

    #[error("Directory error: {0}")]
    Directory(String),

    #[error("Peer dial failed: {0}")]
    PeerDial(String),

    #[error("Invalid dispatcher address: {0}")]
    InvalidAddr(String),

    #[error("Key error: {0}")]
    Key(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
