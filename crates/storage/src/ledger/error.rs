#![forbid(unsafe_code)]

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("unknown job {0}")]
    UnknownJob(String),
    #[error("corrupt row for job {jid}: {reason}")]
    CorruptRow { jid: String, reason: String },
}
