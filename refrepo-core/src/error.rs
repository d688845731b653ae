use uuid::Uuid;

/// Result type alias for repository operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the reference repository
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("{entity} not found by {lookup}: {value}")]
    NotFoundBy {
        entity: &'static str,
        lookup: &'static str,
        value: String,
    },

    #[error("Uniqueness constraint violated on {entity}: {detail}")]
    Duplicate { entity: &'static str, detail: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("An exact duplicate enhancement already exists on this reference")]
    DuplicateEnhancement,

    #[error("Invalid parent enhancement: {0}")]
    InvalidParentEnhancement(String),

    #[error("Malformed index document: {0}")]
    MalformedIndexDocument(String),

    #[error("Index query error: {0}")]
    StoreQuery(String),

    #[error("Blob storage error: {0}")]
    BlobStorage(String),

    #[error("Task error: {0}")]
    Task(String),

    #[error("Transactional scope misuse: {0}")]
    UnitOfWork(String),

    #[error("Storage error: {0}")]
    Store(String),

    #[error("Projection error: {0}")]
    Projection(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Convenience constructor for primary-key misses.
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        Error::NotFound { entity, id }
    }

    /// Check if this error is recoverable (can retry with backoff)
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Store(_) | Error::BlobStorage(_) | Error::Http(_) | Error::Io(_) => true,
            Error::NotFound { .. }
            | Error::NotFoundBy { .. }
            | Error::Duplicate { .. }
            | Error::InvalidInput(_)
            | Error::DuplicateEnhancement
            | Error::InvalidParentEnhancement(_)
            | Error::MalformedIndexDocument(_)
            | Error::StoreQuery(_)
            | Error::Task(_)
            | Error::UnitOfWork(_)
            | Error::Projection(_)
            | Error::Serialization(_) => false,
        }
    }
}
