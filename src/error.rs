use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("entity type `{0}` is not registered in the metamodel")]
    EntityNotRegistered(String),
    #[error("instance of `{0}` did not serialize to a JSON object")]
    NotAnObject(&'static str),
    #[error("record of `{entity}` is transient: {reason}")]
    TransientEntity {
        entity: &'static str,
        reason: &'static str,
    },
    #[error("record of `{entity}` with id {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("unknown or unusable attribute `{field}` on entity `{entity}`")]
    UnknownAttribute { entity: &'static str, field: String },
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

pub trait WithContext<T> {
    fn context(self, msg: impl Into<String>) -> Result<T>;
}

impl<T> WithContext<T> for Result<T> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Context {
            context: msg.into(),
            source: Box::new(e),
        })
    }
}
