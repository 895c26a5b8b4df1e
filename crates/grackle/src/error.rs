use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown typtype {typtype:?} for type {name}")]
    UnknownTyptype { name: String, typtype: char },

    #[error("type {0} not present in catalog")]
    MissingType(String),

    #[error("schema offers nothing to generate from")]
    EmptySchema,

    #[error("no value expression available for type {0}")]
    NoValueExpr(String),

    #[error("comparison operands would not unify")]
    OperandMismatch,

    #[error("gave up building a comparison after {0} attempts")]
    GenerationLimit(u32),
}
