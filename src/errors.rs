#[derive(Debug, thiserror::Error)]
pub enum ReelError {
    #[error("{0}")]
    DataBase(#[from] crate::services::states::db::DataBaseError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Config(#[from] Box<figment::Error>),
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

pub type ReelResult<T> = Result<T, ReelError>;
