mod files;
mod tasks;

pub use files::{FileRepo, NewFinalizedFile};
pub use tasks::{NewTask, TaskRepo};

use sqlx::SqlitePool;
use sqlx::sqlite::SqliteQueryResult;

#[derive(Debug, thiserror::Error)]
pub enum DataBaseError {
    #[error("row not found")]
    RowNotFound,
    #[error("no affected rows")]
    NoAffectedRows,
    #[error("already exists: {msg}")]
    AlreadyExists { msg: String },
    #[error("{0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("sqlx error: {0}")]
    SqlxOther(#[from] sqlx::Error),
}

pub type DataBaseResult<T> = Result<T, DataBaseError>;

pub trait SqliteBaseResultExt<T> {
    fn resolve(self) -> DataBaseResult<T>;
}

impl<T> SqliteBaseResultExt<T> for Result<T, sqlx::Error> {
    fn resolve(self) -> DataBaseResult<T> {
        match self {
            Ok(result) => Ok(result),
            Err(sqlx::Error::RowNotFound) => Err(DataBaseError::RowNotFound),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(DataBaseError::AlreadyExists {
                    msg: e.message().to_string(),
                })
            }
            Err(e) => Err(DataBaseError::SqlxOther(e)),
        }
    }
}

pub trait SqliteQueryResultExt {
    fn resolve_affected(self) -> DataBaseResult<SqliteQueryResult>;
}

impl SqliteQueryResultExt for Result<SqliteQueryResult, sqlx::Error> {
    fn resolve_affected(self) -> DataBaseResult<SqliteQueryResult> {
        match self {
            Ok(res) if res.rows_affected() == 0 => Err(DataBaseError::NoAffectedRows),
            other => other.resolve(),
        }
    }
}

pub struct DataBaseState {
    pool: SqlitePool,
}

impl DataBaseState {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn files(&self) -> FileRepo<'_> {
        FileRepo::new(&self.pool)
    }

    pub fn tasks(&self) -> TaskRepo<'_> {
        TaskRepo::new(&self.pool)
    }

    pub async fn close_conn(&self) {
        self.pool.close().await;
    }
}
